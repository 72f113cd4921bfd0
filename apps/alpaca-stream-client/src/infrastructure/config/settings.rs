//! Stream Client Configuration Settings
//!
//! Configuration types for the stream client, loaded from environment
//! variables.

use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::infrastructure::alpaca::auth::{AuthError, Credentials};
use crate::infrastructure::alpaca::connection::ConnectionSettings;

/// Production market data base URL.
pub const DEFAULT_STREAM_URL: &str = "https://stream.data.alpaca.markets";

/// Market data feed for Alpaca streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataFeed {
    /// IEX (Investors Exchange) - available on every plan.
    #[default]
    Iex,
    /// SIP (Securities Information Processor) - full consolidated tape.
    Sip,
}

impl DataFeed {
    /// Get the feed name used in endpoint paths.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Iex => "iex",
            Self::Sip => "sip",
        }
    }
}

impl FromStr for DataFeed {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "iex" => Ok(Self::Iex),
            "sip" => Ok(Self::Sip),
            _ => Err(ConfigError::UnsupportedFeed(s.to_string())),
        }
    }
}

impl std::fmt::Display for DataFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trading environment (paper vs live). Selects the trade updates endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Paper trading environment (simulated).
    #[default]
    Paper,
    /// Live trading environment (real money).
    Live,
}

impl Environment {
    /// Parse environment from string; anything but "live" is paper.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "LIVE" => Self::Live,
            _ => Self::Paper,
        }
    }

    /// Check if this is the live environment.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }

    /// Get the environment name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::Live => "live",
        }
    }

    /// Trade updates endpoint for this environment.
    #[must_use]
    pub const fn trade_updates_url(&self) -> &'static str {
        match self {
            Self::Paper => "wss://paper-api.alpaca.markets/stream",
            Self::Live => "wss://api.alpaca.markets/stream",
        }
    }
}

/// Build the market data endpoint `{scheme}://{host}/v2/{feed}`.
///
/// The scheme is `ws` when the base URL is `http` or `ws`, and `wss`
/// otherwise.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidUrl`] if the base URL does not parse.
pub fn stream_endpoint(base_url: &str, feed: DataFeed) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        url: base_url.to_string(),
        reason,
    };

    let mut url = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
    let scheme = if matches!(url.scheme(), "http" | "ws") {
        "ws"
    } else {
        "wss"
    };
    url.set_scheme(scheme)
        .map_err(|()| invalid(format!("cannot use {scheme} scheme")))?;
    url.set_path(&format!("/v2/{}", feed.as_str()));
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Complete stream client configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Trading environment.
    pub environment: Environment,
    /// Market data feed.
    pub feed: DataFeed,
    /// API credentials.
    pub credentials: Credentials,
    /// Market data base URL.
    pub stream_url: String,
    /// Trade updates endpoint override.
    pub trading_stream_url: Option<String>,
    /// Connection tunables.
    pub connection: ConnectionSettings,
    /// Prometheus listener port (0 = disabled).
    pub metrics_port: u16,
    /// Symbols the demo binary subscribes to.
    pub symbols: Vec<String>,
}

impl StreamConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if credentials are missing or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if credentials are missing or a value is invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let credentials = Credentials::from_lookup(&lookup)?;

        let environment = lookup("ALPACA_ENV")
            .map(|s| Environment::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let feed = match lookup("ALPACA_FEED").filter(|s| !s.is_empty()) {
            Some(name) => name.parse()?,
            None => DataFeed::default(),
        };

        let stream_url = lookup("ALPACA_STREAM_URL")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_STREAM_URL.to_string());
        stream_endpoint(&stream_url, feed)?;

        let defaults = ConnectionSettings::default();
        let connection = ConnectionSettings {
            connect_attempts: parse_u32(
                &lookup,
                "ALPACA_STREAM_CONNECT_ATTEMPTS",
                defaults.connect_attempts,
            )
            .max(1),
            connect_retry_delay: parse_duration_millis(
                &lookup,
                "ALPACA_STREAM_CONNECT_RETRY_MS",
                defaults.connect_retry_delay,
            ),
            auth_timeout: parse_duration_secs(
                &lookup,
                "ALPACA_STREAM_AUTH_TIMEOUT_SECS",
                defaults.auth_timeout,
            ),
            connect_backoff_max: lookup("ALPACA_STREAM_CONNECT_BACKOFF_MAX_MS")
                .and_then(|s| s.trim().parse::<u64>().ok())
                .filter(|&ms| ms > 0)
                .map(Duration::from_millis),
        };

        let symbols = lookup("ALPACA_STREAM_SYMBOLS")
            .map(|s| parse_symbols(&s))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| vec!["AAPL".to_string(), "MSFT".to_string()]);

        Ok(Self {
            environment,
            feed,
            credentials,
            stream_url,
            trading_stream_url: lookup("ALPACA_TRADING_STREAM_URL").filter(|s| !s.is_empty()),
            connection,
            metrics_port: parse_u16(&lookup, "ALPACA_STREAM_METRICS_PORT", 9090),
            symbols,
        })
    }

    /// Market data endpoint for the configured feed.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid.
    pub fn market_data_url(&self) -> Result<Url, ConfigError> {
        stream_endpoint(&self.stream_url, self.feed)
    }

    /// Trade updates endpoint: the override, else the environment default.
    #[must_use]
    pub fn trade_updates_url(&self) -> String {
        self.trading_stream_url
            .clone()
            .unwrap_or_else(|| self.environment.trade_updates_url().to_string())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Feed name is not `iex` or `sip`.
    #[error("unsupported feed: {0:?} (expected \"iex\" or \"sip\")")]
    UnsupportedFeed(String),
    /// Base URL does not parse.
    #[error("invalid stream URL {url}: {reason}")]
    InvalidUrl {
        /// Offending URL
        url: String,
        /// Parse failure
        reason: String,
    },
    /// Credentials could not be loaded.
    #[error(transparent)]
    Credentials(#[from] AuthError),
}

impl Credentials {
    /// Load credentials from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if no usable credentials are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load credentials from an arbitrary variable lookup.
    ///
    /// `ALPACA_OAUTH_TOKEN` wins when set; otherwise `ALPACA_KEY` and
    /// `ALPACA_SECRET` are required.
    ///
    /// # Errors
    ///
    /// Returns an error if no usable credentials are present.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(token) = lookup("ALPACA_OAUTH_TOKEN").filter(|t| !t.is_empty()) {
            return Ok(Self::oauth(token)?);
        }

        let key = lookup("ALPACA_KEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("ALPACA_KEY".to_string()))?;
        let secret = lookup("ALPACA_SECRET")
            .ok_or_else(|| ConfigError::MissingEnvVar("ALPACA_SECRET".to_string()))?;

        if key.is_empty() {
            return Err(ConfigError::EmptyValue("ALPACA_KEY".to_string()));
        }
        if secret.is_empty() {
            return Err(ConfigError::EmptyValue("ALPACA_SECRET".to_string()));
        }

        Ok(Self::new(key, secret)?)
    }
}

/// Split a comma-separated symbol list, dropping blanks.
#[must_use]
pub fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_uppercase)
        .collect()
}

fn parse_u16(lookup: impl Fn(&str) -> Option<String>, key: &str, default: u16) -> u16 {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn parse_u32(lookup: impl Fn(&str) -> Option<String>, key: &str, default: u32) -> u32 {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn parse_duration_secs(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_duration_millis(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
