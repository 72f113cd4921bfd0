//! Alpaca Stream Client Binary
//!
//! Subscribes to trades, quotes and bars for a handful of symbols and logs
//! them until interrupted.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin alpaca-stream-client
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `ALPACA_KEY` + `ALPACA_SECRET`, or `ALPACA_OAUTH_TOKEN`
//!
//! ## Optional
//! - `ALPACA_ENV`: paper | live, selects the trade updates endpoint (default: paper)
//! - `ALPACA_FEED`: "iex" | "sip" (default: iex)
//! - `ALPACA_STREAM_URL`: Market data base URL (default: <https://stream.data.alpaca.markets>)
//! - `ALPACA_TRADING_STREAM_URL`: Trade updates endpoint override
//! - `ALPACA_STREAM_SYMBOLS`: Comma-separated symbols (default: AAPL,MSFT)
//! - `ALPACA_STREAM_CONNECT_ATTEMPTS`: Handshakes per connect (default: 3)
//! - `ALPACA_STREAM_CONNECT_RETRY_MS`: Delay between handshakes (default: 1000)
//! - `ALPACA_STREAM_CONNECT_BACKOFF_MAX_MS`: Cap for exponential retry delay; unset keeps it fixed
//! - `ALPACA_STREAM_AUTH_TIMEOUT_SECS`: Auth reply timeout (default: 5)
//! - `ALPACA_STREAM_METRICS_PORT`: Prometheus port, 0 disables (default: 9090)
//! - `ALPACA_STREAM_TRADE_UPDATES`: "true" to also log account trade updates
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: cream-alpaca-stream-client)
//! - `RUST_LOG`: Log level (default: info)

use std::net::SocketAddr;

use alpaca_stream_client::infrastructure::telemetry;
use alpaca_stream_client::{SessionConfig, SessionStatus, StreamConfig, StreamSession, init_metrics};
use anyhow::Context;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Alpaca Stream Client");

    let config = StreamConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    if config.metrics_port != 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
        init_metrics(addr).context("failed to start metrics listener")?;
    }

    let session = StreamSession::new(SessionConfig::from(&config))?;
    spawn_status_logger(&session);

    let symbols = config.symbols.clone();
    session
        .subscribe_trades(&symbols, |trade| {
            tracing::info!(
                symbol = %trade.symbol,
                price = %trade.price,
                size = trade.size,
                exchange = %trade.exchange,
                "Trade"
            );
        })
        .await?;
    session
        .subscribe_quotes(&symbols, |quote| {
            tracing::info!(
                symbol = %quote.symbol,
                bid = %quote.bid_price,
                ask = %quote.ask_price,
                "Quote"
            );
        })
        .await?;
    session
        .subscribe_bars(&symbols, |bar| {
            tracing::info!(
                symbol = %bar.symbol,
                open = %bar.open,
                close = %bar.close,
                volume = bar.volume,
                "Bar"
            );
        })
        .await?;

    if std::env::var("ALPACA_STREAM_TRADE_UPDATES").is_ok_and(|v| v.eq_ignore_ascii_case("true"))
    {
        session
            .subscribe_trade_updates(|update| {
                tracing::info!(
                    event = ?update.event,
                    order_id = %update.order.id,
                    symbol = %update.order.symbol,
                    "Trade update"
                );
            })
            .await?;
    }

    tracing::info!(symbols = ?symbols, "Stream client ready");

    await_shutdown().await;
    session.close().await;

    tracing::info!("Stream client stopped");
    Ok(())
}

/// Log every session status change; stop once the session is final.
fn spawn_status_logger(session: &StreamSession) {
    let mut status = session.status_changes();
    let session = session.clone();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            match current {
                SessionStatus::Failed => {
                    tracing::error!(
                        error = session.terminal_error().as_deref().unwrap_or("unknown"),
                        "Stream session failed"
                    );
                    break;
                }
                SessionStatus::Closed => break,
                other => tracing::info!(status = %other, "Stream session status"),
            }
        }
    });
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &StreamConfig) {
    tracing::info!(
        environment = config.environment.as_str(),
        feed = config.feed.as_str(),
        key = %config.credentials.key(),
        metrics_port = config.metrics_port,
        "Configuration loaded"
    );
    tracing::debug!(
        market_data_url = ?config.market_data_url().map(|u| u.to_string()),
        trade_updates_url = %config.trade_updates_url(),
        "WebSocket endpoints"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
}
