//! Alpaca WebSocket Message Types
//!
//! Wire format types for Alpaca's streaming endpoints. Market data frames are
//! `MessagePack` arrays of maps discriminated by `T`; trade update frames are
//! single JSON objects discriminated by `stream`.
//!
//! # Message Types
//!
//! ## Control (market data)
//! - `Success`: connection or authentication acknowledgment
//! - `Error`: error response with code and message
//! - `Subscription`: server's view of the active subscriptions
//!
//! ## Records (market data)
//! - `Trade` (`T = "t"`), `Quote` (`T = "q"`), `Bar` (`T = "b"`)
//!
//! ## Trade Updates (JSON)
//! - `Authorization`, `Listening`, `TradeUpdate`
//!
//! # References
//!
//! - [Stock Streaming](https://docs.alpaca.markets/docs/real-time-stock-pricing-data)
//! - [Trade Updates](https://docs.alpaca.markets/docs/websocket-streaming)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::subscription::SubscriptionSet;

// =============================================================================
// Control Messages
// =============================================================================

/// Acknowledgment of a connection or of authentication.
///
/// # Wire Format
/// ```json
/// {"T": "success", "msg": "connected"}
/// {"T": "success", "msg": "authenticated"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessMessage {
    /// Message type (always "success")
    #[serde(rename = "T")]
    pub msg_type: String,

    /// What succeeded
    pub msg: SuccessKind,
}

/// Kind of success message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuccessKind {
    /// Transport accepted by the server
    Connected,
    /// Credentials accepted
    Authenticated,
    /// Anything else the server chooses to acknowledge
    #[serde(other)]
    Other,
}

/// Error message with code and description.
///
/// # Wire Format
/// ```json
/// {"T": "error", "code": 402, "msg": "auth failed"}
/// ```
///
/// # Error Codes
/// - 400: Invalid syntax
/// - 401: Not authenticated
/// - 402: Auth failed
/// - 403: Already authenticated
/// - 404: Auth timeout
/// - 405: Symbol limit exceeded
/// - 406: Connection limit exceeded
/// - 407: Slow client
/// - 408: Feed not enabled for the account
/// - 409: Insufficient subscription
/// - 410: Invalid subscribe action for this feed
/// - 500: Internal error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Message type (always "error")
    #[serde(rename = "T")]
    pub msg_type: String,

    /// Error code
    pub code: i32,

    /// Error message
    pub msg: String,
}

impl ErrorMessage {
    /// Check if this is an authentication error.
    #[must_use]
    pub const fn is_auth_error(&self) -> bool {
        matches!(self.code, 401..=404)
    }

    /// Check if this is a limit error (symbols, connections, slow client).
    #[must_use]
    pub const fn is_rate_limit_error(&self) -> bool {
        matches!(self.code, 405..=407)
    }

    /// Check if the account or feed cannot serve the requested subscription.
    #[must_use]
    pub const fn is_subscription_error(&self) -> bool {
        matches!(self.code, 408..=410)
    }

    /// Short label for the error class, for logs.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        if self.is_auth_error() {
            "auth"
        } else if self.is_rate_limit_error() {
            "limit"
        } else if self.is_subscription_error() {
            "subscription"
        } else {
            "other"
        }
    }
}

impl std::fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.msg, self.code)
    }
}

/// Subscription confirmation, listing everything now active.
///
/// # Wire Format
/// ```json
/// {"T": "subscription", "trades": ["AAPL"], "quotes": ["AMD"], "bars": []}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionMessage {
    /// Message type (always "subscription")
    #[serde(rename = "T")]
    pub msg_type: String,

    /// Subscribed trade symbols
    #[serde(default)]
    pub trades: Vec<String>,

    /// Subscribed quote symbols
    #[serde(default)]
    pub quotes: Vec<String>,

    /// Subscribed bar symbols
    #[serde(default)]
    pub bars: Vec<String>,
}

// =============================================================================
// Market Data Records
// =============================================================================

/// One trade print.
///
/// # Wire Format
/// ```json
/// {"T": "t", "S": "AAPL", "i": 96921, "x": "D", "p": 126.55, "s": 1,
///  "t": "2021-02-22T15:51:44.208Z", "c": ["@", "I"], "z": "C"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeMessage {
    /// Message type (always "t")
    #[serde(rename = "T")]
    pub msg_type: String,

    /// Ticker symbol
    #[serde(rename = "S")]
    pub symbol: String,

    /// Trade ID, when the feed provides one
    #[serde(rename = "i", default)]
    pub trade_id: i64,

    /// Exchange code where the trade executed
    #[serde(rename = "x")]
    pub exchange: String,

    /// Trade price
    #[serde(rename = "p")]
    pub price: Decimal,

    /// Trade size (shares)
    #[serde(rename = "s")]
    pub size: u32,

    /// Trade timestamp
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,

    /// Trade condition codes
    #[serde(rename = "c", default)]
    pub conditions: Vec<String>,

    /// Tape: "A" (NYSE), "B" (ARCA/regional), "C" (NASDAQ)
    #[serde(rename = "z", default)]
    pub tape: String,
}

/// Top-of-book quote.
///
/// # Wire Format
/// ```json
/// {"T": "q", "S": "AMD", "bx": "U", "bp": 87.66, "bs": 1, "ax": "Q",
///  "ap": 87.68, "as": 4, "t": "2021-02-22T15:51:45.335689322Z",
///  "c": ["R"], "z": "C"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteMessage {
    /// Message type (always "q")
    #[serde(rename = "T")]
    pub msg_type: String,

    /// Ticker symbol
    #[serde(rename = "S")]
    pub symbol: String,

    /// Bid exchange code
    #[serde(rename = "bx")]
    pub bid_exchange: String,

    /// Bid price
    #[serde(rename = "bp")]
    pub bid_price: Decimal,

    /// Bid size (round lots)
    #[serde(rename = "bs")]
    pub bid_size: u32,

    /// Ask exchange code
    #[serde(rename = "ax")]
    pub ask_exchange: String,

    /// Ask price
    #[serde(rename = "ap")]
    pub ask_price: Decimal,

    /// Ask size (round lots)
    #[serde(rename = "as")]
    pub ask_size: u32,

    /// Quote timestamp
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,

    /// Quote condition codes
    #[serde(rename = "c", default)]
    pub conditions: Vec<String>,

    /// Tape
    #[serde(rename = "z", default)]
    pub tape: String,
}

/// One-minute OHLCV bar.
///
/// # Wire Format
/// ```json
/// {"T": "b", "S": "SPY", "o": 388.985, "h": 389.13, "l": 388.975,
///  "c": 389.12, "v": 49378, "n": 461, "vw": 389.062639,
///  "t": "2021-02-22T19:15:00Z"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarMessage {
    /// Message type (always "b")
    #[serde(rename = "T")]
    pub msg_type: String,

    /// Ticker symbol
    #[serde(rename = "S")]
    pub symbol: String,

    /// Open price
    #[serde(rename = "o")]
    pub open: Decimal,

    /// High price
    #[serde(rename = "h")]
    pub high: Decimal,

    /// Low price
    #[serde(rename = "l")]
    pub low: Decimal,

    /// Close price
    #[serde(rename = "c")]
    pub close: Decimal,

    /// Volume (shares)
    #[serde(rename = "v")]
    pub volume: u64,

    /// Number of trades in the bar
    #[serde(rename = "n", default)]
    pub trade_count: u64,

    /// Volume-weighted average price
    #[serde(rename = "vw", default)]
    pub vwap: Option<Decimal>,

    /// Bar start
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
}

/// One decoded element of a market data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    /// Trade record
    Trade(TradeMessage),
    /// Quote record
    Quote(QuoteMessage),
    /// Bar record
    Bar(BarMessage),
    /// Connection/auth acknowledgment
    Success(SuccessMessage),
    /// Server-reported error
    Error(ErrorMessage),
    /// Subscription confirmation
    Subscription(SubscriptionMessage),
}

impl StreamMessage {
    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Trade(_) => "trade",
            Self::Quote(_) => "quote",
            Self::Bar(_) => "bar",
            Self::Success(_) => "success",
            Self::Error(_) => "error",
            Self::Subscription(_) => "subscription",
        }
    }
}

// =============================================================================
// Trade Updates Messages (JSON)
// =============================================================================

/// Order event types from the trade updates stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderEventType {
    /// Order routed
    New,
    /// Order completely filled
    Fill,
    /// Order partially filled
    PartialFill,
    /// Order canceled
    Canceled,
    /// Order expired
    Expired,
    /// Order done for the day
    DoneForDay,
    /// Order replaced
    Replaced,
    /// Order rejected
    Rejected,
    /// Order received, not yet routed
    PendingNew,
    /// Cancel requested
    PendingCancel,
    /// Replace requested
    PendingReplace,
    /// Any event this client does not model
    #[serde(other)]
    Other,
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    /// Buy order
    Buy,
    /// Sell order
    Sell,
}

/// Order snapshot carried by a trade update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDetails {
    /// Order ID
    pub id: String,

    /// Client-provided order ID
    #[serde(default)]
    pub client_order_id: String,

    /// Ticker symbol
    pub symbol: String,

    /// Order side
    pub side: OrderSide,

    /// Order type ("market", "limit", ...)
    #[serde(rename = "type", default)]
    pub order_type: String,

    /// Order quantity (absent for notional orders)
    #[serde(default)]
    pub qty: Option<String>,

    /// Filled quantity
    #[serde(default)]
    pub filled_qty: Option<String>,

    /// Average fill price
    #[serde(default)]
    pub filled_avg_price: Option<String>,

    /// Current order status
    pub status: String,

    /// Last update timestamp
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Payload of one trade update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeUpdate {
    /// Event type
    pub event: OrderEventType,

    /// Order after the event
    pub order: OrderDetails,

    /// Event timestamp
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    /// Position quantity after a fill
    #[serde(default)]
    pub position_qty: Option<String>,

    /// Fill price (fill events)
    #[serde(default)]
    pub price: Option<String>,

    /// Fill quantity (fill events)
    #[serde(default)]
    pub qty: Option<String>,
}

/// Authorization reply on the trading stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationData {
    /// "authorized" or "unauthorized"
    pub status: String,

    /// Echo of the request action
    #[serde(default)]
    pub action: String,
}

impl AuthorizationData {
    /// Check if authorization succeeded.
    #[must_use]
    pub fn is_authorized(&self) -> bool {
        self.status == "authorized"
    }
}

/// Listening confirmation data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListeningData {
    /// Streams now active
    #[serde(default)]
    pub streams: Vec<String>,
}

/// One decoded trading stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradingMessage {
    /// `{"stream": "authorization", "data": {...}}`
    Authorization(AuthorizationData),
    /// `{"stream": "listening", "data": {"streams": [...]}}`
    Listening(ListeningData),
    /// `{"stream": "trade_updates", "data": {...}}`, boxed for size
    TradeUpdate(Box<TradeUpdate>),
}

// =============================================================================
// Outbound Messages (Client -> Server)
// =============================================================================

/// Authentication request, shared by the market data and trading streams.
#[derive(Clone, Serialize)]
pub struct AuthRequest {
    /// Action: "auth"
    pub action: &'static str,

    /// API key, or "oauth" for token auth
    pub key: String,

    /// API secret, or the OAuth token
    pub secret: String,
}

impl std::fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRequest")
            .field("action", &self.action)
            .field("key", &self.key)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl AuthRequest {
    /// Create a new authentication request.
    #[must_use]
    pub const fn new(key: String, secret: String) -> Self {
        Self {
            action: "auth",
            key,
            secret,
        }
    }
}

/// Subscribe or unsubscribe request for market data.
///
/// Empty channel lists are omitted from the frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionRequest {
    /// Action: "subscribe" or "unsubscribe"
    pub action: String,

    /// Trade symbols
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trades: Vec<String>,

    /// Quote symbols
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub quotes: Vec<String>,

    /// Bar symbols
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bars: Vec<String>,
}

impl SubscriptionRequest {
    /// Create a subscribe request.
    #[must_use]
    pub fn subscribe() -> Self {
        Self {
            action: "subscribe".to_string(),
            ..Default::default()
        }
    }

    /// Create an unsubscribe request.
    #[must_use]
    pub fn unsubscribe() -> Self {
        Self {
            action: "unsubscribe".to_string(),
            ..Default::default()
        }
    }

    /// Subscribe request covering every wire symbol of a set.
    #[must_use]
    pub fn resubscribe(set: &SubscriptionSet) -> Self {
        use crate::domain::subscription::Channel;

        Self::subscribe()
            .with_trades(set.wire_symbols(Channel::Trades))
            .with_quotes(set.wire_symbols(Channel::Quotes))
            .with_bars(set.wire_symbols(Channel::Bars))
    }

    /// Set trade symbols.
    #[must_use]
    pub fn with_trades(mut self, symbols: Vec<String>) -> Self {
        self.trades = symbols;
        self
    }

    /// Set quote symbols.
    #[must_use]
    pub fn with_quotes(mut self, symbols: Vec<String>) -> Self {
        self.quotes = symbols;
        self
    }

    /// Set bar symbols.
    #[must_use]
    pub fn with_bars(mut self, symbols: Vec<String>) -> Self {
        self.bars = symbols;
        self
    }

    /// Check if no channel lists any symbol.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trades.is_empty() && self.quotes.is_empty() && self.bars.is_empty()
    }
}

/// Listen request for the trading stream.
#[derive(Debug, Clone, Serialize)]
pub struct ListenRequest {
    /// Action: "listen"
    pub action: &'static str,

    /// Streams to listen to
    pub data: ListeningData,
}

impl ListenRequest {
    /// Create a listen request for trade updates.
    #[must_use]
    pub fn trade_updates() -> Self {
        Self {
            action: "listen",
            data: ListeningData {
                streams: vec!["trade_updates".to_string()],
            },
        }
    }
}
