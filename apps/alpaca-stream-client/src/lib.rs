#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Alpaca Stream Client - Real-time Market Data Subscriber
//!
//! Maintains one logical subscription to Alpaca's `MessagePack` market data
//! stream (trades, quotes, minute bars), dispatches every record to the
//! callback registered for its symbol, and survives connection loss by
//! reconnecting, re-authenticating and resubscribing on its own.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types with no I/O
//!   - `streaming`: Connection lifecycle states
//!   - `subscription`: Handler registry and the desired subscription set
//!
//! - **Application**: Port definitions
//!   - `ports`: Framed transport contracts (`Connector`, reader, writer)
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `alpaca`: Codec, connection, session, trade updates, WebSocket
//!   - `config`: Environment configuration
//!   - `metrics`: Prometheus counters and gauges
//!   - `telemetry`: Tracing and OpenTelemetry
//!
//! - **Façade**: [`stream`] wraps one process-wide session
//!
//! # Data Flow
//!
//! ```text
//!                 subscribe frame          ┌──────────────────┐
//! application ──► SubscriptionManager ───► │    Connection    │ ◄── Alpaca WS
//!      ▲               │ register          └────────┬─────────┘
//!      │               ▼                            │ frames
//!      │        HandlerRegistry ◄── dispatch ◄── read loop ◄── MsgPackCodec
//!      └──────────── callback ◄───────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no external dependencies.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

/// Process-wide convenience API over one session.
pub mod stream;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::ConnectionState;
pub use domain::subscription::{
    Channel, DispatchError, Handler, HandlerRegistry, SubscriptionSet, Symbol, WILDCARD,
};

// Ports
pub use application::ports::{Connector, Frame, FrameReader, FrameWriter, TransportError};

// Session and streams
pub use infrastructure::alpaca::{
    AuthError, BarMessage, CodecError, ConnectError, ConnectionSettings, Credentials,
    QuoteMessage, SessionConfig, SessionError, SessionStatus, StreamSession, TradeMessage,
    TradeUpdate, TradeUpdatesError, TradeUpdatesStream, WebSocketConnector,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, DataFeed, Environment, StreamConfig};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
