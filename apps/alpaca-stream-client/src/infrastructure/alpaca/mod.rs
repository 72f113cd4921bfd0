//! Alpaca WebSocket Adapters
//!
//! Client side of Alpaca's real-time streams:
//!
//! - **Market data**: trades, quotes, bars (`MessagePack` codec)
//! - **Trade Updates**: order fills and updates (JSON codec)

pub mod auth;
pub mod codec;
pub mod connection;
pub mod messages;
pub mod reconnect;
pub mod session;
pub mod subscriptions;
pub mod trading;
pub mod websocket;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{AUTH_TIMEOUT, AuthError, Credentials};
pub use codec::{CodecError, JsonCodec, MsgPackCodec};
pub use connection::{
    ConnectError, Connection, ConnectionSettings, ReadError, WriteError,
};
pub use messages::*;
pub use reconnect::{Backoff, ReconnectConfig, ReconnectPolicy};
pub use session::{SessionConfig, SessionError, SessionStatus, StreamSession};
pub use subscriptions::{MarketDataRegistry, SubscriptionManager};
pub use trading::{TradeUpdateHandler, TradeUpdatesConfig, TradeUpdatesError, TradeUpdatesStream};
pub use websocket::WebSocketConnector;
