//! Trade Updates Stream
//!
//! Account-level order events (fills, cancellations, rejections) from
//! Alpaca's trading stream.
//!
//! # Stream URL
//!
//! - Production: `wss://api.alpaca.markets/stream`
//! - Sandbox: `wss://paper-api.alpaca.markets/stream`
//!
//! # Protocol
//!
//! JSON in text or binary frames, with a different handshake than market
//! data: send `auth`, wait for the `authorization` reply, send `listen` for
//! `trade_updates`, wait for `listening`. After a connection loss the
//! stream reconnects and repeats the handshake; the registered handler is
//! kept. Exhausting the connect attempts is terminal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::auth::{AuthError, Credentials, check_authorization};
use super::codec::{CodecError, JsonCodec};
use super::connection::{ConnectError, Connection, ConnectionSettings, ReadError, WriteError};
use super::messages::{ListenRequest, TradeUpdate, TradingMessage};
use crate::application::ports::{Connector, Frame};
use crate::infrastructure::metrics::{self, StreamKind};

/// Stream name requested in the listen frame.
const TRADE_UPDATES: &str = "trade_updates";

/// Callback for trade updates.
pub type TradeUpdateHandler = Arc<dyn Fn(TradeUpdate) + Send + Sync>;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur on the trade updates stream.
#[derive(Debug, thiserror::Error)]
pub enum TradeUpdatesError {
    /// The stream was closed by the caller.
    #[error("trade updates stream closed")]
    Closed,

    /// Reconnection failed earlier; the stream is unusable.
    #[error("trade updates stream terminated: {0}")]
    Terminated(String),

    /// Transport handshake failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Authorization was refused or malformed.
    #[error("trade updates authorization failed: {0}")]
    Auth(#[from] AuthError),

    /// The listen request was not confirmed.
    #[error("trade updates listen not confirmed: {0}")]
    NotListening(String),

    /// No handshake reply within the auth timeout.
    #[error("timed out after {timeout:?} waiting for {waiting_for}")]
    Timeout {
        /// Time waited
        timeout: Duration,
        /// Reply that never came
        waiting_for: &'static str,
    },

    /// A handshake reply could not be decoded.
    #[error(transparent)]
    Decode(#[from] CodecError),

    /// Reading a handshake reply failed.
    #[error(transparent)]
    Read(#[from] ReadError),

    /// Writing a handshake frame failed.
    #[error(transparent)]
    Write(#[from] WriteError),
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the trade updates stream.
#[derive(Debug, Clone)]
pub struct TradeUpdatesConfig {
    /// WebSocket URL.
    pub url: String,
    /// API credentials.
    pub credentials: Credentials,
    /// Connect attempts, retry delay and handshake timeout.
    pub connection: ConnectionSettings,
}

impl TradeUpdatesConfig {
    /// Create a new configuration with default connection settings.
    #[must_use]
    pub fn new(url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            url: url.into(),
            credentials,
            connection: ConnectionSettings::default(),
        }
    }
}

// =============================================================================
// Stream
// =============================================================================

/// Trade updates stream with a single handler.
///
/// Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct TradeUpdatesStream {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: TradeUpdatesConfig,
    codec: JsonCodec,
    handler: RwLock<Option<TradeUpdateHandler>>,
    connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    terminal: parking_lot::Mutex<Option<String>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TradeUpdatesStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeUpdatesStream")
            .field("url", &self.inner.config.url)
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .field("terminal", &*self.inner.terminal.lock())
            .finish_non_exhaustive()
    }
}

impl TradeUpdatesStream {
    /// Create a stream. Nothing connects until [`Self::subscribe`].
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, config: TradeUpdatesConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                codec: JsonCodec::new(),
                handler: RwLock::new(None),
                connection: tokio::sync::Mutex::new(None),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                terminal: parking_lot::Mutex::new(None),
                reader: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Install `handler` (replacing any previous one) and make sure the
    /// stream is connected and listening.
    ///
    /// # Errors
    ///
    /// Returns [`TradeUpdatesError::Closed`] or
    /// [`TradeUpdatesError::Terminated`] for an unusable stream, or the
    /// connect/handshake error. The handler stays installed so a later call
    /// can retry.
    pub async fn subscribe(&self, handler: TradeUpdateHandler) -> Result<(), TradeUpdatesError> {
        self.inner.check_open()?;
        *self.inner.handler.write() = Some(handler);

        let mut slot = self.inner.connection.lock().await;
        self.inner.check_open()?;
        if slot.is_some() {
            return Ok(());
        }

        let connection = Arc::new(self.inner.establish().await?);
        if self.inner.closed.load(Ordering::Acquire) {
            connection.close(true).await;
            return Err(TradeUpdatesError::Closed);
        }
        *slot = Some(connection);
        drop(slot);

        let handle = tokio::spawn(read_loop(Arc::downgrade(&self.inner)));
        *self.inner.reader.lock() = Some(handle);
        Ok(())
    }

    /// Close the stream. Idempotent; a closed stream never reconnects.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();

        let connection = self.inner.connection.lock().await.take();
        if let Some(connection) = connection {
            connection.close(true).await;
        }
        drop(self.inner.reader.lock().take());
        tracing::info!(url = %self.inner.config.url, "Trade updates stream closed");
    }

    /// Reason the stream stopped reconnecting, if it did.
    #[must_use]
    pub fn terminal_error(&self) -> Option<String> {
        self.inner.terminal.lock().clone()
    }

    /// Check if a connection is currently established.
    pub async fn is_connected(&self) -> bool {
        self.inner.connection.lock().await.is_some()
    }

    /// Endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.config.url
    }
}

impl Inner {
    fn check_open(&self) -> Result<(), TradeUpdatesError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TradeUpdatesError::Closed);
        }
        if let Some(reason) = self.terminal.lock().clone() {
            return Err(TradeUpdatesError::Terminated(reason));
        }
        Ok(())
    }

    async fn establish(&self) -> Result<Connection, TradeUpdatesError> {
        tracing::info!(url = %self.config.url, "Connecting to trade updates stream");
        let connection =
            Connection::connect(&self.connector, &self.config.url, &self.config.connection)
                .await?;

        if let Err(e) = self.handshake(&connection).await {
            connection.close(false).await;
            return Err(e);
        }

        connection.mark_authenticated();
        tracing::info!(url = %self.config.url, "Listening to trade updates");
        Ok(connection)
    }

    async fn handshake(&self, connection: &Connection) -> Result<(), TradeUpdatesError> {
        connection
            .write_json(&self.config.credentials.to_auth_request())
            .await?;
        match self.await_control(connection, "authorization").await? {
            TradingMessage::Authorization(data) => check_authorization(&data)?,
            other => {
                return Err(AuthError::UnexpectedReply(kind(&other).to_string()).into());
            }
        }

        connection.write_json(&ListenRequest::trade_updates()).await?;
        match self.await_control(connection, "listening").await? {
            TradingMessage::Listening(data) if data.streams.iter().any(|s| s == TRADE_UPDATES) => {
                Ok(())
            }
            TradingMessage::Listening(data) => Err(TradeUpdatesError::NotListening(format!(
                "streams {:?}",
                data.streams
            ))),
            other => Err(TradeUpdatesError::NotListening(kind(&other).to_string())),
        }
    }

    async fn await_control(
        &self,
        connection: &Connection,
        waiting_for: &'static str,
    ) -> Result<TradingMessage, TradeUpdatesError> {
        let timeout = self.config.connection.auth_timeout;
        tokio::time::timeout(timeout, self.next_control(connection))
            .await
            .map_err(|_| TradeUpdatesError::Timeout {
                timeout,
                waiting_for,
            })?
    }

    /// Next non-update message; updates arriving meanwhile are delivered.
    async fn next_control(&self, connection: &Connection) -> Result<TradingMessage, TradeUpdatesError> {
        loop {
            let frame = connection.read_frame().await?;
            let Some(payload) = frame.payload() else {
                continue;
            };
            match self.codec.decode(payload)? {
                Some(TradingMessage::TradeUpdate(update)) => self.deliver(*update),
                Some(message) => return Ok(message),
                None => {}
            }
        }
    }

    fn handle_frame(&self, frame: &Frame) {
        let Some(payload) = frame.payload() else {
            return;
        };
        metrics::record_frame_received(StreamKind::TradeUpdates);

        match self.codec.decode(payload) {
            Ok(Some(TradingMessage::TradeUpdate(update))) => self.deliver(*update),
            Ok(Some(message)) => {
                tracing::debug!(message = kind(&message), "Trade updates control message");
            }
            Ok(None) => {}
            Err(e) => {
                metrics::record_decode_error(StreamKind::TradeUpdates);
                tracing::warn!(error = %e, len = payload.len(), "Skipping malformed trade update");
            }
        }
    }

    fn deliver(&self, update: TradeUpdate) {
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => {
                tracing::debug!(
                    event = ?update.event,
                    order_id = %update.order.id,
                    symbol = %update.order.symbol,
                    "Trade update received"
                );
                handler(update);
            }
            None => tracing::trace!(order_id = %update.order.id, "No trade update handler"),
        }
    }

    /// Replace a dead connection. Returns `false` when the loop must stop.
    async fn recover(&self, dead: &Arc<Connection>, error: &ReadError) -> bool {
        let mut slot = self.connection.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        if !slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, dead)) {
            return slot.is_some();
        }

        tracing::warn!(
            url = %dead.url(),
            close_code = ?error.close_code(),
            error = %error,
            "Trade updates connection lost, reconnecting"
        );
        metrics::record_reconnect(StreamKind::TradeUpdates);
        dead.close(false).await;
        *slot = None;

        let result = tokio::select! {
            () = self.shutdown.cancelled() => return false,
            result = self.establish() => result,
        };

        match result {
            Ok(connection) => {
                *slot = Some(Arc::new(connection));
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Trade updates reconnection failed, giving up");
                *self.terminal.lock() = Some(e.to_string());
                false
            }
        }
    }
}

async fn read_loop(inner: Weak<Inner>) {
    loop {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let Some(connection) = inner.connection.lock().await.clone() else {
            break;
        };

        match connection.read_frame().await {
            Ok(frame) => inner.handle_frame(&frame),
            Err(e) => {
                if inner.closed.load(Ordering::Acquire) || !inner.recover(&connection, &e).await {
                    break;
                }
            }
        }
    }
    tracing::debug!("Trade updates read loop stopped");
}

const fn kind(message: &TradingMessage) -> &'static str {
    match message {
        TradingMessage::Authorization(_) => "authorization",
        TradingMessage::Listening(_) => "listening",
        TradingMessage::TradeUpdate(_) => TRADE_UPDATES,
    }
}
