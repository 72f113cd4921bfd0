//! Stream Session
//!
//! One logical market data subscription that outlives any single
//! connection. The session connects lazily on the first subscribe, runs one
//! background read loop, and after a connection loss reconnects,
//! re-authenticates and resubscribes from the handler registry without the
//! caller noticing.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──subscribe──► Connected ──read error──► Reconnecting ──► Connected
//!                        │                          │
//!                        └──────close()──► Closed   └──exhausted──► Failed
//! ```
//!
//! A `Failed` session keeps its terminal error in
//! [`StreamSession::terminal_error`]; a `Closed` one never reconnects.
//!
//! # Locking
//!
//! The current connection sits behind an async `RwLock`. Subscribe and
//! unsubscribe hold the read side across their write and registry update;
//! reconnects and feed switches hold the write side while they rebuild the
//! connection and resubscribe, so the resubscribe frame always covers every
//! completed subscribe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::auth::{AuthError, Credentials};
use super::codec::MsgPackCodec;
use super::connection::{ConnectError, Connection, ConnectionSettings, ReadError, WriteError};
use super::messages::{BarMessage, QuoteMessage, StreamMessage, TradeMessage, TradeUpdate};
use super::subscriptions::{MarketDataRegistry, SubscriptionManager};
use super::trading::{TradeUpdatesConfig, TradeUpdatesError, TradeUpdatesStream};
use super::websocket::WebSocketConnector;
use crate::application::ports::{Connector, Frame};
use crate::domain::streaming::ConnectionState;
use crate::domain::subscription::{
    Channel, DispatchError, Handler, HandlerMap, SubscriptionSet, Symbol, dedup_symbols,
};
use crate::infrastructure::config::{
    ConfigError, DEFAULT_STREAM_URL, DataFeed, Environment, StreamConfig, stream_endpoint,
};
use crate::infrastructure::metrics::{self, StreamKind};

// =============================================================================
// Configuration
// =============================================================================

/// Everything a session needs to connect.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// API credentials, fixed for the life of the session.
    pub credentials: Credentials,
    /// Initial feed.
    pub feed: DataFeed,
    /// Market data base URL; the feed path is appended.
    pub base_url: String,
    /// Trade updates endpoint.
    pub trading_url: String,
    /// Connect attempts, retry delay and auth timeout.
    pub connection: ConnectionSettings,
}

impl SessionConfig {
    /// Production endpoints, IEX feed, paper trade updates.
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            feed: DataFeed::default(),
            base_url: DEFAULT_STREAM_URL.to_string(),
            trading_url: Environment::Paper.trade_updates_url().to_string(),
            connection: ConnectionSettings::default(),
        }
    }

    /// Set the initial feed.
    #[must_use]
    pub const fn with_feed(mut self, feed: DataFeed) -> Self {
        self.feed = feed;
        self
    }

    /// Set the market data base URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the trade updates endpoint.
    #[must_use]
    pub fn with_trading_url(mut self, trading_url: impl Into<String>) -> Self {
        self.trading_url = trading_url.into();
        self
    }

    /// Set the connection tunables.
    #[must_use]
    pub const fn with_connection(mut self, connection: ConnectionSettings) -> Self {
        self.connection = connection;
        self
    }
}

impl From<&StreamConfig> for SessionConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            credentials: config.credentials.clone(),
            feed: config.feed,
            base_url: config.stream_url.clone(),
            trading_url: config.trade_updates_url(),
            connection: config.connection.clone(),
        }
    }
}

// =============================================================================
// Status and Errors
// =============================================================================

/// Coarse session status, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    /// Nothing connected yet.
    #[default]
    Idle,
    /// Connected, authenticated and subscribed.
    Connected,
    /// Rebuilding the connection.
    Reconnecting,
    /// Closed by the caller.
    Closed,
    /// Reconnection was exhausted; see the terminal error.
    Failed,
}

impl SessionStatus {
    /// Get the status name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session was closed.
    #[error("stream session closed")]
    Closed,

    /// Reconnection was exhausted earlier.
    #[error("stream session terminated: {0}")]
    Terminated(String),

    /// Opening a connection failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Authentication failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// A subscribe or unsubscribe frame could not be written.
    #[error(transparent)]
    Write(#[from] WriteError),

    /// Invalid feed or endpoint.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The trade updates stream failed.
    #[error(transparent)]
    TradeUpdates(#[from] TradeUpdatesError),
}

// =============================================================================
// Session
// =============================================================================

/// A self-healing market data subscription.
///
/// Cloning yields another handle to the same session.
///
/// # Backpressure
///
/// There is none. Callbacks run inline on the read loop task, one record at
/// a time, so a slow handler delays every symbol on every channel. Hand work
/// off to a channel or task if a handler can block. An unsubscribe waits for
/// a running handler it removes, so handlers must spawn a task to subscribe
/// or unsubscribe rather than awaiting it inline.
#[derive(Clone)]
pub struct StreamSession {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    credentials: Credentials,
    base_url: String,
    trading_url: String,
    settings: ConnectionSettings,
    feed: RwLock<DataFeed>,
    subscriptions: SubscriptionManager,
    codec: MsgPackCodec,
    connection: tokio::sync::RwLock<Option<Arc<Connection>>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    status: watch::Sender<SessionStatus>,
    terminal: Mutex<Option<String>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    trade_updates: Mutex<Option<TradeUpdatesStream>>,
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("base_url", &self.inner.base_url)
            .field("feed", &self.feed())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl StreamSession {
    /// Create a session that connects over WebSocket.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid.
    pub fn new(config: SessionConfig) -> Result<Self, ConfigError> {
        Self::with_connector(config, Arc::new(WebSocketConnector::new()))
    }

    /// Create a session over a custom transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid.
    pub fn with_connector(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ConfigError> {
        stream_endpoint(&config.base_url, config.feed)?;

        let (status, _) = watch::channel(SessionStatus::Idle);
        Ok(Self {
            inner: Arc::new(Inner {
                connector,
                credentials: config.credentials,
                base_url: config.base_url,
                trading_url: config.trading_url,
                settings: config.connection,
                feed: RwLock::new(config.feed),
                subscriptions: SubscriptionManager::default(),
                codec: MsgPackCodec::new(),
                connection: tokio::sync::RwLock::new(None),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                status,
                terminal: Mutex::new(None),
                reader: Mutex::new(None),
                trade_updates: Mutex::new(None),
            }),
        })
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Deliver trades for `symbols` to `handler`. `"*"` matches any symbol
    /// without its own handler.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed or failed, the connection
    /// cannot be established, or the subscribe frame cannot be written.
    pub async fn subscribe_trades<S, F>(&self, symbols: &[S], handler: F) -> Result<(), SessionError>
    where
        S: AsRef<str> + Sync,
        F: Fn(TradeMessage) + Send + Sync + 'static,
    {
        self.subscribe_channel(MarketDataRegistry::trades, dedup_symbols(symbols), Arc::new(handler))
            .await
    }

    /// Deliver quotes for `symbols` to `handler`.
    ///
    /// # Errors
    ///
    /// See [`Self::subscribe_trades`].
    pub async fn subscribe_quotes<S, F>(&self, symbols: &[S], handler: F) -> Result<(), SessionError>
    where
        S: AsRef<str> + Sync,
        F: Fn(QuoteMessage) + Send + Sync + 'static,
    {
        self.subscribe_channel(MarketDataRegistry::quotes, dedup_symbols(symbols), Arc::new(handler))
            .await
    }

    /// Deliver minute bars for `symbols` to `handler`.
    ///
    /// # Errors
    ///
    /// See [`Self::subscribe_trades`].
    pub async fn subscribe_bars<S, F>(&self, symbols: &[S], handler: F) -> Result<(), SessionError>
    where
        S: AsRef<str> + Sync,
        F: Fn(BarMessage) + Send + Sync + 'static,
    {
        self.subscribe_channel(MarketDataRegistry::bars, dedup_symbols(symbols), Arc::new(handler))
            .await
    }

    /// Stop delivering trades for `symbols`.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed or failed, or the
    /// unsubscribe frame cannot be written; the handlers are kept then.
    pub async fn unsubscribe_trades<S: AsRef<str> + Sync>(
        &self,
        symbols: &[S],
    ) -> Result<(), SessionError> {
        self.unsubscribe_channel(MarketDataRegistry::trades, dedup_symbols(symbols))
            .await
    }

    /// Stop delivering quotes for `symbols`.
    ///
    /// # Errors
    ///
    /// See [`Self::unsubscribe_trades`].
    pub async fn unsubscribe_quotes<S: AsRef<str> + Sync>(
        &self,
        symbols: &[S],
    ) -> Result<(), SessionError> {
        self.unsubscribe_channel(MarketDataRegistry::quotes, dedup_symbols(symbols))
            .await
    }

    /// Stop delivering bars for `symbols`.
    ///
    /// # Errors
    ///
    /// See [`Self::unsubscribe_trades`].
    pub async fn unsubscribe_bars<S: AsRef<str> + Sync>(
        &self,
        symbols: &[S],
    ) -> Result<(), SessionError> {
        self.unsubscribe_channel(MarketDataRegistry::bars, dedup_symbols(symbols))
            .await
    }

    /// Deliver account trade updates to `handler`, replacing any previous
    /// handler. Opens the trade updates stream on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed or the trade updates
    /// stream cannot connect.
    pub async fn subscribe_trade_updates<F>(&self, handler: F) -> Result<(), SessionError>
    where
        F: Fn(TradeUpdate) + Send + Sync + 'static,
    {
        self.inner.check_open()?;
        let stream = self
            .inner
            .trade_updates
            .lock()
            .get_or_insert_with(|| {
                TradeUpdatesStream::new(
                    Arc::clone(&self.inner.connector),
                    TradeUpdatesConfig {
                        url: self.inner.trading_url.clone(),
                        credentials: self.inner.credentials.clone(),
                        connection: self.inner.settings.clone(),
                    },
                )
            })
            .clone();

        stream.subscribe(Arc::new(handler)).await?;
        if self.inner.closed.load(Ordering::Acquire) {
            stream.close().await;
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    async fn subscribe_channel<T>(
        &self,
        handlers: fn(&MarketDataRegistry) -> &HandlerMap<T>,
        symbols: Vec<Symbol>,
        handler: Handler<T>,
    ) -> Result<(), SessionError> {
        if symbols.is_empty() {
            return Ok(());
        }
        self.ensure_running().await?;

        let slot = self.inner.connection.read().await;
        let Some(connection) = slot.as_ref() else {
            return Err(self.inner.unavailable());
        };
        let manager = &self.inner.subscriptions;
        manager
            .subscribe(connection, handlers(manager.registry()), &symbols, handler)
            .await?;
        Ok(())
    }

    async fn unsubscribe_channel<T>(
        &self,
        handlers: fn(&MarketDataRegistry) -> &HandlerMap<T>,
        symbols: Vec<Symbol>,
    ) -> Result<(), SessionError> {
        self.inner.check_open()?;
        if symbols.is_empty() {
            return Ok(());
        }

        let slot = self.inner.connection.read().await;
        let manager = &self.inner.subscriptions;
        let map = handlers(manager.registry());
        match slot.as_ref() {
            Some(connection) => manager.unsubscribe(connection, map, &symbols).await?,
            None => {
                map.unregister(&symbols);
                metrics::set_active_subscriptions(map.channel(), map.len());
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Connect, authenticate, resubscribe and start the read loop, unless a
    /// connection is already running.
    async fn ensure_running(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        inner.check_open()?;
        if inner.connection.read().await.is_some() {
            return Ok(());
        }

        let mut slot = inner.connection.write().await;
        inner.check_open()?;
        if slot.is_some() {
            return Ok(());
        }

        let connection = Arc::new(inner.establish_unless_closed().await?);
        if inner.closed.load(Ordering::Acquire) {
            connection.close(true).await;
            return Err(SessionError::Closed);
        }
        *slot = Some(connection);

        // Published under the slot so a racing close() always lands last.
        let handle = tokio::spawn(read_loop(Arc::downgrade(inner)));
        *inner.reader.lock() = Some(handle);
        inner.status.send_replace(SessionStatus::Connected);
        drop(slot);
        Ok(())
    }

    /// Switch to another feed.
    ///
    /// A running session closes its connection and reconnects to the new
    /// endpoint, resubscribing every registered symbol. An idle session only
    /// records the feed for its first connect.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnsupportedFeed`] for an unknown feed name,
    /// [`SessionError::Closed`] or [`SessionError::Terminated`] for an
    /// unusable session, or the reconnect error, which is terminal.
    pub async fn use_feed(&self, feed: &str) -> Result<(), SessionError> {
        let feed: DataFeed = feed.parse()?;
        let inner = &self.inner;
        inner.check_open()?;

        let mut slot = inner.connection.write().await;
        inner.check_open()?;
        let previous = std::mem::replace(&mut *inner.feed.write(), feed);

        let Some(old) = slot.take() else {
            tracing::debug!(feed = %feed, "Feed set for next connect");
            return Ok(());
        };

        tracing::info!(from = %previous, to = %feed, "Switching feed");
        inner.status.send_replace(SessionStatus::Reconnecting);
        old.close(true).await;

        match inner.establish_unless_closed().await {
            Ok(connection) => {
                *slot = Some(Arc::new(connection));
                inner.status.send_replace(SessionStatus::Connected);
                Ok(())
            }
            Err(SessionError::Closed) => Err(SessionError::Closed),
            Err(e) => {
                inner.fail(&e);
                Err(e)
            }
        }
    }

    /// Close the session: gracefully close the connection and the trade
    /// updates stream and stop the read loop. Idempotent.
    ///
    /// The read loop is not awaited, so this may be called from a handler.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.shutdown.cancel();

        let connection = inner.connection.write().await.take();
        if let Some(connection) = connection {
            connection.close(true).await;
        }

        let trade_updates = inner.trade_updates.lock().take();
        if let Some(stream) = trade_updates {
            stream.close().await;
        }

        drop(inner.reader.lock().take());
        inner.status.send_replace(SessionStatus::Closed);
        tracing::info!(base_url = %inner.base_url, "Stream session closed");
    }

    // -------------------------------------------------------------------------
    // Observers
    // -------------------------------------------------------------------------

    /// Current status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.inner.status.borrow()
    }

    /// Receiver notified on every status change.
    #[must_use]
    pub fn status_changes(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    /// Reason the session stopped reconnecting, if it did.
    #[must_use]
    pub fn terminal_error(&self) -> Option<String> {
        self.inner.terminal.lock().clone()
    }

    /// Active feed.
    #[must_use]
    pub fn feed(&self) -> DataFeed {
        *self.inner.feed.read()
    }

    /// The registry's current key sets.
    #[must_use]
    pub fn desired_subscription_set(&self) -> SubscriptionSet {
        self.inner.subscriptions.desired_subscription_set()
    }

    /// Check if [`Self::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// State of the current connection.
    pub async fn connection_state(&self) -> ConnectionState {
        match self.inner.connection.read().await.as_ref() {
            Some(connection) => connection.state(),
            None if self.is_closed() => ConnectionState::Closed,
            None => ConnectionState::Disconnected,
        }
    }
}

impl Inner {
    fn check_open(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        if let Some(reason) = self.terminal.lock().clone() {
            return Err(SessionError::Terminated(reason));
        }
        Ok(())
    }

    fn unavailable(&self) -> SessionError {
        match self.check_open() {
            Err(e) => e,
            Ok(()) => SessionError::Write(WriteError::Closed),
        }
    }

    fn fail(&self, error: &SessionError) {
        tracing::error!(error = %error, "Stream session reconnection failed, giving up");
        *self.terminal.lock() = Some(error.to_string());
        self.status.send_replace(SessionStatus::Failed);
    }

    /// Open, authenticate and resubscribe. Closes the connection on failure.
    async fn establish(&self) -> Result<Connection, SessionError> {
        let feed = *self.feed.read();
        let url = stream_endpoint(&self.base_url, feed)?;
        let connection = Connection::open(&self.connector, url.as_str(), &self.settings).await?;

        if let Err(e) = self.handshake(&connection).await {
            connection.close(false).await;
            return Err(e);
        }
        Ok(connection)
    }

    async fn handshake(&self, connection: &Connection) -> Result<(), SessionError> {
        connection.authenticate(&self.credentials).await?;
        self.subscriptions.resubscribe(connection).await?;
        Ok(())
    }

    async fn establish_unless_closed(&self) -> Result<Connection, SessionError> {
        tokio::select! {
            () = self.shutdown.cancelled() => Err(SessionError::Closed),
            result = self.establish() => result,
        }
    }

    fn handle_frame(&self, frame: Frame) {
        let Frame::Binary(bytes) = frame else {
            tracing::trace!("Discarding non-binary frame");
            return;
        };
        metrics::record_frame_received(StreamKind::MarketData);

        match self.codec.decode(&bytes) {
            Ok(messages) => {
                for message in messages {
                    self.dispatch(message);
                }
            }
            Err(e) => {
                metrics::record_decode_error(StreamKind::MarketData);
                tracing::warn!(error = %e, len = bytes.len(), "Skipping malformed frame");
            }
        }
    }

    fn dispatch(&self, message: StreamMessage) {
        let registry = self.subscriptions.registry();
        let (channel, result) = match message {
            StreamMessage::Trade(trade) => {
                let symbol = trade.symbol.clone();
                (Channel::Trades, registry.trades().dispatch(&symbol, trade))
            }
            StreamMessage::Quote(quote) => {
                let symbol = quote.symbol.clone();
                (Channel::Quotes, registry.quotes().dispatch(&symbol, quote))
            }
            StreamMessage::Bar(bar) => {
                let symbol = bar.symbol.clone();
                (Channel::Bars, registry.bars().dispatch(&symbol, bar))
            }
            StreamMessage::Error(error) => {
                tracing::error!(
                    code = error.code,
                    msg = %error.msg,
                    category = error.category(),
                    "Stream reported an error"
                );
                return;
            }
            StreamMessage::Subscription(subscription) => {
                tracing::info!(
                    trades = ?subscription.trades,
                    quotes = ?subscription.quotes,
                    bars = ?subscription.bars,
                    "Subscription confirmed"
                );
                return;
            }
            StreamMessage::Success(success) => {
                tracing::debug!(msg = ?success.msg, "Stream acknowledgment");
                return;
            }
        };

        match result {
            Ok(()) => metrics::record_dispatched(channel),
            Err(DispatchError::MissingHandler { channel, symbol }) => {
                metrics::record_missing_handler(channel);
                tracing::debug!(channel = %channel, symbol = %symbol, "No handler for record");
            }
        }
    }

    /// Replace a dead connection. Returns `false` when the loop must stop.
    async fn recover(&self, dead: &Arc<Connection>, error: &ReadError) -> bool {
        let mut slot = self.connection.write().await;
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        if !slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, dead)) {
            // Replaced by a feed switch, or already failed.
            return slot.is_some();
        }

        tracing::warn!(
            url = %dead.url(),
            close_code = ?error.close_code(),
            error = %error,
            "Stream connection lost, reconnecting"
        );
        self.status.send_replace(SessionStatus::Reconnecting);
        metrics::record_reconnect(StreamKind::MarketData);
        dead.close(false).await;
        *slot = None;

        match self.establish_unless_closed().await {
            Ok(connection) => {
                *slot = Some(Arc::new(connection));
                self.status.send_replace(SessionStatus::Connected);
                tracing::info!(url = %dead.url(), "Stream connection restored");
                true
            }
            Err(SessionError::Closed) => false,
            Err(e) => {
                self.fail(&e);
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
        let Some(connection) = inner.connection.read().await.clone() else {
            break;
        };

        match connection.read_frame().await {
            Ok(frame) => inner.handle_frame(frame),
            Err(e) => {
                if inner.closed.load(Ordering::Acquire) || !inner.recover(&connection, &e).await {
                    break;
                }
            }
        }
    }
    tracing::debug!("Stream read loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::alpaca::testing::{
        FakeConnector, FakeServer, bar_json, frame_of, quote_json, trade_json,
        trade_update_text,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn session(fake: &FakeConnector) -> StreamSession {
        let config = SessionConfig::new(Credentials::new("key", "secret").unwrap())
            .with_base_url("ws://test")
            .with_trading_url("ws://test/stream");
        StreamSession::with_connector(config, Arc::new(fake.clone())).unwrap()
    }

    fn symbols_of<T, F>(rx: &mut mpsc::UnboundedReceiver<T>, symbol: F) -> Vec<String>
    where
        F: Fn(&T) -> String,
    {
        let mut seen = Vec::new();
        while let Ok(record) = rx.try_recv() {
            seen.push(symbol(&record));
        }
        seen
    }

    async fn subscribed_to_aapl_trades(
        fake: &FakeConnector,
    ) -> (StreamSession, FakeServer, mpsc::UnboundedReceiver<TradeMessage>) {
        let server = fake.expect_authenticated_session();
        let session = session(fake);
        let (tx, rx) = mpsc::unbounded_channel();
        session
            .subscribe_trades(&["AAPL"], move |trade| {
                let _ = tx.send(trade);
            })
            .await
            .unwrap();
        (session, server, rx)
    }

    #[tokio::test]
    async fn first_subscribe_connects_and_delivers() {
        let fake = FakeConnector::new();
        let (session, server, mut rx) = subscribed_to_aapl_trades(&fake).await;

        let sent = server.sent_values();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["action"], "auth");
        assert_eq!(sent[1]["action"], "subscribe");
        assert_eq!(sent[1]["trades"], serde_json::json!(["AAPL"]));
        assert_eq!(fake.connected_urls(), vec!["ws://test/v2/iex"]);
        assert_eq!(session.status(), SessionStatus::Connected);
        assert_eq!(session.connection_state().await, ConnectionState::Ready);

        server.push(frame_of(&[trade_json("AAPL", 150.25, 100)]));
        let trade = rx.recv().await.unwrap();
        assert_eq!(trade.symbol, "AAPL");
        assert_eq!(trade.size, 100);
    }

    #[tokio::test]
    async fn empty_symbol_list_does_not_connect() {
        let fake = FakeConnector::new();
        let session = session(&fake);

        session
            .subscribe_quotes(&[] as &[&str], |_| {})
            .await
            .unwrap();

        assert_eq!(fake.connect_calls(), 0);
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn wildcard_and_missing_handlers() {
        let fake = FakeConnector::new();
        let server = fake.expect_authenticated_session();
        let session = session(&fake);
        let (quote_tx, mut quotes) = mpsc::unbounded_channel();
        let (bar_tx, mut bars) = mpsc::unbounded_channel();

        session
            .subscribe_quotes(&["AAPL"], move |q: QuoteMessage| {
                let _ = quote_tx.send(q);
            })
            .await
            .unwrap();
        session
            .subscribe_bars(&["*"], move |b: BarMessage| {
                let _ = bar_tx.send(b);
            })
            .await
            .unwrap();
        assert_eq!(server.sent_values().len(), 2);

        server.push(frame_of(&[
            quote_json("MSFT"),
            quote_json("AAPL"),
            bar_json("SPY"),
            trade_json("AAPL", 1.0, 1),
        ]));
        server.push(frame_of(&[bar_json("QQQ")]));

        assert_eq!(bars.recv().await.unwrap().symbol, "SPY");
        assert_eq!(bars.recv().await.unwrap().symbol, "QQQ");
        assert_eq!(symbols_of(&mut quotes, |q| q.symbol.clone()), vec!["AAPL"]);
        assert_eq!(session.status(), SessionStatus::Connected);
    }

    #[tokio::test]
    async fn malformed_and_text_frames_are_skipped() {
        let fake = FakeConnector::new();
        let (_session, server, mut rx) = subscribed_to_aapl_trades(&fake).await;

        server.push(frame_of(&[trade_json("AAPL", 10.0, 4)]));
        server.push(vec![0xc1, 0x00, 0x01]);
        server.push(rmp_serde::to_vec_named(&serde_json::json!({"T": "t"})).unwrap());
        server.push_text("[{\"T\":\"t\"}]");
        server.push(frame_of(&[trade_json("AAPL", 10.0, 5)]));

        assert_eq!(rx.recv().await.unwrap().size, 4);
        assert_eq!(rx.recv().await.unwrap().size, 5);
        assert_eq!(fake.connect_calls(), 1);
    }

    #[tokio::test]
    async fn reconnect_resubscribes_full_registry() {
        let fake = FakeConnector::new();
        let (session, first, mut rx) = subscribed_to_aapl_trades(&fake).await;
        session.subscribe_quotes(&["MSFT"], |_| {}).await.unwrap();
        session.subscribe_bars(&["*"], |_| {}).await.unwrap();
        let second = fake.expect_authenticated_session();

        first.disconnect(Some(1006));

        let sent = second.wait_for_sent(2).await;
        assert_eq!(sent[0]["action"], "auth");
        assert_eq!(sent[1]["action"], "subscribe");
        assert_eq!(sent[1]["trades"], serde_json::json!(["AAPL"]));
        assert_eq!(sent[1]["quotes"], serde_json::json!(["MSFT"]));
        assert!(sent[1].get("bars").is_none());
        assert_eq!(first.close_calls(), vec![false]);

        second.push(frame_of(&[trade_json("AAPL", 2.0, 7)]));
        assert_eq!(rx.recv().await.unwrap().size, 7);
        assert_eq!(session.status(), SessionStatus::Connected);
        assert!(session.terminal_error().is_none());
    }

    #[tokio::test]
    async fn status_channel_reports_reconnect() {
        let fake = FakeConnector::new();
        let (session, first, _rx) = subscribed_to_aapl_trades(&fake).await;
        let mut status = session.status_changes();
        let second = fake.expect_authenticated_session();

        first.disconnect(None);
        status.changed().await.unwrap();
        second.wait_for_sent(2).await;

        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| *s == SessionStatus::Connected),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(fake.connect_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnect_is_terminal() {
        let fake = FakeConnector::new();
        let (session, first, _rx) = subscribed_to_aapl_trades(&fake).await;
        let mut status = session.status_changes();
        fake.fail_next_connects(3);

        first.disconnect(Some(1011));
        status
            .wait_for(|s| *s == SessionStatus::Failed)
            .await
            .unwrap();

        assert!(session.terminal_error().unwrap().contains("3 attempts"));
        assert_eq!(fake.connect_calls(), 4);
        assert!(matches!(
            session.subscribe_trades(&["MSFT"], |_| {}).await,
            Err(SessionError::Terminated(_))
        ));
        assert!(matches!(
            session.unsubscribe_trades(&["AAPL"]).await,
            Err(SessionError::Terminated(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn initial_connect_failure_is_returned_not_terminal() {
        let fake = FakeConnector::new();
        fake.fail_next_connects(3);
        let session = session(&fake);

        let err = session.subscribe_trades(&["AAPL"], |_| {}).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Connect(ConnectError::Exhausted { attempts: 3, .. })
        ));
        assert_eq!(session.status(), SessionStatus::Idle);
        assert!(session.desired_subscription_set().is_empty());

        fake.expect_authenticated_session();
        session.subscribe_trades(&["AAPL"], |_| {}).await.unwrap();
        assert_eq!(session.status(), SessionStatus::Connected);
    }

    #[tokio::test]
    async fn failed_subscribe_write_registers_nothing() {
        let fake = FakeConnector::new();
        let (session, server, _rx) = subscribed_to_aapl_trades(&fake).await;
        server.fail_writes(true);

        let err = session.subscribe_trades(&["MSFT"], |_| {}).await.unwrap_err();

        assert!(matches!(err, SessionError::Write(_)));
        let desired = session.desired_subscription_set();
        assert_eq!(desired.trades.len(), 1);
        assert!(desired.trades.contains("AAPL"));
    }

    #[tokio::test]
    async fn unsubscribe_sends_removed_symbols() {
        let fake = FakeConnector::new();
        let (session, server, _rx) = subscribed_to_aapl_trades(&fake).await;

        session.unsubscribe_trades(&["AAPL", "AAPL"]).await.unwrap();

        let sent = server.sent_values();
        assert_eq!(sent[2]["action"], "unsubscribe");
        assert_eq!(sent[2]["trades"], serde_json::json!(["AAPL"]));
        assert!(session.desired_subscription_set().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unsubscribe_returns_after_running_handler_finishes() {
        let fake = FakeConnector::new();
        let server = fake.expect_authenticated_session();
        let session = session(&fake);
        let running = Arc::new(AtomicBool::new(false));
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();

        let flag = Arc::clone(&running);
        session
            .subscribe_trades(&["AAPL"], move |_| {
                flag.store(true, Ordering::SeqCst);
                let _ = started_tx.send(());
                std::thread::sleep(Duration::from_millis(200));
                flag.store(false, Ordering::SeqCst);
            })
            .await
            .unwrap();

        server.push(frame_of(&[trade_json("AAPL", 1.0, 1)]));
        started_rx.recv().await.unwrap();
        session.unsubscribe_trades(&["AAPL"]).await.unwrap();

        assert!(!running.load(Ordering::SeqCst));
        assert_eq!(server.sent_values()[2]["action"], "unsubscribe");
        session.close().await;
    }

    #[tokio::test]
    async fn unsubscribe_before_connect_is_local() {
        let fake = FakeConnector::new();
        let session = session(&fake);

        session.unsubscribe_bars(&["SPY"]).await.unwrap();

        assert_eq!(fake.connect_calls(), 0);
    }

    #[tokio::test]
    async fn use_feed_rejects_unknown_feed() {
        let fake = FakeConnector::new();
        let session = session(&fake);

        let err = session.use_feed("otc").await.unwrap_err();

        assert!(matches!(
            err,
            SessionError::Config(ConfigError::UnsupportedFeed(_))
        ));
        assert_eq!(session.feed(), DataFeed::Iex);
    }

    #[tokio::test]
    async fn use_feed_on_idle_session_only_records_feed() {
        let fake = FakeConnector::new();
        let session = session(&fake);

        session.use_feed("SIP").await.unwrap();
        assert_eq!(fake.connect_calls(), 0);

        fake.expect_authenticated_session();
        session.subscribe_trades(&["AAPL"], |_| {}).await.unwrap();
        assert_eq!(fake.connected_urls(), vec!["ws://test/v2/sip"]);
    }

    #[tokio::test]
    async fn use_feed_rebuilds_connection_and_resubscribes() {
        let fake = FakeConnector::new();
        let (session, first, mut rx) = subscribed_to_aapl_trades(&fake).await;
        let second = fake.expect_authenticated_session();

        session.use_feed("sip").await.unwrap();

        assert_eq!(session.feed(), DataFeed::Sip);
        assert_eq!(
            fake.connected_urls(),
            vec!["ws://test/v2/iex", "ws://test/v2/sip"]
        );
        assert_eq!(first.close_calls(), vec![true]);
        let sent = second.sent_values();
        assert_eq!(sent[1]["trades"], serde_json::json!(["AAPL"]));

        second.push(frame_of(&[trade_json("AAPL", 3.0, 9)]));
        assert_eq!(rx.recv().await.unwrap().size, 9);
        assert_eq!(fake.connect_calls(), 2);
    }

    #[tokio::test]
    async fn close_is_graceful_idempotent_and_final() {
        let fake = FakeConnector::new();
        let (session, server, _rx) = subscribed_to_aapl_trades(&fake).await;

        session.close().await;
        session.close().await;

        assert_eq!(server.close_calls(), vec![true]);
        assert_eq!(session.status(), SessionStatus::Closed);
        assert_eq!(session.connection_state().await, ConnectionState::Closed);
        assert!(matches!(
            session.subscribe_trades(&["AAPL"], |_| {}).await,
            Err(SessionError::Closed)
        ));
        assert!(matches!(session.use_feed("sip").await, Err(SessionError::Closed)));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fake.connect_calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn close_racing_first_connect_ends_closed() {
        for _ in 0..50 {
            let fake = FakeConnector::new();
            let _server = fake.expect_authenticated_session();
            let session = session(&fake);
            let subscriber = {
                let session = session.clone();
                tokio::spawn(async move { session.subscribe_trades(&["AAPL"], |_| {}).await })
            };

            tokio::task::yield_now().await;
            session.close().await;
            let _ = subscriber.await.unwrap();

            assert_eq!(session.status(), SessionStatus::Closed);
            assert_eq!(session.connection_state().await, ConnectionState::Closed);
        }
    }

    #[tokio::test]
    async fn handler_may_close_the_session() {
        let fake = FakeConnector::new();
        let server = fake.expect_authenticated_session();
        let session = session(&fake);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let handle = session.clone();

        session
            .subscribe_trades(&["AAPL"], move |_| {
                let handle = handle.clone();
                let done_tx = done_tx.clone();
                tokio::spawn(async move {
                    handle.close().await;
                    let _ = done_tx.send(());
                });
            })
            .await
            .unwrap();

        server.push(frame_of(&[trade_json("AAPL", 1.0, 1)]));
        done_rx.recv().await.unwrap();

        assert!(session.is_closed());
        assert_eq!(fake.connect_calls(), 1);
    }

    #[tokio::test]
    async fn trade_updates_share_session_lifecycle() {
        let fake = FakeConnector::new();
        let server = fake.expect_trading_session();
        let session = session(&fake);
        let (tx, mut rx) = mpsc::unbounded_channel();

        session
            .subscribe_trade_updates(move |update| {
                let _ = tx.send(update);
            })
            .await
            .unwrap();
        assert_eq!(fake.connected_urls(), vec!["ws://test/stream"]);

        server.push_text(&trade_update_text("AAPL", "fill"));
        assert_eq!(rx.recv().await.unwrap().order.symbol, "AAPL");

        session.close().await;
        assert_eq!(server.close_calls(), vec![true]);
    }
}
