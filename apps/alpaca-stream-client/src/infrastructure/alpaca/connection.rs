//! Connection Manager
//!
//! One transport connection to the market data stream: handshake with a
//! bounded retry schedule, the `connected` acknowledgment, the auth
//! handshake, and framed reads and writes.
//!
//! # Locking
//!
//! Reads and writes go through two independent async mutexes so the read
//! loop never blocks a subscribe, and the one-shot auth read cannot race the
//! read loop. Closing cancels a token that every pending read selects on, so
//! a blocked reader wakes up with [`ReadError::Closed`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::auth::{AUTH_TIMEOUT, AuthError, Credentials, check_auth_reply};
use super::codec::{CodecError, JsonCodec, MsgPackCodec};
use super::messages::{StreamMessage, SuccessKind};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{Connector, Frame, FrameReader, FrameWriter, TransportError};
use crate::domain::streaming::{AtomicConnectionState, ConnectionState};

// =============================================================================
// Settings
// =============================================================================

/// Default number of transport handshakes per [`Connection::open`].
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;

/// Default delay between handshakes.
pub const DEFAULT_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Tunables for opening and authenticating a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Transport handshakes before giving up.
    pub connect_attempts: u32,
    /// Sleep between handshakes.
    pub connect_retry_delay: Duration,
    /// Maximum wait for the auth reply.
    pub auth_timeout: Duration,
    /// When set, the retry delay doubles after each failure up to this cap,
    /// with ±10% jitter.
    pub connect_backoff_max: Option<Duration>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_retry_delay: DEFAULT_CONNECT_RETRY_DELAY,
            auth_timeout: AUTH_TIMEOUT,
            connect_backoff_max: None,
        }
    }
}

impl ConnectionSettings {
    /// Retry schedule for the transport handshake.
    #[must_use]
    pub const fn reconnect_config(&self) -> ReconnectConfig {
        match self.connect_backoff_max {
            Some(max) => {
                ReconnectConfig::exponential(self.connect_retry_delay, max, self.connect_attempts)
            }
            None => ReconnectConfig::fixed(self.connect_retry_delay, self.connect_attempts),
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Failure to establish a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// Every handshake attempt failed.
    #[error("failed to connect to {url} after {attempts} attempts: {source}")]
    Exhausted {
        /// Endpoint URL
        url: String,
        /// Attempts made
        attempts: u32,
        /// Last handshake error
        #[source]
        source: TransportError,
    },

    /// The first frame was not a `connected` acknowledgment.
    #[error("connection not acknowledged: {0}")]
    NotAcknowledged(String),

    /// The acknowledgment frame could not be decoded.
    #[error("connection acknowledgment malformed: {0}")]
    Decode(#[from] CodecError),

    /// The transport failed before the acknowledgment arrived.
    #[error("connection acknowledgment not received: {0}")]
    Read(#[from] ReadError),
}

/// Failure to read a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    /// The connection was closed locally.
    #[error("connection closed")]
    Closed,

    /// The transport failed or the peer closed it.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ReadError {
    /// WebSocket close code sent by the peer, if any.
    #[must_use]
    pub const fn close_code(&self) -> Option<u16> {
        match self {
            Self::Closed => None,
            Self::Transport(e) => e.close_code(),
        }
    }
}

/// Failure to write a frame.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// The connection was closed locally.
    #[error("connection closed")]
    Closed,

    /// The payload could not be encoded.
    #[error("encode failed: {0}")]
    Encode(#[from] CodecError),

    /// The transport rejected the write.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// =============================================================================
// Connection
// =============================================================================

/// One live transport connection.
pub struct Connection {
    url: String,
    reader: Mutex<Option<Box<dyn FrameReader>>>,
    writer: Mutex<Option<Box<dyn FrameWriter>>>,
    codec: MsgPackCodec,
    authenticated: AtomicBool,
    state: AtomicConnectionState,
    shutdown: CancellationToken,
    auth_timeout: Duration,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url)
            .field("state", &self.state.load())
            .field("authenticated", &self.is_authenticated())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open a transport and wait for the server's `connected` acknowledgment.
    ///
    /// Makes up to `settings.connect_attempts` handshakes, sleeping
    /// `settings.connect_retry_delay` between them.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Exhausted`] if every handshake failed, or
    /// another [`ConnectError`] if the acknowledgment is missing or wrong.
    pub async fn open(
        connector: &Arc<dyn Connector>,
        url: &str,
        settings: &ConnectionSettings,
    ) -> Result<Self, ConnectError> {
        let connection = Self::connect(connector, url, settings).await?;

        if let Err(e) = connection.await_connected().await {
            connection.close(false).await;
            return Err(e);
        }

        connection.state.store(ConnectionState::Authenticating);
        tracing::info!(url = %url, "Connected to stream");
        Ok(connection)
    }

    /// Perform the transport handshake only, with the same retry schedule
    /// as [`Self::open`]. Used by streams that do not send an acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Exhausted`] if every handshake failed.
    pub async fn connect(
        connector: &Arc<dyn Connector>,
        url: &str,
        settings: &ConnectionSettings,
    ) -> Result<Self, ConnectError> {
        let mut policy = ReconnectPolicy::new(settings.reconnect_config());

        let (reader, writer) = loop {
            tracing::debug!(url = %url, attempt = policy.failures() + 1, "Connecting to stream");
            match connector.connect(url).await {
                Ok(halves) => break halves,
                Err(e) => match policy.next_delay() {
                    Some(delay) => {
                        tracing::warn!(
                            url = %url,
                            attempt = policy.failures(),
                            error = %e,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "Connection attempt failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(ConnectError::Exhausted {
                            url: url.to_string(),
                            attempts: policy.failures(),
                            source: e,
                        });
                    }
                },
            }
        };

        Ok(Self {
            url: url.to_string(),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            codec: MsgPackCodec::new(),
            authenticated: AtomicBool::new(false),
            state: AtomicConnectionState::new(ConnectionState::Connecting),
            shutdown: CancellationToken::new(),
            auth_timeout: settings.auth_timeout,
        })
    }

    async fn await_connected(&self) -> Result<(), ConnectError> {
        let frame = self.read_frame().await?;
        let Frame::Binary(bytes) = frame else {
            return Err(ConnectError::NotAcknowledged(
                "non-binary first frame".to_string(),
            ));
        };

        let messages = self.codec.decode(&bytes)?;
        match messages.first() {
            Some(StreamMessage::Success(s)) if s.msg == SuccessKind::Connected => Ok(()),
            Some(StreamMessage::Error(e)) => Err(ConnectError::NotAcknowledged(e.to_string())),
            Some(other) => Err(ConnectError::NotAcknowledged(format!(
                "unexpected {} message",
                other.kind()
            ))),
            None => Err(ConnectError::NotAcknowledged("empty frame".to_string())),
        }
    }

    /// Authenticate, unless this connection already is.
    ///
    /// Sends the auth frame and waits at most the configured auth timeout
    /// for exactly one reply frame.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] on timeout, on an error reply, or on any
    /// reply other than an `authenticated` acknowledgment.
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<(), AuthError> {
        if self.is_authenticated() {
            return Ok(());
        }

        self.state.store(ConnectionState::Authenticating);
        self.write_message(&credentials.to_auth_request()).await?;

        let frame = tokio::time::timeout(self.auth_timeout, self.read_frame())
            .await
            .map_err(|_| AuthError::Timeout(self.auth_timeout))??;
        let Frame::Binary(bytes) = frame else {
            return Err(AuthError::UnexpectedReply("non-binary reply".to_string()));
        };

        check_auth_reply(&self.codec.decode(&bytes)?)?;

        self.mark_authenticated();
        tracing::info!(url = %self.url, key = %credentials.key(), "Authenticated");
        Ok(())
    }

    /// Read the next frame.
    ///
    /// Blocks until a frame arrives or the connection is closed.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError::Closed`] after [`Self::close`], or the transport
    /// error (including the peer's close code) otherwise.
    pub async fn read_frame(&self) -> Result<Frame, ReadError> {
        if self.state.load().is_shutting_down() {
            return Err(ReadError::Closed);
        }

        let mut guard = self.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return Err(ReadError::Closed);
        };

        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Err(ReadError::Closed),
            frame = reader.next_frame() => frame.map_err(ReadError::from),
        }
    }

    /// Write one binary frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the write fails.
    pub async fn write_frame(&self, bytes: Vec<u8>) -> Result<(), WriteError> {
        self.send(Frame::Binary(bytes)).await
    }

    /// Encode a message as `MessagePack` and write it.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the write fails.
    pub async fn write_message<T: Serialize + Sync>(&self, message: &T) -> Result<(), WriteError> {
        let bytes = self.codec.encode(message)?;
        self.write_frame(bytes).await
    }

    /// Encode a message as JSON and write it as a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the write fails.
    pub async fn write_json<T: Serialize + Sync>(&self, message: &T) -> Result<(), WriteError> {
        let text = JsonCodec::new().encode(message)?;
        self.send(Frame::Text(text)).await
    }

    async fn send(&self, frame: Frame) -> Result<(), WriteError> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(WriteError::Closed);
        };
        if self.state.load().is_shutting_down() {
            return Err(WriteError::Closed);
        }
        writer.send_frame(frame).await?;
        Ok(())
    }

    /// Record a handshake completed outside [`Self::authenticate`].
    pub(crate) fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::Release);
        self.state.store(ConnectionState::Ready);
    }

    /// Close the connection and release the transport.
    ///
    /// A graceful close sends a normal-closure close frame first. Any
    /// blocked [`Self::read_frame`] returns [`ReadError::Closed`]. Calling
    /// this more than once is a no-op.
    pub async fn close(&self, graceful: bool) {
        if !self.state.begin_close() {
            return;
        }
        self.shutdown.cancel();

        if let Some(mut writer) = self.writer.lock().await.take()
            && let Err(e) = writer.close(graceful).await
        {
            tracing::debug!(url = %self.url, error = %e, "Close handshake failed");
        }
        drop(self.reader.lock().await.take());

        self.authenticated.store(false, Ordering::Release);
        self.state.store(ConnectionState::Closed);
        tracing::debug!(url = %self.url, graceful, "Connection closed");
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    /// Check if the auth handshake has completed.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::alpaca::reconnect::Backoff;
    use crate::infrastructure::alpaca::testing::{
        FakeConnector, connected_frame, authenticated_frame, error_frame,
    };

    fn credentials() -> Credentials {
        Credentials::new("key", "secret").unwrap()
    }

    fn settings() -> ConnectionSettings {
        ConnectionSettings::default()
    }

    #[test]
    fn default_settings() {
        let settings = ConnectionSettings::default();
        assert_eq!(settings.connect_attempts, 3);
        assert_eq!(settings.connect_retry_delay, Duration::from_secs(1));
        assert_eq!(settings.auth_timeout, Duration::from_secs(5));
        assert_eq!(
            settings.reconnect_config().backoff,
            Backoff::Fixed(Duration::from_secs(1))
        );
    }

    #[test]
    fn backoff_cap_selects_exponential_schedule() {
        let settings = ConnectionSettings {
            connect_retry_delay: Duration::from_millis(100),
            connect_backoff_max: Some(Duration::from_millis(400)),
            ..ConnectionSettings::default()
        };

        let config = settings.reconnect_config();
        assert_eq!(
            config.backoff,
            Backoff::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_millis(400),
            }
        );
        assert_eq!(config.max_attempts, 3);
        assert!(config.jitter_factor > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_retries_then_succeeds() {
        let fake = FakeConnector::new();
        fake.fail_next_connects(2);
        let server = fake.expect_session();
        server.push(connected_frame());
        let connector: Arc<dyn Connector> = Arc::new(fake.clone());

        let start = tokio::time::Instant::now();
        let conn = Connection::open(&connector, "ws://test/v2/iex", &settings())
            .await
            .unwrap();

        assert_eq!(fake.connect_calls(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(conn.state(), ConnectionState::Authenticating);
    }

    #[tokio::test(start_paused = true)]
    async fn open_gives_up_after_attempts() {
        let fake = FakeConnector::new();
        fake.fail_next_connects(10);
        let connector: Arc<dyn Connector> = Arc::new(fake.clone());

        let err = Connection::open(&connector, "ws://test/v2/iex", &settings())
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectError::Exhausted { attempts: 3, .. }));
        assert_eq!(fake.connect_calls(), 3);
    }

    #[tokio::test]
    async fn open_requires_connected_ack() {
        let fake = FakeConnector::new();
        let server = fake.expect_session();
        server.push(authenticated_frame());
        let connector: Arc<dyn Connector> = Arc::new(fake);

        let err = Connection::open(&connector, "ws://test/v2/iex", &settings())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::NotAcknowledged(_)));
    }

    #[tokio::test]
    async fn authenticate_sends_auth_and_is_idempotent() {
        let fake = FakeConnector::new();
        let server = fake.expect_session();
        server.push(connected_frame());
        server.push(authenticated_frame());
        let connector: Arc<dyn Connector> = Arc::new(fake);

        let conn = Connection::open(&connector, "ws://test/v2/iex", &settings())
            .await
            .unwrap();
        conn.authenticate(&credentials()).await.unwrap();
        conn.authenticate(&credentials()).await.unwrap();

        assert!(conn.is_authenticated());
        assert_eq!(conn.state(), ConnectionState::Ready);
        let sent = server.sent_values();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["action"], "auth");
        assert_eq!(sent[0]["key"], "key");
    }

    #[tokio::test]
    async fn authenticate_rejects_error_reply() {
        let fake = FakeConnector::new();
        let server = fake.expect_session();
        server.push(connected_frame());
        server.push(error_frame(402, "auth failed"));
        let connector: Arc<dyn Connector> = Arc::new(fake);

        let conn = Connection::open(&connector, "ws://test/v2/iex", &settings())
            .await
            .unwrap();
        let err = conn.authenticate(&credentials()).await.unwrap_err();

        assert!(matches!(err, AuthError::InvalidCredentials));
        assert!(!conn.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn authenticate_times_out_without_reply() {
        let fake = FakeConnector::new();
        let server = fake.expect_session();
        server.push(connected_frame());
        let connector: Arc<dyn Connector> = Arc::new(fake);

        let conn = Connection::open(&connector, "ws://test/v2/iex", &settings())
            .await
            .unwrap();

        let start = tokio::time::Instant::now();
        let err = conn.authenticate(&credentials()).await.unwrap_err();

        assert!(matches!(err, AuthError::Timeout(d) if d == Duration::from_secs(5)));
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn close_wakes_blocked_reader_and_is_idempotent() {
        let fake = FakeConnector::new();
        let server = fake.expect_session();
        server.push(connected_frame());
        let connector: Arc<dyn Connector> = Arc::new(fake);

        let conn = Arc::new(
            Connection::open(&connector, "ws://test/v2/iex", &settings())
                .await
                .unwrap(),
        );

        let reader = Arc::clone(&conn);
        let pending = tokio::spawn(async move { reader.read_frame().await });
        tokio::task::yield_now().await;

        conn.close(true).await;
        conn.close(true).await;

        assert_eq!(pending.await.unwrap(), Err(ReadError::Closed));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(server.close_calls(), vec![true]);
        assert!(matches!(
            conn.write_frame(vec![0x90]).await,
            Err(WriteError::Closed)
        ));
    }

    #[tokio::test]
    async fn connect_skips_ack_and_writes_text() {
        let fake = FakeConnector::new();
        let server = fake.expect_session();
        let connector: Arc<dyn Connector> = Arc::new(fake);

        let conn = Connection::connect(&connector, "ws://test/stream", &settings())
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Connecting);

        conn.write_json(&serde_json::json!({"action": "listen"}))
            .await
            .unwrap();
        conn.mark_authenticated();

        assert_eq!(server.sent_values(), vec![serde_json::json!({"action": "listen"})]);
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn peer_close_code_is_reported() {
        let fake = FakeConnector::new();
        let server = fake.expect_session();
        server.push(connected_frame());
        let connector: Arc<dyn Connector> = Arc::new(fake);

        let conn = Connection::open(&connector, "ws://test/v2/iex", &settings())
            .await
            .unwrap();
        server.disconnect(Some(1006));

        let err = conn.read_frame().await.unwrap_err();
        assert_eq!(err.close_code(), Some(1006));
    }
}
