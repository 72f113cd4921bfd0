//! Process-wide stream API.
//!
//! Free functions over one lazily created [`StreamSession`], for programs
//! that want a single market data subscription without threading a handle
//! around. The session is built from [`StreamConfig::from_env`] on first use
//! unless one was installed with [`install`].
//!
//! ```no_run
//! # async fn demo() -> Result<(), alpaca_stream_client::SessionError> {
//! use alpaca_stream_client::stream;
//!
//! stream::subscribe_trades(&["AAPL"], |trade| {
//!     tracing::info!(symbol = %trade.symbol, price = %trade.price, "trade");
//! })
//! .await?;
//! stream::close().await;
//! # Ok(())
//! # }
//! ```
//!
//! After [`close`], the next call builds a fresh session.

use parking_lot::Mutex;

use crate::infrastructure::alpaca::messages::{BarMessage, QuoteMessage, TradeMessage, TradeUpdate};
use crate::infrastructure::alpaca::session::{
    SessionConfig, SessionError, SessionStatus, StreamSession,
};
use crate::infrastructure::config::StreamConfig;

static SESSION: Mutex<Option<StreamSession>> = parking_lot::const_mutex(None);

/// The global session, created from the environment if none exists.
///
/// # Errors
///
/// Returns a configuration error if the environment is incomplete.
pub fn session() -> Result<StreamSession, SessionError> {
    let mut slot = SESSION.lock();
    if let Some(session) = slot.as_ref()
        && !session.is_closed()
    {
        return Ok(session.clone());
    }

    let config = StreamConfig::from_env()?;
    let session = StreamSession::new(SessionConfig::from(&config))?;
    tracing::debug!(feed = %config.feed, "Created global stream session");
    *slot = Some(session.clone());
    Ok(session)
}

/// Make `session` the global session. Returns the one it replaces, which
/// is left running.
pub fn install(session: StreamSession) -> Option<StreamSession> {
    SESSION.lock().replace(session)
}

/// Switch the global session to another feed.
///
/// # Errors
///
/// See [`StreamSession::use_feed`].
pub async fn use_feed(feed: &str) -> Result<(), SessionError> {
    session()?.use_feed(feed).await
}

/// Subscribe to trades on the global session.
///
/// # Errors
///
/// See [`StreamSession::subscribe_trades`].
pub async fn subscribe_trades<S, F>(symbols: &[S], handler: F) -> Result<(), SessionError>
where
    S: AsRef<str> + Sync,
    F: Fn(TradeMessage) + Send + Sync + 'static,
{
    session()?.subscribe_trades(symbols, handler).await
}

/// Subscribe to quotes on the global session.
///
/// # Errors
///
/// See [`StreamSession::subscribe_quotes`].
pub async fn subscribe_quotes<S, F>(symbols: &[S], handler: F) -> Result<(), SessionError>
where
    S: AsRef<str> + Sync,
    F: Fn(QuoteMessage) + Send + Sync + 'static,
{
    session()?.subscribe_quotes(symbols, handler).await
}

/// Subscribe to bars on the global session.
///
/// # Errors
///
/// See [`StreamSession::subscribe_bars`].
pub async fn subscribe_bars<S, F>(symbols: &[S], handler: F) -> Result<(), SessionError>
where
    S: AsRef<str> + Sync,
    F: Fn(BarMessage) + Send + Sync + 'static,
{
    session()?.subscribe_bars(symbols, handler).await
}

/// Unsubscribe trades on the global session.
///
/// # Errors
///
/// See [`StreamSession::unsubscribe_trades`].
pub async fn unsubscribe_trades<S: AsRef<str> + Sync>(symbols: &[S]) -> Result<(), SessionError> {
    session()?.unsubscribe_trades(symbols).await
}

/// Unsubscribe quotes on the global session.
///
/// # Errors
///
/// See [`StreamSession::unsubscribe_quotes`].
pub async fn unsubscribe_quotes<S: AsRef<str> + Sync>(symbols: &[S]) -> Result<(), SessionError> {
    session()?.unsubscribe_quotes(symbols).await
}

/// Unsubscribe bars on the global session.
///
/// # Errors
///
/// See [`StreamSession::unsubscribe_bars`].
pub async fn unsubscribe_bars<S: AsRef<str> + Sync>(symbols: &[S]) -> Result<(), SessionError> {
    session()?.unsubscribe_bars(symbols).await
}

/// Subscribe to account trade updates on the global session.
///
/// # Errors
///
/// See [`StreamSession::subscribe_trade_updates`].
pub async fn subscribe_trade_updates<F>(handler: F) -> Result<(), SessionError>
where
    F: Fn(TradeUpdate) + Send + Sync + 'static,
{
    session()?.subscribe_trade_updates(handler).await
}

/// Status of the global session, if one exists.
#[must_use]
pub fn status() -> Option<SessionStatus> {
    SESSION.lock().as_ref().map(StreamSession::status)
}

/// Close and drop the global session, if one exists.
pub async fn close() {
    let session = SESSION.lock().take();
    if let Some(session) = session {
        session.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::alpaca::auth::Credentials;
    use crate::infrastructure::alpaca::testing::{FakeConnector, frame_of, trade_json};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    // The only test touching the global, so it cannot race another.
    #[tokio::test]
    async fn facade_drives_installed_session() {
        let fake = FakeConnector::new();
        let server = fake.expect_authenticated_session();
        let config = SessionConfig::new(Credentials::new("key", "secret").unwrap())
            .with_base_url("ws://test");
        let session = StreamSession::with_connector(config, Arc::new(fake.clone())).unwrap();
        assert!(install(session.clone()).is_none());

        let (tx, mut rx) = mpsc::unbounded_channel();
        subscribe_trades(&["AAPL"], move |trade| {
            let _ = tx.send(trade);
        })
        .await
        .unwrap();
        subscribe_quotes(&["AAPL"], |_| {}).await.unwrap();
        unsubscribe_quotes(&["AAPL"]).await.unwrap();
        assert_eq!(status(), Some(SessionStatus::Connected));

        server.push(frame_of(&[trade_json("AAPL", 1.5, 3)]));
        assert_eq!(rx.recv().await.unwrap().size, 3);

        close().await;
        assert!(session.is_closed());
        assert_eq!(server.close_calls(), vec![true]);
        assert_eq!(status(), None);
    }
}
