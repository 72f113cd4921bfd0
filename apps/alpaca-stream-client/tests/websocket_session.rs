//! Stream Session Integration Tests
//!
//! Drives a real `StreamSession` against an in-process WebSocket server
//! that speaks the `MessagePack` handshake.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

use alpaca_stream_client::{
    ConnectionSettings, Credentials, SessionConfig, SessionStatus, StreamSession, TradeMessage,
};

const WAIT: Duration = Duration::from_secs(5);

fn encode(value: &Value) -> Vec<u8> {
    rmp_serde::to_vec_named(value).unwrap()
}

fn trade(symbol: &str, size: u32) -> Value {
    json!({"T": "t", "S": symbol, "x": "X", "p": 100.0, "s": size,
           "t": "2024-01-15T14:30:00Z", "c": [" "], "z": "A"})
}

/// Loopback market data server. Each accepted connection completes the
/// connect and auth handshake before it is handed to the test.
struct MockServer {
    listener: TcpListener,
}

impl MockServer {
    async fn start() -> (Self, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        (Self { listener }, base_url)
    }

    async fn accept(&self) -> ServerConn {
        let (tcp, _) = timeout(WAIT, self.listener.accept()).await.unwrap().unwrap();
        let ws = accept_async(tcp).await.unwrap();
        let mut conn = ServerConn { ws };

        conn.send(&json!([{"T": "success", "msg": "connected"}])).await;
        let auth = conn.recv().await;
        assert_eq!(auth["action"], "auth");
        assert_eq!(auth["key"], "key");
        conn.send(&json!([{"T": "success", "msg": "authenticated"}]))
            .await;
        conn
    }
}

struct ServerConn {
    ws: WebSocketStream<TcpStream>,
}

impl ServerConn {
    async fn send(&mut self, value: &Value) {
        self.send_raw(encode(value)).await;
    }

    async fn send_raw(&mut self, bytes: Vec<u8>) {
        self.ws.send(Message::Binary(bytes.into())).await.unwrap();
    }

    async fn send_text(&mut self, text: &str) {
        self.ws.send(Message::Text(text.into())).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        loop {
            let message = timeout(WAIT, self.ws.next()).await.unwrap().unwrap().unwrap();
            if let Message::Binary(bytes) = message {
                return rmp_serde::from_slice(&bytes).unwrap();
            }
        }
    }
}

fn config(base_url: &str) -> SessionConfig {
    SessionConfig::new(Credentials::new("key", "secret").unwrap())
        .with_base_url(base_url)
        .with_connection(ConnectionSettings {
            connect_attempts: 5,
            connect_retry_delay: Duration::from_millis(50),
            auth_timeout: Duration::from_secs(2),
            connect_backoff_max: None,
        })
}

/// Subscribe AAPL trades in the background while the server accepts.
async fn subscribe_aapl(
    session: &StreamSession,
    server: &MockServer,
) -> (ServerConn, mpsc::UnboundedReceiver<TradeMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .subscribe_trades(&["AAPL"], move |trade| {
                    let _ = tx.send(trade);
                })
                .await
        })
    };

    let mut conn = server.accept().await;
    assert_eq!(
        conn.recv().await,
        json!({"action": "subscribe", "trades": ["AAPL"]})
    );
    pending.await.unwrap().unwrap();
    (conn, rx)
}

#[tokio::test]
async fn trade_is_delivered_exactly_once() {
    let (server, base_url) = MockServer::start().await;
    let session = StreamSession::new(config(&base_url)).unwrap();
    let (mut conn, mut rx) = subscribe_aapl(&session, &server).await;
    assert_eq!(session.status(), SessionStatus::Connected);

    conn.send(&json!([trade("AAPL", 10), trade("MSFT", 5)])).await;

    let delivered = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(delivered.symbol, "AAPL");
    assert_eq!(delivered.price, Decimal::new(100, 0));
    assert_eq!(delivered.size, 10);
    assert_eq!(delivered.exchange, "X");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());

    session.close().await;
    assert_eq!(session.status(), SessionStatus::Closed);
}

#[tokio::test]
async fn dropped_connection_reauthenticates_and_resubscribes() {
    let (server, base_url) = MockServer::start().await;
    let session = StreamSession::new(config(&base_url)).unwrap();
    let (mut conn, mut rx) = subscribe_aapl(&session, &server).await;

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.subscribe_trades(&["MSFT"], |_| {}).await })
    };
    assert_eq!(
        conn.recv().await,
        json!({"action": "subscribe", "trades": ["MSFT"]})
    );
    pending.await.unwrap().unwrap();

    let mut status = session.status_changes();
    drop(conn);

    // The new connection repeats the auth handshake inside accept().
    let mut conn = server.accept().await;
    assert_eq!(
        conn.recv().await,
        json!({"action": "subscribe", "trades": ["AAPL", "MSFT"]})
    );

    timeout(WAIT, status.wait_for(|s| *s == SessionStatus::Connected))
        .await
        .unwrap()
        .unwrap();

    conn.send(&json!([trade("AAPL", 42)])).await;
    let delivered = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(delivered.size, 42);
    assert!(session.terminal_error().is_none());

    session.close().await;
}

#[tokio::test]
async fn malformed_frames_are_skipped() {
    let (server, base_url) = MockServer::start().await;
    let session = StreamSession::new(config(&base_url)).unwrap();
    let (mut conn, mut rx) = subscribe_aapl(&session, &server).await;

    conn.send(&json!([trade("AAPL", 8)])).await;
    conn.send_raw(vec![0xc1, 0x00, 0xff]).await;
    conn.send_text("not a market data frame").await;
    conn.send(&json!({"T": "t"})).await;
    conn.send(&json!([trade("AAPL", 9)])).await;

    let before = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    let after = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!((before.size, after.size), (8, 9));
    assert_eq!(session.status(), SessionStatus::Connected);

    session.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_handler_sees_every_trade_in_order() {
    const TRADES: u32 = 25;

    let (server, base_url) = MockServer::start().await;
    let session = StreamSession::new(config(&base_url)).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let pending = {
        let session = session.clone();
        let seen = Arc::clone(&seen);
        tokio::spawn(async move {
            session
                .subscribe_trades(&["AAPL"], move |trade| {
                    std::thread::sleep(Duration::from_millis(5));
                    seen.lock().push(trade.size);
                    if trade.size == TRADES {
                        let _ = done_tx.send(());
                    }
                })
                .await
        })
    };
    let mut conn = server.accept().await;
    conn.recv().await;
    pending.await.unwrap().unwrap();

    for size in 1..=TRADES {
        conn.send(&json!([trade("AAPL", size)])).await;
    }

    timeout(WAIT, done_rx.recv()).await.unwrap().unwrap();
    assert_eq!(*seen.lock(), (1..=TRADES).collect::<Vec<_>>());

    session.close().await;
}
