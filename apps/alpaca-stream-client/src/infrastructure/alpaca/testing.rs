//! In-memory transport for unit tests.
//!
//! A [`FakeConnector`] hands out scripted sessions in order. Each
//! [`FakeServer`] handle feeds frames to the client and records what the
//! client wrote.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use crate::application::ports::{Connector, Frame, FrameReader, FrameWriter, TransportError};

type Inbound = Result<Frame, TransportError>;

pub fn encode(value: &serde_json::Value) -> Vec<u8> {
    rmp_serde::to_vec_named(value).unwrap()
}

pub fn connected_frame() -> Vec<u8> {
    encode(&json!([{"T": "success", "msg": "connected"}]))
}

pub fn authenticated_frame() -> Vec<u8> {
    encode(&json!([{"T": "success", "msg": "authenticated"}]))
}

pub fn error_frame(code: i32, msg: &str) -> Vec<u8> {
    encode(&json!([{"T": "error", "code": code, "msg": msg}]))
}

pub fn trade_json(symbol: &str, price: f64, size: u32) -> serde_json::Value {
    json!({"T": "t", "S": symbol, "i": 1, "x": "V", "p": price, "s": size,
           "t": "2024-01-15T14:30:00Z", "c": ["@"], "z": "C"})
}

pub fn quote_json(symbol: &str) -> serde_json::Value {
    json!({"T": "q", "S": symbol, "bx": "V", "bp": 99.5, "bs": 1, "ax": "V",
           "ap": 100.5, "as": 2, "t": "2024-01-15T14:30:00Z", "z": "C"})
}

pub fn bar_json(symbol: &str) -> serde_json::Value {
    json!({"T": "b", "S": symbol, "o": 1.0, "h": 2.0, "l": 0.5, "c": 1.5,
           "v": 100, "t": "2024-01-15T14:30:00Z"})
}

pub fn frame_of(records: &[serde_json::Value]) -> Vec<u8> {
    encode(&serde_json::Value::Array(records.to_vec()))
}

pub fn authorization_text(status: &str) -> String {
    json!({"stream": "authorization", "data": {"status": status, "action": "authenticate"}})
        .to_string()
}

pub fn listening_text() -> String {
    json!({"stream": "listening", "data": {"streams": ["trade_updates"]}}).to_string()
}

pub fn trade_update_text(symbol: &str, event: &str) -> String {
    json!({
        "stream": "trade_updates",
        "data": {
            "event": event,
            "timestamp": "2024-01-15T14:30:00Z",
            "price": "150.25",
            "qty": "10",
            "order": {
                "id": "order-1",
                "client_order_id": "client-1",
                "symbol": symbol,
                "side": "buy",
                "type": "market",
                "qty": "10",
                "filled_qty": "10",
                "status": "filled"
            }
        }
    })
    .to_string()
}

/// Scripted peer for one connection.
#[derive(Clone)]
pub struct FakeServer {
    tx: mpsc::UnboundedSender<Inbound>,
    rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>>,
    sent: Arc<Mutex<Vec<Frame>>>,
    closes: Arc<Mutex<Vec<bool>>>,
    fail_writes: Arc<Mutex<bool>>,
}

impl FakeServer {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(Some(rx))),
            sent: Arc::new(Mutex::new(Vec::new())),
            closes: Arc::new(Mutex::new(Vec::new())),
            fail_writes: Arc::new(Mutex::new(false)),
        }
    }

    pub fn push(&self, bytes: Vec<u8>) {
        let _ = self.tx.send(Ok(Frame::Binary(bytes)));
    }

    pub fn push_text(&self, text: &str) {
        let _ = self.tx.send(Ok(Frame::Text(text.to_string())));
    }

    pub fn disconnect(&self, code: Option<u16>) {
        let _ = self.tx.send(Err(TransportError::Closed {
            code,
            reason: "test disconnect".to_string(),
        }));
    }

    pub fn fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }

    pub fn sent_values(&self) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .iter()
            .filter_map(|frame| match frame {
                Frame::Binary(bytes) => Some(rmp_serde::from_slice(bytes).unwrap()),
                Frame::Text(text) => Some(serde_json::from_str(text).unwrap()),
                Frame::Other => None,
            })
            .collect()
    }

    pub fn close_calls(&self) -> Vec<bool> {
        self.closes.lock().clone()
    }

    /// Wait until the client has written at least `count` frames.
    pub async fn wait_for_sent(&self, count: usize) -> Vec<serde_json::Value> {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.sent.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        self.sent_values()
    }
}

#[derive(Default)]
struct ConnectorState {
    fail_remaining: u32,
    calls: u32,
    urls: Vec<String>,
    sessions: VecDeque<FakeServer>,
}

/// Connector that replays scripted sessions.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().fail_remaining = count;
    }

    /// Queue a session for the next successful connect.
    pub fn expect_session(&self) -> FakeServer {
        let server = FakeServer::new();
        self.state.lock().sessions.push_back(server.clone());
        server
    }

    /// Queue a session that acknowledges the connection and the auth.
    pub fn expect_authenticated_session(&self) -> FakeServer {
        let server = self.expect_session();
        server.push(connected_frame());
        server.push(authenticated_frame());
        server
    }

    /// Queue a trading session that authorizes and confirms listening.
    pub fn expect_trading_session(&self) -> FakeServer {
        let server = self.expect_session();
        server.push_text(&authorization_text("authorized"));
        server.push_text(&listening_text());
        server
    }

    pub fn connect_calls(&self) -> u32 {
        self.state.lock().calls
    }

    pub fn connected_urls(&self) -> Vec<String> {
        self.state.lock().urls.clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameReader>, Box<dyn FrameWriter>), TransportError> {
        let server = {
            let mut state = self.state.lock();
            state.calls += 1;
            state.urls.push(url.to_string());
            if state.fail_remaining > 0 {
                state.fail_remaining -= 1;
                return Err(TransportError::Io("connection refused".to_string()));
            }
            state.sessions.pop_front()
        };
        let server = server.ok_or_else(|| TransportError::Io("no server".to_string()))?;
        let rx = server
            .rx
            .lock()
            .take()
            .ok_or_else(|| TransportError::Io("session reused".to_string()))?;

        Ok((
            Box::new(FakeReader { rx }),
            Box::new(FakeWriter { server }),
        ))
    }
}

struct FakeReader {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl FrameReader for FakeReader {
    async fn next_frame(&mut self) -> Result<Frame, TransportError> {
        self.rx.recv().await.unwrap_or_else(|| Err(TransportError::closed()))
    }
}

struct FakeWriter {
    server: FakeServer,
}

#[async_trait]
impl FrameWriter for FakeWriter {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        if *self.server.fail_writes.lock() {
            return Err(TransportError::Io("write failed".to_string()));
        }
        self.server.sent.lock().push(frame);
        Ok(())
    }

    async fn close(&mut self, graceful: bool) -> Result<(), TransportError> {
        self.server.closes.lock().push(graceful);
        Ok(())
    }
}
