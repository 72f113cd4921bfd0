//! WebSocket Transport Adapter
//!
//! Implements the framed transport ports on top of `tokio-tungstenite`.
//! The socket is split so that reads and writes can be locked independently.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{
    Connector, Frame, FrameReader, FrameWriter, NORMAL_CLOSURE, TransportError,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens `ws://` and `wss://` connections.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a new connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameReader>, Box<dyn FrameWriter>), TransportError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let (sink, stream) = ws_stream.split();

        Ok((
            Box::new(WebSocketReader { stream }),
            Box::new(WebSocketWriter { sink }),
        ))
    }
}

/// Receiving half of a WebSocket.
pub struct WebSocketReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameReader for WebSocketReader {
    async fn next_frame(&mut self) -> Result<Frame, TransportError> {
        match self.stream.next().await {
            Some(Ok(Message::Binary(data))) => Ok(Frame::Binary(data.to_vec())),
            Some(Ok(Message::Text(text))) => Ok(Frame::Text(text.as_str().to_owned())),
            Some(Ok(Message::Close(frame))) => Err(match frame {
                Some(frame) => TransportError::Closed {
                    code: Some(u16::from(frame.code)),
                    reason: frame.reason.as_str().to_owned(),
                },
                None => TransportError::closed(),
            }),
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => Ok(Frame::Other),
            Some(Err(
                tokio_tungstenite::tungstenite::Error::ConnectionClosed
                | tokio_tungstenite::tungstenite::Error::AlreadyClosed,
            ))
            | None => Err(TransportError::closed()),
            Some(Err(e)) => Err(TransportError::Io(e.to_string())),
        }
    }
}

/// Sending half of a WebSocket.
pub struct WebSocketWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameWriter for WebSocketWriter {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Binary(bytes) => Message::Binary(bytes.into()),
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Other => return Ok(()),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self, graceful: bool) -> Result<(), TransportError> {
        if !graceful {
            return Ok(());
        }
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::from(NORMAL_CLOSURE),
            reason: "".into(),
        }));
        self.sink
            .send(close)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}
