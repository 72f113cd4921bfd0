//! Port Interfaces
//!
//! Contracts the streaming core needs from the outside world, following the
//! Hexagonal Architecture pattern. Infrastructure adapters implement them;
//! tests substitute in-memory fakes.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Connector`: opens a bidirectional, message-framed transport
//! - `FrameReader` / `FrameWriter`: the two independently-lockable halves
//!   of an open transport

use async_trait::async_trait;

/// Normal closure code sent on a graceful close.
pub const NORMAL_CLOSURE: u16 = 1000;

/// One transport-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Binary payload (`MessagePack` on the market data stream).
    Binary(Vec<u8>),
    /// Text payload.
    Text(String),
    /// Transport housekeeping (ping/pong) with no application payload.
    Other,
}

impl Frame {
    /// Payload bytes of a binary or text frame.
    #[must_use]
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(bytes) => Some(bytes),
            Self::Text(text) => Some(text.as_bytes()),
            Self::Other => None,
        }
    }
}

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The peer or the local side closed the transport.
    #[error("transport closed (code {code:?}): {reason}")]
    Closed {
        /// WebSocket close code, when one was received.
        code: Option<u16>,
        /// Close reason text.
        reason: String,
    },

    /// Handshake or I/O failure.
    #[error("transport I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Closed without a code or reason.
    #[must_use]
    pub const fn closed() -> Self {
        Self::Closed {
            code: None,
            reason: String::new(),
        }
    }

    /// Close code carried by this error, if any.
    #[must_use]
    pub const fn close_code(&self) -> Option<u16> {
        match self {
            Self::Closed { code, .. } => *code,
            Self::Io(_) => None,
        }
    }
}

/// Receiving half of an open transport.
#[async_trait]
pub trait FrameReader: Send {
    /// Wait for the next frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the transport is closed and
    /// [`TransportError::Io`] on any other failure.
    async fn next_frame(&mut self) -> Result<Frame, TransportError>;
}

/// Sending half of an open transport.
#[async_trait]
pub trait FrameWriter: Send {
    /// Send one frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport is closed or the write fails.
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Close the transport. A graceful close sends [`NORMAL_CLOSURE`] first.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake cannot be written.
    async fn close(&mut self, graceful: bool) -> Result<(), TransportError>;
}

/// Opens transports to a URL.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Perform one transport handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails.
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameReader>, Box<dyn FrameWriter>), TransportError>;
}
