//! Streaming Connection Types
//!
//! Codec-agnostic lifecycle types shared by the connection manager and the
//! stream session.

use std::sync::atomic::{AtomicU8, Ordering};

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of one transport connection.
///
/// ```text
/// Disconnected -> Connecting -> Authenticating -> Ready -> Closing -> Closed
/// ```
///
/// `Closed` is terminal for a connection; a session replaces the connection
/// instead of reviving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ConnectionState {
    /// No transport exists yet.
    #[default]
    Disconnected = 0,
    /// Transport handshake in progress.
    Connecting = 1,
    /// Transport open, auth handshake pending or in progress.
    Authenticating = 2,
    /// Authenticated and usable for subscriptions and data.
    Ready = 3,
    /// Close requested, transport being released.
    Closing = 4,
    /// Transport released.
    Closed = 5,
}

impl ConnectionState {
    /// Get the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    /// Check if the connection is closing or closed.
    #[must_use]
    pub const fn is_shutting_down(&self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Authenticating,
            3 => Self::Ready,
            4 => Self::Closing,
            5 => Self::Closed,
            _ => Self::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free cell holding a [`ConnectionState`].
#[derive(Debug, Default)]
pub struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    /// Create a cell with the given initial state.
    #[must_use]
    pub const fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Read the current state.
    #[must_use]
    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Overwrite the current state.
    pub fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move to `Closing` unless already closing or closed.
    ///
    /// Returns `true` for the caller that performed the transition.
    pub fn begin_close(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if ConnectionState::from_u8(current).is_shutting_down() {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }
}
