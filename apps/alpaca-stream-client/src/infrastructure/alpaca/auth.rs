//! Alpaca WebSocket Authentication
//!
//! Credentials and reply classification for the auth handshake. The
//! handshake itself (send, then wait for one reply under a timeout) lives on
//! [`Connection`](super::connection::Connection) and on the trade updates
//! stream.
//!
//! # Authentication Flow
//!
//! ## Market Data Stream
//! 1. Connect to the WebSocket endpoint
//! 2. Receive `[{"T":"success","msg":"connected"}]`
//! 3. Send `{"action":"auth","key":"...","secret":"..."}`
//! 4. Receive `[{"T":"success","msg":"authenticated"}]` or an error
//!
//! ## Trade Updates Stream
//! 1. Connect to the WebSocket endpoint
//! 2. Send `{"action":"auth","key":"...","secret":"..."}`
//! 3. Receive `{"stream":"authorization","data":{"status":"authorized"}}`
//!
//! OAuth tokens are sent in the same frame with `key` set to `"oauth"` and
//! the token as `secret`.
//!
//! # Error Codes
//!
//! - 401: Not authenticated
//! - 402: Authentication failed (invalid credentials)
//! - 403: Already authenticated
//! - 404: Authentication timeout
//! - 406: Connection limit exceeded

use std::time::Duration;

use thiserror::Error;

use super::codec::CodecError;
use super::connection::{ReadError, WriteError};
use super::messages::{AuthRequest, AuthorizationData, ErrorMessage, StreamMessage, SuccessKind};

/// Default time to wait for the auth reply.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Placeholder key sent with OAuth tokens.
const OAUTH_KEY: &str = "oauth";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during authentication.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Server says the connection is not authenticated.
    #[error("not authenticated: must authenticate before making requests")]
    NotAuthenticated,

    /// Credentials rejected.
    #[error("authentication failed: invalid API key or secret")]
    InvalidCredentials,

    /// Auth was already performed on this connection.
    #[error("already authenticated: connection is already authenticated")]
    AlreadyAuthenticated,

    /// No reply within the allowed window (locally or server-side).
    #[error("authentication timed out after {0:?}")]
    Timeout(Duration),

    /// Too many concurrent connections for the account.
    #[error("connection limit exceeded: too many concurrent connections")]
    ConnectionLimitExceeded,

    /// Any other error reply from the server.
    #[error("server error ({code}): {message}")]
    ServerError {
        /// Error code from server
        code: i32,
        /// Error message from server
        message: String,
    },

    /// The reply was neither an acknowledgment nor an error.
    #[error("unexpected auth reply: {0}")]
    UnexpectedReply(String),

    /// Credentials could not be constructed.
    #[error("invalid credentials: {0}")]
    MissingCredentials(String),

    /// The reply could not be decoded.
    #[error(transparent)]
    Decode(#[from] CodecError),

    /// Reading the reply failed.
    #[error(transparent)]
    Read(#[from] ReadError),

    /// Sending the auth frame failed.
    #[error(transparent)]
    Write(#[from] WriteError),
}

impl From<&ErrorMessage> for AuthError {
    fn from(err: &ErrorMessage) -> Self {
        match err.code {
            401 => Self::NotAuthenticated,
            402 => Self::InvalidCredentials,
            403 => Self::AlreadyAuthenticated,
            404 => Self::Timeout(Duration::ZERO),
            406 => Self::ConnectionLimitExceeded,
            code => Self::ServerError {
                code,
                message: err.msg.clone(),
            },
        }
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// Alpaca API credentials. Immutable once built.
///
/// `Debug` and `Display` never print secrets.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// API key pair.
    KeySecret {
        /// API key ID
        key: String,
        /// API secret
        secret: String,
    },
    /// OAuth access token.
    OAuth {
        /// Bearer token
        token: String,
    },
}

impl Credentials {
    /// Create key/secret credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if either key or secret is empty.
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Result<Self, AuthError> {
        let key = key.into();
        let secret = secret.into();

        if key.is_empty() {
            return Err(AuthError::MissingCredentials(
                "API key cannot be empty".to_string(),
            ));
        }
        if secret.is_empty() {
            return Err(AuthError::MissingCredentials(
                "API secret cannot be empty".to_string(),
            ));
        }

        Ok(Self::KeySecret { key, secret })
    }

    /// Create OAuth credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is empty.
    pub fn oauth(token: impl Into<String>) -> Result<Self, AuthError> {
        let token = token.into();
        if token.is_empty() {
            return Err(AuthError::MissingCredentials(
                "OAuth token cannot be empty".to_string(),
            ));
        }
        Ok(Self::OAuth { token })
    }

    /// Key shown in logs (`"oauth"` for token credentials).
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::KeySecret { key, .. } => key,
            Self::OAuth { .. } => OAUTH_KEY,
        }
    }

    /// Build the auth frame payload.
    #[must_use]
    pub fn to_auth_request(&self) -> AuthRequest {
        match self {
            Self::KeySecret { key, secret } => AuthRequest::new(key.clone(), secret.clone()),
            Self::OAuth { token } => AuthRequest::new(OAUTH_KEY.to_string(), token.clone()),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeySecret { key, .. } => f
                .debug_struct("KeySecret")
                .field("key", key)
                .field("secret", &"[REDACTED]")
                .finish(),
            Self::OAuth { .. } => f
                .debug_struct("OAuth")
                .field("token", &"[REDACTED]")
                .finish(),
        }
    }
}

impl std::fmt::Display for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credentials(key={})", self.key())
    }
}

// =============================================================================
// Reply Classification
// =============================================================================

/// Classify the decoded reply to a market data auth frame.
///
/// # Errors
///
/// Returns the server's error if one is present, and
/// [`AuthError::UnexpectedReply`] unless an `authenticated` acknowledgment
/// is found.
pub fn check_auth_reply(messages: &[StreamMessage]) -> Result<(), AuthError> {
    if let Some(error) = messages.iter().find_map(|m| match m {
        StreamMessage::Error(e) => Some(e),
        _ => None,
    }) {
        return Err(AuthError::from(error));
    }

    let acknowledged = messages.iter().any(|m| {
        matches!(m, StreamMessage::Success(s) if s.msg == SuccessKind::Authenticated)
    });
    if acknowledged {
        Ok(())
    } else {
        Err(AuthError::UnexpectedReply(describe(messages)))
    }
}

/// Classify the trading stream's authorization reply.
///
/// # Errors
///
/// Returns [`AuthError::InvalidCredentials`] if authorization was refused.
pub fn check_authorization(data: &AuthorizationData) -> Result<(), AuthError> {
    if data.is_authorized() {
        Ok(())
    } else {
        Err(AuthError::InvalidCredentials)
    }
}

fn describe(messages: &[StreamMessage]) -> String {
    if messages.is_empty() {
        return "empty reply".to_string();
    }
    messages
        .iter()
        .map(StreamMessage::kind)
        .collect::<Vec<_>>()
        .join(",")
}
