//! Error type shared by the session manager.
//!
//! Every failure raised by the transport pool, the persistent sessions, the
//! registry or the one-shot executor is an [`SshError`]. The error carries an
//! [`ErrorKind`] tag for programmatic checks, a human-readable message that is
//! handed back to the calling agent verbatim, and the underlying cause when
//! one exists.
//!
//! Nothing in this crate retries automatically. Callers decide what to do
//! with a failure; the MCP tool layer turns it into a `{success: false}`
//! payload.

use std::error::Error as StdError;
use std::fmt;

/// Broad category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Key loading, TCP connect, handshake or authentication failed.
    Connection,
    /// Opening or driving a shell/exec channel failed.
    Channel,
    /// A bounded wait elapsed.
    Timeout,
    /// No session is registered under the requested identifier.
    SessionNotFound,
    /// A session with the requested identifier already exists.
    SessionExists,
    /// The session exists but is not accepting commands.
    SessionInactive,
    /// The session shut down before the request completed.
    SessionClosed,
    /// The lab description is missing, malformed or disables the target.
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Channel => "channel",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SessionNotFound => "session_not_found",
            ErrorKind::SessionExists => "session_exists",
            ErrorKind::SessionInactive => "session_inactive",
            ErrorKind::SessionClosed => "session_closed",
            ErrorKind::Config => "config",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct SshError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

pub type SshResult<T> = Result<T, SshError>;

impl SshError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach the underlying cause, appending its text to the message.
    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.message = format!("{}: {}", self.message, source);
        self.source = Some(Box::new(source));
        self
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn channel(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Channel, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn session_not_found(session_id: &str) -> Self {
        Self::new(
            ErrorKind::SessionNotFound,
            format!("Session '{}' not found", session_id),
        )
    }

    pub fn session_exists(session_id: &str) -> Self {
        Self::new(
            ErrorKind::SessionExists,
            format!("Session '{}' already exists", session_id),
        )
    }

    pub fn session_inactive(session_id: &str) -> Self {
        Self::new(
            ErrorKind::SessionInactive,
            format!("Session '{}' is not active", session_id),
        )
    }

    pub fn session_closed(session_id: &str) -> Self {
        Self::new(
            ErrorKind::SessionClosed,
            format!("Session '{}' was closed", session_id),
        )
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
