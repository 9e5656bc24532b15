//! Error types for callbridge-core.

use std::sync::PoisonError;

use thiserror::Error;

use crate::value::Value;

/// Result type for callbridge-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in callbridge-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Handle is out of range or has been revoked.
    #[error("invalid handle: {0}")]
    InvalidHandle(u32),

    /// Goal was rejected before scheduling (empty directive, trailing terminator).
    #[error("invalid goal: {0}")]
    InvalidGoal(String),

    /// Internal bookkeeping disagrees with what the peer sent. Always a bug.
    #[error("protocol inconsistency: {0}")]
    Protocol(String),

    /// The directive ran on the peer and raised an error.
    #[error("peer reported error: {0}")]
    PeerFailure(Value),

    /// Goal was ended by an interrupt, either cascaded or detected by the peer.
    #[error("goal interrupted")]
    Interrupted,

    /// Goal was ended by a session-wide abort.
    #[error("goal aborted")]
    Aborted,

    /// Channel read/write failure. Fatal to the session.
    #[error("transport error: {0}")]
    Transport(String),

    /// A complete frame arrived but its contents could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Engine could not be started or failed its handshake.
    #[error("launch error: {0}")]
    Launch(String),

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Session is shutting down or already terminated.
    #[error("session is shutting down")]
    ShuttingDown,

    /// Invalid operation for the current session state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error means the session can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::Transport(_) | Error::ShuttingDown
        )
    }

    /// Whether this error is a cancellation signal rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Interrupted | Error::Aborted)
    }

    /// Render the error together with a short recovery hint.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Error::InvalidHandle(_) => "the object was revoked or never registered in this session",
            Error::InvalidGoal(_) => "pass the directive without a trailing '.'",
            Error::Protocol(_) => "this is a bug in the host/engine exchange; restart the session",
            Error::PeerFailure(_) => "check the directive text and the engine's error term",
            Error::Interrupted | Error::Aborted => "the goal was cancelled; resubmit it if needed",
            Error::Transport(_) => "the engine connection was lost; start a new session",
            Error::Launch(_) => "set CALLBRIDGE_ENGINE_PATH or put callbridge-engine on PATH",
            Error::Config(_) => "check the config file and CALLBRIDGE_* environment variables",
            Error::ShuttingDown => "start a new session",
            _ => return self.to_string(),
        };
        format!("{self}\n  hint: {hint}")
    }
}

/// Convert a poisoned lock into a session fault.
pub(crate) fn lock_error<T>(e: PoisonError<T>) -> Error {
    Error::Protocol(format!("lock poisoned (thread panicked): {}", e))
}
