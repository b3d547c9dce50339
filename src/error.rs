//! Error types for the change feed consumers.

use std::fmt;

/// Result type alias for change feed operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while consuming a change feed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error occurred during communication.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The server returned a RESP error response.
    #[error("server error: {0}")]
    Server(String),

    /// The RESP data or a reply shape violated the protocol contract.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The response type did not match what was expected.
    #[error("unexpected response type: expected {expected}, got {actual}")]
    UnexpectedResponse {
        /// The expected type description.
        expected: &'static str,
        /// The actual type description.
        actual: String,
    },

    /// The connection to the server was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// An invalid argument was provided.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration parsing or validation error.
    #[error("configuration error: {0}")]
    Config(String),

    /// An optimistic transaction kept losing against concurrent writers.
    #[error("transaction aborted {attempts} times, giving up")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
    },
}

impl Error {
    /// Returns true if the error means the connection or the stored data can
    /// no longer be trusted and the consumer should be torn down.
    #[cold]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::ConnectionClosed
                | Error::Protocol(_)
                | Error::UnexpectedResponse { .. }
        )
    }

    /// Returns true for the `NOSCRIPT` reply sent when a script handle is unknown.
    pub fn is_noscript(&self) -> bool {
        matches!(self, Error::Server(msg) if msg.starts_with("NOSCRIPT"))
    }

    pub(crate) fn unexpected(expected: &'static str, actual: impl fmt::Display) -> Self {
        Error::UnexpectedResponse {
            expected,
            actual: actual.to_string(),
        }
    }
}
