//! Error types for boardlink.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. The variants follow the failure classes
//! of a serial command link: transport failures end the session, while
//! device rejections, timeouts and cancellations only affect one request.

use crate::types::ResponseStatus;

/// The error type for all boardlink operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (serial port unavailable, write failure).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error (malformed JSON line, missing field).
    ///
    /// The reader loop never propagates these to callers; they surface as
    /// [`BoardEvent::ParseError`](crate::events::BoardEvent::ParseError).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The board answered with a status other than `"ok"`.
    #[error("device rejected command: {status}")]
    Device {
        /// The status token from the response (e.g. `invalid_pin`).
        status: ResponseStatus,
    },

    /// Timed out waiting for the response to a request.
    ///
    /// This typically indicates a busy or hung sketch, a firmware that does
    /// not know the command, or a wrong baud rate.
    #[error("timeout waiting for response")]
    Timeout,

    /// The request was cancelled before its response arrived.
    #[error("request cancelled")]
    Cancelled,

    /// An invalid parameter was passed to a board command.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// No connection to the board has been established, or it was closed.
    #[error("not connected")]
    NotConnected,

    /// The connection to the board was lost while the request was pending.
    #[error("connection lost")]
    ConnectionLost,

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error ends the whole session rather than one request.
    ///
    /// The UI maps these to a "disconnected" state; everything else is
    /// shown as a failed individual action.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::NotConnected | Error::ConnectionLost | Error::Io(_)
        )
    }
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
