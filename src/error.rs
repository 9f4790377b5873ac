//! Failure classification for pooled connections and topology operations.
//!
//! Every failure is classified where it happens into one of the variants
//! below, so callers decide what to do with a total match instead of
//! inspecting messages.
use bson;
use thiserror::Error;

use std::{io, result, sync};

pub type Result<T> = result::Result<T, Error>;

/// The closed set of failures produced by this crate.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    /// A specific transport could not be established or used
    /// (refused, reset, pool exhausted).
    #[error("connection failure: {0}")]
    ConnectionFailure(String),
    /// No suitable server is currently known or reachable; the topology
    /// should be consulted again before retrying.
    #[error("auto reconnect: {0}")]
    AutoReconnect(String),
    /// A bounded socket or connect wait expired.
    #[error("network timeout: {0}")]
    NetworkTimeout(String),
    /// The server accepted the request but rejected the operation.
    #[error("operation failure ({code}): {message}")]
    OperationFailure { code: i32, message: String },
    /// The server does not know the requested cursor.
    #[error("cursor id {0} not found")]
    CursorNotFound(i64),
    /// An option was invalid at construction time.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The byte stream is no longer in sync with the request sequence.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A request document could not be encoded.
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    /// A blocked transport call was interrupted.
    #[error("interrupted: {0}")]
    Interrupted(String),
    #[error("lock poisoned")]
    LockPoisoned,
}

impl Error {
    /// True when the connection that produced this error must not be reused.
    pub fn is_network_error(&self) -> bool {
        match *self {
            Error::ConnectionFailure(_)
            | Error::NetworkTimeout(_)
            | Error::Protocol(_)
            | Error::Interrupted(_) => true,
            Error::AutoReconnect(_)
            | Error::OperationFailure { .. }
            | Error::CursorNotFound(_)
            | Error::Configuration(_)
            | Error::InvalidDocument(_)
            | Error::LockPoisoned => false,
        }
    }

    /// True for the "try again, possibly elsewhere" family of failures.
    pub fn is_connection_failure(&self) -> bool {
        match *self {
            Error::ConnectionFailure(_) | Error::AutoReconnect(_) | Error::NetworkTimeout(_) => true,
            _ => false,
        }
    }

    /// True when retrying the whole operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match *self {
            Error::ConnectionFailure(_)
            | Error::AutoReconnect(_)
            | Error::NetworkTimeout(_)
            | Error::Protocol(_) => true,
            Error::Interrupted(_)
            | Error::OperationFailure { .. }
            | Error::CursorNotFound(_)
            | Error::Configuration(_)
            | Error::InvalidDocument(_)
            | Error::LockPoisoned => false,
        }
    }

    /// The server error code, if the server reported one.
    pub fn code(&self) -> Option<i32> {
        match *self {
            Error::OperationFailure { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                Error::NetworkTimeout(err.to_string())
            }
            io::ErrorKind::Interrupted => Error::Interrupted(err.to_string()),
            io::ErrorKind::UnexpectedEof => {
                Error::ConnectionFailure(String::from("connection closed by peer"))
            }
            _ => Error::ConnectionFailure(err.to_string()),
        }
    }
}

impl From<bson::EncoderError> for Error {
    fn from(err: bson::EncoderError) -> Error {
        Error::InvalidDocument(err.to_string())
    }
}

impl From<bson::DecoderError> for Error {
    fn from(err: bson::DecoderError) -> Error {
        match err {
            bson::DecoderError::IoError(io_err) => Error::from(io_err),
            other => Error::Protocol(other.to_string()),
        }
    }
}

impl<T> From<sync::PoisonError<T>> for Error {
    fn from(_: sync::PoisonError<T>) -> Error {
        Error::LockPoisoned
    }
}
