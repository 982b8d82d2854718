//! Error types for liveobj.
//!
//! Every failure that can cross the wire is turned into a `result` command
//! with a failure status; the message text is the `Display` output of the
//! variant below.

use std::time::Duration;
use thiserror::Error;

use crate::protocol::{CallId, FunctionId, ObjectId};

/// Main error type for the liveobj library.
#[derive(Debug, Error)]
pub enum LiveObjError {
    // Registry and codec errors
    #[error("Unknown type: {name}")]
    UnknownType { name: String },

    #[error("Unknown reference to object with id {id}")]
    UnknownReference { id: ObjectId },

    #[error("Can't find function with id {id}")]
    UnknownFunction { id: FunctionId },

    #[error("Type {name} already registered")]
    TypeAlreadyRegistered { name: String },

    #[error("Can't get a reference to an unregistered type: {type_name}")]
    UnregisteredType { type_name: String },

    #[error("Objects of type {type_name} can't be assigned")]
    ReadOnly { type_name: String },

    #[error("No object registered as {name}")]
    UnknownName { name: String },

    #[error("Can't {action} unknown object")]
    UnknownObject { action: &'static str },

    // Invocation errors
    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Native invocation failed: {message}")]
    NativeInvocation { message: String },

    #[error("{message}")]
    Remote { message: String },

    #[error("Expression error at offset {offset}: {message}")]
    Expression { message: String, offset: usize },

    // Protocol errors
    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    #[error("Call id {call_id} not found")]
    OrphanResult { call_id: CallId },

    // Connection errors
    #[error("Connection closed")]
    Disconnected,

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Connection limit reached ({limit})")]
    ConnectionLimit { limit: usize },

    #[error("Transport error: {message}")]
    Transport { message: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

/// Result type alias using LiveObjError.
pub type Result<T> = std::result::Result<T, LiveObjError>;

impl From<std::io::Error> for LiveObjError {
    fn from(err: std::io::Error) -> Self {
        LiveObjError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for LiveObjError {
    fn from(err: serde_json::Error) -> Self {
        LiveObjError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for LiveObjError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        LiveObjError::Transport {
            message: err.to_string(),
        }
    }
}

impl LiveObjError {
    /// Shorthand for a protocol violation.
    pub fn protocol(message: impl Into<String>) -> Self {
        LiveObjError::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Shorthand for a bad argument to a native function.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        LiveObjError::InvalidParams {
            message: message.into(),
        }
    }

    /// True when the receiver can recover by fetching a type description and
    /// decoding the same payload again.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LiveObjError::UnknownType { .. })
    }

    /// Message carried by a failure `result` command.
    pub fn status_message(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LiveObjError::UnknownReference { id: 42 };
        assert_eq!(
            err.to_string(),
            "Unknown reference to object with id 42"
        );

        let err = LiveObjError::UnknownObject { action: "track" };
        assert_eq!(err.to_string(), "Can't track unknown object");
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(LiveObjError::UnknownType {
            name: "Thing".into()
        }
        .is_recoverable());
        assert!(!LiveObjError::UnknownFunction { id: 3 }.is_recoverable());
        assert!(!LiveObjError::Timeout(Duration::from_secs(5)).is_recoverable());
    }

    #[test]
    fn test_remote_message_passthrough() {
        let err = LiveObjError::Remote {
            message: "boom".into(),
        };
        assert_eq!(err.status_message(), "boom");
    }
}
