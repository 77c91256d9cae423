use thiserror::Error;

use crate::protocol::ErrorObject;

/// Result type for Karton operations
pub type KartonResult<T> = Result<T, KartonError>;

/// Errors that can occur in Karton operations
#[derive(Error, Debug)]
pub enum KartonError {
    /// A frame could not be decoded into a message. Only that frame is lost.
    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: String },

    #[error("Connection closed")]
    ConnectionClosed,

    /// A pending call never got its response (timeout or forced cleanup).
    #[error("Connection lost while calling '{procedure}'{}: {reason}", correlation_suffix(.correlation_id))]
    ConnectionLost {
        procedure: String,
        correlation_id: Option<String>,
        reason: String,
    },

    #[error("Client not found: {session_id}")]
    ClientNotFound { session_id: String },

    #[error("Procedure not found: {path}")]
    ProcedureNotFound { path: String },

    /// An exception raised by the remote procedure itself.
    #[error("{}: {}", .0.name, .0.message)]
    Remote(ErrorObject),

    #[error("Invalid patch at {path}: {reason}")]
    InvalidPatch { path: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KartonError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            reason: reason.into(),
        }
    }

    /// True for failures caused by the connection going away rather than by the callee.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::ConnectionLost { .. } | Self::ClientNotFound { .. }
        )
    }
}

fn correlation_suffix(correlation_id: &Option<String>) -> String {
    match correlation_id {
        Some(id) => format!(" (session {})", id),
        None => String::new(),
    }
}
