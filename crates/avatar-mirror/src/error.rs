//! Error types for the client mirror

use std::fmt;

#[derive(Debug)]
pub enum MirrorError {
    /// Local store read or write failed
    PersistenceFailed(String),
    /// Bytes are not a recognisable image
    DecodeFailed(String),
    /// Could not hand an event to the backend
    Backend(String),
    Io(Box<std::io::Error>),
    Json(String),
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    MaxReconnectAttempts,
}

impl fmt::Display for MirrorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorError::PersistenceFailed(msg) => write!(f, "Persistence failed: {}", msg),
            MirrorError::DecodeFailed(msg) => write!(f, "Decode failed: {}", msg),
            MirrorError::Backend(msg) => write!(f, "Backend error: {}", msg),
            MirrorError::Io(err) => write!(f, "IO error: {}", err),
            MirrorError::Json(msg) => write!(f, "JSON error: {}", msg),
            MirrorError::WebSocket(err) => write!(f, "WebSocket error: {}", err),
            MirrorError::MaxReconnectAttempts => write!(f, "Max reconnection attempts reached"),
        }
    }
}

impl std::error::Error for MirrorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MirrorError::Io(err) => Some(err.as_ref()),
            MirrorError::WebSocket(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MirrorError {
    fn from(err: std::io::Error) -> Self {
        MirrorError::Io(Box::new(err))
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(err: serde_json::Error) -> Self {
        MirrorError::Json(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MirrorError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        MirrorError::WebSocket(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, MirrorError>;
