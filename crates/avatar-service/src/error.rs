//! Error types for the avatar service

use std::fmt;

use avatar_engine::AvatarError;

#[derive(Debug)]
pub enum ServiceError {
    Config(String),
    Io(Box<std::io::Error>),
    Engine(AvatarError),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ServiceError::Io(err) => write!(f, "IO error: {}", err),
            ServiceError::Engine(err) => write!(f, "Engine error: {}", err),
        }
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServiceError::Io(err) => Some(err.as_ref()),
            ServiceError::Engine(err) => Some(err),
            ServiceError::Config(_) => None,
        }
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::Io(Box::new(err))
    }
}

impl From<AvatarError> for ServiceError {
    fn from(err: AvatarError) -> Self {
        ServiceError::Engine(err)
    }
}

impl From<avatar_upstream::UpstreamError> for ServiceError {
    fn from(err: avatar_upstream::UpstreamError) -> Self {
        ServiceError::Config(err.to_string())
    }
}

impl From<tracing_subscriber::filter::ParseError> for ServiceError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ServiceError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
