//! Error types for the gateway client

use std::fmt;

use avatar_engine::AvatarError;

#[derive(Debug)]
pub enum UpstreamError {
    Http(Box<reqwest::Error>),
    /// Non-success response, with the gateway's error message when it sent one
    Status(u16, String),
    InvalidUrl(String),
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::Http(err) => write!(f, "HTTP error: {}", err),
            UpstreamError::Status(code, msg) => {
                write!(f, "Gateway returned status {}: {}", code, msg)
            }
            UpstreamError::InvalidUrl(msg) => write!(f, "Invalid gateway URL: {}", msg),
        }
    }
}

impl std::error::Error for UpstreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UpstreamError::Http(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        UpstreamError::Http(Box::new(err))
    }
}

impl From<url::ParseError> for UpstreamError {
    fn from(err: url::ParseError) -> Self {
        UpstreamError::InvalidUrl(err.to_string())
    }
}

impl UpstreamError {
    pub fn into_lookup_error(self) -> AvatarError {
        AvatarError::EntityLookupFailed(self.to_string())
    }

    pub fn into_download_error(self) -> AvatarError {
        AvatarError::DownloadFailed(self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, UpstreamError>;
