//! Gateway wire types

use serde::Deserialize;

/// Error body the gateway sends with non-success responses
#[derive(Debug, Deserialize)]
pub struct GatewayErrorBody {
    pub error: String,
}

/// Photo variants served by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoSize {
    /// Small profile photo thumbnail
    Small,
    /// Full media download of the same photo
    Full,
}

impl PhotoSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhotoSize::Small => "small",
            PhotoSize::Full => "full",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_deserialization() {
        let body: GatewayErrorBody =
            serde_json::from_str(r#"{"error":"AUTH_KEY_UNREGISTERED","code":401}"#).unwrap();
        assert_eq!(body.error, "AUTH_KEY_UNREGISTERED");
    }

    #[test]
    fn test_photo_size_path_segment() {
        assert_eq!(PhotoSize::Small.as_str(), "small");
        assert_eq!(PhotoSize::Full.as_str(), "full");
    }
}
