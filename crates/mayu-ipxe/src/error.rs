//! Error types for iPXE script generation

use thiserror::Error;

/// Error type for iPXE operations
#[derive(Debug, Error)]
pub enum IpxeError {
    /// Missing required configuration
    #[error("missing required configuration: {0}")]
    MissingConfig(String),

    /// Invalid URL format
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// Result type for iPXE operations
pub type Result<T> = std::result::Result<T, IpxeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IpxeError::MissingConfig("base_url".to_string());
        assert_eq!(err.to_string(), "missing required configuration: base_url");

        let err = IpxeError::InvalidUrl("ftp://x".to_string());
        assert_eq!(err.to_string(), "invalid URL: ftp://x");
    }
}
