//! Error types for the discovery registry

use thiserror::Error;

use crate::types::EtcdError;

/// Error type for discovery operations
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// A protocol error, sent to the client as an etcd error envelope
    #[error("etcd error {}: {} ({})", .error.error_code, .error.message, .error.cause)]
    Etcd { status: u16, error: EtcdError },

    /// Token is not 32 lowercase hex characters
    #[error("invalid discovery token: {0}")]
    InvalidToken(String),

    /// The upstream etcd or discovery service could not be reached
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// Etcd endpoint or discovery URL does not parse
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Local persistence failed
    #[error("storage error: {0}")]
    Storage(String),

    /// The CA bundle for the etcd endpoint cannot be used
    #[error("etcd CA file {path}: {reason}")]
    Certificate { path: String, reason: String },

    /// The registry stopped while a watch was pending
    #[error("discovery registry is shutting down")]
    Closed,
}

impl DiscoveryError {
    pub fn etcd(error: EtcdError) -> Self {
        DiscoveryError::Etcd {
            status: error.status(),
            error,
        }
    }

    /// The etcd error code, if this is a protocol error
    pub fn error_code(&self) -> Option<u32> {
        match self {
            DiscoveryError::Etcd { error, .. } => Some(error.error_code),
            _ => None,
        }
    }
}

/// Result type for discovery operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;
