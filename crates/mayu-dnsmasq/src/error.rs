//! Error types for the dnsmasq supervisor

use std::path::PathBuf;
use thiserror::Error;

/// Error type for dnsmasq supervision
#[derive(Debug, Error)]
pub enum DnsmasqError {
    /// The dnsmasq process could not be started
    #[error("failed to spawn {executable}: {source}")]
    SpawnFailed {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Every attempt allowed by the restart policy failed
    #[error("dnsmasq failed to start after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<DnsmasqError>,
    },

    /// The configuration template could not be read
    #[error("failed to read template {path}: {source}")]
    TemplateRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration template failed to render
    #[error("template error: {0}")]
    Template(String),

    /// The rendered configuration could not be written
    #[error("failed to write {path}: {source}")]
    WriteConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DnsmasqError {
    /// Spawn failures are the errors a retry can fix
    pub fn is_spawn_failure(&self) -> bool {
        matches!(self, DnsmasqError::SpawnFailed { .. })
    }
}

/// Result type for dnsmasq operations
pub type Result<T> = std::result::Result<T, DnsmasqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DnsmasqError::Template("undefined variable".to_string());
        assert_eq!(err.to_string(), "template error: undefined variable");

        let err = DnsmasqError::SpawnFailed {
            executable: PathBuf::from("/usr/sbin/dnsmasq"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert_eq!(err.to_string(), "failed to spawn /usr/sbin/dnsmasq: not found");
        assert!(err.is_spawn_failure());

        let err = DnsmasqError::RetriesExhausted {
            attempts: 3,
            last: Box::new(err),
        };
        assert!(err.to_string().starts_with("dnsmasq failed to start after 3 attempts"));
        assert!(!err.is_spawn_failure());
    }
}
