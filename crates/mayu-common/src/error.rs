use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid host state: {0}")]
    InvalidState(String),

    #[error("invalid network configuration: {0}")]
    InvalidNetwork(String),
}
