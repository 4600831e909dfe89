//! Error types for the Pro DJ Link client

use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("DBServer error: {0}")]
    DbServer(#[from] DbServerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Failed to bind announcement socket: {0}")]
    BindFailed(String),

    #[error("DeviceFinder is not active")]
    NotActive,
}

/// DBServer session errors
#[derive(Error, Debug)]
pub enum DbServerError {
    #[error("Player {0} is not visible on the network")]
    NoSuchPlayer(u8),

    #[error("No source device number available to query player {0}")]
    NoSourceNumber(u8),
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
