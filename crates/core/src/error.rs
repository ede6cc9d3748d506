//! Error type shared by the lumen crates that sit above the RHI.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by core services (configuration, windowing, IO).
#[derive(Error, Debug)]
pub enum Error {
    /// Window creation or event loop failure
    #[error("Window error: {0}")]
    Window(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration file could not be read
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A configuration value was malformed or out of range
    #[error("Config error: {0}")]
    Config(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using the core Error type.
pub type Result<T> = std::result::Result<T, Error>;
