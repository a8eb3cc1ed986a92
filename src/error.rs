//! Error types for the meshwire crate.

use crate::config::ConfigError;
use std::io;
use thiserror::Error;

/// Setup and lifecycle errors.
///
/// Per-connection I/O failures never surface here; they terminate the
/// connection and are logged.
#[derive(Debug, Error)]
pub enum Error {
    /// Poll, waker or thread creation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// An address could not be parsed.
    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    /// A service was started without the upstreams it forwards to.
    #[error("{service} needs {needed} upstreams, {found} configured")]
    MissingUpstreams {
        service: &'static str,
        needed: usize,
        found: usize,
    },

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type alias for meshwire operations.
pub type Result<T> = std::result::Result<T, Error>;
