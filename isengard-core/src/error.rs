//! Error types for isengard-core

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Main error type for the isengard-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A single file could not be opened or followed
    #[error("failed to tail {}: {source}", .path.display())]
    Tail {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Filesystem watcher error
    #[error("watcher error: {0}")]
    Watch(#[from] notify::Error),

    /// Object store backend error
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Kafka client error
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A sink rejected a line or failed to release its transport
    #[error("sink '{sink}' error: {message}")]
    Sink { sink: String, message: String },

    /// A send did not complete within the sink's deadline
    #[error("sink '{sink}' send timed out after {after:?}")]
    SendTimeout { sink: String, after: Duration },
}

impl Error {
    /// Shorthand for a [`Error::Tail`] with the offending path.
    pub fn tail(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Tail {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for isengard-core
pub type Result<T> = std::result::Result<T, Error>;
