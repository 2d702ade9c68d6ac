//! Error types for the shard module
//!
//! Defines error types specific to shard operations.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::conn::ConnError;

/// Errors that can occur during shard operations
#[derive(Error, Debug)]
pub enum ShardError {
    /// `open` was called on a shard that already holds a store handle
    #[error("shard already open")]
    AlreadyOpen,

    /// The shard has no open store
    #[error("shard is closed")]
    Closed,

    /// Another owner kept the store file locked past the open timeout
    #[error("timed out after {timeout:?} waiting for store lock on {path:?}")]
    StoreTimeout {
        path: PathBuf,
        timeout: Duration,
    },

    /// The store file could not be opened or initialised
    #[error("failed to open store {path:?}: {message}")]
    StoreOpen {
        path: PathBuf,
        message: String,
    },

    /// Error raised by the embedded store inside a transaction
    #[error("store error: {0}")]
    Store(#[from] heed::Error),

    /// A write batch is truncated or declares a payload past its end
    #[error("invalid point buffer")]
    InvalidPointBuffer,

    /// The broker connection failed
    #[error("shard conn: id={shard_id}, idx={index}: {source}")]
    Conn {
        shard_id: u64,
        index: u64,
        #[source]
        source: ConnError,
    },

    /// A message type the shard does not apply
    #[error("invalid shard message type: {0}")]
    UnknownMessageType(u8),

    /// The consumer thread could not be started or did not exit cleanly
    #[error("shard processor: {0}")]
    Processor(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for shard operations
pub type ShardResult<T> = std::result::Result<T, ShardError>;

impl ShardError {
    /// Create a new store timeout error
    pub fn store_timeout(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self::StoreTimeout {
            path: path.into(),
            timeout,
        }
    }

    /// Create a new store open error
    pub fn store_open(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::StoreOpen {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Wrap a connection failure with the shard position it happened at
    pub fn conn(shard_id: u64, index: u64, source: ConnError) -> Self {
        Self::Conn {
            shard_id,
            index,
            source,
        }
    }

    /// Create a new processor error
    pub fn processor(message: impl Into<String>) -> Self {
        Self::Processor(message.into())
    }

    /// Check if this is an already-open error
    pub fn is_already_open(&self) -> bool {
        matches!(self, Self::AlreadyOpen)
    }

    /// Check if this is a closed error
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Check if this is a malformed batch error
    pub fn is_invalid_point_buffer(&self) -> bool {
        matches!(self, Self::InvalidPointBuffer)
    }

    /// Check if the store could not be acquired
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreTimeout { .. } | Self::StoreOpen { .. })
    }
}
