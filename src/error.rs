//! Error handling for shardstore
//!
//! Crate-level error type for configuration and descriptor handling. Errors
//! raised while operating on a shard are [`ShardError`]s and convert into
//! this type.

use std::io;
use thiserror::Error;

use crate::shard::ShardError;

/// Errors that can occur outside a single shard operation
#[derive(Error, Debug)]
pub enum Error {
    /// Errors related to configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to I/O operations
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Errors related to descriptor serialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Errors raised by a shard
    #[error("Shard error: {0}")]
    Shard(#[from] ShardError),
}

/// Result type for shardstore operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
