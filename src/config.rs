//! Configuration for shards
//!
//! This module provides the options used when a shard acquires its store.

use std::fs;
use std::path::Path;
use std::time::Duration;
use serde::{Serialize, Deserialize};

use crate::error::{Result, Error};

const MIN_MAP_SIZE: usize = 1024 * 1024;
const PAGE_SIZE: usize = 4096;

/// Configuration options for a shard's embedded store and consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ShardConfig {
    /// How long `open` waits for another owner to release the store file
    pub open_timeout: Duration,
    /// Delay between attempts to take the store file lock
    pub lock_retry_interval: Duration,
    /// Maximum size of the memory map backing the store, in bytes
    pub map_size: usize,
    /// Whether commits are flushed to disk before returning
    pub sync_writes: bool,
    /// Name prefix for consumer threads; the shard id is appended
    pub processor_thread_prefix: String,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(1),
            lock_retry_interval: Duration::from_millis(10),
            map_size: 1024 * 1024 * 1024, // 1GB
            sync_writes: true,
            processor_thread_prefix: "shard-processor".to_string(),
        }
    }
}

impl ShardConfig {
    /// Create a new shard configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store open timeout
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Set the lock retry interval
    pub fn with_lock_retry_interval(mut self, interval: Duration) -> Self {
        self.lock_retry_interval = interval;
        self
    }

    /// Set the memory map size
    pub fn with_map_size(mut self, size: usize) -> Self {
        self.map_size = size;
        self
    }

    /// Set whether to sync commits to disk
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Set the consumer thread name prefix
    pub fn with_processor_thread_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.processor_thread_prefix = prefix.into();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.open_timeout.is_zero() {
            return Err(Error::config("Open timeout must be greater than zero"));
        }

        if self.lock_retry_interval.is_zero() {
            return Err(Error::config("Lock retry interval must be greater than zero"));
        }

        if self.lock_retry_interval > self.open_timeout {
            return Err(Error::config(
                "Lock retry interval must not exceed the open timeout"
            ));
        }

        if self.map_size < MIN_MAP_SIZE {
            return Err(Error::config("Map size must be at least 1MB"));
        }

        if self.map_size % PAGE_SIZE != 0 {
            return Err(Error::config(format!(
                "Map size must be a multiple of {} bytes",
                PAGE_SIZE
            )));
        }

        if self.processor_thread_prefix.is_empty() {
            return Err(Error::config("Processor thread prefix must not be empty"));
        }

        Ok(())
    }

    /// Load a configuration from JSON and validate it
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file and validate it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Serialize the configuration to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ShardConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.open_timeout, Duration::from_secs(1));
        assert!(config.sync_writes);
    }

    #[test]
    fn test_builder_and_validation() {
        let config = ShardConfig::new()
            .with_open_timeout(Duration::from_millis(50))
            .with_lock_retry_interval(Duration::from_millis(5))
            .with_map_size(16 * 1024 * 1024)
            .with_sync_writes(false);
        assert!(config.validate().is_ok());

        let bad = config.clone().with_map_size(1000);
        assert!(bad.validate().unwrap_err().is_config_error());

        let bad = config.clone().with_map_size(MIN_MAP_SIZE + 1);
        assert!(bad.validate().is_err());

        let bad = config.clone().with_open_timeout(Duration::ZERO);
        assert!(bad.validate().is_err());

        let bad = config.with_lock_retry_interval(Duration::from_secs(5));
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_json_round_trip_validates() {
        let config = ShardConfig::new().with_processor_thread_prefix("replica");
        let json = config.to_json().unwrap();
        assert_eq!(ShardConfig::from_json(&json).unwrap(), config);

        let invalid = json.replace("\"replica\"", "\"\"");
        assert!(ShardConfig::from_json(&invalid).is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.json");
        let config = ShardConfig::new().with_map_size(64 * 1024 * 1024);
        fs::write(&path, config.to_json().unwrap()).unwrap();
        assert_eq!(ShardConfig::from_file(&path).unwrap(), config);

        let err = ShardConfig::from_file(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
