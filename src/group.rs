//! Shard groups
//!
//! A shard group covers one time window. Series are spread over its shards by
//! id, so every point of a series within the window lives in the same shard.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ShardConfig;
use crate::conn::{ConnError, MessagingConn};
use crate::shard::util::shard_path;
use crate::shard::{Shard, ShardError, ShardId, ShardInfo, ShardResult};

/// A shard that failed to close cleanly
#[derive(Debug)]
pub struct CloseFailure {
    /// Shard that reported the failure
    pub shard_id: ShardId,
    /// What went wrong
    pub error: ShardError,
}

impl fmt::Display for CloseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "close shard {}: {}", self.shard_id, self.error)
    }
}

impl std::error::Error for CloseFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Serializable descriptor of a shard group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardGroupInfo {
    /// Group ID
    #[serde(default, skip_serializing_if = "is_zero")]
    pub id: u64,
    /// Inclusive start of the window
    pub start_time: DateTime<Utc>,
    /// End of the window
    pub end_time: DateTime<Utc>,
    /// Shards in routing order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shards: Vec<ShardInfo>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Time-bounded collection of shards
#[derive(Debug)]
pub struct ShardGroup {
    /// Group ID
    pub id: u64,
    /// Start of the window
    pub start_time: DateTime<Utc>,
    /// End of the window
    pub end_time: DateTime<Utc>,
    /// Shards in routing order
    pub shards: Vec<Shard>,
}

impl ShardGroup {
    /// Create a new shard group
    pub fn new(id: u64, start_time: DateTime<Utc>, end_time: DateTime<Utc>, shards: Vec<Shard>) -> Self {
        Self {
            id,
            start_time,
            end_time,
            shards,
        }
    }

    /// Rebuild a group of closed shards from its descriptor
    pub fn from_info(info: &ShardGroupInfo, config: ShardConfig) -> Self {
        let shards = info
            .shards
            .iter()
            .map(|shard| Shard::with_config(shard.clone(), config.clone()))
            .collect();
        Self::new(info.id, info.start_time, info.end_time, shards)
    }

    /// Descriptor of the group
    pub fn info(&self) -> ShardGroupInfo {
        ShardGroupInfo {
            id: self.id,
            start_time: self.start_time,
            end_time: self.end_time,
            shards: self.shards.iter().map(|s| s.info().clone()).collect(),
        }
    }

    /// Length of the window
    pub fn duration(&self) -> Duration {
        self.end_time - self.start_time
    }

    /// Check if the window overlaps `[min, max]`
    pub fn contains(&self, min: DateTime<Utc>, max: DateTime<Utc>) -> bool {
        let within = |t: DateTime<Utc>| t >= min && t <= max;
        within(self.start_time)
            || within(self.end_time)
            || (self.start_time < min && self.end_time > max)
    }

    /// Shard responsible for a series, `None` if the group has no shards
    pub fn shard_by_series_id(&self, series_id: u32) -> Option<&Shard> {
        if self.shards.is_empty() {
            return None;
        }
        self.shards.get(series_id as usize % self.shards.len())
    }

    /// Find a shard by ID
    pub fn shard_by_id(&self, id: ShardId) -> Option<&Shard> {
        self.shards.iter().find(|s| s.id() == id)
    }

    /// Remove a series from every shard, stopping at the first failure
    pub fn drop_series(&self, series_id: u32) -> ShardResult<()> {
        for shard in &self.shards {
            shard.drop_series(series_id)?;
        }
        Ok(())
    }

    /// Open the shards owned by `node_id` under `base_dir`
    ///
    /// `connect` supplies the broker connection for each shard. If any shard
    /// fails to open, the shards this call already opened are closed again and
    /// the error is returned. Returns the number of shards opened.
    pub fn open_local_shards<F>(&self, base_dir: impl AsRef<Path>, node_id: u64, mut connect: F) -> ShardResult<usize>
    where
        F: FnMut(ShardId) -> Result<Arc<dyn MessagingConn>, ConnError>,
    {
        let base_dir = base_dir.as_ref();
        let mut opened: Vec<&Shard> = Vec::new();

        for shard in self.shards.iter().filter(|s| s.has_data_node_id(node_id)) {
            let result = connect(shard.id())
                .map_err(|e| ShardError::conn(shard.id(), 0, e))
                .and_then(|conn| shard.open(shard_path(base_dir, shard.id()), conn));

            if let Err(e) = result {
                for shard in opened {
                    if let Err(err) = shard.close() {
                        warn!(group_id = self.id, shard_id = shard.id(), error = %err, "failed to close shard");
                    }
                }
                return Err(e);
            }
            opened.push(shard);
        }

        info!(group_id = self.id, node_id, shards = opened.len(), "local shards opened");
        Ok(opened.len())
    }

    /// Close every shard, returning the ones that failed
    pub fn close(&self) -> Vec<CloseFailure> {
        self.shards
            .iter()
            .filter_map(|shard| {
                shard.close().err().map(|error| CloseFailure {
                    shard_id: shard.id(),
                    error,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BatchWriter;
    use crate::conn::{LocalConn, Message};
    use chrono::TimeZone;
    use crossbeam::channel::Receiver;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn group_of(n: u64) -> ShardGroup {
        let shards = (1..=n).map(|id| Shard::new(id, vec![1])).collect();
        ShardGroup::new(1, ts(100), ts(200), shards)
    }

    fn test_config() -> ShardConfig {
        ShardConfig::new()
            .with_map_size(16 * 1024 * 1024)
            .with_open_timeout(std::time::Duration::from_millis(100))
            .with_lock_retry_interval(std::time::Duration::from_millis(5))
    }

    /// Connection whose shutdown works but is reported as failed
    struct NoisyCloseConn(LocalConn);

    impl MessagingConn for NoisyCloseConn {
        fn open(&self, index: u64, from_start: bool) -> Result<(), ConnError> {
            self.0.open(index, from_start)
        }

        fn messages(&self) -> Receiver<Message> {
            self.0.messages()
        }

        fn close(&self) -> Result<(), ConnError> {
            self.0.close()?;
            Err(ConnError::Unavailable("goodbye lost".into()))
        }
    }

    #[test]
    fn test_contains() {
        let group = group_of(1);
        assert!(group.contains(ts(150), ts(160)));
        assert!(!group.contains(ts(50), ts(90)));
        assert!(group.contains(ts(50), ts(150)));
        assert!(group.contains(ts(120), ts(180)));
        assert!(group.contains(ts(50), ts(250)));
        assert!(group.contains(ts(200), ts(300)));
        assert!(!group.contains(ts(201), ts(300)));
    }

    #[test]
    fn test_duration() {
        assert_eq!(group_of(1).duration(), Duration::seconds(100));
    }

    #[test]
    fn test_routing() {
        let group = group_of(3);
        assert_eq!(group.shard_by_series_id(0).map(Shard::id), Some(1));
        assert_eq!(group.shard_by_series_id(4).map(Shard::id), Some(2));
        assert_eq!(group.shard_by_series_id(u32::MAX).map(Shard::id), Some(1));
        assert!(group_of(0).shard_by_series_id(4).is_none());

        assert_eq!(group.shard_by_id(3).map(Shard::id), Some(3));
        assert!(group.shard_by_id(4).is_none());
    }

    proptest! {
        #[test]
        fn routing_is_deterministic(series_id in any::<u32>(), n in 1u64..16) {
            let group = group_of(n);
            let first = group.shard_by_series_id(series_id).map(Shard::id);
            let second = group.shard_by_series_id(series_id).map(Shard::id);
            prop_assert_eq!(first, second);
            prop_assert_eq!(first, Some(series_id as u64 % n + 1));
        }
    }

    #[test]
    fn test_info_round_trip() -> crate::Result<()> {
        let group = ShardGroup::new(
            3,
            ts(100),
            ts(200),
            vec![Shard::new(1, vec![1, 2]), Shard::new(2, vec![2])],
        );
        let info = group.info();
        let json = serde_json::to_string(&info)?;
        assert!(json.contains("\"startTime\""));
        assert!(json.contains("\"endTime\""));
        assert!(json.contains("\"nodeIDs\":[1,2]"));

        let parsed: ShardGroupInfo = serde_json::from_str(&json)?;
        assert_eq!(parsed, info);

        let rebuilt = ShardGroup::from_info(&parsed, ShardConfig::default());
        assert_eq!(rebuilt.shards.len(), 2);
        assert_eq!(rebuilt.shards[0].data_node_ids(), &[1, 2]);
        assert!(!rebuilt.shards[0].is_open());
        Ok(())
    }

    #[test_log::test]
    fn test_open_local_shards_and_drop_series() -> ShardResult<()> {
        let dir = tempdir()?;
        let info = ShardGroupInfo {
            id: 1,
            start_time: ts(100),
            end_time: ts(200),
            shards: vec![
                ShardInfo::new(1, vec![1]),
                ShardInfo::new(2, vec![2]),
                ShardInfo::new(3, vec![1, 2]),
            ],
        };
        let group = ShardGroup::from_info(&info, test_config());

        let opened = group.open_local_shards(dir.path(), 1, |_| Ok(Arc::new(LocalConn::new()) as _))?;
        assert_eq!(opened, 2);
        assert!(group.shards[0].is_open());
        assert!(!group.shards[1].is_open());
        assert!(group.shards[2].is_open());

        let mut batch = BatchWriter::new();
        batch.push(6, 10, b"x")?;
        let shard = group.shard_by_series_id(6).unwrap();
        assert_eq!(shard.id(), 1);
        shard.write_series(1, &batch.finish())?;

        group.drop_series(6)?;
        assert_eq!(shard.read_series(6, 10)?, None);

        assert!(group.close().is_empty());
        assert!(group.shards.iter().all(|s| !s.is_open()));
        Ok(())
    }

    #[test_log::test]
    fn test_open_local_shards_rolls_back() -> ShardResult<()> {
        let dir = tempdir()?;
        let group = ShardGroup::from_info(
            &ShardGroupInfo {
                id: 1,
                start_time: ts(100),
                end_time: ts(200),
                shards: vec![ShardInfo::new(1, vec![1]), ShardInfo::new(2, vec![1])],
            },
            test_config(),
        );

        let err = group
            .open_local_shards(dir.path(), 1, |id| {
                if id == 2 {
                    Err(ConnError::Unavailable("no route".into()))
                } else {
                    Ok(Arc::new(LocalConn::new()) as _)
                }
            })
            .unwrap_err();
        assert!(matches!(err, ShardError::Conn { shard_id: 2, .. }));
        assert!(group.shards.iter().all(|s| !s.is_open()));
        Ok(())
    }

    #[test_log::test]
    fn test_close_collects_failures() -> ShardResult<()> {
        let dir = tempdir()?;
        let group = ShardGroup::from_info(
            &ShardGroupInfo {
                id: 1,
                start_time: ts(100),
                end_time: ts(200),
                shards: vec![
                    ShardInfo::new(1, vec![1]),
                    ShardInfo::new(2, vec![1]),
                    ShardInfo::new(3, vec![1]),
                ],
            },
            test_config(),
        );

        group.open_local_shards(dir.path(), 1, |id| {
            if id == 2 {
                Ok(Arc::new(LocalConn::new()) as _)
            } else {
                Ok(Arc::new(NoisyCloseConn(LocalConn::new())) as _)
            }
        })?;

        let failures = group.close();
        let ids: Vec<_> = failures.iter().map(|f| f.shard_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(failures[0].to_string().starts_with("close shard 1: shard conn: id=1"));

        // Every shard is closed and its store released regardless.
        assert!(group.shards.iter().all(|s| !s.is_open()));
        group.open_local_shards(dir.path(), 1, |_| Ok(Arc::new(LocalConn::new()) as _))?;
        assert!(group.close().is_empty());
        Ok(())
    }
}
