//! Shard descriptors and statistics
//!
//! [`ShardInfo`] is the serializable identity of a shard as it appears in
//! cluster metadata. [`ShardStats`] is a point-in-time view of a live shard.

use serde::{Deserialize, Serialize};

use crate::shard::ProcessorState;

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Information about a shard
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Shard ID
    #[serde(default, skip_serializing_if = "is_zero")]
    pub id: u64,
    /// Data nodes that own a replica of the shard
    #[serde(rename = "nodeIDs", default, skip_serializing_if = "Vec::is_empty")]
    pub data_node_ids: Vec<u64>,
}

impl ShardInfo {
    /// Create a new shard info
    pub fn new(id: u64, data_node_ids: Vec<u64>) -> Self {
        Self { id, data_node_ids }
    }

    /// Check if the data node owns the shard
    pub fn has_data_node_id(&self, id: u64) -> bool {
        self.data_node_ids.contains(&id)
    }
}

/// Statistics about a shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStats {
    /// Shard ID
    pub id: u64,
    /// Highest applied replication index
    pub index: u64,
    /// Whether the shard holds an open store
    pub open: bool,
    /// State of the consumer
    pub processor_state: ProcessorState,
    /// Number of write batches committed
    pub batches_applied: u64,
    /// Number of points written
    pub points_written: u64,
    /// Total payload bytes written
    pub bytes_written: u64,
    /// Replayed messages skipped as already applied
    pub stale_messages: u64,
    /// Number of point reads
    pub reads: u64,
    /// Number of point reads that found a value
    pub read_hits: u64,
    /// Number of series removed
    pub series_dropped: u64,
}

impl ShardStats {
    /// Fraction of reads that found a value
    pub fn read_hit_rate(&self) -> f64 {
        if self.reads == 0 {
            return 0.0;
        }

        self.read_hits as f64 / self.reads as f64
    }

    /// Average payload size per written point
    pub fn avg_point_size(&self) -> f64 {
        if self.points_written == 0 {
            return 0.0;
        }

        self.bytes_written as f64 / self.points_written as f64
    }

    /// Create a human-readable report of statistics
    pub fn report(&self) -> String {
        let mut result = String::new();

        result.push_str(&format!("=== Shard {} ===\n", self.id));
        result.push_str(&format!("Open: {}\n", self.open));
        result.push_str(&format!("Processor: {:?}\n", self.processor_state));
        result.push_str(&format!("Replication Index: {}\n", self.index));
        result.push_str(&format!("Batches Applied: {}\n", self.batches_applied));
        result.push_str(&format!("Points Written: {}\n", self.points_written));
        result.push_str(&format!("Bytes Written: {}\n", self.bytes_written));
        result.push_str(&format!("Stale Messages: {}\n", self.stale_messages));
        result.push_str(&format!("Series Dropped: {}\n", self.series_dropped));

        if self.reads > 0 {
            result.push_str(&format!("Read Hit Rate: {:.2}\n", self.read_hit_rate()));
        }

        result
    }
}
