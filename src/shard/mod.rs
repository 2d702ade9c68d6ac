//! Shards: replicated per-series storage
//!
//! Each shard keeps one embedded store file holding the points of the series
//! routed to it, plus the highest replication index it has applied. A
//! background processor keeps the store in step with the broker's ordered
//! message stream.

mod error;
mod handle;
mod info;
mod processor;
mod store;
pub mod util;

pub use error::{ShardError, ShardResult};
pub use handle::Shard;
pub use info::{ShardInfo, ShardStats};
pub use processor::{ProcessorFailure, ProcessorState};

/// Shard ID type
pub type ShardId = u64;
