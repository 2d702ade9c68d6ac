//! Shard-level storage engine for a time-series database node
//!
//! A [`ShardGroup`] covers one time window and owns an ordered set of
//! [`Shard`]s. Each shard persists per-series timestamped values in its own
//! embedded store file and stays consistent with a totally ordered stream of
//! replicated write messages read from a [`MessagingConn`].

pub mod codec;
pub mod config;
pub mod conn;
pub mod error;
pub mod group;
pub mod metrics;
pub mod shard;

pub use codec::{BatchReader, BatchWriter, PointFrame, PointHeader, POINT_HEADER_SIZE};
pub use config::ShardConfig;
pub use conn::{ConnError, LocalConn, Message, MessageType, MessagingConn};
pub use error::{Error, Result};
pub use group::{CloseFailure, ShardGroup, ShardGroupInfo};
pub use shard::{
    ProcessorFailure, ProcessorState, Shard, ShardError, ShardInfo, ShardResult, ShardStats,
};
