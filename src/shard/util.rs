//! Key encoding and path helpers for shard stores
//!
//! Storage keyspace of a shard file:
//!
//! - `meta` database: key `index` holds the highest applied replication
//!   index as a u64 BE.
//! - `values` database: one namespace per series. Every key starts with the
//!   series id as a u32 BE (the series prefix) followed by the point timestamp
//!   as a u64 BE (the `i64` timestamp reinterpreted bit for bit). Values are
//!   the opaque encoded payloads.
//!
//! All integers are big-endian so byte order matches numeric order within a
//! series, which keeps each series contiguous and range-scannable.

use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};

/// Name of the database holding per-series points
pub const VALUES_BUCKET: &str = "values";

/// Name of the database holding shard metadata
pub const META_BUCKET: &str = "meta";

/// Key of the highest applied replication index in the meta database
pub const INDEX_KEY: &[u8] = b"index";

/// Length of a series prefix in the values database
pub const SERIES_PREFIX_LEN: usize = 4;

/// Length of a full point key in the values database
pub const SERIES_KEY_LEN: usize = SERIES_PREFIX_LEN + 8;

/// Encode a u32 as big-endian bytes
pub fn u32_to_bytes(v: u32) -> [u8; 4] {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, v);
    buf
}

/// Decode a big-endian u32
pub fn bytes_to_u32(buf: &[u8; 4]) -> u32 {
    BigEndian::read_u32(buf)
}

/// Encode a u64 as big-endian bytes
pub fn u64_to_bytes(v: u64) -> [u8; 8] {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, v);
    buf
}

/// Decode a big-endian u64
pub fn bytes_to_u64(buf: &[u8; 8]) -> u64 {
    BigEndian::read_u64(buf)
}

/// Key prefix shared by every point of a series
pub fn series_prefix(series_id: u32) -> [u8; SERIES_PREFIX_LEN] {
    u32_to_bytes(series_id)
}

/// Key of one point: series prefix followed by the timestamp
pub fn series_key(series_id: u32, timestamp: i64) -> [u8; SERIES_KEY_LEN] {
    let mut key = [0u8; SERIES_KEY_LEN];
    key[..SERIES_PREFIX_LEN].copy_from_slice(&series_prefix(series_id));
    key[SERIES_PREFIX_LEN..].copy_from_slice(&u64_to_bytes(timestamp as u64));
    key
}

/// Get the path for a shard store file
pub fn shard_path(base_dir: &Path, shard_id: u64) -> PathBuf {
    base_dir.join("shards").join(shard_id.to_string())
}

/// Path of the ownership lock file kept next to a shard store file
pub fn lock_path(store_path: &Path) -> PathBuf {
    let mut name = store_path.as_os_str().to_owned();
    name.push(".flock");
    PathBuf::from(name)
}
