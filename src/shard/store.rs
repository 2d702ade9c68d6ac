//! Embedded store backing one shard
//!
//! Each shard owns a single LMDB file. LMDB gives single-writer,
//! multi-reader transactions; ownership of the file across handles and
//! processes is enforced with an exclusive lock on a sibling `.flock` file,
//! taken before the environment is opened and held until it is closed.

use std::fs::{self, File, OpenOptions};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use fs2::FileExt;
use heed::types::Bytes;
use heed::{Database, Env, EnvFlags, EnvOpenOptions, RoTxn};
use tracing::{debug, trace};

use crate::codec::BatchReader;
use crate::config::ShardConfig;
use crate::shard::util::{
    bytes_to_u64, lock_path, series_key, series_prefix, u64_to_bytes, INDEX_KEY, META_BUCKET,
    VALUES_BUCKET,
};
use crate::shard::{ShardError, ShardResult};

/// Outcome of a committed write batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BatchSummary {
    /// Points upserted
    pub points: u64,
    /// Payload bytes upserted
    pub bytes: u64,
    /// Replication index persisted with the batch
    pub index: u64,
}

/// Open LMDB environment of a shard
///
/// Field order matters: the environment is closed before the ownership lock
/// file is released.
pub(crate) struct ShardStore {
    env: Env,
    values: Database<Bytes, Bytes>,
    meta: Database<Bytes, Bytes>,
    path: PathBuf,
    lock: File,
}

impl ShardStore {
    /// Acquire and initialise the store at `path`
    ///
    /// Returns the store along with the highest replication index recovered
    /// from its metadata (0 for a new store).
    pub(crate) fn open(path: &Path, config: &ShardConfig) -> ShardResult<(Self, u64)> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                ShardError::store_open(path, format!("create directory: {}", e))
            })?;
        }

        let lock = acquire_lock(path, config)?;

        let mut flags = EnvFlags::NO_SUB_DIR;
        if !config.sync_writes {
            flags |= EnvFlags::NO_SYNC;
        }

        let mut options = EnvOpenOptions::new();
        options.map_size(config.map_size).max_dbs(2);
        // SAFETY: the exclusive lock taken above guarantees no other handle in
        // this or another process has the file mapped.
        let env = unsafe {
            options.flags(flags);
            options.open(path)
        }
        .map_err(|e| ShardError::store_open(path, e.to_string()))?;

        let (values, meta, index) = Self::init(&env)
            .map_err(|e| ShardError::store_open(path, format!("init: {}", e)))?;

        debug!(path = %path.display(), index, "store initialised");

        let store = Self {
            env,
            values,
            meta,
            path: path.to_path_buf(),
            lock,
        };
        Ok((store, index))
    }

    /// Create the buckets if needed and read back the persisted index
    fn init(env: &Env) -> ShardResult<(Database<Bytes, Bytes>, Database<Bytes, Bytes>, u64)> {
        let mut wtxn = env.write_txn()?;
        let values = env.create_database::<Bytes, Bytes>(&mut wtxn, Some(VALUES_BUCKET))?;
        let meta = env.create_database::<Bytes, Bytes>(&mut wtxn, Some(META_BUCKET))?;
        let index = read_index(meta, &wtxn)?;
        wtxn.commit()?;
        Ok((values, meta, index))
    }

    /// Path of the store file
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Read the encoded value of one point
    pub(crate) fn read_series(&self, series_id: u32, timestamp: i64) -> ShardResult<Option<Vec<u8>>> {
        let rtxn = self.env.read_txn()?;
        let value = self
            .values
            .get(&rtxn, &series_key(series_id, timestamp)[..])?
            .map(<[u8]>::to_vec);
        Ok(value)
    }

    /// Apply a write batch and its replication index in one transaction
    ///
    /// A malformed batch or any store error drops the transaction, so nothing
    /// from the batch becomes visible. The persisted index never moves
    /// backwards.
    pub(crate) fn write_series(&self, index: u64, batch: &[u8]) -> ShardResult<BatchSummary> {
        let mut wtxn = self.env.write_txn()?;

        let mut points = 0u64;
        let mut bytes = 0u64;
        for frame in BatchReader::new(batch) {
            let frame = frame?;
            self.values.put(
                &mut wtxn,
                &series_key(frame.series_id, frame.timestamp)[..],
                frame.payload,
            )?;
            points += 1;
            bytes += frame.payload.len() as u64;
        }

        let index = read_index(self.meta, &wtxn)?.max(index);
        self.meta.put(&mut wtxn, INDEX_KEY, &u64_to_bytes(index)[..])?;
        wtxn.commit()?;

        trace!(path = %self.path.display(), index, points, "batch committed");
        Ok(BatchSummary { points, bytes, index })
    }

    /// Remove every point of a series; returns whether anything was removed
    pub(crate) fn drop_series(&self, series_id: u32) -> ShardResult<bool> {
        let start = series_prefix(series_id);
        let end = series_id.checked_add(1).map(series_prefix);
        let upper: Bound<&[u8]> = match &end {
            Some(end) => Bound::Excluded(&end[..]),
            None => Bound::Unbounded,
        };
        let range = (Bound::Included(&start[..]), upper);

        let mut wtxn = self.env.write_txn()?;
        let removed = self.values.delete_range(&mut wtxn, &range)?;
        wtxn.commit()?;
        Ok(removed > 0)
    }

    /// Highest replication index persisted in the store
    #[cfg(test)]
    pub(crate) fn index(&self) -> ShardResult<u64> {
        let rtxn = self.env.read_txn()?;
        read_index(self.meta, &rtxn)
    }

    /// Close the environment and release the ownership lock
    pub(crate) fn close(self) -> ShardResult<()> {
        let Self { env, lock, path, .. } = self;
        drop(env);
        FileExt::unlock(&lock)?;
        debug!(path = %path.display(), "store closed");
        Ok(())
    }
}

fn read_index(meta: Database<Bytes, Bytes>, txn: &RoTxn<'_>) -> ShardResult<u64> {
    match meta.get(txn, INDEX_KEY)? {
        None => Ok(0),
        Some(buf) if buf.is_empty() => Ok(0),
        Some(buf) => {
            let buf: &[u8; 8] = buf.try_into().map_err(|_| {
                ShardError::Store(heed::Error::Encoding(
                    format!("meta index has {} bytes, expected 8", buf.len()).into(),
                ))
            })?;
            Ok(bytes_to_u64(buf))
        }
    }
}

/// Take the exclusive ownership lock of a store, retrying until the timeout
fn acquire_lock(store_path: &Path, config: &ShardConfig) -> ShardResult<File> {
    let path = lock_path(store_path);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| ShardError::store_open(&path, format!("lock file: {}", e)))?;

    let contended = fs2::lock_contended_error().raw_os_error();
    let deadline = Instant::now() + config.open_timeout;
    loop {
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => return Ok(file),
            Err(e) if e.raw_os_error() == contended => {}
            Err(e) => return Err(ShardError::store_open(&path, format!("lock: {}", e))),
        }

        if Instant::now() >= deadline {
            return Err(ShardError::store_timeout(store_path, config.open_timeout));
        }
        thread::sleep(config.lock_retry_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BatchWriter;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_config() -> ShardConfig {
        ShardConfig::new()
            .with_map_size(16 * 1024 * 1024)
            .with_open_timeout(Duration::from_millis(100))
            .with_lock_retry_interval(Duration::from_millis(5))
    }

    fn batch(points: &[(u32, i64, &[u8])]) -> Vec<u8> {
        let mut writer = BatchWriter::new();
        for (series_id, timestamp, payload) in points {
            writer.push(*series_id, *timestamp, payload).unwrap();
        }
        writer.finish()
    }

    #[test]
    fn test_new_store_starts_at_index_zero() -> ShardResult<()> {
        let dir = tempdir()?;
        let (store, index) = ShardStore::open(&dir.path().join("1"), &test_config())?;
        assert_eq!(index, 0);
        assert_eq!(store.index()?, 0);
        assert!(store.path().ends_with("1"));
        store.close()
    }

    #[test]
    fn test_write_then_read() -> ShardResult<()> {
        let dir = tempdir()?;
        let (store, _) = ShardStore::open(&dir.path().join("1"), &test_config())?;

        let summary = store.write_series(5, &batch(&[(7, 42, &[1, 2, 3]), (8, 42, b"x")]))?;
        assert_eq!(summary, BatchSummary { points: 2, bytes: 4, index: 5 });

        assert_eq!(store.read_series(7, 42)?, Some(vec![1, 2, 3]));
        assert_eq!(store.read_series(7, 43)?, None);
        assert_eq!(store.read_series(99, 42)?, None);
        assert_eq!(store.index()?, 5);
        store.close()
    }

    #[test]
    fn test_persisted_index_never_regresses() -> ShardResult<()> {
        let dir = tempdir()?;
        let (store, _) = ShardStore::open(&dir.path().join("1"), &test_config())?;

        store.write_series(10, &batch(&[(1, 1, b"a")]))?;
        let summary = store.write_series(4, &batch(&[(1, 2, b"b")]))?;
        assert_eq!(summary.index, 10);
        assert_eq!(store.index()?, 10);
        assert_eq!(store.read_series(1, 2)?, Some(b"b".to_vec()));
        store.close()
    }

    #[test]
    fn test_malformed_batch_rolls_back() -> ShardResult<()> {
        let dir = tempdir()?;
        let (store, _) = ShardStore::open(&dir.path().join("1"), &test_config())?;

        let mut bad = batch(&[(7, 42, &[1, 2, 3])]);
        bad.extend_from_slice(&crate::codec::encode_point_header(7, 50, 43));
        bad.extend_from_slice(&[0; 10]);

        let err = store.write_series(3, &bad).unwrap_err();
        assert!(err.is_invalid_point_buffer());
        assert_eq!(store.read_series(7, 42)?, None);
        assert_eq!(store.index()?, 0);
        store.close()
    }

    #[test]
    fn test_drop_series_only_removes_that_series() -> ShardResult<()> {
        let dir = tempdir()?;
        let (store, _) = ShardStore::open(&dir.path().join("1"), &test_config())?;

        store.write_series(1, &batch(&[(1, 5, b"a"), (2, 5, b"b"), (2, -3, b"c"), (3, 5, b"d")]))?;
        assert!(store.drop_series(2)?);
        assert!(!store.drop_series(2)?);
        assert!(!store.drop_series(1000)?);

        assert_eq!(store.read_series(1, 5)?, Some(b"a".to_vec()));
        assert_eq!(store.read_series(2, 5)?, None);
        assert_eq!(store.read_series(2, -3)?, None);
        assert_eq!(store.read_series(3, 5)?, Some(b"d".to_vec()));
        store.close()
    }

    #[test]
    fn test_drop_last_series_id() -> ShardResult<()> {
        let dir = tempdir()?;
        let (store, _) = ShardStore::open(&dir.path().join("1"), &test_config())?;

        store.write_series(1, &batch(&[(u32::MAX, 1, b"a"), (u32::MAX - 1, 1, b"b")]))?;
        assert!(store.drop_series(u32::MAX)?);
        assert_eq!(store.read_series(u32::MAX, 1)?, None);
        assert_eq!(store.read_series(u32::MAX - 1, 1)?, Some(b"b".to_vec()));
        store.close()
    }

    #[test]
    fn test_second_open_times_out() -> ShardResult<()> {
        let dir = tempdir()?;
        let path = dir.path().join("1");
        let (store, _) = ShardStore::open(&path, &test_config())?;

        let err = ShardStore::open(&path, &test_config()).err().unwrap();
        assert!(matches!(err, ShardError::StoreTimeout { .. }));

        store.close()?;
        let (store, _) = ShardStore::open(&path, &test_config())?;
        store.close()
    }
}
