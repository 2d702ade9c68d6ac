//! Shard lifecycle and synchronous data access
//!
//! A [`Shard`] starts closed. [`Shard::open`] acquires its store file,
//! recovers the applied replication index, positions the broker connection at
//! that index and starts the consumer thread. [`Shard::close`] shuts the
//! connection, waits for the consumer and releases the store.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::ShardConfig;
use crate::conn::MessagingConn;
use crate::metrics::ShardMetrics;
use crate::shard::processor::{Processor, ProcessorFailure, ProcessorState};
use crate::shard::store::ShardStore;
use crate::shard::{ShardError, ShardId, ShardInfo, ShardResult, ShardStats};

/// State shared between a shard and its consumer thread
pub(crate) struct ShardShared {
    pub(crate) id: ShardId,
    index: AtomicU64,
    running: AtomicBool,
    pub(crate) metrics: ShardMetrics,
}

impl ShardShared {
    fn new(id: ShardId) -> Self {
        Self {
            id,
            index: AtomicU64::new(0),
            running: AtomicBool::new(false),
            metrics: ShardMetrics::new(),
        }
    }

    pub(crate) fn index(&self) -> u64 {
        self.index.load(Ordering::Acquire)
    }

    /// Move the applied index forward; lower values are ignored
    pub(crate) fn advance(&self, index: u64) {
        self.index.fetch_max(index, Ordering::AcqRel);
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Commit a batch and track the index it persisted
    pub(crate) fn write_series(&self, store: &ShardStore, index: u64, batch: &[u8]) -> ShardResult<()> {
        let summary = store.write_series(index, batch)?;
        self.metrics.record_batch(summary.points, summary.bytes);
        self.advance(summary.index);
        Ok(())
    }
}

/// Resources held by an open shard
struct OpenShard {
    store: Arc<ShardStore>,
    conn: Arc<dyn MessagingConn>,
    processor: JoinHandle<()>,
}

enum ShardState {
    Closed,
    /// `open` is acquiring the store; the state lock is not held meanwhile
    Opening,
    Open(OpenShard),
}

/// Logical storage for one slice of a shard group's series
///
/// The local instance holds data only when it has been opened on a data node
/// listed in its owners.
pub struct Shard {
    info: ShardInfo,
    config: ShardConfig,
    shared: Arc<ShardShared>,
    state: RwLock<ShardState>,
    failures: RwLock<Receiver<ProcessorFailure>>,
}

impl Shard {
    /// Create a closed shard with the default configuration
    pub fn new(id: ShardId, data_node_ids: Vec<u64>) -> Self {
        Self::with_config(ShardInfo::new(id, data_node_ids), ShardConfig::default())
    }

    /// Create a closed shard from its descriptor and a configuration
    pub fn with_config(info: ShardInfo, config: ShardConfig) -> Self {
        let (_, failures) = channel::unbounded();
        Self {
            shared: Arc::new(ShardShared::new(info.id)),
            info,
            config,
            state: RwLock::new(ShardState::Closed),
            failures: RwLock::new(failures),
        }
    }

    /// Shard ID
    pub fn id(&self) -> ShardId {
        self.info.id
    }

    /// Data nodes that own the shard
    pub fn data_node_ids(&self) -> &[u64] {
        &self.info.data_node_ids
    }

    /// Check if the data node owns the shard
    pub fn has_data_node_id(&self, id: u64) -> bool {
        self.info.has_data_node_id(id)
    }

    /// Descriptor of the shard
    pub fn info(&self) -> &ShardInfo {
        &self.info
    }

    /// Configuration used when opening the store
    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    /// Highest applied replication index
    pub fn index(&self) -> u64 {
        self.shared.index()
    }

    /// Check if the shard holds an open store
    pub fn is_open(&self) -> bool {
        matches!(*self.state.read(), ShardState::Open(_))
    }

    /// Path of the open store file
    pub fn path(&self) -> Option<PathBuf> {
        match &*self.state.read() {
            ShardState::Open(open) => Some(open.store.path().to_path_buf()),
            ShardState::Closed | ShardState::Opening => None,
        }
    }

    /// State of the consumer thread
    pub fn processor_state(&self) -> ProcessorState {
        if self.shared.is_running() {
            ProcessorState::Running
        } else {
            ProcessorState::Stopped
        }
    }

    /// Channel on which the consumer reports messages it could not apply
    ///
    /// A failure means the processor has stopped; the owner decides whether
    /// to reopen the shard, rebuild it, or take the node down. Every `open`
    /// starts a new channel: a receiver obtained earlier only sees failures of
    /// the processor that was running then, and disconnects once that
    /// processor has exited.
    pub fn failures(&self) -> Receiver<ProcessorFailure> {
        self.failures.read().clone()
    }

    /// Statistics about the shard
    pub fn stats(&self) -> ShardStats {
        let metrics = &self.shared.metrics;
        ShardStats {
            id: self.id(),
            index: self.index(),
            open: self.is_open(),
            processor_state: self.processor_state(),
            batches_applied: metrics.batches_applied(),
            points_written: metrics.points_written(),
            bytes_written: metrics.bytes_written(),
            stale_messages: metrics.stale_messages(),
            reads: metrics.reads(),
            read_hits: metrics.read_hits(),
            series_dropped: metrics.series_dropped(),
        }
    }

    /// Open the shard's store at `path` and start consuming from `conn`
    ///
    /// The connection is opened at the index recovered from the store, asking
    /// for replay, so messages the store already holds are redelivered and
    /// skipped. If anything fails after the store is acquired, the store is
    /// released before the error is returned.
    pub fn open(&self, path: impl AsRef<Path>, conn: Arc<dyn MessagingConn>) -> ShardResult<()> {
        let path = path.as_ref();
        {
            let mut state = self.state.write();
            if !matches!(*state, ShardState::Closed) {
                return Err(ShardError::AlreadyOpen);
            }
            *state = ShardState::Opening;
        }

        // Acquiring the store can wait up to `open_timeout` for another
        // owner, so it runs without holding the state lock.
        let opened = self.start(path, conn);

        let mut state = self.state.write();
        match opened {
            Ok((open, failures)) => {
                *state = ShardState::Open(open);
                *self.failures.write() = failures;
                info!(shard_id = self.id(), index = self.index(), path = %path.display(), "shard opened");
                Ok(())
            }
            Err(e) => {
                *state = ShardState::Closed;
                Err(e)
            }
        }
    }

    /// Acquire the store, position the connection and spawn the consumer
    fn start(
        &self,
        path: &Path,
        conn: Arc<dyn MessagingConn>,
    ) -> ShardResult<(OpenShard, Receiver<ProcessorFailure>)> {
        self.config
            .validate()
            .map_err(|e| ShardError::store_open(path, e.to_string()))?;

        let (store, index) = ShardStore::open(path, &self.config)?;
        self.shared.index.store(index, Ordering::Release);

        if let Err(e) = conn.open(index, true) {
            self.release_store(store);
            return Err(ShardError::conn(self.id(), index, e));
        }

        let (failure_tx, failure_rx) = channel::unbounded();
        let store = Arc::new(store);
        let processor = Processor::new(self.shared.clone(), store.clone(), conn.messages(), failure_tx);
        let processor = match processor.spawn(&self.config.processor_thread_prefix) {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(err) = conn.close() {
                    warn!(shard_id = self.id(), error = %err, "failed to close shard conn");
                }
                if let Ok(store) = Arc::try_unwrap(store) {
                    self.release_store(store);
                }
                return Err(ShardError::processor(format!("spawn: {}", e)));
            }
        };

        let open = OpenShard {
            store,
            conn,
            processor,
        };
        Ok((open, failure_rx))
    }

    /// Close the shard
    ///
    /// Always leaves the shard closed and is a no-op on a closed shard. A
    /// shard that is still being opened is left to its opener. The
    /// connection is closed first so the consumer observes the disconnect and
    /// exits; the store is released once the consumer is gone. Failures along
    /// the way do not stop the remaining steps; the first one is returned.
    pub fn close(&self) -> ShardResult<()> {
        let open = {
            let mut state = self.state.write();
            match std::mem::replace(&mut *state, ShardState::Closed) {
                ShardState::Open(open) => open,
                ShardState::Opening => {
                    *state = ShardState::Opening;
                    return Ok(());
                }
                ShardState::Closed => return Ok(()),
            }
        };
        let OpenShard {
            store,
            conn,
            processor,
        } = open;

        let mut result = Ok(());

        if let Err(e) = conn.close() {
            warn!(shard_id = self.id(), error = %e, "failed to close shard conn");
            result = Err(ShardError::conn(self.id(), self.index(), e));
        }

        if processor.join().is_err() {
            warn!(shard_id = self.id(), "shard processor panicked");
            if result.is_ok() {
                result = Err(ShardError::processor("consumer thread panicked"));
            }
        }

        match Arc::try_unwrap(store) {
            Ok(store) => {
                if let Err(e) = store.close() {
                    warn!(shard_id = self.id(), error = %e, "failed to close shard store");
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
            // A concurrent reader still holds the store; it is released when
            // that reader finishes.
            Err(_) => debug!(shard_id = self.id(), "store release deferred to in-flight reader"),
        }

        info!(shard_id = self.id(), index = self.index(), "shard closed");
        result
    }

    fn release_store(&self, store: ShardStore) {
        if let Err(e) = store.close() {
            warn!(shard_id = self.id(), error = %e, "failed to close shard store");
        }
    }

    fn store(&self) -> Option<Arc<ShardStore>> {
        match &*self.state.read() {
            ShardState::Open(open) => Some(open.store.clone()),
            ShardState::Closed | ShardState::Opening => None,
        }
    }

    /// Read the encoded value of a series at a timestamp
    ///
    /// Returns `None` both when the series has no value at `timestamp` and
    /// when the shard holds no data for the series at all.
    pub fn read_series(&self, series_id: u32, timestamp: i64) -> ShardResult<Option<Vec<u8>>> {
        let store = self.store().ok_or(ShardError::Closed)?;
        let value = store.read_series(series_id, timestamp)?;
        self.shared.metrics.record_read(value.is_some());
        Ok(value)
    }

    /// Write an encoded batch and its replication index in one transaction
    ///
    /// Nothing is written if the batch is malformed.
    pub fn write_series(&self, index: u64, batch: &[u8]) -> ShardResult<()> {
        let store = self.store().ok_or(ShardError::Closed)?;
        self.shared.write_series(&store, index, batch)
    }

    /// Delete all data of a series
    ///
    /// Succeeds without doing anything when the series has no data or the
    /// shard is closed.
    pub fn drop_series(&self, series_id: u32) -> ShardResult<()> {
        let Some(store) = self.store() else {
            return Ok(());
        };
        if store.drop_series(series_id)? {
            self.shared.metrics.increment_series_dropped();
            debug!(shard_id = self.id(), series_id, "series dropped");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.info.id)
            .field("data_node_ids", &self.info.data_node_ids)
            .field("index", &self.index())
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(shard_id = self.id(), error = %e, "error closing shard");
        }
    }
}
