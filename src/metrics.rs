use std::sync::atomic::{AtomicU64, Ordering};

/// Per-shard operation counters
#[derive(Debug, Default)]
pub struct ShardMetrics {
    /// Number of write batches committed
    batches_applied: AtomicU64,
    /// Number of points written
    points_written: AtomicU64,
    /// Total payload bytes written
    bytes_written: AtomicU64,
    /// Replayed messages skipped because their index was already applied
    stale_messages: AtomicU64,
    /// Number of point reads
    reads: AtomicU64,
    /// Number of point reads that found a value
    read_hits: AtomicU64,
    /// Number of series drop operations that removed data
    series_dropped: AtomicU64,
}

impl ShardMetrics {
    /// Create a new set of counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a committed batch
    pub fn record_batch(&self, points: u64, bytes: u64) {
        self.batches_applied.fetch_add(1, Ordering::Relaxed);
        self.points_written.fetch_add(points, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Increment stale message count
    pub fn increment_stale(&self) {
        self.stale_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a point read
    pub fn record_read(&self, hit: bool) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.read_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Increment dropped series count
    pub fn increment_series_dropped(&self) {
        self.series_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Get number of committed batches
    pub fn batches_applied(&self) -> u64 {
        self.batches_applied.load(Ordering::Relaxed)
    }

    /// Get number of points written
    pub fn points_written(&self) -> u64 {
        self.points_written.load(Ordering::Relaxed)
    }

    /// Get total payload bytes written
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Get number of skipped stale messages
    pub fn stale_messages(&self) -> u64 {
        self.stale_messages.load(Ordering::Relaxed)
    }

    /// Get number of point reads
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Get number of point reads that found a value
    pub fn read_hits(&self) -> u64 {
        self.read_hits.load(Ordering::Relaxed)
    }

    /// Get number of dropped series
    pub fn series_dropped(&self) -> u64 {
        self.series_dropped.load(Ordering::Relaxed)
    }
}
