//! Statistics and metrics for a frame archive

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

use crate::frame::StreamId;
use crate::pool::PoolStats;

#[derive(Debug, Default)]
struct Counters {
    frames_published: AtomicU64,
    frames_released: AtomicU64,
    drops_pool_exhausted: AtomicU64,
    drops_queue_full: AtomicU64,
    continuations_fired: AtomicU64,
    continuations_failed: AtomicU64,
    continuations_suppressed: AtomicU64,
    slow_callbacks: AtomicU64,
}

/// Live counters updated on the capture and release paths
///
/// All updates are relaxed atomic increments; the counters sit on their own
/// cache line so consumers releasing frames don't contend with the producer's
/// other state.
#[derive(Debug, Default)]
pub struct ArchiveMetrics {
    counters: CachePadded<Counters>,
}

impl ArchiveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_published(&self) {
        self.counters.frames_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_released(&self) {
        self.counters.frames_released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_exhausted(&self) {
        self.counters
            .drops_pool_exhausted
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_full(&self) {
        self.counters.drops_queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_continuation_fired(&self) {
        self.counters
            .continuations_fired
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_continuation_failed(&self) {
        self.counters
            .continuations_failed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_continuation_suppressed(&self) {
        self.counters
            .continuations_suppressed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slow_callback(&self) {
        self.counters.slow_callbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters into `stats`
    pub(crate) fn fill(&self, stats: &mut ArchiveStats) {
        let c = &self.counters;
        stats.frames_published = c.frames_published.load(Ordering::Relaxed);
        stats.frames_released = c.frames_released.load(Ordering::Relaxed);
        stats.drops_pool_exhausted = c.drops_pool_exhausted.load(Ordering::Relaxed);
        stats.drops_queue_full = c.drops_queue_full.load(Ordering::Relaxed);
        stats.continuations_fired = c.continuations_fired.load(Ordering::Relaxed);
        stats.continuations_failed = c.continuations_failed.load(Ordering::Relaxed);
        stats.continuations_suppressed = c.continuations_suppressed.load(Ordering::Relaxed);
        stats.slow_callbacks = c.slow_callbacks.load(Ordering::Relaxed);
    }
}

/// Archive-wide statistics snapshot
#[derive(Debug, Clone)]
pub struct ArchiveStats {
    /// Frames successfully published
    pub frames_published: u64,
    /// Published frames fully released by every consumer
    pub frames_released: u64,
    /// Captures dropped because the frame pool was exhausted
    pub drops_pool_exhausted: u64,
    /// Captures dropped because a stream hit its published-frame quota
    pub drops_queue_full: u64,
    /// Continuations invoked
    pub continuations_fired: u64,
    /// Continuations that panicked
    pub continuations_failed: u64,
    /// Continuations discarded because the archive was flushed
    pub continuations_suppressed: u64,
    /// Frames whose consumer callback outlasted one frame interval
    pub slow_callbacks: u64,
    pub frames: PoolStats,
    pub framesets: PoolStats,
    pub detached_refs: PoolStats,
    /// Retired payloads waiting for reuse
    pub freelist_len: usize,
    /// Published frames currently held, per enabled stream
    pub published_per_stream: Vec<(StreamId, usize)>,
}

impl ArchiveStats {
    pub(crate) fn new(frames: PoolStats, framesets: PoolStats, detached_refs: PoolStats) -> Self {
        Self {
            frames_published: 0,
            frames_released: 0,
            drops_pool_exhausted: 0,
            drops_queue_full: 0,
            continuations_fired: 0,
            continuations_failed: 0,
            continuations_suppressed: 0,
            slow_callbacks: 0,
            frames,
            framesets,
            detached_refs,
            freelist_len: 0,
            published_per_stream: Vec::new(),
        }
    }

    /// Total captures dropped for any reason
    pub fn frames_dropped(&self) -> u64 {
        self.drops_pool_exhausted + self.drops_queue_full
    }

    /// Published frames not yet fully released
    pub fn outstanding_frames(&self) -> u64 {
        self.frames_published.saturating_sub(self.frames_released)
    }

    /// Published frames currently held for `stream`
    pub fn published_for(&self, stream: StreamId) -> usize {
        self.published_per_stream
            .iter()
            .find(|(id, _)| *id == stream)
            .map_or(0, |(_, count)| *count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolKind;

    fn pool(kind: PoolKind) -> PoolStats {
        PoolStats {
            kind,
            capacity: 4,
            in_use: 0,
            high_water: 0,
        }
    }

    fn empty_stats() -> ArchiveStats {
        ArchiveStats::new(
            pool(PoolKind::Frames),
            pool(PoolKind::FrameSets),
            pool(PoolKind::DetachedRefs),
        )
    }

    #[test]
    fn test_metrics_new() {
        let metrics = ArchiveMetrics::new();
        let mut stats = empty_stats();
        metrics.fill(&mut stats);

        assert_eq!(stats.frames_published, 0);
        assert_eq!(stats.frames_released, 0);
        assert_eq!(stats.frames_dropped(), 0);
        assert_eq!(stats.continuations_fired, 0);
        assert_eq!(stats.outstanding_frames(), 0);
    }

    #[test]
    fn test_metrics_record() {
        let metrics = ArchiveMetrics::new();
        metrics.record_published();
        metrics.record_published();
        metrics.record_published();
        metrics.record_released();
        metrics.record_pool_exhausted();
        metrics.record_queue_full();
        metrics.record_queue_full();
        metrics.record_continuation_fired();
        metrics.record_continuation_failed();
        metrics.record_continuation_suppressed();
        metrics.record_slow_callback();

        let mut stats = empty_stats();
        metrics.fill(&mut stats);

        assert_eq!(stats.frames_published, 3);
        assert_eq!(stats.frames_released, 1);
        assert_eq!(stats.outstanding_frames(), 2);
        assert_eq!(stats.drops_pool_exhausted, 1);
        assert_eq!(stats.drops_queue_full, 2);
        assert_eq!(stats.frames_dropped(), 3);
        assert_eq!(stats.continuations_fired, 1);
        assert_eq!(stats.continuations_failed, 1);
        assert_eq!(stats.continuations_suppressed, 1);
        assert_eq!(stats.slow_callbacks, 1);
    }

    #[test]
    fn test_published_for() {
        let mut stats = empty_stats();
        stats.published_per_stream = vec![(StreamId::DEPTH, 2), (StreamId::COLOR, 0)];

        assert_eq!(stats.published_for(StreamId::DEPTH), 2);
        assert_eq!(stats.published_for(StreamId::COLOR), 0);
        assert_eq!(stats.published_for(StreamId::FISHEYE), 0);
    }
}
