//! Frame archive implementation
//!
//! [`FrameArchive`] is owned by the capture thread and carries the per-stream
//! backbuffers; producer operations take `&mut self` and need no locking.
//! Everything consumers touch lives in a shared `ArchiveShared` reached
//! through cloneable [`ArchiveHandle`]s: the three pools, the payload
//! freelist, the per-stream published counters and the weak "latest frame"
//! pointers. Consumer operations only ever take a pool's or a stream's own
//! small lock, never an archive-wide one.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::frame::buffer::{PublishedFrame, ReleaseCallback};
use crate::frame::handle::SharedFrame;
use crate::frame::{
    DetachedFrame, FrameBuffer, FrameContinuation, FrameHandle, FrameMetadata, FrameSet,
    PooledFrameSet, StreamId,
};
use crate::pool::{Pool, PoolError, PoolKind, Pooled};
use crate::stats::{ArchiveMetrics, ArchiveStats};

use super::config::{ArchiveConfig, StreamProfile};
use super::error::ArchiveError;
use super::freelist::Freelist;

/// Per-stream state visible to consumers
struct StreamState {
    profile: StreamProfile,
    /// Published frames of this stream not yet fully released
    published: AtomicUsize,
    /// Most recently published frame; weak so it never pins a pool slot
    latest: Mutex<Weak<Pooled<PublishedFrame>>>,
}

/// State shared between the producer and all consumers
pub(crate) struct ArchiveShared {
    config: ArchiveConfig,
    /// Indexed by stream id; `None` for ids that were not selected
    streams: Box<[Option<StreamState>]>,
    frames: Arc<Pool<PublishedFrame>>,
    framesets: Arc<Pool<FrameSet>>,
    detached: Arc<Pool<FrameHandle>>,
    freelist: Freelist,
    max_frames_per_stream: AtomicUsize,
    continuations_enabled: AtomicBool,
    metrics: ArchiveMetrics,
    capture_started: Instant,
}

impl ArchiveShared {
    fn new(config: ArchiveConfig) -> Self {
        let mut streams: Vec<Option<StreamState>> =
            (0..config.stream_count()).map(|_| None).collect();
        for profile in &config.streams {
            streams[profile.stream.index()] = Some(StreamState {
                profile: *profile,
                published: AtomicUsize::new(0),
                latest: Mutex::new(Weak::new()),
            });
        }

        Self {
            streams: streams.into_boxed_slice(),
            frames: Pool::new(PoolKind::Frames, config.frame_capacity),
            framesets: Pool::new(PoolKind::FrameSets, config.frameset_capacity),
            detached: Pool::new(PoolKind::DetachedRefs, config.detached_capacity),
            freelist: Freelist::new(config.freelist_capacity, config.freelist_max_age_ms),
            max_frames_per_stream: AtomicUsize::new(config.max_frames_per_stream),
            continuations_enabled: AtomicBool::new(true),
            metrics: ArchiveMetrics::new(),
            capture_started: Instant::now(),
            config,
        }
    }

    fn stream(&self, stream: StreamId) -> Result<&StreamState, ArchiveError> {
        self.streams
            .get(stream.index())
            .and_then(Option::as_ref)
            .ok_or(ArchiveError::UnknownStream(stream))
    }

    /// Move a filled buffer into the frame pool
    ///
    /// On failure the untouched buffer is handed back with the error.
    pub(crate) fn publish(
        self: &Arc<Self>,
        mut buffer: FrameBuffer,
    ) -> Result<FrameHandle, (ArchiveError, FrameBuffer)> {
        let stream = buffer.stream();
        let state = match self.stream(stream) {
            Ok(state) => state,
            Err(err) => return Err((err, buffer)),
        };

        let limit = self.max_frames_per_stream.load(Ordering::Relaxed);
        if limit > 0 && state.published.load(Ordering::Acquire) >= limit {
            self.metrics.record_queue_full();
            return Err((ArchiveError::StreamQueueFull { stream, limit }, buffer));
        }

        let slot = match self.frames.allocate() {
            Ok(slot) => slot,
            Err(err) => {
                if matches!(err, PoolError::Exhausted { .. }) {
                    self.metrics.record_pool_exhausted();
                }
                return Err((err.into(), buffer));
            }
        };

        let (payload, metadata, continuation) = buffer.take_parts();
        state.published.fetch_add(1, Ordering::AcqRel);

        let frame: SharedFrame = Arc::new(Pooled::new(
            slot,
            PublishedFrame::new(payload, metadata, continuation, Arc::downgrade(self)),
        ));
        *state.latest.lock() = Arc::downgrade(&frame);
        self.metrics.record_published();

        tracing::trace!(
            stream = %stream,
            frame_number = metadata.frame_number,
            "Frame published"
        );

        Ok(FrameHandle::adopt(frame))
    }

    /// Last-release work for a published frame, run from its `Drop`
    pub(crate) fn unpublish(&self, frame: &mut PublishedFrame) {
        let metadata = *frame.metadata();
        self.log_callback_end(&metadata, frame.callback_started());

        if let Some(callback) = frame.take_callback() {
            self.run_continuation(&metadata, callback);
        }

        if let Ok(state) = self.stream(metadata.stream) {
            state.published.fetch_sub(1, Ordering::AcqRel);
        }

        if self.frames.is_accepting() {
            self.freelist.retire(frame.take_payload(), metadata.timestamp);
        }

        self.metrics.record_released();

        tracing::trace!(
            stream = %metadata.stream,
            frame_number = metadata.frame_number,
            "Frame released"
        );
    }

    /// Invoke a continuation, containing any panic
    ///
    /// Must not be called while holding a pool or freelist lock.
    pub(crate) fn run_continuation(&self, metadata: &FrameMetadata, callback: ReleaseCallback) {
        if !self.continuations_enabled.load(Ordering::Acquire) {
            drop(callback);
            self.metrics.record_continuation_suppressed();
            tracing::trace!(
                stream = %metadata.stream,
                frame_number = metadata.frame_number,
                "Continuation suppressed after flush"
            );
            return;
        }

        match panic::catch_unwind(AssertUnwindSafe(callback)) {
            Ok(()) => self.metrics.record_continuation_fired(),
            Err(payload) => {
                self.metrics.record_continuation_failed();
                tracing::error!(
                    stream = %metadata.stream,
                    frame_number = metadata.frame_number,
                    error = panic_message(payload.as_ref()),
                    "Frame continuation panicked"
                );
            }
        }
    }

    fn log_callback_end(&self, metadata: &FrameMetadata, started: Option<Instant>) {
        let Some(started) = started else {
            return;
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let max_duration_ms = 1000 / (u64::from(metadata.fps) + 1);

        if self.config.callback_warning && duration_ms > max_duration_ms {
            self.metrics.record_slow_callback();
            tracing::info!(
                stream = %metadata.stream,
                frame_number = metadata.frame_number,
                duration_ms,
                fps = metadata.fps,
                max_duration_ms,
                "Frame callback took too long to complete"
            );
        }

        tracing::debug!(
            stream = %metadata.stream,
            frame_number = metadata.frame_number,
            dispatched_at_ms = self.capture_started.elapsed().as_millis() as u64,
            "Callback finished"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// Consumer-side access to an archive
///
/// Cheap to clone and safe to share between threads. Operations stay valid
/// after the archive is flushed but then fail with [`PoolError::Stopped`].
#[derive(Clone)]
pub struct ArchiveHandle {
    shared: Arc<ArchiveShared>,
}

impl ArchiveHandle {
    /// New reference to the most recently published frame of `stream`
    ///
    /// Returns a null handle if nothing is published or the latest frame has
    /// already been fully released.
    pub fn track_frame(&self, stream: StreamId) -> FrameHandle {
        let Ok(state) = self.shared.stream(stream) else {
            return FrameHandle::null();
        };
        let latest = state.latest.lock().upgrade();
        latest.map(FrameHandle::adopt).unwrap_or_default()
    }

    /// Detached copy of `frame` (one more reference)
    pub fn clone_frame(&self, frame: &FrameHandle) -> Result<DetachedFrame, ArchiveError> {
        let slot = self.shared.detached.allocate()?;
        Ok(DetachedFrame::new(Pooled::new(slot, frame.acquire())))
    }

    /// Move `frame` into the detached-ref pool
    ///
    /// If the pool is exhausted the handle is released.
    pub fn detach_frame(&self, frame: FrameHandle) -> Result<DetachedFrame, ArchiveError> {
        let slot = self.shared.detached.allocate()?;
        Ok(DetachedFrame::new(Pooled::new(slot, frame)))
    }

    /// Take `stream`'s frame out of `set` as a detached handle
    ///
    /// The set is left untouched if no detached slot is available.
    pub fn detach_frame_ref(
        &self,
        set: &mut FrameSet,
        stream: StreamId,
    ) -> Result<DetachedFrame, ArchiveError> {
        let slot = self.shared.detached.allocate()?;
        Ok(DetachedFrame::new(Pooled::new(slot, set.detach_ref(stream))))
    }

    /// Release a detached handle and its detached-ref slot
    pub fn release_frame_ref(&self, frame: DetachedFrame) {
        drop(frame);
    }

    /// Empty frameset from the frameset pool
    pub fn alloc_frameset(&self) -> Result<PooledFrameSet, ArchiveError> {
        let slot = self.shared.framesets.allocate()?;
        Ok(Pooled::new(slot, FrameSet::new(self.shared.streams.len())))
    }

    /// Independent copy of `set` from the frameset pool
    pub fn clone_frameset(&self, set: &FrameSet) -> Result<PooledFrameSet, ArchiveError> {
        let slot = self.shared.framesets.allocate()?;
        Ok(Pooled::new(slot, set.acquire_all()))
    }

    /// Change the per-stream published-frame quota (0 = unlimited)
    pub fn set_max_frames_per_stream(&self, max: usize) {
        self.shared
            .max_frames_per_stream
            .store(max, Ordering::Relaxed);
    }

    pub fn max_frames_per_stream(&self) -> usize {
        self.shared.max_frames_per_stream.load(Ordering::Relaxed)
    }

    /// Selected stream modes
    pub fn streams(&self) -> &[StreamProfile] {
        &self.shared.config.streams
    }

    pub fn profile(&self, stream: StreamId) -> Option<&StreamProfile> {
        self.shared.config.profile(stream)
    }

    /// Number of frameset slots (highest selected stream id + 1)
    pub fn stream_count(&self) -> usize {
        self.shared.streams.len()
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.shared.config
    }

    pub fn is_flushed(&self) -> bool {
        !self.shared.frames.is_accepting()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> ArchiveStats {
        let shared = &self.shared;
        let mut stats = ArchiveStats::new(
            shared.frames.stats(),
            shared.framesets.stats(),
            shared.detached.stats(),
        );
        shared.metrics.fill(&mut stats);
        stats.freelist_len = shared.freelist.len();
        stats.published_per_stream = shared
            .streams
            .iter()
            .flatten()
            .map(|state| {
                (
                    state.profile.stream,
                    state.published.load(Ordering::Acquire),
                )
            })
            .collect();
        stats
    }
}

impl std::fmt::Debug for ArchiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveHandle")
            .field("streams", &self.shared.config.streams.len())
            .field("frames", &self.shared.frames)
            .finish()
    }
}

/// Frame lifecycle orchestrator for one streaming session
///
/// Owned by the capture thread. Created with the session's stream selection
/// and flushed (explicitly or on drop) when streaming stops.
pub struct FrameArchive {
    handle: ArchiveHandle,
    /// Indexed by stream id; `None` for ids that were not selected
    backbuffers: Box<[Option<FrameBuffer>]>,
    flushed: bool,
}

impl FrameArchive {
    /// Create an archive for the given configuration
    pub fn new(config: ArchiveConfig) -> Result<Self, ArchiveError> {
        config.validate()?;

        let shared = Arc::new(ArchiveShared::new(config));
        let owner = Arc::downgrade(&shared);
        let backbuffers = shared
            .streams
            .iter()
            .map(|state| {
                state
                    .as_ref()
                    .map(|state| FrameBuffer::owned_by(state.profile.metadata(), owner.clone()))
            })
            .collect();

        tracing::info!(
            streams = shared.config.streams.len(),
            frame_capacity = shared.config.frame_capacity,
            frameset_capacity = shared.config.frameset_capacity,
            detached_capacity = shared.config.detached_capacity,
            "Frame archive created"
        );

        Ok(Self {
            handle: ArchiveHandle { shared },
            backbuffers,
            flushed: false,
        })
    }

    /// Consumer-side handle to share with other threads
    pub fn handle(&self) -> ArchiveHandle {
        self.handle.clone()
    }

    /// Start filling the backbuffer of `stream` for a new capture
    ///
    /// With `requires_memory` the payload is sized for the stream's mode,
    /// reusing a retired payload when one is large enough; the returned slice
    /// is the payload to fill. Without it the payload is left empty and the
    /// frame's data is expected to come from a continuation's lent buffer.
    pub fn alloc_frame(
        &mut self,
        stream: StreamId,
        metadata: FrameMetadata,
        requires_memory: bool,
    ) -> Result<&mut [u8], ArchiveError> {
        let shared = &self.handle.shared;
        let profile = shared.stream(stream)?.profile;
        let buffer = backbuffer_mut(&mut self.backbuffers, stream)?;

        let metadata = FrameMetadata { stream, ..metadata };
        buffer.begin_fill(metadata, Arc::downgrade(shared));

        let payload = buffer.payload_mut();
        payload.clear();
        if requires_memory {
            let size = profile.frame_size();
            if payload.capacity() < size {
                if let Some(recycled) = shared.freelist.take(size, metadata.timestamp) {
                    *payload = recycled;
                }
            } else {
                shared.freelist.expire(metadata.timestamp);
            }
            payload.resize(size, 0);
        } else {
            shared.freelist.expire(metadata.timestamp);
        }

        Ok(&mut payload[..])
    }

    /// Backbuffer of `stream`, for metadata updates while filling
    pub fn backbuffer(&mut self, stream: StreamId) -> Result<&mut FrameBuffer, ArchiveError> {
        backbuffer_mut(&mut self.backbuffers, stream)
    }

    /// Attach the release notification for the capture being filled
    pub fn attach_continuation(
        &mut self,
        stream: StreamId,
        continuation: FrameContinuation,
    ) -> Result<(), ArchiveError> {
        backbuffer_mut(&mut self.backbuffers, stream)?.attach_continuation(continuation);
        Ok(())
    }

    /// Publish the backbuffer of `stream`
    ///
    /// The returned handle holds the system reference. On a frame-drop error
    /// the capture's continuation fires right away, releasing any lent
    /// transport data with it. The backbuffer keeps its payload and storage,
    /// to be overwritten by the next capture or published again.
    pub fn publish_frame(&mut self, stream: StreamId) -> Result<FrameHandle, ArchiveError> {
        let shared = &self.handle.shared;
        let entry = self
            .backbuffers
            .get_mut(stream.index())
            .ok_or(ArchiveError::UnknownStream(stream))?;
        let Some(buffer) = entry.take() else {
            return Err(ArchiveError::UnknownStream(stream));
        };
        let metadata = *buffer.metadata();

        match shared.publish(buffer) {
            Ok(handle) => {
                *entry = Some(FrameBuffer::owned_by(metadata, Arc::downgrade(shared)));
                Ok(handle)
            }
            Err((err, mut buffer)) => {
                buffer.release_continuation();
                if err.is_frame_drop() {
                    tracing::warn!(
                        stream = %stream,
                        frame_number = metadata.frame_number,
                        error = %err,
                        "Frame dropped"
                    );
                }
                *entry = Some(buffer);
                Err(err)
            }
        }
    }

    /// Publish the backbuffer of `stream` into `set`'s slot for that stream
    ///
    /// The backbuffer is consumed either way; on failure the capture is
    /// dropped and its continuation fires.
    pub fn place_frame(
        &mut self,
        set: &mut FrameSet,
        stream: StreamId,
    ) -> Result<(), ArchiveError> {
        let entry = self
            .backbuffers
            .get_mut(stream.index())
            .ok_or(ArchiveError::UnknownStream(stream))?;
        let Some(buffer) = entry.take() else {
            return Err(ArchiveError::UnknownStream(stream));
        };
        *entry = Some(FrameBuffer::owned_by(*buffer.metadata(), buffer.owner().clone()));

        set.place_frame(stream, buffer)
    }

    pub fn track_frame(&self, stream: StreamId) -> FrameHandle {
        self.handle.track_frame(stream)
    }

    pub fn clone_frame(&self, frame: &FrameHandle) -> Result<DetachedFrame, ArchiveError> {
        self.handle.clone_frame(frame)
    }

    pub fn detach_frame_ref(
        &self,
        set: &mut FrameSet,
        stream: StreamId,
    ) -> Result<DetachedFrame, ArchiveError> {
        self.handle.detach_frame_ref(set, stream)
    }

    pub fn release_frame_ref(&self, frame: DetachedFrame) {
        self.handle.release_frame_ref(frame);
    }

    pub fn alloc_frameset(&self) -> Result<PooledFrameSet, ArchiveError> {
        self.handle.alloc_frameset()
    }

    pub fn clone_frameset(&self, set: &FrameSet) -> Result<PooledFrameSet, ArchiveError> {
        self.handle.clone_frameset(set)
    }

    pub fn profile(&self, stream: StreamId) -> Option<&StreamProfile> {
        self.handle.profile(stream)
    }

    pub fn stats(&self) -> ArchiveStats {
        self.handle.stats()
    }

    /// Session teardown
    ///
    /// Disables continuations first, stops all three pools, then drops the
    /// backbuffers, the freelist and the latest-frame pointers. Handles still
    /// held by consumers stay readable, but their release no longer calls
    /// back into the backend. Idempotent.
    pub fn flush(&mut self) {
        if self.flushed {
            return;
        }
        self.flushed = true;

        let shared = &self.handle.shared;
        shared.continuations_enabled.store(false, Ordering::Release);
        shared.frames.stop_allocation();
        shared.framesets.stop_allocation();
        shared.detached.stop_allocation();

        for buffer in self.backbuffers.iter_mut().flatten() {
            if buffer.disarm() {
                shared.metrics.record_continuation_suppressed();
            }
            *buffer.payload_mut() = BytesMut::new();
        }
        for state in shared.streams.iter().flatten() {
            *state.latest.lock() = Weak::new();
        }
        shared.freelist.clear();

        tracing::info!(
            outstanding_frames = shared.frames.in_use(),
            outstanding_framesets = shared.framesets.in_use(),
            outstanding_detached = shared.detached.in_use(),
            "Frame archive flushed"
        );
    }
}

impl Drop for FrameArchive {
    fn drop(&mut self) {
        self.flush();
    }
}

impl std::fmt::Debug for FrameArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameArchive")
            .field("handle", &self.handle)
            .field("flushed", &self.flushed)
            .finish()
    }
}

fn backbuffer_mut(
    backbuffers: &mut [Option<FrameBuffer>],
    stream: StreamId,
) -> Result<&mut FrameBuffer, ArchiveError> {
    backbuffers
        .get_mut(stream.index())
        .and_then(Option::as_mut)
        .ok_or(ArchiveError::UnknownStream(stream))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::frame::{MetadataKey, PixelFormat};

    fn config(frame_capacity: usize) -> ArchiveConfig {
        ArchiveConfig::with_streams([
            StreamProfile::new(StreamId::DEPTH, PixelFormat::Z16, 4, 2, 30),
            StreamProfile::new(StreamId::COLOR, PixelFormat::Rgb8, 2, 2, 30),
        ])
        .frame_capacity(frame_capacity)
    }

    fn archive(frame_capacity: usize) -> FrameArchive {
        FrameArchive::new(config(frame_capacity)).unwrap()
    }

    fn fill(archive: &mut FrameArchive, stream: StreamId, frame_number: u64) {
        let metadata = archive
            .profile(stream)
            .unwrap()
            .metadata()
            .with_frame_number(frame_number)
            .with_timestamp(frame_number as f64 * 33.0);
        let data = archive.alloc_frame(stream, metadata, true).unwrap();
        data.fill(frame_number as u8);
    }

    fn capture(
        archive: &mut FrameArchive,
        stream: StreamId,
        frame_number: u64,
    ) -> Result<FrameHandle, ArchiveError> {
        fill(archive, stream, frame_number);
        archive.publish_frame(stream)
    }

    fn counting_continuation(counter: &Arc<AtomicUsize>) -> FrameContinuation {
        let counter = Arc::clone(counter);
        FrameContinuation::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = FrameArchive::new(ArchiveConfig::default());
        assert!(matches!(result, Err(ArchiveError::InvalidConfig(_))));
    }

    #[test]
    fn test_alloc_frame_sizes_payload() {
        let mut archive = archive(4);
        let metadata = FrameMetadata::new(StreamId::DEPTH, PixelFormat::Z16, 4, 2);

        let data = archive.alloc_frame(StreamId::DEPTH, metadata, true).unwrap();
        assert_eq!(data.len(), 16);

        let data = archive.alloc_frame(StreamId::COLOR, metadata, true).unwrap();
        assert_eq!(data.len(), 12);
        // The stream id comes from the call, not the metadata
        assert_eq!(
            archive.backbuffer(StreamId::COLOR).unwrap().stream(),
            StreamId::COLOR
        );
    }

    #[test]
    fn test_alloc_unknown_stream() {
        let mut archive = archive(4);
        let metadata = FrameMetadata::new(StreamId::FISHEYE, PixelFormat::Raw8, 1, 1);

        let err = archive
            .alloc_frame(StreamId::FISHEYE, metadata, true)
            .unwrap_err();
        assert!(matches!(err, ArchiveError::UnknownStream(StreamId::FISHEYE)));
        assert!(archive.publish_frame(StreamId::FISHEYE).is_err());
        assert!(archive.track_frame(StreamId::FISHEYE).is_null());
    }

    #[test]
    fn test_publish_and_track() {
        let mut archive = archive(4);
        let handle = capture(&mut archive, StreamId::DEPTH, 5).unwrap();

        assert_eq!(handle.ref_count(), 1);
        assert_eq!(handle.frame_number(), 5);
        assert_eq!(handle.stream(), Some(StreamId::DEPTH));
        assert_eq!(handle.format(), Some(PixelFormat::Z16));
        assert_eq!(handle.width(), 4);
        assert_eq!(handle.height(), 2);
        assert_eq!(handle.stride(), 8);
        assert_eq!(handle.bits_per_pixel(), 16);
        assert_eq!(handle.fps(), 30);
        assert_eq!(handle.timestamp(), 165.0);
        assert_eq!(handle.data(), &[5u8; 16]);

        let tracked = archive.track_frame(StreamId::DEPTH);
        assert!(tracked.ptr_eq(&handle));
        assert_eq!(handle.ref_count(), 2);

        drop(tracked);
        assert_eq!(handle.ref_count(), 1);
        assert!(archive.track_frame(StreamId::COLOR).is_null());
    }

    #[test]
    fn test_track_after_release_is_null() {
        let mut archive = archive(4);
        let handle = capture(&mut archive, StreamId::DEPTH, 1).unwrap();
        drop(handle);

        assert!(archive.track_frame(StreamId::DEPTH).is_null());
        assert_eq!(archive.stats().frames.in_use, 0);
    }

    #[test]
    fn test_publish_exhaustion_keeps_backbuffer() {
        let mut archive = archive(1);
        let first = capture(&mut archive, StreamId::DEPTH, 1).unwrap();

        let err = capture(&mut archive, StreamId::DEPTH, 2).unwrap_err();
        assert!(err.is_pool_exhausted());
        assert_eq!(archive.stats().drops_pool_exhausted, 1);

        // The backbuffer still holds capture #2
        assert_eq!(
            archive.backbuffer(StreamId::DEPTH).unwrap().metadata().frame_number,
            2
        );

        drop(first);
        let retried = archive.publish_frame(StreamId::DEPTH).unwrap();
        assert_eq!(retried.frame_number(), 2);
        assert_eq!(retried.data(), &[2u8; 16]);
    }

    #[test]
    fn test_continuation_fires_on_last_release() {
        let mut archive = archive(4);
        let fired = Arc::new(AtomicUsize::new(0));

        fill(&mut archive, StreamId::DEPTH, 1);
        archive
            .attach_continuation(StreamId::DEPTH, counting_continuation(&fired))
            .unwrap();
        let system = archive.publish_frame(StreamId::DEPTH).unwrap();
        let consumer = system.acquire();

        drop(system);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(consumer);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(archive.stats().continuations_fired, 1);
    }

    #[test]
    fn test_failed_publish_fires_continuation() {
        let mut archive = archive(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let _held = capture(&mut archive, StreamId::DEPTH, 1).unwrap();

        fill(&mut archive, StreamId::DEPTH, 2);
        archive
            .attach_continuation(StreamId::DEPTH, counting_continuation(&fired))
            .unwrap();
        assert!(archive.publish_frame(StreamId::DEPTH).is_err());

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!archive.backbuffer(StreamId::DEPTH).unwrap().has_continuation());
    }

    #[test]
    fn test_retry_after_failed_publish_drops_lent_data() {
        let mut archive = archive(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let held = capture(&mut archive, StreamId::DEPTH, 1).unwrap();

        let metadata = archive
            .profile(StreamId::DEPTH)
            .unwrap()
            .metadata()
            .with_frame_number(2);
        archive.alloc_frame(StreamId::DEPTH, metadata, false).unwrap();
        let counter = Arc::clone(&fired);
        archive
            .attach_continuation(
                StreamId::DEPTH,
                FrameContinuation::with_data(Bytes::from_static(b"transport"), move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        assert!(archive.publish_frame(StreamId::DEPTH).is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(archive.backbuffer(StreamId::DEPTH).unwrap().data().is_empty());

        drop(held);
        let retried = archive.publish_frame(StreamId::DEPTH).unwrap();
        assert_eq!(retried.frame_number(), 2);
        assert!(retried.data().is_empty());
        assert!(!retried.has_continuation());

        drop(retried);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_continuation_fired_on_realloc() {
        let mut archive = archive(4);
        let fired = Arc::new(AtomicUsize::new(0));

        fill(&mut archive, StreamId::DEPTH, 1);
        archive
            .attach_continuation(StreamId::DEPTH, counting_continuation(&fired))
            .unwrap();

        // Capture #1 is abandoned before publishing
        fill(&mut archive, StreamId::DEPTH, 2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_continuation_panic_is_contained() {
        let mut archive = archive(4);
        fill(&mut archive, StreamId::DEPTH, 1);
        archive
            .attach_continuation(
                StreamId::DEPTH,
                FrameContinuation::new(|| panic!("backend gone")),
            )
            .unwrap();

        let handle = archive.publish_frame(StreamId::DEPTH).unwrap();
        drop(handle);

        let stats = archive.stats();
        assert_eq!(stats.continuations_failed, 1);
        assert_eq!(stats.continuations_fired, 0);
        assert_eq!(stats.frames.in_use, 0);
    }

    #[test]
    fn test_disable_continuation() {
        let mut archive = archive(4);
        let fired = Arc::new(AtomicUsize::new(0));

        fill(&mut archive, StreamId::DEPTH, 1);
        archive
            .attach_continuation(StreamId::DEPTH, counting_continuation(&fired))
            .unwrap();
        let handle = archive.publish_frame(StreamId::DEPTH).unwrap();

        assert!(handle.has_continuation());
        assert!(handle.disable_continuation());
        drop(handle);

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stream_quota() {
        let mut archive =
            FrameArchive::new(config(8).max_frames_per_stream(1)).unwrap();

        let _first = capture(&mut archive, StreamId::DEPTH, 1).unwrap();
        let err = capture(&mut archive, StreamId::DEPTH, 2).unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::StreamQueueFull {
                stream: StreamId::DEPTH,
                limit: 1
            }
        ));
        assert!(err.is_frame_drop());

        // Other streams have their own quota
        assert!(capture(&mut archive, StreamId::COLOR, 1).is_ok());

        archive.handle().set_max_frames_per_stream(0);
        assert!(archive.publish_frame(StreamId::DEPTH).is_ok());
        assert_eq!(archive.stats().drops_queue_full, 1);
    }

    #[test]
    fn test_freelist_reuses_payload() {
        let mut archive = archive(4);
        let handle = capture(&mut archive, StreamId::DEPTH, 1).unwrap();
        drop(handle);
        assert_eq!(archive.stats().freelist_len, 1);

        fill(&mut archive, StreamId::DEPTH, 2);
        assert_eq!(archive.stats().freelist_len, 0);
    }

    #[test]
    fn test_lent_continuation_data() {
        let mut archive = archive(4);
        let metadata = archive.profile(StreamId::COLOR).unwrap().metadata();

        let data = archive.alloc_frame(StreamId::COLOR, metadata, false).unwrap();
        assert!(data.is_empty());
        archive
            .attach_continuation(
                StreamId::COLOR,
                FrameContinuation::with_data(Bytes::from_static(b"transport"), || {}),
            )
            .unwrap();

        let handle = archive.publish_frame(StreamId::COLOR).unwrap();
        assert_eq!(handle.data(), b"transport");

        handle.disable_continuation();
        assert_eq!(handle.data(), b"transport");
    }

    #[test]
    fn test_backbuffer_setters() {
        let mut archive = archive(4);
        fill(&mut archive, StreamId::DEPTH, 1);

        let buffer = archive.backbuffer(StreamId::DEPTH).unwrap();
        buffer.set_frame_number(77);
        buffer.set_metadata_value(MetadataKey::ActualExposure, 8.5);

        let handle = archive.publish_frame(StreamId::DEPTH).unwrap();
        assert_eq!(handle.frame_number(), 77);
        assert!(handle.supports_metadata(MetadataKey::ActualExposure));
        assert_eq!(handle.metadata_value(MetadataKey::ActualExposure), Some(8.5));
        assert!(!handle.supports_metadata(MetadataKey::ActualFps));
    }

    #[test]
    fn test_flush_suppresses_continuations() {
        let mut archive = archive(4);
        let fired = Arc::new(AtomicUsize::new(0));

        fill(&mut archive, StreamId::DEPTH, 1);
        archive
            .attach_continuation(StreamId::DEPTH, counting_continuation(&fired))
            .unwrap();
        let outstanding = archive.publish_frame(StreamId::DEPTH).unwrap();

        fill(&mut archive, StreamId::DEPTH, 2);
        archive
            .attach_continuation(StreamId::DEPTH, counting_continuation(&fired))
            .unwrap();

        let handle = archive.handle();
        archive.flush();
        assert!(handle.is_flushed());

        // Still readable, but releasing no longer calls back
        assert_eq!(outstanding.frame_number(), 1);
        drop(outstanding);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let stats = handle.stats();
        assert_eq!(stats.continuations_suppressed, 2);
        assert_eq!(stats.frames.in_use, 0);
        assert_eq!(stats.freelist_len, 0);
    }

    #[test]
    fn test_publish_after_flush_stopped() {
        let mut archive = archive(4);
        archive.flush();
        archive.flush();

        let err = capture(&mut archive, StreamId::DEPTH, 1).unwrap_err();
        assert!(matches!(err, ArchiveError::Pool(PoolError::Stopped { .. })));
        assert!(!err.is_frame_drop());
        assert!(archive.alloc_frameset().is_err());
    }

    #[test]
    fn test_detached_pool_bound() {
        let mut archive = FrameArchive::new(config(4).detached_capacity(1)).unwrap();
        let handle = capture(&mut archive, StreamId::DEPTH, 1).unwrap();

        let detached = archive.clone_frame(&handle).unwrap();
        assert_eq!(handle.ref_count(), 2);
        assert!(detached.ptr_eq(&handle));

        let err = archive.clone_frame(&handle).unwrap_err();
        assert!(err.is_pool_exhausted());
        assert_eq!(handle.ref_count(), 2);

        archive.release_frame_ref(detached);
        assert_eq!(handle.ref_count(), 1);
        assert!(archive.clone_frame(&handle).is_ok());
    }

    #[test]
    fn test_detached_raw_round_trip() {
        let mut archive = archive(4);
        let handle = capture(&mut archive, StreamId::DEPTH, 3).unwrap();
        let detached = archive.handle().detach_frame(handle).unwrap();

        let raw = detached.into_raw();
        let borrowed = unsafe { DetachedFrame::borrow_raw(raw) };
        assert_eq!(borrowed.frame_number(), 3);
        assert_eq!(archive.stats().detached_refs.in_use, 1);

        let reclaimed = unsafe { DetachedFrame::from_raw(raw) };
        let plain = reclaimed.into_handle();
        assert_eq!(archive.stats().detached_refs.in_use, 0);
        assert_eq!(plain.ref_count(), 1);
    }

    #[test]
    fn test_place_frame_into_set() {
        let mut archive = archive(4);
        let mut set = archive.alloc_frameset().unwrap();
        assert_eq!(set.stream_count(), 2);

        fill(&mut archive, StreamId::COLOR, 9);
        archive.place_frame(&mut set, StreamId::COLOR).unwrap();
        assert_eq!(set.frame(StreamId::COLOR).unwrap().frame_number(), 9);

        // Replacing a slot releases the previous frame
        fill(&mut archive, StreamId::COLOR, 10);
        archive.place_frame(&mut set, StreamId::COLOR).unwrap();
        assert_eq!(set.frame(StreamId::COLOR).unwrap().frame_number(), 10);
        assert_eq!(archive.stats().frames.in_use, 1);

        let detached = archive.detach_frame_ref(&mut set, StreamId::COLOR).unwrap();
        assert_eq!(detached.frame_number(), 10);
        assert!(set.frame(StreamId::COLOR).is_none());
    }

    #[test]
    fn test_clone_frameset_independent() {
        let mut archive = archive(4);
        let mut set = archive.alloc_frameset().unwrap();
        let depth = capture(&mut archive, StreamId::DEPTH, 1).unwrap();
        set.place_handle(StreamId::DEPTH, depth.acquire()).unwrap();

        let clone = archive.clone_frameset(&set).unwrap();
        assert_eq!(depth.ref_count(), 3);
        assert_eq!(archive.stats().framesets.in_use, 2);

        drop(set);
        assert_eq!(depth.ref_count(), 2);
        assert_eq!(clone.frame(StreamId::DEPTH).unwrap().frame_number(), 1);

        drop(clone);
        assert_eq!(depth.ref_count(), 1);
        assert_eq!(archive.stats().framesets.in_use, 0);
    }

    #[test]
    fn test_place_handle_wrong_stream() {
        let mut archive = archive(4);
        let mut set = archive.alloc_frameset().unwrap();
        let depth = capture(&mut archive, StreamId::DEPTH, 1).unwrap();

        let err = set.place_handle(StreamId::COLOR, depth).unwrap_err();
        assert!(matches!(err, ArchiveError::StreamMismatch { .. }));
    }

    #[test]
    fn test_slow_callback_logged() {
        let mut archive = archive(4);
        let handle = capture(&mut archive, StreamId::DEPTH, 1).unwrap();

        // 30 fps leaves 1000 / 31 = 32ms per callback
        handle.mark_callback_start();
        std::thread::sleep(Duration::from_millis(50));
        drop(handle);

        assert_eq!(archive.stats().slow_callbacks, 1);
    }

    #[test]
    fn test_stats_per_stream() {
        let mut archive = archive(4);
        let _a = capture(&mut archive, StreamId::DEPTH, 1).unwrap();
        let _b = capture(&mut archive, StreamId::DEPTH, 2).unwrap();
        let _c = capture(&mut archive, StreamId::COLOR, 1).unwrap();

        let stats = archive.stats();
        assert_eq!(stats.frames_published, 3);
        assert_eq!(stats.outstanding_frames(), 3);
        assert_eq!(stats.published_for(StreamId::DEPTH), 2);
        assert_eq!(stats.published_for(StreamId::COLOR), 1);
        assert_eq!(stats.frames.in_use, 3);
        assert_eq!(stats.frames.high_water, 3);
    }
}
