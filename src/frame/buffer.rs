//! Capture buffers
//!
//! A [`FrameBuffer`] is the producer-exclusive backbuffer of one stream: it is
//! filled in place, then published into the archive's frame pool where it
//! becomes an immutable, reference-counted `PublishedFrame` reachable through
//! [`FrameHandle`]s. When the last handle goes away the frame's continuation
//! fires once and its payload storage is recycled.
//!
//! ```text
//!   Free ──alloc_frame──► Filling ──publish──► Published ──last release──► Free
//!                        (FrameBuffer)        (Arc<Pooled<PublishedFrame>>)
//! ```

use std::fmt;
use std::mem;
use std::sync::{OnceLock, Weak};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::archive::store::ArchiveShared;
use crate::archive::ArchiveError;

use super::handle::FrameHandle;
use super::metadata::{FrameMetadata, MetadataKey, StreamId, TimestampDomain};

pub(crate) type ReleaseCallback = Box<dyn FnOnce() + Send + 'static>;

/// One-shot notification fired when a capture is no longer referenced
///
/// Tells the backend that the raw transport buffer behind a frame may be
/// reused. It can also carry that transport buffer, in which case the frame
/// exposes it as its data instead of an archive-owned payload.
#[derive(Default)]
pub struct FrameContinuation {
    callback: Option<ReleaseCallback>,
    data: Option<Bytes>,
}

impl FrameContinuation {
    /// Continuation that only notifies
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            callback: Some(Box::new(callback)),
            data: None,
        }
    }

    /// Continuation that also lends the transport buffer as frame data
    pub fn with_data<F>(data: Bytes, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            callback: Some(Box::new(callback)),
            data: Some(data),
        }
    }

    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    /// Whether the callback is still pending
    pub fn is_armed(&self) -> bool {
        self.callback.is_some()
    }

    pub(crate) fn into_parts(self) -> (Option<ReleaseCallback>, Option<Bytes>) {
        (self.callback, self.data)
    }
}

impl fmt::Debug for FrameContinuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameContinuation")
            .field("armed", &self.is_armed())
            .field("data_len", &self.data.as_ref().map(Bytes::len))
            .finish()
    }
}

/// Producer-exclusive staging buffer for one stream
///
/// Move-only. Metadata setters are meant for the Filling state only; once the
/// buffer is published its contents are immutable. Dropping a buffer that
/// still holds an armed continuation fires it, since nothing references the
/// capture anymore.
pub struct FrameBuffer {
    payload: BytesMut,
    metadata: FrameMetadata,
    continuation: FrameContinuation,
    owner: Weak<ArchiveShared>,
}

impl FrameBuffer {
    /// Standalone buffer with no owning archive
    ///
    /// Such a buffer cannot be published, and a continuation attached to it is
    /// discarded without firing.
    pub fn new(metadata: FrameMetadata) -> Self {
        Self::owned_by(metadata, Weak::new())
    }

    pub(crate) fn owned_by(metadata: FrameMetadata, owner: Weak<ArchiveShared>) -> Self {
        Self {
            payload: BytesMut::new(),
            metadata,
            continuation: FrameContinuation::default(),
            owner,
        }
    }

    pub fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    pub fn stream(&self) -> StreamId {
        self.metadata.stream
    }

    /// Frame bytes: the continuation's transport buffer if one was lent,
    /// otherwise the archive-owned payload
    pub fn data(&self) -> &[u8] {
        match self.continuation.data() {
            Some(data) => &data[..],
            None => &self.payload[..],
        }
    }

    /// Archive-owned payload, writable while filling
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    pub fn set_timestamp(&mut self, timestamp: f64) {
        self.metadata.timestamp = timestamp;
    }

    pub fn set_timestamp_domain(&mut self, domain: TimestampDomain) {
        self.metadata.timestamp_domain = domain;
    }

    pub fn set_system_time(&mut self, system_time: i64) {
        self.metadata.system_time = system_time;
    }

    pub fn set_frame_number(&mut self, frame_number: u64) {
        self.metadata.frame_number = frame_number;
    }

    pub fn set_metadata_value(&mut self, key: MetadataKey, value: f64) {
        self.metadata.set_value(key, value);
    }

    /// Attach the continuation for the capture being filled
    ///
    /// A continuation still pending from an earlier, unpublished capture is
    /// fired first.
    pub fn attach_continuation(&mut self, continuation: FrameContinuation) {
        self.release_continuation();
        self.continuation = continuation;
    }

    pub fn has_continuation(&self) -> bool {
        self.continuation.is_armed()
    }

    /// Publish into the owning archive's frame pool
    ///
    /// On failure the capture is dropped, which fires its continuation.
    pub fn publish(self) -> Result<FrameHandle, ArchiveError> {
        let Some(owner) = self.owner.upgrade() else {
            return Err(ArchiveError::Detached(self.stream()));
        };
        owner.publish(self).map_err(|(err, _dropped)| err)
    }

    /// Prepare for a new capture: fire any stale continuation and reset metadata
    pub(crate) fn begin_fill(&mut self, metadata: FrameMetadata, owner: Weak<ArchiveShared>) {
        self.release_continuation();
        self.continuation = FrameContinuation::default();
        self.metadata = metadata;
        self.owner = owner;
    }

    pub(crate) fn payload_mut(&mut self) -> &mut BytesMut {
        &mut self.payload
    }

    pub(crate) fn owner(&self) -> &Weak<ArchiveShared> {
        &self.owner
    }

    /// Move contents out, leaving an empty buffer behind
    pub(crate) fn take_parts(&mut self) -> (BytesMut, FrameMetadata, FrameContinuation) {
        (
            mem::take(&mut self.payload),
            self.metadata,
            mem::take(&mut self.continuation),
        )
    }

    /// Drop the pending callback, and any lent data, without running it
    pub(crate) fn disarm(&mut self) -> bool {
        let (callback, _lent) = mem::take(&mut self.continuation).into_parts();
        callback.is_some()
    }

    /// Run the pending callback, if any, under the owner's policy
    ///
    /// Lent data goes with the callback: once the backend has been told its
    /// transport buffer is free, this buffer must not expose it any more.
    pub(crate) fn release_continuation(&mut self) {
        let (callback, lent) = mem::take(&mut self.continuation).into_parts();
        drop(lent);
        let Some(callback) = callback else {
            return;
        };
        match self.owner.upgrade() {
            Some(owner) => owner.run_continuation(&self.metadata, callback),
            None => tracing::trace!(
                stream = %self.metadata.stream,
                frame_number = self.metadata.frame_number,
                "Continuation discarded, no owning archive"
            ),
        }
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        self.release_continuation();
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("stream", &self.metadata.stream)
            .field("frame_number", &self.metadata.frame_number)
            .field("payload_len", &self.payload.len())
            .field("continuation", &self.continuation)
            .finish()
    }
}

/// A published, immutable frame
///
/// Lives inside `Arc<Pooled<PublishedFrame>>`: the `Arc` strong count is the
/// frame's reference count, and the pool slot is returned only after this
/// value's `Drop` has run the continuation.
pub(crate) struct PublishedFrame {
    payload: BytesMut,
    external: Option<Bytes>,
    metadata: FrameMetadata,
    on_release: Mutex<Option<ReleaseCallback>>,
    callback_started: OnceLock<Instant>,
    owner: Weak<ArchiveShared>,
}

impl PublishedFrame {
    pub(crate) fn new(
        payload: BytesMut,
        metadata: FrameMetadata,
        continuation: FrameContinuation,
        owner: Weak<ArchiveShared>,
    ) -> Self {
        let (callback, external) = continuation.into_parts();
        Self {
            payload,
            external,
            metadata,
            on_release: Mutex::new(callback),
            callback_started: OnceLock::new(),
            owner,
        }
    }

    pub(crate) fn data(&self) -> &[u8] {
        match &self.external {
            Some(data) => &data[..],
            None => &self.payload[..],
        }
    }

    pub(crate) fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    pub(crate) fn disable_continuation(&self) -> bool {
        self.on_release.lock().take().is_some()
    }

    pub(crate) fn has_continuation(&self) -> bool {
        self.on_release.lock().is_some()
    }

    pub(crate) fn mark_callback_start(&self) -> bool {
        self.callback_started.set(Instant::now()).is_ok()
    }

    pub(crate) fn callback_started(&self) -> Option<Instant> {
        self.callback_started.get().copied()
    }

    pub(crate) fn take_callback(&mut self) -> Option<ReleaseCallback> {
        self.on_release.get_mut().take()
    }

    pub(crate) fn take_payload(&mut self) -> BytesMut {
        mem::take(&mut self.payload)
    }
}

impl Drop for PublishedFrame {
    fn drop(&mut self) {
        // Without a live archive the callback is dropped unrun, as after flush
        if let Some(owner) = self.owner.upgrade() {
            owner.unpublish(self);
        }
    }
}
