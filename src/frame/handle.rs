//! Reference-counted frame handles
//!
//! [`FrameHandle`] is the consumer-facing reference to a published frame.
//! Cloning acquires a reference, dropping releases it, and moving leaves the
//! count untouched. The last release fires the frame's continuation and
//! returns its slot to the archive's frame pool.
//!
//! [`DetachedFrame`] is a handle that additionally occupies a slot of the
//! archive's detached-ref pool, so handles handed across an external API
//! boundary are capacity-bounded too. It converts to and from an opaque raw
//! pointer for C-style callers.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::pool::Pooled;

use super::buffer::PublishedFrame;
use super::metadata::{FrameMetadata, MetadataKey, PixelFormat, StreamId, TimestampDomain};

pub(crate) type SharedFrame = Arc<Pooled<PublishedFrame>>;

/// Reference to a published frame, or null
///
/// A null handle (the default) is always valid; its accessors return empty or
/// zero values.
#[derive(Default, Clone)]
pub struct FrameHandle {
    frame: Option<SharedFrame>,
}

impl FrameHandle {
    /// Handle that owns no frame
    pub fn null() -> Self {
        Self::default()
    }

    /// Take over an existing reference without acquiring another
    pub(crate) fn adopt(frame: SharedFrame) -> Self {
        Self { frame: Some(frame) }
    }

    pub fn is_null(&self) -> bool {
        self.frame.is_none()
    }

    /// New handle to the same frame (one more reference)
    pub fn acquire(&self) -> FrameHandle {
        self.clone()
    }

    /// Give up this reference
    pub fn release(self) {
        drop(self);
    }

    /// Number of live references to the frame; 0 for a null handle
    pub fn ref_count(&self) -> usize {
        self.frame.as_ref().map_or(0, Arc::strong_count)
    }

    /// Whether both handles reference the same frame
    pub fn ptr_eq(&self, other: &FrameHandle) -> bool {
        match (&self.frame, &other.frame) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn metadata(&self) -> Option<&FrameMetadata> {
        self.frame.as_deref().map(|frame| frame.metadata())
    }

    pub fn data(&self) -> &[u8] {
        match self.frame.as_deref() {
            Some(frame) => frame.data(),
            None => &[],
        }
    }

    pub fn stream(&self) -> Option<StreamId> {
        self.metadata().map(|meta| meta.stream)
    }

    pub fn timestamp(&self) -> f64 {
        self.metadata().map_or(0.0, |meta| meta.timestamp)
    }

    pub fn timestamp_domain(&self) -> Option<TimestampDomain> {
        self.metadata().map(|meta| meta.timestamp_domain)
    }

    pub fn frame_number(&self) -> u64 {
        self.metadata().map_or(0, |meta| meta.frame_number)
    }

    pub fn system_time(&self) -> i64 {
        self.metadata().map_or(0, |meta| meta.system_time)
    }

    pub fn width(&self) -> u32 {
        self.metadata().map_or(0, |meta| meta.width)
    }

    pub fn height(&self) -> u32 {
        self.metadata().map_or(0, |meta| meta.height)
    }

    pub fn stride(&self) -> u32 {
        self.metadata().map_or(0, |meta| meta.stride)
    }

    pub fn bits_per_pixel(&self) -> u32 {
        self.metadata().map_or(0, |meta| meta.bits_per_pixel)
    }

    pub fn format(&self) -> Option<PixelFormat> {
        self.metadata().map(|meta| meta.format)
    }

    pub fn fps(&self) -> u32 {
        self.metadata().map_or(0, |meta| meta.fps)
    }

    pub fn supports_metadata(&self, key: MetadataKey) -> bool {
        self.metadata().is_some_and(|meta| meta.supports(key))
    }

    pub fn metadata_value(&self, key: MetadataKey) -> Option<f64> {
        self.metadata().and_then(|meta| meta.value(key))
    }

    /// Suppress the producer notification for this frame
    ///
    /// For consumers that manage buffer reuse timing themselves. The frame's
    /// data stays readable. Returns whether a pending continuation was removed.
    pub fn disable_continuation(&self) -> bool {
        self.frame
            .as_deref()
            .is_some_and(|frame| frame.disable_continuation())
    }

    pub fn has_continuation(&self) -> bool {
        self.frame
            .as_deref()
            .is_some_and(|frame| frame.has_continuation())
    }

    /// Record when the frame was handed to user code
    ///
    /// Only the first call per frame counts. The archive logs slow callbacks
    /// when the frame is finally released.
    pub fn mark_callback_start(&self) {
        if let Some(frame) = self.frame.as_deref() {
            if frame.mark_callback_start() {
                tracing::trace!(
                    stream = %frame.metadata().stream,
                    frame_number = frame.metadata().frame_number,
                    "Callback started"
                );
            }
        }
    }
}

impl fmt::Debug for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.metadata() {
            Some(meta) => f
                .debug_struct("FrameHandle")
                .field("stream", &meta.stream)
                .field("frame_number", &meta.frame_number)
                .field("ref_count", &self.ref_count())
                .finish(),
            None => f.write_str("FrameHandle(null)"),
        }
    }
}

/// A frame handle checked out of the archive's detached-ref pool
pub struct DetachedFrame {
    handle: Pooled<FrameHandle>,
}

impl DetachedFrame {
    pub(crate) fn new(handle: Pooled<FrameHandle>) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &FrameHandle {
        &self.handle
    }

    /// Unwrap into a plain handle, returning the detached-ref slot
    pub fn into_handle(self) -> FrameHandle {
        self.handle.into_inner()
    }

    /// Hand ownership to an external caller as an opaque pointer
    pub fn into_raw(self) -> *mut DetachedFrame {
        Box::into_raw(Box::new(self))
    }

    /// Reclaim a pointer produced by [`into_raw`](Self::into_raw)
    ///
    /// # Safety
    ///
    /// `ptr` must come from `into_raw` and must not have been reclaimed
    /// already.
    pub unsafe fn from_raw(ptr: *mut DetachedFrame) -> DetachedFrame {
        unsafe { *Box::from_raw(ptr) }
    }

    /// Borrow the handle behind an opaque pointer without taking ownership
    ///
    /// # Safety
    ///
    /// `ptr` must come from `into_raw`, must not have been reclaimed, and must
    /// stay unreclaimed for the lifetime `'a`.
    pub unsafe fn borrow_raw<'a>(ptr: *const DetachedFrame) -> &'a FrameHandle {
        unsafe { &(*ptr).handle }
    }
}

impl Deref for DetachedFrame {
    type Target = FrameHandle;

    fn deref(&self) -> &FrameHandle {
        &self.handle
    }
}

impl fmt::Debug for DetachedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetachedFrame")
            .field("slot", &self.handle.slot_index())
            .field("handle", &*self.handle)
            .finish()
    }
}
