//! Multi-stream framesets
//!
//! A [`FrameSet`] holds one [`FrameHandle`] slot per stream id for a single
//! synchronized capture. Slots may be empty. Archive-issued framesets live in
//! the archive's frameset pool ([`PooledFrameSet`]); a set always releases its
//! slots before its pool slot is handed back.

use std::fmt;

use crate::archive::ArchiveError;
use crate::pool::Pooled;

use super::buffer::FrameBuffer;
use super::handle::FrameHandle;
use super::metadata::StreamId;

/// A frameset occupying a slot of the archive's frameset pool
pub type PooledFrameSet = Pooled<FrameSet>;

/// One frame slot per stream for a synchronized capture
pub struct FrameSet {
    slots: Box<[FrameHandle]>,
}

impl FrameSet {
    /// Empty set with slots for stream ids `0..stream_count`
    pub fn new(stream_count: usize) -> Self {
        debug_assert!(stream_count <= usize::from(u8::MAX) + 1);
        Self {
            slots: (0..stream_count).map(|_| FrameHandle::null()).collect(),
        }
    }

    /// Number of stream slots
    pub fn stream_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots
    pub fn frame_count(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.is_null()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(FrameHandle::is_null)
    }

    /// Publish a filled backbuffer into the slot for `stream`
    ///
    /// Whatever previously occupied the slot is released. If the buffer was
    /// filled for another stream, or cannot be published, it is dropped and
    /// the slot is left untouched.
    pub fn place_frame(
        &mut self,
        stream: StreamId,
        buffer: FrameBuffer,
    ) -> Result<(), ArchiveError> {
        let index = self.slot_index(stream)?;
        if buffer.stream() != stream {
            return Err(ArchiveError::StreamMismatch {
                slot: stream,
                frame: buffer.stream(),
            });
        }

        let handle = buffer.publish()?;
        self.slots[index] = handle;
        Ok(())
    }

    /// Put an already published frame into the slot for `stream`
    ///
    /// A null handle clears the slot.
    pub fn place_handle(
        &mut self,
        stream: StreamId,
        handle: FrameHandle,
    ) -> Result<(), ArchiveError> {
        let index = self.slot_index(stream)?;
        if let Some(frame_stream) = handle.stream() {
            if frame_stream != stream {
                return Err(ArchiveError::StreamMismatch {
                    slot: stream,
                    frame: frame_stream,
                });
            }
        }

        self.slots[index] = handle;
        Ok(())
    }

    /// Handle in the slot for `stream`, if occupied
    pub fn frame(&self, stream: StreamId) -> Option<&FrameHandle> {
        self.slots
            .get(stream.index())
            .filter(|slot| !slot.is_null())
    }

    /// Remove and return the handle for `stream`, leaving the slot null
    ///
    /// Returns a null handle for empty or out-of-range slots.
    pub fn detach_ref(&mut self, stream: StreamId) -> FrameHandle {
        self.slots
            .get_mut(stream.index())
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Stream ids of occupied slots, ascending
    pub fn streams(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.frames().filter_map(FrameHandle::stream)
    }

    /// Occupied slots, in stream order
    pub fn frames(&self) -> impl Iterator<Item = &FrameHandle> + '_ {
        self.slots.iter().filter(|slot| !slot.is_null())
    }

    /// Release every slot
    pub fn cleanup(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = FrameHandle::null();
        }
    }

    /// Independent copy with a fresh reference per occupied slot
    pub(crate) fn acquire_all(&self) -> FrameSet {
        FrameSet {
            slots: self.slots.iter().map(FrameHandle::acquire).collect(),
        }
    }

    fn slot_index(&self, stream: StreamId) -> Result<usize, ArchiveError> {
        let index = stream.index();
        if index < self.slots.len() {
            Ok(index)
        } else {
            Err(ArchiveError::UnknownStream(stream))
        }
    }
}

impl Drop for FrameSet {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl fmt::Debug for FrameSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.frames()).finish()
    }
}
