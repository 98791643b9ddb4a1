//! Single-stream or multi-stream capture

use super::handle::FrameHandle;
use super::metadata::StreamId;
use super::set::PooledFrameSet;

/// What a consumer receives: one stream's frame, or a synchronized frameset
#[derive(Debug)]
pub enum Capture {
    Frame(FrameHandle),
    FrameSet(PooledFrameSet),
}

impl Capture {
    pub fn is_composite(&self) -> bool {
        matches!(self, Capture::FrameSet(_))
    }

    /// Frame of `stream`, if this capture holds one
    pub fn frame(&self, stream: StreamId) -> Option<&FrameHandle> {
        match self {
            Capture::Frame(handle) if handle.stream() == Some(stream) => Some(handle),
            Capture::Frame(_) => None,
            Capture::FrameSet(set) => set.frame(stream),
        }
    }

    /// First frame in stream order
    pub fn first(&self) -> Option<&FrameHandle> {
        match self {
            Capture::Frame(handle) if !handle.is_null() => Some(handle),
            Capture::Frame(_) => None,
            Capture::FrameSet(set) => set.frames().next(),
        }
    }

    pub fn frame_count(&self) -> usize {
        match self {
            Capture::Frame(handle) => usize::from(!handle.is_null()),
            Capture::FrameSet(set) => set.frame_count(),
        }
    }

    pub fn contains(&self, stream: StreamId) -> bool {
        self.frame(stream).is_some()
    }

    /// Stream ids present, ascending
    pub fn streams(&self) -> Vec<StreamId> {
        match self {
            Capture::Frame(handle) => handle.stream().into_iter().collect(),
            Capture::FrameSet(set) => set.streams().collect(),
        }
    }

    /// Single frame, if this is not a frameset
    pub fn into_frame(self) -> Option<FrameHandle> {
        match self {
            Capture::Frame(handle) => Some(handle),
            Capture::FrameSet(_) => None,
        }
    }
}

impl From<FrameHandle> for Capture {
    fn from(handle: FrameHandle) -> Self {
        Capture::Frame(handle)
    }
}

impl From<PooledFrameSet> for Capture {
    fn from(set: PooledFrameSet) -> Self {
        Capture::FrameSet(set)
    }
}
