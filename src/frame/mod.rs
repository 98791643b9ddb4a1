//! Frames, frame handles and framesets
//!
//! This module defines the per-capture types that flow from the capture
//! thread to consumers: the producer-exclusive [`FrameBuffer`], the shared
//! [`FrameHandle`] to a published frame, and the multi-stream [`FrameSet`].

pub mod buffer;
pub mod capture;
pub mod handle;
pub mod metadata;
pub mod set;

pub use buffer::{FrameBuffer, FrameContinuation};
pub use capture::Capture;
pub use handle::{DetachedFrame, FrameHandle};
pub use metadata::{FrameMetadata, MetadataKey, PixelFormat, StreamId, TimestampDomain};
pub use set::{FrameSet, PooledFrameSet};
