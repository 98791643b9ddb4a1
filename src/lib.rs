//! Bounded, reference-counted frame lifecycle for multi-stream capture devices
//!
//! A capture thread fills per-stream backbuffers and publishes them into a
//! [`FrameArchive`]; consumers on any thread hold [`FrameHandle`]s to the
//! published frames, group them into [`FrameSet`]s, or detach them across an
//! API boundary as [`DetachedFrame`]s. When the last reference to a frame is
//! released its continuation tells the backend the transport buffer is free,
//! and its storage returns to a bounded pool.
//!
//! # Example
//!
//! ```no_run
//! use frame_archive::{ArchiveConfig, FrameArchive, PixelFormat, StreamId, StreamProfile};
//!
//! let config = ArchiveConfig::with_streams([StreamProfile::new(
//!     StreamId::DEPTH,
//!     PixelFormat::Z16,
//!     640,
//!     480,
//!     30,
//! )]);
//! let mut archive = FrameArchive::new(config)?;
//!
//! let metadata = archive.profile(StreamId::DEPTH).unwrap().metadata();
//! let data = archive.alloc_frame(StreamId::DEPTH, metadata, true)?;
//! data.fill(0);
//!
//! let frame = archive.publish_frame(StreamId::DEPTH)?;
//! assert_eq!(frame.ref_count(), 1);
//! # Ok::<(), frame_archive::ArchiveError>(())
//! ```

pub mod archive;
pub mod dispatch;
pub mod frame;
pub mod pool;
pub mod stats;

pub use archive::{ArchiveConfig, ArchiveError, ArchiveHandle, FrameArchive, StreamProfile};
pub use dispatch::{DispatchStats, FrameDispatcher, FrameSubscription};
pub use frame::{
    Capture, DetachedFrame, FrameBuffer, FrameContinuation, FrameHandle, FrameMetadata, FrameSet,
    MetadataKey, PixelFormat, PooledFrameSet, StreamId, TimestampDomain,
};
pub use pool::{PoolError, PoolKind, PoolStats};
pub use stats::ArchiveStats;
