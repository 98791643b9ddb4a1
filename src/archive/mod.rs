//! Frame archive: bounded storage and lifecycle of captured frames
//!
//! The archive owns one backbuffer per enabled stream and three bounded
//! pools. The capture thread fills a backbuffer and publishes it; consumers
//! hold [`FrameHandle`](crate::frame::FrameHandle)s and the last release
//! returns the frame's slot and fires its continuation.
//!
//! # Architecture
//!
//! ```text
//!     [Capture thread]                         Arc<ArchiveShared>
//!     FrameArchive                       ┌─────────────────────────────┐
//!     ┌──────────────────┐               │ frames:    Pool<Published>  │
//!     │ backbuffers[]    │──publish────► │ framesets: Pool<FrameSet>   │
//!     │  alloc_frame()   │               │ detached:  Pool<FrameHandle>│
//!     │  publish_frame() │               │ freelist   (payload reuse)  │
//!     │  flush()         │               │ streams[]  (quota, latest)  │
//!     └──────────────────┘               └──────────────┬──────────────┘
//!                                                       │
//!              ┌────────────────────────────────────────┼──────────────┐
//!              │                                        │              │
//!              ▼                                        ▼              ▼
//!        ArchiveHandle                             FrameHandle    DetachedFrame
//!        track_frame()                             acquire()      into_raw()
//!        clone_frameset()                          drop ──► continuation fires,
//!                                                           slot returned
//! ```
//!
//! # Bounded memory
//!
//! Every pool has a fixed capacity. Publishing into a full frame pool fails
//! with a frame-drop error instead of blocking or growing; a slow consumer
//! therefore costs the producer frames, never memory.

pub mod config;
pub mod error;
pub mod freelist;
pub mod store;

pub use config::{ArchiveConfig, StreamProfile};
pub use error::ArchiveError;
pub use freelist::Freelist;
pub use store::{ArchiveHandle, FrameArchive};
