//! Archive error types

use crate::frame::StreamId;
use crate::pool::PoolError;

/// Error type for archive operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ArchiveError {
    /// A pool had no free slot, or was stopped by flush
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The stream already holds its quota of published frames
    #[error("stream {stream} already holds {limit} published frames")]
    StreamQueueFull { stream: StreamId, limit: usize },

    /// The stream was not selected when the archive was created
    #[error("stream {0} is not enabled")]
    UnknownStream(StreamId),

    /// A frame was placed in another stream's slot
    #[error("frame of stream {frame} placed in slot for stream {slot}")]
    StreamMismatch { slot: StreamId, frame: StreamId },

    /// The buffer has no live owning archive
    #[error("buffer for stream {0} has no owning archive")]
    Detached(StreamId),

    /// Invalid archive configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ArchiveError {
    /// Whether the error means "drop this capture" rather than a bug
    pub fn is_frame_drop(&self) -> bool {
        matches!(
            self,
            ArchiveError::Pool(PoolError::Exhausted { .. }) | ArchiveError::StreamQueueFull { .. }
        )
    }

    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, ArchiveError::Pool(PoolError::Exhausted { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolKind;

    #[test]
    fn test_frame_drop_classification() {
        let exhausted = ArchiveError::from(PoolError::Exhausted {
            pool: PoolKind::Frames,
            capacity: 4,
        });
        assert!(exhausted.is_frame_drop());
        assert!(exhausted.is_pool_exhausted());

        let full = ArchiveError::StreamQueueFull {
            stream: StreamId::DEPTH,
            limit: 2,
        };
        assert!(full.is_frame_drop());
        assert!(!full.is_pool_exhausted());

        let stopped = ArchiveError::from(PoolError::Stopped {
            pool: PoolKind::Frames,
        });
        assert!(!stopped.is_frame_drop());
        assert!(!ArchiveError::UnknownStream(StreamId::COLOR).is_frame_drop());
    }

    #[test]
    fn test_display() {
        let err = ArchiveError::from(PoolError::Exhausted {
            pool: PoolKind::Frames,
            capacity: 2,
        });
        assert_eq!(err.to_string(), "frame pool exhausted: all 2 slots in use");

        let err = ArchiveError::StreamMismatch {
            slot: StreamId::COLOR,
            frame: StreamId::DEPTH,
        };
        assert_eq!(
            err.to_string(),
            "frame of stream depth placed in slot for stream color"
        );
    }
}
