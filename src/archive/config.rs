//! Archive configuration

use std::collections::HashSet;

use crate::frame::{FrameMetadata, PixelFormat, StreamId};

use super::error::ArchiveError;

/// Mode selected for one stream when streaming starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProfile {
    pub stream: StreamId,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl StreamProfile {
    pub fn new(stream: StreamId, format: PixelFormat, width: u32, height: u32, fps: u32) -> Self {
        Self {
            stream,
            format,
            width,
            height,
            fps,
        }
    }

    /// Metadata template for frames of this mode
    pub fn metadata(&self) -> FrameMetadata {
        FrameMetadata::new(self.stream, self.format, self.width, self.height).with_fps(self.fps)
    }

    /// Payload bytes needed for one frame of this mode
    pub fn frame_size(&self) -> usize {
        self.metadata().image_size()
    }
}

/// Archive configuration options
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Enabled streams; fixed for the archive's lifetime
    pub streams: Vec<StreamProfile>,

    /// Capacity of the published-frames pool
    pub frame_capacity: usize,

    /// Capacity of the frameset pool
    pub frameset_capacity: usize,

    /// Capacity of the detached-ref pool
    pub detached_capacity: usize,

    /// Published frames one stream may hold at once (0 = unlimited)
    pub max_frames_per_stream: usize,

    /// Retired payloads older than this (in capture-time milliseconds) are discarded
    pub freelist_max_age_ms: f64,

    /// Maximum number of retired payloads kept for reuse
    pub freelist_capacity: usize,

    /// Log frames whose consumer callback outlasted one frame interval
    pub callback_warning: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            streams: Vec::new(),
            frame_capacity: 64,
            frameset_capacity: 64,
            detached_capacity: 128,
            max_frames_per_stream: 0, // Unlimited
            freelist_max_age_ms: 1000.0,
            freelist_capacity: 16,
            callback_warning: true,
        }
    }
}

impl ArchiveConfig {
    /// Create a config for the given stream selection
    pub fn with_streams(streams: impl IntoIterator<Item = StreamProfile>) -> Self {
        Self {
            streams: streams.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Add a stream
    pub fn stream(mut self, profile: StreamProfile) -> Self {
        self.streams.push(profile);
        self
    }

    /// Set the published-frames pool capacity
    pub fn frame_capacity(mut self, capacity: usize) -> Self {
        self.frame_capacity = capacity;
        self
    }

    /// Set the frameset pool capacity
    pub fn frameset_capacity(mut self, capacity: usize) -> Self {
        self.frameset_capacity = capacity;
        self
    }

    /// Set the detached-ref pool capacity
    pub fn detached_capacity(mut self, capacity: usize) -> Self {
        self.detached_capacity = capacity;
        self
    }

    /// Limit published frames per stream
    pub fn max_frames_per_stream(mut self, max: usize) -> Self {
        self.max_frames_per_stream = max;
        self
    }

    /// Set the freelist age limit
    pub fn freelist_max_age_ms(mut self, age_ms: f64) -> Self {
        self.freelist_max_age_ms = age_ms;
        self
    }

    /// Set the freelist capacity
    pub fn freelist_capacity(mut self, capacity: usize) -> Self {
        self.freelist_capacity = capacity;
        self
    }

    /// Disable slow-callback logging
    pub fn disable_callback_warning(mut self) -> Self {
        self.callback_warning = false;
        self
    }

    /// Highest stream id + 1
    pub fn stream_count(&self) -> usize {
        self.streams
            .iter()
            .map(|profile| profile.stream.index() + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn profile(&self, stream: StreamId) -> Option<&StreamProfile> {
        self.streams.iter().find(|profile| profile.stream == stream)
    }

    /// Check the config before building an archive from it
    pub fn validate(&self) -> Result<(), ArchiveError> {
        if self.streams.is_empty() {
            return Err(ArchiveError::InvalidConfig("no streams selected".into()));
        }
        if self.frame_capacity == 0 || self.frameset_capacity == 0 || self.detached_capacity == 0 {
            return Err(ArchiveError::InvalidConfig(
                "pool capacities must be non-zero".into(),
            ));
        }

        let mut seen = HashSet::new();
        for profile in &self.streams {
            if !seen.insert(profile.stream) {
                return Err(ArchiveError::InvalidConfig(format!(
                    "stream {} selected twice",
                    profile.stream
                )));
            }
        }

        Ok(())
    }
}
