//! Stream identifiers, pixel formats and per-frame metadata

use std::fmt;

/// Identifier of one native stream of a device
///
/// Doubles as the slot index of that stream in a [`FrameSet`](super::FrameSet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u8);

impl StreamId {
    pub const DEPTH: StreamId = StreamId(0);
    pub const COLOR: StreamId = StreamId(1);
    pub const INFRARED: StreamId = StreamId(2);
    pub const INFRARED2: StreamId = StreamId(3);
    pub const FISHEYE: StreamId = StreamId(4);

    /// Slot index of this stream
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            StreamId::DEPTH => f.write_str("depth"),
            StreamId::COLOR => f.write_str("color"),
            StreamId::INFRARED => f.write_str("infrared"),
            StreamId::INFRARED2 => f.write_str("infrared2"),
            StreamId::FISHEYE => f.write_str("fisheye"),
            StreamId(n) => write!(f, "stream{}", n),
        }
    }
}

/// Pixel layout of a frame payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 16-bit linear depth values
    Z16,
    /// 16-bit disparity values
    Disparity16,
    /// 32-bit float XYZ triplets
    Xyz32f,
    /// Packed YUV 4:2:2
    Yuyv,
    Rgb8,
    Bgr8,
    Rgba8,
    Bgra8,
    /// 8-bit luminance
    Y8,
    /// 16-bit luminance
    Y16,
    Raw8,
    /// 10-bit packed raw sensor data
    Raw10,
    Raw16,
}

impl PixelFormat {
    /// Bits used per pixel in the payload
    pub const fn bits_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Y8 | PixelFormat::Raw8 => 8,
            PixelFormat::Raw10 => 10,
            PixelFormat::Z16
            | PixelFormat::Disparity16
            | PixelFormat::Yuyv
            | PixelFormat::Y16
            | PixelFormat::Raw16 => 16,
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => 24,
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 32,
            PixelFormat::Xyz32f => 96,
        }
    }
}

/// Clock a capture timestamp was taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TimestampDomain {
    /// Device hardware clock
    #[default]
    HardwareClock,
    /// Host system clock at arrival
    SystemTime,
}

/// Optional per-frame values a device may report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKey {
    /// Exposure actually applied by the sensor
    ActualExposure,
    /// Frame rate actually achieved by the sensor
    ActualFps,
}

/// Metadata describing one captured frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMetadata {
    /// Stream the frame was captured for
    pub stream: StreamId,
    /// Capture timestamp in milliseconds
    pub timestamp: f64,
    pub timestamp_domain: TimestampDomain,
    /// Host time at arrival, milliseconds since the Unix epoch
    pub system_time: i64,
    pub frame_number: u64,
    pub width: u32,
    pub height: u32,
    /// Row size in bytes
    pub stride: u32,
    pub bits_per_pixel: u32,
    pub format: PixelFormat,
    /// Nominal frame rate of the stream mode
    pub fps: u32,
    pub actual_exposure: Option<f64>,
    pub actual_fps: Option<f64>,
}

impl FrameMetadata {
    /// Metadata for a tightly packed `width` x `height` image
    pub fn new(stream: StreamId, format: PixelFormat, width: u32, height: u32) -> Self {
        let bits_per_pixel = format.bits_per_pixel();
        Self {
            stream,
            timestamp: 0.0,
            timestamp_domain: TimestampDomain::default(),
            system_time: 0,
            frame_number: 0,
            width,
            height,
            stride: (width * bits_per_pixel).div_ceil(8),
            bits_per_pixel,
            format,
            fps: 0,
            actual_exposure: None,
            actual_fps: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_timestamp_domain(mut self, domain: TimestampDomain) -> Self {
        self.timestamp_domain = domain;
        self
    }

    pub fn with_system_time(mut self, system_time: i64) -> Self {
        self.system_time = system_time;
        self
    }

    pub fn with_frame_number(mut self, frame_number: u64) -> Self {
        self.frame_number = frame_number;
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    pub fn with_stride(mut self, stride: u32) -> Self {
        self.stride = stride;
        self
    }

    /// Attach an optional per-frame value
    pub fn with_value(mut self, key: MetadataKey, value: f64) -> Self {
        self.set_value(key, value);
        self
    }

    pub(crate) fn set_value(&mut self, key: MetadataKey, value: f64) {
        match key {
            MetadataKey::ActualExposure => self.actual_exposure = Some(value),
            MetadataKey::ActualFps => self.actual_fps = Some(value),
        }
    }

    /// Whether the device reported `key` for this frame
    pub fn supports(&self, key: MetadataKey) -> bool {
        self.value(key).is_some()
    }

    /// Optional per-frame value, if reported
    pub fn value(&self, key: MetadataKey) -> Option<f64> {
        match key {
            MetadataKey::ActualExposure => self.actual_exposure,
            MetadataKey::ActualFps => self.actual_fps,
        }
    }

    /// Payload size in bytes (`stride * height`)
    pub fn image_size(&self) -> usize {
        self.stride as usize * self.height as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_display() {
        assert_eq!(StreamId::DEPTH.to_string(), "depth");
        assert_eq!(StreamId::FISHEYE.to_string(), "fisheye");
        assert_eq!(StreamId(9).to_string(), "stream9");
    }

    #[test]
    fn test_packed_stride() {
        let meta = FrameMetadata::new(StreamId::DEPTH, PixelFormat::Z16, 640, 480);
        assert_eq!(meta.bits_per_pixel, 16);
        assert_eq!(meta.stride, 1280);
        assert_eq!(meta.image_size(), 1280 * 480);

        // 10-bit packed rows round up to whole bytes
        let raw = FrameMetadata::new(StreamId::COLOR, PixelFormat::Raw10, 3, 1);
        assert_eq!(raw.stride, 4);
    }

    #[test]
    fn test_optional_values() {
        let meta = FrameMetadata::new(StreamId::COLOR, PixelFormat::Rgb8, 4, 4)
            .with_value(MetadataKey::ActualExposure, 33.0);

        assert!(meta.supports(MetadataKey::ActualExposure));
        assert!(!meta.supports(MetadataKey::ActualFps));
        assert_eq!(meta.value(MetadataKey::ActualExposure), Some(33.0));
        assert_eq!(meta.value(MetadataKey::ActualFps), None);
    }

    #[test]
    fn test_builder_chaining() {
        let meta = FrameMetadata::new(StreamId::INFRARED, PixelFormat::Y8, 8, 2)
            .with_timestamp(12.5)
            .with_timestamp_domain(TimestampDomain::SystemTime)
            .with_system_time(1_700_000_000_000)
            .with_frame_number(42)
            .with_fps(30)
            .with_stride(16);

        assert_eq!(meta.timestamp, 12.5);
        assert_eq!(meta.timestamp_domain, TimestampDomain::SystemTime);
        assert_eq!(meta.system_time, 1_700_000_000_000);
        assert_eq!(meta.frame_number, 42);
        assert_eq!(meta.fps, 30);
        assert_eq!(meta.image_size(), 32);
    }
}
