//! Archive statistics

pub mod metrics;

pub use metrics::{ArchiveMetrics, ArchiveStats};
