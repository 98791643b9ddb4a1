//! Simulated two-stream capture loop with async consumers
//!
//! Run with: cargo run --example capture_loop [FRAMES]
//!
//! A capture thread fills depth and color frames at ~30 fps, groups each pair
//! into a frameset and dispatches it. Two tokio tasks consume:
//!
//! - a viewer that takes every frameset and releases it right away
//! - a slow recorder on the depth stream only, with a short queue, so the
//!   frame pool runs dry and captures get dropped
//!
//! Each capture carries a continuation standing in for the backend's
//! "transport buffer free" notification.
//!
//! ```text
//!   capture thread ──► FrameArchive ──► FrameDispatcher ──┬──► viewer   (all)
//!                                                         └──► recorder (depth)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use frame_archive::{
    ArchiveConfig, FrameArchive, FrameContinuation, FrameDispatcher, FrameSubscription,
    PixelFormat, StreamId, StreamProfile,
};

const STREAMS: [StreamId; 2] = [StreamId::DEPTH, StreamId::COLOR];

fn capture_loop(mut archive: FrameArchive, dispatcher: Arc<FrameDispatcher>, frames: u64) {
    let returned = Arc::new(AtomicU64::new(0));

    for n in 0..frames {
        let Ok(mut set) = archive.alloc_frameset() else {
            tracing::warn!(frame_number = n, "No frameset slot, capture skipped");
            std::thread::sleep(Duration::from_millis(33));
            continue;
        };

        for stream in STREAMS {
            let Some(profile) = archive.profile(stream).copied() else {
                continue;
            };
            let metadata = profile
                .metadata()
                .with_frame_number(n)
                .with_timestamp(n as f64 * 1000.0 / f64::from(profile.fps));

            match archive.alloc_frame(stream, metadata, true) {
                Ok(data) => data.fill(n as u8),
                Err(err) => {
                    tracing::error!(stream = %stream, error = %err, "Allocation failed");
                    continue;
                }
            }

            let returned = Arc::clone(&returned);
            let continuation = FrameContinuation::new(move || {
                returned.fetch_add(1, Ordering::Relaxed);
            });
            if archive.attach_continuation(stream, continuation).is_err() {
                continue;
            }

            if let Err(err) = archive.place_frame(&mut set, stream) {
                tracing::debug!(
                    stream = %stream,
                    frame_number = n,
                    error = %err,
                    "Frame not placed"
                );
            }
        }

        if !set.is_empty() {
            dispatcher.dispatch_frameset(&set);
        }
        drop(set);

        std::thread::sleep(Duration::from_millis(33));
    }

    let stats = archive.stats();
    tracing::info!(
        published = stats.frames_published,
        dropped = stats.frames_dropped(),
        transport_buffers_returned = returned.load(Ordering::Relaxed),
        frames_high_water = stats.frames.high_water,
        "Capture finished"
    );
    archive.flush();
}

async fn viewer(mut subscription: FrameSubscription) -> u64 {
    let mut seen = 0;
    while let Some(capture) = subscription.recv().await {
        seen += 1;
        tracing::debug!(
            streams = ?capture.streams(),
            frame_number = capture.first().map(|f| f.frame_number()),
            "Viewer got capture"
        );
    }
    seen
}

async fn recorder(mut subscription: FrameSubscription) -> u64 {
    let mut recorded = 0;
    while let Some(capture) = subscription.recv().await {
        if let Some(frame) = capture.first() {
            tracing::debug!(
                frame_number = frame.frame_number(),
                bytes = frame.data().len(),
                "Recording frame"
            );
        }
        // Hold the frame well past one frame interval
        tokio::time::sleep(Duration::from_millis(120)).await;
        recorded += 1;
    }
    recorded
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let frames: u64 = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 90,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("frame_archive=info".parse()?)
                .add_directive("capture_loop=debug".parse()?),
        )
        .init();

    let config = ArchiveConfig::with_streams([
        StreamProfile::new(StreamId::DEPTH, PixelFormat::Z16, 640, 480, 30),
        StreamProfile::new(StreamId::COLOR, PixelFormat::Rgb8, 640, 480, 30),
    ])
    .frame_capacity(8)
    .frameset_capacity(8);

    let archive = FrameArchive::new(config)?;
    let dispatcher = Arc::new(FrameDispatcher::new(archive.handle()));

    let viewer = tokio::spawn(viewer(dispatcher.subscribe(None, 4)));
    let recorder = tokio::spawn(recorder(dispatcher.subscribe(Some(StreamId::DEPTH), 2)));

    let producer = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::task::spawn_blocking(move || capture_loop(archive, dispatcher, frames))
    };
    producer.await?;

    let stats = dispatcher.stats();
    drop(dispatcher);

    let seen = viewer.await?;
    let recorded = recorder.await?;

    tracing::info!(
        seen,
        recorded,
        delivered = stats.delivered,
        dropped_full = stats.dropped_full,
        dropped_pool = stats.dropped_pool,
        "Consumers finished"
    );

    Ok(())
}
