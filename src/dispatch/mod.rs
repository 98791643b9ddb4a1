//! Consumer fan-out of published captures
//!
//! A [`FrameDispatcher`] hands each published frame or frameset to every
//! matching subscriber through a bounded `tokio::sync::mpsc` queue. Each
//! delivery is its own reference: a frame delivery acquires the handle, a
//! frameset delivery is an independent clone from the archive's frameset
//! pool. The producer never waits on a consumer; when a subscriber's queue is
//! full that delivery is dropped and counted, releasing its references.
//!
//! ```text
//!   FrameArchive ──publish──► FrameDispatcher::dispatch()
//!                                   │ try_send
//!                 ┌─────────────────┼─────────────────┐
//!                 ▼                 ▼                 ▼
//!          [all streams]      [depth only]      [color only]
//!          sub.recv()         sub.try_recv()    sub.blocking_recv()
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::archive::ArchiveHandle;
use crate::frame::{Capture, FrameHandle, FrameSet, StreamId};

struct Subscriber {
    id: u64,
    filter: Option<StreamId>,
    tx: mpsc::Sender<Capture>,
}

#[derive(Debug, Default)]
struct DispatchCounters {
    delivered: AtomicU64,
    dropped_full: AtomicU64,
    dropped_pool: AtomicU64,
}

/// Dispatch statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    pub subscribers: usize,
    /// Captures queued to a subscriber
    pub delivered: u64,
    /// Deliveries dropped because the subscriber's queue was full
    pub dropped_full: u64,
    /// Frameset deliveries dropped because no frameset slot was free
    pub dropped_pool: u64,
}

/// Fan-out of captures to subscriber queues
pub struct FrameDispatcher {
    archive: ArchiveHandle,
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    counters: DispatchCounters,
}

impl FrameDispatcher {
    pub fn new(archive: ArchiveHandle) -> Self {
        Self {
            archive,
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            counters: DispatchCounters::default(),
        }
    }

    /// Register a subscriber
    ///
    /// With a `filter` the subscriber only receives frames of that stream,
    /// framesets included (as the single matching frame). `capacity` bounds
    /// the subscriber's queue.
    pub fn subscribe(&self, filter: Option<StreamId>, capacity: usize) -> FrameSubscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.subscribers.lock();
        subscribers.push(Subscriber { id, filter, tx });

        tracing::info!(
            subscriber = id,
            filter = ?filter,
            capacity,
            subscribers = subscribers.len(),
            "Subscriber registered"
        );

        FrameSubscription { id, filter, rx }
    }

    /// Remove a subscriber; returns whether it was registered
    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|sub| sub.id != id);
        let removed = subscribers.len() != before;

        if removed {
            tracing::info!(
                subscriber = id,
                subscribers = subscribers.len(),
                "Subscriber removed"
            );
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn archive(&self) -> &ArchiveHandle {
        &self.archive
    }

    /// Deliver `capture` to every matching subscriber; returns deliveries queued
    pub fn dispatch(&self, capture: &Capture) -> usize {
        match capture {
            Capture::Frame(frame) => self.dispatch_frame(frame),
            Capture::FrameSet(set) => self.dispatch_frameset(set),
        }
    }

    /// Deliver a single frame
    pub fn dispatch_frame(&self, frame: &FrameHandle) -> usize {
        let Some(stream) = frame.stream() else {
            return 0;
        };

        self.deliver(|filter| match filter {
            Some(wanted) if wanted != stream => None,
            _ => Some(Capture::Frame(frame.acquire())),
        })
    }

    /// Deliver a frameset
    ///
    /// Unfiltered subscribers each get their own clone of `set`; filtered
    /// subscribers get just their stream's frame.
    pub fn dispatch_frameset(&self, set: &FrameSet) -> usize {
        self.deliver(|filter| match filter {
            Some(stream) => set
                .frame(stream)
                .map(|frame| Capture::Frame(frame.acquire())),
            None => match self.archive.clone_frameset(set) {
                Ok(clone) => Some(Capture::FrameSet(clone)),
                Err(err) => {
                    self.counters.dropped_pool.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(error = %err, "Frameset delivery dropped");
                    None
                }
            },
        })
    }

    fn deliver<F>(&self, mut make: F) -> usize
    where
        F: FnMut(Option<StreamId>) -> Option<Capture>,
    {
        // Rejected captures are dropped after the lock is released: dropping
        // the last reference can run a continuation.
        let mut rejected = Vec::new();
        let mut delivered = 0;

        {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|sub| {
                let Some(capture) = make(sub.filter) else {
                    return !sub.tx.is_closed();
                };
                mark_delivered(&capture);

                match sub.tx.try_send(capture) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(TrySendError::Full(capture)) => {
                        self.counters.dropped_full.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            subscriber = sub.id,
                            "Subscriber queue full, delivery dropped"
                        );
                        rejected.push(capture);
                        true
                    }
                    Err(TrySendError::Closed(capture)) => {
                        tracing::info!(subscriber = sub.id, "Subscriber closed");
                        rejected.push(capture);
                        false
                    }
                }
            });
        }

        drop(rejected);
        self.counters
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            subscribers: self.subscriber_count(),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped_full: self.counters.dropped_full.load(Ordering::Relaxed),
            dropped_pool: self.counters.dropped_pool.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for FrameDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDispatcher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

fn mark_delivered(capture: &Capture) {
    match capture {
        Capture::Frame(frame) => frame.mark_callback_start(),
        Capture::FrameSet(set) => set.frames().for_each(FrameHandle::mark_callback_start),
    }
}

/// Receiving end of a subscription
///
/// Dropping it unsubscribes on the next dispatch and releases every capture
/// still queued.
#[derive(Debug)]
pub struct FrameSubscription {
    id: u64,
    filter: Option<StreamId>,
    rx: mpsc::Receiver<Capture>,
}

impl FrameSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stream filter, if any
    pub fn stream(&self) -> Option<StreamId> {
        self.filter
    }

    /// Wait for the next capture; `None` once the dispatcher is gone
    pub async fn recv(&mut self) -> Option<Capture> {
        self.rx.recv().await
    }

    /// Next capture if one is queued
    pub fn try_recv(&mut self) -> Option<Capture> {
        self.rx.try_recv().ok()
    }

    /// Blocking variant of [`recv`](Self::recv) for non-async consumers
    ///
    /// Panics if called from within an async runtime.
    pub fn blocking_recv(&mut self) -> Option<Capture> {
        self.rx.blocking_recv()
    }
}
