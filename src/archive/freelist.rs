//! Retired payload storage kept for reuse
//!
//! When a published frame is fully released its payload allocation is parked
//! here, tagged with the frame's capture timestamp. The next `alloc_frame`
//! that needs memory takes the first parked payload large enough, so variable
//! size captures don't churn the allocator. Payloads older than the configured
//! age (in capture time) are discarded.

use std::collections::VecDeque;

use bytes::BytesMut;
use parking_lot::Mutex;

#[derive(Debug)]
struct RetiredPayload {
    payload: BytesMut,
    timestamp: f64,
}

/// Bounded list of retired payload buffers
#[derive(Debug)]
pub struct Freelist {
    /// Oldest first
    entries: Mutex<VecDeque<RetiredPayload>>,
    capacity: usize,
    max_age_ms: f64,
}

impl Freelist {
    pub fn new(capacity: usize, max_age_ms: f64) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            max_age_ms,
        }
    }

    /// Take a payload with at least `size` bytes of capacity
    ///
    /// Entries more than `max_age_ms` older than `now` are discarded first.
    pub fn take(&self, size: usize, now: f64) -> Option<BytesMut> {
        let mut entries = self.entries.lock();
        self.purge(&mut entries, now);

        let position = entries
            .iter()
            .position(|entry| entry.payload.capacity() >= size)?;
        entries.remove(position).map(|entry| entry.payload)
    }

    /// Discard entries more than `max_age_ms` older than `now`
    pub fn expire(&self, now: f64) {
        let mut entries = self.entries.lock();
        self.purge(&mut entries, now);
    }

    fn purge(&self, entries: &mut VecDeque<RetiredPayload>, now: f64) {
        entries.retain(|entry| now <= entry.timestamp + self.max_age_ms);
    }

    /// Park a payload for reuse, evicting the oldest entry when full
    pub fn retire(&self, mut payload: BytesMut, timestamp: f64) {
        if self.capacity == 0 || payload.capacity() == 0 {
            return;
        }
        payload.clear();

        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(RetiredPayload { payload, timestamp });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
