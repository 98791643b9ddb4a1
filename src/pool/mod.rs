//! Fixed-capacity slot pools
//!
//! A [`Pool`] is a pre-allocated arena of `capacity` slot indices guarded by a
//! free-index stack. Allocation pops an index and deallocation pushes it back;
//! both are O(1) and may run on different threads. The pool never grows:
//! running out of slots is reported immediately as [`PoolError::Exhausted`],
//! which is how the archive applies backpressure to the capture thread.
//!
//! A [`Slot`] hands its index back when dropped. [`Pooled`] pairs a value with
//! the slot it occupies and drops the value before the slot is returned, so any
//! cleanup the value performs on drop has finished by the time the slot can be
//! handed out again.
//!
//! A pool bounds how many objects are live at once, not where they are stored.
//! Values stay owned by their holders and are heap-allocated there, e.g. a
//! published frame lives in an `Arc<Pooled<_>>`; only the index is recycled.

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Which of the archive's pools a slot belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Published frame buffers
    Frames,
    /// Published framesets
    FrameSets,
    /// Frame handles detached across an API boundary
    DetachedRefs,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolKind::Frames => "frame",
            PoolKind::FrameSets => "frameset",
            PoolKind::DetachedRefs => "detached-ref",
        };
        f.write_str(name)
    }
}

/// Error type for pool allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// Every slot is checked out
    #[error("{pool} pool exhausted: all {capacity} slots in use")]
    Exhausted { pool: PoolKind, capacity: usize },
    /// The pool was stopped during teardown
    #[error("{pool} pool is no longer accepting allocations")]
    Stopped { pool: PoolKind },
}

/// Point-in-time view of a pool's occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub kind: PoolKind,
    pub capacity: usize,
    pub in_use: usize,
    /// Highest `in_use` ever observed
    pub high_water: usize,
}

/// Fixed-capacity arena of reusable slots for one object type
pub struct Pool<T> {
    kind: PoolKind,
    capacity: usize,
    /// Free-index stack; never holds more than `capacity` entries
    free: Mutex<Vec<usize>>,
    in_use: AtomicUsize,
    high_water: AtomicUsize,
    accepting: AtomicBool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Pool<T> {
    /// Create a pool with `capacity` slots, all free
    pub fn new(kind: PoolKind, capacity: usize) -> Arc<Self> {
        let free: Vec<usize> = (0..capacity).rev().collect();

        Arc::new(Self {
            kind,
            capacity,
            free: Mutex::new(free),
            in_use: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            _marker: PhantomData,
        })
    }

    /// Check out a free slot
    ///
    /// Never blocks: fails with [`PoolError::Exhausted`] when every slot is in
    /// use, or [`PoolError::Stopped`] after [`stop_allocation`](Self::stop_allocation).
    pub fn allocate(self: &Arc<Self>) -> Result<Slot<T>, PoolError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(PoolError::Stopped { pool: self.kind });
        }

        let index = {
            let mut free = self.free.lock();
            let index = free.pop().ok_or(PoolError::Exhausted {
                pool: self.kind,
                capacity: self.capacity,
            })?;
            let in_use = self.capacity - free.len();
            self.in_use.store(in_use, Ordering::Release);
            self.high_water.fetch_max(in_use, Ordering::Relaxed);
            index
        };

        Ok(Slot {
            pool: Arc::clone(self),
            index,
        })
    }

    /// Return a slot to the pool
    ///
    /// Equivalent to dropping the slot; may be called from any thread.
    pub fn deallocate(&self, slot: Slot<T>) {
        debug_assert!(
            std::ptr::eq(Arc::as_ptr(&slot.pool), self),
            "slot returned to a foreign pool"
        );
        drop(slot);
    }

    fn release_index(&self, index: usize) {
        let mut free = self.free.lock();
        debug_assert!(free.len() < self.capacity, "{} pool double release", self.kind);
        free.push(index);
        self.in_use
            .store(self.capacity - free.len(), Ordering::Release);
    }

    /// Refuse all further allocations
    ///
    /// Outstanding slots stay valid and still return normally.
    pub fn stop_allocation(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Whether the pool still hands out slots
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently checked out
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Number of slots that can still be allocated
    pub fn available(&self) -> usize {
        self.capacity - self.in_use()
    }

    /// Occupancy snapshot
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            kind: self.kind,
            capacity: self.capacity,
            in_use: self.in_use(),
            high_water: self.high_water.load(Ordering::Relaxed),
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("kind", &self.kind)
            .field("capacity", &self.capacity)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// A checked-out pool slot, returned on drop
pub struct Slot<T> {
    pool: Arc<Pool<T>>,
    index: usize,
}

impl<T> Slot<T> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> PoolKind {
        self.pool.kind
    }
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        self.pool.release_index(self.index);
    }
}

impl<T> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({}#{})", self.pool.kind, self.index)
    }
}

/// A value occupying a pool slot
pub struct Pooled<T> {
    // Declaration order matters: `value` is dropped before `slot`.
    value: T,
    slot: Slot<T>,
}

impl<T> Pooled<T> {
    pub fn new(slot: Slot<T>, value: T) -> Self {
        Self { value, slot }
    }

    pub fn slot_index(&self) -> usize {
        self.slot.index
    }

    /// Take the value out, returning the slot to its pool
    pub fn into_inner(self) -> T {
        let Pooled { value, slot } = self;
        drop(slot);
        value
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("slot", &self.slot)
            .field("value", &self.value)
            .finish()
    }
}
