//! Per-worker container slots for lock-free result aggregation.
//!
//! # Purpose
//!
//! User code running inside graph functions often accumulates per-thread
//! results (counters, buffers, finding lists). [`Batch`] pre-allocates one
//! container per worker so each worker mutates only its own slot, with no
//! synchronisation between slots; the host merges after the pool drains.
//!
//! # Correctness
//!
//! Slot exclusivity rests on the worker-id contract: ids are unique and
//! stable per live worker ([`mod@crate::worker_id`]), so no two threads index
//! the same slot concurrently. A per-slot borrow flag enforces the one
//! remaining hazard (re-entering the same slot from the same worker) by
//! panicking instead of aliasing.
//!
//! # False sharing
//!
//! Slots are `CachePadded` so adjacent workers' containers never share a
//! cache line; per-slot writes stay core-local.
//!
//! # Usage
//!
//! ```ignore
//! let batch = Arc::new(Batch::<u64>::new(scheduler.worker_count()));
//! // inside a graph function:
//! batch.with_local(|count| *count += 1);
//! // after the scheduler run, sole owner again:
//! let total: u64 = batch.all().copied().sum();
//! ```

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::CachePadded;

struct Slot<C> {
    /// Borrow flag: set while `with_local` runs on this slot.
    busy: AtomicBool,
    value: UnsafeCell<C>,
}

// SAFETY: a slot's value is only touched through `with_local` (exclusive by
// the busy flag plus worker-id uniqueness) or through `&mut self` methods.
unsafe impl<C: Send> Sync for Slot<C> {}

/// One container per worker, cache-line padded. See the module docs.
pub struct Batch<C> {
    slots: Vec<CachePadded<Slot<C>>>,
}

impl<C: Default> Batch<C> {
    /// Pre-allocates `workers` default containers.
    ///
    /// `workers` must cover every id the pool can produce; size it with
    /// [`crate::Scheduler::worker_count`].
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero.
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "batch needs at least one worker slot");
        let slots = (0..workers)
            .map(|_| {
                CachePadded::new(Slot {
                    busy: AtomicBool::new(false),
                    value: UnsafeCell::new(C::default()),
                })
            })
            .collect();
        Self { slots }
    }
}

impl<C> Batch<C> {
    /// Number of slots this batch was sized for.
    pub fn worker_slots(&self) -> usize {
        self.slots.len()
    }

    /// Runs `f` with exclusive access to the calling worker's container.
    ///
    /// # Panics
    ///
    /// - Outside a scheduler worker (the worker-id caller error).
    /// - If the batch was sized for fewer workers than the pool has.
    /// - On re-entrant access to the same slot (e.g. calling `with_local`
    ///   on the same batch from inside `f`).
    pub fn with_local<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        let id = crate::worker_id::worker_id();
        assert!(
            id < self.slots.len(),
            "batch sized for {} workers but worker id is {id}",
            self.slots.len()
        );
        let slot = &self.slots[id];
        if slot.busy.swap(true, Ordering::Acquire) {
            panic!("batch slot {id} re-entered");
        }
        let reset = ResetOnDrop(&slot.busy);
        // SAFETY: the busy flag we just claimed grants exclusive access, and
        // no other worker indexes this slot (ids are unique).
        let value = unsafe { &mut *slot.value.get() };
        let out = f(value);
        drop(reset);
        out
    }

    /// Iterates every slot for a post-run merge. Exclusive access makes
    /// this safe regardless of worker state.
    pub fn all(&mut self) -> impl Iterator<Item = &C> + '_ {
        self.slots.iter_mut().map(|slot| &*slot.value.get_mut())
    }

    /// Consumes the batch, returning the containers in worker-id order.
    pub fn into_inner(self) -> Vec<C> {
        self.slots
            .into_iter()
            .map(|slot| CachePadded::into_inner(slot).value.into_inner())
            .collect()
    }
}

/// Clears the borrow flag even if the user closure unwinds.
struct ResetOnDrop<'a>(&'a AtomicBool);

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
