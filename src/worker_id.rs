//! Thread-local worker identity.
//!
//! Worker threads install their id and the pool size on startup and clear
//! both before exit. `try_worker_id()` returns `Some` **only** on a live
//! scheduler worker; the main thread, joiner threads, and tests all see
//! `None`. Ids are stable for a worker's lifetime, unique within the pool,
//! and dense in `[0, worker_count)`, which is what per-worker slotting
//! ([`crate::Batch`]) relies on.
//!
//! Calling [`worker_id`] or [`worker_count`] outside a worker is a caller
//! error and panics; use [`try_worker_id`] where "not a worker" is an
//! expected answer.

use std::cell::Cell;

/// Sentinel for "no worker id installed". Not a valid id: ids are dense
/// from 0 and a pool of `usize::MAX` workers cannot exist.
const NO_WORKER: usize = usize::MAX;

thread_local! {
    /// (worker id, pool size) for this thread. The `const` initializer
    /// means no runtime init code runs; a fresh thread sees the sentinel.
    static WORKER: Cell<(usize, usize)> = const { Cell::new((NO_WORKER, 0)) };
}

/// Installs this thread's worker identity. Called once per worker at
/// startup; paired with [`exit`] before the thread returns.
pub(crate) fn enter(id: usize, pool_size: usize) {
    debug_assert!(id != NO_WORKER);
    debug_assert!(id < pool_size);
    WORKER.with(|c| c.set((id, pool_size)));
}

/// Clears this thread's worker identity before exit, so nothing observes a
/// stale id during thread teardown.
pub(crate) fn exit() {
    WORKER.with(|c| c.set((NO_WORKER, 0)));
}

/// This thread's worker id, if it is a scheduler worker.
#[inline]
pub fn try_worker_id() -> Option<usize> {
    WORKER.with(|c| {
        let (id, _) = c.get();
        if id == NO_WORKER {
            None
        } else {
            Some(id)
        }
    })
}

/// This worker's id, in `[0, worker_count())`.
///
/// # Panics
///
/// Panics when called from a thread that is not a scheduler worker.
#[inline]
pub fn worker_id() -> usize {
    try_worker_id().expect("worker_id() called outside a scheduler worker")
}

/// The size of the pool this worker belongs to.
///
/// # Panics
///
/// Panics when called from a thread that is not a scheduler worker. Outside
/// the pool, use [`crate::Scheduler::worker_count`] or
/// [`crate::SchedulerHandle::worker_count`].
#[inline]
pub fn worker_count() -> usize {
    WORKER.with(|c| {
        let (id, count) = c.get();
        assert!(
            id != NO_WORKER,
            "worker_count() called outside a scheduler worker"
        );
        count
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fresh_thread_has_no_id() {
        assert_eq!(try_worker_id(), None);
    }

    #[test]
    fn enter_and_exit_round_trip() {
        enter(3, 8);
        assert_eq!(try_worker_id(), Some(3));
        assert_eq!(worker_id(), 3);
        assert_eq!(worker_count(), 8);

        exit();
        assert_eq!(try_worker_id(), None);
    }

    #[test]
    fn threads_are_isolated() {
        enter(0, 2);

        let handle = thread::spawn(|| {
            assert_eq!(try_worker_id(), None);
            enter(1, 2);
            assert_eq!(worker_id(), 1);
        });

        assert_eq!(worker_id(), 0);
        handle.join().unwrap();
        assert_eq!(worker_id(), 0, "child thread must not affect this one");

        exit();
    }

    #[test]
    #[should_panic(expected = "outside a scheduler worker")]
    fn worker_id_outside_worker_panics() {
        // This test thread never calls enter().
        let _ = worker_id();
    }

    #[test]
    #[should_panic(expected = "outside a scheduler worker")]
    fn worker_count_outside_worker_panics() {
        let _ = worker_count();
    }
}
