//! Task promises: reference-counted completion handles.
//!
//! # Lifetime model
//!
//! The shared state behind a [`TaskPromise`] is `Arc`-backed: the issuing
//! call keeps one strong reference in the returned handle and transfers a
//! second into the queued task record. The worker that runs the task holds
//! that second reference for the duration of execution, so the state
//! outlives any ordering of "caller drops the handle" versus "worker
//! finishes the task". The state is freed exactly when the last clone
//! drops, including during unwinding, which is what makes the handle
//! exception-safe.
//!
//! # Completion handshake
//!
//! `completed` is a monotone flag: once set it never clears. The flag is
//! readable without the mutex; the mutex plus condvar exist only for the
//! blocking [`TaskPromise::join`] handshake. Completion stores the flag
//! under the mutex and then notifies, so a joiner that checked the flag
//! under the same mutex cannot miss the wakeup.
//!
//! # Caller restriction
//!
//! Joining a promise from inside a task body can starve a small pool: the
//! joining worker is parked while the joined task may still be queued behind
//! it. This is not detected; do not join from inside the pool unless the
//! pool is known to be large enough.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Opaque argument moved into a task at execution time.
pub type TaskArg = Box<dyn Any + Send + 'static>;

/// Shared completion state of one issued task.
pub(crate) struct TaskState {
    completed: AtomicBool,
    failed: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

impl TaskState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            completed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        })
    }

    /// Lock with poison recovery.
    ///
    /// Completion runs on worker threads after the task body has already
    /// been caught; a poisoned mutex here must not prevent the wakeup, or
    /// joiners would hang forever.
    fn lock_or_recover(&self) -> MutexGuard<'_, ()> {
        match self.lock.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }

    /// Marks the task complete and wakes every joiner.
    ///
    /// `failed` records that the task body panicked; the panic itself was
    /// contained by the worker.
    pub(crate) fn complete(&self, failed: bool) {
        let guard = self.lock_or_recover();
        if failed {
            self.failed.store(true, Ordering::Release);
        }
        self.completed.store(true, Ordering::Release);
        drop(guard);
        self.cv.notify_all();
    }
}

/// Handle to a task's completion state.
///
/// Cheap to clone (one atomic increment); all clones observe the same
/// completion. See the module docs for the lifetime model.
#[derive(Clone)]
pub struct TaskPromise {
    state: Arc<TaskState>,
}

impl TaskPromise {
    pub(crate) fn new(state: Arc<TaskState>) -> Self {
        Self { state }
    }

    /// Whether the task has finished executing. Monotone: once `true`,
    /// stays `true`.
    pub fn completed(&self) -> bool {
        self.state.completed.load(Ordering::Acquire)
    }

    /// Whether the task body panicked. Meaningful once [`completed`] is
    /// `true`; the promise still completes so joiners are released.
    ///
    /// [`completed`]: TaskPromise::completed
    pub fn failed(&self) -> bool {
        self.state.failed.load(Ordering::Acquire)
    }

    /// Blocks until the task completes. Returns immediately if it already
    /// has.
    ///
    /// A task dropped unexecuted at scheduler shutdown never completes;
    /// joining such a promise blocks forever.
    pub fn join(&self) {
        if self.completed() {
            return;
        }
        let mut guard = self
            .state
            .lock
            .lock()
            .expect("task promise mutex poisoned");
        while !self.state.completed.load(Ordering::Acquire) {
            guard = self
                .state
                .cv
                .wait(guard)
                .expect("task promise condvar poisoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn completion_is_monotone() {
        let state = TaskState::new();
        let p = TaskPromise::new(Arc::clone(&state));
        assert!(!p.completed());

        state.complete(false);
        assert!(p.completed());
        assert!(!p.failed());
        assert!(p.completed(), "completed must stay true");
    }

    #[test]
    fn clones_observe_the_same_state() {
        let state = TaskState::new();
        let p = TaskPromise::new(Arc::clone(&state));
        let q = p.clone();
        assert!(!q.completed());

        state.complete(false);
        assert!(p.completed());
        assert!(q.completed());
    }

    #[test]
    fn failed_flag_is_visible_after_completion() {
        let state = TaskState::new();
        let p = TaskPromise::new(Arc::clone(&state));
        state.complete(true);
        assert!(p.completed());
        assert!(p.failed());
    }

    #[test]
    fn join_returns_immediately_when_complete() {
        let state = TaskState::new();
        let p = TaskPromise::new(Arc::clone(&state));
        state.complete(false);
        p.join();
    }

    #[test]
    fn join_blocks_until_completion() {
        let state = TaskState::new();
        let p = TaskPromise::new(Arc::clone(&state));

        let joined = Arc::new(AtomicBool::new(false));
        let joined2 = Arc::clone(&joined);
        let p2 = p.clone();
        let th = thread::spawn(move || {
            p2.join();
            joined2.store(true, Ordering::SeqCst);
        });

        // Give the joiner time to start and block.
        thread::sleep(Duration::from_millis(50));
        assert!(!joined.load(Ordering::SeqCst), "join should still block");

        state.complete(false);
        th.join().unwrap();
        assert!(joined.load(Ordering::SeqCst));
        assert!(p.completed());
    }

    #[test]
    fn state_is_freed_when_last_handle_drops() {
        let state = TaskState::new();
        let weak = Arc::downgrade(&state);

        let p = TaskPromise::new(Arc::clone(&state));
        let q = p.clone();

        // Worker-side reference completes and drops first.
        state.complete(false);
        drop(state);
        assert!(weak.upgrade().is_some(), "handles still hold the state");

        drop(p);
        assert!(weak.upgrade().is_some(), "one handle remains");

        drop(q);
        assert!(weak.upgrade().is_none(), "no double-free, no leak");
    }

    #[test]
    fn many_concurrent_joiners_all_release() {
        let state = TaskState::new();
        let p = TaskPromise::new(Arc::clone(&state));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let p = p.clone();
                thread::spawn(move || p.join())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        state.complete(false);

        for th in threads {
            th.join().unwrap();
        }
    }
}
