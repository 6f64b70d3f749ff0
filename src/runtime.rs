//! Worker pool and machine runner.
//!
//! # Architecture
//!
//! ```text
//!   host thread                      worker threads (fixed pool)
//!   ───────────                      ──────────────────────────
//!   Scheduler::new ──spawns──►  N workers, parked on `work_cv`
//!   Scheduler::run loop:
//!     promote queued machine
//!     rebuild counters            ┌────────────────────────────────┐
//!     seed independents ──wake──► │ lock queues                    │
//!     wait on `drained_cv` ◄─sig─ │ pick func (priority) or task   │
//!                                 │ funcs: working += 1, unlock,   │
//!     on drain:                   │   run body, relock, retire,    │
//!       shutdown? → terminate     │   working -= 1                 │
//!       else promote next /       │ tasks: unlock, run, complete   │
//!       re-run current            │   promise                      │
//!                                 └────────────────────────────────┘
//! ```
//!
//! # Quiescence
//!
//! "The machine has drained" is the predicate
//! `function queue empty ∧ working == 0`, evaluated under the queue mutex.
//! `working` is incremented inside the critical section that dequeues a
//! function and decremented inside the critical section that performs its
//! readiness updates, which makes the predicate monotone for one machine
//! run: once true, no new function of that run can appear. Workers signal
//! `drained_cv` whenever they observe the predicate, both when going idle
//! and right after the retire that established it, so a worker that then
//! picks up task work cannot delay the machine transition.
//!
//! # Lock discipline
//!
//! Four mutexes, never nested: the queue mutex (queues, readiness counters,
//! `working`, terminate flag), the control mutex (current/queued machine,
//! shutdown flag), each promise's own mutex, and the panic slot. No lock is
//! held across user code.
//!
//! # Panic policy
//!
//! A panicking task body is caught; its promise completes as failed. A
//! panicking function body is caught and recorded (first panic wins),
//! readiness accounting proceeds so the machine drains cleanly, and
//! [`Scheduler::run`] re-raises the payload after the pool has joined.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crate::metrics::{RunReport, WorkerMetrics};
use crate::promise::{TaskArg, TaskPromise, TaskState};
use crate::queue::{FuncLocant, QueuedTask, Work, WorkQueues};
use crate::readiness::RunCounters;
use crate::registry::{MachineId, Plan};
use crate::worker_id;

/// Pool configuration.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// Upper bound on the worker pool. The pool is sized
    /// `min(available_parallelism, max_workers)`, at least one.
    pub max_workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: usize::MAX,
        }
    }
}

impl SchedulerConfig {
    /// Validates the configuration. Panics on invalid values.
    pub fn validate(&self) {
        assert!(self.max_workers > 0, "max_workers must be > 0");
    }

    fn pool_size(&self) -> usize {
        let hw = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        hw.min(self.max_workers).max(1)
    }
}

/// State guarded by the queue mutex. The queues, the readiness counters and
/// the working count are only ever observed together, which is what makes
/// the quiescence predicate sound.
struct ExecState {
    queues: WorkQueues,
    counters: RunCounters,
    /// Machine currently being executed, if any.
    active: Option<MachineId>,
    /// Workers currently inside a function body of the active machine.
    working: usize,
    /// Pool-wide stop flag; once set, workers exit after their current item.
    terminate: bool,
}

/// Machine-transition state, under its own mutex.
struct Control {
    /// Machine to run (or re-run) after the current one drains.
    queued: Option<MachineId>,
    /// Machine presently running, if any.
    current: Option<MachineId>,
    shutdown: bool,
}

pub(crate) struct Shared {
    plan: Plan,
    exec: Mutex<ExecState>,
    /// Wakes workers when either queue gains an item, and at pool
    /// termination.
    work_cv: Condvar,
    /// Wakes the runner when the active machine has quiesced.
    drained_cv: Condvar,
    control: Mutex<Control>,
    /// First function-body panic of the run, re-raised by `run`.
    panic_slot: Mutex<Option<Box<dyn Any + Send + 'static>>>,
    pool_size: usize,
}

impl Shared {
    fn lock_exec(&self) -> MutexGuard<'_, ExecState> {
        self.exec.lock().expect("scheduler queue mutex poisoned")
    }

    /// Queue lock for shutdown paths, recovering from poison: teardown must
    /// proceed even if a worker died badly.
    fn lock_exec_or_recover(&self) -> MutexGuard<'_, ExecState> {
        match self.exec.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }

    fn lock_control(&self) -> MutexGuard<'_, Control> {
        self.control
            .lock()
            .expect("scheduler control mutex poisoned")
    }

    fn lock_panic_slot(&self) -> MutexGuard<'_, Option<Box<dyn Any + Send + 'static>>> {
        match self.panic_slot.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }

    /// Stores the first panic payload; later ones are discarded.
    fn record_panic(&self, payload: Box<dyn Any + Send + 'static>) {
        let mut slot = self.lock_panic_slot();
        if slot.is_none() {
            *slot = Some(payload);
        }
    }

    fn issue_task(
        &self,
        run: Box<dyn FnOnce(TaskArg) + Send + 'static>,
        arg: TaskArg,
    ) -> TaskPromise {
        let state = TaskState::new();
        let record = QueuedTask {
            run,
            arg,
            state: Arc::clone(&state),
        };
        {
            let mut exec = self.lock_exec();
            exec.queues.push_task(record);
        }
        self.work_cv.notify_one();
        TaskPromise::new(state)
    }

    fn set_next_machine(&self, machine: MachineId) {
        self.lock_control().queued = Some(machine);
    }

    fn request_shutdown(&self) {
        self.lock_control().shutdown = true;
    }
}

// ---------------------------------------------------------------------------
// In-worker context
// ---------------------------------------------------------------------------

thread_local! {
    /// The scheduler this worker belongs to, installed for the worker's
    /// lifetime so function and task bodies can reach the control surface
    /// without capturing handles.
    static CURRENT: RefCell<Option<Arc<Shared>>> = const { RefCell::new(None) };
}

fn with_current<R>(f: impl FnOnce(&Shared) -> R) -> R {
    CURRENT.with(|c| {
        let borrowed = c.borrow();
        let shared = borrowed
            .as_ref()
            .expect("scheduler control called outside a scheduler worker");
        f(shared)
    })
}

/// Issues a task from inside a function or task body.
///
/// Identical in effect to [`SchedulerHandle::issue_task`]; this form reads
/// the scheduler from worker-thread state.
///
/// # Panics
///
/// Panics when called from a thread that is not a scheduler worker.
pub fn issue_task<F>(func: F, arg: TaskArg) -> TaskPromise
where
    F: FnOnce(TaskArg) + Send + 'static,
{
    with_current(|shared| shared.issue_task(Box::new(func), arg))
}

/// Marks the machine to run after the current one drains. In-worker form of
/// [`SchedulerHandle::set_next_machine`].
///
/// # Panics
///
/// Panics when called from a thread that is not a scheduler worker.
pub fn set_next_machine(machine: MachineId) {
    with_current(|shared| shared.set_next_machine(machine));
}

/// Ends the run loop after the current machine drains. In-worker form of
/// [`SchedulerHandle::request_shutdown`].
///
/// # Panics
///
/// Panics when called from a thread that is not a scheduler worker.
pub fn request_shutdown() {
    with_current(|shared| shared.request_shutdown());
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Clonable control surface for threads outside the pool.
///
/// Tasks issued through a handle and tasks issued from inside a worker land
/// in the same queue and behave identically.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Enqueues an ad-hoc task carrying `arg` and returns its promise.
    ///
    /// Workers exist from [`Scheduler::new`], so tasks execute even before
    /// (or without) [`Scheduler::run`]. Tasks still queued when the
    /// scheduler shuts down are dropped and their promises never complete.
    pub fn issue_task<F>(&self, func: F, arg: TaskArg) -> TaskPromise
    where
        F: FnOnce(TaskArg) + Send + 'static,
    {
        self.shared.issue_task(Box::new(func), arg)
    }

    /// Marks the machine to run after the current one drains. Leaving it
    /// unchanged re-runs the current machine.
    pub fn set_next_machine(&self, machine: MachineId) {
        self.shared.set_next_machine(machine);
    }

    /// Ends the run loop after the current machine drains. In-flight work
    /// completes; queued tasks are dropped.
    pub fn request_shutdown(&self) {
        self.shared.request_shutdown();
    }

    /// Size of the worker pool.
    pub fn worker_count(&self) -> usize {
        self.shared.pool_size
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// The machine runner: owns the worker pool and drives machines to
/// completion.
///
/// # Lifecycle
///
/// 1. Build a [`Plan`] with [`crate::Registry`], including a default
///    machine.
/// 2. `Scheduler::new(plan, config)` spawns the pool; workers park until
///    work arrives.
/// 3. Grab a [`SchedulerHandle`] if outside threads need the control
///    surface, then call [`Scheduler::run`].
/// 4. `run` executes machines until shutdown is requested, then joins the
///    pool and returns a [`RunReport`].
///
/// The queued machine persists across drains, so a machine that neither
/// switches machines nor requests shutdown re-runs indefinitely. Hosts end
/// the loop with [`request_shutdown`] (in-worker) or
/// [`SchedulerHandle::request_shutdown`].
pub struct Scheduler {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<WorkerMetrics>>,
}

impl Scheduler {
    /// Spawns the worker pool over a frozen plan.
    ///
    /// # Panics
    ///
    /// Panics if the plan has no default machine (a startup precondition)
    /// or if the configuration is invalid.
    pub fn new(plan: Plan, config: SchedulerConfig) -> Self {
        config.validate();
        let default = plan.default_machine();
        assert!(
            default.is_some(),
            "no default machine designated; register one before starting the scheduler"
        );

        let pool_size = config.pool_size();
        let shared = Arc::new(Shared {
            plan,
            exec: Mutex::new(ExecState {
                queues: WorkQueues::new(),
                counters: RunCounters::empty(),
                active: None,
                working: 0,
                terminate: false,
            }),
            work_cv: Condvar::new(),
            drained_cv: Condvar::new(),
            control: Mutex::new(Control {
                queued: default,
                current: None,
                shutdown: false,
            }),
            panic_slot: Mutex::new(None),
            pool_size,
        });

        let mut threads = Vec::with_capacity(pool_size);
        for id in 0..pool_size {
            let shared = Arc::clone(&shared);
            let th = thread::Builder::new()
                .name(format!("trellis-worker-{id}"))
                .spawn(move || {
                    worker_id::enter(id, shared.pool_size);
                    CURRENT.with(|c| *c.borrow_mut() = Some(Arc::clone(&shared)));

                    let mut metrics = WorkerMetrics::default();
                    worker_loop(&shared, &mut metrics);

                    CURRENT.with(|c| *c.borrow_mut() = None);
                    worker_id::exit();
                    metrics
                })
                .expect("failed to spawn scheduler worker thread");
            threads.push(th);
        }

        Self { shared, threads }
    }

    /// Control surface for threads outside the pool.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Size of the worker pool.
    pub fn worker_count(&self) -> usize {
        self.shared.pool_size
    }

    /// Runs machines until shutdown is requested, then stops the pool.
    ///
    /// Each iteration promotes the queued machine (the previous one if
    /// unchanged), rebuilds the readiness counters, seeds the function
    /// queue with the machine's independents, and blocks until the machine
    /// drains. On shutdown, tasks still queued are dropped (counted in the
    /// report) and in-flight work completes.
    ///
    /// # Panics
    ///
    /// Re-raises the first panic that escaped a function body, after the
    /// machine has drained and the pool has joined.
    pub fn run(mut self) -> RunReport {
        let mut report = RunReport::default();

        loop {
            let machine = {
                let mut control = self.shared.lock_control();
                if control.shutdown {
                    break;
                }
                let machine = control
                    .queued
                    .expect("queued machine cleared while running");
                control.current = Some(machine);
                machine
            };

            self.start_machine(machine);
            self.await_drain();
            self.shared.lock_control().current = None;
            report.machine_runs += 1;

            // A function body panicked: the machine drained cleanly, now
            // stop and re-raise below.
            if self.shared.lock_panic_slot().is_some() {
                break;
            }
        }

        report.tasks_dropped_at_shutdown = self.terminate_pool() as u64;
        for th in self.threads.drain(..) {
            match th.join() {
                Ok(metrics) => report.merge_worker(metrics),
                Err(payload) => self.shared.record_panic(payload),
            }
        }

        if let Some(payload) = self.shared.lock_panic_slot().take() {
            panic::resume_unwind(payload);
        }
        report
    }

    /// Rebuilds per-run counters and seeds the function queue, then wakes
    /// the whole pool.
    fn start_machine(&self, machine: MachineId) {
        {
            let mut exec = self.shared.lock_exec();
            let ExecState {
                queues,
                counters,
                active,
                ..
            } = &mut *exec;
            *counters = RunCounters::for_machine(&self.shared.plan, machine);
            *active = Some(machine);
            counters.seed(&self.shared.plan, machine, &mut |locant| {
                queues.push_func(locant)
            });
        }
        self.shared.work_cv.notify_all();
    }

    /// Blocks until the active machine quiesces. A machine with no function
    /// work satisfies the predicate immediately.
    fn await_drain(&self) {
        let mut exec = self.shared.lock_exec();
        while !(exec.queues.funcs_empty() && exec.working == 0) {
            exec = self
                .shared
                .drained_cv
                .wait(exec)
                .expect("scheduler drain condvar poisoned");
        }
        debug_assert!(
            exec.counters.settled(),
            "machine drained with non-zero readiness counters"
        );
        exec.active = None;
    }

    /// Sets the termination flag, drops queued tasks, and wakes every
    /// worker. Returns the number of orphaned tasks.
    fn terminate_pool(&self) -> usize {
        let dropped = {
            let mut exec = self.shared.lock_exec_or_recover();
            exec.terminate = true;
            exec.active = None;
            exec.queues.clear_tasks()
        };
        self.shared.work_cv.notify_all();
        dropped
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Reached with live threads only when `run` was never called (`run`
        // consumes self and drains `threads`). Stop the parked pool instead
        // of leaking it.
        if self.threads.is_empty() {
            return;
        }
        self.terminate_pool();
        for th in self.threads.drain(..) {
            let _ = th.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

fn worker_loop(shared: &Arc<Shared>, metrics: &mut WorkerMetrics) {
    let mut exec = shared.lock_exec();
    loop {
        if exec.terminate {
            break;
        }

        match exec.queues.pop() {
            Some(Work::Func(locant)) => {
                // The increment must happen before the lock is released so
                // the quiescence predicate cannot observe "queue empty,
                // nobody working" while this function is in limbo.
                exec.working += 1;
                let machine = exec
                    .active
                    .expect("function dequeued with no active machine");
                drop(exec);

                run_graph_func(shared, machine, locant);
                metrics.funcs_executed = metrics.funcs_executed.saturating_add(1);

                exec = shared.lock_exec();
                {
                    let ExecState {
                        queues,
                        counters,
                        working,
                        ..
                    } = &mut *exec;
                    counters.retire(&shared.plan, machine, locant, &mut |ready| {
                        queues.push_func(ready);
                        shared.work_cv.notify_one();
                    });
                    *working -= 1;
                }
                if exec.queues.funcs_empty() && exec.working == 0 {
                    shared.drained_cv.notify_all();
                }
            }
            Some(Work::Task(task)) => {
                drop(exec);
                run_task(task, metrics);
                exec = shared.lock_exec();
            }
            None => {
                if exec.queues.funcs_empty() && exec.working == 0 {
                    shared.drained_cv.notify_all();
                }
                metrics.idle_waits = metrics.idle_waits.saturating_add(1);
                exec = shared
                    .work_cv
                    .wait(exec)
                    .expect("scheduler work condvar poisoned");
            }
        }
    }
}

/// Executes one graph function outside the lock, containing panics.
fn run_graph_func(shared: &Shared, machine: MachineId, locant: FuncLocant) {
    let outer = shared.plan.machine(machine);
    let stage = outer.node(locant.stage_node).payload;
    let body = &shared.plan.stage(stage).node(locant.func_node).payload;

    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| body())) {
        shared.record_panic(payload);
    }
}

/// Executes one task outside the lock and completes its promise. The
/// worker's clone of the promise state is held across execution and dropped
/// after completion.
fn run_task(task: QueuedTask, metrics: &mut WorkerMetrics) {
    let QueuedTask { run, arg, state } = task;
    let failed = panic::catch_unwind(AssertUnwindSafe(|| run(arg))).is_err();
    state.complete(failed);

    metrics.tasks_executed = metrics.tasks_executed.saturating_add(1);
    if failed {
        metrics.tasks_failed = metrics.tasks_failed.saturating_add(1);
    }
}
