//! Static task-graph scheduler for in-process parallel execution.
//!
//! # Overview
//!
//! Hosts declare a hierarchy of work once, at startup: **machines**
//! (top-level execution plans) are outer DAGs of **stages**, and each stage
//! is an inner DAG of **functions** (nullary units of work). The scheduler
//! runs the active machine to completion on a fixed worker pool, honoring
//! every dependency edge, then transitions to the next queued machine (or
//! re-runs the same one) until shutdown is requested. Alongside graph
//! work, any thread may issue ad-hoc **tasks** carrying an opaque argument
//! and await them through a reference-counted promise.
//!
//! # Architecture
//!
//! ```text
//!   Registry (builder) ──freeze──► Plan (immutable graphs)
//!                                    │
//!                                    ▼
//!   ┌──────────────────────────────────────────────────────────┐
//!   │ Scheduler                                                │
//!   │                                                          │
//!   │  machine runner ──seed──► function queue ─┐              │
//!   │       ▲                   task queue ─────┤ one mutex    │
//!   │       │ drained_cv                        ▼              │
//!   │       └───────────────── worker 0 … worker N-1           │
//!   │                          (functions first, tasks after)  │
//!   └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`registry`] | Declarative registration builder and the frozen [`Plan`] |
//! | [`errors`] | Registration error taxonomy |
//! | [`runtime`] | Worker pool, machine runner, control surface |
//! | [`promise`] | Reference-counted task completion handles |
//! | [`batch`] | Per-worker container slots for lock-free aggregation |
//! | [`worker_id`](mod@crate::worker_id) | Thread-local worker identity |
//! | [`metrics`] | Per-worker counters and the aggregated [`RunReport`] |
//!
//! # Ordering guarantees
//!
//! - If *a* depends on *b* (at either graph level), *b* completes before
//!   *a* begins; nodes without a path interleave freely.
//! - Every function node of a machine executes exactly once per run.
//! - A machine is complete only when every stage has drained, the function
//!   queue is empty, and no worker is inside a function body.
//! - Between tasks, and between tasks and graph work: no ordering.
//!
//! # Usage
//!
//! ```ignore
//! use trellis::{Registry, Scheduler, SchedulerConfig};
//!
//! let mut reg = Registry::new();
//! let machine = reg.machine();
//! let stage = reg.stage();
//!
//! let load = reg.add_func(stage, || println!("load"), &[])?;
//! reg.add_func(stage, move || {
//!     println!("process");
//!     trellis::request_shutdown();
//! }, &[load])?;
//!
//! reg.add_stage(machine, stage, &[])?;
//! reg.set_default_machine(machine)?;
//!
//! let sched = Scheduler::new(reg.freeze()?, SchedulerConfig::default());
//! let report = sched.run();
//! assert_eq!(report.funcs_executed, 2);
//! ```
//!
//! # Caller restrictions
//!
//! - [`worker_id`](crate::worker_id()) and [`worker_count`] panic outside a
//!   worker; so do the in-worker control functions.
//! - Joining a promise from inside a task body can starve a small pool;
//!   the scheduler does not detect this.
//! - Tasks still queued at shutdown are dropped; their promises never
//!   complete ([`RunReport::tasks_dropped_at_shutdown`] counts them).

pub mod batch;
pub mod errors;
pub mod metrics;
pub mod promise;
pub mod registry;
pub mod runtime;
pub mod worker_id;

mod graph;
mod queue;
mod readiness;

pub use batch::Batch;
pub use errors::{GraphId, RegistryError};
pub use metrics::{RunReport, WorkerMetrics};
pub use promise::{TaskArg, TaskPromise};
pub use registry::{FuncLink, MachineId, Plan, Registry, StageId, StageLink};
pub use runtime::{
    issue_task, request_shutdown, set_next_machine, Scheduler, SchedulerConfig, SchedulerHandle,
};
pub use worker_id::{try_worker_id, worker_count, worker_id};
