//! The two execution queues.
//!
//! Graph work and ad-hoc task work share one mutex (held by the caller; this
//! module is just the data) and one pair of FIFOs. Function work takes
//! priority when both queues are non-empty: machine completion blocks on the
//! function queue draining, while task work is opportunistic and must not
//! delay machine progress.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::promise::{TaskArg, TaskState};

/// Position of a function node within the active machine: the stage node in
/// the outer graph plus the function node in that stage's inner graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FuncLocant {
    pub stage_node: u32,
    pub func_node: u32,
}

/// A queued ad-hoc task: the callable, its moved argument, and a second
/// reference to the promise state (held for the duration of execution).
pub(crate) struct QueuedTask {
    pub run: Box<dyn FnOnce(TaskArg) + Send + 'static>,
    pub arg: TaskArg,
    pub state: Arc<TaskState>,
}

/// One unit of work picked by a worker.
pub(crate) enum Work {
    Func(FuncLocant),
    Task(QueuedTask),
}

/// Both FIFOs. All access happens under the scheduler's queue mutex.
pub(crate) struct WorkQueues {
    funcs: VecDeque<FuncLocant>,
    tasks: VecDeque<QueuedTask>,
}

impl WorkQueues {
    pub fn new() -> Self {
        Self {
            funcs: VecDeque::new(),
            tasks: VecDeque::new(),
        }
    }

    pub fn push_func(&mut self, locant: FuncLocant) {
        self.funcs.push_back(locant);
    }

    pub fn push_task(&mut self, task: QueuedTask) {
        self.tasks.push_back(task);
    }

    /// Removes and returns the next unit of work, functions first.
    pub fn pop(&mut self) -> Option<Work> {
        if let Some(locant) = self.funcs.pop_front() {
            return Some(Work::Func(locant));
        }
        self.tasks.pop_front().map(Work::Task)
    }

    pub fn funcs_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    /// Drops every queued task, returning how many were orphaned. Their
    /// promises never complete.
    pub fn clear_tasks(&mut self) -> usize {
        let dropped = self.tasks.len();
        self.tasks.clear();
        dropped
    }
}
