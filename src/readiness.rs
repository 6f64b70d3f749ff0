//! Per-run readiness counters for the active machine.
//!
//! # Model
//!
//! Counters mirror static in-degrees at machine start and are decremented as
//! predecessors finish. Two levels are tracked:
//!
//! - `stage_remaining[s]`: outer in-degree left for stage node `s`;
//! - `func_remaining[s][f]`: inner in-degree left for function node `f`
//!   within stage node `s`;
//! - `funcs_in_flight[s]`: function nodes of `s` currently queued or
//!   running.
//!
//! A stage node drains when `funcs_in_flight` reaches zero after a retire.
//! In an acyclic inner graph seeded with its independents, in-flight
//! reaching zero implies every node has run: any unexecuted node would sit
//! on a dependency chain ending at an independent node, which was seeded and
//! therefore counted in-flight. Draining decrements dependant stages'
//! remaining counts and activates those that reach zero; activating a stage
//! with an empty inner graph drains it on the spot, and the cascade is
//! processed iteratively. `stage_drained` is a one-shot flag asserting each
//! stage drains exactly once per run.
//!
//! This type is pure bookkeeping: callers drive it under the scheduler's
//! queue mutex, and every decrement is atomic with the enqueues it causes
//! because both happen under that one lock. Counters index stage *nodes*,
//! not stage identities, so a stage linked twice into one machine is
//! tracked (and executed) once per appearance.

use crate::queue::FuncLocant;
use crate::registry::{MachineId, Plan};

#[derive(Default)]
pub(crate) struct RunCounters {
    stage_remaining: Vec<u32>,
    func_remaining: Vec<Vec<u32>>,
    funcs_in_flight: Vec<u32>,
    stage_drained: Vec<bool>,
}

impl RunCounters {
    /// Placeholder used before the first machine starts.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshots static in-degrees for one machine run.
    pub fn for_machine(plan: &Plan, machine: MachineId) -> Self {
        let outer = plan.machine(machine);
        let stage_count = outer.len();

        let mut stage_remaining = Vec::with_capacity(stage_count);
        let mut func_remaining = Vec::with_capacity(stage_count);
        for idx in 0..stage_count as u32 {
            let node = outer.node(idx);
            stage_remaining.push(node.in_degree);

            let inner = plan.stage(node.payload);
            let per_func = (0..inner.len() as u32)
                .map(|f| inner.node(f).in_degree)
                .collect();
            func_remaining.push(per_func);
        }

        Self {
            stage_remaining,
            func_remaining,
            funcs_in_flight: vec![0; stage_count],
            stage_drained: vec![false; stage_count],
        }
    }

    /// Pushes the initial ready set: every independent function of every
    /// independent stage. Independent stages with empty inner graphs drain
    /// immediately and cascade.
    pub fn seed(
        &mut self,
        plan: &Plan,
        machine: MachineId,
        push: &mut dyn FnMut(FuncLocant),
    ) {
        let outer = plan.machine(machine);
        let mut drained = Vec::new();
        for idx in 0..outer.len() as u32 {
            if outer.node(idx).in_degree == 0 {
                self.activate(plan, machine, idx, push, &mut drained);
            }
        }
        self.propagate_drained(plan, machine, drained, push);
    }

    /// Accounts for one finished function node.
    ///
    /// Order matters: in-flight is decremented first, then same-stage
    /// dependants are decremented (re-incrementing in-flight for each one
    /// that becomes ready), and only then is the drain check made. The check
    /// therefore cannot fire while a newly readied function of the same
    /// stage is being enqueued.
    pub fn retire(
        &mut self,
        plan: &Plan,
        machine: MachineId,
        done: FuncLocant,
        push: &mut dyn FnMut(FuncLocant),
    ) {
        let s = done.stage_node as usize;
        self.funcs_in_flight[s] -= 1;

        let outer = plan.machine(machine);
        let inner = plan.stage(outer.node(done.stage_node).payload);
        for &dep in &inner.node(done.func_node).dependants {
            let remaining = &mut self.func_remaining[s][dep as usize];
            *remaining -= 1;
            if *remaining == 0 {
                self.funcs_in_flight[s] += 1;
                push(FuncLocant {
                    stage_node: done.stage_node,
                    func_node: dep,
                });
            }
        }

        if self.funcs_in_flight[s] == 0 {
            self.propagate_drained(plan, machine, vec![done.stage_node], push);
        }
    }

    /// Activates a stage node whose outer in-degree reached zero: enqueues
    /// its inner independents, or records it as drained if it has none.
    fn activate(
        &mut self,
        plan: &Plan,
        machine: MachineId,
        stage_node: u32,
        push: &mut dyn FnMut(FuncLocant),
        drained: &mut Vec<u32>,
    ) {
        let outer = plan.machine(machine);
        let inner = plan.stage(outer.node(stage_node).payload);
        if inner.len() == 0 {
            drained.push(stage_node);
            return;
        }

        let independents = inner.independents();
        self.funcs_in_flight[stage_node as usize] += independents.len() as u32;
        for &func_node in independents {
            push(FuncLocant {
                stage_node,
                func_node,
            });
        }
    }

    /// Processes drained stage nodes: marks each (exactly once per run),
    /// decrements dependant stages, and activates those that reach zero.
    /// Activation may drain further empty stages; the worklist keeps the
    /// whole cascade inside the caller's critical section.
    fn propagate_drained(
        &mut self,
        plan: &Plan,
        machine: MachineId,
        mut worklist: Vec<u32>,
        push: &mut dyn FnMut(FuncLocant),
    ) {
        let outer = plan.machine(machine);
        while let Some(stage_node) = worklist.pop() {
            let s = stage_node as usize;
            debug_assert!(!self.stage_drained[s], "stage node drained twice");
            self.stage_drained[s] = true;

            for &dep in &outer.node(stage_node).dependants {
                let remaining = &mut self.stage_remaining[dep as usize];
                *remaining -= 1;
                if *remaining == 0 {
                    self.activate(plan, machine, dep, push, &mut worklist);
                }
            }
        }
    }

    /// True when every counter is back to zero and every stage has drained.
    /// Holds at machine drain; checked by a debug assertion there.
    pub fn settled(&self) -> bool {
        self.stage_remaining.iter().all(|&r| r == 0)
            && self.funcs_in_flight.iter().all(|&n| n == 0)
            && self
                .func_remaining
                .iter()
                .all(|per_stage| per_stage.iter().all(|&r| r == 0))
            && self.stage_drained.iter().all(|&d| d)
    }
}
