//! Declarative registration surface and the frozen execution plan.
//!
//! # Overview
//!
//! Hosts describe their work hierarchy once, at startup, through a
//! [`Registry`] builder:
//!
//! - [`Registry::machine`] / [`Registry::stage`] mint identities.
//! - [`Registry::add_func`] / [`Registry::add_stage`] insert a node into the
//!   target graph and wire its dependency edges in one call.
//! - [`Registry::func_link`] / [`Registry::stage_link`] reserve a link
//!   identity *without* binding it, so a dependency list may name a link
//!   that is filled in later. A link's node index is stable from first
//!   reservation onward; registration order cannot change the final graph.
//! - [`Registry::set_default_machine`] nominates the machine the scheduler
//!   starts with.
//! - [`Registry::freeze`] validates everything (unbound links, cycles),
//!   caches each graph's independent nodes, and produces an immutable
//!   [`Plan`].
//!
//! Once a [`Plan`] exists the graphs are read-only; workers traverse them
//! without locks.
//!
//! # Link identity
//!
//! A [`FuncLink`] is the identity of one "function into stage" edge bundle,
//! and is the handle other registrations use to declare "run me after that
//! one". It carries its owning stage, which makes a dependency on a link
//! from a different stage detectable at bind time
//! ([`RegistryError::CrossGraphDependency`]). [`StageLink`] is the same
//! thing one level up.

use crate::errors::{GraphId, RegistryError};
use crate::graph::{DraftFault, DraftGraph, ExecGraph};

/// The callable payload of a function node.
pub(crate) type FuncBody = Box<dyn Fn() + Send + Sync + 'static>;

/// Identity of a registered machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MachineId(u32);

impl MachineId {
    pub(crate) fn index(self) -> u32 {
        self.0
    }
}

/// Identity of a registered stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StageId(u32);

impl StageId {
    pub(crate) fn index(self) -> u32 {
        self.0
    }
}

/// Identity of a function-to-stage link; names a node in one stage's inner
/// graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FuncLink {
    stage: StageId,
    node: u32,
}

/// Identity of a stage-to-machine link; names a node in one machine's outer
/// graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageLink {
    machine: MachineId,
    node: u32,
}

/// Registration builder. Populated before the scheduler starts, then
/// consumed by [`Registry::freeze`].
#[derive(Default)]
pub struct Registry {
    stages: Vec<DraftGraph<FuncBody>>,
    machines: Vec<DraftGraph<StageId>>,
    default_machine: Option<MachineId>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            machines: Vec::new(),
            default_machine: None,
        }
    }

    /// Declares a new machine.
    pub fn machine(&mut self) -> MachineId {
        let id = MachineId(self.machines.len() as u32);
        self.machines.push(DraftGraph::new());
        id
    }

    /// Declares a new stage. A stage may later be linked into any number of
    /// machines; its inner graph is shared across those appearances.
    pub fn stage(&mut self) -> StageId {
        let id = StageId(self.stages.len() as u32);
        self.stages.push(DraftGraph::new());
        id
    }

    /// Reserves a function link in `stage` without binding it.
    ///
    /// The returned handle may appear in dependency lists immediately; bind
    /// it later with [`Registry::bind_func`]. Every reserved link must be
    /// bound before [`Registry::freeze`].
    pub fn func_link(&mut self, stage: StageId) -> FuncLink {
        let node = self.stages[stage.0 as usize].reserve();
        FuncLink { stage, node }
    }

    /// Reserves a stage link in `machine` without binding it.
    pub fn stage_link(&mut self, machine: MachineId) -> StageLink {
        let node = self.machines[machine.0 as usize].reserve();
        StageLink { machine, node }
    }

    /// Binds a reserved function link: sets the callable and declares the
    /// sibling links whose functions must complete first.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::DuplicateLink`] if `link` was already bound.
    /// - [`RegistryError::CrossGraphDependency`] if a dependency belongs to
    ///   a different stage.
    pub fn bind_func<F>(
        &mut self,
        link: FuncLink,
        func: F,
        deps: &[FuncLink],
    ) -> Result<(), RegistryError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let graph_id = GraphId::Stage(link.stage);
        for dep in deps {
            if dep.stage != link.stage {
                return Err(RegistryError::CrossGraphDependency {
                    graph: graph_id,
                    dependency: GraphId::Stage(dep.stage),
                });
            }
        }
        let graph = &mut self.stages[link.stage.0 as usize];
        if graph.is_bound(link.node) {
            return Err(RegistryError::DuplicateLink {
                graph: graph_id,
                node: link.node,
            });
        }
        let dep_nodes: Vec<u32> = deps.iter().map(|d| d.node).collect();
        graph.bind(link.node, Box::new(func), &dep_nodes);
        Ok(())
    }

    /// Registers a function into `stage` in one step: reserve plus bind.
    pub fn add_func<F>(
        &mut self,
        stage: StageId,
        func: F,
        deps: &[FuncLink],
    ) -> Result<FuncLink, RegistryError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let link = self.func_link(stage);
        self.bind_func(link, func, deps)?;
        Ok(link)
    }

    /// Binds a reserved stage link. Symmetric to [`Registry::bind_func`],
    /// one level up.
    pub fn bind_stage(
        &mut self,
        link: StageLink,
        stage: StageId,
        deps: &[StageLink],
    ) -> Result<(), RegistryError> {
        let graph_id = GraphId::Machine(link.machine);
        for dep in deps {
            if dep.machine != link.machine {
                return Err(RegistryError::CrossGraphDependency {
                    graph: graph_id,
                    dependency: GraphId::Machine(dep.machine),
                });
            }
        }
        let graph = &mut self.machines[link.machine.0 as usize];
        if graph.is_bound(link.node) {
            return Err(RegistryError::DuplicateLink {
                graph: graph_id,
                node: link.node,
            });
        }
        let dep_nodes: Vec<u32> = deps.iter().map(|d| d.node).collect();
        graph.bind(link.node, stage, &dep_nodes);
        Ok(())
    }

    /// Registers a stage into `machine` in one step: reserve plus bind.
    pub fn add_stage(
        &mut self,
        machine: MachineId,
        stage: StageId,
        deps: &[StageLink],
    ) -> Result<StageLink, RegistryError> {
        let link = self.stage_link(machine);
        self.bind_stage(link, stage, deps)?;
        Ok(link)
    }

    /// Nominates the machine the scheduler runs first.
    ///
    /// # Errors
    ///
    /// [`RegistryError::DefaultAlreadySet`] on the second call.
    pub fn set_default_machine(&mut self, machine: MachineId) -> Result<(), RegistryError> {
        if let Some(current) = self.default_machine {
            return Err(RegistryError::DefaultAlreadySet { current });
        }
        self.default_machine = Some(machine);
        Ok(())
    }

    /// Validates every graph and produces the immutable execution plan.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::UnboundLink`] for a reserved link never bound.
    /// - [`RegistryError::CycleDetected`] for cyclic dependency edges.
    pub fn freeze(self) -> Result<Plan, RegistryError> {
        let mut stages = Vec::with_capacity(self.stages.len());
        for (idx, draft) in self.stages.into_iter().enumerate() {
            let graph_id = GraphId::Stage(StageId(idx as u32));
            stages.push(draft.freeze().map_err(|f| fault_error(graph_id, f))?);
        }

        let mut machines = Vec::with_capacity(self.machines.len());
        for (idx, draft) in self.machines.into_iter().enumerate() {
            let graph_id = GraphId::Machine(MachineId(idx as u32));
            machines.push(draft.freeze().map_err(|f| fault_error(graph_id, f))?);
        }

        Ok(Plan {
            stages,
            machines,
            default_machine: self.default_machine,
        })
    }
}

fn fault_error(graph: GraphId, fault: DraftFault) -> RegistryError {
    match fault {
        DraftFault::Unbound { node } => RegistryError::UnboundLink { graph, node },
        DraftFault::Cycle => RegistryError::CycleDetected { graph },
    }
}

/// Frozen registration snapshot. Read-only for the whole scheduler run; no
/// lock is needed to traverse it.
pub struct Plan {
    stages: Vec<ExecGraph<FuncBody>>,
    machines: Vec<ExecGraph<StageId>>,
    default_machine: Option<MachineId>,
}

// Manual impl: function payloads are not Debug.
impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("stages", &self.stages.len())
            .field("machines", &self.machines.len())
            .field("default_machine", &self.default_machine)
            .finish()
    }
}

impl Plan {
    /// The machine nominated by [`Registry::set_default_machine`], if any.
    pub fn default_machine(&self) -> Option<MachineId> {
        self.default_machine
    }

    pub(crate) fn machine(&self, machine: MachineId) -> &ExecGraph<StageId> {
        &self.machines[machine.0 as usize]
    }

    pub(crate) fn stage(&self, stage: StageId) -> &ExecGraph<FuncBody> {
        &self.stages[stage.0 as usize]
    }
}
