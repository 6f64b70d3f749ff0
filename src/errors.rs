//! Registration error types.
//!
//! All registration faults are reported before any worker thread exists, so
//! every variant here is a build-time (host programming) error rather than a
//! runtime condition. The enum is `#[non_exhaustive]` to allow adding
//! variants without breaking callers; consumers should include a fallback
//! match arm.

use std::fmt;

use crate::registry::{MachineId, StageId};

/// Identifies the graph a registration fault occurred in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GraphId {
    /// The inner (function-level) graph of a stage.
    Stage(StageId),
    /// The outer (stage-level) graph of a machine.
    Machine(MachineId),
}

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage(s) => write!(f, "stage {}", s.index()),
            Self::Machine(m) => write!(f, "machine {}", m.index()),
        }
    }
}

/// Errors raised while declaring machines, stages, and links, or while
/// freezing the registry into an executable plan.
#[derive(Debug)]
#[non_exhaustive]
pub enum RegistryError {
    /// A link identity was bound twice.
    DuplicateLink { graph: GraphId, node: u32 },
    /// A dependency names a link that belongs to a different graph.
    CrossGraphDependency { graph: GraphId, dependency: GraphId },
    /// A reserved link was never bound before `freeze`.
    UnboundLink { graph: GraphId, node: u32 },
    /// The dependency edges of a graph form a cycle.
    CycleDetected { graph: GraphId },
    /// A default machine was already designated.
    DefaultAlreadySet { current: MachineId },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateLink { graph, node } => {
                write!(f, "link {node} in {graph} registered twice")
            }
            Self::CrossGraphDependency { graph, dependency } => {
                write!(f, "dependency in {graph} names a link from {dependency}")
            }
            Self::UnboundLink { graph, node } => {
                write!(f, "link {node} in {graph} reserved but never bound")
            }
            Self::CycleDetected { graph } => {
                write!(f, "dependency cycle in {graph}")
            }
            Self::DefaultAlreadySet { current } => {
                write!(
                    f,
                    "default machine already set to machine {}",
                    current.index()
                )
            }
        }
    }
}

impl std::error::Error for RegistryError {}
