//! Executable graph arena shared by both scheduling levels.
//!
//! One generic node-vector graph serves the outer (stages of a machine) and
//! inner (functions of a stage) levels; only the payload type differs. Node
//! indices are allocated once and stay stable, so link handles can name
//! nodes before their payloads exist. Graphs are append-only while drafting
//! and immutable once frozen.

/// A node of a frozen graph.
pub(crate) struct Node<P> {
    pub payload: P,
    /// Indices of nodes that depend on this one (same graph).
    pub dependants: Vec<u32>,
    /// Static dependency count, mirrored into per-run counters.
    pub in_degree: u32,
}

/// Frozen, executable graph: nodes plus the cached zero-in-degree index.
pub(crate) struct ExecGraph<P> {
    nodes: Vec<Node<P>>,
    independents: Vec<u32>,
}

impl<P> ExecGraph<P> {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, idx: u32) -> &Node<P> {
        &self.nodes[idx as usize]
    }

    /// Indices of nodes with no dependencies, in allocation order.
    pub fn independents(&self) -> &[u32] {
        &self.independents
    }
}

/// A node under construction. `payload` is `None` between reservation and
/// binding, which is what makes forward dependency references possible.
struct DraftNode<P> {
    payload: Option<P>,
    dependants: Vec<u32>,
    in_degree: u32,
}

/// Graph under construction. Nodes are reserved first (allocating a stable
/// index) and bound later, in either order relative to the edges that name
/// them.
pub(crate) struct DraftGraph<P> {
    nodes: Vec<DraftNode<P>>,
}

/// Faults detected when freezing a draft graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DraftFault {
    /// A reserved node was never bound.
    Unbound { node: u32 },
    /// The dependency edges contain a cycle.
    Cycle,
}

impl<P> DraftGraph<P> {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Allocates a node index with no payload or edges yet.
    pub fn reserve(&mut self) -> u32 {
        debug_assert!(self.nodes.len() < u32::MAX as usize);
        let idx = self.nodes.len() as u32;
        self.nodes.push(DraftNode {
            payload: None,
            dependants: Vec::new(),
            in_degree: 0,
        });
        idx
    }

    pub fn is_bound(&self, node: u32) -> bool {
        self.nodes[node as usize].payload.is_some()
    }

    /// Binds a reserved node: sets its payload, records its dependency
    /// count, and appends it to each dependency's dependant list.
    ///
    /// Callers must reject duplicate binds (`is_bound`) before calling.
    pub fn bind(&mut self, node: u32, payload: P, deps: &[u32]) {
        debug_assert!(!self.is_bound(node), "node bound twice");
        {
            let n = &mut self.nodes[node as usize];
            n.payload = Some(payload);
            n.in_degree = deps.len() as u32;
        }
        for &dep in deps {
            self.nodes[dep as usize].dependants.push(node);
        }
    }

    /// Validates the draft and produces the executable form.
    ///
    /// Checks that every node was bound and that the edges are acyclic
    /// (Kahn's algorithm), then caches the independent-node index.
    pub fn freeze(self) -> Result<ExecGraph<P>, DraftFault> {
        let mut remaining: Vec<u32> = Vec::with_capacity(self.nodes.len());
        for (idx, node) in self.nodes.iter().enumerate() {
            if node.payload.is_none() {
                return Err(DraftFault::Unbound { node: idx as u32 });
            }
            remaining.push(node.in_degree);
        }

        let mut ready: Vec<u32> = (0..self.nodes.len() as u32)
            .filter(|&i| remaining[i as usize] == 0)
            .collect();
        let independents = ready.clone();

        let mut visited = 0usize;
        while let Some(idx) = ready.pop() {
            visited += 1;
            for &dep in &self.nodes[idx as usize].dependants {
                let r = &mut remaining[dep as usize];
                *r -= 1;
                if *r == 0 {
                    ready.push(dep);
                }
            }
        }
        if visited != self.nodes.len() {
            return Err(DraftFault::Cycle);
        }

        let nodes = self
            .nodes
            .into_iter()
            .map(|n| Node {
                payload: n.payload.expect("checked above"),
                dependants: n.dependants,
                in_degree: n.in_degree,
            })
            .collect();

        Ok(ExecGraph {
            nodes,
            independents,
        })
    }
}
