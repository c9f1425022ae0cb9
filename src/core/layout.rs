//! Degree-of-freedom layout: the (node, slot) → flat index map.
//!
//! The map is built once per partition layout and shared (read-only) by the assembler,
//! the damping chain, the time integrator and the norm evaluator. Each rank owns one
//! contiguous range of flat indices; nodes owned by rank `k` are numbered before those
//! of rank `k + 1`, and circuit unknowns are appended to the end of their owner's range.

use std::collections::HashMap;
use std::ops::Range;
use std::str::FromStr;

use crate::error::{MixError, Result};

pub type NodeId = usize;

/// Slot positions inside a node's contiguous block.
pub mod slot {
    pub const POTENTIAL: usize = 0;
    pub const ELECTRON: usize = 1;
    pub const HOLE: usize = 2;
}

/// Material role of a region; it alone decides how many unknowns a node carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionRole {
    Semiconductor,
    Insulator,
    Electrode,
    Metal,
    Vacuum,
}

impl RegionRole {
    /// Potential, electron and hole density for semiconductors; potential otherwise.
    pub const fn n_slots(self) -> usize {
        match self {
            RegionRole::Semiconductor => 3,
            _ => 1,
        }
    }
}

impl FromStr for RegionRole {
    type Err = MixError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "semiconductor" => Ok(RegionRole::Semiconductor),
            "insulator" => Ok(RegionRole::Insulator),
            "electrode" => Ok(RegionRole::Electrode),
            "metal" | "conductor" => Ok(RegionRole::Metal),
            "vacuum" => Ok(RegionRole::Vacuum),
            _ => Err(MixError::UnknownRole(s.to_string())),
        }
    }
}

/// One mesh node as seen by the solver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeDof {
    pub node: NodeId,
    /// Index of the owning region in the system's region list.
    pub region: usize,
    pub role: RegionRole,
    /// Rank that owns the node's unknowns.
    pub owner: usize,
    /// Flat index of the node's first slot.
    pub offset: usize,
}

impl NodeDof {
    pub fn n_slots(&self) -> usize {
        self.role.n_slots()
    }

    pub fn index(&self, s: usize) -> usize {
        debug_assert!(s < self.n_slots());
        self.offset + s
    }

    pub fn potential(&self) -> usize {
        self.offset + slot::POTENTIAL
    }
}

/// Immutable (node, slot) → flat index map for one partition layout.
#[derive(Debug, Clone)]
pub struct DofMap {
    nodes: Vec<NodeDof>,
    lookup: HashMap<NodeId, usize>,
    ranges: Vec<Range<usize>>,
    circuit: Range<usize>,
    circuit_owner: usize,
    n_dofs: usize,
}

impl DofMap {
    pub fn builder(n_ranks: usize) -> DofMapBuilder {
        DofMapBuilder::new(n_ranks)
    }

    /// Total number of unknowns across all ranks.
    pub fn n_dofs(&self) -> usize {
        self.n_dofs
    }

    pub fn n_ranks(&self) -> usize {
        self.ranges.len()
    }

    pub fn owned_range(&self, rank: usize) -> Range<usize> {
        self.ranges[rank].clone()
    }

    pub fn nodes(&self) -> &[NodeDof] {
        &self.nodes
    }

    /// Nodes whose unknowns live on `rank`, in flat-index order.
    pub fn owned_nodes(&self, rank: usize) -> impl Iterator<Item = &NodeDof> + '_ {
        self.nodes.iter().filter(move |n| n.owner == rank)
    }

    pub fn node(&self, id: NodeId) -> Result<&NodeDof> {
        self.lookup
            .get(&id)
            .map(|&i| &self.nodes[i])
            .ok_or(MixError::UnknownNode(id))
    }

    pub fn flat_index(&self, id: NodeId, s: usize) -> Result<usize> {
        let node = self.node(id)?;
        if s >= node.n_slots() {
            return Err(MixError::SlotOutOfRange { node: id, slot: s });
        }
        Ok(node.offset + s)
    }

    /// Flat indices of the circuit engine's own unknowns.
    pub fn circuit_range(&self) -> Range<usize> {
        self.circuit.clone()
    }

    pub fn circuit_owner(&self) -> usize {
        self.circuit_owner
    }
}

/// Collects nodes and their owners, then numbers them rank by rank.
#[derive(Debug)]
pub struct DofMapBuilder {
    n_ranks: usize,
    entries: Vec<(NodeId, usize, RegionRole, usize)>,
    circuit_unknowns: usize,
    circuit_owner: Option<usize>,
}

impl DofMapBuilder {
    pub fn new(n_ranks: usize) -> Self {
        Self {
            n_ranks: n_ranks.max(1),
            entries: Vec::new(),
            circuit_unknowns: 0,
            circuit_owner: None,
        }
    }

    pub fn add_node(&mut self, node: NodeId, region: usize, role: RegionRole, owner: usize) -> &mut Self {
        self.entries.push((node, region, role, owner));
        self
    }

    /// Reserve `count` circuit unknowns on `owner` (defaults to the last rank).
    pub fn circuit_unknowns(&mut self, count: usize, owner: Option<usize>) -> &mut Self {
        self.circuit_unknowns = count;
        self.circuit_owner = owner;
        self
    }

    pub fn build(&self) -> Result<DofMap> {
        let circuit_owner = self.circuit_owner.unwrap_or(self.n_ranks - 1);
        if circuit_owner >= self.n_ranks {
            return Err(MixError::Layout(format!(
                "circuit owner {} outside {} ranks",
                circuit_owner, self.n_ranks
            )));
        }

        let mut lookup = HashMap::with_capacity(self.entries.len());
        for &(node, _, _, owner) in &self.entries {
            if owner >= self.n_ranks {
                return Err(MixError::Layout(format!(
                    "node {} owned by rank {} of {}",
                    node, owner, self.n_ranks
                )));
            }
            if lookup.insert(node, usize::MAX).is_some() {
                return Err(MixError::Layout(format!("node {} registered twice", node)));
            }
        }

        let mut nodes = Vec::with_capacity(self.entries.len());
        let mut ranges = Vec::with_capacity(self.n_ranks);
        let mut circuit = 0..0;
        let mut next = 0;
        for rank in 0..self.n_ranks {
            let start = next;
            for &(node, region, role, owner) in &self.entries {
                if owner != rank {
                    continue;
                }
                lookup.insert(node, nodes.len());
                nodes.push(NodeDof { node, region, role, owner, offset: next });
                next += role.n_slots();
            }
            if rank == circuit_owner {
                circuit = next..next + self.circuit_unknowns;
                next += self.circuit_unknowns;
            }
            ranges.push(start..next);
        }

        Ok(DofMap {
            nodes,
            lookup,
            ranges,
            circuit,
            circuit_owner,
            n_dofs: next,
        })
    }
}
