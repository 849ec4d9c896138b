//! Function escape summaries.
//!
//! The externally visible fact computed for a function: a compressed
//! points-to graph (drain count plus edges over `(kind, path)` nodes) and
//! the set of escaping nodes. Summaries are immutable value objects; the
//! interprocedural fixpoint compares them structurally.

use std::cmp::Ordering;

use kestrel_dfir::{Field, INTESTINES_HASH};
use smallvec::SmallVec;

use crate::error::EscapeError;

/// Root of a compressed node: the return slot, a parameter, or a drain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SummaryKind {
    Return,
    Param(u32),
    Drain(u32),
}

impl SummaryKind {
    /// Total order over roots: parameters first, then the return, then
    /// drains by index.
    pub fn absolute_index(self) -> i64 {
        match self {
            SummaryKind::Return => 0,
            SummaryKind::Param(i) => i as i64 - 1_000_000,
            SummaryKind::Drain(i) => i as i64 + 1,
        }
    }
}

impl PartialOrd for SummaryKind {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SummaryKind {
    fn cmp(&self, other: &Self) -> Ordering {
        self.absolute_index().cmp(&other.absolute_index())
    }
}

impl std::fmt::Display for SummaryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SummaryKind::Return => write!(f, "RET"),
            SummaryKind::Param(i) => write!(f, "P{i}"),
            SummaryKind::Drain(i) => write!(f, "D{i}"),
        }
    }
}

/// A node of the compressed graph: a root plus a walk over fields from it.
#[derive(Clone, Debug, Hash)]
pub struct SummaryNode {
    pub kind: SummaryKind,
    pub path: SmallVec<[Field; 2]>,
}

impl SummaryNode {
    pub fn root(kind: SummaryKind) -> Self {
        Self {
            kind,
            path: SmallVec::new(),
        }
    }

    pub fn ret() -> Self {
        Self::root(SummaryKind::Return)
    }

    pub fn param(i: u32) -> Self {
        Self::root(SummaryKind::Param(i))
    }

    pub fn drain(i: u32) -> Self {
        Self::root(SummaryKind::Drain(i))
    }

    /// Extend the walk by one field.
    pub fn child(&self, field: Field) -> Self {
        let mut path = self.path.clone();
        path.push(field);
        Self {
            kind: self.kind,
            path,
        }
    }

    fn path_hashes(&self) -> impl Iterator<Item = i64> + '_ {
        self.path.iter().map(|f| f.hash)
    }
}

impl PartialEq for SummaryNode {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.path_hashes().eq(other.path_hashes())
    }
}

impl Eq for SummaryNode {}

impl PartialOrd for SummaryNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SummaryNode {
    /// Order by root, then lexicographically by path hashes; a strict
    /// prefix sorts before its extensions.
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .cmp(&other.kind)
            .then_with(|| self.path_hashes().cmp(other.path_hashes()))
    }
}

impl std::fmt::Display for SummaryNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        for field in &self.path {
            write!(f, ".{field}")?;
        }
        Ok(())
    }
}

/// A points-to relation between two compressed nodes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SummaryEdge {
    pub from: SummaryNode,
    pub to: SummaryNode,
}

impl SummaryEdge {
    pub fn new(from: SummaryNode, to: SummaryNode) -> Self {
        Self { from, to }
    }
}

impl std::fmt::Display for SummaryEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// The escape summary of one function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionSummary {
    num_drains: u32,
    edges: Vec<SummaryEdge>,
    escapes: Vec<SummaryNode>,
}

impl FunctionSummary {
    /// Sorts and deduplicates, so structural equality is stable under any
    /// input ordering.
    pub fn new(num_drains: u32, mut edges: Vec<SummaryEdge>, mut escapes: Vec<SummaryNode>) -> Self {
        edges.sort();
        edges.dedup();
        escapes.sort();
        escapes.dedup();
        Self {
            num_drains,
            edges,
            escapes,
        }
    }

    /// No drains, no edges, no escapes: the starting assumption for every
    /// function of an SCC under analysis.
    pub fn optimistic() -> Self {
        Self::new(0, Vec::new(), Vec::new())
    }

    /// Every parameter and the return escape: the assumption for unknown or
    /// virtual callees and for functions whose analysis did not converge.
    pub fn pessimistic(param_count: u32) -> Self {
        let escapes = (0..param_count)
            .map(SummaryNode::param)
            .chain(std::iter::once(SummaryNode::ret()))
            .collect();
        Self::new(0, Vec::new(), escapes)
    }

    /// Decode the packed annotations carried by runtime-provided functions.
    ///
    /// `escapes_mask` is a bitset over parameter indices with the bit at
    /// `points_to.len() - 1` denoting the return. `points_to[i]` holds one
    /// nibble per target `j` at position `4*j`:
    ///
    /// | code | edge                              |
    /// |------|-----------------------------------|
    /// | 0    | none                              |
    /// | 1    | `Pi -> Pj`                        |
    /// | 2    | `Pi -> Pj.intestines`             |
    /// | 3    | `Pi.intestines -> Pj`             |
    /// | 4    | `Pi.intestines -> Pj.intestines`  |
    ///
    /// Any other code is an integration bug.
    pub fn from_bits(escapes_mask: u32, points_to: &[u32]) -> Result<Self, EscapeError> {
        let slots = points_to.len() as u32;
        let Some(param_count) = slots.checked_sub(1) else {
            return Ok(Self::optimistic());
        };
        let node_at = |i: u32| {
            if i == param_count {
                SummaryNode::ret()
            } else {
                SummaryNode::param(i)
            }
        };

        let mut escapes = Vec::new();
        for i in 0..slots.min(32) {
            if escapes_mask & (1 << i) != 0 {
                escapes.push(node_at(i));
            }
        }

        let mut edges = Vec::new();
        for (i, &word) in points_to.iter().enumerate() {
            let i = i as u32;
            for j in 0..slots.min(8) {
                let code = (word >> (4 * j)) & 0xF;
                let (from, to) = match code {
                    0 => continue,
                    1 => (node_at(i), node_at(j)),
                    2 => (node_at(i), node_at(j).child(Field::intestines())),
                    3 => (node_at(i).child(Field::intestines()), node_at(j)),
                    4 => (
                        node_at(i).child(Field::intestines()),
                        node_at(j).child(Field::intestines()),
                    ),
                    code => {
                        return Err(EscapeError::InvalidPointsToCode { code, from: i, to: j });
                    }
                };
                edges.push(SummaryEdge::new(from, to));
            }
        }

        Ok(Self::new(0, edges, escapes))
    }

    /// Encode back into the packed form, when the summary is expressible in
    /// it: no drains, every node a parameter or return with at most one
    /// `intestines` step, every escaping node a root.
    pub fn to_bits(&self, param_count: u32) -> Option<(u32, Vec<u32>)> {
        if self.num_drains != 0 || param_count >= 8 {
            return None;
        }
        let slot_of = |node: &SummaryNode| -> Option<(u32, bool)> {
            let slot = match node.kind {
                SummaryKind::Return => param_count,
                SummaryKind::Param(i) if i < param_count => i,
                _ => return None,
            };
            match node.path.as_slice() {
                [] => Some((slot, false)),
                [f] if f.hash == INTESTINES_HASH => Some((slot, true)),
                _ => None,
            }
        };

        let mut escapes_mask = 0u32;
        for node in &self.escapes {
            let (slot, through_field) = slot_of(node)?;
            if through_field {
                return None;
            }
            escapes_mask |= 1 << slot;
        }

        let mut points_to = vec![0u32; param_count as usize + 1];
        for edge in &self.edges {
            let (i, from_inner) = slot_of(&edge.from)?;
            let (j, to_inner) = slot_of(&edge.to)?;
            let code: u32 = match (from_inner, to_inner) {
                (false, false) => 1,
                (false, true) => 2,
                (true, false) => 3,
                (true, true) => 4,
            };
            let shift = 4 * j;
            let existing = (points_to[i as usize] >> shift) & 0xF;
            if existing != 0 && existing != code {
                return None;
            }
            points_to[i as usize] |= code << shift;
        }

        Some((escapes_mask, points_to))
    }

    pub fn num_drains(&self) -> u32 {
        self.num_drains
    }

    pub fn edges(&self) -> &[SummaryEdge] {
        &self.edges
    }

    pub fn escapes(&self) -> &[SummaryNode] {
        &self.escapes
    }
}

impl std::fmt::Display for FunctionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "drains={}", self.num_drains)?;
        if !self.escapes.is_empty() {
            write!(f, " escapes=[")?;
            for (i, node) in self.escapes.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{node}")?;
            }
            write!(f, "]")?;
        }
        if !self.edges.is_empty() {
            write!(f, " edges=[")?;
            for (i, edge) in self.edges.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{edge}")?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}
