//! The per-function points-to graph.
//!
//! One mutable graph per function under analysis: a node per DFIR value
//! node, plus lazily created field-slot nodes, callee drains materialized at
//! call sites, and the drains synthesized during closure. Nodes live in an
//! arena and refer to each other by [`PtgId`]; the graph is inherently
//! cyclic, so no owning references cross between nodes.

use kestrel_dfir::{
    Arena, CallSite, DfirNode, Field, FunctionBody, Identifier, Lifetime, NodeId, identifier,
};
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::roles::{
    DEPTH_ESCAPES, DEPTH_INFINITY, DEPTH_PARAMETER, DEPTH_RETURN_VALUE, Role, RoleAssignment,
};
use crate::summary::{FunctionSummary, SummaryKind, SummaryNode};

identifier! {
    /// A node of the points-to graph.
    struct PtgId
}

/// Where a PTG node came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PtgOrigin {
    /// Mirrors one DFIR value node.
    Dfir(NodeId),
    /// The dedicated return slot of the function.
    Returns,
    /// A field slot created lazily by [`PointsToGraph::goto_field`].
    FieldSlot,
    /// A callee drain materialized while inlining a call-site summary.
    CalleeDrain,
    /// A drain synthesized during component construction or coalescing.
    Drain,
    /// A helper drain recording that two summary nodes may alias.
    AuxDrain,
}

impl PtgOrigin {
    pub(crate) fn is_synthesized_drain(self) -> bool {
        matches!(self, PtgOrigin::Drain | PtgOrigin::AuxDrain)
    }
}

/// An outgoing edge. `field == None` is an assignment edge; otherwise a
/// field edge labelled with that field.
#[derive(Clone, Debug)]
pub(crate) struct PtgEdge {
    pub(crate) target: PtgId,
    pub(crate) field: Option<Field>,
}

#[derive(Clone, Debug)]
pub(crate) struct PtgNode {
    pub(crate) origin: PtgOrigin,
    pub(crate) depth: i32,
    /// The node's original lexical depth; `DEPTH_INFINITY` for synthetics.
    pub(crate) lexical_depth: i32,
    /// Whether the node carries the return-value role itself (as opposed to
    /// being reached through a field of the return).
    pub(crate) is_actual_return: bool,
    pub(crate) edges: Vec<PtgEdge>,
    /// Sources of incoming assignment edges.
    pub(crate) reversed: Vec<PtgId>,
    /// Cache of outgoing field-edge targets, by field hash.
    pub(crate) field_targets: FxHashMap<i64, PtgId>,
    pub(crate) forced_lifetime: Option<Lifetime>,
    /// Union-find pointer towards the component's drain; `None` for roots.
    pub(crate) drain: Option<PtgId>,
}

impl PtgNode {
    fn new(origin: PtgOrigin, depth: i32, lexical_depth: i32) -> Self {
        Self {
            origin,
            depth,
            lexical_depth,
            is_actual_return: false,
            edges: Vec::new(),
            reversed: Vec::new(),
            field_targets: FxHashMap::default(),
            forced_lifetime: None,
            drain: None,
        }
    }

    pub(crate) fn assignment_targets(&self) -> impl Iterator<Item = PtgId> + '_ {
        self.edges
            .iter()
            .filter(|e| e.field.is_none())
            .map(|e| e.target)
    }

    pub(crate) fn field_edges(&self) -> impl Iterator<Item = (&Field, PtgId)> {
        self.edges
            .iter()
            .filter_map(|e| e.field.as_ref().map(|f| (f, e.target)))
    }

    pub(crate) fn has_assignment_out(&self) -> bool {
        self.edges.iter().any(|e| e.field.is_none())
    }
}

/// The mutable per-function points-to graph.
pub(crate) struct PointsToGraph {
    pub(crate) nodes: Arena<PtgId, PtgNode>,
    /// DFIR node -> PTG node, by arena position.
    of_dfir: Vec<Option<PtgId>>,
    /// Parameter index -> PTG node.
    pub(crate) params: Vec<Option<PtgId>>,
    pub(crate) returns_node: PtgId,
}

impl PointsToGraph {
    /// Seed the graph from a function body and its role assignment: one node
    /// per DFIR value node, edges per role entry, and the dedicated return
    /// slot.
    pub(crate) fn build(body: &FunctionBody, roles: &RoleAssignment) -> Self {
        let mut nodes = Arena::new();
        let mut of_dfir: Vec<Option<PtgId>> = vec![None; body.nodes().len()];
        let mut params: Vec<Option<PtgId>> = vec![None; body.param_count() as usize];

        for (id, node) in body.nodes().iter_with_ids() {
            let Some(info) = roles.get(id) else {
                continue;
            };
            let depth = if info.escapes() {
                DEPTH_ESCAPES
            } else if matches!(node, DfirNode::Parameter { .. }) {
                DEPTH_PARAMETER
            } else if info.has_role(Role::ReturnValue) {
                DEPTH_RETURN_VALUE
            } else {
                info.depth()
            };
            let mut ptg = PtgNode::new(PtgOrigin::Dfir(id), depth, info.depth());
            ptg.is_actual_return = info.has_role(Role::ReturnValue);
            let ptg_id = nodes.alloc(ptg);
            of_dfir[id.index()] = Some(ptg_id);
            if let DfirNode::Parameter { index } = node {
                if let Some(slot) = params.get_mut(*index as usize) {
                    *slot = Some(ptg_id);
                }
            }
        }

        let mut returns = PtgNode::new(PtgOrigin::Returns, DEPTH_RETURN_VALUE, DEPTH_INFINITY);
        returns.is_actual_return = true;
        let returns_node = nodes.alloc(returns);

        let mut graph = Self {
            nodes,
            of_dfir,
            params,
            returns_node,
        };

        for id in body.nodes().ids() {
            let Some(info) = roles.get(id) else {
                continue;
            };
            let Some(this) = graph.of_dfir[id.index()] else {
                continue;
            };
            for entry in info.entries(Role::Assigned) {
                if let Some(value) = entry.node.and_then(|n| graph.of(n)) {
                    graph.add_assignment(this, value);
                }
            }
            for entry in info.entries(Role::WriteField).to_vec() {
                let (Some(value), Some(field)) = (entry.node, entry.field) else {
                    continue;
                };
                let slot = graph.goto_field(this, &field);
                if let Some(value) = graph.of(value) {
                    graph.add_assignment(slot, value);
                }
            }
            for entry in info.entries(Role::ReadField).to_vec() {
                let (Some(read), Some(field)) = (entry.node, entry.field) else {
                    continue;
                };
                let slot = graph.goto_field(this, &field);
                if let Some(read) = graph.of(read) {
                    graph.add_assignment(read, slot);
                }
            }
            if info.has_role(Role::ReturnValue) {
                let slot = graph.goto_field(graph.returns_node, &Field::return_value());
                graph.add_assignment(slot, this);
            }
        }

        graph
    }

    pub(crate) fn of(&self, id: NodeId) -> Option<PtgId> {
        self.of_dfir.get(id.index()).copied().flatten()
    }

    pub(crate) fn node(&self, id: PtgId) -> &PtgNode {
        &self.nodes[id]
    }

    pub(crate) fn node_mut(&mut self, id: PtgId) -> &mut PtgNode {
        &mut self.nodes[id]
    }

    pub(crate) fn add_synthetic(&mut self, origin: PtgOrigin) -> PtgId {
        self.nodes
            .alloc(PtgNode::new(origin, DEPTH_INFINITY, DEPTH_INFINITY))
    }

    /// Add an assignment edge `from -> to` unless already present. Plain
    /// self-assignments carry no information and are not recorded.
    pub(crate) fn add_assignment(&mut self, from: PtgId, to: PtgId) {
        if from == to {
            return;
        }
        if self.nodes[from]
            .edges
            .iter()
            .any(|e| e.field.is_none() && e.target == to)
        {
            return;
        }
        self.nodes[from].edges.push(PtgEdge {
            target: to,
            field: None,
        });
        self.nodes[to].reversed.push(from);
    }

    /// The field slot `node.[field]`, created (with its field edge) on first
    /// access.
    pub(crate) fn goto_field(&mut self, node: PtgId, field: &Field) -> PtgId {
        if let Some(&slot) = self.nodes[node].field_targets.get(&field.hash) {
            return slot;
        }
        let slot = self.add_synthetic(PtgOrigin::FieldSlot);
        self.nodes[node].edges.push(PtgEdge {
            target: slot,
            field: Some(field.clone()),
        });
        self.nodes[node].field_targets.insert(field.hash, slot);
        slot
    }

    /// Chase drain pointers to the component's drain.
    pub(crate) fn actual_drain(&self, id: PtgId) -> PtgId {
        let mut current = id;
        while let Some(next) = self.nodes[current].drain {
            if next == current {
                break;
            }
            current = next;
        }
        current
    }

    /// OR the function's own packed escape annotation into the graph.
    pub(crate) fn apply_escapes_mask(&mut self, mask: u32, param_count: u32) {
        for i in 0..param_count {
            if mask & (1 << i) != 0 {
                if let Some(Some(param)) = self.params.get(i as usize).copied() {
                    self.nodes[param].depth = DEPTH_ESCAPES;
                }
            }
        }
        if mask & (1 << param_count) != 0 {
            let returns = self.returns_node;
            self.nodes[returns].depth = DEPTH_ESCAPES;
        }
    }

    /// Splice a callee summary into the graph at one call site.
    ///
    /// Callee drains materialize as fresh nodes; escaping summary nodes mark
    /// their resolved counterparts with the escaping depth; summary edges
    /// become assignment edges. Endpoints that fail to resolve (an absent
    /// argument) drop their edge with a warning and are counted.
    pub(crate) fn inline_call_site(
        &mut self,
        body: &FunctionBody,
        site: &CallSite,
        summary: &FunctionSummary,
        dropped_edges: &mut usize,
    ) {
        let drains: Vec<PtgId> = (0..summary.num_drains())
            .map(|_| self.add_synthetic(PtgOrigin::CalleeDrain))
            .collect();

        for node in summary.escapes() {
            match self.resolve_summary_node(body, site, &drains, node) {
                Some(resolved) => self.nodes[resolved].depth = DEPTH_ESCAPES,
                None => {
                    warn!(site = ?site.node, node = %node, "escape target did not map, skipped");
                    *dropped_edges += 1;
                }
            }
        }

        for edge in summary.edges() {
            let from = self.resolve_summary_node(body, site, &drains, &edge.from);
            let to = self.resolve_summary_node(body, site, &drains, &edge.to);
            match (from, to) {
                (Some(from), Some(to)) => self.add_assignment(from, to),
                _ => {
                    warn!(site = ?site.node, edge = %edge, "call edge did not map, skipped");
                    *dropped_edges += 1;
                }
            }
        }
    }

    /// Resolve a compressed node against a call site: root first, then the
    /// field walk. The return-value sentinel inside a path is a no-op (the
    /// return slot is already the root).
    fn resolve_summary_node(
        &mut self,
        body: &FunctionBody,
        site: &CallSite,
        drains: &[PtgId],
        node: &SummaryNode,
    ) -> Option<PtgId> {
        let root = match node.kind {
            SummaryKind::Return => self.of(site.node),
            SummaryKind::Param(i) => self.argument_of(body, site.node, i),
            SummaryKind::Drain(i) => drains.get(i as usize).copied(),
        }?;
        let mut current = root;
        for field in &node.path {
            if field.is_return_value() {
                continue;
            }
            current = self.goto_field(current, field);
        }
        Some(current)
    }

    /// The PTG node holding the callee's parameter `index` at `call`.
    ///
    /// A `Call` passes its arguments positionally; a `NewObject` is itself
    /// the receiver (parameter 0) with its arguments shifted by one.
    fn argument_of(&self, body: &FunctionBody, call: NodeId, index: u32) -> Option<PtgId> {
        let dfir = match body.node(call) {
            DfirNode::Call { arguments, .. } => arguments.get(index as usize).copied(),
            DfirNode::NewObject { arguments, .. } => {
                if index == 0 {
                    Some(call)
                } else {
                    arguments.get(index as usize - 1).copied()
                }
            }
            _ => None,
        }?;
        self.of(dfir)
    }
}
