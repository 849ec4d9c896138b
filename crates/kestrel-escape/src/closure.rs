//! Graph closure: components, drains, coalescing, and the pre-compression
//! closure passes.
//!
//! All traversals are iterative with explicit stacks or queues; function
//! bodies can be large enough that recursion depth is a real hazard.

use std::collections::VecDeque;

use kestrel_dfir::{Field, Identifier};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::EscapeError;
use crate::ptg::{PointsToGraph, PtgEdge, PtgId, PtgOrigin};
use crate::roles::DEPTH_ESCAPES;

/// Run the structural closure: components and drains, multi-edge
/// coalescing, then canonicalization with invariant validation.
pub(crate) fn close(graph: &mut PointsToGraph) -> Result<(), EscapeError> {
    build_components_and_drains(graph);
    coalesce_field_edges(graph);
    canonicalize(graph)
}

/// Step A: treat assignment edges as undirected, find connected components,
/// give each one a drain, and hoist every member's field edges onto it.
///
/// A component reuses an existing member as its drain when that member has
/// no outgoing assignment edges and every other member reaches it;
/// otherwise a drain is synthesized and every member is attached to it.
fn build_components_and_drains(graph: &mut PointsToGraph) {
    let original: Vec<PtgId> = graph.nodes.ids().collect();
    let mut visited: FxHashSet<PtgId> = FxHashSet::default();

    for &start in &original {
        if visited.contains(&start) {
            continue;
        }
        let component = undirected_component(graph, start);
        visited.extend(component.iter().copied());

        let elected = component.iter().copied().find(|&candidate| {
            !graph.node(candidate).has_assignment_out()
                && reverse_reachable_count(graph, candidate) == component.len()
        });
        let drain = match elected {
            Some(drain) => drain,
            None => {
                let drain = graph.add_synthetic(PtgOrigin::Drain);
                for &member in &component {
                    graph.add_assignment(member, drain);
                }
                drain
            }
        };

        for &member in &component {
            if member != drain {
                graph.node_mut(member).drain = Some(drain);
            }
        }
        for &member in &component {
            if member == drain {
                continue;
            }
            let hoisted: Vec<PtgEdge> = {
                let node = graph.node_mut(member);
                let (fields, assignments): (Vec<_>, Vec<_>) =
                    node.edges.drain(..).partition(|e| e.field.is_some());
                node.edges = assignments;
                fields
            };
            graph.node_mut(drain).edges.extend(hoisted);
        }
    }
}

/// The connected component of `start` over assignment edges, both
/// directions, in ascending node order.
fn undirected_component(graph: &PointsToGraph, start: PtgId) -> Vec<PtgId> {
    let mut seen: FxHashSet<PtgId> = FxHashSet::default();
    let mut stack = vec![start];
    seen.insert(start);
    while let Some(id) = stack.pop() {
        let node = graph.node(id);
        for target in node
            .assignment_targets()
            .chain(node.reversed.iter().copied())
        {
            if seen.insert(target) {
                stack.push(target);
            }
        }
    }
    let mut component: Vec<PtgId> = seen.into_iter().collect();
    component.sort();
    component
}

/// How many nodes reach `sink` over assignment edges, `sink` included.
fn reverse_reachable_count(graph: &PointsToGraph, sink: PtgId) -> usize {
    let mut seen: FxHashSet<PtgId> = FxHashSet::default();
    let mut stack = vec![sink];
    seen.insert(sink);
    while let Some(id) = stack.pop() {
        for &source in &graph.node(id).reversed {
            if seen.insert(source) {
                stack.push(source);
            }
        }
    }
    seen.len()
}

/// Step B: drains may now carry several outgoing field edges with the same
/// label, pointing into different components. Merge the target components'
/// drains and collapse each duplicate group to a single edge, until every
/// drain has unique field labels.
fn coalesce_field_edges(graph: &mut PointsToGraph) {
    loop {
        let Some((holder, field_hash)) = find_duplicate_label(graph) else {
            break;
        };

        // Detach the whole duplicate group from the holder.
        let mut field: Option<Field> = None;
        let mut targets: Vec<PtgId> = Vec::new();
        graph.node_mut(holder).edges.retain(|e| match &e.field {
            Some(f) if f.hash == field_hash => {
                field.get_or_insert_with(|| f.clone());
                targets.push(e.target);
                false
            }
            _ => true,
        });
        // Identity of a field is its hash alone.
        let field = field.unwrap_or_else(|| Field::new(None, None, field_hash, None));

        let mut merged = graph.actual_drain(targets[0]);
        for &target in &targets[1..] {
            let other = graph.actual_drain(target);
            merged = merge_drains(graph, merged, other);
        }

        // Collapse the group: a single edge, preferring a target that is
        // not itself a drain so depth still flows through it to the others.
        let kept = targets
            .iter()
            .copied()
            .find(|&t| graph.actual_drain(t) != t)
            .unwrap_or(merged);

        // Merging may have displaced the holder under a new root, taking
        // its remaining field edges along.
        let holder = graph.actual_drain(holder);
        graph.node_mut(holder).edges.push(PtgEdge {
            target: kept,
            field: Some(field),
        });

        if graph.actual_drain(kept) != kept {
            let mut others: Vec<PtgId> = targets.into_iter().filter(|&t| t != kept).collect();
            others.sort();
            others.dedup();
            for target in others {
                graph.add_assignment(kept, target);
            }
        }
    }
}

/// A drain carrying two outgoing field edges with the same label whose
/// targets live in different components (or are plain duplicates).
fn find_duplicate_label(graph: &PointsToGraph) -> Option<(PtgId, i64)> {
    for id in graph.nodes.ids() {
        if graph.actual_drain(id) != id {
            continue;
        }
        let mut seen: FxHashMap<i64, PtgId> = FxHashMap::default();
        for (field, target) in graph.node(id).field_edges() {
            if seen.insert(field.hash, target).is_some() {
                return Some((id, field.hash));
            }
        }
    }
    None
}

/// Merge two component drains, following the synthesized/real rules, and
/// hoist the displaced drains' field edges onto the surviving root.
fn merge_drains(graph: &mut PointsToGraph, a: PtgId, b: PtgId) -> PtgId {
    if a == b {
        return a;
    }
    let a_synth = graph.node(a).origin.is_synthesized_drain();
    let b_synth = graph.node(b).origin.is_synthesized_drain();
    let root = match (a_synth, b_synth) {
        (true, false) => {
            graph.node_mut(b).drain = Some(a);
            a
        }
        (false, true) => {
            graph.node_mut(a).drain = Some(b);
            b
        }
        // Both synthesized or both real: a fresh parent absorbs both.
        _ => {
            let parent = graph.add_synthetic(PtgOrigin::Drain);
            graph.node_mut(a).drain = Some(parent);
            graph.node_mut(b).drain = Some(parent);
            parent
        }
    };
    for displaced in [a, b] {
        if displaced == root {
            continue;
        }
        let hoisted: Vec<PtgEdge> = {
            let node = graph.node_mut(displaced);
            let (fields, rest): (Vec<_>, Vec<_>) =
                node.edges.drain(..).partition(|e| e.field.is_some());
            node.edges = rest;
            fields
        };
        graph.node_mut(root).edges.extend(hoisted);
    }
    root
}

/// Step C: freeze the drain forest (full path compression), attach every
/// member to its drain by assignment, and validate the drain invariants.
fn canonicalize(graph: &mut PointsToGraph) -> Result<(), EscapeError> {
    let ids: Vec<PtgId> = graph.nodes.ids().collect();
    for &id in &ids {
        let root = graph.actual_drain(id);
        if root == id {
            graph.node_mut(id).drain = None;
        } else {
            graph.node_mut(id).drain = Some(root);
            graph.add_assignment(id, root);
        }
    }

    for &id in &ids {
        if graph.node(id).drain.is_some() {
            continue;
        }
        let node = graph.node(id);
        if node.has_assignment_out() {
            return Err(EscapeError::DrainAssignmentEdges { node: id.index() });
        }
        let mut labels: FxHashSet<i64> = FxHashSet::default();
        for (field, _) in node.field_edges() {
            if !labels.insert(field.hash) {
                return Err(EscapeError::DuplicateFieldLabel {
                    node: id.index(),
                    field: field.hash,
                });
            }
        }
    }
    Ok(())
}

/// Drains the summary keeps: those reachable from a parameter or the return
/// slot over field edges, minus iteratively pruned cactus leaves. A cactus
/// leaf is a drain with no field edge into another interesting drain whose
/// single incoming interesting edge originates at a non-escaping node;
/// parameters' own drains are never pruned.
pub(crate) fn interesting_drains(graph: &PointsToGraph) -> FxHashSet<PtgId> {
    let mut interesting: FxHashSet<PtgId> = FxHashSet::default();
    let mut always_kept: FxHashSet<PtgId> = FxHashSet::default();
    let mut queue: VecDeque<PtgId> = VecDeque::new();

    let roots = graph
        .params
        .iter()
        .copied()
        .flatten()
        .chain(std::iter::once(graph.returns_node));
    for root in roots {
        let drain = graph.actual_drain(root);
        always_kept.insert(drain);
        if interesting.insert(drain) {
            queue.push_back(drain);
        }
    }
    while let Some(drain) = queue.pop_front() {
        for (_, target) in graph.node(drain).field_edges() {
            let target_drain = graph.actual_drain(target);
            if interesting.insert(target_drain) {
                queue.push_back(target_drain);
            }
        }
    }

    loop {
        // Incoming interesting edges per drain: the slot nodes that hang
        // off an interesting drain and belong to this one.
        let mut incoming: FxHashMap<PtgId, Vec<PtgId>> = FxHashMap::default();
        for &drain in &interesting {
            for (_, target) in graph.node(drain).field_edges() {
                let target_drain = graph.actual_drain(target);
                if target_drain != drain && interesting.contains(&target_drain) {
                    incoming.entry(target_drain).or_default().push(target);
                }
            }
        }
        let prunable = interesting
            .iter()
            .copied()
            .filter(|drain| !always_kept.contains(drain))
            .filter(|&drain| {
                if graph.node(drain).depth == DEPTH_ESCAPES {
                    return false;
                }
                let is_leaf = !graph.node(drain).field_edges().any(|(_, target)| {
                    let target_drain = graph.actual_drain(target);
                    target_drain != drain && interesting.contains(&target_drain)
                });
                let slots = incoming.get(&drain).map(Vec::as_slice).unwrap_or(&[]);
                is_leaf && slots.len() == 1 && graph.node(slots[0]).depth != DEPTH_ESCAPES
            })
            .min();
        match prunable {
            Some(drain) => {
                interesting.remove(&drain);
            }
            None => break,
        }
    }
    interesting
}

/// The nodes the compressed summary can name: parameters, the return slot,
/// interesting drains, and the field-edge targets hanging off them.
pub(crate) fn kept_nodes(
    graph: &PointsToGraph,
    interesting: &FxHashSet<PtgId>,
) -> FxHashSet<PtgId> {
    let mut kept: FxHashSet<PtgId> = interesting.clone();
    kept.extend(graph.params.iter().copied().flatten());
    kept.insert(graph.returns_node);
    for &drain in interesting {
        for (_, target) in graph.node(drain).field_edges() {
            if interesting.contains(&graph.actual_drain(target)) {
                kept.insert(target);
            }
        }
    }
    kept
}

/// Step D: preserve the transitive assignment relations that compression
/// would hide. For each kept node, anything kept that is reachable through
/// non-kept intermediates but not through kept ones gets a direct edge.
pub(crate) fn close_over_kept_nodes(graph: &mut PointsToGraph, kept: &FxHashSet<PtgId>) {
    let mut sources: Vec<PtgId> = kept.iter().copied().collect();
    sources.sort();
    for &source in &sources {
        let full = assignment_reachable(graph, source, None);
        let within = assignment_reachable(graph, source, Some(kept));
        let mut missing: Vec<PtgId> = full
            .difference(&within)
            .copied()
            .filter(|id| kept.contains(id))
            .collect();
        missing.sort();
        for target in missing {
            graph.add_assignment(source, target);
        }
    }
}

/// Nodes reachable from `start` over assignment edges. With `within`, only
/// edges between member nodes are followed. `start` itself is excluded.
fn assignment_reachable(
    graph: &PointsToGraph,
    start: PtgId,
    within: Option<&FxHashSet<PtgId>>,
) -> FxHashSet<PtgId> {
    let mut seen: FxHashSet<PtgId> = FxHashSet::default();
    let mut stack = vec![start];
    while let Some(id) = stack.pop() {
        for target in graph.node(id).assignment_targets() {
            if let Some(allowed) = within {
                if !allowed.contains(&target) {
                    continue;
                }
            }
            if target != start && seen.insert(target) {
                stack.push(target);
            }
        }
    }
    seen
}

/// Step E: record aliasing the compressed form would lose. Two kept members
/// of one component with no direct edge between them may still hold the
/// same value; a helper drain `v -> d' <- w` captures that. The symmetric
/// pattern is not added: one slot cannot hold two values at once, but two
/// references may hold one.
pub(crate) fn insert_aux_drains(
    graph: &mut PointsToGraph,
    kept: &FxHashSet<PtgId>,
) -> Vec<PtgId> {
    let mut by_component: FxHashMap<PtgId, Vec<PtgId>> = FxHashMap::default();
    for &id in kept {
        let drain = graph.actual_drain(id);
        if drain != id {
            by_component.entry(drain).or_default().push(id);
        }
    }
    let mut components: Vec<(PtgId, Vec<PtgId>)> = by_component.into_iter().collect();
    components.sort_by_key(|(drain, _)| *drain);

    let mut aux = Vec::new();
    for (_, mut members) in components {
        members.sort();
        for i in 0..members.len() {
            for j in i + 1..members.len() {
                let (v, w) = (members[i], members[j]);
                let direct = graph
                    .node(v)
                    .assignment_targets()
                    .any(|t| t == w)
                    || graph.node(w).assignment_targets().any(|t| t == v);
                if direct {
                    continue;
                }
                let helper = graph.add_synthetic(PtgOrigin::AuxDrain);
                graph.add_assignment(v, helper);
                graph.add_assignment(w, helper);
                aux.push(helper);
            }
        }
    }
    aux
}
