//! Summary extraction: painting the closed graph into compressed form.
//!
//! Parameters and the return slot are painted with their root kinds; a BFS
//! over the interesting drains' field edges extends paths outward; drains
//! discovered without a label get fresh `Drain(k)` identifiers in discovery
//! order. Finally every edge between painted nodes is compressed.

use std::collections::VecDeque;

use kestrel_dfir::{Field, Identifier};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::closure::interesting_drains;
use crate::error::EscapeError;
use crate::ptg::{PointsToGraph, PtgId};
use crate::roles::DEPTH_ESCAPES;
use crate::summary::{FunctionSummary, SummaryEdge, SummaryKind, SummaryNode};

pub(crate) fn extract_summary(
    graph: &PointsToGraph,
    aux_drains: &[PtgId],
) -> Result<FunctionSummary, EscapeError> {
    let interesting = interesting_drains(graph);

    let mut labels: FxHashMap<PtgId, SummaryNode> = FxHashMap::default();
    let mut queue: VecDeque<PtgId> = VecDeque::new();
    let mut queued: FxHashSet<PtgId> = FxHashSet::default();
    let mut drain_count: u32 = 0;

    for (index, param) in graph.params.iter().enumerate() {
        let Some(param) = *param else { continue };
        labels.insert(param, SummaryNode::param(index as u32));
        let drain = graph.actual_drain(param);
        if queued.insert(drain) {
            queue.push_back(drain);
        }
    }
    labels.insert(graph.returns_node, SummaryNode::ret());
    let returns_drain = graph.actual_drain(graph.returns_node);
    if queued.insert(returns_drain) {
        queue.push_back(returns_drain);
    }

    while let Some(drain) = queue.pop_front() {
        let painter = labels
            .entry(drain)
            .or_insert_with(|| {
                let label = SummaryNode::drain(drain_count);
                drain_count += 1;
                label
            })
            .clone();
        let targets: Vec<(Field, PtgId)> = graph
            .node(drain)
            .field_edges()
            .map(|(f, t)| (f.clone(), t))
            .collect();
        for (field, target) in targets {
            if target == drain {
                // Field self-loop: kept as an edge later, but paints nothing.
                continue;
            }
            let target_drain = graph.actual_drain(target);
            if !interesting.contains(&target_drain) {
                continue;
            }
            match labels.get(&target) {
                None => {
                    labels.insert(target, painter.child(field));
                }
                // A drain labelled at discovery may legitimately be the slot
                // of another component; its discovery label wins. Anything
                // else is a second incoming field edge on a painted node.
                Some(existing)
                    if matches!(existing.kind, SummaryKind::Drain(_))
                        && existing.path.is_empty()
                        && target == target_drain => {}
                Some(_) => {
                    return Err(EscapeError::DoublyPainted {
                        node: target.index(),
                    });
                }
            }
            if queued.insert(target_drain) {
                queue.push_back(target_drain);
            }
        }
    }

    // Helper drains recording may-alias pairs come last.
    for &helper in aux_drains {
        labels.entry(helper).or_insert_with(|| {
            let label = SummaryNode::drain(drain_count);
            drain_count += 1;
            label
        });
    }

    let mut edges: Vec<SummaryEdge> = Vec::new();
    let mut escapes: Vec<SummaryNode> = Vec::new();
    for id in graph.nodes.ids() {
        let Some(from) = labels.get(&id) else { continue };
        for edge in &graph.node(id).edges {
            match &edge.field {
                // Plain self-loops are dropped; other assignment edges are
                // kept when both endpoints are painted.
                None => {
                    if edge.target == id {
                        continue;
                    }
                    if let Some(to) = labels.get(&edge.target) {
                        if to != from {
                            edges.push(SummaryEdge::new(from.clone(), to.clone()));
                        }
                    }
                }
                // A field edge's target is the painter's path extended by
                // the field; a self-loop through a field is information.
                Some(field) => {
                    let target_drain = graph.actual_drain(edge.target);
                    if !interesting.contains(&target_drain) {
                        continue;
                    }
                    edges.push(SummaryEdge::new(from.clone(), from.child(field.clone())));
                }
            }
        }
        if graph.node(id).depth == DEPTH_ESCAPES {
            escapes.push(from.clone());
        }
    }

    Ok(FunctionSummary::new(drain_count, edges, escapes))
}
