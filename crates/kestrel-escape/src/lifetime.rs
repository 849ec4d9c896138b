//! Depth propagation and lifetime assignment.
//!
//! Depths flow along directed edges, monotonically decreasing, until a
//! fixed point. Allocation sites are then classified; anything the code
//! generator cannot keep on the stack is forced to the heap, which feeds
//! back into the depths so that heap residency propagates to everything
//! reachable from a forced node.

use std::collections::VecDeque;

use kestrel_dfir::{Context, DfirNode, FunctionBody, Identifier, IrId, Lifetime};
use tracing::debug;

use crate::driver::EscapeConfig;
use crate::ptg::{PointsToGraph, PtgId};
use crate::roles::{DEPTH_ESCAPES, DEPTH_PARAMETER, DEPTH_RETURN_VALUE};

/// Bytes of object header ahead of array elements: the length word.
const ARRAY_HEADER_EXTRA: u64 = 4;

/// Lower every edge target's depth to at most its source's depth, to a
/// fixed point. The depth lattice is finite and propagation only ever
/// decreases, so this terminates.
pub(crate) fn propagate_depths(graph: &mut PointsToGraph) {
    let mut queue: VecDeque<PtgId> = graph.nodes.ids().collect();
    let mut queued = vec![true; graph.nodes.len()];
    while let Some(id) = queue.pop_front() {
        queued[id.index()] = false;
        let depth = graph.node(id).depth;
        let targets: Vec<PtgId> = graph.node(id).edges.iter().map(|e| e.target).collect();
        for target in targets {
            if graph.node(target).depth > depth {
                graph.node_mut(target).depth = depth;
                if !queued[target.index()] {
                    queued[target.index()] = true;
                    queue.push_back(target);
                }
            }
        }
    }
}

/// The classification table over final depths.
pub(crate) fn classify(graph: &PointsToGraph, id: PtgId) -> Lifetime {
    let node = graph.node(id);
    if let Some(forced) = node.forced_lifetime {
        return forced;
    }
    match node.depth {
        DEPTH_ESCAPES => Lifetime::Global,
        DEPTH_PARAMETER => Lifetime::Argument,
        DEPTH_RETURN_VALUE => {
            if node.is_actual_return {
                Lifetime::ReturnValue
            } else {
                Lifetime::IndirectReturnValue
            }
        }
        depth if depth == node.lexical_depth => Lifetime::Stack,
        _ => Lifetime::Local,
    }
}

/// One `NewObject` site of the function under analysis.
struct Allocation {
    ptg: PtgId,
    ir: IrId,
    /// Byte size on the stack, for sized-array candidates.
    array_size: Option<u64>,
    /// An array allocation whose length is not a compile-time constant can
    /// never be budgeted, so it can never stay on the stack.
    unsized_array: bool,
}

/// Classify every allocation site of the function and force the non-stack
/// ones to the heap.
///
/// Runs the admission/forcing loop to a fixed point: forcing marks the node
/// escaping and re-propagates depths, which may knock further allocations
/// out of stack eligibility, which may free or never frees budget — each
/// round forces at least one new node, so the loop is bounded by the
/// allocation count.
pub(crate) fn assign_allocation_lifetimes(
    context: &Context,
    body: &FunctionBody,
    graph: &mut PointsToGraph,
    config: &EscapeConfig,
) -> Vec<(IrId, Lifetime)> {
    let mut allocations: Vec<Allocation> = Vec::new();
    for (id, node) in body.nodes().iter_with_ids() {
        let DfirNode::NewObject {
            constructed_type,
            arguments,
            ir,
        } = node
        else {
            continue;
        };
        let Some(ptg) = graph.of(id) else {
            continue;
        };
        let (array_size, unsized_array) = match context.array_kind(*constructed_type) {
            Some(kind) => match arguments.first().and_then(|&len| body.as_int_const(len)) {
                Some(length) if length >= 0 => {
                    let item = kind.item_size(context.pointer_size()) as u64;
                    let size = context.pointer_size() as u64
                        + ARRAY_HEADER_EXTRA
                        + item * length as u64;
                    (Some(size), false)
                }
                _ => (None, true),
            },
            None => (None, false),
        };
        allocations.push(Allocation {
            ptg,
            ir: *ir,
            array_size,
            unsized_array,
        });
    }

    loop {
        let mut newly_forced: Vec<PtgId> = Vec::new();

        for alloc in &allocations {
            if graph.node(alloc.ptg).forced_lifetime.is_some() {
                continue;
            }
            let lifetime = classify(graph, alloc.ptg);
            if lifetime == Lifetime::Stack {
                if alloc.unsized_array {
                    newly_forced.push(alloc.ptg);
                }
            } else {
                // The code generator only supports stack and heap; a value
                // known to live on the heap taints whatever it reaches.
                newly_forced.push(alloc.ptg);
            }
        }

        // Greedy admission of the surviving sized-array candidates into the
        // per-frame budget, cheapest first.
        let mut candidates: Vec<(u64, PtgId)> = allocations
            .iter()
            .filter(|a| {
                graph.node(a.ptg).forced_lifetime.is_none()
                    && !newly_forced.contains(&a.ptg)
                    && a.array_size.is_some()
                    && classify(graph, a.ptg) == Lifetime::Stack
            })
            .map(|a| (a.array_size.unwrap_or(0), a.ptg))
            .collect();
        candidates.sort();
        let mut used: u64 = 0;
        for (size, ptg) in candidates {
            if used + size <= config.stack_budget as u64 {
                used += size;
            } else {
                newly_forced.push(ptg);
            }
        }

        if newly_forced.is_empty() {
            break;
        }
        for ptg in newly_forced {
            graph.node_mut(ptg).forced_lifetime = Some(Lifetime::Global);
            if config.propagate_forced_to_heap {
                graph.node_mut(ptg).depth = DEPTH_ESCAPES;
            }
        }
        if config.propagate_forced_to_heap {
            propagate_depths(graph);
        } else {
            break;
        }
    }

    allocations
        .iter()
        .map(|alloc| {
            let lifetime = classify(graph, alloc.ptg);
            debug!(ir = ?alloc.ir, %lifetime, "allocation classified");
            (alloc.ir, lifetime)
        })
        .collect()
}

/// Pessimistic fallback: every allocation of the body goes to the heap.
pub(crate) fn all_heap_lifetimes(body: &FunctionBody) -> Vec<(IrId, Lifetime)> {
    body.nodes()
        .iter()
        .filter_map(|node| match node {
            DfirNode::NewObject { ir, .. } => Some((*ir, Lifetime::Global)),
            _ => None,
        })
        .collect()
}
