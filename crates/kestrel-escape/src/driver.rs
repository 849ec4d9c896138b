//! The interprocedural driver.
//!
//! Multi-nodes of the call-graph condensation arrive callees-first; inside
//! each one, functions start from the optimistic summary and are re-analysed
//! until their summaries stop changing. A function about to be analysed a
//! third time is demoted to the pessimistic summary instead, which bounds
//! the fixpoint. Lifetimes are published once the multi-node has settled.

use std::collections::VecDeque;

use kestrel_dfir::{
    CallGraph, CallSite, Callee, Context, DfirNode, ExternalModulesDfg, FunctionBody, FunctionId,
    IrId, Lifetime, ModuleDfg,
};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::closure;
use crate::error::EscapeError;
use crate::lifetime;
use crate::paint;
use crate::ptg::PointsToGraph;
use crate::roles::{self, RoleAssignment};
use crate::summary::FunctionSummary;

/// Tunables of the pass. The defaults are the production configuration.
#[derive(Clone, Debug)]
pub struct EscapeConfig {
    /// Per-frame byte budget for stack-allocated sized arrays.
    pub stack_budget: u32,
    /// How many times a function may be re-analysed inside one multi-node
    /// before it is demoted to the pessimistic summary.
    pub max_reanalyses: u32,
    /// Propagate forced heap residency through the points-to graph.
    ///
    /// Disabling this is experimental; the production entry point never
    /// does.
    pub propagate_forced_to_heap: bool,
}

impl Default for EscapeConfig {
    fn default() -> Self {
        Self {
            stack_budget: 65_536,
            max_reanalyses: 2,
            propagate_forced_to_heap: true,
        }
    }
}

/// Counters surfaced alongside the lifetime map.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EscapeStats {
    /// Call-site summary endpoints that failed to map to a graph node; the
    /// affected edges were dropped.
    pub dropped_call_edges: usize,
    /// Functions demoted to the pessimistic summary for non-convergence.
    pub demoted_functions: usize,
    /// Allocation sites emitted as stack.
    pub stack_allocations: usize,
    /// Allocation sites emitted as heap.
    pub heap_allocations: usize,
}

/// Compute a lifetime for every allocation site of the module.
///
/// `lifetimes` must be empty at entry; on success it maps every `NewObject`
/// IR element to either [`Lifetime::Stack`] or [`Lifetime::Global`].
pub fn compute_lifetimes(
    context: &Context,
    module: &ModuleDfg,
    external: &ExternalModulesDfg,
    call_graph: &CallGraph,
    lifetimes: &mut FxHashMap<IrId, Lifetime>,
) -> Result<EscapeStats, EscapeError> {
    compute_lifetimes_with_config(
        context,
        module,
        external,
        call_graph,
        lifetimes,
        &EscapeConfig::default(),
    )
}

pub fn compute_lifetimes_with_config(
    context: &Context,
    module: &ModuleDfg,
    external: &ExternalModulesDfg,
    call_graph: &CallGraph,
    lifetimes: &mut FxHashMap<IrId, Lifetime>,
    config: &EscapeConfig,
) -> Result<EscapeStats, EscapeError> {
    run(context, module, external, call_graph, lifetimes, config).map(|(_, stats)| stats)
}

/// Run the pass and return the per-function summaries instead of the
/// lifetime map; the allocation lifetimes are computed and discarded.
pub fn compute_summaries(
    context: &Context,
    module: &ModuleDfg,
    external: &ExternalModulesDfg,
    call_graph: &CallGraph,
    config: &EscapeConfig,
) -> Result<FxHashMap<FunctionId, FunctionSummary>, EscapeError> {
    let mut lifetimes = FxHashMap::default();
    run(context, module, external, call_graph, &mut lifetimes, config)
        .map(|(summaries, _)| summaries)
}

fn run(
    context: &Context,
    module: &ModuleDfg,
    external: &ExternalModulesDfg,
    call_graph: &CallGraph,
    lifetimes: &mut FxHashMap<IrId, Lifetime>,
    config: &EscapeConfig,
) -> Result<(FxHashMap<FunctionId, FunctionSummary>, EscapeStats), EscapeError> {
    if !lifetimes.is_empty() {
        return Err(EscapeError::LifetimesNotEmpty(lifetimes.len()));
    }
    let mut stats = EscapeStats::default();

    // Intraprocedural roles, once per function, retained for the whole pass.
    let mut roles: FxHashMap<FunctionId, RoleAssignment> = FxHashMap::default();
    for (id, decl) in module.functions().iter_with_ids() {
        if let Some(body) = &decl.body {
            roles.insert(id, roles::assign_roles(context, module, external, body)?);
        }
    }

    let mut summaries: FxHashMap<FunctionId, FunctionSummary> = FxHashMap::default();
    let mut allocations: FxHashMap<FunctionId, Vec<(IrId, Lifetime)>> = FxHashMap::default();

    for multi_node in call_graph.condensation(module) {
        let mut live: FxHashSet<FunctionId> = multi_node
            .iter()
            .copied()
            .filter(|&f| module.body(f).is_some())
            .collect();
        for &f in &live {
            summaries.insert(f, FunctionSummary::optimistic());
        }

        let mut members: Vec<FunctionId> = live.iter().copied().collect();
        members.sort();
        let mut worklist: VecDeque<FunctionId> = members.iter().copied().collect();
        let mut in_worklist: FxHashSet<FunctionId> = live.clone();
        let mut analysed: FxHashMap<FunctionId, u32> = FxHashMap::default();

        while let Some(f) = worklist.pop_front() {
            in_worklist.remove(&f);
            if !live.contains(&f) {
                continue;
            }
            let runs = analysed.entry(f).or_insert(0);
            if *runs >= config.max_reanalyses {
                // Third entry without convergence: give up on this function.
                let decl = module.function(f);
                warn!(
                    function = %decl.symbol.name,
                    "escape analysis did not converge, falling back to pessimistic summary"
                );
                let pessimistic = FunctionSummary::pessimistic(decl.symbol.param_count);
                let changed = summaries.get(&f) != Some(&pessimistic);
                summaries.insert(f, pessimistic);
                if let Some(body) = module.body(f) {
                    allocations.insert(f, lifetime::all_heap_lifetimes(body));
                }
                live.remove(&f);
                stats.demoted_functions += 1;
                if changed {
                    enqueue_callers(call_graph, &live, f, &mut worklist, &mut in_worklist);
                }
                continue;
            }
            *runs += 1;

            let analysis = analyze_function(
                context,
                module,
                external,
                call_graph,
                f,
                &roles[&f],
                &summaries,
                config,
                &mut stats,
            )?;
            debug!(
                function = %module.function(f).symbol.name,
                summary = %analysis.summary,
                "function analysed"
            );
            allocations.insert(f, analysis.allocations);
            if summaries.get(&f) != Some(&analysis.summary) {
                summaries.insert(f, analysis.summary);
                enqueue_callers(call_graph, &live, f, &mut worklist, &mut in_worklist);
            }
        }

        // The multi-node has settled; publish its allocation lifetimes.
        for &f in &members {
            let Some(per_function) = allocations.get(&f) else {
                continue;
            };
            for &(ir, lifetime) in per_function {
                match lifetime.emitted() {
                    Lifetime::Stack => stats.stack_allocations += 1,
                    _ => stats.heap_allocations += 1,
                }
                lifetimes.insert(ir, lifetime.emitted());
            }
        }
    }

    Ok((summaries, stats))
}

fn enqueue_callers(
    call_graph: &CallGraph,
    live: &FxHashSet<FunctionId>,
    callee: FunctionId,
    worklist: &mut VecDeque<FunctionId>,
    in_worklist: &mut FxHashSet<FunctionId>,
) {
    for &caller in call_graph.callers(callee) {
        if live.contains(&caller) && in_worklist.insert(caller) {
            worklist.push_back(caller);
        }
    }
}

struct FunctionAnalysis {
    summary: FunctionSummary,
    allocations: Vec<(IrId, Lifetime)>,
}

/// Analyse one function against the currently installed callee summaries.
#[allow(clippy::too_many_arguments)]
fn analyze_function(
    context: &Context,
    module: &ModuleDfg,
    external: &ExternalModulesDfg,
    call_graph: &CallGraph,
    f: FunctionId,
    roles: &RoleAssignment,
    summaries: &FxHashMap<FunctionId, FunctionSummary>,
    config: &EscapeConfig,
    stats: &mut EscapeStats,
) -> Result<FunctionAnalysis, EscapeError> {
    let decl = module.function(f);
    let body = module
        .body(f)
        .unwrap_or_else(|| panic!("analysing function {:?} without a body", f));

    let mut graph = PointsToGraph::build(body, roles);
    if let Some(mask) = decl.symbol.escapes {
        graph.apply_escapes_mask(mask, decl.symbol.param_count);
    }

    for site in call_graph.call_sites(f) {
        let summary = callee_summary(module, external, body, summaries, site)?;
        graph.inline_call_site(body, site, &summary, &mut stats.dropped_call_edges);
    }

    closure::close(&mut graph)?;
    lifetime::propagate_depths(&mut graph);

    let interesting = closure::interesting_drains(&graph);
    let kept = closure::kept_nodes(&graph, &interesting);
    closure::close_over_kept_nodes(&mut graph, &kept);
    let aux_drains = closure::insert_aux_drains(&mut graph, &kept);

    let allocations = lifetime::assign_allocation_lifetimes(context, body, &mut graph, config);
    let summary = paint::extract_summary(&graph, &aux_drains)?;

    Ok(FunctionAnalysis {
        summary,
        allocations,
    })
}

/// The summary to splice in for one call site.
fn callee_summary(
    module: &ModuleDfg,
    external: &ExternalModulesDfg,
    body: &FunctionBody,
    summaries: &FxHashMap<FunctionId, FunctionSummary>,
    site: &CallSite,
) -> Result<FunctionSummary, EscapeError> {
    match site.callee {
        Callee::Local(callee) => match summaries.get(&callee) {
            Some(summary) => Ok(summary.clone()),
            // A local function without a DFIR body is as opaque as an
            // unknown external one.
            None => Ok(FunctionSummary::pessimistic(
                module.function(callee).symbol.param_count,
            )),
        },
        Callee::External(hash) => match external.resolve_function(hash) {
            Some(symbol) if is_trusted_runtime_function(&symbol.name) && symbol.has_annotations() => {
                let escapes = symbol.escapes.unwrap_or(0);
                let points_to = match &symbol.points_to {
                    Some(words) => words.clone(),
                    None => vec![0; symbol.param_count as usize + 1],
                };
                FunctionSummary::from_bits(escapes, &points_to)
            }
            Some(symbol) => Ok(FunctionSummary::pessimistic(symbol.param_count)),
            None => Ok(FunctionSummary::pessimistic(site_param_count(body, site))),
        },
        Callee::Virtual => Ok(FunctionSummary::pessimistic(site_param_count(body, site))),
    }
}

/// Runtime functions under `kotlin.` carry trustworthy escape annotations;
/// the concurrency runtime is excluded.
fn is_trusted_runtime_function(name: &str) -> bool {
    name.starts_with("kfun:kotlin.") && !name.starts_with("kfun:kotlin.native.concurrent")
}

/// Parameter count implied by the call-site shape, for callees we know
/// nothing about: a constructor's receiver occupies one extra slot.
fn site_param_count(body: &FunctionBody, site: &CallSite) -> u32 {
    match body.node(site.node) {
        DfirNode::Call { arguments, .. } => arguments.len() as u32,
        DfirNode::NewObject { arguments, .. } => arguments.len() as u32 + 1,
        _ => 0,
    }
}
