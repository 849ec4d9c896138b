use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::FxHashMap;

use crate::module::{FunctionId, ModuleDfg};
use crate::node::NodeId;

/// Where a call site dispatches to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Callee {
    /// A function of the module under compilation.
    Local(FunctionId),
    /// An external function, by symbol hash.
    External(i64),
    /// A virtual call site; the target set is unknown.
    Virtual,
}

/// One call site: the `Call` or `NewObject` DFIR node in the caller's body
/// plus the resolved callee.
#[derive(Clone, Copy, Debug)]
pub struct CallSite {
    pub node: NodeId,
    pub callee: Callee,
}

/// The whole-program call graph over the module's functions.
#[derive(Clone, Debug, Default)]
pub struct CallGraph {
    direct: FxHashMap<FunctionId, Vec<CallSite>>,
    reversed: FxHashMap<FunctionId, Vec<FunctionId>>,
}

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_call_site(&mut self, caller: FunctionId, site: CallSite) {
        if let Callee::Local(callee) = site.callee {
            let callers = self.reversed.entry(callee).or_default();
            if !callers.contains(&caller) {
                callers.push(caller);
            }
        }
        self.direct.entry(caller).or_default().push(site);
    }

    pub fn call_sites(&self, caller: FunctionId) -> &[CallSite] {
        self.direct.get(&caller).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn callers(&self, callee: FunctionId) -> &[FunctionId] {
        self.reversed
            .get(&callee)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Condense the call graph into strongly connected multi-nodes.
    ///
    /// Multi-nodes come back with callees before callers (Tarjan emits
    /// components in reverse topological order), which is exactly the order
    /// the interprocedural driver consumes them in. Every function of the
    /// module appears in exactly one multi-node, isolated ones included.
    pub fn condensation(&self, module: &ModuleDfg) -> Vec<Vec<FunctionId>> {
        let mut graph: DiGraph<FunctionId, ()> = DiGraph::new();
        let mut index_of: FxHashMap<FunctionId, NodeIndex> = FxHashMap::default();
        for id in module.functions().ids() {
            index_of.insert(id, graph.add_node(id));
        }
        for (&caller, sites) in &self.direct {
            let Some(&from) = index_of.get(&caller) else {
                continue;
            };
            for site in sites {
                if let Callee::Local(callee) = site.callee {
                    if let Some(&to) = index_of.get(&callee) {
                        graph.update_edge(from, to, ());
                    }
                }
            }
        }
        tarjan_scc(&graph)
            .into_iter()
            .map(|component| component.into_iter().map(|ix| graph[ix]).collect())
            .collect()
    }
}
