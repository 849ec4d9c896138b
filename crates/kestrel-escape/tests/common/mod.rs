//! Shared fixture builders: a miniature module with the runtime symbols the
//! analysis expects, plus a body builder that tracks scopes and call sites.
#![allow(dead_code)]

use kestrel_dfir::{
    ArrayKind, CallGraph, CallSite, Callee, ConstValue, Context, DeclaredType, DfirNode,
    ExternalModulesDfg, Field, FunctionBody, FunctionId, FunctionSymbol, IrId, Lifetime, ModuleDfg,
    NodeId, TypeHash, WellKnownTypes,
};
use kestrel_escape::{
    EscapeConfig, EscapeStats, FunctionSummary, compute_lifetimes_with_config, compute_summaries,
};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

pub const NOTHING_TY: TypeHash = 1;
pub const ANY_TY: TypeHash = 2;
pub const INT_ARRAY_TY: TypeHash = 3;
pub const REF_ARRAY_TY: TypeHash = 4;
pub const PAIR_TY: TypeHash = 5;

pub const ANY_INIT: i64 = 1001;
pub const ANY_HASH_CODE: i64 = 1002;
pub const INT_ARRAY_INIT: i64 = 1003;
pub const REF_ARRAY_INIT: i64 = 1004;
/// An external function outside the trusted runtime: always pessimistic.
pub const OPAQUE_FN: i64 = 1005;
/// Annotated runtime pair constructor: stores both values into the pair.
pub const PAIR_INIT: i64 = 1006;

pub fn test_context() -> Context {
    let mut well_known = WellKnownTypes::default();
    well_known.nothing = Some(NOTHING_TY);
    well_known.arrays.insert(INT_ARRAY_TY, ArrayKind::Int);
    well_known.arrays.insert(REF_ARRAY_TY, ArrayKind::Reference);
    Context::new(8, well_known)
}

pub struct TestModule {
    pub context: Context,
    pub module: ModuleDfg,
    pub external: ExternalModulesDfg,
    pub call_graph: CallGraph,
}

impl TestModule {
    pub fn new() -> Self {
        let mut external = ExternalModulesDfg::new();
        external.publish_type(DeclaredType::new(ANY_TY, "kotlin.Any"));
        external.publish_function(
            ANY_INIT,
            FunctionSymbol::new("kfun:kotlin.Any.<init>", 1).with_annotations(0, vec![0, 0]),
        );
        external.publish_function(
            ANY_HASH_CODE,
            FunctionSymbol::new("kfun:kotlin.Any.hashCode", 1).with_annotations(0, vec![0, 0]),
        );
        external.publish_function(
            INT_ARRAY_INIT,
            FunctionSymbol::new("kfun:kotlin.IntArray.<init>", 2)
                .with_annotations(0, vec![0, 0, 0]),
        );
        external.publish_function(
            REF_ARRAY_INIT,
            FunctionSymbol::new("kfun:kotlin.Array.<init>", 2).with_annotations(0, vec![0, 0, 0]),
        );
        // The pair stores both arguments: P0.intestines -> P1 (code 3 at
        // nibble 1) and P0.intestines -> P2 (code 3 at nibble 2).
        external.publish_type(DeclaredType::new(PAIR_TY, "kotlin.Pair"));
        external.publish_function(
            PAIR_INIT,
            FunctionSymbol::new("kfun:kotlin.Pair.<init>", 3)
                .with_annotations(0, vec![0x330, 0, 0, 0]),
        );
        external.publish_function(
            OPAQUE_FN,
            FunctionSymbol::new("kfun:third.party.consume", 1),
        );
        Self {
            context: test_context(),
            module: ModuleDfg::new(),
            external,
            call_graph: CallGraph::new(),
        }
    }

    pub fn declare(&mut self, name: &str, param_count: u32) -> FunctionId {
        self.module
            .add_function(FunctionSymbol::new(name, param_count), None)
    }

    pub fn set_body(&mut self, id: FunctionId, builder: FnBuilder) {
        for site in &builder.sites {
            self.call_graph.add_call_site(id, *site);
        }
        self.module.set_body(id, builder.body);
    }

    pub fn install(&mut self, name: &str, builder: FnBuilder) -> FunctionId {
        let id = self.declare(name, builder.body.param_count());
        self.set_body(id, builder);
        id
    }

    pub fn run(&self) -> (FxHashMap<IrId, Lifetime>, EscapeStats) {
        self.run_with_config(&EscapeConfig::default())
    }

    pub fn run_with_config(
        &self,
        config: &EscapeConfig,
    ) -> (FxHashMap<IrId, Lifetime>, EscapeStats) {
        let mut lifetimes = FxHashMap::default();
        let stats = compute_lifetimes_with_config(
            &self.context,
            &self.module,
            &self.external,
            &self.call_graph,
            &mut lifetimes,
            config,
        )
        .expect("escape analysis failed");
        (lifetimes, stats)
    }

    pub fn summaries(&self) -> FxHashMap<FunctionId, FunctionSummary> {
        compute_summaries(
            &self.context,
            &self.module,
            &self.external,
            &self.call_graph,
            &EscapeConfig::default(),
        )
        .expect("escape analysis failed")
    }
}

/// Body builder tracking a scope stack and the call sites to register.
pub struct FnBuilder {
    pub body: FunctionBody,
    scopes: Vec<NodeId>,
    pub sites: Vec<CallSite>,
}

impl FnBuilder {
    /// A body whose top-level statements sit at depth 0 (the root scope is
    /// depth -1 and holds a single nested body scope).
    pub fn new(param_count: u32) -> Self {
        let mut body = FunctionBody::new(param_count);
        let root = body.root_scope();
        let top = body.nested_scope(root);
        Self {
            body,
            scopes: vec![top],
            sites: Vec::new(),
        }
    }

    fn scope(&self) -> NodeId {
        *self.scopes.last().expect("scope stack is never empty")
    }

    pub fn enter_scope(&mut self) {
        let scope = self.body.nested_scope(self.scope());
        self.scopes.push(scope);
    }

    pub fn exit_scope(&mut self) {
        self.scopes.pop();
    }

    pub fn param(&mut self, index: u32) -> NodeId {
        let scope = self.scope();
        self.body.alloc_in(scope, DfirNode::Parameter { index })
    }

    pub fn int(&mut self, value: i64) -> NodeId {
        let scope = self.scope();
        self.body.alloc_in(
            scope,
            DfirNode::Const {
                value: ConstValue::Int(value),
            },
        )
    }

    pub fn variable(&mut self, values: &[NodeId]) -> NodeId {
        let scope = self.scope();
        self.body.alloc_in(
            scope,
            DfirNode::Variable {
                values: SmallVec::from_slice(values),
            },
        )
    }

    pub fn new_object(
        &mut self,
        ty: TypeHash,
        args: &[NodeId],
        ir: u64,
        constructor: Callee,
    ) -> NodeId {
        let scope = self.scope();
        let node = self.body.alloc_in(
            scope,
            DfirNode::NewObject {
                constructed_type: ty,
                arguments: SmallVec::from_slice(args),
                ir: IrId(ir),
            },
        );
        self.sites.push(CallSite {
            node,
            callee: constructor,
        });
        node
    }

    pub fn call(&mut self, callee: Callee, args: &[NodeId], ir: u64) -> NodeId {
        let scope = self.scope();
        let node = self.body.alloc_in(
            scope,
            DfirNode::Call {
                arguments: SmallVec::from_slice(args),
                ir: IrId(ir),
            },
        );
        self.sites.push(CallSite { node, callee });
        node
    }

    pub fn field_write(&mut self, receiver: Option<NodeId>, field: Field, value: NodeId) -> NodeId {
        let scope = self.scope();
        self.body.alloc_in(
            scope,
            DfirNode::FieldWrite {
                receiver,
                field,
                value,
            },
        )
    }

    pub fn field_read(&mut self, receiver: Option<NodeId>, field: Field, ir: u64) -> NodeId {
        let scope = self.scope();
        self.body.alloc_in(
            scope,
            DfirNode::FieldRead {
                receiver,
                field,
                ir: IrId(ir),
            },
        )
    }

    pub fn array_write(&mut self, array: NodeId, value: NodeId) -> NodeId {
        let scope = self.scope();
        self.body
            .alloc_in(scope, DfirNode::ArrayWrite { array, value })
    }

    pub fn singleton(&mut self, ty: TypeHash) -> NodeId {
        let scope = self.scope();
        self.body.alloc_in(scope, DfirNode::Singleton { ty })
    }

    pub fn ret(&mut self, value: NodeId) {
        let scope = self.scope();
        self.body.set_return(scope, value);
    }

    pub fn throw(&mut self, value: NodeId) {
        let scope = self.scope();
        self.body.set_throw(scope, value);
    }
}

pub fn field(hash: i64, name: &str) -> Field {
    Field::new(None, None, hash, Some(name))
}
