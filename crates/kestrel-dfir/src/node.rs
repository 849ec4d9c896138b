use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::arena::Arena;
use crate::field::{Field, TypeHash};
use crate::identifier;

identifier! {
    /// A node of one function's data-flow IR.
    struct NodeId
}

/// Handle of the compiler-IR element an allocation site originated from.
///
/// The analysis never interprets it: it is the key under which the computed
/// lifetime is reported back to the code generator.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IrId(pub u64);

/// A compile-time constant carried by the IR.
///
/// The analysis only ever inspects integer constants (stack-array sizing);
/// everything else collapses to [`ConstValue::Other`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConstValue {
    Int(i64),
    Other,
}

/// One node of the data-flow IR: a closed sum, arena-held per function.
///
/// A function body is a tree of [`Scope`](DfirNode::Scope) nodes rooted at
/// [`FunctionBody::root_scope`]; every other variant is a value node living
/// in exactly one scope.
#[derive(Clone, Debug)]
pub enum DfirNode {
    Parameter {
        index: u32,
    },
    /// A local variable; `values` are the nodes assigned into it.
    Variable {
        values: SmallVec<[NodeId; 2]>,
    },
    /// `receiver.field` read; `receiver` absent for a read of a global.
    FieldRead {
        receiver: Option<NodeId>,
        field: Field,
        ir: IrId,
    },
    /// `receiver.field = value`; `receiver` absent for a write to a global.
    FieldWrite {
        receiver: Option<NodeId>,
        field: Field,
        value: NodeId,
    },
    ArrayRead {
        array: NodeId,
        ir: IrId,
    },
    ArrayWrite {
        array: NodeId,
        value: NodeId,
    },
    /// Lazily initialized `object` declaration access.
    Singleton {
        ty: TypeHash,
    },
    NewObject {
        constructed_type: TypeHash,
        arguments: SmallVec<[NodeId; 4]>,
        ir: IrId,
    },
    Call {
        arguments: SmallVec<[NodeId; 4]>,
        ir: IrId,
    },
    Scope {
        nodes: Vec<NodeId>,
    },
    Const {
        value: ConstValue,
    },
}

impl DfirNode {
    pub fn is_scope(&self) -> bool {
        matches!(self, DfirNode::Scope { .. })
    }
}

/// The data-flow IR of one function.
///
/// Built once by the DFIR builder, then read-only for the analysis.
#[derive(Clone, Debug)]
pub struct FunctionBody {
    nodes: Arena<NodeId, DfirNode>,
    root_scope: NodeId,
    /// scope -> node returned from that scope
    returns: FxHashMap<NodeId, NodeId>,
    /// scope -> node thrown from that scope
    throws: FxHashMap<NodeId, NodeId>,
    param_count: u32,
}

impl FunctionBody {
    /// Start an empty body with a fresh root scope.
    pub fn new(param_count: u32) -> Self {
        let mut nodes = Arena::new();
        let root_scope = nodes.alloc(DfirNode::Scope { nodes: Vec::new() });
        Self {
            nodes,
            root_scope,
            returns: FxHashMap::default(),
            throws: FxHashMap::default(),
            param_count,
        }
    }

    pub fn alloc(&mut self, node: DfirNode) -> NodeId {
        self.nodes.alloc(node)
    }

    /// Allocate `node` and append it to `scope`.
    pub fn alloc_in(&mut self, scope: NodeId, node: DfirNode) -> NodeId {
        let id = self.nodes.alloc(node);
        self.attach(scope, id);
        id
    }

    /// Append an already-allocated node to `scope`.
    pub fn attach(&mut self, scope: NodeId, node: NodeId) {
        match &mut self.nodes[scope] {
            DfirNode::Scope { nodes } => nodes.push(node),
            _ => panic!("attach target {scope:?} is not a scope"),
        }
    }

    /// Open a nested scope under `parent`.
    pub fn nested_scope(&mut self, parent: NodeId) -> NodeId {
        self.alloc_in(parent, DfirNode::Scope { nodes: Vec::new() })
    }

    /// Record that `scope` returns `node`.
    pub fn set_return(&mut self, scope: NodeId, node: NodeId) {
        self.returns.insert(scope, node);
    }

    /// Record that `scope` throws `node`.
    pub fn set_throw(&mut self, scope: NodeId, node: NodeId) {
        self.throws.insert(scope, node);
    }

    pub fn nodes(&self) -> &Arena<NodeId, DfirNode> {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &DfirNode {
        &self.nodes[id]
    }

    pub fn root_scope(&self) -> NodeId {
        self.root_scope
    }

    pub fn returns(&self) -> &FxHashMap<NodeId, NodeId> {
        &self.returns
    }

    pub fn throws(&self) -> &FxHashMap<NodeId, NodeId> {
        &self.throws
    }

    pub fn param_count(&self) -> u32 {
        self.param_count
    }

    /// Resolve `node` to an integer constant if it is one, or a variable
    /// whose single assigned value is one.
    pub fn as_int_const(&self, node: NodeId) -> Option<i64> {
        match self.node(node) {
            DfirNode::Const {
                value: ConstValue::Int(v),
            } => Some(*v),
            DfirNode::Variable { values } if values.len() == 1 => match self.node(values[0]) {
                DfirNode::Const {
                    value: ConstValue::Int(v),
                } => Some(*v),
                _ => None,
            },
            _ => None,
        }
    }
}
