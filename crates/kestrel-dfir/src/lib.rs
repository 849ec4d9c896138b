//! Input data model for the escape analysis: per-function data-flow IR
//! bodies, module and symbol tables, the whole-program call graph, and the
//! lifetime vocabulary shared with the code generator.

pub mod arena;
mod callgraph;
mod field;
mod lifetime;
mod module;
mod node;

pub use arena::{Arena, Id, Identifier};
pub use callgraph::{CallGraph, CallSite, Callee};
pub use field::{Field, INTESTINES_HASH, RETURN_VALUE_HASH, TypeHash};
pub use lifetime::Lifetime;
pub use module::{
    ArrayKind, Context, DeclaredType, ExternalModulesDfg, FunctionDecl, FunctionId,
    FunctionSymbol, ModuleDfg, WellKnownTypes,
};
pub use node::{ConstValue, DfirNode, FunctionBody, IrId, NodeId};
