//! Escape analysis for an ahead-of-time compiler targeting a managed,
//! reference-counted runtime.
//!
//! The pass classifies each allocation site of a module with a lifetime,
//! principally deciding which allocations may be placed on the stack frame
//! rather than the heap. It runs in two stages:
//!
//! ```text
//! DFIR ──> intraprocedural roles ──> per-SCC fixpoint:
//!            build points-to graph ──> inline callee summaries
//!              ──> closure (drains) ──> depths ──> lifetimes
//!              ──> compressed summary
//! ```
//!
//! Inputs (the DFIR bodies, the call graph and its condensation, symbol
//! tables) come from [`kestrel_dfir`]; the single output is a map from
//! allocation-site IR elements to [`kestrel_dfir::Lifetime`], of which only
//! `Stack` and `Global` are ever emitted.

mod closure;
mod driver;
mod error;
mod lifetime;
mod paint;
mod ptg;
mod roles;
mod summary;

pub use driver::{
    EscapeConfig, EscapeStats, compute_lifetimes, compute_lifetimes_with_config,
    compute_summaries,
};
pub use error::EscapeError;
pub use roles::{
    DEPTH_ESCAPES, DEPTH_INFINITY, DEPTH_PARAMETER, DEPTH_RETURN_VALUE, NodeInfo, Role,
    RoleAssignment, RoleEntry, assign_roles,
};
pub use summary::{FunctionSummary, SummaryEdge, SummaryKind, SummaryNode};
