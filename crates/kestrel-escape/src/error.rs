use kestrel_dfir::TypeHash;

/// Error type for escape-analysis failures.
///
/// Every variant is a programming or integration bug, not a recoverable
/// condition: the pass aborts with a diagnostic and the caller is expected
/// to treat the module as failed.
#[derive(Debug, thiserror::Error)]
pub enum EscapeError {
    /// The output lifetime map already had entries at entry.
    #[error("lifetime map must be empty at entry, found {0} stale entries")]
    LifetimesNotEmpty(usize),
    /// A type hash could not be resolved in the context or any module.
    #[error("unresolved type hash {0:#x}")]
    UnresolvedType(TypeHash),
    /// A packed points-to annotation carried a nibble outside `0..=4`.
    #[error("invalid points-to code {code} between parameters {from} and {to}")]
    InvalidPointsToCode { code: u32, from: u32, to: u32 },
    /// A drain kept outgoing assignment edges after canonicalization.
    #[error("drain node {node} has outgoing assignment edges after canonicalization")]
    DrainAssignmentEdges { node: usize },
    /// A drain carried two outgoing field edges with the same label.
    #[error("drain node {node} carries duplicate field label {field:#x}")]
    DuplicateFieldLabel { node: usize, field: i64 },
    /// A node received more than one incoming field edge during painting.
    #[error("node {node} painted twice during summary extraction")]
    DoublyPainted { node: usize },
}
