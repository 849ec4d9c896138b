/// Where a value computed at an allocation site is allowed to live.
///
/// The analysis reasons about all six outcomes, but the code generator only
/// understands [`Stack`](Lifetime::Stack) and [`Global`](Lifetime::Global);
/// everything else collapses to `Global` at emission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Lifetime {
    /// The value never leaves the frame it was allocated in.
    Stack,
    /// Confined to the function but outlives its allocation scope.
    Local,
    /// Reachable from a parameter of the enclosing function.
    Argument,
    /// The value is returned.
    ReturnValue,
    /// Reachable through a field of the returned value.
    IndirectReturnValue,
    /// Reachable from a global root, or thrown.
    Global,
}

impl Lifetime {
    /// Collapse to the two lifetimes the code generator supports.
    pub fn emitted(self) -> Lifetime {
        match self {
            Lifetime::Stack => Lifetime::Stack,
            _ => Lifetime::Global,
        }
    }
}

impl std::fmt::Display for Lifetime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Lifetime::Stack => "stack",
            Lifetime::Local => "local",
            Lifetime::Argument => "argument",
            Lifetime::ReturnValue => "return-value",
            Lifetime::IndirectReturnValue => "indirect-return-value",
            Lifetime::Global => "global",
        };
        f.write_str(s)
    }
}
