use std::hash::{Hash, Hasher};

/// Hash identifying a type across module boundaries.
pub type TypeHash = i64;

/// A field referenced by the data-flow IR.
///
/// Identity is the `hash` alone: two fields with equal hashes are the same
/// field regardless of the metadata carried along for diagnostics. The
/// declaring type is absent for fields of external types whose declarations
/// were not imported.
#[derive(Clone, Debug)]
pub struct Field {
    pub declaring_type: Option<TypeHash>,
    pub field_type: Option<TypeHash>,
    pub hash: i64,
    pub name: Option<Box<str>>,
}

/// Reserved hash of the [`Field::intestines`] sentinel.
pub const INTESTINES_HASH: i64 = -1;
/// Reserved hash of the [`Field::return_value`] sentinel.
pub const RETURN_VALUE_HASH: i64 = -2;

impl Field {
    pub fn new(
        declaring_type: Option<TypeHash>,
        field_type: Option<TypeHash>,
        hash: i64,
        name: Option<&str>,
    ) -> Self {
        Self {
            declaring_type,
            field_type,
            hash,
            name: name.map(Into::into),
        }
    }

    /// Stands in for every element of an array: all indices are
    /// indistinguishable to the analysis.
    pub fn intestines() -> Self {
        Self::new(None, None, INTESTINES_HASH, Some("<intestines>"))
    }

    /// Synthetic slot unifying `return x` with field-write handling:
    /// a return is modelled as `ret.<return_value> = x`.
    pub fn return_value() -> Self {
        Self::new(None, None, RETURN_VALUE_HASH, Some("<return>"))
    }

    pub fn is_intestines(&self) -> bool {
        self.hash == INTESTINES_HASH
    }

    pub fn is_return_value(&self) -> bool {
        self.hash == RETURN_VALUE_HASH
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Field {}

impl PartialOrd for Field {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Field {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.hash.cmp(&other.hash)
    }
}

impl Hash for Field {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "#{:x}", self.hash),
        }
    }
}
