use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::arena::Arena;
use crate::field::TypeHash;
use crate::identifier;
use crate::node::FunctionBody;

identifier! {
    /// A function of the module under compilation.
    struct FunctionId
}

/// Element kind of a well-known array class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArrayKind {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Float,
    Long,
    Double,
    Reference,
}

impl ArrayKind {
    /// Per-element payload size in bytes.
    pub fn item_size(self, pointer_size: u32) -> u32 {
        match self {
            ArrayKind::Boolean | ArrayKind::Byte => 1,
            ArrayKind::Char | ArrayKind::Short => 2,
            ArrayKind::Int | ArrayKind::Float => 4,
            ArrayKind::Long | ArrayKind::Double => 8,
            ArrayKind::Reference => pointer_size,
        }
    }
}

/// The class symbols the runtime declares and the analysis must recognize.
#[derive(Clone, Debug, Default)]
pub struct WellKnownTypes {
    /// The bottom type; a `Singleton` of it never materializes.
    pub nothing: Option<TypeHash>,
    /// Primitive and reference array classes, by type hash.
    pub arrays: FxHashMap<TypeHash, ArrayKind>,
}

/// Compilation context: runtime geometry plus well-known symbols.
#[derive(Clone, Debug)]
pub struct Context {
    pointer_size: u32,
    well_known: WellKnownTypes,
}

impl Context {
    pub fn new(pointer_size: u32, well_known: WellKnownTypes) -> Self {
        Self {
            pointer_size,
            well_known,
        }
    }

    pub fn pointer_size(&self) -> u32 {
        self.pointer_size
    }

    pub fn is_nothing(&self, ty: TypeHash) -> bool {
        self.well_known.nothing == Some(ty)
    }

    pub fn array_kind(&self, ty: TypeHash) -> Option<ArrayKind> {
        self.well_known.arrays.get(&ty).copied()
    }
}

/// A function symbol: fully qualified name, arity, and the optional packed
/// escape annotations the runtime library carries.
#[derive(Clone, Debug)]
pub struct FunctionSymbol {
    pub name: String,
    pub param_count: u32,
    /// Bitset over parameter indices; the bit at `param_count` is the return.
    pub escapes: Option<u32>,
    /// One word per parameter plus the return slot; nibble `4*j` of word `i`
    /// encodes the points-to relation from parameter `i` to parameter `j`.
    pub points_to: Option<Vec<u32>>,
}

impl FunctionSymbol {
    pub fn new(name: impl Into<String>, param_count: u32) -> Self {
        Self {
            name: name.into(),
            param_count,
            escapes: None,
            points_to: None,
        }
    }

    pub fn with_annotations(mut self, escapes: u32, points_to: Vec<u32>) -> Self {
        self.escapes = Some(escapes);
        self.points_to = Some(points_to);
        self
    }

    pub fn has_annotations(&self) -> bool {
        self.escapes.is_some() || self.points_to.is_some()
    }
}

/// One function of the module: its symbol and, when the function was
/// compiled from source rather than imported, its DFIR body.
#[derive(Clone, Debug)]
pub struct FunctionDecl {
    pub symbol: FunctionSymbol,
    pub body: Option<FunctionBody>,
}

/// The module under compilation: function table plus declared types.
#[derive(Clone, Debug, Default)]
pub struct ModuleDfg {
    functions: Arena<FunctionId, FunctionDecl>,
    declared_types: IndexMap<TypeHash, DeclaredType>,
}

impl ModuleDfg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&mut self, symbol: FunctionSymbol, body: Option<FunctionBody>) -> FunctionId {
        self.functions.alloc(FunctionDecl { symbol, body })
    }

    /// Attach a body to a previously declared function. Declaration and
    /// body construction are separate steps so that bodies can reference
    /// the ids of functions declared later (recursion, forward calls).
    pub fn set_body(&mut self, id: FunctionId, body: FunctionBody) {
        self.functions[id].body = Some(body);
    }

    pub fn declare_type(&mut self, ty: DeclaredType) {
        self.declared_types.insert(ty.hash, ty);
    }

    pub fn functions(&self) -> &Arena<FunctionId, FunctionDecl> {
        &self.functions
    }

    pub fn function(&self, id: FunctionId) -> &FunctionDecl {
        &self.functions[id]
    }

    pub fn body(&self, id: FunctionId) -> Option<&FunctionBody> {
        self.functions[id].body.as_ref()
    }

    pub fn declares_type(&self, hash: TypeHash) -> bool {
        self.declared_types.contains_key(&hash)
    }
}

/// A type declaration visible across module boundaries.
#[derive(Clone, Debug)]
pub struct DeclaredType {
    pub hash: TypeHash,
    pub name: String,
}

impl DeclaredType {
    pub fn new(hash: TypeHash, name: impl Into<String>) -> Self {
        Self {
            hash,
            name: name.into(),
        }
    }
}

/// Public declarations of every external module, keyed by symbol hash.
#[derive(Clone, Debug, Default)]
pub struct ExternalModulesDfg {
    public_types: IndexMap<TypeHash, DeclaredType>,
    public_functions: IndexMap<i64, FunctionSymbol>,
}

impl ExternalModulesDfg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish_type(&mut self, ty: DeclaredType) {
        self.public_types.insert(ty.hash, ty);
    }

    pub fn publish_function(&mut self, hash: i64, symbol: FunctionSymbol) {
        self.public_functions.insert(hash, symbol);
    }

    /// Resolve an external type by hash.
    pub fn resolve_type(&self, hash: TypeHash) -> Option<&DeclaredType> {
        self.public_types.get(&hash)
    }

    /// Resolve an external function by symbol hash. Unresolvable symbols
    /// stay external: the caller falls back to the pessimistic summary.
    pub fn resolve_function(&self, hash: i64) -> Option<&FunctionSymbol> {
        self.public_functions.get(&hash)
    }
}
