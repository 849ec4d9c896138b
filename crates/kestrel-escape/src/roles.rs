//! Intraprocedural role assignment.
//!
//! One walk over a function's scope tree assigns every value node its
//! lexical depth; a second walk over the value nodes records the roles the
//! node's value is used in. The result is the per-node [`NodeInfo`] side
//! table the points-to graph is seeded from.

use kestrel_dfir::{
    Context, DfirNode, ExternalModulesDfg, Field, FunctionBody, Identifier, ModuleDfg, NodeId,
};
use smallvec::SmallVec;

use crate::error::EscapeError;

/// Sentinel depth of nodes reachable from a global root or thrown.
pub const DEPTH_ESCAPES: i32 = -3;
/// Sentinel depth of parameters.
pub const DEPTH_PARAMETER: i32 = -2;
/// Sentinel depth of returned values.
pub const DEPTH_RETURN_VALUE: i32 = -1;
/// Depth of nodes with no lexical position (synthetic graph nodes).
pub const DEPTH_INFINITY: i32 = 1_000_000;

/// The closed set of roles a node's value can be used in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    ReturnValue = 0,
    ThrowValue = 1,
    WriteField = 2,
    ReadField = 3,
    WrittenToGlobal = 4,
    Assigned = 5,
}

impl Role {
    pub const COUNT: usize = 6;

    fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// The other end of a role relation: the node and field involved, where the
/// role carries them (`WriteField`, `ReadField`, `Assigned`).
#[derive(Clone, Debug)]
pub struct RoleEntry {
    pub node: Option<NodeId>,
    pub field: Option<Field>,
}

/// Lexical depth plus the roles recorded for one DFIR node.
///
/// Role presence is a bitmask; entries are flat per-role lists, most of
/// which stay empty.
#[derive(Clone, Debug)]
pub struct NodeInfo {
    depth: i32,
    mask: u8,
    entries: [SmallVec<[RoleEntry; 1]>; Role::COUNT],
}

impl NodeInfo {
    pub fn new(depth: i32) -> Self {
        Self {
            depth,
            mask: 0,
            entries: Default::default(),
        }
    }

    pub fn depth(&self) -> i32 {
        self.depth
    }

    pub fn add_role(&mut self, role: Role) {
        self.mask |= role.bit();
    }

    pub fn add_entry(&mut self, role: Role, node: Option<NodeId>, field: Option<Field>) {
        self.mask |= role.bit();
        self.entries[role as usize].push(RoleEntry { node, field });
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.mask & role.bit() != 0
    }

    pub fn entries(&self, role: Role) -> &[RoleEntry] {
        &self.entries[role as usize]
    }

    /// Whether the node escapes before any propagation: it was written to a
    /// global or thrown.
    pub fn escapes(&self) -> bool {
        self.mask & (Role::WrittenToGlobal.bit() | Role::ThrowValue.bit()) != 0
    }
}

/// The intraprocedural result for one function: a `NodeInfo` per value node,
/// indexed by the node's arena position. Scopes carry no info.
#[derive(Clone, Debug)]
pub struct RoleAssignment {
    infos: Vec<Option<NodeInfo>>,
}

impl RoleAssignment {
    pub fn get(&self, node: NodeId) -> Option<&NodeInfo> {
        self.infos.get(node.index()).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, node: NodeId) -> &mut NodeInfo {
        self.infos[node.index()]
            .as_mut()
            .unwrap_or_else(|| panic!("role entry attached to scope or unvisited node"))
    }
}

/// Run role assignment over one function body.
pub fn assign_roles(
    context: &Context,
    module: &ModuleDfg,
    external: &ExternalModulesDfg,
    body: &FunctionBody,
) -> Result<RoleAssignment, EscapeError> {
    let mut result = RoleAssignment {
        infos: vec![None; body.nodes().len()],
    };

    // Depth walk: the root scope has depth -1, each nested scope adds 1,
    // every value node receives the depth of its containing scope.
    let mut stack: Vec<(NodeId, i32)> = vec![(body.root_scope(), -1)];
    while let Some((scope, depth)) = stack.pop() {
        let DfirNode::Scope { nodes } = body.node(scope) else {
            continue;
        };
        for &child in nodes {
            match body.node(child) {
                DfirNode::Scope { .. } => stack.push((child, depth + 1)),
                _ => result.infos[child.index()] = Some(NodeInfo::new(depth)),
            }
        }
    }

    for &returned in body.returns().values() {
        result.get_mut(returned).add_role(Role::ReturnValue);
    }
    for &thrown in body.throws().values() {
        result.get_mut(thrown).add_role(Role::ThrowValue);
    }

    for (id, node) in body.nodes().iter_with_ids() {
        match node {
            DfirNode::FieldWrite {
                receiver,
                field,
                value,
            } => match receiver {
                Some(receiver) => {
                    result.get_mut(*receiver).add_entry(
                        Role::WriteField,
                        Some(*value),
                        Some(field.clone()),
                    );
                }
                // A write to a global publishes the value.
                None => result.get_mut(*value).add_role(Role::WrittenToGlobal),
            },
            DfirNode::FieldRead { receiver, field, .. } => match receiver {
                Some(receiver) => {
                    result.get_mut(*receiver).add_entry(
                        Role::ReadField,
                        Some(id),
                        Some(field.clone()),
                    );
                }
                // A read of a global yields a value from an escaped region.
                None => result.get_mut(id).add_role(Role::WrittenToGlobal),
            },
            DfirNode::ArrayWrite { array, value } => {
                result.get_mut(*array).add_entry(
                    Role::WriteField,
                    Some(*value),
                    Some(Field::intestines()),
                );
            }
            DfirNode::ArrayRead { array, .. } => {
                result
                    .get_mut(*array)
                    .add_entry(Role::ReadField, Some(id), Some(Field::intestines()));
            }
            DfirNode::Singleton { ty } => {
                if !context.is_nothing(*ty) {
                    if !module.declares_type(*ty) && external.resolve_type(*ty).is_none() {
                        return Err(EscapeError::UnresolvedType(*ty));
                    }
                    result.get_mut(id).add_role(Role::WrittenToGlobal);
                }
            }
            DfirNode::Variable { values } => {
                for &value in values {
                    result.get_mut(id).add_entry(Role::Assigned, Some(value), None);
                }
            }
            DfirNode::Parameter { .. }
            | DfirNode::NewObject { .. }
            | DfirNode::Call { .. }
            | DfirNode::Const { .. }
            | DfirNode::Scope { .. } => {}
        }
    }

    Ok(result)
}
