//! Lexical scopes and variable declarations.
//!
//! Scopes form a tree rooted at the global scope. They are
//! arena-allocated in the [`CompilerContext`](crate::context::CompilerContext)
//! and refer to each other by [`ScopeId`], so variable references can
//! carry their resolved scope without ownership cycles.

use std::collections::HashMap;

use bitflags::bitflags;

use crate::ids::{FrameSlotId, ScopeId, VRegId};
use crate::interner::Name;
use crate::types::{Qualifiers, Ty};

bitflags! {
    /// Storage class of a declaration. Empty means plain `auto`.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct Storage: u8 {
        const STATIC      = 1 << 0;
        const EXTERN      = 1 << 1;
        const TYPEDEF     = 1 << 2;
        const ENUM_MEMBER = 1 << 3;
    }
}

/// What kind of region a scope covers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ScopeKind {
    Global,
    /// Function parameter list.
    Params,
    Block,
}

/// A folded constant initializer for a global or static variable.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GlobalInit {
    Fixnum(i64),
    Flonum(f64),
}

/// Backend slot assignment for a local variable.
///
/// The native builder fills `vreg` (scalars) or `frame` (addressed
/// locals and aggregates); the wasm backend fills `wasm_index`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalSlot {
    pub vreg: Option<VRegId>,
    pub frame: Option<FrameSlotId>,
    pub wasm_index: Option<u32>,
}

/// A declared variable.
#[derive(Clone, Debug)]
pub struct VarInfo {
    pub name: Name,
    pub ty: Ty,
    pub storage: Storage,
    pub qual: Qualifiers,
    /// Value of an enum member (`storage` contains `ENUM_MEMBER`).
    pub enum_value: i64,
    /// Parameter position when declared in a `Params` scope.
    pub param_index: Option<u32>,
    /// Initializer for globals and statics.
    pub init: Option<GlobalInit>,
    pub local: LocalSlot,
}

impl VarInfo {
    pub fn new(name: Name, ty: Ty, storage: Storage, qual: Qualifiers) -> Self {
        Self {
            name,
            ty,
            storage,
            qual,
            enum_value: 0,
            param_index: None,
            init: None,
            local: LocalSlot::default(),
        }
    }

    /// True when the variable lives in a register or frame slot rather
    /// than in static storage.
    pub fn is_local_storage(&self) -> bool {
        !self
            .storage
            .intersects(Storage::STATIC | Storage::EXTERN | Storage::ENUM_MEMBER | Storage::TYPEDEF)
    }
}

/// One node of the scope tree.
#[derive(Debug)]
pub struct ScopeData {
    pub parent: Option<ScopeId>,
    pub kind: ScopeKind,
    /// Declaration-ordered variables.
    pub vars: Vec<VarInfo>,
    by_name: HashMap<Name, usize>,
    /// Names introduced by `typedef` (the scope's type namespace).
    typedefs: HashMap<Name, Ty>,
    /// struct/union/enum tag namespace.
    tags: HashMap<Name, Ty>,
}

impl ScopeData {
    pub fn new(parent: Option<ScopeId>, kind: ScopeKind) -> Self {
        Self {
            parent,
            kind,
            vars: Vec::new(),
            by_name: HashMap::new(),
            typedefs: HashMap::new(),
            tags: HashMap::new(),
        }
    }

    /// Add a variable; returns its index, or None on redefinition.
    pub fn add_var(&mut self, var: VarInfo) -> Option<usize> {
        if self.by_name.contains_key(&var.name) {
            return None;
        }
        let index = self.vars.len();
        self.by_name.insert(var.name, index);
        self.vars.push(var);
        Some(index)
    }

    pub fn find_var(&self, name: Name) -> Option<usize> {
        self.by_name.get(&name).copied()
    }

    pub fn add_typedef(&mut self, name: Name, ty: Ty) {
        self.typedefs.insert(name, ty);
    }

    pub fn find_typedef(&self, name: Name) -> Option<Ty> {
        self.typedefs.get(&name).copied()
    }

    pub fn add_tag(&mut self, name: Name, ty: Ty) {
        self.tags.insert(name, ty);
    }

    pub fn find_tag(&self, name: Name) -> Option<Ty> {
        self.tags.get(&name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redefinition_rejected() {
        let mut scope = ScopeData::new(None, ScopeKind::Global);
        let v = VarInfo::new(Name(0), Ty::INT, Storage::empty(), Qualifiers::empty());
        assert_eq!(scope.add_var(v.clone()), Some(0));
        assert_eq!(scope.add_var(v), None);
    }

    #[test]
    fn test_declaration_order_preserved() {
        let mut scope = ScopeData::new(None, ScopeKind::Block);
        for i in 0..4 {
            let v = VarInfo::new(Name(i), Ty::INT, Storage::empty(), Qualifiers::empty());
            assert_eq!(scope.add_var(v), Some(i));
        }
        let names: Vec<_> = scope.vars.iter().map(|v| v.name).collect();
        assert_eq!(names, vec![Name(0), Name(1), Name(2), Name(3)]);
    }

    #[test]
    fn test_local_storage_classification() {
        let auto = VarInfo::new(Name(0), Ty::INT, Storage::empty(), Qualifiers::empty());
        let stat = VarInfo::new(Name(1), Ty::INT, Storage::STATIC, Qualifiers::empty());
        assert!(auto.is_local_storage());
        assert!(!stat.is_local_storage());
    }
}
