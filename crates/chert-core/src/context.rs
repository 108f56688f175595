//! Central compiler context.
//!
//! Every piece of state the original kept process-wide (current scope,
//! token vector, symbol tables, source stack) lives here instead, so two
//! compilations are two `CompilerContext` values.

use std::sync::Arc;

use crate::diagnostic::Diagnostics;
use crate::ids::ScopeId;
use crate::index_vec::IndexVec;
use crate::interner::{Interner, Name};
use crate::scope::{ScopeData, ScopeKind, VarInfo};
use crate::source::{SourceMap, Span};
use crate::types::{TargetSizes, Ty, TypeInterner};

/// Stores global compiler state: interners, the scope arena, source
/// files, and accumulated diagnostics.
pub struct CompilerContext {
    /// String interner (shared, thread-safe).
    pub interner: Arc<Interner>,
    /// Type interner, parameterized by the target's size model.
    pub types: TypeInterner,
    /// Scope arena; index 0 is the global scope.
    pub scopes: IndexVec<ScopeId, ScopeData>,
    /// Source file management.
    pub source_map: SourceMap,
    /// Accumulated diagnostics.
    pub diagnostics: Diagnostics,
    /// String literal pool, deduplicated, in first-encounter order.
    strings: Vec<String>,
}

impl CompilerContext {
    pub fn new(sizes: TargetSizes) -> Self {
        let mut scopes = IndexVec::new();
        let global = scopes.push(ScopeData::new(None, ScopeKind::Global));
        debug_assert_eq!(global, ScopeId(0));
        Self {
            interner: Arc::new(Interner::new()),
            types: TypeInterner::new(sizes),
            scopes,
            source_map: SourceMap::new(),
            diagnostics: Diagnostics::new(),
            strings: Vec::new(),
        }
    }

    pub fn global_scope(&self) -> ScopeId {
        ScopeId(0)
    }

    // ------------------------------------------------------------------
    // String interning
    // ------------------------------------------------------------------

    pub fn intern(&self, s: &str) -> Name {
        self.interner.intern(s)
    }

    pub fn str(&self, name: Name) -> String {
        self.interner.str(name).to_string()
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    pub fn new_scope(&mut self, parent: ScopeId, kind: ScopeKind) -> ScopeId {
        self.scopes.push(ScopeData::new(Some(parent), kind))
    }

    /// Walk the scope chain looking for a variable. Returns the scope it
    /// was found in plus its index there.
    pub fn find_var(&self, from: ScopeId, name: Name) -> Option<(ScopeId, usize)> {
        let mut cur = Some(from);
        while let Some(sid) = cur {
            let scope = &self.scopes[sid];
            if let Some(idx) = scope.find_var(name) {
                return Some((sid, idx));
            }
            cur = scope.parent;
        }
        None
    }

    pub fn var(&self, scope: ScopeId, index: usize) -> &VarInfo {
        &self.scopes[scope].vars[index]
    }

    pub fn var_mut(&mut self, scope: ScopeId, index: usize) -> &mut VarInfo {
        &mut self.scopes[scope].vars[index]
    }

    /// Walk the scope chain for a typedef name.
    pub fn find_typedef(&self, from: ScopeId, name: Name) -> Option<Ty> {
        let mut cur = Some(from);
        while let Some(sid) = cur {
            let scope = &self.scopes[sid];
            if let Some(ty) = scope.find_typedef(name) {
                return Some(ty);
            }
            cur = scope.parent;
        }
        None
    }

    /// Walk the scope chain for a struct/union/enum tag.
    pub fn find_tag(&self, from: ScopeId, name: Name) -> Option<Ty> {
        let mut cur = Some(from);
        while let Some(sid) = cur {
            let scope = &self.scopes[sid];
            if let Some(ty) = scope.find_tag(name) {
                return Some(ty);
            }
            cur = scope.parent;
        }
        None
    }

    pub fn is_global_scope(&self, scope: ScopeId) -> bool {
        scope == self.global_scope()
    }

    // ------------------------------------------------------------------
    // String literals
    // ------------------------------------------------------------------

    /// Pool a string literal, returning its dense index.
    pub fn add_string(&mut self, value: &str) -> u32 {
        if let Some(idx) = self.strings.iter().position(|s| s == value) {
            return idx as u32;
        }
        self.strings.push(value.to_string());
        (self.strings.len() - 1) as u32
    }

    pub fn string(&self, index: u32) -> &str {
        &self.strings[index as usize]
    }

    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    pub fn error(&mut self, span: Span, message: impl Into<String>) {
        self.diagnostics.error(span, message);
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.has_errors()
    }

    pub fn render_diagnostics(&self) -> String {
        self.diagnostics.render(&self.source_map)
    }

    /// Human-readable type name for diagnostics.
    pub fn type_name(&self, ty: Ty) -> String {
        self.types.display(ty, &self.interner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{Storage, VarInfo};
    use crate::types::Qualifiers;

    #[test]
    fn test_scope_chain_lookup() {
        let mut ctx = CompilerContext::new(TargetSizes::lp64());
        let g = ctx.global_scope();
        let name = ctx.intern("x");
        ctx.scopes[g]
            .add_var(VarInfo::new(name, Ty::INT, Storage::empty(), Qualifiers::empty()))
            .unwrap();

        let inner = ctx.new_scope(g, ScopeKind::Block);
        let (found_scope, idx) = ctx.find_var(inner, name).unwrap();
        assert_eq!(found_scope, g);
        assert_eq!(ctx.var(found_scope, idx).ty, Ty::INT);
    }

    #[test]
    fn test_shadowing_resolves_to_innermost() {
        let mut ctx = CompilerContext::new(TargetSizes::lp64());
        let g = ctx.global_scope();
        let name = ctx.intern("x");
        ctx.scopes[g]
            .add_var(VarInfo::new(name, Ty::INT, Storage::empty(), Qualifiers::empty()))
            .unwrap();

        let inner = ctx.new_scope(g, ScopeKind::Block);
        ctx.scopes[inner]
            .add_var(VarInfo::new(name, Ty::LONG, Storage::empty(), Qualifiers::empty()))
            .unwrap();

        let (found_scope, idx) = ctx.find_var(inner, name).unwrap();
        assert_eq!(found_scope, inner);
        assert_eq!(ctx.var(found_scope, idx).ty, Ty::LONG);
    }

    #[test]
    fn test_string_pool_dedup() {
        let mut ctx = CompilerContext::new(TargetSizes::lp64());
        let a = ctx.add_string("hello");
        let b = ctx.add_string("world");
        let c = ctx.add_string("hello");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(ctx.string_count(), 2);
    }
}
