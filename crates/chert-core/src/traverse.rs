//! AST traversal: reachability marking and dense index assignment.
//!
//! Walks function bodies from the emission roots (the export list for
//! the WebAssembly backend, every defined function for the native one),
//! registering called symbols as it goes. Function indices are dense and
//! assigned in first-encounter order with imports (declared but not
//! defined) occupying the first block; signature indices are deduplicated
//! through the type interner's structural identity.

use std::collections::HashMap;

use crate::context::CompilerContext;
use crate::ids::ScopeId;
use crate::interner::Name;
use crate::scope::Storage;
use crate::syntax::ast::{Declaration, Expr, ExprKind, Function, Program, Stmt, StmtKind};
use crate::types::Ty;

/// Per-function emission bookkeeping.
#[derive(Clone, Copy, Debug)]
pub struct FuncInfo {
    pub ty: Ty,
    pub defined: bool,
    pub referenced: bool,
    /// Dense function index (imports first). Valid once assigned.
    pub index: u32,
    /// Signature index into [`ProgramIndex::signatures`].
    pub type_index: u32,
}

/// Function table with deterministic first-encounter iteration order.
#[derive(Debug, Default)]
pub struct FuncTable {
    order: Vec<Name>,
    map: HashMap<Name, FuncInfo>,
}

impl FuncTable {
    pub fn ensure(&mut self, name: Name, ty: Ty) -> &mut FuncInfo {
        if !self.map.contains_key(&name) {
            self.order.push(name);
            self.map.insert(
                name,
                FuncInfo {
                    ty,
                    defined: false,
                    referenced: false,
                    index: 0,
                    type_index: 0,
                },
            );
        }
        self.map.get_mut(&name).unwrap()
    }

    pub fn get(&self, name: Name) -> Option<&FuncInfo> {
        self.map.get(&name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Name, &FuncInfo)> {
        self.order.iter().map(move |name| (*name, &self.map[name]))
    }
}

/// Which functions seed the reachability walk.
pub enum EmitRoots<'a> {
    /// Native backend: every defined function is emitted.
    AllDefined,
    /// WebAssembly backend: the requested export list.
    Exports(&'a [Name]),
}

/// The traversal result: function table, signature list, and the global
/// variables in declaration order.
#[derive(Debug, Default)]
pub struct ProgramIndex {
    pub funcs: FuncTable,
    /// Deduplicated function signatures in first-encounter order.
    pub signatures: Vec<Ty>,
    /// Global variables as (scope, index) pairs, in declaration order.
    pub globals: Vec<(ScopeId, usize)>,
}

impl ProgramIndex {
    pub fn import_count(&self) -> usize {
        self.funcs
            .iter()
            .filter(|(_, info)| info.referenced && !info.defined)
            .count()
    }

    pub fn defined_referenced(&self) -> impl Iterator<Item = (Name, &FuncInfo)> {
        self.funcs
            .iter()
            .filter(|(_, info)| info.referenced && info.defined)
    }
}

pub fn traverse(ctx: &mut CompilerContext, program: &Program, roots: EmitRoots) -> ProgramIndex {
    let mut index = ProgramIndex::default();

    for decl in &program.decls {
        match decl {
            Declaration::Func(func) => {
                let info = index.funcs.ensure(func.name, func.ty);
                info.defined = true;
            }
            Declaration::Var { scope, index: var } => {
                if !index.globals.contains(&(*scope, *var)) {
                    index.globals.push((*scope, *var));
                }
            }
        }
    }

    let mut worklist: Vec<Name> = Vec::new();
    match roots {
        EmitRoots::AllDefined => {
            for func in program.functions() {
                let info = index.funcs.ensure(func.name, func.ty);
                if !info.referenced {
                    info.referenced = true;
                    worklist.push(func.name);
                }
            }
        }
        EmitRoots::Exports(names) => {
            for &name in names {
                if !validate_export(ctx, name) {
                    continue;
                }
                let info = match index.funcs.map.get_mut(&name) {
                    Some(info) if info.defined => info,
                    _ => {
                        let msg =
                            format!("export `{}` is not defined", ctx.str(name));
                        ctx.diagnostics.push(crate::diagnostic::Diagnostic::error(msg));
                        continue;
                    }
                };
                if !info.referenced {
                    info.referenced = true;
                    worklist.push(name);
                }
            }
        }
    }

    // Transitive closure over direct calls.
    let by_name: HashMap<Name, &Function> =
        program.functions().map(|f| (f.name, f)).collect();
    while let Some(name) = worklist.pop() {
        let Some(func) = by_name.get(&name) else {
            continue;
        };
        for stmt in &func.body {
            visit_calls(stmt, &mut |callee, ty| {
                let info = index.funcs.ensure(callee, ty);
                if !info.referenced {
                    info.referenced = true;
                    worklist.push(callee);
                }
            });
        }
    }

    // Dense indices: imports first, then defined functions, both in
    // first-encounter order; signatures deduplicated along the way.
    let mut sig_index: HashMap<Ty, u32> = HashMap::new();
    let referenced: Vec<Name> = index
        .funcs
        .iter()
        .filter(|(_, info)| info.referenced && !info.defined)
        .map(|(name, _)| name)
        .chain(
            index
                .funcs
                .iter()
                .filter(|(_, info)| info.referenced && info.defined)
                .map(|(name, _)| name),
        )
        .collect();
    for (i, name) in referenced.iter().enumerate() {
        let ty = index.funcs.map[name].ty;
        let type_index = *sig_index.entry(ty).or_insert_with(|| {
            index.signatures.push(ty);
            (index.signatures.len() - 1) as u32
        });
        let info = index.funcs.map.get_mut(name).unwrap();
        info.index = i as u32;
        info.type_index = type_index;
    }

    index
}

fn validate_export(ctx: &mut CompilerContext, name: Name) -> bool {
    let global = ctx.global_scope();
    let Some(idx) = ctx.scopes[global].find_var(name) else {
        let msg = format!("export `{}` not found", ctx.str(name));
        ctx.diagnostics
            .push(crate::diagnostic::Diagnostic::error(msg));
        return false;
    };
    let var = ctx.var(global, idx);
    if !ctx.types.is_func(var.ty) {
        let msg = format!("export `{}` is not a function", ctx.str(name));
        ctx.diagnostics
            .push(crate::diagnostic::Diagnostic::error(msg));
        return false;
    }
    if var.storage.contains(Storage::STATIC) {
        let msg = format!("export `{}` is not public", ctx.str(name));
        ctx.diagnostics
            .push(crate::diagnostic::Diagnostic::error(msg));
        return false;
    }
    true
}

/// Invoke `f` for every direct call inside `stmt`.
pub fn visit_calls(stmt: &Stmt, f: &mut impl FnMut(Name, Ty)) {
    visit_stmt_exprs(stmt, &mut |expr| {
        if let ExprKind::Call { callee, .. } = &expr.kind {
            if let ExprKind::Var { name, .. } = callee.kind {
                f(name, callee.ty);
            }
        }
    });
}

/// Walk every expression in a statement tree.
pub fn visit_stmt_exprs(stmt: &Stmt, f: &mut impl FnMut(&Expr)) {
    match &stmt.kind {
        StmtKind::Expr(e) | StmtKind::Return(Some(e)) => visit_expr(e, f),
        StmtKind::Block { stmts, .. } | StmtKind::VarDecl { inits: stmts } => {
            for s in stmts {
                visit_stmt_exprs(s, f);
            }
        }
        StmtKind::If {
            cond,
            then_stmt,
            else_stmt,
        } => {
            visit_expr(cond, f);
            visit_stmt_exprs(then_stmt, f);
            if let Some(e) = else_stmt {
                visit_stmt_exprs(e, f);
            }
        }
        StmtKind::Switch { value, body, .. } => {
            visit_expr(value, f);
            visit_stmt_exprs(body, f);
        }
        StmtKind::While { cond, body } => {
            visit_expr(cond, f);
            visit_stmt_exprs(body, f);
        }
        StmtKind::DoWhile { body, cond } => {
            visit_stmt_exprs(body, f);
            visit_expr(cond, f);
        }
        StmtKind::For {
            pre,
            cond,
            post,
            body,
            ..
        } => {
            if let Some(s) = pre {
                visit_stmt_exprs(s, f);
            }
            if let Some(e) = cond {
                visit_expr(e, f);
            }
            if let Some(e) = post {
                visit_expr(e, f);
            }
            visit_stmt_exprs(body, f);
        }
        StmtKind::Return(None)
        | StmtKind::Break
        | StmtKind::Continue
        | StmtKind::Case { .. }
        | StmtKind::Default
        | StmtKind::Goto(_)
        | StmtKind::Label(_)
        | StmtKind::Asm(_)
        | StmtKind::Empty => {}
    }
}

/// Walk an expression tree, visiting every node.
pub fn visit_expr(expr: &Expr, f: &mut impl FnMut(&Expr)) {
    f(expr);
    match &expr.kind {
        ExprKind::Member { target, .. } => visit_expr(target, f),
        ExprKind::Deref(sub)
        | ExprKind::Addr(sub)
        | ExprKind::Unary { sub, .. }
        | ExprKind::Cast(sub)
        | ExprKind::IncDec { sub, .. } => visit_expr(sub, f),
        ExprKind::Binary { lhs, rhs, .. }
        | ExprKind::Logical { lhs, rhs, .. }
        | ExprKind::Assign { lhs, rhs }
        | ExprKind::CompoundAssign { lhs, rhs, .. }
        | ExprKind::Comma { lhs, rhs } => {
            visit_expr(lhs, f);
            visit_expr(rhs, f);
        }
        ExprKind::Call { callee, args } => {
            visit_expr(callee, f);
            for arg in args {
                visit_expr(arg, f);
            }
        }
        ExprKind::Ternary {
            cond,
            then_expr,
            else_expr,
        } => {
            visit_expr(cond, f);
            visit_expr(then_expr, f);
            visit_expr(else_expr, f);
        }
        ExprKind::CompoundLit { inits, .. } => {
            for init in inits {
                visit_expr(init, f);
            }
        }
        ExprKind::BlockExpr(block) => visit_stmt_exprs(block, f),
        ExprKind::IntLit(_)
        | ExprKind::FloatLit(_)
        | ExprKind::StrLit(_)
        | ExprKind::Var { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::{parse_into, tokenize};
    use crate::types::TargetSizes;

    fn analyze(src: &str, roots: &[&str]) -> (CompilerContext, ProgramIndex) {
        let mut ctx = CompilerContext::new(TargetSizes::wasm32());
        let source = ctx.source_map.add_inline(src);
        let tokens = tokenize(src, source, &ctx.interner).expect("lex error");
        let mut program = Program::default();
        parse_into(&mut ctx, tokens, &mut program);
        assert!(!ctx.has_errors(), "{}", ctx.render_diagnostics());

        let root_names: Vec<Name> = roots.iter().map(|r| ctx.intern(r)).collect();
        let index = if roots.is_empty() {
            traverse(&mut ctx, &program, EmitRoots::AllDefined)
        } else {
            traverse(&mut ctx, &program, EmitRoots::Exports(&root_names))
        };
        (ctx, index)
    }

    #[test]
    fn test_reachability_from_export() {
        let src = "
            int helper(int x) { return x * 2; }
            int unused(int x) { return x; }
            int f(int x) { return helper(x) + 1; }
        ";
        let (ctx, index) = analyze(src, &["f"]);
        let f = index.funcs.get(ctx.intern("f")).unwrap();
        let helper = index.funcs.get(ctx.intern("helper")).unwrap();
        let unused = index.funcs.get(ctx.intern("unused")).unwrap();
        assert!(f.referenced);
        assert!(helper.referenced);
        assert!(!unused.referenced);
    }

    #[test]
    fn test_imports_take_first_indices() {
        let src = "
            int external(int x);
            int f(int x) { return external(x); }
        ";
        let (ctx, index) = analyze(src, &["f"]);
        assert_eq!(index.import_count(), 1);
        let ext = index.funcs.get(ctx.intern("external")).unwrap();
        let f = index.funcs.get(ctx.intern("f")).unwrap();
        assert!(!ext.defined);
        assert_eq!(ext.index, 0);
        assert_eq!(f.index, 1);
    }

    #[test]
    fn test_signatures_deduplicated_in_first_encounter_order() {
        let src = "
            int a(int x) { return x; }
            long b(void) { return 0; }
            int c(int x) { return x; }
            int f(int x, int y) { return a(x) + (int)b() + c(y); }
        ";
        let (ctx, index) = analyze(src, &["f", "a", "b", "c"]);
        // Three distinct signatures: (int)->int, ()->long, (int,int)->int.
        assert_eq!(index.signatures.len(), 3);
        let a = index.funcs.get(ctx.intern("a")).unwrap();
        let c = index.funcs.get(ctx.intern("c")).unwrap();
        assert_eq!(a.type_index, c.type_index);
    }

    #[test]
    fn test_unknown_export_reported() {
        let src = "int f(int x) { return x; }";
        let mut ctx = CompilerContext::new(TargetSizes::wasm32());
        let source = ctx.source_map.add_inline(src);
        let tokens = tokenize(src, source, &ctx.interner).unwrap();
        let mut program = Program::default();
        parse_into(&mut ctx, tokens, &mut program);
        let missing = ctx.intern("missing");
        traverse(&mut ctx, &program, EmitRoots::Exports(&[missing]));
        assert!(ctx.has_errors());
        assert!(ctx.render_diagnostics().contains("not found"));
    }

    #[test]
    fn test_recursion_handled() {
        let src = "int fib(int n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }";
        let (ctx, index) = analyze(src, &["fib"]);
        let fib = index.funcs.get(ctx.intern("fib")).unwrap();
        assert!(fib.referenced && fib.defined);
        assert_eq!(fib.index, 0);
    }
}
