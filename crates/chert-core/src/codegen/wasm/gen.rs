//! Per-function lowering from the AST into wasm bytecode.
//!
//! Expressions post-order-emit their operands, then a single opcode.
//! Control flow uses the structured `block`/`loop`/`if` instructions
//! with a hand-maintained depth counter, so `return`, `break` and
//! `continue` compute their `br` depth from the absolute depth at which
//! their target block was entered. A return-value local is allocated
//! per non-void function; `return` stores to it and branches to the
//! function's outermost block.

use crate::context::CompilerContext;
use crate::source::Span;
use crate::syntax::ast::{BinOp, Expr, ExprKind, Function, Stmt, StmtKind, UnOp};
use crate::traverse::ProgramIndex;
use crate::types::{FlonumKind, Ty, TyKind};

use super::super::CodegenError;
use super::leb128::DataBuf;
use super::{op, to_wtype, wt};

pub fn gen_function(
    ctx: &mut CompilerContext,
    index: &ProgramIndex,
    func: &Function,
) -> Result<DataBuf, CodegenError> {
    let TyKind::Func { ret, vararg, .. } = ctx.types.kind(func.ty).clone() else {
        unreachable!("lowering a non-function");
    };
    if vararg {
        return Err(CodegenError::unsupported(
            "varargs are not supported on the wasm32 backend",
            Some(func.span),
        ));
    }

    // Dense local indices: parameters first, then locals, the return
    // value local, and hidden switch scrutinee temporaries.
    let param_count = func.params.len() as u32;
    for (i, &pidx) in func.params.iter().enumerate() {
        let ty = ctx.var(func.param_scope, pidx).ty;
        to_wtype(&ctx.types, ty)
            .map_err(|_| unsupported_local(ctx, func, ty))?;
        ctx.var_mut(func.param_scope, pidx).local.wasm_index = Some(i as u32);
    }

    let mut local_decls = DataBuf::new();
    let mut local_count = 0u32;
    for &scope in &func.scopes {
        for idx in 0..ctx.scopes[scope].vars.len() {
            let var = ctx.var(scope, idx);
            if !var.is_local_storage() || var.param_index.is_some() {
                continue;
            }
            let ty = var.ty;
            let wtype =
                to_wtype(&ctx.types, ty).map_err(|_| unsupported_local(ctx, func, ty))?;
            ctx.var_mut(scope, idx).local.wasm_index = Some(param_count + local_count);
            local_count += 1;
            local_decls.uleb128(1);
            local_decls.push(wtype);
        }
    }

    let ret_local = if ret == Ty::VOID {
        None
    } else {
        let wtype = to_wtype(&ctx.types, ret)?;
        let idx = param_count + local_count;
        local_count += 1;
        local_decls.uleb128(1);
        local_decls.push(wtype);
        Some(idx)
    };

    let mut switch_tys = Vec::new();
    for stmt in &func.body {
        collect_switch_types(stmt, &mut switch_tys);
    }
    let mut switch_tmp_locals = Vec::new();
    for &ty in &switch_tys {
        let wtype = to_wtype(&ctx.types, ty)?;
        switch_tmp_locals.push(param_count + local_count);
        local_count += 1;
        local_decls.uleb128(1);
        local_decls.push(wtype);
    }

    let mut g = FuncGen {
        ctx,
        index,
        code: DataBuf::new(),
        cur_depth: 0,
        break_stack: Vec::new(),
        cont_stack: Vec::new(),
        ret_local,
        switch_tmp_locals,
        next_switch_tmp: 0,
    };

    // The whole body sits in one outer block so `return` can branch to
    // its end.
    g.code.push(op::BLOCK);
    g.code.push(wt::VOID);
    g.cur_depth += 1;
    for stmt in &func.body {
        g.gen_stmt(stmt)?;
    }
    g.code.push(op::END);
    g.cur_depth -= 1;
    debug_assert_eq!(g.cur_depth, 0, "unbalanced block depth");
    if let Some(idx) = g.ret_local {
        g.code.push(op::LOCAL_GET);
        g.code.uleb128(idx as u64);
    }
    g.code.push(op::END);
    let code = g.code;

    // Function body: size, local group count, groups, then bytecode.
    let mut body = DataBuf::new();
    body.uleb128(local_count as u64);
    body.concat(&local_decls);
    body.concat(&code);
    body.uleb128_at(0, body.len() as u64);
    Ok(body)
}

fn unsupported_local(ctx: &CompilerContext, func: &Function, ty: Ty) -> CodegenError {
    CodegenError::unsupported(
        format!(
            "`{}` cannot be used on the wasm32 backend (pointers, arrays and structs need linear memory)",
            ctx.type_name(ty)
        ),
        Some(func.span),
    )
}

fn collect_switch_types(stmt: &Stmt, out: &mut Vec<Ty>) {
    match &stmt.kind {
        StmtKind::Switch { value, body, .. } => {
            out.push(value.ty);
            collect_switch_types(body, out);
        }
        StmtKind::Block { stmts, .. } | StmtKind::VarDecl { inits: stmts } => {
            for s in stmts {
                collect_switch_types(s, out);
            }
        }
        StmtKind::If {
            then_stmt,
            else_stmt,
            ..
        } => {
            collect_switch_types(then_stmt, out);
            if let Some(e) = else_stmt {
                collect_switch_types(e, out);
            }
        }
        StmtKind::While { body, .. }
        | StmtKind::DoWhile { body, .. }
        | StmtKind::For { body, .. } => collect_switch_types(body, out),
        _ => {}
    }
}

enum Marker {
    Case(i64),
    Default,
}

struct FuncGen<'a> {
    ctx: &'a CompilerContext,
    index: &'a ProgramIndex,
    code: DataBuf,
    cur_depth: u32,
    /// Absolute depths of the innermost break/continue targets.
    break_stack: Vec<u32>,
    cont_stack: Vec<u32>,
    ret_local: Option<u32>,
    switch_tmp_locals: Vec<u32>,
    next_switch_tmp: usize,
}

impl FuncGen<'_> {
    fn is_i64(&self, ty: Ty) -> bool {
        self.ctx.types.is_fixnum(ty) && self.ctx.types.size_of(ty) > 4
    }

    fn unsupported(&self, what: &str, span: Span) -> CodegenError {
        CodegenError::unsupported(
            format!("{} is not supported on the wasm32 backend", what),
            Some(span),
        )
    }

    fn br(&mut self, target_depth: u32) {
        self.code.push(op::BR);
        self.code.uleb128((self.cur_depth - target_depth) as u64);
    }

    fn br_if(&mut self, target_depth: u32) {
        self.code.push(op::BR_IF);
        self.code.uleb128((self.cur_depth - target_depth) as u64);
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn gen_stmt(&mut self, stmt: &Stmt) -> Result<(), CodegenError> {
        match &stmt.kind {
            StmtKind::Expr(expr) => self.gen_expr_stmt(expr),
            StmtKind::Block { stmts, .. } | StmtKind::VarDecl { inits: stmts } => {
                for s in stmts {
                    self.gen_stmt(s)?;
                }
                Ok(())
            }
            StmtKind::Return(value) => {
                if let Some(expr) = value {
                    self.gen_expr(expr)?;
                    let idx = self.ret_local.expect("return value in a void function");
                    self.code.push(op::LOCAL_SET);
                    self.code.uleb128(idx as u64);
                }
                self.br(1);
                Ok(())
            }
            StmtKind::If {
                cond,
                then_stmt,
                else_stmt,
            } => {
                self.gen_cond(cond, true)?;
                self.code.push(op::IF);
                self.code.push(wt::VOID);
                self.cur_depth += 1;
                self.gen_stmt(then_stmt)?;
                if let Some(els) = else_stmt {
                    self.code.push(op::ELSE);
                    self.gen_stmt(els)?;
                }
                self.code.push(op::END);
                self.cur_depth -= 1;
                Ok(())
            }
            StmtKind::While { cond, body } => {
                self.code.push(op::BLOCK);
                self.code.push(wt::VOID);
                self.cur_depth += 1;
                let exit = self.cur_depth;
                self.code.push(op::LOOP);
                self.code.push(wt::VOID);
                self.cur_depth += 1;
                let head = self.cur_depth;

                self.gen_cond(cond, false)?;
                self.br_if(exit);

                self.break_stack.push(exit);
                self.cont_stack.push(head);
                self.gen_stmt(body)?;
                self.cont_stack.pop();
                self.break_stack.pop();

                self.br(head);
                self.code.push(op::END);
                self.code.push(op::END);
                self.cur_depth -= 2;
                Ok(())
            }
            StmtKind::DoWhile { body, cond } => {
                self.code.push(op::BLOCK);
                self.code.push(wt::VOID);
                self.cur_depth += 1;
                let exit = self.cur_depth;
                self.code.push(op::LOOP);
                self.code.push(wt::VOID);
                self.cur_depth += 1;
                let head = self.cur_depth;
                self.code.push(op::BLOCK);
                self.code.push(wt::VOID);
                self.cur_depth += 1;
                let cont = self.cur_depth;

                self.break_stack.push(exit);
                self.cont_stack.push(cont);
                self.gen_stmt(body)?;
                self.cont_stack.pop();
                self.break_stack.pop();

                self.code.push(op::END);
                self.cur_depth -= 1;
                self.gen_cond(cond, true)?;
                self.br_if(head);
                self.code.push(op::END);
                self.code.push(op::END);
                self.cur_depth -= 2;
                Ok(())
            }
            StmtKind::For {
                pre,
                cond,
                post,
                body,
                ..
            } => {
                if let Some(pre) = pre {
                    self.gen_stmt(pre)?;
                }
                self.code.push(op::BLOCK);
                self.code.push(wt::VOID);
                self.cur_depth += 1;
                let exit = self.cur_depth;
                self.code.push(op::LOOP);
                self.code.push(wt::VOID);
                self.cur_depth += 1;
                let head = self.cur_depth;

                if let Some(cond) = cond {
                    self.gen_cond(cond, false)?;
                    self.br_if(exit);
                }

                // The continue target is the block end just before the
                // post statement.
                self.code.push(op::BLOCK);
                self.code.push(wt::VOID);
                self.cur_depth += 1;
                let cont = self.cur_depth;

                self.break_stack.push(exit);
                self.cont_stack.push(cont);
                self.gen_stmt(body)?;
                self.cont_stack.pop();
                self.break_stack.pop();

                self.code.push(op::END);
                self.cur_depth -= 1;
                if let Some(post) = post {
                    self.gen_expr_stmt(post)?;
                }
                self.br(head);
                self.code.push(op::END);
                self.code.push(op::END);
                self.cur_depth -= 2;
                Ok(())
            }
            StmtKind::Switch { value, body, .. } => self.gen_switch(value, body),
            StmtKind::Break => {
                let Some(&target) = self.break_stack.last() else {
                    return Err(self.unsupported("break at this position", stmt.span));
                };
                self.br(target);
                Ok(())
            }
            StmtKind::Continue => {
                let Some(&target) = self.cont_stack.last() else {
                    return Err(self.unsupported("continue at this position", stmt.span));
                };
                self.br(target);
                Ok(())
            }
            StmtKind::Case { .. } | StmtKind::Default => Err(self.unsupported(
                "a case label nested inside an inner statement",
                stmt.span,
            )),
            StmtKind::Goto(_) | StmtKind::Label(_) => {
                Err(self.unsupported("goto", stmt.span))
            }
            StmtKind::Asm(_) => Err(self.unsupported("inline assembly", stmt.span)),
            StmtKind::Empty => Ok(()),
        }
    }

    fn gen_expr_stmt(&mut self, expr: &Expr) -> Result<(), CodegenError> {
        self.gen_expr(expr)?;
        if expr.ty != Ty::VOID {
            self.code.push(op::DROP);
        }
        Ok(())
    }

    /// Switch lowering over nested blocks: dispatch sits in the
    /// innermost block, each case label closes one block, `break`
    /// targets the outermost.
    fn gen_switch(&mut self, value: &Expr, body: &Stmt) -> Result<(), CodegenError> {
        let tmp = self.switch_tmp_locals[self.next_switch_tmp];
        self.next_switch_tmp += 1;

        self.gen_expr(value)?;
        self.code.push(op::LOCAL_SET);
        self.code.uleb128(tmp as u64);

        let stmts: &[Stmt] = match &body.kind {
            StmtKind::Block { stmts, .. } => stmts,
            _ => std::slice::from_ref(body),
        };
        let markers: Vec<Marker> = stmts
            .iter()
            .filter_map(|s| match &s.kind {
                StmtKind::Case { value } => Some(Marker::Case(*value)),
                StmtKind::Default => Some(Marker::Default),
                _ => None,
            })
            .collect();
        let k = markers.len() as u32;

        self.code.push(op::BLOCK);
        self.code.push(wt::VOID);
        self.cur_depth += 1;
        let exit = self.cur_depth;
        for _ in 0..k {
            self.code.push(op::BLOCK);
            self.code.push(wt::VOID);
            self.cur_depth += 1;
        }

        // Dispatch: compare the scrutinee against each case value.
        let wide = self.is_i64(value.ty);
        let marker_depth = |j: u32| exit + (k - j);
        let mut default_depth = None;
        for (j, marker) in markers.iter().enumerate() {
            match marker {
                Marker::Case(cv) => {
                    self.code.push(op::LOCAL_GET);
                    self.code.uleb128(tmp as u64);
                    if wide {
                        self.code.push(op::I64_CONST);
                        self.code.sleb128(*cv);
                        self.code.push(0x51); // i64.eq
                    } else {
                        self.code.push(op::I32_CONST);
                        self.code.sleb128(*cv);
                        self.code.push(0x46); // i32.eq
                    }
                    self.br_if(marker_depth(j as u32));
                }
                Marker::Default => default_depth = Some(marker_depth(j as u32)),
            }
        }
        self.br(default_depth.unwrap_or(exit));

        // Walk the body; each marker ends the innermost open block, so
        // case code falls through in source order.
        self.break_stack.push(exit);
        for s in stmts {
            match &s.kind {
                StmtKind::Case { .. } | StmtKind::Default => {
                    self.code.push(op::END);
                    self.cur_depth -= 1;
                }
                _ => self.gen_stmt(s)?,
            }
        }
        self.break_stack.pop();

        self.code.push(op::END);
        self.cur_depth -= 1;
        debug_assert_eq!(self.cur_depth + 1, exit);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn gen_expr(&mut self, expr: &Expr) -> Result<(), CodegenError> {
        match &expr.kind {
            ExprKind::IntLit(v) => {
                if self.is_i64(expr.ty) {
                    self.code.push(op::I64_CONST);
                    self.code.sleb128(*v);
                } else {
                    self.code.push(op::I32_CONST);
                    self.code.sleb128(*v as i32 as i64);
                }
                Ok(())
            }
            ExprKind::FloatLit(v) => {
                match self.ctx.types.kind(expr.ty) {
                    TyKind::Flonum(FlonumKind::Float) => {
                        self.code.push(op::F32_CONST);
                        self.code.append(&(*v as f32).to_le_bytes());
                    }
                    _ => {
                        self.code.push(op::F64_CONST);
                        self.code.append(&v.to_le_bytes());
                    }
                }
                Ok(())
            }
            ExprKind::Var { name, scope } => {
                let idx = self.ctx.scopes[*scope]
                    .find_var(*name)
                    .expect("resolved variable vanished");
                let var = self.ctx.var(*scope, idx);
                if var.is_local_storage() {
                    let local = var
                        .local
                        .wasm_index
                        .expect("local without a wasm index");
                    self.code.push(op::LOCAL_GET);
                    self.code.uleb128(local as u64);
                } else {
                    let global = var
                        .local
                        .wasm_index
                        .ok_or_else(|| self.unsupported("this variable", expr.span))?;
                    self.code.push(op::GLOBAL_GET);
                    self.code.uleb128(global as u64);
                }
                Ok(())
            }
            ExprKind::Unary { op: un, sub } => self.gen_unary(*un, sub, expr),
            ExprKind::Binary { op: bin, lhs, rhs } => {
                if bin.is_compare() {
                    self.gen_compare(*bin, lhs, rhs)
                } else {
                    self.gen_expr(lhs)?;
                    self.gen_expr(rhs)?;
                    self.gen_arith(*bin, expr.ty, expr.span)
                }
            }
            ExprKind::Logical { .. } => self.gen_cond(expr, true),
            ExprKind::Assign { lhs, rhs } => self.gen_assign(lhs, rhs, expr.span),
            ExprKind::CompoundAssign { op: bin, lhs, rhs } => {
                self.gen_compound_assign(*bin, lhs, rhs, expr)
            }
            ExprKind::IncDec { pre, inc, sub } => self.gen_incdec(*pre, *inc, sub, expr),
            ExprKind::Call { callee, args } => self.gen_call(callee, args, expr.span),
            ExprKind::Cast(sub) => {
                self.gen_expr(sub)?;
                self.gen_cast(expr.ty, sub.ty, expr.span)
            }
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                self.gen_cond(cond, true)?;
                self.code.push(op::IF);
                if expr.ty == Ty::VOID {
                    self.code.push(wt::VOID);
                } else {
                    let wtype = to_wtype(&self.ctx.types, expr.ty)
                        .map_err(|_| self.unsupported("this value type", expr.span))?;
                    self.code.push(wtype);
                }
                self.cur_depth += 1;
                self.gen_expr(then_expr)?;
                self.code.push(op::ELSE);
                self.gen_expr(else_expr)?;
                self.code.push(op::END);
                self.cur_depth -= 1;
                Ok(())
            }
            ExprKind::Comma { lhs, rhs } => {
                self.gen_expr_stmt(lhs)?;
                self.gen_expr(rhs)
            }
            ExprKind::BlockExpr(block) => {
                let StmtKind::Block { stmts, .. } = &block.kind else {
                    unreachable!();
                };
                for (i, s) in stmts.iter().enumerate() {
                    if i + 1 == stmts.len() {
                        if let StmtKind::Expr(e) = &s.kind {
                            self.gen_expr(e)?;
                            return Ok(());
                        }
                    }
                    self.gen_stmt(s)?;
                }
                Ok(())
            }
            ExprKind::StrLit(_) => Err(self.unsupported("string data", expr.span)),
            ExprKind::Deref(_) | ExprKind::Addr(_) => {
                Err(self.unsupported("pointer access", expr.span))
            }
            ExprKind::Member { .. } | ExprKind::CompoundLit { .. } => {
                Err(self.unsupported("struct access", expr.span))
            }
        }
    }

    fn gen_unary(&mut self, un: UnOp, sub: &Expr, expr: &Expr) -> Result<(), CodegenError> {
        match un {
            UnOp::Neg => {
                // 0 - x, for both integers and floats.
                match self.ctx.types.kind(expr.ty) {
                    TyKind::Flonum(FlonumKind::Float) => {
                        self.code.push(op::F32_CONST);
                        self.code.append(&0f32.to_le_bytes());
                    }
                    TyKind::Flonum(FlonumKind::Double) => {
                        self.code.push(op::F64_CONST);
                        self.code.append(&0f64.to_le_bytes());
                    }
                    _ => {
                        if self.is_i64(expr.ty) {
                            self.code.push(op::I64_CONST);
                        } else {
                            self.code.push(op::I32_CONST);
                        }
                        self.code.sleb128(0);
                    }
                }
                self.gen_expr(sub)?;
                self.gen_arith(BinOp::Sub, expr.ty, expr.span)
            }
            UnOp::BitNot => {
                self.gen_expr(sub)?;
                if self.is_i64(expr.ty) {
                    self.code.push(op::I64_CONST);
                } else {
                    self.code.push(op::I32_CONST);
                }
                self.code.sleb128(-1);
                self.gen_arith(BinOp::BitXor, expr.ty, expr.span)
            }
            UnOp::Not => self.gen_cond(expr, true),
        }
    }

    fn gen_assign(&mut self, lhs: &Expr, rhs: &Expr, span: Span) -> Result<(), CodegenError> {
        let ExprKind::Var { name, scope } = lhs.kind else {
            return Err(self.unsupported("assignment through memory", span));
        };
        let idx = self.ctx.scopes[scope].find_var(name).unwrap();
        let var = self.ctx.var(scope, idx);
        if var.is_local_storage() {
            let local = var.local.wasm_index.unwrap();
            self.gen_expr(rhs)?;
            self.code.push(op::LOCAL_TEE);
            self.code.uleb128(local as u64);
        } else {
            let global = var
                .local
                .wasm_index
                .ok_or_else(|| self.unsupported("this variable", span))?;
            self.gen_expr(rhs)?;
            self.code.push(op::GLOBAL_SET);
            self.code.uleb128(global as u64);
            self.code.push(op::GLOBAL_GET);
            self.code.uleb128(global as u64);
        }
        Ok(())
    }

    fn gen_compound_assign(
        &mut self,
        bin: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        expr: &Expr,
    ) -> Result<(), CodegenError> {
        let ExprKind::Var { name, scope } = lhs.kind else {
            return Err(self.unsupported("compound assignment through memory", expr.span));
        };
        let idx = self.ctx.scopes[scope].find_var(name).unwrap();
        let var = self.ctx.var(scope, idx);
        if var.is_local_storage() {
            let local = var.local.wasm_index.unwrap();
            self.code.push(op::LOCAL_GET);
            self.code.uleb128(local as u64);
            self.gen_expr(rhs)?;
            self.gen_arith(bin, expr.ty, expr.span)?;
            self.code.push(op::LOCAL_TEE);
            self.code.uleb128(local as u64);
        } else {
            let global = var
                .local
                .wasm_index
                .ok_or_else(|| self.unsupported("this variable", expr.span))?;
            self.code.push(op::GLOBAL_GET);
            self.code.uleb128(global as u64);
            self.gen_expr(rhs)?;
            self.gen_arith(bin, expr.ty, expr.span)?;
            self.code.push(op::GLOBAL_SET);
            self.code.uleb128(global as u64);
            self.code.push(op::GLOBAL_GET);
            self.code.uleb128(global as u64);
        }
        Ok(())
    }

    fn gen_incdec(
        &mut self,
        pre: bool,
        inc: bool,
        sub: &Expr,
        expr: &Expr,
    ) -> Result<(), CodegenError> {
        let ExprKind::Var { name, scope } = sub.kind else {
            return Err(self.unsupported("increment through memory", expr.span));
        };
        let idx = self.ctx.scopes[scope].find_var(name).unwrap();
        let var = self.ctx.var(scope, idx);
        let arith = if inc { BinOp::Add } else { BinOp::Sub };

        let one = |g: &mut Self| {
            if g.is_i64(expr.ty) {
                g.code.push(op::I64_CONST);
            } else {
                g.code.push(op::I32_CONST);
            }
            g.code.sleb128(1);
        };

        if var.is_local_storage() {
            let local = var.local.wasm_index.unwrap();
            if pre {
                self.code.push(op::LOCAL_GET);
                self.code.uleb128(local as u64);
                one(self);
                self.gen_arith(arith, expr.ty, expr.span)?;
                self.code.push(op::LOCAL_TEE);
                self.code.uleb128(local as u64);
            } else {
                // Push the old value first, then store the update.
                self.code.push(op::LOCAL_GET);
                self.code.uleb128(local as u64);
                self.code.push(op::LOCAL_GET);
                self.code.uleb128(local as u64);
                one(self);
                self.gen_arith(arith, expr.ty, expr.span)?;
                self.code.push(op::LOCAL_SET);
                self.code.uleb128(local as u64);
            }
        } else {
            let global = var
                .local
                .wasm_index
                .ok_or_else(|| self.unsupported("this variable", expr.span))?;
            if pre {
                self.code.push(op::GLOBAL_GET);
                self.code.uleb128(global as u64);
                one(self);
                self.gen_arith(arith, expr.ty, expr.span)?;
                self.code.push(op::GLOBAL_SET);
                self.code.uleb128(global as u64);
                self.code.push(op::GLOBAL_GET);
                self.code.uleb128(global as u64);
            } else {
                self.code.push(op::GLOBAL_GET);
                self.code.uleb128(global as u64);
                self.code.push(op::GLOBAL_GET);
                self.code.uleb128(global as u64);
                one(self);
                self.gen_arith(arith, expr.ty, expr.span)?;
                self.code.push(op::GLOBAL_SET);
                self.code.uleb128(global as u64);
            }
        }
        Ok(())
    }

    fn gen_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        span: Span,
    ) -> Result<(), CodegenError> {
        let ExprKind::Var { name, .. } = callee.kind else {
            return Err(self.unsupported("an indirect call", span));
        };
        if !self.ctx.types.is_func(callee.ty) {
            return Err(self.unsupported("an indirect call", span));
        }
        if let TyKind::Func { vararg: true, .. } = self.ctx.types.kind(callee.ty) {
            return Err(self.unsupported("a varargs call", span));
        }
        for arg in args {
            self.gen_expr(arg)?;
        }
        let info = self
            .index
            .funcs
            .get(name)
            .expect("call target missing from the function table");
        self.code.push(op::CALL);
        self.code.uleb128(info.index as u64);
        Ok(())
    }

    /// Arithmetic opcode selection by operand class and signedness.
    fn gen_arith(&mut self, bin: BinOp, ty: Ty, span: Span) -> Result<(), CodegenError> {
        let unsigned = self.ctx.types.is_unsigned(ty);
        let opcode = match self.ctx.types.kind(ty) {
            TyKind::Flonum(kind) => {
                let base: u8 = match kind {
                    FlonumKind::Float => 0x92,
                    FlonumKind::Double => 0xa0,
                };
                match bin {
                    BinOp::Add => base,
                    BinOp::Sub => base + 1,
                    BinOp::Mul => base + 2,
                    BinOp::Div => base + 3,
                    _ => {
                        return Err(
                            self.unsupported("this operator on floating point", span)
                        )
                    }
                }
            }
            TyKind::Fixnum { .. } => {
                let wide = self.is_i64(ty);
                let (base, div_s): (u8, u8) = if wide { (0x7c, 0x7f) } else { (0x6a, 0x6d) };
                match bin {
                    BinOp::Add => base,
                    BinOp::Sub => base + 1,
                    BinOp::Mul => base + 2,
                    BinOp::Div => div_s + u8::from(unsigned),
                    BinOp::Mod => div_s + 2 + u8::from(unsigned),
                    BinOp::BitAnd => div_s + 4,
                    BinOp::BitOr => div_s + 5,
                    BinOp::BitXor => div_s + 6,
                    BinOp::Shl => div_s + 7,
                    BinOp::Shr => div_s + 8 + u8::from(unsigned),
                    _ => unreachable!("comparison routed elsewhere"),
                }
            }
            _ => return Err(self.unsupported("arithmetic on this type", span)),
        };
        self.code.push(opcode);
        Ok(())
    }

    fn gen_compare(&mut self, bin: BinOp, lhs: &Expr, rhs: &Expr) -> Result<(), CodegenError> {
        self.gen_expr(lhs)?;
        self.gen_expr(rhs)?;
        self.compare_op(bin, lhs.ty);
        Ok(())
    }

    fn compare_op(&mut self, bin: BinOp, operand_ty: Ty) {
        let unsigned = self.ctx.types.is_unsigned(operand_ty);
        let opcode = match self.ctx.types.kind(operand_ty) {
            TyKind::Flonum(kind) => {
                let base: u8 = match kind {
                    FlonumKind::Float => 0x5b,
                    FlonumKind::Double => 0x61,
                };
                match bin {
                    BinOp::Eq => base,
                    BinOp::Ne => base + 1,
                    BinOp::Lt => base + 2,
                    BinOp::Gt => base + 3,
                    BinOp::Le => base + 4,
                    BinOp::Ge => base + 5,
                    _ => unreachable!(),
                }
            }
            _ => {
                let base: u8 = if self.is_i64(operand_ty) { 0x51 } else { 0x46 };
                match bin {
                    BinOp::Eq => base,
                    BinOp::Ne => base + 1,
                    BinOp::Lt => base + 2 + u8::from(unsigned),
                    BinOp::Gt => base + 4 + u8::from(unsigned),
                    BinOp::Le => base + 6 + u8::from(unsigned),
                    BinOp::Ge => base + 8 + u8::from(unsigned),
                    _ => unreachable!(),
                }
            }
        };
        self.code.push(opcode);
    }

    /// Compile a condition, leaving i32 `tf`-sense truth on the stack.
    fn gen_cond(&mut self, cond: &Expr, tf: bool) -> Result<(), CodegenError> {
        match &cond.kind {
            ExprKind::IntLit(v) => {
                self.code.push(op::I32_CONST);
                self.code.sleb128(i64::from((*v != 0) == tf));
                Ok(())
            }
            ExprKind::Binary { op: bin, lhs, rhs } if bin.is_compare() => {
                let bin = if tf { *bin } else { negate_compare(*bin) };
                self.gen_expr(lhs)?;
                self.gen_expr(rhs)?;
                self.compare_op(bin, lhs.ty);
                Ok(())
            }
            ExprKind::Unary {
                op: UnOp::Not,
                sub,
            } => self.gen_cond(sub, !tf),
            ExprKind::Logical { and, lhs, rhs } => {
                // Short-circuit via a value-producing `if`.
                let both = if tf { *and } else { !*and };
                if both {
                    self.gen_cond(lhs, tf)?;
                    self.code.push(op::IF);
                    self.code.push(wt::I32);
                    self.cur_depth += 1;
                    self.gen_cond(rhs, tf)?;
                    self.code.push(op::ELSE);
                    self.code.push(op::I32_CONST);
                    self.code.sleb128(0);
                    self.code.push(op::END);
                    self.cur_depth -= 1;
                } else {
                    self.gen_cond(lhs, tf)?;
                    self.code.push(op::IF);
                    self.code.push(wt::I32);
                    self.cur_depth += 1;
                    self.code.push(op::I32_CONST);
                    self.code.sleb128(1);
                    self.code.push(op::ELSE);
                    self.gen_cond(rhs, tf)?;
                    self.code.push(op::END);
                    self.cur_depth -= 1;
                }
                Ok(())
            }
            ExprKind::Comma { lhs, rhs } => {
                self.gen_expr_stmt(lhs)?;
                self.gen_cond(rhs, tf)
            }
            _ => {
                // Normalize an arbitrary scalar to 0/1.
                self.gen_expr(cond)?;
                match self.ctx.types.kind(cond.ty) {
                    TyKind::Flonum(kind) => {
                        match kind {
                            FlonumKind::Float => {
                                self.code.push(op::F32_CONST);
                                self.code.append(&0f32.to_le_bytes());
                            }
                            FlonumKind::Double => {
                                self.code.push(op::F64_CONST);
                                self.code.append(&0f64.to_le_bytes());
                            }
                        }
                        self.compare_op(if tf { BinOp::Ne } else { BinOp::Eq }, cond.ty);
                    }
                    _ => {
                        if self.is_i64(cond.ty) {
                            self.code.push(op::I64_EQZ);
                        } else {
                            self.code.push(op::I32_EQZ);
                        }
                        if tf {
                            self.code.push(op::I32_EQZ);
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Casts per the wasm conversion matrix; drops when the target is
    /// void.
    fn gen_cast(&mut self, dst: Ty, src: Ty, span: Span) -> Result<(), CodegenError> {
        if dst == Ty::VOID {
            if src != Ty::VOID {
                self.code.push(op::DROP);
            }
            return Ok(());
        }

        let types = &self.ctx.types;
        let src_unsigned = types.is_unsigned(src);
        let dst_unsigned = types.is_unsigned(dst);
        match (types.kind(src).clone(), types.kind(dst).clone()) {
            (TyKind::Fixnum { .. }, TyKind::Fixnum { .. }) => {
                let (sw, dw) = (self.is_i64(src), self.is_i64(dst));
                match (sw, dw) {
                    (true, false) => self.code.push(0xa7), // i32.wrap_i64
                    (false, true) => {
                        // extend by the source's signedness
                        self.code.push(if src_unsigned { 0xad } else { 0xac });
                    }
                    _ => {}
                }
                // Narrow targets keep wrap semantics explicitly; there
                // are no sub-register views on the value stack.
                let dsize = types.size_of(dst);
                if !dw && dsize < 4 && dsize < types.size_of(src).max(4) {
                    let bits = 32 - (dsize as i64 * 8);
                    if dst_unsigned {
                        self.code.push(op::I32_CONST);
                        self.code.sleb128((1 << (dsize * 8)) - 1);
                        self.code.push(0x71); // i32.and
                    } else {
                        self.code.push(op::I32_CONST);
                        self.code.sleb128(bits);
                        self.code.push(0x74); // i32.shl
                        self.code.push(op::I32_CONST);
                        self.code.sleb128(bits);
                        self.code.push(0x75); // i32.shr_s
                    }
                }
                Ok(())
            }
            (TyKind::Flonum(fk), TyKind::Fixnum { .. }) => {
                let wide = self.is_i64(dst);
                let opcode = match (wide, fk) {
                    (false, FlonumKind::Float) => 0xa8 + u8::from(dst_unsigned),
                    (false, FlonumKind::Double) => 0xaa + u8::from(dst_unsigned),
                    (true, FlonumKind::Float) => 0xae + u8::from(dst_unsigned),
                    (true, FlonumKind::Double) => 0xb0 + u8::from(dst_unsigned),
                };
                self.code.push(opcode);
                Ok(())
            }
            (TyKind::Fixnum { .. }, TyKind::Flonum(fk)) => {
                let wide = self.is_i64(src);
                let opcode = match (fk, wide) {
                    (FlonumKind::Float, false) => 0xb2 + u8::from(src_unsigned),
                    (FlonumKind::Float, true) => 0xb4 + u8::from(src_unsigned),
                    (FlonumKind::Double, false) => 0xb7 + u8::from(src_unsigned),
                    (FlonumKind::Double, true) => 0xb9 + u8::from(src_unsigned),
                };
                self.code.push(opcode);
                Ok(())
            }
            (TyKind::Flonum(sk), TyKind::Flonum(dk)) => {
                if sk != dk {
                    self.code.push(match dk {
                        FlonumKind::Float => 0xb6,  // f32.demote_f64
                        FlonumKind::Double => 0xbb, // f64.promote_f32
                    });
                }
                Ok(())
            }
            _ => Err(self.unsupported("this conversion", span)),
        }
    }
}

fn negate_compare(bin: BinOp) -> BinOp {
    match bin {
        BinOp::Eq => BinOp::Ne,
        BinOp::Ne => BinOp::Eq,
        BinOp::Lt => BinOp::Ge,
        BinOp::Le => BinOp::Gt,
        BinOp::Gt => BinOp::Le,
        BinOp::Ge => BinOp::Lt,
        _ => unreachable!("not a comparison"),
    }
}
