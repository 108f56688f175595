//! Lowering from the typed AST into basic blocks of IR.
//!
//! One function at a time, top-down over statements. A cursor tracks the
//! current block; new blocks are created at branch targets, after
//! unconditional branches and at labels. Expressions lower recursively,
//! each producing a result vreg (except void).

use std::collections::{HashMap, HashSet};

use crate::context::CompilerContext;
use crate::ids::{BBId, ScopeId, VRegId};
use crate::interner::Name;
use crate::scope::Storage;
use crate::source::Span;
use crate::syntax::ast::{BinOp, Expr, ExprKind, Function, Stmt, StmtKind, UnOp};
use crate::traverse::{visit_expr, visit_stmt_exprs};
use crate::types::{Bitfield, Ty, TyKind};

use super::{
    float_label, CondCode, CondKind, FuncIr, Ir, IrBinOp, IrKind, IrUnOp, VRegFlags, VRegType,
};

/// A construct the native backend cannot lower.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct BuildError {
    pub message: String,
    pub span: Span,
}

impl BuildError {
    fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

type BResult<T> = Result<T, BuildError>;

/// Number of integer argument registers in the System-V ABI.
pub const MAX_REG_ARGS: usize = 6;
/// Number of floating-point argument registers.
pub const MAX_FREG_ARGS: usize = 8;

/// Lower one function body to IR.
pub fn build(ctx: &mut CompilerContext, func: &Function) -> BResult<FuncIr> {
    let ret = match ctx.types.kind(func.ty) {
        TyKind::Func { ret, .. } => *ret,
        _ => unreachable!("lowering a non-function"),
    };
    let ret_flonum = ctx.types.is_flonum(ret);

    let mut builder = Builder {
        func: FuncIr::new(func.name, ret_flonum),
        ctx,
        cur: BBId(0),
        ret_bb: BBId(0),
        break_stack: Vec::new(),
        cont_stack: Vec::new(),
        labels: HashMap::new(),
        switch_stack: Vec::new(),
        sret_vreg: None,
    };
    builder.run(func)?;
    Ok(builder.func)
}

struct SwitchLower {
    case_bbs: Vec<BBId>,
    next_case: usize,
    default_bb: BBId,
}

struct Builder<'a> {
    ctx: &'a mut CompilerContext,
    func: FuncIr,
    cur: BBId,
    ret_bb: BBId,
    break_stack: Vec<BBId>,
    cont_stack: Vec<BBId>,
    labels: HashMap<Name, BBId>,
    switch_stack: Vec<SwitchLower>,
    /// Hidden pointer to the caller-allocated return object, when the
    /// function returns a struct.
    sret_vreg: Option<VRegId>,
}

impl Builder<'_> {
    fn run(&mut self, func: &Function) -> BResult<()> {
        let entry = self.func.bbcon.new_bb();
        self.ret_bb = self.func.bbcon.new_bb();
        self.func.bbcon.schedule(entry);
        self.cur = entry;

        self.allocate_locals(func)?;

        for stmt in &func.body {
            self.gen_stmt(stmt)?;
        }

        self.set_curbb(self.ret_bb);
        Ok(())
    }

    /// Assign vregs to scalar locals and frame slots to everything that
    /// must live in memory (aggregates and addressed variables).
    fn allocate_locals(&mut self, func: &Function) -> BResult<()> {
        let mut addressed: HashSet<(ScopeId, usize)> = HashSet::new();
        for stmt in &func.body {
            visit_stmt_exprs(stmt, &mut |expr| {
                match &expr.kind {
                    ExprKind::Addr(sub) => {
                        if let ExprKind::Var { name, scope } = sub.kind {
                            // Decay of arrays also lands here; arrays get
                            // frame slots through their type anyway.
                            if let Some(idx) = self.ctx.scopes[scope].find_var(name) {
                                addressed.insert((scope, idx));
                            }
                        }
                    }
                    ExprKind::CompoundLit { scope, index, .. } => {
                        addressed.insert((*scope, *index));
                    }
                    _ => {}
                }
            });
        }

        // Parameter slots count per register file, so a float parameter
        // does not consume an integer argument register.
        let mut int_slot = 0u32;
        let mut fp_slot = 0u32;

        // A struct return arrives as a hidden pointer in the first
        // integer argument register.
        let ret = match self.ctx.types.kind(func.ty) {
            TyKind::Func { ret, .. } => *ret,
            _ => unreachable!("lowering a non-function"),
        };
        if self.ctx.types.is_struct(ret) {
            let vreg = self.func.new_vreg(self.ptr_vtype(), VRegFlags::PARAM);
            self.func.vregs[vreg].param_index = Some(0);
            self.func.param_vregs.push(vreg);
            self.sret_vreg = Some(vreg);
            int_slot = 1;
        }

        for &scope in &func.scopes {
            for idx in 0..self.ctx.scopes[scope].vars.len() {
                let var = self.ctx.var(scope, idx);
                if !var.is_local_storage() {
                    continue;
                }
                let ty = var.ty;
                let param_index = match var.param_index {
                    Some(_) => {
                        let flonum = self.ctx.types.is_flonum(ty);
                        let slot = if flonum {
                            let s = fp_slot;
                            fp_slot += 1;
                            s
                        } else {
                            let s = int_slot;
                            int_slot += 1;
                            s
                        };
                        let limit = if flonum { MAX_FREG_ARGS } else { MAX_REG_ARGS };
                        if slot as usize >= limit {
                            return Err(BuildError::new(
                                "stack-passed parameters are not supported",
                                func.span,
                            ));
                        }
                        Some(slot)
                    }
                    None => None,
                };
                let needs_memory = self.ctx.types.is_array(ty)
                    || self.ctx.types.is_struct(ty)
                    || addressed.contains(&(scope, idx));

                if needs_memory {
                    if self.ctx.types.is_struct(ty) && param_index.is_some() {
                        return Err(BuildError::new(
                            "struct parameters are not supported",
                            func.span,
                        ));
                    }
                    let size = self.ctx.types.size_of(ty).max(1);
                    let align = self.ctx.types.align_of(ty).max(1);
                    let slot = self.func.add_frame_slot(size, align);
                    self.ctx.var_mut(scope, idx).local.frame = Some(slot);

                    // An addressed parameter still arrives in a
                    // register; store it to its frame home at entry.
                    if let Some(pi) = param_index {
                        let vtype = self.vtype(ty)?;
                        let vreg = self
                            .func
                            .new_vreg(vtype, VRegFlags::PARAM | VRegFlags::REF);
                        self.func.vregs[vreg].param_index = Some(pi);
                        self.func.param_vregs.push(vreg);
                        let addr = self.bofs(slot);
                        self.emit(Ir::with(IrKind::Store, None, Some(vreg), Some(addr)));
                    }
                } else {
                    let vtype = self.vtype(ty)?;
                    let flags = if param_index.is_some() {
                        VRegFlags::PARAM
                    } else {
                        VRegFlags::empty()
                    };
                    let vreg = self.func.new_vreg(vtype, flags);
                    self.func.vregs[vreg].param_index = param_index;
                    if param_index.is_some() {
                        self.func.param_vregs.push(vreg);
                    }
                    self.ctx.var_mut(scope, idx).local.vreg = Some(vreg);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Infrastructure
    // ------------------------------------------------------------------

    fn emit(&mut self, ir: Ir) {
        self.func.bbcon.push(self.cur, ir);
    }

    fn set_curbb(&mut self, bb: BBId) {
        self.func.bbcon.schedule(bb);
        self.cur = bb;
    }

    fn new_bb(&mut self) -> BBId {
        self.func.bbcon.new_bb()
    }

    fn vtype(&self, ty: Ty) -> BResult<VRegType> {
        let types = &self.ctx.types;
        if types.is_flonum(ty) {
            let size = types.size_of(ty);
            return Ok(VRegType {
                size,
                align: size,
                unsigned: false,
                flonum: true,
            });
        }
        // Pointers, integers, and addresses of aggregates all fit the
        // integer file.
        let size = if types.is_scalar(ty) {
            types.size_of(ty)
        } else {
            types.sizes().ptr_size
        };
        Ok(VRegType {
            size,
            align: size,
            unsigned: types.is_unsigned(ty),
            flonum: false,
        })
    }

    fn ptr_vtype(&self) -> VRegType {
        VRegType::int(self.ctx.types.sizes().ptr_size, true)
    }

    fn const_int(&mut self, value: i64, vtype: VRegType) -> VRegId {
        debug_assert!(!vtype.flonum, "constant vregs are integer-only");
        self.func.new_const_vreg(value, vtype)
    }

    /// A floating-point immediate, materialized through the literal
    /// pool since constant vregs are integer-only.
    fn float_imm(&mut self, value: f64, vtype: VRegType) -> VRegId {
        let single = vtype.size == 4;
        let bits = if single {
            (value as f32).to_bits() as u64
        } else {
            value.to_bits()
        };
        let idx = self.func.float_const(bits, single);
        let name = self.ctx.str(self.func.name);
        let label = self.ctx.intern(&float_label(&name, idx));
        let addr = self.iofs(label, false);
        self.load(addr, vtype)
    }

    fn zero_of(&mut self, vtype: VRegType) -> VRegId {
        if vtype.flonum {
            self.float_imm(0.0, vtype)
        } else {
            self.const_int(0, vtype)
        }
    }

    /// The increment step for `++`/`--`.
    fn step_of(&mut self, step: i64, vtype: VRegType) -> VRegId {
        if vtype.flonum {
            self.float_imm(step as f64, vtype)
        } else {
            self.const_int(step, vtype)
        }
    }

    fn bofs(&mut self, slot: crate::ids::FrameSlotId) -> VRegId {
        let dst = self.func.new_vreg(self.ptr_vtype(), VRegFlags::empty());
        self.emit(Ir::with(IrKind::Bofs { slot }, Some(dst), None, None));
        dst
    }

    fn iofs(&mut self, label: Name, global: bool) -> VRegId {
        let dst = self.func.new_vreg(self.ptr_vtype(), VRegFlags::empty());
        self.emit(Ir::with(IrKind::Iofs { label, global }, Some(dst), None, None));
        dst
    }

    fn mov(&mut self, dst: VRegId, src: VRegId) {
        self.emit(Ir::with(IrKind::Mov, Some(dst), Some(src), None));
    }

    fn load(&mut self, addr: VRegId, vtype: VRegType) -> VRegId {
        let dst = self.func.new_vreg(vtype, VRegFlags::empty());
        self.emit(Ir::with(IrKind::Load, Some(dst), Some(addr), None));
        dst
    }

    fn store(&mut self, value: VRegId, addr: VRegId) {
        self.emit(Ir::with(IrKind::Store, None, Some(value), Some(addr)));
    }

    fn binop(&mut self, op: IrBinOp, lhs: VRegId, rhs: VRegId, vtype: VRegType) -> VRegId {
        let dst = self.func.new_vreg(vtype, VRegFlags::empty());
        self.emit(Ir::with(IrKind::BinOp(op), Some(dst), Some(lhs), Some(rhs)));
        dst
    }

    fn jmp(&mut self, bb: BBId) {
        self.emit(Ir::new(IrKind::Jmp { bb }));
    }

    /// Continue in a fresh block after an unconditional transfer, so
    /// trailing (unreachable) statements still have a home.
    fn start_dead_block(&mut self) {
        let bb = self.new_bb();
        self.set_curbb(bb);
    }

    fn str_label(&mut self, index: u32) -> Name {
        self.ctx.intern(&format!(".L.str.{}", index))
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn gen_stmt(&mut self, stmt: &Stmt) -> BResult<()> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.gen_expr(expr)?;
                Ok(())
            }
            StmtKind::Block { stmts, .. } => {
                for s in stmts {
                    self.gen_stmt(s)?;
                }
                Ok(())
            }
            StmtKind::VarDecl { inits } => {
                for s in inits {
                    self.gen_stmt(s)?;
                }
                Ok(())
            }
            StmtKind::If {
                cond,
                then_stmt,
                else_stmt,
            } => self.gen_if(cond, then_stmt, else_stmt.as_deref()),
            StmtKind::While { cond, body } => self.gen_while(cond, body),
            StmtKind::DoWhile { body, cond } => self.gen_do_while(body, cond),
            StmtKind::For {
                pre,
                cond,
                post,
                body,
                ..
            } => self.gen_for(pre.as_deref(), cond.as_ref(), post.as_ref(), body),
            StmtKind::Switch {
                value,
                body,
                cases,
                has_default,
            } => self.gen_switch(value, body, cases, *has_default),
            StmtKind::Case { .. } => {
                let sw = self
                    .switch_stack
                    .last_mut()
                    .expect("case outside switch survived sema");
                let bb = sw.case_bbs[sw.next_case];
                sw.next_case += 1;
                self.set_curbb(bb);
                Ok(())
            }
            StmtKind::Default => {
                let bb = self
                    .switch_stack
                    .last()
                    .expect("default outside switch survived sema")
                    .default_bb;
                self.set_curbb(bb);
                Ok(())
            }
            StmtKind::Break => {
                let Some(&bb) = self.break_stack.last() else {
                    return Err(BuildError::new("break outside of a loop or switch", stmt.span));
                };
                self.jmp(bb);
                self.start_dead_block();
                Ok(())
            }
            StmtKind::Continue => {
                let Some(&bb) = self.cont_stack.last() else {
                    return Err(BuildError::new("continue outside of a loop", stmt.span));
                };
                self.jmp(bb);
                self.start_dead_block();
                Ok(())
            }
            StmtKind::Return(value) => {
                if let Some(expr) = value {
                    if self.ctx.types.is_struct(expr.ty) {
                        // Copy the object into the caller's hidden
                        // return slot; the pointer itself is the result.
                        let src = self.gen_expr_value(expr)?;
                        let dst = self
                            .sret_vreg
                            .expect("struct return without a hidden pointer");
                        let size = self.ctx.types.size_of(expr.ty);
                        self.copy_object(dst, src, size)?;
                        self.emit(Ir::with(IrKind::Result, None, Some(dst), None));
                    } else {
                        let v = self.gen_expr_value(expr)?;
                        self.emit(Ir::with(IrKind::Result, None, Some(v), None));
                    }
                }
                self.jmp(self.ret_bb);
                self.start_dead_block();
                Ok(())
            }
            StmtKind::Goto(name) => {
                let bb = self.label_bb(*name);
                self.jmp(bb);
                self.start_dead_block();
                Ok(())
            }
            StmtKind::Label(name) => {
                let bb = self.label_bb(*name);
                self.set_curbb(bb);
                Ok(())
            }
            StmtKind::Asm(text) => {
                self.emit(Ir::new(IrKind::Asm(text.clone())));
                Ok(())
            }
            StmtKind::Empty => Ok(()),
        }
    }

    /// A goto label's block, created on first mention so forward gotos
    /// resolve without patching.
    fn label_bb(&mut self, name: Name) -> BBId {
        if let Some(&bb) = self.labels.get(&name) {
            return bb;
        }
        let bb = self.new_bb();
        self.labels.insert(name, bb);
        bb
    }

    fn gen_if(&mut self, cond: &Expr, then_stmt: &Stmt, else_stmt: Option<&Stmt>) -> BResult<()> {
        let false_bb = self.new_bb();
        self.gen_cond_jmp(cond, false, false_bb)?;
        self.gen_stmt(then_stmt)?;
        match else_stmt {
            None => {
                self.set_curbb(false_bb);
            }
            Some(els) => {
                let next_bb = self.new_bb();
                self.jmp(next_bb);
                self.set_curbb(false_bb);
                self.gen_stmt(els)?;
                self.set_curbb(next_bb);
            }
        }
        Ok(())
    }

    fn gen_while(&mut self, cond: &Expr, body: &Stmt) -> BResult<()> {
        let header = self.new_bb();
        let next = self.new_bb();

        self.set_curbb(header);
        self.gen_cond_jmp(cond, false, next)?;

        self.break_stack.push(next);
        self.cont_stack.push(header);
        self.gen_stmt(body)?;
        self.cont_stack.pop();
        self.break_stack.pop();

        self.jmp(header);
        self.set_curbb(next);
        Ok(())
    }

    fn gen_do_while(&mut self, body: &Stmt, cond: &Expr) -> BResult<()> {
        let body_bb = self.new_bb();
        let cond_bb = self.new_bb();
        let next = self.new_bb();

        self.set_curbb(body_bb);
        self.break_stack.push(next);
        self.cont_stack.push(cond_bb);
        self.gen_stmt(body)?;
        self.cont_stack.pop();
        self.break_stack.pop();

        self.set_curbb(cond_bb);
        self.gen_cond_jmp(cond, true, body_bb)?;
        self.set_curbb(next);
        Ok(())
    }

    fn gen_for(
        &mut self,
        pre: Option<&Stmt>,
        cond: Option<&Expr>,
        post: Option<&Expr>,
        body: &Stmt,
    ) -> BResult<()> {
        if let Some(pre) = pre {
            self.gen_stmt(pre)?;
        }

        let header = self.new_bb();
        let post_bb = self.new_bb();
        let next = self.new_bb();

        self.set_curbb(header);
        if let Some(cond) = cond {
            self.gen_cond_jmp(cond, false, next)?;
        }

        self.break_stack.push(next);
        self.cont_stack.push(post_bb);
        self.gen_stmt(body)?;
        self.cont_stack.pop();
        self.break_stack.pop();

        self.set_curbb(post_bb);
        if let Some(post) = post {
            self.gen_expr(post)?;
        }
        self.jmp(header);
        self.set_curbb(next);
        Ok(())
    }

    fn gen_switch(
        &mut self,
        value: &Expr,
        body: &Stmt,
        cases: &[i64],
        has_default: bool,
    ) -> BResult<()> {
        let v = self.gen_expr_value(value)?;
        let vtype = self.func.vregs[v].vtype;

        let break_bb = self.new_bb();
        let case_bbs: Vec<BBId> = cases.iter().map(|_| self.new_bb()).collect();
        let default_bb = if has_default {
            self.new_bb()
        } else {
            break_bb
        };

        if let Some((min, table)) = dense_jump_table(cases, &case_bbs, default_bb) {
            self.emit(Ir::with(
                IrKind::TableJmp {
                    table,
                    min,
                    default: default_bb,
                },
                None,
                Some(v),
                None,
            ));
        } else {
            for (i, &cv) in cases.iter().enumerate() {
                let c = self.const_int(cv, vtype);
                self.emit(Ir::with(IrKind::Cmp, None, Some(v), Some(c)));
                self.emit(Ir::new(IrKind::JmpCond {
                    cond: CondCode::new(CondKind::Eq, vtype.unsigned, false),
                    bb: case_bbs[i],
                }));
            }
            self.jmp(default_bb);
        }
        self.start_dead_block();

        self.switch_stack.push(SwitchLower {
            case_bbs,
            next_case: 0,
            default_bb,
        });
        self.break_stack.push(break_bb);
        self.gen_stmt(body)?;
        self.break_stack.pop();
        self.switch_stack.pop();

        self.set_curbb(break_bb);
        Ok(())
    }

    /// Compile a conditional jump: branch to `bb` when `cond` evaluates
    /// to `tf`.
    fn gen_cond_jmp(&mut self, cond: &Expr, tf: bool, bb: BBId) -> BResult<()> {
        match &cond.kind {
            ExprKind::IntLit(v) => {
                if (*v != 0) == tf {
                    self.jmp(bb);
                    self.start_dead_block();
                }
                Ok(())
            }
            ExprKind::Binary { op, lhs, rhs } if op.is_compare() => {
                let mut cc = self.compare_cond(*op, lhs.ty);
                if !tf {
                    cc = cc.negate();
                }
                self.gen_compare(lhs, rhs, &mut cc)?;
                self.emit(Ir::new(IrKind::JmpCond { cond: cc, bb }));
                Ok(())
            }
            ExprKind::Logical { and, lhs, rhs } => {
                // Short-circuit evaluation gets its own CFG.
                let effective_and = if tf { *and } else { !*and };
                if effective_and {
                    let skip = self.new_bb();
                    self.gen_cond_jmp(lhs, !tf, skip)?;
                    self.gen_cond_jmp(rhs, tf, bb)?;
                    self.set_curbb(skip);
                } else {
                    self.gen_cond_jmp(lhs, tf, bb)?;
                    self.gen_cond_jmp(rhs, tf, bb)?;
                }
                Ok(())
            }
            ExprKind::Unary {
                op: UnOp::Not,
                sub,
            } => self.gen_cond_jmp(sub, !tf, bb),
            ExprKind::Comma { lhs, rhs } => {
                self.gen_expr(lhs)?;
                self.gen_cond_jmp(rhs, tf, bb)
            }
            _ => {
                let v = self.gen_expr_value(cond)?;
                let vtype = self.func.vregs[v].vtype;
                let zero = self.zero_of(vtype);
                self.emit(Ir::with(IrKind::Cmp, None, Some(v), Some(zero)));
                let kind = if tf { CondKind::Ne } else { CondKind::Eq };
                self.emit(Ir::new(IrKind::JmpCond {
                    cond: CondCode::new(kind, vtype.unsigned, vtype.flonum),
                    bb,
                }));
                Ok(())
            }
        }
    }

    fn compare_cond(&self, op: BinOp, operand_ty: Ty) -> CondCode {
        let kind = match op {
            BinOp::Eq => CondKind::Eq,
            BinOp::Ne => CondKind::Ne,
            BinOp::Lt => CondKind::Lt,
            BinOp::Le => CondKind::Le,
            BinOp::Gt => CondKind::Gt,
            BinOp::Ge => CondKind::Ge,
            _ => unreachable!("not a comparison"),
        };
        CondCode::new(
            kind,
            self.ctx.types.is_unsigned(operand_ty),
            self.ctx.types.is_flonum(operand_ty),
        )
    }

    /// Emit a `Cmp`, swapping a constant left operand to the right.
    fn gen_compare(&mut self, lhs: &Expr, rhs: &Expr, cc: &mut CondCode) -> BResult<()> {
        let (lhs, rhs) = if lhs.is_const() && !rhs.is_const() {
            *cc = cc.swap();
            (rhs, lhs)
        } else {
            (lhs, rhs)
        };
        let l = self.gen_expr_value(lhs)?;
        let r = self.gen_expr_value(rhs)?;
        self.emit(Ir::with(IrKind::Cmp, None, Some(l), Some(r)));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn gen_expr_value(&mut self, expr: &Expr) -> BResult<VRegId> {
        match self.gen_expr(expr)? {
            Some(v) => Ok(v),
            None => Err(BuildError::new("void value used", expr.span)),
        }
    }

    fn gen_expr(&mut self, expr: &Expr) -> BResult<Option<VRegId>> {
        match &expr.kind {
            ExprKind::IntLit(v) => {
                let vtype = self.vtype(expr.ty)?;
                Ok(Some(self.const_int(*v, vtype)))
            }
            ExprKind::FloatLit(v) => {
                let single = self.ctx.types.size_of(expr.ty) == 4;
                let bits = if single {
                    (*v as f32).to_bits() as u64
                } else {
                    v.to_bits()
                };
                let idx = self.func.float_const(bits, single);
                let name = self.ctx.str(self.func.name);
                let label = self.ctx.intern(&float_label(&name, idx));
                let addr = self.iofs(label, false);
                let vtype = self.vtype(expr.ty)?;
                Ok(Some(self.load(addr, vtype)))
            }
            ExprKind::StrLit(index) => {
                let label = self.str_label(*index);
                Ok(Some(self.iofs(label, false)))
            }
            ExprKind::Var { name, scope } => self.gen_var(*name, *scope, expr),
            ExprKind::Member { .. } | ExprKind::Deref(_) => {
                if self.ctx.types.is_struct(expr.ty) || self.ctx.types.is_array(expr.ty) {
                    // Aggregates evaluate to their address.
                    return Ok(Some(self.gen_lval(expr)?));
                }
                if let ExprKind::Member { target, struct_id, member } = &expr.kind {
                    let info = self.ctx.types.struct_def(*struct_id).members[*member].clone();
                    if let Some(bf) = info.bitfield {
                        let base = self.gen_lval(target)?;
                        let addr = self.member_addr(base, info.offset)?;
                        let unit_vtype = self.vtype(info.ty)?;
                        return Ok(Some(self.load_bitfield(addr, unit_vtype, bf)));
                    }
                }
                let addr = self.gen_lval(expr)?;
                let vtype = self.vtype(expr.ty)?;
                Ok(Some(self.load(addr, vtype)))
            }
            ExprKind::Addr(sub) => Ok(Some(self.gen_lval(sub)?)),
            ExprKind::Unary { op, sub } => self.gen_unary(*op, sub, expr),
            ExprKind::Binary { op, lhs, rhs } => self.gen_binary(*op, lhs, rhs, expr),
            ExprKind::Logical { .. } => {
                let vtype = VRegType::int(4, false);
                let res = self.func.new_vreg(vtype, VRegFlags::empty());
                let false_bb = self.new_bb();
                let next_bb = self.new_bb();
                self.gen_cond_jmp(expr, false, false_bb)?;
                let one = self.const_int(1, vtype);
                self.mov(res, one);
                self.jmp(next_bb);
                self.set_curbb(false_bb);
                let zero = self.const_int(0, vtype);
                self.mov(res, zero);
                self.set_curbb(next_bb);
                Ok(Some(res))
            }
            ExprKind::Assign { lhs, rhs } => self.gen_assign(lhs, rhs),
            ExprKind::CompoundAssign { op, lhs, rhs } => {
                self.gen_compound_assign(*op, lhs, rhs, expr)
            }
            ExprKind::IncDec { pre, inc, sub } => self.gen_incdec(*pre, *inc, sub),
            ExprKind::Call { callee, args } => self.gen_call(expr, callee, args),
            ExprKind::Cast(sub) => self.gen_cast(sub, expr.ty),
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => self.gen_ternary(cond, then_expr, else_expr, expr.ty),
            ExprKind::Comma { lhs, rhs } => {
                self.gen_expr(lhs)?;
                self.gen_expr(rhs)
            }
            ExprKind::CompoundLit {
                scope,
                index,
                inits,
            } => {
                for init in inits {
                    self.gen_expr(init)?;
                }
                let slot = self
                    .ctx
                    .var(*scope, *index)
                    .local
                    .frame
                    .expect("compound literal without a frame slot");
                Ok(Some(self.bofs(slot)))
            }
            ExprKind::BlockExpr(block) => {
                let StmtKind::Block { stmts, .. } = &block.kind else {
                    unreachable!();
                };
                let mut result = None;
                for (i, s) in stmts.iter().enumerate() {
                    if i + 1 == stmts.len() {
                        if let StmtKind::Expr(e) = &s.kind {
                            result = self.gen_expr(e)?;
                            continue;
                        }
                    }
                    self.gen_stmt(s)?;
                }
                Ok(result)
            }
        }
    }

    fn gen_var(&mut self, name: Name, scope: ScopeId, expr: &Expr) -> BResult<Option<VRegId>> {
        let idx = self.ctx.scopes[scope]
            .find_var(name)
            .expect("resolved variable vanished");
        let var = self.ctx.var(scope, idx);

        if var.is_local_storage() {
            if let Some(vreg) = var.local.vreg {
                return Ok(Some(vreg));
            }
            let slot = var.local.frame.expect("local without storage");
            let addr = self.bofs(slot);
            if self.ctx.types.is_struct(expr.ty) || self.ctx.types.is_array(expr.ty) {
                return Ok(Some(addr));
            }
            let vtype = self.vtype(expr.ty)?;
            return Ok(Some(self.load(addr, vtype)));
        }

        // Static or extern storage.
        let global = !var.storage.contains(Storage::STATIC);
        let addr = self.iofs(name, global);
        if self.ctx.types.is_struct(expr.ty)
            || self.ctx.types.is_array(expr.ty)
            || self.ctx.types.is_func(expr.ty)
        {
            return Ok(Some(addr));
        }
        let vtype = self.vtype(expr.ty)?;
        Ok(Some(self.load(addr, vtype)))
    }

    fn gen_lval(&mut self, expr: &Expr) -> BResult<VRegId> {
        match &expr.kind {
            ExprKind::Var { name, scope } => {
                let idx = self.ctx.scopes[*scope]
                    .find_var(*name)
                    .expect("resolved variable vanished");
                let var = self.ctx.var(*scope, idx);
                if var.is_local_storage() {
                    match var.local.frame {
                        Some(slot) => Ok(self.bofs(slot)),
                        None => Err(BuildError::new(
                            "cannot take the address of a register variable",
                            expr.span,
                        )),
                    }
                } else {
                    let global = !var.storage.contains(Storage::STATIC);
                    Ok(self.iofs(*name, global))
                }
            }
            ExprKind::Deref(sub) => self.gen_expr_value(sub),
            ExprKind::Member {
                target,
                struct_id,
                member,
            } => {
                let offset = self.ctx.types.struct_def(*struct_id).members[*member].offset;
                let base = self.gen_lval(target)?;
                self.member_addr(base, offset)
            }
            ExprKind::StrLit(index) => {
                let label = self.str_label(*index);
                Ok(self.iofs(label, false))
            }
            ExprKind::CompoundLit { .. } => {
                Ok(self.gen_expr_value(expr)?)
            }
            // A struct-returning call evaluates to the address of its
            // caller-allocated temporary.
            ExprKind::Call { .. } if self.ctx.types.is_struct(expr.ty) => {
                self.gen_expr_value(expr)
            }
            ExprKind::Addr(sub) => {
                // Decayed array: its "value" is the element address.
                self.gen_lval(sub)
            }
            _ => Err(BuildError::new("expression is not an lvalue", expr.span)),
        }
    }

    fn member_addr(&mut self, base: VRegId, offset: usize) -> BResult<VRegId> {
        if offset == 0 {
            return Ok(base);
        }
        let vtype = self.ptr_vtype();
        let off = self.const_int(offset as i64, vtype);
        Ok(self.binop(IrBinOp::Add, base, off, vtype))
    }

    /// Copy `size` bytes between two addresses in power-of-two chunks.
    /// Struct sizes are known statically and small, so the copy is
    /// unrolled.
    fn copy_object(&mut self, dst: VRegId, src: VRegId, size: usize) -> BResult<()> {
        let mut offset = 0usize;
        while offset < size {
            let chunk = match size - offset {
                n if n >= 8 => 8,
                n if n >= 4 => 4,
                n if n >= 2 => 2,
                _ => 1,
            };
            let vtype = VRegType::int(chunk, true);
            let from = self.member_addr(src, offset)?;
            let value = self.load(from, vtype);
            let to = self.member_addr(dst, offset)?;
            self.store(value, to);
            offset += chunk;
        }
        Ok(())
    }

    fn load_bitfield(&mut self, addr: VRegId, unit_vtype: VRegType, bf: Bitfield) -> VRegId {
        let unit_bits = (unit_vtype.size * 8) as i64;
        let raw_vtype = VRegType {
            unsigned: true,
            ..unit_vtype
        };
        let raw = self.load(addr, raw_vtype);
        let pos = self.const_int(bf.position as i64, raw_vtype);
        let shifted = self.binop(IrBinOp::Shr, raw, pos, raw_vtype);
        let mask = self.const_int((1i64 << bf.width) - 1, raw_vtype);
        let masked = self.binop(IrBinOp::BitAnd, shifted, mask, raw_vtype);
        if unit_vtype.unsigned {
            return masked;
        }
        // Sign extend: shift the field up to the top, then arithmetic
        // shift back down.
        let up = self.const_int(unit_bits - bf.width as i64, raw_vtype);
        let left = self.binop(IrBinOp::Shl, masked, up, raw_vtype);
        let signed_vtype = VRegType {
            unsigned: false,
            ..unit_vtype
        };
        self.binop(IrBinOp::Shr, left, up, signed_vtype)
    }

    fn store_bitfield(
        &mut self,
        addr: VRegId,
        value: VRegId,
        unit_vtype: VRegType,
        bf: Bitfield,
    ) {
        let raw_vtype = VRegType {
            unsigned: true,
            ..unit_vtype
        };
        let old = self.load(addr, raw_vtype);
        let field_mask = ((1i64 << bf.width) - 1) << bf.position;
        let clear = self.const_int(!field_mask, raw_vtype);
        let cleared = self.binop(IrBinOp::BitAnd, old, clear, raw_vtype);
        let vmask = self.const_int((1i64 << bf.width) - 1, raw_vtype);
        let vmasked = self.binop(IrBinOp::BitAnd, value, vmask, raw_vtype);
        let pos = self.const_int(bf.position as i64, raw_vtype);
        let vshifted = self.binop(IrBinOp::Shl, vmasked, pos, raw_vtype);
        let merged = self.binop(IrBinOp::BitOr, cleared, vshifted, raw_vtype);
        self.store(merged, addr);
    }

    fn gen_unary(&mut self, op: UnOp, sub: &Expr, expr: &Expr) -> BResult<Option<VRegId>> {
        match op {
            UnOp::Neg | UnOp::BitNot => {
                let v = self.gen_expr_value(sub)?;
                let vtype = self.vtype(expr.ty)?;
                let dst = self.func.new_vreg(vtype, VRegFlags::empty());
                let kind = match op {
                    UnOp::Neg => IrUnOp::Neg,
                    UnOp::BitNot => IrUnOp::BitNot,
                    UnOp::Not => unreachable!(),
                };
                self.emit(Ir::with(IrKind::UnOp(kind), Some(dst), Some(v), None));
                Ok(Some(dst))
            }
            UnOp::Not => {
                let v = self.gen_expr_value(sub)?;
                let svtype = self.func.vregs[v].vtype;
                let zero = self.zero_of(svtype);
                self.emit(Ir::with(IrKind::Cmp, None, Some(v), Some(zero)));
                let dst = self.func.new_vreg(VRegType::int(4, false), VRegFlags::empty());
                self.emit(Ir::with(
                    IrKind::Cond(CondCode::new(CondKind::Eq, svtype.unsigned, svtype.flonum)),
                    Some(dst),
                    None,
                    None,
                ));
                Ok(Some(dst))
            }
        }
    }

    fn gen_binary(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        expr: &Expr,
    ) -> BResult<Option<VRegId>> {
        if op.is_compare() {
            let mut cc = self.compare_cond(op, lhs.ty);
            self.gen_compare(lhs, rhs, &mut cc)?;
            let dst = self.func.new_vreg(VRegType::int(4, false), VRegFlags::empty());
            self.emit(Ir::with(IrKind::Cond(cc), Some(dst), None, None));
            return Ok(Some(dst));
        }

        let ir_op = match op {
            BinOp::Add => IrBinOp::Add,
            BinOp::Sub => IrBinOp::Sub,
            BinOp::Mul => IrBinOp::Mul,
            BinOp::Div => IrBinOp::Div,
            BinOp::Mod => IrBinOp::Mod,
            BinOp::BitAnd => IrBinOp::BitAnd,
            BinOp::BitOr => IrBinOp::BitOr,
            BinOp::BitXor => IrBinOp::BitXor,
            BinOp::Shl => IrBinOp::Shl,
            BinOp::Shr => IrBinOp::Shr,
            _ => unreachable!(),
        };
        let l = self.gen_expr_value(lhs)?;
        let r = self.gen_expr_value(rhs)?;
        let vtype = self.vtype(expr.ty)?;
        Ok(Some(self.binop(ir_op, l, r, vtype)))
    }

    fn gen_assign(&mut self, lhs: &Expr, rhs: &Expr) -> BResult<Option<VRegId>> {
        if self.ctx.types.is_struct(lhs.ty) {
            // Struct values are addresses; assignment is an object copy.
            let dst = self.gen_lval(lhs)?;
            let src = self.gen_expr_value(rhs)?;
            let size = self.ctx.types.size_of(lhs.ty);
            self.copy_object(dst, src, size)?;
            return Ok(Some(dst));
        }

        // A register-resident variable is assigned with a plain move.
        if let ExprKind::Var { name, scope } = lhs.kind {
            let idx = self.ctx.scopes[scope].find_var(name).unwrap();
            if let Some(vreg) = self.ctx.var(scope, idx).local.vreg {
                let value = self.gen_expr_value(rhs)?;
                self.mov(vreg, value);
                return Ok(Some(vreg));
            }
        }

        if let ExprKind::Member {
            target,
            struct_id,
            member,
        } = &lhs.kind
        {
            let info = self.ctx.types.struct_def(*struct_id).members[*member].clone();
            if let Some(bf) = info.bitfield {
                let base = self.gen_lval(target)?;
                let addr = self.member_addr(base, info.offset)?;
                let value = self.gen_expr_value(rhs)?;
                let unit_vtype = self.vtype(info.ty)?;
                self.store_bitfield(addr, value, unit_vtype, bf);
                return Ok(Some(value));
            }
        }

        let addr = self.gen_lval(lhs)?;
        let value = self.gen_expr_value(rhs)?;
        self.store(value, addr);
        Ok(Some(value))
    }

    fn gen_compound_assign(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        expr: &Expr,
    ) -> BResult<Option<VRegId>> {
        let ir_op = match op {
            BinOp::Add => IrBinOp::Add,
            BinOp::Sub => IrBinOp::Sub,
            BinOp::Mul => IrBinOp::Mul,
            BinOp::Div => IrBinOp::Div,
            BinOp::Mod => IrBinOp::Mod,
            BinOp::BitAnd => IrBinOp::BitAnd,
            BinOp::BitOr => IrBinOp::BitOr,
            BinOp::BitXor => IrBinOp::BitXor,
            BinOp::Shl => IrBinOp::Shl,
            BinOp::Shr => IrBinOp::Shr,
            _ => unreachable!("comparison cannot be compound"),
        };
        let vtype = self.vtype(expr.ty)?;

        if let ExprKind::Var { name, scope } = lhs.kind {
            let idx = self.ctx.scopes[scope].find_var(name).unwrap();
            if let Some(vreg) = self.ctx.var(scope, idx).local.vreg {
                let r = self.gen_expr_value(rhs)?;
                let combined = self.binop(ir_op, vreg, r, vtype);
                self.mov(vreg, combined);
                return Ok(Some(vreg));
            }
        }

        // Produce the lvalue address once, then load-combine-store.
        let addr = self.gen_lval(lhs)?;
        let r = self.gen_expr_value(rhs)?;
        let old = self.load(addr, vtype);
        let combined = self.binop(ir_op, old, r, vtype);
        self.store(combined, addr);
        Ok(Some(combined))
    }

    fn gen_incdec(&mut self, pre: bool, inc: bool, sub: &Expr) -> BResult<Option<VRegId>> {
        let step = match self.ctx.types.pointee(sub.ty) {
            Some(pointee) => self.ctx.types.size_of(pointee).max(1) as i64,
            None => 1,
        };
        let vtype = self.vtype(sub.ty)?;
        let ir_op = if inc { IrBinOp::Add } else { IrBinOp::Sub };

        if let ExprKind::Var { name, scope } = sub.kind {
            let idx = self.ctx.scopes[scope].find_var(name).unwrap();
            if let Some(vreg) = self.ctx.var(scope, idx).local.vreg {
                let result = if pre {
                    None
                } else {
                    let keep = self.func.new_vreg(vtype, VRegFlags::empty());
                    self.mov(keep, vreg);
                    Some(keep)
                };
                let one = self.step_of(step, vtype);
                let updated = self.binop(ir_op, vreg, one, vtype);
                self.mov(vreg, updated);
                return Ok(Some(result.unwrap_or(vreg)));
            }
        }

        let addr = self.gen_lval(sub)?;
        let old = self.load(addr, vtype);
        let one = self.step_of(step, vtype);
        let updated = self.binop(ir_op, old, one, vtype);
        self.store(updated, addr);
        Ok(Some(if pre { updated } else { old }))
    }

    fn gen_cast(&mut self, sub: &Expr, to: Ty) -> BResult<Option<VRegId>> {
        if to == Ty::VOID {
            self.gen_expr(sub)?;
            return Ok(None);
        }
        let v = self.gen_expr_value(sub)?;
        let src = self.func.vregs[v].vtype;
        let dst_vtype = self.vtype(to)?;
        if src.size == dst_vtype.size
            && src.unsigned == dst_vtype.unsigned
            && src.flonum == dst_vtype.flonum
        {
            return Ok(Some(v));
        }
        let dst = self.func.new_vreg(dst_vtype, VRegFlags::empty());
        self.emit(Ir::with(IrKind::Cast, Some(dst), Some(v), None));
        Ok(Some(dst))
    }

    fn gen_ternary(
        &mut self,
        cond: &Expr,
        then_expr: &Expr,
        else_expr: &Expr,
        ty: Ty,
    ) -> BResult<Option<VRegId>> {
        let result = if ty == Ty::VOID {
            None
        } else {
            let vtype = self.vtype(ty)?;
            Some(self.func.new_vreg(vtype, VRegFlags::empty()))
        };

        let else_bb = self.new_bb();
        let next_bb = self.new_bb();

        self.gen_cond_jmp(cond, false, else_bb)?;
        if let Some(res) = result {
            let v = self.gen_expr_value(then_expr)?;
            self.mov(res, v);
        } else {
            self.gen_expr(then_expr)?;
        }
        self.jmp(next_bb);

        self.set_curbb(else_bb);
        if let Some(res) = result {
            let v = self.gen_expr_value(else_expr)?;
            self.mov(res, v);
        } else {
            self.gen_expr(else_expr)?;
        }
        self.set_curbb(next_bb);
        Ok(result)
    }

    /// Function calls: funarg simplification, precall, right-to-left
    /// argument placement, the call itself and stack-pointer reversal.
    fn gen_call(
        &mut self,
        expr: &Expr,
        callee: &Expr,
        args: &[Expr],
    ) -> BResult<Option<VRegId>> {
        let ret_struct = self.ctx.types.is_struct(expr.ty);
        let sret_slot = if ret_struct {
            let size = self.ctx.types.size_of(expr.ty).max(1);
            let align = self.ctx.types.align_of(expr.ty).max(1);
            Some(self.func.add_frame_slot(size, align))
        } else {
            None
        };

        for arg in args {
            if self.ctx.types.is_struct(arg.ty) {
                return Err(BuildError::new(
                    "struct arguments are not supported",
                    arg.span,
                ));
            }
        }

        // Funarg simplification: any argument whose evaluation performs
        // a call (or clobbers fixed registers through div/mod) is
        // hoisted into a temporary before argument placement starts.
        let mut hoisted: Vec<Option<VRegId>> = Vec::with_capacity(args.len());
        for arg in args {
            if needs_hoist(arg) {
                let v = self.gen_expr_value(arg)?;
                let tmp = self.func.new_vreg(self.func.vregs[v].vtype, VRegFlags::empty());
                self.mov(tmp, v);
                hoisted.push(Some(tmp));
            } else {
                hoisted.push(None);
            }
        }

        // Assign argument slots: integer and float files fill
        // independently; overflow goes to the stack.
        let hidden = usize::from(sret_slot.is_some());
        let mut int_idx = hidden;
        let mut fp_idx = 0usize;
        let mut stack_off = 0usize;
        let mut slots: Vec<(usize, Option<usize>)> = Vec::with_capacity(args.len());
        for arg in args {
            let flonum = self.ctx.types.is_flonum(arg.ty);
            if flonum {
                if fp_idx < MAX_FREG_ARGS {
                    slots.push((fp_idx, None));
                    fp_idx += 1;
                } else {
                    slots.push((0, Some(stack_off)));
                    stack_off += 8;
                }
            } else if int_idx < MAX_REG_ARGS {
                slots.push((int_idx, None));
                int_idx += 1;
            } else {
                slots.push((0, Some(stack_off)));
                stack_off += 8;
            }
        }
        let stack_space = (stack_off + 15) & !15;
        self.func.max_stack_args = self.func.max_stack_args.max(stack_space);

        let total_args = args.len() + hidden;
        self.emit(Ir::new(IrKind::PreCall {
            arg_count: total_args,
            stack_space,
        }));

        // Arguments are evaluated right-to-left into their slots.
        for i in (0..args.len()).rev() {
            let (index, stack_offset) = slots[i];
            let v = match hoisted[i] {
                Some(tmp) => tmp,
                None => self.gen_expr_value(&args[i])?,
            };
            self.emit(Ir::with(
                IrKind::PushArg {
                    index,
                    stack_offset,
                },
                None,
                Some(v),
                None,
            ));
        }
        if let Some(slot) = sret_slot {
            let addr = self.bofs(slot);
            self.emit(Ir::with(
                IrKind::PushArg {
                    index: 0,
                    stack_offset: None,
                },
                None,
                Some(addr),
                None,
            ));
        }

        // Direct call through a function designator, indirect otherwise.
        let (label, indirect) = match &callee.kind {
            ExprKind::Var { name, .. } if self.ctx.types.is_func(callee.ty) => {
                (Some(*name), None)
            }
            _ => {
                let fp = self.gen_expr_value(callee)?;
                (None, Some(fp))
            }
        };

        let reg_arg_count = int_idx.min(MAX_REG_ARGS);
        let dst = if expr.ty == Ty::VOID || ret_struct {
            None
        } else {
            let vtype = self.vtype(expr.ty)?;
            Some(self.func.new_vreg(vtype, VRegFlags::empty()))
        };
        self.emit(Ir::with(
            IrKind::Call {
                label,
                arg_count: total_args,
                reg_arg_count,
                stack_space,
            },
            dst,
            indirect,
            None,
        ));
        if stack_space > 0 {
            self.emit(Ir::new(IrKind::SubSp { space: stack_space }));
        }

        match sret_slot {
            Some(slot) => Ok(Some(self.bofs(slot))),
            None => Ok(dst),
        }
    }
}

/// Does evaluating this expression call a function or use the fixed
/// mul/div registers?
fn needs_hoist(expr: &Expr) -> bool {
    let mut found = false;
    visit_expr(expr, &mut |e| match &e.kind {
        ExprKind::Call { .. } => found = true,
        ExprKind::Binary {
            op: BinOp::Div | BinOp::Mod,
            ..
        } => found = true,
        _ => {}
    });
    found
}

/// Build a dense jump table when the case values warrant one.
fn dense_jump_table(
    cases: &[i64],
    case_bbs: &[BBId],
    default_bb: BBId,
) -> Option<(i64, Vec<BBId>)> {
    if cases.len() < 4 {
        return None;
    }
    let min = *cases.iter().min()?;
    let max = *cases.iter().max()?;
    let range = (max - min) as u64 + 1;
    if range > 3 * cases.len() as u64 {
        return None;
    }
    let mut table = vec![default_bb; range as usize];
    for (i, &cv) in cases.iter().enumerate() {
        table[(cv - min) as usize] = case_bbs[i];
    }
    Some((min, table))
}
