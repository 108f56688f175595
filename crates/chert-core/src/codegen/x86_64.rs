//! Native x86-64 emitter: AT&T-syntax assembly, System-V conventions.
//!
//! Walks each function's blocks in order, mapping every IR to one to
//! three instructions. Condition flags from `Cmp` are consumed by the
//! following `JmpCond` or `Cond`. `%rax`, `%rdx`, `%r11` and `%xmm15`
//! are emitter scratch and never allocated.

use std::fmt::Write as _;

use crate::context::CompilerContext;
use crate::ids::VRegId;
use crate::interner::Name;
use crate::ir::builder::build;
use crate::ir::regalloc::{allocate, RegAllocConfig, NO_PHYS};
use crate::ir::{float_label, CondCode, CondKind, FuncIr, Ir, IrBinOp, IrKind, IrUnOp};
use crate::scope::Storage;
use crate::syntax::ast::Function;
use crate::traverse::ProgramIndex;
use crate::types::{align_to, TyKind};

use super::{Backend, CodegenError};

// Allocator register file: index 0 is scratch-range, 1..=5 callee-saved,
// 6.. the argument registers (rdx excluded; it is div/mul scratch).
const REG64: [&str; 11] = [
    "%r10", "%rbx", "%r12", "%r13", "%r14", "%r15", "%rdi", "%rsi", "%rcx", "%r8", "%r9",
];
const REG32: [&str; 11] = [
    "%r10d", "%ebx", "%r12d", "%r13d", "%r14d", "%r15d", "%edi", "%esi", "%ecx", "%r8d", "%r9d",
];
const REG16: [&str; 11] = [
    "%r10w", "%bx", "%r12w", "%r13w", "%r14w", "%r15w", "%di", "%si", "%cx", "%r8w", "%r9w",
];
const REG8: [&str; 11] = [
    "%r10b", "%bl", "%r12b", "%r13b", "%r14b", "%r15b", "%dil", "%sil", "%cl", "%r8b", "%r9b",
];

/// ABI argument registers by argument index.
const ARG64: [&str; 6] = ["%rdi", "%rsi", "%rdx", "%rcx", "%r8", "%r9"];
const ARG32: [&str; 6] = ["%edi", "%esi", "%edx", "%ecx", "%r8d", "%r9d"];

/// Argument index to allocator index (rdx is not allocatable).
static REG_PARAM_MAP: [usize; 6] = [6, 7, NO_PHYS, 8, 9, 10];
/// Allocator indices of callee-saved registers.
const CALLEE_SAVED: [usize; 5] = [1, 2, 3, 4, 5];

const RCX_ALLOC_INDEX: usize = 8;

pub fn regalloc_config() -> RegAllocConfig {
    RegAllocConfig {
        phys_max: 11,
        temporary_count: 1,
        reg_param_map: &REG_PARAM_MAP,
        // r10 plus the argument registers.
        caller_saved: (1 << 0) | (0b11111 << 6),
        fphys_max: 15,
        ftemporary_count: 0,
        freg_param_count: 8,
        fcaller_saved: (1 << 15) - 1,
    }
}

/// The native backend. Accumulates assembly text per function and emits
/// data sections at finalize.
pub struct NativeBackend {
    out: String,
    mach_o: bool,
    need_neg_mask32: bool,
    need_neg_mask64: bool,
}

impl NativeBackend {
    pub fn new() -> Self {
        Self::with_flavor(cfg!(target_os = "macos"))
    }

    pub fn with_flavor(mach_o: bool) -> Self {
        Self {
            out: String::new(),
            mach_o,
            need_neg_mask32: false,
            need_neg_mask64: false,
        }
    }

    fn mangle(&self, name: &str) -> String {
        if self.mach_o && !name.starts_with('.') {
            format!("_{}", name)
        } else {
            name.to_string()
        }
    }

    fn line(&mut self, text: &str) {
        self.out.push('\t');
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn label(&mut self, text: &str) {
        self.out.push_str(text);
        self.out.push_str(":\n");
    }

    fn align(&mut self, align: usize) {
        if align <= 1 {
            return;
        }
        if self.mach_o {
            let _ = writeln!(self.out, "\t.p2align {}", align.trailing_zeros());
        } else {
            let _ = writeln!(self.out, "\t.align {}", align);
        }
    }
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for NativeBackend {
    fn lower_function(
        &mut self,
        ctx: &mut CompilerContext,
        index: &ProgramIndex,
        func: &Function,
    ) -> Result<(), CodegenError> {
        let info = index.funcs.get(func.name);
        if !info.map_or(false, |i| i.referenced) {
            return Ok(());
        }

        let mut func_ir = build(ctx, func)?;
        allocate(&mut func_ir, &regalloc_config());

        let mut emitter = FuncEmitter {
            backend: self,
            ctx,
            func_ir: &mut func_ir,
            is_static: func.storage.contains(Storage::STATIC),
            saved: Vec::new(),
            table_count: 0,
        };
        emitter.emit();
        Ok(())
    }

    fn finalize(
        &mut self,
        ctx: &mut CompilerContext,
        index: &ProgramIndex,
    ) -> Result<Vec<u8>, CodegenError> {
        self.emit_globals(ctx, index)?;
        self.emit_strings(ctx);
        self.emit_masks();
        Ok(std::mem::take(&mut self.out).into_bytes())
    }
}

impl NativeBackend {
    fn emit_globals(
        &mut self,
        ctx: &CompilerContext,
        index: &ProgramIndex,
    ) -> Result<(), CodegenError> {
        let mut data: Vec<String> = Vec::new();
        let mut bss: Vec<String> = Vec::new();

        for &(scope, var_idx) in &index.globals {
            let var = ctx.var(scope, var_idx);
            if var.storage.contains(Storage::EXTERN) {
                continue;
            }
            let name = self.mangle(&ctx.str(var.name));
            let size = ctx.types.size_of(var.ty).max(1);
            let align = ctx.types.align_of(var.ty).max(1);
            let globl = if var.storage.contains(Storage::STATIC) {
                String::new()
            } else {
                format!("\t.globl {}\n", name)
            };
            let align_directive = if self.mach_o {
                format!("\t.p2align {}\n", align.trailing_zeros())
            } else {
                format!("\t.align {}\n", align)
            };

            match var.init {
                Some(init) => {
                    let value = match init {
                        crate::scope::GlobalInit::Fixnum(v) => v,
                        crate::scope::GlobalInit::Flonum(v) => match ctx.types.kind(var.ty) {
                            TyKind::Flonum(crate::types::FlonumKind::Float) => {
                                (v as f32).to_bits() as i64
                            }
                            _ => v.to_bits() as i64,
                        },
                    };
                    let directive = match size {
                        1 => format!("\t.byte {}\n", value as i8),
                        2 => format!("\t.word {}\n", value as i16),
                        4 => format!("\t.long {}\n", value as i32),
                        _ => format!("\t.quad {}\n", value),
                    };
                    data.push(format!("{}{}{}:\n{}", globl, align_directive, name, directive));
                }
                None => {
                    bss.push(format!(
                        "{}{}{}:\n\t.zero {}\n",
                        globl, align_directive, name, size
                    ));
                }
            }
        }

        if !data.is_empty() {
            self.out.push_str("\t.data\n");
            for chunk in data {
                self.out.push_str(&chunk);
            }
        }
        if !bss.is_empty() {
            self.out.push_str("\t.bss\n");
            for chunk in bss {
                self.out.push_str(&chunk);
            }
        }
        Ok(())
    }

    fn emit_strings(&mut self, ctx: &CompilerContext) {
        if ctx.string_count() == 0 {
            return;
        }
        self.out.push_str("\t.section .rodata\n");
        for i in 0..ctx.string_count() as u32 {
            let _ = writeln!(self.out, ".L.str.{}:", i);
            let escaped = escape_asm_string(ctx.string(i));
            let _ = writeln!(self.out, "\t.string \"{}\"", escaped);
        }
    }

    fn emit_masks(&mut self) {
        if !self.need_neg_mask32 && !self.need_neg_mask64 {
            return;
        }
        self.out.push_str("\t.section .rodata\n");
        if self.need_neg_mask32 {
            self.align(16);
            self.out.push_str(".LC.negmask32:\n\t.long 0x80000000, 0, 0, 0\n");
        }
        if self.need_neg_mask64 {
            self.align(16);
            self.out
                .push_str(".LC.negmask64:\n\t.quad 0x8000000000000000, 0\n");
        }
    }
}

fn escape_asm_string(s: &str) -> String {
    let mut out = String::new();
    for &b in s.as_bytes() {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            b'\r' => out.push_str("\\r"),
            0x20..=0x7e => out.push(b as char),
            _ => {
                let _ = write!(out, "\\{:03o}", b);
            }
        }
    }
    out
}

struct FuncEmitter<'a> {
    backend: &'a mut NativeBackend,
    ctx: &'a CompilerContext,
    func_ir: &'a mut FuncIr,
    is_static: bool,
    saved: Vec<usize>,
    table_count: usize,
}

impl FuncEmitter<'_> {
    fn emit(&mut self) {
        let name = self.ctx.str(self.func_ir.name);
        let label = self.backend.mangle(&name);

        self.backend.out.push_str("\t.text\n");
        if !self.is_static {
            let _ = writeln!(self.backend.out, "\t.globl {}", label);
        }
        self.backend.label(&label);

        self.prologue();
        self.body(&name);
        self.epilogue();
        self.literals(&name);
    }

    fn prologue(&mut self) {
        let used = self.func_ir.used_regs;
        self.saved = CALLEE_SAVED
            .iter()
            .copied()
            .filter(|&r| used & (1 << r) != 0)
            .collect();

        self.backend.line("push %rbp");
        self.backend.line("mov %rsp, %rbp");
        let saved = self.saved.clone();
        for &r in &saved {
            let line = format!("push {}", REG64[r]);
            self.backend.line(&line);
        }

        // Frame slots sit below the callee-saved area.
        let saved_bytes = 8 * self.saved.len();
        let mut running = 0usize;
        for slot in self.func_ir.frame.iter_mut() {
            running = align_to(running + slot.size, slot.align.max(1));
            slot.offset = -((saved_bytes + running) as i64);
        }
        let mut frame_size = align_to(running, 16);
        if self.saved.len() % 2 != 0 {
            frame_size += 8;
        }
        if frame_size > 0 {
            let line = format!("sub ${}, %rsp", frame_size);
            self.backend.line(&line);
        }

        // Move incoming parameters into their allocated homes.
        for &p in &self.func_ir.param_vregs.clone() {
            let vreg = self.func_ir.vregs[p];
            let Some(slot_idx) = vreg.param_index else {
                continue;
            };
            let slot_idx = slot_idx as usize;
            if vreg.vtype.flonum {
                match vreg.phys {
                    Some(phys) if phys == slot_idx => {}
                    Some(phys) => {
                        let op = if vreg.vtype.size == 4 { "movss" } else { "movsd" };
                        let line = format!("{} %xmm{}, %xmm{}", op, slot_idx, phys);
                        self.backend.line(&line);
                    }
                    None => {
                        if let Some(frame) = vreg.frame_slot {
                            let off = self.func_ir.frame[frame].offset;
                            let op = if vreg.vtype.size == 4 { "movss" } else { "movsd" };
                            let line = format!("{} %xmm{}, {}(%rbp)", op, slot_idx, off);
                            self.backend.line(&line);
                        }
                    }
                }
            } else {
                let src = if vreg.vtype.size <= 4 {
                    ARG32[slot_idx]
                } else {
                    ARG64[slot_idx]
                };
                match vreg.phys {
                    Some(phys) if REG_PARAM_MAP[slot_idx] == phys => {}
                    Some(phys) => {
                        let dst = reg_name(phys, vreg.vtype.size);
                        let line = format!("mov {}, {}", src, dst);
                        self.backend.line(&line);
                    }
                    None => {
                        if let Some(frame) = vreg.frame_slot {
                            let off = self.func_ir.frame[frame].offset;
                            let line = format!(
                                "mov{} {}, {}(%rbp)",
                                size_suffix(vreg.vtype.size),
                                src,
                                off
                            );
                            self.backend.line(&line);
                        }
                    }
                }
            }
        }
    }

    fn epilogue(&mut self) {
        if self.saved.is_empty() {
            self.backend.line("mov %rbp, %rsp");
        } else {
            let line = format!("lea -{}(%rbp), %rsp", 8 * self.saved.len());
            self.backend.line(&line);
            let saved = self.saved.clone();
            for &r in saved.iter().rev() {
                let line = format!("pop {}", REG64[r]);
                self.backend.line(&line);
            }
        }
        self.backend.line("pop %rbp");
        self.backend.line("ret");
    }

    fn bb_label(&self, name: &str, bb: crate::ids::BBId) -> String {
        format!(".L{}.{}", name, bb.0)
    }

    fn body(&mut self, name: &str) {
        let order = self.func_ir.bbcon.order.clone();
        for &bb in &order {
            let label = self.bb_label(name, bb);
            self.backend.label(&label);
            let irs = self.func_ir.bbcon.pool[bb].irs.clone();
            for ir in &irs {
                self.instr(name, ir);
            }
        }
    }

    /// Operand as a sized register name or an immediate.
    fn operand(&self, v: VRegId, size: usize) -> String {
        let vreg = &self.func_ir.vregs[v];
        if vreg.is_const() {
            return format!("${}", vreg.fixnum);
        }
        let phys = vreg.phys.expect("unallocated vreg reached the emitter");
        if vreg.vtype.flonum {
            format!("%xmm{}", phys)
        } else {
            reg_name(phys, size).to_string()
        }
    }

    fn reg_of(&self, v: VRegId, size: usize) -> String {
        let vreg = &self.func_ir.vregs[v];
        debug_assert!(!vreg.is_const());
        self.operand(v, size)
    }

    fn is_const(&self, v: VRegId) -> bool {
        self.func_ir.vregs[v].is_const()
    }

    fn const_value(&self, v: VRegId) -> i64 {
        self.func_ir.vregs[v].fixnum
    }

    fn phys_of(&self, v: VRegId) -> Option<usize> {
        self.func_ir.vregs[v].phys
    }

    fn frame_offset(&self, v: VRegId) -> i64 {
        let slot = self.func_ir.vregs[v]
            .frame_slot
            .expect("spilled vreg without a frame slot");
        self.func_ir.frame[slot].offset
    }

    /// Move an immediate into a register; 64-bit values outside the
    /// sign-extended 32-bit range need `movabs`.
    fn mov_imm(&mut self, value: i64, dst: &str, size: usize) {
        if size == 8 && !imm_fits_i32(value) {
            let line = format!("movabs ${}, {}", value, dst);
            self.backend.line(&line);
        } else {
            let line = format!("mov ${}, {}", value, dst);
            self.backend.line(&line);
        }
    }

    /// Operand usable as an instruction immediate or register; large
    /// 64-bit immediates are staged through scratch.
    fn arith_operand(&mut self, v: VRegId, size: usize) -> String {
        let vreg = &self.func_ir.vregs[v];
        if vreg.is_const() && size == 8 && !imm_fits_i32(vreg.fixnum) {
            let value = vreg.fixnum;
            let line = format!("movabs ${}, %r11", value);
            self.backend.line(&line);
            return "%r11".to_string();
        }
        self.operand(v, size)
    }

    fn instr(&mut self, name: &str, ir: &Ir) {
        match &ir.kind {
            IrKind::Mov => self.emit_mov(ir),
            IrKind::Load => self.emit_load(ir),
            IrKind::Store => self.emit_store(ir),
            IrKind::BinOp(op) => self.emit_binop(*op, ir),
            IrKind::UnOp(op) => self.emit_unop(*op, ir),
            IrKind::Cmp => self.emit_cmp(ir),
            IrKind::Cond(cc) => self.emit_setcc(*cc, ir),
            IrKind::JmpCond { cond, bb } => {
                let target = self.bb_label(name, *bb);
                match cond.kind {
                    CondKind::None => {}
                    CondKind::Any => {
                        let line = format!("jmp {}", target);
                        self.backend.line(&line);
                    }
                    _ => {
                        let line = format!("j{} {}", cc_suffix(*cond), target);
                        self.backend.line(&line);
                    }
                }
            }
            IrKind::Jmp { bb } => {
                let target = self.bb_label(name, *bb);
                let line = format!("jmp {}", target);
                self.backend.line(&line);
            }
            IrKind::TableJmp { table, min, default } => {
                self.emit_table_jmp(name, ir, table, *min, *default);
            }
            IrKind::Cast => self.emit_cast(ir),
            IrKind::Bofs { slot } => {
                let off = self.func_ir.frame[*slot].offset;
                let dst = self.reg_of(ir.dst.unwrap(), 8);
                let line = format!("lea {}(%rbp), {}", off, dst);
                self.backend.line(&line);
            }
            IrKind::Iofs { label, .. } => {
                let sym = self.symbol_for(*label);
                let dst = self.reg_of(ir.dst.unwrap(), 8);
                let line = format!("lea {}(%rip), {}", sym, dst);
                self.backend.line(&line);
            }
            IrKind::Sofs { offset } => {
                let dst = self.reg_of(ir.dst.unwrap(), 8);
                let line = format!("lea {}(%rsp), {}", offset, dst);
                self.backend.line(&line);
            }
            IrKind::PreCall { stack_space, .. } => {
                if *stack_space > 0 {
                    let line = format!("sub ${}, %rsp", stack_space);
                    self.backend.line(&line);
                }
            }
            IrKind::PushArg {
                index,
                stack_offset,
            } => self.emit_push_arg(ir, *index, *stack_offset),
            IrKind::Call { label, .. } => self.emit_call(ir, *label),
            IrKind::SubSp { space } => {
                if *space > 0 {
                    let line = format!("add ${}, %rsp", space);
                    self.backend.line(&line);
                }
            }
            IrKind::Result => self.emit_result(ir),
            IrKind::Asm(text) => {
                self.backend.line(text);
            }
            IrKind::LoadSpilled => {
                let src = ir.opr1.unwrap();
                let off = self.frame_offset(src);
                let dst_v = ir.dst.unwrap();
                let vt = self.func_ir.vregs[dst_v].vtype;
                if vt.flonum {
                    let op = if vt.size == 4 { "movss" } else { "movsd" };
                    let dst = self.reg_of(dst_v, vt.size);
                    let line = format!("{} {}(%rbp), {}", op, off, dst);
                    self.backend.line(&line);
                } else {
                    let dst = self.reg_of(dst_v, vt.size);
                    let line = format!("mov{} {}(%rbp), {}", size_suffix(vt.size), off, dst);
                    self.backend.line(&line);
                }
            }
            IrKind::StoreSpilled => {
                let dst = ir.dst.unwrap();
                let off = self.frame_offset(dst);
                let src_v = ir.opr1.unwrap();
                let vt = self.func_ir.vregs[src_v].vtype;
                if vt.flonum {
                    let op = if vt.size == 4 { "movss" } else { "movsd" };
                    let src = self.reg_of(src_v, vt.size);
                    let line = format!("{} {}, {}(%rbp)", op, src, off);
                    self.backend.line(&line);
                } else {
                    let src = self.reg_of(src_v, vt.size);
                    let line = format!("mov{} {}, {}(%rbp)", size_suffix(vt.size), src, off);
                    self.backend.line(&line);
                }
            }
        }
    }

    fn symbol_for(&self, label: Name) -> String {
        let text = self.ctx.str(label);
        self.backend.mangle(&text)
    }

    fn emit_mov(&mut self, ir: &Ir) {
        let dst_v = ir.dst.unwrap();
        let src_v = ir.opr1.unwrap();
        let vt = self.func_ir.vregs[dst_v].vtype;
        if vt.flonum {
            if self.phys_of(dst_v) == self.phys_of(src_v) {
                return;
            }
            let op = if vt.size == 4 { "movss" } else { "movsd" };
            let line = format!(
                "{} {}, {}",
                op,
                self.operand(src_v, vt.size),
                self.reg_of(dst_v, vt.size)
            );
            self.backend.line(&line);
            return;
        }
        if self.is_const(src_v) {
            let size = vt.size.max(4);
            let dst = self.reg_of(dst_v, size);
            let value = self.const_value(src_v);
            self.mov_imm(value, &dst, size);
            return;
        }
        if self.phys_of(dst_v) == self.phys_of(src_v) {
            return;
        }
        let line = format!(
            "mov {}, {}",
            self.reg_of(src_v, vt.size.max(4)),
            self.reg_of(dst_v, vt.size.max(4))
        );
        self.backend.line(&line);
    }

    fn emit_load(&mut self, ir: &Ir) {
        let dst_v = ir.dst.unwrap();
        let addr = self.reg_of(ir.opr1.unwrap(), 8);
        let vt = self.func_ir.vregs[dst_v].vtype;
        if vt.flonum {
            let op = if vt.size == 4 { "movss" } else { "movsd" };
            let dst = self.reg_of(dst_v, vt.size);
            let line = format!("{} ({}), {}", op, addr, dst);
            self.backend.line(&line);
            return;
        }
        let dst = self.reg_of(dst_v, vt.size);
        let line = format!("mov{} ({}), {}", size_suffix(vt.size), addr, dst);
        self.backend.line(&line);
    }

    fn emit_store(&mut self, ir: &Ir) {
        let src_v = ir.opr1.unwrap();
        let addr = self.reg_of(ir.opr2.unwrap(), 8);
        let vt = self.func_ir.vregs[src_v].vtype;
        if vt.flonum {
            let op = if vt.size == 4 { "movss" } else { "movsd" };
            let src = self.reg_of(src_v, vt.size);
            let line = format!("{} {}, ({})", op, src, addr);
            self.backend.line(&line);
            return;
        }
        if self.is_const(src_v) {
            let value = self.const_value(src_v);
            if vt.size == 8 && !imm_fits_i32(value) {
                let line = format!("movabs ${}, %r11", value);
                self.backend.line(&line);
                let line = format!("mov %r11, ({})", addr);
                self.backend.line(&line);
            } else {
                let line =
                    format!("mov{} ${}, ({})", size_suffix(vt.size), value, addr);
                self.backend.line(&line);
            }
            return;
        }
        let src = self.reg_of(src_v, vt.size);
        let line = format!("mov{} {}, ({})", size_suffix(vt.size), src, addr);
        self.backend.line(&line);
    }

    fn emit_binop(&mut self, op: IrBinOp, ir: &Ir) {
        let dst_v = ir.dst.unwrap();
        let l = ir.opr1.unwrap();
        let r = ir.opr2.unwrap();
        let vt = self.func_ir.vregs[dst_v].vtype;

        if vt.flonum {
            self.emit_float_binop(op, dst_v, l, r);
            return;
        }
        match op {
            IrBinOp::Div | IrBinOp::Mod => self.emit_divmod(op, dst_v, l, r),
            IrBinOp::Shl | IrBinOp::Shr => self.emit_shift(op, dst_v, l, r),
            _ => self.emit_simple_binop(op, dst_v, l, r),
        }
    }

    fn emit_simple_binop(&mut self, op: IrBinOp, dst_v: VRegId, l: VRegId, r: VRegId) {
        let vt = self.func_ir.vregs[dst_v].vtype;
        let size = vt.size.max(4);
        let mnemonic = match op {
            IrBinOp::Add => "add",
            IrBinOp::Sub => "sub",
            IrBinOp::Mul => "imul",
            IrBinOp::BitAnd => "and",
            IrBinOp::BitOr => "or",
            IrBinOp::BitXor => "xor",
            _ => unreachable!(),
        };
        let commutative = matches!(
            op,
            IrBinOp::Add | IrBinOp::Mul | IrBinOp::BitAnd | IrBinOp::BitOr | IrBinOp::BitXor
        );
        let dst_phys = self.phys_of(dst_v);
        let dst = self.reg_of(dst_v, size);

        if !self.is_const(l) && self.phys_of(l) == dst_phys {
            let opr = self.arith_operand(r, size);
            let line = format!("{} {}, {}", mnemonic, opr, dst);
            self.backend.line(&line);
        } else if !self.is_const(r) && self.phys_of(r) == dst_phys {
            if commutative {
                let opr = self.arith_operand(l, size);
                let line = format!("{} {}, {}", mnemonic, opr, dst);
                self.backend.line(&line);
            } else {
                // dst aliases the right operand: go through scratch.
                let scratch = scratch_name(size);
                if self.is_const(l) {
                    let value = self.const_value(l);
                    self.mov_imm(value, scratch, size);
                } else {
                    let line = format!("mov {}, {}", self.operand(l, size), scratch);
                    self.backend.line(&line);
                }
                let line = format!("{} {}, {}", mnemonic, self.operand(r, size), scratch);
                self.backend.line(&line);
                let line = format!("mov {}, {}", scratch, dst);
                self.backend.line(&line);
            }
        } else {
            if self.is_const(l) {
                let value = self.const_value(l);
                self.mov_imm(value, &dst, size);
            } else {
                let line = format!("mov {}, {}", self.operand(l, size), dst);
                self.backend.line(&line);
            }
            let opr = self.arith_operand(r, size);
            let line = format!("{} {}, {}", mnemonic, opr, dst);
            self.backend.line(&line);
        }
    }

    fn emit_divmod(&mut self, op: IrBinOp, dst_v: VRegId, l: VRegId, r: VRegId) {
        let vt = self.func_ir.vregs[dst_v].vtype;
        let size = vt.size.max(4);
        let (ax, dx) = if size <= 4 {
            ("%eax", "%edx")
        } else {
            ("%rax", "%rdx")
        };

        let line = format!("mov {}, {}", self.operand(l, size), ax);
        self.backend.line(&line);

        let divisor = if self.is_const(r) {
            let scratch = scratch_name(size);
            let value = self.const_value(r);
            self.mov_imm(value, scratch, size);
            scratch.to_string()
        } else {
            self.reg_of(r, size)
        };

        if vt.unsigned {
            let line = format!("xor {}, {}", dx, dx);
            self.backend.line(&line);
            let line = format!("div {}", divisor);
            self.backend.line(&line);
        } else {
            self.backend.line(if size <= 4 { "cltd" } else { "cqto" });
            let line = format!("idiv {}", divisor);
            self.backend.line(&line);
        }

        let result = if op == IrBinOp::Div { ax } else { dx };
        let line = format!("mov {}, {}", result, self.reg_of(dst_v, size));
        self.backend.line(&line);
    }

    fn emit_shift(&mut self, op: IrBinOp, dst_v: VRegId, l: VRegId, r: VRegId) {
        let vt = self.func_ir.vregs[dst_v].vtype;
        let size = vt.size.max(4);
        let mnemonic = match (op, vt.unsigned) {
            (IrBinOp::Shl, _) => "shl",
            (IrBinOp::Shr, true) => "shr",
            (IrBinOp::Shr, false) => "sar",
            _ => unreachable!(),
        };

        if self.is_const(r) {
            let dst_phys = self.phys_of(dst_v);
            let dst = self.reg_of(dst_v, size);
            if self.is_const(l) || self.phys_of(l) != dst_phys {
                let line = format!("mov {}, {}", self.operand(l, size), dst);
                self.backend.line(&line);
            }
            let line = format!("{} ${}, {}", mnemonic, self.const_value(r) & 63, dst);
            self.backend.line(&line);
            return;
        }

        // A variable count must live in %cl. The value shifts in %r11 so
        // neither the count's register nor a value parked in %rcx can be
        // clobbered mid-sequence.
        let dst_is_rcx = self.phys_of(dst_v) == Some(RCX_ALLOC_INDEX);
        let count_in_rcx = self.phys_of(r) == Some(RCX_ALLOC_INDEX);
        let work = scratch_name(size);

        let line = format!("mov {}, {}", self.operand(l, size), work);
        self.backend.line(&line);
        if !count_in_rcx {
            if !dst_is_rcx {
                self.backend.line("push %rcx");
            }
            let line = format!("mov {}, %ecx", self.operand(r, 4));
            self.backend.line(&line);
        }
        let line = format!("{} %cl, {}", mnemonic, work);
        self.backend.line(&line);
        if !count_in_rcx && !dst_is_rcx {
            self.backend.line("pop %rcx");
        }
        let line = format!("mov {}, {}", work, self.reg_of(dst_v, size));
        self.backend.line(&line);
    }

    fn emit_float_binop(&mut self, op: IrBinOp, dst_v: VRegId, l: VRegId, r: VRegId) {
        let vt = self.func_ir.vregs[dst_v].vtype;
        let suffix = if vt.size == 4 { "ss" } else { "sd" };
        let mnemonic = match op {
            IrBinOp::Add => "add",
            IrBinOp::Sub => "sub",
            IrBinOp::Mul => "mul",
            IrBinOp::Div => "div",
            _ => unreachable!("integer-only operator on floats"),
        };
        let dst_phys = self.phys_of(dst_v);
        let dst = self.reg_of(dst_v, vt.size);
        let commutative = matches!(op, IrBinOp::Add | IrBinOp::Mul);

        if self.phys_of(l) == dst_phys {
            let line = format!("{}{} {}, {}", mnemonic, suffix, self.reg_of(r, vt.size), dst);
            self.backend.line(&line);
        } else if self.phys_of(r) == dst_phys {
            if commutative {
                let line =
                    format!("{}{} {}, {}", mnemonic, suffix, self.reg_of(l, vt.size), dst);
                self.backend.line(&line);
            } else {
                let mov = if vt.size == 4 { "movss" } else { "movsd" };
                let line = format!("{} {}, %xmm15", mov, self.reg_of(l, vt.size));
                self.backend.line(&line);
                let line =
                    format!("{}{} {}, %xmm15", mnemonic, suffix, self.reg_of(r, vt.size));
                self.backend.line(&line);
                let line = format!("{} %xmm15, {}", mov, dst);
                self.backend.line(&line);
            }
        } else {
            let mov = if vt.size == 4 { "movss" } else { "movsd" };
            let line = format!("{} {}, {}", mov, self.reg_of(l, vt.size), dst);
            self.backend.line(&line);
            let line = format!("{}{} {}, {}", mnemonic, suffix, self.reg_of(r, vt.size), dst);
            self.backend.line(&line);
        }
    }

    fn emit_unop(&mut self, op: IrUnOp, ir: &Ir) {
        let dst_v = ir.dst.unwrap();
        let src_v = ir.opr1.unwrap();
        let vt = self.func_ir.vregs[dst_v].vtype;

        if vt.flonum {
            let mov = if vt.size == 4 { "movss" } else { "movsd" };
            let mask = if vt.size == 4 {
                self.backend.need_neg_mask32 = true;
                ".LC.negmask32"
            } else {
                self.backend.need_neg_mask64 = true;
                ".LC.negmask64"
            };
            let xor = if vt.size == 4 { "xorps" } else { "xorpd" };
            let dst = self.reg_of(dst_v, vt.size);
            if self.phys_of(src_v) != self.phys_of(dst_v) {
                let line = format!("{} {}, {}", mov, self.reg_of(src_v, vt.size), dst);
                self.backend.line(&line);
            }
            let line = format!("{} {}(%rip), {}", xor, mask, dst);
            self.backend.line(&line);
            return;
        }

        let size = vt.size.max(4);
        let dst = self.reg_of(dst_v, size);
        if self.is_const(src_v) {
            let value = self.const_value(src_v);
            self.mov_imm(value, &dst, size);
        } else if self.phys_of(src_v) != self.phys_of(dst_v) {
            let line = format!("mov {}, {}", self.operand(src_v, size), dst);
            self.backend.line(&line);
        }
        let mnemonic = match op {
            IrUnOp::Neg => "neg",
            IrUnOp::BitNot => "not",
        };
        let line = format!("{} {}", mnemonic, dst);
        self.backend.line(&line);
    }

    fn emit_cmp(&mut self, ir: &Ir) {
        let l = ir.opr1.unwrap();
        let r = ir.opr2.unwrap();
        let lt = self.func_ir.vregs[l].vtype;
        let size = lt.size.max(4);

        if lt.flonum {
            let op = if lt.size == 4 { "ucomiss" } else { "ucomisd" };
            let line = format!(
                "{} {}, {}",
                op,
                self.reg_of(r, lt.size),
                self.reg_of(l, lt.size)
            );
            self.backend.line(&line);
            return;
        }

        let left = if self.is_const(l) {
            // Both-const comparisons were folded; a remaining constant
            // left side goes through scratch.
            let scratch = scratch_name(size);
            let value = self.const_value(l);
            self.mov_imm(value, scratch, size);
            scratch.to_string()
        } else {
            self.reg_of(l, size)
        };
        let opr = self.arith_operand(r, size);
        let line = format!("cmp {}, {}", opr, left);
        self.backend.line(&line);
    }

    fn emit_setcc(&mut self, cc: CondCode, ir: &Ir) {
        let dst_v = ir.dst.unwrap();
        match cc.kind {
            CondKind::Any | CondKind::None => {
                let value = if cc.kind == CondKind::Any { 1 } else { 0 };
                let line = format!("movl ${}, {}", value, self.reg_of(dst_v, 4));
                self.backend.line(&line);
            }
            _ => {
                let line = format!("set{} %al", cc_suffix(cc));
                self.backend.line(&line);
                let line = format!("movzbl %al, {}", self.reg_of(dst_v, 4));
                self.backend.line(&line);
            }
        }
    }

    fn emit_table_jmp(
        &mut self,
        name: &str,
        ir: &Ir,
        table: &[crate::ids::BBId],
        min: i64,
        default: crate::ids::BBId,
    ) {
        let v = ir.opr1.unwrap();
        let vt = self.func_ir.vregs[v].vtype;
        // Widen the index into scratch.
        if vt.size <= 4 {
            let line = format!("movslq {}, %r11", self.reg_of(v, 4));
            self.backend.line(&line);
        } else {
            let line = format!("mov {}, %r11", self.reg_of(v, 8));
            self.backend.line(&line);
        }
        if min != 0 {
            let line = format!("sub ${}, %r11", min);
            self.backend.line(&line);
        }
        let line = format!("cmp ${}, %r11", table.len());
        self.backend.line(&line);
        let line = format!("jae {}", self.bb_label(name, default));
        self.backend.line(&line);
        let table_label = format!(".Ltab.{}.{}", name, self.table_count);
        self.table_count += 1;
        let line = format!("lea {}(%rip), %rax", table_label);
        self.backend.line(&line);
        self.backend.line("jmp *(%rax,%r11,8)");

        // The table itself goes to .rodata right away.
        self.backend.out.push_str("\t.section .rodata\n");
        self.backend.align(8);
        self.backend.label(&table_label);
        for &bb in table {
            let entry = format!("\t.quad {}\n", self.bb_label(name, bb));
            self.backend.out.push_str(&entry);
        }
        self.backend.out.push_str("\t.text\n");
    }

    fn emit_cast(&mut self, ir: &Ir) {
        let dst_v = ir.dst.unwrap();
        let src_v = ir.opr1.unwrap();
        let dt = self.func_ir.vregs[dst_v].vtype;
        let st = self.func_ir.vregs[src_v].vtype;

        match (st.flonum, dt.flonum) {
            (false, false) => self.emit_int_cast(dst_v, src_v),
            (false, true) => {
                // Integer to float: widen the source to at least 32 bits
                // through scratch first.
                let (int_src, int_size) = if st.size < 4 {
                    let ext = if st.unsigned { "movzb" } else { "movsb" };
                    let ext = if st.size == 2 {
                        if st.unsigned { "movzw" } else { "movsw" }
                    } else {
                        ext
                    };
                    let line = format!("{}l {}, %eax", ext, self.reg_of(src_v, st.size));
                    self.backend.line(&line);
                    ("%eax".to_string(), 4)
                } else if st.size == 4 && st.unsigned {
                    // Zero-extend into 64 bits so the signed convert is
                    // exact.
                    let line = format!("mov {}, %eax", self.reg_of(src_v, 4));
                    self.backend.line(&line);
                    ("%rax".to_string(), 8)
                } else {
                    (self.reg_of(src_v, st.size), st.size)
                };
                let cvt = if dt.size == 4 { "cvtsi2ss" } else { "cvtsi2sd" };
                let q = if int_size == 8 { "q" } else { "l" };
                let line = format!("{}{} {}, {}", cvt, q, int_src, self.reg_of(dst_v, dt.size));
                self.backend.line(&line);
            }
            (true, false) => {
                let cvt = if st.size == 4 { "cvttss2si" } else { "cvttsd2si" };
                let out_size = dt.size.max(4);
                let line = format!(
                    "{} {}, {}",
                    cvt,
                    self.reg_of(src_v, st.size),
                    self.reg_of(dst_v, out_size)
                );
                self.backend.line(&line);
            }
            (true, true) => {
                let cvt = if st.size == 4 {
                    "cvtss2sd"
                } else {
                    "cvtsd2ss"
                };
                let line = format!(
                    "{} {}, {}",
                    cvt,
                    self.reg_of(src_v, st.size),
                    self.reg_of(dst_v, dt.size)
                );
                self.backend.line(&line);
            }
        }
    }

    fn emit_int_cast(&mut self, dst_v: VRegId, src_v: VRegId) {
        let dt = self.func_ir.vregs[dst_v].vtype;
        let st = self.func_ir.vregs[src_v].vtype;

        if self.is_const(src_v) {
            let size = dt.size.max(4);
            let dst = self.reg_of(dst_v, size);
            let value = self.const_value(src_v);
            self.mov_imm(value, &dst, size);
            return;
        }

        if dt.size <= st.size {
            // Shrinking: move the low part.
            let size = dt.size.max(4);
            let src = self.reg_of(src_v, size);
            let dst = self.reg_of(dst_v, size);
            if src != dst {
                let line = format!("mov {}, {}", src, dst);
                self.backend.line(&line);
            }
            return;
        }

        // Widening: the source's signedness picks the extension.
        let ext = match (st.size, st.unsigned) {
            (1, false) => "movsb",
            (1, true) => "movzb",
            (2, false) => "movsw",
            (2, true) => "movzw",
            (4, false) => "movsl",
            (4, true) => "",
            _ => "",
        };
        let src = self.reg_of(src_v, st.size);
        if ext.is_empty() {
            // 32-to-64 unsigned: a 32-bit move zero-extends.
            let line = format!("mov {}, {}", self.reg_of(src_v, 4), self.reg_of(dst_v, 4));
            self.backend.line(&line);
        } else if st.size == 4 {
            let line = format!("movslq {}, {}", src, self.reg_of(dst_v, 8));
            self.backend.line(&line);
        } else {
            let wide = if dt.size == 8 { "q" } else { "l" };
            let line = format!("{}{} {}, {}", ext, wide, src, self.reg_of(dst_v, dt.size));
            self.backend.line(&line);
        }
    }

    fn emit_push_arg(&mut self, ir: &Ir, index: usize, stack_offset: Option<usize>) {
        let v = ir.opr1.unwrap();
        let vt = self.func_ir.vregs[v].vtype;

        match stack_offset {
            Some(off) => {
                if vt.flonum {
                    let op = if vt.size == 4 { "movss" } else { "movsd" };
                    let line = format!("{} {}, {}(%rsp)", op, self.reg_of(v, vt.size), off);
                    self.backend.line(&line);
                } else if self.is_const(v) {
                    let value = self.const_value(v);
                    if imm_fits_i32(value) {
                        let line = format!("movq ${}, {}(%rsp)", value, off);
                        self.backend.line(&line);
                    } else {
                        let line = format!("movabs ${}, %r11", value);
                        self.backend.line(&line);
                        let line = format!("mov %r11, {}(%rsp)", off);
                        self.backend.line(&line);
                    }
                } else {
                    let line = format!("mov {}, {}(%rsp)", self.reg_of(v, 8), off);
                    self.backend.line(&line);
                }
            }
            None => {
                if vt.flonum {
                    let op = if vt.size == 4 { "movss" } else { "movsd" };
                    let phys = self.phys_of(v);
                    if phys != Some(index) {
                        let line =
                            format!("{} {}, %xmm{}", op, self.reg_of(v, vt.size), index);
                        self.backend.line(&line);
                    }
                } else if self.is_const(v) {
                    let value = self.const_value(v);
                    self.mov_imm(value, ARG64[index], 8);
                } else {
                    let same = self.phys_of(v) == Some(REG_PARAM_MAP[index])
                        && REG_PARAM_MAP[index] != NO_PHYS;
                    if !same {
                        let (src, dst) = if vt.size <= 4 {
                            (self.reg_of(v, 4), ARG32[index])
                        } else {
                            (self.reg_of(v, 8), ARG64[index])
                        };
                        let line = format!("mov {}, {}", src, dst);
                        self.backend.line(&line);
                    }
                }
            }
        }
    }

    fn emit_call(&mut self, ir: &Ir, label: Option<Name>) {
        match label {
            Some(name) => {
                let sym = self.symbol_for(name);
                let line = format!("call {}", sym);
                self.backend.line(&line);
            }
            None => {
                let target = self.reg_of(ir.opr1.unwrap(), 8);
                let line = format!("call *{}", target);
                self.backend.line(&line);
            }
        }
        if let Some(dst_v) = ir.dst {
            let vt = self.func_ir.vregs[dst_v].vtype;
            if vt.flonum {
                let op = if vt.size == 4 { "movss" } else { "movsd" };
                if self.phys_of(dst_v) != Some(0) {
                    let line = format!("{} %xmm0, {}", op, self.reg_of(dst_v, vt.size));
                    self.backend.line(&line);
                }
            } else {
                let (src, size) = if vt.size <= 4 {
                    ("%eax", 4)
                } else {
                    ("%rax", 8)
                };
                let line = format!("mov {}, {}", src, self.reg_of(dst_v, size));
                self.backend.line(&line);
            }
        }
    }

    fn emit_result(&mut self, ir: &Ir) {
        let v = ir.opr1.unwrap();
        let vt = self.func_ir.vregs[v].vtype;
        if vt.flonum {
            let op = if vt.size == 4 { "movss" } else { "movsd" };
            if self.phys_of(v) != Some(0) {
                let line = format!("{} {}, %xmm0", op, self.reg_of(v, vt.size));
                self.backend.line(&line);
            }
            return;
        }
        let (dst, size) = if vt.size <= 4 { ("%eax", 4) } else { ("%rax", 8) };
        if self.is_const(v) {
            let value = self.const_value(v);
            self.mov_imm(value, dst, size);
        } else {
            let line = format!("mov {}, {}", self.operand(v, size), dst);
            self.backend.line(&line);
        }
    }

    /// Per-function literal pool: pooled float constants.
    fn literals(&mut self, name: &str) {
        if self.func_ir.float_consts.is_empty() {
            return;
        }
        self.backend.out.push_str("\t.section .rodata\n");
        for (i, &(bits, single)) in self.func_ir.float_consts.iter().enumerate() {
            let label = float_label(name, i);
            if single {
                self.backend.align(4);
                let _ = writeln!(self.backend.out, "{}:\n\t.long {}", label, bits as u32);
            } else {
                self.backend.align(8);
                let _ = writeln!(self.backend.out, "{}:\n\t.quad {}", label, bits);
            }
        }
        self.backend.out.push_str("\t.text\n");
    }
}

fn reg_name(phys: usize, size: usize) -> &'static str {
    match size {
        1 => REG8[phys],
        2 => REG16[phys],
        4 => REG32[phys],
        _ => REG64[phys],
    }
}

fn scratch_name(size: usize) -> &'static str {
    if size <= 4 {
        "%r11d"
    } else {
        "%r11"
    }
}

fn imm_fits_i32(value: i64) -> bool {
    value >= i32::MIN as i64 && value <= i32::MAX as i64
}

fn size_suffix(size: usize) -> &'static str {
    match size {
        1 => "b",
        2 => "w",
        4 => "l",
        _ => "q",
    }
}

/// Condition-code suffix; unsigned and floating comparisons use the
/// carry-flag family.
fn cc_suffix(cc: CondCode) -> &'static str {
    let unsigned_like = cc.unsigned || cc.flonum;
    match (cc.kind, unsigned_like) {
        (CondKind::Eq, _) => "e",
        (CondKind::Ne, _) => "ne",
        (CondKind::Lt, false) => "l",
        (CondKind::Le, false) => "le",
        (CondKind::Ge, false) => "ge",
        (CondKind::Gt, false) => "g",
        (CondKind::Lt, true) => "b",
        (CondKind::Le, true) => "be",
        (CondKind::Ge, true) => "ae",
        (CondKind::Gt, true) => "a",
        (CondKind::Any, _) | (CondKind::None, _) => unreachable!("handled by the caller"),
    }
}
