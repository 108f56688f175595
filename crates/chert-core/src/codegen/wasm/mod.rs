//! WebAssembly backend: a distinct code path that lowers the AST
//! directly into a binary module, bypassing the IR and register
//! allocator.
//!
//! Section buffers are assembled in memory with counts and sizes
//! inserted at the front once each body is complete, then written in
//! canonical section-id order behind the magic/version header.

pub mod gen;
pub mod leb128;

use std::collections::HashMap;

use crate::context::CompilerContext;
use crate::ids::ScopeId;
use crate::interner::Name;
use crate::scope::{GlobalInit, Storage};
use crate::syntax::ast::Function;
use crate::traverse::ProgramIndex;
use crate::types::{FlonumKind, Ty, TyKind, TypeInterner, Qualifiers};

use super::{Backend, CodegenError};
use leb128::DataBuf;

/// Imported functions live under this fixed module name.
const IMPORT_MODULE_NAME: &str = "c";

/// Section ids, in canonical order.
mod sec {
    pub const TYPE: u8 = 1;
    pub const IMPORT: u8 = 2;
    pub const FUNC: u8 = 3;
    pub const GLOBAL: u8 = 6;
    pub const EXPORT: u8 = 7;
    pub const CODE: u8 = 10;
}

/// Value types.
pub(crate) mod wt {
    pub const VOID: u8 = 0x40;
    pub const F64: u8 = 0x7c;
    pub const F32: u8 = 0x7d;
    pub const I64: u8 = 0x7e;
    pub const I32: u8 = 0x7f;
    pub const FUNC: u8 = 0x60;
}

/// Opcodes used by the emitter.
pub(crate) mod op {
    pub const BLOCK: u8 = 0x02;
    pub const LOOP: u8 = 0x03;
    pub const IF: u8 = 0x04;
    pub const ELSE: u8 = 0x05;
    pub const END: u8 = 0x0b;
    pub const BR: u8 = 0x0c;
    pub const BR_IF: u8 = 0x0d;
    pub const CALL: u8 = 0x10;
    pub const DROP: u8 = 0x1a;

    pub const LOCAL_GET: u8 = 0x20;
    pub const LOCAL_SET: u8 = 0x21;
    pub const LOCAL_TEE: u8 = 0x22;
    pub const GLOBAL_GET: u8 = 0x23;
    pub const GLOBAL_SET: u8 = 0x24;

    pub const I32_CONST: u8 = 0x41;
    pub const I64_CONST: u8 = 0x42;
    pub const F32_CONST: u8 = 0x43;
    pub const F64_CONST: u8 = 0x44;

    pub const I32_EQZ: u8 = 0x45;
    pub const I64_EQZ: u8 = 0x50;
}

/// Classify a scalar type for the wasm value stack.
pub(crate) fn to_wtype(types: &TypeInterner, ty: Ty) -> Result<u8, CodegenError> {
    match types.kind(ty) {
        TyKind::Fixnum { .. } => Ok(if types.size_of(ty) <= 4 {
            wt::I32
        } else {
            wt::I64
        }),
        TyKind::Flonum(FlonumKind::Float) => Ok(wt::F32),
        TyKind::Flonum(FlonumKind::Double) => Ok(wt::F64),
        _ => Err(CodegenError::unsupported(
            "only integer and floating-point values are supported on the wasm32 backend",
            None,
        )),
    }
}

/// The WebAssembly backend.
pub struct WasmBackend {
    exports: Vec<Name>,
    codes: HashMap<Name, DataBuf>,
    emitted_globals: Vec<(ScopeId, usize)>,
    globals_ready: bool,
}

impl WasmBackend {
    pub fn new(exports: Vec<Name>) -> Self {
        Self {
            exports,
            codes: HashMap::new(),
            emitted_globals: Vec::new(),
            globals_ready: false,
        }
    }

    /// Assign dense global indices in declaration order.
    fn ensure_globals(
        &mut self,
        ctx: &mut CompilerContext,
        index: &ProgramIndex,
    ) -> Result<(), CodegenError> {
        if self.globals_ready {
            return Ok(());
        }
        let mut next = 0u32;
        for &(scope, var_idx) in &index.globals {
            let var = ctx.var(scope, var_idx);
            if var.storage.contains(Storage::EXTERN) {
                return Err(CodegenError::unsupported(
                    format!(
                        "extern global `{}` is not supported on the wasm32 backend",
                        ctx.str(var.name)
                    ),
                    None,
                ));
            }
            to_wtype(&ctx.types, var.ty)?;
            ctx.var_mut(scope, var_idx).local.wasm_index = Some(next);
            next += 1;
            self.emitted_globals.push((scope, var_idx));
        }
        self.globals_ready = true;
        Ok(())
    }
}

impl Backend for WasmBackend {
    fn lower_function(
        &mut self,
        ctx: &mut CompilerContext,
        index: &ProgramIndex,
        func: &Function,
    ) -> Result<(), CodegenError> {
        self.ensure_globals(ctx, index)?;
        let referenced = index
            .funcs
            .get(func.name)
            .map_or(false, |info| info.referenced);
        if !referenced {
            return Ok(());
        }
        let code = gen::gen_function(ctx, index, func)?;
        self.codes.insert(func.name, code);
        Ok(())
    }

    fn finalize(
        &mut self,
        ctx: &mut CompilerContext,
        index: &ProgramIndex,
    ) -> Result<Vec<u8>, CodegenError> {
        self.ensure_globals(ctx, index)?;

        // Type section: deduplicated signatures in first-encounter order.
        let mut types_section = DataBuf::new();
        for &sig in &index.signatures {
            let TyKind::Func { ret, params, vararg } = ctx.types.kind(sig).clone() else {
                unreachable!("non-function signature");
            };
            if vararg {
                return Err(CodegenError::unsupported(
                    "varargs are not supported on the wasm32 backend",
                    None,
                ));
            }
            types_section.push(wt::FUNC);
            types_section.uleb128(params.len() as u64);
            for p in params {
                types_section.push(to_wtype(&ctx.types, p)?);
            }
            if ret == Ty::VOID {
                types_section.uleb128(0);
            } else {
                types_section.uleb128(1);
                types_section.push(to_wtype(&ctx.types, ret)?);
            }
        }
        types_section.uleb128_at(0, index.signatures.len() as u64);

        // Import section: referenced but undefined functions, first
        // block of function indices.
        let mut imports_section = DataBuf::new();
        let mut imports_count = 0u64;
        for (name, info) in index.funcs.iter() {
            if !info.referenced || info.defined {
                continue;
            }
            imports_section.name(IMPORT_MODULE_NAME);
            imports_section.name(&ctx.str(name));
            imports_section.uleb128(0);
            imports_section.uleb128(info.type_index as u64);
            imports_count += 1;
        }
        if imports_count > 0 {
            imports_section.uleb128_at(0, imports_count);
        }

        // Function section: each local function's type index.
        let mut functions_section = DataBuf::new();
        let mut function_count = 0u64;
        for (_, info) in index.defined_referenced() {
            functions_section.uleb128(info.type_index as u64);
            function_count += 1;
        }
        functions_section.uleb128_at(0, function_count);

        // Global section: one entry per global scalar; mutability from
        // const-ness.
        let mut globals_section = DataBuf::new();
        let globals_count = self.emitted_globals.len() as u64;
        for &(scope, var_idx) in &self.emitted_globals {
            let var = ctx.var(scope, var_idx);
            let wtype = to_wtype(&ctx.types, var.ty)?;
            globals_section.push(wtype);
            globals_section.push(u8::from(!var.qual.contains(Qualifiers::CONST)));
            match (wtype, var.init) {
                (wt::I32, init) => {
                    globals_section.push(op::I32_CONST);
                    globals_section.sleb128(init_fixnum(init));
                }
                (wt::I64, init) => {
                    globals_section.push(op::I64_CONST);
                    globals_section.sleb128(init_fixnum(init));
                }
                (wt::F32, init) => {
                    globals_section.push(op::F32_CONST);
                    globals_section.append(&(init_flonum(init) as f32).to_le_bytes());
                }
                (_, init) => {
                    globals_section.push(op::F64_CONST);
                    globals_section.append(&init_flonum(init).to_le_bytes());
                }
            }
            globals_section.push(op::END);
        }
        if globals_count > 0 {
            globals_section.uleb128_at(0, globals_count);
        }

        // Export section, all of function kind.
        let mut exports_section = DataBuf::new();
        exports_section.uleb128(self.exports.len() as u64);
        for &name in &self.exports {
            let info = index
                .funcs
                .get(name)
                .expect("export validated by the traverser");
            exports_section.name(&ctx.str(name));
            exports_section.uleb128(0);
            exports_section.uleb128(info.index as u64);
        }

        // Code section: per-function size-prefixed bodies in index
        // order.
        let mut code_section = DataBuf::new();
        code_section.uleb128(function_count);
        for (name, _) in index.defined_referenced() {
            let code = self
                .codes
                .get(&name)
                .expect("referenced function was not lowered");
            code_section.concat(code);
        }

        // Module assembly: header, then sections in canonical id order.
        let mut out = DataBuf::new();
        out.append(b"\0asm");
        out.append(&[0x01, 0x00, 0x00, 0x00]);
        write_section(&mut out, sec::TYPE, &types_section);
        if imports_count > 0 {
            write_section(&mut out, sec::IMPORT, &imports_section);
        }
        write_section(&mut out, sec::FUNC, &functions_section);
        if globals_count > 0 {
            write_section(&mut out, sec::GLOBAL, &globals_section);
        }
        write_section(&mut out, sec::EXPORT, &exports_section);
        write_section(&mut out, sec::CODE, &code_section);
        Ok(out.into_vec())
    }
}

fn write_section(out: &mut DataBuf, id: u8, body: &DataBuf) {
    out.push(id);
    out.uleb128(body.len() as u64);
    out.concat(body);
}

fn init_fixnum(init: Option<GlobalInit>) -> i64 {
    match init {
        Some(GlobalInit::Fixnum(v)) => v,
        Some(GlobalInit::Flonum(v)) => v as i64,
        None => 0,
    }
}

fn init_flonum(init: Option<GlobalInit>) -> f64 {
    match init {
        Some(GlobalInit::Flonum(v)) => v,
        Some(GlobalInit::Fixnum(v)) => v as f64,
        None => 0.0,
    }
}
