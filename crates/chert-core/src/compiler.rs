//! Main compiler driver.
//!
//! Runs one translation unit through the pipeline:
//! tokenize → parse/analyze → traverse → backend lowering → module
//! bytes. Lexical errors are fatal; semantic errors accumulate and
//! suppress code generation.

use std::path::Path;

use tracing::debug;

use crate::codegen::wasm::WasmBackend;
use crate::codegen::x86_64::NativeBackend;
use crate::codegen::{Backend, CodegenError};
use crate::context::CompilerContext;
use crate::diagnostic::Diagnostic;
use crate::interner::Name;
use crate::syntax::ast::{Declaration, Program};
use crate::syntax::{parse_into, tokenize};
use crate::traverse::{traverse, EmitRoots};
use crate::types::TargetSizes;

/// Emission target.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Target {
    X86_64,
    Wasm32,
}

impl Target {
    pub fn sizes(self) -> TargetSizes {
        match self {
            Target::X86_64 => TargetSizes::lp64(),
            Target::Wasm32 => TargetSizes::wasm32(),
        }
    }

    /// Default output file name.
    pub fn default_output(self) -> &'static str {
        match self {
            Target::X86_64 => "a.s",
            Target::Wasm32 => "a.wasm",
        }
    }
}

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// One or more diagnostics were reported; codegen was skipped.
    #[error("compilation failed with {count} error(s)")]
    Failed { count: usize },
    #[error("no exported symbols (the wasm32 backend requires -e)")]
    NoExports,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Compiler instance: owns the context and the accumulated translation
/// unit.
pub struct Compiler {
    ctx: CompilerContext,
    program: Program,
    target: Target,
}

impl Compiler {
    pub fn new(target: Target) -> Self {
        Self {
            ctx: CompilerContext::new(target.sizes()),
            program: Program::default(),
            target,
        }
    }

    pub fn context(&self) -> &CompilerContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut CompilerContext {
        &mut self.ctx
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// Load and parse one source file, accumulating declarations.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> CompileResult<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let source = self.ctx.source_map.add_file(path, content.clone());
        debug!(file = %path.display(), "parsing");
        self.ingest(source, &content)
    }

    /// Parse a source string (standard input or a test snippet).
    pub fn parse_source(&mut self, content: &str) -> CompileResult<()> {
        let source = self.ctx.source_map.add_inline(content);
        self.ingest(source, content)
    }

    fn ingest(
        &mut self,
        source: crate::source::SourceId,
        content: &str,
    ) -> CompileResult<()> {
        let tokens = match tokenize(content, source, &self.ctx.interner) {
            Ok(tokens) => tokens,
            Err(err) => {
                // Lexical errors abort the translation unit.
                let span = err.span();
                self.ctx.error(span, err.to_string());
                return Err(self.failed());
            }
        };
        debug!(tokens = tokens.len(), "tokenized");
        parse_into(&mut self.ctx, tokens, &mut self.program);
        Ok(())
    }

    fn failed(&self) -> CompileError {
        CompileError::Failed {
            count: self.ctx.diagnostics.error_count().max(1),
        }
    }

    /// Run traversal and the selected backend, producing the output
    /// module bytes. `exports` is consulted by the wasm32 backend only.
    pub fn compile(&mut self, exports: &[String]) -> CompileResult<Vec<u8>> {
        if self.ctx.has_errors() {
            return Err(self.failed());
        }

        let export_names: Vec<Name> = exports.iter().map(|e| self.ctx.intern(e)).collect();
        let roots = match self.target {
            Target::X86_64 => EmitRoots::AllDefined,
            Target::Wasm32 => {
                if export_names.is_empty() {
                    return Err(CompileError::NoExports);
                }
                EmitRoots::Exports(&export_names)
            }
        };
        let index = traverse(&mut self.ctx, &self.program, roots);
        if self.ctx.has_errors() {
            return Err(self.failed());
        }

        let mut backend: Box<dyn Backend> = match self.target {
            Target::X86_64 => Box::new(NativeBackend::new()),
            Target::Wasm32 => Box::new(WasmBackend::new(export_names)),
        };

        for decl in &self.program.decls {
            let Declaration::Func(func) = decl else {
                continue;
            };
            debug!(function = %self.ctx.str(func.name), "lowering");
            if let Err(err) = backend.lower_function(&mut self.ctx, &index, func) {
                report_codegen_error(&mut self.ctx, err);
            }
        }
        if self.ctx.has_errors() {
            return Err(self.failed());
        }

        let bytes = match backend.finalize(&mut self.ctx, &index) {
            Ok(bytes) => bytes,
            Err(err) => {
                report_codegen_error(&mut self.ctx, err);
                return Err(self.failed());
            }
        };
        debug!(bytes = bytes.len(), "emitted");
        Ok(bytes)
    }

    pub fn has_errors(&self) -> bool {
        self.ctx.has_errors()
    }

    pub fn render_diagnostics(&self) -> String {
        self.ctx.render_diagnostics()
    }
}

fn report_codegen_error(ctx: &mut CompilerContext, err: CodegenError) {
    let message = err.to_string();
    match err.span() {
        Some(span) => ctx.error(span, message),
        None => ctx.diagnostics.push(Diagnostic::error(message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wasmtime::{Engine, Instance, Module, Store};

    fn compile_wasm(src: &str, exports: &[&str]) -> Vec<u8> {
        let mut compiler = Compiler::new(Target::Wasm32);
        compiler.parse_source(src).expect("lex error");
        let exports: Vec<String> = exports.iter().map(|s| s.to_string()).collect();
        match compiler.compile(&exports) {
            Ok(bytes) => bytes,
            Err(err) => panic!("{err}\n{}", compiler.render_diagnostics()),
        }
    }

    fn compile_native(src: &str) -> String {
        let mut compiler = Compiler::new(Target::X86_64);
        compiler.parse_source(src).expect("lex error");
        match compiler.compile(&[]) {
            Ok(bytes) => String::from_utf8(bytes).unwrap(),
            Err(err) => panic!("{err}\n{}", compiler.render_diagnostics()),
        }
    }

    fn instantiate(bytes: &[u8]) -> (Store<()>, Instance) {
        let engine = Engine::default();
        let module = Module::new(&engine, bytes).expect("module failed validation");
        let mut store = Store::new(&engine, ());
        let instance = Instance::new(&mut store, &module, &[]).expect("instantiation failed");
        (store, instance)
    }

    /// Decode the entry count of one section, if present.
    fn section_entry_count(bytes: &[u8], wanted_id: u8) -> Option<u64> {
        fn uleb(bytes: &[u8], pos: &mut usize) -> u64 {
            let mut value = 0u64;
            let mut shift = 0;
            loop {
                let b = bytes[*pos];
                *pos += 1;
                value |= ((b & 0x7f) as u64) << shift;
                if b & 0x80 == 0 {
                    return value;
                }
                shift += 7;
            }
        }
        let mut pos = 8;
        while pos < bytes.len() {
            let id = bytes[pos];
            pos += 1;
            let size = uleb(bytes, &mut pos) as usize;
            if id == wanted_id {
                let mut body_pos = pos;
                return Some(uleb(bytes, &mut body_pos));
            }
            pos += size;
        }
        None
    }

    #[test]
    fn test_wasm_add_one() {
        let bytes = compile_wasm("int f(int x) { return x + 1; }", &["f"]);
        // One local function with signature (i32) -> i32, exported as f.
        assert_eq!(section_entry_count(&bytes, 1), Some(1));
        assert_eq!(section_entry_count(&bytes, 3), Some(1));
        assert_eq!(section_entry_count(&bytes, 10), Some(1));

        let (mut store, instance) = instantiate(&bytes);
        let f = instance
            .get_typed_func::<i32, i32>(&mut store, "f")
            .unwrap();
        assert_eq!(f.call(&mut store, 41).unwrap(), 42);
    }

    #[test]
    fn test_wasm_fib_recursion() {
        let bytes = compile_wasm(
            "int fib(int n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }",
            &["fib"],
        );
        let (mut store, instance) = instantiate(&bytes);
        let fib = instance
            .get_typed_func::<i32, i32>(&mut store, "fib")
            .unwrap();
        assert_eq!(fib.call(&mut store, 10).unwrap(), 55);
        // Recursion is visible as two `call 0` instructions.
        let calls = bytes.windows(2).filter(|w| w == &[0x10, 0x00]).count();
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_wasm_control_flow() {
        let src = "
            int collatz_steps(int n) {
                int steps = 0;
                while (n != 1) {
                    if (n % 2 == 0) { n = n / 2; } else { n = 3 * n + 1; }
                    steps++;
                }
                return steps;
            }
        ";
        let bytes = compile_wasm(src, &["collatz_steps"]);
        let (mut store, instance) = instantiate(&bytes);
        let f = instance
            .get_typed_func::<i32, i32>(&mut store, "collatz_steps")
            .unwrap();
        assert_eq!(f.call(&mut store, 6).unwrap(), 8);
        assert_eq!(f.call(&mut store, 27).unwrap(), 111);
    }

    #[test]
    fn test_wasm_loops_and_switch() {
        let src = "
            int classify(int x) {
                switch (x) {
                case 0: return 100;
                case 1:
                case 2: return 200;
                default: return 300;
                }
            }
            int sum_to(int n) {
                int total = 0;
                for (int i = 1; i <= n; i++) {
                    if (i == 13) continue;
                    total += i;
                }
                return total;
            }
        ";
        let bytes = compile_wasm(src, &["classify", "sum_to"]);
        let (mut store, instance) = instantiate(&bytes);
        let classify = instance
            .get_typed_func::<i32, i32>(&mut store, "classify")
            .unwrap();
        assert_eq!(classify.call(&mut store, 0).unwrap(), 100);
        assert_eq!(classify.call(&mut store, 2).unwrap(), 200);
        assert_eq!(classify.call(&mut store, 9).unwrap(), 300);

        let sum_to = instance
            .get_typed_func::<i32, i32>(&mut store, "sum_to")
            .unwrap();
        assert_eq!(sum_to.call(&mut store, 10).unwrap(), 55);
        assert_eq!(sum_to.call(&mut store, 20).unwrap(), 210 - 13);
    }

    #[test]
    fn test_wasm_globals() {
        let src = "
            int counter = 7;
            int bump(int by) { counter += by; return counter; }
        ";
        let bytes = compile_wasm(src, &["bump"]);
        // One entry in the Global section.
        assert_eq!(section_entry_count(&bytes, 6), Some(1));
        let (mut store, instance) = instantiate(&bytes);
        let bump = instance
            .get_typed_func::<i32, i32>(&mut store, "bump")
            .unwrap();
        assert_eq!(bump.call(&mut store, 3).unwrap(), 10);
        assert_eq!(bump.call(&mut store, 5).unwrap(), 15);
    }

    #[test]
    fn test_wasm_imports_take_first_indices() {
        let src = "
            int external(int x);
            int f(int x) { return external(x) + 1; }
        ";
        let bytes = compile_wasm(src, &["f"]);
        assert_eq!(section_entry_count(&bytes, 2), Some(1));

        let engine = Engine::default();
        let module = Module::new(&engine, &bytes).unwrap();
        let mut store = Store::new(&engine, ());
        let host = wasmtime::Func::wrap(&mut store, |x: i32| -> i32 { x * 2 });
        let instance = Instance::new(&mut store, &module, &[host.into()]).unwrap();
        let f = instance
            .get_typed_func::<i32, i32>(&mut store, "f")
            .unwrap();
        assert_eq!(f.call(&mut store, 10).unwrap(), 21);
    }

    #[test]
    fn test_wasm_type_section_deduplicates() {
        // Forty functions over three distinct signatures.
        let mut src = String::new();
        for i in 0..20 {
            src.push_str(&format!("int a{i}(int x) {{ return x + {i}; }}\n"));
        }
        for i in 0..15 {
            src.push_str(&format!("long b{i}(void) {{ return {i}; }}\n"));
        }
        for i in 0..5 {
            src.push_str(&format!("int c{i}(int x, int y) {{ return x * y + {i}; }}\n"));
        }
        let export_names: Vec<String> = (0..20)
            .map(|i| format!("a{i}"))
            .chain((0..15).map(|i| format!("b{i}")))
            .chain((0..5).map(|i| format!("c{i}")))
            .collect();
        let export_refs: Vec<&str> = export_names.iter().map(|s| s.as_str()).collect();
        let bytes = compile_wasm(&src, &export_refs);
        assert_eq!(section_entry_count(&bytes, 1), Some(3));
        assert_eq!(section_entry_count(&bytes, 3), Some(40));
        assert_eq!(section_entry_count(&bytes, 7), Some(40));
    }

    #[test]
    fn test_wasm_missing_exports_rejected() {
        let mut compiler = Compiler::new(Target::Wasm32);
        compiler
            .parse_source("int f(int x) { return x; }")
            .unwrap();
        assert!(matches!(
            compiler.compile(&[]),
            Err(CompileError::NoExports)
        ));
    }

    #[test]
    fn test_wasm_varargs_diagnosed() {
        let mut compiler = Compiler::new(Target::Wasm32);
        compiler
            .parse_source("int f(int x, ...) { return x; }")
            .unwrap();
        let result = compiler.compile(&["f".to_string()]);
        assert!(result.is_err());
        assert!(compiler
            .render_diagnostics()
            .contains("varargs are not supported"));
    }

    #[test]
    fn test_native_global_store_load() {
        let asm = compile_native("int g; int main() { g = 42; return g; }");
        assert!(asm.contains("\t.bss\n"), "g should land in .bss:\n{asm}");
        assert!(asm.contains("g:\n"), "missing g definition:\n{asm}");
        assert!(asm.contains("g(%rip)"), "missing rip-relative access:\n{asm}");
        assert!(asm.contains("$42"), "missing store of 42:\n{asm}");
        assert!(asm.contains(".globl main"), "main not exported:\n{asm}");
    }

    #[test]
    fn test_native_prologue_epilogue() {
        let asm = compile_native("int f(int x) { return x + 1; }");
        assert!(asm.contains("push %rbp"));
        assert!(asm.contains("mov %rsp, %rbp"));
        assert!(asm.contains("pop %rbp"));
        assert!(asm.contains("\tret\n"));
    }

    #[test]
    fn test_native_spill_pressure() {
        // More simultaneously-live values than the integer register
        // file can hold.
        let mut src = String::from("int f(int x) {\n");
        for i in 0..32 {
            src.push_str(&format!("    int v{i} = x + {i};\n"));
        }
        src.push_str("    return ");
        let terms: Vec<String> = (0..32).map(|i| format!("v{i}")).collect();
        src.push_str(&terms.join(" + "));
        src.push_str(";\n}\n");

        let mut compiler = Compiler::new(Target::X86_64);
        compiler.parse_source(&src).unwrap();
        let index = traverse(
            &mut compiler.ctx,
            &compiler.program,
            EmitRoots::AllDefined,
        );
        assert!(!compiler.has_errors());
        let func = compiler.program.functions().next().unwrap();
        assert!(index.funcs.get(func.name).unwrap().referenced);

        let mut func_ir =
            crate::ir::builder::build(&mut compiler.ctx, func).expect("lowering failed");
        crate::ir::regalloc::allocate(
            &mut func_ir,
            &crate::codegen::x86_64::regalloc_config(),
        );

        let spilled: Vec<_> = func_ir
            .vregs
            .iter()
            .filter(|v| v.flags.contains(crate::ir::VRegFlags::SPILLED))
            .collect();
        assert!(!spilled.is_empty(), "expected spills under pressure");
        // Frame grows by at least 8 bytes per spill.
        let frame_bytes: usize = func_ir.frame.iter().map(|s| s.size.max(8)).sum();
        assert!(frame_bytes >= 8 * spilled.len());

        // Bracketing invariant: spilled vregs only inside
        // LoadSpilled/StoreSpilled.
        for bb in &func_ir.bbcon.order {
            for ir in &func_ir.bbcon.pool[*bb].irs {
                if matches!(
                    ir.kind,
                    crate::ir::IrKind::LoadSpilled | crate::ir::IrKind::StoreSpilled
                ) {
                    continue;
                }
                for v in [ir.dst, ir.opr1, ir.opr2].into_iter().flatten() {
                    assert!(
                        !func_ir.vregs[v].flags.contains(crate::ir::VRegFlags::SPILLED),
                        "spilled vreg referenced directly"
                    );
                }
            }
        }
    }

    #[test]
    fn test_native_struct_return_through_hidden_pointer() {
        let src = "
            struct point { int x; int y; };
            struct point make_point(int x, int y) {
                struct point p;
                p.x = x;
                p.y = y;
                return p;
            }
            int norm1(int x, int y) {
                struct point p = make_point(x, y);
                return p.x + p.y;
            }
            int first(int x, int y) { return make_point(x, y).x; }
        ";
        let asm = compile_native(src);
        // The caller-allocated temporary is addressed and filled by the
        // callee through the hidden first argument.
        assert!(asm.contains("call make_point"), "{asm}");
        assert!(asm.contains(".globl norm1"), "{asm}");
        assert!(asm.contains(".globl first"), "{asm}");
        // The protocol stays deterministic across runs.
        assert_eq!(asm, compile_native(src));
    }

    #[test]
    fn test_struct_return_rejected_on_wasm() {
        let mut compiler = Compiler::new(Target::Wasm32);
        compiler
            .parse_source(
                "struct pair { int a; int b; };
                 struct pair mk(int a) { struct pair p; p.a = a; p.b = 0; return p; }",
            )
            .unwrap();
        let result = compiler.compile(&["mk".to_string()]);
        assert!(result.is_err());
        assert!(compiler
            .render_diagnostics()
            .contains("wasm32 backend"));
    }

    #[test]
    fn test_emitters_are_idempotent() {
        let src = "
            int square(int x) { return x * x; }
            int apply_twice(int x) { return square(square(x)); }
        ";
        let first = compile_native(src);
        let second = compile_native(src);
        assert_eq!(first, second);

        let wasm1 = compile_wasm(src, &["apply_twice"]);
        let wasm2 = compile_wasm(src, &["apply_twice"]);
        assert_eq!(wasm1, wasm2);
    }

    #[test]
    fn test_syntax_error_pins_location_and_fails() {
        let src = "int f(void) {\n    int x = 1;\n    int y = 2;\n    int z = 3;\n    retur 4;\n    return x;\n}\n";
        let mut compiler = Compiler::new(Target::X86_64);
        compiler.parse_source(src).unwrap();
        let result = compiler.compile(&[]);
        assert!(result.is_err());
        let rendered = compiler.render_diagnostics();
        assert!(rendered.contains(":5:"), "diagnostic not pinned to line 5: {rendered}");
    }

    #[test]
    fn test_unterminated_literal_is_fatal() {
        let mut compiler = Compiler::new(Target::X86_64);
        let result = compiler.parse_source("char *s = \"oops;\n");
        assert!(matches!(result, Err(CompileError::Failed { .. })));
        assert!(compiler
            .render_diagnostics()
            .contains("unterminated string literal"));
    }

    #[test]
    fn test_wasm_long_is_32_bits() {
        // The wasm32 size model keeps long at 4 bytes, so it lowers to
        // i32.
        let bytes = compile_wasm("long half(long x) { return x / 2; }", &["half"]);
        let (mut store, instance) = instantiate(&bytes);
        let half = instance
            .get_typed_func::<i32, i32>(&mut store, "half")
            .unwrap();
        assert_eq!(half.call(&mut store, 10).unwrap(), 5);
    }

    #[test]
    fn test_wasm_long_long_is_i64() {
        let bytes = compile_wasm(
            "long long mul(long long a, long long b) { return a * b; }",
            &["mul"],
        );
        let (mut store, instance) = instantiate(&bytes);
        let mul = instance
            .get_typed_func::<(i64, i64), i64>(&mut store, "mul")
            .unwrap();
        assert_eq!(mul.call(&mut store, (1 << 40, 4)).unwrap(), 4 << 40);
    }
}
