//! chert compiler core
//!
//! This crate implements a compiler for a C-family subset with:
//! - A hand-written lexer and single-pass recursive-descent
//!   parser/semantic analyzer producing a fully typed AST
//! - Hash-consed type descriptors with structural function-signature
//!   identity
//! - Two backends behind one frontend: native x86-64 via a
//!   three-address IR and linear-scan register allocation, and
//!   WebAssembly lowered directly from the AST
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      CompilerContext                         │
//! │  ┌──────────┐  ┌─────────┐  ┌────────┐  ┌───────────────┐    │
//! │  │ Interner │  │  Types  │  │ Scopes │  │ SourceMap/Diag │   │
//! │  └──────────┘  └─────────┘  └────────┘  └───────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//!        ↑               ↑              ↑
//!   ┌────┴───┐     ┌─────┴────┐   ┌─────┴────┐
//!   │  Lex   │  →  │ Parse +  │ → │ Traverse │ ─┬→ IR → RegAlloc → x86-64
//!   │        │     │  Sema    │   │          │  └→ direct lowering → wasm
//!   └────────┘     └──────────┘   └──────────┘
//! ```

pub mod codegen;
pub mod compiler;
pub mod context;
pub mod diagnostic;
pub mod ids;
pub mod index_vec;
pub mod interner;
pub mod ir;
pub mod scope;
pub mod source;
pub mod syntax;
pub mod traverse;
pub mod types;

pub use compiler::{CompileError, CompileResult, Compiler, Target};
pub use context::CompilerContext;
pub use diagnostic::{Diagnostic, Diagnostics, Severity};
pub use interner::{Interner, Name};
pub use source::{Source, SourceId, SourceMap, Span};
pub use types::{TargetSizes, Ty, TyKind, TypeInterner};
