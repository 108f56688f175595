//! Target emission.
//!
//! The AST is the shared contract between the two backends; below it,
//! each one is a closed module behind the [`Backend`] capability. The
//! native backend runs the IR builder and register allocator before
//! printing assembly; the WebAssembly backend lowers the AST directly
//! into a stack-machine bytestream.

pub mod wasm;
pub mod x86_64;

use crate::context::CompilerContext;
use crate::ir::builder::BuildError;
use crate::source::Span;
use crate::syntax::ast::Function;
use crate::traverse::ProgramIndex;

#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("{message}")]
    Unsupported {
        message: String,
        span: Option<Span>,
    },
}

impl CodegenError {
    pub fn unsupported(message: impl Into<String>, span: Option<Span>) -> Self {
        Self::Unsupported {
            message: message.into(),
            span,
        }
    }

    pub fn span(&self) -> Option<Span> {
        match self {
            CodegenError::Unsupported { span, .. } => *span,
        }
    }
}

impl From<BuildError> for CodegenError {
    fn from(err: BuildError) -> Self {
        CodegenError::Unsupported {
            message: err.message,
            span: Some(err.span),
        }
    }
}

/// A code generation backend: lower each function, then finalize the
/// module bytes.
pub trait Backend {
    fn lower_function(
        &mut self,
        ctx: &mut CompilerContext,
        index: &ProgramIndex,
        func: &Function,
    ) -> Result<(), CodegenError>;

    fn finalize(
        &mut self,
        ctx: &mut CompilerContext,
        index: &ProgramIndex,
    ) -> Result<Vec<u8>, CodegenError>;
}
