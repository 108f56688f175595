//! The typed abstract syntax tree.
//!
//! Expressions and statements are closed sum types so the code
//! generators can match exhaustively. Every expression node carries its
//! resolved type; the parser has already inserted the implicit `Cast`
//! nodes and pointer-arithmetic scaling, so nothing downstream has to
//! infer a conversion.

use crate::ids::{ScopeId, StructId};
use crate::interner::Name;
use crate::scope::Storage;
use crate::source::Span;
use crate::types::Ty;

/// Unary operators that survive into the AST.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnOp {
    /// Arithmetic negation.
    Neg,
    /// Bitwise complement.
    BitNot,
    /// Logical not; yields `int` 0 or 1.
    Not,
}

/// Binary operators. Comparison operators yield `int`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    pub fn is_compare(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }
}

/// An expression with its resolved type and source span.
#[derive(Clone, Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: Ty,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub enum ExprKind {
    IntLit(i64),
    FloatLit(f64),
    /// Index into the context's string-literal pool.
    StrLit(u32),
    /// A variable reference with its resolved scope.
    Var { name: Name, scope: ScopeId },
    /// Member access with the member already resolved.
    Member {
        target: Box<Expr>,
        struct_id: StructId,
        member: usize,
    },
    Deref(Box<Expr>),
    Addr(Box<Expr>),
    Unary { op: UnOp, sub: Box<Expr> },
    /// Both operands have been converted to the node's type (or, for
    /// comparisons, to their common type) before construction.
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Short-circuit `&&` / `||`; yields `int` 0 or 1.
    Logical {
        and: bool,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Assign { lhs: Box<Expr>, rhs: Box<Expr> },
    /// `lhs op= rhs`, kept unexpanded so the lvalue is evaluated once.
    CompoundAssign {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    IncDec {
        pre: bool,
        inc: bool,
        sub: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    /// Conversion to the node's type; explicit or compiler-inserted.
    Cast(Box<Expr>),
    Ternary {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    Comma { lhs: Box<Expr>, rhs: Box<Expr> },
    /// A compound literal; references the hidden anonymous variable the
    /// parser allocated, plus the assignments that fill it in.
    CompoundLit {
        scope: ScopeId,
        index: usize,
        inits: Vec<Expr>,
    },
    /// GNU statement expression; the value is the final expression
    /// statement of the block.
    BlockExpr(Box<Stmt>),
}

impl Expr {
    pub fn new(kind: ExprKind, ty: Ty, span: Span) -> Self {
        Self { kind, ty, span }
    }

    /// A compile-time constant literal.
    pub fn is_const(&self) -> bool {
        matches!(self.kind, ExprKind::IntLit(_) | ExprKind::FloatLit(_))
    }

    pub fn int_value(&self) -> Option<i64> {
        match self.kind {
            ExprKind::IntLit(v) => Some(v),
            _ => None,
        }
    }

    /// Does this expression denote a memory location?
    pub fn is_lvalue(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Var { .. }
                | ExprKind::Deref(_)
                | ExprKind::Member { .. }
                | ExprKind::StrLit(_)
                | ExprKind::CompoundLit { .. }
        )
    }
}

/// A statement with its source span.
#[derive(Clone, Debug)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub enum StmtKind {
    Expr(Expr),
    Block { scope: ScopeId, stmts: Vec<Stmt> },
    If {
        cond: Expr,
        then_stmt: Box<Stmt>,
        else_stmt: Option<Box<Stmt>>,
    },
    /// Case values and the default flag are discovered at parse time.
    Switch {
        value: Expr,
        body: Box<Stmt>,
        cases: Vec<i64>,
        has_default: bool,
    },
    While { cond: Expr, body: Box<Stmt> },
    DoWhile { body: Box<Stmt>, cond: Expr },
    For {
        scope: ScopeId,
        pre: Option<Box<Stmt>>,
        cond: Option<Expr>,
        post: Option<Expr>,
        body: Box<Stmt>,
    },
    Break,
    Continue,
    Return(Option<Expr>),
    Case { value: i64 },
    Default,
    Goto(Name),
    Label(Name),
    /// A local declaration group, lowered to its initializer statements.
    VarDecl { inits: Vec<Stmt> },
    /// Opaque inline assembly, passed through to the native emitter.
    Asm(String),
    Empty,
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { kind, span }
    }
}

/// A function definition (or, with an empty body and `defined` false, a
/// prototype).
#[derive(Clone, Debug)]
pub struct Function {
    pub name: Name,
    /// The function's `Func` type.
    pub ty: Ty,
    /// Parameter-list scope; always `scopes[0]`.
    pub param_scope: ScopeId,
    /// Indices of the parameters within the parameter scope, in order.
    pub params: Vec<usize>,
    /// Every scope belonging to this function, parameter scope first.
    pub scopes: Vec<ScopeId>,
    pub body: Vec<Stmt>,
    pub storage: Storage,
    pub defined: bool,
    pub span: Span,
}

/// A top-level declaration.
#[derive(Clone, Debug)]
pub enum Declaration {
    Func(Function),
    /// A global variable, registered in the global scope.
    Var { scope: ScopeId, index: usize },
}

/// A parsed translation unit (possibly concatenated from several input
/// files).
#[derive(Clone, Debug, Default)]
pub struct Program {
    pub decls: Vec<Declaration>,
}

impl Program {
    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.decls.iter().filter_map(|d| match d {
            Declaration::Func(f) => Some(f),
            Declaration::Var { .. } => None,
        })
    }
}
