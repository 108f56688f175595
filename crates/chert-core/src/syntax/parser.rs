//! Recursive-descent parser and semantic analyzer.
//!
//! Parsing and analysis run in a single pass: name resolution, the usual
//! arithmetic conversions, pointer-arithmetic scaling, lvalue checks and
//! constant folding all happen while nodes are constructed, so the AST
//! that leaves this module is fully typed.
//!
//! The grammar is hand-written with one-token lookahead plus an
//! occasional two-token peek (labels, and the classic typedef-name
//! disambiguation, which consults the scope's type namespace).
//! Syntactic errors abort the enclosing declaration and resynchronize at
//! the next `;` or `}`; semantic errors are reported and parsing
//! continues.

use crate::context::CompilerContext;
use crate::ids::ScopeId;
use crate::interner::Name;
use crate::scope::{GlobalInit, ScopeKind, Storage, VarInfo};
use crate::source::Span;
use crate::types::{
    Bitfield, FixnumKind, FlonumKind, MemberInfo, Qualifiers, Ty, TyKind,
};

use super::ast::{
    BinOp, Declaration, Expr, ExprKind, Function, Program, Stmt, StmtKind, UnOp,
};
use super::token::{Keyword, Token, TokenKind};

/// A syntactic error pinned to a token.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct SyntaxError {
    pub message: String,
    pub span: Span,
}

impl SyntaxError {
    fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

type PResult<T> = Result<T, SyntaxError>;

/// Parse one tokenized source into `program`, accumulating declarations.
pub fn parse_into(ctx: &mut CompilerContext, tokens: Vec<Token>, program: &mut Program) {
    Parser::new(ctx, tokens).toplevel(program);
}

struct CurFunc {
    ret: Ty,
    scopes: Vec<ScopeId>,
}

struct SwitchCtx {
    cases: Vec<i64>,
    has_default: bool,
}

struct ParamVar {
    name: Option<Name>,
    name_span: Span,
    ty: Ty,
}

enum DeclCore {
    Name(Name, Span),
    Nested(Box<DeclaratorSyntax>),
    Abstract,
}

enum DeclSuffix {
    Array(Option<u32>),
    Func { params: Vec<ParamVar>, vararg: bool },
}

/// A declarator parsed syntactically; applied to a base type outside-in.
struct DeclaratorSyntax {
    ptrs: usize,
    core: DeclCore,
    suffixes: Vec<DeclSuffix>,
}

struct Parser<'a> {
    ctx: &'a mut CompilerContext,
    tokens: Vec<Token>,
    pos: usize,
    cur_scope: ScopeId,
    cur_func: Option<CurFunc>,
    switches: Vec<SwitchCtx>,
}

impl<'a> Parser<'a> {
    fn new(ctx: &'a mut CompilerContext, tokens: Vec<Token>) -> Self {
        let global = ctx.global_scope();
        Self {
            ctx,
            tokens,
            pos: 0,
            cur_scope: global,
            cur_func: None,
            switches: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Token plumbing
    // ------------------------------------------------------------------

    fn tok(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn kind(&self) -> &TokenKind {
        &self.tok().kind
    }

    fn peek_kind(&self, n: usize) -> &TokenKind {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)].kind
    }

    fn span(&self) -> Span {
        self.tok().span
    }

    fn advance(&mut self) -> Token {
        let tok = self.tok().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn at(&self, kind: &TokenKind) -> bool {
        self.kind() == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn at_kw(&self, kw: Keyword) -> bool {
        matches!(self.kind(), TokenKind::Keyword(k) if *k == kw)
    }

    fn eat_kw(&mut self, kw: Keyword) -> bool {
        if self.at_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn describe(&self) -> String {
        match self.kind() {
            TokenKind::Eof => "end of input".to_string(),
            TokenKind::Ident(name) => format!("`{}`", self.ctx.str(*name)),
            other => format!("{:?}", other),
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> PResult<Span> {
        if self.at(kind) {
            Ok(self.advance().span)
        } else {
            Err(SyntaxError::new(
                format!("expected {}, found {}", what, self.describe()),
                self.span(),
            ))
        }
    }

    fn expect_ident(&mut self, what: &str) -> PResult<(Name, Span)> {
        match *self.kind() {
            TokenKind::Ident(name) => {
                let span = self.advance().span;
                Ok((name, span))
            }
            _ => Err(SyntaxError::new(
                format!("expected {}, found {}", what, self.describe()),
                self.span(),
            )),
        }
    }

    /// Skip forward to the next declaration boundary after a syntax
    /// error.
    fn resync(&mut self) {
        let mut depth = 0usize;
        loop {
            match self.kind() {
                TokenKind::Eof => return,
                TokenKind::LBrace => {
                    depth += 1;
                    self.advance();
                }
                TokenKind::RBrace => {
                    self.advance();
                    if depth <= 1 {
                        return;
                    }
                    depth -= 1;
                }
                TokenKind::Semicolon if depth == 0 => {
                    self.advance();
                    return;
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    fn push_scope(&mut self, kind: ScopeKind) -> ScopeId {
        let scope = self.ctx.new_scope(self.cur_scope, kind);
        if let Some(func) = self.cur_func.as_mut() {
            func.scopes.push(scope);
        }
        self.cur_scope = scope;
        scope
    }

    fn pop_scope(&mut self) {
        self.cur_scope = self.ctx.scopes[self.cur_scope]
            .parent
            .expect("popping the global scope");
    }

    // ------------------------------------------------------------------
    // Top level
    // ------------------------------------------------------------------

    fn toplevel(&mut self, program: &mut Program) {
        while !self.tok().is_eof() {
            if let Err(err) = self.declaration(program) {
                self.ctx.error(err.span, err.message);
                self.resync();
            }
        }
    }

    fn declaration(&mut self, program: &mut Program) -> PResult<()> {
        let start = self.span();
        let (base, storage, qual) = self.declspec()?;

        // A bare `struct S { ... };` or `enum E { ... };`.
        if self.eat(&TokenKind::Semicolon) {
            return Ok(());
        }

        let mut first = true;
        loop {
            let decl = self.declarator()?;
            let (name, ty, params) = self.apply_declarator(base, &decl)?;
            let (name, name_span) = match name {
                Some(pair) => pair,
                None => {
                    return Err(SyntaxError::new("expected declarator name", self.span()))
                }
            };

            if first && self.ctx.types.is_func(ty) && self.at(&TokenKind::LBrace) {
                let func = self.function_def(name, name_span, ty, params, storage, start)?;
                program.decls.push(Declaration::Func(func));
                return Ok(());
            }
            first = false;

            if storage.contains(Storage::TYPEDEF) {
                self.ctx.scopes[self.cur_scope].add_typedef(name, ty);
            } else if self.ctx.types.is_func(ty) {
                self.declare_symbol(name, name_span, ty, storage | Storage::EXTERN, qual);
            } else {
                let init = if self.eat(&TokenKind::Assign) {
                    Some(self.global_initializer(ty)?)
                } else {
                    None
                };
                if let Some(index) = self.declare_symbol(name, name_span, ty, storage, qual) {
                    let scope = self.ctx.global_scope();
                    self.ctx.var_mut(scope, index).init = init;
                    program.decls.push(Declaration::Var { scope, index });
                }
            }

            if self.eat(&TokenKind::Comma) {
                continue;
            }
            self.expect(&TokenKind::Semicolon, "`;`")?;
            return Ok(());
        }
    }

    fn declare_symbol(
        &mut self,
        name: Name,
        span: Span,
        ty: Ty,
        storage: Storage,
        qual: Qualifiers,
    ) -> Option<usize> {
        let global = self.ctx.global_scope();
        if let Some(existing) = self.ctx.scopes[global].find_var(name) {
            let prev = self.ctx.var(global, existing);
            if prev.ty != ty {
                let msg = format!("conflicting types for `{}`", self.ctx.str(name));
                self.ctx.error(span, msg);
            }
            // Re-declaration of the same symbol is fine.
            return Some(existing);
        }
        let var = VarInfo::new(name, ty, storage, qual);
        self.ctx.scopes[global].add_var(var)
    }

    fn global_initializer(&mut self, ty: Ty) -> PResult<GlobalInit> {
        let expr = self.conditional()?;
        let expr = self.make_cast(expr, ty, false);
        match expr.kind {
            ExprKind::IntLit(v) => Ok(GlobalInit::Fixnum(v)),
            ExprKind::FloatLit(v) => Ok(GlobalInit::Flonum(v)),
            _ => Err(SyntaxError::new(
                "global initializer is not a constant",
                expr.span,
            )),
        }
    }

    fn function_def(
        &mut self,
        name: Name,
        name_span: Span,
        ty: Ty,
        params: Option<(Vec<ParamVar>, bool)>,
        storage: Storage,
        start: Span,
    ) -> PResult<Function> {
        // The function symbol itself lives in the global scope.
        if let Some(existing) = self.ctx.scopes[self.ctx.global_scope()].find_var(name) {
            let global = self.ctx.global_scope();
            let prev = self.ctx.var(global, existing);
            if prev.ty != ty {
                let msg = format!("conflicting types for `{}`", self.ctx.str(name));
                self.ctx.error(name_span, msg);
            }
        } else {
            self.declare_symbol(name, name_span, ty, storage, Qualifiers::empty());
        }

        let ret = match self.ctx.types.kind(ty) {
            TyKind::Func { ret, .. } => *ret,
            _ => unreachable!("function definition with non-function type"),
        };

        let param_scope = self.ctx.new_scope(self.ctx.global_scope(), ScopeKind::Params);
        self.cur_scope = param_scope;
        self.cur_func = Some(CurFunc {
            ret,
            scopes: vec![param_scope],
        });

        let mut param_indices = Vec::new();
        if let Some((params, _vararg)) = &params {
            for (i, param) in params.iter().enumerate() {
                let Some(pname) = param.name else {
                    self.ctx.error(param.name_span, "parameter name omitted");
                    continue;
                };
                let mut var =
                    VarInfo::new(pname, param.ty, Storage::empty(), Qualifiers::empty());
                var.param_index = Some(i as u32);
                match self.ctx.scopes[param_scope].add_var(var) {
                    Some(idx) => param_indices.push(idx),
                    None => {
                        let msg =
                            format!("redefinition of parameter `{}`", self.ctx.str(pname));
                        self.ctx.error(param.name_span, msg);
                    }
                }
            }
        }

        // Restore parser state before propagating a body syntax error so
        // resynchronization starts from the global scope.
        let body_result = self.block();
        let func = self.cur_func.take().unwrap();
        self.cur_scope = self.ctx.global_scope();
        let body = vec![body_result?];

        Ok(Function {
            name,
            ty,
            param_scope,
            params: param_indices,
            scopes: func.scopes,
            body,
            storage,
            defined: true,
            span: start.merge(name_span),
        })
    }

    // ------------------------------------------------------------------
    // Declaration specifiers and declarators
    // ------------------------------------------------------------------

    fn is_type_start(&self) -> bool {
        match self.kind() {
            TokenKind::Keyword(kw) => matches!(
                kw,
                Keyword::Void
                    | Keyword::Char
                    | Keyword::Short
                    | Keyword::Int
                    | Keyword::Long
                    | Keyword::Float
                    | Keyword::Double
                    | Keyword::Signed
                    | Keyword::Unsigned
                    | Keyword::Struct
                    | Keyword::Union
                    | Keyword::Enum
                    | Keyword::Const
                    | Keyword::Volatile
            ),
            TokenKind::Ident(name) => self.ctx.find_typedef(self.cur_scope, *name).is_some(),
            _ => false,
        }
    }

    fn is_decl_start(&self) -> bool {
        if self.is_type_start() {
            return true;
        }
        matches!(
            self.kind(),
            TokenKind::Keyword(Keyword::Typedef)
                | TokenKind::Keyword(Keyword::Static)
                | TokenKind::Keyword(Keyword::Extern)
        )
    }

    /// Parse storage class + type specifiers + qualifiers.
    fn declspec(&mut self) -> PResult<(Ty, Storage, Qualifiers)> {
        let mut storage = Storage::empty();
        let mut qual = Qualifiers::empty();

        let mut base: Option<Ty> = None;
        let mut signedness: Option<bool> = None;
        let mut long_count = 0usize;
        let mut short = false;
        let mut int_seen = false;

        loop {
            match *self.kind() {
                TokenKind::Keyword(Keyword::Typedef) => {
                    storage |= Storage::TYPEDEF;
                    self.advance();
                }
                TokenKind::Keyword(Keyword::Static) => {
                    storage |= Storage::STATIC;
                    self.advance();
                }
                TokenKind::Keyword(Keyword::Extern) => {
                    storage |= Storage::EXTERN;
                    self.advance();
                }
                TokenKind::Keyword(Keyword::Const) => {
                    qual |= Qualifiers::CONST;
                    self.advance();
                }
                TokenKind::Keyword(Keyword::Volatile) => {
                    qual |= Qualifiers::VOLATILE;
                    self.advance();
                }
                TokenKind::Keyword(Keyword::Void) => {
                    base = Some(Ty::VOID);
                    self.advance();
                }
                TokenKind::Keyword(Keyword::Char) => {
                    base = Some(Ty::CHAR);
                    self.advance();
                }
                TokenKind::Keyword(Keyword::Short) => {
                    short = true;
                    self.advance();
                }
                TokenKind::Keyword(Keyword::Int) => {
                    int_seen = true;
                    self.advance();
                }
                TokenKind::Keyword(Keyword::Long) => {
                    long_count += 1;
                    self.advance();
                }
                TokenKind::Keyword(Keyword::Float) => {
                    base = Some(self.ctx.types.flonum(FlonumKind::Float));
                    self.advance();
                }
                TokenKind::Keyword(Keyword::Double) => {
                    base = Some(self.ctx.types.flonum(FlonumKind::Double));
                    self.advance();
                }
                TokenKind::Keyword(Keyword::Signed) => {
                    signedness = Some(false);
                    self.advance();
                }
                TokenKind::Keyword(Keyword::Unsigned) => {
                    signedness = Some(true);
                    self.advance();
                }
                TokenKind::Keyword(Keyword::Struct) => {
                    self.advance();
                    base = Some(self.struct_or_union(false)?);
                }
                TokenKind::Keyword(Keyword::Union) => {
                    self.advance();
                    base = Some(self.struct_or_union(true)?);
                }
                TokenKind::Keyword(Keyword::Enum) => {
                    self.advance();
                    base = Some(self.enum_decl()?);
                }
                TokenKind::Ident(name)
                    if base.is_none()
                        && !short
                        && long_count == 0
                        && !int_seen
                        && signedness.is_none() =>
                {
                    match self.ctx.find_typedef(self.cur_scope, name) {
                        Some(ty) => {
                            base = Some(ty);
                            self.advance();
                        }
                        None => break,
                    }
                }
                _ => break,
            }
        }

        let unsigned = signedness.unwrap_or(false);
        let ty = match base {
            Some(t) if t == Ty::CHAR && signedness.is_some() => {
                self.ctx.types.fixnum(FixnumKind::Char, unsigned)
            }
            Some(t) => {
                if short || long_count > 0 {
                    return Err(SyntaxError::new("invalid type specifier combination", self.span()));
                }
                t
            }
            None => {
                if short {
                    self.ctx.types.fixnum(FixnumKind::Short, unsigned)
                } else if long_count >= 2 {
                    self.ctx.types.fixnum(FixnumKind::LongLong, unsigned)
                } else if long_count == 1 {
                    self.ctx.types.fixnum(FixnumKind::Long, unsigned)
                } else if int_seen || signedness.is_some() {
                    self.ctx.types.fixnum(FixnumKind::Int, unsigned)
                } else {
                    return Err(SyntaxError::new(
                        format!("expected type specifier, found {}", self.describe()),
                        self.span(),
                    ));
                }
            }
        };
        Ok((ty, storage, qual))
    }

    fn struct_or_union(&mut self, is_union: bool) -> PResult<Ty> {
        let tag = match *self.kind() {
            TokenKind::Ident(name) => {
                self.advance();
                Some(name)
            }
            _ => None,
        };

        let ty = match tag {
            Some(name) => match self.ctx.find_tag(self.cur_scope, name) {
                Some(existing) => existing,
                None => {
                    let id = self.ctx.types.add_struct(Some(name), is_union);
                    let ty = self.ctx.types.intern(TyKind::Struct(id));
                    self.ctx.scopes[self.cur_scope].add_tag(name, ty);
                    ty
                }
            },
            None => {
                let id = self.ctx.types.add_struct(None, is_union);
                self.ctx.types.intern(TyKind::Struct(id))
            }
        };

        if !self.eat(&TokenKind::LBrace) {
            return Ok(ty);
        }

        let id = match self.ctx.types.kind(ty) {
            TyKind::Struct(id) => *id,
            _ => unreachable!(),
        };
        if self.ctx.types.struct_def(id).defined {
            let span = self.span();
            self.ctx.error(span, "redefinition of struct");
        }

        let mut members = Vec::new();
        while !self.eat(&TokenKind::RBrace) {
            let (base, _storage, _qual) = self.declspec()?;
            loop {
                let decl = self.declarator()?;
                let (name, ty, _) = self.apply_declarator(base, &decl)?;
                let bitfield = if self.eat(&TokenKind::Colon) {
                    let width = self.const_expr()? as u32;
                    Some(Bitfield { width, position: 0 })
                } else {
                    None
                };
                if let Some((name, _)) = name {
                    members.push(MemberInfo {
                        name,
                        ty,
                        offset: 0,
                        bitfield,
                    });
                }
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::Semicolon, "`;`")?;
        }
        self.ctx.types.define_struct(id, members);
        Ok(ty)
    }

    fn enum_decl(&mut self) -> PResult<Ty> {
        let tag = match *self.kind() {
            TokenKind::Ident(name) => {
                self.advance();
                Some(name)
            }
            _ => None,
        };
        let ty = self.ctx.types.fixnum(FixnumKind::Enum, false);

        if self.eat(&TokenKind::LBrace) {
            let mut value = 0i64;
            while !self.eat(&TokenKind::RBrace) {
                let (name, span) = self.expect_ident("enum member name")?;
                if self.eat(&TokenKind::Assign) {
                    value = self.const_expr()?;
                }
                let mut var =
                    VarInfo::new(name, ty, Storage::ENUM_MEMBER, Qualifiers::CONST);
                var.enum_value = value;
                if self.ctx.scopes[self.cur_scope].add_var(var).is_none() {
                    let msg = format!("redefinition of `{}`", self.ctx.str(name));
                    self.ctx.error(span, msg);
                }
                value += 1;
                if !self.eat(&TokenKind::Comma) {
                    self.expect(&TokenKind::RBrace, "`}`")?;
                    break;
                }
            }
        }

        if let Some(name) = tag {
            self.ctx.scopes[self.cur_scope].add_tag(name, ty);
        }
        Ok(ty)
    }

    fn declarator(&mut self) -> PResult<DeclaratorSyntax> {
        let mut ptrs = 0;
        while self.eat(&TokenKind::Star) {
            ptrs += 1;
            while self.eat_kw(Keyword::Const) || self.eat_kw(Keyword::Volatile) {}
        }

        let core = match *self.kind() {
            TokenKind::Ident(name) => {
                let span = self.advance().span;
                DeclCore::Name(name, span)
            }
            TokenKind::LParen if !self.paren_starts_params() => {
                self.advance();
                let inner = self.declarator()?;
                self.expect(&TokenKind::RParen, "`)`")?;
                DeclCore::Nested(Box::new(inner))
            }
            _ => DeclCore::Abstract,
        };

        let mut suffixes = Vec::new();
        loop {
            if self.eat(&TokenKind::LBracket) {
                let len = if self.at(&TokenKind::RBracket) {
                    None
                } else {
                    Some(self.const_expr()? as u32)
                };
                self.expect(&TokenKind::RBracket, "`]`")?;
                suffixes.push(DeclSuffix::Array(len));
            } else if self.at(&TokenKind::LParen) {
                self.advance();
                let (params, vararg) = self.param_list()?;
                suffixes.push(DeclSuffix::Func { params, vararg });
            } else {
                break;
            }
        }

        Ok(DeclaratorSyntax {
            ptrs,
            core,
            suffixes,
        })
    }

    /// Disambiguate `(` after a missing declarator core: a type keyword
    /// or `)` means a parameter list, anything else a nested declarator.
    fn paren_starts_params(&self) -> bool {
        match self.peek_kind(1) {
            TokenKind::RParen => true,
            TokenKind::Keyword(_) => true,
            TokenKind::Ident(name) => self
                .ctx
                .find_typedef(self.cur_scope, *name)
                .is_some(),
            _ => false,
        }
    }

    fn param_list(&mut self) -> PResult<(Vec<ParamVar>, bool)> {
        let mut params = Vec::new();
        let mut vararg = false;

        if self.eat(&TokenKind::RParen) {
            return Ok((params, vararg));
        }
        // `(void)` means no parameters.
        if self.at_kw(Keyword::Void) && *self.peek_kind(1) == TokenKind::RParen {
            self.advance();
            self.advance();
            return Ok((params, vararg));
        }

        loop {
            if self.eat(&TokenKind::Ellipsis) {
                vararg = true;
                break;
            }
            let (base, _storage, _qual) = self.declspec()?;
            let decl = self.declarator()?;
            let (name, mut ty, _) = self.apply_declarator(base, &decl)?;
            // Arrays and functions decay to pointers in parameter lists.
            if let Some(elem) = self.ctx.types.array_elem(ty) {
                ty = self.ctx.types.ptr_to(elem);
            } else if self.ctx.types.is_func(ty) {
                ty = self.ctx.types.ptr_to(ty);
            }
            let (name, name_span) = match name {
                Some((n, s)) => (Some(n), s),
                None => (None, self.span()),
            };
            params.push(ParamVar {
                name,
                name_span,
                ty,
            });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, "`)`")?;
        Ok((params, vararg))
    }

    /// Apply a parsed declarator to a base type using the standard
    /// outside-in construction.
    fn apply_declarator(
        &mut self,
        base: Ty,
        decl: &DeclaratorSyntax,
    ) -> PResult<(Option<(Name, Span)>, Ty, Option<(Vec<ParamVar>, bool)>)> {
        let mut ty = base;
        for _ in 0..decl.ptrs {
            ty = self.ctx.types.ptr_to(ty);
        }
        for suffix in decl.suffixes.iter().rev() {
            match suffix {
                DeclSuffix::Array(len) => {
                    ty = self.ctx.types.array_of(ty, *len);
                }
                DeclSuffix::Func { params, vararg } => {
                    let param_tys = params.iter().map(|p| p.ty).collect();
                    ty = self.ctx.types.func(ty, param_tys, *vararg);
                }
            }
        }

        match &decl.core {
            DeclCore::Name(name, span) => {
                let params = match decl.suffixes.first() {
                    Some(DeclSuffix::Func { params, vararg }) => Some((
                        params
                            .iter()
                            .map(|p| ParamVar {
                                name: p.name,
                                name_span: p.name_span,
                                ty: p.ty,
                            })
                            .collect(),
                        *vararg,
                    )),
                    _ => None,
                };
                Ok((Some((*name, *span)), ty, params))
            }
            DeclCore::Nested(inner) => self.apply_declarator(ty, inner),
            DeclCore::Abstract => Ok((None, ty, None)),
        }
    }

    /// Parse a type name (for casts and `sizeof`).
    fn type_name(&mut self) -> PResult<Ty> {
        let (base, _storage, _qual) = self.declspec()?;
        let decl = self.declarator()?;
        let (name, ty, _) = self.apply_declarator(base, &decl)?;
        if let Some((_, span)) = name {
            return Err(SyntaxError::new("unexpected name in type name", span));
        }
        Ok(ty)
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn block(&mut self) -> PResult<Stmt> {
        let start = self.expect(&TokenKind::LBrace, "`{`")?;
        let scope = self.push_scope(ScopeKind::Block);
        let mut stmts = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            if self.tok().is_eof() {
                self.pop_scope();
                return Err(SyntaxError::new("unterminated block", self.span()));
            }
            match self.stmt() {
                Ok(stmt) => stmts.push(stmt),
                Err(err) => {
                    self.ctx.error(err.span, err.message);
                    self.resync_stmt();
                }
            }
        }
        let end = self.advance().span;
        self.pop_scope();
        Ok(Stmt::new(StmtKind::Block { scope, stmts }, start.merge(end)))
    }

    fn resync_stmt(&mut self) {
        loop {
            match self.kind() {
                TokenKind::Eof | TokenKind::RBrace => return,
                TokenKind::Semicolon => {
                    self.advance();
                    return;
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn stmt(&mut self) -> PResult<Stmt> {
        let start = self.span();
        match *self.kind() {
            TokenKind::LBrace => self.block(),
            TokenKind::Semicolon => {
                self.advance();
                Ok(Stmt::new(StmtKind::Empty, start))
            }
            TokenKind::Keyword(Keyword::If) => self.if_stmt(),
            TokenKind::Keyword(Keyword::While) => self.while_stmt(),
            TokenKind::Keyword(Keyword::Do) => self.do_while_stmt(),
            TokenKind::Keyword(Keyword::For) => self.for_stmt(),
            TokenKind::Keyword(Keyword::Switch) => self.switch_stmt(),
            TokenKind::Keyword(Keyword::Case) => {
                self.advance();
                let value = self.const_expr()?;
                self.expect(&TokenKind::Colon, "`:`")?;
                match self.switches.last_mut() {
                    Some(ctx) => ctx.cases.push(value),
                    None => {
                        self.ctx.error(start, "case label outside of switch");
                    }
                }
                Ok(Stmt::new(StmtKind::Case { value }, start))
            }
            TokenKind::Keyword(Keyword::Default) => {
                self.advance();
                self.expect(&TokenKind::Colon, "`:`")?;
                match self.switches.last_mut() {
                    Some(ctx) => ctx.has_default = true,
                    None => {
                        self.ctx.error(start, "default label outside of switch");
                    }
                }
                Ok(Stmt::new(StmtKind::Default, start))
            }
            TokenKind::Keyword(Keyword::Break) => {
                self.advance();
                self.expect(&TokenKind::Semicolon, "`;`")?;
                Ok(Stmt::new(StmtKind::Break, start))
            }
            TokenKind::Keyword(Keyword::Continue) => {
                self.advance();
                self.expect(&TokenKind::Semicolon, "`;`")?;
                Ok(Stmt::new(StmtKind::Continue, start))
            }
            TokenKind::Keyword(Keyword::Goto) => {
                self.advance();
                let (name, _) = self.expect_ident("label name")?;
                self.expect(&TokenKind::Semicolon, "`;`")?;
                Ok(Stmt::new(StmtKind::Goto(name), start))
            }
            TokenKind::Keyword(Keyword::Return) => {
                self.advance();
                let value = if self.at(&TokenKind::Semicolon) {
                    None
                } else {
                    let expr = self.expr()?;
                    let ret = self.cur_func.as_ref().map(|f| f.ret).unwrap_or(Ty::VOID);
                    if ret == Ty::VOID {
                        self.ctx
                            .error(expr.span, "returning a value from a void function");
                        Some(expr)
                    } else {
                        let expr = self.decay(expr);
                        if self.ctx.types.is_struct(ret) || self.ctx.types.is_struct(expr.ty)
                        {
                            if expr.ty != ret {
                                self.ctx.error(expr.span, "incompatible return type");
                            }
                            Some(expr)
                        } else {
                            Some(self.make_cast(expr, ret, false))
                        }
                    }
                };
                self.expect(&TokenKind::Semicolon, "`;`")?;
                Ok(Stmt::new(StmtKind::Return(value), start))
            }
            TokenKind::Keyword(Keyword::Asm) => {
                self.advance();
                self.expect(&TokenKind::LParen, "`(`")?;
                let text = match self.kind().clone() {
                    TokenKind::StrLit(text) => {
                        self.advance();
                        text
                    }
                    _ => {
                        return Err(SyntaxError::new(
                            "expected string literal in __asm",
                            self.span(),
                        ))
                    }
                };
                self.expect(&TokenKind::RParen, "`)`")?;
                self.expect(&TokenKind::Semicolon, "`;`")?;
                Ok(Stmt::new(StmtKind::Asm(text), start))
            }
            TokenKind::Ident(name) if *self.peek_kind(1) == TokenKind::Colon => {
                self.advance();
                self.advance();
                Ok(Stmt::new(StmtKind::Label(name), start))
            }
            _ if self.is_decl_start() => {
                let inits = self.local_declaration()?;
                Ok(Stmt::new(StmtKind::VarDecl { inits }, start))
            }
            _ => {
                let expr = self.expr()?;
                self.expect(&TokenKind::Semicolon, "`;`")?;
                Ok(Stmt::new(StmtKind::Expr(expr), start))
            }
        }
    }

    fn if_stmt(&mut self) -> PResult<Stmt> {
        let start = self.advance().span;
        self.expect(&TokenKind::LParen, "`(`")?;
        let cond = self.condition_expr()?;
        self.expect(&TokenKind::RParen, "`)`")?;
        let then_stmt = Box::new(self.stmt()?);
        let else_stmt = if self.eat_kw(Keyword::Else) {
            Some(Box::new(self.stmt()?))
        } else {
            None
        };
        Ok(Stmt::new(
            StmtKind::If {
                cond,
                then_stmt,
                else_stmt,
            },
            start,
        ))
    }

    fn while_stmt(&mut self) -> PResult<Stmt> {
        let start = self.advance().span;
        self.expect(&TokenKind::LParen, "`(`")?;
        let cond = self.condition_expr()?;
        self.expect(&TokenKind::RParen, "`)`")?;
        let body = Box::new(self.stmt()?);
        Ok(Stmt::new(StmtKind::While { cond, body }, start))
    }

    fn do_while_stmt(&mut self) -> PResult<Stmt> {
        let start = self.advance().span;
        let body = Box::new(self.stmt()?);
        if !self.eat_kw(Keyword::While) {
            return Err(SyntaxError::new("expected `while` after do body", self.span()));
        }
        self.expect(&TokenKind::LParen, "`(`")?;
        let cond = self.condition_expr()?;
        self.expect(&TokenKind::RParen, "`)`")?;
        self.expect(&TokenKind::Semicolon, "`;`")?;
        Ok(Stmt::new(StmtKind::DoWhile { body, cond }, start))
    }

    fn for_stmt(&mut self) -> PResult<Stmt> {
        let start = self.advance().span;
        self.expect(&TokenKind::LParen, "`(`")?;
        let scope = self.push_scope(ScopeKind::Block);

        let pre = if self.eat(&TokenKind::Semicolon) {
            None
        } else if self.is_decl_start() {
            let span = self.span();
            let inits = self.local_declaration()?;
            Some(Box::new(Stmt::new(StmtKind::VarDecl { inits }, span)))
        } else {
            let expr = self.expr()?;
            self.expect(&TokenKind::Semicolon, "`;`")?;
            let span = expr.span;
            Some(Box::new(Stmt::new(StmtKind::Expr(expr), span)))
        };

        let cond = if self.at(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.condition_expr()?)
        };
        self.expect(&TokenKind::Semicolon, "`;`")?;

        let post = if self.at(&TokenKind::RParen) {
            None
        } else {
            Some(self.expr()?)
        };
        self.expect(&TokenKind::RParen, "`)`")?;

        let body = Box::new(self.stmt()?);
        self.pop_scope();
        Ok(Stmt::new(
            StmtKind::For {
                scope,
                pre,
                cond,
                post,
                body,
            },
            start,
        ))
    }

    fn switch_stmt(&mut self) -> PResult<Stmt> {
        let start = self.advance().span;
        self.expect(&TokenKind::LParen, "`(`")?;
        let value = self.expr()?;
        let value = self.decay(value);
        if !self.ctx.types.is_fixnum(value.ty) {
            self.ctx
                .error(value.span, "switch value is not an integer");
        }
        self.expect(&TokenKind::RParen, "`)`")?;

        self.switches.push(SwitchCtx {
            cases: Vec::new(),
            has_default: false,
        });
        let body = Box::new(self.stmt()?);
        let ctx = self.switches.pop().unwrap();

        // Duplicate case values are a semantic error.
        let mut seen = ctx.cases.clone();
        seen.sort_unstable();
        if seen.windows(2).any(|w| w[0] == w[1]) {
            self.ctx.error(start, "duplicate case value in switch");
        }

        Ok(Stmt::new(
            StmtKind::Switch {
                value,
                body,
                cases: ctx.cases,
                has_default: ctx.has_default,
            },
            start,
        ))
    }

    fn local_declaration(&mut self) -> PResult<Vec<Stmt>> {
        let (base, storage, qual) = self.declspec()?;
        let mut inits = Vec::new();

        if self.eat(&TokenKind::Semicolon) {
            return Ok(inits);
        }

        loop {
            let decl = self.declarator()?;
            let (name, ty, _params) = self.apply_declarator(base, &decl)?;
            let Some((name, name_span)) = name else {
                return Err(SyntaxError::new("expected declarator name", self.span()));
            };

            if storage.contains(Storage::TYPEDEF) {
                self.ctx.scopes[self.cur_scope].add_typedef(name, ty);
            } else if storage.contains(Storage::STATIC) {
                self.ctx
                    .error(name_span, "static local variables are not supported");
            } else if self.ctx.types.is_func(ty) {
                self.declare_symbol(name, name_span, ty, storage | Storage::EXTERN, qual);
            } else {
                let var = VarInfo::new(name, ty, storage, qual);
                if self.ctx.scopes[self.cur_scope].add_var(var).is_none() {
                    let msg = format!("redefinition of `{}`", self.ctx.str(name));
                    self.ctx.error(name_span, msg);
                }
                if self.eat(&TokenKind::Assign) {
                    if self.at(&TokenKind::LBrace) {
                        self.ctx.error(
                            name_span,
                            "initializer lists for locals are not supported",
                        );
                        self.skip_braced();
                    } else {
                        let lhs = Expr::new(
                            ExprKind::Var {
                                name,
                                scope: self.cur_scope,
                            },
                            ty,
                            name_span,
                        );
                        let rhs = self.assign()?;
                        let assign = self.make_assign(lhs, rhs, name_span);
                        inits.push(Stmt::new(StmtKind::Expr(assign), name_span));
                    }
                }
            }

            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::Semicolon, "`;`")?;
        Ok(inits)
    }

    fn skip_braced(&mut self) {
        let mut depth = 0;
        loop {
            match self.kind() {
                TokenKind::Eof => return,
                TokenKind::LBrace => {
                    depth += 1;
                    self.advance();
                }
                TokenKind::RBrace => {
                    self.advance();
                    depth -= 1;
                    if depth == 0 {
                        return;
                    }
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    /// Parse a controlling expression and check it is scalar.
    fn condition_expr(&mut self) -> PResult<Expr> {
        let expr = self.expr()?;
        let expr = self.decay(expr);
        if !self.ctx.types.is_scalar(expr.ty) {
            self.ctx.error(expr.span, "condition is not scalar");
        }
        Ok(expr)
    }

    // ------------------------------------------------------------------
    // Expressions (precedence climbing)
    // ------------------------------------------------------------------

    fn expr(&mut self) -> PResult<Expr> {
        let mut lhs = self.assign()?;
        while self.eat(&TokenKind::Comma) {
            let rhs = self.assign()?;
            let span = lhs.span.merge(rhs.span);
            let ty = rhs.ty;
            lhs = Expr::new(
                ExprKind::Comma {
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                ty,
                span,
            );
        }
        Ok(lhs)
    }

    fn assign(&mut self) -> PResult<Expr> {
        let lhs = self.conditional()?;

        let compound = match self.kind() {
            TokenKind::Assign => None,
            TokenKind::PlusAssign => Some(BinOp::Add),
            TokenKind::MinusAssign => Some(BinOp::Sub),
            TokenKind::StarAssign => Some(BinOp::Mul),
            TokenKind::SlashAssign => Some(BinOp::Div),
            TokenKind::PercentAssign => Some(BinOp::Mod),
            TokenKind::AmpAssign => Some(BinOp::BitAnd),
            TokenKind::PipeAssign => Some(BinOp::BitOr),
            TokenKind::CaretAssign => Some(BinOp::BitXor),
            TokenKind::ShlAssign => Some(BinOp::Shl),
            TokenKind::ShrAssign => Some(BinOp::Shr),
            _ => return Ok(lhs),
        };
        let op_span = self.advance().span;
        let rhs = self.assign()?;

        match compound {
            None => Ok(self.make_assign(lhs, rhs, op_span)),
            Some(op) => {
                self.require_lvalue(&lhs);
                if !self.ctx.types.is_scalar(lhs.ty) {
                    self.ctx
                        .error(op_span, "invalid operand to compound assignment");
                }
                let rhs = self.decay(rhs);
                let ty = lhs.ty;
                let rhs = if self.ctx.types.is_ptr(ty) {
                    self.scale_index(rhs, ty)
                } else {
                    self.make_cast(rhs, ty, false)
                };
                let span = lhs.span.merge(rhs.span);
                Ok(Expr::new(
                    ExprKind::CompoundAssign {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    ty,
                    span,
                ))
            }
        }
    }

    fn make_assign(&mut self, lhs: Expr, rhs: Expr, span: Span) -> Expr {
        self.require_lvalue(&lhs);
        let rhs = self.decay(rhs);
        self.check_assignable(lhs.ty, &rhs, span);
        let rhs = self.make_cast(rhs, lhs.ty, false);
        let ty = lhs.ty;
        let span = lhs.span.merge(span).merge(rhs.span);
        Expr::new(
            ExprKind::Assign {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
            span,
        )
    }

    fn check_assignable(&mut self, dst: Ty, src: &Expr, span: Span) {
        let types = &self.ctx.types;
        let ok = if types.is_number(dst) && types.is_number(src.ty) {
            true
        } else if types.is_ptr(dst) && types.is_ptr(src.ty) {
            // `void *` converts freely; otherwise require the same
            // pointee.
            dst == src.ty
                || types.pointee(dst) == Some(Ty::VOID)
                || types.pointee(src.ty) == Some(Ty::VOID)
        } else if types.is_ptr(dst) && src.int_value() == Some(0) {
            true
        } else {
            dst == src.ty
        };
        if !ok {
            let msg = format!(
                "incompatible conversion from `{}` to `{}`",
                self.ctx.type_name(src.ty),
                self.ctx.type_name(dst)
            );
            self.ctx.error(span, msg);
        }
    }

    fn conditional(&mut self) -> PResult<Expr> {
        let cond = self.logical_or()?;
        if !self.eat(&TokenKind::Question) {
            return Ok(cond);
        }
        let cond = self.decay(cond);
        let then_expr = self.expr()?;
        self.expect(&TokenKind::Colon, "`:`")?;
        let else_expr = self.conditional()?;

        let then_expr = self.decay(then_expr);
        let else_expr = self.decay(else_expr);
        let types = &mut self.ctx.types;
        let ty = if types.is_number(then_expr.ty) && types.is_number(else_expr.ty) {
            types.usual_arith(then_expr.ty, else_expr.ty)
        } else {
            then_expr.ty
        };
        let then_expr = self.make_cast(then_expr, ty, false);
        let else_expr = self.make_cast(else_expr, ty, false);

        // Fold a constant condition away entirely.
        if let Some(v) = cond.int_value() {
            return Ok(if v != 0 { then_expr } else { else_expr });
        }

        let span = cond.span.merge(else_expr.span);
        Ok(Expr::new(
            ExprKind::Ternary {
                cond: Box::new(cond),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            },
            ty,
            span,
        ))
    }

    fn logical_or(&mut self) -> PResult<Expr> {
        let mut lhs = self.logical_and()?;
        while self.eat(&TokenKind::PipePipe) {
            let rhs = self.logical_and()?;
            lhs = self.make_logical(false, lhs, rhs);
        }
        Ok(lhs)
    }

    fn logical_and(&mut self) -> PResult<Expr> {
        let mut lhs = self.bit_or()?;
        while self.eat(&TokenKind::AndAnd) {
            let rhs = self.bit_or()?;
            lhs = self.make_logical(true, lhs, rhs);
        }
        Ok(lhs)
    }

    fn make_logical(&mut self, and: bool, lhs: Expr, rhs: Expr) -> Expr {
        let lhs = self.decay(lhs);
        let rhs = self.decay(rhs);
        for side in [&lhs, &rhs] {
            if !self.ctx.types.is_scalar(side.ty) {
                self.ctx.error(side.span, "operand is not scalar");
            }
        }
        let span = lhs.span.merge(rhs.span);
        if let (Some(l), Some(r)) = (lhs.int_value(), rhs.int_value()) {
            let value = if and {
                (l != 0 && r != 0) as i64
            } else {
                (l != 0 || r != 0) as i64
            };
            return Expr::new(ExprKind::IntLit(value), Ty::INT, span);
        }
        Expr::new(
            ExprKind::Logical {
                and,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            Ty::INT,
            span,
        )
    }

    fn bit_or(&mut self) -> PResult<Expr> {
        let mut lhs = self.bit_xor()?;
        while self.at(&TokenKind::Pipe) {
            self.advance();
            let rhs = self.bit_xor()?;
            lhs = self.arith_binop(BinOp::BitOr, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn bit_xor(&mut self) -> PResult<Expr> {
        let mut lhs = self.bit_and()?;
        while self.at(&TokenKind::Caret) {
            self.advance();
            let rhs = self.bit_and()?;
            lhs = self.arith_binop(BinOp::BitXor, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn bit_and(&mut self) -> PResult<Expr> {
        let mut lhs = self.equality()?;
        while self.at(&TokenKind::Amp) {
            self.advance();
            let rhs = self.equality()?;
            lhs = self.arith_binop(BinOp::BitAnd, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> PResult<Expr> {
        let mut lhs = self.relational()?;
        loop {
            let op = match self.kind() {
                TokenKind::EqEq => BinOp::Eq,
                TokenKind::NotEq => BinOp::Ne,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.relational()?;
            lhs = self.compare_binop(op, lhs, rhs)?;
        }
    }

    fn relational(&mut self) -> PResult<Expr> {
        let mut lhs = self.shift()?;
        loop {
            let op = match self.kind() {
                TokenKind::Lt => BinOp::Lt,
                TokenKind::Le => BinOp::Le,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::Ge => BinOp::Ge,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.shift()?;
            lhs = self.compare_binop(op, lhs, rhs)?;
        }
    }

    fn shift(&mut self) -> PResult<Expr> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.kind() {
                TokenKind::Shl => BinOp::Shl,
                TokenKind::Shr => BinOp::Shr,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.additive()?;
            // Shift result takes the promoted left type; the right side
            // is converted independently.
            let lhs2 = self.decay(lhs);
            let rhs = self.decay(rhs);
            let ty = self.ctx.types.promote(lhs2.ty);
            let lhs2 = self.make_cast(lhs2, ty, false);
            let rhs = self.make_cast(rhs, Ty::INT, false);
            lhs = self.fold_or_build(op, lhs2, rhs, ty);
        }
    }

    fn additive(&mut self) -> PResult<Expr> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.multiplicative()?;
            lhs = self.add_sub(op, lhs, rhs)?;
        }
    }

    fn multiplicative(&mut self) -> PResult<Expr> {
        let mut lhs = self.cast_expr()?;
        loop {
            let op = match self.kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.cast_expr()?;
            lhs = self.arith_binop(op, lhs, rhs)?;
        }
    }

    /// `+`/`-` with pointer-arithmetic scaling.
    fn add_sub(&mut self, op: BinOp, lhs: Expr, rhs: Expr) -> PResult<Expr> {
        let lhs = self.decay(lhs);
        let rhs = self.decay(rhs);
        let l_ptr = self.ctx.types.is_ptr(lhs.ty);
        let r_ptr = self.ctx.types.is_ptr(rhs.ty);

        match (l_ptr, r_ptr) {
            (false, false) => {
                let lhs_span = lhs.span;
                self.numeric_binop(op, lhs, rhs, lhs_span)
            }
            (true, false) => {
                let rhs = self.scale_index(rhs, lhs.ty);
                let ty = lhs.ty;
                Ok(self.fold_or_build(op, lhs, rhs, ty))
            }
            (false, true) => {
                if op == BinOp::Sub {
                    self.ctx
                        .error(lhs.span, "cannot subtract a pointer from an integer");
                }
                let lhs = self.scale_index(lhs, rhs.ty);
                let ty = rhs.ty;
                Ok(self.fold_or_build(op, rhs, lhs, ty))
            }
            (true, true) => {
                if op != BinOp::Sub || lhs.ty != rhs.ty {
                    self.ctx.error(lhs.span, "invalid pointer arithmetic");
                }
                // (p - q) / sizeof(*p), as a signed integer.
                let pointee = self.ctx.types.pointee(lhs.ty).unwrap_or(Ty::CHAR);
                let size = self.ctx.types.size_of(pointee).max(1);
                let diff_ty = self.ctx.types.ptrdiff();
                let span = lhs.span.merge(rhs.span);
                let diff = Expr::new(
                    ExprKind::Binary {
                        op: BinOp::Sub,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    diff_ty,
                    span,
                );
                if size == 1 {
                    return Ok(diff);
                }
                let size_lit = Expr::new(ExprKind::IntLit(size as i64), diff_ty, span);
                Ok(Expr::new(
                    ExprKind::Binary {
                        op: BinOp::Div,
                        lhs: Box::new(diff),
                        rhs: Box::new(size_lit),
                    },
                    diff_ty,
                    span,
                ))
            }
        }
    }

    /// Multiply an index by `sizeof(*ptr)` for pointer arithmetic.
    fn scale_index(&mut self, index: Expr, ptr_ty: Ty) -> Expr {
        let pointee = self.ctx.types.pointee(ptr_ty).unwrap_or(Ty::CHAR);
        let size = self.ctx.types.size_of(pointee).max(1);
        let diff_ty = self.ctx.types.ptrdiff();
        let index = self.make_cast(index, diff_ty, false);
        if size == 1 {
            return index;
        }
        let span = index.span;
        if let Some(v) = index.int_value() {
            return Expr::new(ExprKind::IntLit(v * size as i64), diff_ty, span);
        }
        let size_lit = Expr::new(ExprKind::IntLit(size as i64), diff_ty, span);
        Expr::new(
            ExprKind::Binary {
                op: BinOp::Mul,
                lhs: Box::new(index),
                rhs: Box::new(size_lit),
            },
            diff_ty,
            span,
        )
    }

    fn arith_binop(&mut self, op: BinOp, lhs: Expr, rhs: Expr) -> PResult<Expr> {
        let lhs = self.decay(lhs);
        let rhs = self.decay(rhs);
        let span = lhs.span.merge(rhs.span);
        self.numeric_binop(op, lhs, rhs, span)
    }

    fn numeric_binop(&mut self, op: BinOp, lhs: Expr, rhs: Expr, span: Span) -> PResult<Expr> {
        if !self.ctx.types.is_number(lhs.ty) || !self.ctx.types.is_number(rhs.ty) {
            let msg = format!(
                "invalid operands to binary operator (`{}` and `{}`)",
                self.ctx.type_name(lhs.ty),
                self.ctx.type_name(rhs.ty)
            );
            self.ctx.error(span, msg);
            return Ok(Expr::new(ExprKind::IntLit(0), Ty::INT, span));
        }
        let is_int_only = matches!(
            op,
            BinOp::Mod | BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr
        );
        if is_int_only
            && (self.ctx.types.is_flonum(lhs.ty) || self.ctx.types.is_flonum(rhs.ty))
        {
            self.ctx
                .error(span, "operator requires integer operands");
        }
        let common = self.ctx.types.usual_arith(lhs.ty, rhs.ty);
        let lhs = self.make_cast(lhs, common, false);
        let rhs = self.make_cast(rhs, common, false);
        Ok(self.fold_or_build(op, lhs, rhs, common))
    }

    fn compare_binop(&mut self, op: BinOp, lhs: Expr, rhs: Expr) -> PResult<Expr> {
        let lhs = self.decay(lhs);
        let rhs = self.decay(rhs);
        let span = lhs.span.merge(rhs.span);

        let l_ptr = self.ctx.types.is_ptr(lhs.ty);
        let r_ptr = self.ctx.types.is_ptr(rhs.ty);
        let (lhs, rhs) = if l_ptr || r_ptr {
            if l_ptr && r_ptr && lhs.ty != rhs.ty {
                self.ctx
                    .error(span, "comparison of incompatible pointer types");
            }
            // Allow the null-pointer constant on either side.
            let ptr_ty = if l_ptr { lhs.ty } else { rhs.ty };
            let lhs = self.make_cast(lhs, ptr_ty, false);
            let rhs = self.make_cast(rhs, ptr_ty, false);
            (lhs, rhs)
        } else {
            if !self.ctx.types.is_number(lhs.ty) || !self.ctx.types.is_number(rhs.ty) {
                self.ctx.error(span, "invalid comparison operands");
                return Ok(Expr::new(ExprKind::IntLit(0), Ty::INT, span));
            }
            let common = self.ctx.types.usual_arith(lhs.ty, rhs.ty);
            let lhs = self.make_cast(lhs, common, false);
            let rhs = self.make_cast(rhs, common, false);
            (lhs, rhs)
        };

        // Comparisons yield int; operands keep their common type.
        if let (Some(l), Some(r)) = (lhs.int_value(), rhs.int_value()) {
            let unsigned = self.ctx.types.is_unsigned(lhs.ty);
            let value = fold_compare(op, l, r, unsigned);
            return Ok(Expr::new(ExprKind::IntLit(value), Ty::INT, span));
        }
        Ok(Expr::new(
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            Ty::INT,
            span,
        ))
    }

    /// Fold an all-constant operation, otherwise build the node.
    fn fold_or_build(&mut self, op: BinOp, lhs: Expr, rhs: Expr, ty: Ty) -> Expr {
        let span = lhs.span.merge(rhs.span);
        if self.ctx.types.is_fixnum(ty) {
            if let (Some(l), Some(r)) = (lhs.int_value(), rhs.int_value()) {
                let unsigned = self.ctx.types.is_unsigned(ty);
                if let Some(value) = fold_int(op, l, r, unsigned) {
                    let size = self.ctx.types.size_of(ty);
                    let value = truncate_int(value, size, unsigned);
                    return Expr::new(ExprKind::IntLit(value), ty, span);
                }
            }
        }
        if self.ctx.types.is_flonum(ty) {
            if let (ExprKind::FloatLit(l), ExprKind::FloatLit(r)) = (&lhs.kind, &rhs.kind) {
                if let Some(value) = fold_float(op, *l, *r) {
                    return Expr::new(ExprKind::FloatLit(value), ty, span);
                }
            }
        }
        Expr::new(
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
            span,
        )
    }

    fn cast_expr(&mut self) -> PResult<Expr> {
        if self.at(&TokenKind::LParen) && self.type_starts_at(1) {
            let start = self.advance().span;
            let ty = self.type_name()?;
            self.expect(&TokenKind::RParen, "`)`")?;
            if self.at(&TokenKind::LBrace) {
                return self.compound_literal(ty, start);
            }
            let sub = self.cast_expr()?;
            let sub = self.decay(sub);
            return Ok(self.make_cast(sub, ty, true));
        }
        self.unary()
    }

    fn type_starts_at(&self, n: usize) -> bool {
        match self.peek_kind(n) {
            TokenKind::Keyword(kw) => matches!(
                kw,
                Keyword::Void
                    | Keyword::Char
                    | Keyword::Short
                    | Keyword::Int
                    | Keyword::Long
                    | Keyword::Float
                    | Keyword::Double
                    | Keyword::Signed
                    | Keyword::Unsigned
                    | Keyword::Struct
                    | Keyword::Union
                    | Keyword::Enum
                    | Keyword::Const
                    | Keyword::Volatile
            ),
            TokenKind::Ident(name) => self.ctx.find_typedef(self.cur_scope, *name).is_some(),
            _ => false,
        }
    }

    fn compound_literal(&mut self, ty: Ty, start: Span) -> PResult<Expr> {
        if !self.ctx.types.is_struct(ty) {
            self.ctx
                .error(start, "compound literal requires a struct type");
        }

        // Allocate the hidden anonymous variable in the current scope.
        let anon = self.ctx.interner.synthesize("complit");
        let var = VarInfo::new(anon, ty, Storage::empty(), Qualifiers::empty());
        let index = self.ctx.scopes[self.cur_scope]
            .add_var(var)
            .expect("anonymous name collision");
        let scope = self.cur_scope;

        self.expect(&TokenKind::LBrace, "`{`")?;
        let mut inits = Vec::new();
        let mut member = 0usize;
        while !self.at(&TokenKind::RBrace) {
            let value = self.assign()?;
            let value = self.decay(value);
            if let TyKind::Struct(id) = *self.ctx.types.kind(ty) {
                let def = self.ctx.types.struct_def(id);
                if member < def.members.len() {
                    let mty = def.members[member].ty;
                    let target = Expr::new(
                        ExprKind::Member {
                            target: Box::new(Expr::new(
                                ExprKind::Var { name: anon, scope },
                                ty,
                                start,
                            )),
                            struct_id: id,
                            member,
                        },
                        mty,
                        value.span,
                    );
                    let value = self.make_cast(value, mty, false);
                    let span = value.span;
                    inits.push(Expr::new(
                        ExprKind::Assign {
                            lhs: Box::new(target),
                            rhs: Box::new(value),
                        },
                        mty,
                        span,
                    ));
                } else {
                    self.ctx
                        .error(value.span, "too many initializers for compound literal");
                }
            }
            member += 1;
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        let end = self.expect(&TokenKind::RBrace, "`}`")?;

        Ok(Expr::new(
            ExprKind::CompoundLit {
                scope,
                index,
                inits,
            },
            ty,
            start.merge(end),
        ))
    }

    fn unary(&mut self) -> PResult<Expr> {
        let start = self.span();
        match *self.kind() {
            TokenKind::Plus => {
                self.advance();
                let sub = self.cast_expr()?;
                let sub = self.decay(sub);
                let ty = self.ctx.types.promote(sub.ty);
                Ok(self.make_cast(sub, ty, false))
            }
            TokenKind::Minus => {
                self.advance();
                let sub = self.cast_expr()?;
                let sub = self.decay(sub);
                if !self.ctx.types.is_number(sub.ty) {
                    self.ctx.error(sub.span, "negation of a non-number");
                }
                let ty = self.ctx.types.promote(sub.ty);
                let sub = self.make_cast(sub, ty, false);
                let span = start.merge(sub.span);
                if let Some(v) = sub.int_value() {
                    let size = self.ctx.types.size_of(ty);
                    let unsigned = self.ctx.types.is_unsigned(ty);
                    return Ok(Expr::new(
                        ExprKind::IntLit(truncate_int(v.wrapping_neg(), size, unsigned)),
                        ty,
                        span,
                    ));
                }
                if let ExprKind::FloatLit(v) = sub.kind {
                    return Ok(Expr::new(ExprKind::FloatLit(-v), ty, span));
                }
                Ok(Expr::new(
                    ExprKind::Unary {
                        op: UnOp::Neg,
                        sub: Box::new(sub),
                    },
                    ty,
                    span,
                ))
            }
            TokenKind::Tilde => {
                self.advance();
                let sub = self.cast_expr()?;
                let sub = self.decay(sub);
                if !self.ctx.types.is_fixnum(sub.ty) {
                    self.ctx.error(sub.span, "bitwise complement of a non-integer");
                }
                let ty = self.ctx.types.promote(sub.ty);
                let sub = self.make_cast(sub, ty, false);
                let span = start.merge(sub.span);
                if let Some(v) = sub.int_value() {
                    let size = self.ctx.types.size_of(ty);
                    let unsigned = self.ctx.types.is_unsigned(ty);
                    return Ok(Expr::new(
                        ExprKind::IntLit(truncate_int(!v, size, unsigned)),
                        ty,
                        span,
                    ));
                }
                Ok(Expr::new(
                    ExprKind::Unary {
                        op: UnOp::BitNot,
                        sub: Box::new(sub),
                    },
                    ty,
                    span,
                ))
            }
            TokenKind::Bang => {
                self.advance();
                let sub = self.cast_expr()?;
                let sub = self.decay(sub);
                let span = start.merge(sub.span);
                if let Some(v) = sub.int_value() {
                    return Ok(Expr::new(ExprKind::IntLit((v == 0) as i64), Ty::INT, span));
                }
                Ok(Expr::new(
                    ExprKind::Unary {
                        op: UnOp::Not,
                        sub: Box::new(sub),
                    },
                    Ty::INT,
                    span,
                ))
            }
            TokenKind::Star => {
                self.advance();
                let sub = self.cast_expr()?;
                let sub = self.decay(sub);
                let span = start.merge(sub.span);
                match self.ctx.types.pointee(sub.ty) {
                    Some(pointee) => Ok(Expr::new(ExprKind::Deref(Box::new(sub)), pointee, span)),
                    None => {
                        self.ctx.error(span, "dereference of a non-pointer");
                        Ok(Expr::new(ExprKind::IntLit(0), Ty::INT, span))
                    }
                }
            }
            TokenKind::Amp => {
                self.advance();
                // Arrays do not decay under `&`.
                let sub = self.unary()?;
                self.require_lvalue(&sub);
                let ty = self.ctx.types.ptr_to(sub.ty);
                let span = start.merge(sub.span);
                Ok(Expr::new(ExprKind::Addr(Box::new(sub)), ty, span))
            }
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                let inc = self.at(&TokenKind::PlusPlus);
                self.advance();
                let sub = self.unary()?;
                self.make_incdec(true, inc, sub, start)
            }
            TokenKind::Keyword(Keyword::Sizeof) => {
                self.advance();
                let ty = if self.at(&TokenKind::LParen) && self.type_starts_at(1) {
                    self.advance();
                    let ty = self.type_name()?;
                    self.expect(&TokenKind::RParen, "`)`")?;
                    ty
                } else {
                    // No decay under sizeof.
                    let sub = self.unary()?;
                    sub.ty
                };
                let size = self.ctx.types.size_of(ty);
                Ok(Expr::new(ExprKind::IntLit(size as i64), Ty::ULONG, start))
            }
            _ => self.postfix(),
        }
    }

    fn make_incdec(&mut self, pre: bool, inc: bool, sub: Expr, start: Span) -> PResult<Expr> {
        self.require_lvalue(&sub);
        if !self.ctx.types.is_scalar(sub.ty) || self.ctx.types.is_array(sub.ty) {
            self.ctx
                .error(sub.span, "increment target is not a scalar lvalue");
        }
        let ty = sub.ty;
        let span = start.merge(sub.span);
        Ok(Expr::new(
            ExprKind::IncDec {
                pre,
                inc,
                sub: Box::new(sub),
            },
            ty,
            span,
        ))
    }

    fn postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            let start = self.span();
            match *self.kind() {
                TokenKind::LParen => {
                    self.advance();
                    expr = self.call(expr)?;
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.expr()?;
                    let end = self.expect(&TokenKind::RBracket, "`]`")?;
                    let sum = self.add_sub(BinOp::Add, expr, index)?;
                    let pointee = match self.ctx.types.pointee(sum.ty) {
                        Some(p) => p,
                        None => {
                            self.ctx.error(start, "subscript of a non-pointer");
                            Ty::INT
                        }
                    };
                    let span = sum.span.merge(end);
                    expr = Expr::new(ExprKind::Deref(Box::new(sum)), pointee, span);
                }
                TokenKind::Dot => {
                    self.advance();
                    expr = self.member_access(expr, false)?;
                }
                TokenKind::Arrow => {
                    self.advance();
                    expr = self.member_access(expr, true)?;
                }
                TokenKind::PlusPlus | TokenKind::MinusMinus => {
                    let inc = self.at(&TokenKind::PlusPlus);
                    self.advance();
                    expr = self.make_incdec(false, inc, expr, start)?;
                }
                _ => return Ok(expr),
            }
        }
    }

    fn member_access(&mut self, target: Expr, through_ptr: bool) -> PResult<Expr> {
        let (member_name, name_span) = self.expect_ident("member name")?;

        let target = if through_ptr {
            let target = self.decay(target);
            match self.ctx.types.pointee(target.ty) {
                Some(pointee) => {
                    let span = target.span;
                    Expr::new(ExprKind::Deref(Box::new(target)), pointee, span)
                }
                None => {
                    self.ctx.error(target.span, "`->` on a non-pointer");
                    return Ok(Expr::new(ExprKind::IntLit(0), Ty::INT, name_span));
                }
            }
        } else {
            target
        };

        let id = match *self.ctx.types.kind(target.ty) {
            TyKind::Struct(id) => id,
            _ => {
                self.ctx
                    .error(target.span, "member access on a non-struct value");
                return Ok(Expr::new(ExprKind::IntLit(0), Ty::INT, name_span));
            }
        };
        match self.ctx.types.struct_def(id).member(member_name) {
            Some((index, info)) => {
                let ty = info.ty;
                let span = target.span.merge(name_span);
                Ok(Expr::new(
                    ExprKind::Member {
                        target: Box::new(target),
                        struct_id: id,
                        member: index,
                    },
                    ty,
                    span,
                ))
            }
            None => {
                let msg = format!("unknown member `{}`", self.ctx.str(member_name));
                self.ctx.error(name_span, msg);
                Ok(Expr::new(ExprKind::IntLit(0), Ty::INT, name_span))
            }
        }
    }

    fn call(&mut self, callee: Expr) -> PResult<Expr> {
        // Resolve the signature: a function designator or a pointer to
        // function.
        let fn_ty = if self.ctx.types.is_func(callee.ty) {
            Some(callee.ty)
        } else {
            self.ctx
                .types
                .pointee(callee.ty)
                .filter(|p| self.ctx.types.is_func(*p))
        };
        let (ret, param_tys, vararg) = match fn_ty {
            Some(fty) => match self.ctx.types.kind(fty).clone() {
                TyKind::Func { ret, params, vararg } => (ret, params, vararg),
                _ => unreachable!(),
            },
            None => {
                self.ctx
                    .error(callee.span, "called object is not a function");
                (Ty::INT, Vec::new(), true)
            }
        };

        let mut args = Vec::new();
        if !self.eat(&TokenKind::RParen) {
            loop {
                let arg = self.assign()?;
                let arg = self.decay(arg);
                let arg = match param_tys.get(args.len()) {
                    Some(&pty) => {
                        self.check_assignable(pty, &arg, arg.span);
                        self.make_cast(arg, pty, false)
                    }
                    None => {
                        // Default argument promotions for varargs and
                        // unprototyped calls.
                        let promoted = match self.ctx.types.kind(arg.ty) {
                            TyKind::Flonum(FlonumKind::Float) => {
                                self.ctx.types.flonum(FlonumKind::Double)
                            }
                            TyKind::Fixnum { .. } => self.ctx.types.promote(arg.ty),
                            _ => arg.ty,
                        };
                        self.make_cast(arg, promoted, false)
                    }
                };
                args.push(arg);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RParen, "`)`")?;
        }

        if args.len() < param_tys.len() || (!vararg && args.len() > param_tys.len()) {
            let msg = format!(
                "wrong number of arguments: expected {}, found {}",
                param_tys.len(),
                args.len()
            );
            self.ctx.error(callee.span, msg);
        }

        let span = callee.span;
        Ok(Expr::new(
            ExprKind::Call {
                callee: Box::new(callee),
                args,
            },
            ret,
            span,
        ))
    }

    fn primary(&mut self) -> PResult<Expr> {
        let start = self.span();
        match self.kind().clone() {
            TokenKind::IntLit {
                value,
                kind,
                unsigned,
            } => {
                self.advance();
                let ty = self.ctx.types.fixnum(kind, unsigned);
                Ok(Expr::new(ExprKind::IntLit(value), ty, start))
            }
            TokenKind::FloatLit { value, single } => {
                self.advance();
                let kind = if single {
                    FlonumKind::Float
                } else {
                    FlonumKind::Double
                };
                let ty = self.ctx.types.flonum(kind);
                Ok(Expr::new(ExprKind::FloatLit(value), ty, start))
            }
            TokenKind::CharLit(value) => {
                self.advance();
                Ok(Expr::new(ExprKind::IntLit(value), Ty::INT, start))
            }
            TokenKind::StrLit(first) => {
                self.advance();
                // Adjacent string literals concatenate.
                let mut text = first;
                let mut end = start;
                loop {
                    let next = match self.kind() {
                        TokenKind::StrLit(s) => s.clone(),
                        _ => break,
                    };
                    text.push_str(&next);
                    end = self.advance().span;
                }
                let index = self.ctx.add_string(&text);
                let ty = self.ctx.types.ptr_to(Ty::CHAR);
                Ok(Expr::new(ExprKind::StrLit(index), ty, start.merge(end)))
            }
            TokenKind::Ident(name) => {
                self.advance();
                match self.ctx.find_var(self.cur_scope, name) {
                    Some((scope, index)) => {
                        let var = self.ctx.var(scope, index);
                        if var.storage.contains(Storage::ENUM_MEMBER) {
                            return Ok(Expr::new(
                                ExprKind::IntLit(var.enum_value),
                                Ty::INT,
                                start,
                            ));
                        }
                        Ok(Expr::new(ExprKind::Var { name, scope }, var.ty, start))
                    }
                    None => {
                        let msg = format!("undeclared identifier `{}`", self.ctx.str(name));
                        self.ctx.error(start, msg);
                        Ok(Expr::new(ExprKind::IntLit(0), Ty::INT, start))
                    }
                }
            }
            TokenKind::LParen => {
                self.advance();
                if self.at(&TokenKind::LBrace) {
                    // GNU statement expression: `({ ... })`.
                    let block = self.block()?;
                    let end = self.expect(&TokenKind::RParen, "`)`")?;
                    let ty = last_expr_type(&block).unwrap_or(Ty::VOID);
                    return Ok(Expr::new(
                        ExprKind::BlockExpr(Box::new(block)),
                        ty,
                        start.merge(end),
                    ));
                }
                let expr = self.expr()?;
                self.expect(&TokenKind::RParen, "`)`")?;
                Ok(expr)
            }
            _ => Err(SyntaxError::new(
                format!("expected expression, found {}", self.describe()),
                start,
            )),
        }
    }

    // ------------------------------------------------------------------
    // Conversion helpers
    // ------------------------------------------------------------------

    /// Arrays decay to pointers (and function designators to function
    /// pointers) in value contexts.
    fn decay(&mut self, expr: Expr) -> Expr {
        if let Some(elem) = self.ctx.types.array_elem(expr.ty) {
            let ty = self.ctx.types.ptr_to(elem);
            let span = expr.span;
            return Expr::new(ExprKind::Addr(Box::new(expr)), ty, span);
        }
        if self.ctx.types.is_func(expr.ty) {
            let ty = self.ctx.types.ptr_to(expr.ty);
            let span = expr.span;
            return Expr::new(ExprKind::Addr(Box::new(expr)), ty, span);
        }
        expr
    }

    /// Wrap `expr` in a cast to `ty`, folding constant operands. Every
    /// conversion in the tree goes through here, so the backends never
    /// have to infer one.
    fn make_cast(&mut self, expr: Expr, ty: Ty, _explicit: bool) -> Expr {
        if expr.ty == ty {
            return expr;
        }
        let span = expr.span;

        if self.ctx.types.is_fixnum(ty) {
            if let Some(v) = expr.int_value() {
                let size = self.ctx.types.size_of(ty);
                let unsigned = self.ctx.types.is_unsigned(ty);
                return Expr::new(ExprKind::IntLit(truncate_int(v, size, unsigned)), ty, span);
            }
            if let ExprKind::FloatLit(v) = expr.kind {
                let size = self.ctx.types.size_of(ty);
                let unsigned = self.ctx.types.is_unsigned(ty);
                return Expr::new(
                    ExprKind::IntLit(truncate_int(v as i64, size, unsigned)),
                    ty,
                    span,
                );
            }
        }
        if self.ctx.types.is_flonum(ty) {
            match expr.kind {
                ExprKind::IntLit(v) => {
                    return Expr::new(ExprKind::FloatLit(v as f64), ty, span);
                }
                ExprKind::FloatLit(v) => {
                    let v = match self.ctx.types.kind(ty) {
                        TyKind::Flonum(FlonumKind::Float) => v as f32 as f64,
                        _ => v,
                    };
                    return Expr::new(ExprKind::FloatLit(v), ty, span);
                }
                _ => {}
            }
        }

        Expr::new(ExprKind::Cast(Box::new(expr)), ty, span)
    }

    fn require_lvalue(&mut self, expr: &Expr) {
        if !expr.is_lvalue() {
            self.ctx.error(expr.span, "expression is not an lvalue");
        }
    }

    /// Parse a constant expression and require an integer literal after
    /// folding.
    fn const_expr(&mut self) -> PResult<i64> {
        let expr = self.conditional()?;
        match expr.int_value() {
            Some(v) => Ok(v),
            None => Err(SyntaxError::new("expression is not constant", expr.span)),
        }
    }
}

/// The type of a block's final expression statement, for statement
/// expressions.
fn last_expr_type(block: &Stmt) -> Option<Ty> {
    match &block.kind {
        StmtKind::Block { stmts, .. } => match stmts.last() {
            Some(Stmt {
                kind: StmtKind::Expr(e),
                ..
            }) => Some(e.ty),
            _ => None,
        },
        _ => None,
    }
}

fn truncate_int(value: i64, size: usize, unsigned: bool) -> i64 {
    if size >= 8 {
        return value;
    }
    let bits = size * 8;
    let mask = (1i64 << bits) - 1;
    let truncated = value & mask;
    if !unsigned && truncated & (1i64 << (bits - 1)) != 0 {
        truncated | !mask
    } else {
        truncated
    }
}

fn fold_int(op: BinOp, l: i64, r: i64, unsigned: bool) -> Option<i64> {
    Some(match op {
        BinOp::Add => l.wrapping_add(r),
        BinOp::Sub => l.wrapping_sub(r),
        BinOp::Mul => l.wrapping_mul(r),
        BinOp::Div => {
            if r == 0 {
                return None;
            } else if unsigned {
                ((l as u64) / (r as u64)) as i64
            } else {
                l.wrapping_div(r)
            }
        }
        BinOp::Mod => {
            if r == 0 {
                return None;
            } else if unsigned {
                ((l as u64) % (r as u64)) as i64
            } else {
                l.wrapping_rem(r)
            }
        }
        BinOp::BitAnd => l & r,
        BinOp::BitOr => l | r,
        BinOp::BitXor => l ^ r,
        BinOp::Shl => l.wrapping_shl(r as u32 & 63),
        BinOp::Shr => {
            if unsigned {
                ((l as u64).wrapping_shr(r as u32 & 63)) as i64
            } else {
                l.wrapping_shr(r as u32 & 63)
            }
        }
        _ => fold_compare(op, l, r, unsigned),
    })
}

fn fold_compare(op: BinOp, l: i64, r: i64, unsigned: bool) -> i64 {
    let result = if unsigned {
        let (l, r) = (l as u64, r as u64);
        match op {
            BinOp::Eq => l == r,
            BinOp::Ne => l != r,
            BinOp::Lt => l < r,
            BinOp::Le => l <= r,
            BinOp::Gt => l > r,
            BinOp::Ge => l >= r,
            _ => unreachable!("non-comparison operator"),
        }
    } else {
        match op {
            BinOp::Eq => l == r,
            BinOp::Ne => l != r,
            BinOp::Lt => l < r,
            BinOp::Le => l <= r,
            BinOp::Gt => l > r,
            BinOp::Ge => l >= r,
            _ => unreachable!("non-comparison operator"),
        }
    };
    result as i64
}

fn fold_float(op: BinOp, l: f64, r: f64) -> Option<f64> {
    Some(match op {
        BinOp::Add => l + r,
        BinOp::Sub => l - r,
        BinOp::Mul => l * r,
        BinOp::Div => l / r,
        _ => return None,
    })
}
