//! Source-level frontend: tokens, lexer, AST and the parser/semantic
//! analyzer.

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod token;

pub use ast::{Declaration, Expr, ExprKind, Function, Program, Stmt, StmtKind};
pub use lexer::{tokenize, LexError, Lexer};
pub use parser::{parse_into, SyntaxError};
pub use token::{Keyword, Token, TokenKind};

#[cfg(test)]
mod tests {
    use super::ast::{BinOp, ExprKind, StmtKind};
    use super::*;
    use crate::context::CompilerContext;
    use crate::types::{FlonumKind, TargetSizes, Ty, TyKind};

    fn parse(src: &str) -> (CompilerContext, Program) {
        let mut ctx = CompilerContext::new(TargetSizes::lp64());
        let source = ctx.source_map.add_inline(src);
        let tokens = tokenize(src, source, &ctx.interner).expect("lex error");
        let mut program = Program::default();
        parse_into(&mut ctx, tokens, &mut program);
        (ctx, program)
    }

    fn body_stmts(program: &Program) -> &[Stmt] {
        let func = program.functions().next().expect("no function");
        match &func.body[0].kind {
            StmtKind::Block { stmts, .. } => stmts,
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_simple_function_parses_clean() {
        let (ctx, program) = parse("int f(int x) { return x + 1; }");
        assert!(!ctx.has_errors(), "{}", ctx.render_diagnostics());
        let func = program.functions().next().unwrap();
        assert_eq!(func.params.len(), 1);
        match ctx.types.kind(func.ty) {
            TyKind::Func { ret, params, vararg } => {
                assert_eq!(*ret, Ty::INT);
                assert_eq!(params, &[Ty::INT]);
                assert!(!vararg);
            }
            other => panic!("not a function type: {other:?}"),
        }
    }

    #[test]
    fn test_implicit_cast_inserted_for_mixed_arith() {
        let (ctx, program) = parse("long f(int x, long y) { return x + y; }");
        assert!(!ctx.has_errors());
        let stmts = body_stmts(&program);
        let StmtKind::Return(Some(value)) = &stmts[0].kind else {
            panic!("expected return");
        };
        // x + y: x is cast to long; the sum is already long.
        assert_eq!(value.ty, Ty::LONG);
        let ExprKind::Binary { op: BinOp::Add, lhs, .. } = &value.kind else {
            panic!("expected add, got {:?}", value.kind);
        };
        assert!(matches!(lhs.kind, ExprKind::Cast(_)));
        assert_eq!(lhs.ty, Ty::LONG);
    }

    #[test]
    fn test_usual_arith_conversion_int_float() {
        let (ctx, program) = parse("double f(int x, double d) { return x * d; }");
        assert!(!ctx.has_errors());
        let stmts = body_stmts(&program);
        let StmtKind::Return(Some(value)) = &stmts[0].kind else {
            panic!("expected return");
        };
        let ExprKind::Binary { lhs, rhs, .. } = &value.kind else {
            panic!("expected binary");
        };
        assert!(matches!(
            ctx.types.kind(lhs.ty),
            TyKind::Flonum(FlonumKind::Double)
        ));
        assert_eq!(lhs.ty, rhs.ty);
        assert!(matches!(lhs.kind, ExprKind::Cast(_)));
    }

    #[test]
    fn test_pointer_arithmetic_scaled() {
        let (ctx, program) = parse("int f(int *p) { return *(p + 2); }");
        assert!(!ctx.has_errors());
        let stmts = body_stmts(&program);
        let StmtKind::Return(Some(value)) = &stmts[0].kind else {
            panic!("expected return");
        };
        let ExprKind::Deref(sum) = &value.kind else {
            panic!("expected deref");
        };
        let ExprKind::Binary { op: BinOp::Add, rhs, .. } = &sum.kind else {
            panic!("expected add");
        };
        // The integer side is pre-multiplied by sizeof(int).
        assert_eq!(rhs.int_value(), Some(8));
    }

    #[test]
    fn test_pointer_difference_divided() {
        let (ctx, program) = parse("long f(long *p, long *q) { return p - q; }");
        assert!(!ctx.has_errors());
        let stmts = body_stmts(&program);
        let StmtKind::Return(Some(value)) = &stmts[0].kind else {
            panic!("expected return");
        };
        let ExprKind::Binary { op: BinOp::Div, rhs, .. } = &value.kind else {
            panic!("expected division by element size, got {:?}", value.kind);
        };
        assert_eq!(rhs.int_value(), Some(8));
    }

    #[test]
    fn test_constant_folding() {
        let (ctx, program) = parse("int f(void) { return 6 * 7 + (3 < 4); }");
        assert!(!ctx.has_errors());
        let stmts = body_stmts(&program);
        let StmtKind::Return(Some(value)) = &stmts[0].kind else {
            panic!("expected return");
        };
        assert_eq!(value.int_value(), Some(43));
    }

    #[test]
    fn test_sizeof_folds_without_decay() {
        let (ctx, program) = parse("long f(void) { int a[10]; return sizeof(a); }");
        assert!(!ctx.has_errors());
        let stmts = body_stmts(&program);
        let StmtKind::Return(Some(value)) = &stmts[1].kind else {
            panic!("expected return");
        };
        // sizeof(int[10]) = 40, and a cast wraps the unsigned literal
        // into the return type.
        match &value.kind {
            ExprKind::IntLit(v) => assert_eq!(*v, 40),
            other => panic!("expected folded literal, got {other:?}"),
        }
    }

    #[test]
    fn test_typedef_name_disambiguation() {
        let (ctx, program) = parse("typedef int myint; myint g(myint x) { myint y = x; return y; }");
        assert!(!ctx.has_errors(), "{}", ctx.render_diagnostics());
        let func = program.functions().next().unwrap();
        match ctx.types.kind(func.ty) {
            TyKind::Func { ret, .. } => assert_eq!(*ret, Ty::INT),
            _ => panic!("not a function"),
        }
    }

    #[test]
    fn test_enum_members_fold_to_constants() {
        let (ctx, program) = parse("enum { A, B = 10, C }; int f(void) { return A + B + C; }");
        assert!(!ctx.has_errors());
        let stmts = body_stmts(&program);
        let StmtKind::Return(Some(value)) = &stmts[0].kind else {
            panic!("expected return");
        };
        assert_eq!(value.int_value(), Some(21));
    }

    #[test]
    fn test_switch_cases_collected_at_parse_time() {
        let (ctx, program) = parse(
            "int f(int x) { switch (x) { case 1: return 1; case 7: return 2; default: return 3; } }",
        );
        assert!(!ctx.has_errors());
        let stmts = body_stmts(&program);
        let StmtKind::Switch { cases, has_default, .. } = &stmts[0].kind else {
            panic!("expected switch");
        };
        assert_eq!(cases, &[1, 7]);
        assert!(has_default);
    }

    #[test]
    fn test_non_lvalue_assignment_reported() {
        let (ctx, _) = parse("int f(int x) { 1 = x; return 0; }");
        assert!(ctx.has_errors());
        assert!(ctx.render_diagnostics().contains("not an lvalue"));
    }

    #[test]
    fn test_undeclared_identifier_reported_and_continues() {
        let (ctx, program) = parse("int f(void) { return missing; } int g(void) { return 1; }");
        assert!(ctx.has_errors());
        assert!(ctx.render_diagnostics().contains("undeclared identifier"));
        // Translation continued past the semantic error.
        assert_eq!(program.functions().count(), 2);
    }

    #[test]
    fn test_syntax_error_resynchronizes() {
        let (ctx, program) = parse("int f(void) { return 1 +; } int g(void) { return 2; }");
        assert!(ctx.has_errors());
        assert_eq!(program.functions().count(), 2);
    }

    #[test]
    fn test_struct_member_access_resolved() {
        let (ctx, program) = parse(
            "struct point { int x; int y; }; int f(struct point *p) { return p->y; }",
        );
        assert!(!ctx.has_errors(), "{}", ctx.render_diagnostics());
        let stmts = body_stmts(&program);
        let StmtKind::Return(Some(value)) = &stmts[0].kind else {
            panic!("expected return");
        };
        let ExprKind::Member { member, .. } = &value.kind else {
            panic!("expected member access, got {:?}", value.kind);
        };
        assert_eq!(*member, 1);
    }

    #[test]
    fn test_array_subscript_lowered_to_deref() {
        let (ctx, program) = parse("int f(int *p) { return p[3]; }");
        assert!(!ctx.has_errors());
        let stmts = body_stmts(&program);
        let StmtKind::Return(Some(value)) = &stmts[0].kind else {
            panic!("expected return");
        };
        assert!(matches!(value.kind, ExprKind::Deref(_)));
    }

    #[test]
    fn test_function_pointer_declarator() {
        let (ctx, _) = parse("int apply(int (*fn)(int), int x) { return fn(x); }");
        assert!(!ctx.has_errors(), "{}", ctx.render_diagnostics());
    }

    #[test]
    fn test_duplicate_case_reported() {
        let (ctx, _) = parse("int f(int x) { switch (x) { case 1: case 1: return 0; } return 1; }");
        assert!(ctx.has_errors());
        assert!(ctx.render_diagnostics().contains("duplicate case"));
    }
}
