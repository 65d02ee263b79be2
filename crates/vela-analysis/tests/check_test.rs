//! Checker tests over programmatically built ASTs.

use vela_analysis::{check_program, Entity};
use vela_common::Position;
use vela_runtime::package::Packages;
use vela_syntax::ast::*;
use vela_syntax::op::{AssignOp, BinaryOp};

fn main_fn(b: &mut AstBuilder, body: Vec<Stmt>) -> Decl {
    Decl::Func(FuncDecl {
        name: b.ident("main"),
        typ: FuncTypeExpr {
            params: vec![],
            results: vec![],
            variadic: false,
        },
        body,
        pos: Position::at(1, 1),
    })
}

fn file(b: &mut AstBuilder, decls: Vec<Decl>) -> File {
    File {
        path: "main.vela".to_string(),
        package: b.ident("main"),
        imports: vec![],
        decls,
    }
}

#[test]
fn untyped_constant_arithmetic_folds_to_seven() {
    // var x = 1 + 2*3
    let mut b = AstBuilder::new();
    let two_three = {
        let two = b.int(2);
        let three = b.int(3);
        b.binary(BinaryOp::Mul, two, three)
    };
    let one = b.int(1);
    let sum = b.binary(BinaryOp::Add, one, two_three);
    let sum_id = sum.id;
    let x = b.ident("x");
    let var = Decl::Var(
        VarDecl {
            names: vec![x],
            typ: None,
            values: vec![sum],
        },
        Position::at(1, 1),
    );
    let main = main_fn(&mut b, vec![]);
    let f = file(&mut b, vec![var, main]);

    let checked = check_program(vec![f], &Packages::new(), false).unwrap();
    let info = checked.info.expr(sum_id);
    assert_eq!(info.value.as_ref().unwrap().to_i64(), Some(7));
    assert!(info.is_untyped());
    assert_eq!(checked.globals.len(), 1);
    assert_eq!(
        checked.globals[0].typ.basic_kind(),
        Some(vela_runtime::types::BasicKind::Int)
    );
}

#[test]
fn constant_definition_loop_reports_both_positions() {
    // const a = b; const b = a
    let mut b = AstBuilder::new();
    let use_b = {
        let id = b.ident_at("b", Position::at(1, 11));
        b.expr(ExprKind::Ident(id))
    };
    let a_name = b.ident_at("a", Position::at(1, 7));
    let ca = Decl::Const(
        ConstDecl {
            names: vec![a_name],
            typ: None,
            values: vec![use_b],
            iota: 0,
        },
        Position::at(1, 1),
    );
    let use_a = {
        let id = b.ident_at("a", Position::at(2, 11));
        b.expr(ExprKind::Ident(id))
    };
    let b_name = b.ident_at("b", Position::at(2, 7));
    let cb = Decl::Const(
        ConstDecl {
            names: vec![b_name],
            typ: None,
            values: vec![use_a],
            iota: 0,
        },
        Position::at(2, 1),
    );
    let main = main_fn(&mut b, vec![]);
    let f = file(&mut b, vec![ca, cb, main]);

    let err = check_program(vec![f], &Packages::new(), false).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("constant definition loop"), "message: {}", msg);
    assert!(msg.contains("1:11"), "first position listed: {}", msg);
    assert!(msg.contains("2:11"), "second position listed: {}", msg);
}

#[test]
fn short_declaration_requires_a_new_variable() {
    // x := 1; x := 2  -> "no new variables on left side of :="
    let mut b = AstBuilder::new();
    let one = b.int(1);
    let x1 = b.name("x");
    let s1 = b.assign(AssignOp::Define, vec![x1], vec![one]);
    let two = b.int(2);
    let x2 = b.name("x");
    let s2 = b.assign(AssignOp::Define, vec![x2], vec![two]);
    let main = main_fn(&mut b, vec![s1, s2]);
    let f = file(&mut b, vec![main]);

    let err = check_program(vec![f], &Packages::new(), false).unwrap_err();
    assert!(
        err.message.contains("no new variables"),
        "got: {}",
        err.message
    );
}

#[test]
fn repeated_name_on_short_declaration() {
    let mut b = AstBuilder::new();
    let one = b.int(1);
    let two = b.int(2);
    let x1 = b.name("x");
    let x2 = b.name("x");
    let s = b.assign(AssignOp::Define, vec![x1, x2], vec![one, two]);
    let main = main_fn(&mut b, vec![s]);
    let f = file(&mut b, vec![main]);

    let err = check_program(vec![f], &Packages::new(), false).unwrap_err();
    assert!(
        err.message.contains("repeated on left side of :="),
        "got: {}",
        err.message
    );
}

#[test]
fn undefined_name_is_reported() {
    let mut b = AstBuilder::new();
    let y = b.name("y");
    let x = b.name("x");
    let s = b.assign(AssignOp::Define, vec![x], vec![y]);
    let main = main_fn(&mut b, vec![s]);
    let f = file(&mut b, vec![main]);

    let err = check_program(vec![f], &Packages::new(), false).unwrap_err();
    assert!(err.message.contains("undefined: y"), "got: {}", err.message);
}

#[test]
fn division_by_zero_in_constants() {
    let mut b = AstBuilder::new();
    let one = b.int(1);
    let zero = b.int(0);
    let div = b.binary(BinaryOp::Div, one, zero);
    let x = b.ident("x");
    let var = Decl::Var(
        VarDecl {
            names: vec![x],
            typ: None,
            values: vec![div],
        },
        Position::at(1, 1),
    );
    let main = main_fn(&mut b, vec![]);
    let f = file(&mut b, vec![var, main]);

    let err = check_program(vec![f], &Packages::new(), false).unwrap_err();
    assert!(
        err.message.contains("division by zero"),
        "got: {}",
        err.message
    );
}

#[test]
fn mismatched_types_in_binary_op() {
    // x := "s" + 1
    let mut b = AstBuilder::new();
    let s = b.string("s");
    let one = b.int(1);
    let sum = b.binary(BinaryOp::Add, s, one);
    let x = b.name("x");
    let stmt = b.assign(AssignOp::Define, vec![x], vec![sum]);
    let main = main_fn(&mut b, vec![stmt]);
    let f = file(&mut b, vec![main]);

    let err = check_program(vec![f], &Packages::new(), false).unwrap_err();
    assert!(
        err.message.contains("mismatched types"),
        "got: {}",
        err.message
    );
}

#[test]
fn go_statement_can_be_disallowed() {
    let mut b = AstBuilder::new();
    let fun = {
        let f = FuncLit {
            id: b.next_id(),
            typ: FuncTypeExpr {
                params: vec![],
                results: vec![],
                variadic: false,
            },
            body: vec![],
            pos: Position::default(),
        };
        b.expr(ExprKind::FuncLit(Box::new(f)))
    };
    let call = b.call(fun, vec![]);
    let go = b.stmt(StmtKind::Go(call));
    let main = main_fn(&mut b, vec![go]);
    let f = file(&mut b, vec![main]);

    let err = check_program(vec![f], &Packages::new(), true).unwrap_err();
    assert!(
        err.message.contains("not available"),
        "got: {}",
        err.message
    );
}

#[test]
fn declaration_order_is_dependency_sorted() {
    // var b = a; var a = 1  -> a must be checked (and later emitted)
    // before b.
    let mut b = AstBuilder::new();
    let use_a = b.name("a");
    let b_name = b.ident("b");
    let var_b = Decl::Var(
        VarDecl {
            names: vec![b_name],
            typ: None,
            values: vec![use_a],
        },
        Position::at(1, 1),
    );
    let one = b.int(1);
    let a_name = b.ident("a");
    let var_a = Decl::Var(
        VarDecl {
            names: vec![a_name],
            typ: None,
            values: vec![one],
        },
        Position::at(2, 1),
    );
    let main = main_fn(&mut b, vec![]);
    let f = file(&mut b, vec![var_b, var_a, main]);

    let checked = check_program(vec![f], &Packages::new(), false).unwrap();
    // Globals are assigned in check order: a first.
    assert_eq!(checked.globals[0].name, "a");
    assert_eq!(checked.globals[1].name, "b");
}

#[test]
fn type_assertion_requires_interface_base() {
    // var x = 1; _ = x.(int) is invalid: x is not an interface.
    let mut b = AstBuilder::new();
    let one = b.int(1);
    let x_decl = b.name("x");
    let s1 = b.assign(AssignOp::Define, vec![x_decl], vec![one]);
    let x_use = b.name("x");
    let int_te = b.type_name("int");
    let assert_expr = b.expr(ExprKind::TypeAssert(Box::new(x_use), Some(int_te)));
    let blank = b.name("_");
    let s2 = b.assign(AssignOp::Assign, vec![blank], vec![assert_expr]);
    let main = main_fn(&mut b, vec![s1, s2]);
    let f = file(&mut b, vec![main]);

    let err = check_program(vec![f], &Packages::new(), false).unwrap_err();
    assert!(
        err.message.contains("not an interface"),
        "got: {}",
        err.message
    );
}

#[test]
fn native_function_call_is_checked_against_signature() {
    use std::rc::Rc;
    use vela_runtime::native::{NativeFunction, NativeImpl};
    use vela_runtime::package::{DeclaredPackage, NativeDecl};
    use vela_runtime::types::{BasicKind, Type};

    let mut packages = Packages::new();
    let upper = NativeFunction::new(
        "strings",
        "ToUpper",
        Type::func(
            vec![Type::basic(BasicKind::String)],
            vec![Type::basic(BasicKind::String)],
            false,
        ),
        NativeImpl::StrToStr(|s| s.to_uppercase()),
    );
    packages.insert(
        "strings",
        Rc::new(DeclaredPackage::new("strings").declare("ToUpper", NativeDecl::Func(upper))),
    );

    let mut b = AstBuilder::new();
    let pkg = b.name("strings");
    let sel = b.selector(pkg, "ToUpper");
    let sel_id = sel.id;
    let arg = b.string("hi");
    let call = b.call(sel, vec![arg]);
    let x = b.name("x");
    let s = b.assign(AssignOp::Define, vec![x], vec![call]);
    let main = main_fn(&mut b, vec![s]);
    let mut f = file(&mut b, vec![main]);
    f.imports.push(ImportDecl {
        path: "strings".to_string(),
        alias: None,
        pos: Position::at(1, 1),
    });

    let checked = check_program(vec![f], &packages, false).unwrap();
    match checked.info.entity(sel_id) {
        Entity::NativeFunc(nf) => assert_eq!(nf.name, "ToUpper"),
        other => panic!("expected native func, got {:?}", other),
    }

    // Wrong arity errors.
    let mut b = AstBuilder::new();
    let pkg = b.name("strings");
    let sel = b.selector(pkg, "ToUpper");
    let call = b.call(sel, vec![]);
    let stmt = b.expr_stmt(call);
    let main = main_fn(&mut b, vec![stmt]);
    let mut f = file(&mut b, vec![main]);
    f.imports.push(ImportDecl {
        path: "strings".to_string(),
        alias: None,
        pos: Position::at(1, 1),
    });
    let err = check_program(vec![f], &packages, false).unwrap_err();
    assert!(
        err.message.contains("not enough arguments"),
        "got: {}",
        err.message
    );
}
