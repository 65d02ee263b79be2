//! End-to-end scenarios: build an AST, compile, run on the VM, observe
//! exit codes and errors.

use std::collections::HashMap;
use std::rc::Rc;

use vela::{build, build_script, Options, RunOptions, RuntimeError};
use vela_common::Position;
use vela_runtime::native::{NativeFunction, NativeImpl};
use vela_runtime::package::{DeclaredPackage, NativeDecl, Packages};
use vela_runtime::types::{BasicKind, Type};
use vela_runtime::value::Value;
use vela_syntax::ast::*;
use vela_syntax::op::{AssignOp, BinaryOp, IncDecOp};

fn func_type(b: &mut AstBuilder, params: Vec<(&str, TypeExpr)>, results: Vec<TypeExpr>) -> FuncTypeExpr {
    FuncTypeExpr {
        params: params
            .into_iter()
            .map(|(name, typ)| ParamDecl {
                name: Some(b.ident(name)),
                typ,
            })
            .collect(),
        results: results
            .into_iter()
            .map(|typ| ParamDecl { name: None, typ })
            .collect(),
        variadic: false,
    }
}

fn func_decl(b: &mut AstBuilder, name: &str, typ: FuncTypeExpr, body: Vec<Stmt>) -> Decl {
    Decl::Func(FuncDecl {
        name: b.ident(name),
        typ,
        body,
        pos: Position::at(1, 1),
    })
}

fn file(b: &mut AstBuilder, imports: Vec<&str>, decls: Vec<Decl>) -> File {
    File {
        path: "main.vela".to_string(),
        package: b.ident("main"),
        imports: imports
            .into_iter()
            .map(|p| ImportDecl {
                path: p.to_string(),
                alias: None,
                pos: Position::at(1, 1),
            })
            .collect(),
        decls,
    }
}

fn func_lit(b: &mut AstBuilder, typ: FuncTypeExpr, body: Vec<Stmt>) -> Expr {
    let fl = FuncLit {
        id: b.next_id(),
        typ,
        body,
        pos: Position::default(),
    };
    b.expr(ExprKind::FuncLit(Box::new(fl)))
}

fn run_ok(files: Vec<File>) -> i32 {
    build(files, Options::default())
        .unwrap()
        .run(RunOptions::default())
        .unwrap()
}

#[test]
fn constant_arithmetic_becomes_exit_code() {
    // var x = 1 + 2*3 ; func main() int { return x }  -> exit code 7
    let mut b = AstBuilder::new();
    let mul = {
        let two = b.int(2);
        let three = b.int(3);
        b.binary(BinaryOp::Mul, two, three)
    };
    let one = b.int(1);
    let sum = b.binary(BinaryOp::Add, one, mul);
    let x = b.ident("x");
    let var = Decl::Var(
        VarDecl {
            names: vec![x],
            typ: None,
            values: vec![sum],
        },
        Position::at(1, 1),
    );
    let ret = {
        let x = b.name("x");
        b.ret(vec![x])
    };
    let int_te = b.type_name("int");
    let typ = func_type(&mut b, vec![], vec![int_te]);
    let main = func_decl(&mut b, "main", typ, vec![ret]);
    let f = file(&mut b, vec![], vec![var, main]);
    assert_eq!(run_ok(vec![f]), 7);
}

#[test]
fn defer_recover_yields_clean_exit() {
    // func main() { defer func() { recover() }(); panic("boom") }
    let mut b = AstBuilder::new();
    let rec_call = {
        let rec = b.name("recover");
        b.call(rec, vec![])
    };
    let rec_stmt = b.expr_stmt(rec_call);
    let lit = func_lit(
        &mut b,
        FuncTypeExpr {
            params: vec![],
            results: vec![],
            variadic: false,
        },
        vec![rec_stmt],
    );
    let defer_call = b.call(lit, vec![]);
    let defer_stmt = b.stmt(StmtKind::Defer(defer_call));
    let panic_call = {
        let p = b.name("panic");
        let boom = b.string("boom");
        b.call(p, vec![boom])
    };
    let panic_stmt = b.expr_stmt(panic_call);
    let typ = func_type(&mut b, vec![], vec![]);
    let main = func_decl(&mut b, "main", typ, vec![defer_stmt, panic_stmt]);
    let f = file(&mut b, vec![], vec![main]);
    assert_eq!(run_ok(vec![f]), 0);
}

#[test]
fn unrecovered_panic_surfaces() {
    let mut b = AstBuilder::new();
    let panic_call = {
        let p = b.name("panic");
        let boom = b.string("boom");
        b.call(p, vec![boom])
    };
    let panic_stmt = b.expr_stmt(panic_call);
    let typ = func_type(&mut b, vec![], vec![]);
    let main = func_decl(&mut b, "main", typ, vec![panic_stmt]);
    let f = file(&mut b, vec![], vec![main]);
    let err = build(vec![f], Options::default())
        .unwrap()
        .run(RunOptions::default())
        .unwrap_err();
    match err {
        RuntimeError::Panic(p) => {
            assert_eq!(p.to_string(), "panic: boom");
            assert!(!p.recovered());
            assert!(p.next().is_none());
        }
        other => panic!("expected panic, got {}", other),
    }
}

#[test]
fn out_of_memory_append_loop() {
    // s := []int{}; for i := 0; i < 1000; i++ { s = append(s, i) }
    let mut b = AstBuilder::new();
    let int_te = b.type_name("int");
    let slice_te = b.type_expr(TypeExprKind::Slice(Box::new(int_te)));
    let lit = b.expr(ExprKind::Composite(CompositeLit {
        typ: Some(slice_te),
        elems: vec![],
    }));
    let s0 = b.name("s");
    let init_s = b.assign(AssignOp::Define, vec![s0], vec![lit]);

    let zero = b.int(0);
    let i0 = b.name("i");
    let for_init = b.assign(AssignOp::Define, vec![i0], vec![zero]);
    let cond = {
        let i = b.name("i");
        let limit = b.int(1000);
        b.binary(BinaryOp::Lt, i, limit)
    };
    let post = {
        let i = b.name("i");
        b.stmt(StmtKind::IncDec(i, IncDecOp::Inc))
    };
    let append_call = {
        let ap = b.name("append");
        let s = b.name("s");
        let i = b.name("i");
        b.call(ap, vec![s, i])
    };
    let s1 = b.name("s");
    let body = b.assign(AssignOp::Assign, vec![s1], vec![append_call]);
    let for_stmt = b.stmt(StmtKind::For(Box::new(ForStmt {
        init: Some(for_init),
        cond: Some(cond),
        post: Some(post),
        body: vec![body],
    })));

    let typ = func_type(&mut b, vec![], vec![]);
    let main = func_decl(&mut b, "main", typ, vec![init_s, for_stmt]);
    let f = file(&mut b, vec![], vec![main]);

    let program = build(vec![f], Options::default()).unwrap();
    let err = program
        .run(RunOptions {
            max_memory: Some(1024),
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, RuntimeError::OutOfMemory), "got {}", err);
}

#[test]
fn select_with_cancelled_context_does_not_deadlock() {
    // ch1, ch2 unbuffered; a goroutine waits on ch2 before sending on
    // ch1; main selects on ch1. With the context already cancelled the
    // run reports cancellation.
    let mut b = AstBuilder::new();
    let int_te = b.type_name("int");
    let chan_te = b.type_expr(TypeExprKind::Chan(
        vela_syntax::op::ChanDir::Both,
        Box::new(int_te),
    ));
    let make1 = {
        let mk = b.name("make");
        let t = b.type_lit(chan_te.clone());
        b.call(mk, vec![t])
    };
    let ch1_decl = b.name("ch1");
    let s1 = b.assign(AssignOp::Define, vec![ch1_decl], vec![make1]);
    let make2 = {
        let mk = b.name("make");
        let t = b.type_lit(chan_te);
        b.call(mk, vec![t])
    };
    let ch2_decl = b.name("ch2");
    let s2 = b.assign(AssignOp::Define, vec![ch2_decl], vec![make2]);

    // go func() { <-ch2; ch1 <- 1 }()
    let recv2 = {
        let ch2 = b.name("ch2");
        b.expr(ExprKind::Receive(Box::new(ch2)))
    };
    let recv_stmt = b.expr_stmt(recv2);
    let send_stmt = {
        let ch1 = b.name("ch1");
        let one = b.int(1);
        b.stmt(StmtKind::Send(ch1, one))
    };
    let lit = func_lit(
        &mut b,
        FuncTypeExpr {
            params: vec![],
            results: vec![],
            variadic: false,
        },
        vec![recv_stmt, send_stmt],
    );
    let go_call = b.call(lit, vec![]);
    let go_stmt = b.stmt(StmtKind::Go(go_call));

    // select { case <-ch1: }
    let select_stmt = {
        let ch1 = b.name("ch1");
        b.stmt(StmtKind::Select(SelectStmt {
            cases: vec![SelectCase {
                comm: SelectComm::Recv {
                    value: None,
                    ok: None,
                    define: false,
                    chan: ch1,
                },
                body: vec![],
                pos: Position::default(),
            }],
            pos: Position::default(),
        }))
    };

    let typ = func_type(&mut b, vec![], vec![]);
    let main = func_decl(&mut b, "main", typ, vec![s1, s2, go_stmt, select_stmt]);
    let f = file(&mut b, vec![], vec![main]);

    let program = build(vec![f], Options::default()).unwrap();
    let (ctx, cancel) = vela::RunContext::with_cancel();
    cancel.cancel();
    let err = program
        .run(RunOptions {
            context: ctx,
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, RuntimeError::ContextCancelled), "got {}", err);
}

#[test]
fn type_assertion_comma_ok_does_not_panic() {
    // var i interface{} = "hi"; x, ok := i.(int)
    // if ok { return 1 }; return x   -> 0
    let mut b = AstBuilder::new();
    let iface_te = b.type_expr(TypeExprKind::Interface(vec![]));
    let hi = b.string("hi");
    let i_name = b.ident("i");
    let var_i = b.stmt(StmtKind::Var(VarDecl {
        names: vec![i_name],
        typ: Some(iface_te),
        values: vec![hi],
    }));
    let assert_expr = {
        let i = b.name("i");
        let int_te = b.type_name("int");
        b.expr(ExprKind::TypeAssert(Box::new(i), Some(int_te)))
    };
    let x = b.name("x");
    let ok = b.name("ok");
    let define = b.assign(AssignOp::Define, vec![x, ok], vec![assert_expr]);
    let if_ok = {
        let okv = b.name("ok");
        let one = b.int(1);
        let ret1 = b.ret(vec![one]);
        b.stmt(StmtKind::If(Box::new(IfStmt {
            init: None,
            cond: okv,
            then: vec![ret1],
            els: None,
        })))
    };
    let ret_x = {
        let x = b.name("x");
        b.ret(vec![x])
    };
    let int_te = b.type_name("int");
    let typ = func_type(&mut b, vec![], vec![int_te]);
    let main = func_decl(&mut b, "main", typ, vec![var_i, define, if_ok, ret_x]);
    let f = file(&mut b, vec![], vec![main]);
    assert_eq!(run_ok(vec![f]), 0);
}

#[test]
fn constant_definition_loop_is_a_build_error() {
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
    let typ = func_type(&mut b, vec![], vec![]);
    let main = func_decl(&mut b, "main", typ, vec![]);
    let f = file(&mut b, vec![], vec![ca, cb, main]);

    let err = build(vec![f], Options::default()).unwrap_err();
    assert!(
        err.message.contains("constant definition loop"),
        "got: {}",
        err.message
    );
    assert!(err.message.contains("1:11") && err.message.contains("2:11"));
}

#[test]
fn closures_share_captured_variables() {
    // func counter() func() int { n := 0; return func() int { n++; return n } }
    // func main() int { c := counter(); c(); c(); return c() }  -> 3
    let mut b = AstBuilder::new();
    let zero = b.int(0);
    let n0 = b.name("n");
    let init_n = b.assign(AssignOp::Define, vec![n0], vec![zero]);
    let inc = {
        let n = b.name("n");
        b.stmt(StmtKind::IncDec(n, IncDecOp::Inc))
    };
    let ret_n = {
        let n = b.name("n");
        b.ret(vec![n])
    };
    let int_te = b.type_name("int");
    let inner_typ = func_type(&mut b, vec![], vec![int_te]);
    let inner = func_lit(&mut b, inner_typ, vec![inc, ret_n]);
    let ret_inner = b.ret(vec![inner]);

    let int_te2 = b.type_name("int");
    let inner_fn_type = func_type(&mut b, vec![], vec![int_te2]);
    let fn_int = b.type_expr(TypeExprKind::Func(Box::new(inner_fn_type)));
    let counter_typ = FuncTypeExpr {
        params: vec![],
        results: vec![ParamDecl {
            name: None,
            typ: fn_int,
        }],
        variadic: false,
    };
    let counter = func_decl(&mut b, "counter", counter_typ, vec![init_n, ret_inner]);

    let counter_call = {
        let c = b.name("counter");
        b.call(c, vec![])
    };
    let c0 = b.name("c");
    let def_c = b.assign(AssignOp::Define, vec![c0], vec![counter_call]);
    let call1 = {
        let c = b.name("c");
        let call = b.call(c, vec![]);
        b.expr_stmt(call)
    };
    let call2 = {
        let c = b.name("c");
        let call = b.call(c, vec![]);
        b.expr_stmt(call)
    };
    let ret_call = {
        let c = b.name("c");
        let call = b.call(c, vec![]);
        b.ret(vec![call])
    };
    let int_te3 = b.type_name("int");
    let main_typ = func_type(&mut b, vec![], vec![int_te3]);
    let main = func_decl(&mut b, "main", main_typ, vec![def_c, call1, call2, ret_call]);
    let f = file(&mut b, vec![], vec![counter, main]);
    assert_eq!(run_ok(vec![f]), 3);
}

#[test]
fn goroutine_channel_roundtrip() {
    // ch := make(chan int, 1); go func() { ch <- 41 }(); return <-ch + 1
    let mut b = AstBuilder::new();
    let int_te = b.type_name("int");
    let chan_te = b.type_expr(TypeExprKind::Chan(
        vela_syntax::op::ChanDir::Both,
        Box::new(int_te),
    ));
    let make = {
        let mk = b.name("make");
        let t = b.type_lit(chan_te);
        let one = b.int(1);
        b.call(mk, vec![t, one])
    };
    let ch0 = b.name("ch");
    let def_ch = b.assign(AssignOp::Define, vec![ch0], vec![make]);
    let send = {
        let ch = b.name("ch");
        let v = b.int(41);
        b.stmt(StmtKind::Send(ch, v))
    };
    let lit = func_lit(
        &mut b,
        FuncTypeExpr {
            params: vec![],
            results: vec![],
            variadic: false,
        },
        vec![send],
    );
    let go_call = b.call(lit, vec![]);
    let go_stmt = b.stmt(StmtKind::Go(go_call));
    let ret = {
        let ch = b.name("ch");
        let recv = b.expr(ExprKind::Receive(Box::new(ch)));
        let one = b.int(1);
        let sum = b.binary(BinaryOp::Add, recv, one);
        b.ret(vec![sum])
    };
    let int_te2 = b.type_name("int");
    let typ = func_type(&mut b, vec![], vec![int_te2]);
    let main = func_decl(&mut b, "main", typ, vec![def_ch, go_stmt, ret]);
    let f = file(&mut b, vec![], vec![main]);
    assert_eq!(run_ok(vec![f]), 42);
}

#[test]
fn native_package_call() {
    // import "strings"; func main() int { return len(strings.ToUpper("abc")) }
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
    let call = {
        let pkg = b.name("strings");
        let sel = b.selector(pkg, "ToUpper");
        let arg = b.string("abc");
        b.call(sel, vec![arg])
    };
    let len_call = {
        let l = b.name("len");
        b.call(l, vec![call])
    };
    let ret = b.ret(vec![len_call]);
    let int_te = b.type_name("int");
    let typ = func_type(&mut b, vec![], vec![int_te]);
    let main = func_decl(&mut b, "main", typ, vec![ret]);
    let f = file(&mut b, vec!["strings"], vec![main]);

    let program = build(
        vec![f],
        Options {
            packages,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(program.run(RunOptions::default()).unwrap(), 3);
}

#[test]
fn range_over_map_sums_values() {
    // m := map[string]int{"a": 1, "b": 2}; sum := 0
    // for _, v := range m { sum += v }; return sum  -> 3
    let mut b = AstBuilder::new();
    let str_te = b.type_name("string");
    let int_te = b.type_name("int");
    let map_te = b.type_expr(TypeExprKind::Map(Box::new(str_te), Box::new(int_te)));
    let lit = {
        let ka = b.string("a");
        let va = b.int(1);
        let kb = b.string("b");
        let vb = b.int(2);
        b.expr(ExprKind::Composite(CompositeLit {
            typ: Some(map_te),
            elems: vec![
                CompositeElem {
                    key: Some(ka),
                    value: va,
                },
                CompositeElem {
                    key: Some(kb),
                    value: vb,
                },
            ],
        }))
    };
    let m0 = b.name("m");
    let def_m = b.assign(AssignOp::Define, vec![m0], vec![lit]);
    let zero = b.int(0);
    let sum0 = b.name("sum");
    let def_sum = b.assign(AssignOp::Define, vec![sum0], vec![zero]);
    let range = {
        let m = b.name("m");
        let body = {
            let sum = b.name("sum");
            let v = b.name("v");
            b.stmt(StmtKind::Assign(AssignStmt {
                op: AssignOp::Compound(BinaryOp::Add),
                lhs: vec![sum],
                rhs: vec![v],
            }))
        };
        let key = b.ident("_");
        let value = b.ident("v");
        b.stmt(StmtKind::ForRange(Box::new(ForRangeStmt {
            key: Some(key),
            value: Some(value),
            define: true,
            expr: m,
            body: vec![body],
        })))
    };
    let ret = {
        let sum = b.name("sum");
        b.ret(vec![sum])
    };
    let int_te2 = b.type_name("int");
    let typ = func_type(&mut b, vec![], vec![int_te2]);
    let main = func_decl(&mut b, "main", typ, vec![def_m, def_sum, range, ret]);
    let f = file(&mut b, vec![], vec![main]);
    assert_eq!(run_ok(vec![f]), 3);
}

#[test]
fn switch_selects_matching_case() {
    let mut b = AstBuilder::new();
    let two = b.int(2);
    let x0 = b.name("x");
    let def_x = b.assign(AssignOp::Define, vec![x0], vec![two]);
    let mk_case = |b: &mut AstBuilder, v: i64, ret: i64| {
        let val = b.int(v);
        let r = b.int(ret);
        let ret_stmt = b.ret(vec![r]);
        SwitchCase {
            values: vec![val],
            body: vec![ret_stmt],
            pos: Position::default(),
        }
    };
    let c1 = mk_case(&mut b, 1, 10);
    let c2 = mk_case(&mut b, 2, 20);
    let default = {
        let r = b.int(30);
        let ret_stmt = b.ret(vec![r]);
        SwitchCase {
            values: vec![],
            body: vec![ret_stmt],
            pos: Position::default(),
        }
    };
    let tag = b.name("x");
    let sw = b.stmt(StmtKind::Switch(Box::new(SwitchStmt {
        init: None,
        tag: Some(tag),
        cases: vec![c1, c2, default],
    })));
    let int_te = b.type_name("int");
    let typ = func_type(&mut b, vec![], vec![int_te]);
    let main = func_decl(&mut b, "main", typ, vec![def_x, sw]);
    let f = file(&mut b, vec![], vec![main]);
    assert_eq!(run_ok(vec![f]), 20);
}

#[test]
fn script_vars_seed_globals() {
    // script: var greeting string; func main() int { return len(greeting) }
    let mut b = AstBuilder::new();
    let str_te = b.type_name("string");
    let greeting = b.ident("greeting");
    let var = Decl::Var(
        VarDecl {
            names: vec![greeting],
            typ: Some(str_te),
            values: vec![],
        },
        Position::at(1, 1),
    );
    let ret = {
        let l = b.name("len");
        let g = b.name("greeting");
        let call = b.call(l, vec![g]);
        b.ret(vec![call])
    };
    let int_te = b.type_name("int");
    let typ = func_type(&mut b, vec![], vec![int_te]);
    let main = func_decl(&mut b, "main", typ, vec![ret]);
    let f = file(&mut b, vec![], vec![var, main]);

    let script = build_script(f, Options::default()).unwrap();
    let mut vars = HashMap::new();
    vars.insert("greeting".to_string(), Some(Value::str("hey")));
    assert_eq!(script.run(vars, RunOptions::default()).unwrap(), 3);
    // A missing entry supplies the zero value.
    assert_eq!(
        script.run(HashMap::new(), RunOptions::default()).unwrap(),
        0
    );
}

#[test]
fn env_exit_surfaces_as_exit_error() {
    // import "os"; func main() { os.Exit(3) }
    let mut packages = Packages::new();
    let exit = NativeFunction::with_env(
        "os",
        "Exit",
        Type::func(vec![Type::basic(BasicKind::Int)], vec![], false),
        true,
        NativeImpl::Generic(Box::new(|env, args| {
            env.exit(args[0].as_int() as i32);
            Ok(vec![])
        })),
    );
    packages.insert(
        "os",
        Rc::new(DeclaredPackage::new("os").declare("Exit", NativeDecl::Func(exit))),
    );

    let mut b = AstBuilder::new();
    let call = {
        let pkg = b.name("os");
        let sel = b.selector(pkg, "Exit");
        let three = b.int(3);
        b.call(sel, vec![three])
    };
    let stmt = b.expr_stmt(call);
    let typ = func_type(&mut b, vec![], vec![]);
    let main = func_decl(&mut b, "main", typ, vec![stmt]);
    let f = file(&mut b, vec!["os"], vec![main]);

    let program = build(
        vec![f],
        Options {
            packages,
            ..Default::default()
        },
    )
    .unwrap();
    match program.run(RunOptions::default()) {
        Err(RuntimeError::Exit(vela::ExitError(3))) => {}
        other => panic!("expected exit status 3, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn initvars_runs_before_main_with_dependency_order() {
    // var b2 = a2 + 1 ; var a2 = 41 ; func main() int { return b2 }
    let mut b = AstBuilder::new();
    let init_b = {
        let a = b.name("a2");
        let one = b.int(1);
        b.binary(BinaryOp::Add, a, one)
    };
    let b_name = b.ident("b2");
    let var_b = Decl::Var(
        VarDecl {
            names: vec![b_name],
            typ: None,
            values: vec![init_b],
        },
        Position::at(1, 1),
    );
    let a_val = b.int(41);
    let a_name = b.ident("a2");
    let var_a = Decl::Var(
        VarDecl {
            names: vec![a_name],
            typ: None,
            values: vec![a_val],
        },
        Position::at(2, 1),
    );
    let ret = {
        let bv = b.name("b2");
        b.ret(vec![bv])
    };
    let int_te = b.type_name("int");
    let typ = func_type(&mut b, vec![], vec![int_te]);
    let main = func_decl(&mut b, "main", typ, vec![ret]);
    let f = file(&mut b, vec![], vec![var_b, var_a, main]);
    assert_eq!(run_ok(vec![f]), 42);
}
