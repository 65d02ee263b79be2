//! Emitter tests: structural invariants over emitted modules.

use vela_analysis::check_program;
use vela_codegen::emit_program;
use vela_common::Position;
use vela_runtime::instruction::{decode_uint24, Opcode};
use vela_runtime::package::Packages;
use vela_syntax::ast::*;
use vela_syntax::op::{AssignOp, BinaryOp, IncDecOp};

/// Builds a program exercising calls, loops, closures and conditions.
fn sample_program() -> Vec<File> {
    let mut b = AstBuilder::new();

    // func add(x int, y int) int { return x + y }
    let int1 = b.type_name("int");
    let int2 = b.type_name("int");
    let int3 = b.type_name("int");
    let add_typ = FuncTypeExpr {
        params: vec![
            ParamDecl {
                name: Some(b.ident("x")),
                typ: int1,
            },
            ParamDecl {
                name: Some(b.ident("y")),
                typ: int2,
            },
        ],
        results: vec![ParamDecl {
            name: None,
            typ: int3,
        }],
        variadic: false,
    };
    let add_body = {
        let x = b.name("x");
        let y = b.name("y");
        let sum = b.binary(BinaryOp::Add, x, y);
        vec![b.ret(vec![sum])]
    };
    let add = Decl::Func(FuncDecl {
        name: b.ident("add"),
        typ: add_typ,
        body: add_body,
        pos: Position::at(1, 1),
    });

    // func main() int {
    //   total := 0
    //   for i := 0; i < 10; i++ { total = add(total, i) }
    //   inc := func() { total++ }
    //   inc()
    //   if total > 40 { return 1 }
    //   return 0
    // }
    let zero = b.int(0);
    let total0 = b.name("total");
    let init_total = b.assign(AssignOp::Define, vec![total0], vec![zero]);
    let for_stmt = {
        let zero = b.int(0);
        let i0 = b.name("i");
        let init = b.assign(AssignOp::Define, vec![i0], vec![zero]);
        let cond = {
            let i = b.name("i");
            let ten = b.int(10);
            b.binary(BinaryOp::Lt, i, ten)
        };
        let post = {
            let i = b.name("i");
            b.stmt(StmtKind::IncDec(i, IncDecOp::Inc))
        };
        let body = {
            let addf = b.name("add");
            let total = b.name("total");
            let i = b.name("i");
            let call = b.call(addf, vec![total, i]);
            let total_l = b.name("total");
            b.assign(AssignOp::Assign, vec![total_l], vec![call])
        };
        b.stmt(StmtKind::For(Box::new(ForStmt {
            init: Some(init),
            cond: Some(cond),
            post: Some(post),
            body: vec![body],
        })))
    };
    let inc_def = {
        let total = b.name("total");
        let bump = b.stmt(StmtKind::IncDec(total, IncDecOp::Inc));
        let lit = FuncLit {
            id: b.next_id(),
            typ: FuncTypeExpr {
                params: vec![],
                results: vec![],
                variadic: false,
            },
            body: vec![bump],
            pos: Position::default(),
        };
        let lit = b.expr(ExprKind::FuncLit(Box::new(lit)));
        let inc = b.name("inc");
        b.assign(AssignOp::Define, vec![inc], vec![lit])
    };
    let inc_call = {
        let inc = b.name("inc");
        let call = b.call(inc, vec![]);
        b.expr_stmt(call)
    };
    let if_stmt = {
        let total = b.name("total");
        let forty = b.int(40);
        let cond = b.binary(BinaryOp::Gt, total, forty);
        let one = b.int(1);
        let ret1 = b.ret(vec![one]);
        b.stmt(StmtKind::If(Box::new(IfStmt {
            init: None,
            cond,
            then: vec![ret1],
            els: None,
        })))
    };
    let ret0 = {
        let zero = b.int(0);
        b.ret(vec![zero])
    };
    let int4 = b.type_name("int");
    let main = Decl::Func(FuncDecl {
        name: b.ident("main"),
        typ: FuncTypeExpr {
            params: vec![],
            results: vec![ParamDecl {
                name: None,
                typ: int4,
            }],
            variadic: false,
        },
        body: vec![init_total, for_stmt, inc_def, inc_call, if_stmt, ret0],
        pos: Position::at(10, 1),
    });

    vec![File {
        path: "main.vela".to_string(),
        package: b.ident("main"),
        imports: vec![],
        decls: vec![add, main],
    }]
}

#[test]
fn jump_targets_stay_inside_the_body() {
    let checked = check_program(sample_program(), &Packages::new(), false).unwrap();
    let module = emit_program(&checked);
    for f in &module.functions {
        for inst in &f.body {
            let (op, _) = inst.decode();
            if op == Opcode::Goto {
                let addr = decode_uint24(inst.a, inst.b, inst.c);
                assert!(
                    (addr as usize) < f.body.len(),
                    "jump to {} escapes {} (len {})",
                    addr,
                    f.name,
                    f.body.len()
                );
            }
        }
    }
}

#[test]
fn constant_pools_stay_deduplicated() {
    let checked = check_program(sample_program(), &Packages::new(), false).unwrap();
    let module = emit_program(&checked);
    for f in &module.functions {
        for (i, x) in f.consts.ints.iter().enumerate() {
            for y in &f.consts.ints[i + 1..] {
                assert_ne!(x, y, "duplicate int constant in {}", f.name);
            }
        }
        for (i, x) in f.consts.strings.iter().enumerate() {
            for y in &f.consts.strings[i + 1..] {
                assert_ne!(x, y, "duplicate string constant in {}", f.name);
            }
        }
        for (i, x) in f.consts.floats.iter().enumerate() {
            for y in &f.consts.floats[i + 1..] {
                assert_ne!(x.to_bits(), y.to_bits(), "duplicate float constant in {}", f.name);
            }
        }
    }
}

#[test]
fn every_function_ends_with_return() {
    let checked = check_program(sample_program(), &Packages::new(), false).unwrap();
    let module = emit_program(&checked);
    for f in &module.functions {
        let last = f.body.last().expect("empty body");
        assert_eq!(last.decode().0, Opcode::Return, "{} lacks a return", f.name);
    }
}

#[test]
fn literal_functions_record_capture_refs() {
    let checked = check_program(sample_program(), &Packages::new(), false).unwrap();
    let module = emit_program(&checked);
    // The `inc` literal captures `total` from its parent's frame: its
    // var_refs must name a parent cell (negative entry).
    let lit = module
        .functions
        .iter()
        .find(|f| f.name.ends_with(".func"))
        .expect("literal function emitted");
    assert_eq!(lit.var_refs.len(), 1);
    assert!(lit.var_refs[0] < 0, "cell reference is negative");
}

#[test]
fn entry_points_at_main() {
    let checked = check_program(sample_program(), &Packages::new(), false).unwrap();
    let module = emit_program(&checked);
    assert_eq!(module.functions[module.entry as usize].name, "main");
}
