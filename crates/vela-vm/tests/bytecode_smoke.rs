//! Hand-assembled bytecode programs exercising the core dispatch paths:
//! arithmetic, jumps, calls, tail calls, globals and exit codes.

use vela_runtime::env::Env;
use vela_runtime::function::{Function, Global, Module};
use vela_runtime::instruction::{
    encode_int16, encode_uint24, Condition, Instruction, Opcode, CURRENT_FUNCTION,
};
use vela_runtime::types::{BasicKind, Type, TypeHandle};
use vela_runtime::value::Value;
use vela_vm::vm::Vm;

fn int_t() -> TypeHandle {
    Type::basic(BasicKind::Int)
}

fn void_fn(name: &str) -> Function {
    Function::new("main", name, Type::func(vec![], vec![], false))
}

fn move_int_imm(v: i8, dst: i8) -> Instruction {
    Instruction::with_k(Opcode::Move, true, 0, v, dst)
}

fn goto(addr: u32) -> Instruction {
    let (a, b, c) = encode_uint24(addr);
    Instruction::new(Opcode::Goto, a, b, c)
}

fn set_var(src: i8, idx: i16) -> Instruction {
    let (b, c) = encode_int16(idx);
    Instruction::new(Opcode::SetVar, src, b, c)
}

fn run(module: Module) -> (Result<i32, vela_vm::VmError>, std::rc::Rc<Env>) {
    let env = Env::new();
    let mut vm = Vm::new(module, env.clone());
    (vm.run(), env)
}

#[test]
fn add_constants_into_global() {
    let mut f = void_fn("main");
    f.reg_count = [3, 0, 0, 0];
    f.body = vec![
        move_int_imm(1, 1),
        move_int_imm(2, 2),
        Instruction::new(Opcode::AddInt, 1, 2, 3),
        set_var(3, 0),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];
    let mut module = Module::new();
    module.add_function(f);
    module.globals.push(Global::new("main", "g0", int_t()));
    let (result, env) = run(module);
    assert_eq!(result.unwrap(), 0);
    assert_eq!(env.global(0).borrow().as_int(), 3);
}

#[test]
fn constant_operand_form_matches_register_form() {
    // 10 - 3 both ways: k-immediate and via a register.
    let mut f = void_fn("main");
    f.reg_count = [4, 0, 0, 0];
    f.body = vec![
        move_int_imm(10, 1),
        Instruction::with_k(Opcode::SubInt, true, 1, 3, 2),
        move_int_imm(3, 3),
        Instruction::new(Opcode::SubInt, 1, 3, 4),
        Instruction::new(Opcode::SubInt, 2, 4, 1),
        set_var(1, 0),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];
    let mut module = Module::new();
    module.add_function(f);
    module.globals.push(Global::new("main", "g0", int_t()));
    let (result, env) = run(module);
    result.unwrap();
    assert_eq!(env.global(0).borrow().as_int(), 0);
}

#[test]
fn conditional_jump_takes_then_branch() {
    let mut f = void_fn("main");
    f.reg_count = [2, 0, 0, 0];
    f.consts.ints = vec![111, 222];
    f.body = vec![
        move_int_imm(3, 1),
        // 3 < 5 holds: skip the Goto to the else branch.
        Instruction::with_k(Opcode::IfInt, true, 1, 5, Condition::Less as i8),
        goto(5),
        Instruction::new(Opcode::LoadNumber, 0, 0, 2),
        goto(6),
        Instruction::new(Opcode::LoadNumber, 0, 1, 2),
        set_var(2, 0),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];
    let mut module = Module::new();
    module.add_function(f);
    module.globals.push(Global::new("main", "g0", int_t()));
    let (result, env) = run(module);
    result.unwrap();
    assert_eq!(env.global(0).borrow().as_int(), 111);
}

#[test]
fn call_and_return_values() {
    // add(x, y) called with (7, 5); result stored in a global.
    let mut add = Function::new(
        "main",
        "add",
        Type::func(vec![int_t(), int_t()], vec![int_t()], false),
    );
    add.reg_count = [3, 0, 0, 0];
    add.body = vec![
        Instruction::new(Opcode::AddInt, 2, 3, 1),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];

    let mut main = void_fn("main");
    main.reg_count = [4, 0, 0, 0];
    main.body = vec![
        move_int_imm(7, 3),
        move_int_imm(5, 4),
        Instruction::new(Opcode::Call, 0, 0, 0),
        Instruction::quad([1, 0, 0, 0]),
        Instruction::new(Opcode::Move, 0, 2, 1),
        set_var(1, 0),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];

    let mut module = Module::new();
    let main_id = module.add_function(main);
    let add_id = module.add_function(add);
    module.functions[main_id as usize].functions.push(add_id);
    module.globals.push(Global::new("main", "g0", int_t()));
    let (result, env) = run(module);
    result.unwrap();
    assert_eq!(env.global(0).borrow().as_int(), 12);
}

#[test]
fn entry_int_result_becomes_exit_code() {
    let mut f = Function::new("main", "main", Type::func(vec![], vec![int_t()], false));
    f.reg_count = [1, 0, 0, 0];
    f.body = vec![
        move_int_imm(7, 1),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];
    let mut module = Module::new();
    module.add_function(f);
    let (result, _) = run(module);
    assert_eq!(result.unwrap(), 7);
}

#[test]
fn tail_call_countdown() {
    // td(n): if n == 0 { return }; td(n - 1) as a tail call.
    // No results, so the parameter lives in register 1.
    let mut td = Function::new("main", "td", Type::func(vec![int_t()], vec![], false));
    td.reg_count = [1, 0, 0, 0];
    td.body = vec![
        Instruction::with_k(Opcode::IfInt, true, 1, 0, Condition::Equal as i8),
        goto(3),
        Instruction::new(Opcode::Return, 0, 0, 0),
        Instruction::with_k(Opcode::SubInt, true, 1, 1, 1),
        Instruction::new(Opcode::TailCall, CURRENT_FUNCTION, 0, 0),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];

    let mut main = void_fn("main");
    main.reg_count = [2, 0, 0, 0];
    main.consts.ints = vec![100];
    main.body = vec![
        Instruction::new(Opcode::LoadNumber, 0, 0, 2),
        Instruction::new(Opcode::Call, 0, 0, 0),
        Instruction::quad([1, 0, 0, 0]),
        move_int_imm(1, 1),
        set_var(1, 0),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];

    let mut module = Module::new();
    let main_id = module.add_function(main);
    let td_id = module.add_function(td);
    module.functions[main_id as usize].functions.push(td_id);
    module.globals.push(Global::new("main", "g0", int_t()));
    let (result, env) = run(module);
    result.unwrap();
    assert_eq!(env.global(0).borrow().as_int(), 1);
}

#[test]
fn deep_recursion_grows_register_stacks() {
    // rec(n): if n == 0 { return 0 }; return rec(n - 1)
    // 600 frames shift the int bank well past its initial 512 slots.
    let mut rec = Function::new("main", "rec", Type::func(vec![int_t()], vec![int_t()], false));
    rec.reg_count = [5, 0, 0, 0];
    rec.body = vec![
        Instruction::with_k(Opcode::IfInt, true, 2, 0, Condition::Equal as i8),
        goto(4),
        move_int_imm(0, 1),
        Instruction::new(Opcode::Return, 0, 0, 0),
        Instruction::with_k(Opcode::SubInt, true, 2, 1, 5),
        Instruction::new(Opcode::Call, 0, 0, 0),
        Instruction::quad([3, 0, 0, 0]),
        Instruction::new(Opcode::Move, 0, 4, 1),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];

    let mut main = void_fn("main");
    main.reg_count = [3, 0, 0, 0];
    main.consts.ints = vec![600];
    main.body = vec![
        Instruction::new(Opcode::LoadNumber, 0, 0, 3),
        Instruction::new(Opcode::Call, 0, 0, 0),
        Instruction::quad([1, 0, 0, 0]),
        Instruction::new(Opcode::Move, 0, 2, 1),
        set_var(1, 0),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];

    let mut module = Module::new();
    let main_id = module.add_function(main);
    let rec_id = module.add_function(rec);
    module.functions[main_id as usize].functions.push(rec_id);
    module.functions[rec_id as usize].functions.push(rec_id);
    module.globals.push(Global::new("main", "g0", int_t()));
    let (result, env) = run(module);
    result.unwrap();
    assert_eq!(env.global(0).borrow().as_int(), 0);
}

#[test]
fn string_concat_and_conditions() {
    let mut f = void_fn("main");
    f.reg_count = [1, 0, 3, 0];
    f.consts.strings = vec!["he".into(), "llo".into(), "hello".into()];
    f.body = vec![
        Instruction::with_k(Opcode::Move, true, 2, 0, 1), // s1 = "he"
        Instruction::with_k(Opcode::Concat, true, 1, 1, 2), // s2 = s1 + "llo"
        // s2 == "hello" holds: skip the else Goto.
        Instruction::with_k(Opcode::IfString, true, 2, 2, Condition::Equal as i8),
        goto(6),
        move_int_imm(1, 1),
        goto(7),
        move_int_imm(2, 1),
        set_var(1, 0),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];
    let mut module = Module::new();
    module.add_function(f);
    module.globals.push(Global::new("main", "g0", int_t()));
    let (result, env) = run(module);
    result.unwrap();
    assert_eq!(env.global(0).borrow().as_int(), 1);
}

#[test]
fn range_over_slice_sums_elements() {
    let int = int_t();
    let slice_t = Type::slice(int.clone());
    let mut f = void_fn("main");
    f.types = vec![slice_t];
    f.reg_count = [4, 0, 0, 1];
    f.body = vec![
        // s := make([]int, 0, 4); s = append(s, 5); s = append(s, 6)
        Instruction::new(Opcode::MakeSlice, 0, 0, 1),
        Instruction::operands(0, 4, 3), // len=0 (k), cap=4 (k)
        move_int_imm(5, 4),
        Instruction::new(Opcode::Append, 4, 1, 1),
        move_int_imm(6, 4),
        Instruction::new(Opcode::Append, 4, 1, 1),
        // sum over range
        Instruction::new(Opcode::Range, 1, 0, 0),
        Instruction::new(Opcode::RangeNext, 0, 2, 3),
        goto(11),
        Instruction::new(Opcode::AddInt, 1, 3, 1),
        goto(7),
        set_var(1, 0),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];
    let mut module = Module::new();
    module.add_function(f);
    module.globals.push(Global::new("main", "g0", int_t()));
    let (result, env) = run(module);
    result.unwrap();
    assert_eq!(env.global(0).borrow().as_int(), 11);
}

#[test]
fn map_set_index_and_comma_ok() {
    let int = int_t();
    let str_t = Type::basic(BasicKind::String);
    let map_t = Type::map(str_t, int.clone());
    let mut f = void_fn("main");
    f.types = vec![map_t];
    f.consts.strings = vec!["a".into(), "missing".into()];
    f.reg_count = [3, 0, 1, 1];
    f.body = vec![
        Instruction::with_k(Opcode::MakeMap, true, 0, 4, 1),
        // m["a"] = 9
        move_int_imm(9, 1),
        Instruction::with_k(Opcode::Move, true, 2, 0, 1), // key in string reg 1
        Instruction::new(Opcode::SetMap, 1, 1, 1),
        // x = m["a"]; ok expected
        Instruction::new(Opcode::MapIndex, 1, 1, 2),
        Instruction::new(Opcode::If, 0, Condition::NotOk as i8, 0),
        goto(8),
        move_int_imm(0, 2), // not ok: zero it (should not happen)
        // y, ok = m["missing"]; ok must be false, y zero
        Instruction::with_k(Opcode::Move, true, 2, 1, 1),
        Instruction::new(Opcode::MapIndex, 1, 1, 3),
        Instruction::new(Opcode::If, 0, Condition::Ok as i8, 0),
        goto(13),
        move_int_imm(99, 3), // ok: poison (should not happen)
        Instruction::new(Opcode::AddInt, 2, 3, 2),
        set_var(2, 0),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];
    let mut module = Module::new();
    module.add_function(f);
    module.globals.push(Global::new("main", "g0", int_t()));
    let (result, env) = run(module);
    result.unwrap();
    assert_eq!(env.global(0).borrow().as_int(), 9);
}

#[test]
fn type_assertion_comma_ok_does_not_panic() {
    // i := interface{}(string); x, ok := i.(int) -> x == 0, ok == false
    let int = int_t();
    let str_t = Type::basic(BasicKind::String);
    let mut f = void_fn("main");
    f.types = vec![str_t, int];
    f.consts.strings = vec!["hi".into()];
    f.reg_count = [2, 0, 1, 1];
    f.body = vec![
        Instruction::with_k(Opcode::Move, true, 2, 0, 1), // s = "hi"
        Instruction::new(Opcode::Typify, 0, 1, 1),        // box into general r1
        Instruction::new(Opcode::Assert, 1, 1, 1),        // .(int) -> int r1
        Instruction::new(Opcode::If, 0, Condition::NotOk as i8, 0),
        goto(6),
        move_int_imm(7, 2), // reached only when not ok
        set_var(1, 0),
        set_var(2, 1),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];
    let mut module = Module::new();
    module.add_function(f);
    module.globals.push(Global::new("main", "g0", int_t()));
    module.globals.push(Global::new("main", "g1", int_t()));
    let (result, env) = run(module);
    result.unwrap();
    assert_eq!(env.global(0).borrow().as_int(), 0, "asserted value is zero");
    assert_eq!(env.global(1).borrow().as_int(), 7, "ok was false");
}

#[test]
fn indirect_register_through_cell() {
    use vela_runtime::value::new_cell;
    // general r2 holds a cell; int ops through register -2 read/write it.
    let mut f = void_fn("main");
    f.reg_count = [1, 0, 0, 2];
    f.consts.general = vec![Value::Cell(new_cell(Value::Int(40)))];
    f.body = vec![
        Instruction::with_k(Opcode::Move, true, 3, 0, 2),
        Instruction::with_k(Opcode::AddInt, true, -2, 2, -2),
        Instruction::new(Opcode::Move, 0, -2, 1),
        set_var(1, 0),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];
    let mut module = Module::new();
    module.add_function(f);
    module.globals.push(Global::new("main", "g0", int_t()));
    let (result, env) = run(module);
    result.unwrap();
    assert_eq!(env.global(0).borrow().as_int(), 42);
}
