//! Defer, panic, recover and memory-limit behavior on hand-assembled
//! bytecode.

use vela_runtime::env::{Context, Env};
use vela_runtime::function::{Function, Global, Module};
use vela_runtime::instruction::{
    encode_int16, encode_uint24, Condition, Instruction, Opcode, NO_VARIADIC,
};
use vela_runtime::types::{BasicKind, Type, TypeHandle};
use vela_runtime::value::Value;
use vela_vm::error::VmError;
use vela_vm::vm::Vm;

fn int_t() -> TypeHandle {
    Type::basic(BasicKind::Int)
}

fn void_fn(name: &str) -> Function {
    Function::new("main", name, Type::func(vec![], vec![], false))
}

fn goto(addr: u32) -> Instruction {
    let (a, b, c) = encode_uint24(addr);
    Instruction::new(Opcode::Goto, a, b, c)
}

fn set_var(src: i8, idx: i16) -> Instruction {
    let (b, c) = encode_int16(idx);
    Instruction::new(Opcode::SetVar, src, b, c)
}

#[test]
fn deferred_call_runs_after_return() {
    // main defers mark(); mark sets g0 = 1. The global must be set even
    // though the defer is registered before main's own store of g0 = 2:
    // LIFO execution means mark() runs last.
    let mut mark = void_fn("mark");
    mark.reg_count = [1, 0, 0, 0];
    mark.body = vec![
        Instruction::with_k(Opcode::Move, true, 0, 1, 1),
        set_var(1, 0),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];

    let mut main = void_fn("main");
    main.reg_count = [1, 0, 0, 1];
    main.body = vec![
        Instruction::new(Opcode::GetFunc, 0, 0, 1),
        Instruction::new(Opcode::Defer, 1, NO_VARIADIC, 0),
        Instruction::quad([0, 0, 0, 1]),
        Instruction::quad([0, 0, 0, 0]),
        Instruction::with_k(Opcode::Move, true, 0, 2, 1),
        set_var(1, 0),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];

    let mut module = Module::new();
    let main_id = module.add_function(main);
    let mark_id = module.add_function(mark);
    module.functions[main_id as usize].functions.push(mark_id);
    module.globals.push(Global::new("main", "g0", int_t()));

    let env = Env::new();
    let mut vm = Vm::new(module, env.clone());
    vm.run().unwrap();
    assert_eq!(env.global(0).borrow().as_int(), 1, "deferred store wins");
}

#[test]
fn defer_recover_swallows_panic() {
    // func main() { defer func() { recover() }(); panic("boom") }
    // must finish with exit code 0 and no surfaced error.
    let mut rec = void_fn("rec");
    rec.reg_count = [0, 0, 0, 1];
    rec.body = vec![
        Instruction::new(Opcode::Recover, 0, 0, 1),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];

    let mut main = void_fn("main");
    main.reg_count = [0, 0, 0, 2];
    main.consts.general = vec![Value::str("boom")];
    main.body = vec![
        Instruction::new(Opcode::GetFunc, 0, 0, 1),
        Instruction::new(Opcode::Defer, 1, NO_VARIADIC, 0),
        Instruction::quad([0, 0, 0, 1]),
        Instruction::quad([0, 0, 0, 0]),
        Instruction::with_k(Opcode::Move, true, 3, 0, 2),
        Instruction::new(Opcode::Panic, 2, 0, 0),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];

    let mut module = Module::new();
    let main_id = module.add_function(main);
    let rec_id = module.add_function(rec);
    module.functions[main_id as usize].functions.push(rec_id);

    let env = Env::new();
    let mut vm = Vm::new(module, env);
    assert_eq!(vm.run().unwrap(), 0);
}

#[test]
fn unrecovered_panic_surfaces_with_chain() {
    let mut main = void_fn("main");
    main.reg_count = [0, 0, 0, 1];
    main.consts.general = vec![Value::str("boom")];
    main.body = vec![
        Instruction::with_k(Opcode::Move, true, 3, 0, 1),
        Instruction::new(Opcode::Panic, 1, 0, 0),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];
    let mut module = Module::new();
    module.add_function(main);

    let env = Env::new();
    let mut vm = Vm::new(module, env);
    match vm.run() {
        Err(VmError::Panic(chain)) => {
            assert_eq!(chain.len(), 1);
            assert!(!chain[0].recovered);
            assert_eq!(format!("{}", VmError::Panic(chain)), "panic: boom");
        }
        other => panic!("expected panic, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn panic_inside_defer_chains_with_recovered_marker() {
    // main panics "X"; its deferred function recovers and then panics
    // "Z". The surfaced chain is X [recovered], Z.
    let mut rec = void_fn("rec");
    rec.reg_count = [0, 0, 0, 2];
    rec.consts.general = vec![Value::str("Z")];
    rec.body = vec![
        Instruction::new(Opcode::Recover, 0, 0, 1),
        Instruction::with_k(Opcode::Move, true, 3, 0, 2),
        Instruction::new(Opcode::Panic, 2, 0, 0),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];

    let mut main = void_fn("main");
    main.reg_count = [0, 0, 0, 2];
    main.consts.general = vec![Value::str("X")];
    main.body = vec![
        Instruction::new(Opcode::GetFunc, 0, 0, 1),
        Instruction::new(Opcode::Defer, 1, NO_VARIADIC, 0),
        Instruction::quad([0, 0, 0, 1]),
        Instruction::quad([0, 0, 0, 0]),
        Instruction::with_k(Opcode::Move, true, 3, 0, 2),
        Instruction::new(Opcode::Panic, 2, 0, 0),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];

    let mut module = Module::new();
    let main_id = module.add_function(main);
    let rec_id = module.add_function(rec);
    module.functions[main_id as usize].functions.push(rec_id);

    let env = Env::new();
    let mut vm = Vm::new(module, env);
    match vm.run() {
        Err(VmError::Panic(chain)) => {
            assert_eq!(chain.len(), 2);
            assert!(chain[0].recovered);
            assert!(!chain[1].recovered);
            assert_eq!(
                format!("{}", VmError::Panic(chain)),
                "panic: X [recovered]\npanic: Z"
            );
        }
        other => panic!("expected panic chain, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn append_loop_exhausts_memory_budget() {
    // With a 1024-byte budget, appending 1000 ints must fail with
    // OutOfMemory and leave the counter negative.
    let int = int_t();
    let slice_t = Type::slice(int);
    let mut main = void_fn("main");
    main.types = vec![slice_t];
    main.reg_count = [3, 0, 0, 1];
    main.consts.ints = vec![1000];
    main.body = vec![
        Instruction::new(Opcode::MakeSlice, 0, 0, 1),
        Instruction::operands(0, 0, 3), // len=0, cap=0, both immediate
        Instruction::new(Opcode::LoadNumber, 0, 0, 3),
        // while i < 1000: the condition holding skips the exit jump
        Instruction::new(Opcode::IfInt, 1, 3, Condition::Less as i8),
        goto(9),
        Instruction::new(Opcode::Move, 0, 1, 2),
        Instruction::new(Opcode::Append, 2, 1, 1),
        Instruction::with_k(Opcode::AddInt, true, 1, 1, 1),
        goto(3),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];
    let mut module = Module::new();
    module.add_function(main);

    let env = Env::with_options(Context::background(), Some(1024), None);
    let mut vm = Vm::new(module, env.clone());
    match vm.run() {
        Err(VmError::OutOfMemory) => {}
        other => panic!("expected out of memory, got {:?}", other.map(|_| ())),
    }
    let (free, limited) = env.free_memory();
    assert!(limited);
    assert!(free < 0, "counter is negative by the failed allocation");
}

#[test]
fn out_of_memory_is_recoverable() {
    // Same loop, but main defers a recover: the run completes normally.
    let int = int_t();
    let slice_t = Type::slice(int);
    let mut rec = void_fn("rec");
    rec.reg_count = [0, 0, 0, 1];
    rec.body = vec![
        Instruction::new(Opcode::Recover, 0, 0, 1),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];

    let mut main = void_fn("main");
    main.types = vec![slice_t];
    main.reg_count = [3, 0, 0, 2];
    main.consts.ints = vec![1000];
    main.body = vec![
        Instruction::new(Opcode::GetFunc, 0, 0, 2),
        Instruction::new(Opcode::Defer, 2, NO_VARIADIC, 0),
        Instruction::quad([0, 0, 0, 2]),
        Instruction::quad([0, 0, 0, 0]),
        Instruction::new(Opcode::MakeSlice, 0, 0, 1),
        Instruction::operands(0, 0, 3),
        Instruction::new(Opcode::LoadNumber, 0, 0, 3),
        Instruction::new(Opcode::IfInt, 1, 3, Condition::Less as i8),
        goto(13),
        Instruction::new(Opcode::Move, 0, 1, 2),
        Instruction::new(Opcode::Append, 2, 1, 1),
        Instruction::with_k(Opcode::AddInt, true, 1, 1, 1),
        goto(7),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];
    let mut module = Module::new();
    let main_id = module.add_function(main);
    let rec_id = module.add_function(rec);
    module.functions[main_id as usize].functions.push(rec_id);

    let env = Env::with_options(Context::background(), Some(1024), None);
    let mut vm = Vm::new(module, env);
    assert_eq!(vm.run().unwrap(), 0, "recover absorbs the OOM panic");
}
