//! Goroutines, channels, select and context cancellation on
//! hand-assembled bytecode.

use vela_runtime::env::{Context, Env};
use vela_runtime::function::{Function, Global, Module};
use vela_runtime::instruction::{
    encode_int16, encode_uint24, Condition, Instruction, Opcode,
};
use vela_runtime::types::{BasicKind, ChanDir, Type, TypeHandle};
use vela_vm::error::VmError;
use vela_vm::vm::Vm;

fn int_t() -> TypeHandle {
    Type::basic(BasicKind::Int)
}

fn chan_int_t() -> TypeHandle {
    Type::chan(ChanDir::Both, int_t())
}

fn void_fn(name: &str) -> Function {
    Function::new("main", name, Type::func(vec![], vec![], false))
}

fn goto(addr: u32) -> Instruction {
    let (a, b, c) = encode_uint24(addr);
    Instruction::new(Opcode::Goto, a, b, c)
}

fn get_var(idx: i16, dst: i8) -> Instruction {
    let (a, b) = encode_int16(idx);
    Instruction::new(Opcode::GetVar, a, b, dst)
}

fn set_var(src: i8, idx: i16) -> Instruction {
    let (b, c) = encode_int16(idx);
    Instruction::new(Opcode::SetVar, src, b, c)
}

#[test]
fn goroutine_sends_main_receives() {
    // worker: g0 <- 42 ; main: g1 = <-g0
    let mut worker = void_fn("worker");
    worker.reg_count = [1, 0, 0, 1];
    worker.body = vec![
        get_var(0, 1),
        Instruction::with_k(Opcode::Move, true, 0, 42, 1),
        Instruction::new(Opcode::Send, 1, 0, 1),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];

    let mut main = void_fn("main");
    main.types = vec![chan_int_t()];
    main.reg_count = [1, 0, 0, 1];
    main.body = vec![
        Instruction::with_k(Opcode::MakeChan, true, 0, 0, 1),
        set_var(1, 0),
        Instruction::new(Opcode::Go, 0, 0, 0),
        Instruction::new(Opcode::Call, 0, 0, 0),
        Instruction::quad([0, 0, 0, 1]),
        Instruction::new(Opcode::Receive, 1, 0, 1),
        set_var(1, 1),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];

    let mut module = Module::new();
    let main_id = module.add_function(main);
    let worker_id = module.add_function(worker);
    module.functions[main_id as usize].functions.push(worker_id);
    module.globals.push(Global::new("main", "ch", chan_int_t()));
    module.globals.push(Global::new("main", "got", int_t()));

    let env = Env::new();
    let mut vm = Vm::new(module, env.clone());
    vm.run().unwrap();
    assert_eq!(env.global(1).borrow().as_int(), 42);
}

#[test]
fn close_releases_every_blocked_goroutine() {
    // 1000 workers receive from an unbuffered channel, then ack on a
    // second channel. Main closes the work channel and counts the acks:
    // every goroutine must be released.
    const WORKERS: i64 = 1000;

    let mut worker = void_fn("worker");
    worker.reg_count = [1, 0, 0, 2];
    worker.body = vec![
        get_var(0, 1),
        Instruction::new(Opcode::Receive, 1, 0, 1), // blocks until close
        get_var(1, 2),
        Instruction::with_k(Opcode::Move, true, 0, 1, 1),
        Instruction::new(Opcode::Send, 1, 0, 2),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];

    let mut main = void_fn("main");
    main.types = vec![chan_int_t()];
    main.reg_count = [3, 0, 0, 2];
    main.consts.ints = vec![WORKERS];
    let mut body = vec![
        Instruction::with_k(Opcode::MakeChan, true, 0, 0, 1),
        set_var(1, 0),
        Instruction::with_k(Opcode::MakeChan, true, 0, 0, 2),
        set_var(2, 1),
    ];
    for _ in 0..WORKERS {
        body.push(Instruction::new(Opcode::Go, 0, 0, 0));
        body.push(Instruction::new(Opcode::Call, 0, 0, 0));
        body.push(Instruction::quad([0, 0, 0, 2]));
    }
    let close_pc = body.len() as u32;
    body.push(Instruction::new(Opcode::Close, 1, 0, 0));
    body.push(Instruction::new(Opcode::LoadNumber, 0, 0, 3));
    let loop_head = close_pc + 2;
    body.push(Instruction::new(
        Opcode::IfInt,
        1,
        3,
        Condition::Less as i8,
    ));
    body.push(goto(loop_head + 5)); // exit
    body.push(Instruction::new(Opcode::Receive, 2, 0, 2));
    body.push(Instruction::with_k(Opcode::AddInt, true, 1, 1, 1));
    body.push(goto(loop_head));
    body.push(set_var(1, 2));
    body.push(Instruction::new(Opcode::Return, 0, 0, 0));
    main.body = body;

    let mut module = Module::new();
    let main_id = module.add_function(main);
    let worker_id = module.add_function(worker);
    module.functions[main_id as usize].functions.push(worker_id);
    module.globals.push(Global::new("main", "work", chan_int_t()));
    module.globals.push(Global::new("main", "ack", chan_int_t()));
    module.globals.push(Global::new("main", "count", int_t()));

    let env = Env::new();
    let mut vm = Vm::new(module, env.clone());
    vm.run().unwrap();
    assert_eq!(env.global(2).borrow().as_int(), WORKERS);
}

#[test]
fn select_chooses_ready_case() {
    // A buffered channel already holding a value: the receive case is
    // chosen over default.
    let mut main = void_fn("main");
    main.types = vec![chan_int_t()];
    main.reg_count = [2, 0, 0, 1];
    main.body = vec![
        Instruction::with_k(Opcode::MakeChan, true, 0, 1, 1),
        Instruction::with_k(Opcode::Move, true, 0, 9, 1),
        Instruction::new(Opcode::Send, 1, 0, 1),
        // select { case v := <-ch: g0 = v ; default: g0 = -1 }
        Instruction::new(Opcode::Case, 1, 2, 1),
        goto(9),
        Instruction::new(Opcode::Case, 2, 0, 0),
        goto(11),
        Instruction::new(Opcode::Select, 0, 0, 0),
        Instruction::new(Opcode::Return, 0, 0, 0), // unreachable
        // recv body
        set_var(2, 0),
        Instruction::new(Opcode::Return, 0, 0, 0),
        // default body
        Instruction::with_k(Opcode::Move, true, 0, -1, 2),
        set_var(2, 0),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];
    let mut module = Module::new();
    module.add_function(main);
    module.globals.push(Global::new("main", "g0", int_t()));

    let env = Env::new();
    let mut vm = Vm::new(module, env.clone());
    vm.run().unwrap();
    assert_eq!(env.global(0).borrow().as_int(), 9);
}

#[test]
fn select_with_cancelled_context_fails_without_deadlock() {
    // select on an empty channel with no default; the context is already
    // cancelled, so the run reports cancellation instead of deadlocking.
    let mut main = void_fn("main");
    main.types = vec![chan_int_t()];
    main.reg_count = [1, 0, 0, 1];
    main.body = vec![
        Instruction::with_k(Opcode::MakeChan, true, 0, 0, 1),
        Instruction::new(Opcode::Case, 1, 1, 1),
        goto(4),
        Instruction::new(Opcode::Select, 0, 0, 0),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];
    let mut module = Module::new();
    module.add_function(main);

    let (ctx, cancel) = Context::with_cancel();
    cancel.cancel();
    let env = Env::with_options(ctx, None, None);
    let mut vm = Vm::new(module, env);
    match vm.run() {
        Err(VmError::ContextCancelled) => {}
        other => panic!("expected cancellation, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn blocked_receive_without_context_is_a_deadlock() {
    let mut main = void_fn("main");
    main.types = vec![chan_int_t()];
    main.reg_count = [1, 0, 0, 1];
    main.body = vec![
        Instruction::with_k(Opcode::MakeChan, true, 0, 0, 1),
        Instruction::new(Opcode::Receive, 1, 0, 1),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];
    let mut module = Module::new();
    module.add_function(main);

    let env = Env::new();
    let mut vm = Vm::new(module, env);
    match vm.run() {
        Err(VmError::Deadlock) => {}
        other => panic!("expected deadlock, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn range_over_channel_drains_until_close() {
    // worker sends 1, 2, 3 then closes; main ranges and sums.
    let mut worker = void_fn("worker");
    worker.reg_count = [2, 0, 0, 1];
    worker.body = vec![
        get_var(0, 1),
        Instruction::with_k(Opcode::Move, true, 0, 1, 1),
        // while v <= 3
        Instruction::with_k(Opcode::IfInt, true, 1, 3, Condition::LessOrEqual as i8),
        goto(7),
        Instruction::new(Opcode::Send, 1, 0, 1),
        Instruction::with_k(Opcode::AddInt, true, 1, 1, 1),
        goto(2),
        Instruction::new(Opcode::Close, 1, 0, 0),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];

    let mut main = void_fn("main");
    main.types = vec![chan_int_t()];
    main.reg_count = [3, 0, 0, 1];
    main.body = vec![
        Instruction::with_k(Opcode::MakeChan, true, 0, 0, 1),
        set_var(1, 0),
        Instruction::new(Opcode::Go, 0, 0, 0),
        Instruction::new(Opcode::Call, 0, 0, 0),
        Instruction::quad([0, 0, 0, 1]),
        Instruction::new(Opcode::Range, 1, 0, 4),
        Instruction::new(Opcode::RangeNext, 0, 2, 0),
        goto(10),
        Instruction::new(Opcode::AddInt, 1, 2, 1),
        goto(6),
        set_var(1, 1),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];

    let mut module = Module::new();
    let main_id = module.add_function(main);
    let worker_id = module.add_function(worker);
    module.functions[main_id as usize].functions.push(worker_id);
    module.globals.push(Global::new("main", "ch", chan_int_t()));
    module.globals.push(Global::new("main", "sum", int_t()));

    let env = Env::new();
    let mut vm = Vm::new(module, env.clone());
    vm.run().unwrap();
    assert_eq!(env.global(1).borrow().as_int(), 6);
}
