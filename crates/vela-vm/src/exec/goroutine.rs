//! Goroutine spawning: a `Go` prefix turns the following call into a
//! fresh fiber with a copy of the staged argument window.

use vela_runtime::env::Env;
use vela_runtime::function::{Function, Module};
use vela_runtime::instruction::{Opcode, NO_VARIADIC};
use vela_runtime::types::Type;
use vela_runtime::value::{Callable, Value};

use crate::fiber::{Fiber, PanicKind, StagedArgs};
use crate::vm::{exit_check, native, Effects, Flow};

use super::defer::{raise, runtime_panic};

pub(crate) fn go_spawn(
    fiber: &mut Fiber,
    fn_: &Function,
    module: &Module,
    env: &Env,
    effects: &mut Effects,
) -> Flow {
    let call = fn_.body[fiber.pc as usize];
    let shift = fn_.body[fiber.pc as usize + 1].as_quad();
    fiber.pc += 2;
    let (op, _) = call.decode();

    let spawn_fn = |fiber: &Fiber, target: u32, cells: Vec<vela_runtime::value::CellRef>| {
        let callee = &module.functions[target as usize];
        // Placeholder id; assigned when the scheduler adopts the fiber.
        let mut child = Fiber::new(u32::MAX, target);
        child.cells = cells;
        child.regs.ensure([0; 4], callee.reg_count);
        // Copy the staged argument window into the child's frame.
        for t in 0..4u8 {
            let base = fiber.fp[t as usize] + shift[t as usize] as u32;
            for r in 1..=callee.reg_count[t as usize] {
                match t {
                    0 => {
                        let v = fiber.regs.int[(base + r as u32) as usize];
                        child.regs.int[r as usize] = v;
                    }
                    1 => {
                        let v = fiber.regs.float[(base + r as u32) as usize];
                        child.regs.float[r as usize] = v;
                    }
                    2 => {
                        let v = fiber.regs.string[(base + r as u32) as usize].clone();
                        child.regs.string[r as usize] = v;
                    }
                    _ => {
                        let v = fiber.regs.general[(base + r as u32) as usize].clone();
                        child.regs.general[r as usize] = v;
                    }
                }
            }
        }
        child
    };

    match op {
        Opcode::Call => {
            let target = fn_.functions[call.a as u8 as usize];
            effects.spawns.push(spawn_fn(fiber, target, Vec::new()));
            Flow::Next
        }
        Opcode::CallIndirect => {
            let callee = fiber.regs.general(fiber.fp, call.a);
            match &callee {
                Value::Func(cl) => match native::promote(cl, env) {
                    Callable::Fn { fn_id, cells } => {
                        effects.spawns.push(spawn_fn(fiber, fn_id, cells));
                        Flow::Next
                    }
                    Callable::Native(nf) => {
                        // Native goroutine: runs to completion here; the
                        // cooperative model has no preemption inside host
                        // code anyway. Results are discarded.
                        let mut staged = StagedArgs::default();
                        stage_native_args(fiber, fn_, &nf, call.b, shift, &mut staged);
                        match native::call_staged(env, &nf, &staged, call.b) {
                            Ok(()) => exit_check(fiber, module, env),
                            Err(msg) => {
                                raise(fiber, module, env, Value::str(&msg), PanicKind::Runtime)
                            }
                        }
                    }
                    Callable::Method { .. } => runtime_panic(
                        fiber,
                        module,
                        env,
                        "runtime error: unresolved method value",
                    ),
                },
                Value::Nil => runtime_panic(
                    fiber,
                    module,
                    env,
                    "runtime error: invalid memory address or nil pointer dereference",
                ),
                _ => runtime_panic(fiber, module, env, "runtime error: go of non-function"),
            }
        }
        Opcode::CallNative => {
            let nf = fn_.natives[call.a as u8 as usize].clone();
            let mut staged = StagedArgs::default();
            stage_native_args(fiber, fn_, &nf, call.b, shift, &mut staged);
            match native::call_staged(env, &nf, &staged, call.b) {
                Ok(()) => exit_check(fiber, module, env),
                Err(msg) => raise(fiber, module, env, Value::str(&msg), PanicKind::Runtime),
            }
        }
        _ => runtime_panic(fiber, module, env, "runtime error: bad go instruction"),
    }
}

/// Copies a native call's raw register window — per-bank result slots,
/// fixed arguments and the staged variadic tail — into per-bank vectors
/// for `go native(...)` and deferred native calls.
fn stage_native_args(
    fiber: &Fiber,
    _fn: &Function,
    nf: &vela_runtime::native::NativeFunction,
    numvar: i8,
    shift: [i8; 4],
    staged: &mut StagedArgs,
) {
    use vela_runtime::native::Kind;
    let tables = nf.tables();
    // Per-bank window sizes: result slots plus inputs of that bank.
    let mut counts = [
        tables.out_off[0] as u32,
        tables.out_off[1] as u32,
        tables.out_off[2] as u32,
        tables.out_off[3] as u32,
    ];
    let variadic = nf.is_variadic();
    let last_in = tables.ins.len().saturating_sub(1);
    for (i, kind) in tables.ins.iter().enumerate() {
        if variadic && i == last_in && numvar != NO_VARIADIC {
            // The trailing elements sit in the element's bank.
            let bank = match nf.func_type().params.last().map(Type::underlying) {
                Some(t) => match &*t {
                    Type::Slice(e) => e.bank() as usize,
                    _ => 3,
                },
                None => 3,
            };
            counts[bank] += numvar.max(0) as u32;
            continue;
        }
        match kind {
            Kind::Env => {}
            Kind::Bool | Kind::Int | Kind::Uint => counts[0] += 1,
            Kind::Float64 => counts[1] += 1,
            Kind::String => counts[2] += 1,
            Kind::Func | Kind::Interface => counts[3] += 1,
        }
    }
    let base = [
        fiber.fp[0] + shift[0] as u32,
        fiber.fp[1] + shift[1] as u32,
        fiber.fp[2] + shift[2] as u32,
        fiber.fp[3] + shift[3] as u32,
    ];
    for r in 1..=counts[0] {
        staged.int.push(fiber.regs.int[(base[0] + r) as usize]);
    }
    for r in 1..=counts[1] {
        staged.float.push(fiber.regs.float[(base[1] + r) as usize]);
    }
    for r in 1..=counts[2] {
        staged
            .string
            .push(fiber.regs.string[(base[2] + r) as usize].clone());
    }
    for r in 1..=counts[3] {
        staged
            .general
            .push(fiber.regs.general[(base[3] + r) as usize].clone());
    }
}
