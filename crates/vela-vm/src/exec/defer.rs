//! Defer, panic, recover: staging deferred calls, interleaving them
//! with returns and panic unwinding, and surfacing unrecovered panics.

use vela_runtime::env::Env;
use vela_runtime::function::Module;
use vela_runtime::value::{Callable, Value};

use crate::error::{PanicEntry, VmError};
use crate::fiber::{CallFrame, DeferredCall, Fiber, FrameStatus, PanicKind, PanicRecord};
use crate::vm::{native, Flow};

fn stack_trace(fiber: &Fiber, module: &Module) -> String {
    let mut out = format!("vela goroutine {} [running]:", fiber.id + 1);
    let mut frames: Vec<(u32, u32)> = vec![(fiber.fn_id, fiber.pc.saturating_sub(1))];
    for frame in fiber.frames.iter().rev() {
        let back = if frame.status == FrameStatus::Tailed { 1 } else { 2 };
        frames.push((frame.fn_id, frame.pc.saturating_sub(back)));
    }
    for (fn_id, pc) in frames {
        let f = &module.functions[fn_id as usize];
        out.push('\n');
        if f.pkg.is_empty() {
            out.push_str(&f.name);
        } else {
            out.push_str(&format!("{}.{}", f.pkg, f.name));
        }
        out.push_str("()\n\t");
        if f.file.is_empty() {
            out.push_str("???");
        } else {
            out.push_str(&f.file);
        }
        out.push(':');
        match f.line_for_pc(pc) {
            Some(line) => out.push_str(&line.to_string()),
            None => out.push_str("???"),
        }
    }
    out
}

pub(crate) fn runtime_panic(fiber: &mut Fiber, module: &Module, env: &Env, msg: &str) -> Flow {
    raise(fiber, module, env, Value::str(msg), PanicKind::Runtime)
}

pub(crate) fn raise(fiber: &mut Fiber, module: &Module, env: &Env, msg: Value, kind: PanicKind) -> Flow {
    let stack = stack_trace(fiber, module);
    fiber.panics.push(PanicRecord {
        msg,
        kind,
        recovered: false,
        stack,
    });
    unwind_step(fiber, module, env)
}

/// Converts the fiber's panic stack into the surfaced error.
fn panic_error(fiber: &Fiber) -> VmError {
    match fiber.panics.last().map(|p| p.kind.clone()) {
        Some(PanicKind::OutOfMemory) => VmError::OutOfMemory,
        Some(PanicKind::ContextCancelled) => VmError::ContextCancelled,
        _ => VmError::Panic(
            fiber
                .panics
                .iter()
                .map(|p| PanicEntry {
                    msg: p.msg.clone(),
                    recovered: p.recovered,
                    stack: p.stack.clone(),
                })
                .collect(),
        ),
    }
}

/// Advances panic unwinding: runs the next deferred call in the way of
/// the active panic, or pops frames until the fiber dies.
pub(crate) fn unwind_step(fiber: &mut Fiber, module: &Module, env: &Env) -> Flow {
    if let Some(PanicKind::Exit(code)) = fiber.panics.last().map(|p| p.kind.clone()) {
        // Exit sentinel: no deferred calls run, no recovery.
        fiber.frames.clear();
        return Flow::Exit(code);
    }
    loop {
        if let Some(d) = fiber.pop_defer_at_depth() {
            match park_and_invoke(fiber, module, env, d, FrameStatus::Panicked) {
                InvokeOutcome::Entered => return Flow::Refetch,
                InvokeOutcome::NativeDone => continue,
                InvokeOutcome::NativePanicked(msg) => {
                    return raise(fiber, module, env, Value::str(&msg), PanicKind::Runtime)
                }
            }
        }
        match fiber.frames.pop() {
            None => return Flow::Fail(panic_error(fiber)),
            Some(frame) => {
                restore(fiber, frame);
                // Keep unwinding through the restored frame; its own
                // deferred calls are picked up at the top of the loop.
            }
        }
    }
}

pub(crate) fn restore(fiber: &mut Fiber, frame: CallFrame) {
    fiber.fn_id = frame.fn_id;
    fiber.cells = frame.cells;
    fiber.fp = frame.fp;
    fiber.pc = frame.pc;
    fiber.iters.truncate(fiber.iter_base);
    fiber.iter_base = frame.iter_base;
}

pub(crate) enum InvokeOutcome {
    /// A bytecode deferred call was entered; dispatch must refetch.
    Entered,
    /// A native deferred call ran to completion inline.
    NativeDone,
    NativePanicked(String),
}

/// Parks the current function with `status` and enters a deferred call.
/// The deferred frame window sits right above the parked function's
/// registers.
pub(crate) fn park_and_invoke(
    fiber: &mut Fiber,
    module: &Module,
    env: &Env,
    d: DeferredCall,
    status: FrameStatus,
) -> InvokeOutcome {
    let callable = match &d.callable {
        Value::Func(c) => c.clone(),
        _ => return InvokeOutcome::NativePanicked("call of nil function".to_string()),
    };
    let resolved = native::promote(&callable, env);
    match resolved {
        Callable::Fn { fn_id, cells } => {
            let parked_count = module.functions[fiber.fn_id as usize].reg_count;
            fiber.frames.push(CallFrame {
                fn_id: fiber.fn_id,
                cells: std::mem::take(&mut fiber.cells),
                fp: fiber.fp,
                pc: fiber.pc,
                iter_base: fiber.iter_base,
                status,
                variadics: d.variadics,
            });
            fiber.iter_base = fiber.iters.len();
            for t in 0..4 {
                fiber.fp[t] += parked_count[t] as u32;
            }
            let callee = &module.functions[fn_id as usize];
            fiber.regs.ensure(fiber.fp, callee.reg_count);
            let fp = fiber.fp;
            for (i, v) in d.args.int.iter().enumerate() {
                fiber.regs.set_int(fp, (i + 1) as i8, *v);
            }
            for (i, v) in d.args.float.iter().enumerate() {
                fiber.regs.set_float(fp, (i + 1) as i8, *v);
            }
            for (i, v) in d.args.string.iter().enumerate() {
                fiber.regs.set_string(fp, (i + 1) as i8, v.clone());
            }
            for (i, v) in d.args.general.iter().enumerate() {
                fiber.regs.set_general(fp, (i + 1) as i8, v.clone());
            }
            fiber.fn_id = fn_id;
            fiber.cells = cells;
            fiber.pc = 0;
            InvokeOutcome::Entered
        }
        Callable::Native(nf) => {
            match native::call_staged(env, &nf, &d.args, d.variadics) {
                Ok(()) => InvokeOutcome::NativeDone,
                Err(msg) => InvokeOutcome::NativePanicked(msg),
            }
        }
        Callable::Method { .. } => {
            InvokeOutcome::NativePanicked("unresolved method value".to_string())
        }
    }
}
