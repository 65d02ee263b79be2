//! Call and return: frame push with the four-bank stack shift, and the
//! return sequence that runs deferred calls LIFO before restoring the
//! caller.

use vela_runtime::env::Env;
use vela_runtime::function::Module;
use vela_runtime::value::Value;

use crate::fiber::{CallFrame, Fiber, FrameStatus, PanicKind};
use crate::vm::Flow;

use super::defer::{park_and_invoke, raise, restore, unwind_step, InvokeOutcome};

/// The return sequence: runs deferred calls LIFO, then restores the
/// caller. Shared by the `Return` op and by parked `Returned`/`Recovered`
/// frames resuming after a deferred call.
pub(crate) fn do_return(fiber: &mut Fiber, module: &Module, env: &Env) -> Flow {
    loop {
        if let Some(d) = fiber.pop_defer_at_depth() {
            // Park the returning function at its Return instruction; when
            // the deferred call finishes, the parked frame pops with
            // status Returned and this loop resumes.
            fiber.pc = fiber.pc.saturating_sub(1);
            match park_and_invoke(fiber, module, env, d, FrameStatus::Returned) {
                InvokeOutcome::Entered => return Flow::Refetch,
                InvokeOutcome::NativeDone => {
                    fiber.pc += 1;
                    continue;
                }
                InvokeOutcome::NativePanicked(msg) => {
                    return raise(fiber, module, env, Value::str(&msg), PanicKind::Runtime)
                }
            }
        }
        match fiber.frames.pop() {
            None => return Flow::Done,
            Some(frame) => {
                let status = frame.status;
                restore(fiber, frame);
                match status {
                    FrameStatus::Started => return Flow::Refetch,
                    // Tail-call markers are transparent on return.
                    FrameStatus::Tailed => continue,
                    // The parked function was mid-return (or its panic was
                    // recovered): keep returning on its behalf.
                    FrameStatus::Returned | FrameStatus::Recovered => continue,
                    // A deferred call finished while unwinding: the panic
                    // is still active, keep unwinding this function.
                    FrameStatus::Panicked => return unwind_step(fiber, module, env),
                }
            }
        }
    }
}

pub(crate) fn enter_call(
    fiber: &mut Fiber,
    module: &Module,
    target: u32,
    cells: Vec<vela_runtime::value::CellRef>,
    shift: [i8; 4],
    return_pc: u32,
    variadics: i8,
) {
    fiber.frames.push(CallFrame {
        fn_id: fiber.fn_id,
        cells: std::mem::replace(&mut fiber.cells, cells),
        fp: fiber.fp,
        pc: return_pc,
        iter_base: fiber.iter_base,
        status: FrameStatus::Started,
        variadics,
    });
    fiber.iter_base = fiber.iters.len();
    for t in 0..4 {
        fiber.fp[t] += shift[t] as u32;
    }
    let callee = &module.functions[target as usize];
    fiber.regs.ensure(fiber.fp, callee.reg_count);
    fiber.fn_id = target;
    fiber.pc = 0;
}
