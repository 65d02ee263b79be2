//! Channel send and receive: non-blocking attempts against the channel
//! state, fiber parking, and context-cancellation checks shared with
//! select and channel ranges.

use vela_runtime::chan::{RecvOutcome, SendOutcome};
use vela_runtime::env::Env;
use vela_runtime::function::{Function, Module};
use vela_runtime::value::Value;

use crate::fiber::{Fiber, PanicKind};
use crate::vm::{read_typed, write_typed, Effects, Flow};

use super::defer::{raise, runtime_panic};

pub(crate) fn cancelled(fiber: &mut Fiber, module: &Module, env: &Env) -> Option<Flow> {
    let ctx = env.context();
    if ctx.is_cancellable() && ctx.done() {
        return Some(raise(
            fiber,
            module,
            env,
            Value::str("context cancelled"),
            PanicKind::ContextCancelled,
        ));
    }
    None
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn chan_send(
    fiber: &mut Fiber,
    fn_: &Function,
    module: &Module,
    env: &Env,
    effects: &mut Effects,
    k: bool,
    a: i8,
    c: i8,
) -> Flow {
    // A parked sender whose value was already consumed resumes here.
    if fiber.send_done {
        fiber.send_done = false;
        return Flow::Next;
    }
    if let Some(flow) = cancelled(fiber, module, env) {
        return flow;
    }
    let ch = match fiber.regs.general(fiber.fp, c) {
        Value::Chan(ch) => ch,
        Value::Nil => {
            // Send on nil channel blocks forever.
            fiber.pc -= 1;
            return Flow::Block;
        }
        _ => return runtime_panic(fiber, module, env, "runtime error: send on non-chan"),
    };
    let v = read_typed(fiber, fn_, &ch.elem.clone(), a, k);
    match ch.try_send(v.deep_copy()) {
        SendOutcome::Sent(wake) => {
            if let Some(w) = wake {
                effects.wakes.push((w, false));
            }
            Flow::Next
        }
        SendOutcome::WouldBlock => {
            ch.park_sender(fiber.id, v.deep_copy());
            fiber.pc -= 1;
            Flow::Block
        }
        SendOutcome::Closed => runtime_panic(fiber, module, env, "send on closed channel"),
    }
}

pub(crate) fn chan_receive(
    fiber: &mut Fiber,
    module: &Module,
    env: &Env,
    effects: &mut Effects,
    a: i8,
    c: i8,
) -> Flow {
    if let Some(flow) = cancelled(fiber, module, env) {
        // Remove a stale registration from a previous block.
        if let Value::Chan(ch) = fiber.regs.general(fiber.fp, a) {
            ch.unpark_receiver(fiber.id);
        }
        return flow;
    }
    let ch = match fiber.regs.general(fiber.fp, a) {
        Value::Chan(ch) => ch,
        Value::Nil => {
            fiber.pc -= 1;
            return Flow::Block;
        }
        _ => return runtime_panic(fiber, module, env, "runtime error: receive on non-chan"),
    };
    match ch.try_recv() {
        RecvOutcome::Received(v, wake) => {
            if let Some(w) = wake {
                effects.wakes.push((w, true));
            }
            let elem = ch.elem.clone();
            write_typed(fiber, &elem, c, v);
            fiber.ok = true;
            Flow::Next
        }
        RecvOutcome::Drained => {
            let elem = ch.elem.clone();
            write_typed(fiber, &elem, c, Value::zero(&elem));
            fiber.ok = false;
            Flow::Next
        }
        RecvOutcome::WouldBlock => {
            ch.park_receiver(fiber.id);
            fiber.pc -= 1;
            Flow::Block
        }
    }
}
