//! Select: polls the registered cases, commits the first ready one and
//! rewinds the program counter to its body jump, or parks the fiber on
//! every involved channel.

use std::rc::Rc;

use vela_runtime::chan::{Channel, RecvOutcome, SendOutcome};
use vela_runtime::env::Env;
use vela_runtime::function::{Function, Module};
use vela_runtime::value::Value;

use crate::fiber::{Fiber, SelectCase, SelectDir};
use crate::vm::{read_typed, write_typed, Effects, Flow};

use super::channel::cancelled;
use super::defer::runtime_panic;

fn select_chan(fiber: &Fiber, case: &SelectCase) -> Option<Rc<Channel>> {
    match fiber.regs.general(fiber.fp, case.chan_reg) {
        Value::Chan(ch) => Some(ch),
        _ => None,
    }
}

pub(crate) fn do_select(
    fiber: &mut Fiber,
    fn_: &Function,
    module: &Module,
    env: &Env,
    effects: &mut Effects,
) -> Flow {
    let sp = fiber.pc; // already past Select
    let n = fiber.select.len() as u32;

    // Unpark from every involved channel before re-polling.
    for case in fiber.select.clone() {
        if let Some(ch) = select_chan(fiber, &case) {
            ch.unpark_selector(fiber.id);
        }
    }

    if let Some(flow) = cancelled(fiber, module, env) {
        fiber.select.clear();
        return flow;
    }

    let cases = fiber.select.clone();
    let mut default_idx: Option<u32> = None;
    for (i, case) in cases.iter().enumerate() {
        match case.dir {
            SelectDir::Default => default_idx = Some(i as u32),
            SelectDir::Recv => {
                let ready = select_chan(fiber, case).map(|ch| ch.recv_ready()).unwrap_or(false);
                if ready {
                    let ch = select_chan(fiber, case).unwrap();
                    match ch.try_recv() {
                        RecvOutcome::Received(v, wake) => {
                            if let Some(w) = wake {
                                effects.wakes.push((w, true));
                            }
                            let elem = ch.elem.clone();
                            write_typed(fiber, &elem, case.value_reg, v);
                            fiber.ok = true;
                        }
                        RecvOutcome::Drained => {
                            let elem = ch.elem.clone();
                            write_typed(fiber, &elem, case.value_reg, Value::zero(&elem));
                            fiber.ok = false;
                        }
                        RecvOutcome::WouldBlock => continue,
                    }
                    fiber.select.clear();
                    fiber.pc = sp - 2 * (n - i as u32);
                    return Flow::Next;
                }
            }
            SelectDir::Send => {
                let ready = select_chan(fiber, case).map(|ch| ch.send_ready()).unwrap_or(false);
                if ready {
                    let ch = select_chan(fiber, case).unwrap();
                    let v = read_typed(fiber, fn_, &ch.elem.clone(), case.value_reg, false);
                    match ch.try_send(v) {
                        SendOutcome::Sent(wake) => {
                            if let Some(w) = wake {
                                effects.wakes.push((w, false));
                            }
                        }
                        SendOutcome::Closed => {
                            fiber.select.clear();
                            return runtime_panic(fiber, module, env, "send on closed channel");
                        }
                        SendOutcome::WouldBlock => continue,
                    }
                    fiber.select.clear();
                    fiber.pc = sp - 2 * (n - i as u32);
                    return Flow::Next;
                }
            }
        }
    }

    if let Some(d) = default_idx {
        fiber.select.clear();
        fiber.pc = sp - 2 * (n - d);
        return Flow::Next;
    }

    // Nothing ready: park on every channel case and retry on wake.
    for case in &cases {
        if let Some(ch) = select_chan(fiber, case) {
            ch.park_selector(fiber.id);
        }
    }
    fiber.pc = sp - 1; // back to the Select instruction
    Flow::Block
}
