//! Range iteration over slices, arrays, strings, maps and channels,
//! driven by per-frame iterator slots.

use std::rc::Rc;

use vela_runtime::chan::{Channel, RecvOutcome};
use vela_runtime::env::Env;
use vela_runtime::function::Module;
use vela_runtime::types::Type;
use vela_runtime::value::{SliceObj, Value};

use crate::fiber::{Fiber, RangeIter};
use crate::vm::{Effects, Flow};

use super::channel::cancelled;
use super::defer::runtime_panic;

/// `Range a, b, c`: a = collection register, b = static loop depth,
/// c = collection kind (2 = string, which lives in the string bank).
pub(crate) fn range_begin(fiber: &mut Fiber, module: &Module, env: &Env, a: i8, b: i8, c: i8) -> Flow {
    let iter = match c {
        2 => {
            let s = fiber.regs.string(fiber.fp, a);
            RangeIter::Str { s, byte: 0 }
        }
        _ => match fiber.regs.general(fiber.fp, a) {
            Value::Slice(s) => RangeIter::Slice { s, i: 0 },
            Value::Array(arr) => RangeIter::Slice {
                s: arr.as_slice(),
                i: 0,
            },
            Value::Map(m) => {
                let entries: Vec<(Value, Value)> = m
                    .data
                    .borrow()
                    .iter()
                    .map(|(mk, v)| (map_key_value(mk), v.clone()))
                    .collect();
                RangeIter::Map { entries, i: 0 }
            }
            Value::Chan(ch) => RangeIter::Chan(ch),
            Value::Nil => RangeIter::Slice {
                s: SliceObj::with_len_cap(Type::empty_interface(), 0, 0),
                i: 0,
            },
            _ => return runtime_panic(fiber, module, env, "runtime error: range over bad value"),
        },
    };
    let slot = fiber.iter_base + b as usize;
    if fiber.iters.len() <= slot {
        fiber.iters.resize_with(slot + 1, || None);
    }
    fiber.iters[slot] = Some(iter);
    Flow::Next
}

fn map_key_value(mk: &vela_runtime::value::MapKey) -> Value {
    use vela_runtime::value::MapKey;
    match mk {
        MapKey::Nil => Value::Nil,
        MapKey::Bool(b) => Value::Bool(*b),
        MapKey::Int(i) => Value::Int(*i),
        MapKey::Float(bits) => Value::Float(f64::from_bits(*bits)),
        MapKey::Str(s) => Value::Str(s.clone()),
    }
}

pub(crate) fn range_next(
    fiber: &mut Fiber,
    module: &Module,
    env: &Env,
    effects: &mut Effects,
    a: i8,
    b: i8,
    c: i8,
) -> Flow {
    let slot = fiber.iter_base + a as usize;
    if slot >= fiber.iters.len() {
        return runtime_panic(fiber, module, env, "runtime error: bad range iterator");
    }
    enum Step {
        Item(Value, Value),
        DoneIter,
        BlockChan(Rc<Channel>),
        WakeThen(Value, Option<u32>),
    }
    let step = match fiber.iters[slot].as_mut() {
        None => return runtime_panic(fiber, module, env, "runtime error: bad range iterator"),
        Some(RangeIter::Slice { s, i }) => {
            if *i < s.len {
                let item = Step::Item(Value::Int(*i as i64), s.get(*i).unwrap());
                *i += 1;
                item
            } else {
                Step::DoneIter
            }
        }
        Some(RangeIter::Str { s, byte }) => {
            if *byte < s.len() {
                let ch = s[*byte..].chars().next().unwrap();
                let item = Step::Item(Value::Int(*byte as i64), Value::Int(ch as i64));
                *byte += ch.len_utf8();
                item
            } else {
                Step::DoneIter
            }
        }
        Some(RangeIter::Map { entries, i }) => {
            if *i < entries.len() {
                let (key, v) = entries[*i].clone();
                *i += 1;
                Step::Item(key, v)
            } else {
                Step::DoneIter
            }
        }
        Some(RangeIter::Chan(ch)) => match ch.try_recv() {
            RecvOutcome::Received(v, wake) => Step::WakeThen(v, wake),
            RecvOutcome::Drained => Step::DoneIter,
            RecvOutcome::WouldBlock => Step::BlockChan(ch.clone()),
        },
    };
    // If-family convention: the next instruction (a Goto to the loop
    // end) is skipped iff an item was produced.
    match step {
        Step::Item(key, val) => {
            write_value_auto(fiber, b, key);
            write_value_auto(fiber, c, val);
            fiber.pc += 1;
            Flow::Next
        }
        Step::WakeThen(v, wake) => {
            if let Some(w) = wake {
                effects.wakes.push((w, true));
            }
            write_value_auto(fiber, b, v);
            fiber.pc += 1;
            Flow::Next
        }
        Step::DoneIter => {
            fiber.iters[slot] = None;
            Flow::Next
        }
        Step::BlockChan(ch) => {
            if let Some(flow) = cancelled(fiber, module, env) {
                ch.unpark_receiver(fiber.id);
                return flow;
            }
            ch.park_receiver(fiber.id);
            fiber.pc -= 1;
            Flow::Block
        }
    }
}

/// Writes a ranged key/value into the bank its runtime representation
/// dictates (the emitter allocated the destination accordingly).
fn write_value_auto(fiber: &mut Fiber, r: i8, v: Value) {
    match v {
        Value::Int(i) => fiber.regs.set_int(fiber.fp, r, i),
        Value::Bool(bv) => fiber.regs.set_int(fiber.fp, r, bv as i64),
        Value::Float(f) => fiber.regs.set_float(fiber.fp, r, f),
        Value::Str(s) => fiber.regs.set_string(fiber.fp, r, s),
        other => fiber.regs.set_general(fiber.fp, r, other),
    }
}
