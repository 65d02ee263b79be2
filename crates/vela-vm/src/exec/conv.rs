//! Conversions: integer widths, floats, strings and byte/rune slices.

use std::rc::Rc;

use vela_runtime::env::Env;
use vela_runtime::function::{Function, Module};
use vela_runtime::types::{BasicKind, Type, TypeHandle};
use vela_runtime::value::{SliceObj, Value};

use crate::fiber::Fiber;
use crate::vm::{charge, Flow};

use super::defer::runtime_panic;

pub(crate) fn truncate_int(v: i64, typ: &TypeHandle) -> i64 {
    match typ.basic_kind() {
        Some(BasicKind::Int8) => v as i8 as i64,
        Some(BasicKind::Int16) => v as i16 as i64,
        Some(BasicKind::Int32) => v as i32 as i64,
        Some(BasicKind::Uint8) => v as u8 as i64,
        Some(BasicKind::Uint16) => v as u16 as i64,
        Some(BasicKind::Uint32) => v as u32 as i64,
        Some(BasicKind::Uint64) | Some(BasicKind::Uint) => v, // bit pattern preserved
        _ => v,
    }
}

pub(crate) fn convert_int(
    fiber: &mut Fiber,
    module: &Module,
    env: &Env,
    x: i64,
    typ: &TypeHandle,
    c: i8,
) -> Flow {
    match typ.basic_kind() {
        Some(bk) if bk.is_float() => {
            fiber.regs.set_float(fiber.fp, c, x as f64);
            Flow::Next
        }
        Some(BasicKind::String) => {
            // Rune to string.
            let ch = char::from_u32(x as u32).unwrap_or(char::REPLACEMENT_CHARACTER);
            fiber
                .regs
                .set_string(fiber.fp, c, Rc::from(ch.to_string().as_str()));
            Flow::Next
        }
        Some(_) => {
            fiber.regs.set_int(fiber.fp, c, truncate_int(x, typ));
            Flow::Next
        }
        None => runtime_panic(fiber, module, env, "runtime error: bad int conversion"),
    }
}

pub(crate) fn convert_string(
    fiber: &mut Fiber,
    fn_: &Function,
    module: &Module,
    env: &Env,
    a: i8,
    b: i8,
    c: i8,
) -> Flow {
    let typ = fn_.types[b as u8 as usize].clone();
    match &*Type::underlying(&typ) {
        // Slice of bytes/runes back to string: source is a general slice.
        Type::Basic(BasicKind::String) => {
            let s = match fiber.regs.general(fiber.fp, a) {
                Value::Slice(s) => s,
                Value::Nil => SliceObj::with_len_cap(Type::basic(BasicKind::Uint8), 0, 0),
                _ => {
                    return runtime_panic(fiber, module, env, "runtime error: bad string conversion")
                }
            };
            let rune_elems = matches!(s.elem.basic_kind(), Some(BasicKind::Int32));
            if let Some(flow) = charge(fiber, module, env, s.len * if rune_elems { 4 } else { 1 }) {
                return flow;
            }
            let mut out = String::with_capacity(s.len);
            for i in 0..s.len {
                let v = s.get(i).unwrap().as_int();
                if rune_elems {
                    out.push(char::from_u32(v as u32).unwrap_or(char::REPLACEMENT_CHARACTER));
                } else {
                    out.push(v as u8 as char);
                }
            }
            fiber.regs.set_string(fiber.fp, c, Rc::from(out.as_str()));
            Flow::Next
        }
        // String to []byte or []rune.
        Type::Slice(elem) => {
            let s = fiber.regs.string(fiber.fp, a);
            let runes = matches!(elem.basic_kind(), Some(BasicKind::Int32));
            let bytes = if runes { s.chars().count() * 4 } else { s.len() };
            if let Some(flow) = charge(fiber, module, env, bytes) {
                return flow;
            }
            let values: Vec<Value> = if runes {
                s.chars().map(|ch| Value::Int(ch as i64)).collect()
            } else {
                s.bytes().map(|byte| Value::Int(byte as i64)).collect()
            };
            let len = values.len();
            let obj = SliceObj {
                elem: elem.clone(),
                array: Rc::new(std::cell::RefCell::new(values)),
                off: 0,
                len,
                cap: len,
            };
            fiber.regs.set_general(fiber.fp, c, Value::Slice(obj));
            Flow::Next
        }
        _ => runtime_panic(fiber, module, env, "runtime error: bad string conversion"),
    }
}
