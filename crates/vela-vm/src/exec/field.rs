//! Struct field access through encoded field-index paths, with pointer
//! auto-deref along the way.

use vela_runtime::env::Env;
use vela_runtime::function::{Function, Module};
use vela_runtime::types::{Type, TypeHandle};
use vela_runtime::value::{StructObj, Value};

use crate::fiber::Fiber;
use crate::vm::{read_typed, write_typed, Flow};

use super::defer::runtime_panic;

fn struct_at_path(v: Value, path: &[usize]) -> Result<(StructObj, usize), &'static str> {
    let mut cur = v;
    // Auto-deref pointers along the way.
    for (i, &idx) in path.iter().enumerate() {
        cur = match cur {
            Value::Cell(cell) => cell.borrow().clone(),
            other => other,
        };
        match cur {
            Value::Struct(s) => {
                if i == path.len() - 1 {
                    return Ok((s, idx));
                }
                let next = s.fields.borrow().get(idx).cloned();
                match next {
                    Some(v) => cur = v,
                    None => return Err("bad field index"),
                }
            }
            Value::Nil => return Err("nil dereference"),
            _ => return Err("field access on non-struct"),
        }
    }
    Err("empty field path")
}

fn field_type_at(typ: &TypeHandle, idx: usize) -> Option<TypeHandle> {
    match &*Type::underlying(typ) {
        Type::Struct(fields) => fields.get(idx).map(|f| f.typ.clone()),
        Type::Pointer(e) => field_type_at(e, idx),
        _ => None,
    }
}

pub(crate) fn field_get(
    fiber: &mut Fiber,
    module: &Module,
    env: &Env,
    v: Value,
    path: &[usize],
    c: i8,
) -> Flow {
    match struct_at_path(v, path) {
        Ok((s, idx)) => {
            let field = s.fields.borrow().get(idx).cloned();
            match field {
                Some(fv) => {
                    let ft = field_type_at(&s.typ, idx).unwrap_or_else(Type::empty_interface);
                    write_typed(fiber, &ft, c, fv.deep_copy());
                    Flow::Next
                }
                None => runtime_panic(fiber, module, env, "runtime error: bad field index"),
            }
        }
        Err("nil dereference") => runtime_panic(
            fiber,
            module,
            env,
            "runtime error: invalid memory address or nil pointer dereference",
        ),
        Err(msg) => runtime_panic(fiber, module, env, msg),
    }
}

pub(crate) fn field_set(
    fiber: &mut Fiber,
    fn_: &Function,
    module: &Module,
    env: &Env,
    target: Value,
    path: &[usize],
    a: i8,
    k: bool,
) -> Flow {
    match struct_at_path(target, path) {
        Ok((s, idx)) => {
            let ft = field_type_at(&s.typ, idx).unwrap_or_else(Type::empty_interface);
            let v = read_typed(fiber, fn_, &ft, a, k);
            s.fields.borrow_mut()[idx] = v.deep_copy();
            Flow::Next
        }
        Err("nil dereference") => runtime_panic(
            fiber,
            module,
            env,
            "runtime error: invalid memory address or nil pointer dereference",
        ),
        Err(msg) => runtime_panic(fiber, module, env, msg),
    }
}
