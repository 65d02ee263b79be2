//! Native-function calls: the bridge between bytecode and host code.
//!
//! The calling convention mirrors the register layout: the caller stages
//! a window at `fp + shift` holding, per bank, the result slots followed
//! by the argument registers. A handful of common signatures are invoked
//! directly from the registers; everything else is marshaled through a
//! pooled `Value` slab directed by the function's cached kind tables.
//!
//! Variadic conventions: a variadic count ≥ 0 means the trailing
//! arguments are staged individually in the element's bank and the bridge
//! builds the slice; [`NO_VARIADIC`] with a variadic callee means the
//! caller already passed a spread slice as the final argument. Manifest
//! signatures declare the variadic parameter as its slice type.

use std::cell::RefCell;
use std::rc::Rc;

use vela_runtime::env::Env;
use vela_runtime::instruction::NO_VARIADIC;
use vela_runtime::native::{Kind, NativeFunction, NativeImpl};
use vela_runtime::types::{Type, TypeHandle};
use vela_runtime::value::{Callable, SliceObj, Value};

use crate::fiber::{Fiber, StagedArgs};

/// Resolves a callable to a directly invokable variant. Bound methods are
/// promoted to their resolved native function and the promotion is
/// written back, so later calls skip the lookup; promotion is idempotent.
pub(crate) fn promote(cl: &Rc<RefCell<Callable>>, _env: &Env) -> Callable {
    let resolved = match &*cl.borrow() {
        Callable::Fn { fn_id, cells } => {
            return Callable::Fn {
                fn_id: *fn_id,
                cells: cells.clone(),
            }
        }
        Callable::Native(nf) => return Callable::Native(nf.clone()),
        Callable::Method { recv, name } => resolve_method(recv, name),
    };
    match resolved {
        Some(nf) => {
            *cl.borrow_mut() = Callable::Native(nf.clone());
            Callable::Native(nf)
        }
        None => cl.borrow().clone(),
    }
}

/// Binds `recv.name` to a native function: looks the method up on the
/// receiver's named type and wraps it with the receiver applied.
fn resolve_method(recv: &Value, name: &str) -> Option<Rc<NativeFunction>> {
    let (typ, recv) = match recv {
        Value::Struct(s) => (s.typ.clone(), Value::Struct(s.clone())),
        _ => return None,
    };
    let method = typ.method(name)?.func.clone();
    let ft = method.func_type();
    // The method's declared signature carries the receiver in first
    // position; the bound form drops it.
    let bound_sig = Type::func(
        ft.params.iter().skip(1).cloned().collect(),
        ft.results.clone(),
        ft.variadic,
    );
    let inner = method.clone();
    Some(NativeFunction::generic(
        inner.pkg.clone(),
        format!("{}.{}", typ, name),
        bound_sig,
        move |env, args| {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(recv.clone());
            full.extend_from_slice(args);
            invoke_values(&inner, env, &full)
        },
    ))
}

/// Invokes any [`NativeImpl`] with boxed arguments.
pub(crate) fn invoke_values(
    nf: &NativeFunction,
    env: &Env,
    args: &[Value],
) -> Result<Vec<Value>, String> {
    match nf.imp() {
        NativeImpl::StrToInt(f) => Ok(vec![Value::Int(f(&args[0].as_str()))]),
        NativeImpl::StrToStr(f) => Ok(vec![Value::str(f(&args[0].as_str()))]),
        NativeImpl::StrStrToInt(f) => {
            Ok(vec![Value::Int(f(&args[0].as_str(), &args[1].as_str()))])
        }
        NativeImpl::StrStrToBool(f) => {
            Ok(vec![Value::Bool(f(&args[0].as_str(), &args[1].as_str()))])
        }
        NativeImpl::StrIntToStr(f) => {
            Ok(vec![Value::str(f(&args[0].as_str(), args[1].as_int()))])
        }
        NativeImpl::IntToInt(f) => Ok(vec![Value::Int(f(args[0].as_int()))]),
        NativeImpl::IntIntToInt(f) => Ok(vec![Value::Int(f(args[0].as_int(), args[1].as_int()))]),
        NativeImpl::FloatToFloat(f) => Ok(vec![Value::Float(f(args[0].as_float()))]),
        NativeImpl::Generic(f) => f(env, args),
    }
}

/// Element type of a variadic function's trailing slice parameter.
fn variadic_elem(nf: &NativeFunction) -> TypeHandle {
    match nf.func_type().params.last().map(Type::underlying) {
        Some(t) => match &*t {
            Type::Slice(e) => e.clone(),
            _ => Type::empty_interface(),
        },
        None => Type::empty_interface(),
    }
}

/// Calls a native function against the register window at `fp + shift`.
///
/// Results are written back into the window's leading slots; the frame
/// pointers are restored before returning.
pub(crate) fn call_native(
    fiber: &mut Fiber,
    _fn: &vela_runtime::function::Function,
    env: &Env,
    nf: &NativeFunction,
    numvar: i8,
    shift: [i8; 4],
) -> Result<(), String> {
    let saved_fp = fiber.fp;
    for t in 0..4 {
        fiber.fp[t] += shift[t] as u32;
    }
    let result = call_native_shifted(fiber, env, nf, numvar);
    fiber.fp = saved_fp;
    result
}

fn call_native_shifted(fiber: &mut Fiber, env: &Env, nf: &NativeFunction, numvar: i8) -> Result<(), String> {
    let fp = fiber.fp;

    // Fast paths: direct register access for hand-picked signatures.
    match nf.imp() {
        NativeImpl::StrToInt(f) => {
            let r = f(&fiber.regs.string(fp, 1));
            fiber.regs.set_int(fp, 1, r);
            return Ok(());
        }
        NativeImpl::StrToStr(f) => {
            let r = f(&fiber.regs.string(fp, 2));
            fiber.regs.set_string(fp, 1, Rc::from(r.as_str()));
            return Ok(());
        }
        NativeImpl::StrStrToInt(f) => {
            let r = f(&fiber.regs.string(fp, 1), &fiber.regs.string(fp, 2));
            fiber.regs.set_int(fp, 1, r);
            return Ok(());
        }
        NativeImpl::StrStrToBool(f) => {
            let r = f(&fiber.regs.string(fp, 1), &fiber.regs.string(fp, 2));
            fiber.regs.set_bool(fp, 1, r);
            return Ok(());
        }
        NativeImpl::StrIntToStr(f) => {
            let r = f(&fiber.regs.string(fp, 2), fiber.regs.int(fp, 1));
            fiber.regs.set_string(fp, 1, Rc::from(r.as_str()));
            return Ok(());
        }
        NativeImpl::IntToInt(f) => {
            let r = f(fiber.regs.int(fp, 2));
            fiber.regs.set_int(fp, 1, r);
            return Ok(());
        }
        NativeImpl::IntIntToInt(f) => {
            let r = f(fiber.regs.int(fp, 2), fiber.regs.int(fp, 3));
            fiber.regs.set_int(fp, 1, r);
            return Ok(());
        }
        NativeImpl::FloatToFloat(f) => {
            let r = f(fiber.regs.float(fp, 2));
            fiber.regs.set_float(fp, 1, r);
            return Ok(());
        }
        NativeImpl::Generic(_) => {}
    }

    // Slow path: kind-directed marshaling through the pooled slab.
    let tables = nf.tables();
    let variadic = nf.is_variadic();
    let mut args = nf.get_args(tables.ins.len());
    let mut cursor: [i8; 4] = tables.out_off;
    let last_in = tables.ins.len().saturating_sub(1);
    for (i, kind) in tables.ins.iter().enumerate() {
        let is_variadic_slot = variadic && i == last_in && numvar != NO_VARIADIC;
        if is_variadic_slot {
            let elem = variadic_elem(nf);
            let mut items = Vec::with_capacity(numvar.max(0) as usize);
            for _ in 0..numvar.max(0) {
                items.push(read_next(fiber, &mut cursor, &elem));
            }
            args.push(make_slice(elem, items));
            continue;
        }
        match kind {
            Kind::Env => {} // passed separately to the host closure
            Kind::Bool => {
                cursor[0] += 1;
                args.push(Value::Bool(fiber.regs.int(fp, cursor[0]) != 0));
            }
            Kind::Int | Kind::Uint => {
                cursor[0] += 1;
                args.push(Value::Int(fiber.regs.int(fp, cursor[0])));
            }
            Kind::Float64 => {
                cursor[1] += 1;
                args.push(Value::Float(fiber.regs.float(fp, cursor[1])));
            }
            Kind::String => {
                cursor[2] += 1;
                args.push(Value::Str(fiber.regs.string(fp, cursor[2])));
            }
            Kind::Func | Kind::Interface => {
                cursor[3] += 1;
                args.push(fiber.regs.general(fp, cursor[3]));
            }
        }
    }

    let rets = invoke_values(nf, env, &args);
    nf.put_args(args);
    let rets = rets?;

    let mut out: [i8; 4] = [0; 4];
    for (kind, v) in tables.outs.iter().zip(rets) {
        match kind {
            Kind::Bool | Kind::Int | Kind::Uint => {
                out[0] += 1;
                fiber.regs.set_int(fp, out[0], v.as_int());
            }
            Kind::Float64 => {
                out[1] += 1;
                fiber.regs.set_float(fp, out[1], v.as_float());
            }
            Kind::String => {
                out[2] += 1;
                fiber.regs.set_string(fp, out[2], v.as_str());
            }
            Kind::Func | Kind::Interface | Kind::Env => {
                out[3] += 1;
                fiber.regs.set_general(fp, out[3], v);
            }
        }
    }
    Ok(())
}

fn read_next(fiber: &Fiber, cursor: &mut [i8; 4], elem: &TypeHandle) -> Value {
    use vela_runtime::types::BasicKind;
    let fp = fiber.fp;
    match &*Type::underlying(elem) {
        Type::Basic(BasicKind::Bool) => {
            cursor[0] += 1;
            Value::Bool(fiber.regs.int(fp, cursor[0]) != 0)
        }
        Type::Basic(k) if k.is_integer() => {
            cursor[0] += 1;
            Value::Int(fiber.regs.int(fp, cursor[0]))
        }
        Type::Basic(k) if k.is_float() => {
            cursor[1] += 1;
            Value::Float(fiber.regs.float(fp, cursor[1]))
        }
        Type::Basic(BasicKind::String) => {
            cursor[2] += 1;
            Value::Str(fiber.regs.string(fp, cursor[2]))
        }
        _ => {
            cursor[3] += 1;
            fiber.regs.general(fp, cursor[3])
        }
    }
}

fn make_slice(elem: TypeHandle, items: Vec<Value>) -> Value {
    let len = items.len();
    Value::Slice(SliceObj {
        elem,
        array: Rc::new(RefCell::new(items)),
        off: 0,
        len,
        cap: len,
    })
}

/// Calls a native function with arguments frozen into per-bank vectors
/// (`go native(...)` and deferred native calls). Results are discarded.
pub(crate) fn call_staged(
    env: &Env,
    nf: &NativeFunction,
    staged: &StagedArgs,
    numvar: i8,
) -> Result<(), String> {
    let tables = nf.tables();
    let variadic = nf.is_variadic();
    // The staged window starts with the per-bank result slots.
    let mut cursor: [usize; 4] = [
        tables.out_off[0] as usize,
        tables.out_off[1] as usize,
        tables.out_off[2] as usize,
        tables.out_off[3] as usize,
    ];
    let mut next = |bank: usize, staged: &StagedArgs| -> Value {
        let i = cursor[bank];
        cursor[bank] += 1;
        match bank {
            0 => Value::Int(staged.int.get(i).copied().unwrap_or(0)),
            1 => Value::Float(staged.float.get(i).copied().unwrap_or(0.0)),
            2 => Value::Str(staged.string.get(i).cloned().unwrap_or_else(|| Rc::from(""))),
            _ => staged.general.get(i).cloned().unwrap_or(Value::Nil),
        }
    };
    let mut args = Vec::with_capacity(tables.ins.len());
    let last_in = tables.ins.len().saturating_sub(1);
    for (i, kind) in tables.ins.iter().enumerate() {
        if variadic && i == last_in && numvar != NO_VARIADIC {
            let elem = variadic_elem(nf);
            let bank = bank_of(&elem);
            let mut items = Vec::with_capacity(numvar.max(0) as usize);
            for _ in 0..numvar.max(0) {
                items.push(next(bank, staged));
            }
            args.push(make_slice(elem, items));
            continue;
        }
        match kind {
            Kind::Env => {}
            Kind::Bool => {
                let v = next(0, staged);
                args.push(Value::Bool(v.as_int() != 0));
            }
            Kind::Int | Kind::Uint => args.push(next(0, staged)),
            Kind::Float64 => args.push(next(1, staged)),
            Kind::String => args.push(next(2, staged)),
            Kind::Func | Kind::Interface => args.push(next(3, staged)),
        }
    }
    invoke_values(nf, env, &args).map(|_| ())
}

fn bank_of(t: &TypeHandle) -> usize {
    use vela_runtime::types::BasicKind;
    match &*Type::underlying(t) {
        Type::Basic(k) if k.is_float() => 1,
        Type::Basic(BasicKind::String) => 2,
        Type::Basic(_) => 0,
        _ => 3,
    }
}
