//! The virtual machine: dispatch loop, calls, defer/panic unwinding,
//! channels, select, iteration and memory charging.
//!
//! Execution is cooperative: each goroutine is a fiber, and the VM runs
//! one fiber at a time for up to [`TIME_SLICE`] instructions before
//! re-queuing it. Blocking operations (send, receive, select, channel
//! range) suspend the fiber; channel state wakes it. All cross-fiber
//! effects produced while a fiber runs — wakes and spawns — are collected
//! and applied when the slice ends, so the dispatch loop borrows one
//! fiber at a time.

pub(crate) mod native;

use std::rc::Rc;

use tracing::debug;

use vela_runtime::chan::Channel;
use vela_runtime::env::Env;
use vela_runtime::function::{Function, Module};
use vela_runtime::instruction::{
    decode_field_index, decode_int16, decode_uint24, BankTag, Condition, Opcode, NO_VARIADIC,
};
use vela_runtime::types::{BasicKind, Type, TypeHandle};
use vela_runtime::value::{new_cell, Callable, MapObj, SliceObj, Value};

use crate::error::VmError;
use crate::fiber::{
    CallFrame, DeferredCall, Fiber, FrameStatus, PanicKind, SelectCase, SelectDir,
    StagedArgs,
};
use crate::scheduler::Scheduler;

use crate::exec::call::{do_return, enter_call};
use crate::exec::channel::{chan_receive, chan_send};
use crate::exec::cmp::{
    float_condition, int_condition, len_condition, string_condition, uint_condition,
};
use crate::exec::conv::{convert_int, convert_string, truncate_int};
use crate::exec::defer::{raise, runtime_panic};
use crate::exec::field::{field_get, field_set};
use crate::exec::goroutine::go_spawn;
use crate::exec::iface::value_implements;
use crate::exec::iter::{range_begin, range_next};
use crate::exec::select::do_select;

pub use crate::registers::STACK_SIZE;

/// Instructions executed per scheduling turn before a fiber yields.
pub const TIME_SLICE: u32 = 1024;

/// Result of running one fiber for a slice.
#[derive(Debug)]
enum SliceOutcome {
    Continue,
    Done,
    Block,
    Exit(i32),
    Failed(VmError),
}

/// Per-instruction control flow inside a slice.
pub(crate) enum Flow {
    Next,
    /// Frames changed: re-fetch the running function.
    Refetch,
    Block,
    Done,
    Exit(i32),
    Fail(VmError),
}

/// Cross-fiber effects collected during a slice and applied after.
#[derive(Default)]
pub(crate) struct Effects {
    /// `(fiber, delivered)` — delivered marks a parked sender whose value
    /// was consumed, so it must not re-send on resume.
    pub(crate) wakes: Vec<(u32, bool)>,
    pub(crate) spawns: Vec<Fiber>,
}

pub struct Vm {
    pub module: Rc<Module>,
    pub env: Rc<Env>,
    pub scheduler: Scheduler,
    /// Set when the run terminated through `Env::exit`.
    pub exit_code: Option<i32>,
}

impl Vm {
    pub fn new(module: Module, env: Rc<Env>) -> Vm {
        Vm {
            module: Rc::new(module),
            env,
            scheduler: Scheduler::new(),
            exit_code: None,
        }
    }

    /// Runs the module's entry function to completion and returns the
    /// exit code: the value of `Env::exit`, or the entry function's
    /// integer result, or 0.
    pub fn run(&mut self) -> Result<i32, VmError> {
        let entry = self.module.entry;
        if entry as usize >= self.module.functions.len() {
            return Err(VmError::InvalidEntry(entry));
        }

        // Bind globals: host cells stay shared, the rest get fresh cells
        // seeded with the initial or zero value.
        let cells = self
            .module
            .globals
            .iter()
            .map(|g| match &g.cell {
                Some(c) => c.clone(),
                None => new_cell(
                    g.init
                        .clone()
                        .unwrap_or_else(|| Value::zero(&g.typ)),
                ),
            })
            .collect();
        self.env.set_globals(cells);

        let main_id = self.scheduler.next_fiber_id();
        let mut fiber = Fiber::new(main_id, entry);
        fiber
            .regs
            .ensure([0; 4], self.module.functions[entry as usize].reg_count);
        self.scheduler.spawn(fiber);
        debug!(entry, "vm run");

        let result = loop {
            let id = match self.scheduler.schedule_next() {
                Some(id) => id,
                None => {
                    if !self.scheduler.has_blocked() {
                        // Main already handled below; nothing left.
                        break Ok(0);
                    }
                    let ctx = self.env.context();
                    if !ctx.is_cancellable() {
                        break Err(VmError::Deadlock);
                    }
                    // Wait for the context to fire, then let every blocked
                    // operation observe it.
                    while !ctx.done() {
                        std::thread::sleep(std::time::Duration::from_millis(1));
                    }
                    self.scheduler.wake_all_blocked();
                    continue;
                }
            };

            match self.run_fiber(id) {
                SliceOutcome::Continue => self.scheduler.requeue_current(),
                SliceOutcome::Block => self.scheduler.block_current(),
                SliceOutcome::Done => {
                    let is_main = id == main_id;
                    let code = if is_main { self.main_result(id) } else { 0 };
                    self.scheduler.kill_current();
                    self.scheduler.reap_dead();
                    if is_main {
                        break Ok(code);
                    }
                }
                SliceOutcome::Exit(code) => {
                    self.exit_code = Some(code);
                    break Ok(code);
                }
                SliceOutcome::Failed(err) => break Err(err),
            }
        };
        self.env.terminated();
        result
    }

    /// The entry function's integer result, if its signature has one.
    fn main_result(&self, id: u32) -> i32 {
        let fiber = self.scheduler.fiber(id);
        let fn_ = &self.module.functions[fiber.fn_id as usize];
        if let Type::Func(ft) = &*fn_.typ {
            if ft.results.len() == 1 {
                if let Some(k) = ft.results[0].basic_kind() {
                    if k.is_integer() {
                        return fiber.regs.int(fiber.fp, 1) as i32;
                    }
                }
            }
        }
        0
    }

    fn run_fiber(&mut self, id: u32) -> SliceOutcome {
        let module = self.module.clone();
        let env = self.env.clone();
        let mut effects = Effects::default();
        let fiber = self.scheduler.fiber_mut(id);
        let outcome = exec_slice(fiber, &module, &env, &mut effects);
        for (w, delivered) in effects.wakes {
            if delivered {
                self.scheduler.fiber_mut(w).send_done = true;
            }
            self.scheduler.wake(w);
        }
        for mut f in effects.spawns {
            f.id = self.scheduler.next_fiber_id();
            self.scheduler.spawn(f);
        }
        outcome
    }
}

// =============================================================================
// Register access helpers (typed and bank-tagged)
// =============================================================================

/// Reads a register (or, with `k`, a constant) as a boxed value, using the
/// type to pick the bank: this is the uniform path for channel sends, map
/// keys and values, slice elements.
pub(crate) fn read_typed(fiber: &Fiber, fn_: &Function, typ: &TypeHandle, r: i8, k: bool) -> Value {
    match &*Type::underlying(typ) {
        Type::Basic(BasicKind::Bool) => {
            let v = if k { r as i64 } else { fiber.regs.int(fiber.fp, r) };
            Value::Bool(v != 0)
        }
        Type::Basic(b) if b.is_integer() => {
            let v = if k { r as i64 } else { fiber.regs.int(fiber.fp, r) };
            Value::Int(v)
        }
        Type::Basic(b) if b.is_float() => {
            let v = if k {
                fn_.consts.floats[r as u8 as usize]
            } else {
                fiber.regs.float(fiber.fp, r)
            };
            Value::Float(v)
        }
        Type::Basic(BasicKind::String) => {
            let v = if k {
                fn_.consts.strings[r as u8 as usize].clone()
            } else {
                fiber.regs.string(fiber.fp, r)
            };
            Value::Str(v)
        }
        _ => {
            if k {
                fn_.consts.general[r as u8 as usize].clone()
            } else {
                fiber.regs.general(fiber.fp, r)
            }
        }
    }
}

/// Writes a boxed value into the register bank the type dictates.
pub(crate) fn write_typed(fiber: &mut Fiber, typ: &TypeHandle, r: i8, v: Value) {
    match &*Type::underlying(typ) {
        Type::Basic(b) if b.is_float() => fiber.regs.set_float(fiber.fp, r, v.as_float()),
        Type::Basic(BasicKind::String) => fiber.regs.set_string(fiber.fp, r, v.as_str()),
        Type::Basic(_) => fiber.regs.set_int(fiber.fp, r, v.as_int()),
        _ => fiber.regs.set_general(fiber.fp, r, v),
    }
}

pub(crate) fn read_bank(fiber: &Fiber, tag: BankTag, r: i8) -> Value {
    match tag {
        BankTag::Int => Value::Int(fiber.regs.int(fiber.fp, r)),
        BankTag::Float => Value::Float(fiber.regs.float(fiber.fp, r)),
        BankTag::String => Value::Str(fiber.regs.string(fiber.fp, r)),
        BankTag::General => fiber.regs.general(fiber.fp, r),
    }
}

pub(crate) fn write_bank(fiber: &mut Fiber, tag: BankTag, r: i8, v: Value) {
    match tag {
        BankTag::Int => fiber.regs.set_int(fiber.fp, r, v.as_int()),
        BankTag::Float => fiber.regs.set_float(fiber.fp, r, v.as_float()),
        BankTag::String => fiber.regs.set_string(fiber.fp, r, v.as_str()),
        BankTag::General => fiber.regs.set_general(fiber.fp, r, v),
    }
}

// =============================================================================
// Memory cost model
// =============================================================================

pub(crate) fn charge(fiber: &mut Fiber, module: &Module, env: &Env, bytes: usize) -> Option<Flow> {
    match env.alloc(bytes as isize) {
        Ok(()) => None,
        Err(e) => Some(raise(
            fiber,
            module,
            env,
            Value::str(&e.to_string()),
            PanicKind::OutOfMemory,
        )),
    }
}

// =============================================================================
// The dispatch loop
// =============================================================================

fn exec_slice(fiber: &mut Fiber, module: &Module, env: &Env, effects: &mut Effects) -> SliceOutcome {
    let mut fn_: &Function = &module.functions[fiber.fn_id as usize];

    for _ in 0..TIME_SLICE {
        if fiber.pc as usize >= fn_.body.len() {
            // Implicit return at end of body (the builder always emits a
            // trailing Return, so this is a safety net).
            match do_return(fiber, module, env) {
                Flow::Refetch => {
                    fn_ = &module.functions[fiber.fn_id as usize];
                    continue;
                }
                Flow::Done => return SliceOutcome::Done,
                Flow::Fail(e) => return SliceOutcome::Failed(e),
                Flow::Exit(c) => return SliceOutcome::Exit(c),
                _ => unreachable!(),
            }
        }
        let inst = fn_.body[fiber.pc as usize];
        fiber.pc += 1;
        let (op, k) = inst.decode();
        let (a, b, c) = (inst.a, inst.b, inst.c);

        let flow = step(fiber, fn_, module, env, effects, op, k, a, b, c);
        match flow {
            Flow::Next => {}
            Flow::Refetch => fn_ = &module.functions[fiber.fn_id as usize],
            Flow::Block => return SliceOutcome::Block,
            Flow::Done => return SliceOutcome::Done,
            Flow::Exit(code) => return SliceOutcome::Exit(code),
            Flow::Fail(e) => return SliceOutcome::Failed(e),
        }
    }
    SliceOutcome::Continue
}

#[allow(clippy::too_many_arguments)]
fn step(
    fiber: &mut Fiber,
    fn_: &Function,
    module: &Module,
    env: &Env,
    effects: &mut Effects,
    op: Opcode,
    k: bool,
    a: i8,
    b: i8,
    c: i8,
) -> Flow {
    let fp = fiber.fp;
    match op {
        Opcode::None => Flow::Next,

        // --- int arithmetic -------------------------------------------------
        Opcode::AddInt => {
            let x = fiber.regs.int(fp, a);
            let y = if k { b as i64 } else { fiber.regs.int(fp, b) };
            fiber.regs.set_int(fp, c, x.wrapping_add(y));
            Flow::Next
        }
        Opcode::SubInt => {
            let x = fiber.regs.int(fp, a);
            let y = if k { b as i64 } else { fiber.regs.int(fp, b) };
            fiber.regs.set_int(fp, c, x.wrapping_sub(y));
            Flow::Next
        }
        Opcode::SubInvInt => {
            let x = fiber.regs.int(fp, a);
            let y = if k { b as i64 } else { fiber.regs.int(fp, b) };
            fiber.regs.set_int(fp, c, y.wrapping_sub(x));
            Flow::Next
        }
        Opcode::MulInt => {
            let x = fiber.regs.int(fp, a);
            let y = if k { b as i64 } else { fiber.regs.int(fp, b) };
            fiber.regs.set_int(fp, c, x.wrapping_mul(y));
            Flow::Next
        }
        Opcode::DivInt => {
            let x = fiber.regs.int(fp, a);
            let y = if k { b as i64 } else { fiber.regs.int(fp, b) };
            if y == 0 {
                return runtime_panic(fiber, module, env, "runtime error: integer divide by zero");
            }
            fiber.regs.set_int(fp, c, x.wrapping_div(y));
            Flow::Next
        }
        Opcode::RemInt => {
            let x = fiber.regs.int(fp, a);
            let y = if k { b as i64 } else { fiber.regs.int(fp, b) };
            if y == 0 {
                return runtime_panic(fiber, module, env, "runtime error: integer divide by zero");
            }
            fiber.regs.set_int(fp, c, x.wrapping_rem(y));
            Flow::Next
        }

        // --- float arithmetic -----------------------------------------------
        Opcode::AddFloat => {
            let x = fiber.regs.float(fp, a);
            let y = if k {
                fn_.consts.floats[b as u8 as usize]
            } else {
                fiber.regs.float(fp, b)
            };
            fiber.regs.set_float(fp, c, x + y);
            Flow::Next
        }
        Opcode::SubFloat => {
            let x = fiber.regs.float(fp, a);
            let y = if k {
                fn_.consts.floats[b as u8 as usize]
            } else {
                fiber.regs.float(fp, b)
            };
            fiber.regs.set_float(fp, c, x - y);
            Flow::Next
        }
        Opcode::SubInvFloat => {
            let x = fiber.regs.float(fp, a);
            let y = if k {
                fn_.consts.floats[b as u8 as usize]
            } else {
                fiber.regs.float(fp, b)
            };
            fiber.regs.set_float(fp, c, y - x);
            Flow::Next
        }
        Opcode::MulFloat => {
            let x = fiber.regs.float(fp, a);
            let y = if k {
                fn_.consts.floats[b as u8 as usize]
            } else {
                fiber.regs.float(fp, b)
            };
            fiber.regs.set_float(fp, c, x * y);
            Flow::Next
        }
        Opcode::DivFloat => {
            let x = fiber.regs.float(fp, a);
            let y = if k {
                fn_.consts.floats[b as u8 as usize]
            } else {
                fiber.regs.float(fp, b)
            };
            fiber.regs.set_float(fp, c, x / y);
            Flow::Next
        }

        // --- bitwise --------------------------------------------------------
        Opcode::And => {
            let x = fiber.regs.int(fp, a);
            let y = if k { b as i64 } else { fiber.regs.int(fp, b) };
            fiber.regs.set_int(fp, c, x & y);
            Flow::Next
        }
        Opcode::AndNot => {
            let x = fiber.regs.int(fp, a);
            let y = if k { b as i64 } else { fiber.regs.int(fp, b) };
            fiber.regs.set_int(fp, c, x & !y);
            Flow::Next
        }
        Opcode::Or => {
            let x = fiber.regs.int(fp, a);
            let y = if k { b as i64 } else { fiber.regs.int(fp, b) };
            fiber.regs.set_int(fp, c, x | y);
            Flow::Next
        }
        Opcode::Xor => {
            let x = fiber.regs.int(fp, a);
            let y = if k { b as i64 } else { fiber.regs.int(fp, b) };
            fiber.regs.set_int(fp, c, x ^ y);
            Flow::Next
        }
        Opcode::Shl => {
            let x = fiber.regs.int(fp, a);
            let y = if k { b as i64 } else { fiber.regs.int(fp, b) };
            if y < 0 {
                return runtime_panic(fiber, module, env, "runtime error: negative shift amount");
            }
            let r = if y >= 64 { 0 } else { x.wrapping_shl(y as u32) };
            fiber.regs.set_int(fp, c, r);
            Flow::Next
        }
        Opcode::Shr => {
            let x = fiber.regs.int(fp, a);
            let y = if k { b as i64 } else { fiber.regs.int(fp, b) };
            if y < 0 {
                return runtime_panic(fiber, module, env, "runtime error: negative shift amount");
            }
            let r = if y >= 64 {
                if x < 0 {
                    -1
                } else {
                    0
                }
            } else {
                x.wrapping_shr(y as u32)
            };
            fiber.regs.set_int(fp, c, r);
            Flow::Next
        }
        Opcode::ShrU => {
            let x = fiber.regs.int(fp, a) as u64;
            let y = if k { b as i64 } else { fiber.regs.int(fp, b) };
            if y < 0 {
                return runtime_panic(fiber, module, env, "runtime error: negative shift amount");
            }
            let r = if y >= 64 { 0 } else { x.wrapping_shr(y as u32) };
            fiber.regs.set_int(fp, c, r as i64);
            Flow::Next
        }

        // --- data movement --------------------------------------------------
        Opcode::Move => match BankTag::from_i8(a) {
            BankTag::Int => {
                let v = if k { b as i64 } else { fiber.regs.int(fp, b) };
                fiber.regs.set_int(fp, c, v);
                Flow::Next
            }
            BankTag::Float => {
                let v = if k {
                    fn_.consts.floats[b as u8 as usize]
                } else {
                    fiber.regs.float(fp, b)
                };
                fiber.regs.set_float(fp, c, v);
                Flow::Next
            }
            BankTag::String => {
                let v = if k {
                    fn_.consts.strings[b as u8 as usize].clone()
                } else {
                    fiber.regs.string(fp, b)
                };
                fiber.regs.set_string(fp, c, v);
                Flow::Next
            }
            BankTag::General => {
                let v = if k {
                    fn_.consts.general[b as u8 as usize].clone()
                } else {
                    fiber.regs.general(fp, b)
                };
                // Structs and arrays copy on assignment.
                fiber.regs.set_general(fp, c, v.deep_copy());
                Flow::Next
            }
        },
        Opcode::LoadNumber => {
            match a {
                0 => {
                    let v = fn_.consts.ints[b as u8 as usize];
                    fiber.regs.set_int(fp, c, v);
                }
                _ => {
                    let v = fn_.consts.floats[b as u8 as usize];
                    fiber.regs.set_float(fp, c, v);
                }
            }
            Flow::Next
        }
        Opcode::Typify => {
            let typ = &fn_.types[a as u8 as usize];
            let v = read_typed(fiber, fn_, typ, b, k);
            fiber.regs.set_general(fp, c, v.deep_copy());
            Flow::Next
        }
        Opcode::Concat => {
            let x = fiber.regs.string(fp, a);
            let y = if k {
                fn_.consts.strings[b as u8 as usize].clone()
            } else {
                fiber.regs.string(fp, b)
            };
            if let Some(flow) = charge(fiber, module, env, x.len() + y.len()) {
                return flow;
            }
            let mut s = String::with_capacity(x.len() + y.len());
            s.push_str(&x);
            s.push_str(&y);
            fiber.regs.set_string(fiber.fp, c, Rc::from(s.as_str()));
            Flow::Next
        }

        // --- conversions ----------------------------------------------------
        Opcode::ConvertInt => {
            let x = fiber.regs.int(fp, a);
            let typ = &fn_.types[b as u8 as usize];
            convert_int(fiber, module, env, x, typ, c)
        }
        Opcode::ConvertUint => {
            let x = fiber.regs.int(fp, a) as u64;
            let typ = &fn_.types[b as u8 as usize];
            match typ.basic_kind() {
                Some(bk) if bk.is_float() => {
                    fiber.regs.set_float(fp, c, x as f64);
                    Flow::Next
                }
                Some(_) => {
                    fiber.regs.set_int(fp, c, truncate_int(x as i64, typ));
                    Flow::Next
                }
                None => runtime_panic(fiber, module, env, "runtime error: bad uint conversion"),
            }
        }
        Opcode::ConvertFloat => {
            let x = fiber.regs.float(fp, a);
            let typ = &fn_.types[b as u8 as usize];
            match typ.basic_kind() {
                Some(BasicKind::Float32) => {
                    fiber.regs.set_float(fp, c, x as f32 as f64);
                    Flow::Next
                }
                Some(BasicKind::Float64) => {
                    fiber.regs.set_float(fp, c, x);
                    Flow::Next
                }
                Some(_) => {
                    fiber.regs.set_int(fp, c, truncate_int(x as i64, typ));
                    Flow::Next
                }
                None => runtime_panic(fiber, module, env, "runtime error: bad float conversion"),
            }
        }
        Opcode::ConvertString => convert_string(fiber, fn_, module, env, a, b, c),
        Opcode::ConvertGeneral => {
            let typ = &fn_.types[b as u8 as usize];
            if let Some(flow) = charge(fiber, module, env, typ.size()) {
                return flow;
            }
            let v = fiber.regs.general(fiber.fp, a);
            fiber.regs.set_general(fiber.fp, c, v.deep_copy());
            Flow::Next
        }

        // --- globals, captures, function values -----------------------------
        Opcode::GetVar => {
            let idx = decode_int16(a, b) as usize;
            let cell = env.global(idx);
            let v = cell.borrow().clone();
            let typ = module.globals[idx].typ.clone();
            write_typed(fiber, &typ, c, v.deep_copy());
            Flow::Next
        }
        Opcode::SetVar => {
            let idx = decode_int16(b, c) as usize;
            let typ = module.globals[idx].typ.clone();
            let v = read_typed(fiber, fn_, &typ, a, k);
            let cell = env.global(idx);
            *cell.borrow_mut() = v.deep_copy();
            Flow::Next
        }
        Opcode::GetCapture => {
            let cell = fiber.cells[a as u8 as usize].clone();
            let v = cell.borrow().clone();
            write_bank(fiber, BankTag::from_i8(b), c, v);
            Flow::Next
        }
        Opcode::SetCapture => {
            let v = read_bank(fiber, BankTag::from_i8(c), a);
            let cell = fiber.cells[b as u8 as usize].clone();
            *cell.borrow_mut() = v;
            Flow::Next
        }
        Opcode::GetFunc => {
            let v = if a == 0 {
                Value::func(Callable::Fn {
                    fn_id: fn_.functions[b as u8 as usize],
                    cells: Vec::new(),
                })
            } else {
                Value::func(Callable::Native(fn_.natives[b as u8 as usize].clone()))
            };
            fiber.regs.set_general(fp, c, v);
            Flow::Next
        }
        Opcode::Func => {
            let target = fn_.literals[b as u8 as usize];
            let callee = &module.functions[target as usize];
            let mut cells = Vec::with_capacity(callee.var_refs.len());
            for &vr in &callee.var_refs {
                if vr < 0 {
                    // A cell in the parent's general bank.
                    let reg = (-vr) as i8;
                    match fiber.regs.general(fp, reg) {
                        Value::Cell(cell) => cells.push(cell),
                        other => {
                            // Capture by boxing on first closure creation.
                            let cell = new_cell(other);
                            fiber.regs.set_general(fp, reg, Value::Cell(cell.clone()));
                            cells.push(cell);
                        }
                    }
                } else {
                    cells.push(fiber.cells[vr as usize].clone());
                }
            }
            let v = Value::func(Callable::Fn {
                fn_id: target,
                cells,
            });
            fiber.regs.set_general(fiber.fp, c, v);
            Flow::Next
        }
        Opcode::MethodValue => {
            let recv = fiber.regs.general(fp, a);
            let name = fn_.consts.strings[b as u8 as usize].to_string();
            let v = Value::func(Callable::Method {
                recv: Box::new(recv),
                name,
            });
            fiber.regs.set_general(fp, c, v);
            Flow::Next
        }

        // --- allocation -----------------------------------------------------
        Opcode::New => {
            let typ = fn_.types[b as u8 as usize].clone();
            if let Some(flow) = charge(fiber, module, env, typ.size()) {
                return flow;
            }
            let v = Value::Cell(new_cell(Value::zero(&typ)));
            fiber.regs.set_general(fiber.fp, c, v);
            Flow::Next
        }
        Opcode::MakeSlice => {
            let typ = fn_.types[a as u8 as usize].clone();
            let operands = fn_.body[fiber.pc as usize];
            fiber.pc += 1;
            let flags = operands.c;
            let len = if flags & 1 != 0 {
                operands.a as i64
            } else {
                fiber.regs.int(fp, operands.a)
            };
            let cap = if flags & 2 != 0 {
                operands.b as i64
            } else {
                fiber.regs.int(fp, operands.b)
            };
            if len < 0 || cap < len {
                return runtime_panic(fiber, module, env, "runtime error: makeslice: len out of range");
            }
            let elem = match &*Type::underlying(&typ) {
                Type::Slice(e) => e.clone(),
                _ => return runtime_panic(fiber, module, env, "runtime error: makeslice of non-slice"),
            };
            if let Some(flow) = charge(fiber, module, env, elem.size() * cap as usize + 24) {
                return flow;
            }
            let s = SliceObj::with_len_cap(elem, len as usize, cap as usize);
            fiber.regs.set_general(fiber.fp, c, Value::Slice(s));
            Flow::Next
        }
        Opcode::MakeMap => {
            let typ = fn_.types[a as u8 as usize].clone();
            let n = if k { b as i64 } else { fiber.regs.int(fp, b) };
            if let Some(flow) = charge(fiber, module, env, 50 * n.max(0) as usize + 24) {
                return flow;
            }
            let (kt, vt) = match &*Type::underlying(&typ) {
                Type::Map(kt, vt) => (kt.clone(), vt.clone()),
                _ => return runtime_panic(fiber, module, env, "runtime error: make of non-map"),
            };
            let m = MapObj::with_capacity(kt, vt, n.max(0) as usize);
            fiber.regs.set_general(fiber.fp, c, Value::Map(m));
            Flow::Next
        }
        Opcode::MakeChan => {
            let typ = fn_.types[a as u8 as usize].clone();
            let cap = if k { b as i64 } else { fiber.regs.int(fp, b) };
            if cap < 0 {
                return runtime_panic(fiber, module, env, "runtime error: makechan: size out of range");
            }
            let elem = match &*Type::underlying(&typ) {
                Type::Chan(_, e) => e.clone(),
                _ => return runtime_panic(fiber, module, env, "runtime error: make of non-chan"),
            };
            if let Some(flow) = charge(fiber, module, env, elem.size() * cap as usize + 80) {
                return flow;
            }
            let ch = Channel::new(elem, cap as usize);
            fiber.regs.set_general(fiber.fp, c, Value::Chan(Rc::new(ch)));
            Flow::Next
        }

        // --- slices, arrays, strings, maps ----------------------------------
        Opcode::Append => {
            let s = match fiber.regs.general(fp, c) {
                Value::Slice(s) => s,
                Value::Nil => SliceObj::with_len_cap(Type::empty_interface(), 0, 0),
                _ => return runtime_panic(fiber, module, env, "runtime error: append to non-slice"),
            };
            let count = b as usize;
            // Charge for a growth if one will happen.
            if s.len + count > s.cap {
                let new_cap = vela_runtime::value::grow_cap(s.cap, s.len + count);
                if let Some(flow) = charge(fiber, module, env, new_cap * s.elem.size()) {
                    return flow;
                }
            }
            let mut cur = s;
            for i in 0..count {
                let v = read_typed(fiber, fn_, &cur.elem.clone(), a + i as i8, false);
                cur = cur.append(v);
            }
            fiber.regs.set_general(fiber.fp, c, Value::Slice(cur));
            Flow::Next
        }
        Opcode::AppendSlice => {
            let src = match fiber.regs.general(fp, a) {
                Value::Slice(s) => s,
                Value::Nil => {
                    return Flow::Next; // append(dst, nil...) is a no-op
                }
                _ => return runtime_panic(fiber, module, env, "runtime error: append of non-slice"),
            };
            let dst = match fiber.regs.general(fp, c) {
                Value::Slice(s) => s,
                Value::Nil => SliceObj::with_len_cap(src.elem.clone(), 0, 0),
                _ => return runtime_panic(fiber, module, env, "runtime error: append to non-slice"),
            };
            if dst.len + src.len > dst.cap {
                let new_cap = vela_runtime::value::grow_cap(dst.cap, dst.len + src.len);
                if let Some(flow) = charge(fiber, module, env, new_cap * dst.elem.size()) {
                    return flow;
                }
            }
            let mut cur = dst;
            for i in 0..src.len {
                cur = cur.append(src.get(i).unwrap());
            }
            fiber.regs.set_general(fiber.fp, c, Value::Slice(cur));
            Flow::Next
        }
        Opcode::SetSlice => {
            let s = match fiber.regs.general(fp, c) {
                Value::Slice(s) => s,
                Value::Array(arr) => arr.as_slice(),
                _ => return runtime_panic(fiber, module, env, "runtime error: index of non-slice"),
            };
            let idx = if k { b as i64 } else { fiber.regs.int(fp, b) };
            let v = read_typed(fiber, fn_, &s.elem.clone(), a, false);
            if idx < 0 || !s.set(idx as usize, v) {
                let msg = format!(
                    "runtime error: index out of range [{}] with length {}",
                    idx, s.len
                );
                return raise(fiber, module, env, Value::str(&msg), PanicKind::Runtime);
            }
            Flow::Next
        }
        Opcode::Index => {
            let s = match fiber.regs.general(fp, a) {
                Value::Slice(s) => s,
                Value::Array(arr) => arr.as_slice(),
                Value::Nil => SliceObj::with_len_cap(Type::empty_interface(), 0, 0),
                _ => return runtime_panic(fiber, module, env, "runtime error: index of non-slice"),
            };
            let idx = if k { b as i64 } else { fiber.regs.int(fp, b) };
            match if idx >= 0 { s.get(idx as usize) } else { None } {
                Some(v) => {
                    let elem = s.elem.clone();
                    write_typed(fiber, &elem, c, v.deep_copy());
                    Flow::Next
                }
                None => {
                    let msg = format!(
                        "runtime error: index out of range [{}] with length {}",
                        idx, s.len
                    );
                    raise(fiber, module, env, Value::str(&msg), PanicKind::Runtime)
                }
            }
        }
        Opcode::StringIndex => {
            let s = fiber.regs.string(fp, a);
            let idx = if k { b as i64 } else { fiber.regs.int(fp, b) };
            let bytes = s.as_bytes();
            if idx < 0 || idx as usize >= bytes.len() {
                let msg = format!(
                    "runtime error: index out of range [{}] with length {}",
                    idx,
                    bytes.len()
                );
                return raise(fiber, module, env, Value::str(&msg), PanicKind::Runtime);
            }
            fiber.regs.set_int(fp, c, bytes[idx as usize] as i64);
            Flow::Next
        }
        Opcode::MapIndex => {
            let (key_t, val_t, data) = match fiber.regs.general(fp, a) {
                Value::Map(m) => (m.key.clone(), m.value.clone(), Some(m)),
                Value::Nil => {
                    // Reads from a nil map yield the zero value.
                    fiber.ok = false;
                    (Type::empty_interface(), Type::empty_interface(), None)
                }
                _ => return runtime_panic(fiber, module, env, "runtime error: index of non-map"),
            };
            match data {
                Some(m) => {
                    let key = read_typed(fiber, fn_, &key_t, b, k);
                    let mk = match key.map_key() {
                        Some(mk) => mk,
                        None => {
                            return runtime_panic(
                                fiber,
                                module,
                                env,
                                "runtime error: hash of unhashable type",
                            )
                        }
                    };
                    let hit = m.data.borrow().get(&mk).cloned();
                    fiber.ok = hit.is_some();
                    let v = hit.unwrap_or_else(|| Value::zero(&val_t));
                    write_typed(fiber, &val_t, c, v.deep_copy());
                }
                None => {
                    fiber.regs.set_general(fiber.fp, c, Value::Nil);
                }
            }
            Flow::Next
        }
        Opcode::SetMap => {
            let m = match fiber.regs.general(fp, a) {
                Value::Map(m) => m,
                Value::Nil => {
                    return runtime_panic(
                        fiber,
                        module,
                        env,
                        "assignment to entry in nil map",
                    )
                }
                _ => return runtime_panic(fiber, module, env, "runtime error: index of non-map"),
            };
            let key = read_typed(fiber, fn_, &m.key.clone(), c, false);
            let val = read_typed(fiber, fn_, &m.value.clone(), b, k);
            if let Some(flow) = charge(fiber, module, env, m.key.size() + m.value.size()) {
                return flow;
            }
            let mk = match key.map_key() {
                Some(mk) => mk,
                None => {
                    return runtime_panic(
                        fiber,
                        module,
                        env,
                        "runtime error: hash of unhashable type",
                    )
                }
            };
            m.data.borrow_mut().insert(mk, val.deep_copy());
            Flow::Next
        }
        Opcode::Delete => {
            match fiber.regs.general(fp, a) {
                Value::Map(m) => {
                    let key = read_typed(fiber, fn_, &m.key.clone(), c, false);
                    if let Some(mk) = key.map_key() {
                        m.data.borrow_mut().remove(&mk);
                    }
                }
                // Deleting from a nil map is a no-op.
                Value::Nil => {}
                _ => return runtime_panic(fiber, module, env, "runtime error: delete of non-map"),
            }
            Flow::Next
        }
        Opcode::Slice => {
            let operands = fn_.body[fiber.pc as usize];
            fiber.pc += 1;
            let flags = operands.c;
            let low = if flags & 1 != 0 {
                operands.a as i64
            } else {
                fiber.regs.int(fp, operands.a)
            };
            let src_kind = b; // 0 slice, 1 array, 2 string
            if src_kind == 2 {
                let s = fiber.regs.string(fp, a);
                let high = if flags & 4 != 0 {
                    s.len() as i64
                } else if flags & 2 != 0 {
                    operands.b as i64
                } else {
                    fiber.regs.int(fp, operands.b)
                };
                if low < 0 || high < low || high as usize > s.len() {
                    let msg = format!("runtime error: slice bounds out of range [{}:{}]", low, high);
                    return raise(fiber, module, env, Value::str(&msg), PanicKind::Runtime);
                }
                let sub: Rc<str> = Rc::from(&s[low as usize..high as usize]);
                fiber.regs.set_string(fp, c, sub);
                return Flow::Next;
            }
            let s = match fiber.regs.general(fp, a) {
                Value::Slice(s) => s,
                Value::Array(arr) => arr.as_slice(),
                Value::Nil => SliceObj::with_len_cap(Type::empty_interface(), 0, 0),
                _ => return runtime_panic(fiber, module, env, "runtime error: slice of non-slice"),
            };
            let high = if flags & 4 != 0 {
                s.len as i64
            } else if flags & 2 != 0 {
                operands.b as i64
            } else {
                fiber.regs.int(fp, operands.b)
            };
            match if low >= 0 && high >= 0 {
                s.reslice(low as usize, high as usize)
            } else {
                None
            } {
                Some(sub) => {
                    fiber.regs.set_general(fiber.fp, c, Value::Slice(sub));
                    Flow::Next
                }
                None => {
                    let msg = format!("runtime error: slice bounds out of range [{}:{}]", low, high);
                    raise(fiber, module, env, Value::str(&msg), PanicKind::Runtime)
                }
            }
        }
        Opcode::Len => {
            let n = match b {
                0 => fiber.regs.string(fp, a).len() as i64,
                1 => match fiber.regs.general(fp, a) {
                    Value::Slice(s) => s.len as i64,
                    Value::Nil => 0,
                    _ => return runtime_panic(fiber, module, env, "runtime error: len of non-slice"),
                },
                2 => match fiber.regs.general(fp, a) {
                    Value::Map(m) => m.data.borrow().len() as i64,
                    Value::Nil => 0,
                    _ => return runtime_panic(fiber, module, env, "runtime error: len of non-map"),
                },
                3 => match fiber.regs.general(fp, a) {
                    Value::Chan(ch) => ch.len() as i64,
                    Value::Nil => 0,
                    _ => return runtime_panic(fiber, module, env, "runtime error: len of non-chan"),
                },
                _ => match fiber.regs.general(fp, a) {
                    Value::Array(arr) => arr.data.borrow().len() as i64,
                    _ => return runtime_panic(fiber, module, env, "runtime error: len of non-array"),
                },
            };
            fiber.regs.set_int(fp, c, n);
            Flow::Next
        }
        Opcode::Cap => {
            let n = match fiber.regs.general(fp, a) {
                Value::Slice(s) => s.cap as i64,
                Value::Chan(ch) => ch.cap as i64,
                Value::Nil => 0,
                _ => return runtime_panic(fiber, module, env, "runtime error: cap of bad value"),
            };
            fiber.regs.set_int(fp, c, n);
            Flow::Next
        }
        Opcode::Copy => {
            let dst = match fiber.regs.general(fp, a) {
                Value::Slice(s) => s,
                _ => return runtime_panic(fiber, module, env, "runtime error: copy to non-slice"),
            };
            let src = match fiber.regs.general(fp, b) {
                Value::Slice(s) => s,
                Value::Nil => SliceObj::with_len_cap(dst.elem.clone(), 0, 0),
                _ => return runtime_panic(fiber, module, env, "runtime error: copy of non-slice"),
            };
            let n = dst.len.min(src.len);
            for i in 0..n {
                dst.set(i, src.get(i).unwrap());
            }
            fiber.regs.set_int(fp, c, n as i64);
            Flow::Next
        }

        // --- structs and pointers -------------------------------------------
        Opcode::Field => {
            let v = fiber.regs.general(fp, a);
            let path = decode_field_index(fn_.consts.ints[b as u8 as usize]);
            field_get(fiber, module, env, v, &path, c)
        }
        Opcode::SetField => {
            let target = fiber.regs.general(fp, c);
            let path = decode_field_index(fn_.consts.ints[b as u8 as usize]);
            field_set(fiber, fn_, module, env, target, &path, a, k)
        }
        Opcode::PtrGet => {
            match fiber.regs.general(fp, a) {
                Value::Cell(cell) => {
                    let v = cell.borrow().clone();
                    write_bank(fiber, BankTag::from_i8(b), c, v);
                    Flow::Next
                }
                Value::Nil => runtime_panic(
                    fiber,
                    module,
                    env,
                    "runtime error: invalid memory address or nil pointer dereference",
                ),
                _ => runtime_panic(fiber, module, env, "runtime error: dereference of non-pointer"),
            }
        }
        Opcode::PtrSet => {
            let v = read_bank(fiber, BankTag::from_i8(b), a);
            match fiber.regs.general(fp, c) {
                Value::Cell(cell) => {
                    *cell.borrow_mut() = v;
                    Flow::Next
                }
                Value::Nil => runtime_panic(
                    fiber,
                    module,
                    env,
                    "runtime error: invalid memory address or nil pointer dereference",
                ),
                _ => runtime_panic(fiber, module, env, "runtime error: store through non-pointer"),
            }
        }

        // --- control flow ---------------------------------------------------
        Opcode::Goto => {
            fiber.pc = decode_uint24(a, b, c);
            Flow::Next
        }
        Opcode::If => {
            let cond = Condition::from_i8(b);
            let holds = match cond {
                Condition::Nil => fiber.regs.general(fp, a).is_nil(),
                Condition::NotNil => !fiber.regs.general(fp, a).is_nil(),
                Condition::Ok => fiber.ok,
                Condition::NotOk => !fiber.ok,
                _ => return runtime_panic(fiber, module, env, "runtime error: bad If condition"),
            };
            if holds {
                fiber.pc += 1;
            }
            Flow::Next
        }
        Opcode::IfInt => {
            let x = fiber.regs.int(fp, a);
            let y = if k { b as i64 } else { fiber.regs.int(fp, b) };
            if int_condition(x, y, Condition::from_i8(c)) {
                fiber.pc += 1;
            }
            Flow::Next
        }
        Opcode::IfUint => {
            let x = fiber.regs.int(fp, a) as u64;
            let y = if k {
                b as u8 as u64
            } else {
                fiber.regs.int(fp, b) as u64
            };
            if uint_condition(x, y, Condition::from_i8(c)) {
                fiber.pc += 1;
            }
            Flow::Next
        }
        Opcode::IfFloat => {
            let x = fiber.regs.float(fp, a);
            let y = if k {
                fn_.consts.floats[b as u8 as usize]
            } else {
                fiber.regs.float(fp, b)
            };
            if float_condition(x, y, Condition::from_i8(c)) {
                fiber.pc += 1;
            }
            Flow::Next
        }
        Opcode::IfString => {
            let cond = Condition::from_i8(c);
            let x = fiber.regs.string(fp, a);
            let holds = if cond.is_len() {
                let y = if k { b as i64 } else { fiber.regs.int(fp, b) };
                len_condition(x.len() as i64, y, cond)
            } else {
                let y = if k {
                    fn_.consts.strings[b as u8 as usize].clone()
                } else {
                    fiber.regs.string(fp, b)
                };
                string_condition(&x, &y, cond)
            };
            if holds {
                fiber.pc += 1;
            }
            Flow::Next
        }

        // --- calls ----------------------------------------------------------
        Opcode::Call => {
            let target = fn_.functions[a as u8 as usize];
            let shift = fn_.body[fiber.pc as usize].as_quad();
            let return_pc = fiber.pc + 1;
            enter_call(fiber, module, target, Vec::new(), shift, return_pc, NO_VARIADIC);
            Flow::Refetch
        }
        Opcode::CallIndirect => {
            let callee = fiber.regs.general(fp, a);
            let shift = fn_.body[fiber.pc as usize].as_quad();
            let return_pc = fiber.pc + 1;
            match &callee {
                Value::Func(cl) => {
                    let resolved = native::promote(cl, env);
                    match resolved {
                        Callable::Fn { fn_id, cells } => {
                            enter_call(fiber, module, fn_id, cells, shift, return_pc, b);
                            Flow::Refetch
                        }
                        Callable::Native(nf) => {
                            fiber.pc = return_pc;
                            match native::call_native(fiber, fn_, env, &nf, b, shift) {
                                Ok(()) => exit_check(fiber, module, env),
                                Err(msg) => raise(
                                    fiber,
                                    module,
                                    env,
                                    Value::str(&msg),
                                    PanicKind::Runtime,
                                ),
                            }
                        }
                        Callable::Method { .. } => runtime_panic(
                            fiber,
                            module,
                            env,
                            "runtime error: unresolved method value",
                        ),
                    }
                }
                Value::Nil => runtime_panic(
                    fiber,
                    module,
                    env,
                    "runtime error: invalid memory address or nil pointer dereference",
                ),
                _ => runtime_panic(fiber, module, env, "runtime error: call of non-function"),
            }
        }
        Opcode::CallNative => {
            let nf = fn_.natives[a as u8 as usize].clone();
            let shift = fn_.body[fiber.pc as usize].as_quad();
            fiber.pc += 1;
            match native::call_native(fiber, fn_, env, &nf, b, shift) {
                Ok(()) => exit_check(fiber, module, env),
                Err(msg) => raise(fiber, module, env, Value::str(&msg), PanicKind::Runtime),
            }
        }
        Opcode::TailCall => {
            let target = if a == vela_runtime::instruction::CURRENT_FUNCTION {
                fiber.fn_id
            } else {
                fn_.functions[a as u8 as usize]
            };
            fiber.frames.push(CallFrame {
                fn_id: fiber.fn_id,
                cells: std::mem::take(&mut fiber.cells),
                fp: fiber.fp,
                pc: fiber.pc,
                iter_base: fiber.iter_base,
                status: FrameStatus::Tailed,
                variadics: NO_VARIADIC,
            });
            fiber.iter_base = fiber.iters.len();
            let callee = &module.functions[target as usize];
            fiber.regs.ensure(fiber.fp, callee.reg_count);
            fiber.fn_id = target;
            fiber.pc = 0;
            Flow::Refetch
        }
        Opcode::Return => do_return(fiber, module, env),
        Opcode::Defer => {
            let callable = fiber.regs.general(fp, a);
            let shift = fn_.body[fiber.pc as usize].as_quad();
            let argsq = fn_.body[fiber.pc as usize + 1].as_quad();
            fiber.pc += 2;
            let mut staged = StagedArgs::default();
            for i in 0..argsq[0] {
                staged
                    .int
                    .push(fiber.regs.int(fp, shift[0] + 1 + i));
            }
            for i in 0..argsq[1] {
                staged
                    .float
                    .push(fiber.regs.float(fp, shift[1] + 1 + i));
            }
            for i in 0..argsq[2] {
                staged
                    .string
                    .push(fiber.regs.string(fp, shift[2] + 1 + i));
            }
            for i in 0..argsq[3] {
                staged
                    .general
                    .push(fiber.regs.general(fp, shift[3] + 1 + i));
            }
            let depth = fiber.depth();
            fiber.defers.push(DeferredCall {
                depth,
                callable,
                args: staged,
                variadics: b,
            });
            Flow::Next
        }
        Opcode::Go => go_spawn(fiber, fn_, module, env, effects),

        // --- channels and select --------------------------------------------
        Opcode::Send => chan_send(fiber, fn_, module, env, effects, k, a, c),
        Opcode::Receive => chan_receive(fiber, module, env, effects, a, c),
        Opcode::Close => {
            match fiber.regs.general(fp, a) {
                Value::Chan(ch) => {
                    let (first, woken) = ch.close();
                    if !first {
                        return runtime_panic(fiber, module, env, "close of closed channel");
                    }
                    effects.wakes.extend(woken.into_iter().map(|w| (w, false)));
                    Flow::Next
                }
                Value::Nil => runtime_panic(fiber, module, env, "close of nil channel"),
                _ => runtime_panic(fiber, module, env, "runtime error: close of non-chan"),
            }
        }
        Opcode::Case => {
            let dir = match a {
                0 => SelectDir::Send,
                1 => SelectDir::Recv,
                _ => SelectDir::Default,
            };
            let pc = fiber.pc - 1;
            fiber.select.push(SelectCase {
                dir,
                value_reg: b,
                chan_reg: c,
                pc,
            });
            // Skip this case's Goto during registration.
            fiber.pc += 1;
            Flow::Next
        }
        Opcode::Select => do_select(fiber, fn_, module, env, effects),

        // --- iteration ------------------------------------------------------
        Opcode::Range => range_begin(fiber, module, env, a, b, c),
        Opcode::RangeNext => range_next(fiber, module, env, effects, a, b, c),

        // --- dynamic typing -------------------------------------------------
        Opcode::Assert => {
            let v = fiber.regs.general(fp, a);
            let typ = fn_.types[b as u8 as usize].clone();
            if typ.is_interface() {
                // Interface-to-interface assertion; dynamic method sets of
                // native types are checked, plain values satisfy only the
                // empty interface.
                let ok = !v.is_nil() && value_implements(&v, &typ);
                fiber.ok = ok;
                if ok {
                    fiber.regs.set_general(fiber.fp, c, v);
                } else {
                    fiber.regs.set_general(fiber.fp, c, Value::Nil);
                }
            } else {
                let ok = v.has_type(&typ);
                fiber.ok = ok;
                if ok {
                    write_typed(fiber, &typ, c, v);
                } else {
                    write_typed(fiber, &typ, c, Value::zero(&typ));
                }
            }
            Flow::Next
        }

        // --- panics and printing --------------------------------------------
        Opcode::Panic => {
            let msg = fiber.regs.general(fp, a);
            raise(fiber, module, env, msg, PanicKind::User)
        }
        Opcode::Recover => {
            // Meaningful only when called directly by a deferred function
            // during unwinding: the parked frame below must be Panicked.
            let recovered = match fiber.frames.last_mut() {
                Some(frame) if frame.status == FrameStatus::Panicked => {
                    frame.status = FrameStatus::Recovered;
                    let p = fiber
                        .panics
                        .iter_mut()
                        .rev()
                        .find(|p| !p.recovered)
                        .expect("panicked frame without active panic");
                    p.recovered = true;
                    Some(p.msg.clone())
                }
                _ => None,
            };
            fiber
                .regs
                .set_general(fiber.fp, c, recovered.unwrap_or(Value::Nil));
            Flow::Next
        }
        Opcode::Print => {
            let v = if k {
                fn_.consts.general[a as u8 as usize].clone()
            } else {
                fiber.regs.general(fp, a)
            };
            env.print(&v);
            Flow::Next
        }
    }
}

/// After a native call returns, honor a pending `Env::exit`.
pub(crate) fn exit_check(fiber: &mut Fiber, module: &Module, env: &Env) -> Flow {
    match env.take_pending_exit() {
        Some(code) => raise(fiber, module, env, Value::Nil, PanicKind::Exit(code)),
        None => Flow::Next,
    }
}
