//! The execution environment.
//!
//! One [`Env`] is shared by every goroutine of a run: it owns the global
//! variable cells, the advisory free-memory counter, the cancellation
//! context, the print hook and the exit hooks. Only the memory counter and
//! the exit state may be touched after the VM starts, and both sit behind
//! the env mutex; everything else is set up before `run` and read-only
//! afterwards.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;

use crate::value::{CellRef, Value};

/// Raised through the VM's panic machinery when the memory budget is
/// exhausted; recoverable by user code like any other panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("out of memory")]
pub struct OutOfMemory;

/// A cancellation context: an externally-settable flag plus an optional
/// deadline. Every blocking VM operation consults it.
#[derive(Clone, Default)]
pub struct Context {
    cancelled: Option<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never done.
    pub fn background() -> Context {
        Context::default()
    }

    /// Returns a context and a handle that cancels it.
    pub fn with_cancel() -> (Context, CancelHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        (
            Context {
                cancelled: Some(flag.clone()),
                deadline: None,
            },
            CancelHandle { flag },
        )
    }

    pub fn with_deadline(deadline: Instant) -> Context {
        Context {
            cancelled: None,
            deadline: Some(deadline),
        }
    }

    pub fn and_deadline(mut self, deadline: Instant) -> Context {
        self.deadline = Some(deadline);
        self
    }

    pub fn done(&self) -> bool {
        if let Some(flag) = &self.cancelled {
            if flag.load(Ordering::Acquire) {
                return true;
            }
        }
        if let Some(d) = self.deadline {
            if Instant::now() >= d {
                return true;
            }
        }
        false
    }

    /// Whether this context can ever fire. A plain background context is
    /// never polled by the VM.
    pub fn is_cancellable(&self) -> bool {
        self.cancelled.is_some() || self.deadline.is_some()
    }
}

#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

/// How a run terminated, beyond a plain return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    Exit(i32),
}

struct MemState {
    limited: bool,
    free: isize,
}

struct ExitState {
    exited: bool,
    /// Set by `Env::exit`; the VM polls it after native calls and unwinds.
    pending: Option<i32>,
    hooks: Vec<Box<dyn FnOnce() + Send>>,
}

pub type PrintFunc = Box<dyn Fn(&Value)>;

pub struct Env {
    globals: RefCell<Vec<CellRef>>,
    mem: Mutex<MemState>,
    exit: Mutex<ExitState>,
    ctx: Context,
    print: Option<PrintFunc>,
}

impl Env {
    pub fn new() -> Rc<Env> {
        Rc::new(Env {
            globals: RefCell::new(Vec::new()),
            mem: Mutex::new(MemState {
                limited: false,
                free: 0,
            }),
            exit: Mutex::new(ExitState {
                exited: false,
                pending: None,
                hooks: Vec::new(),
            }),
            ctx: Context::background(),
            print: None,
        })
    }

    pub fn with_options(ctx: Context, max_memory: Option<usize>, print: Option<PrintFunc>) -> Rc<Env> {
        Rc::new(Env {
            globals: RefCell::new(Vec::new()),
            mem: Mutex::new(MemState {
                limited: max_memory.is_some(),
                free: max_memory.map(|b| b as isize).unwrap_or(0),
            }),
            exit: Mutex::new(ExitState {
                exited: false,
                pending: None,
                hooks: Vec::new(),
            }),
            ctx,
            print,
        })
    }

    // --- globals ---

    pub fn set_globals(&self, globals: Vec<CellRef>) {
        *self.globals.borrow_mut() = globals;
    }

    pub fn global(&self, index: usize) -> CellRef {
        self.globals.borrow()[index].clone()
    }

    pub fn global_count(&self) -> usize {
        self.globals.borrow().len()
    }

    // --- memory accounting ---

    /// Charges `bytes` against the budget (or credits, if negative).
    /// Does nothing when no limit is set. On exhaustion the counter stays
    /// negative — the spec's invariant for inspecting the overshoot — and
    /// `OutOfMemory` is returned for the VM to raise as a panic.
    pub fn alloc(&self, bytes: isize) -> Result<(), OutOfMemory> {
        let mut mem = self.mem.lock();
        if !mem.limited {
            return Ok(());
        }
        if mem.free >= 0 {
            mem.free -= bytes;
        }
        if mem.free < 0 {
            return Err(OutOfMemory);
        }
        Ok(())
    }

    /// Returns `(free_bytes, limited)`. A negative value reports by how
    /// much the budget was overshot.
    pub fn free_memory(&self) -> (isize, bool) {
        let mem = self.mem.lock();
        (mem.free, mem.limited)
    }

    // --- context ---

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    // --- print hook ---

    pub fn print(&self, v: &Value) {
        match &self.print {
            Some(p) => p(v),
            None => print!("{}", format_value(v)),
        }
    }

    // --- exit ---

    /// Requests termination with the given exit code. The VM observes the
    /// request at its next native-call boundary and unwinds with a
    /// sentinel that skips deferred calls and cannot be recovered.
    pub fn exit(&self, code: i32) {
        let mut exit = self.exit.lock();
        if exit.pending.is_none() {
            exit.pending = Some(code);
        }
    }

    /// Takes the pending exit request, if any.
    pub fn take_pending_exit(&self) -> Option<i32> {
        self.exit.lock().pending.take()
    }

    /// Registers a hook to run after the VM terminates. If the run has
    /// already terminated, the hook runs immediately in its own thread.
    pub fn exit_func(&self, f: Box<dyn FnOnce() + Send>) {
        let mut exit = self.exit.lock();
        if exit.exited {
            std::thread::spawn(f);
        } else {
            exit.hooks.push(f);
        }
    }

    /// Marks the run terminated and launches every registered hook, each
    /// in its own thread.
    pub fn terminated(&self) {
        let hooks = {
            let mut exit = self.exit.lock();
            exit.exited = true;
            std::mem::take(&mut exit.hooks)
        };
        for hook in hooks {
            std::thread::spawn(hook);
        }
    }
}

/// Default rendering for the `print`/`println` builtins.
pub fn format_value(v: &Value) -> String {
    match v {
        Value::Nil => "<nil>".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => {
            if f.fract() == 0.0 && f.is_finite() {
                format!("{:+e}", f)
            } else {
                format!("{}", f)
            }
        }
        Value::Str(s) => s.to_string(),
        Value::Slice(s) => format!("[{}/{}]", s.len, s.cap),
        Value::Array(a) => format!("[{}]", a.data.borrow().len()),
        Value::Map(m) => format!("map[{}]", m.data.borrow().len()),
        Value::Chan(_) => "chan".to_string(),
        Value::Func(_) => "func".to_string(),
        Value::Struct(s) => format!("{}{{...}}", s.typ),
        Value::Cell(c) => format!("&{}", format_value(&c.borrow())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_memory_never_fails() {
        let env = Env::new();
        assert!(env.alloc(1 << 40).is_ok());
        assert_eq!(env.free_memory(), (0, false));
    }

    #[test]
    fn memory_budget_goes_negative_once() {
        let env = Env::with_options(Context::background(), Some(100), None);
        assert!(env.alloc(60).is_ok());
        assert!(env.alloc(60).is_err());
        let (free, limited) = env.free_memory();
        assert!(limited);
        assert_eq!(free, -20);
        // After exhaustion the counter is not charged further.
        assert!(env.alloc(1000).is_err());
        assert_eq!(env.free_memory().0, -20);
    }

    #[test]
    fn context_cancel() {
        let (ctx, cancel) = Context::with_cancel();
        assert!(!ctx.done());
        cancel.cancel();
        assert!(ctx.done());
    }

    #[test]
    fn exit_hooks_run_after_termination() {
        use std::sync::mpsc;
        let env = Env::new();
        let (tx, rx) = mpsc::channel();
        env.exit_func(Box::new(move || tx.send(1).unwrap()));
        env.terminated();
        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap(), 1);
    }
}
