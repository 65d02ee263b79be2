//! Fibers: one per goroutine.
//!
//! A fiber owns its register banks, call stack, deferred-call stack and
//! panic stack; the [`Env`](vela_runtime::Env) is shared. The frame
//! statuses drive the return/defer/panic interleaving: a synthetic frame
//! with status `Returned` or `Panicked` parks the interrupted function
//! while one of its deferred calls runs.

use std::rc::Rc;

use vela_runtime::chan::Channel;
use vela_runtime::value::{CellRef, SliceObj, Value};

use crate::registers::Registers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// A regular call in progress.
    Started,
    /// Replaced in place by a tail call; skipped when unwinding return
    /// values, still visible to stack traces.
    Tailed,
    /// Parked while its deferred calls run after a normal return.
    Returned,
    /// Parked while its deferred calls run during panic unwinding.
    Panicked,
    /// A deferred call recovered the active panic; the parked function
    /// returns normally once the deferred chain finishes.
    Recovered,
}

/// A parked caller (or parked returning/panicking function).
#[derive(Clone)]
pub struct CallFrame {
    pub fn_id: u32,
    pub cells: Vec<CellRef>,
    /// Frame pointers to restore.
    pub fp: [u32; 4],
    /// Program counter to resume at.
    pub pc: u32,
    /// Range-iterator base to restore.
    pub iter_base: usize,
    pub status: FrameStatus,
    pub variadics: i8,
}

/// Arguments of a deferred call, frozen at `Defer` time.
#[derive(Clone, Default)]
pub struct StagedArgs {
    pub int: Vec<i64>,
    pub float: Vec<f64>,
    pub string: Vec<Rc<str>>,
    pub general: Vec<Value>,
}

#[derive(Clone)]
pub struct DeferredCall {
    /// `frames.len()` of the deferring function at push time; the call
    /// runs when that function returns or panics.
    pub depth: usize,
    pub callable: Value,
    pub args: StagedArgs,
    pub variadics: i8,
}

/// Why a panic was raised; decides how it surfaces if unrecovered.
#[derive(Debug, Clone, PartialEq)]
pub enum PanicKind {
    User,
    Runtime,
    OutOfMemory,
    ContextCancelled,
    /// `Env::exit`: skips deferred calls and cannot be recovered.
    Exit(i32),
}

#[derive(Clone)]
pub struct PanicRecord {
    pub msg: Value,
    pub kind: PanicKind,
    pub recovered: bool,
    pub stack: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectDir {
    Send,
    Recv,
    Default,
}

#[derive(Clone, Copy)]
pub struct SelectCase {
    pub dir: SelectDir,
    /// Register staging the sent value / receiving the value.
    pub value_reg: i8,
    pub chan_reg: i8,
    /// pc of this case's `Case` instruction.
    pub pc: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    Ready,
    Running,
    Blocked,
    Dead,
}

/// Iterator state for `Range`/`RangeNext`. A `Range` pushes one of these
/// onto the fiber's iterator stack and stores its slot in an int
/// register; `RangeNext` advances it. Common collection kinds iterate
/// without dynamic dispatch beyond this enum.
pub enum RangeIter {
    Slice { s: SliceObj, i: usize },
    Str { s: Rc<str>, byte: usize },
    Map { entries: Vec<(Value, Value)>, i: usize },
    Chan(Rc<Channel>),
}

pub struct Fiber {
    pub id: u32,
    pub status: FiberStatus,
    pub regs: Registers,
    /// Current frame pointers.
    pub fp: [u32; 4],
    /// Current program counter.
    pub pc: u32,
    /// Running function (module id) and its closure cells.
    pub fn_id: u32,
    pub cells: Vec<CellRef>,
    /// Parked callers, innermost last.
    pub frames: Vec<CallFrame>,
    pub defers: Vec<DeferredCall>,
    pub panics: Vec<PanicRecord>,
    /// Select cases registered by `Case` ops, consumed by `Select`.
    pub select: Vec<SelectCase>,
    /// Range-iterator slots. Each function addresses slots
    /// `iter_base + depth`, where depth is the static nesting level of
    /// the range loop; slots are reused across loop entries.
    pub iters: Vec<Option<RangeIter>>,
    /// First iterator slot of the running function.
    pub iter_base: usize,
    /// The comma-ok flag (map index, receive, type assertion).
    pub ok: bool,
    /// Set when a parked sender's value was consumed by a receiver: the
    /// re-executed `Send` must complete instead of sending again.
    pub send_done: bool,
}

impl Fiber {
    pub fn new(id: u32, fn_id: u32) -> Fiber {
        Fiber {
            id,
            status: FiberStatus::Ready,
            regs: Registers::new(),
            fp: [0; 4],
            pc: 0,
            fn_id,
            cells: Vec::new(),
            frames: Vec::new(),
            defers: Vec::new(),
            panics: Vec::new(),
            select: Vec::new(),
            iters: Vec::new(),
            iter_base: 0,
            ok: false,
            send_done: false,
        }
    }

    /// Depth of the running function: its deferred calls are tagged with
    /// this value.
    #[inline]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Pops the deferred calls registered by the running function, in
    /// LIFO order.
    pub fn take_defers_at_depth(&mut self) -> Vec<DeferredCall> {
        let depth = self.depth();
        let mut out = Vec::new();
        while self
            .defers
            .last()
            .map(|d| d.depth == depth)
            .unwrap_or(false)
        {
            out.push(self.defers.pop().unwrap());
        }
        out
    }

    pub fn has_defers_at_depth(&self) -> bool {
        let depth = self.depth();
        self.defers
            .last()
            .map(|d| d.depth == depth)
            .unwrap_or(false)
    }

    pub fn pop_defer_at_depth(&mut self) -> Option<DeferredCall> {
        if self.has_defers_at_depth() {
            self.defers.pop()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defers_pop_in_lifo_order_per_depth() {
        let mut fiber = Fiber::new(0, 0);
        fiber.frames.push(CallFrame {
            fn_id: 0,
            cells: Vec::new(),
            fp: [0; 4],
            pc: 0,
            iter_base: 0,
            status: FrameStatus::Started,
            variadics: -1,
        });
        for i in 0..3 {
            fiber.defers.push(DeferredCall {
                depth: 1,
                callable: Value::Int(i),
                args: StagedArgs::default(),
                variadics: -1,
            });
        }
        fiber.defers.push(DeferredCall {
            depth: 0,
            callable: Value::Int(99),
            args: StagedArgs::default(),
            variadics: -1,
        });
        // The depth-0 defer belongs to an outer frame; it must stay.
        assert!(!fiber.has_defers_at_depth());
        fiber.defers.truncate(3);
        let taken = fiber.take_defers_at_depth();
        let order: Vec<i64> = taken.iter().map(|d| d.callable.as_int()).collect();
        assert_eq!(order, vec![2, 1, 0]);
    }
}
