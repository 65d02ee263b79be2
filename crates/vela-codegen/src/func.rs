//! The function builder.
//!
//! Allocates registers with per-bank live counters and monotonic
//! high-water marks, binds variables per scope, pools constants with
//! deduplication, and resolves labels by back-patching 24-bit addresses
//! when the function is finished. Register scoping comes in two flavors:
//! `enter_scope`/`exit_scope` for lexical blocks (which also pop variable
//! bindings) and `enter_stack`/`exit_stack` for expression-level
//! temporaries that are released after one use.

use std::collections::HashMap;
use std::rc::Rc;

use vela_runtime::function::Function;
use vela_runtime::instruction::{encode_uint24, Instruction, Opcode};
use vela_runtime::native::NativeFunction;
use vela_runtime::types::{Bank, Type, TypeHandle};
use vela_runtime::value::Value;
use vela_syntax::ast::NodeId;

/// Where a variable lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarLoc {
    /// A plain register of some bank.
    Reg { bank: Bank, r: i8 },
    /// A shared cell in a general register (captured or address-taken
    /// variables); accessed through the negative-index convention.
    Cell { r: i8 },
    /// A variable captured from an enclosing function, accessed through
    /// the closure's capture vector.
    Capture { idx: i8, bank: Bank },
}

impl VarLoc {
    /// The operand that reads/writes this variable in bank-typed ops;
    /// captures have no direct operand and go through
    /// `GetCapture`/`SetCapture`.
    pub fn operand(&self) -> Option<i8> {
        match self {
            VarLoc::Reg { r, .. } => Some(*r),
            VarLoc::Cell { r } => Some(-*r),
            VarLoc::Capture { .. } => None,
        }
    }
}

pub struct FuncBuilder {
    pub fn_: Function,
    num_regs: [i8; 4],
    max_regs: [i8; 4],
    stack_shifts: Vec<[i8; 4]>,
    scopes: Vec<Vec<NodeId>>,
    vars: HashMap<NodeId, VarLoc>,
    /// Label addresses, 1-based; 0 = unset.
    labels: Vec<u32>,
    /// Pending jumps: (pc, label).
    gotos: Vec<(usize, u32)>,
}

impl FuncBuilder {
    pub fn new(fn_: Function) -> FuncBuilder {
        FuncBuilder {
            fn_,
            num_regs: [0; 4],
            max_regs: [0; 4],
            stack_shifts: Vec::new(),
            scopes: vec![Vec::new()],
            vars: HashMap::new(),
            labels: Vec::new(),
            gotos: Vec::new(),
        }
    }

    // === Register allocation ===

    pub fn new_register(&mut self, bank: Bank) -> i8 {
        let t = bank as usize;
        assert!(self.num_regs[t] < 127, "register overflow in {}", self.fn_.name);
        self.num_regs[t] += 1;
        if self.num_regs[t] > self.max_regs[t] {
            self.max_regs[t] = self.num_regs[t];
        }
        self.num_regs[t]
    }

    pub fn new_register_for(&mut self, typ: &TypeHandle) -> (Bank, i8) {
        let bank = typ.bank();
        (bank, self.new_register(bank))
    }

    /// The current per-bank live counts: the stack shift of a call
    /// staged here.
    pub fn stack_shift(&self) -> [i8; 4] {
        self.num_regs
    }

    /// Enters a lexical scope: variables bound inside it disappear on
    /// exit and their registers are reused.
    pub fn enter_scope(&mut self) {
        self.scopes.push(Vec::new());
        self.enter_stack();
    }

    pub fn exit_scope(&mut self) {
        for id in self.scopes.pop().expect("scope underflow") {
            self.vars.remove(&id);
        }
        self.exit_stack();
    }

    /// Enters a virtual stack: registers allocated until the matching
    /// `exit_stack` are released for reuse afterwards.
    pub fn enter_stack(&mut self) {
        self.stack_shifts.push(self.num_regs);
    }

    pub fn exit_stack(&mut self) {
        self.num_regs = self.stack_shifts.pop().expect("stack underflow");
    }

    // === Variable binding ===

    pub fn bind_var(&mut self, decl: NodeId, loc: VarLoc) {
        self.scopes.last_mut().expect("no scope").push(decl);
        self.vars.insert(decl, loc);
    }

    pub fn var_loc(&self, decl: NodeId) -> Option<VarLoc> {
        self.vars.get(&decl).copied()
    }

    // === Constant pools (capped at 256, int/float/string deduplicated) ===

    pub fn int_const(&mut self, v: i64) -> i8 {
        if let Some(i) = self.fn_.consts.ints.iter().position(|x| *x == v) {
            return i as u8 as i8;
        }
        let i = self.fn_.consts.ints.len();
        assert!(i < 256, "int constant pool overflow");
        self.fn_.consts.ints.push(v);
        i as u8 as i8
    }

    pub fn float_const(&mut self, v: f64) -> i8 {
        if let Some(i) = self
            .fn_
            .consts
            .floats
            .iter()
            .position(|x| x.to_bits() == v.to_bits())
        {
            return i as u8 as i8;
        }
        let i = self.fn_.consts.floats.len();
        assert!(i < 256, "float constant pool overflow");
        self.fn_.consts.floats.push(v);
        i as u8 as i8
    }

    pub fn string_const(&mut self, v: &str) -> i8 {
        if let Some(i) = self.fn_.consts.strings.iter().position(|x| &**x == v) {
            return i as u8 as i8;
        }
        let i = self.fn_.consts.strings.len();
        assert!(i < 256, "string constant pool overflow");
        self.fn_.consts.strings.push(Rc::from(v));
        i as u8 as i8
    }

    /// General constants are append-only: values may not be comparable.
    pub fn general_const(&mut self, v: Value) -> i8 {
        let i = self.fn_.consts.general.len();
        assert!(i < 256, "general constant pool overflow");
        self.fn_.consts.general.push(v);
        i as u8 as i8
    }

    // === Per-function tables ===

    pub fn add_type(&mut self, typ: &TypeHandle) -> i8 {
        if let Some(i) = self.fn_.types.iter().position(|t| Type::identical(t, typ)) {
            return i as u8 as i8;
        }
        let i = self.fn_.types.len();
        assert!(i < 256, "type table overflow");
        self.fn_.types.push(typ.clone());
        i as u8 as i8
    }

    pub fn add_function(&mut self, fn_id: u32) -> i8 {
        if let Some(i) = self.fn_.functions.iter().position(|f| *f == fn_id) {
            return i as u8 as i8;
        }
        let i = self.fn_.functions.len();
        assert!(i < 256, "function table overflow");
        self.fn_.functions.push(fn_id);
        i as u8 as i8
    }

    pub fn add_literal(&mut self, fn_id: u32) -> i8 {
        let i = self.fn_.literals.len();
        assert!(i < 256, "literal table overflow");
        self.fn_.literals.push(fn_id);
        i as u8 as i8
    }

    pub fn add_native(&mut self, nf: &Rc<NativeFunction>) -> i8 {
        if let Some(i) = self.fn_.natives.iter().position(|f| Rc::ptr_eq(f, nf)) {
            return i as u8 as i8;
        }
        let i = self.fn_.natives.len();
        assert!(i < 256, "native function table overflow");
        self.fn_.natives.push(nf.clone());
        i as u8 as i8
    }

    // === Emission ===

    pub fn emit(&mut self, inst: Instruction) -> usize {
        let pc = self.fn_.body.len();
        self.fn_.body.push(inst);
        pc
    }

    pub fn current_addr(&self) -> u32 {
        self.fn_.body.len() as u32
    }

    pub fn add_line(&mut self, line: u32) {
        if line > 0 {
            let pc = self.fn_.body.len() as u32;
            self.fn_.lines.entry(pc).or_insert(line);
        }
    }

    // === Labels ===

    pub fn new_label(&mut self) -> u32 {
        self.labels.push(0);
        self.labels.len() as u32
    }

    pub fn set_label_addr(&mut self, label: u32) {
        self.labels[label as usize - 1] = self.current_addr() + 1;
    }

    /// Emits a jump to a label, resolved at `end`.
    pub fn emit_goto(&mut self, label: u32) {
        let pc = self.emit(Instruction::new(Opcode::Goto, 0, 0, 0));
        self.gotos.push((pc, label));
    }

    /// Finishes the function: appends a trailing return if the body does
    /// not end with one, resolves every pending jump, and records the
    /// register high-water marks.
    pub fn end(mut self) -> Function {
        let needs_return = self
            .fn_
            .body
            .last()
            .map(|i| i.decode().0 != Opcode::Return)
            .unwrap_or(true);
        if needs_return {
            self.emit(Instruction::new(Opcode::Return, 0, 0, 0));
        }
        for (pc, label) in std::mem::take(&mut self.gotos) {
            let addr = self.labels[label as usize - 1];
            assert!(addr != 0, "label {} referenced but never set", label);
            let (a, b, c) = encode_uint24(addr - 1);
            self.fn_.body[pc] = Instruction::new(Opcode::Goto, a, b, c);
        }
        for t in 0..4 {
            self.fn_.reg_count[t] = self.max_regs[t] as u8;
        }
        self.fn_
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> FuncBuilder {
        FuncBuilder::new(Function::new("main", "f", Type::func(vec![], vec![], false)))
    }

    #[test]
    fn scope_exit_restores_register_counters() {
        let mut fb = builder();
        let r1 = fb.new_register(Bank::Int);
        assert_eq!(r1, 1);
        for _ in 0..3 {
            fb.enter_scope();
            let r2 = fb.new_register(Bank::Int);
            assert_eq!(r2, 2);
            fb.exit_scope();
        }
        // Counters restored, high-water monotonic.
        assert_eq!(fb.new_register(Bank::Int), 2);
        let f = fb.end();
        assert_eq!(f.reg_count[0], 2);
    }

    #[test]
    fn high_water_covers_every_addressed_register() {
        let mut fb = builder();
        fb.enter_stack();
        for _ in 0..5 {
            fb.new_register(Bank::General);
        }
        fb.exit_stack();
        fb.new_register(Bank::General);
        let f = fb.end();
        assert_eq!(f.reg_count[3], 5);
    }

    #[test]
    fn int_pool_deduplicates() {
        let mut fb = builder();
        let a = fb.int_const(42);
        let b = fb.int_const(42);
        let c = fb.int_const(43);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let f = fb.end();
        assert_eq!(f.consts.ints.len(), 2);
        // Deduplicated: no two entries are equal.
        for (i, x) in f.consts.ints.iter().enumerate() {
            for y in &f.consts.ints[i + 1..] {
                assert_ne!(x, y);
            }
        }
    }

    #[test]
    #[should_panic(expected = "int constant pool overflow")]
    fn const_pool_overflow_is_detected() {
        let mut fb = builder();
        for v in 0..=256i64 {
            fb.int_const(v);
        }
    }

    #[test]
    fn labels_backpatch_24_bit_addresses() {
        let mut fb = builder();
        let l = fb.new_label();
        fb.emit_goto(l);
        fb.emit(Instruction::new(Opcode::None, 0, 0, 0));
        fb.set_label_addr(l);
        fb.emit(Instruction::new(Opcode::Return, 0, 0, 0));
        let f = fb.end();
        let (a, b, c) = (f.body[0].a, f.body[0].b, f.body[0].c);
        assert_eq!(vela_runtime::instruction::decode_uint24(a, b, c), 2);
        // Every jump target lands inside the body.
        assert!((vela_runtime::instruction::decode_uint24(a, b, c) as usize) < f.body.len());
    }

    #[test]
    #[should_panic(expected = "referenced but never set")]
    fn unset_label_is_a_builder_bug() {
        let mut fb = builder();
        let l = fb.new_label();
        fb.emit_goto(l);
        let _ = fb.end();
    }

    #[test]
    fn register_index_reaches_extremes() {
        let mut fb = builder();
        for _ in 0..127 {
            fb.new_register(Bank::Int);
        }
        let f = fb.end();
        assert_eq!(f.reg_count[0], 127);
    }

    #[test]
    #[should_panic(expected = "register overflow")]
    fn register_128_overflows() {
        let mut fb = builder();
        for _ in 0..128 {
            fb.new_register(Bank::Int);
        }
    }

    #[test]
    fn trailing_return_is_appended() {
        let fb = builder();
        let f = fb.end();
        assert_eq!(f.body.len(), 1);
        assert_eq!(f.body[0].decode().0, Opcode::Return);
    }

    #[test]
    fn var_binding_follows_scopes() {
        let mut fb = builder();
        let r = fb.new_register(Bank::Float);
        fb.enter_scope();
        fb.bind_var(7, VarLoc::Reg { bank: Bank::Float, r });
        assert!(fb.var_loc(7).is_some());
        fb.exit_scope();
        assert!(fb.var_loc(7).is_none());
        let _ = fb.end();
    }
}
