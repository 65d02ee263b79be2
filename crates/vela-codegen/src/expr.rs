//! Expression lowering.
//!
//! Every expression is emitted toward a destination register (register 0
//! discards the result but still evaluates side effects). Operand-B
//! positions prefer the constant form: when the value is a small
//! immediate or a pooled constant the negated opcode is emitted instead
//! of materializing a register — every branch below decides
//! "constant-operand form?" before emitting.

use vela_analysis::{assignment::CommaOk, Builtin, Entity, ExprInfo};
use vela_runtime::function::Function;
use vela_runtime::instruction::{encode_field_index, Condition, Instruction, Opcode, NO_VARIADIC};
use vela_runtime::types::{Bank, BasicKind, FuncType, Type, TypeHandle};
use vela_runtime::value::Value;
use vela_syntax::ast::{CallExpr, Expr, ExprKind, FuncLit, NodeId};
use vela_syntax::op::{BinaryOp, UnaryOp};

use crate::func::VarLoc;
use crate::{Emitter, LoopCtx};

use vela_analysis::constant::ConstValue;

impl Emitter<'_, '_> {
    pub(crate) fn info(&self, e: &Expr) -> &ExprInfo {
        self.ctx.checked.info.expr(e.id)
    }

    /// The type an expression takes in its context: its checked type, or
    /// the default type of an untyped constant.
    pub(crate) fn expr_type(&self, e: &Expr) -> TypeHandle {
        let info = self.info(e);
        match &info.typ {
            Some(t) => t.clone(),
            None => match &info.value {
                Some(v) => v.kind().default_type(),
                None => Type::empty_interface(),
            },
        }
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Emits `e` into `dst` (a register of `typ`'s bank; 0 discards).
    pub(crate) fn emit_expr_to(&mut self, e: &Expr, typ: &TypeHandle, dst: i8) {
        self.fb.add_line(e.pos.line);
        let info = self.info(e).clone();

        // Constants load directly.
        if let Some(v) = &info.value {
            self.emit_const_to(v, typ, dst);
            return;
        }

        match &e.kind {
            ExprKind::Ident(id) => self.emit_ident_to(id.id, typ, dst),
            ExprKind::Paren(inner) => self.emit_expr_to(inner, typ, dst),
            ExprKind::Unary(op, operand) => self.emit_unary(e, *op, operand, typ, dst),
            ExprKind::Binary(op, l, r) => self.emit_binary(e, *op, l, r, typ, dst),
            ExprKind::Call(call) => self.emit_call(e, call, typ, dst),
            ExprKind::Index(base, index) => self.emit_index(base, index, typ, dst),
            ExprKind::Slicing(s) => self.emit_slicing(s, typ, dst),
            ExprKind::Selector(base, field) => self.emit_selector(e, base, field, typ, dst),
            ExprKind::TypeAssert(base, _) => {
                // Non-comma-ok form: a failed assertion panics.
                self.emit_type_assert(e, base, typ, dst, true);
            }
            ExprKind::Receive(ch) => {
                let ct = self.expr_type(ch);
                self.fb.enter_stack();
                let creg = self.emit_to_temp(ch, &ct);
                self.fb
                    .emit(Instruction::new(Opcode::Receive, creg, 0, dst));
                self.fb.exit_stack();
            }
            ExprKind::Composite(lit) => self.emit_composite(e, lit, typ, dst),
            ExprKind::FuncLit(fl) => self.emit_func_lit(fl, dst),
            ExprKind::TypeLit(_) => panic!("type used as value reached the emitter"),
            ExprKind::IntLit(_)
            | ExprKind::FloatLit(_)
            | ExprKind::StringLit(_)
            | ExprKind::RuneLit(_) => unreachable!("literal constants handled above"),
        }

        // The destination bank is decided by the context type; when the
        // expression's own type boxes differently (interface target), the
        // context emitted a Typify through emit_boxed instead.
    }

    /// Emits `e` into a fresh temporary of `typ`'s bank.
    pub(crate) fn emit_to_temp(&mut self, e: &Expr, typ: &TypeHandle) -> i8 {
        let bank = typ.bank();
        let r = self.fb.new_register(bank);
        self.emit_expr_to(e, typ, r);
        r
    }

    /// Emits `e` as an operand-B value: `(operand, k)`. Small integers
    /// and pooled constants use the constant form; anything else lands in
    /// a temporary register of the current stack.
    pub(crate) fn emit_operand(&mut self, e: &Expr, typ: &TypeHandle) -> (i8, bool) {
        let info = self.info(e).clone();
        if let Some(v) = &info.value {
            match Type::underlying(typ).basic_kind() {
                Some(k) if k.is_integer() || k == BasicKind::Bool => {
                    let val = v.to_i64().unwrap_or(0);
                    if (-128..=127).contains(&val) {
                        return (val as i8, true);
                    }
                    let r = self.fb.new_register(Bank::Int);
                    self.emit_const_to(v, typ, r);
                    return (r, false);
                }
                Some(k) if k.is_float() => {
                    return (self.fb.float_const(v.to_f64()), true);
                }
                Some(BasicKind::String) => {
                    if let ConstValue::Str(s) = v {
                        return (self.fb.string_const(s), true);
                    }
                }
                _ => {
                    let boxed = v.to_value(typ);
                    return (self.fb.general_const(boxed), true);
                }
            }
        }
        (self.emit_to_temp(e, typ), false)
    }

    /// Loads a constant into a destination register of `typ`'s bank.
    pub(crate) fn emit_const_to(&mut self, v: &ConstValue, typ: &TypeHandle, dst: i8) {
        match Type::underlying(typ).basic_kind() {
            Some(k) if k.is_float() => {
                let idx = self.fb.float_const(v.to_f64());
                self.fb
                    .emit(Instruction::new(Opcode::LoadNumber, 1, idx, dst));
            }
            Some(BasicKind::String) => {
                let s = match v {
                    ConstValue::Str(s) => s.clone(),
                    _ => String::new(),
                };
                let idx = self.fb.string_const(&s);
                self.fb
                    .emit(Instruction::with_k(Opcode::Move, true, Bank::String as i8, idx, dst));
            }
            Some(_) => {
                let val = v.to_i64().unwrap_or(0);
                if (-128..=127).contains(&val) {
                    self.fb.emit(Instruction::with_k(
                        Opcode::Move,
                        true,
                        Bank::Int as i8,
                        val as i8,
                        dst,
                    ));
                } else {
                    let idx = self.fb.int_const(val);
                    self.fb
                        .emit(Instruction::new(Opcode::LoadNumber, 0, idx, dst));
                }
            }
            None => {
                // Interface destination: the constant boxes at its value.
                let idx = self.fb.general_const(v.to_value(typ));
                self.fb.emit(Instruction::with_k(
                    Opcode::Move,
                    true,
                    Bank::General as i8,
                    idx,
                    dst,
                ));
            }
        }
    }

    /// Emits a value of type `src` into a general-bank destination,
    /// boxing through `Typify` when the source lives in another bank.
    pub(crate) fn emit_boxed(&mut self, e: &Expr, src: &TypeHandle, dst: i8) {
        if src.bank() == Bank::General {
            self.emit_expr_to(e, src, dst);
            return;
        }
        self.fb.enter_stack();
        let info = self.info(e).clone();
        let t_idx = self.fb.add_type(src);
        if let Some(v) = &info.value {
            let (op, k) = self.const_operand(v, src);
            self.fb
                .emit(Instruction::with_k(Opcode::Typify, k, t_idx, op, dst));
        } else {
            let r = self.emit_to_temp(e, src);
            self.fb
                .emit(Instruction::new(Opcode::Typify, t_idx, r, dst));
        }
        self.fb.exit_stack();
    }

    fn const_operand(&mut self, v: &ConstValue, typ: &TypeHandle) -> (i8, bool) {
        match Type::underlying(typ).basic_kind() {
            Some(k) if k.is_float() => (self.fb.float_const(v.to_f64()), true),
            Some(BasicKind::String) => match v {
                ConstValue::Str(s) => (self.fb.string_const(s), true),
                _ => (self.fb.string_const(""), true),
            },
            Some(_) => {
                let val = v.to_i64().unwrap_or(0);
                if (-128..=127).contains(&val) {
                    (val as i8, true)
                } else {
                    let r = self.fb.new_register(Bank::Int);
                    self.emit_const_to(v, typ, r);
                    (r, false)
                }
            }
            None => (self.fb.general_const(v.to_value(typ)), true),
        }
    }

    /// Emits a value for an assignment into `dst_typ`: boxes into the
    /// general bank when the destination is an interface but the source
    /// is not.
    pub(crate) fn emit_assignable(&mut self, e: &Expr, dst_typ: &TypeHandle, dst: i8) {
        let src_t = self.expr_type(e);
        let info = self.info(e).clone();
        if dst_typ.bank() == Bank::General && src_t.bank() != Bank::General && !info.is_nil() {
            self.emit_boxed(e, &src_t, dst);
        } else {
            self.emit_expr_to(e, dst_typ, dst);
        }
    }

    // =========================================================================
    // Identifiers
    // =========================================================================

    fn emit_ident_to(&mut self, id: NodeId, typ: &TypeHandle, dst: i8) {
        let entity = self.entity(id).clone();
        match entity {
            Entity::Local { decl } => {
                let loc = self
                    .fb
                    .var_loc(decl)
                    .expect("local referenced before binding");
                match loc {
                    VarLoc::Reg { bank, r } => {
                        self.fb
                            .emit(Instruction::new(Opcode::Move, bank as i8, r, dst));
                    }
                    VarLoc::Cell { r } => {
                        let bank = typ.bank();
                        self.fb
                            .emit(Instruction::new(Opcode::Move, bank as i8, -r, dst));
                    }
                    VarLoc::Capture { idx, bank } => {
                        self.fb
                            .emit(Instruction::new(Opcode::GetCapture, idx, bank as i8, dst));
                    }
                }
            }
            Entity::Global { index } => self.emit_get_var(index, dst),
            Entity::Func { name } => {
                let fn_id = self.ctx.fn_ids[&name];
                let idx = self.fb.add_function(fn_id);
                self.fb
                    .emit(Instruction::new(Opcode::GetFunc, 0, idx, dst));
            }
            Entity::NativeFunc(nf) => {
                let idx = self.fb.add_native(&nf);
                self.fb
                    .emit(Instruction::new(Opcode::GetFunc, 1, idx, dst));
            }
            Entity::Nil => {
                let idx = self.fb.general_const(Value::Nil);
                self.fb.emit(Instruction::with_k(
                    Opcode::Move,
                    true,
                    Bank::General as i8,
                    idx,
                    dst,
                ));
            }
            Entity::Const { .. } => unreachable!("constants are loaded by emit_expr_to"),
            Entity::Builtin(_) | Entity::TypeName(_) | Entity::Package { .. } => {
                panic!("non-value identifier reached the emitter")
            }
        }
        let _ = typ;
    }

    /// The assignment target of an identifier, for stores.
    pub(crate) fn store_ident(&mut self, id: NodeId, typ: &TypeHandle, src: i8, k: bool) {
        let entity = self.entity(id).clone();
        match entity {
            Entity::Local { decl } => {
                let loc = self.fb.var_loc(decl).expect("local without binding");
                match loc {
                    VarLoc::Reg { bank, r } => {
                        self.fb
                            .emit(Instruction::with_k(Opcode::Move, k, bank as i8, src, r));
                    }
                    VarLoc::Cell { r } => {
                        let bank = typ.bank();
                        self.fb
                            .emit(Instruction::with_k(Opcode::Move, k, bank as i8, src, -r));
                    }
                    VarLoc::Capture { idx, bank } => {
                        // SetCapture has no constant form; materialize.
                        let s = if k {
                            let tmp = self.fb.new_register(bank);
                            self.fb
                                .emit(Instruction::with_k(Opcode::Move, true, bank as i8, src, tmp));
                            tmp
                        } else {
                            src
                        };
                        self.fb
                            .emit(Instruction::new(Opcode::SetCapture, s, idx, bank as i8));
                    }
                }
            }
            Entity::Global { index } => self.emit_set_var(index, src, k),
            _ => panic!("store target is not a variable"),
        }
    }

    // =========================================================================
    // Unary and binary operators
    // =========================================================================

    fn emit_unary(&mut self, e: &Expr, op: UnaryOp, operand: &Expr, typ: &TypeHandle, dst: i8) {
        match op {
            UnaryOp::Pos => self.emit_expr_to(operand, typ, dst),
            UnaryOp::Neg => {
                self.fb.enter_stack();
                let r = self.emit_to_temp(operand, typ);
                match Type::underlying(typ).basic_kind() {
                    Some(k) if k.is_float() => {
                        let zero = self.fb.float_const(0.0);
                        self.fb.emit(Instruction::with_k(
                            Opcode::SubInvFloat,
                            true,
                            r,
                            zero,
                            dst,
                        ));
                    }
                    _ => {
                        self.fb
                            .emit(Instruction::with_k(Opcode::SubInvInt, true, r, 0, dst));
                    }
                }
                self.fb.exit_stack();
            }
            UnaryOp::Not => {
                self.fb.enter_stack();
                let r = self.emit_to_temp(operand, typ);
                self.fb
                    .emit(Instruction::with_k(Opcode::Xor, true, r, 1, dst));
                self.fb.exit_stack();
            }
            UnaryOp::BitNot => {
                self.fb.enter_stack();
                let r = self.emit_to_temp(operand, typ);
                self.fb
                    .emit(Instruction::with_k(Opcode::Xor, true, r, -1, dst));
                self.fb.exit_stack();
            }
            UnaryOp::Deref => {
                self.fb.enter_stack();
                let ptr_t = self.expr_type(operand);
                let r = self.emit_to_temp(operand, &ptr_t);
                self.fb
                    .emit(Instruction::new(Opcode::PtrGet, r, typ.bank() as i8, dst));
                self.fb.exit_stack();
            }
            UnaryOp::Addr => self.emit_addr(e, operand, dst),
        }
    }

    fn emit_addr(&mut self, _e: &Expr, operand: &Expr, dst: i8) {
        match &operand.kind {
            ExprKind::Ident(id) => {
                match self.entity(id.id).clone() {
                    Entity::Local { decl } => {
                        match self.fb.var_loc(decl).expect("local without binding") {
                            VarLoc::Cell { r } => {
                                // The cell is the pointer.
                                self.fb.emit(Instruction::new(
                                    Opcode::Move,
                                    Bank::General as i8,
                                    r,
                                    dst,
                                ));
                            }
                            _ => panic!("address-taken local was not celled by the checker"),
                        }
                    }
                    _ => panic!("unsupported address-of target"),
                }
            }
            ExprKind::Composite(_) => {
                // &T{...}: allocate a cell and fill it.
                let vt = self.expr_type(operand);
                let t_idx = self.fb.add_type(&vt);
                self.fb.emit(Instruction::new(Opcode::New, 0, t_idx, dst));
                self.fb.enter_stack();
                let tmp = self.emit_to_temp(operand, &vt);
                self.fb.emit(Instruction::new(
                    Opcode::PtrSet,
                    tmp,
                    vt.bank() as i8,
                    dst,
                ));
                self.fb.exit_stack();
            }
            _ => panic!("unsupported address-of target"),
        }
    }

    fn emit_binary(
        &mut self,
        e: &Expr,
        op: BinaryOp,
        l: &Expr,
        r: &Expr,
        typ: &TypeHandle,
        dst: i8,
    ) {
        if op.is_comparison() {
            self.emit_bool_from_condition(e, dst);
            return;
        }
        if op.is_logical() {
            self.emit_logical(op, l, r, dst);
            return;
        }
        let operand_t = self.expr_type(l);
        let operand_t = if self.info(l).value.is_some() && self.info(l).typ.is_none() {
            // Untyped constant on the left: the right operand decides.
            self.expr_type(r)
        } else {
            operand_t
        };
        let kind = Type::underlying(&operand_t)
            .basic_kind()
            .expect("arithmetic on non-basic type");

        // String concatenation.
        if kind == BasicKind::String {
            self.fb.enter_stack();
            let a = self.emit_to_temp(l, &operand_t);
            let (b, k) = self.emit_operand(r, &operand_t);
            self.fb
                .emit(Instruction::with_k(Opcode::Concat, k, a, b, dst));
            self.fb.exit_stack();
            return;
        }

        let opcode = if kind.is_float() {
            match op {
                BinaryOp::Add => Opcode::AddFloat,
                BinaryOp::Sub => Opcode::SubFloat,
                BinaryOp::Mul => Opcode::MulFloat,
                BinaryOp::Div => Opcode::DivFloat,
                _ => panic!("operator {} on float", op),
            }
        } else {
            match op {
                BinaryOp::Add => Opcode::AddInt,
                BinaryOp::Sub => Opcode::SubInt,
                BinaryOp::Mul => Opcode::MulInt,
                BinaryOp::Div => Opcode::DivInt,
                BinaryOp::Rem => Opcode::RemInt,
                BinaryOp::BitAnd => Opcode::And,
                BinaryOp::AndNot => Opcode::AndNot,
                BinaryOp::BitOr => Opcode::Or,
                BinaryOp::BitXor => Opcode::Xor,
                BinaryOp::Shl => Opcode::Shl,
                BinaryOp::Shr => {
                    if kind.is_unsigned() {
                        Opcode::ShrU
                    } else {
                        Opcode::Shr
                    }
                }
                _ => panic!("unexpected operator {}", op),
            }
        };

        self.fb.enter_stack();
        // A constant left operand with SubInv folds into one instruction.
        let linfo = self.info(l).clone();
        if matches!(op, BinaryOp::Sub) && linfo.value.is_some() && !kind.is_float() {
            let lv = linfo.value.as_ref().unwrap().to_i64().unwrap_or(0);
            if (-128..=127).contains(&lv) {
                let b = self.emit_to_temp(r, &operand_t);
                self.fb.emit(Instruction::with_k(
                    Opcode::SubInvInt,
                    true,
                    b,
                    lv as i8,
                    dst,
                ));
                self.fb.exit_stack();
                return;
            }
        }
        let a = self.emit_to_temp(l, &operand_t);
        let (b, k) = self.emit_operand(r, &operand_t);
        self.fb.emit(Instruction::with_k(opcode, k, a, b, dst));
        self.fb.exit_stack();

        // Narrow integer results wrap at their width.
        if kind.is_integer() && kind.bits() < 64 {
            let t_idx = self.fb.add_type(typ);
            let conv = if kind.is_unsigned() {
                Opcode::ConvertUint
            } else {
                Opcode::ConvertInt
            };
            self.fb.emit(Instruction::new(conv, dst, t_idx, dst));
        }
    }

    fn emit_logical(&mut self, op: BinaryOp, l: &Expr, r: &Expr, dst: i8) {
        // Short-circuit: evaluate the left into dst; the right runs only
        // when the left does not already decide. The condition holding
        // skips the jump to the end, so it selects "keep evaluating".
        let bool_t = Type::basic(BasicKind::Bool);
        let end = self.fb.new_label();
        self.emit_expr_to(l, &bool_t, dst);
        let cond = if op == BinaryOp::LogicalAnd {
            // true && x continues with x; false short-circuits.
            Condition::NotEqual
        } else {
            // false || x continues with x; true short-circuits.
            Condition::Equal
        };
        self.fb
            .emit(Instruction::with_k(Opcode::IfInt, true, dst, 0, cond as i8));
        self.fb.emit_goto(end);
        self.emit_expr_to(r, &bool_t, dst);
        self.fb.set_label_addr(end);
    }

    /// Lowers a boolean-valued condition expression through the If
    /// family: dst = 1 when the condition holds.
    pub(crate) fn emit_bool_from_condition(&mut self, e: &Expr, dst: i8) {
        let set_false = self.fb.new_label();
        let end = self.fb.new_label();
        self.emit_condition(e);
        self.fb.emit_goto(set_false);
        self.fb.emit(Instruction::with_k(
            Opcode::Move,
            true,
            Bank::Int as i8,
            1,
            dst,
        ));
        self.fb.emit_goto(end);
        self.fb.set_label_addr(set_false);
        self.fb.emit(Instruction::with_k(
            Opcode::Move,
            true,
            Bank::Int as i8,
            0,
            dst,
        ));
        self.fb.set_label_addr(end);
    }

    /// Emits a condition ending in one If-family instruction: the next
    /// instruction (normally a jump to the false branch) is skipped iff
    /// the condition holds.
    pub(crate) fn emit_condition(&mut self, e: &Expr) {
        match &e.kind {
            ExprKind::Paren(inner) => self.emit_condition(inner),
            ExprKind::Unary(UnaryOp::Not, inner) => {
                // Evaluate and compare against false.
                self.fb.enter_stack();
                let bool_t = Type::basic(BasicKind::Bool);
                let r = self.emit_to_temp(inner, &bool_t);
                self.fb.emit(Instruction::with_k(
                    Opcode::IfInt,
                    true,
                    r,
                    0,
                    Condition::Equal as i8,
                ));
                self.fb.exit_stack();
            }
            ExprKind::Binary(op, l, r) if op.is_comparison() => {
                self.emit_comparison_condition(*op, l, r)
            }
            _ => {
                // A plain boolean value: holds when non-zero.
                self.fb.enter_stack();
                let bool_t = Type::basic(BasicKind::Bool);
                let r = self.emit_to_temp(e, &bool_t);
                self.fb.emit(Instruction::with_k(
                    Opcode::IfInt,
                    true,
                    r,
                    0,
                    Condition::NotEqual as i8,
                ));
                self.fb.exit_stack();
            }
        }
    }

    fn emit_comparison_condition(&mut self, op: BinaryOp, l: &Expr, r: &Expr) {
        let li = self.info(l).clone();
        let ri = self.info(r).clone();

        // x == nil / x != nil.
        if li.is_nil() || ri.is_nil() {
            let value = if li.is_nil() { r } else { l };
            let vt = self.expr_type(value);
            self.fb.enter_stack();
            let reg = self.emit_to_temp(value, &vt);
            let cond = if op == BinaryOp::Eq {
                Condition::Nil
            } else {
                Condition::NotNil
            };
            self.fb
                .emit(Instruction::new(Opcode::If, reg, cond as i8, 0));
            self.fb.exit_stack();
            return;
        }

        // len(s) <op> constant lowers to the *Len string conditions.
        if let Some((subject, n)) = self.len_comparison(l, r) {
            let cond = match op {
                BinaryOp::Eq => Condition::EqualLen,
                BinaryOp::Ne => Condition::NotEqualLen,
                BinaryOp::Lt => Condition::LessLen,
                BinaryOp::Le => Condition::LessOrEqualLen,
                BinaryOp::Gt => Condition::GreaterLen,
                BinaryOp::Ge => Condition::GreaterOrEqualLen,
                _ => unreachable!(),
            };
            let str_t = Type::basic(BasicKind::String);
            self.fb.enter_stack();
            let reg = self.emit_to_temp(subject, &str_t);
            self.fb.emit(Instruction::with_k(
                Opcode::IfString,
                true,
                reg,
                n,
                cond as i8,
            ));
            self.fb.exit_stack();
            return;
        }

        let cond = match op {
            BinaryOp::Eq => Condition::Equal,
            BinaryOp::Ne => Condition::NotEqual,
            BinaryOp::Lt => Condition::Less,
            BinaryOp::Le => Condition::LessOrEqual,
            BinaryOp::Gt => Condition::Greater,
            BinaryOp::Ge => Condition::GreaterOrEqual,
            _ => unreachable!(),
        };
        let t = if li.typ.is_some() {
            self.expr_type(l)
        } else {
            self.expr_type(r)
        };
        let under = Type::underlying(&t);
        self.fb.enter_stack();
        match under.basic_kind() {
            Some(k) if k.is_float() => {
                let a = self.emit_to_temp(l, &t);
                let (b, kk) = self.emit_operand(r, &t);
                self.fb
                    .emit(Instruction::with_k(Opcode::IfFloat, kk, a, b, cond as i8));
            }
            Some(BasicKind::String) => {
                let a = self.emit_to_temp(l, &t);
                let (b, kk) = self.emit_operand(r, &t);
                self.fb
                    .emit(Instruction::with_k(Opcode::IfString, kk, a, b, cond as i8));
            }
            Some(k) if k.is_unsigned() && op.is_ordering() => {
                let a = self.emit_to_temp(l, &t);
                let (b, kk) = self.emit_operand(r, &t);
                self.fb
                    .emit(Instruction::with_k(Opcode::IfUint, kk, a, b, cond as i8));
            }
            Some(_) => {
                // Signed integers and bools; unsigned ==/!= also lands
                // here (no precision loss for equality).
                let a = self.emit_to_temp(l, &t);
                let (b, kk) = self.emit_operand(r, &t);
                self.fb
                    .emit(Instruction::with_k(Opcode::IfInt, kk, a, b, cond as i8));
            }
            None => {
                // Comparisons on non-basic operands reduce to the nil
                // forms (handled above) or to basic-kinded dynamic
                // values; anything else was rejected by the checker.
                panic!("comparison on non-basic types reached the emitter");
            }
        }
        self.fb.exit_stack();
    }

    /// Matches `len(stringExpr) <op> smallConst`.
    fn len_comparison<'e>(&self, l: &'e Expr, r: &'e Expr) -> Option<(&'e Expr, i8)> {
        let (call, konst) = if self.info(r).value.is_some() {
            (l, r)
        } else {
            return None;
        };
        let n = self.info(konst).value.as_ref()?.to_i64()?;
        if !(-128..=127).contains(&n) {
            return None;
        }
        match &call.kind {
            ExprKind::Call(c) => {
                let is_len = matches!(
                    self.ctx.checked.info.uses.get(&callee_id(&c.fun)),
                    Some(Entity::Builtin(Builtin::Len))
                );
                if is_len && c.args.len() == 1 {
                    let arg = &c.args[0];
                    let at = self.expr_type(arg);
                    if Type::underlying(&at).basic_kind() == Some(BasicKind::String) {
                        return Some((arg, n as i8));
                    }
                }
                None
            }
            _ => None,
        }
    }

    // =========================================================================
    // Indexing, slicing, selectors
    // =========================================================================

    fn emit_index(&mut self, base: &Expr, index: &Expr, typ: &TypeHandle, dst: i8) {
        let bt = self.expr_type(base);
        let under = Type::underlying(&bt);
        self.fb.enter_stack();
        match &*under {
            Type::Map(key_t, _) => {
                let m = self.emit_to_temp(base, &bt);
                let key_t = key_t.clone();
                let (k_op, kk) = self.emit_operand(index, &key_t);
                self.fb
                    .emit(Instruction::with_k(Opcode::MapIndex, kk, m, k_op, dst));
            }
            Type::Basic(BasicKind::String) => {
                let s = self.emit_to_temp(base, &bt);
                let int_t = Type::basic(BasicKind::Int);
                let (i_op, kk) = self.emit_operand(index, &int_t);
                self.fb
                    .emit(Instruction::with_k(Opcode::StringIndex, kk, s, i_op, dst));
            }
            _ => {
                let s = self.emit_to_temp(base, &bt);
                let int_t = Type::basic(BasicKind::Int);
                let (i_op, kk) = self.emit_operand(index, &int_t);
                self.fb
                    .emit(Instruction::with_k(Opcode::Index, kk, s, i_op, dst));
            }
        }
        self.fb.exit_stack();
        let _ = typ;
    }

    fn emit_slicing(&mut self, s: &vela_syntax::ast::SlicingExpr, typ: &TypeHandle, dst: i8) {
        let bt = self.expr_type(&s.expr);
        let under = Type::underlying(&bt);
        let src_kind: i8 = match &*under {
            Type::Basic(BasicKind::String) => 2,
            Type::Array(_, _) => 1,
            _ => 0,
        };
        self.fb.enter_stack();
        let base = self.emit_to_temp(&s.expr, &bt);
        let int_t = Type::basic(BasicKind::Int);
        let mut flags: i8 = 0;
        let (low, low_k) = match &s.low {
            Some(low) => self.emit_operand(low, &int_t),
            None => (0, true),
        };
        if low_k {
            flags |= 1;
        }
        let (high, high_k) = match &s.high {
            Some(high) => {
                let (h, hk) = self.emit_operand(high, &int_t);
                if hk {
                    flags |= 2;
                }
                (h, hk)
            }
            None => {
                flags |= 4; // high = len
                (0, false)
            }
        };
        let _ = high_k;
        self.fb
            .emit(Instruction::new(Opcode::Slice, base, src_kind, dst));
        self.fb.emit(Instruction::operands(low, high, flags));
        self.fb.exit_stack();
        let _ = typ;
    }

    fn emit_selector(
        &mut self,
        e: &Expr,
        base: &Expr,
        field: &vela_syntax::ast::Ident,
        typ: &TypeHandle,
        dst: i8,
    ) {
        // Package selector: the checker resolved an entity for this node.
        if self.info(base).is_package() {
            let entity = self.entity(e.id).clone();
            match entity {
                Entity::NativeFunc(nf) => {
                    let idx = self.fb.add_native(&nf);
                    self.fb
                        .emit(Instruction::new(Opcode::GetFunc, 1, idx, dst));
                }
                Entity::Global { index } => self.emit_get_var(index, dst),
                Entity::Const { .. } => unreachable!("constant selector folds earlier"),
                _ => panic!("unsupported package member in expression"),
            }
            return;
        }

        let bt = self.expr_type(base);
        // Bound method value.
        if bt.method(&field.name).is_some() {
            self.fb.enter_stack();
            let recv = self.emit_to_temp(base, &bt);
            let name_idx = self.fb.string_const(&field.name);
            self.fb
                .emit(Instruction::new(Opcode::MethodValue, recv, name_idx, dst));
            self.fb.exit_stack();
            return;
        }

        // Struct field access (with pointer auto-deref at runtime).
        let path = self.field_path(&bt, &field.name);
        let path_const = self.fb.int_const(encode_field_index(&path));
        self.fb.enter_stack();
        let b = self.emit_to_temp(base, &bt);
        self.fb
            .emit(Instruction::with_k(Opcode::Field, true, b, path_const, dst));
        self.fb.exit_stack();
        let _ = typ;
    }

    pub(crate) fn field_path(&self, typ: &TypeHandle, name: &str) -> Vec<usize> {
        match typ.field_index(name) {
            Some((i, _)) => vec![i],
            None => panic!("unknown field {} on {}", name, typ),
        }
    }

    // =========================================================================
    // Type assertions
    // =========================================================================

    /// Emits a type assertion. With `panic_on_failure`, a failed
    /// assertion raises; the comma-ok forms read the ok flag instead.
    pub(crate) fn emit_type_assert(
        &mut self,
        e: &Expr,
        base: &Expr,
        typ: &TypeHandle,
        dst: i8,
        panic_on_failure: bool,
    ) {
        self.fb.enter_stack();
        let bt = self.expr_type(base);
        let src = self.emit_to_temp(base, &bt);
        let t_idx = self.fb.add_type(typ);
        self.fb
            .emit(Instruction::new(Opcode::Assert, src, t_idx, dst));
        self.fb.exit_stack();
        if panic_on_failure {
            // When the assertion failed, skip the jump over the panic
            // sequence.
            let ok = self.fb.new_label();
            self.fb
                .emit(Instruction::new(Opcode::If, 0, Condition::NotOk as i8, 0));
            self.fb.emit_goto(ok);
            // Interface conversion failure message.
            self.fb.enter_stack();
            let msg = self
                .fb
                .general_const(Value::str(format!("interface conversion: not {}", typ)));
            let tmp = self.fb.new_register(Bank::General);
            self.fb.emit(Instruction::with_k(
                Opcode::Move,
                true,
                Bank::General as i8,
                msg,
                tmp,
            ));
            self.fb.emit(Instruction::new(Opcode::Panic, tmp, 0, 0));
            self.fb.exit_stack();
            self.fb.set_label_addr(ok);
        }
        let _ = e;
    }

    // =========================================================================
    // Composite literals
    // =========================================================================

    fn emit_composite(
        &mut self,
        e: &Expr,
        lit: &vela_syntax::ast::CompositeLit,
        typ: &TypeHandle,
        dst: i8,
    ) {
        let lt = self.info(e).typ.clone().unwrap_or_else(|| typ.clone());
        let under = Type::underlying(&lt);
        match &*under {
            Type::Slice(elem) => {
                let elem = elem.clone();
                // Size from the highest index (keyed entries may skip).
                let mut n = 0i64;
                let mut next = 0i64;
                for el in &lit.elems {
                    let at = match &el.key {
                        Some(k) => self
                            .info(k)
                            .value
                            .as_ref()
                            .and_then(|v| v.to_i64())
                            .expect("constant slice index"),
                        None => next,
                    };
                    next = at + 1;
                    n = n.max(next);
                }
                let t_idx = self.fb.add_type(&lt);
                let (len_op, cap_op, flags) = self.size_operands(n);
                self.fb.emit(Instruction::new(Opcode::MakeSlice, t_idx, 0, dst));
                self.fb.emit(Instruction::operands(len_op, cap_op, flags));
                self.fb.enter_stack();
                let mut next = 0i64;
                for el in &lit.elems {
                    let at = match &el.key {
                        Some(k) => self
                            .info(k)
                            .value
                            .as_ref()
                            .and_then(|v| v.to_i64())
                            .expect("constant slice index"),
                        None => next,
                    };
                    next = at + 1;
                    self.fb.enter_stack();
                    let v = self.emit_elem_value(&el.value, &elem);
                    let idx_op = if (-128..=127).contains(&at) {
                        (at as i8, true)
                    } else {
                        let r = self.fb.new_register(Bank::Int);
                        let idx = self.fb.int_const(at);
                        self.fb.emit(Instruction::new(Opcode::LoadNumber, 0, idx, r));
                        (r, false)
                    };
                    self.fb.emit(Instruction::with_k(
                        Opcode::SetSlice,
                        idx_op.1,
                        v,
                        idx_op.0,
                        dst,
                    ));
                    self.fb.exit_stack();
                }
                self.fb.exit_stack();
            }
            Type::Array(n, elem) => {
                let elem = elem.clone();
                // Arrays materialize as a fresh zero value plus stores.
                let t_idx = self.fb.add_type(&lt);
                self.fb.enter_stack();
                let cell = self.fb.new_register(Bank::General);
                self.fb.emit(Instruction::new(Opcode::New, 0, t_idx, cell));
                self.fb
                    .emit(Instruction::new(Opcode::PtrGet, cell, Bank::General as i8, dst));
                for (i, el) in lit.elems.iter().enumerate() {
                    assert!(i < *n, "array literal overflow");
                    self.fb.enter_stack();
                    let v = self.emit_elem_value(&el.value, &elem);
                    self.fb.emit(Instruction::with_k(
                        Opcode::SetSlice,
                        true,
                        v,
                        i as i8,
                        dst,
                    ));
                    self.fb.exit_stack();
                }
                self.fb.exit_stack();
            }
            Type::Map(key_t, val_t) => {
                let (key_t, val_t) = (key_t.clone(), val_t.clone());
                let t_idx = self.fb.add_type(&lt);
                let n = lit.elems.len() as i64;
                let (size_op, size_k) = if (-128..=127).contains(&n) {
                    (n as i8, true)
                } else {
                    (127, true)
                };
                self.fb.emit(Instruction::with_k(
                    Opcode::MakeMap,
                    size_k,
                    t_idx,
                    size_op,
                    dst,
                ));
                for el in &lit.elems {
                    self.fb.enter_stack();
                    let key = el.key.as_ref().expect("map literal key");
                    let kreg = {
                        let r = self.fb.new_register(key_t.bank());
                        self.emit_assignable(key, &key_t, r);
                        r
                    };
                    let v = self.emit_elem_value(&el.value, &val_t);
                    self.fb
                        .emit(Instruction::new(Opcode::SetMap, dst, v, kreg));
                    self.fb.exit_stack();
                }
            }
            Type::Struct(fields) => {
                let fields = fields.clone();
                let t_idx = self.fb.add_type(&lt);
                self.fb.enter_stack();
                let cell = self.fb.new_register(Bank::General);
                self.fb.emit(Instruction::new(Opcode::New, 0, t_idx, cell));
                self.fb
                    .emit(Instruction::new(Opcode::PtrGet, cell, Bank::General as i8, dst));
                let keyed = lit.elems.iter().any(|el| el.key.is_some());
                for (i, el) in lit.elems.iter().enumerate() {
                    let (fi, ft) = if keyed {
                        let name = match &el.key.as_ref().unwrap().kind {
                            ExprKind::Ident(id) => &id.name,
                            _ => panic!("struct literal key is not a field name"),
                        };
                        let idx = fields
                            .iter()
                            .position(|f| &f.name == name)
                            .expect("unknown struct field");
                        (idx, fields[idx].typ.clone())
                    } else {
                        (i, fields[i].typ.clone())
                    };
                    self.fb.enter_stack();
                    let v = self.emit_elem_value(&el.value, &ft);
                    let path = self.fb.int_const(encode_field_index(&[fi]));
                    self.fb
                        .emit(Instruction::new(Opcode::SetField, v, path, dst));
                    self.fb.exit_stack();
                }
                self.fb.exit_stack();
            }
            _ => panic!("invalid composite literal type reached the emitter"),
        }
    }

    /// Emits an element value, boxing when the element type is an
    /// interface.
    fn emit_elem_value(&mut self, value: &Expr, elem: &TypeHandle) -> i8 {
        let r = self.fb.new_register(elem.bank());
        self.emit_assignable(value, elem, r);
        r
    }

    // =========================================================================
    // Function literals
    // =========================================================================

    fn emit_func_lit(&mut self, fl: &FuncLit, dst: i8) {
        let sig = self
            .ctx
            .checked
            .info
            .expr(fl.id)
            .typ
            .clone()
            .expect("literal without signature");
        let captures = self
            .ctx
            .checked
            .info
            .captures
            .get(&fl.id)
            .cloned()
            .unwrap_or_default();

        // Build the child function with a nested emitter.
        let mut child = Function::new("main", format!("{}.func", self.fb.fn_.name), sig.clone());
        child.file = self.fb.fn_.file.clone();
        child.line = fl.pos.line;
        // Resolve the child's closure-variable references against this
        // (the parent) frame.
        for cap in &captures {
            if cap.from_parent_frame {
                let loc = self
                    .fb
                    .var_loc(cap.decl)
                    .expect("captured variable unbound in parent");
                match loc {
                    VarLoc::Cell { r } => child.var_refs.push(-(r as i16)),
                    _ => panic!("captured variable was not celled"),
                }
            } else {
                // From the enclosing literal's capture vector.
                let parent_caps = self
                    .fb
                    .var_loc(cap.decl)
                    .expect("transitively captured variable unbound");
                match parent_caps {
                    VarLoc::Capture { idx, .. } => child.var_refs.push(idx as i16),
                    _ => panic!("transitively captured variable has no capture slot"),
                }
            }
        }

        let child_id = {
            let placeholder = self.ctx.module.add_function(child);
            placeholder
        };
        let built = {
            let child_fn = self.ctx.module.functions[child_id as usize].clone();
            let mut em = Emitter::new(self.ctx, child_fn);
            em.setup_frame(&fl.typ, &sig, &captures);
            em.emit_block(&fl.body);
            em.fb.end()
        };
        self.ctx.module.functions[child_id as usize] = built;

        let lit_idx = self.fb.add_literal(child_id);
        self.fb
            .emit(Instruction::new(Opcode::Func, 0, lit_idx, dst));
    }

    // =========================================================================
    // Calls
    // =========================================================================

    pub(crate) fn emit_call(&mut self, e: &Expr, call: &CallExpr, typ: &TypeHandle, dst: i8) {
        self.fb.enter_stack();
        let rets = self.emit_call_multi(e, call);
        // Copy the first result to the destination.
        if let Some((bank, r)) = rets.first() {
            if dst != 0 {
                self.fb
                    .emit(Instruction::new(Opcode::Move, *bank as i8, *r, dst));
            }
        }
        self.fb.exit_stack();
        let _ = typ;
    }

    /// Emits a call leaving the results in registers of the current
    /// stack; the caller wraps with `enter_stack`/`exit_stack` and
    /// consumes the results before exiting. Returns the result registers
    /// in declaration order.
    pub(crate) fn emit_call_multi(&mut self, e: &Expr, call: &CallExpr) -> Vec<(Bank, i8)> {
        let fun_info = self.info(&call.fun).clone();

        // Conversion.
        if fun_info.is_type() {
            let target = fun_info.typ.clone().unwrap();
            let r = self.fb.new_register(target.bank());
            self.emit_conversion(&call.args[0], &target, r);
            return vec![(target.bank(), r)];
        }

        // Builtin.
        if let Some(Entity::Builtin(b)) = self.ctx.checked.info.uses.get(&callee_id(&call.fun)) {
            let b = *b;
            return self.emit_builtin(b, e, call);
        }

        let sig_t = fun_info.typ.clone().expect("callee without type");
        let sig = match &*Type::underlying(&sig_t) {
            Type::Func(ft) => ft.clone(),
            _ => panic!("call of non-function reached the emitter"),
        };

        // Dispatch: direct, native, or indirect.
        enum Callee {
            Direct(u32),
            Native(std::rc::Rc<vela_runtime::native::NativeFunction>),
            Indirect,
        }
        let callee = match self.ctx.checked.info.uses.get(&callee_id(&call.fun)) {
            Some(Entity::Func { name }) => Callee::Direct(self.ctx.fn_ids[name]),
            Some(Entity::NativeFunc(nf)) => Callee::Native(nf.clone()),
            _ => Callee::Indirect,
        };

        // An indirect callee (closure value, method value) loads first,
        // below the call window.
        let callable = match &callee {
            Callee::Indirect => {
                let r = self.fb.new_register(Bank::General);
                self.emit_expr_to(&call.fun, &sig_t, r);
                Some(r)
            }
            _ => None,
        };

        // A forwarded multi-value argument f(g()) evaluates before the
        // window so the window stays contiguous.
        let forwarded: Option<Vec<(Bank, i8)>> = if call.args.len() == 1 && !sig.variadic {
            match (&self.info(&call.args[0]).multi, &call.args[0].kind) {
                (Some(multi), ExprKind::Call(inner)) if multi.len() == sig.params.len() => {
                    let inner = inner.clone();
                    Some(self.emit_call_multi(&call.args[0], &inner))
                }
                _ => None,
            }
        } else {
            None
        };

        let shift = self.fb.stack_shift();
        let mut rets: Vec<(Bank, i8)> = Vec::new();
        for rt in &sig.results {
            rets.push(self.fb.new_register_for(rt));
        }
        let numvar = match forwarded {
            Some(inner_rets) => {
                for (pt, (b, src)) in sig.params.iter().zip(&inner_rets) {
                    let dst = self.fb.new_register(pt.bank());
                    self.fb
                        .emit(Instruction::new(Opcode::Move, *b as i8, *src, dst));
                }
                NO_VARIADIC
            }
            None => self.stage_args(&sig, call, matches!(callee, Callee::Native(_))),
        };

        match callee {
            Callee::Direct(fn_id) => {
                let idx = self.fb.add_function(fn_id);
                self.fb.emit(Instruction::new(Opcode::Call, idx, 0, 0));
                self.fb.emit(Instruction::quad(shift));
            }
            Callee::Native(nf) => {
                let idx = self.fb.add_native(&nf);
                self.fb
                    .emit(Instruction::new(Opcode::CallNative, idx, numvar, 0));
                self.fb.emit(Instruction::quad(shift));
            }
            Callee::Indirect => {
                self.fb.emit(Instruction::new(
                    Opcode::CallIndirect,
                    callable.unwrap(),
                    numvar,
                    0,
                ));
                self.fb.emit(Instruction::quad(shift));
            }
        }
        rets
    }

    /// Stages arguments after the result slots. Script-function variadic
    /// tails are materialized as a slice; native tails stay unrolled with
    /// their count returned.
    fn stage_args(&mut self, sig: &FuncType, call: &CallExpr, native: bool) -> i8 {
        let nparams = sig.params.len();
        let fixed = if sig.variadic { nparams - 1 } else { nparams };

        for (i, arg) in call.args.iter().take(fixed).enumerate() {
            let pt = sig.params[i].clone();
            let r = self.fb.new_register(pt.bank());
            self.emit_assignable(arg, &pt, r);
        }

        if !sig.variadic {
            return NO_VARIADIC;
        }
        let slice_t = sig.params[nparams - 1].clone();
        let elem = match &*Type::underlying(&slice_t) {
            Type::Slice(e) => e.clone(),
            _ => panic!("variadic parameter is not a slice"),
        };

        if call.spread {
            // The spread slice is passed through directly.
            let r = self.fb.new_register(Bank::General);
            self.emit_expr_to(&call.args[fixed], &slice_t, r);
            return NO_VARIADIC;
        }

        let tail = &call.args[fixed..];
        if native {
            // Unrolled in the element's bank; the bridge builds the
            // slice.
            for arg in tail {
                let r = self.fb.new_register(elem.bank());
                self.emit_assignable(arg, &elem, r);
            }
            tail.len() as i8
        } else {
            // Materialize the slice at the call site.
            let dst = self.fb.new_register(Bank::General);
            let t_idx = self.fb.add_type(&slice_t);
            let (len_op, cap_op, flags) = self.size_operands(tail.len() as i64);
            self.fb
                .emit(Instruction::new(Opcode::MakeSlice, t_idx, 0, dst));
            self.fb.emit(Instruction::operands(len_op, cap_op, flags));
            for (i, arg) in tail.iter().enumerate() {
                self.fb.enter_stack();
                let v = self.emit_elem_value(arg, &elem);
                self.fb
                    .emit(Instruction::with_k(Opcode::SetSlice, true, v, i as i8, dst));
                self.fb.exit_stack();
            }
            NO_VARIADIC
        }
    }

    fn emit_conversion(&mut self, arg: &Expr, target: &TypeHandle, dst: i8) {
        let src_t = self.expr_type(arg);
        let (su, tu) = (Type::underlying(&src_t), Type::underlying(target));
        let src_kind = su.basic_kind();
        let dst_kind = tu.basic_kind();
        let t_idx = self.fb.add_type(target);

        match (src_kind, dst_kind) {
            (Some(sk), Some(dk)) if sk.is_integer() && dk.is_numeric() => {
                let r = self.emit_to_temp(arg, &src_t);
                let op = if sk.is_unsigned() {
                    Opcode::ConvertUint
                } else {
                    Opcode::ConvertInt
                };
                self.fb.emit(Instruction::new(op, r, t_idx, dst));
            }
            (Some(sk), Some(_)) if sk.is_float() => {
                let r = self.emit_to_temp(arg, &src_t);
                self.fb
                    .emit(Instruction::new(Opcode::ConvertFloat, r, t_idx, dst));
            }
            (Some(sk), Some(BasicKind::String)) if sk.is_integer() => {
                let r = self.emit_to_temp(arg, &src_t);
                self.fb
                    .emit(Instruction::new(Opcode::ConvertInt, r, t_idx, dst));
            }
            (Some(BasicKind::String), _) | (_, Some(BasicKind::String)) => {
                // string <-> []byte / []rune.
                let r = self.emit_to_temp(arg, &src_t);
                self.fb
                    .emit(Instruction::new(Opcode::ConvertString, r, t_idx, dst));
            }
            _ => {
                // Identity up to naming; interface boxing goes through
                // the general conversion with its memory charge.
                if target.bank() == Bank::General && src_t.bank() != Bank::General {
                    self.emit_boxed(arg, &src_t, dst);
                } else if target.bank() == Bank::General {
                    let r = self.emit_to_temp(arg, &src_t);
                    self.fb
                        .emit(Instruction::new(Opcode::ConvertGeneral, r, t_idx, dst));
                } else {
                    self.emit_expr_to(arg, &src_t, dst);
                }
            }
        }
    }

    // =========================================================================
    // Builtins
    // =========================================================================

    fn emit_builtin(&mut self, b: Builtin, e: &Expr, call: &CallExpr) -> Vec<(Bank, i8)> {
        match b {
            Builtin::Len => {
                let dst = self.fb.new_register(Bank::Int);
                let arg = &call.args[0];
                let at = self.expr_type(arg);
                let under = Type::underlying(&at);
                let (tag, bank): (i8, Bank) = match &*under {
                    Type::Basic(BasicKind::String) => (0, Bank::String),
                    Type::Slice(_) => (1, Bank::General),
                    Type::Map(_, _) => (2, Bank::General),
                    Type::Chan(_, _) => (3, Bank::General),
                    Type::Array(_, _) => (4, Bank::General),
                    _ => panic!("len of unsupported type"),
                };
                let r = self.fb.new_register(bank);
                self.emit_expr_to(arg, &at, r);
                self.fb.emit(Instruction::new(Opcode::Len, r, tag, dst));
                vec![(Bank::Int, dst)]
            }
            Builtin::Cap => {
                let dst = self.fb.new_register(Bank::Int);
                let arg = &call.args[0];
                let at = self.expr_type(arg);
                let r = self.emit_to_temp(arg, &at);
                self.fb.emit(Instruction::new(Opcode::Cap, r, 0, dst));
                vec![(Bank::Int, dst)]
            }
            Builtin::Append => self.emit_append(call),
            Builtin::Close => {
                let at = self.expr_type(&call.args[0]);
                let r = self.emit_to_temp(&call.args[0], &at);
                self.fb.emit(Instruction::new(Opcode::Close, r, 0, 0));
                Vec::new()
            }
            Builtin::Copy => {
                let dst_t = self.expr_type(&call.args[0]);
                let src_t = self.expr_type(&call.args[1]);
                let d = self.emit_to_temp(&call.args[0], &dst_t);
                let s = self.emit_to_temp(&call.args[1], &src_t);
                let n = self.fb.new_register(Bank::Int);
                self.fb.emit(Instruction::new(Opcode::Copy, d, s, n));
                vec![(Bank::Int, n)]
            }
            Builtin::Delete => {
                let mt = self.expr_type(&call.args[0]);
                let key_t = match &*Type::underlying(&mt) {
                    Type::Map(k, _) => k.clone(),
                    _ => panic!("delete of non-map"),
                };
                let m = self.emit_to_temp(&call.args[0], &mt);
                let k = self.fb.new_register(key_t.bank());
                self.emit_assignable(&call.args[1], &key_t, k);
                self.fb.emit(Instruction::new(Opcode::Delete, m, 0, k));
                Vec::new()
            }
            Builtin::Make => {
                let target = self.info(e).typ.clone().expect("make without type");
                let dst = self.fb.new_register(Bank::General);
                let t_idx = self.fb.add_type(&target);
                let int_t = Type::basic(BasicKind::Int);
                match &*Type::underlying(&target) {
                    Type::Slice(_) => {
                        let mut flags: i8 = 0;
                        let (len_op, len_k) = self.emit_operand(&call.args[1], &int_t);
                        if len_k {
                            flags |= 1;
                        }
                        let (cap_op, cap_k) = if call.args.len() > 2 {
                            self.emit_operand(&call.args[2], &int_t)
                        } else {
                            (len_op, len_k)
                        };
                        if cap_k {
                            flags |= 2;
                        }
                        self.fb
                            .emit(Instruction::new(Opcode::MakeSlice, t_idx, 0, dst));
                        self.fb.emit(Instruction::operands(len_op, cap_op, flags));
                    }
                    Type::Map(_, _) => {
                        let (size, k) = if call.args.len() > 1 {
                            self.emit_operand(&call.args[1], &int_t)
                        } else {
                            (0, true)
                        };
                        self.fb
                            .emit(Instruction::with_k(Opcode::MakeMap, k, t_idx, size, dst));
                    }
                    Type::Chan(_, _) => {
                        let (cap, k) = if call.args.len() > 1 {
                            self.emit_operand(&call.args[1], &int_t)
                        } else {
                            (0, true)
                        };
                        self.fb
                            .emit(Instruction::with_k(Opcode::MakeChan, k, t_idx, cap, dst));
                    }
                    _ => panic!("make of unsupported type"),
                }
                vec![(Bank::General, dst)]
            }
            Builtin::New => {
                let elem = match &self.info(&call.args[0]).typ {
                    Some(t) => t.clone(),
                    None => panic!("new without type"),
                };
                let dst = self.fb.new_register(Bank::General);
                let t_idx = self.fb.add_type(&elem);
                self.fb.emit(Instruction::new(Opcode::New, 0, t_idx, dst));
                vec![(Bank::General, dst)]
            }
            Builtin::Panic => {
                let arg = &call.args[0];
                let at = self.expr_type(arg);
                let r = self.fb.new_register(Bank::General);
                self.emit_assignable(arg, &Type::empty_interface(), r);
                let _ = at;
                self.fb.emit(Instruction::new(Opcode::Panic, r, 0, 0));
                Vec::new()
            }
            Builtin::Print | Builtin::Println => {
                for (i, arg) in call.args.iter().enumerate() {
                    if b == Builtin::Println && i > 0 {
                        let sep = self.fb.general_const(Value::str(" "));
                        self.fb
                            .emit(Instruction::with_k(Opcode::Print, true, sep, 0, 0));
                    }
                    self.fb.enter_stack();
                    let r = self.fb.new_register(Bank::General);
                    self.emit_assignable(arg, &Type::empty_interface(), r);
                    self.fb.emit(Instruction::new(Opcode::Print, r, 0, 0));
                    self.fb.exit_stack();
                }
                if b == Builtin::Println {
                    let nl = self.fb.general_const(Value::str("\n"));
                    self.fb
                        .emit(Instruction::with_k(Opcode::Print, true, nl, 0, 0));
                }
                Vec::new()
            }
            Builtin::Recover => {
                let dst = self.fb.new_register(Bank::General);
                self.fb.emit(Instruction::new(Opcode::Recover, 0, 0, dst));
                vec![(Bank::General, dst)]
            }
            Builtin::Complex | Builtin::Imag | Builtin::Real => {
                panic!("complex builtins rejected by the checker")
            }
        }
    }

    fn emit_append(&mut self, call: &CallExpr) -> Vec<(Bank, i8)> {
        let slice_t = self.expr_type(&call.args[0]);
        let elem = match &*Type::underlying(&slice_t) {
            Type::Slice(e) => e.clone(),
            _ => panic!("append to non-slice"),
        };
        let dst = self.fb.new_register(Bank::General);
        self.emit_expr_to(&call.args[0], &slice_t, dst);
        if call.spread {
            self.fb.enter_stack();
            let src = self.fb.new_register(Bank::General);
            self.emit_expr_to(&call.args[1], &slice_t, src);
            self.fb
                .emit(Instruction::new(Opcode::AppendSlice, src, 0, dst));
            self.fb.exit_stack();
        } else if call.args.len() > 1 {
            // The appended values form a contiguous window in the
            // element's bank.
            self.fb.enter_stack();
            let first = self.fb.new_register(elem.bank());
            self.emit_assignable(&call.args[1], &elem, first);
            for arg in &call.args[2..] {
                let r = self.fb.new_register(elem.bank());
                self.emit_assignable(arg, &elem, r);
            }
            self.fb.emit(Instruction::new(
                Opcode::Append,
                first,
                (call.args.len() - 1) as i8,
                dst,
            ));
            self.fb.exit_stack();
        }
        vec![(Bank::General, dst)]
    }

    // =========================================================================
    // Comma-ok sources
    // =========================================================================

    /// Emits a comma-ok source into `dst`, then the ok flag into
    /// `ok_dst` (both may be 0).
    pub(crate) fn emit_comma_ok(
        &mut self,
        src: &Expr,
        kind: CommaOk,
        val_t: &TypeHandle,
        dst: i8,
        ok_dst: i8,
    ) {
        match kind {
            CommaOk::TypeAssert => {
                if let ExprKind::TypeAssert(base, _) = strip_parens(src) {
                    self.emit_type_assert(src, base, val_t, dst, false);
                } else {
                    unreachable!("comma-ok assert shape");
                }
            }
            CommaOk::MapIndex => {
                if let ExprKind::Index(base, index) = strip_parens(src) {
                    self.emit_index(base, index, val_t, dst);
                } else {
                    unreachable!("comma-ok map shape");
                }
            }
            CommaOk::Receive => {
                if let ExprKind::Receive(ch) = strip_parens(src) {
                    let ct = self.expr_type(ch);
                    self.fb.enter_stack();
                    let creg = self.emit_to_temp(ch, &ct);
                    self.fb
                        .emit(Instruction::new(Opcode::Receive, creg, 0, dst));
                    self.fb.exit_stack();
                } else {
                    unreachable!("comma-ok receive shape");
                }
            }
        }
        if ok_dst != 0 {
            // ok := the flag left by the source instruction.
            self.fb.emit(Instruction::with_k(
                Opcode::Move,
                true,
                Bank::Int as i8,
                0,
                ok_dst,
            ));
            self.fb
                .emit(Instruction::new(Opcode::If, 0, Condition::NotOk as i8, 0));
            self.fb.emit(Instruction::with_k(
                Opcode::Move,
                true,
                Bank::Int as i8,
                1,
                ok_dst,
            ));
        }
    }
}

pub(crate) fn callee_id(e: &Expr) -> NodeId {
    match &e.kind {
        ExprKind::Ident(id) => id.id,
        ExprKind::Paren(inner) => callee_id(inner),
        _ => e.id,
    }
}

pub(crate) fn strip_parens(e: &Expr) -> &ExprKind {
    match &e.kind {
        ExprKind::Paren(inner) => strip_parens(inner),
        other => other,
    }
}



// Loop context accessors used by statement lowering.
impl Emitter<'_, '_> {
    pub(crate) fn current_loop(&self) -> &LoopCtx {
        self.loops.last().expect("break/continue outside loop")
    }

    /// Known len/cap operands for `MakeSlice`: immediates when small,
    /// otherwise a register loaded before the instruction.
    fn size_operands(&mut self, n: i64) -> (i8, i8, i8) {
        if (0..=127).contains(&n) {
            (n as i8, n as i8, 3)
        } else {
            let r = self.fb.new_register(Bank::Int);
            let idx = self.fb.int_const(n);
            self.fb.emit(Instruction::new(Opcode::LoadNumber, 0, idx, r));
            (r, r, 0)
        }
    }
}
