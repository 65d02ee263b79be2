//! Statement lowering.

use vela_analysis::assignment::{comma_ok_shape, CommaOk};
use vela_analysis::Entity;
use vela_runtime::instruction::{encode_field_index, Condition, Instruction, Opcode, NO_VARIADIC};
use vela_runtime::types::{Bank, BasicKind, Type, TypeHandle};
use vela_syntax::ast::{
    AssignStmt, Expr, ExprKind, Ident, SelectComm, Stmt, StmtKind, VarDecl,
};
use vela_syntax::op::{AssignOp, BinaryOp, IncDecOp, UnaryOp};

use crate::expr::{callee_id, strip_parens};
use crate::func::VarLoc;
use crate::{Emitter, LoopCtx};

impl Emitter<'_, '_> {
    pub(crate) fn emit_block(&mut self, body: &[Stmt]) {
        self.fb.enter_scope();
        for s in body {
            self.emit_stmt(s);
        }
        self.fb.exit_scope();
    }

    fn emit_stmt(&mut self, s: &Stmt) {
        self.fb.add_line(s.pos.line);
        match &s.kind {
            StmtKind::Expr(e) => match strip_parens(e) {
                ExprKind::Call(call) => {
                    self.fb.enter_stack();
                    let _ = self.emit_call_multi(e, call);
                    self.fb.exit_stack();
                }
                ExprKind::Receive(ch) => {
                    self.fb.enter_stack();
                    let ct = self.expr_type(ch);
                    let creg = self.emit_to_temp(ch, &ct);
                    self.fb
                        .emit(Instruction::new(Opcode::Receive, creg, 0, 0));
                    self.fb.exit_stack();
                }
                _ => panic!("non-call expression statement reached the emitter"),
            },
            StmtKind::Send(ch, value) => {
                self.fb.enter_stack();
                let ct = self.expr_type(ch);
                let elem = match &*Type::underlying(&ct) {
                    Type::Chan(_, e) => e.clone(),
                    _ => panic!("send on non-channel"),
                };
                let creg = self.emit_to_temp(ch, &ct);
                let (v, k) = self.emit_operand(value, &elem);
                self.fb
                    .emit(Instruction::with_k(Opcode::Send, k, v, 0, creg));
                self.fb.exit_stack();
            }
            StmtKind::IncDec(target, op) => {
                let delta: i8 = if *op == IncDecOp::Inc { 1 } else { -1 };
                let tt = self.expr_type(target);
                let is_float = tt
                    .basic_kind()
                    .map(|k| k.is_float())
                    .unwrap_or(false);
                self.rmw(target, &tt, |em, cur, dst| {
                    if is_float {
                        let one = em.fb.float_const(delta as f64);
                        em.fb.emit(Instruction::with_k(
                            Opcode::AddFloat,
                            true,
                            cur,
                            one,
                            dst,
                        ));
                    } else {
                        em.fb.emit(Instruction::with_k(
                            Opcode::AddInt,
                            true,
                            cur,
                            delta,
                            dst,
                        ));
                    }
                });
            }
            StmtKind::Assign(a) => self.emit_assign(a),
            StmtKind::Var(vd) => self.emit_local_var(vd),
            StmtKind::Const(_) | StmtKind::Type(_) => {}
            StmtKind::Block(body) => self.emit_block(body),
            StmtKind::If(stmt) => {
                self.fb.enter_scope();
                if let Some(init) = &stmt.init {
                    self.emit_stmt(init);
                }
                let else_l = self.fb.new_label();
                let end = self.fb.new_label();
                self.emit_condition(&stmt.cond);
                self.fb.emit_goto(else_l);
                self.emit_block(&stmt.then);
                self.fb.emit_goto(end);
                self.fb.set_label_addr(else_l);
                if let Some(els) = &stmt.els {
                    self.emit_stmt(els);
                }
                self.fb.set_label_addr(end);
                self.fb.exit_scope();
            }
            StmtKind::For(stmt) => {
                self.fb.enter_scope();
                if let Some(init) = &stmt.init {
                    self.emit_stmt(init);
                }
                let start = self.fb.new_label();
                let post_l = self.fb.new_label();
                let end = self.fb.new_label();
                self.fb.set_label_addr(start);
                if let Some(cond) = &stmt.cond {
                    self.emit_condition(cond);
                    self.fb.emit_goto(end);
                }
                self.loops.push(LoopCtx {
                    break_label: end,
                    continue_label: post_l,
                });
                self.emit_block(&stmt.body);
                self.loops.pop();
                self.fb.set_label_addr(post_l);
                if let Some(post) = &stmt.post {
                    self.emit_stmt(post);
                }
                self.fb.emit_goto(start);
                self.fb.set_label_addr(end);
                self.fb.exit_scope();
            }
            StmtKind::ForRange(stmt) => self.emit_for_range(stmt),
            StmtKind::Switch(stmt) => self.emit_switch(stmt),
            StmtKind::TypeSwitch(stmt) => self.emit_type_switch(stmt),
            StmtKind::Select(stmt) => self.emit_select(stmt),
            StmtKind::Return(values) => self.emit_return(values),
            StmtKind::Break => {
                let label = self.current_loop().break_label;
                self.fb.emit_goto(label);
            }
            StmtKind::Continue => {
                let label = self.current_loop().continue_label;
                self.fb.emit_goto(label);
            }
            StmtKind::Fallthrough => {
                unreachable!("fallthrough is lowered by the switch emitter")
            }
            StmtKind::Go(call) => self.emit_go(call),
            StmtKind::Defer(call) => self.emit_defer(call),
        }
    }

    // =========================================================================
    // Assignments
    // =========================================================================

    fn emit_assign(&mut self, a: &AssignStmt) {
        match a.op {
            AssignOp::Define | AssignOp::Assign => {}
            AssignOp::Compound(op) => {
                let lhs = &a.lhs[0];
                let rhs = &a.rhs[0];
                let tt = self.expr_type(lhs);
                // Rewritten as the matching plain assignment of a binary
                // expression over the current value.
                self.rmw(lhs, &tt, |em, cur, dst| {
                    em.emit_compound_op(op, &tt, cur, rhs, dst);
                });
                return;
            }
        }

        // Comma-ok forms.
        if a.rhs.len() == 1 && a.lhs.len() == 2 {
            if let Some(kind) = comma_ok_shape(&a.rhs[0], &self.ctx.checked.info) {
                self.emit_comma_ok_assign(a, kind);
                return;
            }
        }

        // Multi-value call on the right.
        if a.rhs.len() == 1 && a.lhs.len() > 1 {
            if let ExprKind::Call(call) = strip_parens(&a.rhs[0]) {
                let call = call.clone();
                self.fb.enter_stack();
                let rets = self.emit_call_multi(&a.rhs[0], &call);
                let targets = self.prepare_targets(a);
                for ((bank, src), target) in rets.iter().zip(targets) {
                    self.store_prepared(target, *bank, *src, false);
                }
                self.fb.exit_stack();
                return;
            }
        }

        // Plain 1:1 (or N:N) assignment: evaluate every right-hand side
        // into temporaries first so swaps work, then store.
        self.fb.enter_stack();
        let mut temps: Vec<(Bank, i8, TypeHandle)> = Vec::new();
        for (lhs, rhs) in a.lhs.iter().zip(&a.rhs) {
            let tt = if a.op == AssignOp::Define {
                self.define_target_type(lhs, rhs)
            } else if is_blank(lhs) {
                self.expr_type(rhs)
            } else {
                self.expr_type(lhs)
            };
            let r = self.fb.new_register(tt.bank());
            self.emit_assignable(rhs, &tt, r);
            temps.push((tt.bank(), r, tt));
        }
        for (lhs, (bank, src, tt)) in a.lhs.iter().zip(temps) {
            if is_blank(lhs) {
                continue;
            }
            if a.op == AssignOp::Define {
                self.define_target(lhs, &tt, bank, src);
            } else {
                self.emit_store(lhs, &tt, src, false);
            }
        }
        self.fb.exit_stack();
    }

    /// The declared (or existing) type of a `:=` target.
    fn define_target_type(&mut self, lhs: &Expr, rhs: &Expr) -> TypeHandle {
        let id = match strip_parens(lhs) {
            ExprKind::Ident(id) => id,
            _ => panic!(":= target is not an identifier"),
        };
        if id.is_blank() {
            return self.expr_type(rhs);
        }
        match self.ctx.checked.info.uses.get(&id.id) {
            // Redeclared existing variable in the same block.
            Some(Entity::Local { decl }) => self
                .ctx
                .checked
                .info
                .defs
                .get(decl)
                .expect("local without definition")
                .typ
                .clone(),
            _ => self
                .ctx
                .checked
                .info
                .defs
                .get(&id.id)
                .expect("defined variable without definition")
                .typ
                .clone(),
        }
    }

    /// Binds (or re-stores) a `:=` target from a staged temporary.
    fn define_target(&mut self, lhs: &Expr, typ: &TypeHandle, bank: Bank, src: i8) {
        let id = match strip_parens(lhs) {
            ExprKind::Ident(id) => id.clone(),
            _ => panic!(":= target is not an identifier"),
        };
        match self.ctx.checked.info.uses.get(&id.id) {
            Some(Entity::Local { .. }) | Some(Entity::Global { .. }) => {
                // Existing variable: plain store.
                self.store_ident(id.id, typ, src, false);
            }
            _ => {
                let loc = self.declare_var(&id, typ);
                self.store_to_loc(loc, bank, src, typ);
            }
        }
    }

    /// Allocates storage for a newly declared variable, celling it when
    /// captured or address-taken.
    pub(crate) fn declare_var(&mut self, name: &Ident, typ: &TypeHandle) -> VarLoc {
        if self.ctx.checked.info.captured.contains(&name.id) {
            let cell = self.fb.new_register(Bank::General);
            let t_idx = self.fb.add_type(typ);
            self.fb.emit(Instruction::new(Opcode::New, 0, t_idx, cell));
            let loc = VarLoc::Cell { r: cell };
            self.fb.bind_var(name.id, loc);
            loc
        } else {
            let (bank, r) = self.fb.new_register_for(typ);
            let loc = VarLoc::Reg { bank, r };
            self.fb.bind_var(name.id, loc);
            loc
        }
    }

    fn store_to_loc(&mut self, loc: VarLoc, bank: Bank, src: i8, typ: &TypeHandle) {
        match loc {
            VarLoc::Reg { bank: b, r } => {
                self.fb.emit(Instruction::new(Opcode::Move, b as i8, src, r));
            }
            VarLoc::Cell { r } => {
                self.fb
                    .emit(Instruction::new(Opcode::Move, typ.bank() as i8, src, -r));
            }
            VarLoc::Capture { idx, bank: b } => {
                self.fb
                    .emit(Instruction::new(Opcode::SetCapture, src, idx, b as i8));
            }
        }
        let _ = bank;
    }

    fn emit_comma_ok_assign(&mut self, a: &AssignStmt, kind: CommaOk) {
        self.fb.enter_stack();
        let val_t = {
            let src_t = self.expr_type(&a.rhs[0]);
            src_t
        };
        let bool_t = Type::basic(BasicKind::Bool);
        // Stage into temporaries, then store (targets may be fresh `:=`
        // variables or existing ones).
        let v_tmp = self.fb.new_register(val_t.bank());
        let ok_tmp = self.fb.new_register(Bank::Int);
        self.emit_comma_ok(&a.rhs[0], kind, &val_t, v_tmp, ok_tmp);
        for (lhs, (tt, bank, src)) in a.lhs.iter().zip([
            (val_t.clone(), val_t.bank(), v_tmp),
            (bool_t.clone(), Bank::Int, ok_tmp),
        ]) {
            if is_blank(lhs) {
                continue;
            }
            if a.op == AssignOp::Define {
                self.define_target(lhs, &tt, bank, src);
            } else {
                self.emit_store(lhs, &tt, src, false);
            }
        }
        self.fb.exit_stack();
    }

    /// Pre-resolves multi-assignment targets (before the values exist).
    fn prepare_targets<'e>(&mut self, a: &'e AssignStmt) -> Vec<Option<(&'e Expr, TypeHandle)>> {
        a.lhs
            .iter()
            .map(|lhs| {
                if is_blank(lhs) {
                    None
                } else if a.op == AssignOp::Define {
                    let tt = {
                        let id = match strip_parens(lhs) {
                            ExprKind::Ident(id) => id,
                            _ => panic!(":= target is not an identifier"),
                        };
                        self.ctx
                            .checked
                            .info
                            .defs
                            .get(&id.id)
                            .map(|d| d.typ.clone())
                            .unwrap_or_else(|| self.expr_type(lhs))
                    };
                    Some((lhs, tt))
                } else {
                    Some((lhs, self.expr_type(lhs)))
                }
            })
            .collect()
    }

    fn store_prepared(
        &mut self,
        target: Option<(&Expr, TypeHandle)>,
        bank: Bank,
        src: i8,
        k: bool,
    ) {
        if let Some((lhs, tt)) = target {
            let is_new = matches!(strip_parens(lhs), ExprKind::Ident(id)
                if !id.is_blank() && !matches!(self.ctx.checked.info.uses.get(&id.id), Some(Entity::Local{..}) | Some(Entity::Global{..})));
            if is_new {
                self.define_target(lhs, &tt, bank, src);
            } else {
                self.emit_store(lhs, &tt, src, k);
            }
        }
    }

    /// Stores a staged value into any assignable target.
    pub(crate) fn emit_store(&mut self, lhs: &Expr, typ: &TypeHandle, src: i8, k: bool) {
        match strip_parens(lhs) {
            ExprKind::Ident(id) => self.store_ident(id.id, typ, src, k),
            ExprKind::Index(base, index) => {
                let bt = self.expr_type(base);
                self.fb.enter_stack();
                match &*Type::underlying(&bt) {
                    Type::Map(key_t, _) => {
                        let key_t = key_t.clone();
                        let m = self.emit_to_temp(base, &bt);
                        let kreg = self.fb.new_register(key_t.bank());
                        self.emit_assignable(index, &key_t, kreg);
                        self.fb
                            .emit(Instruction::with_k(Opcode::SetMap, k, m, src, kreg));
                    }
                    _ => {
                        let s = self.emit_to_temp(base, &bt);
                        let int_t = Type::basic(BasicKind::Int);
                        let (i_op, ik) = self.emit_operand(index, &int_t);
                        // SetSlice's constant bit covers the index.
                        let _ = k;
                        self.fb
                            .emit(Instruction::with_k(Opcode::SetSlice, ik, src, i_op, s));
                    }
                }
                self.fb.exit_stack();
            }
            ExprKind::Selector(base, field) => {
                // Package-variable selector.
                if self.info(base).is_package() {
                    match self.ctx.checked.info.uses.get(&lhs.id).cloned() {
                        Some(Entity::Global { index }) => self.emit_set_var(index, src, k),
                        _ => panic!("assignment to non-variable package member"),
                    }
                    return;
                }
                let bt = self.expr_type(base);
                let path = self.field_path(&bt, &field.name);
                let path_const = self.fb.int_const(encode_field_index(&path));
                self.fb.enter_stack();
                let b = self.emit_struct_base(base, &bt);
                self.fb
                    .emit(Instruction::new(Opcode::SetField, src, path_const, b));
                self.store_struct_base_back(base, &bt, b);
                self.fb.exit_stack();
            }
            ExprKind::Unary(UnaryOp::Deref, ptr) => {
                let pt = self.expr_type(ptr);
                self.fb.enter_stack();
                let p = self.emit_to_temp(ptr, &pt);
                self.fb
                    .emit(Instruction::new(Opcode::PtrSet, src, typ.bank() as i8, p));
                self.fb.exit_stack();
            }
            _ => panic!("unsupported assignment target"),
        }
    }

    /// A struct base for a field store: local struct variables are used
    /// in place (no copying move); container elements and globals go
    /// through read-modify-write.
    fn emit_struct_base(&mut self, base: &Expr, bt: &TypeHandle) -> i8 {
        if let ExprKind::Ident(id) = strip_parens(base) {
            if let Some(Entity::Local { decl }) = self.ctx.checked.info.uses.get(&id.id) {
                if let Some(VarLoc::Reg { bank: Bank::General, r }) = self.fb.var_loc(*decl) {
                    return r;
                }
                if let Some(VarLoc::Cell { r }) = self.fb.var_loc(*decl) {
                    return -r;
                }
            }
        }
        self.emit_to_temp(base, bt)
    }

    /// After a field store through a temporary, container elements and
    /// globals write the modified struct back.
    fn store_struct_base_back(&mut self, base: &Expr, bt: &TypeHandle, breg: i8) {
        match strip_parens(base) {
            ExprKind::Ident(id) => {
                match self.ctx.checked.info.uses.get(&id.id) {
                    Some(Entity::Global { index }) => {
                        let index = *index;
                        self.emit_set_var(index, breg, false);
                    }
                    // Locals were modified in place.
                    _ => {}
                }
            }
            ExprKind::Index(_, _) if matches!(&*Type::underlying(bt), Type::Struct(_) | Type::Named(_)) => {
                // s[i].f = v completes as s[i] = modified copy.
                self.emit_store(base, bt, breg, false);
            }
            _ => {}
        }
    }

    fn emit_compound_op(
        &mut self,
        op: BinaryOp,
        typ: &TypeHandle,
        cur: i8,
        rhs: &Expr,
        dst: i8,
    ) {
        let kind = Type::underlying(typ)
            .basic_kind()
            .expect("compound assignment on non-basic type");
        if kind == BasicKind::String {
            let (b, k) = self.emit_operand(rhs, typ);
            self.fb
                .emit(Instruction::with_k(Opcode::Concat, k, cur, b, dst));
            return;
        }
        let opcode = if kind.is_float() {
            match op {
                BinaryOp::Add => Opcode::AddFloat,
                BinaryOp::Sub => Opcode::SubFloat,
                BinaryOp::Mul => Opcode::MulFloat,
                BinaryOp::Div => Opcode::DivFloat,
                _ => panic!("float compound operator {}", op),
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
                _ => panic!("compound operator {}", op),
            }
        };
        let (b, k) = self.emit_operand(rhs, typ);
        self.fb.emit(Instruction::with_k(opcode, k, cur, b, dst));
    }

    /// Read-modify-write on an assignable target: loads the current
    /// value, applies `f`, stores back.
    fn rmw(
        &mut self,
        target: &Expr,
        typ: &TypeHandle,
        f: impl FnOnce(&mut Self, i8, i8),
    ) {
        // Fast path: variables mutate their own register.
        if let ExprKind::Ident(id) = strip_parens(target) {
            if let Some(Entity::Local { decl }) = self.ctx.checked.info.uses.get(&id.id) {
                if let Some(loc) = self.fb.var_loc(*decl) {
                    if let Some(r) = loc.operand() {
                        self.fb.enter_stack();
                        f(self, r, r);
                        self.fb.exit_stack();
                        return;
                    }
                }
            }
        }
        self.fb.enter_stack();
        let cur = self.fb.new_register(typ.bank());
        self.emit_expr_to(target, typ, cur);
        f(self, cur, cur);
        self.emit_store(target, typ, cur, false);
        self.fb.exit_stack();
    }

    // =========================================================================
    // Local variable declarations
    // =========================================================================

    fn emit_local_var(&mut self, vd: &VarDecl) {
        // Multi-value initializer.
        if vd.values.len() == 1 && vd.names.len() > 1 {
            if let ExprKind::Call(call) = strip_parens(&vd.values[0]) {
                let call = call.clone();
                self.fb.enter_stack();
                let rets = self.emit_call_multi(&vd.values[0], &call);
                let mut locs = Vec::new();
                for name in &vd.names {
                    let typ = self.var_type(name);
                    locs.push((self.declare_var_or_discard(name, &typ), typ));
                }
                for ((bank, src), (loc, typ)) in rets.iter().zip(locs) {
                    if let Some(loc) = loc {
                        self.store_to_loc(loc, *bank, *src, &typ);
                    }
                }
                self.fb.exit_stack();
                return;
            }
        }

        if vd.values.is_empty() {
            // Zero values.
            for name in &vd.names {
                let typ = self.var_type(name);
                if let Some(loc) = self.declare_var_or_discard(name, &typ) {
                    self.emit_zero_to_loc(loc, &typ);
                }
            }
            return;
        }

        for (name, value) in vd.names.iter().zip(&vd.values) {
            let typ = self.var_type(name);
            self.fb.enter_stack();
            let tmp = self.fb.new_register(typ.bank());
            self.emit_assignable(value, &typ, tmp);
            if let Some(loc) = self.declare_var_or_discard(name, &typ) {
                self.store_to_loc(loc, typ.bank(), tmp, &typ);
            }
            self.fb.exit_stack();
        }
    }

    fn var_type(&self, name: &Ident) -> TypeHandle {
        self.ctx
            .checked
            .info
            .defs
            .get(&name.id)
            .map(|d| d.typ.clone())
            .unwrap_or_else(Type::empty_interface)
    }

    fn declare_var_or_discard(&mut self, name: &Ident, typ: &TypeHandle) -> Option<VarLoc> {
        if name.is_blank() {
            None
        } else {
            Some(self.declare_var(name, typ))
        }
    }

    pub(crate) fn emit_zero_to_loc(&mut self, loc: VarLoc, typ: &TypeHandle) {
        match Type::underlying(typ).basic_kind() {
            Some(k) if k.is_float() => {
                let idx = self.fb.float_const(0.0);
                let r = loc_operand(loc);
                self.fb
                    .emit(Instruction::with_k(Opcode::Move, true, Bank::Float as i8, idx, r));
            }
            Some(BasicKind::String) => {
                let idx = self.fb.string_const("");
                let r = loc_operand(loc);
                self.fb
                    .emit(Instruction::with_k(Opcode::Move, true, Bank::String as i8, idx, r));
            }
            Some(_) => {
                let r = loc_operand(loc);
                self.fb
                    .emit(Instruction::with_k(Opcode::Move, true, Bank::Int as i8, 0, r));
            }
            None => {
                // Cells hold the zero already (New); plain general
                // registers get a fresh zero value through New + PtrGet.
                match loc {
                    VarLoc::Cell { .. } => {}
                    VarLoc::Reg { r, .. } => {
                        self.fb.enter_stack();
                        let t_idx = self.fb.add_type(typ);
                        let cell = self.fb.new_register(Bank::General);
                        self.fb.emit(Instruction::new(Opcode::New, 0, t_idx, cell));
                        self.fb.emit(Instruction::new(
                            Opcode::PtrGet,
                            cell,
                            Bank::General as i8,
                            r,
                        ));
                        self.fb.exit_stack();
                    }
                    VarLoc::Capture { .. } => {}
                }
            }
        }
    }

    // =========================================================================
    // Global variable initializers ($initvars)
    // =========================================================================

    pub(crate) fn emit_global_var_init(&mut self, vd: &VarDecl) {
        if vd.values.is_empty() {
            return; // zeros are seeded at load time
        }
        // Multi-value initializer.
        if vd.values.len() == 1 && vd.names.len() > 1 {
            if let ExprKind::Call(call) = strip_parens(&vd.values[0]) {
                let call = call.clone();
                self.fb.enter_stack();
                let rets = self.emit_call_multi(&vd.values[0], &call);
                for (name, (_, src)) in vd.names.iter().zip(rets) {
                    if name.is_blank() {
                        continue;
                    }
                    if let Some(index) = self.global_index(name) {
                        self.emit_set_var(index, src, false);
                    }
                }
                self.fb.exit_stack();
                return;
            }
        }
        for (name, value) in vd.names.iter().zip(&vd.values) {
            self.fb.enter_stack();
            let typ = self.var_type(name);
            let tmp = self.fb.new_register(typ.bank());
            self.emit_assignable(value, &typ, tmp);
            if !name.is_blank() {
                if let Some(index) = self.global_index(name) {
                    self.emit_set_var(index, tmp, false);
                }
            }
            self.fb.exit_stack();
        }
    }

    fn global_index(&self, name: &Ident) -> Option<u16> {
        self.ctx
            .checked
            .globals
            .iter()
            .position(|g| g.pkg == "main" && g.name == name.name)
            .map(|i| i as u16)
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    fn emit_for_range(&mut self, stmt: &vela_syntax::ast::ForRangeStmt) {
        self.fb.enter_scope();
        let et = self.expr_type(&stmt.expr);
        let under = Type::underlying(&et);
        let kind: i8 = match &*under {
            Type::Slice(_) => 0,
            Type::Array(_, _) => 1,
            Type::Basic(BasicKind::String) => 2,
            Type::Map(_, _) => 3,
            Type::Chan(_, _) => 4,
            _ => panic!("range over unsupported type"),
        };
        let creg = self.emit_to_temp(&stmt.expr, &et);

        // Key/value destinations (0 discards).
        let (key_t, val_t): (TypeHandle, Option<TypeHandle>) = match &*under {
            Type::Slice(e) => (Type::basic(BasicKind::Int), Some(e.clone())),
            Type::Array(_, e) => (Type::basic(BasicKind::Int), Some(e.clone())),
            Type::Basic(BasicKind::String) => (
                Type::basic(BasicKind::Int),
                Some(Type::basic(BasicKind::Int32)),
            ),
            Type::Map(k, v) => (k.clone(), Some(v.clone())),
            Type::Chan(_, e) => (e.clone(), None),
            _ => unreachable!(),
        };
        let key_reg = match &stmt.key {
            Some(id) if !id.is_blank() => {
                if stmt.define {
                    match self.declare_var(id, &key_t) {
                        VarLoc::Reg { r, .. } => r,
                        VarLoc::Cell { r } => -r,
                        VarLoc::Capture { .. } => unreachable!("fresh variable captured slot"),
                    }
                } else {
                    self.existing_var_operand(id)
                }
            }
            _ => 0,
        };
        let val_reg = match (&stmt.value, &val_t) {
            (Some(id), Some(vt)) if !id.is_blank() => {
                if stmt.define {
                    match self.declare_var(id, vt) {
                        VarLoc::Reg { r, .. } => r,
                        VarLoc::Cell { r } => -r,
                        VarLoc::Capture { .. } => unreachable!("fresh variable captured slot"),
                    }
                } else {
                    self.existing_var_operand(id)
                }
            }
            _ => 0,
        };

        let depth = self.range_depth;
        self.range_depth += 1;
        self.fb
            .emit(Instruction::new(Opcode::Range, creg, depth, kind));
        let start = self.fb.new_label();
        let end = self.fb.new_label();
        self.fb.set_label_addr(start);
        self.fb
            .emit(Instruction::new(Opcode::RangeNext, depth, key_reg, val_reg));
        self.fb.emit_goto(end);
        self.loops.push(LoopCtx {
            break_label: end,
            continue_label: start,
        });
        self.emit_block(&stmt.body);
        self.loops.pop();
        self.fb.emit_goto(start);
        self.fb.set_label_addr(end);
        self.range_depth -= 1;
        self.fb.exit_scope();
    }

    fn existing_var_operand(&mut self, id: &Ident) -> i8 {
        match self.ctx.checked.info.uses.get(&id.id) {
            Some(Entity::Local { decl }) => {
                let loc = self.fb.var_loc(*decl).expect("local without binding");
                loc.operand().expect("range variable in capture slot")
            }
            _ => panic!("range assignment target must be a local variable"),
        }
    }

    fn emit_switch(&mut self, stmt: &vela_syntax::ast::SwitchStmt) {
        self.fb.enter_scope();
        if let Some(init) = &stmt.init {
            self.emit_stmt(init);
        }
        let end = self.fb.new_label();
        let body_labels: Vec<u32> = stmt.cases.iter().map(|_| self.fb.new_label()).collect();
        let mut default_case: Option<usize> = None;

        // Tag evaluated once.
        let tag = stmt.tag.as_ref();
        let tag_t = tag.map(|t| self.expr_type(t));
        let tag_reg = match (tag, &tag_t) {
            (Some(t), Some(tt)) => Some(self.emit_to_temp(t, tt)),
            _ => None,
        };

        for (i, case) in stmt.cases.iter().enumerate() {
            if case.values.is_empty() {
                default_case = Some(i);
                continue;
            }
            for v in &case.values {
                match (tag_reg, &tag_t) {
                    (Some(reg), Some(tt)) => {
                        self.emit_tag_condition(reg, tt, v);
                    }
                    _ => {
                        // Tagless switch: each value is a bool condition.
                        self.emit_condition(v);
                    }
                }
                // Condition held: skip the fall-to-next jump.
                let no = self.fb.new_label();
                self.fb.emit_goto(no);
                self.fb.emit_goto(body_labels[i]);
                self.fb.set_label_addr(no);
            }
        }
        match default_case {
            Some(d) => self.fb.emit_goto(body_labels[d]),
            None => self.fb.emit_goto(end),
        }

        self.loops.push(LoopCtx {
            break_label: end,
            continue_label: self
                .loops
                .last()
                .map(|l| l.continue_label)
                .unwrap_or(end),
        });
        for (i, case) in stmt.cases.iter().enumerate() {
            self.fb.set_label_addr(body_labels[i]);
            let falls = case
                .body
                .last()
                .map(|s| matches!(s.kind, StmtKind::Fallthrough))
                .unwrap_or(false);
            let body: &[Stmt] = if falls {
                &case.body[..case.body.len() - 1]
            } else {
                &case.body
            };
            self.emit_block(body);
            if falls {
                self.fb.emit_goto(body_labels[i + 1]);
            } else {
                self.fb.emit_goto(end);
            }
        }
        self.loops.pop();
        self.fb.set_label_addr(end);
        self.fb.exit_scope();
    }

    /// One `tag == value` test ending in an If-family instruction.
    fn emit_tag_condition(&mut self, tag_reg: i8, tag_t: &TypeHandle, v: &Expr) {
        self.fb.enter_stack();
        let under = Type::underlying(tag_t);
        let (op, cond) = match under.basic_kind() {
            Some(k) if k.is_float() => (Opcode::IfFloat, Condition::Equal),
            Some(BasicKind::String) => (Opcode::IfString, Condition::Equal),
            Some(_) => (Opcode::IfInt, Condition::Equal),
            None => panic!("switch on non-basic tag"),
        };
        let (b, k) = self.emit_operand(v, tag_t);
        self.fb
            .emit(Instruction::with_k(op, k, tag_reg, b, cond as i8));
        self.fb.exit_stack();
    }

    fn emit_type_switch(&mut self, stmt: &vela_syntax::ast::TypeSwitchStmt) {
        self.fb.enter_scope();
        if let Some(init) = &stmt.init {
            self.emit_stmt(init);
        }
        let subject_t = self.expr_type(&stmt.expr);
        let subject = self.emit_to_temp(&stmt.expr, &subject_t);
        let end = self.fb.new_label();
        let body_labels: Vec<u32> = stmt.cases.iter().map(|_| self.fb.new_label()).collect();
        let mut default_case: Option<usize> = None;

        for (i, case) in stmt.cases.iter().enumerate() {
            if case.types.is_empty() {
                default_case = Some(i);
                continue;
            }
            for t in &case.types {
                let no = self.fb.new_label();
                if is_nil_type(t) {
                    self.fb
                        .emit(Instruction::new(Opcode::If, subject, Condition::Nil as i8, 0));
                } else {
                    let ct = self.ctx.checked.info.type_expr(t.id).clone();
                    let t_idx = self.fb.add_type(&ct);
                    self.fb
                        .emit(Instruction::new(Opcode::Assert, subject, t_idx, 0));
                    self.fb
                        .emit(Instruction::new(Opcode::If, 0, Condition::Ok as i8, 0));
                }
                self.fb.emit_goto(no);
                self.fb.emit_goto(body_labels[i]);
                self.fb.set_label_addr(no);
            }
        }
        match default_case {
            Some(d) => self.fb.emit_goto(body_labels[d]),
            None => self.fb.emit_goto(end),
        }

        self.loops.push(LoopCtx {
            break_label: end,
            continue_label: self
                .loops
                .last()
                .map(|l| l.continue_label)
                .unwrap_or(end),
        });
        for (i, case) in stmt.cases.iter().enumerate() {
            self.fb.set_label_addr(body_labels[i]);
            self.fb.enter_scope();
            if let Some(binding) = &stmt.binding {
                // Single-type cases bind at the asserted type; others
                // keep the interface value.
                let bind_t = if case.types.len() == 1 && !is_nil_type(&case.types[0]) {
                    self.ctx.checked.info.type_expr(case.types[0].id).clone()
                } else {
                    subject_t.clone()
                };
                let loc = self.declare_var(binding, &bind_t);
                let dst = match loc {
                    VarLoc::Reg { r, .. } => r,
                    VarLoc::Cell { r } => -r,
                    VarLoc::Capture { .. } => unreachable!(),
                };
                if Type::identical(&bind_t, &subject_t) {
                    self.fb.emit(Instruction::new(
                        Opcode::Move,
                        Bank::General as i8,
                        subject,
                        dst,
                    ));
                } else {
                    let t_idx = self.fb.add_type(&bind_t);
                    self.fb
                        .emit(Instruction::new(Opcode::Assert, subject, t_idx, dst));
                }
            }
            for s in &case.body {
                self.emit_stmt(s);
            }
            self.fb.exit_scope();
            self.fb.emit_goto(end);
        }
        self.loops.pop();
        self.fb.set_label_addr(end);
        self.fb.exit_scope();
    }

    fn emit_select(&mut self, stmt: &vela_syntax::ast::SelectStmt) {
        self.fb.enter_scope();
        let end = self.fb.new_label();

        struct CaseSlot {
            dir: i8,
            value_reg: i8,
            chan_reg: i8,
            body_label: u32,
        }
        let mut slots: Vec<CaseSlot> = Vec::new();

        // Registration phase: channels and staged send values evaluate
        // up front, in case order.
        for case in &stmt.cases {
            let body_label = self.fb.new_label();
            let slot = match &case.comm {
                SelectComm::Send(ch, value) => {
                    let ct = self.expr_type(ch);
                    let elem = match &*Type::underlying(&ct) {
                        Type::Chan(_, e) => e.clone(),
                        _ => panic!("select send on non-channel"),
                    };
                    let chan_reg = self.emit_to_temp(ch, &ct);
                    let value_reg = self.fb.new_register(elem.bank());
                    self.emit_assignable(value, &elem, value_reg);
                    CaseSlot {
                        dir: 0,
                        value_reg,
                        chan_reg,
                        body_label,
                    }
                }
                SelectComm::Recv { value, chan, .. } => {
                    let ct = self.expr_type(chan);
                    let elem = match &*Type::underlying(&ct) {
                        Type::Chan(_, e) => e.clone(),
                        _ => panic!("select receive on non-channel"),
                    };
                    let chan_reg = self.emit_to_temp(chan, &ct);
                    let value_reg = match value {
                        Some(id) if !id.is_blank() => self.fb.new_register(elem.bank()),
                        _ => 0,
                    };
                    CaseSlot {
                        dir: 1,
                        value_reg,
                        chan_reg,
                        body_label,
                    }
                }
                SelectComm::Default => CaseSlot {
                    dir: 2,
                    value_reg: 0,
                    chan_reg: 0,
                    body_label,
                },
            };
            slots.push(slot);
        }

        // The case pairs, then the select.
        for slot in &slots {
            self.fb.emit(Instruction::new(
                Opcode::Case,
                slot.dir,
                slot.value_reg,
                slot.chan_reg,
            ));
            self.fb.emit_goto(slot.body_label);
        }
        self.fb.emit(Instruction::new(Opcode::Select, 0, 0, 0));
        self.fb.emit_goto(end); // unreachable safety net

        // Bodies.
        for (case, slot) in stmt.cases.iter().zip(&slots) {
            self.fb.set_label_addr(slot.body_label);
            self.fb.enter_scope();
            if let SelectComm::Recv {
                value, ok, define, ..
            } = &case.comm
            {
                if *define {
                    if let Some(id) = value {
                        if !id.is_blank() {
                            // The received value is already in the
                            // registered register; bind it.
                            let vt = self.var_type(id);
                            self.fb.bind_var(
                                id.id,
                                VarLoc::Reg {
                                    bank: vt.bank(),
                                    r: slot.value_reg,
                                },
                            );
                        }
                    }
                    if let Some(okv) = ok {
                        if !okv.is_blank() {
                            let loc = self.declare_var(okv, &Type::basic(BasicKind::Bool));
                            let dst = loc.operand().expect("fresh ok variable");
                            self.emit_ok_flag(dst);
                        }
                    }
                } else {
                    if let Some(id) = value {
                        if !id.is_blank() {
                            let vt = self.var_type(id);
                            self.store_ident(id.id, &vt, slot.value_reg, false);
                        }
                    }
                    if let Some(okv) = ok {
                        if !okv.is_blank() {
                            self.fb.enter_stack();
                            let tmp = self.fb.new_register(Bank::Int);
                            self.emit_ok_flag(tmp);
                            let bool_t = Type::basic(BasicKind::Bool);
                            self.store_ident(okv.id, &bool_t, tmp, false);
                            self.fb.exit_stack();
                        }
                    }
                }
            }
            for s in &case.body {
                self.emit_stmt(s);
            }
            self.fb.exit_scope();
            self.fb.emit_goto(end);
        }
        self.fb.set_label_addr(end);
        self.fb.exit_scope();
    }

    /// Captures the ok flag into an int register.
    fn emit_ok_flag(&mut self, dst: i8) {
        self.fb
            .emit(Instruction::with_k(Opcode::Move, true, Bank::Int as i8, 0, dst));
        self.fb
            .emit(Instruction::new(Opcode::If, 0, Condition::NotOk as i8, 0));
        self.fb
            .emit(Instruction::with_k(Opcode::Move, true, Bank::Int as i8, 1, dst));
    }

    fn emit_return(&mut self, values: &[Expr]) {
        let results = match &*self.fb.fn_.typ {
            Type::Func(ft) => ft.results.clone(),
            _ => Vec::new(),
        };
        if values.len() == 1 && results.len() > 1 {
            if let ExprKind::Call(call) = strip_parens(&values[0]) {
                let call = call.clone();
                self.fb.enter_stack();
                let rets = self.emit_call_multi(&values[0], &call);
                let ret_regs = self.ret_regs.clone();
                for ((bank, src), (_, dst)) in rets.iter().zip(&ret_regs) {
                    self.fb
                        .emit(Instruction::new(Opcode::Move, *bank as i8, *src, *dst));
                }
                self.fb.exit_stack();
                self.fb.emit(Instruction::new(Opcode::Return, 0, 0, 0));
                return;
            }
        }
        let ret_regs = self.ret_regs.clone();
        for ((v, rt), (_, dst)) in values.iter().zip(&results).zip(&ret_regs) {
            self.emit_assignable(v, rt, *dst);
        }
        self.fb.emit(Instruction::new(Opcode::Return, 0, 0, 0));
    }

    // =========================================================================
    // go and defer
    // =========================================================================

    fn emit_go(&mut self, call_expr: &Expr) {
        let call = match strip_parens(call_expr) {
            ExprKind::Call(c) => c.clone(),
            _ => panic!("go of non-call"),
        };
        let sig_t = self
            .info(&call.fun)
            .typ
            .clone()
            .expect("go callee without type");
        let sig = match &*Type::underlying(&sig_t) {
            Type::Func(ft) => ft.clone(),
            _ => panic!("go of non-function"),
        };

        self.fb.enter_stack();
        enum Target {
            Direct(u32),
            Native(std::rc::Rc<vela_runtime::native::NativeFunction>),
            Indirect(i8),
        }
        let target = match self.ctx.checked.info.uses.get(&callee_id(&call.fun)) {
            Some(Entity::Func { name }) => Target::Direct(self.ctx.fn_ids[name]),
            Some(Entity::NativeFunc(nf)) => Target::Native(nf.clone()),
            _ => {
                let r = self.fb.new_register(Bank::General);
                self.emit_expr_to(&call.fun, &sig_t, r);
                Target::Indirect(r)
            }
        };
        let shift = self.fb.stack_shift();
        for rt in &sig.results {
            let _ = self.fb.new_register_for(rt);
        }
        let numvar = self.stage_call_args(&sig, &call, matches!(target, Target::Native(_)));
        self.fb.emit(Instruction::new(Opcode::Go, 0, 0, 0));
        match target {
            Target::Direct(fn_id) => {
                let idx = self.fb.add_function(fn_id);
                self.fb.emit(Instruction::new(Opcode::Call, idx, 0, 0));
            }
            Target::Native(nf) => {
                let idx = self.fb.add_native(&nf);
                self.fb
                    .emit(Instruction::new(Opcode::CallNative, idx, numvar, 0));
            }
            Target::Indirect(r) => {
                self.fb
                    .emit(Instruction::new(Opcode::CallIndirect, r, numvar, 0));
            }
        }
        self.fb.emit(Instruction::quad(shift));
        self.fb.exit_stack();
    }

    fn emit_defer(&mut self, call_expr: &Expr) {
        let call = match strip_parens(call_expr) {
            ExprKind::Call(c) => c.clone(),
            _ => panic!("defer of non-call"),
        };
        let sig_t = self
            .info(&call.fun)
            .typ
            .clone()
            .expect("defer callee without type");
        let sig = match &*Type::underlying(&sig_t) {
            Type::Func(ft) => ft.clone(),
            _ => panic!("defer of non-function"),
        };

        self.fb.enter_stack();
        // The deferred callable is always a first-class value.
        let callable = self.fb.new_register(Bank::General);
        self.emit_expr_to(&call.fun, &sig_t, callable);

        let shift = self.fb.stack_shift();
        for rt in &sig.results {
            let _ = self.fb.new_register_for(rt);
        }
        let numvar = self.stage_call_args(&sig, &call, false);
        let after = self.fb.stack_shift();
        let argsq = [
            after[0] - shift[0],
            after[1] - shift[1],
            after[2] - shift[2],
            after[3] - shift[3],
        ];
        self.fb
            .emit(Instruction::new(Opcode::Defer, callable, numvar, 0));
        self.fb.emit(Instruction::quad(shift));
        self.fb.emit(Instruction::quad(argsq));
        self.fb.exit_stack();
    }

    /// Shared staging for go/defer: fixed args, then the variadic tail
    /// (unrolled for native callees, a materialized slice otherwise).
    fn stage_call_args(
        &mut self,
        sig: &vela_runtime::types::FuncType,
        call: &vela_syntax::ast::CallExpr,
        native: bool,
    ) -> i8 {
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
            let r = self.fb.new_register(Bank::General);
            self.emit_expr_to(&call.args[fixed], &slice_t, r);
            return NO_VARIADIC;
        }
        let tail = &call.args[fixed..];
        if native {
            for arg in tail {
                let r = self.fb.new_register(elem.bank());
                self.emit_assignable(arg, &elem, r);
            }
            tail.len() as i8
        } else {
            let dst = self.fb.new_register(Bank::General);
            let t_idx = self.fb.add_type(&slice_t);
            self.fb
                .emit(Instruction::new(Opcode::MakeSlice, t_idx, 0, dst));
            let n = tail.len() as i8;
            self.fb.emit(Instruction::operands(n, n, 3));
            for (i, arg) in tail.iter().enumerate() {
                self.fb.enter_stack();
                let vr = self.fb.new_register(elem.bank());
                self.emit_assignable(arg, &elem, vr);
                self.fb
                    .emit(Instruction::with_k(Opcode::SetSlice, true, vr, i as i8, dst));
                self.fb.exit_stack();
            }
            NO_VARIADIC
        }
    }
}

fn is_blank(e: &Expr) -> bool {
    matches!(strip_parens(e), ExprKind::Ident(id) if id.is_blank())
}

fn is_nil_type(t: &vela_syntax::ast::TypeExpr) -> bool {
    matches!(&t.kind, vela_syntax::ast::TypeExprKind::Name(id) if id.name == "nil")
}

fn loc_operand(loc: VarLoc) -> i8 {
    loc.operand().expect("variable without direct operand")
}
