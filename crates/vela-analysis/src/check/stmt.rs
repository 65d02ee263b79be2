//! Statement checking.

use vela_common::Position;
use vela_runtime::types::{BasicKind, ChanDir, Type, TypeHandle};
use vela_syntax::ast::{
    Expr, ExprKind, SelectComm, Stmt, StmtKind, TypeExprKind,
};

use super::errors::CheckError;
use super::type_info::Entity;
use super::{describe, Checker};
use crate::scope::ScopeEntry;

impl Checker<'_> {
    pub(crate) fn check_block(&mut self, body: &[Stmt]) -> Result<(), CheckError> {
        self.scopes.push();
        let result = body.iter().try_for_each(|s| self.check_stmt(s));
        self.scopes.pop();
        result
    }

    fn check_stmt(&mut self, s: &Stmt) -> Result<(), CheckError> {
        match &s.kind {
            StmtKind::Expr(e) => {
                let info = self.check_expr(e, None)?;
                match &e.kind {
                    ExprKind::Call(_) | ExprKind::Receive(_) => Ok(()),
                    _ => {
                        let _ = info;
                        self.err(e.pos, "expression evaluated but not used")
                    }
                }
            }
            StmtKind::Send(ch, value) => {
                let ci = self.check_expr(ch, None)?;
                let elem = match ci.typ.as_ref().map(Type::underlying).as_deref() {
                    Some(Type::Chan(dir, elem)) => {
                        if *dir == ChanDir::RecvOnly {
                            return self.err(
                                s.pos,
                                "invalid operation: send to receive-only channel",
                            );
                        }
                        elem.clone()
                    }
                    _ => {
                        return self.err(
                            s.pos,
                            format!("invalid operation: cannot send to {}", describe(&ci)),
                        )
                    }
                };
                let vi = self.check_expr(value, Some(&elem))?;
                self.check_assignable(&vi, &elem, value.pos)
            }
            StmtKind::IncDec(e, op) => self.check_inc_dec(e, *op, s.pos),
            StmtKind::Assign(a) => self.check_assign_stmt(a, s.pos),
            StmtKind::Var(vd) => {
                let types = self.check_var_decl_types(vd, s.pos)?;
                for (name, typ) in vd.names.iter().zip(types) {
                    self.declare_local(name, typ)?;
                }
                Ok(())
            }
            StmtKind::Const(cd) => self.check_local_const(cd, s.pos),
            StmtKind::Type(td) => {
                let underlying = self.check_type_expr(&td.typ)?;
                let typ = if td.alias {
                    underlying
                } else {
                    std::rc::Rc::new(Type::Named(vela_runtime::types::NamedType {
                        pkg: "main".to_string(),
                        name: td.name.name.clone(),
                        underlying,
                        methods: Vec::new(),
                    }))
                };
                let entry = ScopeEntry {
                    entity: Entity::TypeName(typ),
                    pos: td.name.pos,
                    fn_depth: self.fn_depth,
                };
                if self.scopes.declare(&td.name.name, entry).is_err() {
                    return self.err(
                        td.name.pos,
                        format!("{} redeclared in this block", td.name.name),
                    );
                }
                Ok(())
            }
            StmtKind::Block(body) => self.check_block(body),
            StmtKind::If(stmt) => {
                self.scopes.push();
                let result = (|| {
                    if let Some(init) = &stmt.init {
                        self.check_stmt(init)?;
                    }
                    self.check_bool_cond(&stmt.cond)?;
                    self.check_block(&stmt.then)?;
                    if let Some(els) = &stmt.els {
                        self.check_stmt(els)?;
                    }
                    Ok(())
                })();
                self.scopes.pop();
                result
            }
            StmtKind::For(stmt) => {
                self.scopes.push();
                self.loop_depth += 1;
                let result = (|| {
                    if let Some(init) = &stmt.init {
                        self.check_stmt(init)?;
                    }
                    if let Some(cond) = &stmt.cond {
                        self.check_bool_cond(cond)?;
                    }
                    if let Some(post) = &stmt.post {
                        self.check_stmt(post)?;
                    }
                    self.check_block(&stmt.body)
                })();
                self.loop_depth -= 1;
                self.scopes.pop();
                result
            }
            StmtKind::ForRange(stmt) => self.check_for_range(stmt, s.pos),
            StmtKind::Switch(stmt) => {
                self.scopes.push();
                self.switch_depth += 1;
                let result = (|| {
                    if let Some(init) = &stmt.init {
                        self.check_stmt(init)?;
                    }
                    let tag_t: TypeHandle = match &stmt.tag {
                        Some(tag) => {
                            let ti = self.check_expr(tag, None)?;
                            self.default_type(&ti, tag.pos)?
                        }
                        None => Type::basic(BasicKind::Bool),
                    };
                    let ncases = stmt.cases.len();
                    let mut seen_default = false;
                    for (ci, case) in stmt.cases.iter().enumerate() {
                        if case.values.is_empty() {
                            if seen_default {
                                return self.err(case.pos, "multiple defaults in switch");
                            }
                            seen_default = true;
                        }
                        for v in &case.values {
                            let vi = self.check_expr(v, Some(&tag_t))?;
                            self.check_assignable(&vi, &tag_t, v.pos)?;
                        }
                        for (si, cs) in case.body.iter().enumerate() {
                            if matches!(cs.kind, StmtKind::Fallthrough) {
                                if si != case.body.len() - 1 {
                                    return self.err(
                                        cs.pos,
                                        "fallthrough statement out of place",
                                    );
                                }
                                if ci == ncases - 1 {
                                    return self.err(
                                        cs.pos,
                                        "cannot fallthrough final case in switch",
                                    );
                                }
                            }
                        }
                        self.check_block(&case.body)?;
                    }
                    Ok(())
                })();
                self.switch_depth -= 1;
                self.scopes.pop();
                result
            }
            StmtKind::TypeSwitch(stmt) => {
                self.scopes.push();
                self.switch_depth += 1;
                let result = (|| {
                    if let Some(init) = &stmt.init {
                        self.check_stmt(init)?;
                    }
                    let ei = self.check_expr(&stmt.expr, None)?;
                    let et = match &ei.typ {
                        Some(t) if t.is_interface() => t.clone(),
                        Some(t) => {
                            return self.err(
                                stmt.expr.pos,
                                format!("cannot type switch on non-interface value of type {}", t),
                            )
                        }
                        None => return self.err(stmt.expr.pos, "use of untyped nil"),
                    };
                    for case in &stmt.cases {
                        self.scopes.push();
                        let case_result = (|| {
                            let bind_t = if case.types.len() == 1 {
                                let t = &case.types[0];
                                if is_nil_type_expr(t) {
                                    et.clone()
                                } else {
                                    self.check_type_expr(t)?
                                }
                            } else {
                                for t in &case.types {
                                    if !is_nil_type_expr(t) {
                                        self.check_type_expr(t)?;
                                    }
                                }
                                et.clone()
                            };
                            if let Some(binding) = &stmt.binding {
                                self.declare_local(binding, bind_t)?;
                                // Each case binds its own variable; later
                                // cases redefine it, so drop the previous
                                // definition record's uniqueness by id.
                            }
                            self.check_block_flat(&case.body)
                        })();
                        self.scopes.pop();
                        case_result?;
                    }
                    Ok(())
                })();
                self.switch_depth -= 1;
                self.scopes.pop();
                result
            }
            StmtKind::Select(stmt) => {
                for case in &stmt.cases {
                    self.scopes.push();
                    let result = (|| {
                        match &case.comm {
                            SelectComm::Send(ch, value) => {
                                let send = Stmt {
                                    id: 0,
                                    kind: StmtKind::Send(ch.clone(), value.clone()),
                                    pos: case.pos,
                                };
                                // Re-borrowed as a send statement check.
                                self.check_stmt(&send)?;
                            }
                            SelectComm::Recv {
                                value,
                                ok,
                                define,
                                chan,
                            } => {
                                let ci = self.check_expr(chan, None)?;
                                let elem = match ci.typ.as_ref().map(Type::underlying).as_deref() {
                                    Some(Type::Chan(dir, elem)) => {
                                        if *dir == ChanDir::SendOnly {
                                            return self.err(
                                                case.pos,
                                                "invalid operation: receive from send-only channel",
                                            );
                                        }
                                        elem.clone()
                                    }
                                    _ => {
                                        return self.err(
                                            case.pos,
                                            "invalid operation: receive from non-channel",
                                        )
                                    }
                                };
                                if *define {
                                    if let Some(v) = value {
                                        self.declare_local(v, elem)?;
                                    }
                                    if let Some(okv) = ok {
                                        self.declare_local(okv, Type::basic(BasicKind::Bool))?;
                                    }
                                } else {
                                    if let Some(v) = value {
                                        let vi = self.check_ident_use(v)?;
                                        if let Some(t) = &vi.typ {
                                            if !self.assignable_type(&elem, t) {
                                                return self.err(
                                                    v.pos,
                                                    format!(
                                                        "cannot use value of type {} as {} value",
                                                        elem, t
                                                    ),
                                                );
                                            }
                                        }
                                    }
                                    if let Some(okv) = ok {
                                        self.check_ident_use(okv)?;
                                    }
                                }
                            }
                            SelectComm::Default => {}
                        }
                        self.check_block_flat(&case.body)
                    })();
                    self.scopes.pop();
                    result?;
                }
                Ok(())
            }
            StmtKind::Return(values) => self.check_return(values, s.pos),
            StmtKind::Break => {
                if self.loop_depth == 0 && self.switch_depth == 0 {
                    return self.err(s.pos, "break is not in a loop, switch or select");
                }
                Ok(())
            }
            StmtKind::Continue => {
                if self.loop_depth == 0 {
                    return self.err(s.pos, "continue is not in a loop");
                }
                Ok(())
            }
            StmtKind::Fallthrough => {
                if self.switch_depth == 0 {
                    return self.err(s.pos, "fallthrough statement out of place");
                }
                Ok(())
            }
            StmtKind::Go(call) => {
                if self.disallow_go_stmt {
                    return self.err(s.pos, "\"go\" statement not available");
                }
                self.check_go_defer_call(call, "go")
            }
            StmtKind::Defer(call) => self.check_go_defer_call(call, "defer"),
        }
    }

    /// Checks case-body statements without opening another scope (the
    /// caller already scoped the case).
    fn check_block_flat(&mut self, body: &[Stmt]) -> Result<(), CheckError> {
        body.iter().try_for_each(|s| self.check_stmt(s))
    }

    fn check_ident_use(
        &mut self,
        id: &vela_syntax::ast::Ident,
    ) -> Result<super::type_info::ExprInfo, CheckError> {
        let e = Expr {
            id: id.id,
            kind: ExprKind::Ident(id.clone()),
            pos: id.pos,
        };
        self.check_expr(&e, None)
    }

    fn check_bool_cond(&mut self, cond: &Expr) -> Result<(), CheckError> {
        let ci = self.check_expr(cond, None)?;
        let ok = match (&ci.typ, &ci.value) {
            (Some(t), _) => t.basic_kind() == Some(BasicKind::Bool),
            (None, Some(v)) => v.kind() == crate::constant::ConstKind::Bool,
            _ => false,
        };
        if !ok {
            return self.err(
                cond.pos,
                format!("non-boolean condition {}", describe(&ci)),
            );
        }
        Ok(())
    }

    fn check_local_const(
        &mut self,
        cd: &vela_syntax::ast::ConstDecl,
        pos: Position,
    ) -> Result<(), CheckError> {
        self.iota = Some(cd.iota as i64);
        let result = (|| {
            if cd.values.len() != cd.names.len() {
                return self.err(pos, "assignment mismatch in const declaration");
            }
            let declared = match &cd.typ {
                Some(t) => Some(self.check_type_expr(t)?),
                None => None,
            };
            for (name, value) in cd.names.iter().zip(&cd.values) {
                let vi = self.check_expr(value, declared.as_ref())?;
                let cv = match &vi.value {
                    Some(cv) => cv.clone(),
                    None => {
                        return self.err(value.pos, "const initializer is not a constant")
                    }
                };
                let typ = match &declared {
                    Some(t) => {
                        if !cv.representable(t) {
                            return self
                                .err(value.pos, format!("constant {} overflows {}", cv, t));
                        }
                        Some(t.clone())
                    }
                    None => vi.typ.clone(),
                };
                if name.is_blank() {
                    continue;
                }
                let entry = ScopeEntry {
                    entity: Entity::Const { value: cv, typ },
                    pos: name.pos,
                    fn_depth: self.fn_depth,
                };
                if self.scopes.declare(&name.name, entry).is_err() {
                    return self
                        .err(name.pos, format!("{} redeclared in this block", name.name));
                }
            }
            Ok(())
        })();
        self.iota = None;
        result
    }

    fn check_for_range(
        &mut self,
        stmt: &vela_syntax::ast::ForRangeStmt,
        pos: Position,
    ) -> Result<(), CheckError> {
        self.scopes.push();
        self.loop_depth += 1;
        let result = (|| {
            let ei = self.check_expr(&stmt.expr, None)?;
            let et = match &ei.typ {
                Some(t) => Type::underlying(t),
                None => return self.err(stmt.expr.pos, "cannot range over nil"),
            };
            let (key_t, val_t): (TypeHandle, Option<TypeHandle>) = match &*et {
                Type::Slice(elem) => (Type::basic(BasicKind::Int), Some(elem.clone())),
                Type::Array(_, elem) => (Type::basic(BasicKind::Int), Some(elem.clone())),
                Type::Basic(BasicKind::String) => (
                    Type::basic(BasicKind::Int),
                    Some(Type::basic(BasicKind::Int32)),
                ),
                Type::Map(k, v) => (k.clone(), Some(v.clone())),
                Type::Chan(dir, elem) => {
                    if *dir == ChanDir::SendOnly {
                        return self.err(
                            stmt.expr.pos,
                            "invalid operation: range over send-only channel",
                        );
                    }
                    if stmt.value.is_some() {
                        return self.err(
                            pos,
                            "range over channel permits only one iteration variable",
                        );
                    }
                    (elem.clone(), None)
                }
                _ => {
                    return self.err(
                        stmt.expr.pos,
                        format!("cannot range over {}", describe(&ei)),
                    )
                }
            };
            if stmt.define {
                if let Some(key) = &stmt.key {
                    self.declare_local(key, key_t)?;
                }
                if let Some(value) = &stmt.value {
                    self.declare_local(value, val_t.expect("value type"))?;
                }
            } else {
                if let Some(key) = &stmt.key {
                    self.check_ident_use(key)?;
                }
                if let Some(value) = &stmt.value {
                    self.check_ident_use(value)?;
                }
            }
            self.check_block(&stmt.body)
        })();
        self.loop_depth -= 1;
        self.scopes.pop();
        result
    }

    fn check_return(&mut self, values: &[Expr], pos: Position) -> Result<(), CheckError> {
        let results = self
            .results
            .last()
            .cloned()
            .unwrap_or_default();
        if values.is_empty() {
            if results.is_empty() {
                return Ok(());
            }
            return self.err(pos, "not enough return values");
        }
        // return f() forwarding a multi-valued call.
        if values.len() == 1 && results.len() > 1 {
            let vi = self.check_expr(&values[0], None)?;
            match &vi.multi {
                Some(types) if types.len() == results.len() => {
                    for (t, r) in types.iter().zip(&results) {
                        if !self.assignable_type(t, r) {
                            return self.err(
                                values[0].pos,
                                format!("cannot use {} as {} in return", t, r),
                            );
                        }
                    }
                    return Ok(());
                }
                _ => return self.err(pos, "not enough return values"),
            }
        }
        if values.len() != results.len() {
            return self.err(
                pos,
                if values.len() < results.len() {
                    "not enough return values"
                } else {
                    "too many return values"
                },
            );
        }
        for (v, r) in values.iter().zip(&results) {
            let vi = self.check_expr(v, Some(r))?;
            self.check_assignable(&vi, r, v.pos)?;
        }
        Ok(())
    }

    fn check_go_defer_call(&mut self, call: &Expr, what: &str) -> Result<(), CheckError> {
        match &call.kind {
            ExprKind::Call(inner) => {
                let fi = self.check_expr(&inner.fun, None)?;
                if fi.properties.has(super::type_info::Properties::IS_BUILTIN) {
                    return self.err(
                        call.pos,
                        format!("{} of builtin function is not supported", what),
                    );
                }
                if fi.is_type() {
                    return self.err(call.pos, format!("{} requires function call", what));
                }
                self.check_expr(call, None)?;
                Ok(())
            }
            _ => self.err(
                call.pos,
                format!("expression in {} must be function call", what),
            ),
        }
    }
}

fn is_nil_type_expr(t: &vela_syntax::ast::TypeExpr) -> bool {
    matches!(&t.kind, TypeExprKind::Name(id) if id.name == "nil")
}

/// Conservative termination analysis for the missing-return check: a
/// block terminates when its last statement is a return, a panic call, an
/// infinite for, or an if/else (or switch with default) whose branches
/// all terminate.
pub fn terminates(body: &[Stmt]) -> bool {
    let last = match body.last() {
        Some(s) => s,
        None => return false,
    };
    match &last.kind {
        StmtKind::Return(_) => true,
        StmtKind::Expr(e) => is_panic_call(e),
        StmtKind::Block(inner) => terminates(inner),
        StmtKind::If(stmt) => match &stmt.els {
            Some(els) => {
                terminates(&stmt.then)
                    && match &els.kind {
                        StmtKind::Block(inner) => terminates(inner),
                        StmtKind::If(_) => terminates(std::slice::from_ref(els)),
                        _ => false,
                    }
            }
            None => false,
        },
        StmtKind::For(stmt) => stmt.cond.is_none() && !has_break(&stmt.body),
        StmtKind::Switch(stmt) => {
            stmt.cases.iter().any(|c| c.values.is_empty())
                && stmt
                    .cases
                    .iter()
                    .all(|c| terminates(&c.body) && !has_break(&c.body))
        }
        _ => false,
    }
}

fn is_panic_call(e: &Expr) -> bool {
    match &e.kind {
        ExprKind::Call(call) => {
            matches!(&call.fun.kind, ExprKind::Ident(id) if id.name == "panic")
        }
        _ => false,
    }
}

fn has_break(body: &[Stmt]) -> bool {
    body.iter().any(|s| match &s.kind {
        StmtKind::Break => true,
        StmtKind::If(stmt) => {
            has_break(&stmt.then)
                || stmt
                    .els
                    .as_ref()
                    .map(|e| has_break(std::slice::from_ref(e)))
                    .unwrap_or(false)
        }
        StmtKind::Block(inner) => has_break(inner),
        _ => false,
    })
}
