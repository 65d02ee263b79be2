//! Assignment checking: the five shapes.
//!
//! `var` declarations with and without initializers are handled by
//! `check_var_decl_types`; this module covers assignment statements:
//! plain `=`, short `:=`, compound `op=`, `++`/`--`, multi-value calls on
//! the right-hand side, and the comma-ok forms of type assertions, map
//! indexing and channel receives.

use vela_common::Position;
use vela_runtime::types::{BasicKind, Type, TypeHandle};
use vela_syntax::ast::{AssignStmt, Expr, ExprKind};
use vela_syntax::op::{AssignOp, IncDecOp};

use super::errors::CheckError;
use super::type_info::{ExprInfo, TypeInfo};
use super::Checker;

/// The comma-ok right-hand shapes; the second variable is always an
/// untyped bool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommaOk {
    TypeAssert,
    MapIndex,
    Receive,
}

/// Classifies an expression as a comma-ok source, using the checked base
/// type to distinguish map indexing from slice indexing.
pub fn comma_ok_shape(e: &Expr, info: &TypeInfo) -> Option<CommaOk> {
    match &e.kind {
        ExprKind::TypeAssert(_, _) => Some(CommaOk::TypeAssert),
        ExprKind::Receive(_) => Some(CommaOk::Receive),
        ExprKind::Index(base, _) => {
            let bi = info.exprs.get(&base.id)?;
            match bi.typ.as_ref().map(Type::underlying).as_deref() {
                Some(Type::Map(_, _)) => Some(CommaOk::MapIndex),
                _ => None,
            }
        }
        ExprKind::Paren(inner) => comma_ok_shape(inner, info),
        _ => None,
    }
}

impl Checker<'_> {
    pub(crate) fn check_assign_stmt(
        &mut self,
        a: &AssignStmt,
        pos: Position,
    ) -> Result<(), CheckError> {
        match a.op {
            AssignOp::Define => self.check_define(a, pos),
            AssignOp::Assign => self.check_plain_assign(a, pos),
            AssignOp::Compound(op) => {
                if a.lhs.len() != 1 || a.rhs.len() != 1 {
                    return self.err(pos, "compound assignment needs one expression on each side");
                }
                let li = self.check_assign_target(&a.lhs[0])?;
                let lt = match &li.typ {
                    Some(t) => t.clone(),
                    None => return self.err(a.lhs[0].pos, "cannot assign to nil"),
                };
                // Checked as the rewritten plain assignment of a binary
                // expression.
                let ri = self.check_expr(&a.rhs[0], Some(&lt))?;
                self.check_assignable(&ri, &lt, a.rhs[0].pos)?;
                let kind = lt.basic_kind();
                let valid = match op {
                    vela_syntax::op::BinaryOp::Add => kind
                        .map(|k| k.is_numeric() || k == BasicKind::String)
                        .unwrap_or(false),
                    vela_syntax::op::BinaryOp::Sub
                    | vela_syntax::op::BinaryOp::Mul
                    | vela_syntax::op::BinaryOp::Div => {
                        kind.map(|k| k.is_numeric()).unwrap_or(false)
                    }
                    vela_syntax::op::BinaryOp::Shl | vela_syntax::op::BinaryOp::Shr => {
                        kind.map(|k| k.is_integer()).unwrap_or(false)
                    }
                    _ => kind.map(|k| k.is_integer()).unwrap_or(false),
                };
                if !valid {
                    return self.err(
                        pos,
                        format!("invalid operation: operator {}= not defined on {}", op, lt),
                    );
                }
                Ok(())
            }
        }
    }

    pub(crate) fn check_inc_dec(
        &mut self,
        e: &Expr,
        _op: IncDecOp,
        pos: Position,
    ) -> Result<(), CheckError> {
        let li = self.check_assign_target(e)?;
        match li.typ.as_ref().and_then(|t| t.basic_kind()) {
            Some(k) if k.is_numeric() => Ok(()),
            _ => self.err(pos, "invalid operation: ++/-- operand must be numeric"),
        }
    }

    fn check_define(&mut self, a: &AssignStmt, pos: Position) -> Result<(), CheckError> {
        // All left-hand sides must be (possibly blank) identifiers.
        let mut names = Vec::with_capacity(a.lhs.len());
        for lhs in &a.lhs {
            match &lhs.kind {
                ExprKind::Ident(id) => names.push(id),
                _ => return self.err(lhs.pos, "non-name on left side of :="),
            }
        }
        for (i, n) in names.iter().enumerate() {
            if !n.is_blank() && names[..i].iter().any(|m| m.name == n.name) {
                return self.err(n.pos, format!("{} repeated on left side of :=", n.name));
            }
        }

        let types = self.define_rhs_types(a, pos)?;
        debug_assert_eq!(types.len(), names.len());

        let mut new_count = 0;
        for (n, t) in names.iter().zip(types) {
            if n.is_blank() {
                continue;
            }
            if self.scopes.declared_in_innermost(&n.name) {
                // Existing variable in the same block: plain assignment.
                let entry = self.scopes.lookup(&n.name).unwrap().clone();
                self.info.uses.insert(n.id, entry.entity.clone());
                let li = self.entity_info(&entry.entity, n.pos)?;
                match &li.typ {
                    Some(lt) if self.assignable_type(&t, lt) => {}
                    Some(lt) => {
                        return self.err(
                            n.pos,
                            format!("cannot use value of type {} as {} value", t, lt),
                        )
                    }
                    None => return self.err(n.pos, "cannot assign to non-variable"),
                }
            } else {
                new_count += 1;
                self.declare_local(n, t)?;
            }
        }
        if new_count == 0 {
            return self.err(pos, "no new variables on left side of :=");
        }
        Ok(())
    }

    /// Resolves the per-name types of the right-hand side of `:=`,
    /// covering the comma-ok and multi-value shapes.
    fn define_rhs_types(
        &mut self,
        a: &AssignStmt,
        pos: Position,
    ) -> Result<Vec<TypeHandle>, CheckError> {
        if a.rhs.len() == 1 && a.lhs.len() == 2 {
            let ri = self.check_expr(&a.rhs[0], None)?;
            if comma_ok_shape(&a.rhs[0], &self.info).is_some() {
                let t = self.default_type(&ri, a.rhs[0].pos)?;
                return Ok(vec![t, Type::basic(BasicKind::Bool)]);
            }
            return self.expand_multi(&ri, a, pos);
        }
        if a.rhs.len() == 1 && a.lhs.len() > 1 {
            let ri = self.check_expr(&a.rhs[0], None)?;
            return self.expand_multi(&ri, a, pos);
        }
        if a.rhs.len() != a.lhs.len() {
            return self.err(
                pos,
                format!(
                    "assignment mismatch: {} variables but {} values",
                    a.lhs.len(),
                    a.rhs.len()
                ),
            );
        }
        let mut out = Vec::with_capacity(a.rhs.len());
        for r in &a.rhs {
            let ri = self.check_expr(r, None)?;
            out.push(self.default_type(&ri, r.pos)?);
        }
        Ok(out)
    }

    fn expand_multi(
        &mut self,
        ri: &ExprInfo,
        a: &AssignStmt,
        pos: Position,
    ) -> Result<Vec<TypeHandle>, CheckError> {
        match &ri.multi {
            Some(types) if types.len() == a.lhs.len() => Ok(types.clone()),
            Some(types) => self.err(
                pos,
                format!(
                    "assignment mismatch: {} variables but {} values",
                    a.lhs.len(),
                    types.len()
                ),
            ),
            None => self.err(
                pos,
                format!("assignment mismatch: {} variables but 1 value", a.lhs.len()),
            ),
        }
    }

    fn check_plain_assign(&mut self, a: &AssignStmt, pos: Position) -> Result<(), CheckError> {
        // Comma-ok: x, ok = <source>
        if a.rhs.len() == 1 && a.lhs.len() == 2 {
            let ri = self.check_expr(&a.rhs[0], None)?;
            if comma_ok_shape(&a.rhs[0], &self.info).is_some() {
                let vt = self.default_type(&ri, a.rhs[0].pos)?;
                self.assign_one(&a.lhs[0], &vt)?;
                self.assign_one(&a.lhs[1], &Type::basic(BasicKind::Bool))?;
                return Ok(());
            }
            return self.assign_multi(&ri, a, pos);
        }
        if a.rhs.len() == 1 && a.lhs.len() > 1 {
            let ri = self.check_expr(&a.rhs[0], None)?;
            return self.assign_multi(&ri, a, pos);
        }
        if a.rhs.len() != a.lhs.len() {
            return self.err(
                pos,
                format!(
                    "assignment mismatch: {} variables but {} values",
                    a.lhs.len(),
                    a.rhs.len()
                ),
            );
        }
        for (lhs, rhs) in a.lhs.iter().zip(&a.rhs) {
            if is_blank(lhs) {
                self.check_expr(rhs, None)?;
                continue;
            }
            let li = self.check_assign_target(lhs)?;
            let lt = match &li.typ {
                Some(t) => t.clone(),
                None => return self.err(lhs.pos, "cannot assign"),
            };
            let ri = self.check_expr(rhs, Some(&lt))?;
            self.check_assignable(&ri, &lt, rhs.pos)?;
        }
        Ok(())
    }

    fn assign_multi(
        &mut self,
        ri: &ExprInfo,
        a: &AssignStmt,
        pos: Position,
    ) -> Result<(), CheckError> {
        let types = self.expand_multi(ri, a, pos)?;
        for (lhs, t) in a.lhs.iter().zip(types) {
            self.assign_one(lhs, &t)?;
        }
        Ok(())
    }

    fn assign_one(&mut self, lhs: &Expr, t: &TypeHandle) -> Result<(), CheckError> {
        if is_blank(lhs) {
            return Ok(());
        }
        let li = self.check_assign_target(lhs)?;
        match &li.typ {
            Some(lt) if self.assignable_type(t, lt) => Ok(()),
            Some(lt) => self.err(
                lhs.pos,
                format!("cannot use value of type {} as {} value", t, lt),
            ),
            None => self.err(lhs.pos, "cannot assign"),
        }
    }

    /// Checks an assignment target: an addressable expression or a map
    /// index.
    pub(crate) fn check_assign_target(&mut self, lhs: &Expr) -> Result<ExprInfo, CheckError> {
        let li = self.check_expr(lhs, None)?;
        if li.is_addressable() || is_map_index(lhs, &self.info) {
            return Ok(li);
        }
        self.err(lhs.pos, "cannot assign to expression")
    }
}

pub(crate) fn is_blank(e: &Expr) -> bool {
    matches!(&e.kind, ExprKind::Ident(id) if id.is_blank())
}

fn is_map_index(e: &Expr, info: &TypeInfo) -> bool {
    match &e.kind {
        ExprKind::Index(base, _) => matches!(
            info.exprs
                .get(&base.id)
                .and_then(|bi| bi.typ.as_ref())
                .map(Type::underlying)
                .as_deref(),
            Some(Type::Map(_, _))
        ),
        ExprKind::Paren(inner) => is_map_index(inner, info),
        _ => false,
    }
}
