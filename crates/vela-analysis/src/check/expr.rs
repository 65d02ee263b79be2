//! Expression checking.

use vela_common::Position;
use vela_runtime::package::NativeDecl;
use vela_runtime::types::{BasicKind, Type, TypeHandle};
use vela_syntax::ast::{CompositeLit, Expr, ExprKind, FuncLit, Ident, NodeId};
use vela_syntax::op::{BinaryOp, UnaryOp};

use super::errors::CheckError;
use super::type_info::{Capture, Entity, ExprInfo, Properties};
use super::{describe, Checker};
use crate::constant::{self, ConstKind, ConstValue};
use crate::scope::ScopeEntry;
use crate::universe::{self, Builtin};

impl Checker<'_> {
    /// Checks an expression and records its info. `hint` is the type the
    /// context will assign the value to, used to type untyped constants
    /// and to elide composite literal types.
    pub(crate) fn check_expr(
        &mut self,
        e: &Expr,
        hint: Option<&TypeHandle>,
    ) -> Result<ExprInfo, CheckError> {
        let info = self.check_expr_inner(e, hint)?;
        Ok(self.record(e.id, info))
    }

    fn check_expr_inner(
        &mut self,
        e: &Expr,
        hint: Option<&TypeHandle>,
    ) -> Result<ExprInfo, CheckError> {
        match &e.kind {
            ExprKind::Ident(id) => self.check_ident(id),
            ExprKind::IntLit(lit) => match ConstValue::parse_int(lit) {
                Some(v) => Ok(ExprInfo::constant(v, None)),
                None => self.err(e.pos, format!("malformed integer literal {}", lit)),
            },
            ExprKind::FloatLit(lit) => match ConstValue::parse_float(lit) {
                Some(v) => Ok(ExprInfo::constant(v, None)),
                None => self.err(e.pos, format!("malformed float literal {}", lit)),
            },
            ExprKind::StringLit(s) => Ok(ExprInfo::constant(ConstValue::Str(s.clone()), None)),
            ExprKind::RuneLit(c) => Ok(ExprInfo::constant(ConstValue::Int64(*c as i64), None)),
            ExprKind::TypeLit(t) => {
                let typ = self.check_type_expr(t)?;
                Ok(ExprInfo {
                    typ: Some(typ),
                    properties: Properties::IS_TYPE,
                    ..Default::default()
                })
            }
            ExprKind::Paren(inner) => self.check_expr(inner, hint),
            ExprKind::Unary(op, operand) => self.check_unary(e.pos, *op, operand),
            ExprKind::Binary(op, l, r) => self.check_binary(e.pos, *op, l, r),
            ExprKind::Call(call) => self.check_call(e, call),
            ExprKind::Index(base, index) => self.check_index(e.pos, base, index),
            ExprKind::Slicing(s) => self.check_slicing(e.pos, s),
            ExprKind::Selector(base, field) => self.check_selector(e, base, field),
            ExprKind::TypeAssert(base, asserted) => {
                let bi = self.check_expr(base, None)?;
                let bt = match &bi.typ {
                    Some(t) if t.is_interface() => t.clone(),
                    Some(t) => {
                        return self.err(
                            e.pos,
                            format!("invalid type assertion: {} is not an interface", t),
                        )
                    }
                    None => return self.err(e.pos, "use of untyped nil"),
                };
                let _ = bt;
                let asserted = match asserted {
                    Some(t) => t,
                    None => {
                        return self.err(e.pos, "use of .(type) outside type switch")
                    }
                };
                let typ = self.check_type_expr(asserted)?;
                Ok(ExprInfo::value_of(typ))
            }
            ExprKind::Receive(ch) => {
                let ci = self.check_expr(ch, None)?;
                match ci.typ.as_ref().map(Type::underlying) {
                    Some(t) => match &*t {
                        Type::Chan(dir, elem) => {
                            if *dir == vela_runtime::types::ChanDir::SendOnly {
                                return self.err(
                                    e.pos,
                                    "invalid operation: receive from send-only channel",
                                );
                            }
                            Ok(ExprInfo::value_of(elem.clone()))
                        }
                        _ => self.err(
                            e.pos,
                            format!("invalid operation: cannot receive from {}", describe(&ci)),
                        ),
                    },
                    None => self.err(e.pos, "use of untyped nil"),
                }
            }
            ExprKind::Composite(lit) => self.check_composite(e.pos, lit, hint),
            ExprKind::FuncLit(fl) => self.check_func_lit(fl),
        }
    }

    fn check_ident(&mut self, id: &Ident) -> Result<ExprInfo, CheckError> {
        if id.is_blank() {
            return self.err(id.pos, "cannot use _ as value");
        }
        if let Some(entry) = self.scopes.lookup(&id.name) {
            let entry = entry.clone();
            self.note_capture(&entry);
            let entity = entry.entity.clone();
            self.info.uses.insert(id.id, entity.clone());
            return self.entity_info(&entity, id.pos);
        }
        // Universe block.
        if let Some(typ) = universe::type_for_name(&id.name) {
            self.info.uses.insert(id.id, Entity::TypeName(typ.clone()));
            return Ok(ExprInfo {
                typ: Some(typ),
                properties: Properties::IS_TYPE,
                ..Default::default()
            });
        }
        match id.name.as_str() {
            "true" | "false" => {
                let v = ConstValue::Bool(id.name == "true");
                self.info.uses.insert(
                    id.id,
                    Entity::Const {
                        value: v.clone(),
                        typ: None,
                    },
                );
                return Ok(ExprInfo::constant(v, None));
            }
            "nil" => {
                self.info.uses.insert(id.id, Entity::Nil);
                return Ok(ExprInfo::default());
            }
            "iota" => {
                return match self.iota {
                    Some(i) => {
                        let v = ConstValue::Int64(i);
                        self.info.uses.insert(
                            id.id,
                            Entity::Const {
                                value: v.clone(),
                                typ: None,
                            },
                        );
                        Ok(ExprInfo::constant(v, None))
                    }
                    None => self.err(id.pos, "cannot use iota outside constant declaration"),
                };
            }
            _ => {}
        }
        if let Some(b) = Builtin::lookup(&id.name) {
            self.info.uses.insert(id.id, Entity::Builtin(b));
            return Ok(ExprInfo {
                properties: Properties::IS_BUILTIN,
                ..Default::default()
            });
        }
        // Scripts may auto-import from the root manifest, one level deep.
        if self.script {
            if let Some(root) = self.packages.get("") {
                if let Some(NativeDecl::Package(p)) = root.lookup(&id.name) {
                    let path = id.name.clone();
                    let entry = ScopeEntry {
                        entity: Entity::Package { path: path.clone() },
                        pos: id.pos,
                        fn_depth: 0,
                    };
                    self.scopes.redeclare_package(&id.name, entry);
                    // Auto-imported packages register under their name.
                    let _ = p;
                    self.info
                        .uses
                        .insert(id.id, Entity::Package { path });
                    return Ok(ExprInfo {
                        properties: Properties::IS_PACKAGE,
                        ..Default::default()
                    });
                }
            }
        }
        self.err(id.pos, format!("undefined: {}", id.name))
    }

    /// When a local declared in an outer function is referenced, every
    /// function literal between the declaration and the use captures it.
    fn note_capture(&mut self, entry: &ScopeEntry) {
        let decl = match &entry.entity {
            Entity::Local { decl } => *decl,
            _ => return,
        };
        if entry.fn_depth == 0 || entry.fn_depth >= self.fn_depth {
            return;
        }
        self.info.captured.insert(decl);
        let lits: Vec<(NodeId, usize)> = self
            .lits
            .iter()
            .filter(|(_, d)| *d > entry.fn_depth)
            .copied()
            .collect();
        for (lit, depth) in lits {
            let cap = Capture {
                decl,
                from_parent_frame: depth == entry.fn_depth + 1,
            };
            let list = self.info.captures.entry(lit).or_default();
            if !list.contains(&cap) {
                list.push(cap);
            }
        }
    }

    pub(crate) fn entity_info(
        &mut self,
        entity: &Entity,
        pos: Position,
    ) -> Result<ExprInfo, CheckError> {
        Ok(match entity {
            Entity::Local { decl } => {
                let def = self.info.defs.get(decl).expect("local without definition");
                ExprInfo::addressable_value(def.typ.clone())
            }
            Entity::Global { index } => {
                ExprInfo::addressable_value(self.globals[*index as usize].typ.clone())
            }
            Entity::Func { name } => {
                let sig = self
                    .func_sigs
                    .get(name)
                    .expect("function without signature")
                    .clone();
                ExprInfo::value_of(sig)
            }
            Entity::NativeFunc(nf) => ExprInfo {
                typ: Some(nf.sig.clone()),
                properties: Properties::IS_NATIVE.with(Properties::HAS_VALUE),
                native_pkg: Some(nf.pkg.clone()),
                ..Default::default()
            },
            Entity::Const { value, typ } => ExprInfo::constant(value.clone(), typ.clone()),
            Entity::Builtin(_) => ExprInfo {
                properties: Properties::IS_BUILTIN,
                ..Default::default()
            },
            Entity::TypeName(typ) => ExprInfo {
                typ: Some(typ.clone()),
                properties: Properties::IS_TYPE,
                ..Default::default()
            },
            Entity::Package { .. } => ExprInfo {
                properties: Properties::IS_PACKAGE,
                ..Default::default()
            },
            Entity::Nil => {
                let _ = pos;
                ExprInfo::default()
            }
        })
    }

    fn check_unary(
        &mut self,
        pos: Position,
        op: UnaryOp,
        operand: &Expr,
    ) -> Result<ExprInfo, CheckError> {
        if op == UnaryOp::Addr {
            return self.check_addr(pos, operand);
        }
        let oi = self.check_expr(operand, None)?;
        if let Some(v) = &oi.value {
            return match constant::unary(op, v) {
                Ok(folded) => Ok(ExprInfo::constant(folded, oi.typ.clone())),
                Err(err) => self.err(pos, err.to_string()),
            };
        }
        let typ = match &oi.typ {
            Some(t) => t.clone(),
            None => return self.err(pos, "use of untyped nil"),
        };
        match op {
            UnaryOp::Neg | UnaryOp::Pos => match typ.basic_kind() {
                Some(k) if k.is_numeric() => Ok(ExprInfo::value_of(typ)),
                _ => self.err(
                    pos,
                    format!("invalid operation: operator {} not defined on {}", op, typ),
                ),
            },
            UnaryOp::Not => match typ.basic_kind() {
                Some(BasicKind::Bool) => Ok(ExprInfo::value_of(typ)),
                _ => self.err(
                    pos,
                    format!("invalid operation: operator ! not defined on {}", typ),
                ),
            },
            UnaryOp::BitNot => match typ.basic_kind() {
                Some(k) if k.is_integer() => Ok(ExprInfo::value_of(typ)),
                _ => self.err(
                    pos,
                    format!("invalid operation: operator ^ not defined on {}", typ),
                ),
            },
            UnaryOp::Deref => match &*Type::underlying(&typ) {
                Type::Pointer(elem) => Ok(ExprInfo::addressable_value(elem.clone())),
                _ => self.err(pos, format!("invalid operation: cannot indirect {}", typ)),
            },
            UnaryOp::Addr => unreachable!(),
        }
    }

    /// `&x` for an addressable identifier (the variable moves into a
    /// shared cell) or a composite literal.
    fn check_addr(&mut self, pos: Position, operand: &Expr) -> Result<ExprInfo, CheckError> {
        match &operand.kind {
            ExprKind::Ident(id) => {
                let oi = self.check_expr(operand, None)?;
                if !oi.is_addressable() {
                    return self.err(pos, format!("cannot take the address of {}", id.name));
                }
                // A local whose address escapes lives in a cell.
                if let Some(Entity::Local { decl }) = self.info.uses.get(&id.id) {
                    self.info.captured.insert(*decl);
                }
                Ok(ExprInfo::value_of(Type::pointer(oi.typ.unwrap())))
            }
            ExprKind::Composite(_) => {
                let oi = self.check_expr(operand, None)?;
                Ok(ExprInfo::value_of(Type::pointer(oi.typ.unwrap())))
            }
            _ => self.err(pos, "cannot take the address of expression"),
        }
    }

    fn check_binary(
        &mut self,
        pos: Position,
        op: BinaryOp,
        l: &Expr,
        r: &Expr,
    ) -> Result<ExprInfo, CheckError> {
        let li = self.check_expr(l, None)?;
        let ri = self.check_expr(r, None)?;

        // Both constant: fold at arbitrary precision.
        if let (Some(lv), Some(rv)) = (&li.value, &ri.value) {
            if op.is_shift() {
                return match constant::binary(op, lv, rv) {
                    Ok(v) => Ok(ExprInfo::constant(v, li.typ.clone())),
                    Err(err) => self.err(pos, err.to_string()),
                };
            }
            if op.is_comparison() {
                return match constant::compare(op, lv, rv) {
                    Ok(b) => Ok(ExprInfo::constant(ConstValue::Bool(b), None)),
                    Err(err) => self.err(pos, err.to_string()),
                };
            }
            // Typed constants must agree; untyped mix by kind.
            if let (Some(lt), Some(rt)) = (&li.typ, &ri.typ) {
                if !Type::identical(lt, rt) {
                    return self.err(
                        pos,
                        format!("invalid operation: mismatched types {} and {}", lt, rt),
                    );
                }
            }
            return match constant::binary(op, lv, rv) {
                Ok(v) => Ok(ExprInfo::constant(v, li.typ.clone().or(ri.typ.clone()))),
                Err(err) => self.err(pos, err.to_string()),
            };
        }

        if op.is_logical() {
            for (i, x) in [(&li, l), (&ri, r)] {
                let ok = i
                    .typ
                    .as_ref()
                    .map(|t| t.basic_kind() == Some(BasicKind::Bool))
                    .unwrap_or(i.value.as_ref().map(|v| v.kind() == ConstKind::Bool).unwrap_or(false));
                if !ok {
                    return self.err(
                        x.pos,
                        format!("invalid operation: operator {} not defined on {}", op, describe(i)),
                    );
                }
            }
            return Ok(ExprInfo::value_of(Type::basic(BasicKind::Bool)));
        }

        if op.is_comparison() {
            return self.check_comparison(pos, op, &li, &ri);
        }

        if op.is_shift() {
            let lt = self.operand_type(&li, l.pos)?;
            if lt.basic_kind().map(|k| k.is_integer()) != Some(true) {
                return self.err(l.pos, "shifted operand must be integer");
            }
            if let Some(rv) = &ri.value {
                match rv.to_i64() {
                    Some(n) if n >= 0 => {}
                    _ => return self.err(r.pos, "shift count must not be negative"),
                }
            } else if ri.typ.as_ref().and_then(|t| t.basic_kind()).map(|k| k.is_integer())
                != Some(true)
            {
                return self.err(r.pos, "shift count must be an integer");
            }
            return Ok(ExprInfo::value_of(lt));
        }

        // Arithmetic (and string +).
        let (lt, rt) = (self.operand_type(&li, l.pos)?, self.operand_type(&ri, r.pos)?);
        let typ = if li.is_untyped() || li.value.is_some() && li.typ.is_none() {
            self.const_fits(&li, &rt, l.pos)?;
            rt.clone()
        } else if ri.is_untyped() || ri.value.is_some() && ri.typ.is_none() {
            self.const_fits(&ri, &lt, r.pos)?;
            lt.clone()
        } else if Type::identical(&lt, &rt) {
            lt.clone()
        } else {
            return self.err(
                pos,
                format!("invalid operation: mismatched types {} and {}", lt, rt),
            );
        };
        let kind = match typ.basic_kind() {
            Some(k) => k,
            None => {
                return self.err(
                    pos,
                    format!("invalid operation: operator {} not defined on {}", op, typ),
                )
            }
        };
        let valid = match op {
            BinaryOp::Add => kind.is_numeric() || kind == BasicKind::String,
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => kind.is_numeric(),
            BinaryOp::Rem
            | BinaryOp::BitAnd
            | BinaryOp::BitOr
            | BinaryOp::BitXor
            | BinaryOp::AndNot => kind.is_integer(),
            _ => false,
        };
        if !valid {
            return self.err(
                pos,
                format!("invalid operation: operator {} not defined on {}", op, typ),
            );
        }
        Ok(ExprInfo::value_of(typ))
    }

    fn check_comparison(
        &mut self,
        pos: Position,
        op: BinaryOp,
        li: &ExprInfo,
        ri: &ExprInfo,
    ) -> Result<ExprInfo, CheckError> {
        let bool_t = Type::basic(BasicKind::Bool);
        // nil comparisons need a nilable counterpart.
        if li.is_nil() || ri.is_nil() {
            let other = if li.is_nil() { ri } else { li };
            if op != BinaryOp::Eq && op != BinaryOp::Ne {
                return self.err(pos, "invalid operation: operator not defined on nil");
            }
            match &other.typ {
                Some(t) if t.is_nilable() => return Ok(ExprInfo::value_of(bool_t)),
                Some(t) => {
                    return self.err(
                        pos,
                        format!("invalid operation: cannot compare {} with nil", t),
                    )
                }
                None => {
                    return self.err(pos, "invalid operation: operator not defined on nil")
                }
            }
        }
        let lt = self.operand_type(li, pos)?;
        let rt = self.operand_type(ri, pos)?;
        let comparable = self.assignable_type(&lt, &rt)
            || self.assignable_type(&rt, &lt)
            || li.is_untyped()
            || ri.is_untyped();
        if !comparable {
            return self.err(
                pos,
                format!("invalid operation: mismatched types {} and {}", lt, rt),
            );
        }
        if op.is_ordering() {
            let ordered = lt
                .basic_kind()
                .map(|k| k.is_numeric() || k == BasicKind::String)
                .unwrap_or(false);
            if !ordered {
                return self.err(
                    pos,
                    format!("invalid operation: operator {} not defined on {}", op, lt),
                );
            }
        } else if !Type::comparable(&lt) && !lt.is_interface() {
            return self.err(
                pos,
                format!("invalid operation: {} cannot be compared", lt),
            );
        }
        Ok(ExprInfo::value_of(bool_t))
    }

    fn check_index(
        &mut self,
        pos: Position,
        base: &Expr,
        index: &Expr,
    ) -> Result<ExprInfo, CheckError> {
        let bi = self.check_expr(base, None)?;
        let bt = match &bi.typ {
            Some(t) => Type::underlying(t),
            None => return self.err(pos, "use of untyped nil"),
        };
        match &*bt {
            Type::Map(key, value) => {
                let ki = self.check_expr(index, Some(key))?;
                self.check_assignable(&ki, key, index.pos)?;
                Ok(ExprInfo::value_of(value.clone()))
            }
            Type::Slice(elem) => {
                self.check_int_index(index)?;
                Ok(ExprInfo::addressable_value(elem.clone()))
            }
            Type::Array(_, elem) => {
                self.check_int_index(index)?;
                let mut info = ExprInfo::value_of(elem.clone());
                if bi.is_addressable() {
                    info.properties = info.properties.with(Properties::ADDRESSABLE);
                }
                Ok(info)
            }
            Type::Basic(BasicKind::String) => {
                self.check_int_index(index)?;
                Ok(ExprInfo::value_of(Type::basic(BasicKind::Uint8)))
            }
            _ => self.err(
                pos,
                format!("invalid operation: cannot index {}", describe(&bi)),
            ),
        }
    }

    fn check_int_index(&mut self, index: &Expr) -> Result<(), CheckError> {
        let ii = self.check_expr(index, None)?;
        if let Some(v) = &ii.value {
            match v.to_i64() {
                Some(n) if n >= 0 => return Ok(()),
                _ => return self.err(index.pos, format!("invalid index {}", v)),
            }
        }
        match ii.typ.as_ref().and_then(|t| t.basic_kind()) {
            Some(k) if k.is_integer() => Ok(()),
            _ => self.err(index.pos, "index must be an integer"),
        }
    }

    fn check_slicing(
        &mut self,
        pos: Position,
        s: &vela_syntax::ast::SlicingExpr,
    ) -> Result<ExprInfo, CheckError> {
        let bi = self.check_expr(&s.expr, None)?;
        if let Some(low) = &s.low {
            self.check_int_index(low)?;
        }
        if let Some(high) = &s.high {
            self.check_int_index(high)?;
        }
        let bt = match &bi.typ {
            Some(t) => Type::underlying(t),
            None => return self.err(pos, "use of untyped nil"),
        };
        match &*bt {
            Type::Slice(_) => Ok(ExprInfo::value_of(bi.typ.unwrap())),
            Type::Array(_, elem) => {
                if !bi.is_addressable() {
                    return self.err(pos, "invalid operation: slice of unaddressable value");
                }
                Ok(ExprInfo::value_of(Type::slice(elem.clone())))
            }
            Type::Basic(BasicKind::String) => {
                Ok(ExprInfo::value_of(Type::basic(BasicKind::String)))
            }
            _ => self.err(
                pos,
                format!("invalid operation: cannot slice {}", describe(&bi)),
            ),
        }
    }

    fn check_selector(
        &mut self,
        e: &Expr,
        base: &Expr,
        field: &Ident,
    ) -> Result<ExprInfo, CheckError> {
        let bi = self.check_expr(base, None)?;

        // Package selector: resolve the declaration and record it under
        // the selector's node id for the emitter.
        if bi.is_package() {
            let path = match self.info.uses.get(&base_ident_id(base)) {
                Some(Entity::Package { path }) => path.clone(),
                _ => return self.err(base.pos, "package used without selector"),
            };
            let manifest = self
                .packages
                .get(&path)
                .expect("imported package disappeared");
            let pkg_name = manifest.name().to_string();
            let decl = match manifest.lookup(&field.name) {
                Some(d) => d,
                None => {
                    return self.err(
                        field.pos,
                        format!("undefined: {}.{}", pkg_name, field.name),
                    )
                }
            };
            let entity = self.native_decl_entity(&path, &pkg_name, &field.name, decl, field.pos)?;
            self.info.uses.insert(e.id, entity.clone());
            let mut info = self.entity_info(&entity, field.pos)?;
            info.native_pkg = Some(pkg_name);
            if matches!(entity, Entity::Global { .. }) {
                info.properties = info.properties.with(Properties::IS_NATIVE);
            }
            return Ok(info);
        }

        let bt = match &bi.typ {
            Some(t) => t.clone(),
            None => return self.err(e.pos, "use of untyped nil"),
        };
        // Method on a named type.
        if let Some(m) = bt.method(&field.name) {
            let ft = m.func.func_type();
            let bound = Type::func(
                ft.params.iter().skip(1).cloned().collect(),
                ft.results.clone(),
                ft.variadic,
            );
            return Ok(ExprInfo::value_of(bound));
        }
        // Struct field, with pointer auto-deref.
        match bt.field_index(&field.name) {
            Some((_, ft)) => {
                let through_ptr = matches!(&*Type::underlying(&bt), Type::Pointer(_));
                let mut info = ExprInfo::value_of(ft);
                if bi.is_addressable() || through_ptr {
                    info.properties = info.properties.with(Properties::ADDRESSABLE);
                }
                Ok(info)
            }
            None => self.err(
                field.pos,
                format!("type {} has no field or method {}", bt, field.name),
            ),
        }
    }

    fn check_composite(
        &mut self,
        pos: Position,
        lit: &CompositeLit,
        hint: Option<&TypeHandle>,
    ) -> Result<ExprInfo, CheckError> {
        let typ = match &lit.typ {
            Some(t) => self.check_type_expr(t)?,
            None => match hint {
                Some(t) => t.clone(),
                None => return self.err(pos, "missing type in composite literal"),
            },
        };
        match &*Type::underlying(&typ) {
            Type::Slice(elem) => {
                for el in &lit.elems {
                    if let Some(key) = &el.key {
                        let ki = self.check_expr(key, None)?;
                        if ki.value.as_ref().and_then(|v| v.to_i64()).is_none() {
                            return self.err(key.pos, "index must be a non-negative integer constant");
                        }
                    }
                    let vi = self.check_expr(&el.value, Some(elem))?;
                    self.check_assignable(&vi, elem, el.value.pos)?;
                }
                Ok(ExprInfo::value_of(typ.clone()))
            }
            Type::Array(n, elem) => {
                if lit.elems.len() > *n {
                    return self.err(
                        pos,
                        format!("array index {} out of bounds [0:{}]", lit.elems.len() - 1, n),
                    );
                }
                for el in &lit.elems {
                    let vi = self.check_expr(&el.value, Some(elem))?;
                    self.check_assignable(&vi, elem, el.value.pos)?;
                }
                Ok(ExprInfo::value_of(typ.clone()))
            }
            Type::Map(key, value) => {
                for el in &lit.elems {
                    let k = match &el.key {
                        Some(k) => k,
                        None => {
                            return self.err(el.value.pos, "missing key in map literal")
                        }
                    };
                    let ki = self.check_expr(k, Some(key))?;
                    self.check_assignable(&ki, key, k.pos)?;
                    let vi = self.check_expr(&el.value, Some(value))?;
                    self.check_assignable(&vi, value, el.value.pos)?;
                }
                Ok(ExprInfo::value_of(typ.clone()))
            }
            Type::Struct(fields) => {
                let keyed = lit.elems.iter().any(|el| el.key.is_some());
                if keyed {
                    for el in &lit.elems {
                        let key = match &el.key {
                            Some(Expr {
                                kind: ExprKind::Ident(id),
                                ..
                            }) => id,
                            _ => {
                                return self.err(
                                    el.value.pos,
                                    "invalid field name in struct literal",
                                )
                            }
                        };
                        let ft = match fields.iter().find(|f| f.name == key.name) {
                            Some(f) => f.typ.clone(),
                            None => {
                                return self.err(
                                    key.pos,
                                    format!("unknown field {} in struct literal", key.name),
                                )
                            }
                        };
                        let vi = self.check_expr(&el.value, Some(&ft))?;
                        self.check_assignable(&vi, &ft, el.value.pos)?;
                    }
                } else {
                    if !lit.elems.is_empty() && lit.elems.len() != fields.len() {
                        return self.err(
                            pos,
                            format!(
                                "too few values in struct literal (have {}, want {})",
                                lit.elems.len(),
                                fields.len()
                            ),
                        );
                    }
                    for (el, f) in lit.elems.iter().zip(fields) {
                        let vi = self.check_expr(&el.value, Some(&f.typ))?;
                        self.check_assignable(&vi, &f.typ, el.value.pos)?;
                    }
                }
                Ok(ExprInfo::value_of(typ.clone()))
            }
            _ => self.err(pos, format!("invalid composite literal type {}", typ)),
        }
    }

    fn check_func_lit(&mut self, fl: &FuncLit) -> Result<ExprInfo, CheckError> {
        let sig = self.check_func_type(&fl.typ)?;
        let ft = match &*sig {
            Type::Func(ft) => ft.clone(),
            _ => unreachable!(),
        };
        self.fn_depth += 1;
        self.lits.push((fl.id, self.fn_depth));
        self.scopes.push();
        self.declare_params(&fl.typ, &ft)?;
        self.results.push(ft.results.clone());
        let saved_loop = std::mem::take(&mut self.loop_depth);
        let result = self.check_block(&fl.body);
        self.loop_depth = saved_loop;
        self.results.pop();
        self.scopes.pop();
        self.lits.pop();
        self.fn_depth -= 1;
        result?;
        if !ft.results.is_empty() && !super::stmt::terminates(&fl.body) {
            return self.err(fl.pos, "missing return at end of function");
        }
        Ok(ExprInfo::value_of(sig))
    }

    // --- assignability and defaults ---

    pub(crate) fn operand_type(
        &self,
        info: &ExprInfo,
        pos: Position,
    ) -> Result<TypeHandle, CheckError> {
        match &info.typ {
            Some(t) => Ok(t.clone()),
            None => match &info.value {
                Some(v) => Ok(v.kind().default_type()),
                None => self.err(pos, "use of untyped nil"),
            },
        }
    }

    /// The type an expression assumes without context.
    pub(crate) fn default_type(
        &self,
        info: &ExprInfo,
        pos: Position,
    ) -> Result<TypeHandle, CheckError> {
        if info.is_type() {
            return self.err(pos, "type is not an expression value");
        }
        self.operand_type(info, pos)
    }

    /// Structural assignability between two types (without constants).
    pub(crate) fn assignable_type(&self, src: &TypeHandle, dst: &TypeHandle) -> bool {
        if Type::identical(src, dst) {
            return true;
        }
        // Identical underlying types when at most one side is named.
        let named_src = matches!(&**src, Type::Named(_));
        let named_dst = matches!(&**dst, Type::Named(_));
        if !(named_src && named_dst)
            && Type::identical(&Type::underlying(src), &Type::underlying(dst))
        {
            return true;
        }
        if dst.is_interface() {
            return Type::implements(src, dst);
        }
        false
    }

    fn const_fits(
        &self,
        info: &ExprInfo,
        typ: &TypeHandle,
        pos: Position,
    ) -> Result<(), CheckError> {
        if let Some(v) = &info.value {
            if info.typ.is_none() && !v.representable(typ) {
                return self.err(pos, format!("cannot use {} as {} value", v, typ));
            }
        }
        Ok(())
    }

    /// Checks that a value is assignable to `dst` (the spec's four
    /// rules: identity, representable untyped constant, nil to a nilable
    /// kind, interface satisfaction).
    pub(crate) fn check_assignable(
        &self,
        info: &ExprInfo,
        dst: &TypeHandle,
        pos: Position,
    ) -> Result<(), CheckError> {
        if info.is_type() || info.is_package() {
            return self.err(pos, format!("cannot use {} as value", describe(info)));
        }
        if info.is_nil() {
            if dst.is_nilable() {
                return Ok(());
            }
            return self.err(pos, format!("cannot use nil as {} value", dst));
        }
        if let (Some(v), None) = (&info.value, &info.typ) {
            // Untyped constant: representability decides.
            if dst.is_interface() {
                return Ok(());
            }
            if v.representable(dst) {
                return Ok(());
            }
            return self.err(pos, format!("cannot use {} as {} value", v, dst));
        }
        let src = info.typ.as_ref().expect("typed operand");
        if self.assignable_type(src, dst) {
            return Ok(());
        }
        self.err(
            pos,
            format!("cannot use value of type {} as {} value", src, dst),
        )
    }
}

fn base_ident_id(e: &Expr) -> NodeId {
    match &e.kind {
        ExprKind::Ident(id) => id.id,
        ExprKind::Paren(inner) => base_ident_id(inner),
        _ => e.id,
    }
}
