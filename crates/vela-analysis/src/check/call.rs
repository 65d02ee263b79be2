//! Call expression checking: conversions, builtins, native and ordinary
//! function calls.

use vela_common::Position;
use vela_runtime::types::{BasicKind, ChanDir, FuncType, Type, TypeHandle};
use vela_syntax::ast::{CallExpr, Expr, ExprKind};

use super::errors::CheckError;
use super::type_info::{Entity, ExprInfo};
use super::{describe, Checker};
use crate::constant::{self, ConstValue};
use crate::universe::Builtin;

impl Checker<'_> {
    pub(crate) fn check_call(&mut self, e: &Expr, call: &CallExpr) -> Result<ExprInfo, CheckError> {
        let fi = self.check_expr(&call.fun, None)?;

        // Conversion: the callee is a type.
        if fi.is_type() {
            return self.check_conversion(e.pos, fi.typ.as_ref().unwrap().clone(), call);
        }

        // Builtin: per-name rules.
        if fi.properties.has(super::type_info::Properties::IS_BUILTIN) {
            let builtin = match self.info.uses.get(&callee_ident(&call.fun)) {
                Some(Entity::Builtin(b)) => *b,
                _ => return self.err(e.pos, "unresolved builtin"),
            };
            return self.check_builtin(e.pos, builtin, call);
        }

        // Ordinary or native function call.
        let sig = match fi.typ.as_ref().map(Type::underlying) {
            Some(t) => match &*t {
                Type::Func(ft) => ft.clone(),
                _ => {
                    return self.err(
                        e.pos,
                        format!("invalid operation: cannot call non-function {}", describe(&fi)),
                    )
                }
            },
            None => return self.err(e.pos, "use of untyped nil"),
        };
        self.check_call_args(e.pos, &sig, call)?;
        Ok(call_result(&sig))
    }

    fn check_call_args(
        &mut self,
        pos: Position,
        sig: &FuncType,
        call: &CallExpr,
    ) -> Result<(), CheckError> {
        let nparams = sig.params.len();

        if call.spread {
            if !sig.variadic {
                return self.err(pos, "cannot use ... in call to non-variadic function");
            }
            if call.args.len() != nparams {
                return self.err(pos, "not enough arguments in call");
            }
            for (i, arg) in call.args.iter().enumerate() {
                let ai = self.check_expr(arg, Some(&sig.params[i]))?;
                self.check_assignable(&ai, &sig.params[i], arg.pos)?;
            }
            return Ok(());
        }

        // f(g()) with g multi-valued.
        if call.args.len() == 1 {
            let ai = self.check_expr(&call.args[0], sig.params.first())?;
            if let Some(types) = &ai.multi {
                if types.len() != nparams || sig.variadic {
                    return self.err(
                        pos,
                        format!(
                            "wrong number of arguments in call (have {}, want {})",
                            types.len(),
                            nparams
                        ),
                    );
                }
                for (t, p) in types.iter().zip(&sig.params) {
                    if !self.assignable_type(t, p) {
                        return self.err(pos, format!("cannot use {} as {} in call", t, p));
                    }
                }
                return Ok(());
            }
            // Single-argument fast path falls through to the arity check
            // with the already-checked argument.
            return self.finish_fixed_args(pos, sig, call, Some(ai));
        }

        self.finish_fixed_args(pos, sig, call, None)
    }

    fn finish_fixed_args(
        &mut self,
        pos: Position,
        sig: &FuncType,
        call: &CallExpr,
        first: Option<ExprInfo>,
    ) -> Result<(), CheckError> {
        let nparams = sig.params.len();
        let fixed = if sig.variadic { nparams - 1 } else { nparams };
        if call.args.len() < fixed {
            return self.err(pos, "not enough arguments in call");
        }
        if !sig.variadic && call.args.len() > nparams {
            return self.err(pos, "too many arguments in call");
        }
        let variadic_elem = if sig.variadic {
            match &*Type::underlying(&sig.params[nparams - 1]) {
                Type::Slice(e) => Some(e.clone()),
                _ => None,
            }
        } else {
            None
        };
        for (i, arg) in call.args.iter().enumerate() {
            let target = if i < fixed {
                sig.params[i].clone()
            } else {
                variadic_elem.clone().expect("variadic slice parameter")
            };
            let ai = match (&first, i) {
                (Some(info), 0) => info.clone(),
                _ => self.check_expr(arg, Some(&target))?,
            };
            self.check_assignable(&ai, &target, arg.pos)?;
        }
        Ok(())
    }

    fn check_conversion(
        &mut self,
        pos: Position,
        target: TypeHandle,
        call: &CallExpr,
    ) -> Result<ExprInfo, CheckError> {
        if call.args.is_empty() {
            return self.err(pos, format!("missing argument in conversion to {}", target));
        }
        if call.args.len() > 1 {
            return self.err(pos, format!("too many arguments in conversion to {}", target));
        }
        let ai = self.check_expr(&call.args[0], Some(&target))?;

        // Constant conversions fold.
        if let Some(v) = &ai.value {
            if let Some(kind) = Type::underlying(&target).basic_kind() {
                let folded: Option<ConstValue> = if kind.is_integer() {
                    constant::to_int(v).filter(|iv| iv.representable(&target))
                } else if kind.is_float() {
                    if v.is_numeric() {
                        Some(v.clone())
                    } else {
                        None
                    }
                } else if kind == BasicKind::String {
                    match v {
                        ConstValue::Str(_) => Some(v.clone()),
                        // Rune to string.
                        _ => v.to_i64().map(|r| {
                            ConstValue::Str(
                                char::from_u32(r as u32)
                                    .unwrap_or(char::REPLACEMENT_CHARACTER)
                                    .to_string(),
                            )
                        }),
                    }
                } else if kind == BasicKind::Bool {
                    match v {
                        ConstValue::Bool(_) => Some(v.clone()),
                        _ => None,
                    }
                } else {
                    None
                };
                return match folded {
                    Some(cv) => Ok(ExprInfo::constant(cv, Some(target))),
                    None => self.err(
                        pos,
                        format!("cannot convert {} to type {}", v, target),
                    ),
                };
            }
        }

        if self.convertible(&ai, &target) {
            Ok(ExprInfo::value_of(target))
        } else {
            self.err(
                pos,
                format!("cannot convert {} to type {}", describe(&ai), target),
            )
        }
    }

    fn convertible(&self, info: &ExprInfo, target: &TypeHandle) -> bool {
        if info.is_nil() {
            return target.is_nilable();
        }
        let src = match &info.typ {
            Some(t) => t.clone(),
            None => match &info.value {
                Some(v) => v.kind().default_type(),
                None => return false,
            },
        };
        if self.assignable_type(&src, target) {
            return true;
        }
        let (su, tu) = (Type::underlying(&src), Type::underlying(target));
        if Type::identical(&su, &tu) {
            return true;
        }
        match (su.basic_kind(), tu.basic_kind()) {
            // Numeric conversions.
            (Some(a), Some(b)) if a.is_numeric() && b.is_numeric() => return true,
            // Integer to string (rune).
            (Some(a), Some(BasicKind::String)) if a.is_integer() => return true,
            _ => {}
        }
        // string <-> []byte / []rune
        match (&*su, &*tu) {
            (Type::Basic(BasicKind::String), Type::Slice(e)) => {
                matches!(e.basic_kind(), Some(BasicKind::Uint8) | Some(BasicKind::Int32))
            }
            (Type::Slice(e), Type::Basic(BasicKind::String)) => {
                matches!(e.basic_kind(), Some(BasicKind::Uint8) | Some(BasicKind::Int32))
            }
            _ => false,
        }
    }

    fn check_builtin(
        &mut self,
        pos: Position,
        builtin: Builtin,
        call: &CallExpr,
    ) -> Result<ExprInfo, CheckError> {
        let int_t = Type::basic(BasicKind::Int);
        let argc = call.args.len();
        let arity = |this: &Self, want: usize| -> Result<(), CheckError> {
            if argc < want {
                return this.err(pos, format!("not enough arguments in call to {}", builtin.name()));
            }
            if argc > want {
                return this.err(pos, format!("too many arguments in call to {}", builtin.name()));
            }
            Ok(())
        };
        match builtin {
            Builtin::Len | Builtin::Cap => {
                arity(self, 1)?;
                let ai = self.check_expr(&call.args[0], None)?;
                // len of a constant string folds.
                if builtin == Builtin::Len {
                    if let Some(ConstValue::Str(s)) = &ai.value {
                        return Ok(ExprInfo::constant(
                            ConstValue::Int64(s.len() as i64),
                            Some(int_t),
                        ));
                    }
                }
                let t = match &ai.typ {
                    Some(t) => Type::underlying(t),
                    None => return self.err(pos, "use of untyped nil"),
                };
                let ok = match (builtin, &*t) {
                    (Builtin::Len, Type::Basic(BasicKind::String)) => true,
                    (Builtin::Len, Type::Slice(_) | Type::Array(_, _) | Type::Map(_, _) | Type::Chan(_, _)) => true,
                    (Builtin::Cap, Type::Slice(_) | Type::Array(_, _) | Type::Chan(_, _)) => true,
                    _ => false,
                };
                if !ok {
                    return self.err(
                        pos,
                        format!("invalid argument for {}", builtin.name()),
                    );
                }
                Ok(ExprInfo::value_of(int_t))
            }
            Builtin::Append => {
                if argc == 0 {
                    return self.err(pos, "not enough arguments in call to append");
                }
                let si = self.check_expr(&call.args[0], None)?;
                let (slice_t, elem) = match si.typ.as_ref().map(Type::underlying).as_deref() {
                    Some(Type::Slice(e)) => (si.typ.clone().unwrap(), e.clone()),
                    _ => {
                        return self.err(
                            call.args[0].pos,
                            "first argument to append must be a slice",
                        )
                    }
                };
                if call.spread {
                    if argc != 2 {
                        return self.err(pos, "can only use ... with final argument in append");
                    }
                    let xi = self.check_expr(&call.args[1], Some(&slice_t))?;
                    self.check_assignable(&xi, &slice_t, call.args[1].pos)?;
                } else {
                    for arg in &call.args[1..] {
                        let xi = self.check_expr(arg, Some(&elem))?;
                        self.check_assignable(&xi, &elem, arg.pos)?;
                    }
                }
                Ok(ExprInfo::value_of(slice_t))
            }
            Builtin::Close => {
                arity(self, 1)?;
                let ci = self.check_expr(&call.args[0], None)?;
                match ci.typ.as_ref().map(Type::underlying).as_deref() {
                    Some(Type::Chan(dir, _)) => {
                        if *dir == ChanDir::RecvOnly {
                            return self.err(pos, "cannot close receive-only channel");
                        }
                    }
                    _ => {
                        return self.err(
                            call.args[0].pos,
                            "invalid argument: close of non-channel",
                        )
                    }
                }
                Ok(no_value())
            }
            Builtin::Copy => {
                arity(self, 2)?;
                let di = self.check_expr(&call.args[0], None)?;
                let si = self.check_expr(&call.args[1], None)?;
                let de = match di.typ.as_ref().map(Type::underlying).as_deref() {
                    Some(Type::Slice(e)) => e.clone(),
                    _ => return self.err(pos, "arguments to copy must be slices"),
                };
                match si.typ.as_ref().map(Type::underlying).as_deref() {
                    Some(Type::Slice(e)) if Type::identical(e, &de) => {}
                    _ => return self.err(pos, "arguments to copy must have the same element type"),
                }
                Ok(ExprInfo::value_of(int_t))
            }
            Builtin::Delete => {
                arity(self, 2)?;
                let mi = self.check_expr(&call.args[0], None)?;
                let key_t = match mi.typ.as_ref().map(Type::underlying).as_deref() {
                    Some(Type::Map(k, _)) => k.clone(),
                    _ => return self.err(pos, "first argument to delete must be a map"),
                };
                let ki = self.check_expr(&call.args[1], Some(&key_t))?;
                self.check_assignable(&ki, &key_t, call.args[1].pos)?;
                Ok(no_value())
            }
            Builtin::Make => {
                if argc == 0 {
                    return self.err(pos, "not enough arguments in call to make");
                }
                let ti = self.check_expr(&call.args[0], None)?;
                if !ti.is_type() {
                    return self.err(call.args[0].pos, "first argument to make must be a type");
                }
                let target = ti.typ.clone().unwrap();
                match &*Type::underlying(&target) {
                    Type::Slice(_) => {
                        if argc < 2 {
                            return self.err(pos, "missing len argument to make");
                        }
                        if argc > 3 {
                            return self.err(pos, "too many arguments to make");
                        }
                        let li = self.check_make_size(&call.args[1])?;
                        let ci = if argc == 3 {
                            Some(self.check_make_size(&call.args[2])?)
                        } else {
                            None
                        };
                        if let (Some(l), Some(Some(c))) = (
                            li.as_ref().map(|v| v.to_i64().unwrap_or(0)),
                            ci.as_ref().map(|o| o.as_ref().map(|v| v.to_i64().unwrap_or(0))),
                        ) {
                            if c < l {
                                return self.err(pos, "len larger than cap in make");
                            }
                        }
                    }
                    Type::Map(_, _) | Type::Chan(_, _) => {
                        if argc > 2 {
                            return self.err(pos, "too many arguments to make");
                        }
                        if argc == 2 {
                            self.check_make_size(&call.args[1])?;
                        }
                    }
                    _ => {
                        return self.err(
                            pos,
                            format!("cannot make type {}", target),
                        )
                    }
                }
                Ok(ExprInfo::value_of(target))
            }
            Builtin::New => {
                arity(self, 1)?;
                let ti = self.check_expr(&call.args[0], None)?;
                if !ti.is_type() {
                    return self.err(call.args[0].pos, "argument to new must be a type");
                }
                Ok(ExprInfo::value_of(Type::pointer(ti.typ.unwrap())))
            }
            Builtin::Panic => {
                arity(self, 1)?;
                let ai = self.check_expr(&call.args[0], None)?;
                let _ = ai;
                Ok(no_value())
            }
            Builtin::Print | Builtin::Println => {
                for arg in &call.args {
                    self.check_expr(arg, None)?;
                }
                Ok(no_value())
            }
            Builtin::Recover => {
                arity(self, 0)?;
                Ok(ExprInfo::value_of(Type::empty_interface()))
            }
            Builtin::Complex | Builtin::Imag | Builtin::Real => {
                self.err(pos, "complex numbers are not supported")
            }
        }
    }

    /// A make size argument: an integer, and a non-negative constant if
    /// constant. Returns the constant value when known.
    fn check_make_size(&mut self, arg: &Expr) -> Result<Option<ConstValue>, CheckError> {
        let ai = self.check_expr(arg, None)?;
        if let Some(v) = &ai.value {
            match v.to_i64() {
                Some(n) if n >= 0 => return Ok(Some(v.clone())),
                _ => return self.err(arg.pos, format!("negative size argument in make: {}", v)),
            }
        }
        match ai.typ.as_ref().and_then(|t| t.basic_kind()) {
            Some(k) if k.is_integer() => Ok(None),
            _ => self.err(arg.pos, "size argument to make must be an integer"),
        }
    }
}

/// Result info of a call for a given signature.
pub(crate) fn call_result(sig: &FuncType) -> ExprInfo {
    match sig.results.len() {
        0 => no_value(),
        1 => ExprInfo::value_of(sig.results[0].clone()),
        _ => ExprInfo {
            multi: Some(sig.results.clone()),
            ..Default::default()
        },
    }
}

/// A call with no results: usable only as a statement.
fn no_value() -> ExprInfo {
    ExprInfo {
        multi: Some(Vec::new()),
        ..Default::default()
    }
}

fn callee_ident(e: &Expr) -> vela_syntax::ast::NodeId {
    match &e.kind {
        ExprKind::Ident(id) => id.id,
        ExprKind::Paren(inner) => callee_ident(inner),
        _ => e.id,
    }
}
