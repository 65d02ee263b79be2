//! Type expression resolution.

use std::rc::Rc;

use vela_runtime::package::NativeDecl;
use vela_runtime::types::{ChanDir as RtChanDir, StructField, Type, TypeHandle};
use vela_syntax::ast::{TypeExpr, TypeExprKind};
use vela_syntax::op::ChanDir;

use super::errors::CheckError;
use super::type_info::Entity;
use super::Checker;
use crate::universe;

impl Checker<'_> {
    pub(crate) fn check_type_expr(&mut self, t: &TypeExpr) -> Result<TypeHandle, CheckError> {
        let typ = self.resolve_type_expr(t)?;
        self.info.type_exprs.insert(t.id, typ.clone());
        Ok(typ)
    }

    fn resolve_type_expr(&mut self, t: &TypeExpr) -> Result<TypeHandle, CheckError> {
        match &t.kind {
            TypeExprKind::Name(id) => {
                if let Some(entry) = self.scopes.lookup(&id.name) {
                    return match &entry.entity {
                        Entity::TypeName(typ) => Ok(typ.clone()),
                        _ => self.err(id.pos, format!("{} is not a type", id.name)),
                    };
                }
                match universe::type_for_name(&id.name) {
                    Some(typ) => Ok(typ),
                    None => self.err(id.pos, format!("undefined: {}", id.name)),
                }
            }
            TypeExprKind::Qualified(pkg, name) => {
                let path = match self.scopes.lookup(&pkg.name).map(|e| e.entity.clone()) {
                    Some(Entity::Package { path }) => path,
                    _ => return self.err(pkg.pos, format!("undefined: {}", pkg.name)),
                };
                let manifest = self
                    .packages
                    .get(&path)
                    .expect("imported package disappeared");
                match manifest.lookup(&name.name) {
                    Some(NativeDecl::Type(typ)) => Ok(typ),
                    Some(_) => self.err(
                        name.pos,
                        format!("{}.{} is not a type", pkg.name, name.name),
                    ),
                    None => self.err(
                        name.pos,
                        format!("undefined: {}.{}", pkg.name, name.name),
                    ),
                }
            }
            TypeExprKind::Slice(elem) => Ok(Type::slice(self.check_type_expr(elem)?)),
            TypeExprKind::Array(len, elem) => {
                let li = self.check_expr(len, None)?;
                let n = match li.value.as_ref().and_then(|v| v.to_i64()) {
                    Some(n) if n >= 0 => n as usize,
                    Some(_) => return self.err(len.pos, "array bound must be non-negative"),
                    None => {
                        return self.err(len.pos, "array bound must be a constant expression")
                    }
                };
                Ok(Type::array(n, self.check_type_expr(elem)?))
            }
            TypeExprKind::Map(key, value) => {
                let kt = self.check_type_expr(key)?;
                if !Type::comparable(&kt) {
                    return self.err(key.pos, format!("invalid map key type {}", kt));
                }
                Ok(Type::map(kt, self.check_type_expr(value)?))
            }
            TypeExprKind::Chan(dir, elem) => {
                let d = match dir {
                    ChanDir::Both => RtChanDir::Both,
                    ChanDir::SendOnly => RtChanDir::SendOnly,
                    ChanDir::RecvOnly => RtChanDir::RecvOnly,
                };
                Ok(Type::chan(d, self.check_type_expr(elem)?))
            }
            TypeExprKind::Pointer(elem) => Ok(Type::pointer(self.check_type_expr(elem)?)),
            TypeExprKind::Func(ft) => self.check_func_type(ft),
            TypeExprKind::Struct(fields) => {
                let mut out: Vec<StructField> = Vec::new();
                for field in fields {
                    let ft = self.check_type_expr(&field.typ)?;
                    for name in &field.names {
                        if out.iter().any(|f| f.name == name.name) {
                            return self.err(
                                name.pos,
                                format!("duplicate field {}", name.name),
                            );
                        }
                        out.push(StructField {
                            name: name.name.clone(),
                            typ: ft.clone(),
                        });
                    }
                }
                Ok(Rc::new(Type::Struct(out)))
            }
            TypeExprKind::Interface(methods) => {
                let mut out: Vec<(String, TypeHandle)> = Vec::new();
                for m in methods {
                    if out.iter().any(|(n, _)| *n == m.name.name) {
                        return self.err(
                            m.name.pos,
                            format!("duplicate method {}", m.name.name),
                        );
                    }
                    let sig = self.check_func_type(&m.typ)?;
                    out.push((m.name.name.clone(), sig));
                }
                // Canonical order for structural identity.
                out.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(Rc::new(Type::Interface(out)))
            }
        }
    }
}
