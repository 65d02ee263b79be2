//! The checker: entry points, declaration checking, and shared state.

pub mod assignment;
pub mod call;
pub mod errors;
pub mod expr;
pub mod package;
pub mod stmt;
pub mod type_info;
pub mod typexpr;

use std::collections::HashMap;

use tracing::debug;

use vela_common::Position;
use vela_runtime::package::{NativeDecl, Packages};
use vela_runtime::types::{Type, TypeHandle};
use vela_syntax::ast::{ConstDecl, Decl, File, FuncDecl, Ident, NodeId, VarDecl};

use crate::constant::ConstValue;
use crate::scope::{ScopeEntry, ScopeStack};
use errors::CheckError;
use type_info::{CheckedProgram, DeclRef, Entity, ExprInfo, GlobalInfo, TypeInfo, VarDef};

/// Type-checks the files of a program's main package.
pub fn check_program(
    files: Vec<File>,
    packages: &Packages,
    disallow_go_stmt: bool,
) -> Result<CheckedProgram, CheckError> {
    Checker::new(packages, false, disallow_go_stmt).check(files)
}

/// Type-checks a script: a single file whose `main` function is the
/// script body. Unresolved names may auto-import from the registry's
/// root manifest, and package-level variables can be seeded by the host.
pub fn check_script(file: File, packages: &Packages) -> Result<CheckedProgram, CheckError> {
    Checker::new(packages, true, false).check(vec![file])
}

pub struct Checker<'p> {
    pub(crate) packages: &'p Packages,
    pub(crate) script: bool,
    pub(crate) disallow_go_stmt: bool,
    pub(crate) path: String,
    pub(crate) info: TypeInfo,
    pub(crate) scopes: ScopeStack,
    pub(crate) globals: Vec<GlobalInfo>,
    /// Signatures of package-level functions, by name.
    pub(crate) func_sigs: HashMap<String, TypeHandle>,
    /// Function nesting depth: 0 at package level, 1 inside a top-level
    /// function, +1 per literal.
    pub(crate) fn_depth: usize,
    /// Result types of the enclosing functions, innermost last.
    pub(crate) results: Vec<Vec<TypeHandle>>,
    /// Enclosing function literals: (literal id, its body's fn depth).
    pub(crate) lits: Vec<(NodeId, usize)>,
    pub(crate) iota: Option<i64>,
    pub(crate) loop_depth: usize,
    pub(crate) switch_depth: usize,
}

impl<'p> Checker<'p> {
    fn new(packages: &'p Packages, script: bool, disallow_go_stmt: bool) -> Checker<'p> {
        Checker {
            packages,
            script,
            disallow_go_stmt,
            path: String::new(),
            info: TypeInfo::default(),
            scopes: ScopeStack::new(),
            globals: Vec::new(),
            func_sigs: HashMap::new(),
            fn_depth: 0,
            results: Vec::new(),
            lits: Vec::new(),
            iota: None,
            loop_depth: 0,
            switch_depth: 0,
        }
    }

    pub(crate) fn err<T>(&self, pos: Position, msg: impl Into<String>) -> Result<T, CheckError> {
        Err(CheckError::new(&self.path, pos, msg))
    }

    pub(crate) fn record(&mut self, id: NodeId, info: ExprInfo) -> ExprInfo {
        self.info.exprs.insert(id, info.clone());
        info
    }

    fn check(mut self, files: Vec<File>) -> Result<CheckedProgram, CheckError> {
        if files.is_empty() {
            return Err(CheckError::new("", Position::default(), "no source files"));
        }
        self.path = files[0].path.clone();
        let pkg_name = files[0].package.name.clone();
        for f in &files {
            if f.package.name != pkg_name {
                return Err(CheckError::new(
                    &f.path,
                    f.package.pos,
                    format!("package {}; expected {}", f.package.name, pkg_name),
                ));
            }
        }
        if !self.script && pkg_name != "main" {
            return Err(CheckError::new(
                &files[0].path,
                files[0].package.pos,
                format!("package {} is not a main package", pkg_name),
            ));
        }
        debug!(package = %pkg_name, files = files.len(), "check");

        // Imports resolve to native package manifests.
        for f in &files {
            self.path = f.path.clone();
            for imp in &f.imports {
                let pkg = match self.packages.get(&imp.path) {
                    Some(p) => p,
                    None => {
                        return self.err(imp.pos, format!("cannot find package \"{}\"", imp.path))
                    }
                };
                let name = imp
                    .alias
                    .as_ref()
                    .map(|a| a.name.clone())
                    .unwrap_or_else(|| pkg.name().to_string());
                let entry = ScopeEntry {
                    entity: Entity::Package {
                        path: imp.path.clone(),
                    },
                    pos: imp.pos,
                    fn_depth: 0,
                };
                if let Err(prev) = self.scopes.declare_package(&name, entry) {
                    let _ = prev;
                    return self.err(imp.pos, format!("{} redeclared in this block", name));
                }
            }
        }

        // Sort package-level declarations and detect cycles.
        let sorted = package::sort_declarations(&self, &files)?;

        // Pre-declare functions so bodies can reference each other.
        let mut inits: Vec<DeclRef> = Vec::new();
        let mut main: Option<DeclRef> = None;
        for &(fi, di) in &sorted {
            if let Decl::Func(fd) = &files[fi].decls[di] {
                self.path = files[fi].path.clone();
                let sig = self.check_func_type(&fd.typ)?;
                if fd.name.name == "init" {
                    if !matches!(&*sig, Type::Func(ft) if ft.params.is_empty() && ft.results.is_empty())
                    {
                        return self.err(
                            fd.pos,
                            "func init must have no arguments and no return values",
                        );
                    }
                    inits.push((fi, di));
                    continue;
                }
                if fd.name.name == "main" {
                    if !matches!(&*sig, Type::Func(ft) if ft.params.is_empty()) {
                        return self.err(fd.pos, "func main must have no arguments");
                    }
                    main = Some((fi, di));
                }
                if fd.name.is_blank() {
                    continue;
                }
                self.func_sigs.insert(fd.name.name.clone(), sig);
                let entry = ScopeEntry {
                    entity: Entity::Func {
                        name: fd.name.name.clone(),
                    },
                    pos: fd.name.pos,
                    fn_depth: 0,
                };
                if let Err(_prev) = self.scopes.declare_package(&fd.name.name, entry) {
                    return self.err(
                        fd.name.pos,
                        format!("{} redeclared in this block", fd.name.name),
                    );
                }
            }
        }
        // Scripts carry their body as the main function too.
        if main.is_none() {
            return Err(CheckError::new(
                &files[0].path,
                Position::default(),
                "function main is undeclared in the main package",
            ));
        }

        // Check declarations in dependency order: types, constants and
        // variables before any function body.
        for &(fi, di) in &sorted {
            self.path = files[fi].path.clone();
            match &files[fi].decls[di] {
                Decl::Type(td, pos) => self.check_type_decl(td, *pos)?,
                Decl::Const(cd, pos) => self.check_const_decl(cd, *pos)?,
                Decl::Var(vd, pos) => self.check_global_var_decl(vd, *pos)?,
                Decl::Func(_) => {}
            }
        }
        for &(fi, di) in &sorted {
            if let Decl::Func(fd) = &files[fi].decls[di] {
                self.path = files[fi].path.clone();
                self.check_func_body(fd)?;
            }
        }

        Ok(CheckedProgram {
            files,
            info: self.info,
            sorted_decls: sorted,
            globals: self.globals,
            inits,
            main,
        })
    }

    fn check_type_decl(
        &mut self,
        td: &vela_syntax::ast::TypeDecl,
        _pos: Position,
    ) -> Result<(), CheckError> {
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
        if td.name.is_blank() {
            return Ok(());
        }
        let entry = ScopeEntry {
            entity: Entity::TypeName(typ),
            pos: td.name.pos,
            fn_depth: 0,
        };
        if self.scopes.declare_package(&td.name.name, entry).is_err() {
            return self.err(
                td.name.pos,
                format!("{} redeclared in this block", td.name.name),
            );
        }
        Ok(())
    }

    fn check_const_decl(&mut self, cd: &ConstDecl, pos: Position) -> Result<(), CheckError> {
        self.iota = Some(cd.iota as i64);
        let result = self.check_const_decl_inner(cd, pos);
        self.iota = None;
        result
    }

    fn check_const_decl_inner(&mut self, cd: &ConstDecl, pos: Position) -> Result<(), CheckError> {
        if cd.values.len() != cd.names.len() {
            return self.err(
                pos,
                if cd.values.len() < cd.names.len() {
                    "missing value in const declaration"
                } else {
                    "extra expression in const declaration"
                },
            );
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
                    return self.err(
                        value.pos,
                        format!("const initializer {} is not a constant", describe(&vi)),
                    )
                }
            };
            let typ = match &declared {
                Some(t) => {
                    if !cv.representable(t) {
                        return self.err(
                            value.pos,
                            format!("constant {} overflows {}", cv, t),
                        );
                    }
                    Some(t.clone())
                }
                None => vi.typ.clone(),
            };
            if name.is_blank() {
                continue;
            }
            let entry = ScopeEntry {
                entity: Entity::Const {
                    value: cv,
                    typ,
                },
                pos: name.pos,
                fn_depth: 0,
            };
            if self.scopes.declare_package(&name.name, entry).is_err() {
                return self.err(name.pos, format!("{} redeclared in this block", name.name));
            }
        }
        Ok(())
    }

    fn check_global_var_decl(&mut self, vd: &VarDecl, pos: Position) -> Result<(), CheckError> {
        let types = self.check_var_decl_types(vd, pos)?;
        for (name, typ) in vd.names.iter().zip(types) {
            if name.is_blank() {
                continue;
            }
            let index = self.globals.len() as u16;
            self.globals.push(GlobalInfo {
                pkg: "main".to_string(),
                name: name.name.clone(),
                typ: typ.clone(),
                cell: None,
            });
            self.info.defs.insert(
                name.id,
                VarDef {
                    name: name.name.clone(),
                    typ,
                    depth: 0,
                },
            );
            let entry = ScopeEntry {
                entity: Entity::Global { index },
                pos: name.pos,
                fn_depth: 0,
            };
            if self.scopes.declare_package(&name.name, entry).is_err() {
                return self.err(name.pos, format!("{} redeclared in this block", name.name));
            }
        }
        Ok(())
    }

    /// Resolves the per-name types of a var declaration, checking the
    /// initializers. Shared by global and local `var` statements.
    pub(crate) fn check_var_decl_types(
        &mut self,
        vd: &VarDecl,
        pos: Position,
    ) -> Result<Vec<TypeHandle>, CheckError> {
        let declared = match &vd.typ {
            Some(t) => Some(self.check_type_expr(t)?),
            None => None,
        };
        if vd.values.is_empty() {
            // `var x T`: zeros are synthesized by the emitter.
            let t = match &declared {
                Some(t) => t.clone(),
                None => return self.err(pos, "missing type or value in variable declaration"),
            };
            return Ok(vec![t; vd.names.len()]);
        }
        // Multi-value call on the right-hand side.
        if vd.values.len() == 1 && vd.names.len() > 1 {
            let vi = self.check_expr(&vd.values[0], None)?;
            let types = match &vi.multi {
                Some(types) => types.clone(),
                None => {
                    return self.err(
                        pos,
                        format!(
                            "assignment mismatch: {} variables but 1 value",
                            vd.names.len()
                        ),
                    )
                }
            };
            if types.len() != vd.names.len() {
                return self.err(
                    pos,
                    format!(
                        "assignment mismatch: {} variables but {} values",
                        vd.names.len(),
                        types.len()
                    ),
                );
            }
            return match &declared {
                Some(t) => {
                    for rt in &types {
                        if !Type::identical(rt, t) && !self.assignable_type(rt, t) {
                            return self.err(
                                pos,
                                format!("cannot use value of type {} as {}", rt, t),
                            );
                        }
                    }
                    Ok(vec![t.clone(); vd.names.len()])
                }
                None => Ok(types),
            };
        }
        if vd.values.len() != vd.names.len() {
            return self.err(
                pos,
                format!(
                    "assignment mismatch: {} variables but {} values",
                    vd.names.len(),
                    vd.values.len()
                ),
            );
        }
        let mut out = Vec::with_capacity(vd.names.len());
        for value in &vd.values {
            let vi = self.check_expr(value, declared.as_ref())?;
            let t = match &declared {
                Some(t) => {
                    self.check_assignable(&vi, t, value.pos)?;
                    t.clone()
                }
                None => self.default_type(&vi, value.pos)?,
            };
            out.push(t);
        }
        Ok(out)
    }

    pub(crate) fn check_func_type(
        &mut self,
        ft: &vela_syntax::ast::FuncTypeExpr,
    ) -> Result<TypeHandle, CheckError> {
        let mut params = Vec::with_capacity(ft.params.len());
        for p in &ft.params {
            params.push(self.check_type_expr(&p.typ)?);
        }
        let mut results = Vec::with_capacity(ft.results.len());
        for r in &ft.results {
            results.push(self.check_type_expr(&r.typ)?);
        }
        if ft.variadic {
            // The declared variadic parameter is its slice type.
            let last = params.pop().ok_or_else(|| {
                CheckError::new(&self.path, Position::default(), "missing variadic parameter")
            })?;
            params.push(Type::slice(last));
        }
        Ok(Type::func(params, results, ft.variadic))
    }

    fn check_func_body(&mut self, fd: &FuncDecl) -> Result<(), CheckError> {
        let sig = match self.func_sigs.get(&fd.name.name) {
            Some(sig) => sig.clone(),
            None => self.check_func_type(&fd.typ)?, // init functions
        };
        let ft = match &*sig {
            Type::Func(ft) => ft.clone(),
            _ => unreachable!("function signature is a func type"),
        };
        self.fn_depth = 1;
        self.scopes.push();
        self.declare_params(&fd.typ, &ft)?;
        self.results.push(ft.results.clone());
        let result = self.check_block(&fd.body);
        self.results.pop();
        self.scopes.pop();
        self.fn_depth = 0;
        result?;
        if !ft.results.is_empty() && !stmt::terminates(&fd.body) {
            return self.err(fd.pos, "missing return at end of function");
        }
        Ok(())
    }

    pub(crate) fn declare_params(
        &mut self,
        typ: &vela_syntax::ast::FuncTypeExpr,
        ft: &vela_runtime::types::FuncType,
    ) -> Result<(), CheckError> {
        for (p, t) in typ.params.iter().zip(&ft.params) {
            if let Some(name) = &p.name {
                if name.is_blank() {
                    continue;
                }
                self.declare_local(name, t.clone())?;
            }
        }
        Ok(())
    }

    pub(crate) fn declare_local(
        &mut self,
        name: &Ident,
        typ: TypeHandle,
    ) -> Result<(), CheckError> {
        if name.is_blank() {
            return Ok(());
        }
        self.info.defs.insert(
            name.id,
            VarDef {
                name: name.name.clone(),
                typ,
                depth: self.fn_depth,
            },
        );
        let entry = ScopeEntry {
            entity: Entity::Local { decl: name.id },
            pos: name.pos,
            fn_depth: self.fn_depth,
        };
        if self.scopes.declare(&name.name, entry).is_err() {
            return self.err(name.pos, format!("{} redeclared in this block", name.name));
        }
        Ok(())
    }

    /// Resolves a native package declaration, interning native variables
    /// as global slots bound to the host cell.
    pub(crate) fn native_decl_entity(
        &mut self,
        pkg_path: &str,
        pkg_name: &str,
        name: &str,
        decl: NativeDecl,
        pos: Position,
    ) -> Result<Entity, CheckError> {
        Ok(match decl {
            NativeDecl::Func(f) => Entity::NativeFunc(f),
            NativeDecl::Type(t) => Entity::TypeName(t),
            NativeDecl::Var(cell) => {
                // One global slot per native variable, shared across uses.
                if let Some(existing) = self
                    .globals
                    .iter()
                    .position(|g| g.pkg == pkg_path && g.name == name)
                {
                    Entity::Global {
                        index: existing as u16,
                    }
                } else {
                    let typ = infer_cell_type(&cell);
                    let index = self.globals.len() as u16;
                    self.globals.push(GlobalInfo {
                        pkg: pkg_path.to_string(),
                        name: name.to_string(),
                        typ,
                        cell: Some(cell),
                    });
                    Entity::Global { index }
                }
            }
            NativeDecl::UntypedIntConst(lit) => match ConstValue::parse_int(&lit) {
                Some(v) => Entity::Const { value: v, typ: None },
                None => {
                    return self.err(
                        pos,
                        format!("invalid untyped constant {:?} for {}.{}", lit, pkg_name, name),
                    )
                }
            },
            NativeDecl::UntypedFloatConst(lit) => match ConstValue::parse_float(&lit) {
                Some(v) => Entity::Const { value: v, typ: None },
                None => {
                    return self.err(
                        pos,
                        format!("invalid untyped constant {:?} for {}.{}", lit, pkg_name, name),
                    )
                }
            },
            NativeDecl::UntypedStringConst(s) => Entity::Const {
                value: ConstValue::Str(s),
                typ: None,
            },
            NativeDecl::UntypedBoolConst(b) => Entity::Const {
                value: ConstValue::Bool(b),
                typ: None,
            },
            NativeDecl::Const(v, t) => {
                let cv = match &v {
                    vela_runtime::value::Value::Bool(b) => ConstValue::Bool(*b),
                    vela_runtime::value::Value::Int(i) => ConstValue::Int64(*i),
                    vela_runtime::value::Value::Float(f) => ConstValue::Float(*f),
                    vela_runtime::value::Value::Str(s) => ConstValue::Str(s.to_string()),
                    _ => {
                        return self.err(
                            pos,
                            format!("invalid constant value for {}.{}", pkg_name, name),
                        )
                    }
                };
                Entity::Const {
                    value: cv,
                    typ: Some(t),
                }
            }
            NativeDecl::Package(_) => {
                return self.err(
                    pos,
                    format!(
                        "cannot use nested package {}.{} here",
                        pkg_name, name
                    ),
                )
            }
        })
    }
}

fn infer_cell_type(cell: &vela_runtime::value::CellRef) -> TypeHandle {
    use vela_runtime::types::BasicKind;
    use vela_runtime::value::Value;
    match &*cell.borrow() {
        Value::Bool(_) => Type::basic(BasicKind::Bool),
        Value::Int(_) => Type::basic(BasicKind::Int),
        Value::Float(_) => Type::basic(BasicKind::Float64),
        Value::Str(_) => Type::basic(BasicKind::String),
        Value::Slice(s) => Type::slice(s.elem.clone()),
        Value::Map(m) => Type::map(m.key.clone(), m.value.clone()),
        Value::Chan(c) => Type::chan(vela_runtime::types::ChanDir::Both, c.elem.clone()),
        Value::Struct(s) => s.typ.clone(),
        _ => Type::empty_interface(),
    }
}

pub(crate) fn describe(info: &ExprInfo) -> String {
    if info.is_type() {
        return "type".to_string();
    }
    if info.is_package() {
        return "package".to_string();
    }
    match &info.typ {
        Some(t) => format!("(value of type {})", t),
        None => "nil".to_string(),
    }
}

