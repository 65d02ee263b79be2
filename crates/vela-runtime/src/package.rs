//! Predefined (native) package manifests.
//!
//! A host exposes Rust types, functions, variables and constants to
//! scripts through [`NativePackage`] manifests. The checker consults the
//! manifest during import resolution; the emitter interns looked-up
//! functions into per-function native tables. Package indices are
//! per-build state ([`Packages`]), never process-global.

use std::rc::Rc;

use indexmap::IndexMap;

use crate::native::NativeFunction;
use crate::types::TypeHandle;
use crate::value::{CellRef, Value};

/// One exported declaration of a native package.
#[derive(Clone)]
pub enum NativeDecl {
    /// A nested package for auto-import. Only consulted for scripts, not
    /// programs, and only one level deep.
    Package(Rc<dyn NativePackage>),
    /// A type exported by the host.
    Type(TypeHandle),
    /// An addressable host variable; scripts read and write through the
    /// cell without copies.
    Var(CellRef),
    Func(Rc<NativeFunction>),
    /// Untyped constants, parsed by the checker to arbitrary precision.
    UntypedIntConst(String),
    UntypedFloatConst(String),
    UntypedStringConst(String),
    UntypedBoolConst(bool),
    /// A typed constant.
    Const(Value, TypeHandle),
}

pub trait NativePackage {
    fn name(&self) -> &str;

    /// Exported names, sorted and unique.
    fn declaration_names(&self) -> Vec<String>;

    fn lookup(&self, name: &str) -> Option<NativeDecl>;
}

/// A manifest backed by a declaration map; the convenient way for hosts
/// and tests to assemble packages.
pub struct DeclaredPackage {
    name: String,
    decls: IndexMap<String, NativeDecl>,
}

impl DeclaredPackage {
    pub fn new(name: impl Into<String>) -> DeclaredPackage {
        DeclaredPackage {
            name: name.into(),
            decls: IndexMap::new(),
        }
    }

    pub fn declare(mut self, name: impl Into<String>, decl: NativeDecl) -> DeclaredPackage {
        self.decls.insert(name.into(), decl);
        self
    }

    pub fn declare_func(self, name: &str, f: Rc<NativeFunction>) -> DeclaredPackage {
        self.declare(name, NativeDecl::Func(f))
    }
}

impl NativePackage for DeclaredPackage {
    fn name(&self) -> &str {
        &self.name
    }

    fn declaration_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.decls.keys().cloned().collect();
        names.sort();
        names
    }

    fn lookup(&self, name: &str) -> Option<NativeDecl> {
        self.decls.get(name).cloned()
    }
}

/// The per-build registry mapping import paths to package manifests.
#[derive(Default, Clone)]
pub struct Packages {
    by_path: IndexMap<String, Rc<dyn NativePackage>>,
}

impl Packages {
    pub fn new() -> Packages {
        Packages::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, pkg: Rc<dyn NativePackage>) {
        self.by_path.insert(path.into(), pkg);
    }

    pub fn get(&self, path: &str) -> Option<Rc<dyn NativePackage>> {
        self.by_path.get(path).cloned()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.by_path.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NativeImpl;
    use crate::types::{BasicKind, Type};

    #[test]
    fn declaration_names_are_sorted() {
        let pkg = DeclaredPackage::new("strings")
            .declare_func(
                "ToUpper",
                NativeFunction::new(
                    "strings",
                    "ToUpper",
                    Type::func(
                        vec![Type::basic(BasicKind::String)],
                        vec![Type::basic(BasicKind::String)],
                        false,
                    ),
                    NativeImpl::StrToStr(|s| s.to_uppercase()),
                ),
            )
            .declare(
                "Count",
                NativeDecl::UntypedIntConst("42".to_string()),
            );
        assert_eq!(pkg.declaration_names(), vec!["Count", "ToUpper"]);
        assert!(pkg.lookup("ToUpper").is_some());
        assert!(pkg.lookup("missing").is_none());
    }

    #[test]
    fn registry_is_per_build() {
        let mut a = Packages::new();
        a.insert("strings", Rc::new(DeclaredPackage::new("strings")));
        let b = Packages::new();
        assert!(a.get("strings").is_some());
        assert!(b.get("strings").is_none());
    }
}
