//! The native bridge: host functions exposed to bytecode.
//!
//! A [`NativeFunction`] wraps a host callable together with cached
//! marshaling tables: a per-argument [`Kind`] vector, a per-result kind
//! vector and the per-bank output offsets. The tables are derived lazily
//! from the declared signature on first call and reused afterwards; the
//! argument vectors themselves come from a freelist so steady-state calls
//! do not allocate.
//!
//! A handful of hand-picked monomorphic signatures bypass marshaling
//! entirely ([`NativeImpl`] fast paths); everything else goes through the
//! generic entry point with a `Value` slab.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::env::Env;
use crate::types::{Type, TypeHandle};
use crate::value::Value;

/// Marshaling kind of one native argument or result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Bool,
    Int,
    Uint,
    Float64,
    String,
    Func,
    /// The execution environment, passed implicitly; only allowed in
    /// first position.
    Env,
    /// Anything else: moved through the general bank as a `Value`.
    Interface,
}

impl Kind {
    fn of(t: &TypeHandle) -> Kind {
        use crate::types::BasicKind::*;
        match &*Type::underlying(t) {
            Type::Basic(Bool) => Kind::Bool,
            Type::Basic(k) if k.is_unsigned() => Kind::Uint,
            Type::Basic(k) if k.is_integer() => Kind::Int,
            Type::Basic(k) if k.is_float() => Kind::Float64,
            Type::Basic(String) => Kind::String,
            Type::Func(_) => Kind::Func,
            _ => Kind::Interface,
        }
    }

    /// Which output-offset slot results of this kind consume.
    fn out_bank(self) -> usize {
        match self {
            Kind::Bool | Kind::Int | Kind::Uint => 0,
            Kind::Float64 => 1,
            Kind::String => 2,
            Kind::Func | Kind::Interface | Kind::Env => 3,
        }
    }
}

/// The host-side implementation of a native function.
pub enum NativeImpl {
    // Fast paths: direct calls for common shapes, no slab, no boxing.
    StrToInt(fn(&str) -> i64),
    StrToStr(fn(&str) -> String),
    StrStrToInt(fn(&str, &str) -> i64),
    StrStrToBool(fn(&str, &str) -> bool),
    StrIntToStr(fn(&str, i64) -> String),
    IntToInt(fn(i64) -> i64),
    IntIntToInt(fn(i64, i64) -> i64),
    FloatToFloat(fn(f64) -> f64),
    /// The general form: values marshaled by kind through a pooled slab.
    /// An `Err` is raised in the VM as a runtime panic.
    Generic(Box<dyn Fn(&Env, &[Value]) -> Result<Vec<Value>, String>>),
}

impl fmt::Debug for NativeImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NativeImpl::StrToInt(_) => "fn(string) int",
            NativeImpl::StrToStr(_) => "fn(string) string",
            NativeImpl::StrStrToInt(_) => "fn(string, string) int",
            NativeImpl::StrStrToBool(_) => "fn(string, string) bool",
            NativeImpl::StrIntToStr(_) => "fn(string, int) string",
            NativeImpl::IntToInt(_) => "fn(int) int",
            NativeImpl::IntIntToInt(_) => "fn(int, int) int",
            NativeImpl::FloatToFloat(_) => "fn(float64) float64",
            NativeImpl::Generic(_) => "fn(...)",
        };
        f.write_str(name)
    }
}

/// Cached marshaling tables, computed once per function.
#[derive(Debug, Clone)]
pub struct KindTables {
    pub ins: Vec<Kind>,
    pub outs: Vec<Kind>,
    /// How many results land in each bank; the VM bumps the frame
    /// pointers by these before reading inputs so outputs and inputs
    /// never collide.
    pub out_off: [i8; 4],
}

pub struct NativeFunction {
    pub pkg: String,
    pub name: String,
    /// Declared signature; drives marshaling and the checker.
    pub sig: TypeHandle,
    /// Whether the host function takes the environment in first position.
    pub wants_env: bool,
    imp: NativeImpl,
    /// Lazily-built kind tables (the "slowed" form).
    tables: RefCell<Option<Rc<KindTables>>>,
    /// Freelist of argument vectors for the generic path.
    slabs: RefCell<Vec<Vec<Value>>>,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunction({}.{} {:?})", self.pkg, self.name, self.imp)
    }
}

impl NativeFunction {
    pub fn new(
        pkg: impl Into<String>,
        name: impl Into<String>,
        sig: TypeHandle,
        imp: NativeImpl,
    ) -> Rc<NativeFunction> {
        Self::with_env(pkg, name, sig, false, imp)
    }

    pub fn with_env(
        pkg: impl Into<String>,
        name: impl Into<String>,
        sig: TypeHandle,
        wants_env: bool,
        imp: NativeImpl,
    ) -> Rc<NativeFunction> {
        debug_assert!(matches!(&*sig, Type::Func(_)), "signature must be a func type");
        Rc::new(NativeFunction {
            pkg: pkg.into(),
            name: name.into(),
            sig,
            wants_env,
            imp,
            tables: RefCell::new(None),
            slabs: RefCell::new(Vec::new()),
        })
    }

    /// A generic native function from a closure; the common constructor
    /// for package manifests.
    pub fn generic<F>(
        pkg: impl Into<String>,
        name: impl Into<String>,
        sig: TypeHandle,
        f: F,
    ) -> Rc<NativeFunction>
    where
        F: Fn(&Env, &[Value]) -> Result<Vec<Value>, String> + 'static,
    {
        Self::new(pkg, name, sig, NativeImpl::Generic(Box::new(f)))
    }

    pub fn func_type(&self) -> &crate::types::FuncType {
        match &*self.sig {
            Type::Func(ft) => ft,
            _ => unreachable!("native signature checked at construction"),
        }
    }

    pub fn is_variadic(&self) -> bool {
        self.func_type().variadic
    }

    pub fn imp(&self) -> &NativeImpl {
        &self.imp
    }

    /// Returns the cached kind tables, introspecting the signature on
    /// first use.
    pub fn tables(&self) -> Rc<KindTables> {
        if let Some(t) = self.tables.borrow().as_ref() {
            return t.clone();
        }
        let ft = self.func_type();
        let mut ins = Vec::with_capacity(ft.params.len() + 1);
        if self.wants_env {
            ins.push(Kind::Env);
        }
        ins.extend(ft.params.iter().map(Kind::of));
        let outs: Vec<Kind> = ft.results.iter().map(Kind::of).collect();
        let mut out_off = [0i8; 4];
        for k in &outs {
            out_off[k.out_bank()] += 1;
        }
        let tables = Rc::new(KindTables { ins, outs, out_off });
        *self.tables.borrow_mut() = Some(tables.clone());
        tables
    }

    /// Fetches a pooled argument vector sized for `n` values.
    pub fn get_args(&self, n: usize) -> Vec<Value> {
        let mut slab = match self.slabs.borrow_mut().pop() {
            Some(s) => s,
            None => Vec::with_capacity(n),
        };
        slab.clear();
        slab.reserve(n);
        slab
    }

    /// Returns an argument vector to the freelist.
    pub fn put_args(&self, args: Vec<Value>) {
        self.slabs.borrow_mut().push(args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BasicKind;

    fn int_t() -> TypeHandle {
        Type::basic(BasicKind::Int)
    }

    fn str_t() -> TypeHandle {
        Type::basic(BasicKind::String)
    }

    #[test]
    fn kind_tables_built_once() {
        let sig = Type::func(vec![str_t(), int_t()], vec![str_t(), int_t()], false);
        let f = NativeFunction::new("strings", "repeat", sig, NativeImpl::StrIntToStr(|s, n| s.repeat(n as usize)));
        let t = f.tables();
        assert_eq!(t.ins, vec![Kind::String, Kind::Int]);
        assert_eq!(t.outs, vec![Kind::String, Kind::Int]);
        assert_eq!(t.out_off, [1, 0, 1, 0]);
        assert!(Rc::ptr_eq(&t, &f.tables()));
    }

    #[test]
    fn env_kind_in_first_position() {
        let sig = Type::func(vec![int_t()], vec![], false);
        let f = NativeFunction::with_env(
            "os",
            "exit",
            sig,
            true,
            NativeImpl::Generic(Box::new(|_, _| Ok(Vec::new()))),
        );
        assert_eq!(f.tables().ins, vec![Kind::Env, Kind::Int]);
    }

    #[test]
    fn slab_roundtrip_reuses_allocation() {
        let sig = Type::func(vec![int_t()], vec![int_t()], false);
        let f = NativeFunction::new("math", "abs", sig, NativeImpl::IntToInt(i64::abs));
        let mut args = f.get_args(1);
        args.push(Value::Int(-4));
        let ptr = args.as_ptr() as usize;
        f.put_args(args);
        let again = f.get_args(1);
        assert_eq!(again.as_ptr() as usize, ptr);
        assert!(again.is_empty());
    }
}
