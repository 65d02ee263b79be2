//! The type graph shared by the checker, the emitter and the VM.
//!
//! Rust has no runtime reflection, so the "host-type handle" attached to
//! expressions and carried in bytecode type tables is an interned
//! [`TypeHandle`] into this graph. Named types compare by identity
//! (`Rc::ptr_eq`); unnamed composite types compare structurally.

use std::fmt;
use std::rc::Rc;

use crate::native::NativeFunction;

pub type TypeHandle = Rc<Type>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChanDir {
    Both,
    SendOnly,
    RecvOnly,
}

/// Basic (predeclared) type kinds. Booleans and every integer width share
/// the VM's int register bank; the kind still matters for conversions,
/// constant representability and wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicKind {
    Bool,
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    String,
}

impl BasicKind {
    pub fn is_integer(self) -> bool {
        use BasicKind::*;
        matches!(
            self,
            Int | Int8 | Int16 | Int32 | Int64 | Uint | Uint8 | Uint16 | Uint32 | Uint64
        )
    }

    pub fn is_unsigned(self) -> bool {
        use BasicKind::*;
        matches!(self, Uint | Uint8 | Uint16 | Uint32 | Uint64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, BasicKind::Float32 | BasicKind::Float64)
    }

    pub fn is_numeric(self) -> bool {
        self.is_integer() || self.is_float()
    }

    /// Bit width of an integer kind (64 for `int`/`uint`).
    pub fn bits(self) -> u32 {
        use BasicKind::*;
        match self {
            Int8 | Uint8 => 8,
            Int16 | Uint16 => 16,
            Int32 | Uint32 => 32,
            _ => 64,
        }
    }

    pub fn name(self) -> &'static str {
        use BasicKind::*;
        match self {
            Bool => "bool",
            Int => "int",
            Int8 => "int8",
            Int16 => "int16",
            Int32 => "int32",
            Int64 => "int64",
            Uint => "uint",
            Uint8 => "uint8",
            Uint16 => "uint16",
            Uint32 => "uint32",
            Uint64 => "uint64",
            Float32 => "float32",
            Float64 => "float64",
            String => "string",
        }
    }
}

/// Which of the four register banks a value of some type lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bank {
    Int = 0,
    Float = 1,
    String = 2,
    General = 3,
}

#[derive(Debug, Clone)]
pub struct FuncType {
    pub params: Vec<TypeHandle>,
    pub results: Vec<TypeHandle>,
    pub variadic: bool,
}

#[derive(Debug, Clone)]
pub struct StructField {
    pub name: String,
    pub typ: TypeHandle,
}

/// A named type: a host- or script-declared type with an underlying type
/// and an optional method set provided by the native bridge.
#[derive(Debug)]
pub struct NamedType {
    pub pkg: String,
    pub name: String,
    pub underlying: TypeHandle,
    pub methods: Vec<NativeMethod>,
}

#[derive(Debug, Clone)]
pub struct NativeMethod {
    pub name: String,
    pub func: Rc<NativeFunction>,
}

#[derive(Debug)]
pub enum Type {
    Basic(BasicKind),
    Slice(TypeHandle),
    Array(usize, TypeHandle),
    Map(TypeHandle, TypeHandle),
    Chan(ChanDir, TypeHandle),
    Func(FuncType),
    Pointer(TypeHandle),
    /// Methods sorted by name, each with its function type.
    Interface(Vec<(String, TypeHandle)>),
    Struct(Vec<StructField>),
    Named(NamedType),
}

impl Type {
    pub fn basic(kind: BasicKind) -> TypeHandle {
        Rc::new(Type::Basic(kind))
    }

    pub fn slice(elem: TypeHandle) -> TypeHandle {
        Rc::new(Type::Slice(elem))
    }

    pub fn array(len: usize, elem: TypeHandle) -> TypeHandle {
        Rc::new(Type::Array(len, elem))
    }

    pub fn map(key: TypeHandle, value: TypeHandle) -> TypeHandle {
        Rc::new(Type::Map(key, value))
    }

    pub fn chan(dir: ChanDir, elem: TypeHandle) -> TypeHandle {
        Rc::new(Type::Chan(dir, elem))
    }

    pub fn func(params: Vec<TypeHandle>, results: Vec<TypeHandle>, variadic: bool) -> TypeHandle {
        Rc::new(Type::Func(FuncType {
            params,
            results,
            variadic,
        }))
    }

    pub fn pointer(elem: TypeHandle) -> TypeHandle {
        Rc::new(Type::Pointer(elem))
    }

    pub fn empty_interface() -> TypeHandle {
        Rc::new(Type::Interface(Vec::new()))
    }

    /// The type a named type reduces to; identity for unnamed types.
    pub fn underlying(t: &TypeHandle) -> TypeHandle {
        match &**t {
            Type::Named(n) => n.underlying.clone(),
            _ => t.clone(),
        }
    }

    pub fn basic_kind(&self) -> Option<BasicKind> {
        match self {
            Type::Basic(k) => Some(*k),
            Type::Named(n) => n.underlying.basic_kind(),
            _ => None,
        }
    }

    pub fn is_interface(&self) -> bool {
        match self {
            Type::Interface(_) => true,
            Type::Named(n) => n.underlying.is_interface(),
            _ => false,
        }
    }

    pub fn is_nilable(&self) -> bool {
        match self {
            Type::Pointer(_)
            | Type::Func(_)
            | Type::Slice(_)
            | Type::Map(_, _)
            | Type::Chan(_, _)
            | Type::Interface(_) => true,
            Type::Named(n) => n.underlying.is_nilable(),
            Type::Basic(_) | Type::Array(_, _) | Type::Struct(_) => false,
        }
    }

    /// Register bank of a value of this type.
    pub fn bank(&self) -> Bank {
        match self {
            Type::Basic(k) if *k == BasicKind::String => Bank::String,
            Type::Basic(k) if k.is_float() => Bank::Float,
            Type::Basic(_) => Bank::Int,
            Type::Named(n) => n.underlying.bank(),
            _ => Bank::General,
        }
    }

    /// Method on a named type, if any.
    pub fn method(&self, name: &str) -> Option<&NativeMethod> {
        match self {
            Type::Named(n) => n.methods.iter().find(|m| m.name == name),
            _ => None,
        }
    }

    /// Structural field lookup, looking through named types and one level
    /// of pointer indirection (selector auto-deref).
    pub fn field_index(&self, name: &str) -> Option<(usize, TypeHandle)> {
        match self {
            Type::Struct(fields) => fields
                .iter()
                .enumerate()
                .find(|(_, f)| f.name == name)
                .map(|(i, f)| (i, f.typ.clone())),
            Type::Named(n) => n.underlying.field_index(name),
            Type::Pointer(e) => e.field_index(name),
            _ => None,
        }
    }

    /// Reports whether two types are identical.
    pub fn identical(a: &TypeHandle, b: &TypeHandle) -> bool {
        if Rc::ptr_eq(a, b) {
            return true;
        }
        match (&**a, &**b) {
            (Type::Named(_), _) | (_, Type::Named(_)) => false,
            (Type::Basic(x), Type::Basic(y)) => x == y,
            (Type::Slice(x), Type::Slice(y)) => Type::identical(x, y),
            (Type::Array(n, x), Type::Array(m, y)) => n == m && Type::identical(x, y),
            (Type::Map(kx, vx), Type::Map(ky, vy)) => {
                Type::identical(kx, ky) && Type::identical(vx, vy)
            }
            (Type::Chan(dx, x), Type::Chan(dy, y)) => dx == dy && Type::identical(x, y),
            (Type::Pointer(x), Type::Pointer(y)) => Type::identical(x, y),
            (Type::Func(x), Type::Func(y)) => {
                x.variadic == y.variadic
                    && x.params.len() == y.params.len()
                    && x.results.len() == y.results.len()
                    && x.params
                        .iter()
                        .zip(&y.params)
                        .all(|(p, q)| Type::identical(p, q))
                    && x.results
                        .iter()
                        .zip(&y.results)
                        .all(|(p, q)| Type::identical(p, q))
            }
            (Type::Interface(x), Type::Interface(y)) => {
                x.len() == y.len()
                    && x.iter()
                        .zip(y)
                        .all(|((nx, tx), (ny, ty))| nx == ny && Type::identical(tx, ty))
            }
            (Type::Struct(x), Type::Struct(y)) => {
                x.len() == y.len()
                    && x.iter()
                        .zip(y)
                        .all(|(f, g)| f.name == g.name && Type::identical(&f.typ, &g.typ))
            }
            _ => false,
        }
    }

    /// Reports whether a value of type `t` implements interface `iface`.
    ///
    /// Satisfaction is structural: every interface method must appear in
    /// `t`'s method set with an identical signature. The empty interface
    /// is implemented by every type.
    pub fn implements(t: &TypeHandle, iface: &TypeHandle) -> bool {
        let under = Type::underlying(iface);
        let methods = match &*under {
            Type::Interface(ms) => ms,
            _ => return false,
        };
        if methods.is_empty() {
            return true;
        }
        methods.iter().all(|(name, sig)| match t.method(name) {
            Some(m) => Type::identical(&m.func.sig, sig),
            None => false,
        })
    }

    /// Comparability for `==`/`!=` and map keys.
    pub fn comparable(t: &TypeHandle) -> bool {
        match &*Type::underlying(t) {
            Type::Basic(_) | Type::Pointer(_) | Type::Chan(_, _) | Type::Interface(_) => true,
            Type::Array(_, e) => Type::comparable(e),
            Type::Struct(fs) => fs.iter().all(|f| Type::comparable(&f.typ)),
            Type::Slice(_) | Type::Map(_, _) | Type::Func(_) => false,
            Type::Named(_) => unreachable!("underlying returned a named type"),
        }
    }

    /// Approximate in-memory size in bytes, used by the VM's memory
    /// accounting. Over-approximation is fine: the counter is advisory.
    pub fn size(&self) -> usize {
        match self {
            Type::Basic(k) => match k {
                BasicKind::Bool | BasicKind::Int8 | BasicKind::Uint8 => 1,
                BasicKind::Int16 | BasicKind::Uint16 => 2,
                BasicKind::Int32 | BasicKind::Uint32 | BasicKind::Float32 => 4,
                BasicKind::String => 16,
                _ => 8,
            },
            Type::Slice(_) | Type::Interface(_) | Type::Func(_) => 16,
            Type::Array(n, e) => n * e.size(),
            Type::Map(_, _) | Type::Chan(_, _) | Type::Pointer(_) => 8,
            Type::Struct(fs) => fs.iter().map(|f| f.typ.size()).sum::<usize>().max(1),
            Type::Named(n) => n.underlying.size(),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Basic(k) => f.write_str(k.name()),
            Type::Slice(e) => write!(f, "[]{}", e),
            Type::Array(n, e) => write!(f, "[{}]{}", n, e),
            Type::Map(k, v) => write!(f, "map[{}]{}", k, v),
            Type::Chan(ChanDir::Both, e) => write!(f, "chan {}", e),
            Type::Chan(ChanDir::SendOnly, e) => write!(f, "chan<- {}", e),
            Type::Chan(ChanDir::RecvOnly, e) => write!(f, "<-chan {}", e),
            Type::Pointer(e) => write!(f, "*{}", e),
            Type::Func(ft) => {
                write!(f, "func(")?;
                for (i, p) in ft.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    if ft.variadic && i == ft.params.len() - 1 {
                        write!(f, "...{}", p)?;
                    } else {
                        write!(f, "{}", p)?;
                    }
                }
                write!(f, ")")?;
                match ft.results.len() {
                    0 => Ok(()),
                    1 => write!(f, " {}", ft.results[0]),
                    _ => {
                        write!(f, " (")?;
                        for (i, r) in ft.results.iter().enumerate() {
                            if i > 0 {
                                write!(f, ", ")?;
                            }
                            write!(f, "{}", r)?;
                        }
                        write!(f, ")")
                    }
                }
            }
            Type::Interface(ms) if ms.is_empty() => f.write_str("interface {}"),
            Type::Interface(ms) => {
                write!(f, "interface {{ ")?;
                for (i, (name, _)) in ms.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", name)?;
                }
                write!(f, " }}")
            }
            Type::Struct(fs) => {
                write!(f, "struct {{ ")?;
                for (i, field) in fs.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{} {}", field.name, field.typ)?;
                }
                write!(f, " }}")
            }
            Type::Named(n) if n.pkg.is_empty() => f.write_str(&n.name),
            Type::Named(n) => write!(f, "{}.{}", n.pkg, n.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_identity() {
        let a = Type::slice(Type::basic(BasicKind::Int));
        let b = Type::slice(Type::basic(BasicKind::Int));
        let c = Type::slice(Type::basic(BasicKind::String));
        assert!(Type::identical(&a, &b));
        assert!(!Type::identical(&a, &c));
    }

    #[test]
    fn named_types_compare_by_identity() {
        let underlying = Type::basic(BasicKind::Int);
        let a: TypeHandle = Rc::new(Type::Named(NamedType {
            pkg: "p".into(),
            name: "T".into(),
            underlying: underlying.clone(),
            methods: Vec::new(),
        }));
        let b: TypeHandle = Rc::new(Type::Named(NamedType {
            pkg: "p".into(),
            name: "T".into(),
            underlying,
            methods: Vec::new(),
        }));
        assert!(Type::identical(&a, &a.clone()));
        assert!(!Type::identical(&a, &b));
    }

    #[test]
    fn empty_interface_implemented_by_all() {
        let any = Type::empty_interface();
        assert!(Type::implements(&Type::basic(BasicKind::Int), &any));
        assert!(Type::implements(
            &Type::slice(Type::basic(BasicKind::Bool)),
            &any
        ));
    }

    #[test]
    fn comparability() {
        assert!(Type::comparable(&Type::basic(BasicKind::String)));
        assert!(!Type::comparable(&Type::slice(Type::basic(BasicKind::Int))));
        assert!(!Type::comparable(&Type::map(
            Type::basic(BasicKind::Int),
            Type::basic(BasicKind::Int)
        )));
    }

    #[test]
    fn display() {
        let t = Type::map(
            Type::basic(BasicKind::String),
            Type::slice(Type::basic(BasicKind::Int)),
        );
        assert_eq!(t.to_string(), "map[string][]int");
    }
}
