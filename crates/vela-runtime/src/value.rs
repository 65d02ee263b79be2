//! Runtime values for the general register bank.
//!
//! Ints, floats and strings live in their own banks; everything else —
//! slices, maps, channels, structs, pointers, callables, interface values —
//! is a [`Value`] in the general bank. Reference kinds share state through
//! `Rc`; a pointer (and a captured-by-reference local) is a shared
//! [`CellRef`]. Struct and array values copy on assignment, matching the
//! language's value semantics; the VM's `Move` handler calls
//! [`Value::deep_copy`] for them.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::chan::Channel;
use crate::native::NativeFunction;
use crate::types::{Type, TypeHandle};

/// A shared storage cell: the referent of a pointer, a captured variable,
/// or a VM-allocated global slot.
pub type CellRef = Rc<RefCell<Value>>;

pub fn new_cell(v: Value) -> CellRef {
    Rc::new(RefCell::new(v))
}

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Slice(SliceObj),
    Array(ArrayObj),
    Map(MapObj),
    Chan(Rc<Channel>),
    Func(Rc<RefCell<Callable>>),
    Struct(StructObj),
    /// A pointer: `new(T)`, `&x`, or the boxed cell of a captured local.
    Cell(CellRef),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn func(c: Callable) -> Value {
        Value::Func(Rc::new(RefCell::new(c)))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// The zero value for a type, placed in freshly allocated cells,
    /// globals and map misses.
    pub fn zero(typ: &TypeHandle) -> Value {
        match &*Type::underlying(typ) {
            Type::Basic(k) => {
                if k.is_float() {
                    Value::Float(0.0)
                } else if *k == crate::types::BasicKind::String {
                    Value::str("")
                } else if *k == crate::types::BasicKind::Bool {
                    Value::Bool(false)
                } else {
                    Value::Int(0)
                }
            }
            Type::Struct(fields) => Value::Struct(StructObj::zero(typ.clone(), fields)),
            Type::Array(n, elem) => {
                let mut data = Vec::with_capacity(*n);
                for _ in 0..*n {
                    data.push(Value::zero(elem));
                }
                Value::Array(ArrayObj {
                    elem: elem.clone(),
                    data: Rc::new(RefCell::new(data)),
                })
            }
            _ => Value::Nil,
        }
    }

    /// Copies value-semantics kinds (structs, arrays); shares the rest.
    pub fn deep_copy(&self) -> Value {
        match self {
            Value::Struct(s) => Value::Struct(s.copy()),
            Value::Array(a) => Value::Array(ArrayObj {
                elem: a.elem.clone(),
                data: Rc::new(RefCell::new(
                    a.data.borrow().iter().map(|v| v.deep_copy()).collect(),
                )),
            }),
            other => other.clone(),
        }
    }

    pub fn as_int(&self) -> i64 {
        match self {
            Value::Int(i) => *i,
            Value::Bool(b) => *b as i64,
            _ => 0,
        }
    }

    pub fn as_float(&self) -> f64 {
        match self {
            Value::Float(f) => *f,
            Value::Int(i) => *i as f64,
            _ => 0.0,
        }
    }

    pub fn as_str(&self) -> Rc<str> {
        match self {
            Value::Str(s) => s.clone(),
            _ => Rc::from(""),
        }
    }

    /// Dynamic type check used by type assertions: does this value's
    /// dynamic type match `typ`?
    pub fn has_type(&self, typ: &TypeHandle) -> bool {
        use crate::types::BasicKind;
        match (self, &*Type::underlying(typ)) {
            (Value::Bool(_), Type::Basic(BasicKind::Bool)) => true,
            (Value::Int(_), Type::Basic(k)) => k.is_integer(),
            (Value::Float(_), Type::Basic(k)) => k.is_float(),
            (Value::Str(_), Type::Basic(BasicKind::String)) => true,
            (Value::Slice(s), Type::Slice(e)) => Type::identical(&s.elem, e),
            (Value::Array(a), Type::Array(n, e)) => {
                a.data.borrow().len() == *n && Type::identical(&a.elem, e)
            }
            (Value::Map(m), Type::Map(k, v)) => {
                Type::identical(&m.key, k) && Type::identical(&m.value, v)
            }
            (Value::Chan(c), Type::Chan(_, e)) => Type::identical(&c.elem, e),
            (Value::Struct(s), _) => Type::identical(&s.typ, typ),
            (Value::Cell(_), Type::Pointer(_)) => true,
            (Value::Func(_), Type::Func(_)) => true,
            _ => false,
        }
    }

    /// Equality for `==` on interface values and map keys of interface
    /// type. Returns `None` when the operands are not comparable at
    /// runtime (slices, maps, functions).
    pub fn equals(&self, other: &Value) -> Option<bool> {
        match (self, other) {
            (Value::Nil, Value::Nil) => Some(true),
            (Value::Nil, _) | (_, Value::Nil) => Some(false),
            (Value::Bool(a), Value::Bool(b)) => Some(a == b),
            (Value::Int(a), Value::Int(b)) => Some(a == b),
            (Value::Float(a), Value::Float(b)) => Some(a == b),
            (Value::Str(a), Value::Str(b)) => Some(a == b),
            (Value::Chan(a), Value::Chan(b)) => Some(Rc::ptr_eq(a, b)),
            (Value::Cell(a), Value::Cell(b)) => Some(Rc::ptr_eq(a, b)),
            (Value::Struct(a), Value::Struct(b)) => {
                if !Type::identical(&a.typ, &b.typ) {
                    return Some(false);
                }
                let fa = a.fields.borrow();
                let fb = b.fields.borrow();
                for (x, y) in fa.iter().zip(fb.iter()) {
                    match x.equals(y) {
                        Some(true) => {}
                        other => return other,
                    }
                }
                Some(true)
            }
            (Value::Slice(_), _) | (_, Value::Slice(_)) => None,
            (Value::Map(_), _) | (_, Value::Map(_)) => None,
            (Value::Func(_), _) | (_, Value::Func(_)) => None,
            _ => Some(false),
        }
    }

    /// Hashable key form for map storage; `None` for unhashable values.
    pub fn map_key(&self) -> Option<MapKey> {
        match self {
            Value::Bool(b) => Some(MapKey::Bool(*b)),
            Value::Int(i) => Some(MapKey::Int(*i)),
            Value::Float(f) => Some(MapKey::Float(f.to_bits())),
            Value::Str(s) => Some(MapKey::Str(s.clone())),
            Value::Nil => Some(MapKey::Nil),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Slice(s) => write!(f, "slice(len={}, cap={})", s.len, s.cap),
            Value::Array(a) => write!(f, "array(len={})", a.data.borrow().len()),
            Value::Map(m) => write!(f, "map(len={})", m.data.borrow().len()),
            Value::Chan(_) => f.write_str("chan"),
            Value::Func(_) => f.write_str("func"),
            Value::Struct(s) => write!(f, "struct {}", s.typ),
            Value::Cell(_) => f.write_str("ptr"),
        }
    }
}

/// Map key wrapper with the hashability rules of the language: basic
/// kinds hash by value, floats by bit pattern.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum MapKey {
    Nil,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(Rc<str>),
}

/// A slice header: shared backing array plus offset/len/cap, so reslicing
/// aliases the base array exactly as the language requires.
#[derive(Clone)]
pub struct SliceObj {
    pub elem: TypeHandle,
    pub array: Rc<RefCell<Vec<Value>>>,
    pub off: usize,
    pub len: usize,
    pub cap: usize,
}

impl SliceObj {
    pub fn with_len_cap(elem: TypeHandle, len: usize, cap: usize) -> SliceObj {
        let mut data = Vec::with_capacity(cap);
        for _ in 0..cap {
            data.push(Value::zero(&elem));
        }
        SliceObj {
            elem,
            array: Rc::new(RefCell::new(data)),
            off: 0,
            len,
            cap,
        }
    }

    pub fn get(&self, i: usize) -> Option<Value> {
        if i < self.len {
            Some(self.array.borrow()[self.off + i].clone())
        } else {
            None
        }
    }

    pub fn set(&self, i: usize, v: Value) -> bool {
        if i < self.len {
            self.array.borrow_mut()[self.off + i] = v;
            true
        } else {
            false
        }
    }

    /// `s[low:high]` — shares the backing array. Returns `None` on bounds
    /// violation (`0 <= low <= high <= cap`).
    pub fn reslice(&self, low: usize, high: usize) -> Option<SliceObj> {
        if low > high || high > self.cap {
            return None;
        }
        Some(SliceObj {
            elem: self.elem.clone(),
            array: self.array.clone(),
            off: self.off + low,
            len: high - low,
            cap: self.cap - low,
        })
    }

    /// Appends one value, growing the backing array with the usual
    /// doubling rule when capacity is exhausted. Returns the new header.
    pub fn append(&self, v: Value) -> SliceObj {
        if self.len < self.cap {
            self.array.borrow_mut()[self.off + self.len] = v;
            SliceObj {
                elem: self.elem.clone(),
                array: self.array.clone(),
                off: self.off,
                len: self.len + 1,
                cap: self.cap,
            }
        } else {
            let new_cap = grow_cap(self.cap, self.len + 1);
            let mut data = Vec::with_capacity(new_cap);
            {
                let arr = self.array.borrow();
                data.extend_from_slice(&arr[self.off..self.off + self.len]);
            }
            data.push(v);
            for _ in data.len()..new_cap {
                data.push(Value::zero(&self.elem));
            }
            SliceObj {
                elem: self.elem.clone(),
                array: Rc::new(RefCell::new(data)),
                off: 0,
                len: self.len + 1,
                cap: new_cap,
            }
        }
    }
}

/// Capacity growth rule for append: double until large, then 1.25x.
pub fn grow_cap(cap: usize, needed: usize) -> usize {
    let mut new_cap = if cap == 0 { 4 } else { cap };
    while new_cap < needed {
        if new_cap < 1024 {
            new_cap *= 2;
        } else {
            new_cap += new_cap / 4;
        }
    }
    new_cap
}

/// A fixed-size array value. Copies on assignment (see
/// [`Value::deep_copy`]); indexing shares element storage only through
/// explicit pointers.
#[derive(Clone)]
pub struct ArrayObj {
    pub elem: TypeHandle,
    pub data: Rc<RefCell<Vec<Value>>>,
}

impl ArrayObj {
    /// The full-array slice view used when ranging or slicing an array.
    pub fn as_slice(&self) -> SliceObj {
        let len = self.data.borrow().len();
        SliceObj {
            elem: self.elem.clone(),
            array: self.data.clone(),
            off: 0,
            len,
            cap: len,
        }
    }
}

#[derive(Clone)]
pub struct MapObj {
    pub key: TypeHandle,
    pub value: TypeHandle,
    pub data: Rc<RefCell<HashMap<MapKey, Value>>>,
}

impl MapObj {
    pub fn with_capacity(key: TypeHandle, value: TypeHandle, n: usize) -> MapObj {
        MapObj {
            key,
            value,
            data: Rc::new(RefCell::new(HashMap::with_capacity(n))),
        }
    }
}

#[derive(Clone)]
pub struct StructObj {
    pub typ: TypeHandle,
    pub fields: Rc<RefCell<Vec<Value>>>,
}

impl StructObj {
    pub fn zero(typ: TypeHandle, fields: &[crate::types::StructField]) -> StructObj {
        let data = fields.iter().map(|f| Value::zero(&f.typ)).collect();
        StructObj {
            typ,
            fields: Rc::new(RefCell::new(data)),
        }
    }

    /// Field copy for struct assignment.
    pub fn copy(&self) -> StructObj {
        StructObj {
            typ: self.typ.clone(),
            fields: Rc::new(RefCell::new(
                self.fields.borrow().iter().map(|v| v.deep_copy()).collect(),
            )),
        }
    }
}

/// Runtime representation of a first-class function.
///
/// Exactly one variant is populated at a time. A bound method is promoted
/// to its resolved native function on first call; the promotion is
/// idempotent and observationally transparent.
#[derive(Clone)]
pub enum Callable {
    /// A function compiled from source, with its captured cells.
    Fn { fn_id: u32, cells: Vec<CellRef> },
    /// A host function exposed through the native bridge.
    Native(Rc<NativeFunction>),
    /// A method value bound to a receiver, resolved lazily by name.
    Method { recv: Box<Value>, name: String },
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callable::Fn { fn_id, cells } => {
                write!(f, "fn#{} ({} captured)", fn_id, cells.len())
            }
            Callable::Native(n) => write!(f, "native {}.{}", n.pkg, n.name),
            Callable::Method { name, .. } => write!(f, "method {}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BasicKind;

    #[test]
    fn reslice_aliases_backing_array() {
        let s = SliceObj::with_len_cap(Type::basic(BasicKind::Int), 4, 4);
        let sub = s.reslice(1, 3).unwrap();
        assert_eq!(sub.len, 2);
        sub.set(0, Value::Int(9));
        assert_eq!(s.get(1).unwrap().as_int(), 9);
    }

    #[test]
    fn append_within_capacity_shares_array() {
        let s = SliceObj::with_len_cap(Type::basic(BasicKind::Int), 0, 2);
        let s2 = s.append(Value::Int(7));
        assert_eq!(s2.len, 1);
        assert!(Rc::ptr_eq(&s.array, &s2.array));
        let s3 = s2.append(Value::Int(8)).append(Value::Int(9));
        assert!(!Rc::ptr_eq(&s.array, &s3.array));
        assert_eq!(s3.get(2).unwrap().as_int(), 9);
    }

    #[test]
    fn struct_copy_is_independent() {
        let fields = vec![crate::types::StructField {
            name: "x".into(),
            typ: Type::basic(BasicKind::Int),
        }];
        let typ = Rc::new(Type::Struct(fields.clone()));
        let a = StructObj::zero(typ, &fields);
        let b = a.copy();
        b.fields.borrow_mut()[0] = Value::Int(5);
        assert_eq!(a.fields.borrow()[0].as_int(), 0);
    }

    #[test]
    fn interface_equality() {
        assert_eq!(Value::Int(3).equals(&Value::Int(3)), Some(true));
        assert_eq!(Value::Nil.equals(&Value::Int(0)), Some(false));
        let s = SliceObj::with_len_cap(Type::basic(BasicKind::Int), 0, 0);
        assert_eq!(Value::Slice(s.clone()).equals(&Value::Slice(s)), None);
    }

    #[test]
    fn grow_cap_doubles_small() {
        assert_eq!(grow_cap(0, 1), 4);
        assert_eq!(grow_cap(4, 5), 8);
        assert_eq!(grow_cap(2048, 2049), 2560);
    }
}
