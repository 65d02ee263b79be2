//! Compile-time constant values and arithmetic.
//!
//! Untyped constants are evaluated at arbitrary precision: integers use
//! `i64` while they fit and `BigInt` beyond, floats use exact rationals
//! while "reasonably" sized and `f64` past that. Operations mirror the
//! language rules: integer division truncates, `/` on floats is exact
//! rational division, division by zero and float remainder are errors
//! reported by the checker.

use std::fmt;

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{ToPrimitive, Zero};

use vela_runtime::types::{BasicKind, Type, TypeHandle};
use vela_runtime::value::Value;
use vela_syntax::op::{BinaryOp, UnaryOp};

/// Rationals wider than this exponent collapse to `f64`.
const MAX_EXP: u64 = 4 << 10;

#[derive(Clone, Debug, PartialEq)]
pub enum ConstValue {
    Bool(bool),
    Str(String),
    /// Integer that fits in an `i64`.
    Int64(i64),
    /// Integer beyond `i64`.
    IntBig(BigInt),
    /// Exact rational.
    Rat(BigRational),
    /// Approximate float (escaped the rational range).
    Float(f64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConstKind {
    Bool,
    String,
    Int,
    Float,
}

impl ConstKind {
    /// The default type an untyped constant assumes without context.
    pub fn default_type(self) -> TypeHandle {
        match self {
            ConstKind::Bool => Type::basic(BasicKind::Bool),
            ConstKind::String => Type::basic(BasicKind::String),
            ConstKind::Int => Type::basic(BasicKind::Int),
            ConstKind::Float => Type::basic(BasicKind::Float64),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ConstKind::Bool => "bool",
            ConstKind::String => "string",
            ConstKind::Int => "int",
            ConstKind::Float => "float",
        }
    }
}

/// Errors surfaced to the checker with positions attached there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstError {
    DivisionByZero,
    FloatModulo,
    MismatchedTypes,
    InvalidOperation,
    Overflow(&'static str),
}

impl fmt::Display for ConstError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstError::DivisionByZero => write!(f, "division by zero"),
            ConstError::FloatModulo => write!(f, "operator % not defined on float"),
            ConstError::MismatchedTypes => write!(f, "mismatched types"),
            ConstError::InvalidOperation => write!(f, "invalid operation"),
            ConstError::Overflow(what) => write!(f, "constant overflows {}", what),
        }
    }
}

impl ConstValue {
    pub fn kind(&self) -> ConstKind {
        match self {
            ConstValue::Bool(_) => ConstKind::Bool,
            ConstValue::Str(_) => ConstKind::String,
            ConstValue::Int64(_) | ConstValue::IntBig(_) => ConstKind::Int,
            ConstValue::Rat(_) | ConstValue::Float(_) => ConstKind::Float,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self.kind(), ConstKind::Int | ConstKind::Float)
    }

    /// Parses an integer literal (decimal, hex, octal, binary, with
    /// optional `_` separators).
    pub fn parse_int(lit: &str) -> Option<ConstValue> {
        let s: String = lit.chars().filter(|c| *c != '_').collect();
        let (radix, digits) = if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            (16, rest)
        } else if let Some(rest) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
            (2, rest)
        } else if let Some(rest) = s.strip_prefix("0o").or_else(|| s.strip_prefix("0O")) {
            (8, rest)
        } else {
            (10, s.as_str())
        };
        if let Ok(v) = i64::from_str_radix(digits, radix) {
            return Some(ConstValue::Int64(v));
        }
        BigInt::parse_bytes(digits.as_bytes(), radix).map(ConstValue::IntBig)
    }

    /// Parses a float literal into an exact rational when possible.
    pub fn parse_float(lit: &str) -> Option<ConstValue> {
        let s: String = lit.chars().filter(|c| *c != '_').collect();
        if let Some(rat) = rational_from_decimal(&s) {
            return Some(norm_rat(rat));
        }
        s.parse::<f64>().ok().map(ConstValue::Float)
    }

    /// The runtime value of this constant at its default (or given) type.
    pub fn to_value(&self, typ: &TypeHandle) -> Value {
        match Type::underlying(typ).basic_kind() {
            Some(k) if k.is_float() => Value::Float(self.to_f64()),
            Some(BasicKind::Bool) => Value::Bool(matches!(self, ConstValue::Bool(true))),
            Some(BasicKind::String) => match self {
                ConstValue::Str(s) => Value::str(s),
                _ => Value::str(""),
            },
            Some(_) => Value::Int(self.to_i64().unwrap_or(0)),
            None => match self {
                ConstValue::Str(s) => Value::str(s),
                ConstValue::Bool(b) => Value::Bool(*b),
                _ => Value::Int(self.to_i64().unwrap_or(0)),
            },
        }
    }

    pub fn to_i64(&self) -> Option<i64> {
        match self {
            ConstValue::Int64(v) => Some(*v),
            ConstValue::IntBig(v) => v.to_i64(),
            ConstValue::Rat(r) if r.is_integer() => r.numer().to_i64(),
            ConstValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn to_f64(&self) -> f64 {
        match self {
            ConstValue::Int64(v) => *v as f64,
            ConstValue::IntBig(v) => v.to_f64().unwrap_or(f64::INFINITY),
            ConstValue::Rat(r) => r.to_f64().unwrap_or(f64::INFINITY),
            ConstValue::Float(f) => *f,
            ConstValue::Bool(_) | ConstValue::Str(_) => 0.0,
        }
    }

    /// Whether this constant is representable by the basic kind of `typ`
    /// without loss (truncation is loss for integers, not for floats).
    pub fn representable(&self, typ: &TypeHandle) -> bool {
        let kind = match Type::underlying(typ).basic_kind() {
            Some(k) => k,
            None => return false,
        };
        match kind {
            BasicKind::Bool => matches!(self, ConstValue::Bool(_)),
            BasicKind::String => matches!(self, ConstValue::Str(_)),
            k if k.is_float() => self.is_numeric(),
            k if k.is_integer() => {
                let v = match self.to_i64() {
                    Some(v) => v,
                    None => return false,
                };
                let bits = k.bits();
                if k.is_unsigned() {
                    if v < 0 {
                        return false;
                    }
                    bits == 64 || (v as u64) < (1u64 << bits)
                } else {
                    bits == 64 || (-(1i64 << (bits - 1))..(1i64 << (bits - 1))).contains(&v)
                }
            }
            _ => false,
        }
    }
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Bool(b) => write!(f, "{}", b),
            ConstValue::Str(s) => write!(f, "{:?}", s),
            ConstValue::Int64(v) => write!(f, "{}", v),
            ConstValue::IntBig(v) => write!(f, "{}", v),
            ConstValue::Rat(r) if r.is_integer() => write!(f, "{}", r.numer()),
            ConstValue::Rat(r) => write!(f, "{}", r),
            ConstValue::Float(v) => write!(f, "{}", v),
        }
    }
}

// --- normalization ---

fn norm_big(v: BigInt) -> ConstValue {
    match v.to_i64() {
        Some(small) => ConstValue::Int64(small),
        None => ConstValue::IntBig(v),
    }
}

fn norm_rat(r: BigRational) -> ConstValue {
    if r.is_integer() {
        return norm_big(r.numer().clone());
    }
    if r.numer().bits() > MAX_EXP || r.denom().bits() > MAX_EXP {
        return ConstValue::Float(r.to_f64().unwrap_or(f64::INFINITY));
    }
    ConstValue::Rat(r)
}

fn to_big(v: &ConstValue) -> Option<BigInt> {
    match v {
        ConstValue::Int64(x) => Some(BigInt::from(*x)),
        ConstValue::IntBig(x) => Some(x.clone()),
        _ => None,
    }
}

fn to_rat(v: &ConstValue) -> Option<BigRational> {
    match v {
        ConstValue::Int64(x) => Some(BigRational::from(BigInt::from(*x))),
        ConstValue::IntBig(x) => Some(BigRational::from(x.clone())),
        ConstValue::Rat(r) => Some(r.clone()),
        ConstValue::Float(f) => BigRational::from_float(*f),
        _ => None,
    }
}

fn rational_from_decimal(s: &str) -> Option<BigRational> {
    // "12.5", "1e9", "2.5e-3" — mantissa over a power of ten.
    let (mantissa, exp) = match s.find(['e', 'E']) {
        Some(i) => (&s[..i], s[i + 1..].parse::<i64>().ok()?),
        None => (s, 0),
    };
    if exp.unsigned_abs() > MAX_EXP {
        return None;
    }
    let (int_part, frac_part) = match mantissa.find('.') {
        Some(i) => (&mantissa[..i], &mantissa[i + 1..]),
        None => (mantissa, ""),
    };
    let digits = format!("{}{}", int_part, frac_part);
    let numer = BigInt::parse_bytes(digits.as_bytes(), 10)?;
    let scale = frac_part.len() as i64 - exp;
    let ten = BigInt::from(10);
    Some(if scale >= 0 {
        BigRational::new(numer, num_traits::pow(ten, scale as usize))
    } else {
        BigRational::from(numer * num_traits::pow(ten, (-scale) as usize))
    })
}

// --- operations ---

/// Binary arithmetic on two constants of compatible kinds.
pub fn binary(op: BinaryOp, x: &ConstValue, y: &ConstValue) -> Result<ConstValue, ConstError> {
    use BinaryOp::*;
    match op {
        LogicalAnd | LogicalOr => match (x, y) {
            (ConstValue::Bool(a), ConstValue::Bool(b)) => Ok(ConstValue::Bool(if op == LogicalAnd {
                *a && *b
            } else {
                *a || *b
            })),
            _ => Err(ConstError::MismatchedTypes),
        },
        Eq | Ne | Lt | Le | Gt | Ge => compare(op, x, y).map(ConstValue::Bool),
        Add if x.kind() == ConstKind::String => match (x, y) {
            (ConstValue::Str(a), ConstValue::Str(b)) => Ok(ConstValue::Str(format!("{}{}", a, b))),
            _ => Err(ConstError::MismatchedTypes),
        },
        Shl | Shr => shift(op, x, y),
        BitAnd | BitOr | BitXor | AndNot | Rem => {
            let (a, b) = match (to_big(x), to_big(y)) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(if op == Rem && x.is_numeric() && y.is_numeric() {
                        ConstError::FloatModulo
                    } else {
                        ConstError::MismatchedTypes
                    })
                }
            };
            let r = match op {
                BitAnd => a & b,
                BitOr => a | b,
                BitXor => a ^ b,
                AndNot => a & !b,
                Rem => {
                    if b.is_zero() {
                        return Err(ConstError::DivisionByZero);
                    }
                    a % b
                }
                _ => unreachable!(),
            };
            Ok(norm_big(r))
        }
        Add | Sub | Mul | Div => {
            if !x.is_numeric() || !y.is_numeric() {
                return Err(ConstError::MismatchedTypes);
            }
            // Integer / integer stays integer except for `/` producing a
            // non-exact quotient only when one side is already float-ish.
            if x.kind() == ConstKind::Int && y.kind() == ConstKind::Int {
                let (a, b) = (to_big(x).unwrap(), to_big(y).unwrap());
                let r = match op {
                    Add => a + b,
                    Sub => a - b,
                    Mul => a * b,
                    Div => {
                        if b.is_zero() {
                            return Err(ConstError::DivisionByZero);
                        }
                        a / b
                    }
                    _ => unreachable!(),
                };
                return Ok(norm_big(r));
            }
            let (a, b) = match (to_rat(x), to_rat(y)) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    // One side escaped to f64 infinity/NaN.
                    let (fa, fb) = (x.to_f64(), y.to_f64());
                    let r = match op {
                        Add => fa + fb,
                        Sub => fa - fb,
                        Mul => fa * fb,
                        Div => {
                            if fb == 0.0 {
                                return Err(ConstError::DivisionByZero);
                            }
                            fa / fb
                        }
                        _ => unreachable!(),
                    };
                    return Ok(ConstValue::Float(r));
                }
            };
            let r = match op {
                Add => a + b,
                Sub => a - b,
                Mul => a * b,
                Div => {
                    if b.is_zero() {
                        return Err(ConstError::DivisionByZero);
                    }
                    a / b
                }
                _ => unreachable!(),
            };
            Ok(norm_rat(r))
        }
    }
}

fn shift(op: BinaryOp, x: &ConstValue, y: &ConstValue) -> Result<ConstValue, ConstError> {
    let a = to_big(x).ok_or(ConstError::InvalidOperation)?;
    let n = y.to_i64().ok_or(ConstError::InvalidOperation)?;
    if n < 0 {
        return Err(ConstError::InvalidOperation);
    }
    if n as u64 > MAX_EXP {
        return Err(ConstError::Overflow("shift count"));
    }
    let r = match op {
        BinaryOp::Shl => a << (n as usize),
        BinaryOp::Shr => a >> (n as usize),
        _ => unreachable!(),
    };
    Ok(norm_big(r))
}

/// Comparison; mixed default kinds are a type error.
pub fn compare(op: BinaryOp, x: &ConstValue, y: &ConstValue) -> Result<bool, ConstError> {
    use std::cmp::Ordering;
    let ord = match (x, y) {
        (ConstValue::Bool(a), ConstValue::Bool(b)) => {
            return match op {
                BinaryOp::Eq => Ok(a == b),
                BinaryOp::Ne => Ok(a != b),
                _ => Err(ConstError::InvalidOperation),
            }
        }
        (ConstValue::Str(a), ConstValue::Str(b)) => a.cmp(b),
        _ if x.is_numeric() && y.is_numeric() => match (to_rat(x), to_rat(y)) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => x
                .to_f64()
                .partial_cmp(&y.to_f64())
                .unwrap_or(Ordering::Equal),
        },
        _ => return Err(ConstError::MismatchedTypes),
    };
    Ok(match op {
        BinaryOp::Eq => ord == Ordering::Equal,
        BinaryOp::Ne => ord != Ordering::Equal,
        BinaryOp::Lt => ord == Ordering::Less,
        BinaryOp::Le => ord != Ordering::Greater,
        BinaryOp::Gt => ord == Ordering::Greater,
        BinaryOp::Ge => ord != Ordering::Less,
        _ => return Err(ConstError::InvalidOperation),
    })
}

pub fn unary(op: UnaryOp, x: &ConstValue) -> Result<ConstValue, ConstError> {
    match op {
        UnaryOp::Pos if x.is_numeric() => Ok(x.clone()),
        UnaryOp::Neg => match x {
            ConstValue::Int64(v) => Ok(match v.checked_neg() {
                Some(n) => ConstValue::Int64(n),
                None => ConstValue::IntBig(-BigInt::from(*v)),
            }),
            ConstValue::IntBig(v) => Ok(norm_big(-v.clone())),
            ConstValue::Rat(r) => Ok(norm_rat(-r.clone())),
            ConstValue::Float(f) => Ok(ConstValue::Float(-f)),
            _ => Err(ConstError::InvalidOperation),
        },
        UnaryOp::Not => match x {
            ConstValue::Bool(b) => Ok(ConstValue::Bool(!b)),
            _ => Err(ConstError::InvalidOperation),
        },
        UnaryOp::BitNot => match to_big(x) {
            Some(v) => Ok(norm_big(!v)),
            None => Err(ConstError::InvalidOperation),
        },
        _ => Err(ConstError::InvalidOperation),
    }
}

/// Truncates a constant to an integer (for int conversions); `None` when
/// the value has a fractional part.
pub fn to_int(x: &ConstValue) -> Option<ConstValue> {
    match x {
        ConstValue::Int64(_) | ConstValue::IntBig(_) => Some(x.clone()),
        ConstValue::Rat(r) if r.is_integer() => Some(norm_big(r.numer().clone())),
        ConstValue::Float(f) if f.fract() == 0.0 && f.is_finite() => {
            Some(ConstValue::Int64(*f as i64))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i64) -> ConstValue {
        ConstValue::Int64(v)
    }

    #[test]
    fn arithmetic_folds_with_precedence_applied() {
        // 1 + 2 * 3 evaluated as two folds.
        let six = binary(BinaryOp::Mul, &int(2), &int(3)).unwrap();
        let seven = binary(BinaryOp::Add, &int(1), &six).unwrap();
        assert_eq!(seven.to_i64(), Some(7));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert_eq!(
            binary(BinaryOp::Div, &int(1), &int(0)),
            Err(ConstError::DivisionByZero)
        );
        assert_eq!(
            binary(BinaryOp::Rem, &int(1), &int(0)),
            Err(ConstError::DivisionByZero)
        );
    }

    #[test]
    fn float_modulo_is_an_error() {
        let f = ConstValue::parse_float("1.5").unwrap();
        assert_eq!(
            binary(BinaryOp::Rem, &f, &int(1)),
            Err(ConstError::FloatModulo)
        );
    }

    #[test]
    fn mixed_default_kinds_mismatch() {
        let s = ConstValue::Str("x".into());
        assert_eq!(
            binary(BinaryOp::Add, &s, &int(1)),
            Err(ConstError::MismatchedTypes)
        );
    }

    #[test]
    fn big_integers_round_trip_through_overflow() {
        let max = int(i64::MAX);
        let sum = binary(BinaryOp::Add, &max, &int(1)).unwrap();
        assert!(matches!(sum, ConstValue::IntBig(_)));
        let back = binary(BinaryOp::Sub, &sum, &int(1)).unwrap();
        assert_eq!(back.to_i64(), Some(i64::MAX));
    }

    #[test]
    fn rational_division_is_exact() {
        let third = binary(BinaryOp::Div, &ConstValue::parse_float("1.0").unwrap(), &ConstValue::parse_float("3.0").unwrap()).unwrap();
        let one = binary(BinaryOp::Mul, &third, &ConstValue::parse_float("3.0").unwrap()).unwrap();
        assert_eq!(one.to_i64(), Some(1));
    }

    #[test]
    fn integer_division_truncates() {
        let q = binary(BinaryOp::Div, &int(7), &int(2)).unwrap();
        assert_eq!(q.to_i64(), Some(3));
    }

    #[test]
    fn representability() {
        assert!(int(255).representable(&Type::basic(BasicKind::Uint8)));
        assert!(!int(256).representable(&Type::basic(BasicKind::Uint8)));
        assert!(!int(-1).representable(&Type::basic(BasicKind::Uint64)));
        assert!(int(127).representable(&Type::basic(BasicKind::Int8)));
        assert!(!int(128).representable(&Type::basic(BasicKind::Int8)));
    }

    #[test]
    fn literal_parsing() {
        assert_eq!(ConstValue::parse_int("0x10").unwrap().to_i64(), Some(16));
        assert_eq!(ConstValue::parse_int("1_000").unwrap().to_i64(), Some(1000));
        assert_eq!(ConstValue::parse_float("2.5e1").unwrap().to_i64(), Some(25));
    }

    #[test]
    fn comparisons_yield_bool() {
        assert_eq!(compare(BinaryOp::Lt, &int(1), &int(2)), Ok(true));
        assert_eq!(
            compare(BinaryOp::Eq, &ConstValue::Str("a".into()), &int(1)),
            Err(ConstError::MismatchedTypes)
        );
    }
}
