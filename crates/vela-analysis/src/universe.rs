//! The universe block: predeclared types, constants and builtins.

use vela_runtime::types::{BasicKind, Type, TypeHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Append,
    Cap,
    Close,
    Complex,
    Copy,
    Delete,
    Imag,
    Len,
    Make,
    New,
    Panic,
    Print,
    Println,
    Real,
    Recover,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Append => "append",
            Builtin::Cap => "cap",
            Builtin::Close => "close",
            Builtin::Complex => "complex",
            Builtin::Copy => "copy",
            Builtin::Delete => "delete",
            Builtin::Imag => "imag",
            Builtin::Len => "len",
            Builtin::Make => "make",
            Builtin::New => "new",
            Builtin::Panic => "panic",
            Builtin::Print => "print",
            Builtin::Println => "println",
            Builtin::Real => "real",
            Builtin::Recover => "recover",
        }
    }

    pub fn lookup(name: &str) -> Option<Builtin> {
        Some(match name {
            "append" => Builtin::Append,
            "cap" => Builtin::Cap,
            "close" => Builtin::Close,
            "complex" => Builtin::Complex,
            "copy" => Builtin::Copy,
            "delete" => Builtin::Delete,
            "imag" => Builtin::Imag,
            "len" => Builtin::Len,
            "make" => Builtin::Make,
            "new" => Builtin::New,
            "panic" => Builtin::Panic,
            "print" => Builtin::Print,
            "println" => Builtin::Println,
            "real" => Builtin::Real,
            "recover" => Builtin::Recover,
            _ => return None,
        })
    }
}

/// Predeclared type names. `byte` and `rune` are aliases.
pub fn type_for_name(name: &str) -> Option<TypeHandle> {
    let kind = match name {
        "bool" => BasicKind::Bool,
        "int" => BasicKind::Int,
        "int8" => BasicKind::Int8,
        "int16" => BasicKind::Int16,
        "int32" | "rune" => BasicKind::Int32,
        "int64" => BasicKind::Int64,
        "uint" => BasicKind::Uint,
        "uint8" | "byte" => BasicKind::Uint8,
        "uint16" => BasicKind::Uint16,
        "uint32" => BasicKind::Uint32,
        "uint64" => BasicKind::Uint64,
        "float32" => BasicKind::Float32,
        "float64" => BasicKind::Float64,
        "string" => BasicKind::String,
        _ => return None,
    };
    Some(Type::basic(kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_to_their_kinds() {
        assert_eq!(
            type_for_name("byte").unwrap().basic_kind(),
            Some(BasicKind::Uint8)
        );
        assert_eq!(
            type_for_name("rune").unwrap().basic_kind(),
            Some(BasicKind::Int32)
        );
        assert!(type_for_name("complex128").is_none());
    }

    #[test]
    fn builtin_lookup() {
        assert_eq!(Builtin::lookup("len"), Some(Builtin::Len));
        assert_eq!(Builtin::lookup("lenn"), None);
        assert_eq!(Builtin::Make.name(), "make");
    }
}
