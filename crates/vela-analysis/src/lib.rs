//! The Vela type checker.
//!
//! Consumes an externally-parsed AST and produces a [`CheckedProgram`]:
//! the same AST plus a side table mapping every expression to its
//! [`ExprInfo`], resolved entities for every identifier, the global
//! variable table, capture lists for function literals, and the
//! dependency-sorted declaration order for the main package.

pub mod constant;
pub mod scope;
pub mod universe;

mod check;

pub use check::assignment;
pub use check::errors::CheckError;
pub use check::type_info::{
    Capture, CheckedProgram, Entity, ExprInfo, GlobalInfo, Properties, TypeInfo, VarDef,
};
pub use check::{check_program, check_script, Checker};
pub use universe::Builtin;
