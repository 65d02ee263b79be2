//! Runtime support for the Vela virtual machine.
//!
//! This crate defines everything the VM and the compiler back-end share:
//! the runtime value model (the general register bank), channels, the
//! native-function bridge through which host code is exposed to bytecode,
//! the execution environment (globals, memory accounting, context, exit
//! hooks), the predefined-package manifest, and the bytecode format itself
//! (instructions, functions, modules). The `vela-vm` crate re-exports the
//! bytecode modules.

pub mod chan;
pub mod env;
pub mod function;
pub mod instruction;
pub mod native;
pub mod package;
pub mod types;
pub mod value;

pub use chan::{Channel, RecvOutcome, SendOutcome};
pub use env::{Context, Env, ExitKind};
pub use function::{Function, Global, Module};
pub use instruction::{Condition, Instruction, Opcode};
pub use native::{Kind, NativeFunction, NativeImpl};
pub use package::{DeclaredPackage, NativeDecl, NativePackage, Packages};
pub use types::{ChanDir, Type, TypeHandle};
pub use value::{new_cell, ArrayObj, Callable, CellRef, MapKey, MapObj, SliceObj, StructObj, Value};
