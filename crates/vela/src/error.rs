//! Public error taxonomy.

use thiserror::Error;

use vela_analysis::CheckError;
use vela_common::Position;
use vela_runtime::value::Value;
use vela_vm::error::{format_panic_chain, PanicEntry};
use vela_vm::VmError;

/// A compile-time failure: path, position, message.
#[derive(Debug, Clone, Error)]
#[error("{path}:{pos}: {message}")]
pub struct BuildError {
    pub path: String,
    pub pos: Position,
    pub message: String,
}

impl From<CheckError> for BuildError {
    fn from(e: CheckError) -> BuildError {
        BuildError {
            path: e.path,
            pos: e.pos,
            message: e.message,
        }
    }
}

impl BuildError {
    /// The diagnostic form, for annotated-snippet rendering through a
    /// [`vela_common::DiagnosticSink`].
    pub fn to_diagnostic(&self) -> vela_common::Diagnostic {
        vela_common::Diagnostic::error(&self.path, self.pos, &self.message)
    }
}

/// A runtime panic chain, oldest first. `value`/`recovered` describe the
/// newest panic; `next` walks toward the older ones.
#[derive(Debug, Clone)]
pub struct PanicError {
    entries: Vec<PanicEntry>,
}

impl PanicError {
    pub(crate) fn new(entries: Vec<PanicEntry>) -> PanicError {
        PanicError { entries }
    }

    /// The panic value of the newest panic.
    pub fn value(&self) -> &Value {
        &self.entries.last().expect("empty panic chain").msg
    }

    pub fn recovered(&self) -> bool {
        self.entries.last().map(|e| e.recovered).unwrap_or(false)
    }

    /// The next older panic in the chain, if any.
    pub fn next(&self) -> Option<PanicError> {
        if self.entries.len() > 1 {
            Some(PanicError {
                entries: self.entries[..self.entries.len() - 1].to_vec(),
            })
        } else {
            None
        }
    }

    pub fn stack_trace(&self) -> &str {
        self.entries
            .last()
            .map(|e| e.stack.as_str())
            .unwrap_or("")
    }
}

impl std::fmt::Display for PanicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format_panic_chain(&self.entries))
    }
}

impl std::error::Error for PanicError {}

/// A non-zero exit requested through the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("exit status {0}")]
pub struct ExitError(pub i32);

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Panic(#[from] PanicError),
    #[error(transparent)]
    Exit(#[from] ExitError),
    #[error("out of memory")]
    OutOfMemory,
    #[error("context cancelled")]
    ContextCancelled,
    #[error("all goroutines are asleep - deadlock")]
    Deadlock,
    /// A path-based loader was given a malformed path.
    #[error("invalid path {0:?}")]
    InvalidPath(String),
    /// A path-based loader found nothing at the path.
    #[error("path {0:?} does not exist")]
    NotExist(String),
}

pub(crate) fn from_vm_error(e: VmError) -> RuntimeError {
    match e {
        VmError::Panic(entries) => RuntimeError::Panic(PanicError::new(entries)),
        VmError::OutOfMemory => RuntimeError::OutOfMemory,
        VmError::ContextCancelled => RuntimeError::ContextCancelled,
        VmError::Deadlock => RuntimeError::Deadlock,
        VmError::InvalidEntry(id) => RuntimeError::Panic(PanicError::new(vec![PanicEntry {
            msg: Value::str(format!("invalid entry function {}", id)),
            recovered: false,
            stack: String::new(),
        }])),
    }
}
