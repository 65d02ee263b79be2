//! Checker errors.
//!
//! Checking stops at the first error; it is threaded out with `?` and
//! surfaced by the build API as a `BuildError` rendering
//! `path:line:col: message`.

use thiserror::Error;

use vela_common::{Diagnostic, Position};

#[derive(Debug, Clone, Error)]
#[error("{path}:{pos}: {message}")]
pub struct CheckError {
    pub path: String,
    pub pos: Position,
    pub message: String,
}

impl CheckError {
    pub fn new(path: impl Into<String>, pos: Position, message: impl Into<String>) -> CheckError {
        CheckError {
            path: path.into(),
            pos,
            message: message.into(),
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::error(&self.path, self.pos, &self.message)
    }
}
