//! Diagnostic reporting.
//!
//! Compiler errors are collected in a [`DiagnosticSink`] during checking and
//! emission. Each diagnostic carries a severity, the source path, a
//! [`Position`] and a message, plus optional secondary labels (used for
//! cycle paths and redeclaration notes).
//!
//! Two renderings are supported: the plain `path:line:col: message` form
//! used by the build API's error type, and rich annotated snippets through
//! `codespan-reporting` when the host supplies source text.

use std::fmt;

use codespan_reporting::diagnostic::{
    Diagnostic as CsDiagnostic, Label as CsLabel, Severity as CsSeverity,
};
use codespan_reporting::files::SimpleFiles;
use codespan_reporting::term::{self, termcolor::WriteColor, Config};

use crate::span::Position;

/// Severity level of a diagnostic.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl Severity {
    #[inline]
    pub const fn is_error(self) -> bool {
        matches!(self, Severity::Error)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Note => write!(f, "note"),
        }
    }
}

impl From<Severity> for CsSeverity {
    fn from(s: Severity) -> Self {
        match s {
            Severity::Error => CsSeverity::Error,
            Severity::Warning => CsSeverity::Warning,
            Severity::Note => CsSeverity::Note,
        }
    }
}

/// A secondary location attached to a diagnostic.
#[derive(Clone, Debug)]
pub struct Label {
    pub pos: Position,
    pub message: String,
}

impl Label {
    pub fn new(pos: Position, message: impl Into<String>) -> Self {
        Self {
            pos,
            message: message.into(),
        }
    }
}

/// A single compiler diagnostic.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub path: String,
    pub pos: Position,
    pub message: String,
    pub labels: Vec<Label>,
}

impl Diagnostic {
    pub fn error(path: impl Into<String>, pos: Position, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            path: path.into(),
            pos,
            message: message.into(),
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, pos: Position, message: impl Into<String>) -> Self {
        self.labels.push(Label::new(pos, message));
        self
    }
}

impl fmt::Display for Diagnostic {
    /// The plain `path:line:col: message` rendering.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pos.is_unknown() {
            write!(f, "{}: {}", self.path, self.message)
        } else {
            write!(f, "{}:{}: {}", self.path, self.pos, self.message)
        }
    }
}

/// Collects diagnostics during a build.
#[derive(Debug, Default)]
pub struct DiagnosticSink {
    diagnostics: Vec<Diagnostic>,
    errors: usize,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, d: Diagnostic) {
        if d.severity.is_error() {
            self.errors += 1;
        }
        self.diagnostics.push(d);
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Takes the first error out of the sink, if any.
    pub fn first_error(&self) -> Option<&Diagnostic> {
        self.diagnostics.iter().find(|d| d.severity.is_error())
    }

    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        self.diagnostics
    }

    /// Renders all diagnostics as annotated snippets.
    ///
    /// `sources` maps a path to its source text; diagnostics whose path has
    /// no source fall back to the plain one-line form.
    pub fn render(
        &self,
        sources: &[(&str, &str)],
        writer: &mut dyn WriteColor,
    ) -> Result<(), codespan_reporting::files::Error> {
        let mut files = SimpleFiles::new();
        let mut ids = Vec::new();
        for (path, text) in sources {
            ids.push((*path, files.add(path.to_string(), text.to_string())));
        }
        let config = Config::default();
        for d in &self.diagnostics {
            let file_id = ids.iter().find(|(p, _)| *p == d.path).map(|(_, id)| *id);
            match file_id {
                Some(id) => {
                    let mut cs = CsDiagnostic::new(d.severity.into())
                        .with_message(&d.message)
                        .with_labels(vec![CsLabel::primary(id, d.pos.byte_range())]);
                    for label in &d.labels {
                        cs = cs.with_labels(vec![CsLabel::secondary(id, label.pos.byte_range())
                            .with_message(&label.message)]);
                    }
                    term::emit(writer, &config, &files, &cs)?;
                }
                None => {
                    writeln!(writer, "{}: {}", d.severity, d)
                        .map_err(codespan_reporting::files::Error::Io)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_rendering() {
        let d = Diagnostic::error("main.vela", Position::at(4, 7), "undefined: x");
        assert_eq!(d.to_string(), "main.vela:4:7: undefined: x");
    }

    #[test]
    fn sink_counts_errors_only() {
        let mut sink = DiagnosticSink::new();
        sink.emit(Diagnostic::error("a", Position::at(1, 1), "boom"));
        sink.emit(Diagnostic {
            severity: Severity::Warning,
            path: "a".into(),
            pos: Position::at(2, 1),
            message: "meh".into(),
            labels: Vec::new(),
        });
        assert!(sink.has_errors());
        assert_eq!(sink.error_count(), 1);
        assert_eq!(sink.diagnostics().len(), 2);
    }
}
