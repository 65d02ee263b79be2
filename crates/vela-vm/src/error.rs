//! VM error taxonomy.

use std::fmt;

use thiserror::Error;

use vela_runtime::env::format_value;
use vela_runtime::value::Value;

/// One link of a panic chain surfaced to the host.
#[derive(Debug, Clone)]
pub struct PanicEntry {
    pub msg: Value,
    pub recovered: bool,
    pub stack: String,
}

#[derive(Debug, Error)]
pub enum VmError {
    /// An unrecovered panic; the chain is ordered oldest first.
    #[error("{}", format_panic_chain(.0))]
    Panic(Vec<PanicEntry>),
    /// The memory budget was exhausted and no recover intervened.
    #[error("out of memory")]
    OutOfMemory,
    /// The context was cancelled or its deadline expired.
    #[error("context cancelled")]
    ContextCancelled,
    /// Every goroutine is blocked and the context cannot fire.
    #[error("all goroutines are asleep - deadlock")]
    Deadlock,
    #[error("invalid entry function {0}")]
    InvalidEntry(u32),
}

/// Renders a panic chain the way the language runtime prints overlapping
/// panics: one line per panic, `[recovered]` markers on recovered links.
pub fn format_panic_chain(chain: &[PanicEntry]) -> String {
    let mut out = String::new();
    for (i, p) in chain.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str("panic: ");
        out.push_str(&format_value(&p.msg));
        if p.recovered {
            out.push_str(" [recovered]");
        }
    }
    out
}

impl fmt::Display for PanicEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", format_value(&self.msg))?;
        if self.recovered {
            write!(f, " [recovered]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_chain_formatting() {
        let chain = vec![
            PanicEntry {
                msg: Value::str("X"),
                recovered: false,
                stack: String::new(),
            },
            PanicEntry {
                msg: Value::str("Y"),
                recovered: true,
                stack: String::new(),
            },
            PanicEntry {
                msg: Value::str("Z"),
                recovered: false,
                stack: String::new(),
            },
        ];
        assert_eq!(
            format_panic_chain(&chain),
            "panic: X\npanic: Y [recovered]\npanic: Z"
        );
    }
}
