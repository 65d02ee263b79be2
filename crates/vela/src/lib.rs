//! Embed the Vela language in a Rust host.
//!
//! The host supplies an externally-parsed AST and, optionally, native
//! package manifests exposing Rust functions, variables, constants and
//! types. [`build`] type-checks and compiles a program; the resulting
//! [`Program`] runs on a sandboxed VM that bounds memory and honors a
//! cancellation context. [`build_script`] is the package-less variant:
//! its globals can be seeded by the host at run time and unresolved
//! names may auto-import from the registry's root manifest.
//!
//! ```no_run
//! use vela::{build, Options, RunOptions};
//! # fn parse() -> Vec<vela_syntax::ast::File> { unimplemented!() }
//! let files = parse();
//! let program = build(files, Options::default()).unwrap();
//! let code = program.run(RunOptions::default()).unwrap();
//! assert_eq!(code, 0);
//! ```

mod error;

use std::collections::HashMap;

use tracing::debug;

use vela_analysis::{check_program, check_script};
use vela_codegen::emit_program;
use vela_runtime::env::{Context, Env, PrintFunc};
use vela_runtime::function::Module;
use vela_runtime::package::Packages;
use vela_runtime::value::Value;
use vela_syntax::ast::File;
use vela_vm::Vm;

pub use error::{BuildError, ExitError, PanicError, RuntimeError};
pub use vela_common::{Diagnostic, DiagnosticSink};
pub use vela_runtime::env::CancelHandle;
pub use vela_runtime::native::{NativeFunction, NativeImpl};
pub use vela_runtime::package::{DeclaredPackage, NativeDecl, NativePackage};
pub use vela_runtime::types::Type;
pub use vela_runtime::Context as RunContext;

/// Build options.
#[derive(Default)]
pub struct Options {
    /// Rejects `go` statements at check time.
    pub disallow_go_stmt: bool,
    /// Import-path to native-package manifests, per build.
    pub packages: Packages,
}

/// Run options.
#[derive(Default)]
pub struct RunOptions {
    /// Cancellation context polled at every blocking operation.
    pub context: Context,
    /// Custom `print`/`println` sink.
    pub print: Option<PrintFunc>,
    /// Memory budget in bytes; exhausting it raises a recoverable
    /// out-of-memory panic.
    pub max_memory: Option<usize>,
}

/// A compiled program, ready to run any number of times.
#[derive(Debug)]
pub struct Program {
    module: Module,
}

/// A compiled script: like a program, but its package-level variables
/// can be seeded by the host before running.
pub struct Script {
    module: Module,
}

/// Type-checks and compiles the files of a main package.
pub fn build(files: Vec<File>, options: Options) -> Result<Program, BuildError> {
    let checked = check_program(files, &options.packages, options.disallow_go_stmt)?;
    debug!(globals = checked.globals.len(), "checked");
    let module = emit_program(&checked);
    debug!(functions = module.functions.len(), "emitted");
    Ok(Program { module })
}

/// Type-checks and compiles a script file.
pub fn build_script(file: File, options: Options) -> Result<Script, BuildError> {
    let checked = check_script(file, &options.packages)?;
    let module = emit_program(&checked);
    Ok(Script { module })
}

fn run_module(module: Module, options: RunOptions) -> Result<i32, RuntimeError> {
    let env = Env::with_options(options.context, options.max_memory, options.print);
    let mut vm = Vm::new(module, env);
    match vm.run() {
        Ok(code) => {
            // A non-zero Env::exit surfaces as an error; the entry
            // function's own integer result is a plain exit code.
            match vm.exit_code {
                Some(n) if n != 0 => Err(RuntimeError::Exit(ExitError(n))),
                _ => Ok(code),
            }
        }
        Err(e) => Err(error::from_vm_error(e)),
    }
}

impl Program {
    /// Runs the program to completion. Returns the exit code: the entry
    /// function's integer result, or 0. `Env::exit(n)` with non-zero `n`
    /// surfaces as [`ExitError`].
    pub fn run(&self, options: RunOptions) -> Result<i32, RuntimeError> {
        run_module(self.module.clone(), options)
    }

    pub fn module(&self) -> &Module {
        &self.module
    }
}

impl Script {
    /// Runs the script. `vars` seeds package-level globals by name; a
    /// `None` value (or a missing entry) supplies the zero value.
    pub fn run(
        &self,
        vars: HashMap<String, Option<Value>>,
        options: RunOptions,
    ) -> Result<i32, RuntimeError> {
        let mut module = self.module.clone();
        for global in &mut module.globals {
            if let Some(v) = vars.get(&global.name) {
                global.init = v.clone();
            }
        }
        run_module(module, options)
    }

    pub fn module(&self) -> &Module {
        &self.module
    }
}
