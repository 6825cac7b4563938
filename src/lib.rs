//! Rill: an embeddable coroutine scripting language.
//!
//! A host compiles a source program once into flat bytecode, then executes
//! it any number of times in fresh runtime states. Persistence between
//! runs belongs to the host, exposed through registered native callbacks.
//!
//! ```no_run
//! rill::run("sum = 0 for i in 10 sum = sum + i end print(sum)").unwrap();
//! ```

#![allow(clippy::result_large_err)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::new_without_default)]
#![allow(clippy::collapsible_if)]

pub mod ast;
pub mod bytecode;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod runtime;
pub mod span;

pub use error::RillError;
pub use runtime::{Callback, Value, Vm, VmConfig};

/// Compile and run a single-module program once.
pub fn run(source: &str) -> Result<(), RillError> {
    Vm::from_source(source)?.run_main()
}

/// Compile a single-module program without running it.
pub fn compile(source: &str) -> Result<Vm, RillError> {
    Vm::from_source(source)
}

/// Compile a program and render its bytecode.
pub fn disassemble(source: &str) -> Result<String, RillError> {
    Ok(Vm::from_source(source)?.disassemble())
}
