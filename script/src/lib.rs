//! A small line-oriented scripting language with a debuggable interpreter.
//!
//! # Architecture
//!
//! Source text flows lexer -> parser -> interpreter. The interpreter
//! is embeddable: every run is parameterized by a [`Host`] that owns the
//! program's input/output, process operations and trace hooks, so the same
//! engine serves plain execution and a debug client driving it over a
//! socket.
//!
//! # Scope
//!
//! The language is deliberately compact: integers, floats, strings, bools,
//! lists, maps, functions, `if`/`while` blocks closed by `end`, and `raise`
//! without any catch. There is no exception handling on purpose; an
//! uncaught error always unwinds to the embedder, which is exactly what a
//! debugger wants to observe.

mod ast;
mod error;
mod host;
mod interp;
mod lexer;
mod parser;
mod value;

pub use ast::{CompiledBlock, CompiledExpr, Program};
pub use error::{Interrupt, RuntimeError, ScriptError, SyntaxError, TracebackEntry};
pub use host::{CollectingHost, DefaultHost, ForkContext, Host, HostError};
pub use interp::{
    reserved_names, run_file, Builtin, Frame, Interpreter, TraceContext, DEFAULT_DEPTH_LIMIT,
    PRELUDE_FILENAME,
};
pub use value::Value;

/// Compile a whole program. `filename` is carried into frames and
/// tracebacks verbatim.
pub fn compile(source: &str, filename: &str) -> Result<Program, SyntaxError> {
    parser::parse_program(source, filename)
}

/// Compile a single expression, e.g. a breakpoint condition.
pub fn compile_expr(source: &str) -> Result<CompiledExpr, SyntaxError> {
    let expr = parser::parse_expression(source)?;
    Ok(CompiledExpr {
        source: source.to_owned(),
        expr,
    })
}

/// Compile a statement sequence for injection into a live frame.
pub fn compile_block(source: &str) -> Result<CompiledBlock, SyntaxError> {
    let body = parser::parse_statements(source)?;
    Ok(CompiledBlock {
        source: source.to_owned(),
        body,
    })
}
