//! Error and control-flow types for compiling and running scripts.

use std::fmt;

/// A position in a raised error's traceback, innermost last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracebackEntry {
    pub filename: String,
    pub line: u32,
    pub function: String,
}

impl fmt::Display for TracebackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  file {:?}, line {}, in {}",
            self.filename, self.line, self.function
        )
    }
}

/// The script could not be parsed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("syntax error at line {line}, column {column}: {message}")]
pub struct SyntaxError {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

/// The script failed while running.
///
/// The language has no exception handling, so every runtime error unwinds to
/// the caller of [`Interpreter::run`] with the traceback captured at the
/// raise point.
///
/// [`Interpreter::run`]: crate::Interpreter::run
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} (line {line})")]
pub struct RuntimeError {
    pub message: String,
    pub line: u32,
    pub traceback: Vec<TracebackEntry>,
}

impl RuntimeError {
    /// Render the error the way it is shown to users: traceback first,
    /// innermost frame last, message on the final line.
    pub fn render(&self) -> String {
        let mut out = String::from("traceback (innermost last):\n");
        for entry in &self.traceback {
            out.push_str(&entry.to_string());
            out.push('\n');
        }
        out.push_str(&self.message);
        out
    }
}

/// Out-of-band control flow that is not an error in the user's program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// `exit(code)` was called.
    Exit(i64),
    /// The host asked execution to stop immediately.
    Quit,
}

/// Everything that can stop a script.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScriptError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// Not a failure: `exit()` or a host-requested stop unwinding the stack.
    #[error("interrupted")]
    Interrupt(Interrupt),
}

impl From<Interrupt> for ScriptError {
    fn from(interrupt: Interrupt) -> Self {
        Self::Interrupt(interrupt)
    }
}
