//! The process-boundary seam between scripts and the outside world.
//!
//! Blocking input, process forks, stdio and trace callbacks all route
//! through [`Host`]. A plain run uses [`DefaultHost`]; a debugged run plugs
//! in a host whose hooks drive the debug protocol. Whether a debugger is
//! active is decided by construction, never probed at runtime.

use std::io::{self, BufRead, Write};
use std::time::Duration;

use crate::error::{Interrupt, RuntimeError};
use crate::interp::TraceContext;

/// Why a fork is happening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkContext {
    /// The script called `fork()` itself.
    User,
    /// Interpreter machinery forks as part of `run()`; the child is about
    /// to execute a different program and is never worth following.
    Internal,
}

/// A host-side operation failed.
///
/// Carries only a message: the interpreter attaches position and traceback
/// where the failing call was made.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct HostError(pub String);

pub trait Host {
    /// Write program output. `text` arrives exactly as produced, newlines
    /// included.
    fn stdout(&mut self, text: &str);

    fn stderr(&mut self, text: &str);

    /// Block for one line of user input, without the trailing newline.
    fn input(&mut self, prompt: &str) -> Result<String, HostError>;

    /// `sleep(ms)`. Overridable so a debugging host can keep servicing its
    /// control channel while the script sleeps.
    fn sleep(&mut self, millis: u64) {
        std::thread::sleep(Duration::from_millis(millis));
    }

    /// Fork the process. Returns 0 in the child and the child pid in the
    /// parent.
    fn fork(&mut self, context: ForkContext) -> Result<i64, HostError>;

    /// Wait for a forked child and return its exit code.
    fn wait_child(&mut self, pid: i64) -> Result<i64, HostError>;

    /// Called before each statement. An `Err` unwinds the script without
    /// running anything further.
    fn on_line(&mut self, _ctx: &mut TraceContext<'_>) -> Result<(), Interrupt> {
        Ok(())
    }

    /// Called after a function frame is pushed, before its body runs.
    fn on_call(&mut self, _ctx: &mut TraceContext<'_>) -> Result<(), Interrupt> {
        Ok(())
    }

    /// Called before a function frame is popped.
    fn on_return(&mut self, _ctx: &mut TraceContext<'_>) -> Result<(), Interrupt> {
        Ok(())
    }

    /// Called once at the raise point of a runtime error, before unwinding.
    fn on_exception(
        &mut self,
        _ctx: &mut TraceContext<'_>,
        _error: &RuntimeError,
    ) -> Result<(), Interrupt> {
        Ok(())
    }
}

/// Plain stdio and real process primitives; no tracing.
#[derive(Debug, Default)]
pub struct DefaultHost;

impl Host for DefaultHost {
    fn stdout(&mut self, text: &str) {
        let mut out = io::stdout();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }

    fn stderr(&mut self, text: &str) {
        let mut err = io::stderr();
        let _ = err.write_all(text.as_bytes());
        let _ = err.flush();
    }

    fn input(&mut self, prompt: &str) -> Result<String, HostError> {
        if !prompt.is_empty() {
            self.stdout(prompt);
        }
        let mut line = String::new();
        io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(|e| HostError(format!("could not read input: {e}")))?;
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    #[cfg(unix)]
    fn fork(&mut self, _context: ForkContext) -> Result<i64, HostError> {
        // Single-threaded by construction, which is the one situation where
        // forking is sound.
        match unsafe { nix::unistd::fork() } {
            Ok(nix::unistd::ForkResult::Parent { child }) => Ok(i64::from(child.as_raw())),
            Ok(nix::unistd::ForkResult::Child) => Ok(0),
            Err(e) => Err(HostError(format!("fork failed: {e}"))),
        }
    }

    #[cfg(not(unix))]
    fn fork(&mut self, _context: ForkContext) -> Result<i64, HostError> {
        Err(HostError("fork is not supported on this platform".to_owned()))
    }

    #[cfg(unix)]
    fn wait_child(&mut self, pid: i64) -> Result<i64, HostError> {
        use nix::sys::wait::{waitpid, WaitStatus};
        use nix::unistd::Pid;

        match waitpid(Pid::from_raw(pid as i32), None) {
            Ok(WaitStatus::Exited(_, code)) => Ok(i64::from(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => Ok(128 + signal as i64),
            Ok(other) => Err(HostError(format!("unexpected wait status: {other:?}"))),
            Err(e) => Err(HostError(format!("wait failed: {e}"))),
        }
    }

    #[cfg(not(unix))]
    fn wait_child(&mut self, _pid: i64) -> Result<i64, HostError> {
        Err(HostError("fork is not supported on this platform".to_owned()))
    }
}

/// Captures all output and refuses anything interactive.
///
/// Used for evaluating conditions and `executeStatement` text inside a
/// halted script: output is collected for shipping in one piece, hooks stay
/// silent so nothing can re-enter the debugger, and blocking or
/// process-level operations fail cleanly instead of wedging the session.
#[derive(Debug, Default)]
pub struct CollectingHost {
    pub output: String,
}

impl Host for CollectingHost {
    fn stdout(&mut self, text: &str) {
        self.output.push_str(text);
    }

    fn stderr(&mut self, text: &str) {
        self.output.push_str(text);
    }

    fn input(&mut self, _prompt: &str) -> Result<String, HostError> {
        Err(HostError("input is not available here".to_owned()))
    }

    fn sleep(&mut self, _millis: u64) {}

    fn fork(&mut self, _context: ForkContext) -> Result<i64, HostError> {
        Err(HostError("fork is not available here".to_owned()))
    }

    fn wait_child(&mut self, _pid: i64) -> Result<i64, HostError> {
        Err(HostError("fork is not available here".to_owned()))
    }
}
