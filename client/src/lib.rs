//! Debug runtime that runs inside the debugged process.
//!
//! The `debug-client` binary wraps a script in this runtime: it dials the
//! controller, announces itself, holds at startup while breakpoints are
//! installed, then interprets the script with every trace hook wired to the
//! control socket.
//!
//! # Architecture
//!
//! - [`DebugClient`] owns the connection and the session lifecycle, and
//!   implements the interpreter's `Host` seam
//! - `breakpoints` keeps the breakpoint and watch tables, with conditions
//!   compiled at registration and evaluated in the halted frame
//! - `variables` renders and expands scopes for introspection requests
//! - `execute` runs controller-supplied statements in a halted frame
//! - `fork` decides which side of a fork keeps the connection
//! - `signals` turns watched process signals into reported halts
//!
//! # Scope
//!
//! Only the debuggee side lives here. The controller's state machine,
//! dispatching and persistence are the `debugger` crate's business.

mod breakpoints;
mod execute;
mod fork;
mod runtime;
mod signals;
mod variables;

pub use fork::ForkPolicy;
pub use runtime::{
    ClientError, ClientOptions, DebugClient, EPILOGUE_TIMEOUT, HANDSHAKE_TIMEOUT,
};
