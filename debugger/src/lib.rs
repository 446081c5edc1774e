//! Controller-side session management for the remote script debugger.
//!
//! The crate sits between a UI (or the bundled repl) and a debuggee running
//! under the `client` runtime:
//!
//! - [`ControlListener`] accepts debuggee connections and parks their
//!   announcements until someone adopts them
//! - [`SessionManager`] is the facade: it spawns or attaches to debuggees,
//!   walks the session state machine, forwards commands, and runs a monitor
//!   thread that turns wire messages into [`DebugEvent`]s
//! - [`EventDispatcher`] fans events out to registered callbacks and can be
//!   chained, so bookkeeping sees events before UI listeners
//! - [`BreakpointProxy`] mirrors the breakpoint and watch tables so they
//!   survive across sessions and can be pushed into a fresh debuggee
//! - [`BreakpointStore`] persists breakpoints per script between runs
//!
//! All calls are safe from any thread; session state lives behind one lock
//! and events are delivered from the monitor thread.

mod config;
mod dispatcher;
mod error;
mod listener;
mod monitor;
mod pending;
mod persistence;
mod proxy;
mod session;
mod spawn;
mod state;

pub use config::ManagerConfig;
pub use dispatcher::{CallbackId, DebugEvent, EventDispatcher, EventFilter, EventKind};
pub use error::SessionError;
pub use listener::{ControlListener, DebuggeeInfo};
pub use persistence::{BreakpointRecord, BreakpointStore};
pub use proxy::{BreakpointProxy, MirroredBreakpoint, MirroredWatch};
pub use session::{SessionManager, StatementOutcome};
pub use spawn::LaunchOptions;
pub use state::{ServerInfo, SessionState};
