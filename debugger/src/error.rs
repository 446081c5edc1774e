//! Error types for the controller side.

use std::path::PathBuf;

use transport::{CodecError, Method};

/// Errors surfaced to callers of the session manager.
///
/// The first three variants are contract violations: the caller issued a
/// command in a session state that cannot carry it. The rest are runtime
/// failures of the operation itself.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A command that needs a live session was issued while detached.
    #[error("no debug session is attached")]
    NotAttached,

    /// `launch` or `attach` was called while a session is active.
    #[error("a debug session is already active")]
    AlreadyAttached,

    /// An inspection or resume command was issued while the debuggee is
    /// running freely.
    #[error("the debuggee is not halted")]
    DebuggerNotBroken,

    /// There is no way to spawn a debuggee in a terminal on this platform.
    #[error("spawning a debuggee is not supported on {0}")]
    SpawnUnsupported(String),

    /// The spawned debuggee never announced itself before the discovery retries ran out.
    #[error("the spawned debuggee never announced itself")]
    SpawnTimeout,

    #[error("attach failed: {0}")]
    AttachFailed(String),

    /// The token the debuggee announced does not match the password written
    /// for it at spawn time.
    #[error("the debuggee's authentication token did not match")]
    AuthFailed,

    #[error("loopback probe failed: {0}")]
    FirewallBlocked(String),

    /// A bounded wait expired.
    #[error("timed out waiting for {what}")]
    WaitTimeout { what: String },

    /// Another caller is already waiting on the same reply method.
    #[error("a {0} request is already outstanding")]
    RequestPending(Method),

    #[error("could not parse config file {path:?}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("could not parse breakpoint store {path:?}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A thread holding the session lock panicked.
    #[error("session state lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
