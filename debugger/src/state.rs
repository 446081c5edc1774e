//! Session state machine types.

use std::fmt;

use transport::params::ProcIdInfo;

use crate::dispatcher::DebugEvent;
use crate::listener::DebuggeeInfo;

/// Where a debug session currently stands.
///
/// Every transition is published as a [`DebugEvent::StateChange`], so
/// listeners can follow the session without polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No debuggee; the manager is idle.
    Detached,
    /// A debuggee process has been spawned and the manager is waiting for it
    /// to announce itself.
    Spawning,
    /// An announced debuggee is being adopted.
    Attaching,
    /// The debuggee is running freely.
    Attached,
    /// The debuggee is halted and accepting inspection commands.
    Broken,
    /// Halted, with inspection targeting the exception stack instead of the
    /// live one. Entered and left explicitly, only from [`Broken`].
    ///
    /// [`Broken`]: SessionState::Broken
    Analyze,
    /// A graceful shutdown is underway.
    Detaching,
}

impl SessionState {
    /// Whether inspection and resume commands are accepted right now.
    pub fn accepts_inspection(self) -> bool {
        matches!(self, SessionState::Broken | SessionState::Analyze)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Detached => "detached",
            SessionState::Spawning => "spawning",
            SessionState::Attaching => "attaching",
            SessionState::Attached => "attached",
            SessionState::Broken => "broken",
            SessionState::Analyze => "analyze",
            SessionState::Detaching => "detaching",
        };
        f.write_str(name)
    }
}

impl From<&SessionState> for DebugEvent {
    fn from(state: &SessionState) -> Self {
        DebugEvent::StateChange(*state)
    }
}

/// Identity of the debuggee a session is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub pid: i32,
    pub module: String,
    pub filename: String,
    pub procuuid: String,
}

impl ServerInfo {
    pub(crate) fn from_announcement(procuuid: &str, info: &ProcIdInfo) -> Self {
        Self {
            pid: info.pid,
            module: info.module.clone(),
            filename: info.filename.clone(),
            procuuid: procuuid.to_owned(),
        }
    }
}

impl From<&DebuggeeInfo> for ServerInfo {
    fn from(info: &DebuggeeInfo) -> Self {
        Self {
            pid: info.pid,
            module: info.module.clone(),
            filename: info.filename.clone(),
            procuuid: info.procuuid.clone(),
        }
    }
}
