//! Fork-following policy and the raw process primitives behind it.

use script::{ForkContext, HostError};
use transport::params::ForkTarget;

/// Which side of a fork keeps the debug connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForkPolicy {
    /// Ask the controller at each fork the script performs itself.
    #[default]
    Ask,
    FollowChild,
    FollowParent,
}

impl ForkPolicy {
    /// Decide locally where possible; `None` means the controller must be
    /// asked. Machinery forks never stay attached to the child, whatever
    /// the policy.
    pub fn preset(self, context: ForkContext) -> Option<ForkTarget> {
        match context {
            ForkContext::Internal => Some(ForkTarget::Parent),
            ForkContext::User => match self {
                ForkPolicy::FollowChild => Some(ForkTarget::Child),
                ForkPolicy::FollowParent => Some(ForkTarget::Parent),
                ForkPolicy::Ask => None,
            },
        }
    }
}

/// Fork. Returns 0 in the child and the child pid in the parent.
#[cfg(unix)]
pub fn raw_fork() -> Result<i64, HostError> {
    // Single-threaded by construction, which is the one situation where
    // forking is sound.
    match unsafe { nix::unistd::fork() } {
        Ok(nix::unistd::ForkResult::Parent { child }) => Ok(i64::from(child.as_raw())),
        Ok(nix::unistd::ForkResult::Child) => Ok(0),
        Err(e) => Err(HostError(format!("fork failed: {e}"))),
    }
}

#[cfg(not(unix))]
pub fn raw_fork() -> Result<i64, HostError> {
    Err(HostError("fork is not supported on this platform".to_owned()))
}

/// Non-blocking check for a child's exit; `Ok(None)` while it still runs.
#[cfg(unix)]
pub fn raw_try_wait(pid: i64) -> Result<Option<i64>, HostError> {
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::Pid;

    match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => Ok(None),
        Ok(WaitStatus::Exited(_, code)) => Ok(Some(i64::from(code))),
        Ok(WaitStatus::Signaled(_, signal, _)) => Ok(Some(128 + signal as i64)),
        Ok(other) => Err(HostError(format!("unexpected wait status: {other:?}"))),
        Err(e) => Err(HostError(format!("wait failed: {e}"))),
    }
}

#[cfg(not(unix))]
pub fn raw_try_wait(_pid: i64) -> Result<Option<i64>, HostError> {
    Err(HostError("fork is not supported on this platform".to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machinery_forks_always_follow_the_parent() {
        for policy in [
            ForkPolicy::Ask,
            ForkPolicy::FollowChild,
            ForkPolicy::FollowParent,
        ] {
            assert_eq!(
                policy.preset(ForkContext::Internal),
                Some(ForkTarget::Parent)
            );
        }
    }

    #[test]
    fn user_forks_follow_the_configured_side() {
        assert_eq!(
            ForkPolicy::FollowChild.preset(ForkContext::User),
            Some(ForkTarget::Child)
        );
        assert_eq!(
            ForkPolicy::FollowParent.preset(ForkContext::User),
            Some(ForkTarget::Parent)
        );
        assert_eq!(ForkPolicy::Ask.preset(ForkContext::User), None);
    }
}
