/// States of the Lifecycle Controller's state machine (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Configured,
    Locked,
    Starting,
    Running,
    Stopping,
    SnapshottingForSuspend,
    Terminated,
}

/// Events fed into the controller by signal handlers, the control socket
/// server, and the chrome bridge. Signal handlers and socket handlers only
/// ever construct and send one of these; they never touch controller state
/// directly (§5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// SIGINT, or the control socket's `stop` command: immediate-but-graceful
    /// shutdown.
    Stop,
    /// SIGUSR1, or the control socket's `suspend` command.
    Suspend,
    /// SIGUSR2, or the control socket's `request-stop` command: ask the
    /// guest OS to shut itself down.
    RequestGuestStop,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_terminated_is_terminal() {
        assert!(!LifecycleState::Init.is_terminal());
        assert!(!LifecycleState::Running.is_terminal());
        assert!(LifecycleState::Terminated.is_terminal());
    }
}
