use crate::os_common::ExitStatus;

/// Lifecycle of a child process, as tracked by its [`Popen`](crate::Popen).
///
/// States only ever advance: `Preparing` to `Running` to `Finished`.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ChildState {
    /// Streams are being set up; the child has not been forked yet.
    Preparing,
    /// The child was forked and has not been reaped.
    Running { pid: u32 },
    /// The child was reaped, or is known to have been reaped by someone else.
    Finished(ExitStatus),
}

impl ChildState {
    /// The PID, while the child is running.
    pub fn pid(&self) -> Option<u32> {
        match *self {
            ChildState::Running { pid } => Some(pid),
            ChildState::Preparing | ChildState::Finished(_) => None,
        }
    }

    /// The exit status, once the child has finished.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match *self {
            ChildState::Finished(status) => Some(status),
            ChildState::Preparing | ChildState::Running { .. } => None,
        }
    }

    pub(crate) fn start(&mut self, pid: u32) {
        assert!(
            matches!(self, ChildState::Preparing),
            "child state {:?} cannot move to Running",
            self
        );
        *self = ChildState::Running { pid };
    }

    pub(crate) fn finish(&mut self, status: ExitStatus) {
        assert!(
            matches!(self, ChildState::Running { .. }),
            "child state {:?} cannot move to Finished",
            self
        );
        *self = ChildState::Finished(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions() {
        let mut state = ChildState::Preparing;
        assert_eq!(state.pid(), None);
        assert_eq!(state.exit_status(), None);

        state.start(42);
        assert_eq!(state.pid(), Some(42));
        assert_eq!(state.exit_status(), None);

        state.finish(ExitStatus::Exited(0));
        assert_eq!(state.pid(), None);
        assert_eq!(state.exit_status(), Some(ExitStatus::Exited(0)));
    }

    #[test]
    #[should_panic(expected = "cannot move to Finished")]
    fn finish_without_start() {
        ChildState::Preparing.finish(ExitStatus::Undetermined);
    }

    #[test]
    #[should_panic(expected = "cannot move to Running")]
    fn no_restart_after_finish() {
        let mut state = ChildState::Finished(ExitStatus::Exited(1));
        state.start(7);
    }
}
