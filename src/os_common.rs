use std::fmt;

/// Exit status of a process.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone)]
pub enum ExitStatus {
    /// The process exited with the specified exit code.
    ///
    /// Note that the exit code is limited to a much smaller range on
    /// most platforms.
    Exited(u32),

    /// The process exited due to a signal with the specified number.
    Signaled(u8),

    /// The process exit status cannot be described by the preceding
    /// two variants.  Holds the raw wait status.
    ///
    /// This should not occur in normal operation.
    Other(i32),

    /// It is known that the process has completed, but its exit
    /// status is unavailable.
    ///
    /// This should not occur in normal operation, but is possible if
    /// for example some foreign code calls `waitpid()` on the PID of
    /// the child process.
    Undetermined,
}

impl ExitStatus {
    /// True if the process exited normally with exit code 0.
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ExitStatus::Exited(code) => write!(f, "exit code {}", code),
            ExitStatus::Signaled(signal) => write!(f, "signal {}", signal),
            ExitStatus::Other(raw) => write!(f, "unrecognized wait status: {} {:#x}", raw, raw),
            ExitStatus::Undetermined => f.write_str("undetermined exit status"),
        }
    }
}

/// One of the three standard streams, numbered by its descriptor slot.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub(crate) enum StandardStream {
    Input = 0,
    Output = 1,
    Error = 2,
}

impl StandardStream {
    pub fn slot(self) -> i32 {
        self as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_only_for_zero_exit() {
        assert!(ExitStatus::Exited(0).success());
        assert!(!ExitStatus::Exited(1).success());
        assert!(!ExitStatus::Signaled(0).success());
        assert!(!ExitStatus::Other(0).success());
        assert!(!ExitStatus::Undetermined.success());
    }

    #[test]
    fn display() {
        assert_eq!(ExitStatus::Exited(3).to_string(), "exit code 3");
        assert_eq!(ExitStatus::Signaled(9).to_string(), "signal 9");
        assert_eq!(
            ExitStatus::Undetermined.to_string(),
            "undetermined exit status"
        );
    }

    #[test]
    fn stream_slots() {
        assert_eq!(StandardStream::Input.slot(), 0);
        assert_eq!(StandardStream::Output.slot(), 1);
        assert_eq!(StandardStream::Error.slot(), 2);
    }
}
