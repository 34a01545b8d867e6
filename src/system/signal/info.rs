use std::fmt;

use crate::system::interface::ProcessId;

use super::{signal_name, SignalNumber};

/// Information related to the arrival of a signal.
#[repr(transparent)]
pub(crate) struct SignalInfo {
    info: libc::siginfo_t,
}

impl SignalInfo {
    pub(super) const SIZE: usize = std::mem::size_of::<Self>();

    /// Returns whether the signal was sent by the user or not.
    pub(crate) fn is_user_signaled(&self) -> bool {
        // This matches SI_USER and SI_QUEUE alike, libc does not export the former.
        self.info.si_code <= 0
    }

    /// Gets the PID that sent the signal, if the kernel recorded one.
    pub(crate) fn signaler_pid(&self) -> Option<ProcessId> {
        if self.is_user_signaled() || self.signal() == libc::SIGCHLD {
            // SAFETY: si_pid is filled in for user sent signals and SIGCHLD.
            let pid = ProcessId::new(unsafe { self.info.si_pid() });
            pid.is_valid().then_some(pid)
        } else {
            None
        }
    }

    /// Gets the signal number.
    pub(crate) fn signal(&self) -> SignalNumber {
        self.info.si_signo
    }
}

impl fmt::Display for SignalInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} from {}",
            signal_name(self.signal()),
            if self.is_user_signaled() {
                "user"
            } else {
                "kernel"
            }
        )?;
        if let Some(pid) = self.signaler_pid() {
            write!(f, " (pid {pid})")?;
        }
        Ok(())
    }
}
