use std::io;

use crate::cutils::cerr;
use crate::log::dev_debug;
use crate::system::make_zeroed_sigaction;
use crate::system::signal::signal_name;

use super::{consts::*, SignalNumber};

/// The dispositions the process had for the signals it handles, captured before any handler is
/// installed so that they can be reinstated right before running the command.
pub(crate) struct SignalsState {
    actions: [libc::sigaction; Self::SAVED_SIGNALS.len()],
}

impl SignalsState {
    // SIGKILL and SIGSTOP cannot be caught, so there is nothing to save for them.
    const SAVED_SIGNALS: [SignalNumber; 14] = [
        SIGINT, SIGQUIT, SIGTSTP, SIGTERM, SIGHUP, SIGALRM, SIGPIPE, SIGUSR1, SIGUSR2, SIGCHLD,
        SIGCONT, SIGWINCH, SIGTTIN, SIGTTOU,
    ];

    pub(crate) fn save() -> io::Result<Self> {
        let mut actions = std::array::from_fn(|_| make_zeroed_sigaction());

        for (action, &signal) in actions.iter_mut().zip(Self::SAVED_SIGNALS.iter()) {
            // SAFETY: `signal` is a valid signal and a null new action only queries.
            cerr(unsafe { libc::sigaction(signal, std::ptr::null(), action) })?;
        }

        Ok(Self { actions })
    }

    /// Reinstate every saved disposition.
    pub(crate) fn restore(&self) -> io::Result<()> {
        for (action, &signal) in self.actions.iter().zip(Self::SAVED_SIGNALS.iter()) {
            dev_debug!("restoring action for {}", signal_name(signal));
            // SAFETY: `action` was filled in by `save`.
            cerr(unsafe { libc::sigaction(signal, action, std::ptr::null_mut()) })?;
        }
        Ok(())
    }
}
