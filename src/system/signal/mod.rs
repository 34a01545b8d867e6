//! Utilities to handle signals.
use std::borrow::Cow;

use libc::c_int;

mod handler;
mod info;
mod set;
mod state;
mod stream;

pub(crate) use handler::{SignalHandler, SignalHandlerBehavior};
pub(crate) use info::SignalInfo;
pub(crate) use set::SignalSet;
pub(crate) use state::SignalsState;
pub(crate) use stream::{register_handlers, SignalStream};

pub(crate) type SignalNumber = c_int;

macro_rules! define_consts {
    ($($signal:ident,)*) => {
        pub(crate) mod consts {
            pub(crate) use libc::{$($signal,)*};
        }

        /// The symbolic name of a signal, or its number if it has none we know of.
        pub(crate) fn signal_name(signal: SignalNumber) -> Cow<'static, str> {
            match signal {
                $(consts::$signal => Cow::Borrowed(stringify!($signal)),)*
                _ => Cow::Owned(format!("signal {signal}")),
            }
        }
    };
}

define_consts! {
    SIGINT,
    SIGQUIT,
    SIGTSTP,
    SIGTERM,
    SIGHUP,
    SIGALRM,
    SIGPIPE,
    SIGUSR1,
    SIGUSR2,
    SIGCHLD,
    SIGCONT,
    SIGWINCH,
    SIGTTIN,
    SIGTTOU,
    SIGKILL,
    SIGSTOP,
}

/// The human readable description of a signal as given by `strsignal`.
pub(crate) fn signal_description(signal: SignalNumber) -> String {
    // SAFETY: strsignal returns a pointer to a NUL-terminated string or NULL.
    let description = unsafe { crate::cutils::string_from_ptr(libc::strsignal(signal)) };
    if description.is_empty() {
        signal_name(signal).into_owned()
    } else {
        description
    }
}

#[cfg(test)]
mod tests {
    use super::{consts::*, signal_description, signal_name};

    #[test]
    fn names() {
        assert_eq!(signal_name(SIGWINCH), "SIGWINCH");
        assert_eq!(signal_name(SIGKILL), "SIGKILL");
        assert_eq!(signal_name(0), "signal 0");
    }

    #[test]
    fn descriptions() {
        assert_eq!(signal_description(SIGKILL), "Killed");
        assert_eq!(signal_description(libc::SIGSEGV), "Segmentation fault");
    }
}
