#![deny(unsafe_code)]

mod event;
mod intercept;
mod interface;
mod io_util;
mod no_pty;
mod pipe;
mod plugin;
mod setup;
mod use_pty;

use std::{borrow::Cow, ffi::c_uint, io, time::Duration};

use crate::{
    common::Error,
    log::{dev_info, dev_warn, user_error},
    system::{
        _exit, alarm, fork,
        interface::ProcessId,
        kill, killpg,
        signal::{consts::*, signal_name, SignalNumber},
        term::UserTerm,
        wait::{Wait, WaitError, WaitOptions, WaitStatus},
        ForkResult,
    },
};

pub use intercept::{ApprovedExec, InterceptClient};
pub use interface::{CommandDetails, CommandStatus, ExecFlags, ExitReason, InterceptType, TargetUser};
pub use plugin::{
    ApprovalPlugin, AuditPlugin, AuditSource, IoCapabilities, IoPlugin, IoStream, LogAction,
    Plugin, Plugins, PolicyDecision, PolicyPlugin,
};

use self::{
    event::{EventRegistry, Process},
    io_util::was_interrupted,
    no_pty::exec_no_pty,
    setup::ExecContext,
    use_pty::{exec_pty, SIGCONT_BG, SIGCONT_FG},
};

/// Run the command described by `details`, which the policy in `plugins` already accepted.
///
/// Depending on what the plugins need, the command replaces the current process, runs as a
/// child of it, or runs in a pseudo-terminal under a monitor process. A command that could not
/// be executed is reported as [`CommandStatus::Errno`].
pub fn run_command(details: &CommandDetails, plugins: &mut Plugins) -> Result<CommandStatus, Error> {
    if details.flags.background && !details.flags.exec_bg {
        return run_in_background(details, plugins);
    }

    let context = ExecContext::new(details)?;

    if direct_exec_allowed(details, plugins) {
        dev_info!("executing {} directly", details.command.display());
        let err = context.exec_command(plugins, None, None, &[]);
        user_error!("unable to execute {}: {err}", details.command.display());
        return Err(Error::Io(Some(details.command.clone()), err));
    }

    let status = if needs_pty(details, plugins) {
        match UserTerm::open() {
            Ok(user_tty) => exec_pty(&context, plugins, user_tty)?,
            Err(err) => {
                dev_info!("Could not open user's terminal, not allocating a pty: {err}");
                exec_no_pty(&context, plugins)?
            }
        }
    } else {
        exec_no_pty(&context, plugins)?
    };

    if let CommandStatus::Errno(errno) = status {
        user_error!(
            "unable to execute {}: {}",
            details.command.display(),
            io::Error::from_raw_os_error(errno)
        );
    }

    plugins.close(&status);
    context.restore_signals();

    Ok(status)
}

/// Leave the command to a child process and report success right away.
fn run_in_background(details: &CommandDetails, plugins: &mut Plugins) -> Result<CommandStatus, Error> {
    let ForkResult::Parent(pid) = fork().map_err(|err| {
        dev_warn!("unable to fork background process: {err}");
        err
    })?
    else {
        let mut details = details.clone();
        details.flags.exec_bg = true;

        let code = match run_command(&details, plugins) {
            Ok(status) => match status.exit_reason() {
                Some(ExitReason::Code(code)) => code,
                Some(ExitReason::Signal(signal)) => 128 + signal,
                None => 1,
            },
            Err(err) => {
                user_error!("{err}");
                1
            }
        };
        _exit(code);
    };

    dev_info!("running command in the background as {pid}");

    Ok(CommandStatus::WaitStatus(WaitStatus::from_exit_code(0)))
}

/// Whether something needs the command to have its own terminal.
fn needs_pty(details: &CommandDetails, plugins: &Plugins) -> bool {
    let caps = plugins.io_capabilities();

    details.flags.use_pty
        || details.flags.intercept
        || details.flags.log_subcmds
        || caps.tty_in
        || caps.tty_out
        || caps.change_winsize
        || caps.suspend
}

/// Whether nothing has to happen after the command is executed, so sudo can become the command.
fn direct_exec_allowed(details: &CommandDetails, plugins: &Plugins) -> bool {
    let caps = plugins.io_capabilities();

    !needs_pty(details, plugins)
        && !plugins.wants_close()
        && !caps.stdin
        && !caps.stdout
        && !caps.stderr
        && details.timeout.is_none()
        && !details.intercepts()
}

/// Schedule the `SIGALRM` that ends a command running past its timeout.
fn arm_timeout(timeout: Option<Duration>) {
    if let Some(timeout) = timeout {
        let secs = c_uint::try_from(timeout.as_secs().max(1)).unwrap_or(c_uint::MAX);
        dev_info!("command times out in {secs} seconds");
        alarm(secs);
    }
}

// Kill the process with increasing urgency.
fn terminate_process(pid: ProcessId, use_killpg: bool) {
    let kill_fn = if use_killpg { killpg } else { kill };
    kill_fn(pid, SIGHUP).ok();
    kill_fn(pid, SIGTERM).ok();
    std::thread::sleep(Duration::from_secs(2));
    kill_fn(pid, SIGKILL).ok();
}

trait HandleSigchld: Process {
    const OPTIONS: WaitOptions;

    /// The child exited or was terminated by a signal.
    fn on_exit(&mut self, status: WaitStatus, registry: &mut EventRegistry<Self>);
    fn on_stop(&mut self, status: WaitStatus, registry: &mut EventRegistry<Self>);
}

fn handle_sigchld<T: HandleSigchld>(
    handler: &mut T,
    registry: &mut EventRegistry<T>,
    child_name: &'static str,
    child_pid: ProcessId,
) {
    let status = loop {
        match child_pid.wait(T::OPTIONS) {
            Err(WaitError::Io(err)) if was_interrupted(&err) => {}
            // This only happens if we receive `SIGCHLD` but there's no status update from the
            // child.
            Err(WaitError::Io(err)) => {
                dev_info!("cannot wait for {child_pid} ({child_name}): {err}");
                return;
            }
            // This only happens if the child exited and any process already waited for it.
            Err(WaitError::NotReady) => {
                dev_info!("{child_pid} ({child_name}) has no status report");
                return;
            }
            Ok((_pid, status)) => break status,
        }
    };

    if let Some(exit_code) = status.exit_status() {
        dev_info!("{child_pid} ({child_name}) exited with status code {exit_code}");
        handler.on_exit(status, registry)
    } else if let Some(signal) = status.stop_signal() {
        dev_info!(
            "{child_pid} ({child_name}) was stopped by {}",
            signal_fmt(signal),
        );
        handler.on_stop(status, registry)
    } else if let Some(signal) = status.term_signal() {
        dev_info!(
            "{child_pid} ({child_name}) was terminated by {}",
            signal_fmt(signal),
        );
        handler.on_exit(status, registry)
    } else if status.did_continue() {
        dev_info!("{child_pid} ({child_name}) continued execution");
    } else {
        dev_warn!("unexpected wait status for {child_pid} ({child_name})")
    }
}

fn signal_fmt(signal: SignalNumber) -> Cow<'static, str> {
    match signal {
        SIGCONT_FG => "SIGCONT_FG".into(),
        SIGCONT_BG => "SIGCONT_BG".into(),
        signal => signal_name(signal),
    }
}

const fn cond_fmt<'a>(cond: bool, true_s: &'a str, false_s: &'a str) -> &'a str {
    if cond {
        true_s
    } else {
        false_s
    }
}

const fn opt_fmt(cond: bool, s: &str) -> &str {
    cond_fmt(cond, s, "")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use crate::system::signal::consts::*;

    use super::{
        direct_exec_allowed, needs_pty,
        plugin::{tests::AllowAll, IoCapabilities, IoPlugin, Plugin, Plugins},
        signal_fmt, CommandDetails, ExecFlags, SIGCONT_BG, SIGCONT_FG,
    };

    struct Caps(IoCapabilities);

    impl IoPlugin for Caps {
        fn capabilities(&self) -> IoCapabilities {
            self.0
        }
    }

    fn plugins(io: Option<IoCapabilities>) -> Plugins {
        let mut list = vec![Plugin::Policy(Box::new(AllowAll))];
        list.extend(io.map(|caps| Plugin::Io(Box::new(Caps(caps)))));
        Plugins::new(list).unwrap()
    }

    #[test]
    fn pseudo_signals_have_names() {
        assert_eq!(signal_fmt(SIGCONT_FG), "SIGCONT_FG");
        assert_eq!(signal_fmt(SIGCONT_BG), "SIGCONT_BG");
        assert_eq!(signal_fmt(SIGTSTP), "SIGTSTP");
    }

    #[test]
    fn plain_commands_are_executed_directly() {
        let details = CommandDetails::new("/bin/true");
        assert!(!needs_pty(&details, &plugins(None)));
        assert!(direct_exec_allowed(&details, &plugins(None)));

        let timed = CommandDetails::new("/bin/true").timeout(Duration::from_secs(3));
        assert!(!direct_exec_allowed(&timed, &plugins(None)));

        let stdout = IoCapabilities {
            stdout: true,
            ..Default::default()
        };
        assert!(!needs_pty(&details, &plugins(Some(stdout))));
        assert!(!direct_exec_allowed(&details, &plugins(Some(stdout))));
    }

    #[test]
    fn terminal_features_need_a_pty() {
        let details = CommandDetails::new("/bin/true");
        let winsize = IoCapabilities {
            change_winsize: true,
            ..Default::default()
        };
        assert!(needs_pty(&details, &plugins(Some(winsize))));

        for flags in [
            ExecFlags {
                use_pty: true,
                ..Default::default()
            },
            ExecFlags {
                intercept: true,
                ..Default::default()
            },
            ExecFlags {
                log_subcmds: true,
                ..Default::default()
            },
        ] {
            let details = CommandDetails::new("/bin/true").flags(flags);
            assert!(needs_pty(&details, &plugins(None)));
            assert!(!direct_exec_allowed(&details, &plugins(None)));
        }

        let noexec = CommandDetails::new("/bin/true").flags(ExecFlags {
            noexec: true,
            ..Default::default()
        });
        assert!(!needs_pty(&noexec, &plugins(None)));
        assert!(!direct_exec_allowed(&noexec, &plugins(None)));
    }
}
