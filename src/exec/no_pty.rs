use std::{ffi::c_int, io, os::fd::AsRawFd};

use super::{
    arm_timeout,
    event::{EventHandle, EventRegistry, PollEvent, Process, StopReason},
    intercept::{self, InterceptEvent, InterceptHost, InterceptServer},
    interface::CommandStatus,
    io_util::was_interrupted,
    pipe::StdioRelays,
    plugin::{IoStream, Plugins},
    setup::{redirect_stdio, ExecContext},
    terminate_process, HandleSigchld,
};
use crate::{
    common::bin_serde::BinPipe,
    system::signal::{
        consts::*, register_handlers, SignalHandler, SignalHandlerBehavior, SignalNumber,
        SignalSet, SignalStream,
    },
};
use crate::{
    exec::{handle_sigchld, opt_fmt, signal_fmt},
    log::{dev_error, dev_info, dev_warn, user_warn},
    system::{
        _exit, fork, getpgid, getpgrp, getpid,
        interface::ProcessId,
        kill, killpg,
        term::{Terminal, UserTerm},
        wait::{Wait, WaitOptions, WaitStatus},
        ForkResult,
    },
};

/// Run the command as a direct child of this process, sharing its terminal and session.
pub(super) fn exec_no_pty(context: &ExecContext, plugins: &mut Plugins) -> io::Result<CommandStatus> {
    let details = context.details;

    // Block all the signals until we are done setting up the signal handlers so we don't miss
    // SIGCHLD.
    let original_set = match SignalSet::full().and_then(|set| set.block()) {
        Ok(original_set) => Some(original_set),
        Err(err) => {
            dev_warn!("cannot block signals: {err}");
            None
        }
    };

    let mut registry = EventRegistry::new();

    let caps = plugins.io_capabilities();
    let (relays, stdio) = StdioRelays::new(
        [caps.stdin, caps.stdout, caps.stderr],
        &mut registry,
        ExecEvent::Stdio,
    )?;

    let (child_intercept, intercept_server) = intercept::prepare(details)?.unzip();

    // Use a pipe to get the IO error if `exec` fails.
    let (mut errpipe_tx, errpipe_rx) = BinPipe::pair()?;

    let ForkResult::Parent(command_pid) = fork().map_err(|err| {
        dev_warn!("unable to fork command process: {err}");
        err
    })?
    else {
        drop((relays, intercept_server, errpipe_rx));

        let err = match redirect_stdio(stdio) {
            Ok(()) => context.exec_command(
                plugins,
                child_intercept.as_ref(),
                original_set.as_ref(),
                &[errpipe_tx.as_raw_fd()],
            ),
            Err(err) => err,
        };

        dev_warn!("failed to execute command: {err}");
        // If `exec` returns, it means that executing the command failed. Send the error to the
        // parent using the pipe.
        if let Some(error_code) = err.raw_os_error() {
            errpipe_tx.write(&error_code).ok();
        }

        _exit(1);
    };

    drop((stdio, child_intercept, errpipe_tx));

    dev_info!("executed command with pid {command_pid}");

    let mut closure = ExecClosure::new(
        command_pid,
        errpipe_rx,
        relays,
        intercept_server,
        plugins,
        &mut registry,
    )?;

    // Restore the signal mask now that the handlers have been setup.
    if let Some(set) = original_set {
        if let Err(err) = set.set_mask() {
            dev_warn!("cannot restore signal mask: {err}");
        }
    }

    arm_timeout(details.timeout);

    let status = match registry.event_loop(&mut closure) {
        StopReason::Exit(status) => status,
        StopReason::Break(err) => match closure.exec_error {
            Some(errno) => {
                closure.reap_command();
                CommandStatus::Errno(errno)
            }
            None => {
                if let Some(command_pid) = closure.command_pid {
                    dev_warn!("terminating command after an error: {err}");
                    terminate_process(command_pid, false);
                    closure.reap_command();
                }
                return Err(err);
            }
        },
    };

    closure.relays.drain(closure.plugins);

    Ok(status)
}

struct ExecClosure<'a> {
    command_pid: Option<ProcessId>,
    parent_pgrp: ProcessId,
    errpipe_rx: BinPipe<i32>,
    errpipe_handle: Option<EventHandle>,
    /// The command reached `exec`.
    command_running: bool,
    exec_error: Option<c_int>,
    relays: StdioRelays,
    intercept: Option<InterceptServer>,
    plugins: &'a mut Plugins,
    signal_stream: SignalStream,
    _signal_handlers: [SignalHandler; SIGNALS.len()],
}

const SIGNALS: [SignalNumber; 12] = [
    SIGINT, SIGQUIT, SIGTSTP, SIGTERM, SIGHUP, SIGALRM, SIGPIPE, SIGUSR1, SIGUSR2, SIGCHLD, SIGCONT,
    SIGWINCH,
];

impl<'a> ExecClosure<'a> {
    fn new(
        command_pid: ProcessId,
        errpipe_rx: BinPipe<i32>,
        relays: StdioRelays,
        mut intercept: Option<InterceptServer>,
        plugins: &'a mut Plugins,
        registry: &mut EventRegistry<Self>,
    ) -> io::Result<Self> {
        let errpipe_handle =
            registry.register_event(&errpipe_rx, PollEvent::Readable, |_| ExecEvent::ErrPipe);

        let signal_stream = SignalStream::init()?;

        registry.register_event(&signal_stream, PollEvent::Readable, |_| ExecEvent::Signal);

        let signal_handlers = register_handlers(SIGNALS)?;

        if let Some(server) = &mut intercept {
            server.register(registry);
        }

        Ok(Self {
            command_pid: Some(command_pid),
            parent_pgrp: getpgrp(),
            errpipe_rx,
            errpipe_handle: Some(errpipe_handle),
            command_running: false,
            exec_error: None,
            relays,
            intercept,
            plugins,
            signal_stream,
            _signal_handlers: signal_handlers,
        })
    }

    /// Decides if the signal sent by the process with `signaler_pid` PID is self-terminating.
    ///
    /// A signal is self-terminating if `signaler_pid`:
    /// - is the same PID of the command, or
    /// - is in the process group of the command or of this process.
    fn is_self_terminating(&self, signaler_pid: ProcessId) -> bool {
        if Some(signaler_pid) == self.command_pid {
            return true;
        }

        if let Ok(signaler_pgrp) = getpgid(signaler_pid) {
            if Some(signaler_pgrp) == self.command_pid || signaler_pgrp == self.parent_pgrp {
                return true;
            }
        }

        false
    }

    /// Learn whether the command was executed. Blocks if the command has not got that far yet.
    fn on_errpipe(&mut self, registry: &mut EventRegistry<Self>) {
        let error_code = match self.errpipe_rx.read() {
            Err(err) if was_interrupted(&err) => return,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                dev_info!("command was executed");
                self.command_running = true;
                None
            }
            Err(err) => {
                registry.set_break(err);
                return;
            }
            Ok(error_code) => Some(error_code),
        };

        if let Some(handle) = self.errpipe_handle.take() {
            registry.deregister_event(handle);
        }

        if let Some(error_code) = error_code {
            // Received error code from the command, forward it to the caller.
            self.exec_error = Some(error_code);
            registry.set_break(io::Error::from_raw_os_error(error_code));
        }
    }

    /// Wait for a command that is known to be exiting.
    fn reap_command(&mut self) {
        if let Some(command_pid) = self.command_pid.take() {
            if let Err(err) = command_pid.wait(WaitOptions::new()) {
                dev_info!("cannot wait for command ({command_pid}): {err:?}");
            }
        }
    }

    /// Suspend the main process.
    fn suspend_parent(&self, signal: SignalNumber) {
        let mut opt_tty = UserTerm::open().ok();
        let mut opt_pgrp = None;

        if let Some(tty) = opt_tty.as_ref() {
            if let Ok(saved_pgrp) = tty.tcgetpgrp() {
                // Save the terminal's foreground process group so we can restore it after resuming
                // if needed.
                opt_pgrp = Some(saved_pgrp);
            } else {
                opt_tty.take();
            }
        }

        if let Some(saved_pgrp) = opt_pgrp {
            // This means that the command was stopped trying to access the terminal. If the
            // terminal has a different foreground process group and we own the terminal, we give
            // it to the command and let it continue.
            if let SIGTTOU | SIGTTIN = signal {
                if saved_pgrp == self.parent_pgrp {
                    if let Some(command_pgrp) = self.command_pid.and_then(|pid| getpgid(pid).ok()) {
                        if command_pgrp != self.parent_pgrp
                            && opt_tty
                                .as_ref()
                                .is_some_and(|tty| tty.tcsetpgrp_nobg(command_pgrp).is_ok())
                        {
                            if let Err(err) = killpg(command_pgrp, SIGCONT) {
                                dev_warn!("cannot send SIGCONT to command ({command_pgrp}): {err}");
                            }

                            return;
                        }
                    }
                }
            }
        }

        let sigtstp_handler = if signal == SIGTSTP {
            SignalHandler::register(signal, SignalHandlerBehavior::Default)
                .map_err(|err| dev_warn!("cannot set handler for {}: {err}", signal_fmt(signal)))
                .ok()
        } else {
            None
        };

        let sudo_pid = getpid();
        if let Err(err) = kill(sudo_pid, signal) {
            dev_warn!("cannot send {} to {sudo_pid} (sudo): {err}", signal_fmt(signal));
        }

        drop(sigtstp_handler);

        if let Some(saved_pgrp) = opt_pgrp {
            // Restore the foreground process group after resuming.
            if saved_pgrp != self.parent_pgrp {
                if let Some(tty) = opt_tty {
                    tty.tcsetpgrp_nobg(saved_pgrp).ok();
                }
            }
        }
    }

    fn on_signal(&mut self, registry: &mut EventRegistry<Self>) {
        let info = match self.signal_stream.recv() {
            Ok(info) => info,
            Err(err) => {
                dev_error!("sudo could not receive signal: {err}");
                return;
            }
        };

        dev_info!(
            "received{} {info}",
            opt_fmt(info.is_user_signaled(), " user signaled"),
        );

        let Some(command_pid) = self.command_pid else {
            dev_info!("command was terminated, ignoring signal");
            return;
        };

        match info.signal() {
            SIGCHLD => handle_sigchld(self, registry, "command", command_pid),
            signal => {
                // Skip the signal if it was sent by the user and it is self-terminating.
                if info.is_user_signaled()
                    && info
                        .signaler_pid()
                        .is_some_and(|pid| self.is_self_terminating(pid))
                {
                    return;
                }

                if signal == SIGALRM {
                    user_warn!("command timed out");
                    terminate_process(command_pid, false);
                } else if let Err(err) = kill(command_pid, signal) {
                    dev_warn!("cannot send {} to command: {err}", signal_fmt(signal));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecEvent {
    Signal,
    ErrPipe,
    Stdio(IoStream, PollEvent),
    Intercept(InterceptEvent),
}

impl Process for ExecClosure<'_> {
    type Event = ExecEvent;
    type Break = io::Error;
    type Exit = CommandStatus;

    fn on_event(&mut self, event: Self::Event, registry: &mut EventRegistry<Self>) {
        match event {
            ExecEvent::Signal => self.on_signal(registry),
            ExecEvent::ErrPipe => self.on_errpipe(registry),
            ExecEvent::Stdio(stream, poll_event) => {
                self.relays
                    .on_event(stream, poll_event, self.plugins, registry)
            }
            ExecEvent::Intercept(event) => {
                if let Some(server) = &mut self.intercept {
                    server.on_event(event, self.command_running, self.plugins, registry);
                }
            }
        }
    }
}

impl InterceptHost for ExecClosure<'_> {
    fn intercept_event(event: InterceptEvent) -> Self::Event {
        ExecEvent::Intercept(event)
    }
}

impl HandleSigchld for ExecClosure<'_> {
    const OPTIONS: WaitOptions = WaitOptions::new().all().untraced().no_hang();

    fn on_exit(&mut self, status: WaitStatus, registry: &mut EventRegistry<Self>) {
        self.command_pid = None;

        // A command that failed to execute exits right after reporting why.
        if self.errpipe_handle.is_some() {
            self.on_errpipe(registry);
            if self.exec_error.is_some() {
                return;
            }
        }

        registry.set_exit(CommandStatus::WaitStatus(status));
    }

    fn on_stop(&mut self, status: WaitStatus, _registry: &mut EventRegistry<Self>) {
        if let Some(signal) = status.stop_signal() {
            self.suspend_parent(signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use crate::{
        exec::{
            interface::{CommandDetails, CommandStatus, ExecFlags},
            plugin::{
                tests::{AllowAll, DenyAll},
                Plugin, Plugins,
            },
            ExitReason,
            setup::ExecContext,
        },
        system::{
            fork,
            signal::consts::*,
            wait::{Wait, WaitOptions},
            ForkResult, _exit,
        },
    };

    use super::exec_no_pty;

    fn allow_all() -> Plugins {
        Plugins::new([Plugin::Policy(Box::new(AllowAll))]).unwrap()
    }

    /// Supervise `details` in a child process and map the outcome to its exit code.
    fn supervise(details: CommandDetails, check: fn(CommandStatus) -> bool) -> i32 {
        supervise_with(details, allow_all(), check)
    }

    fn supervise_with(
        details: CommandDetails,
        mut plugins: Plugins,
        check: fn(CommandStatus) -> bool,
    ) -> i32 {
        let ForkResult::Parent(child) = fork().unwrap() else {
            let ok = ExecContext::new(&details)
                .and_then(|context| exec_no_pty(&context, &mut plugins))
                .is_ok_and(check);
            _exit(if ok { 0 } else { 1 })
        };

        let (_, status) = child.wait(WaitOptions::new()).unwrap();
        status.exit_status().unwrap()
    }

    fn sh(script: &str) -> CommandDetails {
        CommandDetails::new("/bin/sh").args(["-c", script])
    }

    #[test]
    fn exit_codes_are_reported() {
        let code = supervise(sh("exit 42"), |status| {
            status.exit_reason() == Some(ExitReason::Code(42))
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn missing_commands_are_an_errno() {
        let code = supervise(CommandDetails::new("/no/such/command"), |status| {
            status == CommandStatus::Errno(libc::ENOENT)
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn commands_killing_themselves() {
        let code = supervise(sh("kill -TERM $$"), |status| {
            matches!(status, CommandStatus::WaitStatus(status) if status.term_signal() == Some(SIGTERM))
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn rejected_sub_commands_are_permission_errors() {
        // The shell itself goes through, what it executes afterwards does not. A shell reports a
        // program it may not execute with 126.
        let details = sh("/bin/true; exit $?").flags(ExecFlags {
            intercept: true,
            ..Default::default()
        });
        let plugins = Plugins::new([Plugin::Policy(Box::new(DenyAll))]).unwrap();

        let code = supervise_with(details, plugins, |status| {
            status.exit_reason() == Some(ExitReason::Code(126))
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn timeouts_end_the_command() {
        let details = sh("sleep 30").timeout(Duration::from_secs(1));
        let code = supervise(details, |status| {
            matches!(status, CommandStatus::WaitStatus(status) if status.term_signal() == Some(SIGHUP))
        });
        assert_eq!(code, 0);
    }
}
