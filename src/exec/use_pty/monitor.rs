use std::{
    ffi::c_int,
    io,
    os::fd::{AsRawFd, RawFd},
    time::Duration,
};

use crate::exec::{opt_fmt, signal_fmt};
use crate::system::signal::{
    consts::*, register_handlers, SignalHandler, SignalHandlerBehavior, SignalNumber, SignalSet,
    SignalStream,
};
use crate::{
    common::bin_serde::BinPipe,
    exec::{
        event::{EventHandle, EventRegistry, PollEvent, Process, StopReason},
        intercept::{self, ChildIntercept, InterceptEvent, InterceptHost, InterceptServer},
        interface::CommandStatus,
        io_util::{retry_while_interrupted, was_interrupted},
        pipe::CommandStdio,
        plugin::Plugins,
        setup::{redirect_stdio, ExecContext},
        use_pty::{
            backchannel::{MonitorBackchannel, MonitorMessage},
            SIGCONT_BG, SIGCONT_FG,
        },
    },
    log::{dev_error, dev_info, dev_warn},
};
use crate::{
    exec::{handle_sigchld, terminate_process, HandleSigchld},
    system::{
        _exit, fork, getpgid, getpgrp, getpid,
        interface::ProcessId,
        killpg, setpgid, setsid,
        term::{PtyFollower, Terminal},
        wait::{Wait, WaitError, WaitOptions, WaitStatus},
        ForkResult,
    },
};

/// Run the command in its own process group, in a new session with the pty as controlling
/// terminal, and report what happens to it over `backchannel`.
///
/// Returns once the final status was sent. An error means the command was never started.
#[allow(clippy::too_many_arguments)]
pub(super) fn exec_monitor(
    context: &ExecContext,
    plugins: &mut Plugins,
    pty_follower: PtyFollower,
    stdio: CommandStdio,
    foreground: bool,
    backchannel: &mut MonitorBackchannel,
    original_set: Option<SignalSet>,
) -> io::Result<()> {
    // The monitor is not meant to read or write the pty while the command owns it.
    match SignalHandler::register(SIGTTIN, SignalHandlerBehavior::Ignore) {
        Ok(handler) => handler.forget(),
        Err(err) => dev_warn!("cannot set handler for SIGTTIN: {err}"),
    }
    match SignalHandler::register(SIGTTOU, SignalHandlerBehavior::Ignore) {
        Ok(handler) => handler.forget(),
        Err(err) => dev_warn!("cannot set handler for SIGTTOU: {err}"),
    }

    // Start a new terminal session with the monitor as the leader.
    setsid().map_err(|err| {
        dev_warn!("cannot start a new session: {err}");
        err
    })?;

    // Set the follower side of the pty as the controlling terminal for the session.
    pty_follower.make_controlling_terminal().map_err(|err| {
        dev_warn!("cannot set the controlling terminal: {err}");
        err
    })?;

    // The monitor answers the command's exec requests when it is intercepted.
    let (child_intercept, intercept_server) = intercept::prepare(context.details)?.unzip();

    // Use a pipe to get the IO error if `exec_command` fails.
    let (mut errpipe_tx, errpipe_rx) = BinPipe::pair()?;

    // Wait for the parent to give us green light before spawning the command. This avoids race
    // conditions when the command exits quickly.
    let message = retry_while_interrupted(|| backchannel.recv()).map_err(|err| {
        dev_warn!("cannot receive green light from parent: {err}");
        err
    })?;
    // Given that `UnixStream` delivers messages in order it shouldn't be possible to
    // receive an event different to `ExecCommand` at the beginning.
    debug_assert_eq!(message, MonitorMessage::ExecCommand);

    let ForkResult::Parent(command_pid) = fork().map_err(|err| {
        dev_warn!("unable to fork command process: {err}");
        err
    })?
    else {
        drop((errpipe_rx, intercept_server));

        let err = exec_command(
            context,
            plugins,
            foreground,
            pty_follower,
            stdio,
            child_intercept.as_ref(),
            original_set.as_ref(),
            errpipe_tx.as_raw_fd(),
        );
        dev_warn!("failed to execute command: {err}");
        // If `exec_command` returns, it means that executing the command failed. Send the error to
        // the monitor using the pipe.
        if let Some(error_code) = err.raw_os_error() {
            errpipe_tx.write(&error_code).ok();
        }

        _exit(1);
    };

    drop((stdio, child_intercept, errpipe_tx));

    // Send the command's PID to the parent.
    if let Err(err) = backchannel.send(&CommandStatus::Pid(command_pid)) {
        dev_warn!("cannot send command PID to parent: {err}");
    }

    let mut registry = EventRegistry::new();

    let mut closure = MonitorClosure::new(
        command_pid,
        pty_follower,
        errpipe_rx,
        backchannel,
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

    // Set the foreground group for the pty follower.
    if foreground {
        if let Err(err) = closure.pty_follower.tcsetpgrp(closure.command_pgrp) {
            dev_error!(
                "cannot set foreground progess group to {} (command): {err}",
                closure.command_pgrp
            );
        }
    }

    let status = match registry.event_loop(&mut closure) {
        StopReason::Exit(status) => status,
        StopReason::Break(err) => match closure.exec_error {
            Some(errno) => {
                closure.reap_command();
                CommandStatus::Errno(errno)
            }
            None => {
                dev_warn!("monitor stopped after an error: {err}");
                // Terminate the command if it's not terminated.
                match closure.command_pid.take() {
                    Some(command_pid) => {
                        terminate_process(command_pid, true);
                        wait_for(command_pid)
                            .map(CommandStatus::WaitStatus)
                            .unwrap_or(CommandStatus::Errno(errno_of(&err)))
                    }
                    None => CommandStatus::Errno(errno_of(&err)),
                }
            }
        },
    };

    // Take the controlling tty so the command's children don't receive SIGHUP when we exit.
    if let Err(err) = closure.pty_follower.tcsetpgrp(closure.monitor_pgrp) {
        dev_error!(
            "cannot set foreground process group to {} (monitor): {err}",
            closure.monitor_pgrp
        );
    }

    if let Err(err) = closure.backchannel.send(&status) {
        dev_warn!("cannot send message over backchannel: {err}")
    }

    Ok(())
}

fn errno_of(err: &io::Error) -> c_int {
    err.raw_os_error().unwrap_or(libc::EIO)
}

/// Block until `pid` exits.
fn wait_for(pid: ProcessId) -> Option<WaitStatus> {
    loop {
        match pid.wait(WaitOptions::new()) {
            Err(WaitError::Io(err)) if was_interrupted(&err) => {}
            Err(err) => {
                dev_info!("cannot wait for command ({pid}): {err:?}");
                return None;
            }
            Ok((_, status)) => return Some(status),
        }
    }
}

// FIXME: This should return `io::Result<!>` but `!` is not stable yet.
#[allow(clippy::too_many_arguments)]
fn exec_command(
    context: &ExecContext,
    plugins: &mut Plugins,
    foreground: bool,
    pty_follower: PtyFollower,
    stdio: CommandStdio,
    intercept: Option<&ChildIntercept>,
    original_set: Option<&SignalSet>,
    errpipe_fd: RawFd,
) -> io::Error {
    let command_pid = getpid();

    setpgid(ProcessId::new(0), command_pid).ok();

    // Wait for the monitor to set us as the foreground group for the pty if we are in the
    // foreground.
    if foreground {
        while !pty_follower.tcgetpgrp().is_ok_and(|pid| pid == command_pid) {
            std::thread::sleep(Duration::from_micros(1));
        }
    }

    // Done with the pty follower.
    drop(pty_follower);

    if let Err(err) = redirect_stdio(stdio) {
        return err;
    }

    context.exec_command(plugins, intercept, original_set, &[errpipe_fd])
}

struct MonitorClosure<'a> {
    /// The command PID.
    ///
    /// This is `Some` iff the process is still running.
    command_pid: Option<ProcessId>,
    command_pgrp: ProcessId,
    monitor_pgrp: ProcessId,
    pty_follower: PtyFollower,
    errpipe_rx: BinPipe<i32>,
    errpipe_handle: Option<EventHandle>,
    /// The command reached `exec`.
    command_running: bool,
    exec_error: Option<c_int>,
    backchannel: &'a mut MonitorBackchannel,
    intercept: Option<InterceptServer>,
    plugins: &'a mut Plugins,
    signal_stream: SignalStream,
    _signal_handlers: [SignalHandler; SIGNALS.len()],
}

const SIGNALS: [SignalNumber; 8] = [
    SIGINT, SIGQUIT, SIGTSTP, SIGTERM, SIGHUP, SIGUSR1, SIGUSR2, SIGCHLD,
];

impl<'a> MonitorClosure<'a> {
    fn new(
        command_pid: ProcessId,
        pty_follower: PtyFollower,
        errpipe_rx: BinPipe<i32>,
        backchannel: &'a mut MonitorBackchannel,
        mut intercept: Option<InterceptServer>,
        plugins: &'a mut Plugins,
        registry: &mut EventRegistry<Self>,
    ) -> io::Result<Self> {
        // Store the pgid of the monitor.
        let monitor_pgrp = getpgrp();

        // Register the callback to receive the IO error if the command fails to execute.
        let errpipe_handle =
            registry.register_event(&errpipe_rx, PollEvent::Readable, |_| MonitorEvent::ErrPipe);

        // Register the callback to receive events from the backchannel
        registry.register_event(&*backchannel, PollEvent::Readable, |_| {
            MonitorEvent::Backchannel
        });

        let signal_stream = SignalStream::init()?;

        registry.register_event(&signal_stream, PollEvent::Readable, |_| MonitorEvent::Signal);

        let signal_handlers = register_handlers(SIGNALS)?;

        if let Some(server) = &mut intercept {
            server.register(registry);
        }

        // Put the command in its own process group.
        let command_pgrp = command_pid;
        if let Err(err) = setpgid(command_pid, command_pgrp) {
            dev_warn!("cannot set process group ID for process: {err}");
        };

        Ok(Self {
            command_pid: Some(command_pid),
            command_pgrp,
            monitor_pgrp,
            pty_follower,
            errpipe_rx,
            errpipe_handle: Some(errpipe_handle),
            command_running: false,
            exec_error: None,
            backchannel,
            intercept,
            plugins,
            signal_stream,
            _signal_handlers: signal_handlers,
        })
    }

    /// Handle a request from the parent.
    fn read_backchannel(&mut self, registry: &mut EventRegistry<Self>) {
        match self.backchannel.recv() {
            // We can try later if receive is interrupted.
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                // There's something wrong with the backchannel, break the event loop.
                dev_warn!("cannot read from backchannel: {err}");
                registry.set_break(err);
            }
            // We shouldn't receive this event more than once.
            Ok(MonitorMessage::ExecCommand) => {
                dev_warn!("received a second green light from parent");
            }
            // Forward signal to the command.
            Ok(MonitorMessage::Signal(signal)) => {
                if let Some(command_pid) = self.command_pid {
                    self.send_signal(signal, command_pid, true)
                }
            }
        }
    }

    /// Learn whether the command was executed. Blocks if the command has not got that far yet.
    fn read_errpipe(&mut self, registry: &mut EventRegistry<Self>) {
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
            // Received error code from the command, forward it to the parent.
            self.exec_error = Some(error_code);
            registry.set_break(io::Error::from_raw_os_error(error_code));
        }
    }

    fn reap_command(&mut self) {
        if let Some(command_pid) = self.command_pid.take() {
            wait_for(command_pid);
        }
    }

    /// Send a signal to the command.
    fn send_signal(&self, signal: c_int, command_pid: ProcessId, from_parent: bool) {
        dev_info!(
            "sending {}{} to command",
            signal_fmt(signal),
            opt_fmt(from_parent, " from parent"),
        );
        match signal {
            SIGALRM => {
                terminate_process(command_pid, true);
            }
            SIGCONT_FG => {
                // Continue with the command as the foreground process group
                if let Err(err) = self.pty_follower.tcsetpgrp(self.command_pgrp) {
                    dev_error!(
                        "cannot set the foreground process group to {} (command): {err}",
                        self.command_pgrp
                    );
                }
                killpg(command_pid, SIGCONT).ok();
            }
            SIGCONT_BG => {
                // Continue with the monitor as the foreground process group
                if let Err(err) = self.pty_follower.tcsetpgrp(self.monitor_pgrp) {
                    dev_error!(
                        "cannot set the foreground process group to {} (monitor): {err}",
                        self.monitor_pgrp
                    );
                }
                killpg(command_pid, SIGCONT).ok();
            }
            signal => {
                // Send the signal to the command.
                killpg(command_pid, signal).ok();
            }
        }
    }

    fn on_signal(&mut self, registry: &mut EventRegistry<Self>) {
        let info = match self.signal_stream.recv() {
            Ok(info) => info,
            Err(err) => {
                dev_error!("could not receive signal: {err}");
                return;
            }
        };

        dev_info!(
            "monitor received{} {info}",
            opt_fmt(info.is_user_signaled(), " user signaled"),
        );

        // Don't do anything if the command has terminated already
        let Some(command_pid) = self.command_pid else {
            dev_info!("command was terminated, ignoring signal");
            return;
        };

        match info.signal() {
            SIGCHLD => handle_sigchld(self, registry, "command", command_pid),
            // Skip the signal if it was sent by the user and it is self-terminating.
            _ if info.is_user_signaled()
                && info.signaler_pid().is_some_and(|pid| {
                    is_self_terminating(pid, command_pid, self.command_pgrp)
                }) => {}
            signal => self.send_signal(signal, command_pid, false),
        }
    }
}

/// Decides if the signal sent by the process with `signaler_pid` PID is self-terminating.
///
/// A signal is self-terminating if `signaler_pid`:
/// - is the same PID of the command, or
/// - is in the process group of the command and the command is the leader.
fn is_self_terminating(
    signaler_pid: ProcessId,
    command_pid: ProcessId,
    command_pgrp: ProcessId,
) -> bool {
    if signaler_pid.is_valid() {
        if signaler_pid == command_pid {
            return true;
        }

        if let Ok(grp_leader) = getpgid(signaler_pid) {
            if grp_leader == command_pgrp {
                return true;
            }
        }
    }

    false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorEvent {
    Signal,
    ErrPipe,
    Backchannel,
    Intercept(InterceptEvent),
}

impl Process for MonitorClosure<'_> {
    type Event = MonitorEvent;
    type Break = io::Error;
    type Exit = CommandStatus;

    fn on_event(&mut self, event: Self::Event, registry: &mut EventRegistry<Self>) {
        match event {
            MonitorEvent::Signal => self.on_signal(registry),
            MonitorEvent::ErrPipe => self.read_errpipe(registry),
            MonitorEvent::Backchannel => self.read_backchannel(registry),
            MonitorEvent::Intercept(event) => {
                if let Some(server) = &mut self.intercept {
                    server.on_event(event, self.command_running, self.plugins, registry);
                }
            }
        }
    }
}

impl InterceptHost for MonitorClosure<'_> {
    fn intercept_event(event: InterceptEvent) -> Self::Event {
        MonitorEvent::Intercept(event)
    }
}

impl HandleSigchld for MonitorClosure<'_> {
    const OPTIONS: WaitOptions = WaitOptions::new().untraced().no_hang();

    fn on_exit(&mut self, status: WaitStatus, registry: &mut EventRegistry<Self>) {
        self.command_pid = None;

        // A command that failed to execute exits right after reporting why.
        if self.errpipe_handle.is_some() {
            self.read_errpipe(registry);
            if self.exec_error.is_some() {
                return;
            }
        }

        registry.set_exit(CommandStatus::WaitStatus(status));
    }

    fn on_stop(&mut self, status: WaitStatus, _registry: &mut EventRegistry<Self>) {
        // Save the foreground process group ID so we can restore it later.
        if let Ok(pgrp) = self.pty_follower.tcgetpgrp() {
            if pgrp != self.monitor_pgrp {
                self.command_pgrp = pgrp;
            }
        }
        if let Err(err) = self.backchannel.send(&CommandStatus::WaitStatus(status)) {
            dev_warn!("cannot send stop status to parent: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::system::{getpgrp, getpid, interface::ProcessId};

    use super::is_self_terminating;

    #[test]
    fn signals_from_the_command_group_are_dropped() {
        let me = getpid();
        let other = ProcessId::new(me.get() + 1);

        assert!(is_self_terminating(me, me, other));
        assert!(is_self_terminating(me, other, getpgrp()));
        assert!(!is_self_terminating(ProcessId::new(0), other, getpgrp()));
    }
}
