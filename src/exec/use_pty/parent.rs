use std::collections::VecDeque;
use std::io::{self, IsTerminal, Write};
use std::os::fd::OwnedFd;

use crate::exec::event::{EventHandle, EventRegistry, PollEvent, Process, StopReason};
use crate::exec::use_pty::monitor::exec_monitor;
use crate::exec::use_pty::SIGCONT_FG;
use crate::exec::{
    arm_timeout, cond_fmt, handle_sigchld, opt_fmt, signal_fmt, terminate_process, HandleSigchld,
};
use crate::exec::{
    interface::CommandStatus,
    io_util::retry_while_interrupted,
    pipe::{Pipe, StdioRelays},
    plugin::{IoStream, Plugins},
    setup::ExecContext,
    use_pty::backchannel::{backchannel_pair, MonitorMessage, ParentBackchannel},
};
use crate::log::{dev_error, dev_info, dev_warn, user_warn};
use crate::system::signal::{
    consts::*, register_handlers, signal_description, SignalHandler, SignalHandlerBehavior,
    SignalNumber, SignalSet, SignalStream,
};
use crate::system::term::{Pty, PtyLeader, TermSize, Terminal, UserTerm};
use crate::system::wait::{Wait, WaitError, WaitOptions, WaitStatus};
use crate::system::{
    _exit, fork, getpgid, getpgrp, getpid, group_id_by_name, kill, killpg, real_uid, ForkResult,
};
use crate::system::interface::ProcessId;

use super::SIGCONT_BG;

/// Run the command in a new pseudo-terminal under a monitor process, proxying the user's
/// terminal to it.
pub(in crate::exec) fn exec_pty(
    context: &ExecContext,
    plugins: &mut Plugins,
    user_tty: UserTerm,
) -> io::Result<CommandStatus> {
    let details = context.details;

    // Allocate a pseudoterminal.
    let pty = get_pty()?;

    // Create backchannels to communicate with the monitor.
    let (mut backchannel, mut monitor_backchannel) = backchannel_pair().map_err(|err| {
        dev_error!("cannot create backchannel: {err}");
        err
    })?;

    // We don't want to receive SIGTTIN/SIGTTOU
    match SignalHandler::register(SIGTTIN, SignalHandlerBehavior::Ignore) {
        Ok(handler) => handler.forget(),
        Err(err) => dev_warn!("cannot set handler for SIGTTIN: {err}"),
    }
    match SignalHandler::register(SIGTTOU, SignalHandlerBehavior::Ignore) {
        Ok(handler) => handler.forget(),
        Err(err) => dev_warn!("cannot set handler for SIGTTOU: {err}"),
    }

    let sudo_pid = getpid();
    // Fetch the parent process group so we can signals to it.
    let parent_pgrp = getpgrp();

    let mut registry = EventRegistry::<ParentClosure>::new();

    // Pipe data between both terminals
    let mut tty_pipe = Pipe::new(
        user_tty,
        pty.leader,
        &mut registry,
        ParentEvent::Tty,
        ParentEvent::Pty,
    );

    let user_tty = tty_pipe.left_mut();

    // Check if we are the foreground process
    let mut foreground = !details.flags.exec_bg
        && user_tty
            .tcgetpgrp()
            .is_ok_and(|tty_pgrp| tty_pgrp == parent_pgrp);
    dev_info!(
        "sudo is running in the {}",
        cond_fmt(foreground, "foreground", "background")
    );

    // Whether we're running on a pipeline
    let mut pipeline = false;
    // Whether the command should be executed in the background (this is not the `-b` flag)
    let mut command_bg = false;
    // Whether the user's terminal is in raw mode or not.
    let mut term_raw = false;

    let is_tty = [
        io::stdin().is_terminal(),
        io::stdout().is_terminal(),
        io::stderr().is_terminal(),
    ];

    // Streams that are not terminals are inherited, unless an I/O plugin wants to see them.
    let caps = plugins.io_capabilities();
    let (relays, mut stdio) = StdioRelays::new(
        [
            !is_tty[0] && caps.stdin,
            !is_tty[1] && caps.stdout,
            !is_tty[2] && caps.stderr,
        ],
        &mut registry,
        ParentEvent::Stdio,
    )?;

    for (fd, is_tty) in stdio.iter_mut().zip(is_tty) {
        if is_tty {
            let follower = pty.follower.try_clone().map_err(|err| {
                dev_error!("cannot clone pty follower: {err}");
                err
            })?;
            *fd = Some(OwnedFd::from(follower));
        }
    }

    if !is_tty[0] {
        dev_info!("stdin is not a terminal, command will not read from the pty");
        pipeline = true;

        if foreground && parent_pgrp != sudo_pid {
            // If sudo is not the process group leader and stdin is not a terminal we might be
            // running as a background job via a shell script. Starting in the foreground would
            // change the terminal mode.
            command_bg = true;
        }
    }

    if !is_tty[1] {
        dev_info!("stdout is not a terminal, command will not write to the pty");
        pipeline = true;
        foreground = false;
    }

    // Copy terminal settings from `/dev/tty` to the pty.
    if let Err(err) = user_tty.copy_to(&pty.follower) {
        dev_error!("cannot copy terminal settings to pty: {err}");
        foreground = false;
    }

    // Start in raw mode unless we're part of a pipeline or backgrounded.
    if foreground && !pipeline && !command_bg && user_tty.set_raw_mode(false).is_ok() {
        term_raw = true;
    }

    let tty_size = tty_pipe.left().get_size().map_err(|err| {
        dev_error!("cannot get terminal size: {err}");
        err
    })?;
    if let Err(err) = pty.follower.set_size(&tty_size) {
        dev_warn!("cannot set pty size to {tty_size}: {err}");
    }

    // Block all the signals until we are done setting up the signal handlers so we don't miss
    // SIGCHLD.
    let original_set = match SignalSet::full().and_then(|set| set.block()) {
        Ok(original_set) => Some(original_set),
        Err(err) => {
            dev_warn!("cannot block signals: {err}");
            None
        }
    };

    if !foreground {
        tty_pipe.disable_input(&mut registry);
    }

    let ForkResult::Parent(monitor_pid) = fork().map_err(|err| {
        dev_error!("cannot fork monitor process: {err}");
        err
    })?
    else {
        // Close the file descriptors that we don't access
        drop((tty_pipe, relays, backchannel));

        let result = exec_monitor(
            context,
            plugins,
            pty.follower,
            stdio,
            foreground && !pipeline && !command_bg,
            &mut monitor_backchannel,
            original_set,
        );

        if let Err(err) = result {
            dev_warn!("monitor failed: {err}");
            let errno = err.raw_os_error().unwrap_or(libc::EIO);
            if let Err(err) = monitor_backchannel.send(&CommandStatus::Errno(errno)) {
                dev_error!("cannot send status to parent: {err}");
            }
            _exit(1);
        }

        // We call `_exit` instead of `exit` to avoid flushing the parent's IO streams by accident.
        _exit(0);
    };

    // Close the file descriptors that we don't access
    drop((pty.follower, monitor_backchannel, stdio));

    // Send green light to the monitor after closing the follower.
    retry_while_interrupted(|| backchannel.write(&MonitorMessage::ExecCommand)).map_err(
        |err| {
            dev_error!("cannot send green light to monitor: {err}");
            err
        },
    )?;

    let mut closure = ParentClosure::new(
        monitor_pid,
        sudo_pid,
        parent_pgrp,
        backchannel,
        tty_pipe,
        relays,
        tty_size,
        foreground,
        term_raw,
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

    let result = match registry.event_loop(&mut closure) {
        StopReason::Exit(status) => Ok(status),
        StopReason::Break(err) => {
            if let Some(command_pid) = closure.command_pid.take() {
                dev_warn!("terminating command after an error: {err}");
                terminate_process(command_pid, true);
            }
            Err(err)
        }
    };

    closure.reap_monitor();

    // Flush the terminal
    if let Err(err) = closure.tty_pipe.drain_right(closure.plugins) {
        dev_warn!("cannot flush the pty output: {err}");
    }
    closure.relays.drain(closure.plugins);

    // Restore the terminal settings
    if closure.term_raw {
        // Only restore the terminal if sudo is the foreground process.
        if let Ok(pgrp) = closure.tty_pipe.left().tcgetpgrp() {
            if pgrp == closure.parent_pgrp {
                match closure.tty_pipe.left_mut().restore(false) {
                    Ok(()) => closure.term_raw = false,
                    Err(err) => dev_warn!("cannot restore terminal settings: {err}"),
                }
            }
        }
    }

    if let Ok(CommandStatus::WaitStatus(status)) = result {
        closure.report_fatal_signal(status);
    }

    result
}

fn get_pty() -> io::Result<Pty> {
    let tty_gid = group_id_by_name(c"tty").unwrap_or(None);

    let pty = Pty::open().map_err(|err| {
        dev_error!("cannot allocate pty: {err}");
        io::Error::new(io::ErrorKind::NotFound, "unable to open pty")
    })?;

    // An unprivileged caller cannot hand the pty to the tty group, the pty stays usable anyway.
    if let Err(err) = pty.set_owner(real_uid(), tty_gid) {
        dev_warn!("cannot change owner for pty: {err}");
    }

    Ok(pty)
}

struct ParentClosure<'a> {
    // The monitor PID.
    //
    /// This is `Some` iff the process is still running.
    monitor_pid: Option<ProcessId>,
    sudo_pid: ProcessId,
    parent_pgrp: ProcessId,
    command_pid: Option<ProcessId>,
    tty_pipe: Pipe<UserTerm, PtyLeader>,
    relays: StdioRelays,
    tty_size: TermSize,
    foreground: bool,
    term_raw: bool,
    backchannel: ParentBackchannel,
    message_queue: VecDeque<MonitorMessage>,
    backchannel_write_handle: EventHandle,
    plugins: &'a mut Plugins,
    signal_stream: SignalStream,
    _signal_handlers: [SignalHandler; SIGNALS.len()],
}

const SIGNALS: [SignalNumber; 11] = [
    SIGINT, SIGQUIT, SIGTSTP, SIGTERM, SIGHUP, SIGALRM, SIGUSR1, SIGUSR2, SIGCHLD, SIGCONT,
    SIGWINCH,
];

impl<'a> ParentClosure<'a> {
    #[allow(clippy::too_many_arguments)]
    fn new(
        monitor_pid: ProcessId,
        sudo_pid: ProcessId,
        parent_pgrp: ProcessId,
        backchannel: ParentBackchannel,
        tty_pipe: Pipe<UserTerm, PtyLeader>,
        relays: StdioRelays,
        tty_size: TermSize,
        foreground: bool,
        term_raw: bool,
        plugins: &'a mut Plugins,
        registry: &mut EventRegistry<Self>,
    ) -> io::Result<Self> {
        registry.register_event(&backchannel, PollEvent::Readable, ParentEvent::Backchannel);
        let mut backchannel_write_handle =
            registry.register_event(&backchannel, PollEvent::Writable, ParentEvent::Backchannel);
        // Ignore write events on the backchannel as we don't want to poll it for writing if there
        // are no messages in the queue.
        backchannel_write_handle.ignore(registry);

        let signal_stream = SignalStream::init()?;

        registry.register_event(&signal_stream, PollEvent::Readable, |_| ParentEvent::Signal);

        let signal_handlers = register_handlers(SIGNALS)?;

        Ok(Self {
            monitor_pid: Some(monitor_pid),
            sudo_pid,
            parent_pgrp,
            command_pid: None,
            tty_pipe,
            relays,
            tty_size,
            foreground,
            term_raw,
            backchannel,
            message_queue: VecDeque::new(),
            backchannel_write_handle,
            plugins,
            signal_stream,
            _signal_handlers: signal_handlers,
        })
    }

    /// Read a status from the backchannel.
    fn on_message_received(&mut self, registry: &mut EventRegistry<Self>) {
        let status = match self.backchannel.read() {
            Ok(status) => status,
            // If we get EOF the monitor exited or was killed
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                dev_info!("received EOF from backchannel");
                registry.set_break(err);
                return;
            }
            // We can try later if receive is interrupted.
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return,
            // Failed to read command status. This means that something is wrong with the socket
            // and we should stop.
            Err(err) => {
                dev_error!("cannot receive message from backchannel: {err}");
                if !registry.got_break() {
                    registry.set_break(err);
                }
                return;
            }
        };

        match status {
            // Received the PID of the command. This means that the command is already
            // executing.
            CommandStatus::Pid(pid) => {
                dev_info!("received command PID ({pid}) from monitor");
                self.command_pid = Some(pid);
            }
            CommandStatus::WaitStatus(wait_status) if wait_status.was_stopped() => {
                let signal = wait_status.stop_signal().unwrap_or(SIGSTOP);
                dev_info!(
                    "command was stopped by {}, suspending parent",
                    signal_fmt(signal)
                );
                // Suspend parent and tell monitor how to resume on return
                if let Some(signal) = self.suspend_pty(signal, registry) {
                    self.schedule_signal(signal, registry);
                }

                self.tty_pipe.resume_events(registry);
            }
            // The command terminated or the monitor was not able to spawn it. We should stop
            // either way.
            status if status.is_final() => {
                dev_info!("command finished: {status:?}");
                self.command_pid = None;
                registry.set_exit(status);
            }
            status => dev_warn!("unexpected status from monitor: {status:?}"),
        }
    }

    /// Decides if the signal sent by the process with `signaler_pid` PID is self-terminating.
    ///
    /// A signal is self-terminating if `signaler_pid`:
    /// - is the same PID of the command, or
    /// - is in the process group of the command and either sudo or the command is the leader.
    fn is_self_terminating(&self, signaler_pid: ProcessId) -> bool {
        if signaler_pid.is_valid() {
            if Some(signaler_pid) == self.command_pid {
                return true;
            }

            if let Ok(signaler_pgrp) = getpgid(signaler_pid) {
                if Some(signaler_pgrp) == self.command_pid || signaler_pgrp == self.sudo_pid {
                    return true;
                }
            }
        }

        false
    }

    /// Schedule sending a signal event to the monitor using the backchannel.
    ///
    /// The signal message will be sent once the backchannel is ready to be written.
    fn schedule_signal(&mut self, signal: SignalNumber, registry: &mut EventRegistry<Self>) {
        dev_info!("scheduling message with {} for monitor", signal_fmt(signal));
        self.message_queue.push_back(MonitorMessage::Signal(signal));

        // Start polling the backchannel for writing if not already.
        self.backchannel_write_handle.resume(registry);
    }

    /// Send the first message in the event queue using the backchannel, if any.
    ///
    /// Calling this function will block until the backchannel can be written.
    fn check_message_queue(&mut self, registry: &mut EventRegistry<Self>) {
        let Some(&msg) = self.message_queue.front() else {
            self.backchannel_write_handle.ignore(registry);
            return;
        };

        dev_info!("sending message {msg:?} to monitor over backchannel");
        match self.backchannel.write(&msg) {
            // The event was sent, remove it from the queue
            Ok(()) => {
                self.message_queue.pop_front();
                // Stop polling the backchannel for writing if the queue is empty.
                if self.message_queue.is_empty() {
                    self.backchannel_write_handle.ignore(registry);
                }
            }
            // We can try later if send is interrupted.
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                // There's something wrong with the backchannel, break the event loop.
                dev_error!("cannot send via backchannel {err}");
                registry.set_break(err);
            }
        }
    }

    /// Suspend sudo if the command is suspended.
    ///
    /// Return `SIGCONT_FG` or `SIGCONT_BG` to state whether the command should be resumend in the
    /// foreground or not.
    fn suspend_pty(
        &mut self,
        signal: SignalNumber,
        registry: &mut EventRegistry<Self>,
    ) -> Option<SignalNumber> {
        // Ignore `SIGCONT` while suspending to avoid resuming the terminal twice.
        let sigcont_handler = SignalHandler::register(SIGCONT, SignalHandlerBehavior::Ignore)
            .map_err(|err| dev_warn!("cannot set handler for SIGCONT: {err}"))
            .ok();

        if let SIGTTOU | SIGTTIN = signal {
            // If sudo is already the foreground process we can resume the command in the
            // foreground. Otherwise, we have to suspend and resume later.
            if !self.foreground && self.check_foreground().is_err() {
                // User's tty was revoked.
                return None;
            }

            if self.foreground {
                dev_info!(
                    "command received {}, parent running in the foreground",
                    signal_fmt(signal)
                );
                if !self.term_raw && self.tty_pipe.left_mut().set_raw_mode(false).is_ok() {
                    self.term_raw = true;
                }
                // Resume command in the foreground
                return Some(SIGCONT_FG);
            }
        }

        // Whatever the command wrote before stopping goes out first.
        if let Err(err) = self.tty_pipe.flush_left() {
            dev_warn!("cannot flush pty output: {err}");
        }

        // Stop polling the terminals.
        self.tty_pipe.ignore_events(registry);

        if self.term_raw {
            match self.tty_pipe.left_mut().restore(false) {
                Ok(()) => self.term_raw = false,
                Err(err) => dev_warn!("cannot restore terminal settings: {err}"),
            }
        }

        self.plugins.suspend(signal);

        let signal_handler = if signal != SIGSTOP {
            SignalHandler::register(signal, SignalHandlerBehavior::Default)
                .map_err(|err| dev_warn!("cannot set handler for {}: {err}", signal_fmt(signal)))
                .ok()
        } else {
            None
        };

        if self.parent_pgrp != self.sudo_pid && kill(self.parent_pgrp, 0).is_err()
            || killpg(self.parent_pgrp, signal).is_err()
        {
            dev_error!("no parent to suspend, terminating command");
            if let Some(command_pid) = self.command_pid.take() {
                terminate_process(command_pid, true);
            }
        }

        drop(signal_handler);

        self.plugins.suspend(SIGCONT);

        if self.command_pid.is_none() || self.resume_terminal(registry).is_err() {
            return None;
        }

        let ret_signal = if self.term_raw {
            SIGCONT_FG
        } else {
            SIGCONT_BG
        };

        // Restore the handler for SIGCONT.
        drop(sigcont_handler);

        Some(ret_signal)
    }

    /// Check whether we are part of the foreground process group and update the foreground flag.
    fn check_foreground(&mut self) -> io::Result<()> {
        let pgrp = self.tty_pipe.left().tcgetpgrp()?;
        self.foreground = pgrp == self.parent_pgrp;
        Ok(())
    }

    /// Restore the terminal when sudo resumes after receiving `SIGCONT`.
    fn resume_terminal(&mut self, registry: &mut EventRegistry<Self>) -> io::Result<()> {
        self.check_foreground()?;

        // Update the pty settings based on the user's tty.
        self.tty_pipe
            .left()
            .copy_to(self.tty_pipe.right())
            .map_err(|err| {
                dev_error!("cannot copy terminal settings to pty: {err}");
                err
            })?;

        if let Err(err) = self.sync_tty_size() {
            dev_warn!("cannot resize terminal: {err}");
        }

        dev_info!(
            "parent is in {} ({} -> {})",
            cond_fmt(self.foreground, "foreground", "background"),
            cond_fmt(self.term_raw, "raw", "cooked"),
            cond_fmt(self.foreground, "raw", "cooked"),
        );

        if self.foreground {
            // We're in the foreground, set tty to raw mode.
            if self.tty_pipe.left_mut().set_raw_mode(false).is_ok() {
                self.term_raw = true;
            }
            self.tty_pipe.enable_input(registry);
        } else {
            // We're in the background, cannot access tty.
            self.term_raw = false;
            self.tty_pipe.disable_input(registry);
        }

        Ok(())
    }

    fn on_signal(&mut self, registry: &mut EventRegistry<Self>) {
        let info = match self.signal_stream.recv() {
            Ok(info) => info,
            Err(err) => {
                dev_error!("parent could not receive signal: {err}");
                return;
            }
        };

        dev_info!(
            "parent received{} {info}",
            opt_fmt(info.is_user_signaled(), " user signaled"),
        );

        let Some(monitor_pid) = self.monitor_pid else {
            dev_info!("monitor was terminated, ignoring signal");
            return;
        };

        match info.signal() {
            SIGCHLD => handle_sigchld(self, registry, "monitor", monitor_pid),
            SIGCONT => {
                if let Err(err) = self.resume_terminal(registry) {
                    dev_warn!("cannot resume terminal: {err}");
                }
            }
            SIGWINCH => {
                if let Err(err) = self.sync_tty_size() {
                    dev_warn!("cannot resize terminal: {err}");
                }
            }
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
                }

                self.schedule_signal(signal, registry)
            }
        }
    }

    /// Give the pty the size of the user's terminal if it changed.
    fn sync_tty_size(&mut self) -> io::Result<()> {
        let new_size = self.tty_pipe.left().get_size()?;

        if new_size != self.tty_size {
            dev_info!("updating pty size from {} to {new_size}", self.tty_size);
            // Set the pty size.
            self.tty_pipe.right().set_size(&new_size)?;
            self.plugins
                .change_winsize(new_size.rows(), new_size.cols());
            // Send SIGWINCH to the command.
            if let Some(command_pid) = self.command_pid {
                killpg(command_pid, SIGWINCH).ok();
            }
            // Update the terminal size.
            self.tty_size = new_size;
        }

        Ok(())
    }

    /// Wait for the monitor, which exits right after sending the final status.
    fn reap_monitor(&mut self) {
        let Some(monitor_pid) = self.monitor_pid.take() else {
            return;
        };

        loop {
            match monitor_pid.wait(WaitOptions::new()) {
                Err(WaitError::Io(err)) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    dev_info!("cannot wait for monitor ({monitor_pid}): {err:?}");
                    break;
                }
                Ok(_) => break,
            }
        }
    }

    /// Tell the user why the command died, like a shell would.
    fn report_fatal_signal(&mut self, status: WaitStatus) {
        let Some(signal) = status.term_signal() else {
            return;
        };

        if signal == SIGINT || signal == SIGPIPE {
            return;
        }

        let mut message = signal_description(signal);
        if status.did_core_dump() {
            message.push_str(" (core dumped)");
        }
        message.push('\n');

        if let Err(err) = self.tty_pipe.left_mut().write_all(message.as_bytes()) {
            dev_warn!("cannot write to the terminal: {err}");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParentEvent {
    Signal,
    Tty(PollEvent),
    Pty(PollEvent),
    Backchannel(PollEvent),
    Stdio(IoStream, PollEvent),
}

impl Process for ParentClosure<'_> {
    type Event = ParentEvent;
    type Break = io::Error;
    type Exit = CommandStatus;

    fn on_event(&mut self, event: Self::Event, registry: &mut EventRegistry<Self>) {
        match event {
            ParentEvent::Signal => self.on_signal(registry),
            ParentEvent::Tty(poll_event) => {
                // Check if tty which existed is now gone.
                if self.tty_pipe.left().tcgetsid().is_err() {
                    dev_warn!("tty gone (closed/detached), ignoring future events");
                    self.tty_pipe.ignore_events(registry);
                } else if let Err(err) =
                    self.tty_pipe
                        .on_left_event(poll_event, self.plugins, registry)
                {
                    dev_warn!("cannot relay the user's terminal: {err}");
                    self.tty_pipe.ignore_events(registry);
                }
            }
            ParentEvent::Pty(poll_event) => {
                if let Err(err) = self
                    .tty_pipe
                    .on_right_event(poll_event, self.plugins, registry)
                {
                    dev_warn!("cannot relay the pty: {err}");
                    self.tty_pipe.ignore_events(registry);
                }
            }
            ParentEvent::Backchannel(poll_event) => match poll_event {
                PollEvent::Readable => self.on_message_received(registry),
                PollEvent::Writable => self.check_message_queue(registry),
            },
            ParentEvent::Stdio(stream, poll_event) => {
                self.relays
                    .on_event(stream, poll_event, self.plugins, registry)
            }
        }
    }
}

impl HandleSigchld for ParentClosure<'_> {
    const OPTIONS: WaitOptions = WaitOptions::new().all().untraced().no_hang();

    fn on_exit(&mut self, _status: WaitStatus, _registry: &mut EventRegistry<Self>) {
        self.monitor_pid = None;
    }

    fn on_stop(&mut self, status: WaitStatus, registry: &mut EventRegistry<Self>) {
        let Some(signal) = status.stop_signal() else {
            return;
        };

        if let Some(signal) = self.suspend_pty(signal, registry) {
            self.schedule_signal(signal, registry);
        }
        self.tty_pipe.resume_events(registry);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        fs::File,
        io::{self, Read, Write},
        os::fd::OwnedFd,
        rc::Rc,
    };

    use crate::{
        exec::{
            event::{EventRegistry, PollEvent},
            interface::{CommandDetails, CommandStatus},
            pipe::{Pipe, StdioRelays},
            plugin::{tests::AllowAll, IoCapabilities, IoPlugin, Plugin, Plugins},
            setup::ExecContext,
            use_pty::{backchannel::backchannel_pair, SIGCONT_FG},
        },
        system::{
            _exit, dup2, fork, getpgrp, getpid, set_nonblocking, setsid,
            signal::{consts::*, SignalNumber},
            term::{Pty, Terminal, UserTerm},
            wait::{Wait, WaitOptions},
            ForkResult,
        },
    };

    use super::{exec_pty, ParentClosure, ParentEvent};

    fn sh(script: &str) -> CommandDetails {
        CommandDetails::new("/bin/sh").args(["-c", script])
    }

    /// Supervise `details` in a child whose controlling terminal is a fresh pty. Returns whether
    /// `check` accepted the status together with everything written to that terminal.
    fn supervise(details: CommandDetails, check: fn(CommandStatus) -> bool) -> (bool, String) {
        let outer = Pty::open().unwrap();

        let ForkResult::Parent(child) = fork().unwrap() else {
            let result = (|| -> io::Result<CommandStatus> {
                setsid()?;
                outer.follower.make_controlling_terminal()?;
                for target in 0..3 {
                    dup2(&outer.follower, target)?;
                }
                let tty = File::from(OwnedFd::from(outer.follower.try_clone()?));

                let context = ExecContext::new(&details)?;
                let mut plugins = Plugins::new([Plugin::Policy(Box::new(AllowAll))])
                    .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
                exec_pty(&context, &mut plugins, UserTerm::from_file(tty))
            })();
            _exit(if result.is_ok_and(check) { 0 } else { 1 })
        };

        let (_, status) = child.wait(WaitOptions::new()).unwrap();

        let mut leader = outer.leader;
        set_nonblocking(&leader, true).unwrap();
        let mut output = Vec::new();
        let mut buf = [0; 1024];
        while let Ok(len @ 1..) = leader.read(&mut buf) {
            output.extend_from_slice(&buf[..len]);
        }

        (
            status.exit_status() == Some(0),
            String::from_utf8_lossy(&output).into_owned(),
        )
    }

    const PENDING_OUTPUT: &[u8] = b"written-before-the-stop";

    /// Remembers every suspend notification.
    struct Suspensions(Rc<RefCell<Vec<SignalNumber>>>);

    impl IoPlugin for Suspensions {
        fn capabilities(&self) -> IoCapabilities {
            IoCapabilities {
                suspend: true,
                ..Default::default()
            }
        }

        fn suspend(&mut self, signal: SignalNumber) {
            self.0.borrow_mut().push(signal);
        }
    }

    type ClosureCheck = for<'a> fn(
        &mut ParentClosure<'a>,
        &mut EventRegistry<ParentClosure<'a>>,
        &RefCell<Vec<SignalNumber>>,
    ) -> bool;

    /// Build a parent relaying a fresh controlling terminal to a second pty, with
    /// [`PENDING_OUTPUT`] read from that pty but not yet written out, and hand it to `check` in a
    /// child process. Returns whether `check` succeeded together with everything written to the
    /// controlling terminal.
    fn with_parent(foreground: bool, check: ClosureCheck) -> (bool, String) {
        let outer = Pty::open().unwrap();

        let ForkResult::Parent(child) = fork().unwrap() else {
            let result = (|| -> io::Result<bool> {
                setsid()?;
                outer.follower.make_controlling_terminal()?;
                let mut tty = UserTerm::from_file(File::from(OwnedFd::from(
                    outer.follower.try_clone()?,
                )));
                if foreground {
                    tty.set_raw_mode(false)?;
                }
                let tty_size = tty.get_size()?;

                let inner = Pty::open()?;
                let mut command_side = File::from(OwnedFd::from(inner.follower.try_clone()?));

                let suspensions = Rc::new(RefCell::new(Vec::new()));
                let mut plugins = Plugins::new([
                    Plugin::Policy(Box::new(AllowAll)),
                    Plugin::Io(Box::new(Suspensions(suspensions.clone()))),
                ])
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;

                let mut registry = EventRegistry::<ParentClosure>::new();
                let tty_pipe = Pipe::new(
                    tty,
                    inner.leader,
                    &mut registry,
                    ParentEvent::Tty,
                    ParentEvent::Pty,
                );
                let (relays, _) = StdioRelays::new([false; 3], &mut registry, ParentEvent::Stdio)?;
                let (backchannel, _monitor_backchannel) = backchannel_pair()?;

                let mut closure = ParentClosure::new(
                    getpid(),
                    getpid(),
                    getpgrp(),
                    backchannel,
                    tty_pipe,
                    relays,
                    tty_size,
                    foreground,
                    foreground,
                    &mut plugins,
                    &mut registry,
                )?;

                command_side.write_all(PENDING_OUTPUT)?;
                closure.tty_pipe.on_right_event(
                    PollEvent::Readable,
                    closure.plugins,
                    &mut registry,
                )?;

                Ok(check(&mut closure, &mut registry, &suspensions))
            })();
            _exit(if result.unwrap_or(false) { 0 } else { 1 })
        };

        let (_, status) = child.wait(WaitOptions::new()).unwrap();

        let mut leader = outer.leader;
        set_nonblocking(&leader, true).unwrap();
        let mut output = Vec::new();
        let mut buf = [0; 1024];
        while let Ok(len @ 1..) = leader.read(&mut buf) {
            output.extend_from_slice(&buf[..len]);
        }

        (
            status.exit_status() == Some(0),
            String::from_utf8_lossy(&output).into_owned(),
        )
    }

    #[test]
    fn raw_foreground_terminal_resumes_the_command_in_place() {
        let (ok, output) = with_parent(true, |closure, registry, suspensions| {
            closure.suspend_pty(SIGTTOU, registry) == Some(SIGCONT_FG)
                && closure.term_raw
                && suspensions.borrow().is_empty()
        });

        assert!(ok);
        assert!(!output.contains("written-before-the-stop"), "{output:?}");
    }

    #[test]
    fn pending_output_is_written_before_suspending() {
        let (ok, output) = with_parent(false, |closure, registry, suspensions| {
            // Nothing tracks a command here, so there is nothing to resume afterwards.
            closure.suspend_pty(SIGTSTP, registry).is_none()
                && *suspensions.borrow() == [SIGTSTP, SIGCONT]
        });

        assert!(ok);
        assert!(output.contains("written-before-the-stop"), "{output:?}");
    }

    #[test]
    fn output_reaches_the_user_terminal() {
        let (ok, output) = supervise(sh("echo through-the-pty; exit 3"), |status| {
            status.exit_reason() == Some(crate::exec::ExitReason::Code(3))
        });

        assert!(ok);
        assert!(output.contains("through-the-pty"), "{output:?}");
    }

    #[test]
    fn fatal_signals_are_reported_on_the_terminal() {
        let (ok, output) = supervise(sh("kill -TERM $$"), |status| {
            matches!(status, CommandStatus::WaitStatus(status) if status.term_signal() == Some(SIGTERM))
        });

        assert!(ok);
        assert!(output.contains("Terminated"), "{output:?}");
    }

    #[test]
    fn stopped_commands_are_continued() {
        // The supervisor leads an orphaned process group, so it shrugs off the stop it forwards
        // to itself and continues the command right away.
        let (ok, output) = supervise(sh("echo stopping; kill -TSTP $$; echo continued"), |status| {
            status.exit_reason() == Some(crate::exec::ExitReason::Code(0))
        });

        assert!(ok);
        assert!(output.contains("stopping"), "{output:?}");
        assert!(output.contains("continued"), "{output:?}");
    }

    #[test]
    fn terminal_stops_resume_in_the_foreground() {
        let (ok, output) = supervise(sh("kill -TTOU $$; echo back-in-front"), |status| {
            status.exit_reason() == Some(crate::exec::ExitReason::Code(0))
        });

        assert!(ok);
        assert!(output.contains("back-in-front"), "{output:?}");
    }

    #[test]
    fn missing_commands_are_an_errno() {
        let (ok, _) = supervise(CommandDetails::new("/no/such/command"), |status| {
            status == CommandStatus::Errno(libc::ENOENT)
        });

        assert!(ok);
    }
}
