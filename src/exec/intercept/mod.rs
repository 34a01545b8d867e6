//! Catching the programs an intercepted command executes and checking them against the policy.
//!
//! There are two ways to catch them. With [`InterceptType::Trace`] a seccomp filter installed in
//! the command turns every exec into a notification the supervisor answers. With
//! [`InterceptType::Dso`] a preloaded library in the command asks the supervisor itself, first
//! over the socket passed in `SUDO_INTERCEPT_FD` and then over TCP connections to a listener on
//! the loopback interface, see [`InterceptClient`].
use std::{
    ffi::{OsStr, OsString},
    io,
    os::{
        fd::{AsRawFd, OwnedFd, RawFd},
        unix::{ffi::OsStrExt, net::UnixStream},
    },
    path::Path,
};

use crate::{
    log::dev_info,
    system::{
        dup_at_least, getpgrp,
        interface::ProcessId,
        signal::{consts::SIGTTOU, SignalSet},
        term::{Terminal, UserTerm},
        PreservedFdList,
    },
};

use self::{
    proto::{InterceptResponse, PolicyAcceptMessage, PolicyCheckRequest},
    server::{ConnectionId, DsoServer},
    trap::TrapServer,
};

use super::{
    event::{EventRegistry, Process},
    interface::{CommandDetails, InterceptType},
    plugin::{AuditSource, Plugins, PolicyDecision},
};

mod client;
pub(crate) mod proto;
mod server;
mod trap;

pub use client::{ApprovedExec, InterceptClient};

/// The environment variable that tells the preloaded library where to reach the supervisor.
pub(crate) const INTERCEPT_FD_ENV: &str = "SUDO_INTERCEPT_FD";
/// The descriptor handed to the command is at least this one, out of the way of the command's own.
pub(crate) const INTERCEPT_FD_MIN: RawFd = 64;

const INVALID_REQUEST: &str = "invalid PolicyCheckRequest";
const POLICY_REJECTED: &str = "command rejected by policy";
const POLICY_ERROR: &str = "policy plugin error";
const EXEC_DENIED: &str = "executing other commands is not permitted";

/// What happens to the programs the command executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum InterceptMode {
    /// Every program has to be accepted by the policy.
    Check,
    /// Every program runs and is audited.
    LogOnly,
    /// The command may not execute anything.
    Deny,
}

impl InterceptMode {
    fn for_command(details: &CommandDetails) -> Option<Self> {
        let flags = details.flags;
        if flags.noexec {
            Some(Self::Deny)
        } else if flags.intercept {
            Some(Self::Check)
        } else if flags.log_subcmds {
            Some(Self::LogOnly)
        } else {
            None
        }
    }
}

/// The events of the intercept server that the process hosting it has to forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum InterceptEvent {
    TrapSocket,
    TrapNotify,
    Listener,
    Connection(ConnectionId),
}

/// A process whose event loop runs an [`InterceptServer`].
pub(super) trait InterceptHost: Process {
    fn intercept_event(event: InterceptEvent) -> Self::Event;
}

/// The end of the intercept channel that goes to the command.
pub(super) enum ChildIntercept {
    Trap(UnixStream),
    Dso(OwnedFd),
}

impl ChildIntercept {
    /// Set up interception in the command process. This must happen while it is still
    /// privileged.
    pub(super) fn install(&self) -> io::Result<()> {
        match self {
            ChildIntercept::Trap(socket) => trap::install_filter(socket),
            ChildIntercept::Dso(_) => Ok(()),
        }
    }

    /// Keep the descriptor the command needs open across `closefrom`.
    pub(super) fn preserve(&self, fds: &mut PreservedFdList) {
        if let ChildIntercept::Dso(fd) = self {
            fds.preserve(fd);
        }
    }

    /// Tell the preloaded library where the supervisor is.
    pub(super) fn apply_env(&self, envp: &mut Vec<OsString>, preload: Option<&Path>) {
        let ChildIntercept::Dso(fd) = self else {
            return;
        };

        set_env(envp, INTERCEPT_FD_ENV, fd.as_raw_fd().to_string().as_ref());

        if let Some(preload) = preload {
            let preload = preload.as_os_str();
            let value = match get_env(envp, "LD_PRELOAD") {
                Some(old) if old.as_bytes().split(|&b| b == b':').any(|p| p == preload.as_bytes()) => {
                    return;
                }
                Some(old) if !old.is_empty() => {
                    let mut value = preload.to_owned();
                    value.push(":");
                    value.push(old);
                    value
                }
                _ => preload.to_owned(),
            };
            set_env(envp, "LD_PRELOAD", &value);
        }
    }
}

fn get_env<'a>(envp: &'a [OsString], name: &str) -> Option<&'a OsStr> {
    envp.iter().find_map(|var| {
        let rest = var.as_bytes().strip_prefix(name.as_bytes())?;
        rest.strip_prefix(b"=").map(OsStr::from_bytes)
    })
}

/// Set `name` to `value`, dropping any further definitions of it.
pub(super) fn set_env(envp: &mut Vec<OsString>, name: &str, value: &OsStr) {
    let defines = |var: &OsString| {
        var.as_bytes()
            .strip_prefix(name.as_bytes())
            .is_some_and(|rest| rest.starts_with(b"="))
    };

    let mut var = OsString::from(name);
    var.push("=");
    var.push(value);

    match envp.iter().position(defines) {
        Some(pos) => {
            envp[pos] = var;
            let mut index = 0;
            envp.retain(|var| {
                index += 1;
                index - 1 <= pos || !defines(var)
            });
        }
        None => envp.push(var),
    }
}

enum ServerKind {
    Dso(DsoServer),
    Trap(TrapServer),
}

/// The supervisor side of interception.
pub(super) struct InterceptServer {
    mode: InterceptMode,
    kind: ServerKind,
}

impl InterceptServer {
    /// Start polling the descriptors of this server in `registry`.
    pub(super) fn register<H: InterceptHost>(&mut self, registry: &mut EventRegistry<H>) {
        match &mut self.kind {
            ServerKind::Dso(server) => server.register(registry),
            ServerKind::Trap(server) => server.register(registry),
        }
    }

    /// Handle `event`. `command_running` tells whether the command itself has been executed
    /// already.
    pub(super) fn on_event<H: InterceptHost>(
        &mut self,
        event: InterceptEvent,
        command_running: bool,
        plugins: &mut Plugins,
        registry: &mut EventRegistry<H>,
    ) {
        match (&mut self.kind, event) {
            (ServerKind::Trap(server), InterceptEvent::TrapSocket) => server.on_socket(registry),
            (ServerKind::Trap(server), InterceptEvent::TrapNotify) => {
                server.on_notify(command_running, self.mode, plugins, registry)
            }
            (ServerKind::Dso(server), InterceptEvent::Listener) => server.on_listener(registry),
            (ServerKind::Dso(server), InterceptEvent::Connection(id)) => {
                server.on_connection(id, self.mode, plugins, registry)
            }
            (_, event) => dev_info!("ignoring unexpected intercept event {event:?}"),
        }
    }
}

/// Create both ends of interception for `details`, if the command is to be intercepted at all.
pub(super) fn prepare(
    details: &CommandDetails,
) -> io::Result<Option<(ChildIntercept, InterceptServer)>> {
    let Some(mode) = InterceptMode::for_command(details) else {
        return Ok(None);
    };

    let (child, kind) = match details.intercept_type {
        InterceptType::Trace => {
            let (rx, tx) = UnixStream::pair()?;
            (ChildIntercept::Trap(tx), ServerKind::Trap(TrapServer::new(rx)))
        }
        InterceptType::Dso => {
            let (ours, theirs) = UnixStream::pair()?;
            ours.set_nonblocking(true)?;
            let theirs = dup_at_least(&theirs, INTERCEPT_FD_MIN)?;
            (ChildIntercept::Dso(theirs), ServerKind::Dso(DsoServer::new(ours)))
        }
    };

    dev_info!("intercepting sub-commands: {mode:?} using {:?}", details.intercept_type);

    Ok(Some((child, InterceptServer { mode, kind })))
}

/// Decide on a program the command wants to execute.
fn check_request(
    mode: InterceptMode,
    plugins: &mut Plugins,
    request: &PolicyCheckRequest,
) -> InterceptResponse {
    if request.command.is_empty() || request.argv.is_empty() || request.envp.is_empty() {
        plugins.audit_error(AuditSource::Intercept, INVALID_REQUEST);
        return InterceptResponse::Error(INVALID_REQUEST.into());
    }

    let mut argv = request.argv.clone();
    argv[0] = request.command.clone();

    match mode {
        InterceptMode::Deny => {
            plugins.audit_reject(AuditSource::Intercept, EXEC_DENIED, &argv);
            InterceptResponse::Reject(EXEC_DENIED.into())
        }
        InterceptMode::LogOnly => {
            plugins.audit_accept(AuditSource::Intercept, &request.command, &argv);
            InterceptResponse::Accept(PolicyAcceptMessage {
                run_command: request.command.clone(),
                run_argv: argv,
                run_envp: request.envp.clone(),
            })
        }
        InterceptMode::Check => {
            let (source, decision) = {
                // The policy may want to talk to the user.
                let _foreground = Foreground::take();
                plugins.check_policy(&argv, &request.envp)
            };

            match decision {
                PolicyDecision::Accept {
                    command, run_argv, ..
                } => {
                    plugins.audit_accept(source, command.as_os_str(), &run_argv);
                    plugins.audit_accept(AuditSource::Intercept, command.as_os_str(), &run_argv);
                    InterceptResponse::Accept(PolicyAcceptMessage {
                        run_command: command.into_os_string(),
                        run_argv,
                        run_envp: request.envp.clone(),
                    })
                }
                PolicyDecision::Reject(message) => {
                    let message = non_empty_or(message, POLICY_REJECTED);
                    plugins.audit_reject(source, &message, &argv);
                    InterceptResponse::Reject(message)
                }
                PolicyDecision::Error(message) => {
                    let message = non_empty_or(message, POLICY_ERROR);
                    plugins.audit_error(source, &message);
                    InterceptResponse::Error(message)
                }
            }
        }
    }
}

fn non_empty_or(message: String, default: &str) -> String {
    if message.is_empty() {
        default.to_owned()
    } else {
        message
    }
}

/// The foreground of the controlling terminal, taken from the command for as long as this lives.
struct Foreground {
    tty: UserTerm,
    saved_pgrp: ProcessId,
}

impl Foreground {
    fn take() -> Option<Self> {
        let mut tty = UserTerm::open().ok()?;
        let saved_pgrp = tty.tcgetpgrp().ok()?;
        set_foreground(&tty, getpgrp()).ok()?;

        if tty.save().is_err() {
            let _ = set_foreground(&tty, saved_pgrp);
            return None;
        }

        Some(Self { tty, saved_pgrp })
    }
}

impl Drop for Foreground {
    fn drop(&mut self) {
        if let Err(err) = self.tty.restore(true) {
            dev_info!("cannot restore terminal settings: {err}");
        }
        if let Err(err) = set_foreground(&self.tty, self.saved_pgrp) {
            dev_info!("cannot give the terminal back to {}: {err}", self.saved_pgrp);
        }
    }
}

/// `tcsetpgrp` that also works from a background process group.
fn set_foreground(tty: &UserTerm, pgrp: ProcessId) -> io::Result<()> {
    let mut set = SignalSet::empty()?;
    set.add(SIGTTOU)?;
    let saved_mask = set.block()?;
    let result = tty.tcsetpgrp(pgrp);
    saved_mask.set_mask()?;
    result
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        ffi::{OsStr, OsString},
        rc::Rc,
    };

    use pretty_assertions::assert_eq;

    use crate::exec::{
        interface::{CommandDetails, ExecFlags},
        plugin::{
            tests::{AllowAll, DenyAll},
            ApprovalPlugin, AuditPlugin, AuditSource, Plugin, Plugins, PolicyDecision,
            PolicyPlugin,
        },
    };

    use super::{
        check_request,
        proto::{InterceptResponse, PolicyAcceptMessage, PolicyCheckRequest},
        set_env, ChildIntercept, InterceptMode,
    };

    fn os(values: &[&str]) -> Vec<OsString> {
        values.iter().map(OsString::from).collect()
    }

    fn request() -> PolicyCheckRequest {
        PolicyCheckRequest {
            command: "/usr/bin/id".into(),
            argv: os(&["id", "-u"]),
            envp: os(&["PATH=/usr/bin"]),
            cwd: "/tmp".into(),
            intercept_fd: -1,
        }
    }

    #[derive(Default)]
    struct Trail(Rc<RefCell<Vec<String>>>);

    impl AuditPlugin for Trail {
        fn accept(&mut self, source: AuditSource, command: &OsStr, _: &[OsString]) {
            let entry = format!("accept {source:?} {}", command.to_string_lossy());
            self.0.borrow_mut().push(entry);
        }
        fn reject(&mut self, source: AuditSource, message: &str, _: &[OsString]) {
            self.0.borrow_mut().push(format!("reject {source:?} {message}"));
        }
        fn error(&mut self, source: AuditSource, message: &str) {
            self.0.borrow_mut().push(format!("error {source:?} {message}"));
        }
    }

    fn with_policy(policy: impl PolicyPlugin + 'static) -> (Plugins, Rc<RefCell<Vec<String>>>) {
        let trail = Trail::default();
        let entries = trail.0.clone();
        let plugins = Plugins::new([
            Plugin::Policy(Box::new(policy)),
            Plugin::Audit(Box::new(trail)),
        ])
        .unwrap();
        (plugins, entries)
    }

    #[test]
    fn accepted_commands_run_with_the_requested_environment() {
        let (mut plugins, trail) = with_policy(AllowAll);

        assert_eq!(
            check_request(InterceptMode::Check, &mut plugins, &request()),
            InterceptResponse::Accept(PolicyAcceptMessage {
                run_command: "/usr/bin/id".into(),
                run_argv: os(&["/usr/bin/id", "-u"]),
                run_envp: os(&["PATH=/usr/bin"]),
            })
        );
        assert_eq!(
            *trail.borrow(),
            vec![
                "accept Plugin(\"policy\") /usr/bin/id".to_owned(),
                "accept Intercept /usr/bin/id".to_owned(),
            ]
        );
    }

    #[test]
    fn rejections_and_errors_get_a_message() {
        struct Silent(PolicyDecision);

        impl PolicyPlugin for Silent {
            fn check_policy(&mut self, _: &[OsString], _: &[OsString]) -> PolicyDecision {
                self.0.clone()
            }
        }

        let (mut plugins, _) = with_policy(DenyAll);
        assert_eq!(
            check_request(InterceptMode::Check, &mut plugins, &request()),
            InterceptResponse::Reject("not today".into())
        );

        let (mut plugins, _) = with_policy(Silent(PolicyDecision::Reject(String::new())));
        assert_eq!(
            check_request(InterceptMode::Check, &mut plugins, &request()),
            InterceptResponse::Reject("command rejected by policy".into())
        );

        let (mut plugins, trail) = with_policy(Silent(PolicyDecision::Error(String::new())));
        assert_eq!(
            check_request(InterceptMode::Check, &mut plugins, &request()),
            InterceptResponse::Error("policy plugin error".into())
        );
        assert_eq!(
            *trail.borrow(),
            vec!["error Plugin(\"policy\") policy plugin error".to_owned()]
        );
    }

    #[test]
    fn approval_rejections_are_audited_as_the_approver() {
        struct NoIds;

        impl ApprovalPlugin for NoIds {
            fn check(&mut self, _: &OsStr, _: &[OsString], _: &[OsString]) -> Result<(), String> {
                Err("ids are private".into())
            }
        }

        let trail = Trail::default();
        let entries = trail.0.clone();
        let mut plugins = Plugins::new([
            Plugin::Policy(Box::new(AllowAll)),
            Plugin::Approval(Box::new(NoIds)),
            Plugin::Audit(Box::new(trail)),
        ])
        .unwrap();

        assert_eq!(
            check_request(InterceptMode::Check, &mut plugins, &request()),
            InterceptResponse::Reject("ids are private".into())
        );
        assert_eq!(
            *entries.borrow(),
            vec!["reject Plugin(\"approval\") ids are private".to_owned()]
        );
    }

    #[test]
    fn incomplete_requests_are_errors() {
        let (mut plugins, _) = with_policy(AllowAll);

        for broken in [
            PolicyCheckRequest {
                command: OsString::new(),
                ..request()
            },
            PolicyCheckRequest {
                argv: vec![],
                ..request()
            },
            PolicyCheckRequest {
                envp: vec![],
                ..request()
            },
        ] {
            assert_eq!(
                check_request(InterceptMode::Check, &mut plugins, &broken),
                InterceptResponse::Error("invalid PolicyCheckRequest".into())
            );
        }
    }

    #[test]
    fn log_only_and_deny_skip_the_policy() {
        let (mut plugins, trail) = with_policy(DenyAll);
        assert!(matches!(
            check_request(InterceptMode::LogOnly, &mut plugins, &request()),
            InterceptResponse::Accept(_)
        ));

        let (mut allow, _) = with_policy(AllowAll);
        assert!(matches!(
            check_request(InterceptMode::Deny, &mut allow, &request()),
            InterceptResponse::Reject(_)
        ));
        assert_eq!(*trail.borrow(), vec!["accept Intercept /usr/bin/id".to_owned()]);
    }

    #[test]
    fn modes_follow_the_flags() {
        let details = |flags| CommandDetails::new("/bin/sh").flags(flags);

        assert_eq!(InterceptMode::for_command(&details(ExecFlags::default())), None);
        assert_eq!(
            InterceptMode::for_command(&details(ExecFlags {
                log_subcmds: true,
                intercept: true,
                ..Default::default()
            })),
            Some(InterceptMode::Check)
        );
        assert_eq!(
            InterceptMode::for_command(&details(ExecFlags {
                log_subcmds: true,
                ..Default::default()
            })),
            Some(InterceptMode::LogOnly)
        );
        assert_eq!(
            InterceptMode::for_command(&details(ExecFlags {
                noexec: true,
                intercept: true,
                ..Default::default()
            })),
            Some(InterceptMode::Deny)
        );
    }

    #[test]
    fn the_library_learns_where_to_connect() {
        let (_ours, theirs) = std::os::unix::net::UnixStream::pair().unwrap();
        let theirs = crate::system::dup_at_least(&theirs, super::INTERCEPT_FD_MIN).unwrap();
        let fd = std::os::fd::AsRawFd::as_raw_fd(&theirs);
        let child = ChildIntercept::Dso(theirs);

        let mut envp = os(&["SUDO_INTERCEPT_FD=3", "LD_PRELOAD=/lib/other.so", "HOME=/"]);
        child.apply_env(&mut envp, Some("/lib/intercept.so".as_ref()));
        assert_eq!(
            envp,
            os(&[
                &format!("SUDO_INTERCEPT_FD={fd}"),
                "LD_PRELOAD=/lib/intercept.so:/lib/other.so",
                "HOME=/",
            ])
        );

        // A second round changes nothing.
        let before = envp.clone();
        child.apply_env(&mut envp, Some("/lib/intercept.so".as_ref()));
        assert_eq!(envp, before);

        let mut envp = os(&["SUDO_INTERCEPT_FDX=1", "A=1", "A=2"]);
        set_env(&mut envp, "SUDO_INTERCEPT_FD", "9".as_ref());
        set_env(&mut envp, "A", "3".as_ref());
        assert_eq!(envp, os(&["SUDO_INTERCEPT_FDX=1", "A=3", "SUDO_INTERCEPT_FD=9"]));
    }
}
