//! The contract between the supervisor and the plugins that decide on and record a command.
use std::{
    ffi::{OsStr, OsString},
    path::PathBuf,
};

use crate::{
    common::Error,
    log::{audit_info, audit_warn, dev_info},
    system::signal::SignalNumber,
};

use super::interface::{CommandDetails, CommandStatus};

/// The outcome of a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Accept {
        command: PathBuf,
        run_argv: Vec<OsString>,
        run_envp: Vec<OsString>,
    },
    Reject(String),
    Error(String),
}

pub trait PolicyPlugin {
    /// Set up the session of the target user. Runs in the process that executes the command.
    fn init_session(&mut self, _details: &CommandDetails) -> Result<(), String> {
        Ok(())
    }

    /// Decide whether `argv` may run with `envp`, `argv[0]` being the command.
    fn check_policy(&mut self, argv: &[OsString], envp: &[OsString]) -> PolicyDecision;

    /// Whether [`PolicyPlugin::close`] has to be called when the command is done.
    fn wants_close(&self) -> bool {
        false
    }

    fn close(&mut self, _status: &CommandStatus) {}
}

/// What an I/O plugin wants done with the bytes it was shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAction {
    /// Pass the data along.
    Keep,
    /// Drop the data and stop writing to its destination.
    Suppress,
    /// The plugin failed, stop calling it for this stream.
    Disable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStream {
    TtyIn,
    TtyOut,
    StdIn,
    StdOut,
    StdErr,
}

/// The callbacks an I/O plugin implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoCapabilities {
    pub tty_in: bool,
    pub tty_out: bool,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub change_winsize: bool,
    pub suspend: bool,
    pub close: bool,
}

impl IoCapabilities {
    fn logs(&self, stream: IoStream) -> bool {
        match stream {
            IoStream::TtyIn => self.tty_in,
            IoStream::TtyOut => self.tty_out,
            IoStream::StdIn => self.stdin,
            IoStream::StdOut => self.stdout,
            IoStream::StdErr => self.stderr,
        }
    }

    fn stop_logging(&mut self, stream: IoStream) {
        match stream {
            IoStream::TtyIn => self.tty_in = false,
            IoStream::TtyOut => self.tty_out = false,
            IoStream::StdIn => self.stdin = false,
            IoStream::StdOut => self.stdout = false,
            IoStream::StdErr => self.stderr = false,
        }
    }

    fn union(self, other: Self) -> Self {
        Self {
            tty_in: self.tty_in || other.tty_in,
            tty_out: self.tty_out || other.tty_out,
            stdin: self.stdin || other.stdin,
            stdout: self.stdout || other.stdout,
            stderr: self.stderr || other.stderr,
            change_winsize: self.change_winsize || other.change_winsize,
            suspend: self.suspend || other.suspend,
            close: self.close || other.close,
        }
    }
}

pub trait IoPlugin {
    fn capabilities(&self) -> IoCapabilities;

    fn log(&mut self, _stream: IoStream, _data: &[u8]) -> LogAction {
        LogAction::Keep
    }

    fn change_winsize(&mut self, _rows: u16, _cols: u16) {}

    /// Called with the stop signal when the command is suspended and with `SIGCONT` when it is
    /// resumed.
    fn suspend(&mut self, _signal: SignalNumber) {}

    fn close(&mut self, _status: &CommandStatus) {}
}

/// Which part of the supervisor produced an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditSource {
    Sudo,
    Intercept,
    Plugin(&'static str),
}

pub(crate) const POLICY: AuditSource = AuditSource::Plugin("policy");
pub(crate) const APPROVAL: AuditSource = AuditSource::Plugin("approval");

pub trait AuditPlugin {
    fn accept(&mut self, source: AuditSource, command: &OsStr, argv: &[OsString]);
    fn reject(&mut self, source: AuditSource, message: &str, argv: &[OsString]);
    fn error(&mut self, source: AuditSource, message: &str);
}

pub trait ApprovalPlugin {
    /// A second opinion on a command the policy accepted. `Err` carries the reason to refuse it.
    fn check(
        &mut self,
        command: &OsStr,
        argv: &[OsString],
        envp: &[OsString],
    ) -> Result<(), String>;
}

/// A loaded plugin of any kind.
pub enum Plugin {
    Policy(Box<dyn PolicyPlugin>),
    Io(Box<dyn IoPlugin>),
    Audit(Box<dyn AuditPlugin>),
    Approval(Box<dyn ApprovalPlugin>),
}

struct IoHook {
    plugin: Box<dyn IoPlugin>,
    caps: IoCapabilities,
}

/// The plugins taking part in one command execution.
pub struct Plugins {
    policy: Box<dyn PolicyPlugin>,
    io: Vec<IoHook>,
    audit: Vec<Box<dyn AuditPlugin>>,
    approval: Vec<Box<dyn ApprovalPlugin>>,
}

impl Plugins {
    /// Sort the plugins by kind. Exactly one policy plugin is required.
    pub fn new(plugins: impl IntoIterator<Item = Plugin>) -> Result<Self, Error> {
        let mut policy = None;
        let mut io = Vec::new();
        let mut audit = Vec::new();
        let mut approval = Vec::new();

        for plugin in plugins {
            match plugin {
                Plugin::Policy(plugin) => {
                    if policy.replace(plugin).is_some() {
                        return Err(Error::Plugin {
                            plugin: "policy",
                            message: "only a single policy plugin may be specified".into(),
                        });
                    }
                }
                Plugin::Io(plugin) => io.push(IoHook {
                    caps: plugin.capabilities(),
                    plugin,
                }),
                Plugin::Audit(plugin) => audit.push(plugin),
                Plugin::Approval(plugin) => approval.push(plugin),
            }
        }

        let policy = policy.ok_or_else(|| Error::Plugin {
            plugin: "policy",
            message: "no policy plugin found".into(),
        })?;

        Ok(Self {
            policy,
            io,
            audit,
            approval,
        })
    }

    pub(crate) fn init_session(&mut self, details: &CommandDetails) -> Result<(), Error> {
        self.policy
            .init_session(details)
            .map_err(|message| Error::Plugin {
                plugin: "policy",
                message,
            })
    }

    /// The callbacks offered by all the I/O plugins together.
    pub(crate) fn io_capabilities(&self) -> IoCapabilities {
        self.io
            .iter()
            .fold(IoCapabilities::default(), |acc, hook| acc.union(hook.caps))
    }

    /// Whether someone has to be told about the end of the command.
    pub(crate) fn wants_close(&self) -> bool {
        self.policy.wants_close() || self.io.iter().any(|hook| hook.caps.close)
    }

    /// Run the policy check for a sub-command and the approval plugins if it is accepted.
    /// Returns the decision together with the plugin that made it.
    pub(crate) fn check_policy(
        &mut self,
        argv: &[OsString],
        envp: &[OsString],
    ) -> (AuditSource, PolicyDecision) {
        let decision = self.policy.check_policy(argv, envp);

        let PolicyDecision::Accept {
            command,
            run_argv,
            run_envp,
        } = &decision
        else {
            return (POLICY, decision);
        };

        for approval in &mut self.approval {
            if let Err(message) = approval.check(command.as_os_str(), run_argv, run_envp) {
                return (APPROVAL, PolicyDecision::Reject(message));
            }
        }

        (POLICY, decision)
    }

    /// Show `data` read from `stream` to every I/O plugin that logs it.
    pub(crate) fn log_io(&mut self, stream: IoStream, data: &[u8]) -> LogAction {
        let mut action = LogAction::Keep;

        for hook in self.io.iter_mut().filter(|hook| hook.caps.logs(stream)) {
            match hook.plugin.log(stream, data) {
                LogAction::Keep => {}
                LogAction::Suppress => {
                    action = LogAction::Suppress;
                    break;
                }
                LogAction::Disable => {
                    dev_info!("I/O plugin failed to log {stream:?}, disabling it");
                    hook.caps.stop_logging(stream);
                    for audit in &mut self.audit {
                        audit.error(AuditSource::Plugin("io"), "unable to log I/O");
                    }
                    action = LogAction::Disable;
                }
            }
        }

        action
    }

    pub(crate) fn change_winsize(&mut self, rows: u16, cols: u16) {
        for hook in self.io.iter_mut().filter(|hook| hook.caps.change_winsize) {
            hook.plugin.change_winsize(rows, cols);
        }
    }

    pub(crate) fn suspend(&mut self, signal: SignalNumber) {
        for hook in self.io.iter_mut().filter(|hook| hook.caps.suspend) {
            hook.plugin.suspend(signal);
        }
    }

    pub(crate) fn audit_accept(&mut self, source: AuditSource, command: &OsStr, argv: &[OsString]) {
        audit_info!("{source:?}: accepted {}", command.to_string_lossy());
        for audit in &mut self.audit {
            audit.accept(source, command, argv);
        }
    }

    pub(crate) fn audit_reject(&mut self, source: AuditSource, message: &str, argv: &[OsString]) {
        audit_warn!("{source:?}: rejected: {message}");
        for audit in &mut self.audit {
            audit.reject(source, message, argv);
        }
    }

    pub(crate) fn audit_error(&mut self, source: AuditSource, message: &str) {
        audit_warn!("{source:?}: {message}");
        for audit in &mut self.audit {
            audit.error(source, message);
        }
    }

    /// Tell the policy and I/O plugins how the command ended.
    pub(crate) fn close(&mut self, status: &CommandStatus) {
        if self.policy.wants_close() {
            self.policy.close(status);
        }
        for hook in self.io.iter_mut().filter(|hook| hook.caps.close) {
            hook.plugin.close(status);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        cell::RefCell,
        ffi::{OsStr, OsString},
        rc::Rc,
    };

    use pretty_assertions::assert_eq;

    use super::{
        ApprovalPlugin, AuditPlugin, AuditSource, IoCapabilities, IoPlugin, IoStream, LogAction,
        Plugin, Plugins, PolicyDecision, PolicyPlugin,
    };

    /// Accepts everything as is.
    pub(crate) struct AllowAll;

    impl PolicyPlugin for AllowAll {
        fn check_policy(&mut self, argv: &[OsString], envp: &[OsString]) -> PolicyDecision {
            PolicyDecision::Accept {
                command: argv[0].clone().into(),
                run_argv: argv.to_vec(),
                run_envp: envp.to_vec(),
            }
        }
    }

    /// Rejects everything.
    pub(crate) struct DenyAll;

    impl PolicyPlugin for DenyAll {
        fn check_policy(&mut self, _: &[OsString], _: &[OsString]) -> PolicyDecision {
            PolicyDecision::Reject("not today".into())
        }
    }

    #[derive(Default)]
    struct Recorder {
        actions: Vec<LogAction>,
        seen: Rc<RefCell<Vec<(IoStream, Vec<u8>)>>>,
    }

    impl IoPlugin for Recorder {
        fn capabilities(&self) -> IoCapabilities {
            IoCapabilities {
                stdout: true,
                tty_out: true,
                ..Default::default()
            }
        }

        fn log(&mut self, stream: IoStream, data: &[u8]) -> LogAction {
            self.seen.borrow_mut().push((stream, data.to_vec()));
            self.actions.pop().unwrap_or(LogAction::Keep)
        }
    }

    #[derive(Default)]
    struct Errors(Rc<RefCell<Vec<String>>>);

    impl AuditPlugin for Errors {
        fn accept(&mut self, _: AuditSource, _: &OsStr, _: &[OsString]) {}
        fn reject(&mut self, _: AuditSource, _: &str, _: &[OsString]) {}
        fn error(&mut self, _: AuditSource, message: &str) {
            self.0.borrow_mut().push(message.to_owned());
        }
    }

    struct NoShells;

    impl ApprovalPlugin for NoShells {
        fn check(&mut self, command: &OsStr, _: &[OsString], _: &[OsString]) -> Result<(), String> {
            if command == "/bin/sh" {
                Err("no shells".into())
            } else {
                Ok(())
            }
        }
    }

    fn os(values: &[&str]) -> Vec<OsString> {
        values.iter().map(OsString::from).collect()
    }

    #[test]
    fn exactly_one_policy_plugin() {
        assert!(Plugins::new([]).is_err());
        assert!(Plugins::new([
            Plugin::Policy(Box::new(AllowAll)),
            Plugin::Policy(Box::new(DenyAll)),
        ])
        .is_err());
        assert!(Plugins::new([Plugin::Policy(Box::new(AllowAll))]).is_ok());
    }

    #[test]
    fn approval_can_overrule_the_policy() {
        let mut plugins = Plugins::new([
            Plugin::Policy(Box::new(AllowAll)),
            Plugin::Approval(Box::new(NoShells)),
        ])
        .unwrap();

        assert_eq!(
            plugins.check_policy(&os(&["/bin/sh"]), &[]),
            (
                AuditSource::Plugin("approval"),
                PolicyDecision::Reject("no shells".into())
            )
        );
        assert!(matches!(
            plugins.check_policy(&os(&["/bin/ls", "-l"]), &[]),
            (AuditSource::Plugin("policy"), PolicyDecision::Accept { .. })
        ));
    }

    #[test]
    fn disabled_streams_are_not_logged_again() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let errors = Rc::new(RefCell::new(Vec::new()));
        let recorder = Recorder {
            actions: vec![LogAction::Disable],
            seen: seen.clone(),
        };
        let mut plugins = Plugins::new([
            Plugin::Policy(Box::new(AllowAll)),
            Plugin::Io(Box::new(recorder)),
            Plugin::Audit(Box::new(Errors(errors.clone()))),
        ])
        .unwrap();

        assert!(plugins.io_capabilities().stdout);
        assert_eq!(plugins.log_io(IoStream::StdIn, b"ignored"), LogAction::Keep);
        assert_eq!(plugins.log_io(IoStream::StdOut, b"one"), LogAction::Disable);
        assert_eq!(plugins.log_io(IoStream::StdOut, b"two"), LogAction::Keep);
        assert_eq!(plugins.log_io(IoStream::TtyOut, b"three"), LogAction::Keep);

        assert_eq!(
            *seen.borrow(),
            vec![
                (IoStream::StdOut, b"one".to_vec()),
                (IoStream::TtyOut, b"three".to_vec()),
            ]
        );
        assert_eq!(errors.borrow().len(), 1);
        assert!(!plugins.io_capabilities().stdout);
    }
}
