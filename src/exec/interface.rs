use std::{
    ffi::{c_int, OsString},
    fmt, io,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    common::bin_serde::DeSerialize,
    system::{
        interface::{GroupId, ProcessId, UserId},
        signal::{signal_name, SignalNumber},
        wait::WaitStatus,
    },
};

/// The identity the command runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUser {
    pub uid: UserId,
    pub gid: GroupId,
    pub groups: Vec<GroupId>,
}

/// How sub-commands of an intercepted command are caught.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterceptType {
    /// A seccomp filter traps `execve` and the supervisor answers for the command.
    #[default]
    Trace,
    /// A preloaded library asks the supervisor itself through `SUDO_INTERCEPT_FD`.
    Dso,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecFlags {
    /// Run the command in a pseudo-terminal.
    pub use_pty: bool,
    /// Do not wait for the command, return to the caller right away.
    pub background: bool,
    /// Start the command in the background of the pty.
    pub exec_bg: bool,
    pub login_shell: bool,
    /// Check every sub-command against the policy.
    pub intercept: bool,
    /// Audit every sub-command without consulting the policy.
    pub log_subcmds: bool,
    /// Forbid the command from executing anything else.
    pub noexec: bool,
}

/// Everything needed to execute a command that the policy already accepted.
///
/// This is built once and only read afterwards.
#[derive(Debug, Clone)]
pub struct CommandDetails {
    pub command: PathBuf,
    pub argv: Vec<OsString>,
    pub envp: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    /// A failure to change to `cwd` is not fatal.
    pub cwd_optional: bool,
    pub chroot: Option<PathBuf>,
    pub umask: Option<libc::mode_t>,
    pub priority: Option<c_int>,
    pub user: Option<TargetUser>,
    pub timeout: Option<Duration>,
    /// Descriptors starting at this one are closed before the command is executed.
    pub closefrom: c_int,
    pub preserve_fds: Vec<c_int>,
    pub flags: ExecFlags,
    pub intercept_type: InterceptType,
    /// Library to preload in the command when using [`InterceptType::Dso`].
    pub intercept_preload: Option<PathBuf>,
}

impl CommandDetails {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        let command = command.into();
        let argv = vec![command.as_os_str().to_owned()];

        Self {
            command,
            argv,
            envp: Vec::new(),
            cwd: None,
            cwd_optional: false,
            chroot: None,
            umask: None,
            priority: None,
            user: None,
            timeout: None,
            closefrom: 3,
            preserve_fds: Vec::new(),
            flags: ExecFlags::default(),
            intercept_type: InterceptType::default(),
            intercept_preload: None,
        }
    }

    /// Replace the arguments after `argv[0]`.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.argv.truncate(1);
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env<I, S>(mut self, envp: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.envp = envp.into_iter().map(Into::into).collect();
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn user(mut self, user: TargetUser) -> Self {
        self.user = Some(user);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn flags(mut self, flags: ExecFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Whether sub-commands have to go through the intercept machinery.
    pub(crate) fn intercepts(&self) -> bool {
        self.flags.intercept || self.flags.log_subcmds || self.flags.noexec
    }

    /// The `argv[0]` the command is executed with. Login shells get a `-` in front of the
    /// command's base name.
    pub(crate) fn arg0(&self) -> OsString {
        if self.flags.login_shell {
            let name = self
                .command
                .file_name()
                .map(|name| name.as_bytes())
                .unwrap_or_default();
            let mut arg0 = Vec::with_capacity(name.len() + 1);
            arg0.push(b'-');
            arg0.extend_from_slice(name);
            std::ffi::OsStr::from_bytes(&arg0).to_owned()
        } else {
            self.argv
                .first()
                .cloned()
                .unwrap_or_else(|| self.command.as_os_str().to_owned())
        }
    }

    pub(crate) fn command_path(&self) -> &Path {
        &self.command
    }
}

/// The fate of the command as seen by one of the supervising processes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Nothing is known yet.
    Invalid,
    /// The command could not be executed.
    Errno(c_int),
    WaitStatus(WaitStatus),
    /// A signal that has to be relayed to the command.
    Signal(SignalNumber),
    /// The command was started with this process ID.
    Pid(ProcessId),
}

impl CommandStatus {
    const INVALID: u8 = 0;
    const ERRNO: u8 = 1;
    const WSTATUS: u8 = 2;
    const SIGNO: u8 = 3;
    const PID: u8 = 4;

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid)
    }

    /// Whether this status is the last one that will be produced for the command.
    pub(crate) fn is_final(&self) -> bool {
        match self {
            Self::Errno(_) => true,
            Self::WaitStatus(status) => status.did_exit() || status.was_signaled(),
            Self::Invalid | Self::Signal(_) | Self::Pid(_) => false,
        }
    }

    /// How the command ended, or `None` if it never ran.
    pub fn exit_reason(&self) -> Option<ExitReason> {
        let Self::WaitStatus(status) = self else {
            return None;
        };

        if let Some(code) = status.exit_status() {
            Some(ExitReason::Code(code))
        } else {
            status.term_signal().map(ExitReason::Signal)
        }
    }
}

impl fmt::Debug for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid => f.write_str("Invalid"),
            Self::Errno(errno) => {
                write!(f, "Errno({})", io::Error::from_raw_os_error(*errno))
            }
            Self::WaitStatus(status) => write!(f, "WaitStatus({status:?})"),
            Self::Signal(signal) => write!(f, "Signal({})", signal_name(*signal)),
            Self::Pid(pid) => write!(f, "Pid({pid})"),
        }
    }
}

impl DeSerialize for CommandStatus {
    type Bytes = [u8; 5];

    fn serialize(&self) -> Self::Bytes {
        let (tag, value) = match *self {
            Self::Invalid => (Self::INVALID, 0),
            Self::Errno(errno) => (Self::ERRNO, errno),
            Self::WaitStatus(status) => (Self::WSTATUS, status.as_raw()),
            Self::Signal(signal) => (Self::SIGNO, signal),
            Self::Pid(pid) => (Self::PID, pid.get()),
        };

        let mut bytes = [0; 5];
        bytes[0] = tag;
        bytes[1..].copy_from_slice(&value.to_ne_bytes());
        bytes
    }

    fn deserialize(bytes: Self::Bytes) -> io::Result<Self> {
        let mut value = [0; 4];
        value.copy_from_slice(&bytes[1..]);
        let value = c_int::from_ne_bytes(value);

        Ok(match bytes[0] {
            Self::INVALID => Self::Invalid,
            Self::ERRNO => Self::Errno(value),
            Self::WSTATUS => Self::WaitStatus(WaitStatus::from_raw(value)),
            Self::SIGNO => Self::Signal(value),
            Self::PID => Self::Pid(ProcessId::new(value)),
            tag => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown command status tag {tag}"),
                ))
            }
        })
    }
}

/// Exit reason for the command executed by sudo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Code(i32),
    Signal(i32),
}
