use std::{
    ffi::c_int,
    fmt, io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd},
};

use crate::{
    common::bin_serde::{BinPipe, DeSerialize},
    exec::{interface::CommandStatus, signal_fmt},
    log::dev_warn,
};

/// The parent's end of the socket shared with the monitor. Statuses come in, requests go out.
pub(super) type ParentBackchannel = BinPipe<CommandStatus, MonitorMessage>;

pub(super) fn backchannel_pair() -> io::Result<(ParentBackchannel, MonitorBackchannel)> {
    let (parent, monitor) = BinPipe::pair()?;

    Ok((
        parent,
        MonitorBackchannel {
            pipe: monitor,
            done: false,
        },
    ))
}

/// Requests the parent makes to the monitor.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(super) enum MonitorMessage {
    /// Green light to execute the command.
    ExecCommand,
    Signal(c_int),
}

impl MonitorMessage {
    const EXEC_CMD: u8 = 0;
    const SIGNAL: u8 = 1;
}

impl DeSerialize for MonitorMessage {
    type Bytes = [u8; 5];

    fn serialize(&self) -> Self::Bytes {
        let (prefix, data) = match *self {
            Self::ExecCommand => (Self::EXEC_CMD, 0),
            Self::Signal(signal) => (Self::SIGNAL, signal),
        };

        let mut bytes = [0; 5];
        bytes[0] = prefix;
        bytes[1..].copy_from_slice(&data.to_ne_bytes());
        bytes
    }

    fn deserialize(bytes: Self::Bytes) -> io::Result<Self> {
        let mut data = [0; 4];
        data.copy_from_slice(&bytes[1..]);

        match bytes[0] {
            Self::EXEC_CMD => Ok(Self::ExecCommand),
            Self::SIGNAL => Ok(Self::Signal(c_int::from_ne_bytes(data))),
            prefix => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown monitor message {prefix}"),
            )),
        }
    }
}

impl fmt::Debug for MonitorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExecCommand => "ExecCommand".fmt(f),
            &Self::Signal(signal) => write!(f, "Signal({})", signal_fmt(signal)),
        }
    }
}

/// The monitor's end of the socket shared with the parent.
///
/// Once a final status went out nothing else is sent, so the parent never sees a second
/// conclusion for the same command.
pub(super) struct MonitorBackchannel {
    pipe: BinPipe<MonitorMessage, CommandStatus>,
    done: bool,
}

impl MonitorBackchannel {
    /// Send `status` to the parent. Calling this method will block until the socket is ready
    /// for writing.
    pub(super) fn send(&mut self, status: &CommandStatus) -> io::Result<()> {
        if self.done {
            dev_warn!("not sending {status:?}, the parent already has a final status");
            return Ok(());
        }

        self.pipe.write(status)?;
        self.done = status.is_final();
        Ok(())
    }

    /// Calling this method will block until there is a complete message to read.
    pub(super) fn recv(&mut self) -> io::Result<MonitorMessage> {
        self.pipe.read()
    }
}

impl AsRawFd for MonitorBackchannel {
    fn as_raw_fd(&self) -> RawFd {
        self.pipe.as_raw_fd()
    }
}

impl AsFd for MonitorBackchannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.pipe.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::{
        common::bin_serde::DeSerialize,
        exec::{interface::CommandStatus, use_pty::SIGCONT_FG},
        system::{interface::ProcessId, signal::consts::*, wait::WaitStatus},
    };

    use super::{backchannel_pair, MonitorMessage};

    #[test]
    fn requests_reach_the_monitor() {
        let (mut parent, mut monitor) = backchannel_pair().unwrap();

        parent.write(&MonitorMessage::ExecCommand).unwrap();
        parent.write(&MonitorMessage::Signal(SIGCONT_FG)).unwrap();

        assert_eq!(monitor.recv().unwrap(), MonitorMessage::ExecCommand);
        assert_eq!(monitor.recv().unwrap(), MonitorMessage::Signal(SIGCONT_FG));
        assert_eq!(
            format!("{:?}", MonitorMessage::Signal(SIGCONT_FG)),
            "Signal(SIGCONT_FG)"
        );
    }

    #[test]
    fn nothing_follows_a_final_status() {
        let (mut parent, mut monitor) = backchannel_pair().unwrap();

        let stopped = CommandStatus::WaitStatus(WaitStatus::from_raw((SIGTSTP << 8) | 0x7f));
        monitor.send(&CommandStatus::Pid(ProcessId::new(77))).unwrap();
        monitor.send(&stopped).unwrap();
        monitor.send(&CommandStatus::Errno(libc::ENOENT)).unwrap();
        monitor
            .send(&CommandStatus::WaitStatus(WaitStatus::from_exit_code(1)))
            .unwrap();
        drop(monitor);

        assert_eq!(parent.read().unwrap(), CommandStatus::Pid(ProcessId::new(77)));
        assert_eq!(parent.read().unwrap(), stopped);
        assert_eq!(parent.read().unwrap(), CommandStatus::Errno(libc::ENOENT));
        assert_eq!(
            parent.read().unwrap_err().kind(),
            std::io::ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn unknown_requests_are_rejected() {
        let mut bytes = MonitorMessage::Signal(SIGINT).serialize();
        assert_eq!(MonitorMessage::deserialize(bytes).unwrap(), MonitorMessage::Signal(SIGINT));

        bytes[0] = 7;
        assert_eq!(
            MonitorMessage::deserialize(bytes).unwrap_err().kind(),
            std::io::ErrorKind::InvalidData
        );
    }
}
