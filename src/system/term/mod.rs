mod user_term;

use std::{
    ffi::{c_uchar, CString},
    fmt,
    fs::File,
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
    ptr::null_mut,
};

use crate::cutils::cerr;

use super::interface::{GroupId, ProcessId, UserId};

pub(crate) use user_term::UserTerm;

pub(crate) struct Pty {
    /// The file path of the follower side of the pty.
    pub(crate) path: CString,
    /// The leader side of the pty.
    pub(crate) leader: PtyLeader,
    /// The follower side of the pty.
    pub(crate) follower: PtyFollower,
}

impl Pty {
    pub(crate) fn open() -> io::Result<Self> {
        const PATH_MAX: usize = libc::PATH_MAX as _;
        // Allocate a buffer to hold the path to the pty.
        let mut path = vec![0 as c_uchar; PATH_MAX];
        // Create two integers to hold the file descriptors for each side of the pty.
        let (mut leader, mut follower) = (0, 0);

        cerr(unsafe {
            libc::openpty(
                &mut leader,
                &mut follower,
                path.as_mut_ptr().cast(),
                null_mut::<libc::termios>(),
                null_mut::<libc::winsize>(),
            )
        })?;

        // SAFETY: openpty succeeded so both descriptors are open and ours.
        let (leader, follower) = unsafe {
            (
                File::from(OwnedFd::from_raw_fd(leader)),
                File::from(OwnedFd::from_raw_fd(follower)),
            )
        };

        // Truncate `path` at its first null byte, if any.
        if let Some(index) = path.iter().position(|&byte| byte == 0) {
            path.truncate(index);
        }

        let path = CString::new(path).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "pty path is not NUL-terminated")
        })?;

        Ok(Self {
            path,
            leader: PtyLeader { file: leader },
            follower: PtyFollower { file: follower },
        })
    }

    /// Hand the follower side to `owner` and the `tty` group, readable and writable by the owner
    /// and writable by the group.
    pub(crate) fn set_owner(&self, owner: UserId, group: Option<GroupId>) -> io::Result<()> {
        // (gid_t)-1 leaves the group alone.
        let group = group.unwrap_or(GroupId::new(libc::gid_t::MAX));
        super::chown(&self.path, owner, group)?;
        cerr(unsafe {
            libc::chmod(
                self.path.as_ptr(),
                libc::S_IRUSR | libc::S_IWUSR | libc::S_IWGRP,
            )
        })
        .map(|_| ())
    }
}

pub(crate) struct PtyLeader {
    file: File,
}

impl io::Read for PtyLeader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn read_vectored(&mut self, bufs: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
        self.file.read_vectored(bufs)
    }
}

impl io::Write for PtyLeader {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        self.file.write_vectored(bufs)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl AsRawFd for PtyLeader {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

pub(crate) struct PtyFollower {
    file: File,
}

impl PtyFollower {
    pub(crate) fn try_clone(&self) -> io::Result<Self> {
        self.file.try_clone().map(|file| Self { file })
    }
}

impl AsRawFd for PtyFollower {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl AsFd for PtyFollower {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl From<PtyFollower> for OwnedFd {
    fn from(follower: PtyFollower) -> Self {
        follower.file.into()
    }
}

/// The dimensions of a terminal.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub(crate) struct TermSize {
    raw: libc::winsize,
}

impl TermSize {
    pub(crate) fn new(rows: u16, cols: u16) -> Self {
        Self {
            raw: libc::winsize {
                ws_row: rows,
                ws_col: cols,
                ws_xpixel: 0,
                ws_ypixel: 0,
            },
        }
    }

    pub(crate) fn rows(&self) -> u16 {
        self.raw.ws_row
    }

    pub(crate) fn cols(&self) -> u16 {
        self.raw.ws_col
    }
}

impl PartialEq for TermSize {
    fn eq(&self, other: &Self) -> bool {
        self.raw.ws_row == other.raw.ws_row && self.raw.ws_col == other.raw.ws_col
    }
}

impl fmt::Display for TermSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x {}", self.raw.ws_row, self.raw.ws_col)
    }
}

impl fmt::Debug for TermSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TermSize({self})")
    }
}

mod sealed {
    use std::os::fd::AsRawFd;

    pub(crate) trait Sealed {}

    impl<F: AsRawFd> Sealed for F {}
}

pub(crate) trait Terminal: sealed::Sealed {
    fn tcgetpgrp(&self) -> io::Result<ProcessId>;
    fn tcsetpgrp(&self, pgrp: ProcessId) -> io::Result<()>;
    fn tcgetsid(&self) -> io::Result<ProcessId>;
    fn make_controlling_terminal(&self) -> io::Result<()>;
    fn get_size(&self) -> io::Result<TermSize>;
    fn set_size(&self, size: &TermSize) -> io::Result<()>;
}

impl<F: AsRawFd> Terminal for F {
    /// Get the foreground process group ID associated with this terminal.
    fn tcgetpgrp(&self) -> io::Result<ProcessId> {
        cerr(unsafe { libc::tcgetpgrp(self.as_raw_fd()) }).map(ProcessId::new)
    }

    /// Set the foreground process group ID associated with this terminal to `pgrp`.
    fn tcsetpgrp(&self, pgrp: ProcessId) -> io::Result<()> {
        cerr(unsafe { libc::tcsetpgrp(self.as_raw_fd(), pgrp.get()) }).map(|_| ())
    }

    /// Get the session ID of the session this terminal controls.
    fn tcgetsid(&self) -> io::Result<ProcessId> {
        cerr(unsafe { libc::tcgetsid(self.as_raw_fd()) }).map(ProcessId::new)
    }

    /// Make the given terminal the controlling terminal of the calling process.
    fn make_controlling_terminal(&self) -> io::Result<()> {
        cerr(unsafe { libc::ioctl(self.as_raw_fd(), libc::TIOCSCTTY, 0) })?;
        Ok(())
    }

    fn get_size(&self) -> io::Result<TermSize> {
        let mut size = TermSize::new(0, 0);
        cerr(unsafe { libc::ioctl(self.as_raw_fd(), libc::TIOCGWINSZ, &mut size.raw) })?;
        Ok(size)
    }

    fn set_size(&self, size: &TermSize) -> io::Result<()> {
        cerr(unsafe { libc::ioctl(self.as_raw_fd(), libc::TIOCSWINSZ, &size.raw) }).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        ffi::OsString,
        io::{IsTerminal, Read, Write},
        os::unix::{net::UnixStream, prelude::OsStringExt},
        path::PathBuf,
    };

    use crate::system::{_exit, fork, getpgid, interface::ProcessId, setsid, term::*, ForkResult};

    #[test]
    fn open_pty() {
        let pty = Pty::open().unwrap();
        assert!(pty.leader.file.is_terminal());
        assert!(pty.follower.file.is_terminal());

        let path = PathBuf::from(OsString::from_vec(pty.path.into_bytes()));
        assert!(path.try_exists().unwrap());
        assert!(path.starts_with("/dev/pts/"));
    }

    #[test]
    fn window_size_is_shared_by_both_sides() {
        let pty = Pty::open().unwrap();
        let size = TermSize::new(42, 132);
        pty.leader.set_size(&size).unwrap();
        assert_eq!(pty.follower.get_size().unwrap(), size);
        assert_eq!(size.to_string(), "42 x 132");
    }

    #[test]
    fn tcsetpgrp_and_tcgetpgrp_are_consistent() {
        // Create a socket so the child can send us a byte if successful.
        let (mut rx, mut tx) = UnixStream::pair().unwrap();

        let ForkResult::Parent(_) = fork().unwrap() else {
            // Open a new pseudoterminal.
            let leader = Pty::open().unwrap().leader;
            // The pty leader should not have a foreground process group yet.
            assert_eq!(leader.tcgetpgrp().unwrap(), ProcessId::new(0));
            // Create a new session so we can change the controlling terminal.
            let sid = setsid().unwrap();
            // Set the pty leader as the controlling terminal.
            leader.make_controlling_terminal().unwrap();
            assert_eq!(leader.tcgetsid().unwrap(), sid);
            // Set us as the foreground process group of the pty leader.
            let pgid = getpgid(ProcessId::new(0)).unwrap();
            leader.tcsetpgrp(pgid).unwrap();
            // Check that we are in fact the foreground process group of the pty leader.
            assert_eq!(pgid, leader.tcgetpgrp().unwrap());
            // If we haven't panicked yet, send a byte to the parent.
            tx.write_all(&[42]).unwrap();

            _exit(0);
        };

        drop(tx);

        // Read one byte from the children to comfirm that it did not panic.
        let mut buf = [0];
        rx.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], 42);
    }
}
