//! Save, change and restore the settings of the terminal the user invoked us from.

use std::{
    ffi::c_int,
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    mem::MaybeUninit,
    os::fd::{AsRawFd, RawFd},
    sync::atomic::{AtomicBool, Ordering},
};

use libc::{
    c_void, cfgetispeed, cfgetospeed, cfmakeraw, cfsetispeed, cfsetospeed, sigaction,
    sigemptyset, sighandler_t, siginfo_t, sigset_t, tcflag_t, tcgetattr, tcsetattr, termios, CS7,
    CS8, ECHO, ECHOCTL, ECHOE, ECHOK, ECHOKE, ECHONL, ICANON, ICRNL, IEXTEN, IGNCR,
    IGNPAR, IMAXBEL, INLCR, INPCK, ISIG, ISTRIP, IUTF8, IXANY, IXOFF, IXON, NOFLSH, OCRNL, OLCUC,
    ONLCR, ONLRET, ONOCR, OPOST, PARENB, PARMRK, PARODD, PENDIN, SIGTTOU, TCSADRAIN, TCSAFLUSH,
    TOSTOP,
};

use super::Terminal;
use crate::{
    cutils::cerr,
    system::{interface::ProcessId, make_zeroed_sigaction},
};

const INPUT_FLAGS: tcflag_t = IGNPAR
    | PARMRK
    | INPCK
    | ISTRIP
    | INLCR
    | IGNCR
    | ICRNL
    // | IUCLC /* FIXME: not in libc */
    | IXON
    | IXANY
    | IXOFF
    | IMAXBEL
    | IUTF8;
const OUTPUT_FLAGS: tcflag_t = OPOST | OLCUC | ONLCR | OCRNL | ONOCR | ONLRET;
const CONTROL_FLAGS: tcflag_t = CS7 | CS8 | PARENB | PARODD;
const LOCAL_FLAGS: tcflag_t = ISIG
    | ICANON
    // | XCASE /* FIXME: not in libc */
    | ECHO
    | ECHOE
    | ECHOK
    | ECHONL
    | NOFLSH
    | TOSTOP
    | IEXTEN
    | ECHOCTL
    | ECHOKE
    | PENDIN;

static GOT_SIGTTOU: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigttou(_signal: c_int, _info: *mut siginfo_t, _: *mut c_void) {
    GOT_SIGTTOU.store(true, Ordering::SeqCst);
}

/// Run a terminal operation that only succeeds if we are in the foreground process group.
///
/// A background process attempting it receives `SIGTTOU`. That signal is trapped for the
/// duration of the call so it turns into an error instead of stopping us.
fn foreground_only<F: FnMut() -> io::Result<()>>(mut op: F) -> io::Result<()> {
    let mut original_action = MaybeUninit::<sigaction>::uninit();

    let action = {
        let mut raw: libc::sigaction = make_zeroed_sigaction();
        raw.sa_sigaction = on_sigttou as sighandler_t;
        raw.sa_mask = {
            let mut sa_mask = MaybeUninit::<sigset_t>::uninit();
            unsafe { sigemptyset(sa_mask.as_mut_ptr()) };
            unsafe { sa_mask.assume_init() }
        };
        raw.sa_flags = 0;
        raw.sa_restorer = None;
        raw
    };

    GOT_SIGTTOU.store(false, Ordering::SeqCst);
    unsafe { sigaction(SIGTTOU, &action, original_action.as_mut_ptr()) };
    // Retry interruptions unless they were caused by `SIGTTOU`.
    let result = loop {
        match op() {
            Ok(()) => break Ok(()),
            Err(err) => {
                let got_sigttou = GOT_SIGTTOU.load(Ordering::SeqCst);
                if got_sigttou || err.kind() != io::ErrorKind::Interrupted {
                    break Err(err);
                }
            }
        }
    };
    unsafe { sigaction(SIGTTOU, original_action.as_ptr(), std::ptr::null_mut()) };

    result
}

fn tcsetattr_nobg(fd: c_int, flags: c_int, tp: &termios) -> io::Result<()> {
    foreground_only(|| cerr(unsafe { tcsetattr(fd, flags, tp) }).map(|_| ()))
}

/// Type to manipulate the settings of the user's terminal.
pub(crate) struct UserTerm {
    tty: File,
    original_termios: Option<termios>,
    changed: bool,
}

impl UserTerm {
    /// Open the user's terminal.
    pub(crate) fn open() -> io::Result<Self> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/tty")
            .map(Self::from_file)
    }

    pub(crate) fn from_file(tty: File) -> Self {
        Self {
            tty,
            original_termios: None,
            changed: false,
        }
    }

    fn original_termios(&mut self) -> io::Result<termios> {
        if let Some(term) = self.original_termios {
            return Ok(term);
        }
        let mut term = MaybeUninit::<termios>::uninit();
        cerr(unsafe { tcgetattr(self.tty.as_raw_fd(), term.as_mut_ptr()) })?;
        // SAFETY: tcgetattr succeeded.
        let term = unsafe { term.assume_init() };
        self.original_termios = Some(term);
        Ok(term)
    }

    /// Make the current settings the ones [`UserTerm::restore`] goes back to.
    pub(crate) fn save(&mut self) -> io::Result<()> {
        self.original_termios = None;
        self.original_termios()?;
        self.changed = true;
        Ok(())
    }

    /// Whether the terminal currently runs with settings other than the saved ones.
    pub(crate) fn is_changed(&self) -> bool {
        self.changed
    }

    /// Copy the settings of the user's terminal to the `dst` terminal.
    pub(crate) fn copy_to<D: AsRawFd>(&self, dst: &D) -> io::Result<()> {
        let src = self.tty.as_raw_fd();
        let dst = dst.as_raw_fd();

        let mut tt_src = MaybeUninit::<termios>::uninit();
        let mut tt_dst = MaybeUninit::<termios>::uninit();

        cerr(unsafe { tcgetattr(src, tt_src.as_mut_ptr()) })?;
        cerr(unsafe { tcgetattr(dst, tt_dst.as_mut_ptr()) })?;

        let tt_src = unsafe { tt_src.assume_init() };
        let mut tt_dst = unsafe { tt_dst.assume_init() };

        // Clear select input, output, control and local flags.
        tt_dst.c_iflag &= !INPUT_FLAGS;
        tt_dst.c_oflag &= !OUTPUT_FLAGS;
        tt_dst.c_cflag &= !CONTROL_FLAGS;
        tt_dst.c_lflag &= !LOCAL_FLAGS;

        // Copy select input, output, control and local flags.
        tt_dst.c_iflag |= tt_src.c_iflag & INPUT_FLAGS;
        tt_dst.c_oflag |= tt_src.c_oflag & OUTPUT_FLAGS;
        tt_dst.c_cflag |= tt_src.c_cflag & CONTROL_FLAGS;
        tt_dst.c_lflag |= tt_src.c_lflag & LOCAL_FLAGS;

        // Copy special chars from src verbatim.
        tt_dst.c_cc.copy_from_slice(&tt_src.c_cc);

        // Copy speed from `src`.
        {
            let mut speed = unsafe { cfgetospeed(&tt_src) };
            // Zero output speed closes the connection.
            if speed == libc::B0 {
                speed = libc::B38400;
            }
            unsafe { cfsetospeed(&mut tt_dst, speed) };
            speed = unsafe { cfgetispeed(&tt_src) };
            unsafe { cfsetispeed(&mut tt_dst, speed) };
        }

        tcsetattr_nobg(dst, TCSAFLUSH, &tt_dst)?;

        let size = self.tty.get_size()?;
        dst.set_size(&size)
    }

    /// Set the user's terminal to raw mode. Enable terminal signals if `with_signals` is set to
    /// `true`.
    pub(crate) fn set_raw_mode(&mut self, with_signals: bool) -> io::Result<()> {
        let fd = self.tty.as_raw_fd();

        let mut term = self.original_termios()?;
        unsafe { cfmakeraw(&mut term) };
        if with_signals {
            term.c_lflag |= ISIG;
        }

        tcsetattr_nobg(fd, TCSADRAIN, &term)?;
        self.changed = true;

        Ok(())
    }

    /// Restore the saved terminal settings if we are in the foreground process group. Calling
    /// this when nothing was changed does nothing.
    ///
    /// This change is done after waiting for all the queued output to be written. To discard the
    /// queued input `flush` must be set to `true`.
    pub(crate) fn restore(&mut self, flush: bool) -> io::Result<()> {
        if let (true, Some(term)) = (self.changed, self.original_termios) {
            let fd = self.tty.as_raw_fd();
            let flags = if flush { TCSAFLUSH } else { TCSADRAIN };
            tcsetattr_nobg(fd, flags, &term)?;
            self.changed = false;
        }

        Ok(())
    }

    /// This is like `tcsetpgrp` but it only suceeds if we are in the foreground process group.
    pub(crate) fn tcsetpgrp_nobg(&self, pgrp: ProcessId) -> io::Result<()> {
        foreground_only(|| self.tty.tcsetpgrp(pgrp))
    }
}

impl AsRawFd for UserTerm {
    fn as_raw_fd(&self) -> RawFd {
        self.tty.as_raw_fd()
    }
}

impl Read for UserTerm {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.tty.read(buf)
    }

    fn read_vectored(&mut self, bufs: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
        self.tty.read_vectored(bufs)
    }
}

impl Write for UserTerm {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tty.write(buf)
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        self.tty.write_vectored(bufs)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.tty.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs::File,
        mem::MaybeUninit,
        os::fd::{AsFd, AsRawFd},
    };

    use libc::{tcgetattr, termios, ECHO, ICANON, ISIG};

    use super::UserTerm;
    use crate::system::term::{Pty, TermSize, Terminal};

    fn termios_of(fd: &impl AsRawFd) -> termios {
        let mut term = MaybeUninit::<termios>::uninit();
        assert_eq!(unsafe { tcgetattr(fd.as_raw_fd(), term.as_mut_ptr()) }, 0);
        unsafe { term.assume_init() }
    }

    fn follower_term(pty: &Pty) -> UserTerm {
        let file = File::from(pty.follower.as_fd().try_clone_to_owned().unwrap());
        UserTerm::from_file(file)
    }

    #[test]
    fn raw_mode_and_restore() {
        let pty = Pty::open().unwrap();
        let mut term = follower_term(&pty);
        let before = termios_of(&term);
        assert!(before.c_lflag & ICANON != 0);

        term.set_raw_mode(true).unwrap();
        let raw = termios_of(&term);
        assert_eq!(raw.c_lflag & (ICANON | ECHO), 0);
        assert!(raw.c_lflag & ISIG != 0);
        assert!(term.is_changed());

        term.restore(false).unwrap();
        assert_eq!(termios_of(&term).c_lflag, before.c_lflag);
        assert!(!term.is_changed());

        // A second restore is a no-op.
        term.restore(true).unwrap();
        assert_eq!(termios_of(&term).c_lflag, before.c_lflag);
    }

    #[test]
    fn copy_to_carries_size_and_modes() {
        let user = Pty::open().unwrap();
        let target = Pty::open().unwrap();
        user.leader.set_size(&TermSize::new(30, 100)).unwrap();

        let term = follower_term(&user);
        term.copy_to(&target.follower).unwrap();

        assert_eq!(target.follower.get_size().unwrap(), TermSize::new(30, 100));
        assert_eq!(
            termios_of(&target.follower).c_lflag & ICANON,
            termios_of(&term).c_lflag & ICANON
        );
    }
}
