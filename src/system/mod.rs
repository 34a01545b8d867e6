use std::{
    collections::BTreeSet,
    ffi::{c_uint, CStr, CString},
    fs::File,
    io,
    mem::MaybeUninit,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use crate::cutils::{cerr, null_terminated};
use interface::{GroupId, ProcessId, UserId};

use self::signal::SignalNumber;

// generalized traits for when we want to hide implementations
pub mod interface;

pub mod limits;

pub mod poll;

pub mod signal;

pub mod term;

pub mod wait;

pub(crate) fn _exit(status: libc::c_int) -> ! {
    unsafe { libc::_exit(status) }
}

/// The descriptors that survive [`PreservedFdList::close_from`] besides the ones below its
/// threshold.
#[derive(Debug, Default, Clone)]
pub(crate) struct PreservedFdList {
    fds: BTreeSet<c_uint>,
}

impl PreservedFdList {
    pub(crate) const fn new() -> Self {
        Self {
            fds: BTreeSet::new(),
        }
    }

    pub(crate) fn preserve<F: AsRawFd>(&mut self, fd: &F) {
        self.preserve_raw(fd.as_raw_fd());
    }

    pub(crate) fn preserve_raw(&mut self, fd: RawFd) {
        if let Ok(fd) = c_uint::try_from(fd) {
            self.fds.insert(fd);
        }
    }

    /// Close every descriptor numbered `lowest` or higher that was not preserved.
    pub(crate) fn close_from(self, lowest: RawFd) -> io::Result<()> {
        let start = c_uint::try_from(lowest).unwrap_or(0);
        let mut next_to_close = start;

        for fd in self.fds.into_iter().filter(|&fd| fd >= start) {
            if let Some(max_fd) = fd.checked_sub(1) {
                close_range(next_to_close, max_fd)?;
            }

            match fd.checked_add(1) {
                Some(min_fd) => next_to_close = min_fd,
                None => return Ok(()),
            }
        }

        close_range(next_to_close, c_uint::MAX)
    }
}

fn close_range(min_fd: c_uint, max_fd: c_uint) -> io::Result<()> {
    if min_fd <= max_fd {
        cerr(unsafe { libc::syscall(libc::SYS_close_range, min_fd, max_fd, 0 as c_uint) })?;
    }

    Ok(())
}

pub(crate) enum ForkResult {
    // Parent process branch with the child process' PID.
    Parent(ProcessId),
    // Child process branch.
    Child,
}

unsafe fn inner_fork() -> io::Result<ForkResult> {
    let pid = cerr(unsafe { libc::fork() })?;
    if pid == 0 {
        Ok(ForkResult::Child)
    } else {
        Ok(ForkResult::Parent(ProcessId::new(pid)))
    }
}

#[cfg(target_os = "linux")]
/// Create a new process.
pub(crate) fn fork() -> io::Result<ForkResult> {
    // SAFETY: `fork` is implemented using `clone` in linux so we don't need to worry about signal
    // safety.
    unsafe { inner_fork() }
}

#[cfg(not(target_os = "linux"))]
/// Create a new process.
///
/// # Safety
///
/// In a multithreaded program, only async-signal-safe functions are guaranteed to work in the
/// child process until a call to `execve` or a similar function is done.
pub(crate) unsafe fn fork() -> io::Result<ForkResult> {
    inner_fork()
}

pub fn setsid() -> io::Result<ProcessId> {
    cerr(unsafe { libc::setsid() }).map(ProcessId::new)
}

pub fn getpid() -> ProcessId {
    ProcessId::new(std::process::id() as libc::pid_t)
}

/// Send a signal to a process with the specified ID.
pub fn kill(pid: ProcessId, signal: SignalNumber) -> io::Result<()> {
    // SAFETY: This function cannot cause UB even if `pid` is not a valid process ID or if
    // `signal` is not a valid signal code.
    cerr(unsafe { libc::kill(pid.get(), signal) }).map(|_| ())
}

/// Send a signal to a process group with the specified ID.
pub fn killpg(pgid: ProcessId, signal: SignalNumber) -> io::Result<()> {
    // SAFETY: This function cannot cause UB even if `pgid` is not a valid process ID or if
    // `signal` is not a valid signal code.
    cerr(unsafe { libc::killpg(pgid.get(), signal) }).map(|_| ())
}

/// Get the process group ID of the current process.
/// Schedule a `SIGALRM` for this process in `secs` seconds, cancelling any earlier one when
/// `secs` is zero.
pub(crate) fn alarm(secs: libc::c_uint) -> libc::c_uint {
    // SAFETY: `alarm` cannot fail.
    unsafe { libc::alarm(secs) }
}

pub fn getpgrp() -> ProcessId {
    ProcessId::new(unsafe { libc::getpgrp() })
}

/// Get a process group ID.
pub fn getpgid(pid: ProcessId) -> io::Result<ProcessId> {
    // SAFETY: This function cannot cause UB even if `pid` is not a valid process ID
    cerr(unsafe { libc::getpgid(pid.get()) }).map(ProcessId::new)
}

/// Set a process group ID.
pub fn setpgid(pid: ProcessId, pgid: ProcessId) -> io::Result<()> {
    cerr(unsafe { libc::setpgid(pid.get(), pgid.get()) }).map(|_| ())
}

pub fn chown<S: AsRef<CStr> + ?Sized>(path: &S, uid: UserId, gid: GroupId) -> io::Result<()> {
    let path = path.as_ref().as_ptr();

    cerr(unsafe { libc::chown(path, uid.get(), gid.get()) }).map(|_| ())
}

pub fn real_uid() -> UserId {
    UserId::new(unsafe { libc::getuid() })
}

/// Set the supplementary groups of the calling process.
pub fn setgroups(groups: &[GroupId]) -> io::Result<()> {
    let groups: Vec<libc::gid_t> = groups.iter().map(GroupId::get).collect();
    cerr(unsafe { libc::setgroups(groups.len() as _, groups.as_ptr()) }).map(|_| ())
}

/// Set the real, effective and saved group ID at once.
pub fn set_all_gids(gid: GroupId) -> io::Result<()> {
    let gid = gid.get();
    cerr(unsafe { libc::setresgid(gid, gid, gid) }).map(|_| ())
}

/// Set the real, effective and saved user ID at once.
pub fn set_all_uids(uid: UserId) -> io::Result<()> {
    let uid = uid.get();
    cerr(unsafe { libc::setresuid(uid, uid, uid) }).map(|_| ())
}

pub fn chdir<S: AsRef<CStr> + ?Sized>(path: &S) -> io::Result<()> {
    cerr(unsafe { libc::chdir(path.as_ref().as_ptr()) }).map(|_| ())
}

pub fn chroot<S: AsRef<CStr> + ?Sized>(path: &S) -> io::Result<()> {
    cerr(unsafe { libc::chroot(path.as_ref().as_ptr()) }).map(|_| ())
}

/// Set the file mode creation mask, returning the previous one.
pub fn umask(mask: libc::mode_t) -> libc::mode_t {
    unsafe { libc::umask(mask) }
}

/// Set the scheduling priority of the calling process.
pub fn set_priority(priority: libc::c_int) -> io::Result<()> {
    cerr(unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, priority) }).map(|_| ())
}

/// Look up the id of a group by its name.
pub fn group_id_by_name(name: &CStr) -> io::Result<Option<GroupId>> {
    let mut buf = vec![0; 16_384];
    let mut grp = MaybeUninit::<libc::group>::uninit();
    let mut grp_ptr = std::ptr::null_mut();

    loop {
        let res = unsafe {
            libc::getgrnam_r(
                name.as_ptr(),
                grp.as_mut_ptr(),
                buf.as_mut_ptr(),
                buf.len(),
                &mut grp_ptr,
            )
        };
        match res {
            0 => break,
            libc::ERANGE if buf.len() < 1 << 20 => buf.resize(buf.len() * 2, 0),
            errno => return Err(io::Error::from_raw_os_error(errno)),
        }
    }

    if grp_ptr.is_null() {
        Ok(None)
    } else {
        // SAFETY: getgrnam_r succeeded and filled in `grp`.
        let grp = unsafe { grp.assume_init() };
        Ok(Some(GroupId::new(grp.gr_gid)))
    }
}

/// Create a pipe whose ends are both close-on-exec, returning `(read, write)`.
pub(crate) fn pipe() -> io::Result<(File, File)> {
    let mut fds = [0; 2];
    cerr(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    // SAFETY: pipe2 succeeded so both descriptors are open and owned by nobody else.
    unsafe { Ok((File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1]))) }
}

pub(crate) fn set_nonblocking<F: AsRawFd>(fd: &F, nonblocking: bool) -> io::Result<()> {
    let fd = fd.as_raw_fd();
    let flags = cerr(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    cerr(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) }).map(|_| ())
}

/// Duplicate `fd` onto the lowest free descriptor that is at least `min_fd`. The new
/// descriptor is inherited across `execve`.
pub(crate) fn dup_at_least<F: AsRawFd>(fd: &F, min_fd: RawFd) -> io::Result<OwnedFd> {
    let new_fd = cerr(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD, min_fd) })?;
    // SAFETY: F_DUPFD returned a fresh descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(new_fd) })
}

/// Make `target` refer to the same open file as `fd`.
pub(crate) fn dup2<F: AsRawFd>(fd: &F, target: RawFd) -> io::Result<()> {
    cerr(unsafe { libc::dup2(fd.as_raw_fd(), target) }).map(|_| ())
}

/// Fill `buf` with random bytes from the kernel.
pub(crate) fn getrandom(buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let rest = &mut buf[filled..];
        match cerr(unsafe { libc::getrandom(rest.as_mut_ptr().cast(), rest.len(), 0) }) {
            Ok(read) => filled += read as usize,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Replace the current process image. This only returns if that failed.
pub(crate) fn execve(path: &CStr, argv: &[CString], envp: &[CString]) -> io::Error {
    let argv = null_terminated(argv);
    let envp = null_terminated(envp);
    // SAFETY: every pointer refers to a NUL-terminated string that outlives the call and both
    // arrays end with a null pointer.
    unsafe { libc::execve(path.as_ptr(), argv.as_ptr(), envp.as_ptr()) };
    io::Error::last_os_error()
}

pub(crate) fn is_fd_open(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

pub fn syslog(priority: libc::c_int, facility: libc::c_int, message: &CStr) {
    const MSG: *const libc::c_char = match CStr::from_bytes_until_nul(b"%s\0") {
        Ok(cstr) => cstr.as_ptr(),
        Err(_) => panic!("syslog formatting string is not null-terminated"),
    };

    unsafe {
        libc::syslog(priority | facility, MSG, message.as_ptr());
    }
}

pub fn make_zeroed_sigaction() -> libc::sigaction {
    // SAFETY: since sigaction is a C struct, all-zeroes is a valid representation
    // We cannot use a "literal struct" initialization method since the exact representation
    // of libc::sigaction is not fixed.
    unsafe { std::mem::zeroed() }
}
