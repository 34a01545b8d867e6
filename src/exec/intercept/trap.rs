// On Linux a seccomp() filter lets the supervisor answer every exec done by the command.
#![allow(unsafe_code)]
#![allow(non_upper_case_globals)]
#![cfg_attr(not(target_arch = "x86_64"), allow(unused))]

use std::ffi::{c_int, c_uint, c_ulong, c_void, OsString};
use std::fs::File;
use std::mem::{offset_of, size_of, zeroed};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::FileExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::ptr::{self, addr_of};
use std::io;

use libc::{
    cmsghdr, iovec, msghdr, prctl, recvmsg, seccomp_data, seccomp_notif, seccomp_notif_resp,
    seccomp_notif_sizes, sendmsg, sock_filter, sock_fprog, syscall, SYS_execve, SYS_execveat,
    SYS_seccomp, BPF_ABS, BPF_ALU, BPF_AND, BPF_JEQ, BPF_JMP, BPF_JUMP, BPF_K, BPF_LD, BPF_RET,
    BPF_STMT, BPF_W, CMSG_DATA, CMSG_FIRSTHDR, CMSG_LEN, CMSG_SPACE, EACCES, ENOENT, MSG_CTRUNC,
    PR_SET_NO_NEW_PRIVS, SCM_RIGHTS, SECCOMP_FILTER_FLAG_NEW_LISTENER, SECCOMP_GET_NOTIF_SIZES,
    SECCOMP_RET_ALLOW, SECCOMP_RET_KILL_PROCESS, SECCOMP_SET_MODE_FILTER,
    SECCOMP_USER_NOTIF_FLAG_CONTINUE, SOL_SOCKET,
};

use crate::{
    cutils::cerr,
    exec::{
        event::{EventHandle, EventRegistry, PollEvent},
        plugin::Plugins,
    },
    log::{dev_info, dev_warn, user_warn},
    system::{interface::ProcessId, poll::poll_now},
};

use super::{
    check_request,
    proto::{InterceptResponse, PolicyCheckRequest, MESSAGE_SIZE_MAX},
    InterceptEvent, InterceptHost, InterceptMode,
};

const SECCOMP_RET_USER_NOTIF: c_uint = 0x7fc00000;
const SECCOMP_IOCTL_NOTIF_RECV: c_ulong = 0xc0502100;
const SECCOMP_IOCTL_NOTIF_SEND: c_ulong = 0xc0182101;
const SECCOMP_IOCTL_NOTIF_ID_VALID: c_ulong = 0x40082102;

// from /usr/include/linux/audit.h, converted using bindgen
const __AUDIT_ARCH_64BIT: u32 = 0x80000000;
const __AUDIT_ARCH_LE: u32 = 0x40000000;

const AUDIT_ARCH_AARCH64: u32 = libc::EM_AARCH64 as u32 | __AUDIT_ARCH_64BIT | __AUDIT_ARCH_LE;
const AUDIT_ARCH_ARM: u32 = libc::EM_ARM as u32 | __AUDIT_ARCH_LE;
const AUDIT_ARCH_I386: u32 = libc::EM_386 as u32 | __AUDIT_ARCH_LE;
const AUDIT_ARCH_MIPS: u32 = libc::EM_MIPS as u32;
const AUDIT_ARCH_MIPSEL: u32 = libc::EM_MIPS as u32 | __AUDIT_ARCH_LE;
const AUDIT_ARCH_MIPS64: u32 = libc::EM_MIPS as u32 | __AUDIT_ARCH_64BIT;
const AUDIT_ARCH_MIPSEL64: u32 = libc::EM_MIPS as u32 | __AUDIT_ARCH_64BIT | __AUDIT_ARCH_LE;
const AUDIT_ARCH_PPC: u32 = libc::EM_PPC as u32;
const AUDIT_ARCH_PPC64: u32 = libc::EM_PPC64 as u32 | __AUDIT_ARCH_64BIT;
const AUDIT_ARCH_PPC64LE: u32 = libc::EM_PPC64 as u32 | __AUDIT_ARCH_64BIT | __AUDIT_ARCH_LE;
const AUDIT_ARCH_RISCV32: u32 = libc::EM_RISCV as u32 | __AUDIT_ARCH_LE;
const AUDIT_ARCH_RISCV64: u32 = libc::EM_RISCV as u32 | __AUDIT_ARCH_64BIT | __AUDIT_ARCH_LE;
const AUDIT_ARCH_S390X: u32 = libc::EM_S390 as u32 | __AUDIT_ARCH_64BIT;
const AUDIT_ARCH_X86_64: u32 = libc::EM_X86_64 as u32 | __AUDIT_ARCH_64BIT | __AUDIT_ARCH_LE;

/// # Safety
///
/// You must follow the rules the Linux man page specifies for the chosen
/// seccomp operation.
unsafe fn seccomp<T>(operation: c_uint, flags: c_uint, args: *mut T) -> c_int {
    // SAFETY: By function invariant.
    unsafe { syscall(SYS_seccomp, operation, flags, args) as c_int }
}

// BPF filtering is only supported (according to man seccomp) on the following architectures
// that are realistic on Linux.
const HOST_ARCH: u32 = if cfg!(target_arch = "aarch64") {
    AUDIT_ARCH_AARCH64
} else if cfg!(target_arch = "arm") {
    AUDIT_ARCH_ARM
} else if cfg!(target_arch = "mips") {
    if cfg!(target_endian = "little") {
        AUDIT_ARCH_MIPSEL
    } else {
        AUDIT_ARCH_MIPS
    }
} else if cfg!(target_arch = "mips64") {
    if cfg!(target_endian = "little") {
        AUDIT_ARCH_MIPSEL64
    } else {
        AUDIT_ARCH_MIPS64
    }
} else if cfg!(target_arch = "powerpc") {
    AUDIT_ARCH_PPC
} else if cfg!(target_arch = "powerpc64") {
    if cfg!(target_endian = "little") {
        AUDIT_ARCH_PPC64LE
    } else {
        AUDIT_ARCH_PPC64
    }
} else if cfg!(target_arch = "riscv32") {
    AUDIT_ARCH_RISCV32
} else if cfg!(target_arch = "riscv64") {
    AUDIT_ARCH_RISCV64
} else if cfg!(target_arch = "s390x") {
    AUDIT_ARCH_S390X
} else if cfg!(target_arch = "x86") {
    AUDIT_ARCH_I386
} else if cfg!(target_arch = "x86_64") {
    AUDIT_ARCH_X86_64
} else {
    0 // this will filter out all syscalls
};

// For x86-64 and aarch64 systems, it's possible to encounter them
// running in multi-arch mode.
const GUEST_ARCH: u32 = if cfg!(target_arch = "aarch64") {
    AUDIT_ARCH_ARM
} else if cfg!(target_arch = "riscv64") {
    AUDIT_ARCH_RISCV32
} else if cfg!(target_arch = "x86_64") {
    AUDIT_ARCH_I386
} else {
    HOST_ARCH
};

/// syscall numbers for the guest architecture according to the Linux syscall table
const SYS_execve_x86: i64 = 11;
const SYS_execve_arm: i64 = 11;
const SYS_execve_x32: i64 = 520;
const SYS_execve_rv32: i64 = 221;
const SYS_execveat_x86: i64 = 358;
const SYS_execveat_arm: i64 = 387;
const SYS_execveat_x32: i64 = 545;
const SYS_execveat_rv32: i64 = 281;

const GUEST_SYSCALL: (i64, i64) = if cfg!(target_arch = "aarch64") {
    (SYS_execve_arm, SYS_execveat_arm)
} else if cfg!(target_arch = "riscv64") {
    (SYS_execve_rv32, SYS_execveat_rv32)
} else if cfg!(target_arch = "x86_64") {
    (SYS_execve_x86, SYS_execveat_x86)
} else {
    (SYS_execve as _, SYS_execveat as _) // fallback
};

// Bit that is set on syscalls when using the X32 ABI; see man seccomp.
const __X32_SYSCALL_BIT: u32 = 0x40000000;

/// Install a filter that turns every `execve` and `execveat` of the calling process and its
/// descendants into a notification, and hand the notification descriptor over `tx`.
///
/// This runs in the command process before it drops its privileges. With the privileges still in
/// place the filter can be installed without setting `no_new_privs`, which would stop set-user-ID
/// programs from working in the command.
pub(super) fn install_filter(tx: &UnixStream) -> io::Result<()> {
    let nr_offset = offset_of!(seccomp_data, nr);
    let arch_offset = offset_of!(seccomp_data, arch);

    // SAFETY: libc unnecessarily marks these functions as unsafe
    #[rustfmt::skip]
    let exec_filter = unsafe { [
        // Load architecture number into the accumulator
        BPF_STMT((BPF_LD | BPF_ABS) as _, arch_offset as _),
        // Check if we are any of the recognized architectures
        BPF_JUMP((BPF_JMP | BPF_JEQ | BPF_K) as _, HOST_ARCH as _, 7, 0),
        BPF_JUMP((BPF_JMP | BPF_JEQ | BPF_K) as _, GUEST_ARCH as _, 1, 0),
        // Not a recognized architecture, forbid all syscalls
        BPF_STMT((BPF_RET | BPF_K) as _, SECCOMP_RET_KILL_PROCESS as _),

        // Guest architecture section
        // Load syscall number into the accumulator
        BPF_STMT((BPF_LD | BPF_W | BPF_ABS) as _, nr_offset as _),
        // Jump to user notify for execve/execveat
        BPF_JUMP((BPF_JMP | BPF_JEQ | BPF_K) as _, GUEST_SYSCALL.0 as _, 2, 0),
        BPF_JUMP((BPF_JMP | BPF_JEQ | BPF_K) as _, GUEST_SYSCALL.1 as _, 1, 0),
        // Allow non-matching syscalls
        BPF_STMT((BPF_RET | BPF_K) as _, SECCOMP_RET_ALLOW),
        // Notify the supervisor about execve/execveat syscall
        BPF_STMT((BPF_RET | BPF_K) as _, SECCOMP_RET_USER_NOTIF as _),

        // Host architecture section
        // Load syscall number into the accumulator
        BPF_STMT((BPF_LD | BPF_W | BPF_ABS) as _, nr_offset as _),
        // Unset the X32_SYSCALL bit (only necessary on x86_64)
        #[cfg(target_arch = "x86_64")]
        BPF_STMT((BPF_ALU | BPF_AND | BPF_K) as _, !__X32_SYSCALL_BIT),
        // On x86-64 only: check the x32 "design error" syscall numbers
        #[cfg(target_arch = "x86_64")]
        BPF_JUMP((BPF_JMP | BPF_JEQ | BPF_K) as _, SYS_execve_x32 as _, 4, 0),
        #[cfg(target_arch = "x86_64")]
        BPF_JUMP((BPF_JMP | BPF_JEQ | BPF_K) as _, SYS_execveat_x32 as _, 3, 0),
        // Jump to user notify for execve/execveat
        BPF_JUMP((BPF_JMP | BPF_JEQ | BPF_K) as _, SYS_execve as _, 2, 0),
        BPF_JUMP((BPF_JMP | BPF_JEQ | BPF_K) as _, SYS_execveat as _, 1, 0),
        // Allow non-matching syscalls
        BPF_STMT((BPF_RET | BPF_K) as _, SECCOMP_RET_ALLOW),
        // Notify the supervisor about execve/execveat syscall
        BPF_STMT((BPF_RET | BPF_K) as _, SECCOMP_RET_USER_NOTIF as _),
    ] };

    // this is used since we can't yet use "let exec_filter: [sock_filter; _] above"
    const fn check_type<const N: usize>(_arr: &[sock_filter; N]) {}
    check_type(&exec_filter);

    let exec_fprog = sock_fprog {
        len: exec_filter.len() as u16,
        filter: addr_of!(exec_filter) as *mut sock_filter,
    };

    let set_filter = || {
        // SAFETY: Passes a valid sock_fprog as argument.
        cerr(unsafe {
            seccomp(
                SECCOMP_SET_MODE_FILTER,
                SECCOMP_FILTER_FLAG_NEW_LISTENER as _,
                addr_of!(exec_fprog).cast_mut(),
            )
        })
    };

    let notify_fd = match set_filter() {
        Ok(fd) => fd,
        // Without CAP_SYS_ADMIN the filter requires the no_new_privs bit.
        Err(err) if err.raw_os_error() == Some(EACCES) => {
            // SAFETY: Trivially safe as it doesn't touch any memory.
            cerr(unsafe { prctl(PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) })?;
            set_filter()?
        }
        Err(err) => return Err(err),
    };

    // SAFETY: seccomp returned a fresh descriptor that nothing else owns.
    let notify_fd = unsafe { OwnedFd::from_raw_fd(notify_fd) };

    send_fd(tx, notify_fd.as_raw_fd())
}

//We must use vectored reads with ancillary data.
//
//NOTE: some day we can witch to using send/recv_vectored_with_ancillary; see:
// - https://doc.rust-lang.org/std/os/unix/net/struct.UnixDatagram.html#method.recv_vectored_with_ancillary
// - https://doc.rust-lang.org/std/os/unix/net/struct.UnixDatagram.html#method.send_vectored_with_ancillary
// but this is (at the time of writing) unstable.

#[repr(C)]
union SingleRightAnciliaryData {
    // SAFETY: Not actually unsafe
    #[allow(clippy::undocumented_unsafe_blocks)] // Clippy doesn't understand the safety comment
    buf: [u8; unsafe { CMSG_SPACE(size_of::<c_int>() as u32) as usize }],
    _align: cmsghdr,
}

/// Receive a file descriptor sent with [`send_fd`].
fn receive_fd(rx_fd: &UnixStream) -> io::Result<OwnedFd> {
    let mut data = [0u8; 1];
    let mut iov = iovec {
        iov_base: &mut data as *mut [u8; 1] as *mut c_void,
        iov_len: 1,
    };

    // SAFETY: msghdr can be zero-initialized
    let mut msg: msghdr = unsafe { zeroed() };
    msg.msg_name = ptr::null_mut();
    msg.msg_namelen = 0;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    // SAFETY: SingleRightAnciliaryData can be zero-initialized.
    let mut control: SingleRightAnciliaryData = unsafe { zeroed() };
    // SAFETY: The buf field is valid when zero-initialized.
    msg.msg_controllen = unsafe { control.buf.len() as _ };
    msg.msg_control = &mut control as *mut _ as *mut c_void;

    // SAFETY: A valid socket fd and a valid initialized msghdr are passed in.
    let received = cerr(unsafe { recvmsg(rx_fd.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) })?;
    if received == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }

    if msg.msg_flags & MSG_CTRUNC == MSG_CTRUNC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "truncated control message",
        ));
    }

    // SAFETY: The kernel correctly initializes everything on recvmsg for this to be safe.
    let fd = unsafe {
        let cmsgp = CMSG_FIRSTHDR(&msg);
        if cmsgp.is_null()
            || (*cmsgp).cmsg_len != CMSG_LEN(size_of::<c_int>() as u32) as _
            || (*cmsgp).cmsg_level != SOL_SOCKET
            || (*cmsgp).cmsg_type != SCM_RIGHTS
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "no descriptor in control message",
            ));
        }
        CMSG_DATA(cmsgp).cast::<c_int>().read()
    };

    // SAFETY: SCM_RIGHTS installed a new descriptor in our table.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn send_fd(tx_fd: &UnixStream, fd: RawFd) -> io::Result<()> {
    let mut data = [0u8; 1];
    let mut iov = iovec {
        iov_base: &mut data as *mut [u8; 1] as *mut c_void,
        iov_len: 1,
    };

    // SAFETY: msghdr can be zero-initialized
    let mut msg: msghdr = unsafe { zeroed() };
    msg.msg_name = ptr::null_mut();
    msg.msg_namelen = 0;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    // SAFETY: SingleRightAnciliaryData can be zero-initialized.
    let mut control: SingleRightAnciliaryData = unsafe { zeroed() };
    // SAFETY: The buf field is valid when zero-initialized.
    msg.msg_controllen = unsafe { control.buf.len() as _ };
    msg.msg_control = &mut control as *mut _ as *mut _;
    // SAFETY: msg.msg_control is correctly initialized and this follows
    // the contract of the various CMSG_* macros.
    unsafe {
        let cmsgp = CMSG_FIRSTHDR(&msg);
        (*cmsgp).cmsg_level = SOL_SOCKET;
        (*cmsgp).cmsg_type = SCM_RIGHTS;
        (*cmsgp).cmsg_len = CMSG_LEN(size_of::<c_int>() as u32) as _;
        ptr::write(CMSG_DATA(cmsgp).cast::<c_int>(), fd);
    }

    // SAFETY: A valid socket fd and a valid initialized msghdr are passed in.
    cerr(unsafe { sendmsg(tx_fd.as_raw_fd(), &msg, 0) }).map(|_| ())
}

/// An exec the command is blocked in until it gets an answer.
#[derive(Debug, Clone, Copy)]
struct TrappedExec {
    id: u64,
    pid: ProcessId,
    arch: u32,
    nr: c_int,
    args: [u64; 6],
}

impl TrappedExec {
    fn is_execveat(&self) -> bool {
        let nr = i64::from(self.nr);
        if self.arch == HOST_ARCH {
            let nr = i64::from(self.nr as u32 & !__X32_SYSCALL_BIT);
            nr == SYS_execveat as i64 || (cfg!(target_arch = "x86_64") && nr == SYS_execveat_x32)
        } else {
            nr == GUEST_SYSCALL.1
        }
    }

    /// Size of a pointer in the address space of the process doing the exec.
    fn pointer_width(&self) -> usize {
        let x32 = cfg!(target_arch = "x86_64") && self.nr as u32 & __X32_SYSCALL_BIT != 0;
        if self.arch == HOST_ARCH && !x32 {
            size_of::<usize>()
        } else {
            4
        }
    }
}

enum Answer {
    Continue,
    Fail(c_int),
}

/// The receiving end of the exec filter.
pub(super) struct Notifier {
    fd: OwnedFd,
    // u64 storage keeps the kernel structures aligned.
    req: Vec<u64>,
    resp: Vec<u64>,
}

impl Notifier {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        let mut sizes = seccomp_notif_sizes {
            seccomp_notif: 0,
            seccomp_notif_resp: 0,
            seccomp_data: 0,
        };
        // SAFETY: A valid seccomp_notif_sizes pointer is passed in
        cerr(unsafe { seccomp(SECCOMP_GET_NOTIF_SIZES, 0, &mut sizes) })?;

        // Linux reserves the right to demand more memory than the structures in libc take.
        let words = |size: u16, min: usize| usize::from(size).max(min).div_ceil(8);

        Ok(Self {
            fd,
            req: vec![0; words(sizes.seccomp_notif, size_of::<seccomp_notif>())],
            resp: vec![0; words(sizes.seccomp_notif_resp, size_of::<seccomp_notif_resp>())],
        })
    }

    /// Wait for the next trapped exec. `None` means the process doing it went away in between.
    fn recv(&mut self) -> io::Result<Option<TrappedExec>> {
        // SECCOMP_IOCTL_NOTIF_RECV expects the target struct to be zeroed
        self.req.fill(0);
        let req = self.req.as_mut_ptr().cast::<seccomp_notif>();

        // SAFETY: req points to a zeroed buffer at least as big as the kernel wants.
        match cerr(unsafe { libc::ioctl(self.fd.as_raw_fd(), SECCOMP_IOCTL_NOTIF_RECV as _, req) })
        {
            Ok(_) => {}
            Err(err) if err.raw_os_error() == Some(ENOENT) => return Ok(None),
            Err(err) => return Err(err),
        }

        // SAFETY: the kernel filled in the notification.
        let req = unsafe { &*req };
        Ok(Some(TrappedExec {
            id: req.id,
            pid: ProcessId::new(req.pid as libc::pid_t),
            arch: req.data.arch,
            nr: req.data.nr,
            args: req.data.args,
        }))
    }

    /// Whether the process behind `id` is still waiting for an answer.
    fn is_valid(&self, id: u64) -> bool {
        let mut id = id;
        // SAFETY: a valid pointer to a u64 is passed in.
        unsafe { libc::ioctl(self.fd.as_raw_fd(), SECCOMP_IOCTL_NOTIF_ID_VALID as _, &mut id) == 0 }
    }

    fn answer(&mut self, id: u64, answer: Answer) -> io::Result<()> {
        self.resp.fill(0);
        let resp = self.resp.as_mut_ptr().cast::<seccomp_notif_resp>();

        // SAFETY: resp points to a zeroed buffer big enough for a seccomp_notif_resp.
        unsafe {
            (*resp).id = id;
            match answer {
                Answer::Continue => (*resp).flags = SECCOMP_USER_NOTIF_FLAG_CONTINUE as _,
                Answer::Fail(errno) => (*resp).error = -errno,
            }
        }

        // SAFETY: A valid pointer to a seccomp_notif_resp is passed in; fd is valid.
        match cerr(unsafe { libc::ioctl(self.fd.as_raw_fd(), SECCOMP_IOCTL_NOTIF_SEND as _, resp) })
        {
            // The process is gone, nothing to answer.
            Err(err) if err.raw_os_error() == Some(ENOENT) => Ok(()),
            result => result.map(|_| ()),
        }
    }
}

impl AsRawFd for Notifier {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Reads strings and pointers out of the memory of another process.
struct ProcessMemory {
    mem: File,
    pointer_width: usize,
}

impl ProcessMemory {
    const CHUNK: usize = 256;

    fn open(pid: ProcessId, pointer_width: usize) -> io::Result<Self> {
        Ok(Self {
            mem: File::open(format!("/proc/{pid}/mem"))?,
            pointer_width,
        })
    }

    fn read_pointer(&self, addr: u64) -> io::Result<u64> {
        let mut bytes = [0; 8];
        let bytes = &mut bytes[..self.pointer_width];
        self.mem.read_exact_at(bytes, addr)?;
        Ok(if let Ok(bytes) = <[u8; 4]>::try_from(&*bytes) {
            u64::from(u32::from_ne_bytes(bytes))
        } else {
            let mut wide = [0; 8];
            wide.copy_from_slice(bytes);
            u64::from_ne_bytes(wide)
        })
    }

    fn read_string(&self, addr: u64) -> io::Result<OsString> {
        let mut string = Vec::new();
        let mut chunk = [0; Self::CHUNK];
        let mut addr = addr;

        loop {
            // A string may end right before an unmapped page, so short reads are fine.
            let read = self.mem.read_at(&mut chunk, addr)?;
            if read == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            if let Some(nul) = chunk[..read].iter().position(|&byte| byte == 0) {
                string.extend_from_slice(&chunk[..nul]);
                return Ok(OsString::from_vec(string));
            }
            string.extend_from_slice(&chunk[..read]);
            if string.len() > MESSAGE_SIZE_MAX {
                return Err(io::Error::from_raw_os_error(libc::E2BIG));
            }
            addr += read as u64;
        }
    }

    /// Read a null terminated array of strings.
    fn read_string_array(&self, addr: u64) -> io::Result<Vec<OsString>> {
        let mut strings = Vec::new();
        if addr == 0 {
            return Ok(strings);
        }

        let mut total = 0;
        for index in 0.. {
            let pointer = self.read_pointer(addr + index * self.pointer_width as u64)?;
            if pointer == 0 {
                break;
            }
            let string = self.read_string(pointer)?;
            total += string.len() + 1;
            if total > MESSAGE_SIZE_MAX {
                return Err(io::Error::from_raw_os_error(libc::E2BIG));
            }
            strings.push(string);
        }

        Ok(strings)
    }
}

/// Describe the exec behind `trap` as a policy check request.
fn read_exec(trap: &TrappedExec) -> io::Result<PolicyCheckRequest> {
    let mem = ProcessMemory::open(trap.pid, trap.pointer_width())?;
    let proc_dir = PathBuf::from(format!("/proc/{}", trap.pid));
    let cwd = std::fs::read_link(proc_dir.join("cwd"))?;

    let (dirfd, path, argv, envp, flags) = if trap.is_execveat() {
        let [dirfd, path, argv, envp, flags, _] = trap.args;
        (Some(dirfd as c_int), path, argv, envp, flags as c_int)
    } else {
        let [path, argv, envp, ..] = trap.args;
        (None, path, argv, envp, 0)
    };

    let path = PathBuf::from(mem.read_string(path)?);
    let dir = || -> io::Result<PathBuf> {
        match dirfd {
            Some(fd) if fd != libc::AT_FDCWD => std::fs::read_link(proc_dir.join(format!("fd/{fd}"))),
            _ => Ok(cwd.clone()),
        }
    };

    let command = if path.as_os_str().is_empty() && flags & libc::AT_EMPTY_PATH != 0 {
        dir()?
    } else if path.is_absolute() {
        path
    } else {
        dir()?.join(path)
    };

    Ok(PolicyCheckRequest {
        command: command.into_os_string(),
        argv: mem.read_string_array(argv)?,
        envp: mem.read_string_array(envp)?,
        cwd: cwd.into_os_string(),
        intercept_fd: -1,
    })
}

/// Whether an accepted exec can go ahead exactly as the command asked for it.
fn runs_unchanged(request: &PolicyCheckRequest, response: &InterceptResponse) -> bool {
    let InterceptResponse::Accept(accept) = response else {
        return false;
    };

    Path::new(&accept.run_command) == Path::new(&request.command)
        && accept.run_argv.get(1..) == request.argv.get(1..)
}

/// Answers the exec notifications of the command.
pub(super) struct TrapServer {
    socket: Option<UnixStream>,
    socket_handle: Option<EventHandle>,
    notifier: Option<(Notifier, EventHandle)>,
}

impl TrapServer {
    /// The notification descriptor will arrive on `socket`.
    pub(super) fn new(socket: UnixStream) -> Self {
        Self {
            socket: Some(socket),
            socket_handle: None,
            notifier: None,
        }
    }

    pub(super) fn register<H: InterceptHost>(&mut self, registry: &mut EventRegistry<H>) {
        if self.socket_handle.is_some() {
            return;
        }
        if let Some(socket) = &self.socket {
            self.socket_handle = Some(registry.register_event(socket, PollEvent::Readable, |_| {
                H::intercept_event(InterceptEvent::TrapSocket)
            }));
        }
    }

    pub(super) fn on_socket<H: InterceptHost>(&mut self, registry: &mut EventRegistry<H>) {
        let (Some(socket), Some(handle)) = (self.socket.take(), self.socket_handle.take()) else {
            return;
        };
        registry.deregister_event(handle);

        let notifier = match receive_fd(&socket).and_then(Notifier::new) {
            Ok(notifier) => notifier,
            Err(err) => {
                dev_warn!("cannot receive the exec notification descriptor: {err}");
                return;
            }
        };

        let handle = registry.register_event(&notifier, PollEvent::Readable, |_| {
            H::intercept_event(InterceptEvent::TrapNotify)
        });
        self.notifier = Some((notifier, handle));
    }

    /// Answer the next trapped exec. Execs done before the command is running are the supervisor
    /// starting it and go through unchecked.
    pub(super) fn on_notify<H: InterceptHost>(
        &mut self,
        command_running: bool,
        mode: InterceptMode,
        plugins: &mut Plugins,
        registry: &mut EventRegistry<H>,
    ) {
        let Some((notifier, _)) = self.notifier.as_mut() else {
            return;
        };

        let trap = match notifier.recv() {
            Ok(Some(trap)) => trap,
            Ok(None) => {
                // Every process using the filter may be gone.
                if poll_now(notifier).map_or(true, |ready| ready.hung_up) {
                    self.stop(registry);
                }
                return;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return,
            Err(err) => {
                dev_warn!("cannot receive exec notification: {err}");
                self.stop(registry);
                return;
            }
        };

        let answer = if !command_running {
            dev_info!("letting the initial exec of {} through", trap.pid);
            Answer::Continue
        } else {
            match read_exec(&trap) {
                Ok(_) if !notifier.is_valid(trap.id) => return,
                Ok(request) => {
                    let response = check_request(mode, plugins, &request);
                    if runs_unchanged(&request, &response) {
                        Answer::Continue
                    } else {
                        if let InterceptResponse::Accept(_) = response {
                            user_warn!("unable to run a modified command when exec is trapped");
                        }
                        Answer::Fail(EACCES)
                    }
                }
                Err(err) => {
                    dev_warn!("cannot read exec arguments of {}: {err}", trap.pid);
                    Answer::Fail(EACCES)
                }
            }
        };

        if let Err(err) = notifier.answer(trap.id, answer) {
            dev_warn!("cannot answer exec notification of {}: {err}", trap.pid);
        }
    }

    fn stop<H: InterceptHost>(&mut self, registry: &mut EventRegistry<H>) {
        if let Some((_, handle)) = self.notifier.take() {
            registry.deregister_event(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        ffi::{CString, OsString},
        io::Write,
        os::{fd::AsRawFd, unix::net::UnixStream},
    };

    use pretty_assertions::assert_eq;

    use crate::{
        exec::intercept::proto::{InterceptResponse, PolicyAcceptMessage, PolicyCheckRequest},
        system::getpid,
    };

    use super::{receive_fd, runs_unchanged, send_fd, ProcessMemory};

    #[test]
    fn descriptors_travel_over_sockets() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (mut pipe_tx, pipe_rx) = UnixStream::pair().unwrap();

        send_fd(&tx, pipe_rx.as_raw_fd()).unwrap();
        let received = receive_fd(&rx).unwrap();
        assert_ne!(received.as_raw_fd(), pipe_rx.as_raw_fd());

        pipe_tx.write_all(b"hi").unwrap();
        let mut received = UnixStream::from(received);
        let mut buf = [0; 2];
        std::io::Read::read_exact(&mut received, &mut buf).unwrap();
        assert_eq!(&buf, b"hi");

        drop(tx);
        assert!(receive_fd(&rx).is_err());
    }

    #[test]
    fn strings_are_read_from_process_memory() {
        let strings = [CString::new("/bin/true").unwrap(), CString::new("").unwrap()];
        let mut pointers: Vec<usize> = strings.iter().map(|s| s.as_ptr() as usize).collect();
        pointers.push(0);

        let mem = ProcessMemory::open(getpid(), std::mem::size_of::<usize>()).unwrap();
        assert_eq!(
            mem.read_string(strings[0].as_ptr() as u64).unwrap(),
            "/bin/true"
        );
        assert_eq!(
            mem.read_string_array(pointers.as_ptr() as u64).unwrap(),
            vec![OsString::from("/bin/true"), OsString::new()]
        );
        assert!(mem.read_string_array(0).unwrap().is_empty());
    }

    #[test]
    fn only_unchanged_commands_continue() {
        let request = PolicyCheckRequest {
            command: "/bin/ls".into(),
            argv: vec!["ls".into(), "-l".into()],
            envp: vec!["A=b".into()],
            ..Default::default()
        };
        let accept = |command: &str, argv: &[&str]| {
            InterceptResponse::Accept(PolicyAcceptMessage {
                run_command: command.into(),
                run_argv: argv.iter().map(OsString::from).collect(),
                run_envp: vec![],
            })
        };

        assert!(runs_unchanged(&request, &accept("/bin/ls", &["/bin/ls", "-l"])));
        assert!(!runs_unchanged(&request, &accept("/bin/ls", &["/bin/ls", "-a"])));
        assert!(!runs_unchanged(&request, &accept("/usr/bin/ls", &["ls", "-l"])));
        assert!(!runs_unchanged(&request, &InterceptResponse::Reject("no".into())));
    }
}
