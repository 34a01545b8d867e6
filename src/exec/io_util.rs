use std::io;

pub(super) fn was_interrupted(err: &io::Error) -> bool {
    // EINTR and EAGAIN are retried alike.
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

/// Call `f` repeatedly until it succeeds or fails with something other than an interruption.
pub(super) fn retry_while_interrupted<T>(mut f: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match f() {
            Err(err) if was_interrupted(&err) => {}
            result => return result,
        }
    }
}

/// Whether a read error means the other end is gone for good.
pub(super) fn is_read_eof(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EIO | libc::ENXIO | libc::EBADF))
}

/// Whether a write error means the destination is gone for good.
pub(super) fn is_write_gone(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::BrokenPipe
        || matches!(err.raw_os_error(), Some(libc::EPIPE | libc::ENXIO | libc::EBADF | libc::EIO))
}
