use std::{
    collections::BTreeMap,
    io,
    os::fd::{AsRawFd, RawFd},
};

use crate::cutils::cerr;
use libc::{c_short, pollfd, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};

/// The kind of event that will be monitored for a file descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PollEvent {
    /// Data may be read without blocking.
    Readable,
    /// Data may be written without blocking.
    Writable,
}

/// A set of indexed file descriptors to be polled using the [`poll`](https://manpage.me/?q=poll) system call.
pub struct PollSet<K> {
    fds: BTreeMap<K, (RawFd, bool, c_short)>,
}

impl<K: Ord + Clone> PollSet<K> {
    /// Create an empty set of file descriptors.
    pub const fn new() -> Self {
        Self {
            fds: BTreeMap::new(),
        }
    }

    /// Add a file descriptor under the provided key. This descriptor will be checked for the given
    /// poll event.
    ///
    /// If the provided key is already in the set, calling this function will overwrite the file
    /// descriptor for that key.
    pub fn add_fd<F: AsRawFd>(&mut self, key: K, fd: &F, event: PollEvent) {
        let event = match event {
            PollEvent::Readable => POLLIN,
            PollEvent::Writable => POLLOUT,
        };
        self.fds.insert(key, (fd.as_raw_fd(), true, event));
    }

    /// Forget the file descriptor under the provided key, returning whether it was present.
    pub fn remove_fd(&mut self, key: &K) -> bool {
        self.fds.remove(key).is_some()
    }

    /// Ignore the file descriptor under the provided key, if any.
    pub fn ignore_fd(&mut self, key: &K) {
        if let Some((_, should_poll, _)) = self.fds.get_mut(key) {
            *should_poll = false;
        }
    }

    /// Stop ignoring the file descriptor under the provided key, if any.
    pub fn resume_fd(&mut self, key: &K) {
        if let Some((_, should_poll, _)) = self.fds.get_mut(key) {
            *should_poll = true;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fds.values().all(|&(_, should_poll, _)| !should_poll)
    }

    /// Poll the set of file descriptors and return the keys of the descriptors that are ready to
    /// be read or written, in key order.
    ///
    /// A hang up or error condition counts as ready so the owner gets to observe it through the
    /// next read or write.
    ///
    /// Calling this function will block until one of the file descriptors in the set is ready.
    pub fn poll(&mut self) -> io::Result<Vec<K>> {
        self.poll_for(-1)
    }

    /// Like [`PollSet::poll`] but only return the descriptors that are ready right now.
    #[cfg(test)]
    pub fn try_poll(&mut self) -> io::Result<Vec<K>> {
        self.poll_for(0)
    }

    fn poll_for(&mut self, timeout: libc::c_int) -> io::Result<Vec<K>> {
        let (keys, mut fds): (Vec<&K>, Vec<pollfd>) = self
            .fds
            .iter()
            .filter(|(_, &(_, should_poll, _))| should_poll)
            .map(|(key, &(fd, _, events))| {
                (
                    key,
                    pollfd {
                        fd,
                        events,
                        revents: 0,
                    },
                )
            })
            .unzip();

        let n = cerr(unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as _, timeout) })?;

        let mut ready = Vec::with_capacity(n as usize);

        for (key, fd) in keys.into_iter().zip(fds) {
            let events = (fd.events | POLLHUP | POLLERR | POLLNVAL) & fd.revents;

            if events != 0 {
                ready.push(key.clone());
            }
        }

        Ok(ready)
    }
}

/// What a descriptor reports right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub hung_up: bool,
}

/// Check the state of `fd` without waiting.
pub fn poll_now<F: AsRawFd>(fd: &F) -> io::Result<Readiness> {
    let mut pollfd = pollfd {
        fd: fd.as_raw_fd(),
        events: POLLIN,
        revents: 0,
    };

    cerr(unsafe { libc::poll(&mut pollfd, 1, 0) })?;

    Ok(Readiness {
        readable: pollfd.revents & POLLIN != 0,
        hung_up: pollfd.revents & (POLLHUP | POLLERR | POLLNVAL) != 0,
    })
}

#[cfg(test)]
mod tests {
    use std::{io::Write, os::unix::net::UnixStream};

    use pretty_assertions::assert_eq;

    use super::{poll_now, PollEvent, PollSet, Readiness};

    #[test]
    fn only_ready_keys_are_reported() {
        let (a_rx, mut a_tx) = UnixStream::pair().unwrap();
        let (b_rx, _b_tx) = UnixStream::pair().unwrap();

        let mut set = PollSet::new();
        set.add_fd(1, &a_rx, PollEvent::Readable);
        set.add_fd(2, &b_rx, PollEvent::Readable);
        set.add_fd(3, &a_tx, PollEvent::Writable);

        a_tx.write_all(b"x").unwrap();

        assert_eq!(set.poll().unwrap(), vec![1, 3]);
    }

    #[test]
    fn ignored_keys_do_not_shift_the_result() {
        let (a_rx, _a_tx) = UnixStream::pair().unwrap();
        let (b_rx, mut b_tx) = UnixStream::pair().unwrap();

        let mut set = PollSet::new();
        set.add_fd(1, &a_rx, PollEvent::Readable);
        set.add_fd(2, &b_rx, PollEvent::Readable);
        set.ignore_fd(&1);

        b_tx.write_all(b"x").unwrap();

        assert_eq!(set.poll().unwrap(), vec![2]);

        set.resume_fd(&1);
        assert!(set.remove_fd(&2));
        assert!(!set.remove_fd(&2));
        assert!(!set.is_empty());
    }

    #[test]
    fn hang_up_counts_as_ready() {
        let (rx, tx) = UnixStream::pair().unwrap();

        let mut set = PollSet::new();
        set.add_fd(7, &rx, PollEvent::Readable);

        drop(tx);

        assert_eq!(set.poll().unwrap(), vec![7]);
    }

    #[test]
    fn poll_now_does_not_wait() {
        let (rx, mut tx) = UnixStream::pair().unwrap();
        assert_eq!(poll_now(&rx).unwrap(), Readiness::default());

        tx.write_all(b"x").unwrap();
        assert!(poll_now(&rx).unwrap().readable);

        drop(tx);
        assert!(poll_now(&rx).unwrap().hung_up);
    }
}
