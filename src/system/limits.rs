//! Resource limits the supervisor changes for itself and undoes for the command.
use std::io;

use crate::cutils::cerr;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type Resource = libc::c_int;

#[derive(Clone, Copy)]
pub(crate) struct ResourceLimit {
    resource: Resource,
    saved: libc::rlimit,
}

impl ResourceLimit {
    fn get(resource: Resource) -> io::Result<Self> {
        let mut saved = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        cerr(unsafe { libc::getrlimit(resource, &mut saved) })?;
        Ok(Self { resource, saved })
    }

    fn set(&self, limit: &libc::rlimit) -> io::Result<()> {
        cerr(unsafe { libc::setrlimit(self.resource, limit) }).map(|_| ())
    }

    /// Put back the limit as it was when it was captured.
    pub(crate) fn restore(&self) -> io::Result<()> {
        self.set(&self.saved)
    }

    pub(crate) fn soft_limit(&self) -> libc::rlim_t {
        self.saved.rlim_cur
    }
}

/// Stop the calling process from producing core dumps, which could leak what it has in memory.
/// The previous limit is returned so that the command can get it back.
pub(crate) fn disable_coredump() -> io::Result<ResourceLimit> {
    let limit = ResourceLimit::get(libc::RLIMIT_CORE)?;
    limit.set(&libc::rlimit {
        rlim_cur: 0,
        rlim_max: limit.saved.rlim_max,
    })?;
    Ok(limit)
}

/// Lift the process count limit so that switching to a user who is at their limit does not fail
/// with `EAGAIN`. The previous limit is returned so it can be put back after the switch.
pub(crate) fn unlimit_nproc() -> io::Result<ResourceLimit> {
    let limit = ResourceLimit::get(libc::RLIMIT_NPROC)?;
    let unlimited = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    if limit.set(&unlimited).is_err() {
        // Without privileges only the soft limit can be raised.
        limit.set(&libc::rlimit {
            rlim_cur: limit.saved.rlim_max,
            rlim_max: limit.saved.rlim_max,
        })?;
    }
    Ok(limit)
}
