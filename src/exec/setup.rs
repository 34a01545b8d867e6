//! Turning a freshly forked process into the command.
use std::{
    ffi::{CString, OsString},
    io,
    os::fd::RawFd,
    path::Path,
};

use crate::{
    cutils::to_cstring,
    log::{dev_info, dev_warn, user_error},
    system::{
        chdir, chroot, dup2, execve,
        limits::{disable_coredump, unlimit_nproc, ResourceLimit},
        set_all_gids, set_all_uids, set_priority, setgroups,
        signal::{SignalSet, SignalsState},
        umask, PreservedFdList,
    },
};

use super::{
    intercept::ChildIntercept, interface::CommandDetails, pipe::CommandStdio, plugin::Plugins,
};

/// The state of the process that called [`run_command`](super::run_command), which the command
/// has to get back.
pub(super) struct ExecContext<'a> {
    pub(super) details: &'a CommandDetails,
    signals: SignalsState,
    core_limit: Option<ResourceLimit>,
}

impl<'a> ExecContext<'a> {
    /// Save the signal dispositions and stop the supervisor from dumping core.
    pub(super) fn new(details: &'a CommandDetails) -> io::Result<Self> {
        let signals = SignalsState::save()?;

        let core_limit = disable_coredump()
            .map_err(|err| dev_warn!("cannot disable core dumps: {err}"))
            .ok();

        Ok(Self {
            details,
            signals,
            core_limit,
        })
    }

    pub(super) fn restore_signals(&self) {
        if let Err(err) = self.signals.restore() {
            dev_warn!("cannot restore signal states: {err}");
        }
    }

    /// Set up the current process as described by the command details and execute the command.
    ///
    /// This only returns if something went wrong. Descriptors in `keep_fds` survive until the
    /// command is executed.
    pub(super) fn exec_command(
        &self,
        plugins: &mut Plugins,
        intercept: Option<&ChildIntercept>,
        mask: Option<&SignalSet>,
        keep_fds: &[RawFd],
    ) -> io::Error {
        match self.become_command(plugins, intercept, mask, keep_fds) {
            Ok(never) => match never {},
            Err(err) => err,
        }
    }

    fn become_command(
        &self,
        plugins: &mut Plugins,
        intercept: Option<&ChildIntercept>,
        mask: Option<&SignalSet>,
        keep_fds: &[RawFd],
    ) -> io::Result<std::convert::Infallible> {
        let details = self.details;

        self.restore_signals();
        if let Some(mask) = mask {
            if let Err(err) = mask.set_mask() {
                dev_warn!("cannot restore signal mask: {err}");
            }
        }

        if let Some(priority) = details.priority {
            if let Err(err) = set_priority(priority) {
                user_error!("unable to set process priority: {err}");
            }
        }

        let nproc_limit = unlimit_nproc()
            .map_err(|err| dev_info!("cannot lift the process limit: {err}"))
            .ok();

        // The seccomp filter can only be installed while we are still privileged.
        if let Some(intercept) = intercept {
            intercept.install().map_err(|err| {
                user_error!("unable to set up interception: {err}");
                err
            })?;
        }

        if let Err(err) = plugins.init_session(details) {
            user_error!("{err}");
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }

        if let Some(user) = &details.user {
            setgroups(&user.groups).map_err(|err| {
                user_error!("unable to set supplementary groups: {err}");
                err
            })?;
        }

        if let Some(root) = &details.chroot {
            chroot(&to_cstring(root)?)
                .and_then(|()| chdir(c"/"))
                .map_err(|err| {
                    user_error!("unable to change root directory to {}: {err}", root.display());
                    err
                })?;
        }

        if let Some(user) = &details.user {
            set_all_gids(user.gid).map_err(|err| {
                user_error!("unable to set group ID to {}: {err}", user.gid);
                err
            })?;
            set_all_uids(user.uid).map_err(|err| {
                user_error!("unable to change to user ID {}: {err}", user.uid);
                err
            })?;
        }

        if let Some(limit) = nproc_limit {
            if let Err(err) = limit.restore() {
                dev_warn!("cannot restore the process limit: {err}");
            }
        }

        if let Some(cwd) = &details.cwd {
            if let Err(err) = to_cstring(cwd).and_then(|cwd| chdir(&cwd)) {
                user_error!("unable to change directory to {}: {err}", cwd.display());
                if !details.cwd_optional {
                    return Err(err);
                }
            }
        }

        if let Some(mask) = details.umask {
            // The command never gets a more permissive mask than the one we were started with.
            let old = umask(mask);
            umask(old | mask);
        }

        if let Some(limit) = self.core_limit {
            if let Err(err) = limit.restore() {
                dev_warn!("cannot restore the core dump limit: {err}");
            }
        }

        let mut envp = details.envp.clone();
        let mut preserved = PreservedFdList::new();
        if let Some(intercept) = intercept {
            intercept.apply_env(&mut envp, details.intercept_preload.as_deref());
            intercept.preserve(&mut preserved);
        }
        for &fd in keep_fds.iter().chain(&details.preserve_fds) {
            preserved.preserve_raw(fd);
        }
        preserved.close_from(details.closefrom)?;

        let mut argv = details.argv.clone();
        match argv.first_mut() {
            Some(arg0) => *arg0 = details.arg0(),
            None => argv.push(details.arg0()),
        }

        Err(my_execve(details.command_path(), &argv, &envp))
    }
}

/// Make the descriptors in `stdio` the standard streams of this process.
pub(super) fn redirect_stdio(stdio: CommandStdio) -> io::Result<()> {
    for (target, fd) in (0..).zip(&stdio) {
        if let Some(fd) = fd {
            dup2(fd, target)?;
        }
    }
    Ok(())
}

/// Execute `path`. Files without an interpreter line that the kernel refuses are run by
/// `/bin/sh` like the shell would.
pub(super) fn my_execve(path: &Path, argv: &[OsString], envp: &[OsString]) -> io::Error {
    let result = (|| -> io::Result<io::Error> {
        let c_path = to_cstring(path)?;
        let c_argv = argv.iter().map(to_cstring).collect::<io::Result<Vec<_>>>()?;
        let c_envp = envp.iter().map(to_cstring).collect::<io::Result<Vec<_>>>()?;

        let err = execve(&c_path, &c_argv, &c_envp);
        if err.raw_os_error() != Some(libc::ENOEXEC) {
            return Ok(err);
        }

        dev_info!("{} has no interpreter line, running it with /bin/sh", path.display());

        let mut sh_argv = Vec::with_capacity(c_argv.len() + 1);
        sh_argv.push(CString::from(c"sh"));
        sh_argv.push(c_path);
        sh_argv.extend(c_argv.into_iter().skip(1));

        Ok(execve(c"/bin/sh", &sh_argv, &c_envp))
    })();

    match result {
        Ok(err) | Err(err) => err,
    }
}
