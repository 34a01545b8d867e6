//! Running a command that a policy accepted, the way sudo does: as the target user, in its own
//! pseudo-terminal when something needs one, with job control and signals relayed between the
//! user and the command, and with the programs it executes checked again on request.
//!
//! The entry point is [`run_command`].
pub(crate) mod common;
pub(crate) mod cutils;
pub(crate) mod exec;
pub(crate) mod log;
pub(crate) mod system;

pub use common::Error;
pub use log::SudoLogger;
pub use exec::{
    run_command, ApprovalPlugin, ApprovedExec, AuditPlugin, AuditSource, CommandDetails,
    CommandStatus, ExecFlags, ExitReason, InterceptClient, InterceptType, IoCapabilities, IoPlugin,
    IoStream, LogAction, Plugin, Plugins, PolicyDecision, PolicyPlugin, TargetUser,
};
pub use system::{
    interface::{GroupId, ProcessId, UserId},
    wait::WaitStatus,
};
