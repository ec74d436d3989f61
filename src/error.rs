use thiserror::Error;

use crate::types::{Tid, VirtAddr};

/// Error kinds the engine distinguishes by type. Backend failures travel as
/// plain `anyhow` errors with the originating errno preserved in the chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DebuggerError {
    #[error("process {pid} has exited with status {status}")]
    ProcessExited { pid: Tid, status: i32 },

    #[error("manual stop requested")]
    ManualStop,

    #[error("breakpoint already exists at {0:#x}")]
    BreakpointExists(VirtAddr),

    #[error("no breakpoint at {0:#x}")]
    NoSuchBreakpoint(VirtAddr),

    #[error("thread {0} does not exist")]
    NoSuchThread(Tid),

    #[error("unable to find location for {0}")]
    LocationNotFound(String),

    #[error("unrecognized breakpoint at {0:#x}")]
    UnrecognizedBreakpoint(VirtAddr),
}

/// True when `err` is, or wraps, a "no such process" failure from the
/// backend. Per-thread stepping inside `next` tolerates these.
pub fn is_no_such_process(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<nix::errno::Errno>() == Some(&nix::errno::Errno::ESRCH))
}
