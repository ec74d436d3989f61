//! Process-control engine for a source-level debugger of Go binaries:
//! attach to or launch a target, stop it, inspect and mutate its state, and
//! drive it forward at source-statement granularity across all of its
//! kernel threads.
//!
//! DWARF and symbol-table parsing, image loading, and variable evaluation
//! are consumed through the traits in [`symbols`]; the OS debugging
//! primitives sit behind [`host::Host`], with a ptrace implementation on
//! Linux and a mach-task implementation on macOS.

pub mod breakpoint;
pub mod error;
pub mod host;
pub mod process;
pub mod symbols;
pub mod thread;
pub mod types;

#[cfg(target_os = "linux")]
pub mod host_linux;

#[cfg(target_os = "macos")]
pub mod host_darwin;

pub use breakpoint::Breakpoint;
pub use error::DebuggerError;
pub use process::{DebuggedProcess, DefaultHost};
pub use types::{Tid, VirtAddr};
