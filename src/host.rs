use std::path::PathBuf;

use anyhow::Result;

use crate::types::{Tid, VirtAddr};

/// Object-file section names the symbolic-context loader should ask the
/// image for. They differ between ELF and Mach-O, so each host carries its
/// own table.
pub struct SectionNames {
    pub frame: &'static str,
    pub line: &'static str,
    pub symtab: &'static str,
    pub pclntab: &'static str,
    pub text: &'static str,
}

/// What a call to [`Host::wait_event`] should wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitScope {
    /// Any thread of the traced process.
    AnyChild,
    /// One specific thread.
    Thread(Tid),
}

/// A single report from the kernel about a traced thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// The thread hit a trap instruction or finished a single-step.
    Trap,
    /// The thread stopped with the given signal.
    Stop(i32),
    /// The thread spawned a new thread with the given id.
    TraceClone(Tid),
    /// The thread (or the whole process, if the id is the root pid) exited.
    Exited(i32),
    /// The wait itself was interrupted by a manual stop request.
    Interrupted,
}

/// Narrow abstraction over the OS debugging primitives. Everything above
/// this trait is host independent; the two implementations are selected at
/// build time.
///
/// Register and memory accessors are only safe to call while the target
/// thread is in signal-delivery-stop. The trait does not enforce this.
pub trait Host: Send + Sync {
    fn pid(&self) -> Tid;
    fn detach(&mut self) -> Result<()>;
    fn executable_path(&self) -> Result<PathBuf>;
    fn section_names(&self) -> &'static SectionNames;

    /// Whether new threads announce themselves through
    /// [`HostEvent::TraceClone`]. When false, the registry polls
    /// [`Host::enumerate_threads`] after every wait instead.
    fn reports_clone_events(&self) -> bool;
    fn supports_hardware_breakpoints(&self) -> bool;

    fn enumerate_threads(&self) -> Result<Vec<Tid>>;

    /// Bring a newly discovered thread under trace. `attach` is false when
    /// the kernel already traces the thread (clone-inherited tracing).
    fn attach_thread(&mut self, tid: Tid, attach: bool) -> Result<()>;

    /// Block until a traced thread reports. Returns the reporting thread and
    /// the event. The thread id accompanying [`HostEvent::Interrupted`] is
    /// meaningless.
    fn wait_event(&mut self, scope: WaitScope) -> Result<(Tid, HostEvent)>;

    fn cont(&mut self, tid: Tid) -> Result<()>;
    fn single_step(&mut self, tid: Tid) -> Result<()>;

    /// Ask the thread to stop; the resulting stop is observed through
    /// [`Host::wait_event`]. Takes `&self` so a manual stop can be requested
    /// while another call blocks in `wait_event`.
    fn halt(&self, tid: Tid) -> Result<()>;

    /// Heuristic: the thread is parked in a runtime-level wait (sleeping in
    /// the kernel) rather than executing user code.
    fn thread_blocked(&self, tid: Tid) -> bool;

    fn read_registers(&self, tid: Tid) -> Result<Registers>;
    fn write_registers(&self, tid: Tid, regs: &Registers) -> Result<()>;

    fn read_memory(&self, tid: Tid, addr: VirtAddr, len: usize) -> Result<Vec<u8>>;
    fn write_memory(&self, tid: Tid, addr: VirtAddr, data: &[u8]) -> Result<()>;

    fn set_hardware_breakpoint(&mut self, tid: Tid, slot: usize, addr: VirtAddr) -> Result<()>;
    fn clear_hardware_breakpoint(&mut self, tid: Tid, slot: usize) -> Result<()>;
}

/// Whole register set of one stopped thread. The layout is per-architecture;
/// this layer only needs the program counter and stack pointer.
#[cfg(target_os = "linux")]
#[derive(Clone, Copy)]
pub struct Registers {
    pub data: libc::user_regs_struct,
}

#[cfg(target_os = "linux")]
impl Registers {
    pub fn zeroed() -> Self {
        Registers {
            data: unsafe { std::mem::zeroed() },
        }
    }

    pub fn pc(&self) -> VirtAddr {
        VirtAddr(self.data.rip)
    }

    pub fn sp(&self) -> VirtAddr {
        VirtAddr(self.data.rsp)
    }

    pub fn set_pc(&mut self, pc: VirtAddr) {
        self.data.rip = pc.0;
    }
}

#[cfg(target_os = "macos")]
#[derive(Clone, Copy)]
pub struct Registers {
    pub data: mach2::structs::x86_thread_state64_t,
}

#[cfg(target_os = "macos")]
impl Registers {
    pub fn zeroed() -> Self {
        Registers {
            data: unsafe { std::mem::zeroed() },
        }
    }

    pub fn pc(&self) -> VirtAddr {
        VirtAddr(self.data.__rip)
    }

    pub fn sp(&self) -> VirtAddr {
        VirtAddr(self.data.__rsp)
    }

    pub fn set_pc(&mut self, pc: VirtAddr) {
        self.data.__rip = pc.0;
    }
}
