use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};

use crate::breakpoint::{Breakpoint, BreakpointTable, SourceLocation};
use crate::error::{is_no_such_process, DebuggerError};
use crate::host::{Host, HostEvent, Registers, WaitScope};
use crate::symbols::{DwarfReader, Loader, SymbolicContext, TableParsers};
use crate::thread::{Thread, ThreadRegistry};
use crate::types::{Tid, VirtAddr};

#[cfg(target_os = "linux")]
pub type DefaultHost = crate::host_linux::PtraceHost;
#[cfg(target_os = "macos")]
pub type DefaultHost = crate::host_darwin::MachHost;

/// The runtime's breakpoint intrinsic. Continuing out of it takes two
/// single steps back to user code.
const RUNTIME_BREAKPOINT_FUNC: &str = "runtime.breakpoint";

/// A process under debug: the traced threads, the breakpoint set, the
/// symbolic tables, and the state machine driving them.
///
/// Driver calls (`resume`, `step`, `next`, `halt`) never overlap; the
/// `running` flag marks one being in flight. `request_manual_stop` is the
/// only operation safe to issue concurrently.
pub struct DebuggedProcess {
    host: Box<dyn Host>,
    context: SymbolicContext,
    threads: ThreadRegistry,
    breakpoints: BreakpointTable,
    running: AtomicBool,
    halt: AtomicBool,
}

impl DebuggedProcess {
    /// Attach to a running process, load its symbolic context, and discover
    /// its threads.
    pub fn attach(pid: Tid, loader: &dyn Loader, parsers: &dyn TableParsers) -> Result<Self> {
        let host = DefaultHost::attach(pid)?;
        info!("attached to process {pid}");
        Self::from_host(Box::new(host), loader, parsers)
    }

    /// Start a new target under trace, stdout/stderr inherited, then proceed
    /// as with [`DebuggedProcess::attach`].
    pub fn launch(argv: &[String], loader: &dyn Loader, parsers: &dyn TableParsers) -> Result<Self> {
        let host = DefaultHost::launch(argv)?;
        info!("launched target process {}", host.pid());
        Self::from_host(Box::new(host), loader, parsers)
    }

    fn from_host(
        host: Box<dyn Host>,
        loader: &dyn Loader,
        parsers: &dyn TableParsers,
    ) -> Result<Self> {
        let path = host.executable_path()?;
        let context = SymbolicContext::load(loader, parsers, &path, host.section_names())?;
        Self::with_context(host, context)
    }

    /// Assemble a process from an already-attached backend and a pre-built
    /// symbolic context.
    pub fn with_context(host: Box<dyn Host>, context: SymbolicContext) -> Result<Self> {
        let mut process = DebuggedProcess {
            host,
            context,
            threads: ThreadRegistry::new(),
            breakpoints: BreakpointTable::new(),
            running: AtomicBool::new(false),
            halt: AtomicBool::new(false),
        };
        process.update_thread_list()?;
        Ok(process)
    }

    pub fn pid(&self) -> Tid {
        self.host.pid()
    }

    /// Whether a driver call is currently executing the target.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Last wait status of the current thread.
    pub fn status(&self) -> Option<HostEvent> {
        self.threads
            .current()
            .and_then(|tid| self.threads.get(tid))
            .and_then(|thread| thread.status)
    }

    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.iter()
    }

    pub fn current_thread(&self) -> Option<Tid> {
        self.threads.current()
    }

    pub fn breakpoints(&self) -> &BreakpointTable {
        &self.breakpoints
    }

    /// Cursor over the image's `.debug_info`, for consumers that evaluate
    /// variables themselves.
    pub fn dwarf_reader(&self) -> Option<DwarfReader<'_>> {
        self.context.dwarf.reader("info")
    }

    pub fn switch_thread(&mut self, tid: Tid) -> Result<()> {
        if self.threads.contains(tid) {
            self.threads.set_current(tid);
            return Ok(());
        }
        Err(DebuggerError::NoSuchThread(tid).into())
    }

    /// Register values of the current thread.
    pub fn registers(&self) -> Result<Registers> {
        let tid = self.current_thread_id()?;
        self.host
            .read_registers(tid)
            .context("could not get registers")
    }

    pub fn current_pc(&self) -> Result<VirtAddr> {
        Ok(self.registers()?.pc())
    }

    /// Resolve a location string: `file:line`, a function name, a breakpoint
    /// id, or a raw address.
    pub fn find_location(&self, location: &str) -> Result<VirtAddr> {
        if let Some((file, line)) = location.split_once(':') {
            let file = std::path::absolute(file)?;
            let line: u64 = line
                .parse()
                .with_context(|| format!("invalid line number in {location}"))?;
            return self.context.symbols.line_to_pc(&file.to_string_lossy(), line);
        }

        if let Some(func) = self.context.symbols.lookup_func(location) {
            return Ok(func.entry);
        }

        let Some(id) = parse_integer(location) else {
            return Err(DebuggerError::LocationNotFound(location.to_string()).into());
        };

        // Try it as a breakpoint id, hardware slots before the software map,
        // before falling back to a raw address.
        for bp in self.breakpoints.hw_slots().iter().flatten() {
            if bp.id as u64 == id {
                return Ok(bp.addr);
            }
        }
        for bp in self.breakpoints.software() {
            if bp.id as u64 == id {
                return Ok(bp.addr);
            }
        }

        Ok(VirtAddr(id))
    }

    /// Set a breakpoint at `addr` through the current thread.
    pub fn set_breakpoint(&mut self, addr: VirtAddr) -> Result<i32> {
        let tid = self.current_thread_id()?;
        let location = self.source_location(addr);
        self.breakpoints
            .set(self.host.as_mut(), tid, addr, false, location)
    }

    pub fn set_breakpoint_by_location(&mut self, location: &str) -> Result<i32> {
        let addr = self.find_location(location)?;
        self.set_breakpoint(addr)
    }

    /// Clear the breakpoint at `addr`, restoring the original instruction
    /// byte or freeing the debug-register slot.
    pub fn clear_breakpoint(&mut self, addr: VirtAddr) -> Result<Breakpoint> {
        let tid = self.current_thread_id()?;
        self.breakpoints.clear(self.host.as_mut(), tid, addr)
    }

    pub fn clear_breakpoint_by_location(&mut self, location: &str) -> Result<Breakpoint> {
        let addr = self.find_location(location)?;
        self.clear_breakpoint(addr)
    }

    /// Ask the running target to stop. Safe to call from another thread
    /// while a driver call blocks in its wait; a no-op if nothing runs.
    pub fn request_manual_stop(&self) {
        self.halt.store(true, Ordering::SeqCst);
        for tid in self.threads.ids() {
            let _ = self.host.halt(tid);
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Stop every live thread.
    pub fn halt(&mut self) -> Result<()> {
        self.halt.store(true, Ordering::SeqCst);
        self.halt_threads()
    }

    /// Resume the whole process and block until a breakpoint is hit, the
    /// target exits, or a manual stop arrives.
    pub fn resume(&mut self) -> Result<()> {
        for tid in self.threads.ids() {
            self.continue_thread(tid)?;
        }

        self.run(|p| {
            let tid = p.trap_wait(WaitScope::AnyChild)?;
            if !p.threads.contains(tid) {
                bail!("could not find thread for {tid}");
            }
            if p.threads.current() != Some(tid) {
                if let Some(current) = p.threads.current() {
                    info!("thread context changed from {current} to {tid}");
                }
                p.threads.set_current(tid);
            }

            let pc = p.current_pc()?;

            if let Some(func) = p.context.symbols.pc_to_func(pc) {
                if func.name == RUNTIME_BREAKPOINT_FUNC {
                    // Step twice to get back to user code.
                    for _ in 0..2 {
                        p.step_thread(tid)?;
                    }
                    return p.halt();
                }
            }

            if let Some(bp) = p.breakpoints.hardware_at(pc) {
                if bp.temp {
                    return Ok(());
                }
                return p.halt();
            }
            // Software traps leave the PC one past the breakpoint address.
            if let Some(bp) = p.breakpoints.software_at(pc - 1) {
                if bp.temp {
                    return Ok(());
                }
                // Rewind onto the breakpoint so the restored instruction is
                // the one that executes on the following resume.
                let mut regs = p.host.read_registers(tid)?;
                regs.set_pc(pc - 1);
                p.host.write_registers(tid, &regs)?;
                return p.halt();
            }

            Err(DebuggerError::UnrecognizedBreakpoint(pc).into())
        })
    }

    /// Single-step every thread that is not parked in a runtime wait.
    pub fn step(&mut self) -> Result<()> {
        self.run(|p| {
            for tid in p.threads.ids() {
                if p.host.thread_blocked(tid) {
                    continue;
                }
                p.step_thread(tid)?;
            }
            Ok(())
        })
    }

    /// Step to the next source line, stepping over calls. Threads blocked in
    /// the runtime are continued as-is; every other thread gets temporary
    /// breakpoints on the candidate lines of its current function.
    pub fn next(&mut self) -> Result<()> {
        self.run(|p| {
            let result = p.next_threads();
            // Temporaries are removed no matter how the walk ended.
            p.clear_temp_breakpoints();
            result
        })
    }

    fn next_threads(&mut self) -> Result<()> {
        let mut ran = 0;
        for tid in self.threads.ids() {
            if self.host.thread_blocked(tid) {
                self.continue_thread(tid)?;
                continue;
            }
            match self.next_thread(tid) {
                Ok(()) => ran += 1,
                // The thread may have died between enumeration and now.
                Err(err) if is_no_such_process(&err) => {}
                Err(err) => return Err(err),
            }
        }

        for _ in 0..ran {
            let tid = self.trap_wait(WaitScope::AnyChild)?;
            let mut regs = self.host.read_registers(tid)?;
            let pc = regs.pc();
            // Only a software trap reports one past the breakpoint; a
            // hardware stop already rests on it.
            if self.breakpoints.software_at(pc - 1).is_some() {
                regs.set_pc(pc - 1);
                self.host.write_registers(tid, &regs)?;
            }
        }

        self.halt()
    }

    /// Plant temporary breakpoints on every further line of the function at
    /// `tid`'s PC; if the line table runs past the function's end, break on
    /// the caller's return address instead. Then continue the thread.
    ///
    /// The stops are placed on addresses, not thread state, because the
    /// runtime may migrate the user task to another kernel thread while the
    /// statement executes.
    fn next_thread(&mut self, tid: Tid) -> Result<()> {
        let regs = self.host.read_registers(tid)?;
        let mut pc = regs.pc();
        if let Some(site) = self.armed_site(pc) {
            pc = site;
        }

        let (fde_end, ret_offset) = {
            let fde = self
                .context
                .frames
                .fde_for_pc(pc)
                .ok_or_else(|| anyhow!("could not find function frame entry for {pc:#x}"))?;
            (fde.end(), fde.return_address_offset(pc))
        };

        let mut loc = self
            .context
            .lines
            .location_for_pc(pc)
            .ok_or_else(|| anyhow!("could not find line entry for {pc:#x}"))?;
        if loc.delta < 0 {
            // Synthetic row; rebase onto the real row for that file:line.
            loc = self
                .context
                .lines
                .location_for_file_line(&loc.file, loc.line)
                .ok_or_else(|| anyhow!("could not find line entry for {}:{}", loc.file, loc.line))?;
        }

        loop {
            loc = self
                .context
                .lines
                .next_location(loc.address)
                .ok_or_else(|| anyhow!("line table ended at {:#x}", loc.address))?;
            if loc.address == pc {
                continue;
            }

            if loc.address >= fde_end {
                // The next row is outside this function: the statement
                // returns. Break on the caller's return address; -8 is the
                // callee's pushed return slot.
                let ret = self.return_address(tid, ret_offset - 8)?;
                if let Err(err) = self.set_temp_breakpoint(tid, ret) {
                    debug!("could not break on return address {ret:#x}: {err:#}");
                }
                break;
            }

            if let Err(err) = self.set_temp_breakpoint(tid, loc.address) {
                if !is_breakpoint_exists(&err) {
                    return Err(err);
                }
            }
        }

        self.continue_thread(tid)
    }

    /// Read the saved return address `offset` bytes from `tid`'s SP.
    fn return_address(&mut self, tid: Tid, offset: i64) -> Result<VirtAddr> {
        let regs = self.host.read_registers(tid)?;
        let data = self.host.read_memory(tid, regs.sp() + offset, 8)?;
        let bytes: [u8; 8] = data
            .as_slice()
            .try_into()
            .context("short read of return address")?;
        Ok(VirtAddr(u64::from_le_bytes(bytes)))
    }

    /// Single-step one thread. A software breakpoint under the PC is
    /// disabled for the step, the PC rewound onto the restored instruction,
    /// and the breakpoint re-armed on every exit path.
    fn step_thread(&mut self, tid: Tid) -> Result<()> {
        let mut regs = self.host.read_registers(tid)?;
        let disabled = if let Some(site) = self.armed_site(regs.pc()) {
            let bp = self.breakpoints.disable_software(self.host.as_mut(), tid, site)?;
            regs.set_pc(site);
            self.host.write_registers(tid, &regs)?;
            Some(bp)
        } else {
            None
        };

        let result = self.single_step_and_wait(tid);

        if let Some(bp) = disabled {
            let addr = bp.addr;
            if let Err(err) = self.breakpoints.rearm_software(self.host.as_mut(), tid, bp) {
                warn!("could not re-arm breakpoint at {addr:#x}: {err:#}");
            }
        }

        result.context("step failed")
    }

    fn single_step_and_wait(&mut self, tid: Tid) -> Result<()> {
        loop {
            self.host.single_step(tid)?;
            let (wtid, event) = self.host.wait_event(WaitScope::Thread(tid))?;
            if let Some(thread) = self.threads.get_mut(wtid) {
                thread.status = Some(event);
            }
            match event {
                HostEvent::TraceClone(child) => {
                    // The stepped instruction spawned a thread; pick it up,
                    // let it run, and finish the step.
                    self.add_thread(child, false)?;
                    self.host.cont(child)?;
                }
                HostEvent::Exited(status) if wtid == self.pid() => {
                    return Err(DebuggerError::ProcessExited { pid: wtid, status }.into());
                }
                HostEvent::Exited(_) => {
                    self.threads.remove(tid);
                    return Err(nix::errno::Errno::ESRCH)
                        .with_context(|| format!("thread {tid} exited during step"));
                }
                _ => return Ok(()),
            }
        }
    }

    /// Continue one thread, stepping over a software breakpoint it may be
    /// stopped on first.
    fn continue_thread(&mut self, tid: Tid) -> Result<()> {
        let regs = self.host.read_registers(tid)?;
        if self.armed_site(regs.pc()).is_some() {
            self.step_thread(tid).context("could not step")?;
        }
        self.host.cont(tid)
    }

    /// The address of the armed software breakpoint this thread is stopped
    /// on, if any. A fresh trap leaves the PC one past the breakpoint; a
    /// rewound thread rests exactly on it.
    fn armed_site(&self, pc: VirtAddr) -> Option<VirtAddr> {
        if self.breakpoints.software_at(pc - 1).is_some() {
            Some(pc - 1)
        } else if self.breakpoints.software_at(pc).is_some() {
            Some(pc)
        } else {
            None
        }
    }

    /// Wait until a thread traps. Clone events attach and continue the new
    /// thread without surfacing a stop; stray signal stops are ignored
    /// unless a manual stop was requested.
    fn trap_wait(&mut self, scope: WaitScope) -> Result<Tid> {
        loop {
            let (tid, event) = self.host.wait_event(scope)?;
            if !self.host.reports_clone_events() {
                self.update_thread_list()?;
            }
            if let Some(thread) = self.threads.get_mut(tid) {
                thread.status = Some(event);
            }

            match event {
                HostEvent::Exited(status) if tid == self.pid() => {
                    return Err(DebuggerError::ProcessExited { pid: tid, status }.into());
                }
                HostEvent::Exited(_) => {
                    self.threads.remove(tid);
                }
                HostEvent::TraceClone(child) => {
                    self.add_thread(child, false)?;
                    self.continue_thread(child)
                        .with_context(|| format!("could not continue new thread {child}"))?;
                    self.continue_thread(tid)
                        .with_context(|| format!("could not continue thread {tid}"))?;
                }
                HostEvent::Trap => return Ok(tid),
                HostEvent::Stop(sig)
                    if sig == libc::SIGSTOP && self.halt.load(Ordering::SeqCst) =>
                {
                    return Err(DebuggerError::ManualStop.into());
                }
                HostEvent::Stop(sig) => {
                    debug!("ignoring stop of {tid} with signal {sig}");
                }
                HostEvent::Interrupted => {
                    return Err(DebuggerError::ManualStop.into());
                }
            }
        }
    }

    /// Run a driver body with the running/halt flags maintained around it.
    /// A manual stop surfacing from the body is normal completion.
    fn run<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.running.store(true, Ordering::SeqCst);
        self.halt.store(false, Ordering::SeqCst);
        let result = f(self);
        self.running.store(false, Ordering::SeqCst);
        match result {
            Err(err)
                if matches!(
                    err.downcast_ref::<DebuggerError>(),
                    Some(DebuggerError::ManualStop)
                ) =>
            {
                Ok(())
            }
            other => other,
        }
    }

    fn halt_threads(&self) -> Result<()> {
        for tid in self.threads.ids() {
            self.host.halt(tid)?;
        }
        Ok(())
    }

    fn add_thread(&mut self, tid: Tid, attach: bool) -> Result<()> {
        if self.threads.contains(tid) {
            return Ok(());
        }
        self.host.attach_thread(tid, attach)?;
        self.threads.add(tid);
        Ok(())
    }

    /// Reconcile the registry with the kernel's thread set, attaching any
    /// thread we have not seen yet.
    fn update_thread_list(&mut self) -> Result<()> {
        let pid = self.pid();
        for tid in self.host.enumerate_threads()? {
            self.add_thread(tid, tid != pid)?;
        }
        Ok(())
    }

    fn current_thread_id(&self) -> Result<Tid> {
        self.threads.current().context("no current thread")
    }

    /// Temporaries are always software breakpoints: the stop must catch any
    /// kernel thread the runtime migrates the user task onto, not just the
    /// thread whose debug registers we could write.
    fn set_temp_breakpoint(&mut self, tid: Tid, addr: VirtAddr) -> Result<i32> {
        let location = self.source_location(addr);
        self.breakpoints
            .set_software(self.host.as_mut(), tid, addr, true, location)
    }

    fn source_location(&self, addr: VirtAddr) -> SourceLocation {
        let function_name = self.context.symbols.pc_to_func(addr).map(|f| f.name);
        let (file, line) = match self.context.symbols.pc_to_line(addr) {
            Some((file, line)) => (Some(file), Some(line)),
            None => (None, None),
        };
        SourceLocation {
            function_name,
            file,
            line,
        }
    }

    fn clear_temp_breakpoints(&mut self) {
        let Some(tid) = self.threads.current() else {
            return;
        };
        for addr in self.breakpoints.temp_addresses() {
            if let Err(err) = self.breakpoints.clear(self.host.as_mut(), tid, addr) {
                warn!("could not clear temporary breakpoint at {addr:#x}: {err:#}");
            }
        }
    }
}

impl Drop for DebuggedProcess {
    fn drop(&mut self) {
        if let Err(err) = self.host.detach() {
            debug!("detach on drop failed: {err:#}");
        }
    }
}

fn is_breakpoint_exists(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<DebuggerError>(),
        Some(DebuggerError::BreakpointExists(_))
    )
}

/// Parse an integer with the standard `0x`/`0o`/`0b` prefixes, defaulting to
/// decimal.
fn parse_integer(s: &str) -> Option<u64> {
    let (radix, digits) = match s.get(..2) {
        Some("0x") | Some("0X") => (16, &s[2..]),
        Some("0o") | Some("0O") => (8, &s[2..]),
        Some("0b") | Some("0B") => (2, &s[2..]),
        _ => (10, s),
    };
    u64::from_str_radix(digits, radix).ok()
}

#[cfg(test)]
mod tests {
    use super::parse_integer;

    #[test]
    fn integer_prefixes() {
        assert_eq!(parse_integer("0x401000"), Some(0x401000));
        assert_eq!(parse_integer("0o755"), Some(0o755));
        assert_eq!(parse_integer("0b1010"), Some(10));
        assert_eq!(parse_integer("42"), Some(42));
        assert_eq!(parse_integer("main.foo"), None);
        assert_eq!(parse_integer(""), None);
    }
}
