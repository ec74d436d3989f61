use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::mem::offset_of;
use std::os::fd::{FromRawFd, IntoRawFd};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::ptr;

use anyhow::{bail, Context, Result};
use nix::fcntl::OFlag;
use nix::libc::{self, c_long, c_void, iovec, process_vm_readv};
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, execv, fork, pipe2, ForkResult, Pid};

use crate::host::{Host, HostEvent, Registers, SectionNames, WaitScope};
use crate::types::{Tid, VirtAddr};

static ELF_SECTIONS: SectionNames = SectionNames {
    frame: ".debug_frame",
    line: ".debug_line",
    symtab: ".gosymtab",
    pclntab: ".gopclntab",
    text: ".text",
};

/// Marker in `/proc/<pid>/task/<tid>/stat` for a thread sleeping in the
/// kernel, which is how parked runtime threads show up.
const STATUS_SLEEPING: char = 'S';

pub struct PtraceHost {
    pid: Pid,
}

impl PtraceHost {
    /// Attach to a running process and consume its initial stop.
    pub fn attach(pid: Tid) -> Result<Self> {
        if pid == 0 {
            bail!("invalid pid");
        }
        let pid = Pid::from_raw(pid);
        ptrace::attach(pid).with_context(|| format!("could not attach to {pid}"))?;
        waitpid(pid, Some(WaitPidFlag::__WALL))?;
        Ok(PtraceHost { pid })
    }

    /// Fork and exec the target under trace, stdout/stderr inherited. Exec
    /// failures in the child are reported back through a CLOEXEC pipe. The
    /// exec stop is consumed before returning.
    pub fn launch(argv: &[String]) -> Result<Self> {
        if argv.is_empty() {
            bail!("empty command line");
        }
        let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC)?;

        match unsafe { fork() } {
            Ok(ForkResult::Parent { child, .. }) => {
                close(write_fd.into_raw_fd())?;

                let mut file = unsafe { File::from_raw_fd(read_fd.into_raw_fd()) };
                let mut error_message = String::new();
                file.read_to_string(&mut error_message)?;

                if !error_message.is_empty() {
                    waitpid(child, None)?;
                    bail!("error from child: {error_message}");
                }

                waitpid(child, Some(WaitPidFlag::__WALL))
                    .context("waiting for target execve failed")?;
                Ok(PtraceHost { pid: child })
            }
            Ok(ForkResult::Child) => {
                close(read_fd.into_raw_fd())?;
                let write_raw_fd = write_fd.into_raw_fd();

                if ptrace::traceme().is_err() {
                    write_to_pipe(write_raw_fd, "traceme failed");
                    std::process::exit(1);
                }

                let args: Vec<CString> = argv
                    .iter()
                    .map(|a| CString::new(a.as_bytes()))
                    .collect::<Result<_, _>>()?;
                if execv(&args[0], &args).is_err() {
                    write_to_pipe(write_raw_fd, "exec failed");
                    std::process::exit(1);
                }
                unreachable!();
            }
            Err(_) => bail!("fork failed"),
        }
    }

    fn debugreg_offset(slot: usize) -> u64 {
        (offset_of!(libc::user, u_debugreg) + slot * 8) as u64
    }

    fn peek_user(&self, tid: Tid, offset: u64) -> Result<u64> {
        unsafe {
            *libc::__errno_location() = 0;
        }
        let data: c_long = unsafe {
            libc::ptrace(
                libc::PTRACE_PEEKUSER,
                tid,
                offset,
                ptr::null_mut::<c_void>(),
            )
        };
        let err_no = unsafe { *libc::__errno_location() };
        if data == -1 && err_no != 0 {
            return Err(nix::errno::Errno::from_raw(err_no))
                .with_context(|| format!("could not read user area of {tid} at {offset:#x}"));
        }
        Ok(data as u64)
    }

    fn poke_user(&self, tid: Tid, offset: u64, value: u64) -> Result<()> {
        let ret = unsafe { libc::ptrace(libc::PTRACE_POKEUSER, tid, offset, value) };
        if ret < 0 {
            return Err(nix::errno::Errno::last())
                .with_context(|| format!("could not write user area of {tid} at {offset:#x}"));
        }
        Ok(())
    }
}

impl Host for PtraceHost {
    fn pid(&self) -> Tid {
        self.pid.as_raw()
    }

    fn detach(&mut self) -> Result<()> {
        ptrace::detach(self.pid, None)?;
        Ok(())
    }

    fn executable_path(&self) -> Result<PathBuf> {
        let path = std::fs::read_link(format!("/proc/{}/exe", self.pid))?;
        Ok(path)
    }

    fn section_names(&self) -> &'static SectionNames {
        &ELF_SECTIONS
    }

    fn reports_clone_events(&self) -> bool {
        true
    }

    fn supports_hardware_breakpoints(&self) -> bool {
        true
    }

    fn enumerate_threads(&self) -> Result<Vec<Tid>> {
        let mut tids = Vec::new();
        for entry in std::fs::read_dir(format!("/proc/{}/task", self.pid))? {
            let entry = entry?;
            let tid = entry
                .file_name()
                .to_string_lossy()
                .parse::<Tid>()
                .context("unexpected entry in task directory")?;
            tids.push(tid);
        }
        Ok(tids)
    }

    fn attach_thread(&mut self, tid: Tid, attach: bool) -> Result<()> {
        let pid = Pid::from_raw(tid);
        if attach {
            // EPERM usually means the clone option already put the thread
            // under trace; a real permission problem resurfaces below.
            match ptrace::attach(pid) {
                Ok(()) | Err(nix::errno::Errno::EPERM) => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("could not attach to new thread {tid}"))
                }
            }
            let status = waitpid(pid, Some(WaitPidFlag::__WALL))?;
            if let WaitStatus::Exited(..) = status {
                bail!("thread already exited {tid}");
            }
        }

        match ptrace::setoptions(pid, Options::PTRACE_O_TRACECLONE) {
            Err(nix::errno::Errno::ESRCH) => {
                waitpid(pid, Some(WaitPidFlag::__WALL))
                    .with_context(|| format!("error while waiting after adding thread {tid}"))?;
                ptrace::setoptions(pid, Options::PTRACE_O_TRACECLONE)
                    .with_context(|| format!("could not set options for new traced thread {tid}"))?;
            }
            other => other?,
        }
        Ok(())
    }

    fn wait_event(&mut self, scope: WaitScope) -> Result<(Tid, HostEvent)> {
        let target = match scope {
            WaitScope::AnyChild => None,
            WaitScope::Thread(tid) => Some(Pid::from_raw(tid)),
        };

        loop {
            let status = match waitpid(target, Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(nix::errno::Errno::EINTR) => return Ok((0, HostEvent::Interrupted)),
                Err(e) => return Err(e).context("wait failed"),
            };

            match status {
                WaitStatus::Exited(pid, code) => {
                    return Ok((pid.as_raw(), HostEvent::Exited(code)))
                }
                WaitStatus::Signaled(pid, sig, _) => {
                    return Ok((pid.as_raw(), HostEvent::Exited(128 + sig as i32)))
                }
                WaitStatus::PtraceEvent(pid, _, event) if event == libc::PTRACE_EVENT_CLONE => {
                    let cloned = ptrace::getevent(pid).context("could not get event message")?;
                    return Ok((pid.as_raw(), HostEvent::TraceClone(cloned as Tid)));
                }
                WaitStatus::PtraceEvent(pid, _, _) => return Ok((pid.as_raw(), HostEvent::Trap)),
                WaitStatus::Stopped(pid, Signal::SIGTRAP) => {
                    return Ok((pid.as_raw(), HostEvent::Trap))
                }
                WaitStatus::Stopped(pid, sig) => {
                    return Ok((pid.as_raw(), HostEvent::Stop(sig as i32)))
                }
                // Nothing this layer reports; keep waiting.
                WaitStatus::PtraceSyscall(_)
                | WaitStatus::Continued(_)
                | WaitStatus::StillAlive => continue,
            }
        }
    }

    fn cont(&mut self, tid: Tid) -> Result<()> {
        ptrace::cont(Pid::from_raw(tid), None)
            .with_context(|| format!("could not continue thread {tid}"))?;
        Ok(())
    }

    fn single_step(&mut self, tid: Tid) -> Result<()> {
        ptrace::step(Pid::from_raw(tid), None)
            .with_context(|| format!("could not single step thread {tid}"))?;
        Ok(())
    }

    fn halt(&self, tid: Tid) -> Result<()> {
        kill(Pid::from_raw(tid), Signal::SIGSTOP)?;
        Ok(())
    }

    fn thread_blocked(&self, tid: Tid) -> bool {
        let path = format!("/proc/{}/task/{}/stat", self.pid, tid);
        let Ok(stat) = std::fs::read_to_string(path) else {
            return false;
        };
        // The state char follows the parenthesized comm, which may itself
        // contain spaces and parens.
        let Some(end) = stat.rfind(')') else {
            return false;
        };
        stat[end + 1..]
            .trim_start()
            .starts_with(STATUS_SLEEPING)
    }

    fn read_registers(&self, tid: Tid) -> Result<Registers> {
        let data = ptrace::getregs(Pid::from_raw(tid))
            .with_context(|| format!("could not read registers of {tid}"))?;
        Ok(Registers { data })
    }

    fn write_registers(&self, tid: Tid, regs: &Registers) -> Result<()> {
        ptrace::setregs(Pid::from_raw(tid), regs.data)
            .with_context(|| format!("could not write registers of {tid}"))?;
        Ok(())
    }

    fn read_memory(&self, tid: Tid, addr: VirtAddr, len: usize) -> Result<Vec<u8>> {
        let mut ret = vec![0u8; len];
        let local_iov = iovec {
            iov_base: ret.as_mut_ptr() as *mut c_void,
            iov_len: ret.len(),
        };

        // Split the remote side at page boundaries so a fault in one page
        // does not abort the whole transfer request.
        let mut remote_iovs = Vec::new();
        let mut current = addr;
        let mut remaining = len;
        while remaining > 0 {
            let offset = (current.0 & 0xfff) as usize;
            let chunk = remaining.min(0x1000 - offset);
            remote_iovs.push(iovec {
                iov_base: current.0 as *mut c_void,
                iov_len: chunk,
            });
            remaining -= chunk;
            current += chunk as i64;
        }

        let result = unsafe {
            process_vm_readv(
                tid,
                &local_iov as *const iovec,
                1,
                remote_iovs.as_ptr(),
                remote_iovs.len() as u64,
                0,
            )
        };
        if result < 0 {
            return Err(nix::errno::Errno::last())
                .with_context(|| format!("could not read memory of {tid} at {addr:#x}"));
        }

        Ok(ret)
    }

    fn write_memory(&self, tid: Tid, addr: VirtAddr, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            let remaining = data.len() - written;
            let word: u64 = if remaining >= 8 {
                u64::from_le_bytes(data[written..written + 8].try_into().unwrap())
            } else {
                // Partial tail: merge with what is already there.
                let read = self.read_memory(tid, addr + written as i64, 8)?;
                let mut buf = [0u8; 8];
                buf[..remaining].copy_from_slice(&data[written..]);
                buf[remaining..].copy_from_slice(&read[remaining..]);
                u64::from_le_bytes(buf)
            };

            let result = unsafe {
                libc::ptrace(
                    libc::PTRACE_POKEDATA,
                    tid,
                    (addr + written as i64).0 as *mut c_void,
                    word,
                )
            };
            if result < 0 {
                return Err(nix::errno::Errno::last())
                    .with_context(|| format!("could not write memory of {tid} at {addr:#x}"));
            }

            written += 8;
        }
        Ok(())
    }

    fn set_hardware_breakpoint(&mut self, tid: Tid, slot: usize, addr: VirtAddr) -> Result<()> {
        let dr7_offset = Self::debugreg_offset(7);
        self.poke_user(tid, Self::debugreg_offset(slot), addr.0)?;

        let mut control = self.peek_user(tid, dr7_offset)?;
        // Condition bits 00 (execute) and length bits 00 (one byte).
        let clear_mask = (0b11u64 << (slot * 2)) | (0b1111u64 << (slot * 4 + 16));
        control &= !clear_mask;
        control |= 1u64 << (slot * 2);
        self.poke_user(tid, dr7_offset, control)
    }

    fn clear_hardware_breakpoint(&mut self, tid: Tid, slot: usize) -> Result<()> {
        let dr7_offset = Self::debugreg_offset(7);
        self.poke_user(tid, Self::debugreg_offset(slot), 0)?;

        let mut control = self.peek_user(tid, dr7_offset)?;
        let clear_mask = (0b11u64 << (slot * 2)) | (0b1111u64 << (slot * 4 + 16));
        control &= !clear_mask;
        self.poke_user(tid, dr7_offset, control)
    }
}

fn write_to_pipe(write_fd: RawFd, message: &str) {
    unsafe {
        libc::write(
            write_fd,
            message.as_ptr() as *const c_void,
            message.len(),
        );
    }
}
