use std::ffi::CStr;
use std::mem;
use std::path::PathBuf;
use std::ptr;

use anyhow::{bail, Context, Result};
use mach2::exception_types::{
    exception_mask_t, EXCEPTION_DEFAULT, EXC_MASK_BREAKPOINT, EXC_MASK_SOFTWARE,
};
use mach2::kern_return::{kern_return_t, KERN_SUCCESS};
use mach2::mach_port::{mach_port_allocate, mach_port_insert_right, mach_port_move_member};
use mach2::mach_types::{task_t, thread_act_t};
use mach2::message::{
    mach_msg, mach_msg_body_t, mach_msg_header_t, mach_msg_port_descriptor_t, mach_msg_type_number_t,
    MACH_MSG_TIMEOUT_NONE, MACH_MSG_TYPE_MAKE_SEND, MACH_MSG_TYPE_MAKE_SEND_ONCE,
    MACH_MSG_TYPE_MOVE_SEND_ONCE, MACH_RCV_INTERRUPTED, MACH_RCV_MSG, MACH_SEND_MSG,
};
use mach2::port::{
    mach_port_t, MACH_PORT_NULL, MACH_PORT_RIGHT_PORT_SET, MACH_PORT_RIGHT_RECEIVE,
};
use mach2::structs::x86_thread_state64_t;
use mach2::task::{task_resume, task_threads};
use mach2::thread_act::{thread_resume, thread_suspend};
use mach2::thread_status::{thread_state_flavor_t, x86_THREAD_STATE64, THREAD_STATE_NONE};
use mach2::traps::{mach_task_self, task_for_pid};
use mach2::vm::{mach_vm_deallocate, mach_vm_protect, mach_vm_read_overwrite, mach_vm_write};
use mach2::vm_prot::{VM_PROT_COPY, VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

use crate::host::{Host, HostEvent, Registers, SectionNames, WaitScope};
use crate::types::{Tid, VirtAddr};

static MACHO_SECTIONS: SectionNames = SectionNames {
    frame: "__debug_frame",
    line: "__debug_line",
    symtab: "__gosymtab",
    pclntab: "__gopclntab",
    text: "__text",
};

const MACH_NOTIFY_DEAD_NAME: i32 = 72;
const TH_STATE_WAITING: i32 = 3;
const THREAD_BASIC_INFO: u32 = 3;
const TRACE_FLAG: u64 = 0x100;

#[repr(C)]
struct ThreadBasicInfo {
    user_time: [i32; 2],
    system_time: [i32; 2],
    cpu_usage: i32,
    policy: i32,
    run_state: i32,
    flags: i32,
    suspend_count: i32,
    sleep_time: i32,
}

extern "C" {
    fn task_set_exception_ports(
        task: task_t,
        exception_mask: exception_mask_t,
        new_port: mach_port_t,
        behavior: u32,
        new_flavor: thread_state_flavor_t,
    ) -> kern_return_t;

    fn mach_port_request_notification(
        task: task_t,
        name: mach_port_t,
        msgid: i32,
        sync: mach_port_t,
        notify: mach_port_t,
        notify_poly: u32,
        previous: *mut mach_port_t,
    ) -> kern_return_t;

    fn thread_info(
        thread: thread_act_t,
        flavor: u32,
        info: *mut i32,
        count: *mut mach_msg_type_number_t,
    ) -> kern_return_t;

    fn thread_get_state(
        thread: thread_act_t,
        flavor: thread_state_flavor_t,
        state: *mut u32,
        count: *mut mach_msg_type_number_t,
    ) -> kern_return_t;

    fn thread_set_state(
        thread: thread_act_t,
        flavor: thread_state_flavor_t,
        state: *const u32,
        count: mach_msg_type_number_t,
    ) -> kern_return_t;
}

/// Receive buffer for an exception-raise message. Only the thread port
/// descriptor is consumed; the NDR record and codes stay in the tail.
#[repr(C)]
struct ExceptionMessage {
    header: mach_msg_header_t,
    body: mach_msg_body_t,
    thread: mach_msg_port_descriptor_t,
    task: mach_msg_port_descriptor_t,
    tail: [u8; 128],
}

#[repr(C)]
struct ExceptionReply {
    header: mach_msg_header_t,
    ndr: [u8; 8],
    ret_code: kern_return_t,
}

pub struct MachHost {
    pid: Tid,
    task: task_t,
    port_set: mach_port_t,
    exception_port: mach_port_t,
    notification_port: mach_port_t,
}

fn check(kr: kern_return_t, what: &str) -> Result<()> {
    if kr != KERN_SUCCESS {
        bail!("{what}: kern_return {kr}");
    }
    Ok(())
}

impl MachHost {
    /// Acquire the target's task port and wire up the exception and
    /// dead-name notification ports into one port set. Ports are acquired
    /// exactly once, here.
    pub fn attach(pid: Tid) -> Result<Self> {
        if pid == 0 {
            bail!("invalid pid");
        }
        let me = unsafe { mach_task_self() };

        let mut task: task_t = 0;
        check(
            unsafe { task_for_pid(me, pid, &mut task) },
            "could not acquire mach task",
        )?;

        let mut exception_port: mach_port_t = 0;
        let mut notification_port: mach_port_t = 0;
        let mut port_set: mach_port_t = 0;
        unsafe {
            check(
                mach_port_allocate(me, MACH_PORT_RIGHT_RECEIVE, &mut exception_port),
                "could not allocate exception port",
            )?;
            check(
                mach_port_insert_right(
                    me,
                    exception_port,
                    exception_port,
                    MACH_MSG_TYPE_MAKE_SEND,
                ),
                "could not insert send right",
            )?;
            check(
                task_set_exception_ports(
                    task,
                    EXC_MASK_BREAKPOINT | EXC_MASK_SOFTWARE,
                    exception_port,
                    EXCEPTION_DEFAULT,
                    THREAD_STATE_NONE,
                ),
                "could not set exception ports",
            )?;

            check(
                mach_port_allocate(me, MACH_PORT_RIGHT_RECEIVE, &mut notification_port),
                "could not allocate notification port",
            )?;
            let mut previous: mach_port_t = MACH_PORT_NULL;
            check(
                mach_port_request_notification(
                    me,
                    task,
                    MACH_NOTIFY_DEAD_NAME,
                    0,
                    notification_port,
                    MACH_MSG_TYPE_MAKE_SEND_ONCE,
                    &mut previous,
                ),
                "could not request dead-name notification",
            )?;

            check(
                mach_port_allocate(me, MACH_PORT_RIGHT_PORT_SET, &mut port_set),
                "could not allocate port set",
            )?;
            check(
                mach_port_move_member(me, exception_port, port_set),
                "could not add exception port to set",
            )?;
            check(
                mach_port_move_member(me, notification_port, port_set),
                "could not add notification port to set",
            )?;
        }

        Ok(MachHost {
            pid,
            task,
            port_set,
            exception_port,
            notification_port,
        })
    }

    pub fn launch(argv: &[String]) -> Result<Self> {
        if argv.is_empty() {
            bail!("empty command line");
        }
        let args: Vec<std::ffi::CString> = argv
            .iter()
            .map(|a| std::ffi::CString::new(a.as_bytes()))
            .collect::<Result<_, _>>()?;

        let pid = unsafe { libc::fork() };
        match pid {
            -1 => bail!("fork failed"),
            0 => unsafe {
                libc::ptrace(libc::PT_TRACE_ME, 0, ptr::null_mut(), 0);
                let argp: Vec<*const libc::c_char> = args
                    .iter()
                    .map(|a| a.as_ptr())
                    .chain(std::iter::once(ptr::null()))
                    .collect();
                libc::execv(args[0].as_ptr(), argp.as_ptr());
                libc::_exit(1);
            },
            child => {
                let mut status = 0;
                if unsafe { libc::waitpid(child, &mut status, 0) } < 0 {
                    bail!("waiting for target execve failed");
                }
                Self::attach(child)
            }
        }
    }

    fn get_state(&self, tid: Tid) -> Result<x86_thread_state64_t> {
        let mut state: x86_thread_state64_t = unsafe { mem::zeroed() };
        let mut count =
            (mem::size_of::<x86_thread_state64_t>() / mem::size_of::<u32>()) as mach_msg_type_number_t;
        check(
            unsafe {
                thread_get_state(
                    tid as thread_act_t,
                    x86_THREAD_STATE64,
                    &mut state as *mut _ as *mut u32,
                    &mut count,
                )
            },
            "could not read thread state",
        )?;
        Ok(state)
    }

    fn set_state(&self, tid: Tid, state: &x86_thread_state64_t) -> Result<()> {
        let count =
            (mem::size_of::<x86_thread_state64_t>() / mem::size_of::<u32>()) as mach_msg_type_number_t;
        check(
            unsafe {
                thread_set_state(
                    tid as thread_act_t,
                    x86_THREAD_STATE64,
                    state as *const _ as *const u32,
                    count,
                )
            },
            "could not write thread state",
        )
    }

    fn resume_with_trace_flag(&self, tid: Tid, trace: bool) -> Result<()> {
        let mut state = self.get_state(tid)?;
        if trace {
            state.__rflags |= TRACE_FLAG;
        } else {
            state.__rflags &= !TRACE_FLAG;
        }
        self.set_state(tid, &state)?;
        check(
            unsafe { thread_resume(tid as thread_act_t) },
            "could not resume thread",
        )
    }

    /// Acknowledge an exception message so the kernel considers it handled.
    /// The excepting thread stays put because we suspend it first.
    fn reply_exception(&self, msg: &ExceptionMessage) -> Result<()> {
        let mut reply: ExceptionReply = unsafe { mem::zeroed() };
        reply.header.msgh_bits = MACH_MSG_TYPE_MOVE_SEND_ONCE;
        reply.header.msgh_size = mem::size_of::<ExceptionReply>() as u32;
        reply.header.msgh_remote_port = msg.header.msgh_remote_port;
        reply.header.msgh_local_port = MACH_PORT_NULL;
        reply.header.msgh_id = msg.header.msgh_id + 100;
        reply.ret_code = KERN_SUCCESS;

        let kr = unsafe {
            mach_msg(
                &mut reply.header,
                MACH_SEND_MSG,
                reply.header.msgh_size,
                0,
                MACH_PORT_NULL,
                MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            )
        };
        check(kr, "could not reply to exception")
    }
}

impl Host for MachHost {
    fn pid(&self) -> Tid {
        self.pid
    }

    fn detach(&mut self) -> Result<()> {
        unsafe {
            libc::ptrace(libc::PT_DETACH, self.pid, ptr::null_mut(), 0);
            task_resume(self.task);
        }
        Ok(())
    }

    fn executable_path(&self) -> Result<PathBuf> {
        let mut buf = vec![0u8; libc::PROC_PIDPATHINFO_MAXSIZE as usize];
        let len = unsafe {
            libc::proc_pidpath(self.pid, buf.as_mut_ptr() as *mut libc::c_void, buf.len() as u32)
        };
        if len <= 0 {
            bail!("could not find executable for {}", self.pid);
        }
        let cstr = unsafe { CStr::from_ptr(buf.as_ptr() as *const libc::c_char) };
        Ok(PathBuf::from(cstr.to_string_lossy().into_owned()))
    }

    fn section_names(&self) -> &'static SectionNames {
        &MACHO_SECTIONS
    }

    fn reports_clone_events(&self) -> bool {
        false
    }

    fn supports_hardware_breakpoints(&self) -> bool {
        false
    }

    fn enumerate_threads(&self) -> Result<Vec<Tid>> {
        let mut list: *mut thread_act_t = ptr::null_mut();
        let mut count: mach_msg_type_number_t = 0;
        check(
            unsafe { task_threads(self.task, &mut list, &mut count) },
            "could not get thread list",
        )?;
        let tids = unsafe {
            std::slice::from_raw_parts(list, count as usize)
                .iter()
                .map(|&port| port as Tid)
                .collect()
        };
        unsafe {
            mach_vm_deallocate(
                mach_task_self(),
                list as mach_vm_address_t,
                (count as usize * mem::size_of::<thread_act_t>()) as mach_vm_size_t,
            );
        }
        Ok(tids)
    }

    fn attach_thread(&mut self, _tid: Tid, _attach: bool) -> Result<()> {
        // Threads of a task are reachable through the task port already.
        Ok(())
    }

    fn wait_event(&mut self, scope: WaitScope) -> Result<(Tid, HostEvent)> {
        loop {
            let mut msg: ExceptionMessage = unsafe { mem::zeroed() };
            let kr = unsafe {
                mach_msg(
                    &mut msg.header,
                    MACH_RCV_MSG,
                    0,
                    mem::size_of::<ExceptionMessage>() as u32,
                    self.port_set,
                    MACH_MSG_TIMEOUT_NONE,
                    MACH_PORT_NULL,
                )
            };
            if kr == MACH_RCV_INTERRUPTED {
                return Ok((0, HostEvent::Interrupted));
            }
            check(kr, "error while waiting for task")?;

            if msg.header.msgh_local_port == self.notification_port {
                let mut status = 0;
                unsafe { libc::waitpid(self.pid, &mut status, 0) };
                let code = if libc::WIFEXITED(status) {
                    libc::WEXITSTATUS(status)
                } else {
                    128 + libc::WTERMSIG(status)
                };
                return Ok((self.pid, HostEvent::Exited(code)));
            }

            let tid = msg.thread.name as Tid;
            unsafe { thread_suspend(tid as thread_act_t) };
            self.reply_exception(&msg)?;

            if let WaitScope::Thread(want) = scope {
                if tid != want {
                    // Not the thread we are stepping; leave it suspended for
                    // the controller to pick up later.
                    continue;
                }
            }
            return Ok((tid, HostEvent::Trap));
        }
    }

    fn cont(&mut self, tid: Tid) -> Result<()> {
        self.resume_with_trace_flag(tid, false)
    }

    fn single_step(&mut self, tid: Tid) -> Result<()> {
        self.resume_with_trace_flag(tid, true)
    }

    fn halt(&self, tid: Tid) -> Result<()> {
        check(
            unsafe { thread_suspend(tid as thread_act_t) },
            "could not suspend thread",
        )
    }

    fn thread_blocked(&self, tid: Tid) -> bool {
        let mut info: ThreadBasicInfo = unsafe { mem::zeroed() };
        let mut count =
            (mem::size_of::<ThreadBasicInfo>() / mem::size_of::<i32>()) as mach_msg_type_number_t;
        let kr = unsafe {
            thread_info(
                tid as thread_act_t,
                THREAD_BASIC_INFO,
                &mut info as *mut _ as *mut i32,
                &mut count,
            )
        };
        kr == KERN_SUCCESS && info.run_state == TH_STATE_WAITING
    }

    fn read_registers(&self, tid: Tid) -> Result<Registers> {
        Ok(Registers {
            data: self.get_state(tid)?,
        })
    }

    fn write_registers(&self, tid: Tid, regs: &Registers) -> Result<()> {
        self.set_state(tid, &regs.data)
    }

    fn read_memory(&self, _tid: Tid, addr: VirtAddr, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut read: mach_vm_size_t = 0;
        check(
            unsafe {
                mach_vm_read_overwrite(
                    self.task,
                    addr.0,
                    len as mach_vm_size_t,
                    buf.as_mut_ptr() as mach_vm_address_t,
                    &mut read,
                )
            },
            "could not read memory",
        )?;
        buf.truncate(read as usize);
        Ok(buf)
    }

    fn write_memory(&self, _tid: Tid, addr: VirtAddr, data: &[u8]) -> Result<()> {
        unsafe {
            check(
                mach_vm_protect(
                    self.task,
                    addr.0,
                    data.len() as mach_vm_size_t,
                    0,
                    VM_PROT_READ | VM_PROT_WRITE | VM_PROT_COPY,
                ),
                "could not unprotect memory",
            )?;
            check(
                mach_vm_write(
                    self.task,
                    addr.0,
                    data.as_ptr() as usize as mach_vm_address_t,
                    data.len() as mach_msg_type_number_t,
                ),
                "could not write memory",
            )?;
            check(
                mach_vm_protect(
                    self.task,
                    addr.0,
                    data.len() as mach_vm_size_t,
                    0,
                    VM_PROT_READ | VM_PROT_EXECUTE,
                ),
                "could not reprotect memory",
            )?;
        }
        Ok(())
    }

    fn set_hardware_breakpoint(&mut self, _tid: Tid, _slot: usize, _addr: VirtAddr) -> Result<()> {
        bail!("hardware breakpoints are not supported on this host");
    }

    fn clear_hardware_breakpoint(&mut self, _tid: Tid, _slot: usize) -> Result<()> {
        bail!("hardware breakpoints are not supported on this host");
    }
}
