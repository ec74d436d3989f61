use std::collections::HashMap;

use anyhow::Result;
use log::debug;

use crate::error::DebuggerError;
use crate::host::Host;
use crate::types::{Tid, VirtAddr};

/// One-byte trap instruction (x86 INT3).
pub const TRAP_INSTRUCTION: u8 = 0xcc;

pub const HW_SLOTS: usize = 4;

/// One active breakpoint. Software breakpoints keep the instruction byte the
/// trap replaced; hardware breakpoints keep their debug-register slot.
#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub id: i32,
    pub addr: VirtAddr,
    pub function_name: Option<String>,
    pub file: Option<String>,
    pub line: Option<u64>,
    pub original_byte: u8,
    pub hw_slot: Option<usize>,
    pub temp: bool,
}

impl Breakpoint {
    pub fn is_hardware(&self) -> bool {
        self.hw_slot.is_some()
    }
}

/// Source coordinates captured when a breakpoint is installed.
#[derive(Debug, Clone, Default)]
pub struct SourceLocation {
    pub function_name: Option<String>,
    pub file: Option<String>,
    pub line: Option<u64>,
}

/// The process-wide breakpoint set: four hardware slots plus a software map
/// keyed by address. IDs come from a monotonic counter and are never reused
/// within a session.
pub struct BreakpointTable {
    hw: [Option<Breakpoint>; 4],
    sw: HashMap<VirtAddr, Breakpoint>,
    id_counter: i32,
}

impl BreakpointTable {
    pub fn new() -> Self {
        BreakpointTable {
            hw: [None, None, None, None],
            sw: HashMap::new(),
            id_counter: 0,
        }
    }

    pub fn hw_slots(&self) -> &[Option<Breakpoint>; 4] {
        &self.hw
    }

    pub fn software(&self) -> impl Iterator<Item = &Breakpoint> {
        self.sw.values()
    }

    pub fn is_empty(&self) -> bool {
        self.sw.is_empty() && self.hw.iter().all(|slot| slot.is_none())
    }

    /// Any breakpoint, hardware or software, installed at `addr`.
    pub fn at_address(&self, addr: VirtAddr) -> Option<&Breakpoint> {
        self.hardware_at(addr).or_else(|| self.software_at(addr))
    }

    pub fn hardware_at(&self, addr: VirtAddr) -> Option<&Breakpoint> {
        self.hw
            .iter()
            .flatten()
            .find(|bp| bp.addr == addr)
    }

    pub fn software_at(&self, addr: VirtAddr) -> Option<&Breakpoint> {
        self.sw.get(&addr)
    }

    pub fn by_id(&self, id: i32) -> Option<&Breakpoint> {
        self.hw
            .iter()
            .flatten()
            .chain(self.sw.values())
            .find(|bp| bp.id == id)
    }

    fn free_hw_slot(&self) -> Option<usize> {
        self.hw.iter().position(|slot| slot.is_none())
    }

    /// Install a breakpoint at `addr` through `tid`. A free debug-register
    /// slot is preferred on hosts that have them; otherwise a trap byte is
    /// written after stashing the original instruction byte.
    pub fn set(
        &mut self,
        host: &mut dyn Host,
        tid: Tid,
        addr: VirtAddr,
        temp: bool,
        location: SourceLocation,
    ) -> Result<i32> {
        if self.at_address(addr).is_some() {
            return Err(DebuggerError::BreakpointExists(addr).into());
        }

        if host.supports_hardware_breakpoints() {
            if let Some(slot) = self.free_hw_slot() {
                host.set_hardware_breakpoint(tid, slot, addr)?;
                self.id_counter += 1;
                let id = self.id_counter;
                debug!("hardware breakpoint {id} set at {addr:#x} (slot {slot})");
                self.hw[slot] = Some(Breakpoint {
                    id,
                    addr,
                    function_name: location.function_name,
                    file: location.file,
                    line: location.line,
                    original_byte: 0,
                    hw_slot: Some(slot),
                    temp,
                });
                return Ok(id);
            }
        }

        self.install_software(host, tid, addr, temp, location)
    }

    /// Install a software trap at `addr` even when a debug-register slot is
    /// free. A trap byte stops whichever kernel thread reaches the address;
    /// a debug register only arms the one thread it is written to.
    pub fn set_software(
        &mut self,
        host: &mut dyn Host,
        tid: Tid,
        addr: VirtAddr,
        temp: bool,
        location: SourceLocation,
    ) -> Result<i32> {
        if self.at_address(addr).is_some() {
            return Err(DebuggerError::BreakpointExists(addr).into());
        }
        self.install_software(host, tid, addr, temp, location)
    }

    fn install_software(
        &mut self,
        host: &mut dyn Host,
        tid: Tid,
        addr: VirtAddr,
        temp: bool,
        location: SourceLocation,
    ) -> Result<i32> {
        let original = host.read_memory(tid, addr, 1)?;
        host.write_memory(tid, addr, &[TRAP_INSTRUCTION])?;
        self.id_counter += 1;
        let id = self.id_counter;
        debug!("software breakpoint {id} set at {addr:#x}");
        self.sw.insert(
            addr,
            Breakpoint {
                id,
                addr,
                function_name: location.function_name,
                file: location.file,
                line: location.line,
                original_byte: original[0],
                hw_slot: None,
                temp,
            },
        );
        Ok(id)
    }

    /// Remove the breakpoint at `addr`, restoring the original byte or
    /// freeing the debug-register slot. Used hardware slots stay a prefix of
    /// 0..3: breakpoints above a freed slot shift down. Returns the removed
    /// record.
    pub fn clear(&mut self, host: &mut dyn Host, tid: Tid, addr: VirtAddr) -> Result<Breakpoint> {
        for slot in 0..HW_SLOTS {
            if self.hw[slot].as_ref().map(|bp| bp.addr) == Some(addr) {
                host.clear_hardware_breakpoint(tid, slot)?;
                let removed = self.hw[slot].take().unwrap();
                for upper in slot + 1..HW_SLOTS {
                    let Some(mut bp) = self.hw[upper].take() else {
                        break;
                    };
                    host.clear_hardware_breakpoint(tid, upper)?;
                    host.set_hardware_breakpoint(tid, upper - 1, bp.addr)?;
                    bp.hw_slot = Some(upper - 1);
                    self.hw[upper - 1] = Some(bp);
                }
                return Ok(removed);
            }
        }

        if let Some(bp) = self.sw.remove(&addr) {
            host.write_memory(tid, addr, &[bp.original_byte])?;
            return Ok(bp);
        }

        Err(DebuggerError::NoSuchBreakpoint(addr).into())
    }

    /// Restore the original byte at a software breakpoint and take its
    /// record out of the table, so the original instruction can be stepped.
    pub fn disable_software(
        &mut self,
        host: &mut dyn Host,
        tid: Tid,
        addr: VirtAddr,
    ) -> Result<Breakpoint> {
        let bp = self
            .sw
            .remove(&addr)
            .ok_or(DebuggerError::NoSuchBreakpoint(addr))?;
        host.write_memory(tid, addr, &[bp.original_byte])?;
        Ok(bp)
    }

    /// Put a disabled software breakpoint back: rewrite the trap byte and
    /// reinsert the same record, keeping its ID and temp flag.
    pub fn rearm_software(&mut self, host: &mut dyn Host, tid: Tid, bp: Breakpoint) -> Result<()> {
        host.write_memory(tid, bp.addr, &[TRAP_INSTRUCTION])?;
        self.sw.insert(bp.addr, bp);
        Ok(())
    }

    /// Addresses of every temporary breakpoint, hardware or software.
    pub fn temp_addresses(&self) -> Vec<VirtAddr> {
        self.hw
            .iter()
            .flatten()
            .chain(self.sw.values())
            .filter(|bp| bp.temp)
            .map(|bp| bp.addr)
            .collect()
    }
}

impl Default for BreakpointTable {
    fn default() -> Self {
        Self::new()
    }
}
