#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};

use godbg::host::{Host, HostEvent, Registers, SectionNames, WaitScope};
use godbg::process::DebuggedProcess;
use godbg::symbols::{
    DwarfData, Fde, FrameTable, Function, Image, LineRow, LineTable, Loader, SymbolTable,
    SymbolicContext, TableParsers,
};
use godbg::types::{Tid, VirtAddr};

pub const MOCK_PID: Tid = 1000;

/// Byte returned for target memory no test bothered to seed.
const FILLER_BYTE: u8 = 0x90;

static MOCK_SECTIONS: SectionNames = SectionNames {
    frame: ".debug_frame",
    line: ".debug_line",
    symtab: ".gosymtab",
    pclntab: ".gopclntab",
    text: ".text",
};

pub struct ScriptedEvent {
    pub tid: Tid,
    pub event: HostEvent,
    /// Applied to the thread's registers when the event is delivered, the
    /// way a real stop publishes the stop PC.
    pub set_pc: Option<u64>,
}

#[derive(Default)]
pub struct MockState {
    pub threads: Vec<Tid>,
    pub memory: HashMap<u64, u8>,
    pub registers: HashMap<Tid, Registers>,
    pub events: VecDeque<ScriptedEvent>,
    pub hw_supported: bool,
    pub report_clones: bool,
    pub hw_slots: [Option<u64>; 4],
    pub blocked: HashSet<Tid>,
    pub esrch: HashSet<Tid>,
    pub fail_single_step: bool,
    pub cont_count: HashMap<Tid, usize>,
    pub step_count: HashMap<Tid, usize>,
    pub halt_count: HashMap<Tid, usize>,
    pub attached: Vec<(Tid, bool)>,
    pub pc_writes: Vec<(Tid, u64)>,
    pub mem_writes: Vec<(u64, Vec<u8>)>,
}

/// In-memory backend with a scripted event queue. Clones share state, so a
/// test can keep a handle while the process owns the boxed host.
#[derive(Clone)]
pub struct MockHost {
    state: Arc<Mutex<MockState>>,
}

impl MockHost {
    pub fn new(threads: &[Tid]) -> Self {
        let mut state = MockState {
            threads: threads.to_vec(),
            report_clones: true,
            ..MockState::default()
        };
        for &tid in threads {
            state.registers.insert(tid, Registers::zeroed());
        }
        MockHost {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn push_event(&self, tid: Tid, event: HostEvent, set_pc: Option<u64>) {
        self.state().events.push_back(ScriptedEvent { tid, event, set_pc });
    }

    pub fn set_regs(&self, tid: Tid, pc: u64, sp: u64) {
        let mut regs = Registers::zeroed();
        regs.set_pc(VirtAddr(pc));
        regs.data.rsp = sp;
        self.state().registers.insert(tid, regs);
    }

    pub fn seed_bytes(&self, addr: u64, bytes: &[u8]) {
        let mut state = self.state();
        for (i, &b) in bytes.iter().enumerate() {
            state.memory.insert(addr + i as u64, b);
        }
    }

    pub fn byte_at(&self, addr: u64) -> u8 {
        self.state()
            .memory
            .get(&addr)
            .copied()
            .unwrap_or(FILLER_BYTE)
    }

    pub fn pc_of(&self, tid: Tid) -> u64 {
        self.state().registers.get(&tid).map(|r| r.pc().0).unwrap_or(0)
    }

    pub fn cont_count(&self, tid: Tid) -> usize {
        self.state().cont_count.get(&tid).copied().unwrap_or(0)
    }

    pub fn step_count(&self, tid: Tid) -> usize {
        self.state().step_count.get(&tid).copied().unwrap_or(0)
    }

    pub fn halt_count(&self, tid: Tid) -> usize {
        self.state().halt_count.get(&tid).copied().unwrap_or(0)
    }
}

impl Host for MockHost {
    fn pid(&self) -> Tid {
        MOCK_PID
    }

    fn detach(&mut self) -> Result<()> {
        Ok(())
    }

    fn executable_path(&self) -> Result<PathBuf> {
        Ok(PathBuf::from("/tmp/mock-target"))
    }

    fn section_names(&self) -> &'static SectionNames {
        &MOCK_SECTIONS
    }

    fn reports_clone_events(&self) -> bool {
        self.state().report_clones
    }

    fn supports_hardware_breakpoints(&self) -> bool {
        self.state().hw_supported
    }

    fn enumerate_threads(&self) -> Result<Vec<Tid>> {
        Ok(self.state().threads.clone())
    }

    fn attach_thread(&mut self, tid: Tid, attach: bool) -> Result<()> {
        let mut state = self.state();
        state.attached.push((tid, attach));
        if !state.threads.contains(&tid) {
            state.threads.push(tid);
        }
        state.registers.entry(tid).or_insert_with(Registers::zeroed);
        Ok(())
    }

    fn wait_event(&mut self, _scope: WaitScope) -> Result<(Tid, HostEvent)> {
        let mut state = self.state();
        let scripted = state
            .events
            .pop_front()
            .ok_or_else(|| anyhow!("wait_event called with no scripted events left"))?;
        if let Some(pc) = scripted.set_pc {
            let regs = state
                .registers
                .entry(scripted.tid)
                .or_insert_with(Registers::zeroed);
            regs.set_pc(VirtAddr(pc));
        }
        Ok((scripted.tid, scripted.event))
    }

    fn cont(&mut self, tid: Tid) -> Result<()> {
        *self.state().cont_count.entry(tid).or_default() += 1;
        Ok(())
    }

    fn single_step(&mut self, tid: Tid) -> Result<()> {
        let mut state = self.state();
        if state.fail_single_step {
            bail!("single step refused");
        }
        *state.step_count.entry(tid).or_default() += 1;
        Ok(())
    }

    fn halt(&self, tid: Tid) -> Result<()> {
        *self.state().halt_count.entry(tid).or_default() += 1;
        Ok(())
    }

    fn thread_blocked(&self, tid: Tid) -> bool {
        self.state().blocked.contains(&tid)
    }

    fn read_registers(&self, tid: Tid) -> Result<Registers> {
        let state = self.state();
        if state.esrch.contains(&tid) {
            return Err(anyhow::Error::new(nix::errno::Errno::ESRCH));
        }
        Ok(state
            .registers
            .get(&tid)
            .copied()
            .unwrap_or_else(Registers::zeroed))
    }

    fn write_registers(&self, tid: Tid, regs: &Registers) -> Result<()> {
        let mut state = self.state();
        state.pc_writes.push((tid, regs.pc().0));
        state.registers.insert(tid, *regs);
        Ok(())
    }

    fn read_memory(&self, _tid: Tid, addr: VirtAddr, len: usize) -> Result<Vec<u8>> {
        let state = self.state();
        Ok((0..len)
            .map(|i| {
                state
                    .memory
                    .get(&(addr.0 + i as u64))
                    .copied()
                    .unwrap_or(FILLER_BYTE)
            })
            .collect())
    }

    fn write_memory(&self, _tid: Tid, addr: VirtAddr, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        state.mem_writes.push((addr.0, data.to_vec()));
        for (i, &b) in data.iter().enumerate() {
            state.memory.insert(addr.0 + i as u64, b);
        }
        Ok(())
    }

    fn set_hardware_breakpoint(&mut self, _tid: Tid, slot: usize, addr: VirtAddr) -> Result<()> {
        self.state().hw_slots[slot] = Some(addr.0);
        Ok(())
    }

    fn clear_hardware_breakpoint(&mut self, _tid: Tid, slot: usize) -> Result<()> {
        self.state().hw_slots[slot] = None;
        Ok(())
    }
}

pub struct MockFde {
    pub begin: u64,
    pub end: u64,
    pub ret_offset: i64,
}

impl Fde for MockFde {
    fn end(&self) -> VirtAddr {
        VirtAddr(self.end)
    }

    fn return_address_offset(&self, _pc: VirtAddr) -> i64 {
        self.ret_offset
    }
}

pub struct MockFrameTable {
    pub fdes: Vec<MockFde>,
}

impl FrameTable for MockFrameTable {
    fn fde_for_pc(&self, pc: VirtAddr) -> Option<&dyn Fde> {
        self.fdes
            .iter()
            .find(|fde| pc.0 >= fde.begin && pc.0 < fde.end)
            .map(|fde| fde as &dyn Fde)
    }
}

/// Line rows sorted by address.
pub struct MockLineTable {
    pub rows: Vec<LineRow>,
}

impl LineTable for MockLineTable {
    fn location_for_pc(&self, pc: VirtAddr) -> Option<LineRow> {
        self.rows.iter().rev().find(|row| row.address <= pc).cloned()
    }

    fn location_for_file_line(&self, file: &str, line: u64) -> Option<LineRow> {
        self.rows
            .iter()
            .find(|row| row.file == file && row.line == line)
            .cloned()
    }

    fn next_location(&self, addr: VirtAddr) -> Option<LineRow> {
        self.rows.iter().find(|row| row.address > addr).cloned()
    }
}

pub struct MockSymbolTable {
    /// (name, entry, end)
    pub funcs: Vec<(String, u64, u64)>,
    /// (file, line, pc)
    pub lines: Vec<(String, u64, u64)>,
}

impl SymbolTable for MockSymbolTable {
    fn line_to_pc(&self, file: &str, line: u64) -> Result<VirtAddr> {
        self.lines
            .iter()
            .find(|(f, l, _)| f.as_str() == file && *l == line)
            .map(|&(_, _, pc)| VirtAddr(pc))
            .ok_or_else(|| anyhow!("no code at {file}:{line}"))
    }

    fn lookup_func(&self, name: &str) -> Option<Function> {
        self.funcs
            .iter()
            .find(|(n, _, _)| n.as_str() == name)
            .map(|(n, entry, _)| Function {
                name: n.clone(),
                entry: VirtAddr(*entry),
            })
    }

    fn pc_to_func(&self, pc: VirtAddr) -> Option<Function> {
        self.funcs
            .iter()
            .find(|&&(_, entry, end)| pc.0 >= entry && pc.0 < end)
            .map(|(n, entry, _)| Function {
                name: n.clone(),
                entry: VirtAddr(*entry),
            })
    }

    fn pc_to_line(&self, pc: VirtAddr) -> Option<(String, u64)> {
        self.lines
            .iter()
            .find(|&&(_, _, p)| p == pc.0)
            .map(|(f, l, _)| (f.clone(), *l))
    }
}

fn row(file: &str, line: u64, address: u64, delta: i64) -> LineRow {
    LineRow {
        file: file.to_string(),
        line,
        address: VirtAddr(address),
        delta,
    }
}

/// Standard target image shared by most tests:
///
///   main.main            0x400e00..0x400f80 (call site returns to 0x400f00)
///   main.foo             0x401000..0x401150
///   runtime.breakpoint   0x402000..0x402010
///
/// main.foo's lines: 9 @ 0x401000, 10 @ 0x401100 (plus a synthetic row at
/// 0x401108), 11 @ 0x401110; the row at 0x401150 is past the function end.
pub fn standard_context() -> SymbolicContext {
    let frames = MockFrameTable {
        fdes: vec![
            MockFde {
                begin: 0x400e00,
                end: 0x400f80,
                ret_offset: 16,
            },
            MockFde {
                begin: 0x401000,
                end: 0x401150,
                ret_offset: 16,
            },
            MockFde {
                begin: 0x402000,
                end: 0x402010,
                ret_offset: 16,
            },
        ],
    };

    let lines = MockLineTable {
        rows: vec![
            row("/src/main.go", 5, 0x400e00, 0),
            row("/src/main.go", 6, 0x400f00, 0),
            row("/src/main.go", 9, 0x401000, 0),
            row("/src/main.go", 10, 0x401100, 0),
            row("/src/main.go", 10, 0x401108, -1),
            row("/src/main.go", 11, 0x401110, 0),
            row("/src/main.go", 12, 0x401150, 0),
        ],
    };

    let symbols = MockSymbolTable {
        funcs: vec![
            ("main.main".to_string(), 0x400e00, 0x400f80),
            ("main.foo".to_string(), 0x401000, 0x401150),
            ("runtime.breakpoint".to_string(), 0x402000, 0x402010),
        ],
        lines: vec![
            ("/src/main.go".to_string(), 9, 0x401000),
            ("/src/main.go".to_string(), 10, 0x401100),
            ("/src/main.go".to_string(), 11, 0x401110),
        ],
    };

    let mut dwarf_sections = HashMap::new();
    dwarf_sections.insert("info".to_string(), vec![0x01, 0x02]);

    SymbolicContext {
        frames: Box::new(frames),
        lines: Box::new(lines),
        symbols: Box::new(symbols),
        dwarf: DwarfData::new(dwarf_sections),
    }
}

pub struct Session {
    pub process: DebuggedProcess,
    pub host: MockHost,
}

/// A stopped session over the standard image, `main.foo`'s entry byte
/// seeded, software breakpoints only.
pub fn session(threads: &[Tid]) -> Session {
    session_with(threads, false)
}

pub fn session_with(threads: &[Tid], hw_supported: bool) -> Session {
    let host = MockHost::new(threads);
    host.state().hw_supported = hw_supported;
    host.seed_bytes(0x401000, &[0x55]);
    host.seed_bytes(0x401100, &[0x48]);
    host.seed_bytes(0x401110, &[0x8b]);
    host.seed_bytes(0x400f00, &[0x89]);

    let process = DebuggedProcess::with_context(Box::new(host.clone()), standard_context())
        .expect("mock session should assemble");
    Session { process, host }
}

// Loader-side mocks for symbolic-context loading tests.

pub struct MockImage {
    pub sections: HashMap<String, Vec<u8>>,
}

impl Image for MockImage {
    fn section(&self, name: &str) -> Option<Vec<u8>> {
        self.sections.get(name).cloned()
    }

    fn text_base(&self) -> VirtAddr {
        VirtAddr(0x400000)
    }

    fn dwarf(&self) -> Result<DwarfData> {
        let mut sections = HashMap::new();
        sections.insert("info".to_string(), vec![0x01, 0x02]);
        Ok(DwarfData::new(sections))
    }
}

pub struct MockLoader {
    pub sections: HashMap<String, Vec<u8>>,
}

impl Loader for MockLoader {
    fn open(&self, _path: &Path) -> Result<Box<dyn Image>> {
        Ok(Box::new(MockImage {
            sections: self.sections.clone(),
        }))
    }
}

/// Parsers that verify they were handed the loader's bytes and return the
/// standard tables.
pub struct MockParsers;

impl TableParsers for MockParsers {
    fn parse_frame_table(&self, data: &[u8]) -> Result<Box<dyn FrameTable>> {
        if data != b"frame-bytes" {
            bail!("unexpected frame section contents");
        }
        Ok(Box::new(MockFrameTable { fdes: Vec::new() }))
    }

    fn parse_line_table(&self, data: &[u8]) -> Result<Box<dyn LineTable>> {
        if data != b"line-bytes" {
            bail!("unexpected line section contents");
        }
        Ok(Box::new(MockLineTable { rows: Vec::new() }))
    }

    fn parse_symbol_table(
        &self,
        _symtab: &[u8],
        pclntab: &[u8],
        text_base: VirtAddr,
    ) -> Result<Box<dyn SymbolTable>> {
        if pclntab != b"pcln-bytes" {
            bail!("unexpected pclntab section contents");
        }
        if text_base != VirtAddr(0x400000) {
            bail!("unexpected text base");
        }
        Ok(Box::new(MockSymbolTable {
            funcs: Vec::new(),
            lines: Vec::new(),
        }))
    }
}

pub fn loader_sections() -> HashMap<String, Vec<u8>> {
    let mut sections = HashMap::new();
    sections.insert(".debug_frame".to_string(), b"frame-bytes".to_vec());
    sections.insert(".debug_line".to_string(), b"line-bytes".to_vec());
    sections.insert(".gopclntab".to_string(), b"pcln-bytes".to_vec());
    sections.insert(".gosymtab".to_string(), Vec::new());
    sections.insert(".text".to_string(), Vec::new());
    sections
}
