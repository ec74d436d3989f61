use std::collections::HashMap;
use std::path::Path;
use std::thread;

use anyhow::{anyhow, Context, Result};

use crate::host::SectionNames;
use crate::types::VirtAddr;

/// A loaded executable image. Produced by a [`Loader`]; consumed once while
/// the symbolic context is built.
pub trait Image: Send + Sync {
    /// Raw bytes of a named section, or `None` if the image has no such
    /// section.
    fn section(&self, name: &str) -> Option<Vec<u8>>;

    /// Load address of the text segment.
    fn text_base(&self) -> VirtAddr;

    /// The image's DWARF sections, keyed by canonical short name ("info",
    /// "abbrev", "line", "str", "frame").
    fn dwarf(&self) -> Result<DwarfData>;
}

pub trait Loader {
    fn open(&self, path: &Path) -> Result<Box<dyn Image>>;
}

/// Frame description entry for one function: its PC range end and where the
/// return address lives relative to SP.
pub trait Fde {
    fn end(&self) -> VirtAddr;
    fn return_address_offset(&self, pc: VirtAddr) -> i64;
}

pub trait FrameTable: Send + Sync {
    fn fde_for_pc(&self, pc: VirtAddr) -> Option<&dyn Fde>;
}

/// One row of the line table. A negative `delta` marks a synthetic row the
/// resolver produced for a prologue or epilogue marker.
#[derive(Debug, Clone, PartialEq)]
pub struct LineRow {
    pub file: String,
    pub line: u64,
    pub address: VirtAddr,
    pub delta: i64,
}

pub trait LineTable: Send + Sync {
    fn location_for_pc(&self, pc: VirtAddr) -> Option<LineRow>;
    fn location_for_file_line(&self, file: &str, line: u64) -> Option<LineRow>;
    fn next_location(&self, addr: VirtAddr) -> Option<LineRow>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub entry: VirtAddr,
}

pub trait SymbolTable: Send + Sync {
    fn line_to_pc(&self, file: &str, line: u64) -> Result<VirtAddr>;
    fn lookup_func(&self, name: &str) -> Option<Function>;
    fn pc_to_func(&self, pc: VirtAddr) -> Option<Function>;
    fn pc_to_line(&self, pc: VirtAddr) -> Option<(String, u64)>;
}

/// Builders for the three tables, applied to the section byte blobs the
/// loader extracts. Implementations must be callable from scoped worker
/// threads.
pub trait TableParsers: Sync {
    fn parse_frame_table(&self, data: &[u8]) -> Result<Box<dyn FrameTable>>;
    fn parse_line_table(&self, data: &[u8]) -> Result<Box<dyn LineTable>>;
    fn parse_symbol_table(
        &self,
        symtab: &[u8],
        pclntab: &[u8],
        text_base: VirtAddr,
    ) -> Result<Box<dyn SymbolTable>>;
}

/// The tables the engine navigates by, parsed once after attach and
/// immutable afterwards.
pub struct SymbolicContext {
    pub frames: Box<dyn FrameTable>,
    pub lines: Box<dyn LineTable>,
    pub symbols: Box<dyn SymbolTable>,
    pub dwarf: DwarfData,
}

impl std::fmt::Debug for SymbolicContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolicContext")
            .field("dwarf", &self.dwarf)
            .finish_non_exhaustive()
    }
}

impl SymbolicContext {
    /// Open the executable and parse the frame, line and symbol tables, one
    /// worker per table, joined before returning. Missing debug sections are
    /// fatal: a session cannot proceed without them.
    pub fn load(
        loader: &dyn Loader,
        parsers: &dyn TableParsers,
        path: &Path,
        names: &SectionNames,
    ) -> Result<Self> {
        let image = loader.open(path)?;
        let dwarf = image.dwarf()?;

        let frame_data = image
            .section(names.frame)
            .ok_or_else(|| anyhow!("could not find {} section in binary", names.frame))?;
        let line_data = image
            .section(names.line)
            .ok_or_else(|| anyhow!("could not find {} section in binary", names.line))?;
        // The symbol table sections may be empty in some link modes; the
        // pclntab carries enough on its own.
        let symtab = image.section(names.symtab).unwrap_or_default();
        let pclntab = image
            .section(names.pclntab)
            .ok_or_else(|| anyhow!("could not find {} section in binary", names.pclntab))?;
        let text_base = image.text_base();

        let (frames, lines, symbols) = thread::scope(|s| {
            let frames = s.spawn(|| parsers.parse_frame_table(&frame_data));
            let lines = s.spawn(|| parsers.parse_line_table(&line_data));
            let symbols = s.spawn(|| parsers.parse_symbol_table(&symtab, &pclntab, text_base));
            (
                frames.join().expect("frame table parser panicked"),
                lines.join().expect("line table parser panicked"),
                symbols.join().expect("symbol table parser panicked"),
            )
        });

        Ok(SymbolicContext {
            frames: frames.context("could not parse frame table")?,
            lines: lines.context("could not parse line table")?,
            symbols: symbols.context("could not parse symbol table")?,
            dwarf,
        })
    }
}

/// Raw DWARF section bytes, kept for consumers that walk the debug info
/// themselves (variable evaluation lives outside this crate).
#[derive(Debug, Clone, Default)]
pub struct DwarfData {
    sections: HashMap<String, Vec<u8>>,
}

impl DwarfData {
    pub fn new(sections: HashMap<String, Vec<u8>>) -> Self {
        DwarfData { sections }
    }

    pub fn section(&self, name: &str) -> Option<&[u8]> {
        self.sections.get(name).map(|s| s.as_slice())
    }

    /// Cursor over one DWARF section, starting at offset zero.
    pub fn reader(&self, name: &str) -> Option<DwarfReader<'_>> {
        self.section(name).map(DwarfReader::new)
    }
}

/// Byte cursor with the primitive reads DWARF consumers need.
pub struct DwarfReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DwarfReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        DwarfReader { data, pos: 0 }
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, offset: usize) {
        self.pos = offset;
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.data.len() {
            return Err(anyhow!("read past end of dwarf data"));
        }
        let byte = self.data[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes([self.read_u8()?, self.read_u8()?]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        for b in &mut buf {
            *b = self.read_u8()?;
        }
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        for b in &mut buf {
            *b = self.read_u8()?;
        }
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_uleb128(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        Ok(result)
    }

    pub fn read_sleb128(&mut self) -> Result<i64> {
        let mut result: i64 = 0;
        let mut shift = 0;
        let mut byte;
        loop {
            byte = self.read_u8()?;
            result |= i64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }
        if shift < 64 && byte & 0x40 != 0 {
            result |= -1i64 << shift;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uleb128_multi_byte() {
        let mut reader = DwarfReader::new(&[0xe5, 0x8e, 0x26]);
        assert_eq!(reader.read_uleb128().unwrap(), 624485);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn sleb128_negative() {
        let mut reader = DwarfReader::new(&[0x7f]);
        assert_eq!(reader.read_sleb128().unwrap(), -1);
        let mut reader = DwarfReader::new(&[0x9b, 0xf1, 0x59]);
        assert_eq!(reader.read_sleb128().unwrap(), -624485);
    }

    #[test]
    fn read_past_end_errors() {
        let mut reader = DwarfReader::new(&[0x01]);
        assert_eq!(reader.read_u8().unwrap(), 1);
        assert!(reader.read_u16().is_err());
    }
}
