//! Linker map file parsing
//!
//! Only the lines that describe a region or an output section are of interest here. Both the
//! memory configuration table and the linker memory map use the same shape:
//!
//! ```text
//! FLASH            0x01000000         0x00080000         xr
//! .text           0x01000100     0x1000
//! .dspBlock       0x20000000     0x2000 load address 0x01050000
//! ```

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use log::{debug, trace};
use thiserror::Error;

use crate::Error;

/// Mask that turns an absolute address into an offset within its memory
pub const OFFSET_MASK: u32 = 0x00FF_FFFF;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Malformed region on line {}: {:?}", line, contents)]
    MalformedRegion { line: usize, contents: String },
    #[error("I/O error: {}", _0)]
    IoError(#[from] io::Error),
}

/// A named region or section with its start address and length
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    /// The name as it appears in the map file, e.g. `FLASH` or `.text`
    pub name: String,
    /// The start (virtual) address
    pub start_address: u32,
    /// The length in bytes
    pub length: u32,
    /// The load address, when the section is loaded from somewhere else than where it runs
    pub load_address: Option<u32>,
}

impl MemoryRegion {
    /// Returns the `{0, 0}` region used to represent a section that is not in the map file
    pub fn absent<S: Into<String>>(name: S) -> MemoryRegion {
        MemoryRegion {
            name: name.into(),
            start_address: 0,
            length: 0,
            load_address: None,
        }
    }

    /// Returns false if this is the absent `{0, 0}` region
    pub fn is_present(&self) -> bool {
        self.start_address != 0 || self.length != 0
    }

    /// The top byte of the start address
    pub fn location_tag(&self) -> u8 {
        (self.start_address >> 24) as u8
    }

    /// Returns true if the region lives in RAM, which is signified by a non-zero top nibble
    pub fn is_ram(&self) -> bool {
        self.location_tag() & 0xF0 != 0
    }

    /// The start address with the location tag masked off
    pub fn offset(&self) -> u32 {
        self.start_address & OFFSET_MASK
    }

    /// The load memory address - the load address if there is one, the start address otherwise
    pub fn lma(&self) -> u32 {
        self.load_address.unwrap_or(self.start_address)
    }
}

/// The line that starts the section listing, after the discarded input sections
const MEMORY_MAP_HEADER: &str = "Linker script and memory map";

/// A linker map file, kept as lines so that sections can be looked up by name
#[derive(Debug, Clone, Default)]
pub struct MapFile {
    lines: Vec<String>,
}

impl MapFile {
    /// Reads the map file at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<MapFile, ParseError> {
        let file = File::open(path)?;

        MapFile::from_reader(BufReader::new(file))
    }

    /// Reads a map file from the given `reader`
    pub fn from_reader<R: BufRead>(reader: R) -> Result<MapFile, ParseError> {
        let lines = reader.lines().collect::<Result<Vec<_>, _>>()?;

        Ok(MapFile { lines })
    }

    /// Returns the first region or output section called `name`, or `None` if there is none
    ///
    /// Regions and output sections start at the first column. Only the first occurrence is
    /// honored; later lines with the same name are ignored.
    pub fn find(&self, name: &str) -> Result<Option<MemoryRegion>, ParseError> {
        self.find_at(name, 0, 0)
    }

    /// Returns the first input section called `name`, e.g. the ` .dsp` line inside `.dspBlock`
    ///
    /// Input sections are indented by a single space. The ones listed under `Discarded input
    /// sections` are skipped when the map has a memory map header.
    pub fn find_input(&self, name: &str) -> Result<Option<MemoryRegion>, ParseError> {
        let memory_map = self
            .lines
            .iter()
            .position(|line| line.starts_with(MEMORY_MAP_HEADER))
            .unwrap_or(0);

        self.find_at(name, 1, memory_map)
    }

    fn find_at(
        &self,
        name: &str,
        column: usize,
        first_line: usize,
    ) -> Result<Option<MemoryRegion>, ParseError> {
        for (index, line) in self.lines.iter().enumerate().skip(first_line) {
            if leading_whitespace(line) != column {
                continue;
            }

            let mut tokens = line.split_whitespace();

            if tokens.next() != Some(name) {
                continue;
            }

            let mut fields: Vec<&str> = tokens.collect();

            // Long section names make the linker wrap the address and length onto the next line
            if fields.is_empty() {
                match self.lines.get(index + 1) {
                    Some(next) => fields = next.split_whitespace().collect(),
                    None => continue,
                }
            }

            if !fields.first().map_or(false, |field| is_hex_literal(field)) {
                continue;
            }

            let region = parse_fields(name, &fields).ok_or_else(|| ParseError::MalformedRegion {
                line: index + 1,
                contents: line.clone(),
            })?;

            debug!(
                "Found {} at {:#010x} with length {:#x} on line {}",
                name,
                region.start_address,
                region.length,
                index + 1
            );

            return Ok(Some(region));
        }

        trace!("No {} region in map file", name);

        Ok(None)
    }

    /// Returns the first region called `name`, or the absent `{0, 0}` region
    pub fn region(&self, name: &str) -> Result<MemoryRegion, ParseError> {
        Ok(self
            .find(name)?
            .unwrap_or_else(|| MemoryRegion::absent(name)))
    }

    /// Returns the `.reset` section, falling back to `.text`
    ///
    /// Returns `Error::NoEntryPoint` if neither is present.
    pub fn entry_point(&self) -> Result<MemoryRegion, Error> {
        for name in &[".reset", ".text"] {
            if let Some(region) = self.find(name)? {
                return Ok(region);
            }
        }

        Err(Error::NoEntryPoint)
    }
}

fn leading_whitespace(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn is_hex_literal(token: &str) -> bool {
    token.starts_with("0x") || token.starts_with("0X")
}

/// Parses a `0x`-prefixed hex number
pub(crate) fn parse_hex(token: &str) -> Option<u32> {
    if !is_hex_literal(token) {
        return None;
    }

    u32::from_str_radix(&token[2..], 16).ok()
}

fn parse_fields(name: &str, fields: &[&str]) -> Option<MemoryRegion> {
    let start_address = parse_hex(fields.get(0)?)?;
    let length = parse_hex(fields.get(1)?)?;

    let load_address = match (fields.get(2), fields.get(3)) {
        (Some(&"load"), Some(&"address")) => Some(parse_hex(fields.get(4)?)?),
        _ => None,
    };

    Some(MemoryRegion {
        name: name.to_string(),
        start_address,
        length,
        load_address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const MAP: &str = "\
Memory Configuration

Name             Origin             Length             Attributes
FLASH            0x01000000         0x00080000         xr
RAM              0x10000000         0x00040000         xrw
SHM              0x10040000         0x00001000         rw
*default*        0x00000000         0xffffffff

Linker script and memory map

.text           0x01000100     0x1000
 *(.text*)
 .text          0x01000100      0x200 build/main.o
.dspBlock       0x20000000     0x2000 load address 0x01050000
.a_rather_long_section_name
                0x01060000      0x100
.text           0x01070000      0x400
.broken         0x0100zz00      0x100
";

    fn map() -> MapFile {
        MapFile::from_reader(Cursor::new(MAP)).unwrap()
    }

    #[test]
    fn it_should_find_memory_configuration_regions() {
        let flash = map().find("FLASH").unwrap().unwrap();

        assert_eq!(flash.start_address, 0x0100_0000);
        assert_eq!(flash.length, 0x0008_0000);
        assert_eq!(flash.load_address, None);
        assert!(!flash.is_ram());
    }

    #[test]
    fn it_should_honor_the_first_match_only() {
        let text = map().find(".text").unwrap().unwrap();

        assert_eq!(text.start_address, 0x0100_0100);
        assert_eq!(text.length, 0x1000);
    }

    #[test]
    fn it_should_return_none_for_absent_sections() {
        assert_eq!(map().find("DSP").unwrap(), None);
        assert_eq!(map().find("PBUF").unwrap(), None);
    }

    #[test]
    fn it_should_return_an_absent_sentinel_region() {
        let pbuf = map().region("PBUF").unwrap();

        assert_eq!(pbuf, MemoryRegion::absent("PBUF"));
        assert!(!pbuf.is_present());
    }

    #[test]
    fn it_should_parse_load_addresses() {
        let dsp = map().find(".dspBlock").unwrap().unwrap();

        assert_eq!(dsp.start_address, 0x2000_0000);
        assert_eq!(dsp.load_address, Some(0x0105_0000));
        assert_eq!(dsp.lma(), 0x0105_0000);
        assert!(dsp.is_ram());
        assert_eq!(dsp.location_tag(), 0x20);
        assert_eq!(dsp.offset(), 0);
    }

    #[test]
    fn it_should_parse_wrapped_section_lines() {
        let region = map().find(".a_rather_long_section_name").unwrap().unwrap();

        assert_eq!(region.start_address, 0x0106_0000);
        assert_eq!(region.length, 0x100);
    }

    #[test]
    fn it_should_reject_malformed_hex() {
        match map().find(".broken") {
            Err(ParseError::MalformedRegion { line, .. }) => assert_eq!(line, 18),
            other => panic!("expected a malformed region error, got {:?}", other),
        }
    }

    #[test]
    fn it_should_prefer_reset_over_text() {
        let with_reset = format!("{}.reset          0x10000000      0x40\n", MAP);
        let map = MapFile::from_reader(Cursor::new(with_reset)).unwrap();

        assert_eq!(map.entry_point().unwrap().name, ".reset");
    }

    #[test]
    fn it_should_skip_discarded_input_sections() {
        let map = MapFile::from_reader(Cursor::new(
            "\
Discarded input sections

 .text          0x00000000        0x0 /toolchain/crti.o
 .dsp           0x00000000        0x0 /toolchain/crti.o

Linker script and memory map

.text           0x01000100      0x100
.dspBlock       0x01000200       0x40
 .dsp           0x01000200       0x40 build/dsp.o
",
        ))
        .unwrap();

        let text = map.find(".text").unwrap().unwrap();
        assert_eq!(text.start_address, 0x0100_0100);
        assert_eq!(text.length, 0x100);

        let dsp = map.find_input(".dsp").unwrap().unwrap();
        assert_eq!(dsp.start_address, 0x0100_0200);
        assert_eq!(dsp.length, 0x40);
        assert_eq!(map.find(".dsp").unwrap(), None);
    }

    #[test]
    fn it_should_find_input_sections_at_the_second_column() {
        let text = map().find_input(".text").unwrap().unwrap();

        assert_eq!(text.start_address, 0x0100_0100);
        assert_eq!(text.length, 0x200);
    }

    #[test]
    fn it_should_fail_without_an_entry_point() {
        let map = MapFile::from_reader(Cursor::new("FLASH 0x01000000 0x1000\n")).unwrap();

        assert!(matches!(map.entry_point(), Err(Error::NoEntryPoint)));
    }
}
