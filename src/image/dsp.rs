//! DSP firmware images
//!
//! A DSP image bundles the three memories of the DSP core behind a fixed header:
//!
//! ```text
//! [DspHeader: 28 bytes][name + NUL][pmem payload][xmem payload][ymem payload]
//! ```
//!
//! The memories come from per-class text dumps produced from the DSP ELF file, one
//! `<hex offset> <hex value>` pair per line.

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, trace};
use thiserror::Error;

use crate::Error;

/// The size of the DSP header in bytes
pub const DSP_HEADER_LEN: usize = 28;

/// The highest word offset a memory dump may contain
const MAX_DUMP_OFFSET: u64 = 0x00FF_FFFF;

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("Malformed line {}: {:?}", line, contents)]
    MalformedLine { line: usize, contents: String },
    #[error("The value {:#x} on line {} does not fit in {} bytes", value, line, width)]
    ValueTooWide { line: usize, value: u64, width: usize },
    #[error("The offset {:#x} on line {} is behind the previous offset {:#x}", offset, line, cursor)]
    OutOfOrder { line: usize, offset: u64, cursor: u64 },
    #[error("The offset {:#x} on line {} is outside the DSP address space", offset, line)]
    OffsetTooLarge { line: usize, offset: u64 },
    #[error("I/O error: {}", _0)]
    IoError(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("Missing firmware name in DspImageBuilder")]
    MissingName,
    #[error("The firmware name {:?} contains a NUL byte", _0)]
    InvalidName(String),
    #[error("Missing {} dump in DspImageBuilder", _0)]
    MissingDump(MemoryClass),
    #[error("The image does not fit in the 32-bit address space")]
    AddressOverflow,
}

/// The three memories of the DSP core
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MemoryClass {
    /// Program memory, 32-bit words
    Program,
    /// X data memory, dumped as bytes and read as 16-bit words
    XData,
    /// Y data memory, dumped as bytes and read as 16-bit words
    YData,
}

impl MemoryClass {
    /// The number of bytes written for every dump line
    pub fn word_width(self) -> usize {
        match self {
            MemoryClass::Program => 4,
            MemoryClass::XData | MemoryClass::YData => 1,
        }
    }

    /// The extension the dump has next to the ELF file
    pub fn extension(self) -> &'static str {
        match self {
            MemoryClass::Program => "PMEM",
            MemoryClass::XData => "XMEM",
            MemoryClass::YData => "YMEM",
        }
    }

    /// Program memory dumps start with a banner line
    fn has_banner(self) -> bool {
        self == MemoryClass::Program
    }
}

impl fmt::Display for MemoryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// The binary contents of one memory, with gaps zero-filled
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MemoryDump {
    class: MemoryClass,
    data: Vec<u8>,
}

impl MemoryDump {
    /// Reads the dump at `path`
    pub fn open<P: AsRef<Path>>(path: P, class: MemoryClass) -> Result<MemoryDump, DumpError> {
        let file = File::open(path)?;

        MemoryDump::from_reader(BufReader::new(file), class)
    }

    /// The contents of a dump that has no data lines
    ///
    /// Program memory gets a single zero word, data memories a single zero 16-bit word.
    pub fn empty(class: MemoryClass) -> MemoryDump {
        let data = match class {
            MemoryClass::Program => vec![0u8; 4],
            MemoryClass::XData | MemoryClass::YData => vec![0u8; 2],
        };

        MemoryDump { class, data }
    }

    /// Parses a text dump from the given `reader`
    pub fn from_reader<R: BufRead>(reader: R, class: MemoryClass) -> Result<MemoryDump, DumpError> {
        let width = class.word_width();
        let mut data: Vec<u8> = Vec::new();
        let mut cursor: u64 = 0;
        let mut written = false;

        let mut lines = reader.lines().enumerate();

        if class.has_banner() {
            if let Some((_, banner)) = lines.next() {
                let banner = banner?;
                trace!("Skipping {} banner {:?}", class, banner);
            }
        }

        for (index, line) in lines {
            let line = line?;
            let number = index + 1;

            if line.trim().is_empty() {
                continue;
            }

            let (offset, value) =
                parse_dump_line(&line).ok_or_else(|| DumpError::MalformedLine {
                    line: number,
                    contents: line.clone(),
                })?;

            if offset > MAX_DUMP_OFFSET {
                return Err(DumpError::OffsetTooLarge {
                    line: number,
                    offset,
                });
            }

            if offset < cursor {
                return Err(DumpError::OutOfOrder {
                    line: number,
                    offset,
                    cursor,
                });
            }

            if width < 8 && value >> (width * 8) != 0 {
                return Err(DumpError::ValueTooWide {
                    line: number,
                    value,
                    width,
                });
            }

            // Zero-fill the gap between the previous word and this one
            let gap = offset - cursor;

            if gap > 0 {
                trace!("Padding {} {}-byte words before {:#x}", gap, width, offset);
                data.resize(data.len() + gap as usize * width, 0);
            }

            data.write_uint::<LittleEndian>(value, width)?;
            cursor = offset + 1;
            written = true;
        }

        if !written {
            debug!("{} dump has no data, using an empty memory", class);

            return Ok(MemoryDump::empty(class));
        }

        // The data memories are read as 16-bit words
        if class != MemoryClass::Program && data.len() % 2 != 0 {
            data.push(0);
        }

        Ok(MemoryDump { class, data })
    }

    pub fn class(&self) -> MemoryClass {
        self.class
    }

    /// The memory contents as they are laid out in the image
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The length as stored in the header
    ///
    /// Program memory is counted in 32-bit words and the data memories in 16-bit words.
    pub fn length(&self) -> u32 {
        match self.class {
            MemoryClass::Program => (self.data.len() / 4) as u32,
            MemoryClass::XData | MemoryClass::YData => (self.data.len() / 2) as u32,
        }
    }
}

/// Parses a `<hex offset> <hex value>` line, ignoring `@` markers
fn parse_dump_line(line: &str) -> Option<(u64, u64)> {
    let mut tokens = line
        .split_whitespace()
        .map(|token| token.trim_matches('@'))
        .filter(|token| !token.is_empty());

    let offset = u64::from_str_radix(tokens.next()?, 16).ok()?;
    let value = u64::from_str_radix(tokens.next()?, 16).ok()?;

    Some((offset, value))
}

/// The 28-byte header at the start of every DSP image
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct DspHeader {
    /// The address of the NUL-terminated firmware name
    pub string_address: u32,
    /// The program memory length in 32-bit words
    pub pmem_length: u32,
    /// The X data memory length in 16-bit words
    pub xmem_length: u32,
    /// The Y data memory length in 16-bit words
    pub ymem_length: u32,
    /// The address of the program memory payload
    pub pmem_address: u32,
    /// The address of the X data memory payload
    pub xmem_address: u32,
    /// The address of the Y data memory payload
    pub ymem_address: u32,
}

impl DspHeader {
    pub fn from_reader<R: ReadBytesExt>(reader: &mut R) -> io::Result<DspHeader> {
        Ok(DspHeader {
            string_address: reader.read_u32::<LittleEndian>()?,
            pmem_length: reader.read_u32::<LittleEndian>()?,
            xmem_length: reader.read_u32::<LittleEndian>()?,
            ymem_length: reader.read_u32::<LittleEndian>()?,
            pmem_address: reader.read_u32::<LittleEndian>()?,
            xmem_address: reader.read_u32::<LittleEndian>()?,
            ymem_address: reader.read_u32::<LittleEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.string_address)?;
        writer.write_u32::<LittleEndian>(self.pmem_length)?;
        writer.write_u32::<LittleEndian>(self.xmem_length)?;
        writer.write_u32::<LittleEndian>(self.ymem_length)?;
        writer.write_u32::<LittleEndian>(self.pmem_address)?;
        writer.write_u32::<LittleEndian>(self.xmem_address)?;
        writer.write_u32::<LittleEndian>(self.ymem_address)?;

        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; DSP_HEADER_LEN] {
        let mut buf = [0u8; DSP_HEADER_LEN];

        LittleEndian::write_u32_into(
            &[
                self.string_address,
                self.pmem_length,
                self.xmem_length,
                self.ymem_length,
                self.pmem_address,
                self.xmem_address,
                self.ymem_address,
            ],
            &mut buf,
        );

        buf
    }

    /// Returns true if the addresses are still relative to the start of the image
    ///
    /// The name always directly follows the header, so an unrelocated header has its string
    /// address at offset 28.
    pub fn is_relative(&self) -> bool {
        self.string_address == DSP_HEADER_LEN as u32
    }

    /// Returns a copy with every address shifted by `base`, or `None` on overflow
    ///
    /// Lengths are left untouched.
    pub fn relocated(&self, base: u32) -> Option<DspHeader> {
        Some(DspHeader {
            string_address: self.string_address.checked_add(base)?,
            pmem_address: self.pmem_address.checked_add(base)?,
            xmem_address: self.xmem_address.checked_add(base)?,
            ymem_address: self.ymem_address.checked_add(base)?,
            ..*self
        })
    }
}

impl fmt::Display for DspHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  string_address : {:#010x}", self.string_address)?;
        writeln!(f, "    pmem_length : {:#x}", self.pmem_length)?;
        writeln!(f, "    xmem_length : {:#x}", self.xmem_length)?;
        writeln!(f, "    ymem_length : {:#x}", self.ymem_length)?;
        writeln!(f, "   pmem_address : {:#010x}", self.pmem_address)?;
        writeln!(f, "   xmem_address : {:#010x}", self.xmem_address)?;
        write!(f, "   ymem_address : {:#010x}", self.ymem_address)
    }
}

/// A complete DSP image
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DspImage {
    header: DspHeader,
    name: String,
    pmem: MemoryDump,
    xmem: MemoryDump,
    ymem: MemoryDump,
}

impl DspImage {
    pub fn builder() -> DspImageBuilder {
        DspImageBuilder::default()
    }

    pub fn header(&self) -> &DspHeader {
        &self.header
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes the header, the name and the three memories to the given `writer`
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.header.write_to(writer)?;
        writer.write_all(self.name.as_bytes())?;
        writer.write_all(&[0])?;
        writer.write_all(self.pmem.data())?;
        writer.write_all(self.xmem.data())?;
        writer.write_all(self.ymem.data())?;

        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::from(&self.header.to_bytes()[..]);

        buf.extend_from_slice(self.name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.pmem.data());
        buf.extend_from_slice(self.xmem.data());
        buf.extend_from_slice(self.ymem.data());

        buf
    }
}

#[derive(Debug, Default)]
pub struct DspImageBuilder {
    /// The firmware name stored after the header
    name: Option<String>,
    /// The address the image is linked at, zero for a standalone image
    base_address: Option<u32>,
    pmem: Option<MemoryDump>,
    xmem: Option<MemoryDump>,
    ymem: Option<MemoryDump>,
}

impl DspImageBuilder {
    /// Sets the firmware name to `name`
    pub fn name<S: Into<String>>(&mut self, name: S) -> &mut DspImageBuilder {
        self.name = Some(name.into());
        self
    }

    /// Sets the base address that the header addresses are relative to
    pub fn base_address(&mut self, base_address: u32) -> &mut DspImageBuilder {
        self.base_address = Some(base_address);
        self
    }

    /// Sets the dump for the memory class of `dump`
    pub fn memory(&mut self, dump: MemoryDump) -> &mut DspImageBuilder {
        match dump.class() {
            MemoryClass::Program => self.pmem = Some(dump),
            MemoryClass::XData => self.xmem = Some(dump),
            MemoryClass::YData => self.ymem = Some(dump),
        }

        self
    }

    /// Builds the final DspImage from this DspImageBuilder
    ///
    /// Returns the DspImage instance on success, a BuilderError otherwise
    pub fn build(&self) -> Result<DspImage, BuilderError> {
        let name = self.name.clone().ok_or(BuilderError::MissingName)?;

        if name.contains('\0') {
            return Err(BuilderError::InvalidName(name));
        }

        let pmem = self
            .pmem
            .clone()
            .ok_or(BuilderError::MissingDump(MemoryClass::Program))?;
        let xmem = self
            .xmem
            .clone()
            .ok_or(BuilderError::MissingDump(MemoryClass::XData))?;
        let ymem = self
            .ymem
            .clone()
            .ok_or(BuilderError::MissingDump(MemoryClass::YData))?;

        let base_address = self.base_address.unwrap_or(0);
        let header =
            layout(base_address, &name, &pmem, &xmem, &ymem).ok_or(BuilderError::AddressOverflow)?;

        debug!("Built DSP image {:?} with header {:?}", name, header);

        Ok(DspImage {
            header,
            name,
            pmem,
            xmem,
            ymem,
        })
    }
}

/// Computes the header for an image with the given parts placed after each other at `base`
fn layout(
    base: u32,
    name: &str,
    pmem: &MemoryDump,
    xmem: &MemoryDump,
    ymem: &MemoryDump,
) -> Option<DspHeader> {
    let string_address = base.checked_add(DSP_HEADER_LEN as u32)?;
    let pmem_address = string_address.checked_add(name.len() as u32 + 1)?;
    let xmem_address = pmem_address.checked_add(pmem.length().checked_mul(4)?)?;
    let ymem_address = xmem_address.checked_add(xmem.length().checked_mul(2)?)?;

    Some(DspHeader {
        string_address,
        pmem_length: pmem.length(),
        xmem_length: xmem.length(),
        ymem_length: ymem.length(),
        pmem_address,
        xmem_address,
        ymem_address,
    })
}

/// Returns the path of the `class` dump for the ELF file at `elf`, e.g. `dsp.elf.PMEM`
pub fn dump_path<P: AsRef<Path>>(elf: P, class: MemoryClass) -> PathBuf {
    let mut path = elf.as_ref().as_os_str().to_owned();

    path.push(".");
    path.push(class.extension());

    PathBuf::from(path)
}

/// Builds a standalone image from the three dumps next to the ELF file at `elf`
pub fn build_from_elf<P: AsRef<Path>>(
    elf: P,
    name: &str,
    base_address: u32,
) -> Result<DspImage, Error> {
    let mut builder = DspImage::builder();

    builder.name(name).base_address(base_address);

    for class in &[MemoryClass::Program, MemoryClass::XData, MemoryClass::YData] {
        let path = dump_path(&elf, *class);

        debug!("Reading {} dump {}", class, path.display());
        builder.memory(MemoryDump::open(&path, *class)?);
    }

    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_hex::*;
    use hex_literal::hex;
    use std::io::Cursor;

    const PMEM: &str = "\
PMEM dump of demo.elf
@0000 00001234
@0002 0000ABCD
";

    const XMEM: &str = "\
0001 aa
0002 bb
";

    fn dump(contents: &str, class: MemoryClass) -> MemoryDump {
        MemoryDump::from_reader(Cursor::new(contents), class).unwrap()
    }

    fn demo_image() -> DspImage {
        DspImage::builder()
            .name("demo")
            .memory(dump(PMEM, MemoryClass::Program))
            .memory(dump(XMEM, MemoryClass::XData))
            .memory(dump("", MemoryClass::YData))
            .build()
            .unwrap()
    }

    #[test]
    fn it_should_pad_program_memory_gaps_with_words() {
        let pmem = dump(PMEM, MemoryClass::Program);

        assert_eq_hex!(
            pmem.data(),
            &hex!("34 12 00 00 00 00 00 00 CD AB 00 00")[..]
        );
        assert_eq!(pmem.length(), 3);
    }

    #[test]
    fn it_should_pad_a_leading_offset() {
        let pmem = dump("banner\n0002 00000001\n", MemoryClass::Program);

        assert_eq_hex!(
            pmem.data(),
            &hex!("00 00 00 00 00 00 00 00 01 00 00 00")[..]
        );
    }

    #[test]
    fn it_should_reject_offsets_outside_the_address_space() {
        let result = MemoryDump::from_reader(Cursor::new("FFFFFFFFFFFFFFFF 12\n"), MemoryClass::XData);

        assert!(matches!(
            result,
            Err(DumpError::OffsetTooLarge { line: 1, offset: 0xFFFF_FFFF_FFFF_FFFF })
        ));

        let result = MemoryDump::from_reader(
            Cursor::new("banner\n0000 00000001\n1000000 00000002\n"),
            MemoryClass::Program,
        );

        assert!(matches!(
            result,
            Err(DumpError::OffsetTooLarge { line: 3, offset: 0x0100_0000 })
        ));
    }

    #[test]
    fn it_should_pad_data_memories_to_an_even_length() {
        let xmem = dump(XMEM, MemoryClass::XData);

        assert_eq_hex!(xmem.data(), &hex!("00 AA BB 00")[..]);
        assert_eq!(xmem.length(), 2);
    }

    #[test]
    fn it_should_fall_back_to_an_empty_memory() {
        assert_eq!(dump("", MemoryClass::Program), MemoryDump::empty(MemoryClass::Program));
        assert_eq!(dump("banner only\n", MemoryClass::Program).length(), 1);
        assert_eq!(dump("\n\n", MemoryClass::YData).data(), &[0u8, 0][..]);
        assert_eq!(dump("", MemoryClass::XData).length(), 1);
    }

    #[test]
    fn it_should_reject_malformed_lines() {
        let result = MemoryDump::from_reader(Cursor::new("0000 12\nnot a line\n"), MemoryClass::XData);

        assert!(matches!(
            result,
            Err(DumpError::MalformedLine { line: 2, .. })
        ));
    }

    #[test]
    fn it_should_reject_values_wider_than_the_memory() {
        let result = MemoryDump::from_reader(Cursor::new("0000 1234\n"), MemoryClass::XData);

        assert!(matches!(
            result,
            Err(DumpError::ValueTooWide { line: 1, value: 0x1234, width: 1 })
        ));
    }

    #[test]
    fn it_should_reject_offsets_going_backwards() {
        let result = MemoryDump::from_reader(Cursor::new("0004 12\n0002 34\n"), MemoryClass::YData);

        assert!(matches!(
            result,
            Err(DumpError::OutOfOrder { line: 2, offset: 2, cursor: 5 })
        ));
    }

    #[test]
    fn it_should_lay_out_the_header() {
        let image = demo_image();

        assert_eq!(
            *image.header(),
            DspHeader {
                string_address: 28,
                pmem_length: 3,
                xmem_length: 2,
                ymem_length: 1,
                pmem_address: 33,
                xmem_address: 45,
                ymem_address: 49,
            }
        );
        assert!(image.header().is_relative());
    }

    #[test]
    fn it_should_write_the_image() {
        let bytes = demo_image().to_bytes();

        assert_eq!(bytes.len(), 51);
        assert_eq_hex!(
            &bytes[..DSP_HEADER_LEN],
            &hex!("1C 00 00 00 03 00 00 00 02 00 00 00 01 00 00 00 21 00 00 00 2D 00 00 00 31 00 00 00")[..]
        );
        assert_eq!(&bytes[28..33], b"demo\0");
        assert_eq_hex!(&bytes[33..45], &hex!("34 12 00 00 00 00 00 00 CD AB 00 00")[..]);
        assert_eq_hex!(&bytes[45..], &hex!("00 AA BB 00 00 00")[..]);

        let mut written = Vec::new();
        demo_image().write_to(&mut written).unwrap();

        assert_eq_hex!(&written[..], &bytes[..]);
    }

    #[test]
    fn it_should_read_back_the_header() {
        let bytes = demo_image().to_bytes();
        let header = DspHeader::from_reader(&mut Cursor::new(&bytes)).unwrap();

        assert_eq!(header, *demo_image().header());
        assert_eq!(header.to_bytes()[..], bytes[..DSP_HEADER_LEN]);
    }

    #[test]
    fn it_should_offset_the_header_by_the_base_address() {
        let image = DspImage::builder()
            .name("demo")
            .base_address(0x0106_0000)
            .memory(dump(PMEM, MemoryClass::Program))
            .memory(dump(XMEM, MemoryClass::XData))
            .memory(dump("", MemoryClass::YData))
            .build()
            .unwrap();

        assert_eq!(image.header().string_address, 0x0106_001C);
        assert_eq!(image.header().ymem_address, 0x0106_0031);
        assert!(!image.header().is_relative());
    }

    #[test]
    fn it_should_require_every_memory() {
        let result = DspImage::builder()
            .name("demo")
            .memory(dump(PMEM, MemoryClass::Program))
            .build();

        assert!(matches!(
            result,
            Err(BuilderError::MissingDump(MemoryClass::XData))
        ));
    }

    #[test]
    fn it_should_read_dumps_next_to_the_elf_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let elf = dir.path().join("demo.elf");

        std::fs::write(dump_path(&elf, MemoryClass::Program), PMEM).unwrap();
        std::fs::write(dump_path(&elf, MemoryClass::XData), XMEM).unwrap();
        std::fs::write(dump_path(&elf, MemoryClass::YData), "").unwrap();

        let image = build_from_elf(&elf, "demo", 0).unwrap();

        assert_eq!(image, demo_image());
        assert_eq!(
            dump_path("build/demo.elf", MemoryClass::XData),
            PathBuf::from("build/demo.elf.XMEM")
        );
    }
}
