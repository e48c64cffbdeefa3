//! The partition table read by the bootloader
//!
//! The table is six little-endian `u32`s: the start and length of the M3 application, the DSP
//! image and the shared buffer. A `{0, 0}` pair means the region is absent.

use std::fmt;
use std::io::{self, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;

use crate::map::{MapFile, MemoryRegion};
use crate::Error;

/// The size of the partition table in bytes
pub const PARTITION_TABLE_LEN: usize = 24;

/// A single `(start, length)` slot in the partition table
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct PartitionEntry {
    pub start_address: u32,
    pub length: u32,
}

impl PartitionEntry {
    /// Returns false for the `{0, 0}` entry of an absent region
    pub fn is_present(&self) -> bool {
        self.start_address != 0 || self.length != 0
    }
}

impl From<&MemoryRegion> for PartitionEntry {
    fn from(region: &MemoryRegion) -> PartitionEntry {
        PartitionEntry {
            start_address: region.start_address,
            length: region.length,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct PartitionTable {
    /// The M3 application
    pub m3: PartitionEntry,
    /// The DSP image
    pub dsp: PartitionEntry,
    /// The buffer shared between the M3 and the DSP
    pub pbuf: PartitionEntry,
}

impl PartitionTable {
    /// Builds the partition table from the regions in a linker map file
    ///
    /// An application linked to RAM gets the RAM and SHM regions, anything else gets the whole
    /// FLASH region. Returns `Error::NoEntryPoint` if the map has neither `.reset` nor `.text`.
    pub fn from_map(map: &MapFile) -> Result<PartitionTable, Error> {
        let flash = map.region("FLASH")?;
        let ram = map.region("RAM")?;
        let shm = map.region("SHM")?;
        let dsp = map.region("DSP")?;
        let pbuf = map.region("PBUF")?;
        let entry = map.entry_point()?;

        let m3 = if entry.is_ram() {
            debug!(
                "{} is at {:#010x} in RAM, using the RAM and SHM regions",
                entry.name, entry.start_address
            );

            PartitionEntry {
                start_address: ram.start_address,
                length: ram.length.checked_add(shm.length).ok_or(Error::LengthOverflow {
                    ram: ram.length,
                    shm: shm.length,
                })?,
            }
        } else {
            debug!(
                "{} is at {:#010x} in flash, using the FLASH region",
                entry.name, entry.start_address
            );

            PartitionEntry::from(&flash)
        };

        Ok(PartitionTable {
            m3,
            dsp: PartitionEntry::from(&dsp),
            pbuf: PartitionEntry::from(&pbuf),
        })
    }

    pub fn from_reader<R: ReadBytesExt>(reader: &mut R) -> io::Result<PartitionTable> {
        let mut entry = || -> io::Result<PartitionEntry> {
            Ok(PartitionEntry {
                start_address: reader.read_u32::<LittleEndian>()?,
                length: reader.read_u32::<LittleEndian>()?,
            })
        };

        let m3 = entry()?;
        let dsp = entry()?;
        let pbuf = entry()?;

        Ok(PartitionTable { m3, dsp, pbuf })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        for entry in &[self.m3, self.dsp, self.pbuf] {
            writer.write_u32::<LittleEndian>(entry.start_address)?;
            writer.write_u32::<LittleEndian>(entry.length)?;
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; PARTITION_TABLE_LEN] {
        let mut buf = [0u8; PARTITION_TABLE_LEN];

        LittleEndian::write_u32_into(
            &[
                self.m3.start_address,
                self.m3.length,
                self.dsp.start_address,
                self.dsp.length,
                self.pbuf.start_address,
                self.pbuf.length,
            ],
            &mut buf,
        );

        buf
    }
}

impl fmt::Display for PartitionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Partition Table")?;
        writeln!(f, "   m3_start : {:#x}", self.m3.start_address)?;
        writeln!(f, "  m3_length : {:#x}", self.m3.length)?;
        writeln!(f, "  dsp_start : {:#x}", self.dsp.start_address)?;
        writeln!(f, " dsp_length : {:#x}", self.dsp.length)?;
        writeln!(f, " pbuf_start : {:#x}", self.pbuf.start_address)?;
        write!(f, "pbuf_length : {:#x}", self.pbuf.length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_hex::*;
    use hex_literal::hex;
    use std::io::Cursor;

    const FLASH_MAP: &str = "\
FLASH            0x01000000         0x00080000         xr
RAM              0x10000000         0x00040000         xrw
.text           0x01000100     0x1000
";

    const RAM_MAP: &str = "\
FLASH            0x01000000         0x00080000         xr
RAM              0x10000000         0x00040000         xrw
SHM              0x10040000         0x00001000         rw
DSP              0x01060000         0x00010000         xr
PBUF             0x01070000         0x00002000         r
.reset          0x10000000       0x40
.text           0x10000040     0x1000
";

    fn table(map: &str) -> PartitionTable {
        PartitionTable::from_map(&MapFile::from_reader(Cursor::new(map)).unwrap()).unwrap()
    }

    #[test]
    fn it_should_use_the_flash_region_for_flash_builds() {
        let table = table(FLASH_MAP);

        assert_eq!(
            table.m3,
            PartitionEntry {
                start_address: 0x0100_0000,
                length: 0x0008_0000
            }
        );
        assert!(!table.dsp.is_present());
        assert!(!table.pbuf.is_present());
    }

    #[test]
    fn it_should_use_ram_and_shm_for_ram_builds() {
        let table = table(RAM_MAP);

        assert_eq!(table.m3.start_address, 0x1000_0000);
        assert_eq!(table.m3.length, 0x0004_1000);
        assert_eq!(table.dsp.start_address, 0x0106_0000);
        assert_eq!(table.dsp.length, 0x0001_0000);
        assert_eq!(table.pbuf.length, 0x2000);
    }

    #[test]
    fn it_should_write_24_little_endian_bytes() {
        assert_eq_hex!(
            &table(FLASH_MAP).to_bytes()[..],
            &hex!("00 00 00 01 00 00 08 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00")[..]
        );

        let mut buf = Vec::new();
        table(RAM_MAP).write_to(&mut buf).unwrap();

        assert_eq!(buf.len(), PARTITION_TABLE_LEN);
        assert_eq_hex!(&buf[..], &table(RAM_MAP).to_bytes()[..]);
    }

    #[test]
    fn it_should_read_back_a_table() {
        let bytes = table(RAM_MAP).to_bytes();
        let read = PartitionTable::from_reader(&mut Cursor::new(&bytes[..])).unwrap();

        assert_eq!(read, table(RAM_MAP));
    }

    #[test]
    fn it_should_reject_ram_and_shm_lengths_that_overflow() {
        let map = MapFile::from_reader(Cursor::new(
            "\
RAM              0x10000000         0xFFFFF000         xrw
SHM              0x10040000         0x00001000         rw
.reset          0x10000000       0x40
",
        ))
        .unwrap();

        assert!(matches!(
            PartitionTable::from_map(&map),
            Err(Error::LengthOverflow { ram: 0xFFFF_F000, shm: 0x1000 })
        ));
    }

    #[test]
    fn it_should_require_an_entry_point() {
        let map = MapFile::from_reader(Cursor::new("FLASH 0x01000000 0x00080000\n")).unwrap();

        assert!(matches!(
            PartitionTable::from_map(&map),
            Err(Error::NoEntryPoint)
        ));
    }
}
