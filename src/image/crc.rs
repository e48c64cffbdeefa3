//! CRC framing of firmware fragments
//!
//! The bootloader expects a 256-byte header in front of the application:
//!
//! ```text
//! +--------------+--------------+--------------+-----+--------------+
//! | length: i64  | crc32: i64   | crc32: i64   | ... | crc32: i64   |
//! +--------------+--------------+--------------+-----+--------------+
//! ```
//!
//! Every field is little endian. The first crc32 slot is the one the bootloader checks, the rest
//! pad the header to its fixed size.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use thiserror::Error;

use crate::Error;

/// The size of the frame header in bytes, regardless of the payload size
pub const FRAME_HEADER_LEN: usize = 256;

/// The number of crc32 slots in the header
const CRC_SLOTS: usize = (FRAME_HEADER_LEN - 8) / 8;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("The input is {} bytes, which is too short for a frame header", _0)]
    TruncatedHeader(usize),
    #[error("The redundant crc32 slot {} holds {:#x}, expected {:#x}", slot, found, expected)]
    InconsistentHeader {
        slot: usize,
        found: i64,
        expected: i64,
    },
    #[error("The header describes {} bytes of payload, but {} bytes follow it", expected, found)]
    LengthMismatch { expected: i64, found: usize },
    #[error("The payload crc32 is {:#010x}, expected {:#010x}", found, expected)]
    ChecksumMismatch { expected: u32, found: u32 },
    #[error("I/O error: {}", _0)]
    IoError(#[from] io::Error),
}

/// Calculates the crc32 checksum for the given slice of `bytes`
///
/// This is the reflected IEEE 802.3 crc32 with the polynomial 0xEDB88320, an initial value of
/// 0xFFFFFFFF and a final xor of 0xFFFFFFFF.
pub fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// The length and checksum header prepended to a firmware fragment
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CrcFrame {
    /// The length of the payload in bytes
    pub length: i64,
    /// The crc32 of the payload, zero-extended to 64 bits
    pub crc32: i64,
}

impl CrcFrame {
    /// Computes the frame header for the given `payload`
    pub fn for_payload(payload: &[u8]) -> CrcFrame {
        CrcFrame {
            length: payload.len() as i64,
            crc32: i64::from(crc32(payload)),
        }
    }

    /// Reads and validates a frame header from the given `reader`
    pub fn from_reader<R: ReadBytesExt>(reader: &mut R) -> Result<CrcFrame, FrameError> {
        let length = reader.read_i64::<LittleEndian>()?;
        let crc32 = reader.read_i64::<LittleEndian>()?;

        for slot in 1..CRC_SLOTS {
            let found = reader.read_i64::<LittleEndian>()?;

            if found != crc32 {
                return Err(FrameError::InconsistentHeader {
                    slot,
                    found,
                    expected: crc32,
                });
            }
        }

        Ok(CrcFrame { length, crc32 })
    }

    /// Writes the full 256-byte header to the given `writer`
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), FrameError> {
        writer.write_i64::<LittleEndian>(self.length)?;

        for _ in 0..CRC_SLOTS {
            writer.write_i64::<LittleEndian>(self.crc32)?;
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        let (length, slots) = buf.split_at_mut(8);

        LittleEndian::write_i64(length, self.length);
        LittleEndian::write_i64_into(&[self.crc32; CRC_SLOTS], slots);

        buf
    }

    /// Checks that `payload` is the payload this header describes
    pub fn verify(&self, payload: &[u8]) -> Result<(), FrameError> {
        if self.length != payload.len() as i64 {
            return Err(FrameError::LengthMismatch {
                expected: self.length,
                found: payload.len(),
            });
        }

        let found = crc32(payload);

        if i64::from(found) != self.crc32 {
            return Err(FrameError::ChecksumMismatch {
                expected: self.crc32 as u32,
                found,
            });
        }

        Ok(())
    }
}

/// Returns the header followed by `payload`
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());

    buf.extend_from_slice(&CrcFrame::for_payload(payload).to_bytes());
    buf.extend_from_slice(payload);

    buf
}

/// Prepends a frame header to the file at `path`, overwriting the file
///
/// This must happen exactly once per build - framing an already framed file adds a second header.
pub fn frame_file<P: AsRef<Path>>(path: P) -> Result<CrcFrame, Error> {
    let path = path.as_ref();
    let payload = fs::read(path)?;
    let header = CrcFrame::for_payload(&payload);

    debug!(
        "Framing {} with length {} and crc32 {:#010x}",
        path.display(),
        header.length,
        header.crc32
    );

    fs::write(path, frame(&payload))?;

    Ok(header)
}

/// Reads a framed file at `path` and checks its header against its payload
pub fn verify_file<P: AsRef<Path>>(path: P) -> Result<CrcFrame, Error> {
    let bytes = fs::read(path)?;

    if bytes.len() < FRAME_HEADER_LEN {
        return Err(FrameError::TruncatedHeader(bytes.len()).into());
    }

    let (mut head, payload) = bytes.split_at(FRAME_HEADER_LEN);
    let header = CrcFrame::from_reader(&mut head)?;

    header.verify(payload)?;

    Ok(header)
}

/// Reads a header from `reader` without checking it against any payload
pub fn read_header<R: Read>(mut reader: R) -> Result<CrcFrame, FrameError> {
    CrcFrame::from_reader(&mut reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_hex::*;
    use hex_literal::hex;
    use std::io::Cursor;

    #[test]
    fn it_should_use_the_reflected_ieee_crc32() {
        assert_eq_hex!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq_hex!(crc32(&[]), 0);
    }

    #[test]
    fn it_should_frame_a_ten_byte_payload() {
        let payload = [0xAAu8; 10];
        let framed = frame(&payload);
        let expected_crc = crc32(&payload);

        assert_eq!(framed.len(), 266);
        assert_eq_hex!(&framed[0..8], &hex!("0A 00 00 00 00 00 00 00"));
        assert_eq_hex!(&framed[8..16], &i64::from(expected_crc).to_le_bytes());
        assert_eq_hex!(&framed[FRAME_HEADER_LEN..], &payload);
    }

    #[test]
    fn it_should_repeat_the_crc_to_fill_the_header() {
        let framed = frame(b"firmware");
        let crc = &framed[8..16];

        for slot in framed[8..FRAME_HEADER_LEN].chunks(8) {
            assert_eq_hex!(slot, crc);
        }
    }

    #[test]
    fn it_should_always_produce_a_256_byte_header() {
        for len in &[0usize, 1, 255, 256, 4096] {
            let payload = vec![0x5Au8; *len];

            assert_eq!(frame(&payload).len(), FRAME_HEADER_LEN + len);
        }
    }

    #[test]
    fn it_should_serialise_the_header_like_the_writer() {
        let header = CrcFrame::for_payload(b"firmware");
        let mut written = Vec::new();
        header.write_to(&mut written).unwrap();

        assert_eq_hex!(&header.to_bytes()[..], &written[..]);
    }

    #[test]
    fn it_should_read_back_a_header() {
        let framed = frame(b"firmware");
        let header = read_header(Cursor::new(&framed)).unwrap();

        assert_eq!(header, CrcFrame::for_payload(b"firmware"));
        header.verify(&framed[FRAME_HEADER_LEN..]).unwrap();
    }

    #[test]
    fn it_should_reject_inconsistent_headers() {
        let mut framed = frame(b"firmware");
        framed[100] ^= 0xFF;

        assert!(matches!(
            read_header(Cursor::new(&framed)),
            Err(FrameError::InconsistentHeader { slot: 11, .. })
        ));
    }

    #[test]
    fn it_should_reject_a_corrupted_payload() {
        let framed = frame(b"firmware");
        let header = read_header(Cursor::new(&framed)).unwrap();

        assert!(matches!(
            header.verify(b"firmwarf"),
            Err(FrameError::ChecksumMismatch { .. })
        ));
        assert!(matches!(
            header.verify(b"firm"),
            Err(FrameError::LengthMismatch { expected: 8, found: 4 })
        ));
    }

    #[test]
    fn it_should_frame_a_file_in_place() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("02_m3_fw_flash.bin");
        fs::write(&path, [0xAAu8; 10]).unwrap();

        let header = frame_file(&path).unwrap();

        assert_eq!(header.length, 10);
        assert_eq!(fs::metadata(&path).unwrap().len(), 266);
        assert_eq!(verify_file(&path).unwrap(), header);
    }

    #[test]
    fn it_should_reject_truncated_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("short.bin");
        fs::write(&path, [0u8; 16]).unwrap();

        assert!(matches!(
            verify_file(&path),
            Err(Error::FrameError(FrameError::TruncatedHeader(16)))
        ));
    }
}
