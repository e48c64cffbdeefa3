//! DSP header relocation
//!
//! A freshly built DSP image has every address in its header relative to the start of the image.
//! Once it's known where the image ends up, the header is patched so the addresses become
//! absolute. The payload is never touched.

use std::fs;
use std::path::Path;

use log::{debug, info};
use thiserror::Error;

use crate::image::dsp::{DspHeader, DSP_HEADER_LEN};
use crate::linker_script::LinkerScript;
use crate::map::MapFile;
use crate::Error;

#[derive(Debug, Error)]
pub enum RelocateError {
    #[error("The DSP header at offset {:#x} is cut off - the image is only {} bytes", offset, len)]
    TruncatedHeader { offset: usize, len: usize },
    #[error("The DSP header is already relocated - its string address is {:#010x}", _0)]
    AlreadyRelocated(u32),
    #[error("Relocating the DSP header by {:#010x} overflows the address space", _0)]
    AddressOverflow(u32),
}

/// Where a DSP image sits in a binary and where it's loaded on the target
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DspPlacement {
    /// The address the DSP image is loaded from
    pub address: u32,
    /// The offset of the DSP header in the binary
    pub offset: usize,
}

/// Patches DSP headers to absolute addresses
#[derive(Debug, Clone, Copy)]
pub struct Relocator {
    /// The absolute address of the DSP image
    base: u32,
    /// Relocate headers that don't look relative
    force: bool,
}

impl Relocator {
    pub fn new(base: u32) -> Relocator {
        Relocator { base, force: false }
    }

    /// Allows relocating a header that has already been relocated
    pub fn force(&mut self, force: bool) -> &mut Relocator {
        self.force = force;
        self
    }

    /// Rewrites the header at `offset` in `image`, returning the new header
    ///
    /// The header may only be relocated once, since the addresses are shifted rather than
    /// overwritten. Anything but a relative header is refused unless forced.
    pub fn apply(&self, image: &mut [u8], offset: usize) -> Result<DspHeader, RelocateError> {
        let len = image.len();
        let end = offset
            .checked_add(DSP_HEADER_LEN)
            .filter(|end| *end <= len)
            .ok_or(RelocateError::TruncatedHeader { offset, len })?;
        let header_bytes = &mut image[offset..end];

        let header = DspHeader::from_reader(&mut &header_bytes[..])
            .map_err(|_| RelocateError::TruncatedHeader { offset, len })?;

        if !header.is_relative() && !self.force {
            return Err(RelocateError::AlreadyRelocated(header.string_address));
        }

        let relocated = header
            .relocated(self.base)
            .ok_or(RelocateError::AddressOverflow(self.base))?;

        debug!(
            "Relocating DSP header at offset {:#x} by {:#010x}",
            offset, self.base
        );

        header_bytes.copy_from_slice(&relocated.to_bytes());

        Ok(relocated)
    }
}

/// Finds the DSP image inside the combined binary described by `map`
///
/// The DSP image is the `.dspBlock` section. The binary starts at the lowest of the DSP image,
/// the entry point and the `.pbufBlock` section. Returns `None` if there's no DSP image.
pub fn locate_in_map(map: &MapFile) -> Result<Option<DspPlacement>, Error> {
    let entry = map.entry_point()?;

    let dsp = match map.find(".dspBlock")? {
        Some(dsp) => dsp,
        None => {
            debug!("No .dspBlock section, nothing to relocate");
            return Ok(None);
        }
    };

    let pbuf = map.find(".pbufBlock")?;
    let address = dsp.lma();

    let base = [Some(address), Some(entry.start_address), pbuf.map(|pbuf| pbuf.lma())]
        .iter()
        .flatten()
        .min()
        .copied()
        .unwrap_or(address);

    Ok(Some(DspPlacement {
        address,
        offset: (address - base) as usize,
    }))
}

/// Relocates the DSP image inside the combined binary at `path` using the linker `map`
///
/// Returns `None` without touching the file if the map has no DSP image or the file is empty.
pub fn relocate_with_map<P: AsRef<Path>>(
    path: P,
    map: &MapFile,
    force: bool,
) -> Result<Option<DspHeader>, Error> {
    let placement = match locate_in_map(map)? {
        Some(placement) => placement,
        None => return Ok(None),
    };

    info!(
        "DSP image is at {:#010x}, offset {:#x} in the binary",
        placement.address, placement.offset
    );

    relocate_file(path, placement.address, placement.offset, force)
}

/// Relocates the standalone DSP image at `path` to the `ORIGIN` of `region` in the linker script
///
/// Returns `None` without touching the file if the script doesn't declare the region or the file
/// is empty.
pub fn relocate_with_linker_script<P: AsRef<Path>>(
    path: P,
    script: &LinkerScript,
    region: &str,
    force: bool,
) -> Result<Option<DspHeader>, Error> {
    let origin = match script.origin(region)? {
        Some(origin) => origin,
        None => {
            info!("{} region not found, nothing to relocate", region);
            return Ok(None);
        }
    };

    relocate_file(path, origin, 0, force)
}

fn relocate_file<P: AsRef<Path>>(
    path: P,
    base: u32,
    offset: usize,
    force: bool,
) -> Result<Option<DspHeader>, Error> {
    let path = path.as_ref();
    let mut image = fs::read(path)?;

    if image.is_empty() {
        debug!("{} is empty, nothing to relocate", path.display());
        return Ok(None);
    }

    let header = Relocator::new(base).force(force).apply(&mut image, offset)?;

    fs::write(path, &image)?;

    Ok(Some(header))
}
