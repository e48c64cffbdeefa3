//! Splitting a combined linker output binary into the fragments the bootloader loads
//!
//! The combined binary starts at the `.text` section. The DSP image (`.dsp`) and the shared
//! buffer (`.pbuf`) are linked after the M3 code and get their own fragments, and whatever comes
//! before the first of them is the M3 application.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use thiserror::Error;

use crate::image::crc;
use crate::map::{MapFile, MemoryRegion};
use crate::Error;

#[derive(Debug, Error)]
pub enum SplitError {
    #[error(
        "The {} section at offset {:#x} with length {:#x} runs past the end of the {}-byte binary",
        section,
        offset,
        length,
        len
    )]
    OutOfBounds {
        section: String,
        offset: u32,
        length: u32,
        len: usize,
    },
    #[error("The {} section at {:#010x} lies before .text at {:#010x}", section, address, text)]
    BeforeText {
        section: String,
        address: u32,
        text: u32,
    },
}

/// Where a fragment is executed from
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Residency {
    Flash,
    Ram,
}

impl Residency {
    pub fn of(region: &MemoryRegion) -> Residency {
        if region.is_ram() {
            Residency::Ram
        } else {
            Residency::Flash
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Residency::Flash => "flash",
            Residency::Ram => "ram",
        }
    }
}

/// What a fragment contains
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    /// The M3 application
    M3,
    /// The DSP image
    Dsp,
    /// The buffer shared between the M3 and the DSP
    SharedBuffer,
}

impl Role {
    fn prefix(self) -> &'static str {
        match self {
            Role::M3 => "02_m3_fw",
            Role::Dsp => "03_dsp_fw",
            Role::SharedBuffer => "04_pbuf",
        }
    }
}

/// A slice of the combined binary
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Fragment {
    pub role: Role,
    pub residency: Residency,
    pub data: Vec<u8>,
}

impl Fragment {
    /// The file name the bootloader tooling expects, e.g. `03_dsp_fw_flash.bin`
    pub fn file_name(&self) -> String {
        format!("{}_{}.bin", self.role.prefix(), self.residency.suffix())
    }

    /// Only the M3 application in flash is validated by the bootloader
    pub fn needs_crc(&self) -> bool {
        self.role == Role::M3 && self.residency == Residency::Flash
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.file_name(), self.data.len())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SplitOutcome {
    /// The map has no `.text` section, so there's nothing to split
    NothingToSplit,
    /// The application runs from RAM and is loaded as a whole
    RamImage(Fragment),
    /// The application runs from flash and was split into fragments
    Fragments(Vec<Fragment>),
}

impl SplitOutcome {
    pub fn fragments(&self) -> &[Fragment] {
        match self {
            SplitOutcome::NothingToSplit => &[],
            SplitOutcome::RamImage(fragment) => std::slice::from_ref(fragment),
            SplitOutcome::Fragments(fragments) => fragments,
        }
    }
}

/// Splits combined binaries using the sections in a linker map
#[derive(Debug)]
pub struct Splitter<'a> {
    map: &'a MapFile,
}

impl<'a> Splitter<'a> {
    pub fn new(map: &'a MapFile) -> Splitter<'a> {
        Splitter { map }
    }

    /// Splits `binary` into fragments
    ///
    /// Every slice is bounds checked before any fragment is returned.
    pub fn split(&self, binary: &[u8]) -> Result<SplitOutcome, Error> {
        let text = match self.map.find(".text")? {
            Some(text) => text,
            None => {
                info!("No .text section in map file, nothing to split");
                return Ok(SplitOutcome::NothingToSplit);
            }
        };

        if text.is_ram() {
            debug!(".text is at {:#010x} in RAM, not splitting", text.start_address);

            return Ok(SplitOutcome::RamImage(Fragment {
                role: Role::M3,
                residency: Residency::Ram,
                data: binary.to_vec(),
            }));
        }

        let pbuf = self.map.find_input(".pbuf")?;
        let dsp = self.map.find_input(".dsp")?;

        // The DSP block, when there is one, marks where the M3 application ends
        let dsp_boundary = match self.map.find(".dspBlock")? {
            Some(block) => Some(block),
            None => dsp.clone(),
        };

        let boundaries: Vec<&MemoryRegion> = dsp_boundary.iter().chain(pbuf.iter()).collect();

        // Without any DSP or shared buffer contents the whole binary is the M3 application
        let m3_length = if boundaries.iter().all(|region| region.length == 0) {
            binary.len() as u32
        } else {
            boundaries
                .iter()
                .map(|region| relative_offset(region, &text))
                .collect::<Result<Vec<u32>, SplitError>>()?
                .into_iter()
                .min()
                .unwrap_or(binary.len() as u32)
        };

        let m3 = MemoryRegion {
            length: m3_length,
            ..text.clone()
        };

        let mut fragments = vec![slice(binary, Role::M3, &m3, &text)?];

        if let Some(dsp) = &dsp {
            fragments.push(slice(binary, Role::Dsp, dsp, &text)?);
        }

        if let Some(pbuf) = &pbuf {
            fragments.push(slice(binary, Role::SharedBuffer, pbuf, &text)?);
        }

        Ok(SplitOutcome::Fragments(fragments))
    }
}

/// The offset of `region` in the binary that starts at `text`
fn relative_offset(region: &MemoryRegion, text: &MemoryRegion) -> Result<u32, SplitError> {
    region
        .offset()
        .checked_sub(text.offset())
        .ok_or_else(|| SplitError::BeforeText {
            section: region.name.clone(),
            address: region.start_address,
            text: text.start_address,
        })
}

fn slice(
    binary: &[u8],
    role: Role,
    region: &MemoryRegion,
    text: &MemoryRegion,
) -> Result<Fragment, SplitError> {
    let offset = relative_offset(region, text)?;
    let out_of_bounds = || SplitError::OutOfBounds {
        section: region.name.clone(),
        offset,
        length: region.length,
        len: binary.len(),
    };

    let start = offset as usize;
    let end = start
        .checked_add(region.length as usize)
        .ok_or_else(out_of_bounds)?;
    let data = binary.get(start..end).ok_or_else(out_of_bounds)?;

    debug!(
        "Slicing {} at [{:#x}, {:#x}) as {:?}",
        region.name, start, end, role
    );

    Ok(Fragment {
        role,
        residency: Residency::of(region),
        data: data.to_vec(),
    })
}

/// Writes `fragments` into `dir`, framing the ones the bootloader validates
///
/// Returns the paths that were written.
pub fn write_fragments<P: AsRef<Path>>(
    fragments: &[Fragment],
    dir: P,
) -> Result<Vec<PathBuf>, Error> {
    let mut paths = Vec::with_capacity(fragments.len());

    for fragment in fragments {
        let path = dir.as_ref().join(fragment.file_name());

        fs::write(&path, &fragment.data)?;

        if fragment.needs_crc() {
            crc::frame_file(&path)?;
        }

        debug!("Wrote {} to {}", fragment, path.display());
        paths.push(path);
    }

    Ok(paths)
}
