use std::num::ParseIntError;
use std::path::PathBuf;

use structopt::StructOpt;

/// Parses an address given either as `0x`-prefixed hex or as decimal
fn parse_address(s: &str) -> Result<u32, ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

fn parse_offset(s: &str) -> Result<usize, ParseIntError> {
    parse_address(s).map(|offset| offset as usize)
}

#[derive(StructOpt, Debug)]
pub enum Command {
    /// Build a standalone DSP image from the memory dumps of a DSP ELF file
    #[structopt(name = "dsp-image")]
    DspImage(DspImageOpts),
    /// Relocate the DSP image inside a combined binary using its linker map
    Relocate(RelocateOpts),
    /// Relocate a standalone DSP image to a region in a linker script
    #[structopt(name = "relocate-standalone")]
    RelocateStandalone(RelocateStandaloneOpts),
    /// Split a combined binary into M3, DSP and shared buffer fragments
    Split(SplitOpts),
    /// Write the partition table for a linker map
    Partition(PartitionOpts),
    /// Prepend the length and crc32 frame header to a file in place
    Crc {
        /// The file to frame
        filename: PathBuf,
    },
    /// Check the frame header of a framed file
    Verify {
        /// The framed file
        filename: PathBuf,
    },
    /// Print the header of a DSP image
    #[structopt(name = "dsp-info")]
    DspInfo {
        /// The file containing the DSP image
        filename: PathBuf,
        /// The offset of the DSP header in the file
        #[structopt(long = "offset", default_value = "0", parse(try_from_str = parse_offset))]
        offset: usize,
    },
    /// Write an all-zero image
    Blank {
        /// The file to write
        filename: PathBuf,
        /// The number of 32-bit words to write
        #[structopt(long = "words", default_value = "57856")]
        words: usize,
    },
}

#[derive(StructOpt, Debug)]
pub struct DspImageOpts {
    /// The DSP ELF file, with its .PMEM, .XMEM and .YMEM dumps next to it
    pub elf: PathBuf,
    /// The firmware name embedded in the image, defaults to the ELF file stem
    #[structopt(env = "DSP_IMAGE_NAME", short = "n", long = "name")]
    pub name: Option<String>,
    /// The file to write the image to
    #[structopt(short = "o", long = "output", default_value = "dsp_fw.bin")]
    pub output: PathBuf,
    /// The base address of the image
    #[structopt(long = "base", default_value = "0", parse(try_from_str = parse_address))]
    pub base_address: u32,
}

#[derive(StructOpt, Debug)]
pub struct RelocateOpts {
    /// The combined binary containing the DSP image
    pub image: PathBuf,
    /// The linker map of the combined binary
    pub map: PathBuf,
    /// Relocate even if the header doesn't look relative
    #[structopt(long = "force")]
    pub force: bool,
}

#[derive(StructOpt, Debug)]
pub struct RelocateStandaloneOpts {
    /// The standalone DSP image
    pub image: PathBuf,
    /// The linker script declaring the memory regions
    pub linker_script: PathBuf,
    /// The memory region the image is loaded to
    #[structopt(long = "region", default_value = "DSP")]
    pub region: String,
    /// Relocate even if the header doesn't look relative
    #[structopt(long = "force")]
    pub force: bool,
}

#[derive(StructOpt, Debug)]
pub struct SplitOpts {
    /// The combined binary
    pub binary: PathBuf,
    /// The linker map of the combined binary
    pub map: PathBuf,
    /// The directory to write the fragments to, defaults to the directory of the binary
    #[structopt(env = "IMAGE_OUTPUT_DIR", short = "o", long = "output-dir")]
    pub output_dir: Option<PathBuf>,
}

#[derive(StructOpt, Debug)]
pub struct PartitionOpts {
    /// The linker map of the application
    pub map: PathBuf,
    /// The file to write the table to, defaults to 01_partition.bin next to the map file
    #[structopt(short = "o", long = "output")]
    pub output: Option<PathBuf>,
}

#[derive(StructOpt, Debug)]
#[structopt(about = "ECM3532 firmware image tool")]
pub struct Opts {
    #[structopt(subcommand)]
    pub command: Command,
}
