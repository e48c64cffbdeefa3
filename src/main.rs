use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use structopt::StructOpt;

use ecm_image::image::{blank, crc, dsp, relocate, split};
use ecm_image::image::{DspHeader, PartitionTable, SplitOutcome, Splitter};
use ecm_image::linker_script::LinkerScript;
use ecm_image::map::MapFile;

mod cli;

use cli::{Command, DspImageOpts, PartitionOpts, RelocateOpts, RelocateStandaloneOpts, SplitOpts};

fn open_map(path: &Path) -> Result<MapFile, anyhow::Error> {
    MapFile::open(path)
        .with_context(|| format!("Failed to read map file '{}'", path.display()))
}

fn dsp_image(opts: &DspImageOpts) -> Result<(), anyhow::Error> {
    let name = match &opts.name {
        Some(name) => name.clone(),
        None => opts
            .elf
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .with_context(|| format!("Can't derive a name from '{}'", opts.elf.display()))?,
    };

    println!(
        "Building DSP image {:?} from {} at {:#010x}",
        name,
        opts.elf.display(),
        opts.base_address
    );

    let image = dsp::build_from_elf(&opts.elf, &name, opts.base_address).with_context(|| {
        format!(
            "Failed to build DSP image from the dumps of '{}'",
            opts.elf.display()
        )
    })?;

    let mut writer = BufWriter::new(
        File::create(&opts.output)
            .with_context(|| format!("Failed to create '{}'", opts.output.display()))?,
    );

    image.write_to(&mut writer)?;
    writer.flush()?;

    println!("{}", image.header());
    println!("Wrote {}", opts.output.display());

    Ok(())
}

fn print_relocation(path: &Path, header: Option<DspHeader>) {
    match header {
        Some(header) => {
            println!("Relocated DSP image in {}", path.display());
            println!("{}", header);
        }
        None => println!("Nothing to relocate in {}", path.display()),
    }
}

fn relocate(opts: &RelocateOpts) -> Result<(), anyhow::Error> {
    let map = open_map(&opts.map)?;
    let header = relocate::relocate_with_map(&opts.image, &map, opts.force)
        .with_context(|| format!("Failed to relocate '{}'", opts.image.display()))?;

    print_relocation(&opts.image, header);

    Ok(())
}

fn relocate_standalone(opts: &RelocateStandaloneOpts) -> Result<(), anyhow::Error> {
    let script = LinkerScript::open(&opts.linker_script).with_context(|| {
        format!(
            "Failed to read linker script '{}'",
            opts.linker_script.display()
        )
    })?;
    let header = relocate::relocate_with_linker_script(&opts.image, &script, &opts.region, opts.force)
        .with_context(|| format!("Failed to relocate '{}'", opts.image.display()))?;

    print_relocation(&opts.image, header);

    Ok(())
}

fn split(opts: &SplitOpts) -> Result<(), anyhow::Error> {
    let map = open_map(&opts.map)?;
    let binary = fs::read(&opts.binary)
        .with_context(|| format!("Failed to read binary '{}'", opts.binary.display()))?;

    let output_dir = match &opts.output_dir {
        Some(dir) => dir.clone(),
        None => opts
            .binary
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    let outcome = Splitter::new(&map)
        .split(&binary)
        .with_context(|| format!("Failed to split '{}'", opts.binary.display()))?;

    match &outcome {
        SplitOutcome::NothingToSplit => {
            println!("No .text section in {}, nothing to split", opts.map.display());
            return Ok(());
        }
        SplitOutcome::RamImage(_) => println!("Not adding CRC as it's a RAM build"),
        SplitOutcome::Fragments(_) => {}
    }

    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create '{}'", output_dir.display()))?;

    split::write_fragments(outcome.fragments(), &output_dir).with_context(|| {
        format!("Failed to write fragments to '{}'", output_dir.display())
    })?;

    for fragment in outcome.fragments() {
        println!("{}", fragment);
    }

    Ok(())
}

fn partition(opts: &PartitionOpts) -> Result<(), anyhow::Error> {
    let map = open_map(&opts.map)?;
    let table = PartitionTable::from_map(&map).with_context(|| {
        format!(
            "Failed to build the partition table from '{}'",
            opts.map.display()
        )
    })?;

    let output = match &opts.output {
        Some(output) => output.clone(),
        None => opts.map.with_file_name("01_partition.bin"),
    };

    fs::write(&output, table.to_bytes())
        .with_context(|| format!("Failed to write '{}'", output.display()))?;

    println!("{}", table);
    println!("Wrote {}", output.display());

    Ok(())
}

fn dsp_info(path: &Path, offset: usize) -> Result<(), anyhow::Error> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read '{}'", path.display()))?;
    let mut header_bytes = bytes
        .get(offset..)
        .with_context(|| format!("Offset {:#x} is past the end of '{}'", offset, path.display()))?;
    let header = DspHeader::from_reader(&mut header_bytes)
        .with_context(|| format!("No DSP header at offset {:#x}", offset))?;

    println!("DSP header at offset {:#x}", offset);
    println!("{}", header);

    if header.is_relative() {
        println!("The header is relative and can be relocated");
    }

    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    // Create a logger with a timestamp that logs everything at Info level or above
    pretty_env_logger::init_timed();

    // Parse the command-line arguments
    let opts = cli::Opts::from_args();

    match &opts.command {
        Command::DspImage(opts) => dsp_image(opts)?,
        Command::Relocate(opts) => relocate(opts)?,
        Command::RelocateStandalone(opts) => relocate_standalone(opts)?,
        Command::Split(opts) => split(opts)?,
        Command::Partition(opts) => partition(opts)?,
        Command::Crc { filename } => {
            let header = crc::frame_file(filename)
                .with_context(|| format!("Failed to frame '{}'", filename.display()))?;

            println!(
                "Framed {} with length {} and crc32 {:#010x}",
                filename.display(),
                header.length,
                header.crc32
            );
        }
        Command::Verify { filename } => {
            let header = crc::verify_file(filename)
                .with_context(|| format!("Failed to verify '{}'", filename.display()))?;

            println!(
                "{} is valid: length {} and crc32 {:#010x}",
                filename.display(),
                header.length,
                header.crc32
            );
        }
        Command::DspInfo { filename, offset } => dsp_info(filename, *offset)?,
        Command::Blank { filename, words } => {
            blank::create_blank(filename, *words)
                .with_context(|| format!("Failed to write '{}'", filename.display()))?;

            println!("Wrote {} blank words to {}", words, filename.display());
        }
    }

    Ok(())
}
