use std::io;

use thiserror::Error;

use crate::image::crc::FrameError;
use crate::image::dsp::{BuilderError, DumpError};
use crate::image::relocate::RelocateError;
use crate::image::split::SplitError;
use crate::linker_script::ExpressionError;
use crate::map::ParseError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Neither a .reset nor a .text section was found in the map file")]
    NoEntryPoint,
    #[error("The RAM length {:#x} plus the SHM length {:#x} overflows 32 bits", ram, shm)]
    LengthOverflow { ram: u32, shm: u32 },
    #[error("Map file error: {}", _0)]
    MapError(#[from] ParseError),
    #[error("Memory dump error: {}", _0)]
    DumpError(#[from] DumpError),
    #[error("DSP image builder error: {}", _0)]
    BuilderError(#[from] BuilderError),
    #[error("Relocation error: {}", _0)]
    RelocateError(#[from] RelocateError),
    #[error("Split error: {}", _0)]
    SplitError(#[from] SplitError),
    #[error("CRC frame error: {}", _0)]
    FrameError(#[from] FrameError),
    #[error("Linker script error: {}", _0)]
    ExpressionError(#[from] ExpressionError),
    #[error("I/O error: {}", _0)]
    IoError(#[from] io::Error),
}
