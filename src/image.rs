//! Firmware image assembly, relocation, splitting and framing

pub mod blank;
pub mod crc;
pub mod dsp;
pub mod partition;
pub mod relocate;
pub mod split;

pub use crc::{CrcFrame, FRAME_HEADER_LEN};
pub use dsp::{DspHeader, DspImage, DspImageBuilder, MemoryClass, MemoryDump, DSP_HEADER_LEN};
pub use partition::{PartitionEntry, PartitionTable, PARTITION_TABLE_LEN};
pub use relocate::Relocator;
pub use split::{Fragment, Residency, Role, SplitOutcome, Splitter};
