//! Firmware image tooling for the ECM3532
//!
//! The ECM3532 runs an M3 application next to a DSP image. Building a bootable image means
//! assembling the DSP image from its memory dumps, patching it to absolute addresses, splitting
//! the linked binary into the fragments the bootloader loads, writing the partition table that
//! describes them and framing the M3 application with its length and checksum.
//!
//! # Examples
//!
//! ```no_run
//! use ecm_image::image::PartitionTable;
//! use ecm_image::map::MapFile;
//!
//! let map = MapFile::open("build/app.map")?;
//! let table = PartitionTable::from_map(&map)?;
//!
//! println!("{}", table);
//!
//! # Ok::<(), ecm_image::Error>(())
//! ```

mod error;
pub mod image;
pub mod linker_script;
pub mod map;

pub use error::Error;
