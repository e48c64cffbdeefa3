//! All-zero images used to erase an application slot

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use log::debug;

/// The number of words in a blank image, 226 KiB
pub const DEFAULT_BLANK_WORDS: usize = 57856;

/// Writes `words` little-endian zero `u32`s to the given `writer`
pub fn write_blank<W: Write>(writer: &mut W, words: usize) -> io::Result<()> {
    for _ in 0..words {
        writer.write_u32::<LittleEndian>(0)?;
    }

    Ok(())
}

/// Creates the blank image at `path`, replacing any existing file
pub fn create_blank<P: AsRef<Path>>(path: P, words: usize) -> io::Result<()> {
    let path = path.as_ref();
    let mut writer = BufWriter::new(File::create(path)?);

    debug!("Writing {} blank words to {}", words, path.display());

    write_blank(&mut writer, words)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn it_should_write_zero_words() {
        let mut buf = Vec::new();
        write_blank(&mut buf, 3).unwrap();

        assert_eq!(buf, vec![0u8; 12]);
    }

    #[test]
    fn it_should_create_a_226_kib_image_by_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("blank.bin");

        create_blank(&path, DEFAULT_BLANK_WORDS).unwrap();

        let contents = fs::read(&path).unwrap();

        assert_eq!(contents.len(), 226 * 1024);
        assert!(contents.iter().all(|b| *b == 0));
    }
}
