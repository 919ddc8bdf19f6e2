use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use cairn_store::ObjectReader;

use crate::format::ObjectInfo;

/// Read + Seek view over the byte range `[start, end)` of a file.
///
/// Each reader owns its own handle, so any number of them can read the same
/// bundle concurrently.
#[derive(Debug)]
pub struct RangeReader {
    file: File,
    start: u64,
    end: u64,
    pos: u64,
}

impl RangeReader {
    pub fn open(path: &Path, start: u64, end: u64) -> io::Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(start))?;
        Ok(Self {
            file,
            start,
            end: end.max(start),
            pos: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Read for RangeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len().saturating_sub(self.pos);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(remaining.min(usize::MAX as u64) as usize);
        let n = self.file.read(&mut buf[..max])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for RangeReader {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        let new_pos = match target {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(delta) => self.len().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        }
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of object")
        })?;
        self.file.seek(SeekFrom::Start(self.start.saturating_add(new_pos)))?;
        self.pos = new_pos;
        Ok(new_pos)
    }
}

/// Open one bundle entry. Compressed entries are decompressed into memory;
/// raw entries are streamed straight from the file.
pub fn open_entry(path: &Path, info: &ObjectInfo) -> io::Result<ObjectReader> {
    let mut range = RangeReader::open(path, info.start_offset, info.end_offset)?;
    if !info.compressed {
        return Ok(Box::new(range));
    }
    let data = zstd::decode_all(&mut range)?;
    if data.len() as u64 != info.uncompressed_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "entry decompressed to {} bytes, expected {}",
                data.len(),
                info.uncompressed_size
            ),
        ));
    }
    Ok(Box::new(Cursor::new(data)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(content: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn range_reads_only_its_window() {
        let (_dir, path) = fixture(b"0123456789");
        let mut reader = RangeReader::open(&path, 2, 6).unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "2345");
        assert_eq!(reader.len(), 4);
    }

    #[test]
    fn range_seek_is_relative_to_window() {
        let (_dir, path) = fixture(b"0123456789");
        let mut reader = RangeReader::open(&path, 3, 8).unwrap();

        assert_eq!(reader.seek(SeekFrom::End(-2)).unwrap(), 3);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"67");

        reader.seek(SeekFrom::Start(1)).unwrap();
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).unwrap();
        assert_eq!(&byte, b"4");

        assert!(reader.seek(SeekFrom::Current(-10)).is_err());
    }

    #[test]
    fn seek_past_end_reads_nothing() {
        let (_dir, path) = fixture(b"abc");
        let mut reader = RangeReader::open(&path, 0, 3).unwrap();
        reader.seek(SeekFrom::Start(10)).unwrap();
        let mut out = Vec::new();
        assert_eq!(reader.read_to_end(&mut out).unwrap(), 0);
    }

    #[test]
    fn compressed_entry_is_inflated() {
        let original = vec![7u8; 4096];
        let compressed = zstd::encode_all(original.as_slice(), 3).unwrap();
        let mut content = b"HEAD".to_vec();
        content.extend_from_slice(&compressed);
        let (_dir, path) = fixture(&content);

        let info = ObjectInfo {
            start_offset: 4,
            end_offset: content.len() as u64,
            uncompressed_size: original.len() as u64,
            compressed: true,
            incremental_index: 0,
        };
        let mut out = Vec::new();
        open_entry(&path, &info).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, original);

        let wrong = ObjectInfo {
            uncompressed_size: 1,
            ..info
        };
        assert!(open_entry(&path, &wrong).is_err());
    }
}
