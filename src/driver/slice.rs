//! Concurrent bounded readers over one file handle.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::lock::lock_or_recover;

/// A file handle shared by several [`SliceReader`]s.
#[derive(Debug, Clone)]
pub(crate) struct SharedFile {
    file: Arc<Mutex<File>>,
    len: u64,
}

impl SharedFile {
    pub(crate) fn open(path: &Path) -> io::Result<Self> {
        Self::from_file(File::open(path)?)
    }

    pub(crate) fn from_file(file: File) -> io::Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            len,
        })
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    /// Reads exactly `buf.len()` bytes at `offset`.
    pub(crate) fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut file = lock_or_recover(&self.file);
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    /// Returns a reader over `len` bytes starting at `offset`.
    pub(crate) fn slice(&self, offset: u64, len: u64) -> io::Result<SliceReader> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(SliceReader {
                file: self.clone(),
                pos: offset,
                end,
            }),
            _ => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "range {}+{} exceeds file length {}",
                    offset, len, self.len
                ),
            )),
        }
    }
}

/// Reads a byte range of a [`SharedFile`], seeking before every read so
/// that readers on the same handle do not disturb each other.
#[derive(Debug)]
pub(crate) struct SliceReader {
    file: SharedFile,
    pos: u64,
    end: u64,
}

impl Read for SliceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.end - self.pos;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = usize::try_from(remaining).unwrap_or(usize::MAX).min(buf.len());
        let n = {
            let mut file = lock_or_recover(&self.file.file);
            file.seek(SeekFrom::Start(self.pos))?;
            file.read(&mut buf[..max])?
        };
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "archive file was truncated",
            ));
        }
        self.pos += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn shared(content: &[u8]) -> SharedFile {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(content).unwrap();
        SharedFile::from_file(file).unwrap()
    }

    #[test]
    fn test_slices_are_independent() {
        let file = shared(b"hello world");
        let mut a = file.slice(0, 5).unwrap();
        let mut b = file.slice(6, 5).unwrap();

        let mut buf = [0u8; 2];
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"he");
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"wo");

        let mut rest = String::new();
        a.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "llo");
        rest.clear();
        b.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "rld");
    }

    #[test]
    fn test_slice_out_of_range() {
        let file = shared(b"abc");
        assert!(file.slice(2, 2).is_err());
        assert!(file.slice(u64::MAX, 2).is_err());
        assert!(file.slice(3, 0).is_ok());
    }

    #[test]
    fn test_read_exact_at() {
        let file = shared(b"0123456789");
        let mut buf = [0u8; 3];
        file.read_exact_at(4, &mut buf).unwrap();
        assert_eq!(&buf, b"456");
        assert_eq!(file.len(), 10);
    }
}
