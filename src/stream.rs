//! Offset-addressed read/write over a flat region. This is a thin
//! collaborator: the interesting logic lives in [`crate::store`], this
//! module just adapts a file or an in-memory buffer to it.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// Offset-addressable read/write/flush over a flat region.
///
/// Implementors need not track a cursor across calls: every read/write is
/// given an absolute offset.
pub trait ByteStream {
    /// Read exactly `buf.len()` bytes starting at `offset`. Reading past
    /// the end of a growable backing store (e.g. a file shorter than
    /// `offset + buf.len()`) is only valid when the caller already knows
    /// the region was previously written -- the store layer never reads
    /// speculatively past what it itself wrote.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `offset`, growing the backing region if necessary.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Current length of the backing region in bytes.
    fn len(&mut self) -> Result<u64>;

    /// Persist any buffered writes.
    fn flush(&mut self) -> Result<()>;

    /// True when the stream is empty.
    fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// True when the stream rejects writes. A read-only backing store must
    /// skip every write side effect of a flush, not just the final sync --
    /// defaults to `false` since most implementors (e.g. [`InMemoryStream`])
    /// have no read-only mode.
    fn is_read_only(&self) -> bool {
        false
    }
}

/// An in-memory `ByteStream`, useful for tests and for ephemeral stores.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStream {
    buf: Vec<u8>,
}

impl InMemoryStream {
    pub fn new() -> Self {
        InMemoryStream { buf: Vec::new() }
    }

    /// Wrap an existing buffer (e.g. to reopen a store written earlier).
    pub fn from_vec(buf: Vec<u8>) -> Self {
        InMemoryStream { buf }
    }

    /// Borrow the raw buffer, e.g. to hand it to another `InMemoryStream`
    /// when "reopening" in a test.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

impl ByteStream for InMemoryStream {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let offset = offset as usize;
        if offset + buf.len() > self.buf.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of in-memory stream",
            )));
        }
        buf.copy_from_slice(&self.buf[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let offset = offset as usize;
        let end = offset + data.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.buf.len() as u64)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// How a [`FileStream`] opens its backing path, mirroring the four modes a
/// file-backed store supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only; flush is a no-op.
    ReadOnly,
    /// Read/write an existing file.
    ReadWrite,
    /// Read/write, creating the file if it doesn't exist.
    CreateIfMissing,
    /// Truncate and create, discarding any existing content.
    Truncate,
}

impl OpenMode {
    /// Parse the single-character mode codes: `r`/`w`/`c`/`n`.
    pub fn from_char(c: char) -> Result<Self> {
        match c {
            'r' => Ok(OpenMode::ReadOnly),
            'w' => Ok(OpenMode::ReadWrite),
            'c' => Ok(OpenMode::CreateIfMissing),
            'n' => Ok(OpenMode::Truncate),
            other => Err(Error::InvalidMode(other)),
        }
    }

    fn is_read_only(self) -> bool {
        matches!(self, OpenMode::ReadOnly)
    }
}

/// A file-backed `ByteStream`.
#[derive(Debug)]
pub struct FileStream {
    file: File,
    mode: OpenMode,
}

impl FileStream {
    /// Open `path` in the given mode.
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref();
        let file = match mode {
            OpenMode::ReadOnly => OpenOptions::new().read(true).open(path)?,
            OpenMode::ReadWrite => OpenOptions::new().read(true).write(true).open(path)?,
            OpenMode::CreateIfMissing => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)?,
            OpenMode::Truncate => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
        };
        Ok(FileStream { file, mode })
    }
}

impl ByteStream for FileStream {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn flush(&mut self) -> Result<()> {
        if self.mode.is_read_only() {
            return Ok(());
        }
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.mode.is_read_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_read_past_end_errors() {
        let mut s = InMemoryStream::new();
        let mut buf = [0u8; 4];
        assert!(s.read_at(0, &mut buf).is_err());
    }

    #[test]
    fn in_memory_write_grows_and_zero_fills() {
        let mut s = InMemoryStream::new();
        s.write_at(10, b"X").unwrap();
        assert_eq!(s.len().unwrap(), 11);
        let mut buf = [0u8; 11];
        s.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00X");
    }

    #[test]
    fn file_stream_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        {
            let mut s = FileStream::open(&path, OpenMode::Truncate).unwrap();
            s.write_at(0, b"hello").unwrap();
            s.flush().unwrap();
        }
        {
            let mut s = FileStream::open(&path, OpenMode::ReadOnly).unwrap();
            let mut buf = [0u8; 5];
            s.read_at(0, &mut buf).unwrap();
            assert_eq!(&buf, b"hello");
        }
    }

    #[test]
    fn invalid_mode_char_rejected() {
        assert!(matches!(OpenMode::from_char('x'), Err(Error::InvalidMode('x'))));
    }
}
