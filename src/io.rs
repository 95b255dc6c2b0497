//! The byte source/sink abstraction the codecs are written against.
//!
//! Everything below the codecs is positional: no shared cursor, so one
//! handle can satisfy interleaved header and data reads without seek
//! bookkeeping leaking into the parsers.

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use memmap2::Mmap;

use crate::error::Error;

/// A seekable, randomly-addressable byte source/sink.
pub trait RandomAccess {
    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error>;

    /// Writes `bytes` starting at `offset`, extending the file if needed.
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<(), Error>;

    /// Current length in bytes.
    fn len(&mut self) -> Result<u64, Error>;

    fn is_empty(&mut self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    /// Grows the file to at least `len` bytes (zero filled); never
    /// shrinks it.
    fn set_min_len(&mut self, len: u64) -> Result<(), Error>;

    /// Reads `len` bytes at `offset` into a fresh buffer.
    fn read_vec(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }
}

impl RandomAccess for File {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::UnexpectedEof,
            _ => Error::Io(e),
        })
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<(), Error> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(bytes)?;
        Ok(())
    }

    fn len(&mut self) -> Result<u64, Error> {
        Ok(self.metadata()?.len())
    }

    fn set_min_len(&mut self, len: u64) -> Result<(), Error> {
        if self.metadata()?.len() < len {
            self.set_len(len)?;
        }
        Ok(())
    }
}

impl RandomAccess for Cursor<Vec<u8>> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        let data = self.get_ref();
        let start = usize::try_from(offset).map_err(|_| Error::UnexpectedEof)?;
        let end = start.checked_add(buf.len()).ok_or(Error::UnexpectedEof)?;
        if end > data.len() {
            return Err(Error::UnexpectedEof);
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<(), Error> {
        let data = self.get_mut();
        let start = usize::try_from(offset).map_err(|_| Error::UnexpectedEof)?;
        let end = start.checked_add(bytes.len()).ok_or(Error::UnexpectedEof)?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn len(&mut self) -> Result<u64, Error> {
        Ok(self.get_ref().len() as u64)
    }

    fn set_min_len(&mut self, len: u64) -> Result<(), Error> {
        let len = usize::try_from(len).map_err(|_| Error::UnexpectedEof)?;
        if self.get_ref().len() < len {
            self.get_mut().resize(len, 0);
        }
        Ok(())
    }
}

/// Read-only memory-mapped source for the `open_mmap` convenience path.
pub struct MmapSource {
    mmap: Mmap,
}

impl MmapSource {
    pub fn new(mmap: Mmap) -> Self {
        Self { mmap }
    }
}

impl RandomAccess for MmapSource {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        let start = usize::try_from(offset).map_err(|_| Error::UnexpectedEof)?;
        let end = start.checked_add(buf.len()).ok_or(Error::UnexpectedEof)?;
        if end > self.mmap.len() {
            return Err(Error::UnexpectedEof);
        }
        buf.copy_from_slice(&self.mmap[start..end]);
        Ok(())
    }

    fn write_at(&mut self, _offset: u64, _bytes: &[u8]) -> Result<(), Error> {
        Err(Error::Immutable("memory-mapped source is read-only".to_string()))
    }

    fn len(&mut self) -> Result<u64, Error> {
        Ok(self.mmap.len() as u64)
    }

    fn set_min_len(&mut self, _len: u64) -> Result<(), Error> {
        Err(Error::Immutable("memory-mapped source is read-only".to_string()))
    }
}
