//! Format detection and the top-level open entry points.

use std::fs::File;
use std::path::Path;

use log::info;
use memmap2::Mmap;

use crate::classic_reader::ClassicFile;
use crate::error::Error;
use crate::hdf5_reader::Hdf5File;
use crate::io::{MmapSource, RandomAccess};
use crate::models::{Dataset, NumericValues, CLASSIC_MAGIC, HDF5_MAGIC};
use crate::section::Section;

/// The container formats this crate recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    /// CDF-1 (32-bit offsets).
    Classic,
    /// CDF-2 (64-bit offsets).
    Classic64,
    /// HDF5-style hierarchical container.
    Hdf5,
}

/// Identifies the container format from leading bytes. Pure: no I/O,
/// no state. The hierarchical signature is also probed at 512-doubling
/// offsets when the prefix is long enough to contain them.
pub fn sniff(prefix: &[u8]) -> Option<FormatKind> {
    if prefix.len() >= 4 && &prefix[0..3] == CLASSIC_MAGIC {
        return match prefix[3] {
            1 => Some(FormatKind::Classic),
            2 => Some(FormatKind::Classic64),
            _ => None,
        };
    }
    let mut at = 0usize;
    while at + 8 <= prefix.len() {
        if &prefix[at..at + 8] == HDF5_MAGIC {
            return Some(FormatKind::Hdf5);
        }
        at = if at == 0 { 512 } else { at * 2 };
    }
    None
}

/// An open container of either format, dispatching reads statically.
pub enum NcFile<R: RandomAccess> {
    Classic(ClassicFile<R>),
    Hdf5(Hdf5File<R>),
}

impl<R: RandomAccess> NcFile<R> {
    /// Sniffs `source` and opens it with the matching codec.
    pub fn open(mut source: R) -> Result<Self, Error> {
        let len = source.len()?;
        let probe = len.min(4096) as usize;
        let prefix = source.read_vec(0, probe)?;
        match sniff(&prefix) {
            Some(FormatKind::Classic) | Some(FormatKind::Classic64) => {
                info!("opening classic-format container");
                Ok(NcFile::Classic(ClassicFile::open(source, false)?))
            }
            Some(FormatKind::Hdf5) => {
                info!("opening hierarchical-format container");
                Ok(NcFile::Hdf5(Hdf5File::open(source)?))
            }
            None => {
                // The hierarchical signature may sit past the probe
                // window; let its own scan decide before giving up.
                Hdf5File::open(source).map(NcFile::Hdf5)
            }
        }
    }

    pub fn dataset(&self) -> &Dataset {
        match self {
            NcFile::Classic(f) => &f.dataset,
            NcFile::Hdf5(f) => &f.dataset,
        }
    }

    pub fn format(&self) -> FormatKind {
        match self {
            NcFile::Classic(f) if f.version == 2 => FormatKind::Classic64,
            NcFile::Classic(_) => FormatKind::Classic,
            NcFile::Hdf5(_) => FormatKind::Hdf5,
        }
    }

    /// Reads a whole variable by path.
    pub fn read(&mut self, path: &str) -> Result<NumericValues, Error> {
        match self {
            NcFile::Classic(f) => f.read(path),
            NcFile::Hdf5(f) => f.read(path),
        }
    }

    /// Reads the selected section of a variable by path.
    pub fn read_section(&mut self, path: &str, section: &Section) -> Result<NumericValues, Error> {
        match self {
            NcFile::Classic(f) => f.read_section(path, section),
            NcFile::Hdf5(f) => f.read_section(path, section),
        }
    }
}

/// Opens a file by path with buffered positional reads.
pub fn open(path: impl AsRef<Path>) -> Result<NcFile<File>, Error> {
    NcFile::open(File::open(path)?)
}

/// Opens a file by path through a read-only memory map.
pub fn open_mmap(path: impl AsRef<Path>) -> Result<NcFile<MmapSource>, Error> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    NcFile::open(MmapSource::new(mmap))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniff_classic_versions() {
        assert_eq!(sniff(b"CDF\x01rest"), Some(FormatKind::Classic));
        assert_eq!(sniff(b"CDF\x02rest"), Some(FormatKind::Classic64));
        assert_eq!(sniff(b"CDF\x05rest"), None);
    }

    #[test]
    fn sniff_hdf5_at_zero_and_doubled_offsets() {
        assert_eq!(sniff(HDF5_MAGIC), Some(FormatKind::Hdf5));

        let mut buf = vec![0u8; 1024 + 8];
        buf[1024..1032].copy_from_slice(HDF5_MAGIC);
        assert_eq!(sniff(&buf), Some(FormatKind::Hdf5));

        // Signature off the doubling grid is not recognized.
        let mut buf = vec![0u8; 256 + 8];
        buf[256..264].copy_from_slice(HDF5_MAGIC);
        assert_eq!(sniff(&buf), None);
    }

    #[test]
    fn sniff_rejects_short_or_foreign_data() {
        assert_eq!(sniff(b""), None);
        assert_eq!(sniff(b"CD"), None);
        assert_eq!(sniff(b"PK\x03\x04not a container"), None);
    }
}
