//! Translation of a [`Section`](crate::section::Section) request into an
//! ordered sequence of file byte ranges.
//!
//! The [`Indexer`] is the performance-critical primitive every reader
//! uses: it walks the requested subset in row-major order and merges
//! maximal runs of byte-contiguous elements into single [`FileChunk`]s,
//! so a whole-variable read of a contiguous layout costs one seek.

use crate::error::Error;
use crate::section::{Range, Section};

/// One contiguous run of elements to transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChunk {
    /// Absolute byte position of the first element in the file.
    pub file_pos: u64,
    /// Element offset of the run in the flat destination buffer.
    pub dest_offset: u64,
    /// Number of elements in the run.
    pub n_elems: u64,
}

/// Lazy, finite, non-restartable iterator of [`FileChunk`]s covering
/// exactly the requested section in row-major (outermost-first) order.
pub struct Indexer {
    ranges: Vec<Range>,
    /// Byte stride of each dimension in the file layout.
    byte_strides: Vec<u64>,
    base_pos: u64,
    elem_size: u64,
    /// Elements per emitted run: the merged trailing dimensions.
    chunk_elems: u64,
    /// Byte offset contributed by the `first` element of each merged dim.
    merged_base: u64,
    /// Odometer over the outer dimensions, `None` once exhausted.
    odometer: Option<Vec<u64>>,
    emitted: u64,
}

impl Indexer {
    /// Builds an indexer for a variable of `shape` whose first element
    /// lives at `base_pos`. `record_stride` overrides the outermost
    /// dimension's byte stride for record variables interleaved with
    /// their siblings.
    pub fn new(
        shape: &[u64],
        elem_size: usize,
        base_pos: u64,
        section: &Section,
        record_stride: Option<u64>,
    ) -> Result<Self, Error> {
        let ranges = section.resolve(shape)?;
        let elem_size = elem_size as u64;
        let rank = shape.len();

        // Row-major element strides, then byte strides. The record
        // stride replaces the outermost byte stride when given.
        let mut byte_strides = vec![elem_size; rank];
        for i in (0..rank.saturating_sub(1)).rev() {
            byte_strides[i] = byte_strides[i + 1] * shape[i + 1];
        }
        let contiguous_outer = byte_strides.first().copied();
        if let (Some(rs), true) = (record_stride, rank > 0) {
            byte_strides[0] = rs;
        }

        // Grow the merged run inward-out while each dimension is
        // stride-1 and byte-contiguous; stop after the first dimension
        // that is not fully selected.
        let mut chunk_elems: u64 = 1;
        let mut split = rank;
        for i in (0..rank).rev() {
            let r = &ranges[i];
            let contiguous = if i == 0 {
                record_stride.is_none() || Some(byte_strides[0]) == contiguous_outer
            } else {
                true
            };
            let inner_run = byte_strides[i] == chunk_elems * elem_size;
            if r.stride != 1 || !contiguous || !inner_run {
                break;
            }
            chunk_elems *= r.len();
            split = i;
            if r.first != 0 || r.last + 1 != shape[i] {
                break;
            }
        }
        if split == rank {
            // Innermost dimension is strided: one element per run.
            chunk_elems = 1;
        }

        let merged_base: u64 = (split..rank)
            .map(|i| ranges[i].first * byte_strides[i])
            .sum();

        // A zero-length dimension selects nothing at all.
        let odometer = if ranges.iter().any(Range::is_empty) {
            None
        } else {
            Some(vec![0; split])
        };

        Ok(Self {
            ranges,
            byte_strides,
            base_pos,
            elem_size,
            chunk_elems,
            merged_base,
            odometer,
            emitted: 0,
        })
    }

    /// Total number of elements the iterator will cover.
    pub fn total_elements(&self) -> u64 {
        self.ranges.iter().map(Range::len).product()
    }

    /// Size in bytes of one emitted run.
    pub fn chunk_bytes(&self) -> u64 {
        self.chunk_elems * self.elem_size
    }
}

impl Iterator for Indexer {
    type Item = FileChunk;

    fn next(&mut self) -> Option<FileChunk> {
        let odo = self.odometer.as_mut()?;

        let outer_pos: u64 = odo
            .iter()
            .enumerate()
            .map(|(i, &idx)| self.ranges[i].element(idx) * self.byte_strides[i])
            .sum();
        let chunk = FileChunk {
            file_pos: self.base_pos + outer_pos + self.merged_base,
            dest_offset: self.emitted,
            n_elems: self.chunk_elems,
        };
        self.emitted += self.chunk_elems;

        // Advance the odometer, outermost digit last.
        let mut done = true;
        for i in (0..odo.len()).rev() {
            odo[i] += 1;
            if odo[i] < self.ranges[i].len() {
                done = false;
                break;
            }
            odo[i] = 0;
        }
        if done {
            self.odometer = None;
        }
        Some(chunk)
    }
}
