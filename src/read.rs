//! Section reads for both container formats.
//!
//! The classic path turns a request directly into file runs through the
//! [`Indexer`]; the hierarchical path additionally dispatches on the
//! storage layout, reassembling chunked data chunk by chunk and
//! synthesizing fill values where storage was never allocated. All
//! numeric output is in native byte order.

use log::debug;

use crate::classic_reader::ClassicFile;
use crate::error::Error;
use crate::hdf5_reader::Hdf5File;
use crate::indexer::Indexer;
use crate::io::RandomAccess;
use crate::models::{
    DataType, Endianness, NumericValues, StorageLayout, Variable, Vinfo,
};
use crate::section::{Range, Section};
use crate::utils::{decode_numeric, to_native_order};

/// A native element type a variable can be read into directly.
pub trait Element: Sized {
    const DATA_TYPE: DataType;
    fn from_values(values: NumericValues) -> Option<Vec<Self>>;
}

macro_rules! impl_element {
    ($ty:ty, $dt:expr, $variant:ident) => {
        impl Element for $ty {
            const DATA_TYPE: DataType = $dt;
            fn from_values(values: NumericValues) -> Option<Vec<Self>> {
                match values {
                    NumericValues::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(i8, DataType::Byte, I8);
impl_element!(u8, DataType::UByte, U8);
impl_element!(i16, DataType::Short, I16);
impl_element!(u16, DataType::UShort, U16);
impl_element!(i32, DataType::Int, I32);
impl_element!(u32, DataType::UInt, U32);
impl_element!(i64, DataType::Long, I64);
impl_element!(u64, DataType::ULong, U64);
impl_element!(f32, DataType::Float, F32);
impl_element!(f64, DataType::Double, F64);

fn check_element_type<T: Element>(var: &Variable) -> Result<(), Error> {
    let compatible = var.data_type == T::DATA_TYPE
        || (var.data_type == DataType::Char && T::DATA_TYPE == DataType::Byte);
    if !compatible {
        return Err(Error::TypeMismatch {
            expected: format!("{:?}", T::DATA_TYPE),
            found: format!("{:?}", var.data_type),
            context: format!("typed read of '{}'", var.name),
        });
    }
    Ok(())
}

/// A buffer of `n` elements pre-painted with the fill pattern, or
/// zeroed when no fill value is recorded.
fn filled_buffer(n: u64, elem_size: usize, fill: Option<&[u8]>) -> Vec<u8> {
    let total = n as usize * elem_size;
    match fill {
        Some(f) if f.len() == elem_size && f.iter().any(|&b| b != 0) => {
            let mut buf = Vec::with_capacity(total);
            while buf.len() < total {
                buf.extend_from_slice(f);
            }
            buf
        }
        _ => vec![0u8; total],
    }
}

// ---- Classic ----

impl<R: RandomAccess> ClassicFile<R> {
    /// Reads a whole variable.
    pub fn read(&mut self, path: &str) -> Result<NumericValues, Error> {
        let rank = self
            .dataset
            .find_variable(path)
            .ok_or_else(|| Error::VariableNotFound(path.to_string()))?
            .rank();
        self.read_section(path, &Section::all(rank))
    }

    /// Reads the selected section of a variable, decoding the on-disk
    /// big-endian bytes into native values.
    pub fn read_section(&mut self, path: &str, section: &Section) -> Result<NumericValues, Error> {
        let var = self
            .dataset
            .find_variable(path)
            .ok_or_else(|| Error::VariableNotFound(path.to_string()))?
            .clone();
        let Vinfo::Classic(vinfo) = var.vinfo else {
            return Err(Error::InvalidFileStructure(format!(
                "variable '{path}' carries no classic storage info"
            )));
        };

        let mut shape = var.shape();
        if var.is_unlimited() && !shape.is_empty() {
            shape[0] = self.dataset.num_records;
        }
        if shape.contains(&0) {
            // A record variable before its first record.
            return Ok(decode_numeric(var.data_type, &[], Endianness::Big));
        }

        let record_stride = vinfo.is_record.then(|| self.record_size());
        let indexer = Indexer::new(&shape, vinfo.elem_size, vinfo.begin, section, record_stride)?;
        let total = indexer.total_elements();
        let mut buf = vec![0u8; total as usize * vinfo.elem_size];
        for chunk in indexer {
            let at = chunk.dest_offset as usize * vinfo.elem_size;
            let len = chunk.n_elems as usize * vinfo.elem_size;
            self.source.read_at(chunk.file_pos, &mut buf[at..at + len])?;
        }
        Ok(decode_numeric(var.data_type, &buf, Endianness::Big))
    }

    /// Reads a section directly into a native slice type.
    pub fn read_section_as<T: Element>(
        &mut self,
        path: &str,
        section: &Section,
    ) -> Result<Vec<T>, Error> {
        let var = self
            .dataset
            .find_variable(path)
            .ok_or_else(|| Error::VariableNotFound(path.to_string()))?;
        check_element_type::<T>(var)?;
        let values = self.read_section(path, section)?;
        T::from_values(values).ok_or(Error::UnexpectedEof)
    }
}

// ---- Hierarchical ----

impl<R: RandomAccess> Hdf5File<R> {
    /// Reads a whole variable.
    pub fn read(&mut self, path: &str) -> Result<NumericValues, Error> {
        let rank = self
            .dataset
            .find_variable(path)
            .ok_or_else(|| Error::VariableNotFound(path.to_string()))?
            .rank();
        self.read_section(path, &Section::all(rank))
    }

    /// Reads the selected section of a numeric variable into native
    /// values.
    pub fn read_section(&mut self, path: &str, section: &Section) -> Result<NumericValues, Error> {
        let (var, buf) = self.read_section_native(path, section)?;
        match var.data_type {
            DataType::String | DataType::Structure => Err(Error::TypeMismatch {
                expected: "a numeric datatype".to_string(),
                found: format!("{:?}", var.data_type),
                context: format!("numeric read of '{path}'"),
            }),
            dt => Ok(decode_numeric(dt, &buf, Endianness::native())),
        }
    }

    /// Reads a section directly into a native slice type.
    pub fn read_section_as<T: Element>(
        &mut self,
        path: &str,
        section: &Section,
    ) -> Result<Vec<T>, Error> {
        let var = self
            .dataset
            .find_variable(path)
            .ok_or_else(|| Error::VariableNotFound(path.to_string()))?;
        check_element_type::<T>(var)?;
        let values = self.read_section(path, section)?;
        T::from_values(values).ok_or(Error::UnexpectedEof)
    }

    /// Reads a string variable: one string per element, whether the
    /// elements are fixed-width bytes or global-heap references.
    pub fn read_section_strings(
        &mut self,
        path: &str,
        section: &Section,
    ) -> Result<Vec<String>, Error> {
        let (var, buf) = self.read_section_native(path, section)?;
        if var.data_type != DataType::String {
            return Err(Error::TypeMismatch {
                expected: "String".to_string(),
                found: format!("{:?}", var.data_type),
                context: format!("string read of '{path}'"),
            });
        }
        let Vinfo::Hdf5(vinfo) = &var.vinfo else {
            return Err(Error::InvalidFileStructure(format!(
                "variable '{path}' carries no hierarchical storage info"
            )));
        };
        let w = vinfo.elem_size.max(1);
        if vinfo.vlen_string {
            let mut out = Vec::with_capacity(buf.len() / w);
            for at in (0..buf.len()).step_by(w) {
                let bytes = self.read_vlen_item(&buf, at)?;
                out.push(String::from_utf8_lossy(&bytes).into_owned());
            }
            Ok(out)
        } else {
            Ok(buf
                .chunks(w)
                .map(|c| {
                    let end = c.iter().position(|&b| b == 0).unwrap_or(c.len());
                    String::from_utf8_lossy(&c[..end]).into_owned()
                })
                .collect())
        }
    }

    /// Reads raw section bytes in native byte order. This is the
    /// layout-dispatch core; structure variables come back as packed
    /// instances to be sliced up via
    /// [`member_offsets`](crate::models::H5Vinfo::member_offsets).
    pub fn read_section_native(
        &mut self,
        path: &str,
        section: &Section,
    ) -> Result<(Variable, Vec<u8>), Error> {
        let var = self
            .dataset
            .find_variable(path)
            .ok_or_else(|| Error::VariableNotFound(path.to_string()))?
            .clone();
        let Vinfo::Hdf5(vinfo) = var.vinfo.clone() else {
            return Err(Error::InvalidFileStructure(format!(
                "variable '{path}' carries no hierarchical storage info"
            )));
        };
        if var.dimensions.iter().any(|d| d.variable_length) {
            return Err(Error::Unsupported(format!(
                "variable-length sequence data in '{path}'"
            )));
        }

        let shape = var.shape();
        if shape.contains(&0) {
            return Ok((var, Vec::new()));
        }
        let elem = vinfo.elem_size;
        let n = section.num_elements(&shape)?;

        let mut buf = match &vinfo.layout {
            StorageLayout::Compact(data) => {
                let mut buf = vec![0u8; n as usize * elem];
                for chunk in Indexer::new(&shape, elem, 0, section, None)? {
                    let src = chunk.file_pos as usize;
                    let dst = chunk.dest_offset as usize * elem;
                    let len = chunk.n_elems as usize * elem;
                    let src_bytes = data.get(src..src + len).ok_or(Error::UnexpectedEof)?;
                    buf[dst..dst + len].copy_from_slice(src_bytes);
                }
                buf
            }
            StorageLayout::Contiguous { .. } => match vinfo.data_address {
                Some(addr) => {
                    let base = self.ctx.abs(addr);
                    let mut buf = vec![0u8; n as usize * elem];
                    for chunk in Indexer::new(&shape, elem, base, section, None)? {
                        let dst = chunk.dest_offset as usize * elem;
                        let len = chunk.n_elems as usize * elem;
                        self.source.read_at(chunk.file_pos, &mut buf[dst..dst + len])?;
                    }
                    buf
                }
                None => {
                    debug!("'{path}' has unallocated storage; synthesizing fill");
                    filled_buffer(n, elem, vinfo.fill_value.as_deref())
                }
            },
            StorageLayout::Chunked {
                chunk_shape,
                btree_address,
            } => self.read_chunked(
                path,
                &shape,
                elem,
                chunk_shape,
                *btree_address,
                vinfo.data_address.is_some(),
                vinfo.fill_value.as_deref(),
                &vinfo.filters,
                section,
            )?,
        };

        // Strings are byte data, heap references are little-endian by
        // definition, and structure instances are decoded member by
        // member; only plain numerics get swapped wholesale.
        if var.data_type.is_numeric() {
            to_native_order(&mut buf, var.data_type.size(), vinfo.endianness);
        }
        Ok((var, buf))
    }

    /// Assembles a section from chunked storage: every stored chunk that
    /// overlaps the request contributes its intersection; missing chunks
    /// leave the fill pattern in place.
    #[allow(clippy::too_many_arguments)]
    fn read_chunked(
        &mut self,
        path: &str,
        shape: &[u64],
        elem: usize,
        chunk_shape: &[u32],
        btree_address: u64,
        allocated: bool,
        fill: Option<&[u8]>,
        filters: &[crate::models::Filter],
        section: &Section,
    ) -> Result<Vec<u8>, Error> {
        if section.has_stride(shape)? {
            return Err(Error::Unsupported(format!(
                "strided access to chunked variable '{path}'"
            )));
        }
        let ranges = section.resolve(shape)?;
        let rank = shape.len();
        let dest_shape: Vec<u64> = ranges.iter().map(Range::len).collect();
        let n: u64 = dest_shape.iter().product();
        let mut buf = filled_buffer(n.max(1), elem, fill);

        if !allocated {
            debug!("'{path}' has no chunk index; synthesizing fill");
            return Ok(buf);
        }
        // The trailing chunk dimension is the element size.
        let chunk_dims: Vec<u64> = chunk_shape
            .iter()
            .take(rank)
            .map(|&c| c as u64)
            .collect();
        if chunk_dims.len() != rank || chunk_dims.iter().any(|&c| c == 0) {
            return Err(Error::InvalidFileStructure(format!(
                "chunk shape {chunk_shape:?} does not cover rank {rank}"
            )));
        }

        let entries = self.chunk_entries(btree_address, rank)?;
        let filters = filters.to_vec();
        for entry in entries.iter() {
            if !overlaps(&entry.offsets, &chunk_dims, &ranges) {
                continue;
            }
            let data = self.read_chunk(entry, &filters, elem)?;
            copy_overlap(
                &data,
                &entry.offsets,
                &chunk_dims,
                &ranges,
                &dest_shape,
                elem,
                &mut buf,
            )?;
        }
        Ok(buf)
    }
}

// Chunk origins come straight from the file; saturate rather than trust
// them not to overflow.
fn overlaps(origin: &[u64], chunk_dims: &[u64], ranges: &[Range]) -> bool {
    origin
        .iter()
        .zip(chunk_dims)
        .zip(ranges)
        .all(|((&o, &c), r)| o <= r.last && o.saturating_add(c) > r.first)
}

/// Copies the intersection of one decoded chunk with the unit-stride
/// request into the destination buffer, one innermost-dimension run at
/// a time.
fn copy_overlap(
    chunk: &[u8],
    origin: &[u64],
    chunk_dims: &[u64],
    ranges: &[Range],
    dest_shape: &[u64],
    elem: usize,
    dest: &mut [u8],
) -> Result<(), Error> {
    let rank = ranges.len();
    if rank == 0 {
        let src = chunk.get(..elem).ok_or(Error::UnexpectedEof)?;
        dest[..elem].copy_from_slice(src);
        return Ok(());
    }

    // Per-dimension intersection in file coordinates.
    let mut lo = vec![0u64; rank];
    let mut hi = vec![0u64; rank];
    for d in 0..rank {
        lo[d] = origin[d].max(ranges[d].first);
        hi[d] = origin[d]
            .saturating_add(chunk_dims[d])
            .saturating_sub(1)
            .min(ranges[d].last);
    }

    // Row-major element strides within the chunk and the destination.
    let mut cstride = vec![1u64; rank];
    let mut dstride = vec![1u64; rank];
    for d in (0..rank.saturating_sub(1)).rev() {
        cstride[d] = cstride[d + 1] * chunk_dims[d + 1];
        dstride[d] = dstride[d + 1] * dest_shape[d + 1];
    }

    let run = (hi[rank - 1] - lo[rank - 1] + 1) as usize;
    let mut coord = lo[..rank - 1].to_vec();
    loop {
        let mut src_idx = (lo[rank - 1] - origin[rank - 1]) as usize;
        let mut dst_idx = (lo[rank - 1] - ranges[rank - 1].first) as usize;
        for d in 0..rank - 1 {
            src_idx += ((coord[d] - origin[d]) * cstride[d]) as usize;
            dst_idx += ((coord[d] - ranges[d].first) * dstride[d]) as usize;
        }
        let src = chunk
            .get(src_idx * elem..(src_idx + run) * elem)
            .ok_or(Error::UnexpectedEof)?;
        dest[dst_idx * elem..(dst_idx + run) * elem].copy_from_slice(src);

        // Advance across the outer intersection box.
        let mut done = true;
        for d in (0..rank - 1).rev() {
            coord[d] += 1;
            if coord[d] <= hi[d] {
                done = false;
                break;
            }
            coord[d] = lo[d];
        }
        if done {
            break;
        }
    }
    Ok(())
}
