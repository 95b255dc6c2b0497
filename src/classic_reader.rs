//! Classic-format (CDF-1/CDF-2) header reader.
//!
//! The classic container is a flat, big-endian header — dimension table,
//! global attribute table, variable table — followed by fixed-placement
//! data. Version 1 stores variable begin offsets as 32-bit, version 2 as
//! 64-bit. All tables share the `(u32 length, bytes, pad-to-4)` string
//! encoding.

use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::error::Error;
use crate::io::RandomAccess;
use crate::models::{
    Attribute, AttrValue, ClassicVinfo, DataType, Dataset, Dimension, NumericValues, Variable,
    Vinfo, CLASSIC_MAGIC,
};

// Table tags.
const NC_DIMENSION: u32 = 0x0A;
const NC_VARIABLE: u32 = 0x0B;
const NC_ATTRIBUTE: u32 = 0x0C;
const ABSENT: u32 = 0x00;

// Element type codes.
const NC_BYTE: u32 = 1;
const NC_CHAR: u32 = 2;
const NC_SHORT: u32 = 3;
const NC_INT: u32 = 4;
const NC_FLOAT: u32 = 5;
const NC_DOUBLE: u32 = 6;

/// `numrecs` sentinel meaning "written by a streaming producer".
const STREAMING: u32 = 0xFFFF_FFFF;

/// Allowed elision of trailing zero padding at end of file.
const TRUNCATION_SLACK: u64 = 3;

pub(crate) fn type_code(dt: DataType) -> u32 {
    match dt {
        DataType::Byte => NC_BYTE,
        DataType::Char => NC_CHAR,
        DataType::Short => NC_SHORT,
        DataType::Int => NC_INT,
        DataType::Float => NC_FLOAT,
        DataType::Double => NC_DOUBLE,
        // The classic format has no other codes; writers validate first.
        _ => NC_BYTE,
    }
}

fn decode_type(code: u32) -> Result<DataType, Error> {
    match code {
        NC_BYTE => Ok(DataType::Byte),
        NC_CHAR => Ok(DataType::Char),
        NC_SHORT => Ok(DataType::Short),
        NC_INT => Ok(DataType::Int),
        NC_FLOAT => Ok(DataType::Float),
        NC_DOUBLE => Ok(DataType::Double),
        other => Err(Error::InvalidFileStructure(format!(
            "unknown classic element type code {other}"
        ))),
    }
}

/// Sequential big-endian cursor over a positional source.
struct HeaderCursor<'a, R: RandomAccess> {
    src: &'a mut R,
    pos: u64,
}

impl<'a, R: RandomAccess> HeaderCursor<'a, R> {
    fn new(src: &'a mut R) -> Self {
        Self { src, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        let buf = self.src.read_vec(self.pos, len)?;
        self.pos += len as u64;
        Ok(buf)
    }

    fn read_u32(&mut self) -> Result<u32, Error> {
        let b = self.read_bytes(4)?;
        Ok(BigEndian::read_u32(&b))
    }

    fn read_u64(&mut self) -> Result<u64, Error> {
        let b = self.read_bytes(8)?;
        Ok(BigEndian::read_u64(&b))
    }

    /// `(u32 length, bytes, pad-to-4)` string. The length is validated
    /// against the remaining file before any allocation.
    fn read_name(&mut self) -> Result<String, Error> {
        let len = self.read_u32()? as usize;
        let remaining = self.src.len()?.saturating_sub(self.pos);
        if len as u64 > remaining {
            return Err(Error::InvalidFileStructure(format!(
                "name length {len} exceeds the {remaining} bytes left in the file"
            )));
        }
        let bytes = self.read_bytes(len)?;
        self.skip_padding(len)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn skip_padding(&mut self, len: usize) -> Result<(), Error> {
        let rem = len % 4;
        if rem != 0 {
            self.read_bytes(4 - rem)?;
        }
        Ok(())
    }
}

/// An open classic-format file: parsed model plus the handle state the
/// read path needs (record size and start).
#[derive(Debug)]
pub struct ClassicFile<R: RandomAccess> {
    pub(crate) source: R,
    pub dataset: Dataset,
    /// Sum of per-record variable sizes: the byte stride between records.
    pub(crate) rec_size: u64,
    /// File offset of record 0.
    pub(crate) rec_start: u64,
    pub version: u8,
}

impl<R: RandomAccess> ClassicFile<R> {
    /// Parses the header of `source`. `tolerant` disables the truncation
    /// check for files with elided trailing records.
    pub fn open(mut source: R, tolerant: bool) -> Result<Self, Error> {
        let actual_len = source.len()?;
        let mut cur = HeaderCursor::new(&mut source);

        let magic = cur.read_bytes(4)?;
        if &magic[0..3] != CLASSIC_MAGIC {
            return Err(Error::InvalidMagicNumber { found: magic });
        }
        let version = magic[3];
        if version != 1 && version != 2 {
            return Err(Error::InvalidFileStructure(format!(
                "unsupported classic version byte {version}"
            )));
        }

        let numrecs_raw = cur.read_u32()?;

        let mut dataset = Dataset::new();

        // Dimension table. Length 0 marks the unlimited dimension.
        let mut unlimited_index: Option<usize> = None;
        let dims = read_tag_count(&mut cur, NC_DIMENSION)?;
        for i in 0..dims {
            let name = cur.read_name()?;
            let length = cur.read_u32()? as u64;
            let mut dim = Dimension::new(name, length);
            if length == 0 {
                if unlimited_index.is_some() {
                    return Err(Error::InvalidFileStructure(
                        "more than one unlimited dimension".to_string(),
                    ));
                }
                dim.unlimited = true;
                unlimited_index = Some(i);
            }
            dataset.root_mut().dimensions.push(dim);
        }

        // Global attribute table.
        let gatts = read_attribute_table(&mut cur)?;
        dataset.root_mut().attributes = gatts;

        // Variable table, tracking placement extrema as we go.
        let nvars = read_tag_count(&mut cur, NC_VARIABLE)?;
        let mut data_start = u64::MAX;
        let mut rec_start = u64::MAX;
        let mut non_record_span: u64 = 0;
        let mut rec_size: u64 = 0;

        for _ in 0..nvars {
            let name = cur.read_name()?;
            let ndims = cur.read_u32()? as usize;
            let mut dimensions = Vec::with_capacity(ndims);
            let mut is_record = false;
            for d in 0..ndims {
                let dimid = cur.read_u32()? as usize;
                let dim = dataset
                    .root()
                    .dimensions
                    .get(dimid)
                    .cloned()
                    .ok_or_else(|| {
                        Error::InvalidFileStructure(format!(
                            "variable '{name}' references dimension {dimid} of {dims}"
                        ))
                    })?;
                if Some(dimid) == unlimited_index {
                    if d != 0 {
                        return Err(Error::InvalidFileStructure(format!(
                            "variable '{name}' uses the unlimited dimension at index {d}"
                        )));
                    }
                    is_record = true;
                }
                dimensions.push(dim);
            }
            let attributes = read_attribute_table(&mut cur)?;
            let data_type = decode_type(cur.read_u32()?)?;
            let vsize = cur.read_u32()? as u64;
            let begin = if version == 1 {
                cur.read_u32()? as u64
            } else {
                cur.read_u64()?
            };

            data_start = data_start.min(begin);
            if is_record {
                rec_start = rec_start.min(begin);
                rec_size += vsize;
            } else {
                non_record_span += vsize;
            }

            let mut var = Variable::new(name, data_type, dimensions);
            var.attributes = attributes;
            var.vinfo = Vinfo::Classic(ClassicVinfo {
                begin,
                vsize,
                elem_size: data_type.size(),
                is_record,
            });
            dataset.root_mut().variables.push(var);
        }

        // Resolve the record count, deriving it for streaming files.
        let num_records = if numrecs_raw == STREAMING {
            if rec_size > 0 && rec_start != u64::MAX && actual_len > rec_start {
                (actual_len - rec_start) / rec_size
            } else {
                0
            }
        } else {
            numrecs_raw as u64
        };
        dataset.num_records = num_records;

        // Back-fill the unlimited dimension length everywhere it appears.
        if let Some(u) = unlimited_index {
            dataset.root_mut().dimensions[u].length = num_records;
            for var in &mut dataset.root_mut().variables {
                if let Some(d0) = var.dimensions.first_mut() {
                    if d0.unlimited {
                        d0.length = num_records;
                    }
                }
            }
        }

        // Size validation: a writer may elide up to 3 bytes of trailing
        // zero padding, anything beyond that is truncation.
        if nvars > 0 && data_start != u64::MAX {
            let computed = data_start + non_record_span + rec_size * num_records;
            if computed > actual_len + TRUNCATION_SLACK {
                if tolerant {
                    debug!(
                        "tolerating truncated classic file: computed {computed}, actual {actual_len}"
                    );
                } else {
                    return Err(Error::TruncatedFile {
                        computed,
                        actual: actual_len,
                    });
                }
            }
        }

        let rec_start = if rec_start == u64::MAX {
            data_start.saturating_add(non_record_span)
        } else {
            rec_start
        };

        Ok(Self {
            source,
            dataset,
            rec_size,
            rec_start,
            version,
        })
    }

    pub fn record_size(&self) -> u64 {
        self.rec_size
    }
}

fn read_tag_count<R: RandomAccess>(
    cur: &mut HeaderCursor<'_, R>,
    expected: u32,
) -> Result<usize, Error> {
    let tag = cur.read_u32()?;
    let count = cur.read_u32()? as usize;
    if tag == ABSENT && count == 0 {
        return Ok(0);
    }
    if tag != expected {
        return Err(Error::InvalidFileStructure(format!(
            "expected table tag {expected:#x}, found {tag:#x}"
        )));
    }
    Ok(count)
}

fn read_attribute_table<R: RandomAccess>(
    cur: &mut HeaderCursor<'_, R>,
) -> Result<Vec<Attribute>, Error> {
    let count = read_tag_count(cur, NC_ATTRIBUTE)?;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let name = cur.read_name()?;
        let code = cur.read_u32()?;
        let nelems = cur.read_u32()? as usize;
        let data_type = decode_type(code)?;
        let value = match data_type {
            DataType::Char => {
                let bytes = cur.read_bytes(nelems)?;
                cur.skip_padding(nelems)?;
                AttrValue::String(String::from_utf8_lossy(&bytes).into_owned())
            }
            numeric => {
                let size = numeric.size() * nelems;
                let bytes = cur.read_bytes(size)?;
                cur.skip_padding(size)?;
                AttrValue::Numeric(decode_numeric_be(numeric, &bytes))
            }
        };
        out.push(Attribute::new(name, value)?);
    }
    Ok(out)
}

/// Decodes a big-endian value array into typed numerics.
pub(crate) fn decode_numeric_be(dt: DataType, bytes: &[u8]) -> NumericValues {
    match dt {
        DataType::Byte => NumericValues::I8(bytes.iter().map(|&b| b as i8).collect()),
        DataType::Short => NumericValues::I16(
            bytes.chunks_exact(2).map(BigEndian::read_i16).collect(),
        ),
        DataType::Int => {
            NumericValues::I32(bytes.chunks_exact(4).map(BigEndian::read_i32).collect())
        }
        DataType::Float => {
            NumericValues::F32(bytes.chunks_exact(4).map(BigEndian::read_f32).collect())
        }
        DataType::Double => {
            NumericValues::F64(bytes.chunks_exact(8).map(BigEndian::read_f64).collect())
        }
        _ => NumericValues::U8(bytes.to_vec()),
    }
}
