//! Classic-format writer: define phase, two-pass header serialization,
//! and section writes.
//!
//! Absolute data offsets are unknown until the header size is known, so
//! the header is serialized once with placeholder begins, offsets are
//! assigned in table order (non-record variables first, then per-record
//! slots), and the placeholders are patched in place.

use byteorder::{BigEndian, ByteOrder};

use crate::classic_reader::type_code;
use crate::error::Error;
use crate::indexer::Indexer;
use crate::io::RandomAccess;
use crate::models::{
    Attribute, AttrValue, ClassicVinfo, DataType, Dataset, Dimension, NumericValues, Variable,
    Vinfo,
};
use crate::section::{Range, Section};

const NC_DIMENSION: u32 = 0x0A;
const NC_VARIABLE: u32 = 0x0B;
const NC_ATTRIBUTE: u32 = 0x0C;
const ABSENT: u32 = 0x00;

/// Offset of the `numrecs` field in the header.
const NUMRECS_OFFSET: u64 = 4;

// Default fill values, used when a variable has no `_FillValue`.
const FILL_BYTE: i8 = -127;
const FILL_CHAR: u8 = 0;
const FILL_SHORT: i16 = -32767;
const FILL_INT: i32 = -2147483647;
const FILL_FLOAT: f32 = 9.969_21e36;
const FILL_DOUBLE: f64 = 9.969209968386869e36;

/// Define-phase builder producing a [`WritableDataset`]. Dimensions,
/// attributes, and variables are added here; `create` freezes the
/// schema and lays the file out.
pub struct DatasetBuilder {
    dataset: Dataset,
    version: u8,
    fill: bool,
}

impl Default for DatasetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DatasetBuilder {
    pub fn new() -> Self {
        Self {
            dataset: Dataset::new(),
            version: 1,
            fill: false,
        }
    }

    /// Use 64-bit begin offsets (CDF-2).
    pub fn with_64bit_offsets(mut self) -> Self {
        self.version = 2;
        self
    }

    /// Pre-fill every unwritten record slot with the variable's fill
    /// value when records are added.
    pub fn with_fill(mut self) -> Self {
        self.fill = true;
        self
    }

    pub fn add_dimension(&mut self, name: &str, length: u64) -> Result<&mut Self, Error> {
        self.check_new_dimension(name)?;
        self.dataset.root_mut().dimensions.push(Dimension::new(name, length));
        Ok(self)
    }

    pub fn add_unlimited_dimension(&mut self, name: &str) -> Result<&mut Self, Error> {
        self.check_new_dimension(name)?;
        if self.dataset.root().dimensions.iter().any(|d| d.unlimited) {
            return Err(Error::InvalidFileStructure(
                "a classic file has at most one unlimited dimension".to_string(),
            ));
        }
        self.dataset
            .root_mut()
            .dimensions
            .push(Dimension::unlimited(name, 0));
        Ok(self)
    }

    fn check_new_dimension(&self, name: &str) -> Result<(), Error> {
        if self.dataset.root().find_dimension(name).is_some() {
            return Err(Error::InvalidFileStructure(format!(
                "dimension '{name}' already exists"
            )));
        }
        Ok(())
    }

    pub fn add_attribute(&mut self, att: Attribute) -> &mut Self {
        self.dataset.root_mut().attributes.push(att);
        self
    }

    pub fn add_variable(
        &mut self,
        name: &str,
        data_type: DataType,
        dim_names: &[&str],
    ) -> Result<&mut Self, Error> {
        if !matches!(
            data_type,
            DataType::Byte
                | DataType::Char
                | DataType::Short
                | DataType::Int
                | DataType::Float
                | DataType::Double
        ) {
            return Err(Error::Unsupported(format!(
                "classic format cannot store {data_type:?}"
            )));
        }
        if self.dataset.root().find_variable(name).is_some() {
            return Err(Error::InvalidFileStructure(format!(
                "variable '{name}' already exists"
            )));
        }
        let mut dimensions = Vec::with_capacity(dim_names.len());
        for dn in dim_names {
            let dim = self.dataset.root().find_dimension(dn).ok_or_else(|| {
                Error::InvalidFileStructure(format!("unknown dimension '{dn}'"))
            })?;
            dimensions.push(dim.clone());
        }
        let var = Variable::new(name, data_type, dimensions);
        var.validate_dimensions()?;
        self.dataset.root_mut().variables.push(var);
        Ok(self)
    }

    pub fn add_variable_attribute(&mut self, var: &str, att: Attribute) -> Result<&mut Self, Error> {
        let v = self
            .dataset
            .root_mut()
            .variables
            .iter_mut()
            .find(|v| v.name == var)
            .ok_or_else(|| Error::InvalidFileStructure(format!("unknown variable '{var}'")))?;
        v.attributes.push(att);
        Ok(self)
    }

    /// Freezes the schema, lays out the file, and writes the header.
    pub fn create<R: RandomAccess>(mut self, mut sink: R) -> Result<WritableDataset<R>, Error> {
        // Pass 1: serialize with placeholder begins, remembering where
        // each begin field landed.
        let (mut header, begin_positions) = serialize_header(&self.dataset, self.version, 0)?;
        let data_start = header.len() as u64;

        // Pass 2: assign offsets in table order and patch in place.
        let record_count = self
            .dataset
            .root()
            .variables
            .iter()
            .filter(|v| v.is_unlimited())
            .count();
        let mut cursor = data_start;
        let mut begins = Vec::with_capacity(self.dataset.root().variables.len());
        for var in self.dataset.root().variables.iter().filter(|v| !v.is_unlimited()) {
            begins.push((var.name.clone(), cursor, false));
            cursor += variable_vsize(var, record_count);
        }
        let rec_start = cursor;
        let mut rec_size = 0u64;
        for var in self.dataset.root().variables.iter().filter(|v| v.is_unlimited()) {
            begins.push((var.name.clone(), cursor, true));
            let vsize = variable_vsize(var, record_count);
            cursor += vsize;
            rec_size += vsize;
        }
        for (name, begin, _) in &begins {
            let pos = begin_positions
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, p)| *p)
                .ok_or_else(|| Error::InvalidFileStructure(format!("missing begin slot for '{name}'")))?;
            if self.version == 1 {
                let b = u32::try_from(*begin).map_err(|_| {
                    Error::InvalidFileStructure(
                        "file requires 64-bit offsets; use with_64bit_offsets".to_string(),
                    )
                })?;
                BigEndian::write_u32(&mut header[pos..pos + 4], b);
            } else {
                BigEndian::write_u64(&mut header[pos..pos + 8], *begin);
            }
        }

        // Record the placements on the model.
        for (name, begin, is_record) in &begins {
            let var = self
                .dataset
                .root_mut()
                .variables
                .iter_mut()
                .find(|v| v.name == *name)
                .ok_or_else(|| Error::InvalidFileStructure(format!("lost variable '{name}'")))?;
            let vsize = variable_vsize(var, record_count);
            var.vinfo = Vinfo::Classic(ClassicVinfo {
                begin: *begin,
                vsize,
                elem_size: var.data_type.size(),
                is_record: *is_record,
            });
        }

        sink.write_at(0, &header)?;
        sink.set_min_len(rec_start)?;

        let mut out = WritableDataset {
            sink,
            dataset: self.dataset,
            rec_size,
            rec_start,
            fill: self.fill,
            version: self.version,
        };
        if out.fill {
            out.fill_non_record_region()?;
        }
        Ok(out)
    }
}

/// Padded per-variable byte size; the record dimension is excluded for
/// record variables. With exactly one record variable the padding is
/// omitted (format wart, preserved).
fn variable_vsize(var: &Variable, record_var_count: usize) -> u64 {
    let elems: u64 = var
        .dimensions
        .iter()
        .filter(|d| !d.unlimited)
        .map(|d| d.length)
        .product();
    let raw = elems * var.data_type.size() as u64;
    if var.is_unlimited() && record_var_count == 1 {
        raw
    } else {
        raw.div_ceil(4) * 4
    }
}

fn push_name(out: &mut Vec<u8>, name: &str) {
    out.extend_from_slice(&(name.len() as u32).to_be_bytes());
    out.extend_from_slice(name.as_bytes());
    let rem = name.len() % 4;
    if rem != 0 {
        out.extend_from_slice(&[0u8; 4][..4 - rem]);
    }
}

fn push_attributes(out: &mut Vec<u8>, atts: &[Attribute]) -> Result<(), Error> {
    if atts.is_empty() {
        out.extend_from_slice(&ABSENT.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        return Ok(());
    }
    out.extend_from_slice(&NC_ATTRIBUTE.to_be_bytes());
    out.extend_from_slice(&(atts.len() as u32).to_be_bytes());
    for att in atts {
        push_name(out, att.name());
        match att.value() {
            AttrValue::String(s) => {
                out.extend_from_slice(&type_code(DataType::Char).to_be_bytes());
                out.extend_from_slice(&(s.len() as u32).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
                let rem = s.len() % 4;
                if rem != 0 {
                    out.extend_from_slice(&[0u8; 4][..4 - rem]);
                }
            }
            AttrValue::Strings(_) => {
                return Err(Error::Unsupported(
                    "classic attributes hold a single string".to_string(),
                ));
            }
            AttrValue::Numeric(n) => {
                let dt = n.data_type();
                out.extend_from_slice(&type_code(dt).to_be_bytes());
                out.extend_from_slice(&(n.len() as u32).to_be_bytes());
                let bytes = encode_numeric_be(n);
                let rem = bytes.len() % 4;
                out.extend_from_slice(&bytes);
                if rem != 0 {
                    out.extend_from_slice(&[0u8; 4][..4 - rem]);
                }
            }
        }
    }
    Ok(())
}

pub(crate) fn encode_numeric_be(n: &NumericValues) -> Vec<u8> {
    let mut out = Vec::new();
    match n {
        NumericValues::I8(v) => out.extend(v.iter().map(|x| *x as u8)),
        NumericValues::U8(v) => out.extend_from_slice(v),
        NumericValues::I16(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
        NumericValues::U16(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
        NumericValues::I32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
        NumericValues::U32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
        NumericValues::I64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
        NumericValues::U64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
        NumericValues::F32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
        NumericValues::F64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes())),
    }
    out
}

/// Serializes the header with `numrecs` and placeholder begins; returns
/// the bytes and, per variable, the position of its begin field.
fn serialize_header(
    dataset: &Dataset,
    version: u8,
    numrecs: u32,
) -> Result<(Vec<u8>, Vec<(String, usize)>), Error> {
    let root = dataset.root();
    let mut out = Vec::new();
    out.extend_from_slice(b"CDF");
    out.push(version);
    out.extend_from_slice(&numrecs.to_be_bytes());

    if root.dimensions.is_empty() {
        out.extend_from_slice(&ABSENT.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
    } else {
        out.extend_from_slice(&NC_DIMENSION.to_be_bytes());
        out.extend_from_slice(&(root.dimensions.len() as u32).to_be_bytes());
        for dim in &root.dimensions {
            let name = dim.name.as_deref().ok_or_else(|| {
                Error::InvalidFileStructure("classic dimensions must be named".to_string())
            })?;
            push_name(&mut out, name);
            let len = if dim.unlimited { 0 } else { dim.length as u32 };
            out.extend_from_slice(&len.to_be_bytes());
        }
    }

    push_attributes(&mut out, &root.attributes)?;

    let mut begin_positions = Vec::with_capacity(root.variables.len());
    if root.variables.is_empty() {
        out.extend_from_slice(&ABSENT.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
    } else {
        out.extend_from_slice(&NC_VARIABLE.to_be_bytes());
        out.extend_from_slice(&(root.variables.len() as u32).to_be_bytes());
        let record_vars = root.variables.iter().filter(|v| v.is_unlimited()).count();
        for var in &root.variables {
            push_name(&mut out, &var.name);
            out.extend_from_slice(&(var.dimensions.len() as u32).to_be_bytes());
            for dim in &var.dimensions {
                let id = root
                    .dimensions
                    .iter()
                    .position(|d| d.name == dim.name)
                    .ok_or_else(|| {
                        Error::InvalidFileStructure(format!(
                            "variable '{}' uses an unshared dimension",
                            var.name
                        ))
                    })?;
                out.extend_from_slice(&(id as u32).to_be_bytes());
            }
            push_attributes(&mut out, &var.attributes)?;
            out.extend_from_slice(&type_code(var.data_type).to_be_bytes());
            out.extend_from_slice(&(variable_vsize(var, record_vars) as u32).to_be_bytes());
            begin_positions.push((var.name.clone(), out.len()));
            if version == 1 {
                out.extend_from_slice(&0u32.to_be_bytes());
            } else {
                out.extend_from_slice(&0u64.to_be_bytes());
            }
        }
    }
    Ok((out, begin_positions))
}

/// A created classic file accepting data writes. Record growth extends
/// the file; `flush` patches `numrecs`.
pub struct WritableDataset<R: RandomAccess> {
    sink: R,
    pub dataset: Dataset,
    rec_size: u64,
    rec_start: u64,
    fill: bool,
    version: u8,
}

impl<R: RandomAccess> WritableDataset<R> {
    pub fn num_records(&self) -> u64 {
        self.dataset.num_records
    }

    /// Writes `values` at `origin`; the written block's shape is taken
    /// from `shape`. Record variables grow the record count as needed.
    pub fn write(
        &mut self,
        var_name: &str,
        origin: &[u64],
        shape: &[u64],
        values: &NumericValues,
    ) -> Result<(), Error> {
        let var = self
            .dataset
            .find_variable(var_name)
            .ok_or_else(|| Error::InvalidFileStructure(format!("unknown variable '{var_name}'")))?
            .clone();
        let Vinfo::Classic(vinfo) = var.vinfo else {
            return Err(Error::InvalidFileStructure(format!(
                "variable '{var_name}' has no classic placement"
            )));
        };
        if origin.len() != var.rank() || shape.len() != var.rank() {
            return Err(Error::InvalidRange(format!(
                "origin/shape rank does not match variable rank {}",
                var.rank()
            )));
        }
        let n: u64 = shape.iter().product();
        if n != values.len() as u64 {
            return Err(Error::InvalidRange(format!(
                "shape selects {n} elements but {} values were given",
                values.len()
            )));
        }
        if values.data_type() != var.data_type
            && !(var.data_type == DataType::Char && values.data_type() == DataType::UByte)
        {
            return Err(Error::TypeMismatch {
                expected: format!("{:?}", var.data_type),
                found: format!("{:?}", values.data_type()),
                context: format!("write to '{var_name}'"),
            });
        }

        // Record growth happens before placement so the section is valid.
        let mut full_shape = var.shape();
        if vinfo.is_record {
            let needed = origin[0] + shape[0];
            if needed > self.dataset.num_records {
                self.set_num_records(needed)?;
            }
            full_shape[0] = self.dataset.num_records;
        }

        let mut ranges = Vec::with_capacity(origin.len());
        for (&o, &s) in origin.iter().zip(shape) {
            if s == 0 {
                return Err(Error::InvalidRange("empty write shape".to_string()));
            }
            ranges.push(Some(Range::new(o, o + s - 1, 1)?));
        }
        let section = Section::new(ranges);

        let record_stride = vinfo.is_record.then_some(self.rec_size);
        let indexer = Indexer::new(
            &full_shape,
            vinfo.elem_size,
            vinfo.begin,
            &section,
            record_stride,
        )?;
        let bytes = encode_numeric_be(values);
        let elem = vinfo.elem_size as u64;
        for chunk in indexer {
            let start = (chunk.dest_offset * elem) as usize;
            let end = start + (chunk.n_elems * elem) as usize;
            self.sink.write_at(chunk.file_pos, &bytes[start..end])?;
        }
        Ok(())
    }

    /// Grows the record count, filling new slots when fill-on-create was
    /// requested, and patches `numrecs` in the header.
    pub fn set_num_records(&mut self, n: u64) -> Result<(), Error> {
        let old = self.dataset.num_records;
        if n <= old {
            return Ok(());
        }
        self.sink.set_min_len(self.rec_start + n * self.rec_size)?;
        if self.fill {
            for rec in old..n {
                self.fill_record(rec)?;
            }
        }
        self.dataset.num_records = n;
        for var in &mut self.dataset.root_mut().variables {
            if let Some(d0) = var.dimensions.first_mut() {
                if d0.unlimited {
                    d0.length = n;
                }
            }
        }
        for dim in &mut self.dataset.root_mut().dimensions {
            if dim.unlimited {
                dim.length = n;
            }
        }
        self.sink
            .write_at(NUMRECS_OFFSET, &(n as u32).to_be_bytes())?;
        Ok(())
    }

    fn fill_non_record_region(&mut self) -> Result<(), Error> {
        let vars: Vec<Variable> = self
            .dataset
            .root()
            .variables
            .iter()
            .filter(|v| !v.is_unlimited())
            .cloned()
            .collect();
        for var in vars {
            let Vinfo::Classic(vinfo) = &var.vinfo else { continue };
            let fill = fill_bytes(&var);
            let mut block = Vec::with_capacity(vinfo.vsize as usize);
            while block.len() + fill.len() <= vinfo.vsize as usize {
                block.extend_from_slice(&fill);
            }
            block.resize(vinfo.vsize as usize, 0);
            self.sink.write_at(vinfo.begin, &block)?;
        }
        Ok(())
    }

    /// Fills every record variable's slot in record `rec`.
    fn fill_record(&mut self, rec: u64) -> Result<(), Error> {
        let vars: Vec<Variable> = self
            .dataset
            .root()
            .variables
            .iter()
            .filter(|v| v.is_unlimited())
            .cloned()
            .collect();
        for var in vars {
            let Vinfo::Classic(vinfo) = &var.vinfo else { continue };
            let fill = fill_bytes(&var);
            let mut block = Vec::with_capacity(vinfo.vsize as usize);
            while block.len() + fill.len() <= vinfo.vsize as usize {
                block.extend_from_slice(&fill);
            }
            block.resize(vinfo.vsize as usize, 0);
            self.sink
                .write_at(vinfo.begin + rec * self.rec_size, &block)?;
        }
        Ok(())
    }

    /// Finishes all writes and returns the sink.
    pub fn close(mut self) -> Result<R, Error> {
        let numrecs = self.dataset.num_records as u32;
        self.sink
            .write_at(NUMRECS_OFFSET, &numrecs.to_be_bytes())?;
        Ok(self.sink)
    }

    pub fn version(&self) -> u8 {
        self.version
    }
}

/// One element of the variable's fill value, big-endian: `_FillValue`
/// if present, else the per-type default.
fn fill_bytes(var: &Variable) -> Vec<u8> {
    if let Some(att) = var.find_attribute("_FillValue") {
        match att.value() {
            AttrValue::Numeric(n) => {
                let bytes = encode_numeric_be(n);
                if !bytes.is_empty() {
                    return bytes[..var.data_type.size().min(bytes.len())].to_vec();
                }
            }
            AttrValue::String(s) if !s.is_empty() => {
                return s.as_bytes()[..1].to_vec();
            }
            _ => {}
        }
    }
    match var.data_type {
        DataType::Byte | DataType::UByte => vec![FILL_BYTE as u8],
        DataType::Char => vec![FILL_CHAR],
        DataType::Short | DataType::UShort => FILL_SHORT.to_be_bytes().to_vec(),
        DataType::Int | DataType::UInt => FILL_INT.to_be_bytes().to_vec(),
        DataType::Float => FILL_FLOAT.to_be_bytes().to_vec(),
        DataType::Double => FILL_DOUBLE.to_be_bytes().to_vec(),
        _ => vec![0],
    }
}
