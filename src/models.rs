//! The logical data model shared by both container formats.
//!
//! Dimensions, attributes, variables, and groups form a pure ownership
//! graph populated by the codecs during header parsing (read path) or by
//! the define-phase builder (write path). Groups live in an arena indexed
//! by position so that link resolution can walk ancestry without back
//! pointers.

use crate::error::Error;

/// Classic-format magic: 'C' 'D' 'F' followed by the version byte.
pub const CLASSIC_MAGIC: &[u8; 3] = b"CDF";
/// Hierarchical-format signature, found at a 512-byte-aligned offset.
pub const HDF5_MAGIC: &[u8; 8] = b"\x89HDF\r\n\x1a\n";

/// Index of a group in the dataset arena.
pub type GroupId = usize;

/// Element types representable in either container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Byte,
    UByte,
    Char,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    Float,
    Double,
    String,
    /// Compound type; member layout lives on the variable.
    Structure,
}

impl DataType {
    /// Size in bytes of one element. `String` elements are heap references
    /// whose size is layout-dependent; `Structure` size is the sum of its
    /// members and is tracked on the variable.
    pub fn size(&self) -> usize {
        match self {
            DataType::Byte | DataType::UByte | DataType::Char => 1,
            DataType::Short | DataType::UShort => 2,
            DataType::Int | DataType::UInt | DataType::Float => 4,
            DataType::Long | DataType::ULong | DataType::Double => 8,
            DataType::String | DataType::Structure => 0,
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, DataType::Char | DataType::String | DataType::Structure)
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(
            self,
            DataType::UByte | DataType::UShort | DataType::UInt | DataType::ULong
        )
    }
}

/// Byte order of on-disk numeric values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl Endianness {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }
}

/// A named (or anonymous) axis of a variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimension {
    pub name: Option<String>,
    pub length: u64,
    pub shared: bool,
    pub unlimited: bool,
    pub variable_length: bool,
}

impl Dimension {
    /// A shared, fixed-length dimension.
    pub fn new(name: impl Into<String>, length: u64) -> Self {
        Self {
            name: Some(name.into()),
            length,
            shared: true,
            unlimited: false,
            variable_length: false,
        }
    }

    /// The single unlimited (record) dimension. Length 0 is the
    /// placeholder before the first record is written.
    pub fn unlimited(name: impl Into<String>, length: u64) -> Self {
        Self {
            name: Some(name.into()),
            length,
            shared: true,
            unlimited: true,
            variable_length: false,
        }
    }

    /// An anonymous dimension private to one variable.
    pub fn anonymous(length: u64) -> Self {
        Self {
            name: None,
            length,
            shared: false,
            unlimited: false,
            variable_length: false,
        }
    }
}

/// Fixed-size numeric attribute payloads, one vector per element type.
#[derive(Debug, Clone, PartialEq)]
pub enum NumericValues {
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl NumericValues {
    pub fn len(&self) -> usize {
        match self {
            NumericValues::I8(v) => v.len(),
            NumericValues::U8(v) => v.len(),
            NumericValues::I16(v) => v.len(),
            NumericValues::U16(v) => v.len(),
            NumericValues::I32(v) => v.len(),
            NumericValues::U32(v) => v.len(),
            NumericValues::I64(v) => v.len(),
            NumericValues::U64(v) => v.len(),
            NumericValues::F32(v) => v.len(),
            NumericValues::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data_type(&self) -> DataType {
        match self {
            NumericValues::I8(_) => DataType::Byte,
            NumericValues::U8(_) => DataType::UByte,
            NumericValues::I16(_) => DataType::Short,
            NumericValues::U16(_) => DataType::UShort,
            NumericValues::I32(_) => DataType::Int,
            NumericValues::U32(_) => DataType::UInt,
            NumericValues::I64(_) => DataType::Long,
            NumericValues::U64(_) => DataType::ULong,
            NumericValues::F32(_) => DataType::Float,
            NumericValues::F64(_) => DataType::Double,
        }
    }

    /// Lossy widening view used by fill-value and comparison logic.
    pub fn as_f64s(&self) -> Vec<f64> {
        match self {
            NumericValues::I8(v) => v.iter().map(|x| *x as f64).collect(),
            NumericValues::U8(v) => v.iter().map(|x| *x as f64).collect(),
            NumericValues::I16(v) => v.iter().map(|x| *x as f64).collect(),
            NumericValues::U16(v) => v.iter().map(|x| *x as f64).collect(),
            NumericValues::I32(v) => v.iter().map(|x| *x as f64).collect(),
            NumericValues::U32(v) => v.iter().map(|x| *x as f64).collect(),
            NumericValues::I64(v) => v.iter().map(|x| *x as f64).collect(),
            NumericValues::U64(v) => v.iter().map(|x| *x as f64).collect(),
            NumericValues::F32(v) => v.iter().map(|x| *x as f64).collect(),
            NumericValues::F64(v) => v.iter().copied().collect(),
        }
    }
}

/// Attribute payload: a single string, an array of strings, or a
/// fixed-size numeric array.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    String(String),
    Strings(Vec<String>),
    Numeric(NumericValues),
}

/// A named key/value annotation. Immutable once constructed; the
/// constructor validates and fixes the value.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    name: String,
    value: AttrValue,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: AttrValue) -> Result<Self, Error> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidFileStructure(
                "attribute name must not be empty".to_string(),
            ));
        }
        if let AttrValue::Numeric(n) = &value {
            if n.is_empty() {
                return Err(Error::InvalidFileStructure(format!(
                    "attribute '{name}' has no elements"
                )));
            }
        }
        Ok(Self { name, value })
    }

    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Result<Self, Error> {
        Self::new(name, AttrValue::String(value.into()))
    }

    pub fn numeric(name: impl Into<String>, values: NumericValues) -> Result<Self, Error> {
        Self::new(name, AttrValue::Numeric(values))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &AttrValue {
        &self.value
    }

    pub fn data_type(&self) -> DataType {
        match &self.value {
            AttrValue::String(_) | AttrValue::Strings(_) => DataType::String,
            AttrValue::Numeric(n) => n.data_type(),
        }
    }

    pub fn len(&self) -> usize {
        match &self.value {
            AttrValue::String(_) => 1,
            AttrValue::Strings(v) => v.len(),
            AttrValue::Numeric(n) => n.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_string(&self) -> Option<&str> {
        match &self.value {
            AttrValue::String(s) => Some(s),
            AttrValue::Strings(v) => v.first().map(|s| s.as_str()),
            AttrValue::Numeric(_) => None,
        }
    }

    pub fn as_f64s(&self) -> Option<Vec<f64>> {
        match &self.value {
            AttrValue::Numeric(n) => Some(n.as_f64s()),
            _ => None,
        }
    }
}

/// One DEFLATE-class filter step in a chunk pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub id: u16,
    pub name: String,
    pub client_data: Vec<u32>,
}

pub const FILTER_DEFLATE: u16 = 1;
pub const FILTER_SHUFFLE: u16 = 2;

/// How a hierarchical-format variable's data is laid out on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLayout {
    /// Raw bytes inline in the object header.
    Compact(Vec<u8>),
    /// One file region of `size` bytes.
    Contiguous { size: u64 },
    /// Regular chunks indexed by a B-tree. `chunk_shape` has one entry
    /// per dimension plus a trailing element-size entry.
    Chunked { chunk_shape: Vec<u32>, btree_address: u64 },
}

/// Per-codec I/O metadata attached to a variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Vinfo {
    /// Define phase: no storage assigned yet.
    None,
    Classic(ClassicVinfo),
    Hdf5(H5Vinfo),
}

/// Classic-format placement: byte offset of the first element, padded
/// byte span, and whether the variable rides the record dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassicVinfo {
    pub begin: u64,
    pub vsize: u64,
    pub elem_size: usize,
    pub is_record: bool,
}

/// Hierarchical-format placement and decode parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct H5Vinfo {
    /// Data start, or `None` when storage is unallocated.
    pub data_address: Option<u64>,
    pub layout: StorageLayout,
    pub endianness: Endianness,
    pub elem_size: usize,
    pub filters: Vec<Filter>,
    /// Raw fill bytes from the fill-value message, if any.
    pub fill_value: Option<Vec<u8>>,
    /// Byte offset of each member inside a structure instance,
    /// parallel to `Variable::members`.
    pub member_offsets: Vec<u32>,
    /// String elements are `(count, heap address, index)` references
    /// into a global heap rather than inline fixed-width bytes.
    pub vlen_string: bool,
}

/// A typed multidimensional variable, possibly a structure with members.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub data_type: DataType,
    pub dimensions: Vec<Dimension>,
    pub attributes: Vec<Attribute>,
    /// Member variables when `data_type` is `Structure`.
    pub members: Vec<Variable>,
    pub vinfo: Vinfo,
}

impl Variable {
    pub fn new(name: impl Into<String>, data_type: DataType, dimensions: Vec<Dimension>) -> Self {
        Self {
            name: name.into(),
            data_type,
            dimensions,
            attributes: Vec::new(),
            members: Vec::new(),
            vinfo: Vinfo::None,
        }
    }

    /// Logical shape: the sequence of dimension lengths.
    pub fn shape(&self) -> Vec<u64> {
        self.dimensions.iter().map(|d| d.length).collect()
    }

    pub fn num_elements(&self) -> u64 {
        self.dimensions.iter().map(|d| d.length).product()
    }

    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    pub fn is_unlimited(&self) -> bool {
        self.dimensions.first().is_some_and(|d| d.unlimited)
    }

    pub fn find_attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name() == name)
    }

    /// Enforces the single-outermost-unlimited-dimension invariant.
    pub fn validate_dimensions(&self) -> Result<(), Error> {
        let unlimited = self.dimensions.iter().filter(|d| d.unlimited).count();
        if unlimited > 1 {
            return Err(Error::InvalidFileStructure(format!(
                "variable '{}' has {} unlimited dimensions",
                self.name, unlimited
            )));
        }
        if unlimited == 1 && !self.dimensions[0].unlimited {
            return Err(Error::InvalidFileStructure(format!(
                "variable '{}' has an unlimited dimension that is not outermost",
                self.name
            )));
        }
        Ok(())
    }
}

/// One node of the group tree. Parentage is by arena index, never by
/// back pointer, so ancestry walks terminate.
#[derive(Debug, Clone, Default)]
pub struct Group {
    pub name: String,
    pub parent: Option<GroupId>,
    pub children: Vec<GroupId>,
    pub dimensions: Vec<Dimension>,
    pub variables: Vec<Variable>,
    pub attributes: Vec<Attribute>,
}

impl Group {
    pub fn find_variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn find_dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions
            .iter()
            .find(|d| d.name.as_deref() == Some(name))
    }

    pub fn find_attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name() == name)
    }
}

/// A parsed file: the group arena plus record bookkeeping. The root
/// group is always index 0; the classic format has only the root.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub groups: Vec<Group>,
    /// Physical record count for the unlimited dimension.
    pub num_records: u64,
}

impl Dataset {
    pub fn new() -> Self {
        Self {
            groups: vec![Group::default()],
            num_records: 0,
        }
    }

    pub fn root(&self) -> &Group {
        &self.groups[0]
    }

    pub fn root_mut(&mut self) -> &mut Group {
        &mut self.groups[0]
    }

    /// Adds a child group under `parent`, returning its arena index.
    pub fn add_group(&mut self, parent: GroupId, name: impl Into<String>) -> GroupId {
        let id = self.groups.len();
        self.groups.push(Group {
            name: name.into(),
            parent: Some(parent),
            ..Group::default()
        });
        self.groups[parent].children.push(id);
        id
    }

    /// True when `ancestor` appears on `group`'s parent chain (or is the
    /// group itself). Used by the link-cycle check.
    pub fn is_ancestor(&self, ancestor: GroupId, group: GroupId) -> bool {
        let mut cur = Some(group);
        while let Some(id) = cur {
            if id == ancestor {
                return true;
            }
            cur = self.groups[id].parent;
        }
        false
    }

    /// Slash-separated absolute path of a group.
    pub fn group_path(&self, id: GroupId) -> String {
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(g) = cur {
            if g != 0 {
                parts.push(self.groups[g].name.clone());
            }
            cur = self.groups[g].parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    /// Looks up a variable by slash-separated path ("temp" or
    /// "/model/layer/temp").
    pub fn find_variable(&self, path: &str) -> Option<&Variable> {
        let (group, name) = self.resolve_parent(path)?;
        self.groups[group].find_variable(name)
    }

    /// Looks up a group by slash-separated path.
    pub fn find_group(&self, path: &str) -> Option<GroupId> {
        let mut cur = 0;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            cur = *self.groups[cur]
                .children
                .iter()
                .find(|&&c| self.groups[c].name == part)?;
        }
        Some(cur)
    }

    fn resolve_parent<'p>(&self, path: &'p str) -> Option<(GroupId, &'p str)> {
        let trimmed = path.trim_start_matches('/');
        match trimmed.rsplit_once('/') {
            None => Some((0, trimmed)),
            Some((dir, name)) => Some((self.find_group(dir)?, name)),
        }
    }

    /// Flattened view over every variable in every group, with the group
    /// id it belongs to. Classic-format compatibility lookups use this.
    pub fn all_variables(&self) -> impl Iterator<Item = (GroupId, &Variable)> {
        self.groups
            .iter()
            .enumerate()
            .flat_map(|(id, g)| g.variables.iter().map(move |v| (id, v)))
    }
}
