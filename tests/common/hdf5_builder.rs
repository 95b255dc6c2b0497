//! Assembles minimal but structurally-honest hierarchical-format files
//! in memory: superblock v0, local heaps, group B-tree + SNOD, v1
//! object headers, contiguous and chunked layouts, filter pipelines,
//! global heaps, and symbolic links. Addresses are stored relative to
//! the superblock offset, exactly as on disk.

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;

const MAGIC: &[u8; 8] = b"\x89HDF\r\n\x1a\n";
const UNDEF: u64 = u64::MAX;

/// Element datatypes the builder can encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    F32,
    F64,
    I16,
    I32,
    U8,
    /// Fixed-width string of the given byte width.
    FixedStr(u32),
    /// Variable-length string: elements are 16-byte global-heap refs.
    VlenStr,
}

impl Dtype {
    pub fn size(self) -> usize {
        match self {
            Dtype::F32 | Dtype::I32 => 4,
            Dtype::F64 => 8,
            Dtype::I16 => 2,
            Dtype::U8 => 1,
            Dtype::FixedStr(w) => w as usize,
            Dtype::VlenStr => 16, // count(4) + address(8) + index(4)
        }
    }

    /// The on-disk datatype message body (little-endian numerics).
    fn encode(self) -> Vec<u8> {
        let mut b = Vec::new();
        match self {
            Dtype::F32 => {
                b.extend_from_slice(&[0x11, 0x20, 0x3F, 0x00]);
                b.extend_from_slice(&4u32.to_le_bytes());
                b.extend_from_slice(&0u16.to_le_bytes()); // bit offset
                b.extend_from_slice(&32u16.to_le_bytes()); // precision
                b.extend_from_slice(&[23, 8, 0, 23]); // exp loc/size, mant loc/size
                b.extend_from_slice(&127u32.to_le_bytes()); // exp bias
            }
            Dtype::F64 => {
                b.extend_from_slice(&[0x11, 0x20, 0x3F, 0x00]);
                b.extend_from_slice(&8u32.to_le_bytes());
                b.extend_from_slice(&0u16.to_le_bytes());
                b.extend_from_slice(&64u16.to_le_bytes());
                b.extend_from_slice(&[52, 11, 0, 52]);
                b.extend_from_slice(&1023u32.to_le_bytes());
            }
            Dtype::I32 | Dtype::I16 | Dtype::U8 => {
                let (size, signed) = match self {
                    Dtype::I32 => (4u32, true),
                    Dtype::I16 => (2, true),
                    _ => (1, false),
                };
                b.extend_from_slice(&[0x10, if signed { 0x08 } else { 0x00 }, 0x00, 0x00]);
                b.extend_from_slice(&size.to_le_bytes());
                b.extend_from_slice(&0u16.to_le_bytes());
                b.extend_from_slice(&(size as u16 * 8).to_le_bytes());
            }
            Dtype::FixedStr(w) => {
                b.extend_from_slice(&[0x13, 0x00, 0x00, 0x00]);
                b.extend_from_slice(&w.to_le_bytes());
            }
            Dtype::VlenStr => {
                b.extend_from_slice(&[0x19, 0x01, 0x00, 0x00]);
                b.extend_from_slice(&16u32.to_le_bytes());
                // Base type: 1-byte string.
                b.extend_from_slice(&[0x13, 0x00, 0x00, 0x00]);
                b.extend_from_slice(&1u32.to_le_bytes());
            }
        }
        b
    }
}

/// One attribute to attach to an object header.
#[derive(Debug, Clone)]
pub struct AttrSpec {
    pub name: String,
    pub dtype: Dtype,
    pub shape: Vec<u64>,
    pub data: Vec<u8>,
}

impl AttrSpec {
    pub fn string(name: &str, value: &str) -> Self {
        let mut data = value.as_bytes().to_vec();
        data.push(0);
        Self {
            name: name.to_string(),
            dtype: Dtype::FixedStr(data.len() as u32),
            shape: vec![],
            data,
        }
    }

    pub fn f64s(name: &str, values: &[f64]) -> Self {
        Self {
            name: name.to_string(),
            dtype: Dtype::F64,
            shape: if values.len() == 1 {
                vec![]
            } else {
                vec![values.len() as u64]
            },
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    pub fn i32s(name: &str, values: &[i32]) -> Self {
        Self {
            name: name.to_string(),
            dtype: Dtype::I32,
            shape: if values.len() == 1 {
                vec![]
            } else {
                vec![values.len() as u64]
            },
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }
}

/// Filters to apply, in pipeline order, to every chunk.
#[derive(Debug, Clone, Copy, Default)]
pub struct Filters {
    pub shuffle: bool,
    pub deflate: bool,
}

/// One dataset to place in a group.
#[derive(Debug, Clone)]
pub struct DatasetSpec {
    pub name: String,
    pub dtype: Dtype,
    pub shape: Vec<u64>,
    /// Little-endian element bytes, row-major, ignored when
    /// `unallocated` is set. For `VlenStr` use `strings` instead.
    pub data: Vec<u8>,
    pub strings: Vec<String>,
    /// Per-dimension chunk sizes; `None` means contiguous.
    pub chunks: Option<Vec<u32>>,
    pub filters: Filters,
    pub fill: Option<Vec<u8>>,
    pub attrs: Vec<AttrSpec>,
    pub unallocated: bool,
    /// Force the object header messages into a continuation block.
    pub use_continuation: bool,
}

impl DatasetSpec {
    pub fn contiguous(name: &str, dtype: Dtype, shape: &[u64], data: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            dtype,
            shape: shape.to_vec(),
            data,
            strings: vec![],
            chunks: None,
            filters: Filters::default(),
            fill: None,
            attrs: vec![],
            unallocated: false,
            use_continuation: false,
        }
    }

    pub fn chunked(
        name: &str,
        dtype: Dtype,
        shape: &[u64],
        chunks: &[u32],
        data: Vec<u8>,
    ) -> Self {
        let mut ds = Self::contiguous(name, dtype, shape, data);
        ds.chunks = Some(chunks.to_vec());
        ds
    }

    pub fn vlen_strings(name: &str, shape: &[u64], strings: &[&str]) -> Self {
        let mut ds = Self::contiguous(name, Dtype::VlenStr, shape, vec![]);
        ds.strings = strings.iter().map(|s| s.to_string()).collect();
        ds
    }

    pub fn with_filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_fill(mut self, fill: Vec<u8>) -> Self {
        self.fill = Some(fill);
        self
    }

    pub fn with_attr(mut self, attr: AttrSpec) -> Self {
        self.attrs.push(attr);
        self
    }

    pub fn without_storage(mut self) -> Self {
        self.unallocated = true;
        self
    }

    pub fn with_continuation(mut self) -> Self {
        self.use_continuation = true;
        self
    }
}

/// One group: datasets, subgroups, and symbolic links.
#[derive(Debug, Clone, Default)]
pub struct GroupSpec {
    pub name: String,
    pub datasets: Vec<DatasetSpec>,
    pub groups: Vec<GroupSpec>,
    /// `(link name, target path)` pairs.
    pub links: Vec<(String, String)>,
}

impl GroupSpec {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn dataset(mut self, ds: DatasetSpec) -> Self {
        self.datasets.push(ds);
        self
    }

    pub fn group(mut self, g: GroupSpec) -> Self {
        self.groups.push(g);
        self
    }

    pub fn link(mut self, name: &str, target: &str) -> Self {
        self.links.push((name.to_string(), target.to_string()));
        self
    }
}

pub struct Hdf5Builder {
    root: GroupSpec,
    root_attrs: Vec<AttrSpec>,
    sb_offset: u64,
}

impl Default for Hdf5Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Hdf5Builder {
    pub fn new() -> Self {
        Self {
            root: GroupSpec::default(),
            root_attrs: vec![],
            sb_offset: 0,
        }
    }

    /// Places the superblock at `offset` (must be 0 or a 512-doubling).
    pub fn at_offset(mut self, offset: u64) -> Self {
        self.sb_offset = offset;
        self
    }

    pub fn dataset(mut self, ds: DatasetSpec) -> Self {
        self.root.datasets.push(ds);
        self
    }

    pub fn group(mut self, g: GroupSpec) -> Self {
        self.root.groups.push(g);
        self
    }

    pub fn link(mut self, name: &str, target: &str) -> Self {
        self.root.links.push((name.to_string(), target.to_string()));
        self
    }

    pub fn root_attr(mut self, attr: AttrSpec) -> Self {
        self.root_attrs.push(attr);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut img = Image {
            buf: vec![0u8; self.sb_offset as usize],
            base: self.sb_offset,
        };

        // Superblock v0 with patch slots.
        img.put(MAGIC);
        img.put(&[0, 0, 0, 0, 0]); // sb/fs/root/reserved/shared versions
        img.put(&[8, 8, 0]); // offset size, length size, reserved
        img.put(&4u16.to_le_bytes()); // group leaf K
        img.put(&16u16.to_le_bytes()); // group internal K
        img.put(&0u32.to_le_bytes()); // flags
        img.put(&self.sb_offset.to_le_bytes()); // base address
        img.put(&UNDEF.to_le_bytes()); // free-space address
        let eof_patch = img.reserve_u64();
        img.put(&UNDEF.to_le_bytes()); // driver info
        // Root symbol-table entry.
        img.put(&0u64.to_le_bytes()); // link name offset
        let root_ohdr_patch = img.reserve_u64();
        img.put(&1u32.to_le_bytes()); // cache type 1
        img.put(&0u32.to_le_bytes());
        let root_btree_patch = img.reserve_u64();
        let root_heap_patch = img.reserve_u64();
        img.align8();

        let built = write_group(&mut img, &self.root, &self.root_attrs);
        img.patch_u64(root_ohdr_patch, built.ohdr);
        img.patch_u64(root_btree_patch, built.btree);
        img.patch_u64(root_heap_patch, built.heap);

        let eof = img.buf.len() as u64 - img.base;
        img.patch_u64(eof_patch, eof);
        img.buf
    }
}

// ---- assembly internals ----

struct Image {
    buf: Vec<u8>,
    base: u64,
}

impl Image {
    fn put(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Current position as a stored (base-relative) address.
    fn here(&self) -> u64 {
        self.buf.len() as u64 - self.base
    }

    fn reserve_u64(&mut self) -> usize {
        let pos = self.buf.len();
        self.put(&0u64.to_le_bytes());
        pos
    }

    fn patch_u64(&mut self, pos: usize, value: u64) {
        self.buf[pos..pos + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn align8(&mut self) {
        while self.buf.len() % 8 != 0 {
            self.buf.push(0);
        }
    }
}

struct BuiltGroup {
    ohdr: u64,
    btree: u64,
    heap: u64,
}

fn pad8(n: usize) -> usize {
    n.div_ceil(8) * 8
}

/// An object header message with its padded body.
fn message(msg_type: u16, body: &[u8]) -> Vec<u8> {
    let padded = pad8(body.len());
    let mut m = Vec::with_capacity(8 + padded);
    m.extend_from_slice(&msg_type.to_le_bytes());
    m.extend_from_slice(&(padded as u16).to_le_bytes());
    m.extend_from_slice(&[0, 0, 0, 0]); // flags + reserved
    m.extend_from_slice(body);
    m.resize(8 + padded, 0);
    m
}

/// Writes a v1 object header from assembled messages; returns its
/// stored address.
fn write_object_header(img: &mut Image, messages: &[Vec<u8>], split_for_continuation: bool) -> u64 {
    img.align8();
    let addr = img.here();

    if !split_for_continuation {
        let total: usize = messages.iter().map(Vec::len).sum();
        img.put(&[1, 0]);
        img.put(&(messages.len() as u16).to_le_bytes());
        img.put(&1u32.to_le_bytes()); // reference count
        img.put(&(total as u32).to_le_bytes());
        img.put(&[0, 0, 0, 0]); // prefix pad
        for m in messages {
            img.put(m);
        }
        return addr;
    }

    // First block holds only a continuation message; the rest of the
    // messages land in a separate block written afterwards.
    let cont_body_len = 16usize;
    let first_len = 8 + cont_body_len;
    img.put(&[1, 0]);
    img.put(&((messages.len() + 1) as u16).to_le_bytes());
    img.put(&1u32.to_le_bytes());
    img.put(&(first_len as u32).to_le_bytes());
    img.put(&[0, 0, 0, 0]);
    img.put(&0x0010u16.to_le_bytes());
    img.put(&(cont_body_len as u16).to_le_bytes());
    img.put(&[0, 0, 0, 0]);
    let cont_addr_patch = img.reserve_u64();
    let cont_len_patch = img.reserve_u64();

    img.align8();
    let block_addr = img.here();
    let block_len: usize = messages.iter().map(Vec::len).sum();
    for m in messages {
        img.put(m);
    }
    img.patch_u64(cont_addr_patch, block_addr);
    img.patch_u64(cont_len_patch, block_len as u64);
    addr
}

fn dataspace_body(shape: &[u64]) -> Vec<u8> {
    let mut b = vec![1, shape.len() as u8, 0, 0, 0, 0, 0, 0];
    for &d in shape {
        b.extend_from_slice(&d.to_le_bytes());
    }
    b
}

fn attribute_body(attr: &AttrSpec) -> Vec<u8> {
    let mut name = attr.name.as_bytes().to_vec();
    name.push(0);
    let dt = attr.dtype.encode();
    let ds = dataspace_body(&attr.shape);

    let mut b = vec![1, 0];
    b.extend_from_slice(&(name.len() as u16).to_le_bytes());
    b.extend_from_slice(&(dt.len() as u16).to_le_bytes());
    b.extend_from_slice(&(ds.len() as u16).to_le_bytes());
    for part in [&name, &dt, &ds] {
        b.extend_from_slice(part);
        b.resize(pad8(b.len()), 0);
    }
    b.extend_from_slice(&attr.data);
    b
}

fn fill_value_body(fill: &[u8]) -> Vec<u8> {
    let mut b = vec![2, 1, 1, 1];
    b.extend_from_slice(&(fill.len() as u32).to_le_bytes());
    b.extend_from_slice(fill);
    b
}

fn filter_pipeline_body(filters: Filters) -> Vec<u8> {
    let n = filters.shuffle as u8 + filters.deflate as u8;
    let mut b = vec![1, n, 0, 0, 0, 0, 0, 0];
    // Pipeline order: shuffle first, deflate second.
    if filters.shuffle {
        b.extend_from_slice(&2u16.to_le_bytes()); // id
        b.extend_from_slice(&0u16.to_le_bytes()); // name length
        b.extend_from_slice(&0u16.to_le_bytes()); // flags
        b.extend_from_slice(&1u16.to_le_bytes()); // client values
        b.extend_from_slice(&0u32.to_le_bytes()); // elem size, patched by caller
        b.extend_from_slice(&0u32.to_le_bytes()); // pad to even count
    }
    if filters.deflate {
        b.extend_from_slice(&1u16.to_le_bytes());
        b.extend_from_slice(&0u16.to_le_bytes());
        b.extend_from_slice(&0u16.to_le_bytes());
        b.extend_from_slice(&1u16.to_le_bytes());
        b.extend_from_slice(&6u32.to_le_bytes()); // compression level
        b.extend_from_slice(&0u32.to_le_bytes());
    }
    b
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn shuffle(data: &[u8], elem: usize) -> Vec<u8> {
    if elem <= 1 || data.len() % elem != 0 {
        return data.to_vec();
    }
    let n = data.len() / elem;
    let mut out = vec![0u8; data.len()];
    for i in 0..n {
        for j in 0..elem {
            out[j * n + i] = data[i * elem + j];
        }
    }
    out
}

/// Writes chunk data and its B-tree; returns the B-tree address.
fn write_chunks(img: &mut Image, ds: &DatasetSpec, chunk_dims: &[u32]) -> u64 {
    let elem = ds.dtype.size();
    let rank = ds.shape.len();
    let per_chunk: u64 = chunk_dims.iter().map(|&c| c as u64).product();
    let chunk_bytes = per_chunk as usize * elem;

    // Enumerate chunk origins in row-major order.
    let counts: Vec<u64> = ds
        .shape
        .iter()
        .zip(chunk_dims)
        .map(|(&s, &c)| s.div_ceil(c as u64))
        .collect();
    let mut origins: Vec<Vec<u64>> = vec![];
    let mut idx = vec![0u64; rank];
    loop {
        origins.push(
            idx.iter()
                .zip(chunk_dims)
                .map(|(&i, &c)| i * c as u64)
                .collect(),
        );
        let mut d = rank;
        while d > 0 {
            d -= 1;
            idx[d] += 1;
            if idx[d] < counts[d] {
                break;
            }
            idx[d] = 0;
            if d == 0 {
                d = usize::MAX;
                break;
            }
        }
        if d == usize::MAX || rank == 0 {
            break;
        }
    }

    // Source strides over the full variable.
    let mut stride = vec![1u64; rank];
    for d in (0..rank.saturating_sub(1)).rev() {
        stride[d] = stride[d + 1] * ds.shape[d + 1];
    }

    let mut entries: Vec<(Vec<u64>, u64, u32)> = vec![];
    for origin in &origins {
        // Gather this chunk's elements, zero padding past the edge.
        let mut chunk = vec![0u8; chunk_bytes];
        let mut coord = vec![0u64; rank];
        for flat in 0..per_chunk {
            let mut rem = flat;
            for d in (0..rank).rev() {
                coord[d] = origin[d] + rem % chunk_dims[d] as u64;
                rem /= chunk_dims[d] as u64;
            }
            if coord.iter().zip(&ds.shape).any(|(&c, &s)| c >= s) {
                continue;
            }
            let src: u64 = coord.iter().zip(&stride).map(|(&c, &st)| c * st).sum();
            let dst = flat as usize * elem;
            chunk[dst..dst + elem]
                .copy_from_slice(&ds.data[src as usize * elem..(src as usize + 1) * elem]);
        }
        let mut stored = chunk;
        if ds.filters.shuffle {
            stored = shuffle(&stored, elem);
        }
        if ds.filters.deflate {
            stored = deflate(&stored);
        }
        img.align8();
        let addr = img.here();
        img.put(&stored);
        entries.push((origin.clone(), addr, stored.len() as u32));
    }

    // Leaf B-tree node over every chunk.
    img.align8();
    let btree = img.here();
    img.put(b"TREE");
    img.put(&[1, 0]); // node type 1, level 0
    img.put(&(entries.len() as u16).to_le_bytes());
    img.put(&UNDEF.to_le_bytes());
    img.put(&UNDEF.to_le_bytes());
    let key = |img: &mut Image, size: u32, offsets: &[u64]| {
        img.put(&size.to_le_bytes());
        img.put(&0u32.to_le_bytes()); // filter mask
        for &o in offsets {
            img.put(&o.to_le_bytes());
        }
        img.put(&0u64.to_le_bytes()); // element-size coordinate
    };
    for (origin, addr, size) in &entries {
        key(img, *size, origin);
        img.put(&addr.to_le_bytes());
    }
    // Upper-bound key.
    let bound: Vec<u64> = ds
        .shape
        .iter()
        .zip(chunk_dims)
        .map(|(&s, &c)| s.div_ceil(c as u64) * c as u64)
        .collect();
    key(img, 0, &bound);
    btree
}

/// Writes one string collection as a GCOL; returns `(address, indices)`.
fn write_global_heap(img: &mut Image, strings: &[String]) -> (u64, Vec<u32>) {
    img.align8();
    let addr = img.here();
    let mut body = Vec::new();
    let mut indices = Vec::new();
    for (i, s) in strings.iter().enumerate() {
        let index = (i + 1) as u16;
        body.extend_from_slice(&index.to_le_bytes());
        body.extend_from_slice(&1u16.to_le_bytes()); // refcount
        body.extend_from_slice(&[0u8; 4]);
        body.extend_from_slice(&(s.len() as u64).to_le_bytes());
        body.extend_from_slice(s.as_bytes());
        body.resize(pad8(body.len()), 0);
        indices.push(index as u32);
    }
    body.extend_from_slice(&[0u8; 16]); // free-space terminator
    let total = 16 + body.len() as u64;

    img.put(b"GCOL");
    img.put(&[1, 0, 0, 0]);
    img.put(&total.to_le_bytes());
    img.put(&body);
    (addr, indices)
}

/// Writes a dataset's storage and object header; returns the header
/// address.
fn write_dataset(img: &mut Image, ds: &DatasetSpec) -> u64 {
    let elem = ds.dtype.size();

    // Vlen strings materialize their heap and reference data first.
    let data = if ds.dtype == Dtype::VlenStr && !ds.unallocated {
        let (heap_addr, indices) = write_global_heap(img, &ds.strings);
        let mut refs = Vec::new();
        for (s, &idx) in ds.strings.iter().zip(&indices) {
            refs.extend_from_slice(&(s.len() as u32).to_le_bytes());
            refs.extend_from_slice(&heap_addr.to_le_bytes());
            refs.extend_from_slice(&idx.to_le_bytes());
        }
        refs
    } else {
        ds.data.clone()
    };
    let ds_for_chunks = DatasetSpec {
        data: data.clone(),
        ..ds.clone()
    };

    let mut layout = vec![3u8];
    match (&ds.chunks, ds.unallocated) {
        (None, false) => {
            img.align8();
            let addr = img.here();
            img.put(&data);
            layout.push(1);
            layout.extend_from_slice(&addr.to_le_bytes());
            layout.extend_from_slice(&(data.len() as u64).to_le_bytes());
        }
        (None, true) => {
            layout.push(1);
            layout.extend_from_slice(&UNDEF.to_le_bytes());
            layout.extend_from_slice(&0u64.to_le_bytes());
        }
        (Some(chunk_dims), unallocated) => {
            let btree = if unallocated {
                UNDEF
            } else {
                write_chunks(img, &ds_for_chunks, chunk_dims)
            };
            layout.push(2);
            layout.push(ds.shape.len() as u8 + 1);
            layout.extend_from_slice(&btree.to_le_bytes());
            for &c in chunk_dims {
                layout.extend_from_slice(&c.to_le_bytes());
            }
            layout.extend_from_slice(&(elem as u32).to_le_bytes());
        }
    }

    let mut messages = vec![
        message(0x0001, &dataspace_body(&ds.shape)),
        message(0x0003, &ds.dtype.encode()),
    ];
    if let Some(fill) = &ds.fill {
        messages.push(message(0x0005, &fill_value_body(fill)));
    }
    messages.push(message(0x0008, &layout));
    if ds.filters.shuffle || ds.filters.deflate {
        let mut body = filter_pipeline_body(ds.filters);
        if ds.filters.shuffle {
            // Patch the shuffle client value with the element size.
            body[16..20].copy_from_slice(&(elem as u32).to_le_bytes());
        }
        messages.push(message(0x000B, &body));
    }
    for attr in &ds.attrs {
        messages.push(message(0x000C, &attribute_body(attr)));
    }
    write_object_header(img, &messages, ds.use_continuation)
}

fn write_group(img: &mut Image, group: &GroupSpec, attrs: &[AttrSpec]) -> BuiltGroup {
    // Children first so their header addresses are known.
    let mut entries: Vec<(String, u64, u32, [u8; 16])> = Vec::new();
    for ds in &group.datasets {
        let ohdr = write_dataset(img, ds);
        entries.push((ds.name.clone(), ohdr, 0, [0u8; 16]));
    }
    for g in &group.groups {
        let built = write_group(img, g, &[]);
        entries.push((g.name.clone(), built.ohdr, 0, [0u8; 16]));
    }

    // Local heap: names and link targets.
    img.align8();
    let heap = img.here();
    let mut heap_data = vec![0u8]; // offset 0 reserved
    let offset_of = |heap_data: &mut Vec<u8>, s: &str| -> u64 {
        heap_data.resize(pad8(heap_data.len()), 0);
        let off = heap_data.len() as u64;
        heap_data.extend_from_slice(s.as_bytes());
        heap_data.push(0);
        off
    };
    let mut name_offsets = Vec::new();
    for (name, ..) in &entries {
        name_offsets.push(offset_of(&mut heap_data, name));
    }
    let mut link_entries: Vec<(String, u64, u64)> = Vec::new();
    for (name, target) in &group.links {
        let name_off = offset_of(&mut heap_data, name);
        let target_off = offset_of(&mut heap_data, target);
        link_entries.push((name.clone(), name_off, target_off));
    }
    heap_data.resize(pad8(heap_data.len()).max(8), 0);

    let heap_data_addr = heap + 32;
    img.put(b"HEAP");
    img.put(&[1, 0, 0, 0]);
    img.put(&(heap_data.len() as u64).to_le_bytes());
    img.put(&UNDEF.to_le_bytes()); // free list
    img.put(&heap_data_addr.to_le_bytes());
    img.put(&heap_data);

    // SNOD with every entry.
    img.align8();
    let snod = img.here();
    let total_entries = entries.len() + link_entries.len();
    img.put(b"SNOD");
    img.put(&[1, 0]);
    img.put(&(total_entries as u16).to_le_bytes());
    for ((_, ohdr, cache, scratch), name_off) in entries.iter().zip(&name_offsets) {
        img.put(&name_off.to_le_bytes());
        img.put(&ohdr.to_le_bytes());
        img.put(&cache.to_le_bytes());
        img.put(&0u32.to_le_bytes());
        img.put(scratch);
    }
    for (_, name_off, target_off) in &link_entries {
        img.put(&name_off.to_le_bytes());
        img.put(&UNDEF.to_le_bytes());
        img.put(&2u32.to_le_bytes());
        img.put(&0u32.to_le_bytes());
        let mut scratch = [0u8; 16];
        scratch[0..4].copy_from_slice(&(*target_off as u32).to_le_bytes());
        img.put(&scratch);
    }

    // B-tree root: one leaf child.
    img.align8();
    let btree = img.here();
    img.put(b"TREE");
    img.put(&[0, 0]);
    img.put(&1u16.to_le_bytes());
    img.put(&UNDEF.to_le_bytes());
    img.put(&UNDEF.to_le_bytes());
    img.put(&0u64.to_le_bytes()); // key 0
    img.put(&snod.to_le_bytes());
    img.put(&0u64.to_le_bytes()); // key 1

    // Group object header: symbol table message plus any attributes.
    let mut st_body = Vec::new();
    st_body.extend_from_slice(&btree.to_le_bytes());
    st_body.extend_from_slice(&heap.to_le_bytes());
    let mut messages = vec![message(0x0011, &st_body)];
    for attr in attrs {
        messages.push(message(0x000C, &attribute_body(attr)));
    }
    let ohdr = write_object_header(img, &messages, false);

    BuiltGroup { ohdr, btree, heap }
}
