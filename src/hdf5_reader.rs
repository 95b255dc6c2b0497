//! Hierarchical-format (HDF5-style) header reader.
//!
//! Parses the superblock, symbol-table B-trees, local heaps, and v1
//! object headers into the shared data model. Groups nest; datasets
//! become [`Variable`]s carrying an [`H5Vinfo`] with their storage
//! layout, byte order, filter pipeline, and fill value. Symbolic links
//! are resolved after the whole tree has been read, with an explicit
//! ancestry check so cyclic links are dropped instead of followed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::error::Error;
use crate::hdf5_chunks::{ChunkEntry, GlobalHeap};
use crate::io::RandomAccess;
use crate::models::{
    Attribute, AttrValue, DataType, Dataset, Dimension, Endianness, Filter, GroupId, H5Vinfo,
    StorageLayout, Variable, Vinfo, HDF5_MAGIC,
};
use crate::utils::{decode_numeric, pad_to, read_cstring};

pub(crate) const TREE_SIGNATURE: &[u8; 4] = b"TREE";
const SNOD_SIGNATURE: &[u8; 4] = b"SNOD";
const HEAP_SIGNATURE: &[u8; 4] = b"HEAP";

// Object header message types.
const MSG_NIL: u16 = 0x0000;
const MSG_DATASPACE: u16 = 0x0001;
const MSG_DATATYPE: u16 = 0x0003;
const MSG_FILL_VALUE_OLD: u16 = 0x0004;
const MSG_FILL_VALUE: u16 = 0x0005;
const MSG_DATA_LAYOUT: u16 = 0x0008;
const MSG_FILTER_PIPELINE: u16 = 0x000B;
const MSG_ATTRIBUTE: u16 = 0x000C;
const MSG_COMMENT: u16 = 0x000D;
const MSG_MOD_TIME_OLD: u16 = 0x000E;
const MSG_CONTINUATION: u16 = 0x0010;
const MSG_SYMBOL_TABLE: u16 = 0x0011;
const MSG_MOD_TIME: u16 = 0x0012;

// Datatype classes.
const DT_FIXED_POINT: u8 = 0;
const DT_FLOATING_POINT: u8 = 1;
const DT_STRING: u8 = 3;
const DT_COMPOUND: u8 = 6;
const DT_REFERENCE: u8 = 7;
const DT_ENUM: u8 = 8;
const DT_VLEN: u8 = 9;
const DT_ARRAY: u8 = 10;

// Bounds against corrupted or self-referential structures.
const MAX_RECURSION_DEPTH: usize = 64;
const MAX_HEADER_BLOCKS: usize = 64;
const MAX_HEADER_BYTES: usize = 1 << 26;
const MAX_MESSAGES: usize = 4096;

/// The signature must sit at offset 0 or a doubling 512-aligned offset
/// within the first 50000 bytes.
const SUPERBLOCK_SCAN_BOUND: u64 = 50_000;

/// Reads a little-endian unsigned integer of `size` bytes (1..=8).
pub(crate) fn read_uint(data: &[u8], pos: usize, size: usize) -> Result<u64, Error> {
    let end = pos.checked_add(size).ok_or(Error::UnexpectedEof)?;
    if end > data.len() || size == 0 || size > 8 {
        return Err(Error::UnexpectedEof);
    }
    let mut val: u64 = 0;
    for i in 0..size {
        val |= (data[pos + i] as u64) << (i * 8);
    }
    Ok(val)
}

fn read_u8(data: &[u8], pos: usize) -> Result<u8, Error> {
    data.get(pos).copied().ok_or(Error::UnexpectedEof)
}

fn read_u16(data: &[u8], pos: usize) -> Result<u16, Error> {
    Ok(read_uint(data, pos, 2)? as u16)
}

fn read_u32(data: &[u8], pos: usize) -> Result<u32, Error> {
    Ok(read_uint(data, pos, 4)? as u32)
}

/// Superblock parameters threaded through all parsing.
#[derive(Debug, Clone, Copy)]
pub(crate) struct H5Ctx {
    pub offset_size: usize,
    pub length_size: usize,
    /// File offset of the superblock; all stored addresses are relative
    /// to it.
    pub base: u64,
}

impl H5Ctx {
    /// Reads an offset-sized address; `None` is the undefined sentinel
    /// (all bits set).
    pub fn read_offset(&self, data: &[u8], pos: usize) -> Result<Option<u64>, Error> {
        let raw = read_uint(data, pos, self.offset_size)?;
        let undef = if self.offset_size == 8 {
            u64::MAX
        } else {
            (1u64 << (self.offset_size * 8)) - 1
        };
        Ok((raw != undef).then_some(raw))
    }

    pub fn read_length(&self, data: &[u8], pos: usize) -> Result<u64, Error> {
        read_uint(data, pos, self.length_size)
    }

    /// Absolute file position of a stored address.
    pub fn abs(&self, addr: u64) -> u64 {
        self.base + addr
    }
}

/// A deferred symbolic-link entry, resolved after the tree is read.
struct PendingLink {
    parent: GroupId,
    name: String,
    target: String,
}

enum LinkTarget {
    Group(GroupId),
    Variable(GroupId, usize),
}

/// An open hierarchical-format file: the parsed model plus the lazily
/// populated per-address caches the chunked read path uses.
pub struct Hdf5File<R: RandomAccess> {
    pub(crate) source: R,
    pub(crate) ctx: H5Ctx,
    pub dataset: Dataset,
    /// Chunk B-tree entry lists keyed by B-tree root address.
    pub(crate) chunk_cache: HashMap<u64, Arc<Vec<ChunkEntry>>>,
    /// Global heap collections keyed by heap address.
    pub(crate) heap_cache: HashMap<u64, GlobalHeap>,
}

impl<R: RandomAccess> Hdf5File<R> {
    pub fn open(mut source: R) -> Result<Self, Error> {
        let actual_len = source.len()?;
        let sb_offset = find_superblock(&mut source, actual_len)?;
        let sb = source.read_vec(sb_offset, 512.min((actual_len - sb_offset) as usize))?;

        let (ctx, eof_addr, root) = parse_superblock(&sb, sb_offset)?;
        if ctx.abs(eof_addr) > actual_len {
            return Err(Error::TruncatedFile {
                computed: ctx.abs(eof_addr),
                actual: actual_len,
            });
        }

        let mut file = Self {
            source,
            ctx,
            dataset: Dataset::new(),
            chunk_cache: HashMap::new(),
            heap_cache: HashMap::new(),
        };

        // Root group attributes live on the root object header.
        let root_info = file.parse_object(ctx.abs(root.header_addr), "/")?;
        file.dataset.root_mut().attributes = root_info.attributes;

        // Prefer the scratch-pad addresses; fall back to the symbol
        // table message when the scratch was not cached.
        let (btree, heap) = match (root.btree_addr, root.heap_addr) {
            (Some(b), Some(h)) => (b, h),
            _ => root_info.symbol_table.ok_or_else(|| {
                Error::InvalidFileStructure("root object has no symbol table".to_string())
            })?,
        };

        let mut pending = Vec::new();
        let mut visited = Vec::new();
        file.read_group(0, btree, heap, &mut pending, &mut visited, 0)?;
        file.resolve_links(pending);
        Ok(file)
    }
}

/// Scans 0, 512, 1024, 2048, ... for the 8-byte signature.
fn find_superblock<R: RandomAccess>(source: &mut R, len: u64) -> Result<u64, Error> {
    let mut candidate = 0u64;
    let mut found_bytes = Vec::new();
    loop {
        if candidate + 8 > len || candidate > SUPERBLOCK_SCAN_BOUND {
            break;
        }
        let magic = source.read_vec(candidate, 8)?;
        if magic == HDF5_MAGIC {
            return Ok(candidate);
        }
        if candidate == 0 {
            found_bytes = magic;
            candidate = 512;
        } else {
            candidate *= 2;
        }
    }
    Err(Error::InvalidMagicNumber { found: found_bytes })
}

/// Root symbol-table entry pulled from the superblock.
struct RootEntry {
    header_addr: u64,
    btree_addr: Option<u64>,
    heap_addr: Option<u64>,
}

/// Parses a v0/v1 superblock; returns the context, the end-of-file
/// address, and the root entry.
fn parse_superblock(sb: &[u8], sb_offset: u64) -> Result<(H5Ctx, u64, RootEntry), Error> {
    let pos = 8; // past the signature
    let version = read_u8(sb, pos)?;
    if version > 1 {
        return Err(Error::Unsupported(format!(
            "superblock version {version} (only v0/v1)"
        )));
    }
    let offset_size = read_u8(sb, pos + 5)? as usize;
    let length_size = read_u8(sb, pos + 6)? as usize;
    if !(1..=8).contains(&offset_size) || !(1..=8).contains(&length_size) {
        return Err(Error::InvalidFileStructure(format!(
            "invalid offset/length sizes {offset_size}/{length_size}"
        )));
    }
    let ctx = H5Ctx {
        offset_size,
        length_size,
        base: sb_offset,
    };

    // Fixed part after the version block: leaf K(2), internal K(2),
    // flags(4); v1 adds indexed-storage K(2) + reserved(2).
    let var_start = if version == 0 { pos + 16 } else { pos + 20 };

    // base(O), free-space(O), eof(O), driver-info(O). The stored base
    // address should equal the superblock offset; when it does not, the
    // offset the signature was actually found at wins.
    if let Some(stored_base) = ctx.read_offset(sb, var_start)? {
        if stored_base != sb_offset {
            warn!("stored base address {stored_base} does not match superblock offset {sb_offset}");
        }
    }
    let eof_addr = ctx
        .read_offset(sb, var_start + 2 * offset_size)?
        .ok_or_else(|| Error::InvalidFileStructure("undefined end-of-file address".to_string()))?;

    let entry = var_start + 4 * offset_size;
    let header_addr = ctx
        .read_offset(sb, entry + offset_size)?
        .ok_or_else(|| Error::InvalidFileStructure("undefined root object header".to_string()))?;
    let cache_type = read_u32(sb, entry + 2 * offset_size)?;
    let (btree_addr, heap_addr) = if cache_type == 1 {
        let scratch = entry + 2 * offset_size + 8;
        (
            ctx.read_offset(sb, scratch)?,
            ctx.read_offset(sb, scratch + offset_size)?,
        )
    } else {
        (None, None)
    };

    Ok((
        ctx,
        eof_addr,
        RootEntry {
            header_addr,
            btree_addr,
            heap_addr,
        },
    ))
}

// ---- Local heap ----

impl<R: RandomAccess> Hdf5File<R> {
    /// Returns the absolute address of a local heap's data segment.
    fn local_heap_data(&mut self, heap_addr: u64) -> Result<u64, Error> {
        let ctx = self.ctx;
        let header_len = 8 + 2 * ctx.length_size + ctx.offset_size;
        let buf = self.source.read_vec(ctx.abs(heap_addr), header_len)?;
        if &buf[0..4] != HEAP_SIGNATURE {
            return Err(Error::InvalidFileStructure(format!(
                "expected HEAP signature at address {heap_addr}"
            )));
        }
        let data_addr = ctx
            .read_offset(&buf, 8 + 2 * ctx.length_size)?
            .ok_or_else(|| {
                Error::InvalidFileStructure(format!("heap at {heap_addr} has no data segment"))
            })?;
        Ok(ctx.abs(data_addr))
    }

    /// Reads a NUL-terminated name out of a heap data segment.
    fn heap_string(&mut self, heap_data: u64, offset: u64) -> Result<String, Error> {
        // Names tend to be short; fetch a bounded window and grow it
        // until a NUL appears.
        let mut window = 64usize;
        loop {
            let avail = self.source.len()?.saturating_sub(heap_data + offset);
            let take = window.min(avail as usize);
            let buf = self.source.read_vec(heap_data + offset, take)?;
            if let Some(s) = read_cstring(&buf, 0) {
                return Ok(s);
            }
            if take < window || window >= 4096 {
                return Err(Error::InvalidFileStructure(format!(
                    "unterminated heap string at {heap_data}+{offset}"
                )));
            }
            window *= 2;
        }
    }
}

// ---- Group B-tree traversal ----

/// One symbol-table entry as stored in an SNOD leaf.
struct RawEntry {
    link_name_offset: u64,
    header_addr: Option<u64>,
    cache_type: u32,
    scratch: [u8; 16],
}

impl<R: RandomAccess> Hdf5File<R> {
    /// Walks a group B-tree (TREE type 0), collecting SNOD entries in
    /// key order. Internal nodes recurse into every child.
    fn read_group_btree(&mut self, btree_addr: u64, depth: usize) -> Result<Vec<RawEntry>, Error> {
        if depth > MAX_RECURSION_DEPTH {
            return Err(Error::InvalidFileStructure(
                "group B-tree recursion depth exceeded".to_string(),
            ));
        }
        let ctx = self.ctx;
        let head_len = 8 + 2 * ctx.offset_size;
        let head = self.source.read_vec(ctx.abs(btree_addr), head_len)?;
        if &head[0..4] != TREE_SIGNATURE {
            return Err(Error::InvalidFileStructure(format!(
                "expected TREE signature at address {btree_addr}"
            )));
        }
        let node_type = read_u8(&head, 4)?;
        if node_type != 0 {
            return Err(Error::InvalidFileStructure(format!(
                "group B-tree node has type {node_type}"
            )));
        }
        let level = read_u8(&head, 5)?;
        let entries_used = read_u16(&head, 6)? as usize;

        // Keys and children interleave: key[0] child[0] ... key[n].
        let body_len = (entries_used + 1) * ctx.length_size + entries_used * ctx.offset_size;
        let body = self
            .source
            .read_vec(ctx.abs(btree_addr) + head_len as u64, body_len)?;

        let mut out = Vec::new();
        for i in 0..entries_used {
            let child_pos = ctx.length_size + i * (ctx.length_size + ctx.offset_size);
            let Some(child) = ctx.read_offset(&body, child_pos)? else {
                continue;
            };
            if level > 0 {
                out.extend(self.read_group_btree(child, depth + 1)?);
            } else {
                out.extend(self.read_snod(child)?);
            }
        }
        Ok(out)
    }

    fn read_snod(&mut self, snod_addr: u64) -> Result<Vec<RawEntry>, Error> {
        let ctx = self.ctx;
        let head = self.source.read_vec(ctx.abs(snod_addr), 8)?;
        if &head[0..4] != SNOD_SIGNATURE {
            return Err(Error::InvalidFileStructure(format!(
                "expected SNOD signature at address {snod_addr}"
            )));
        }
        let count = read_u16(&head, 6)? as usize;
        let entry_size = 2 * ctx.offset_size + 4 + 4 + 16;
        let body = self
            .source
            .read_vec(ctx.abs(snod_addr) + 8, count * entry_size)?;

        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let base = i * entry_size;
            let link_name_offset = read_uint(&body, base, ctx.offset_size)?;
            let header_addr = ctx.read_offset(&body, base + ctx.offset_size)?;
            let cache_type = read_u32(&body, base + 2 * ctx.offset_size)?;
            let mut scratch = [0u8; 16];
            scratch.copy_from_slice(&body[base + 2 * ctx.offset_size + 8..][..16]);
            out.push(RawEntry {
                link_name_offset,
                header_addr,
                cache_type,
                scratch,
            });
        }
        Ok(out)
    }

    /// Reads one group's children into the arena. Hard links recurse;
    /// symbolic links are deferred into `pending`.
    fn read_group(
        &mut self,
        group: GroupId,
        btree_addr: u64,
        heap_addr: u64,
        pending: &mut Vec<PendingLink>,
        visited: &mut Vec<u64>,
        depth: usize,
    ) -> Result<(), Error> {
        if depth > MAX_RECURSION_DEPTH {
            return Err(Error::InvalidFileStructure(
                "group nesting depth exceeded".to_string(),
            ));
        }
        if visited.contains(&btree_addr) {
            warn!("group B-tree at {btree_addr} links back onto itself; skipping");
            return Ok(());
        }
        visited.push(btree_addr);

        let heap_data = self.local_heap_data(heap_addr)?;
        let entries = self.read_group_btree(btree_addr, 0)?;

        for entry in entries {
            let name = self.heap_string(heap_data, entry.link_name_offset)?;
            if name.is_empty() {
                continue;
            }

            // Symbolic link: the scratch pad caches the heap offset of
            // the target path; resolution waits until the whole tree is
            // known.
            if entry.cache_type == 2 {
                let target_off = LittleEndian::read_u32(&entry.scratch[0..4]) as u64;
                let target = self.heap_string(heap_data, target_off)?;
                pending.push(PendingLink {
                    parent: group,
                    name,
                    target,
                });
                continue;
            }

            let Some(header_addr) = entry.header_addr else {
                continue;
            };
            let path = object_path(&self.dataset.group_path(group), &name);
            let info = match self.parse_object(self.ctx.abs(header_addr), &path) {
                Ok(info) => info,
                Err(Error::Unsupported(reason)) => {
                    warn!("skipping object '{path}': {reason}");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Some((btree, heap)) = info.symbol_table {
                let child = self.dataset.add_group(group, name);
                self.dataset.groups[child].attributes = info.attributes;
                self.read_group(child, btree, heap, pending, visited, depth + 1)?;
            } else if info.dtype.is_some() && info.layout.is_some() {
                match self.build_variable(&name, info) {
                    Ok(var) => self.dataset.groups[group].variables.push(var),
                    Err(Error::Unsupported(reason)) => {
                        warn!("skipping variable '{path}': {reason}");
                    }
                    Err(e) => return Err(e),
                }
            } else {
                debug!("object '{path}' is neither group nor dataset; ignored");
            }
        }

        visited.pop();
        Ok(())
    }

    /// Resolves deferred symbolic links against the fully-read tree.
    /// Dangling targets are dropped with a warning; a group target that
    /// is an ancestor of the link's parent would create a cycle and is
    /// dropped with an error.
    fn resolve_links(&mut self, pending: Vec<PendingLink>) {
        let mut by_path: HashMap<String, LinkTarget> = HashMap::new();
        for id in 0..self.dataset.groups.len() {
            by_path.insert(self.dataset.group_path(id), LinkTarget::Group(id));
            for (vi, var) in self.dataset.groups[id].variables.iter().enumerate() {
                let path = object_path(&self.dataset.group_path(id), &var.name);
                by_path.insert(path, LinkTarget::Variable(id, vi));
            }
        }

        for link in pending {
            let target_path = if link.target.starts_with('/') {
                link.target.clone()
            } else {
                object_path(&self.dataset.group_path(link.parent), &link.target)
            };
            match by_path.get(&target_path) {
                None => {
                    warn!(
                        "dropping symbolic link '{}': target '{target_path}' not found",
                        link.name
                    );
                }
                Some(LinkTarget::Variable(gid, vi)) => {
                    let mut var = self.dataset.groups[*gid].variables[*vi].clone();
                    var.name = link.name;
                    self.dataset.groups[link.parent].variables.push(var);
                }
                Some(LinkTarget::Group(gid)) => {
                    if self.dataset.is_ancestor(*gid, link.parent) {
                        log::error!(
                            "dropping symbolic link '{}': target '{target_path}' is an \
                             ancestor of the link's parent",
                            link.name
                        );
                        continue;
                    }
                    let copied = self.copy_group_subtree(*gid, link.parent);
                    self.dataset.groups[copied].name = link.name;
                }
            }
        }
    }

    /// Deep-copies a group subtree under a new parent; used for
    /// resolved group links.
    fn copy_group_subtree(&mut self, src: GroupId, parent: GroupId) -> GroupId {
        let name = self.dataset.groups[src].name.clone();
        let dst = self.dataset.add_group(parent, name);
        self.dataset.groups[dst].dimensions = self.dataset.groups[src].dimensions.clone();
        self.dataset.groups[dst].variables = self.dataset.groups[src].variables.clone();
        self.dataset.groups[dst].attributes = self.dataset.groups[src].attributes.clone();
        let children = self.dataset.groups[src].children.clone();
        for child in children {
            self.copy_group_subtree(child, dst);
        }
        dst
    }
}

fn object_path(group_path: &str, name: &str) -> String {
    if group_path == "/" {
        format!("/{name}")
    } else {
        format!("{group_path}/{name}")
    }
}

// ---- Object headers ----

/// Storage placement pulled from a layout message.
#[derive(Debug, Clone)]
enum LayoutInfo {
    Compact(Vec<u8>),
    Contiguous {
        address: Option<u64>,
        size: u64,
    },
    Chunked {
        btree_address: Option<u64>,
        chunk_shape: Vec<u32>,
    },
}

/// Everything interpreted out of one object header.
#[derive(Default)]
struct ObjectInfo {
    shape: Option<Vec<u64>>,
    unlimited: Vec<bool>,
    dtype: Option<H5Type>,
    layout: Option<LayoutInfo>,
    filters: Vec<Filter>,
    fill: Option<Vec<u8>>,
    attributes: Vec<Attribute>,
    symbol_table: Option<(u64, u64)>,
}

impl<R: RandomAccess> Hdf5File<R> {
    /// Parses a v1 object header, following continuation messages with
    /// explicit bounds on block count, byte count, and message count.
    fn parse_object(&mut self, abs_addr: u64, path: &str) -> Result<ObjectInfo, Error> {
        let prefix = self.source.read_vec(abs_addr, 16)?;
        let version = read_u8(&prefix, 0)?;
        if version != 1 {
            return Err(Error::Unsupported(format!(
                "object header version {version} at '{path}'"
            )));
        }
        let num_messages = (read_u16(&prefix, 2)? as usize).min(MAX_MESSAGES);
        let header_size = read_u32(&prefix, 8)? as usize;

        let mut info = ObjectInfo::default();
        let mut blocks = vec![(abs_addr + 16, header_size)];
        let mut seen_blocks: HashSet<u64> = HashSet::new();
        let mut total_bytes = 0usize;
        let mut parsed = 0usize;

        while let Some((start, len)) = blocks.pop() {
            if !seen_blocks.insert(start) || seen_blocks.len() > MAX_HEADER_BLOCKS {
                return Err(Error::InvalidFileStructure(format!(
                    "continuation chain loops or fans out at '{path}'"
                )));
            }
            total_bytes += len;
            if total_bytes > MAX_HEADER_BYTES {
                return Err(Error::InvalidFileStructure(format!(
                    "object header at '{path}' exceeds size bound"
                )));
            }
            let block = self.source.read_vec(start, len)?;
            let mut pos = 0usize;
            while pos + 8 <= block.len() && parsed < num_messages {
                let msg_type = read_u16(&block, pos)?;
                let msg_size = read_u16(&block, pos + 2)? as usize;
                let body_start = pos + 8;
                let body_end = body_start + msg_size;
                if body_end > block.len() {
                    break;
                }
                let body = &block[body_start..body_end].to_vec();
                parsed += 1;
                pos = pad_to(body_end, 8);

                match msg_type {
                    MSG_NIL | MSG_MOD_TIME | MSG_MOD_TIME_OLD | MSG_COMMENT => {}
                    MSG_DATASPACE => {
                        let (shape, unlimited) = self.parse_dataspace(body)?;
                        info.shape = Some(shape);
                        info.unlimited = unlimited;
                    }
                    MSG_DATATYPE => {
                        let mut p = 0;
                        match parse_datatype(body, &mut p) {
                            Ok(t) => info.dtype = Some(t),
                            Err(Error::Unsupported(reason)) => {
                                warn!("datatype at '{path}': {reason}");
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    MSG_FILL_VALUE | MSG_FILL_VALUE_OLD => {
                        info.fill = parse_fill_value(body, msg_type)?;
                    }
                    MSG_DATA_LAYOUT => {
                        info.layout = Some(self.parse_layout(body)?);
                    }
                    MSG_FILTER_PIPELINE => {
                        info.filters = parse_filter_pipeline(body)?;
                    }
                    MSG_ATTRIBUTE => match self.parse_attribute(body) {
                        Ok(att) => info.attributes.push(att),
                        Err(Error::Unsupported(reason)) => {
                            warn!("skipping attribute at '{path}': {reason}");
                        }
                        Err(e) => return Err(e),
                    },
                    MSG_CONTINUATION => {
                        let offset = self.ctx.read_offset(body, 0)?.ok_or_else(|| {
                            Error::InvalidFileStructure(format!(
                                "undefined continuation address at '{path}'"
                            ))
                        })?;
                        let length = self.ctx.read_length(body, self.ctx.offset_size)? as usize;
                        if length > 0 {
                            blocks.push((self.ctx.abs(offset), length));
                        }
                    }
                    MSG_SYMBOL_TABLE => {
                        let btree = self.ctx.read_offset(body, 0)?;
                        let heap = self.ctx.read_offset(body, self.ctx.offset_size)?;
                        if let (Some(b), Some(h)) = (btree, heap) {
                            info.symbol_table = Some((b, h));
                        }
                    }
                    other => {
                        debug!("ignoring message type {other:#06x} at '{path}'");
                    }
                }
            }
        }
        Ok(info)
    }

    /// Dataspace: shape plus per-dimension unlimited flags.
    fn parse_dataspace(&self, body: &[u8]) -> Result<(Vec<u64>, Vec<bool>), Error> {
        let version = read_u8(body, 0)?;
        let rank = read_u8(body, 1)? as usize;
        let flags = read_u8(body, 2)?;
        let dims_start = match version {
            1 => 8,
            2 => 4,
            v => {
                return Err(Error::Unsupported(format!("dataspace version {v}")));
            }
        };
        let l = self.ctx.length_size;
        let mut shape = Vec::with_capacity(rank);
        for i in 0..rank {
            shape.push(self.ctx.read_length(body, dims_start + i * l)?);
        }
        let mut unlimited = vec![false; rank];
        if flags & 1 != 0 {
            let max_start = dims_start + rank * l;
            let undef = if l == 8 { u64::MAX } else { (1u64 << (l * 8)) - 1 };
            for (i, u) in unlimited.iter_mut().enumerate() {
                *u = read_uint(body, max_start + i * l, l)? == undef;
            }
        }
        Ok((shape, unlimited))
    }

    fn parse_layout(&self, body: &[u8]) -> Result<LayoutInfo, Error> {
        let version = read_u8(body, 0)?;
        match version {
            1 | 2 => {
                let ndims = read_u8(body, 1)? as usize;
                let class = read_u8(body, 2)?;
                let pos = 8;
                match class {
                    0 => {
                        let dims_end = pos + ndims * 4;
                        let size = read_u32(body, dims_end)? as usize;
                        let data_start = dims_end + 4;
                        let data = body
                            .get(data_start..data_start + size)
                            .ok_or(Error::UnexpectedEof)?;
                        Ok(LayoutInfo::Compact(data.to_vec()))
                    }
                    1 => {
                        let address = self.ctx.read_offset(body, pos)?;
                        let dims_start = pos + self.ctx.offset_size;
                        let mut size = 1u64;
                        for i in 0..ndims {
                            size *= read_u32(body, dims_start + i * 4)? as u64;
                        }
                        Ok(LayoutInfo::Contiguous { address, size })
                    }
                    2 => {
                        let btree_address = self.ctx.read_offset(body, pos)?;
                        let dims_start = pos + self.ctx.offset_size;
                        let mut chunk_shape = Vec::with_capacity(ndims);
                        for i in 0..ndims {
                            chunk_shape.push(read_u32(body, dims_start + i * 4)?);
                        }
                        Ok(LayoutInfo::Chunked {
                            btree_address,
                            chunk_shape,
                        })
                    }
                    c => Err(Error::Unsupported(format!("layout class {c}"))),
                }
            }
            3 => {
                let class = read_u8(body, 1)?;
                match class {
                    0 => {
                        let size = read_u16(body, 2)? as usize;
                        let data = body.get(4..4 + size).ok_or(Error::UnexpectedEof)?;
                        Ok(LayoutInfo::Compact(data.to_vec()))
                    }
                    1 => {
                        let address = self.ctx.read_offset(body, 2)?;
                        let size = self.ctx.read_length(body, 2 + self.ctx.offset_size)?;
                        Ok(LayoutInfo::Contiguous { address, size })
                    }
                    2 => {
                        let ndims = read_u8(body, 2)? as usize;
                        let btree_address = self.ctx.read_offset(body, 3)?;
                        let dims_start = 3 + self.ctx.offset_size;
                        let mut chunk_shape = Vec::with_capacity(ndims);
                        for i in 0..ndims {
                            chunk_shape.push(read_u32(body, dims_start + i * 4)?);
                        }
                        Ok(LayoutInfo::Chunked {
                            btree_address,
                            chunk_shape,
                        })
                    }
                    c => Err(Error::Unsupported(format!("layout class {c}"))),
                }
            }
            v => Err(Error::Unsupported(format!("layout version {v}"))),
        }
    }
}

fn parse_fill_value(body: &[u8], msg_type: u16) -> Result<Option<Vec<u8>>, Error> {
    if msg_type == MSG_FILL_VALUE_OLD {
        let size = read_u32(body, 0)? as usize;
        return Ok(body.get(4..4 + size).map(|b| b.to_vec()));
    }
    let version = read_u8(body, 0)?;
    match version {
        1 | 2 => {
            let defined = read_u8(body, 3)?;
            if version == 1 || defined == 1 {
                let size = read_u32(body, 4)? as usize;
                Ok(body.get(8..8 + size).filter(|b| !b.is_empty()).map(|b| b.to_vec()))
            } else {
                Ok(None)
            }
        }
        3 => {
            let flags = read_u8(body, 1)?;
            if flags & 0x20 != 0 {
                let size = read_u32(body, 2)? as usize;
                Ok(body.get(6..6 + size).filter(|b| !b.is_empty()).map(|b| b.to_vec()))
            } else {
                Ok(None)
            }
        }
        v => Err(Error::Unsupported(format!("fill value version {v}"))),
    }
}

fn parse_filter_pipeline(body: &[u8]) -> Result<Vec<Filter>, Error> {
    let version = read_u8(body, 0)?;
    let nfilters = read_u8(body, 1)? as usize;
    let mut pos = match version {
        1 => 8,
        2 => 2,
        v => return Err(Error::Unsupported(format!("filter pipeline version {v}"))),
    };
    let mut out = Vec::with_capacity(nfilters);
    for _ in 0..nfilters {
        let id = read_u16(body, pos)?;
        pos += 2;
        let name_len = if version == 1 || id >= 256 {
            let n = read_u16(body, pos)? as usize;
            pos += 2;
            n
        } else {
            0
        };
        let _flags = read_u16(body, pos)?;
        let n_client = read_u16(body, pos + 2)? as usize;
        pos += 4;
        let name = if name_len > 0 {
            let raw = body.get(pos..pos + name_len).ok_or(Error::UnexpectedEof)?;
            pos += if version == 1 {
                pad_to(name_len, 8)
            } else {
                name_len
            };
            read_cstring(raw, 0).unwrap_or_default()
        } else {
            String::new()
        };
        let mut client_data = Vec::with_capacity(n_client);
        for i in 0..n_client {
            client_data.push(read_u32(body, pos + i * 4)?);
        }
        pos += n_client * 4;
        if version == 1 && n_client % 2 == 1 {
            pos += 4;
        }
        out.push(Filter {
            id,
            name,
            client_data,
        });
    }
    Ok(out)
}

// ---- Datatypes ----

/// The datatype variant tree as stored on disk.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum H5Type {
    Fixed {
        size: usize,
        endian: Endianness,
        signed: bool,
    },
    Float {
        size: usize,
        endian: Endianness,
    },
    Str {
        size: usize,
    },
    Vlen {
        string: bool,
        base: Box<H5Type>,
    },
    ArrayOf {
        base: Box<H5Type>,
        dims: Vec<u32>,
    },
    Compound {
        size: usize,
        members: Vec<(String, u32, H5Type)>,
    },
    EnumOf {
        base: Box<H5Type>,
        names: Vec<String>,
    },
}

/// Parses a datatype message (or a nested datatype) at `*pos`,
/// advancing past it.
pub(crate) fn parse_datatype(body: &[u8], pos: &mut usize) -> Result<H5Type, Error> {
    let start = *pos;
    let class_and_version = read_u8(body, start)?;
    let class = class_and_version & 0x0F;
    let dt_version = (class_and_version >> 4) & 0x0F;
    let bits0 = read_u8(body, start + 1)?;
    let bits8 = read_u8(body, start + 2)?;
    let size = read_u32(body, start + 4)? as usize;
    *pos = start + 8;

    let endian = if bits0 & 0x01 != 0 {
        Endianness::Big
    } else {
        Endianness::Little
    };

    match class {
        DT_FIXED_POINT => {
            *pos += 4; // bit offset + precision
            Ok(H5Type::Fixed {
                size,
                endian,
                signed: bits0 & 0x08 != 0,
            })
        }
        DT_FLOATING_POINT => {
            *pos += 12;
            Ok(H5Type::Float { size, endian })
        }
        DT_STRING => Ok(H5Type::Str { size }),
        DT_VLEN => {
            let base = parse_datatype(body, pos)?;
            Ok(H5Type::Vlen {
                string: bits0 & 0x0F == 1,
                base: Box::new(base),
            })
        }
        DT_ARRAY => {
            let ndims = read_u8(body, *pos)? as usize;
            *pos += if dt_version <= 2 { 4 } else { 1 };
            let mut dims = Vec::with_capacity(ndims);
            for _ in 0..ndims {
                dims.push(read_u32(body, *pos)?);
                *pos += 4;
            }
            if dt_version <= 2 {
                *pos += ndims * 4; // permutation indices, always identity
            }
            let base = parse_datatype(body, pos)?;
            Ok(H5Type::ArrayOf {
                base: Box::new(base),
                dims,
            })
        }
        DT_COMPOUND => {
            let nmembers = u16::from_le_bytes([bits0, bits8]) as usize;
            let mut members = Vec::with_capacity(nmembers);
            for _ in 0..nmembers {
                let name = read_cstring(body, *pos).ok_or(Error::UnexpectedEof)?;
                match dt_version {
                    1 | 2 => *pos += pad_to(name.len() + 1, 8),
                    _ => *pos += name.len() + 1,
                }
                let offset = match dt_version {
                    1 | 2 => {
                        let off = read_u32(body, *pos)?;
                        *pos += 4;
                        off
                    }
                    _ => {
                        // v3 stores offsets in the minimum number of
                        // bytes needed to address the parent's size.
                        let nbytes = bytes_needed(size as u64);
                        let off = read_uint(body, *pos, nbytes)? as u32;
                        *pos += nbytes;
                        off
                    }
                };
                if dt_version == 1 {
                    // dimensionality(1) + reserved(3) + perm(4) +
                    // reserved(4) + dims(4*4)
                    *pos += 1 + 3 + 4 + 4 + 16;
                }
                let dtype = parse_datatype(body, pos)?;
                members.push((name, offset, dtype));
            }
            Ok(H5Type::Compound { size, members })
        }
        DT_ENUM => {
            let nmembers = u16::from_le_bytes([bits0, bits8]) as usize;
            let base = parse_datatype(body, pos)?;
            let mut names = Vec::with_capacity(nmembers);
            for _ in 0..nmembers {
                let name = read_cstring(body, *pos).ok_or(Error::UnexpectedEof)?;
                match dt_version {
                    1 | 2 => *pos += pad_to(name.len() + 1, 8),
                    _ => *pos += name.len() + 1,
                }
                names.push(name);
            }
            *pos += nmembers * size; // member values in base-type width
            Ok(H5Type::EnumOf {
                base: Box::new(base),
                names,
            })
        }
        DT_REFERENCE => Err(Error::Unsupported("reference datatype".to_string())),
        c => Err(Error::Unsupported(format!("datatype class {c}"))),
    }
}

fn bytes_needed(max: u64) -> usize {
    match max {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFFFF_FFFF => 4,
        _ => 8,
    }
}

/// The flat decode parameters a datatype tree boils down to.
pub(crate) struct MappedType {
    pub data_type: DataType,
    pub elem_size: usize,
    pub endian: Endianness,
    pub vlen_string: bool,
    /// Extra fastest-varying dimensions from array types.
    pub extra_dims: Vec<u32>,
    /// Wrapped in a variable-length sequence.
    pub vlen_sequence: bool,
    pub members: Vec<(String, u32, DataType)>,
    pub enum_names: Vec<String>,
}

pub(crate) fn map_type(t: &H5Type) -> Result<MappedType, Error> {
    let mut mapped = MappedType {
        data_type: DataType::Byte,
        elem_size: 0,
        endian: Endianness::Little,
        vlen_string: false,
        extra_dims: Vec::new(),
        vlen_sequence: false,
        members: Vec::new(),
        enum_names: Vec::new(),
    };
    map_type_into(t, &mut mapped)?;
    Ok(mapped)
}

fn map_type_into(t: &H5Type, out: &mut MappedType) -> Result<(), Error> {
    match t {
        H5Type::Fixed {
            size,
            endian,
            signed,
        } => {
            out.data_type = match (size, signed) {
                (1, true) => DataType::Byte,
                (1, false) => DataType::UByte,
                (2, true) => DataType::Short,
                (2, false) => DataType::UShort,
                (4, true) => DataType::Int,
                (4, false) => DataType::UInt,
                (8, true) => DataType::Long,
                (8, false) => DataType::ULong,
                _ => {
                    return Err(Error::Unsupported(format!(
                        "{size}-byte fixed-point datatype"
                    )));
                }
            };
            out.elem_size = *size;
            out.endian = *endian;
        }
        H5Type::Float { size, endian } => {
            out.data_type = match size {
                4 => DataType::Float,
                8 => DataType::Double,
                _ => {
                    return Err(Error::Unsupported(format!(
                        "{size}-byte floating-point datatype"
                    )));
                }
            };
            out.elem_size = *size;
            out.endian = *endian;
        }
        H5Type::Str { size } => {
            out.data_type = DataType::String;
            out.elem_size = *size;
        }
        H5Type::Vlen { string, base } => {
            if *string {
                out.data_type = DataType::String;
                out.vlen_string = true;
                out.elem_size = 0; // caller sets the reference width
            } else {
                map_type_into(base, out)?;
                out.vlen_sequence = true;
            }
        }
        H5Type::ArrayOf { base, dims } => {
            map_type_into(base, out)?;
            out.extra_dims.extend_from_slice(dims);
        }
        H5Type::Compound { size, members } => {
            out.data_type = DataType::Structure;
            out.elem_size = *size;
            for (name, offset, dtype) in members {
                let m = map_type(dtype)?;
                out.members.push((name.clone(), *offset, m.data_type));
            }
        }
        H5Type::EnumOf { base, names } => {
            map_type_into(base, out)?;
            out.enum_names = names.clone();
        }
    }
    Ok(())
}

// ---- Attributes ----

impl<R: RandomAccess> Hdf5File<R> {
    /// Decodes an attribute message: nested datatype + dataspace + raw
    /// value bytes, handled like a miniature in-header dataset.
    fn parse_attribute(&mut self, body: &[u8]) -> Result<Attribute, Error> {
        let version = read_u8(body, 0)?;
        let (name_size, dt_size, ds_size, mut pos) = match version {
            1 | 2 => (
                read_u16(body, 2)? as usize,
                read_u16(body, 4)? as usize,
                read_u16(body, 6)? as usize,
                8,
            ),
            3 => (
                read_u16(body, 2)? as usize,
                read_u16(body, 4)? as usize,
                read_u16(body, 6)? as usize,
                9,
            ),
            v => return Err(Error::Unsupported(format!("attribute version {v}"))),
        };
        let pad = version == 1;

        let name = read_cstring(body, pos).ok_or(Error::UnexpectedEof)?;
        pos += if pad { pad_to(name_size, 8) } else { name_size };

        let dt_body = body.get(pos..pos + dt_size).ok_or(Error::UnexpectedEof)?;
        let mut p = 0;
        let h5type = parse_datatype(dt_body, &mut p)?;
        pos += if pad { pad_to(dt_size, 8) } else { dt_size };

        let ds_body = body.get(pos..pos + ds_size).ok_or(Error::UnexpectedEof)?;
        let (shape, _) = self.parse_dataspace(ds_body)?;
        pos += if pad { pad_to(ds_size, 8) } else { ds_size };

        let data = body.get(pos..).ok_or(Error::UnexpectedEof)?.to_vec();
        let value = self.decode_attr_value(&h5type, &shape, &data)?;
        Attribute::new(name, value)
    }

    fn decode_attr_value(
        &mut self,
        h5type: &H5Type,
        shape: &[u64],
        data: &[u8],
    ) -> Result<AttrValue, Error> {
        let n = shape.iter().product::<u64>().max(1) as usize;
        let mapped = map_type(h5type)?;
        match mapped.data_type {
            DataType::String if mapped.vlen_string => {
                let ref_size = 4 + self.ctx.offset_size + 4;
                let mut strings = Vec::with_capacity(n);
                for i in 0..n {
                    let bytes = self.read_vlen_item(data, i * ref_size)?;
                    strings.push(String::from_utf8_lossy(&bytes).into_owned());
                }
                Ok(if strings.len() == 1 {
                    AttrValue::String(strings.remove(0))
                } else {
                    AttrValue::Strings(strings)
                })
            }
            DataType::String => {
                // Fixed-width char data: a scalar or 1-D space collapses
                // to one string, higher ranks become a string array.
                let w = mapped.elem_size.max(1);
                let mut strings: Vec<String> = data
                    .chunks(w)
                    .take(n)
                    .map(|c| {
                        let end = c.iter().position(|&b| b == 0).unwrap_or(c.len());
                        String::from_utf8_lossy(&c[..end]).into_owned()
                    })
                    .collect();
                Ok(if shape.len() <= 1 && strings.len() == 1 {
                    AttrValue::String(strings.remove(0))
                } else if shape.is_empty() {
                    AttrValue::String(strings.concat())
                } else {
                    AttrValue::Strings(strings)
                })
            }
            DataType::Structure => {
                Err(Error::Unsupported("compound attribute values".to_string()))
            }
            numeric => {
                let need = n * mapped.elem_size;
                let raw = data.get(..need).ok_or(Error::UnexpectedEof)?;
                Ok(AttrValue::Numeric(decode_numeric(
                    numeric,
                    raw,
                    mapped.endian,
                )))
            }
        }
    }

    /// Resolves one `(count, heap address, index)` variable-length
    /// reference through the global heap cache.
    pub(crate) fn read_vlen_item(&mut self, data: &[u8], at: usize) -> Result<Vec<u8>, Error> {
        let count = read_u32(data, at)? as usize;
        let addr = self
            .ctx
            .read_offset(data, at + 4)?
            .ok_or_else(|| Error::InvalidFileStructure("undefined heap address".to_string()))?;
        let index = read_u32(data, at + 4 + self.ctx.offset_size)?;

        let ctx = self.ctx;
        if !self.heap_cache.contains_key(&addr) {
            let heap = GlobalHeap::read(&mut self.source, &ctx, addr)?;
            self.heap_cache.insert(addr, heap);
        }
        let bytes = self.heap_cache[&addr].object(index)?;
        Ok(bytes[..count.min(bytes.len())].to_vec())
    }
}

// ---- Variables ----

impl<R: RandomAccess> Hdf5File<R> {
    fn build_variable(&mut self, name: &str, info: ObjectInfo) -> Result<Variable, Error> {
        let h5type = info
            .dtype
            .ok_or_else(|| Error::Unsupported("dataset without datatype".to_string()))?;
        let layout = info
            .layout
            .ok_or_else(|| Error::Unsupported("dataset without storage layout".to_string()))?;
        let mapped = map_type(&h5type)?;

        let shape = info.shape.unwrap_or_default();
        // Only the outermost dimension may grow in the data model.
        let mut dimensions: Vec<Dimension> = shape
            .iter()
            .enumerate()
            .map(|(i, &len)| {
                let mut d = Dimension::anonymous(len);
                d.unlimited = i == 0 && info.unlimited.first().copied().unwrap_or(false);
                d
            })
            .collect();
        for extra in &mapped.extra_dims {
            dimensions.push(Dimension::anonymous(*extra as u64));
        }
        if mapped.vlen_sequence {
            let mut d = Dimension::anonymous(0);
            d.variable_length = true;
            dimensions.push(d);
        }

        let elem_size = if mapped.vlen_string {
            4 + self.ctx.offset_size + 4
        } else {
            mapped.elem_size
        };
        if elem_size == 0 {
            return Err(Error::Unsupported(format!(
                "zero-size elements for '{name}'"
            )));
        }

        let (data_address, storage) = match layout {
            LayoutInfo::Compact(data) => (None, StorageLayout::Compact(data)),
            LayoutInfo::Contiguous { address, size } => {
                (address, StorageLayout::Contiguous { size })
            }
            LayoutInfo::Chunked {
                btree_address,
                chunk_shape,
            } => (
                btree_address,
                StorageLayout::Chunked {
                    chunk_shape,
                    btree_address: btree_address.unwrap_or(u64::MAX),
                },
            ),
        };

        let mut var = Variable::new(name, mapped.data_type, dimensions);
        var.attributes = info.attributes;
        if !mapped.enum_names.is_empty() {
            var.attributes.push(Attribute::new(
                "_EnumNames",
                AttrValue::Strings(mapped.enum_names),
            )?);
        }
        let mut member_offsets = Vec::new();
        for (mname, moffset, mtype) in &mapped.members {
            var.members
                .push(Variable::new(mname.clone(), *mtype, Vec::new()));
            member_offsets.push(*moffset);
        }
        var.vinfo = Vinfo::Hdf5(H5Vinfo {
            data_address,
            layout: storage,
            endianness: mapped.endian,
            elem_size,
            filters: info.filters,
            fill_value: info.fill,
            member_offsets,
            vlen_string: mapped.vlen_string,
        });
        var.validate_dimensions()?;
        Ok(var)
    }
}
