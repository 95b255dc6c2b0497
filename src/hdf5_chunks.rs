//! Chunked-storage machinery for the hierarchical format: the chunk
//! B-tree (TREE type 1), the filter pipeline applied per chunk, and the
//! global heap collections backing variable-length strings.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use flate2::read::ZlibDecoder;
use log::debug;

use crate::error::Error;
use crate::hdf5_reader::{read_uint, H5Ctx, Hdf5File, TREE_SIGNATURE};
use crate::io::RandomAccess;
use crate::models::{Filter, FILTER_DEFLATE, FILTER_SHUFFLE};

const GCOL_SIGNATURE: &[u8; 4] = b"GCOL";
const MAX_BTREE_DEPTH: usize = 64;

/// One stored chunk: where its element-space origin sits, where its
/// bytes live, and how they were filtered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEntry {
    /// Element offset of the chunk origin, one entry per dimension.
    pub offsets: Vec<u64>,
    /// Absolute file position of the stored bytes.
    pub address: u64,
    /// Stored byte size (after filtering).
    pub size: u32,
    /// Bit `i` set means filter `i` of the pipeline was skipped.
    pub filter_mask: u32,
}

/// Walks a chunk B-tree and returns every leaf entry. `rank` is the
/// dataset rank; keys carry `rank + 1` offsets, the last being the
/// always-zero element-size coordinate.
pub(crate) fn read_chunk_btree<R: RandomAccess>(
    source: &mut R,
    ctx: &H5Ctx,
    btree_addr: u64,
    rank: usize,
    depth: usize,
) -> Result<Vec<ChunkEntry>, Error> {
    if depth > MAX_BTREE_DEPTH {
        return Err(Error::InvalidFileStructure(
            "chunk B-tree recursion depth exceeded".to_string(),
        ));
    }
    let head_len = 8 + 2 * ctx.offset_size;
    let head = source.read_vec(ctx.abs(btree_addr), head_len)?;
    if &head[0..4] != TREE_SIGNATURE {
        return Err(Error::InvalidFileStructure(format!(
            "expected TREE signature at address {btree_addr}"
        )));
    }
    if head[4] != 1 {
        return Err(Error::InvalidFileStructure(format!(
            "chunk B-tree node has type {}",
            head[4]
        )));
    }
    let level = head[5];
    let entries_used = u16::from_le_bytes([head[6], head[7]]) as usize;

    // key[0] child[0] key[1] child[1] ... key[n]; each key is
    // size(4) + mask(4) + offsets(8 * (rank + 1)).
    let key_size = 8 + 8 * (rank + 1);
    let body_len = (entries_used + 1) * key_size + entries_used * ctx.offset_size;
    let body = source.read_vec(ctx.abs(btree_addr) + head_len as u64, body_len)?;

    let mut out = Vec::new();
    for i in 0..entries_used {
        let key_pos = i * (key_size + ctx.offset_size);
        let child_pos = key_pos + key_size;
        let Some(child) = ctx.read_offset(&body, child_pos)? else {
            continue;
        };
        if level > 0 {
            out.extend(read_chunk_btree(source, ctx, child, rank, depth + 1)?);
        } else {
            let size = read_uint(&body, key_pos, 4)? as u32;
            let filter_mask = read_uint(&body, key_pos + 4, 4)? as u32;
            let mut offsets = Vec::with_capacity(rank);
            for d in 0..rank {
                offsets.push(read_uint(&body, key_pos + 8 + d * 8, 8)?);
            }
            out.push(ChunkEntry {
                offsets,
                address: ctx.abs(child),
                size,
                filter_mask,
            });
        }
    }
    Ok(out)
}

impl<R: RandomAccess> Hdf5File<R> {
    /// Returns the chunk list for a B-tree root, reading and caching it
    /// on first use. Repeated reads of the same variable reuse the
    /// cached list.
    pub(crate) fn chunk_entries(
        &mut self,
        btree_addr: u64,
        rank: usize,
    ) -> Result<Arc<Vec<ChunkEntry>>, Error> {
        if let Some(entries) = self.chunk_cache.get(&btree_addr) {
            return Ok(Arc::clone(entries));
        }
        let ctx = self.ctx;
        let entries = Arc::new(read_chunk_btree(&mut self.source, &ctx, btree_addr, rank, 0)?);
        debug!(
            "chunk B-tree at {btree_addr}: {} stored chunks",
            entries.len()
        );
        self.chunk_cache.insert(btree_addr, Arc::clone(&entries));
        Ok(entries)
    }

    /// Reads one chunk's bytes and undoes its filter pipeline.
    pub(crate) fn read_chunk(
        &mut self,
        entry: &ChunkEntry,
        filters: &[Filter],
        elem_size: usize,
    ) -> Result<Vec<u8>, Error> {
        let raw = self.source.read_vec(entry.address, entry.size as usize)?;
        apply_filters(raw, filters, entry.filter_mask, elem_size, entry.address)
    }
}

/// Undoes a filter pipeline on stored chunk bytes. Filters were applied
/// in pipeline order at write time, so decoding runs in reverse; a set
/// mask bit means that filter was skipped for this chunk.
pub(crate) fn apply_filters(
    mut data: Vec<u8>,
    filters: &[Filter],
    filter_mask: u32,
    elem_size: usize,
    offset: u64,
) -> Result<Vec<u8>, Error> {
    for (i, filter) in filters.iter().enumerate().rev() {
        if filter_mask & (1 << i) != 0 {
            continue;
        }
        data = match filter.id {
            FILTER_DEFLATE => inflate(&data, offset)?,
            FILTER_SHUFFLE => {
                let stride = filter
                    .client_data
                    .first()
                    .map(|&v| v as usize)
                    .unwrap_or(elem_size);
                unshuffle(&data, stride.max(1))
            }
            id => {
                return Err(Error::Unsupported(format!(
                    "filter {id} ('{}')",
                    filter.name
                )));
            }
        };
    }
    Ok(data)
}

fn inflate(data: &[u8], offset: u64) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::Decompression {
            offset,
            reason: e.to_string(),
        })?;
    Ok(out)
}

/// Reverses the byte-shuffle transform: stored bytes are grouped by
/// byte position across elements (all byte 0s, then all byte 1s, ...).
fn unshuffle(data: &[u8], elem_size: usize) -> Vec<u8> {
    if elem_size <= 1 || data.len() % elem_size != 0 {
        return data.to_vec();
    }
    let n = data.len() / elem_size;
    let mut out = vec![0u8; data.len()];
    for j in 0..elem_size {
        let plane = &data[j * n..(j + 1) * n];
        for (i, &b) in plane.iter().enumerate() {
            out[i * elem_size + j] = b;
        }
    }
    out
}

/// One parsed global heap collection, indexed by object id.
pub struct GlobalHeap {
    objects: HashMap<u32, Vec<u8>>,
}

impl GlobalHeap {
    /// Reads the GCOL collection at `addr` (a stored address, relative
    /// to the superblock base).
    pub fn read<R: RandomAccess>(source: &mut R, ctx: &H5Ctx, addr: u64) -> Result<Self, Error> {
        let head_len = 8 + ctx.length_size;
        let head = source.read_vec(ctx.abs(addr), head_len)?;
        if &head[0..4] != GCOL_SIGNATURE {
            return Err(Error::InvalidFileStructure(format!(
                "expected GCOL signature at address {addr}"
            )));
        }
        let version = head[4];
        if version != 1 {
            return Err(Error::Unsupported(format!("global heap version {version}")));
        }
        // Collection size includes the header already read.
        let total = ctx.read_length(&head, 8)? as usize;
        if total < head_len {
            return Err(Error::InvalidFileStructure(format!(
                "global heap at {addr} declares size {total}"
            )));
        }
        let body = source.read_vec(ctx.abs(addr) + head_len as u64, total - head_len)?;

        let mut objects = HashMap::new();
        let mut pos = 0usize;
        let obj_head = 8 + ctx.length_size;
        while pos + obj_head <= body.len() {
            let index = read_uint(&body, pos, 2)? as u32;
            let size = ctx.read_length(&body, pos + 8)? as usize;
            pos += obj_head;
            if index == 0 {
                // Free-space terminator.
                break;
            }
            let data = body.get(pos..pos + size).ok_or(Error::UnexpectedEof)?;
            objects.insert(index, data.to_vec());
            // Object data is padded to a multiple of 8.
            pos += size.div_ceil(8) * 8;
        }
        Ok(Self { objects })
    }

    pub fn object(&self, index: u32) -> Result<&[u8], Error> {
        self.objects
            .get(&index)
            .map(|v| v.as_slice())
            .ok_or_else(|| {
                Error::InvalidFileStructure(format!("global heap object {index} not found"))
            })
    }
}
