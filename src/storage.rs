use bytes::Bytes;
use log::debug;

use crate::block::BlockIndex;
use crate::chunk::{self, iter_coords};
use crate::chunk_key_encoding::ChunkKeyEncoding;
use crate::manager::{BlockManager, ClaimKey};
use crate::map::ChunkBlockMap;
use crate::metadata::{ChunkSource, ZarrayMetadata};

/// Half-open interval `[start, end)` of consecutive block indices, one per
/// chunk in canonical enumeration order.
///
/// Only valid right after creation, when the manager allocated every chunk's
/// block back-to-back. A rewritten container may break contiguity, after
/// which the full chunk-to-block map is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSlice {
    pub start: BlockIndex,
    pub end: BlockIndex,
}

impl BlockSlice {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<BlockSlice> for ChunkSource {
    fn from(value: BlockSlice) -> Self {
        ChunkSource::BlockRange {
            start: value.start,
            end: value.end,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreState {
    Creating,
    Bound,
    Closed,
}

/// Chunk storage backed by blocks embedded in a container file.
///
/// Each chunk of the array gets exactly one fixed-size block; once a chunk
/// is assigned a block, that identity never changes, so every write is an
/// in-place overwrite and out-of-order or repeated writes are safe. One
/// extra block, written at [`finalize`](Self::finalize), holds the encoded
/// chunk-to-block map.
///
/// The store never owns blocks; it holds indices and resolves them through
/// the manager per operation.
pub struct BlockStore<M> {
    manager: M,
    metadata: ZarrayMetadata,
    store_id: String,
    grid: Vec<u64>,
    key_encoding: ChunkKeyEncoding,
    chunk_size: usize,
    map: ChunkBlockMap,
    slice: Option<BlockSlice>,
    map_block: Option<BlockIndex>,
    state: StoreState,
}

impl<M: BlockManager> BlockStore<M> {
    /// Create a store for a fresh array, allocating one block per chunk.
    ///
    /// Blocks are requested in canonical coordinate order and must come back
    /// with consecutive indices; the resulting [`BlockSlice`] depends on it.
    /// Fails before allocating anything if the metadata requests compression
    /// or filters.
    pub fn create(
        manager: M,
        metadata: ZarrayMetadata,
        store_id: impl Into<String>,
    ) -> crate::Result<Self> {
        let mut store = Self::unbound(manager, metadata, store_id)?;

        let mut start = None;
        let mut prev: Option<BlockIndex> = None;
        for coord in iter_coords(&store.grid) {
            let index = store.manager.allocate(store.chunk_size as u64)?;
            match prev {
                None => start = Some(index),
                Some(p) if index == p + 1 => {}
                Some(p) => {
                    return Err(crate::Error::AllocationOrder {
                        expected: p + 1,
                        actual: index,
                    });
                }
            }
            prev = Some(index);
            let owner = ClaimKey::for_chunk(store.store_id.as_str(), store.key_encoding.encode(&coord));
            store.manager.claim(index, owner)?;
        }

        store.slice = match (start, prev) {
            (Some(start), Some(last)) => Some(BlockSlice {
                start,
                end: last + 1,
            }),
            _ => None,
        };
        store.state = StoreState::Bound;
        debug!(
            "created store {:?}: {} chunks of {} bytes in blocks {:?}",
            store.store_id,
            chunk::chunk_count(&store.grid),
            store.chunk_size,
            store.slice,
        );
        Ok(store)
    }

    /// Bind to existing blocks through a persisted chunk-to-block map.
    ///
    /// No data moves; this is O(chunks) bookkeeping. Every referenced block
    /// and the map block itself are re-claimed so a container rewrite cannot
    /// collect them.
    pub fn open_with_map(
        manager: M,
        metadata: ZarrayMetadata,
        store_id: impl Into<String>,
        map_block: BlockIndex,
    ) -> crate::Result<Self> {
        let mut store = Self::unbound(manager, metadata, store_id)?;

        let handle = store.manager.bind(map_block)?;
        let bytes = store.manager.read(&handle)?;
        store.map = ChunkBlockMap::decode(&bytes, &store.grid)?;
        store
            .manager
            .claim(map_block, ClaimKey::for_store(store.store_id.as_str()))?;
        for coord in iter_coords(&store.grid) {
            if let Some(index) = store.map.get(&coord)? {
                let owner = ClaimKey::for_chunk(store.store_id.as_str(), store.key_encoding.encode(&coord));
                store.manager.claim(index, owner)?;
            }
        }

        store.map_block = Some(map_block);
        store.state = StoreState::Bound;
        debug!(
            "opened store {:?} from map block {map_block}",
            store.store_id
        );
        Ok(store)
    }

    /// Bind to an existing contiguous run of blocks, one per chunk in
    /// canonical order.
    pub fn open_with_slice(
        manager: M,
        metadata: ZarrayMetadata,
        store_id: impl Into<String>,
        slice: BlockSlice,
    ) -> crate::Result<Self> {
        let mut store = Self::unbound(manager, metadata, store_id)?;

        let count = chunk::chunk_count(&store.grid);
        if slice.end < slice.start || slice.len() != count {
            return Err(crate::Error::general(format!(
                "block range {}:{} does not cover {count} chunks",
                slice.start, slice.end
            )));
        }
        for (i, coord) in iter_coords(&store.grid).enumerate() {
            let index = slice.start + i as u64;
            store.map.set(&coord, index)?;
            let owner = ClaimKey::for_chunk(store.store_id.as_str(), store.key_encoding.encode(&coord));
            store.manager.claim(index, owner)?;
        }

        store.slice = Some(slice);
        store.state = StoreState::Bound;
        debug!(
            "opened store {:?} from blocks {}:{}",
            store.store_id, slice.start, slice.end
        );
        Ok(store)
    }

    /// Bind via a document-tree chunk source reference.
    pub fn open_with_source(
        manager: M,
        metadata: ZarrayMetadata,
        store_id: impl Into<String>,
        source: ChunkSource,
    ) -> crate::Result<Self> {
        match source {
            ChunkSource::BlockRange { start, end } => {
                Self::open_with_slice(manager, metadata, store_id, BlockSlice { start, end })
            }
            ChunkSource::BlockMap { index } => {
                Self::open_with_map(manager, metadata, store_id, index)
            }
        }
    }

    fn unbound(
        manager: M,
        metadata: ZarrayMetadata,
        store_id: impl Into<String>,
    ) -> crate::Result<Self> {
        metadata.validate()?;
        let grid = chunk::grid_shape(&metadata);
        let chunk_size = chunk::chunk_byte_size(&metadata)?;
        let key_encoding = ChunkKeyEncoding::new(metadata.dimension_separator, grid.len());
        let map = ChunkBlockMap::new_empty(&grid)?;
        Ok(Self {
            manager,
            metadata,
            store_id: store_id.into(),
            grid,
            key_encoding,
            chunk_size,
            map,
            slice: None,
            map_block: None,
            state: StoreState::Creating,
        })
    }

    fn ensure_bound(&self) -> crate::Result<()> {
        if self.state == StoreState::Bound {
            Ok(())
        } else {
            Err(crate::Error::ClosedStore(self.store_id.clone()))
        }
    }

    /// Read a chunk's data.
    ///
    /// `Ok(None)` means the chunk was never written (distinct from
    /// zero-length data); the caller may synthesize fill content, or use
    /// [`get_chunk_or_fill`](Self::get_chunk_or_fill).
    pub fn get_chunk(&self, key: &str) -> crate::Result<Option<Bytes>> {
        self.ensure_bound()?;
        let coord = self.key_encoding.decode(key)?;
        let Some(index) = self.map.get(&coord)? else {
            return Ok(None);
        };
        let handle = self.manager.bind(index)?;
        Ok(Some(self.manager.read(&handle)?))
    }

    /// Read a chunk's data, synthesizing fill-value content for a chunk
    /// never written.
    pub fn get_chunk_or_fill(&self, key: &str) -> crate::Result<Bytes> {
        match self.get_chunk(key)? {
            Some(bytes) => Ok(bytes),
            None => Ok(Bytes::from(self.fill_chunk()?)),
        }
    }

    /// Overwrite a chunk's block in place.
    ///
    /// The payload must be exactly [`chunk_byte_size`](Self::chunk_byte_size)
    /// bytes. The map entry is updated only after the write lands, so a
    /// failed write leaves the chunk unwritten rather than pointing at a
    /// partial block.
    pub fn set_chunk(&mut self, key: &str, bytes: &[u8]) -> crate::Result<()> {
        self.ensure_bound()?;
        let coord = self.key_encoding.decode(key)?;
        if bytes.len() != self.chunk_size {
            return Err(crate::Error::SizeMismatch {
                expected: self.chunk_size,
                actual: bytes.len(),
            });
        }
        self.write_coord(&coord, bytes)
    }

    /// Individual chunks cannot be deleted; block slots are fixed-size and
    /// pre-allocated. Only whole-array deletion is meaningful, and that is
    /// the container's job.
    pub fn delete_chunk(&mut self, _key: &str) -> crate::Result<()> {
        self.ensure_bound()?;
        Err(crate::Error::UnsupportedOperation(
            "cannot delete chunks from a block-backed store".into(),
        ))
    }

    fn write_coord(&mut self, coord: &[u64], bytes: &[u8]) -> crate::Result<()> {
        let index = match self.map.get(coord)? {
            // block identity never changes once assigned
            Some(index) => index,
            None => {
                let index = match self.slice {
                    Some(slice) => slice.start + chunk::linear_index(coord, &self.grid),
                    // no pre-allocated slot: allocate on first write
                    None => self.manager.allocate(self.chunk_size as u64)?,
                };
                let owner = ClaimKey::for_chunk(self.store_id.as_str(), self.key_encoding.encode(coord));
                self.manager.claim(index, owner)?;
                index
            }
        };
        let handle = self.manager.bind(index)?;
        self.manager.write(&handle, bytes)?;
        self.map.set(coord, index)?;
        Ok(())
    }

    fn fill_chunk(&self) -> crate::Result<Vec<u8>> {
        let element = self.metadata.fill_element()?;
        Ok(element.repeat(self.chunk_size / element.len()))
    }

    /// Fill every never-written chunk, persist the chunk-to-block map as one
    /// extra block, and close the store.
    ///
    /// After this, every declared coordinate reads back a deterministic
    /// value from a store reopened via the returned source. Further chunk
    /// operations on this store fail with
    /// [`ClosedStore`](crate::Error::ClosedStore).
    pub fn finalize(&mut self) -> crate::Result<ChunkSource> {
        self.ensure_bound()?;

        let mut missing = Vec::new();
        for coord in iter_coords(&self.grid) {
            if self.map.get(&coord)?.is_none() {
                missing.push(coord);
            }
        }
        if !missing.is_empty() {
            let fill = self.fill_chunk()?;
            debug!(
                "store {:?}: filling {} never-written chunks",
                self.store_id,
                missing.len()
            );
            for coord in &missing {
                self.write_coord(coord, &fill)?;
            }
        }

        let map_block = self.manager.persist_extra(&self.map.encode())?;
        self.manager
            .claim(map_block, ClaimKey::for_store(self.store_id.as_str()))?;
        self.map_block = Some(map_block);
        self.state = StoreState::Closed;
        debug!(
            "finalized store {:?}: map in block {map_block}",
            self.store_id
        );
        Ok(ChunkSource::BlockMap { index: map_block })
    }
}

impl<M> BlockStore<M> {
    pub fn metadata(&self) -> &ZarrayMetadata {
        &self.metadata
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    /// Shape of the chunk grid.
    pub fn grid(&self) -> &[u64] {
        &self.grid
    }

    /// Exact byte size of every chunk, computed from metadata alone.
    pub fn chunk_byte_size(&self) -> usize {
        self.chunk_size
    }

    /// Contiguous block range, if this store was created (or opened) with
    /// back-to-back blocks in this session.
    pub fn block_slice(&self) -> Option<BlockSlice> {
        self.slice
    }

    /// Block holding the serialized chunk-to-block map, once persisted.
    pub fn map_block(&self) -> Option<BlockIndex> {
        self.map_block
    }
}
