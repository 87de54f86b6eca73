use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use log::debug;

use crate::block::{BlockHandle, BlockHeader, BlockIndex, FLAG_TOMBSTONE};

/// A registered dependency from a logical owner onto a block index.
///
/// Chunk data blocks are owned by `(store identity, chunk key)`; the block
/// holding a store's serialized chunk-to-block map is owned by the store
/// identity alone. Identity is an explicit string so claims survive the file
/// being closed and reopened.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClaimKey {
    pub store: String,
    pub chunk: Option<String>,
}

impl ClaimKey {
    pub fn for_store(store: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            chunk: None,
        }
    }

    pub fn for_chunk(store: impl Into<String>, chunk_key: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            chunk: Some(chunk_key.into()),
        }
    }
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.chunk {
            Some(c) => write!(f, "{}/{c}", self.store),
            None => f.write_str(&self.store),
        }
    }
}

/// Allocation, lookup and reclamation of fixed-size blocks in a container
/// file.
///
/// Blocks are overwrite-in-place only; growing a block after allocation is
/// not supported. A block claimed by at least one live [`ClaimKey`] is never
/// dropped; a block with zero claims may be collected by
/// [`release_unclaimed`](Self::release_unclaimed).
pub trait BlockManager {
    /// Reserve a new block with `size` bytes of payload.
    fn allocate(&self, size: u64) -> crate::Result<BlockIndex>;

    /// Resolve an index to a payload region.
    fn bind(&self, index: BlockIndex) -> crate::Result<BlockHandle>;

    fn read(&self, handle: &BlockHandle) -> crate::Result<Bytes>;

    /// Overwrite a block's payload. `bytes` must match the payload size
    /// exactly.
    fn write(&self, handle: &BlockHandle, bytes: &[u8]) -> crate::Result<()>;

    /// Register `owner` as depending on the block at `index`.
    fn claim(&self, index: BlockIndex, owner: ClaimKey) -> crate::Result<()>;

    /// Drop every block with no claims; returns the released indices.
    fn release_unclaimed(&self) -> crate::Result<Vec<BlockIndex>>;

    /// Store out-of-band bytes (e.g. a serialized chunk-to-block map) as one
    /// more block.
    fn persist_extra(&self, bytes: &[u8]) -> crate::Result<BlockIndex> {
        let index = self.allocate(bytes.len() as u64)?;
        let handle = self.bind(index)?;
        self.write(&handle, bytes)?;
        Ok(index)
    }
}

impl<T: BlockManager + ?Sized> BlockManager for &T {
    fn allocate(&self, size: u64) -> crate::Result<BlockIndex> {
        (**self).allocate(size)
    }

    fn bind(&self, index: BlockIndex) -> crate::Result<BlockHandle> {
        (**self).bind(index)
    }

    fn read(&self, handle: &BlockHandle) -> crate::Result<Bytes> {
        (**self).read(handle)
    }

    fn write(&self, handle: &BlockHandle, bytes: &[u8]) -> crate::Result<()> {
        (**self).write(handle, bytes)
    }

    fn claim(&self, index: BlockIndex, owner: ClaimKey) -> crate::Result<()> {
        (**self).claim(index, owner)
    }

    fn release_unclaimed(&self) -> crate::Result<Vec<BlockIndex>> {
        (**self).release_unclaimed()
    }

    fn persist_extra(&self, bytes: &[u8]) -> crate::Result<BlockIndex> {
        (**self).persist_extra(bytes)
    }
}

impl<T: BlockManager + ?Sized> BlockManager for Arc<T> {
    fn allocate(&self, size: u64) -> crate::Result<BlockIndex> {
        (**self).allocate(size)
    }

    fn bind(&self, index: BlockIndex) -> crate::Result<BlockHandle> {
        (**self).bind(index)
    }

    fn read(&self, handle: &BlockHandle) -> crate::Result<Bytes> {
        (**self).read(handle)
    }

    fn write(&self, handle: &BlockHandle, bytes: &[u8]) -> crate::Result<()> {
        (**self).write(handle, bytes)
    }

    fn claim(&self, index: BlockIndex, owner: ClaimKey) -> crate::Result<()> {
        (**self).claim(index, owner)
    }

    fn release_unclaimed(&self) -> crate::Result<Vec<BlockIndex>> {
        (**self).release_unclaimed()
    }

    fn persist_extra(&self, bytes: &[u8]) -> crate::Result<BlockIndex> {
        (**self).persist_extra(bytes)
    }
}

const CONTAINER_MAGIC: [u8; 8] = *b"ASDFBLK\0";

struct BlockRecord {
    /// File offset of the block header.
    offset: u64,
    header: BlockHeader,
}

impl BlockRecord {
    fn payload_offset(&self) -> u64 {
        self.offset + BlockHeader::LEN as u64
    }

    fn end(&self) -> u64 {
        self.payload_offset() + self.header.allocated
    }
}

struct Inner {
    file: File,
    blocks: Vec<BlockRecord>,
    claims: HashMap<BlockIndex, HashSet<ClaimKey>>,
}

/// [`BlockManager`] backed by a single container file.
///
/// Blocks are laid out back-to-back after a file magic, each prefixed with a
/// [`BlockHeader`]. Reopening a file rebuilds the block list by scanning
/// headers; claims are rebuilt by the stores that bind to the file.
pub struct FileBlockManager {
    inner: Mutex<Inner>,
}

impl FileBlockManager {
    /// Create a fresh, empty container file. An existing file is truncated.
    pub fn create(path: impl AsRef<Path>) -> crate::Result<Self> {
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&CONTAINER_MAGIC)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                file,
                blocks: Vec::new(),
                claims: HashMap::new(),
            }),
        })
    }

    /// Open an existing container file, scanning its block headers.
    pub fn open(path: impl AsRef<Path>) -> crate::Result<Self> {
        let mut file = File::options().read(true).write(true).open(path)?;
        let len = file.seek(SeekFrom::End(0))?;

        let mut magic = [0u8; CONTAINER_MAGIC.len()];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut magic)?;
        if magic != CONTAINER_MAGIC {
            return Err(crate::Error::general("not a block container file"));
        }

        let mut blocks = Vec::new();
        let mut offset = CONTAINER_MAGIC.len() as u64;
        let mut header_buf = [0u8; BlockHeader::LEN];
        while offset < len {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut header_buf)?;
            let record = BlockRecord {
                offset,
                header: BlockHeader::from_bytes(&header_buf)?,
            };
            offset = record.end();
            blocks.push(record);
        }
        debug!("opened container with {} blocks", blocks.len());
        Ok(Self {
            inner: Mutex::new(Inner {
                file,
                blocks,
                claims: HashMap::new(),
            }),
        })
    }

    /// Number of blocks in the container, released ones included.
    pub fn block_count(&self) -> crate::Result<usize> {
        Ok(self.lock()?.blocks.len())
    }

    fn lock(&self) -> crate::Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| crate::Error::general("block manager lock poisoned"))
    }
}

impl Inner {
    fn record(&self, index: BlockIndex) -> crate::Result<&BlockRecord> {
        let record = usize::try_from(index)
            .ok()
            .and_then(|i| self.blocks.get(i))
            .ok_or_else(|| crate::Error::general(format!("no block at index {index}")))?;
        if record.header.is_tombstone() {
            return Err(crate::Error::general(format!(
                "block {index} has been released"
            )));
        }
        Ok(record)
    }
}

impl BlockManager for FileBlockManager {
    fn allocate(&self, size: u64) -> crate::Result<BlockIndex> {
        let mut inner = self.lock()?;
        let offset = inner
            .blocks
            .last()
            .map(BlockRecord::end)
            .unwrap_or(CONTAINER_MAGIC.len() as u64);
        let header = BlockHeader::new(size);
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&header.to_bytes())?;
        // reserve the payload; the extension reads back as zeros
        inner
            .file
            .set_len(offset + BlockHeader::LEN as u64 + size)?;
        inner.blocks.push(BlockRecord { offset, header });
        let index = (inner.blocks.len() - 1) as BlockIndex;
        debug!("allocated block {index}: {size} bytes at offset {offset}");
        Ok(index)
    }

    fn bind(&self, index: BlockIndex) -> crate::Result<BlockHandle> {
        let inner = self.lock()?;
        let record = inner.record(index)?;
        Ok(BlockHandle {
            payload_offset: record.payload_offset(),
            size: record.header.allocated,
        })
    }

    fn read(&self, handle: &BlockHandle) -> crate::Result<Bytes> {
        let mut inner = self.lock()?;
        let mut buf = vec![0u8; usize::try_from(handle.size).map_err(crate::Error::wrap)?];
        inner.file.seek(SeekFrom::Start(handle.payload_offset))?;
        inner.file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn write(&self, handle: &BlockHandle, bytes: &[u8]) -> crate::Result<()> {
        if bytes.len() as u64 != handle.size {
            return Err(crate::Error::SizeMismatch {
                expected: usize::try_from(handle.size).map_err(crate::Error::wrap)?,
                actual: bytes.len(),
            });
        }
        let mut inner = self.lock()?;
        inner.file.seek(SeekFrom::Start(handle.payload_offset))?;
        inner.file.write_all(bytes)?;
        inner.file.flush()?;
        Ok(())
    }

    fn claim(&self, index: BlockIndex, owner: ClaimKey) -> crate::Result<()> {
        let mut inner = self.lock()?;
        inner.record(index)?;
        inner.claims.entry(index).or_default().insert(owner);
        Ok(())
    }

    fn release_unclaimed(&self) -> crate::Result<Vec<BlockIndex>> {
        let mut inner = self.lock()?;
        let mut released = Vec::new();
        for i in 0..inner.blocks.len() {
            let index = i as BlockIndex;
            if inner.blocks[i].header.is_tombstone() {
                continue;
            }
            if inner.claims.get(&index).is_some_and(|c| !c.is_empty()) {
                continue;
            }
            inner.blocks[i].header.flags |= FLAG_TOMBSTONE;
            let offset = inner.blocks[i].offset;
            let header_bytes = inner.blocks[i].header.to_bytes();
            inner.file.seek(SeekFrom::Start(offset))?;
            inner.file.write_all(&header_bytes)?;
            released.push(index);
        }
        if !released.is_empty() {
            inner.file.flush()?;
            debug!("released {} unclaimed blocks: {released:?}", released.len());
        }
        Ok(released)
    }
}
