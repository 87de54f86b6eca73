use std::path::PathBuf;

use serde_json::json;
use tempfile::TempDir;
use zarr_asdf::Error;
use zarr_asdf::manager::{BlockManager, FileBlockManager};
use zarr_asdf::metadata::{ChunkSource, ZarrayMetadata};
use zarr_asdf::storage::{BlockSlice, BlockStore};

fn container_path(dir: &TempDir) -> PathBuf {
    env_logger::try_init().ok();
    dir.path().join("test.asdfblk")
}

fn metadata(shape: Vec<u64>, chunks: Vec<u64>, fill_value: serde_json::Value) -> ZarrayMetadata {
    serde_json::from_value(json!({
        "zarr_format": 2,
        "shape": shape,
        "chunks": chunks,
        "dtype": "<i4",
        "compressor": null,
        "fill_value": fill_value,
        "order": "C",
        "filters": null,
    }))
    .expect("metadata should deserialize")
}

/// A chunk payload of `n` little-endian i32s, all equal to `value`.
fn chunk_i4(value: i32, n: usize) -> Vec<u8> {
    value.to_le_bytes().repeat(n)
}

#[test]
fn set_then_get_round_trips() {
    let dir = TempDir::new().unwrap();
    let manager = FileBlockManager::create(container_path(&dir)).unwrap();
    let mut store =
        BlockStore::create(&manager, metadata(vec![20, 9], vec![10, 3], json!(0)), "a").unwrap();

    assert_eq!(store.grid(), &[2, 3]);
    assert_eq!(store.chunk_byte_size(), 120);

    let payload = chunk_i4(7, 30);
    store.set_chunk("1.2", &payload).unwrap();
    assert_eq!(store.get_chunk("1.2").unwrap().unwrap(), payload);
    // other chunks are still unwritten
    assert!(store.get_chunk("0.0").unwrap().is_none());
}

#[test]
fn overwrite_keeps_block_identity() {
    let dir = TempDir::new().unwrap();
    let manager = FileBlockManager::create(container_path(&dir)).unwrap();
    let mut store =
        BlockStore::create(&manager, metadata(vec![100], vec![10], json!(0)), "a").unwrap();
    let blocks_after_create = manager.block_count().unwrap();

    store.set_chunk("3", &chunk_i4(1, 10)).unwrap();
    store.set_chunk("3", &chunk_i4(2, 10)).unwrap();

    assert_eq!(store.get_chunk("3").unwrap().unwrap(), chunk_i4(2, 10));
    // overwrite-in-place: no new blocks
    assert_eq!(manager.block_count().unwrap(), blocks_after_create);
}

#[test]
fn unwritten_chunks_synthesize_fill() {
    let dir = TempDir::new().unwrap();
    let manager = FileBlockManager::create(container_path(&dir)).unwrap();
    let store =
        BlockStore::create(&manager, metadata(vec![100], vec![10], json!(-3)), "a").unwrap();

    assert!(store.get_chunk("6").unwrap().is_none());
    assert_eq!(store.get_chunk_or_fill("6").unwrap(), chunk_i4(-3, 10));
}

#[test]
fn addressing_errors_are_fatal_and_typed() {
    let dir = TempDir::new().unwrap();
    let manager = FileBlockManager::create(container_path(&dir)).unwrap();
    let mut store =
        BlockStore::create(&manager, metadata(vec![100], vec![10], json!(0)), "a").unwrap();

    assert!(matches!(
        store.get_chunk("1.2"),
        Err(Error::MalformedKey { .. })
    ));
    assert!(matches!(
        store.get_chunk("ten"),
        Err(Error::MalformedKey { .. })
    ));
    assert!(matches!(
        store.get_chunk("10"),
        Err(Error::OutOfRange { .. })
    ));
    assert!(matches!(
        store.set_chunk("0", &chunk_i4(0, 9)),
        Err(Error::SizeMismatch {
            expected: 40,
            actual: 36
        })
    ));
    assert!(matches!(
        store.delete_chunk("0"),
        Err(Error::UnsupportedOperation(_))
    ));
}

#[test]
fn compressor_and_filters_are_rejected_before_allocation() {
    let dir = TempDir::new().unwrap();
    let manager = FileBlockManager::create(container_path(&dir)).unwrap();

    let mut meta = metadata(vec![100], vec![10], json!(0));
    meta.compressor = Some(json!({"id": "zstd"}));
    assert!(matches!(
        BlockStore::create(&manager, meta, "a"),
        Err(Error::UnsupportedFeature(_))
    ));

    let mut meta = metadata(vec![100], vec![10], json!(0));
    meta.filters = Some(json!([{"id": "delta"}]));
    assert!(matches!(
        BlockStore::create(&manager, meta, "a"),
        Err(Error::UnsupportedFeature(_))
    ));

    assert_eq!(manager.block_count().unwrap(), 0);
}

#[test]
fn null_separator_multi_chunk_grid_is_rejected() {
    let dir = TempDir::new().unwrap();
    let manager = FileBlockManager::create(container_path(&dir)).unwrap();

    let mut meta = metadata(vec![20], vec![10], json!(0));
    meta.dimension_separator = None;
    assert!(BlockStore::create(&manager, meta, "a").is_err());
    assert_eq!(manager.block_count().unwrap(), 0);

    // a single-chunk array is the one case unseparated keys can address
    let mut meta = metadata(vec![10], vec![10], json!(0));
    meta.dimension_separator = None;
    let mut store = BlockStore::create(&manager, meta, "a").unwrap();
    store.set_chunk("0", &chunk_i4(1, 10)).unwrap();
    assert_eq!(store.get_chunk("0").unwrap().unwrap(), chunk_i4(1, 10));
}

#[test]
fn create_records_contiguous_block_slice() {
    let dir = TempDir::new().unwrap();
    let manager = FileBlockManager::create(container_path(&dir)).unwrap();

    // occupy some leading blocks so the slice does not start at zero
    for _ in 0..5 {
        manager.allocate(8).unwrap();
    }
    let store = BlockStore::create(&manager, metadata(vec![40], vec![10], json!(0)), "a").unwrap();
    assert_eq!(store.block_slice(), Some(BlockSlice { start: 5, end: 9 }));
    assert_eq!(
        ChunkSource::from(store.block_slice().unwrap()).to_string(),
        "blocks://5:9"
    );
}

/// Allocator that burns a block between requests, so issued indices are
/// never consecutive.
struct GappyAllocator<'a> {
    inner: &'a FileBlockManager,
}

impl BlockManager for GappyAllocator<'_> {
    fn allocate(&self, size: u64) -> zarr_asdf::Result<u64> {
        let index = self.inner.allocate(size)?;
        self.inner.allocate(0)?;
        Ok(index)
    }

    fn bind(&self, index: u64) -> zarr_asdf::Result<zarr_asdf::block::BlockHandle> {
        self.inner.bind(index)
    }

    fn read(&self, handle: &zarr_asdf::block::BlockHandle) -> zarr_asdf::Result<bytes::Bytes> {
        self.inner.read(handle)
    }

    fn write(&self, handle: &zarr_asdf::block::BlockHandle, bytes: &[u8]) -> zarr_asdf::Result<()> {
        self.inner.write(handle, bytes)
    }

    fn claim(&self, index: u64, owner: zarr_asdf::manager::ClaimKey) -> zarr_asdf::Result<()> {
        self.inner.claim(index, owner)
    }

    fn release_unclaimed(&self) -> zarr_asdf::Result<Vec<u64>> {
        self.inner.release_unclaimed()
    }
}

#[test]
fn non_consecutive_allocation_is_fatal() {
    let dir = TempDir::new().unwrap();
    let manager = FileBlockManager::create(container_path(&dir)).unwrap();
    let gappy = GappyAllocator { inner: &manager };

    assert!(matches!(
        BlockStore::create(&gappy, metadata(vec![100], vec![10], json!(0)), "a"),
        Err(Error::AllocationOrder {
            expected: 1,
            actual: 2
        })
    ));
}

#[test]
fn finalize_closes_the_store() {
    let dir = TempDir::new().unwrap();
    let manager = FileBlockManager::create(container_path(&dir)).unwrap();
    let mut store =
        BlockStore::create(&manager, metadata(vec![100], vec![10], json!(0)), "a").unwrap();

    store.finalize().unwrap();
    assert!(matches!(store.get_chunk("0"), Err(Error::ClosedStore(_))));
    assert!(matches!(
        store.set_chunk("0", &chunk_i4(0, 10)),
        Err(Error::ClosedStore(_))
    ));
    assert!(matches!(store.finalize(), Err(Error::ClosedStore(_))));
}

#[test]
fn claimed_blocks_survive_collection() {
    let dir = TempDir::new().unwrap();
    let manager = FileBlockManager::create(container_path(&dir)).unwrap();

    let orphan = manager.allocate(16).unwrap();
    let mut store =
        BlockStore::create(&manager, metadata(vec![30], vec![10], json!(0)), "a").unwrap();
    store.set_chunk("1", &chunk_i4(5, 10)).unwrap();

    let released = manager.release_unclaimed().unwrap();
    assert_eq!(released, vec![orphan]);
    assert!(manager.bind(orphan).is_err());
    // the store's blocks are untouched
    assert_eq!(store.get_chunk("1").unwrap().unwrap(), chunk_i4(5, 10));
}

#[test]
fn end_to_end_write_finalize_reopen() {
    let dir = TempDir::new().unwrap();
    let path = container_path(&dir);
    let meta = metadata(vec![100], vec![10], json!(42));

    let source;
    let slice;
    {
        let manager = FileBlockManager::create(&path).unwrap();
        let mut store = BlockStore::create(&manager, meta.clone(), "my_zarr").unwrap();
        for i in 0..5i32 {
            store
                .set_chunk(&i.to_string(), &chunk_i4(i, 10))
                .unwrap();
        }
        for i in 0..5i32 {
            assert_eq!(
                store.get_chunk(&i.to_string()).unwrap().unwrap(),
                chunk_i4(i, 10)
            );
        }
        for i in 5..10 {
            assert_eq!(
                store.get_chunk_or_fill(&i.to_string()).unwrap(),
                chunk_i4(42, 10)
            );
        }
        slice = store.block_slice().unwrap();
        source = store.finalize().unwrap();
        assert_eq!(store.map_block(), Some(slice.end));
    }

    // reopen from the persisted chunk-to-block map
    let manager = FileBlockManager::open(&path).unwrap();
    let store = BlockStore::open_with_source(&manager, meta.clone(), "my_zarr", source).unwrap();
    for i in 0..5i32 {
        assert_eq!(
            store.get_chunk(&i.to_string()).unwrap().unwrap(),
            chunk_i4(i, 10)
        );
    }
    for i in 5..10i32 {
        // finalize materialized the fill value into these blocks
        assert_eq!(
            store.get_chunk(&i.to_string()).unwrap().unwrap(),
            chunk_i4(42, 10)
        );
    }

    // every block the reopened store depends on is claimed, so collection
    // only drops the leftovers (here: nothing)
    assert_eq!(manager.release_unclaimed().unwrap(), Vec::<u64>::new());

    // the contiguous range reference reads identically
    let by_slice = BlockStore::open_with_slice(&manager, meta, "my_zarr", slice).unwrap();
    for i in 0..5i32 {
        assert_eq!(
            by_slice.get_chunk(&i.to_string()).unwrap().unwrap(),
            chunk_i4(i, 10)
        );
    }
}

#[test]
fn reopened_file_collects_unreferenced_blocks() {
    let dir = TempDir::new().unwrap();
    let path = container_path(&dir);
    let meta = metadata(vec![20], vec![10], json!(0));

    let source;
    let orphan;
    {
        let manager = FileBlockManager::create(&path).unwrap();
        orphan = manager.allocate(16).unwrap();
        let mut store = BlockStore::create(&manager, meta.clone(), "a").unwrap();
        store.set_chunk("0", &chunk_i4(9, 10)).unwrap();
        source = store.finalize().unwrap();
    }

    // claims do not persist; they are rebuilt when a store binds
    let manager = FileBlockManager::open(&path).unwrap();
    let store = BlockStore::open_with_source(&manager, meta, "a", source).unwrap();
    let released = manager.release_unclaimed().unwrap();
    assert_eq!(released, vec![orphan]);
    assert_eq!(store.get_chunk("0").unwrap().unwrap(), chunk_i4(9, 10));
}

#[test]
fn chunk_source_string_round_trip() {
    let range: ChunkSource = "blocks://5:9".parse().unwrap();
    assert_eq!(range, ChunkSource::BlockRange { start: 5, end: 9 });
    assert_eq!(range.to_string(), "blocks://5:9");

    let map: ChunkSource = "blockmap://12".parse().unwrap();
    assert_eq!(map, ChunkSource::BlockMap { index: 12 });
    assert_eq!(serde_json::to_string(&map).unwrap(), "\"blockmap://12\"");
    assert!("file:///tmp/chunks".parse::<ChunkSource>().is_err());
}
