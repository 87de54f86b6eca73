use crate::metadata::ZarrayMetadata;

/// Shape of the chunk grid: `ceil(shape / chunks)` per axis.
pub fn grid_shape(metadata: &ZarrayMetadata) -> Vec<u64> {
    metadata
        .shape
        .iter()
        .zip(&metadata.chunks)
        .map(|(&s, &c)| s.div_ceil(c))
        .collect()
}

/// Total number of chunks in the grid.
pub fn chunk_count(grid: &[u64]) -> u64 {
    grid.iter().product()
}

/// Size in bytes of every chunk.
///
/// Exact and context-free: blocks are sized before any chunk data exists,
/// so this must not depend on inspecting data. This is why compressed
/// chunks cannot be supported.
pub fn chunk_byte_size(metadata: &ZarrayMetadata) -> crate::Result<usize> {
    let numel: u64 = metadata.chunks.iter().product();
    Ok(metadata.item_size()? * usize::try_from(numel).map_err(crate::Error::wrap)?)
}

/// Position of a coordinate in the canonical row-major enumeration.
pub(crate) fn linear_index(coord: &[u64], grid: &[u64]) -> u64 {
    let mut idx = 0;
    for (&c, &g) in coord.iter().zip(grid) {
        idx = idx * g + c;
    }
    idx
}

/// Iterate all chunk coordinates in row-major order, first axis slowest.
///
/// This is the canonical enumeration order; create-mode contiguous block
/// allocation depends on it.
pub fn iter_coords(grid: &[u64]) -> ChunkCoordIter {
    ChunkCoordIter {
        grid: grid.to_vec(),
        next: if grid.contains(&0) {
            None
        } else {
            Some(vec![0; grid.len()])
        },
    }
}

#[derive(Debug, Clone)]
pub struct ChunkCoordIter {
    grid: Vec<u64>,
    next: Option<Vec<u64>>,
}

impl Iterator for ChunkCoordIter {
    type Item = Vec<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        let mut succ = current.clone();
        for axis in (0..self.grid.len()).rev() {
            succ[axis] += 1;
            if succ[axis] < self.grid[axis] {
                self.next = Some(succ);
                break;
            }
            succ[axis] = 0;
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(shape: Vec<u64>, chunks: Vec<u64>) -> ZarrayMetadata {
        serde_json::from_value(serde_json::json!({
            "zarr_format": 2,
            "shape": shape,
            "chunks": chunks,
            "dtype": "<i4",
            "compressor": null,
            "fill_value": 0,
            "order": "C",
            "filters": null,
        }))
        .unwrap()
    }

    #[test]
    fn grid_rounds_up_partial_chunks() {
        assert_eq!(grid_shape(&meta(vec![100], vec![10])), vec![10]);
        assert_eq!(grid_shape(&meta(vec![101], vec![10])), vec![11]);
        assert_eq!(grid_shape(&meta(vec![9, 10], vec![10, 3])), vec![1, 4]);
    }

    #[test]
    fn byte_size_from_metadata_alone() {
        assert_eq!(chunk_byte_size(&meta(vec![100], vec![10])).unwrap(), 40);
        assert_eq!(
            chunk_byte_size(&meta(vec![10, 10], vec![4, 4])).unwrap(),
            64
        );
    }

    #[test]
    fn coords_enumerate_row_major() {
        let coords: Vec<_> = iter_coords(&[2, 3]).collect();
        assert_eq!(
            coords,
            vec![
                vec![0, 0],
                vec![0, 1],
                vec![0, 2],
                vec![1, 0],
                vec![1, 1],
                vec![1, 2],
            ]
        );
        for (i, c) in coords.iter().enumerate() {
            assert_eq!(linear_index(c, &[2, 3]), i as u64);
        }
    }

    #[test]
    fn zero_rank_grid_has_one_chunk() {
        let coords: Vec<_> = iter_coords(&[]).collect();
        assert_eq!(coords, vec![Vec::<u64>::new()]);
        assert_eq!(chunk_count(&[]), 1);
    }
}
