use crate::chunk::{chunk_count, linear_index};

/// Map entry meaning "no block assigned yet".
pub const MISSING_CHUNK: i32 = -1;

/// Dense map from chunk coordinate to the container block holding that
/// chunk's data.
///
/// Shaped like the chunk grid and stored row-major, so it round-trips
/// through a flat little-endian byte buffer and can itself be persisted as
/// one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBlockMap {
    grid: Vec<u64>,
    entries: Vec<i32>,
}

impl ChunkBlockMap {
    /// An all-sentinel map for a freshly created store.
    pub fn new_empty(grid: &[u64]) -> crate::Result<Self> {
        let count = usize::try_from(chunk_count(grid)).map_err(crate::Error::wrap)?;
        Ok(Self {
            grid: grid.to_vec(),
            entries: vec![MISSING_CHUNK; count],
        })
    }

    /// Decode a map previously written with [`encode`](Self::encode).
    pub fn decode(bytes: &[u8], grid: &[u64]) -> crate::Result<Self> {
        let count = usize::try_from(chunk_count(grid)).map_err(crate::Error::wrap)?;
        let expected = count * size_of::<i32>();
        if bytes.len() != expected {
            return Err(crate::Error::CorruptMap(format!(
                "{} bytes for grid {grid:?}, expected {expected}",
                bytes.len()
            )));
        }
        let entries: Vec<i32> = bytes
            .chunks_exact(size_of::<i32>())
            .map(|b| i32::from_le_bytes(b.try_into().expect("chunks_exact yields 4 bytes")))
            .collect();
        if let Some(bad) = entries.iter().find(|&&e| e < MISSING_CHUNK) {
            return Err(crate::Error::CorruptMap(format!(
                "negative block index {bad}"
            )));
        }
        Ok(Self {
            grid: grid.to_vec(),
            entries,
        })
    }

    /// Flat little-endian representation, one i32 per chunk in row-major
    /// order.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * size_of::<i32>());
        for e in &self.entries {
            out.extend_from_slice(&e.to_le_bytes());
        }
        out
    }

    fn entry_index(&self, coord: &[u64]) -> crate::Result<usize> {
        if coord.len() != self.grid.len()
            || coord.iter().zip(&self.grid).any(|(&c, &g)| c >= g)
        {
            return Err(crate::Error::OutOfRange {
                coord: coord.to_vec(),
                grid: self.grid.clone(),
            });
        }
        usize::try_from(linear_index(coord, &self.grid)).map_err(crate::Error::wrap)
    }

    /// Block index for a coordinate, or `None` if the chunk was never
    /// written.
    pub fn get(&self, coord: &[u64]) -> crate::Result<Option<u64>> {
        let entry = self.entries[self.entry_index(coord)?];
        if entry == MISSING_CHUNK {
            Ok(None)
        } else {
            Ok(Some(entry as u64))
        }
    }

    pub fn set(&mut self, coord: &[u64], block_index: u64) -> crate::Result<()> {
        let i = self.entry_index(coord)?;
        let entry = i32::try_from(block_index).map_err(|_| {
            crate::Error::general(format!("block index {block_index} exceeds map range"))
        })?;
        self.entries[i] = entry;
        Ok(())
    }

    /// All block indices the map references; these must stay claimed so the
    /// block manager does not collect them.
    pub fn claimed_indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries
            .iter()
            .filter(|&&e| e != MISSING_CHUNK)
            .map(|&e| e as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut map = ChunkBlockMap::new_empty(&[2, 3]).unwrap();
        map.set(&[0, 1], 5).unwrap();
        map.set(&[1, 2], 9).unwrap();
        let decoded = ChunkBlockMap::decode(&map.encode(), &[2, 3]).unwrap();
        assert_eq!(decoded, map);
        assert_eq!(decoded.get(&[0, 1]).unwrap(), Some(5));
        assert_eq!(decoded.get(&[0, 0]).unwrap(), None);
        assert_eq!(decoded.claimed_indices().collect::<Vec<_>>(), vec![5, 9]);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let err = ChunkBlockMap::decode(&[0; 10], &[2, 3]).unwrap_err();
        assert!(matches!(err, crate::Error::CorruptMap(_)));
    }

    #[test]
    fn get_and_set_reject_out_of_grid_coords() {
        let mut map = ChunkBlockMap::new_empty(&[2, 3]).unwrap();
        assert!(matches!(
            map.get(&[2, 0]),
            Err(crate::Error::OutOfRange { .. })
        ));
        assert!(matches!(
            map.set(&[0, 3], 1),
            Err(crate::Error::OutOfRange { .. })
        ));
        assert!(matches!(
            map.get(&[0]),
            Err(crate::Error::OutOfRange { .. })
        ));
    }
}
