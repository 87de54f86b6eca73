use std::fmt::Write;

/// Bijective conversion between chunk coordinates and chunk key strings.
///
/// Keys are the coordinate components joined by the array's dimension
/// separator. With no separator, keys are not split; that only works for a
/// single-chunk array, which gets the identity key `0`.
#[derive(Debug, Clone)]
pub struct ChunkKeyEncoding {
    separator: Option<char>,
    rank: usize,
}

impl ChunkKeyEncoding {
    pub fn new(separator: Option<char>, rank: usize) -> Self {
        Self { separator, rank }
    }

    pub fn encode(&self, coord: &[u64]) -> String {
        if coord.is_empty() {
            return "0".to_string();
        }
        let Some(sep) = self.separator else {
            return "0".to_string();
        };
        let mut s = String::with_capacity(coord.len() * 2);
        let mut is_first = true;
        for c in coord {
            if is_first {
                is_first = false;
            } else {
                s.push(sep);
            }
            s.write_fmt(format_args!("{c}")).expect("write to string");
        }
        s
    }

    pub fn decode(&self, key: &str) -> crate::Result<Vec<u64>> {
        let Some(sep) = self.separator else {
            if key == "0" {
                return Ok(vec![0; self.rank]);
            }
            return Err(crate::Error::malformed_key(
                key,
                "store has no dimension separator, the only valid key is \"0\"",
            ));
        };
        if self.rank == 0 {
            if key == "0" {
                return Ok(Vec::new());
            }
            return Err(crate::Error::malformed_key(
                key,
                "zero-dimensional array, the only valid key is \"0\"",
            ));
        }
        let components: Vec<&str> = key.split(sep).collect();
        if components.len() != self.rank {
            return Err(crate::Error::malformed_key(
                key,
                format!(
                    "expected {} components separated by {sep:?}, got {}",
                    self.rank,
                    components.len()
                ),
            ));
        }
        components
            .iter()
            .map(|c| {
                c.parse().map_err(|_| {
                    crate::Error::malformed_key(key, format!("component {c:?} is not an integer"))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_separator() {
        let enc = ChunkKeyEncoding::new(Some('.'), 3);
        assert_eq!(enc.encode(&[1, 0, 12]), "1.0.12");
        assert_eq!(enc.decode("1.0.12").unwrap(), vec![1, 0, 12]);

        let slash = ChunkKeyEncoding::new(Some('/'), 2);
        assert_eq!(slash.encode(&[4, 7]), "4/7");
        assert_eq!(slash.decode("4/7").unwrap(), vec![4, 7]);
    }

    #[test]
    fn rejects_malformed_keys() {
        let enc = ChunkKeyEncoding::new(Some('.'), 2);
        assert!(matches!(
            enc.decode("1"),
            Err(crate::Error::MalformedKey { .. })
        ));
        assert!(matches!(
            enc.decode("1.2.3"),
            Err(crate::Error::MalformedKey { .. })
        ));
        assert!(matches!(
            enc.decode("1.x"),
            Err(crate::Error::MalformedKey { .. })
        ));
    }

    #[test]
    fn no_separator_is_identity_for_single_chunk() {
        let enc = ChunkKeyEncoding::new(None, 2);
        assert_eq!(enc.encode(&[0, 0]), "0");
        assert_eq!(enc.decode("0").unwrap(), vec![0, 0]);
        assert!(matches!(
            enc.decode("0.0"),
            Err(crate::Error::MalformedKey { .. })
        ));
    }
}
