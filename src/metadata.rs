use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Representation of zarr v2 `.zarray` metadata.
///
/// This is the array descriptor exchanged with the chunked-array library.
/// Only uncompressed, unfiltered arrays can be stored in container blocks,
/// because a chunk's byte size must be computable from metadata alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZarrayMetadata {
    /// Zarr storage format version; always 2.
    #[serde(default = "default_zarr_format")]
    pub zarr_format: u32,
    /// Array shape.
    pub shape: Vec<u64>,
    /// Chunk shape; same rank as `shape`.
    pub chunks: Vec<u64>,
    /// Data type as a numpy type string, e.g. `<i4`.
    pub dtype: String,
    /// Chunk compression configuration. Must be null.
    pub compressor: Option<serde_json::Value>,
    /// Default content for chunks never written.
    pub fill_value: Option<serde_json::Value>,
    /// Memory order within a chunk, `C` or `F`.
    #[serde(default = "default_order")]
    pub order: String,
    /// Chunk filter chain. Must be null.
    #[serde(default)]
    pub filters: Option<serde_json::Value>,
    /// Separator between coordinate components in chunk keys.
    ///
    /// An absent field means `.` per zarr convention; an explicit null means
    /// keys are not split, which only makes sense for a single-chunk array.
    #[serde(default = "default_separator")]
    pub dimension_separator: Option<char>,
}

fn default_zarr_format() -> u32 {
    2
}

fn default_order() -> String {
    "C".to_string()
}

fn default_separator() -> Option<char> {
    Some('.')
}

impl ZarrayMetadata {
    /// Check the invariants required to store this array as container blocks.
    ///
    /// Rejection happens here, before any block is allocated.
    pub fn validate(&self) -> crate::Result<()> {
        if let Some(compressor) = &self.compressor {
            return Err(crate::Error::UnsupportedFeature(format!(
                "compressor {compressor} (only uncompressed arrays can be stored in blocks)"
            )));
        }
        if self.filters.is_some() {
            return Err(crate::Error::UnsupportedFeature(
                "filters (only unfiltered arrays can be stored in blocks)".into(),
            ));
        }
        if self.zarr_format != 2 {
            return Err(crate::Error::UnsupportedFeature(format!(
                "zarr format {}",
                self.zarr_format
            )));
        }
        if self.shape.len() != self.chunks.len() {
            return Err(crate::Error::general(format!(
                "shape has {} dimensions but chunks has {}",
                self.shape.len(),
                self.chunks.len()
            )));
        }
        if self.shape.iter().any(|&s| s == 0) || self.chunks.iter().any(|&c| c == 0) {
            return Err(crate::Error::general(
                "shape and chunks entries must be positive",
            ));
        }
        if self.dimension_separator.is_none() {
            // unseparated keys cannot address more than one chunk
            let chunk_count: u64 = self
                .shape
                .iter()
                .zip(&self.chunks)
                .map(|(&s, &c)| s.div_ceil(c))
                .product();
            if chunk_count > 1 {
                return Err(crate::Error::general(format!(
                    "dimension_separator is null but the array has {chunk_count} chunks"
                )));
            }
        }
        self.data_type()?;
        Ok(())
    }

    /// Parse the numpy dtype string.
    pub fn data_type(&self) -> crate::Result<DataType> {
        self.dtype.parse()
    }

    /// Size in bytes of a single array element.
    pub fn item_size(&self) -> crate::Result<usize> {
        Ok(self.data_type()?.size)
    }

    /// Encode the fill value as the bytes of a single element.
    ///
    /// Fails if no fill value is defined; a store with unwritten chunks
    /// cannot be finalized without one.
    pub fn fill_element(&self) -> crate::Result<Vec<u8>> {
        let value = self
            .fill_value
            .as_ref()
            .ok_or_else(|| crate::Error::general("fill_value is not defined"))?;
        self.data_type()?.encode_element(value)
    }
}

/// A parsed numpy type string: kind, element size and byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataType {
    pub kind: DataTypeKind,
    /// Element size in bytes.
    pub size: usize,
    pub big_endian: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataTypeKind {
    Int,
    Uint,
    Float,
}

impl FromStr for DataType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (big_endian, rest) = match s.as_bytes().first() {
            Some(&b'<') | Some(&b'|') | Some(&b'=') => (false, &s[1..]),
            Some(&b'>') => (true, &s[1..]),
            _ => (false, s),
        };
        let mut chars = rest.chars();
        let kind = match chars.next() {
            Some('i') => DataTypeKind::Int,
            Some('u') => DataTypeKind::Uint,
            Some('f') => DataTypeKind::Float,
            _ => return Err(crate::Error::general(format!("unsupported dtype: {s}"))),
        };
        let size: usize = chars
            .as_str()
            .parse()
            .map_err(|_| crate::Error::general(format!("unsupported dtype: {s}")))?;
        let valid = match kind {
            DataTypeKind::Float => matches!(size, 4 | 8),
            _ => matches!(size, 1 | 2 | 4 | 8),
        };
        if !valid {
            return Err(crate::Error::general(format!("unsupported dtype: {s}")));
        }
        Ok(DataType {
            kind,
            size,
            big_endian,
        })
    }
}

impl DataType {
    /// Encode a JSON scalar as one element in this dtype.
    pub fn encode_element(&self, value: &serde_json::Value) -> crate::Result<Vec<u8>> {
        let bad = || crate::Error::general(format!("fill_value {value} does not fit dtype"));
        let le = match self.kind {
            DataTypeKind::Int => {
                let v = value.as_i64().ok_or_else(bad)?;
                match self.size {
                    1 => i8::try_from(v).map_err(|_| bad())?.to_le_bytes().to_vec(),
                    2 => i16::try_from(v).map_err(|_| bad())?.to_le_bytes().to_vec(),
                    4 => i32::try_from(v).map_err(|_| bad())?.to_le_bytes().to_vec(),
                    _ => v.to_le_bytes().to_vec(),
                }
            }
            DataTypeKind::Uint => {
                let v = value.as_u64().ok_or_else(bad)?;
                match self.size {
                    1 => u8::try_from(v).map_err(|_| bad())?.to_le_bytes().to_vec(),
                    2 => u16::try_from(v).map_err(|_| bad())?.to_le_bytes().to_vec(),
                    4 => u32::try_from(v).map_err(|_| bad())?.to_le_bytes().to_vec(),
                    _ => v.to_le_bytes().to_vec(),
                }
            }
            DataTypeKind::Float => {
                let v = value.as_f64().ok_or_else(bad)?;
                match self.size {
                    4 => (v as f32).to_le_bytes().to_vec(),
                    _ => v.to_le_bytes().to_vec(),
                }
            }
        };
        if self.big_endian {
            Ok(le.into_iter().rev().collect())
        } else {
            Ok(le)
        }
    }
}

/// Reference from the document tree to where an array's chunk data lives.
///
/// Rendered as a source string, e.g. `blocks://3:13` for a contiguous run of
/// blocks in canonical chunk order, or `blockmap://13` for the block holding
/// the encoded chunk-to-block map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSource {
    /// Half-open range of consecutive block indices, one per chunk.
    BlockRange { start: u64, end: u64 },
    /// Index of the block holding the serialized chunk-to-block map.
    BlockMap { index: u64 },
}

impl fmt::Display for ChunkSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkSource::BlockRange { start, end } => write!(f, "blocks://{start}:{end}"),
            ChunkSource::BlockMap { index } => write!(f, "blockmap://{index}"),
        }
    }
}

impl FromStr for ChunkSource {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || crate::Error::general(format!("unsupported chunk source: {s}"));
        let (scheme, rest) = s.split_once("://").ok_or_else(bad)?;
        match scheme {
            "blocks" => {
                let (start, end) = rest.split_once(':').ok_or_else(bad)?;
                Ok(ChunkSource::BlockRange {
                    start: start.parse().map_err(|_| bad())?,
                    end: end.parse().map_err(|_| bad())?,
                })
            }
            "blockmap" => Ok(ChunkSource::BlockMap {
                index: rest.parse().map_err(|_| bad())?,
            }),
            _ => Err(bad()),
        }
    }
}

impl Serialize for ChunkSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChunkSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
