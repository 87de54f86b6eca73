pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The array descriptor requests compression or filters.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
    /// The allocator issued a non-consecutive block index during creation.
    #[error("blocks allocated out of order: expected index {expected}, got {actual}")]
    AllocationOrder { expected: u64, actual: u64 },
    /// A chunk payload did not match the fixed chunk byte size.
    #[error("chunk payload is {actual} bytes, expected exactly {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    /// A chunk coordinate lies outside the declared chunk grid.
    #[error("chunk coordinate {coord:?} is outside the grid {grid:?}")]
    OutOfRange { coord: Vec<u64>, grid: Vec<u64> },
    /// A chunk key could not be split into the right number of integer components.
    #[error("malformed chunk key {key:?}: {reason}")]
    MalformedKey { key: String, reason: String },
    /// A serialized chunk-to-block map did not match the chunk grid.
    #[error("corrupt chunk-to-block map: {0}")]
    CorruptMap(String),
    /// The store was finalized; no further chunk operations are possible.
    #[error("store {0:?} is closed")]
    ClosedStore(String),
    /// The operation is not meaningful on fixed-size pre-allocated blocks.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("{0}")]
    General(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Wrapped(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn general(message: impl Into<String>) -> Self {
        Self::General(message.into())
    }

    pub fn wrap(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Wrapped(Box::new(error))
    }

    pub(crate) fn malformed_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedKey {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
