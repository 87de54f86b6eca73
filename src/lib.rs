pub mod block;
pub mod chunk;
pub mod chunk_key_encoding;
mod error;
pub mod manager;
pub mod map;
pub mod metadata;
pub mod storage;

pub use error::{Error, Result};
