/// Magic bytes preceding every block header in the container file.
pub(crate) const BLOCK_MAGIC: [u8; 4] = [0xd3, b'B', b'L', b'K'];

/// Flag bit marking a block released by garbage collection.
pub(crate) const FLAG_TOMBSTONE: u16 = 1;

/// On-disk header preceding every block payload.
///
/// Big-endian: magic, flags, allocated payload size, used payload size.
/// Payload space is reserved at allocation time, so `allocated == used` for
/// every block this crate writes; the split exists for containers that
/// over-allocate.
#[derive(Debug, Clone, Copy)]
pub struct BlockHeader {
    pub(crate) flags: u16,
    pub(crate) allocated: u64,
    pub(crate) used: u64,
}

impl BlockHeader {
    pub(crate) const LEN: usize = size_of::<u32>() + size_of::<u16>() + 2 * size_of::<u64>();

    pub(crate) fn new(payload_size: u64) -> Self {
        Self {
            flags: 0,
            allocated: payload_size,
            used: payload_size,
        }
    }

    pub(crate) fn is_tombstone(&self) -> bool {
        self.flags & FLAG_TOMBSTONE != 0
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        if bytes.len() < Self::LEN {
            return Err(crate::Error::general(format!(
                "block header truncated: {} bytes",
                bytes.len()
            )));
        }
        if bytes[..4] != BLOCK_MAGIC {
            return Err(crate::Error::general(format!(
                "bad block magic: {:02x?}",
                &bytes[..4]
            )));
        }
        let mut offset = 4;
        let flags = u16::from_be_bytes(
            bytes[offset..offset + 2]
                .try_into()
                .map_err(crate::Error::wrap)?,
        );
        offset += 2;
        let allocated = u64::from_be_bytes(
            bytes[offset..offset + 8]
                .try_into()
                .map_err(crate::Error::wrap)?,
        );
        offset += 8;
        let used = u64::from_be_bytes(
            bytes[offset..offset + 8]
                .try_into()
                .map_err(crate::Error::wrap)?,
        );
        Ok(Self {
            flags,
            allocated,
            used,
        })
    }

    pub(crate) fn to_bytes(self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[..4].copy_from_slice(&BLOCK_MAGIC);
        out[4..6].copy_from_slice(&self.flags.to_be_bytes());
        out[6..14].copy_from_slice(&self.allocated.to_be_bytes());
        out[14..22].copy_from_slice(&self.used.to_be_bytes());
        out
    }
}

/// Manager-assigned position of a block in the container's block list.
pub type BlockIndex = u64;

/// A bound block: index resolved to a payload region.
///
/// Handles are resolved per operation and never cached across operations;
/// the manager may relocate blocks when the file is rewritten.
#[derive(Debug, Clone, Copy)]
pub struct BlockHandle {
    /// File offset of the payload, past the header.
    pub(crate) payload_offset: u64,
    /// Payload size in bytes; writes must match it exactly.
    pub size: u64,
}
