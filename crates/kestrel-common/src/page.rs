//! Block identifiers and page-image framing.
//!
//! Every persisted structure is written to the store as one page image:
//!
//! ```text
//! +-----------+--------------+------------------------------+
//! | codec: u8 | crc32: u32le | payload (maybe compressed)   |
//! +-----------+--------------+------------------------------+
//! ```
//!
//! The checksum covers the stored payload bytes. The whole image must fit
//! within [`PAGE_BUDGET`].

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::config::CompressionType;
use crate::error::{KestrelError, Result};

/// Hard upper bound on the size of one encoded page image (32 KB).
pub const PAGE_BUDGET: usize = 32 * 1024;

/// Bytes of framing in front of every page payload.
pub const IMAGE_HEADER_SIZE: usize = 5;

/// Identifier of a block in the store. Assigned by the store on first write.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockId(pub u64);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a cluster node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Process-local transaction identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TxnId(pub u64);

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frames a payload as a page image, compressing it when configured.
///
/// Compressed output that is not smaller than the input is stored raw.
pub fn seal(payload: &[u8], compression: CompressionType, level: i32) -> Result<Bytes> {
    let compressed = match compression {
        CompressionType::None => None,
        CompressionType::Zstd => {
            let out = zstd::stream::encode_all(payload, level)?;
            (out.len() < payload.len()).then_some(out)
        }
    };

    let (codec, body): (CompressionType, &[u8]) = match &compressed {
        Some(out) => (CompressionType::Zstd, out.as_slice()),
        None => (CompressionType::None, payload),
    };

    let mut buf = BytesMut::with_capacity(IMAGE_HEADER_SIZE + body.len());
    buf.put_u8(codec as u8);
    buf.put_u32_le(crc32fast::hash(body));
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Verifies and unframes a page image, returning the decompressed payload.
pub fn open(block_id: BlockId, image: &[u8]) -> Result<Bytes> {
    if image.len() < IMAGE_HEADER_SIZE {
        return Err(KestrelError::BlockCorrupted {
            block_id,
            reason: format!("image of {} bytes is shorter than its header", image.len()),
        });
    }

    let codec = CompressionType::try_from(image[0]).map_err(|_| KestrelError::BlockCorrupted {
        block_id,
        reason: format!("unknown codec {}", image[0]),
    })?;
    let stored = u32::from_le_bytes([image[1], image[2], image[3], image[4]]);
    let body = &image[IMAGE_HEADER_SIZE..];

    let computed = crc32fast::hash(body);
    if computed != stored {
        return Err(KestrelError::BlockCorrupted {
            block_id,
            reason: format!("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"),
        });
    }

    match codec {
        CompressionType::None => Ok(Bytes::copy_from_slice(body)),
        CompressionType::Zstd => zstd::stream::decode_all(body)
            .map(Bytes::from)
            .map_err(|e| KestrelError::BlockCorrupted {
                block_id,
                reason: format!("zstd: {e}"),
            }),
    }
}
