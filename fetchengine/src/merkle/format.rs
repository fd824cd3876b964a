//! Binary tail-footer layout shared by reference and state files:
//!
//! ```text
//! [ hashes:   HASH_SIZE * total_node_count bytes ]
//! [ bitset:   ceil(leaf_count/8) bytes           ]
//! [ footer:
//!     total_content_size : i64
//!     chunk_size          : i64
//!     total_chunks         : i32
//!     bit_set_length       : i32
//!     magic                : u32
//! ]
//! ```
//!
//! Multi-byte footer fields are little-endian; hashes and the bitset are
//! raw bytes with no further encoding.

use std::io::{Read, Write};

use crate::hash::{Hash, HASH_SIZE};
use crate::merkle::error::MerkleError;
use crate::shape::Shape;

pub const MAGIC_REFERENCE: u32 = 0x4D52_4631; // "MRF1"
pub const MAGIC_STATE: u32 = 0x4D53_5431; // "MST1"

pub const FOOTER_LEN: usize = 8 + 8 + 4 + 4 + 4;

pub struct Footer {
    pub total_content_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub bit_set_length: u32,
    pub magic: u32,
}

impl Footer {
    pub fn encode(&self) -> [u8; FOOTER_LEN] {
        let mut buf = [0u8; FOOTER_LEN];
        buf[0..8].copy_from_slice(&(self.total_content_size as i64).to_le_bytes());
        buf[8..16].copy_from_slice(&(self.chunk_size as i64).to_le_bytes());
        buf[16..20].copy_from_slice(&self.total_chunks.to_le_bytes());
        buf[20..24].copy_from_slice(&self.bit_set_length.to_le_bytes());
        buf[24..28].copy_from_slice(&self.magic.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; FOOTER_LEN]) -> Footer {
        let total_content_size = i64::from_le_bytes(buf[0..8].try_into().unwrap()) as u64;
        let chunk_size = i64::from_le_bytes(buf[8..16].try_into().unwrap()) as u64;
        let total_chunks = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let bit_set_length = u32::from_le_bytes(buf[20..24].try_into().unwrap());
        let magic = u32::from_le_bytes(buf[24..28].try_into().unwrap());
        Footer {
            total_content_size,
            chunk_size,
            total_chunks,
            bit_set_length,
            magic,
        }
    }
}

pub fn bitset_len_bytes(leaf_count: u64) -> usize {
    ((leaf_count + 7) / 8) as usize
}

/// In-memory contents of a parsed reference/state file.
pub struct ParsedTree {
    pub shape: Shape,
    pub hashes: Vec<Hash>,
    pub bits: Vec<u8>,
}

/// Serializes `hashes` + `bits` + a footer derived from `shape`, with the
/// given `magic`, to `writer`.
pub fn write_tree(
    writer: &mut impl Write,
    shape: &Shape,
    hashes: &[Hash],
    bits: &[u8],
    magic: u32,
) -> Result<(), MerkleError> {
    for h in hashes {
        writer.write_all(h)?;
    }
    writer.write_all(bits)?;

    let footer = Footer {
        total_content_size: shape.total_content_size(),
        chunk_size: shape.chunk_size(),
        total_chunks: shape.leaf_count() as u32,
        bit_set_length: shape.leaf_count() as u32,
        magic,
    };
    writer.write_all(&footer.encode())?;
    writer.flush()?;
    Ok(())
}

/// Parses a reference/state file, validating footer arithmetic against a
/// freshly-derived `Shape` and checking that `magic` matches
/// `expected_magic`.
pub fn read_tree(
    reader: &mut impl Read,
    expected_magic: u32,
) -> Result<ParsedTree, MerkleError> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;

    if buf.len() < FOOTER_LEN {
        return Err(MerkleError::InvalidFormat(
            "file too short to contain a footer".into(),
        ));
    }

    let footer_start = buf.len() - FOOTER_LEN;
    let footer_bytes: [u8; FOOTER_LEN] = buf[footer_start..].try_into().unwrap();
    let footer = Footer::decode(&footer_bytes);

    if footer.magic != expected_magic {
        return Err(MerkleError::InvalidFormat(format!(
            "magic mismatch: expected {:#x}, got {:#x}",
            expected_magic, footer.magic
        )));
    }

    let shape = Shape::of(footer.total_content_size)
        .map_err(|e| MerkleError::InvalidFormat(format!("bad total_content_size: {e}")))?;

    if shape.chunk_size() != footer.chunk_size {
        return Err(MerkleError::InvalidFormat(format!(
            "chunk_size mismatch: derived {}, footer says {}",
            shape.chunk_size(),
            footer.chunk_size
        )));
    }
    if shape.leaf_count() as u32 != footer.total_chunks {
        return Err(MerkleError::InvalidFormat(format!(
            "leaf_count mismatch: derived {}, footer says {}",
            shape.leaf_count(),
            footer.total_chunks
        )));
    }
    if footer.bit_set_length != footer.total_chunks {
        return Err(MerkleError::InvalidFormat(
            "bit_set_length does not match total_chunks".into(),
        ));
    }

    let hashes_len = HASH_SIZE * shape.total_node_count() as usize;
    let bits_len = bitset_len_bytes(shape.leaf_count());
    let expected_len = hashes_len + bits_len + FOOTER_LEN;
    if buf.len() != expected_len {
        return Err(MerkleError::InvalidFormat(format!(
            "file length {} does not match expected length {}",
            buf.len(),
            expected_len
        )));
    }

    let mut hashes = Vec::with_capacity(shape.total_node_count() as usize);
    for chunk in buf[0..hashes_len].chunks_exact(HASH_SIZE) {
        let mut h: Hash = [0u8; HASH_SIZE];
        h.copy_from_slice(chunk);
        hashes.push(h);
    }

    let bits = buf[hashes_len..hashes_len + bits_len].to_vec();

    Ok(ParsedTree {
        shape,
        hashes,
        bits,
    })
}
