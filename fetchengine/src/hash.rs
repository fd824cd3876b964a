//! Pure hashing primitives for the Merkle tree: leaf hashing and the
//! internal-node combiner. Fixed to SHA-256 so serialized hashes are stable
//! across platforms and over time (see the persistent file format).

use sha2::{Digest, Sha256};

pub const HASH_SIZE: usize = 32;

/// Hash type used throughout the tree: a raw 32-byte digest.
pub type Hash = [u8; HASH_SIZE];

/// The fixed sentinel for padded leaves (leaves beyond `leaf_count` up to
/// `cap_leaf_count`). Using zero bytes rather than `H(empty)` keeps the
/// value trivially distinguishable from any real hash without hashing
/// anything, and is unambiguous on load.
pub const PADDING_SENTINEL: Hash = [0u8; HASH_SIZE];

/// Hashes the bytes of a single chunk.
pub fn hash_chunk(bytes: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Combines two child hashes into their parent's hash. Order matters: this
/// must be called as `combine(left, right)`, never the reverse.
pub fn combine(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

pub fn to_hex(hash: &Hash) -> String {
    hex::encode(hash)
}
