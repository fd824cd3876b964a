use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use crate::hash::{to_hex, Hash};
use crate::merkle::build::{build_hashes, ChunkSource};
use crate::merkle::error::MerkleError;
use crate::merkle::format::{self, bitset_len_bytes, MAGIC_REFERENCE};
use crate::shape::Shape;

/// Immutable full Merkle tree built once from an authoritative data source,
/// then shipped as a sidecar (`F.mref`) and read-only thereafter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleRef {
    shape: Shape,
    hashes: Vec<Hash>,
}

impl MerkleRef {
    pub fn build(source: &mut impl ChunkSource) -> Result<MerkleRef, MerkleError> {
        let shape = Shape::of(source.total_content_size())
            .map_err(|e| MerkleError::InvalidFormat(e.to_string()))?;
        let hashes = build_hashes(&shape, source)?;
        Ok(MerkleRef { shape, hashes })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn root(&self) -> &Hash {
        &self.hashes[0]
    }

    pub fn hash_for_leaf(&self, i: u64) -> Result<&Hash, MerkleError> {
        if i >= self.shape.cap_leaf_count() {
            return Err(MerkleError::OutOfRange(i));
        }
        Ok(&self.hashes[self.shape.node_index_of_leaf(i) as usize])
    }

    pub fn hash_for_internal(&self, i: u64) -> Result<&Hash, MerkleError> {
        if i >= self.shape.internal_node_count() {
            return Err(MerkleError::OutOfRange(i));
        }
        Ok(&self.hashes[i as usize])
    }

    pub fn hash_for_node(&self, n: u64) -> Result<&Hash, MerkleError> {
        if n >= self.shape.total_node_count() {
            return Err(MerkleError::OutOfRange(n));
        }
        Ok(&self.hashes[n as usize])
    }

    /// Writes the §3.5 layout to `path` with the reference magic and an
    /// all-zero bitset, atomically (write to a temp file, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), MerkleError> {
        let path = path.as_ref();
        let tmp_path = path.with_file_name(format!(
            "{}.tmp.{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("mref"),
            uuid::Uuid::new_v4()
        ));

        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            let bits = vec![0u8; bitset_len_bytes(self.shape.leaf_count())];
            format::write_tree(&mut writer, &self.shape, &self.hashes, &bits, MAGIC_REFERENCE)?;
        }

        match fs::rename(&tmp_path, path) {
            Ok(()) => Ok(()),
            Err(e) => {
                if path.exists() {
                    // Another writer produced the same reference file first;
                    // identical content makes this harmless.
                    let _ = fs::remove_file(&tmp_path);
                    Ok(())
                } else {
                    Err(MerkleError::Io(e))
                }
            }
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<MerkleRef, MerkleError> {
        let mut file = File::open(path)?;
        let parsed = format::read_tree(&mut file, MAGIC_REFERENCE)?;
        Ok(MerkleRef {
            shape: parsed.shape,
            hashes: parsed.hashes,
        })
    }

    pub fn root_hex(&self) -> String {
        to_hex(self.root())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::build::InMemorySource;
    use tempfile::tempdir;

    #[test]
    fn build_then_save_then_load_roundtrips() {
        let data = b"ABCDEFGHIJ";
        let r = MerkleRef::build(&mut InMemorySource::new(data)).unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("data.mref");
        r.save(&path).unwrap();

        let loaded = MerkleRef::load(&path).unwrap();
        assert_eq!(loaded, r);
    }

    #[test]
    fn load_rejects_truncated_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.mref");
        std::fs::write(&path, [0u8; 3]).unwrap();
        assert!(matches!(
            MerkleRef::load(&path),
            Err(MerkleError::InvalidFormat(_))
        ));
    }

    #[test]
    fn leaf_hash_matches_direct_hash_of_content() {
        let data = b"some content to hash and check again";
        let r = MerkleRef::build(&mut InMemorySource::new(data)).unwrap();
        let (off, len) = r.shape().for_leaf(0);
        let slice = &data[off as usize..(off + len) as usize];
        assert_eq!(
            r.hash_for_leaf(0).unwrap(),
            &crate::hash::hash_chunk(slice)
        );
    }

    #[test]
    fn out_of_range_leaf_is_rejected() {
        let data = b"short";
        let r = MerkleRef::build(&mut InMemorySource::new(data)).unwrap();
        let bad_index = r.shape().cap_leaf_count() + 1;
        assert!(matches!(
            r.hash_for_leaf(bad_index),
            Err(MerkleError::OutOfRange(_))
        ));
    }
}
