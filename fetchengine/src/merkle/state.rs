use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::cache_dir::FileLock;
use crate::hash::{hash_chunk, to_hex, Hash};
use crate::merkle::error::MerkleError;
use crate::merkle::format::{self, bitset_len_bytes, MAGIC_STATE};
use crate::merkle::reference::MerkleRef;
use crate::shape::Shape;

/// Snapshot of which leaves are currently verified and persisted. Cheap to
/// clone; callers get a point-in-time copy, never a live view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitSetSnapshot {
    bits: Vec<u8>,
    leaf_count: u64,
}

impl BitSetSnapshot {
    pub fn is_set(&self, i: u64) -> bool {
        if i >= self.leaf_count {
            return false;
        }
        let byte = self.bits[(i / 8) as usize];
        (byte & (1 << (i % 8))) != 0
    }

    pub fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    pub fn count_set(&self) -> u64 {
        (0..self.leaf_count).filter(|&i| self.is_set(i)).count() as u64
    }

    pub fn is_complete(&self) -> bool {
        self.count_set() == self.leaf_count
    }
}

struct Inner {
    hashes: Vec<Hash>,
    bits: Vec<u8>,
}

/// Mutable, persisted, locked Merkle tree: the reference's hash array plus
/// a per-leaf validity bitmap. Created by seeding from a [`MerkleRef`] and
/// mutated throughout a session; mutation is monotonic (see
/// [`MerkleState::verify_and_mark`]).
pub struct MerkleState {
    path: PathBuf,
    lock_path: PathBuf,
    shape: Shape,
    inner: RwLock<Inner>,
}

impl MerkleState {
    pub fn create_from_ref(
        r: &MerkleRef,
        path: impl AsRef<Path>,
        lock_path: impl AsRef<Path>,
    ) -> Result<MerkleState, MerkleError> {
        let path = path.as_ref().to_path_buf();
        let lock_path = lock_path.as_ref().to_path_buf();
        let bits = vec![0u8; bitset_len_bytes(r.shape().leaf_count())];
        let hashes: Vec<Hash> = (0..r.shape().total_node_count())
            .map(|n| *r.hash_for_node(n).expect("n < total_node_count"))
            .collect();

        let state = MerkleState {
            path,
            lock_path,
            shape: *r.shape(),
            inner: RwLock::new(Inner {
                hashes,
                bits,
            }),
        };
        state.persist()?;
        Ok(state)
    }

    pub fn load(
        path: impl AsRef<Path>,
        lock_path: impl AsRef<Path>,
    ) -> Result<MerkleState, MerkleError> {
        let path_buf = path.as_ref().to_path_buf();
        let mut file = File::open(&path_buf)?;
        let parsed = format::read_tree(&mut file, MAGIC_STATE)?;
        Ok(MerkleState {
            path: path_buf,
            lock_path: lock_path.as_ref().to_path_buf(),
            shape: parsed.shape,
            inner: RwLock::new(Inner {
                hashes: parsed.hashes,
                bits: parsed.bits,
            }),
        })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn valid_bits(&self) -> BitSetSnapshot {
        let inner = self.inner.read();
        BitSetSnapshot {
            bits: inner.bits.clone(),
            leaf_count: self.shape.leaf_count(),
        }
    }

    pub fn is_valid(&self, leaf_index: u64) -> bool {
        self.valid_bits().is_set(leaf_index)
    }

    /// Verifies `bytes` against `r`'s hash for `leaf_index`; on success,
    /// sets the validity bit and persists under the advisory file lock.
    /// On mismatch, leaves the bit and persisted file untouched and
    /// returns `MerkleError::HashMismatch`.
    ///
    /// Hashing happens outside any lock; only the bit-set-and-persist step
    /// is made atomic with respect to other writers.
    pub fn verify_and_mark(
        &self,
        leaf_index: u64,
        bytes: &[u8],
        r: &MerkleRef,
    ) -> Result<(), MerkleError> {
        let actual = hash_chunk(bytes);
        let expected = *r.hash_for_leaf(leaf_index)?;

        if actual != expected {
            return Err(MerkleError::HashMismatch {
                leaf: leaf_index,
                expected: to_hex(&expected),
                actual: to_hex(&actual),
            });
        }

        // Already valid: calling verify_and_mark twice with correct bytes
        // is a no-op on the second call.
        if self.is_valid(leaf_index) {
            return Ok(());
        }

        let _lock = FileLock::acquire(&self.lock_path)
            .map_err(|e| MerkleError::LockFailed(e.to_string()))?;
        {
            let mut inner = self.inner.write();
            let byte_index = (leaf_index / 8) as usize;
            inner.bits[byte_index] |= 1 << (leaf_index % 8);
        }
        self.persist()?;
        Ok(())
    }

    /// fsync-equivalent durability boundary: re-writes the full state file
    /// from the in-memory hashes/bits.
    pub fn flush(&self) -> Result<(), MerkleError> {
        self.persist()
    }

    pub fn close(self) {
        // Resources (file handles, locks) are released by `Drop`; kept as
        // an explicit method so callers have a symmetric flush()/close()
        // pair matching the consumer API in the external interfaces.
    }

    fn persist(&self) -> Result<(), MerkleError> {
        let inner = self.inner.read();
        let tmp_path = self.path.with_file_name(format!(
            "{}.tmp.{}",
            self.path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("mrkl"),
            uuid::Uuid::new_v4()
        ));

        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            format::write_tree(&mut writer, &self.shape, &inner.hashes, &inner.bits, MAGIC_STATE)?;
        }

        match fs::rename(&tmp_path, &self.path) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(MerkleError::Io(e))
            }
        }
    }
}
