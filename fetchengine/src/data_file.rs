//! The local, sparse, memory-mapped backing store for a [`crate::ChunkedFile`].
//!
//! Regions corresponding to unset validity bits may hold arbitrary bytes;
//! callers must only read bytes whose leaves are reported valid by
//! `MerkleState`. Writes are region-disjoint by construction (each chunk
//! owns a fixed, non-overlapping byte range), so the mutex here exists for
//! memory safety around the shared `MmapMut`, not to serialize unrelated
//! chunks against each other.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

pub struct DataFile {
    path: PathBuf,
    mmap: Mutex<MmapMut>,
}

impl DataFile {
    /// Opens the backing file at `path`, creating it and sizing it to
    /// `total_content_size` if it doesn't already exist or is the wrong
    /// size. The file is sparse: growing it with `set_len` does not write
    /// real disk blocks for the untouched regions.
    pub fn open_or_create(path: impl AsRef<Path>, total_content_size: u64) -> io::Result<DataFile> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        if file.metadata()?.len() != total_content_size {
            file.set_len(total_content_size)?;
        }

        let mmap = unsafe {
            MmapOptions::new()
                .len(total_content_size as usize)
                .map_mut(&file)?
        };

        Ok(DataFile {
            path,
            mmap: Mutex::new(mmap),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `bytes` at `offset`. Callers must only call this for a chunk
    /// after it has already passed hash verification.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) {
        let mut mmap = self.mmap.lock();
        let start = offset as usize;
        mmap[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Reads `length` bytes at `offset`. Callers must only call this for
    /// leaves already reported valid by `MerkleState`.
    pub fn read_at(&self, offset: u64, length: u64) -> Bytes {
        let mmap = self.mmap.lock();
        let start = offset as usize;
        Bytes::copy_from_slice(&mmap[start..start + length as usize])
    }

    /// fsync-equivalent durability boundary for the data file itself.
    pub fn flush(&self) -> io::Result<()> {
        self.mmap.lock().flush()
    }
}
