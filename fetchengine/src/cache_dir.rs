//! On-disk cache directory layout: per dataset URL, a subdirectory holding
//! the partial data file `F`, the reference tree `F.mref`, the state tree
//! `F.mrkl`, and the advisory lock file `F.lock`.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

const LOCK_SPIN_INTERVAL: Duration = Duration::from_millis(5);
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Deterministic, reversible mapping from a dataset URL to a cache
/// subdirectory, mirroring the hash-sharded directory scheme used
/// elsewhere in this codebase for content-addressed storage: the first two
/// hex digits of `sha256(url)` form one directory level, the next two
/// another, then the full hex digest names the leaf directory. A sidecar
/// `url.txt` file records the original URL for reverse lookup, since the
/// mapping itself is one-way.
pub fn dataset_dir(cache_root: &Path, url: &str) -> PathBuf {
    let digest = Sha256::digest(url.as_bytes());
    let hex = hex::encode(digest);
    cache_root.join(&hex[0..2]).join(&hex[2..4]).join(&hex)
}

/// Paths of the four files the cache directory protocol defines for one
/// remote file `F`.
pub struct CacheEntry {
    pub data: PathBuf,
    pub reference: PathBuf,
    pub state: PathBuf,
    pub lock: PathBuf,
}

impl CacheEntry {
    /// Resolves the cache entry for `url` under `cache_root`, creating the
    /// dataset subdirectory (and recording the reverse-lookup sidecar) if
    /// it does not already exist.
    pub fn for_url(cache_root: &Path, url: &str, file_name: &str) -> io::Result<CacheEntry> {
        let dir = dataset_dir(cache_root, url);
        fs::create_dir_all(&dir)?;

        let sidecar = dir.join("url.txt");
        if !sidecar.exists() {
            fs::write(&sidecar, url)?;
        }

        Ok(CacheEntry {
            data: dir.join(file_name),
            reference: dir.join(format!("{file_name}.mref")),
            state: dir.join(format!("{file_name}.mrkl")),
            lock: dir.join(format!("{file_name}.lock")),
        })
    }
}

/// Advisory, non-reentrant, cross-process mutual exclusion over a single
/// path, using `O_EXCL`-style atomic creation rather than an OS-level flock
/// (no lock-file crate is depended on anywhere in this codebase). Acquired
/// for state creation, every `verify_and_mark` persistence step, and
/// state-file invalidation; never for ordinary reads.
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Spins with a short bounded backoff until the marker file can be
    /// created exclusively, or the timeout elapses.
    pub fn acquire(path: impl AsRef<Path>) -> io::Result<FileLock> {
        let path = path.as_ref().to_path_buf();
        let start = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_file) => return Ok(FileLock { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if start.elapsed() >= LOCK_TIMEOUT {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("timed out acquiring lock at {}", path.display()),
                        ));
                    }
                    thread::sleep(LOCK_SPIN_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
