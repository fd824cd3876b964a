//! The public virtual-file surface: reads and prebuffers that look like
//! ordinary operations on a local file but, under the hood, plan, fetch,
//! verify, and persist only the chunks a caller actually touches.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use crate::cache_dir::CacheEntry;
use crate::config::EngineConfig;
use crate::data_file::DataFile;
use crate::error::{from_queue_error_ref, FetchError, FetchResult};
use crate::merkle::{BitSetSnapshot, MerkleRef, MerkleState};
use crate::queue::{ChunkQueue, FetchContext};
use crate::scheduler::{AdaptiveScheduler, SchedulingStrategy};
use crate::shape::Shape;
use crate::transport::{HttpTransport, Transport};

/// Couples the local sparse file, the reference/state Merkle trees, the
/// scheduler, the single-flight queue, and the transport into the one
/// surface higher layers (xvec readers, HDF5 adapters, etc.) are allowed to
/// touch. Consumers must never read the local cache file directly.
pub struct ChunkedFile {
    shape: Shape,
    reference: Arc<MerkleRef>,
    state: Arc<MerkleState>,
    data_file: Arc<DataFile>,
    transport: Arc<dyn Transport>,
    queue: ChunkQueue,
    scheduler: Box<dyn SchedulingStrategy>,
}

impl ChunkedFile {
    /// Opens a `ChunkedFile` over an HTTP(S) URL, downloading the reference
    /// tree sidecar (`{url}.mref`) on first access and creating or loading
    /// the cache directory's state tree (`F.mrkl`) thereafter.
    pub async fn open(
        url: &str,
        cache_root: &std::path::Path,
        config: EngineConfig,
    ) -> FetchResult<ChunkedFile> {
        let file_name = url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("data.bin");
        let entry = CacheEntry::for_url(cache_root, url, file_name)?;

        let parsed_url: url::Url = url
            .parse()
            .map_err(|e| FetchError::InvalidFormat(format!("invalid url {url}: {e}")))?;
        let client = reqwest::Client::new();
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::with_retry_policy(
            client.clone(),
            parsed_url,
            config.retry_policy,
        ));

        let reference = if entry.reference.exists() {
            MerkleRef::load(&entry.reference)?
        } else {
            let mref_url = format!("{url}.mref");
            info!(url = %mref_url, "downloading reference tree");
            let bytes = client
                .get(mref_url.as_str())
                .send()
                .await
                .map_err(|e| FetchError::TransportFatal(e.to_string()))?
                .error_for_status()
                .map_err(|e| FetchError::TransportFatal(e.to_string()))?
                .bytes()
                .await
                .map_err(|e| FetchError::TransportFatal(e.to_string()))?;
            std::fs::write(&entry.reference, &bytes)?;
            MerkleRef::load(&entry.reference)?
        };

        let probed_size = transport.probe_size().await?;
        validate_probed_size(probed_size, reference.shape().total_content_size())?;

        ChunkedFile::open_with(transport, reference, entry, config)
    }

    /// Lower-level constructor that skips the network round-trip for the
    /// reference sidecar: callers already have a `MerkleRef` (loaded from
    /// disk, or built in-process) and a `Transport` to fetch content bytes
    /// with. This is also how integration tests drive the engine against an
    /// in-process mock transport.
    pub fn open_with(
        transport: Arc<dyn Transport>,
        reference: MerkleRef,
        entry: CacheEntry,
        config: EngineConfig,
    ) -> FetchResult<ChunkedFile> {
        let shape = *reference.shape();
        let reference = Arc::new(reference);

        let state = if entry.state.exists() {
            Arc::new(MerkleState::load(&entry.state, &entry.lock)?)
        } else {
            Arc::new(MerkleState::create_from_ref(
                &reference,
                &entry.state,
                &entry.lock,
            )?)
        };

        let data_file = Arc::new(DataFile::open_or_create(
            &entry.data,
            shape.total_content_size(),
        )?);

        let scheduler = Box::new(AdaptiveScheduler::new(shape.chunk_size() * 8, 0.5));

        Ok(ChunkedFile {
            shape,
            reference,
            state,
            data_file,
            transport,
            queue: ChunkQueue::new(config.max_concurrent_chunks),
            scheduler,
        })
    }

    pub fn size(&self) -> u64 {
        self.shape.total_content_size()
    }

    pub fn valid_bits(&self) -> BitSetSnapshot {
        self.state.valid_bits()
    }

    /// Reads `[offset, offset + length)`, fetching and verifying any
    /// chunks in that range that aren't already valid before returning.
    pub async fn read(&self, offset: u64, length: u64) -> FetchResult<Bytes> {
        if length == 0 {
            self.check_offset(offset)?;
            return Ok(Bytes::new());
        }
        let end = offset
            .checked_add(length)
            .filter(|&end| end <= self.size())
            .ok_or(FetchError::OutOfRange {
                offset,
                size: self.size(),
            })?;

        self.ensure_range(offset, end).await?;
        Ok(self.data_file.read_at(offset, length))
    }

    /// Speculatively fetches and verifies `[offset, offset + length)`
    /// without returning bytes.
    pub async fn prebuffer(&self, offset: u64, length: u64) -> FetchResult<()> {
        if length == 0 {
            return Ok(());
        }
        let end = offset
            .checked_add(length)
            .filter(|&end| end <= self.size())
            .ok_or(FetchError::OutOfRange {
                offset,
                size: self.size(),
            })?;
        self.ensure_range(offset, end).await
    }

    /// Flushes the state tree and the local data file, releasing
    /// resources. Outstanding in-flight fetches only exist for the
    /// duration of an awaiting caller in this implementation (there is no
    /// detached background task), so there is nothing further to drain.
    pub fn close(self) -> FetchResult<()> {
        self.state.flush()?;
        self.data_file.flush()?;
        Ok(())
    }

    fn check_offset(&self, offset: u64) -> FetchResult<()> {
        if offset > self.size() {
            return Err(FetchError::OutOfRange {
                offset,
                size: self.size(),
            });
        }
        Ok(())
    }

    async fn ensure_range(&self, offset: u64, end: u64) -> FetchResult<()> {
        if offset == end {
            return Ok(());
        }
        let tasks = self
            .scheduler
            .plan(offset, end, &self.shape, &self.state.valid_bits())?;

        let ctx = FetchContext {
            shape: &self.shape,
            transport: &*self.transport,
            reference: &self.reference,
            state: &self.state,
            data_file: &self.data_file,
        };

        for task in tasks {
            self.queue
                .get(task, &ctx)
                .await
                .map_err(|e| from_queue_error_ref(&e))?;
        }

        debug!(offset, end, "range ensured");
        Ok(())
    }
}

/// Rejects a remote blob whose probed size disagrees with the size the
/// reference tree was built over — per §4.5/§6.2, the two must match.
fn validate_probed_size(probed_size: u64, expected_size: u64) -> FetchResult<()> {
    if probed_size != expected_size {
        return Err(FetchError::InvalidFormat(format!(
            "remote content size {probed_size} does not match reference tree's recorded size {expected_size}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_dir::CacheEntry;
    use crate::merkle::build::InMemorySource;
    use crate::transport::LocalFileTransport;
    use tempfile::tempdir;

    fn reference_for(data: &[u8]) -> MerkleRef {
        MerkleRef::build(&mut InMemorySource::new(data)).unwrap()
    }

    async fn open_over(
        data: &[u8],
        cache_root: &std::path::Path,
        source_dir: &tempfile::TempDir,
    ) -> ChunkedFile {
        let source_path = source_dir.path().join("source.bin");
        std::fs::write(&source_path, data).unwrap();

        let transport: Arc<dyn Transport> = Arc::new(LocalFileTransport::open(&source_path).unwrap());
        let reference = reference_for(data);
        let entry = CacheEntry::for_url(cache_root, "https://example.com/data.bin", "data.bin").unwrap();
        ChunkedFile::open_with(transport, reference, entry, EngineConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn full_read_returns_exact_bytes_and_marks_all_valid() {
        let dir = tempdir().unwrap();
        let source_dir = tempdir().unwrap();
        let file = open_over(b"ABCDEFGHIJ", dir.path(), &source_dir).await;
        let bytes = file.read(0, 10).await.unwrap();
        assert_eq!(&bytes[..], b"ABCDEFGHIJ");
        assert!(file.valid_bits().is_complete());
    }

    #[test]
    fn validate_probed_size_accepts_matching_sizes() {
        assert!(validate_probed_size(10, 10).is_ok());
    }

    #[test]
    fn validate_probed_size_rejects_mismatch() {
        let err = validate_probed_size(11, 10).unwrap_err();
        assert!(matches!(err, FetchError::InvalidFormat(_)));
    }

    #[tokio::test]
    async fn partial_read_only_marks_touched_leaves() {
        let data = vec![0u8; (crate::shape::BASE_CHUNK_SIZE * 5) as usize];
        let dir = tempdir().unwrap();
        let source_dir = tempdir().unwrap();
        let file = open_over(&data, dir.path(), &source_dir).await;
        let shape = Shape::of(data.len() as u64).unwrap();

        let (off, len) = shape.for_leaf(1);
        let bytes = file.read(off, len).await.unwrap();
        assert_eq!(bytes.len(), len as usize);
        assert!(file.valid_bits().is_set(1));
        assert!(!file.valid_bits().is_set(0));
    }

    #[tokio::test]
    async fn read_past_end_is_out_of_range() {
        let dir = tempdir().unwrap();
        let source_dir = tempdir().unwrap();
        let file = open_over(b"short", dir.path(), &source_dir).await;
        let err = file.read(0, 100).await.unwrap_err();
        assert!(matches!(err, FetchError::OutOfRange { .. }));
    }

    #[tokio::test]
    async fn read_at_exact_end_returns_empty() {
        let dir = tempdir().unwrap();
        let source_dir = tempdir().unwrap();
        let file = open_over(b"ABCDEFGHIJ", dir.path(), &source_dir).await;
        let bytes = file.read(10, 0).await.unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn prebuffer_then_read_does_not_refetch() {
        let dir = tempdir().unwrap();
        let source_dir = tempdir().unwrap();
        let file = open_over(b"ABCDEFGHIJ", dir.path(), &source_dir).await;
        file.prebuffer(0, 10).await.unwrap();
        assert!(file.valid_bits().is_complete());
        let bytes = file.read(0, 10).await.unwrap();
        assert_eq!(&bytes[..], b"ABCDEFGHIJ");
    }

    #[tokio::test]
    async fn reopening_reuses_persisted_state() {
        let dir = tempdir().unwrap();
        let source_dir = tempdir().unwrap();
        let source_path = source_dir.path().join("source.bin");
        std::fs::write(&source_path, b"ABCDEFGHIJ").unwrap();

        let reference = reference_for(b"ABCDEFGHIJ");
        let entry = CacheEntry::for_url(dir.path(), "https://example.com/data.bin", "data.bin").unwrap();
        let transport: Arc<dyn Transport> = Arc::new(LocalFileTransport::open(&source_path).unwrap());
        let file = ChunkedFile::open_with(transport, reference, entry, EngineConfig::default()).unwrap();
        file.read(0, 4).await.unwrap();
        file.close().unwrap();

        let reference = reference_for(b"ABCDEFGHIJ");
        let entry = CacheEntry::for_url(dir.path(), "https://example.com/data.bin", "data.bin").unwrap();
        let transport: Arc<dyn Transport> = Arc::new(LocalFileTransport::open(&source_path).unwrap());
        let reopened = ChunkedFile::open_with(transport, reference, entry, EngineConfig::default()).unwrap();
        assert!(reopened.valid_bits().is_set(0));
    }
}
