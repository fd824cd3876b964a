use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::transport::{Transport, TransportError};

/// Transport over a local file, behaving identically to `HttpTransport`
/// from the engine's point of view: probe size, then random-range reads.
/// Used for datasets already resident on disk and as the basis of the
/// in-process mock transport used by integration tests.
pub struct LocalFileTransport {
    path: PathBuf,
    size: u64,
    file: Mutex<std::fs::File>,
}

impl LocalFileTransport {
    pub fn open(path: impl AsRef<Path>) -> Result<LocalFileTransport, TransportError> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::File::open(&path)
            .map_err(|e| TransportError::Fatal(e.to_string()))?;
        let size = file
            .metadata()
            .map_err(|e| TransportError::Fatal(e.to_string()))?
            .len();
        Ok(LocalFileTransport {
            path,
            size,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Transport for LocalFileTransport {
    async fn probe_size(&self) -> Result<u64, TransportError> {
        Ok(self.size)
    }

    async fn read_range(&self, offset: u64, length: u64) -> Result<Bytes, TransportError> {
        if offset + length > self.size {
            return Err(TransportError::Fatal(format!(
                "range [{offset}, {}) exceeds file size {}",
                offset + length,
                self.size
            )));
        }

        let mut buf = vec![0u8; length as usize];
        let mut file = self.file.lock().expect("local file mutex poisoned");
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| TransportError::Retriable(e.to_string()))?;
        file.read_exact(&mut buf)
            .map_err(|e| TransportError::Retriable(e.to_string()))?;
        Ok(Bytes::from(buf))
    }
}
