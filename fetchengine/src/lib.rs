//! Content-addressed chunked download and verification engine.
//!
//! Presents a large remote immutable blob as a virtual, byte-addressable
//! file: reads look like ordinary local reads, but any byte range covering
//! chunks that haven't been verified yet transparently fetches, hashes,
//! persists, and marks them valid first.
//!
//! ```no_run
//! use std::path::Path;
//! use fetchengine::{ChunkedFile, EngineConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::from_env();
//! let file = ChunkedFile::open(
//!     "https://example.com/datasets/base.fvecs",
//!     Path::new("/tmp/fetchengine-cache"),
//!     config,
//! )
//! .await?;
//! let header = file.read(0, 64).await?;
//! # let _ = header;
//! # Ok(())
//! # }
//! ```

pub mod cache_dir;
mod chunked_file;
pub mod config;
pub mod error;
pub mod hash;
pub mod merkle;
pub mod queue;
pub mod scheduler;
pub mod shape;
pub mod transport;

mod data_file;

pub use chunked_file::ChunkedFile;
pub use config::EngineConfig;
pub use error::{FetchError, FetchResult};
pub use merkle::{BitSetSnapshot, MerkleError, MerkleRef, MerkleState};
pub use scheduler::{
    AdaptiveScheduler, AggressiveScheduler, DefaultScheduler, NodeTask, SchedulerError,
    SchedulingStrategy,
};
pub use shape::{Shape, ShapeError};
pub use transport::{HttpTransport, LocalFileTransport, Transport, TransportError};
