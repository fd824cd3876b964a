//! Top-level error type returned by the public [`crate::ChunkedFile`] API.
//!
//! Each component owns its own `thiserror` enum (see `shape::ShapeError`,
//! `merkle::MerkleError`, `transport::TransportError`,
//! `scheduler::SchedulerError`, `queue::QueueError`); this type just wraps
//! them for callers who only care about the outer taxonomy from the error
//! handling design (`InvalidFormat`, `HashMismatch`, `TransportRetriable`,
//! `TransportFatal`, `IoError`, `Cancelled`).

use std::io;

use crate::merkle::MerkleError;
use crate::queue::QueueError;
use crate::scheduler::SchedulerError;
use crate::shape::ShapeError;
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid on-disk format: {0}")]
    InvalidFormat(String),

    #[error("hash mismatch for leaf {leaf}: expected {expected}, got {actual}")]
    HashMismatch {
        leaf: u64,
        expected: String,
        actual: String,
    },

    #[error("transport error (retriable): {0}")]
    TransportRetriable(String),

    #[error("transport error (fatal): {0}")]
    TransportFatal(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("out of range: offset {offset} exceeds content size {size}")]
    OutOfRange { offset: u64, size: u64 },

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl From<MerkleError> for FetchError {
    fn from(e: MerkleError) -> Self {
        match e {
            MerkleError::InvalidFormat(msg) => FetchError::InvalidFormat(msg),
            MerkleError::HashMismatch {
                leaf,
                expected,
                actual,
            } => FetchError::HashMismatch {
                leaf,
                expected,
                actual,
            },
            MerkleError::Io(e) => FetchError::Io(e),
            MerkleError::OutOfRange(idx) => FetchError::InvalidFormat(format!(
                "merkle node index {idx} out of range"
            )),
            MerkleError::LockFailed(msg) => FetchError::Io(io::Error::other(msg)),
        }
    }
}

impl From<QueueError> for FetchError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::HashMismatch {
                leaf,
                expected,
                actual,
            } => FetchError::HashMismatch {
                leaf,
                expected,
                actual,
            },
            QueueError::Transport(te) => te.into(),
            QueueError::Merkle(me) => me.into(),
            QueueError::Io(e) => FetchError::Io(e),
            QueueError::Cancelled => FetchError::Cancelled,
        }
    }
}

impl From<TransportError> for FetchError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Retriable(msg) => FetchError::TransportRetriable(msg),
            TransportError::Fatal(msg) => FetchError::TransportFatal(msg),
        }
    }
}

/// `QueueError` travels between tasks wrapped in an `Arc` (broadcast
/// payloads must be `Clone`, and `QueueError` itself can't be since it
/// carries a non-`Clone` `io::Error`). `ChunkedFile` only ever has a
/// reference to the shared error, so it converts from that reference rather
/// than consuming an owned `QueueError`.
pub(crate) fn from_queue_error_ref(e: &QueueError) -> FetchError {
    match e {
        QueueError::HashMismatch {
            leaf,
            expected,
            actual,
        } => FetchError::HashMismatch {
            leaf: *leaf,
            expected: expected.clone(),
            actual: actual.clone(),
        },
        QueueError::Transport(te) => te.clone().into(),
        QueueError::Merkle(me) => from_merkle_error_ref(me),
        QueueError::Io(e) => FetchError::Io(io::Error::new(e.kind(), e.to_string())),
        QueueError::Cancelled => FetchError::Cancelled,
    }
}

fn from_merkle_error_ref(e: &MerkleError) -> FetchError {
    match e {
        MerkleError::InvalidFormat(msg) => FetchError::InvalidFormat(msg.clone()),
        MerkleError::HashMismatch {
            leaf,
            expected,
            actual,
        } => FetchError::HashMismatch {
            leaf: *leaf,
            expected: expected.clone(),
            actual: actual.clone(),
        },
        MerkleError::Io(e) => FetchError::Io(io::Error::new(e.kind(), e.to_string())),
        MerkleError::OutOfRange(idx) => {
            FetchError::InvalidFormat(format!("merkle node index {idx} out of range"))
        }
        MerkleError::LockFailed(msg) => FetchError::Io(io::Error::other(msg.clone())),
    }
}

pub type FetchResult<T> = Result<T, FetchError>;
