use std::io;

#[derive(Debug, thiserror::Error)]
pub enum MerkleError {
    #[error("invalid merkle format: {0}")]
    InvalidFormat(String),

    #[error("hash mismatch for leaf {leaf}: expected {expected}, got {actual}")]
    HashMismatch {
        leaf: u64,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("node index {0} out of range")]
    OutOfRange(u64),

    #[error("failed to acquire advisory lock: {0}")]
    LockFailed(String),
}
