//! Byte-range transport against a remote immutable blob, plus a local-file
//! variant used for tests and for datasets already resident on disk.
//! Modeled as a sum type selected at construction time (`Arc<dyn
//! Transport>`), not via runtime reflection.

mod http;
mod local;

pub use http::HttpTransport;
pub use local::LocalFileTransport;

use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, thiserror::Error, Clone)]
pub enum TransportError {
    #[error("retriable transport error: {0}")]
    Retriable(String),

    #[error("fatal transport error: {0}")]
    Fatal(String),
}

/// Byte-range reads against a remote immutable blob. Implementations must
/// be internally thread-safe: the engine issues many overlapping requests
/// against a single shared `Transport` handle.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Total content size; must match the size recorded in the reference
    /// tree.
    async fn probe_size(&self) -> Result<u64, TransportError>;

    /// Reads exactly `length` bytes starting at `offset`. Short reads are
    /// retriable failures, handled internally by the implementation's own
    /// retry loop; callers only see the final `Ok`/`Err`.
    async fn read_range(&self, offset: u64, length: u64) -> Result<Bytes, TransportError>;
}

/// Retry policy shared by transport implementations: capped exponential
/// backoff up to a configured number of attempts.
///
/// `Serialize`/`Deserialize` let this travel inside a serialized
/// `EngineConfig`, the way the teacher derives them on its own
/// small data-carrying structs (see `udr_core::merkle::types`).
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    pub fn backoff_for_attempt(&self, attempt: u32) -> u64 {
        let scaled = self
            .initial_backoff_ms
            .saturating_mul(1u64 << attempt.min(16));
        scaled.min(self.max_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        assert_eq!(policy.backoff_for_attempt(0), 100);
        assert_eq!(policy.backoff_for_attempt(1), 200);
        assert_eq!(policy.backoff_for_attempt(2), 400);
        assert_eq!(policy.backoff_for_attempt(10), 1_000);
    }
}
