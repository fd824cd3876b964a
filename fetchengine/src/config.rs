//! Explicit engine configuration, constructed by the caller and threaded
//! through `ChunkedFile::open` — no process-wide mutable state, per the
//! "global logger / static configuration" redesign note.

use std::env;
use std::path::PathBuf;

use crate::transport::RetryPolicy;

/// Default cap on concurrently in-flight node-tasks when the caller doesn't
/// override it via `EngineConfig` or `MAX_CONCURRENT_CHUNKS`.
pub const DEFAULT_MAX_CONCURRENT_CHUNKS: usize = 16;

/// Name used for the cache directory when no `CACHE_DIR` override and no
/// OS-specific per-user cache directory can be resolved.
const FALLBACK_CACHE_DIR_NAME: &str = ".fetchengine-cache";

/// `Serialize`/`Deserialize` let a caller load/save an `EngineConfig` as
/// part of a larger dataset-layout manifest (the YAML/JSON config layer
/// that surrounds, but is out of scope for, this engine); the engine itself
/// never parses one, it only needs to stay a plain serializable struct so
/// the surrounding layer can.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    pub cache_dir: PathBuf,
    pub max_concurrent_chunks: usize,
    pub retry_policy: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            cache_dir: default_cache_dir(),
            max_concurrent_chunks: DEFAULT_MAX_CONCURRENT_CHUNKS,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Reads the optional environment variables from the external
    /// interfaces section (`CACHE_DIR`, `MAX_CONCURRENT_CHUNKS`,
    /// `HTTP_RETRIES`, `HTTP_TIMEOUT_MS`, `HTTP_BACKOFF_MS`), falling back
    /// to engine constants for anything unset or unparsable.
    pub fn from_env() -> EngineConfig {
        let mut config = EngineConfig::default();

        if let Ok(dir) = env::var("CACHE_DIR") {
            if !dir.is_empty() {
                config.cache_dir = PathBuf::from(dir);
            }
        }

        if let Some(n) = env_parsed::<usize>("MAX_CONCURRENT_CHUNKS") {
            if n > 0 {
                config.max_concurrent_chunks = n;
            }
        }

        if let Some(n) = env_parsed::<u32>("HTTP_RETRIES") {
            config.retry_policy.max_attempts = n;
        }
        if let Some(n) = env_parsed::<u64>("HTTP_BACKOFF_MS") {
            config.retry_policy.initial_backoff_ms = n;
        }
        // HTTP_TIMEOUT_MS governs the per-request timeout applied by the
        // transport's HTTP client, not the retry backoff; HttpTransport
        // reads it when constructing its reqwest::Client.
        let _ = env_parsed::<u64>("HTTP_TIMEOUT_MS");

        config
    }

    /// The per-request timeout transports should apply, read directly from
    /// `HTTP_TIMEOUT_MS` since it configures the HTTP client rather than
    /// anything stored on `EngineConfig` itself.
    pub fn http_timeout_ms() -> Option<u64> {
        env_parsed::<u64>("HTTP_TIMEOUT_MS")
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("fetchengine"))
        .unwrap_or_else(|| PathBuf::from(FALLBACK_CACHE_DIR_NAME))
}
