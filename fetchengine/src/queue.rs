//! Single-flight coordination: coalesces concurrent requests for the same
//! node index into one fetch, verifies the subtree's hashes on completion,
//! persists bytes and validity bits, then wakes every waiter at once.
//!
//! Modeled as message passing rather than callbacks reaching back into the
//! owning [`crate::ChunkedFile`]: completion is published on a
//! `tokio::sync::broadcast` channel that callers `.await`, so neither the
//! queue nor the scheduler holds a reference back to the file.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, warn};

use crate::data_file::DataFile;
use crate::hash::{combine, hash_chunk, to_hex, Hash};
use crate::merkle::{MerkleError, MerkleRef, MerkleState};
use crate::scheduler::NodeTask;
use crate::shape::Shape;
use crate::transport::{Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("hash mismatch for leaf {leaf}: expected {expected}, got {actual}")]
    HashMismatch {
        leaf: u64,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Merkle(#[from] MerkleError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

/// `tokio::sync::broadcast` requires `Clone` payloads; wrapping the error in
/// an `Arc` lets every waiter get the same verdict without requiring
/// `QueueError` (which carries a non-`Clone` `io::Error`) to implement
/// `Clone` itself.
pub type NodeOutcome = Result<Bytes, Arc<QueueError>>;

/// The shared context a `ChunkQueue` needs to actually perform a fetch:
/// where to get bytes from, what to verify them against, and where to
/// persist them. Held once by `ChunkedFile` and passed by reference into
/// `get`.
pub struct FetchContext<'a> {
    pub shape: &'a Shape,
    pub transport: &'a (dyn Transport + 'a),
    pub reference: &'a MerkleRef,
    pub state: &'a MerkleState,
    pub data_file: &'a DataFile,
}

/// Single-flight registry keyed by node index, with a semaphore capping how
/// many node-tasks are fetched concurrently.
pub struct ChunkQueue {
    inflight: DashMap<u64, broadcast::Sender<NodeOutcome>>,
    concurrency: Arc<Semaphore>,
}

impl ChunkQueue {
    pub fn new(max_concurrent_chunks: usize) -> ChunkQueue {
        ChunkQueue {
            inflight: DashMap::new(),
            concurrency: Arc::new(Semaphore::new(max_concurrent_chunks.max(1))),
        }
    }

    /// Fetches and verifies `task`, or joins an already in-flight fetch for
    /// the same node index. Every concurrent caller for a given node index
    /// sees exactly one underlying fetch.
    pub async fn get(&self, task: NodeTask, ctx: &FetchContext<'_>) -> NodeOutcome {
        loop {
            if let Some(sender) = self.inflight.get(&task.node_index) {
                let mut rx = sender.subscribe();
                drop(sender);
                match rx.recv().await {
                    Ok(outcome) => return outcome,
                    Err(broadcast::error::RecvError::Closed) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }

            let (tx, _rx) = broadcast::channel(1);
            match self.inflight.entry(task.node_index) {
                Entry::Occupied(existing) => {
                    let mut rx = existing.get().subscribe();
                    drop(existing);
                    match rx.recv().await {
                        Ok(outcome) => return outcome,
                        Err(_) => continue,
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(tx.clone());
                }
            }

            let outcome = self.fetch_and_verify(task, ctx).await;
            self.inflight.remove(&task.node_index);
            // No receivers is fine: it means every waiter had already given
            // up (dropped interest) before the fetch resolved.
            let _ = tx.send(outcome.clone());
            return outcome;
        }
    }

    async fn fetch_and_verify(&self, task: NodeTask, ctx: &FetchContext<'_>) -> NodeOutcome {
        let permit = self
            .concurrency
            .acquire()
            .await
            .expect("semaphore is never closed");

        let bytes = match ctx
            .transport
            .read_range(task.byte_offset, task.byte_length)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(node = task.node_index, error = %e, "transport fetch failed");
                drop(permit);
                return Err(Arc::new(QueueError::Transport(e)));
            }
        };
        drop(permit);

        let leaf_hashes: Vec<Hash> = (0..task.leaf_count)
            .map(|i| {
                let leaf = task.first_leaf + i;
                let (offset, length) = ctx.shape.for_leaf(leaf);
                let start = (offset - task.byte_offset) as usize;
                hash_chunk(&bytes[start..start + length as usize])
            })
            .collect();

        if let Err(e) = self.verify_subtree(task, &leaf_hashes, ctx.reference) {
            warn!(node = task.node_index, "subtree hash verification failed");
            return Err(Arc::new(e));
        }

        ctx.data_file.write_at(task.byte_offset, &bytes);

        for i in 0..task.leaf_count {
            let leaf = task.first_leaf + i;
            let (offset, length) = ctx.shape.for_leaf(leaf);
            let start = (offset - task.byte_offset) as usize;
            let slice = &bytes[start..start + length as usize];
            if let Err(e) = ctx.state.verify_and_mark(leaf, slice, ctx.reference) {
                // The pre-check above already confirmed the hash matches, so
                // this can only be a persistence (lock/io) failure.
                return Err(Arc::new(QueueError::Merkle(e)));
            }
        }

        debug!(node = task.node_index, leaves = task.leaf_count, "chunk verified and persisted");
        Ok(bytes)
    }

    /// Verifies `leaf_hashes` (one per leaf in `task`, in order) combine up
    /// to the hash `reference` records for `task.node_index`.
    fn verify_subtree(
        &self,
        task: NodeTask,
        leaf_hashes: &[Hash],
        reference: &MerkleRef,
    ) -> Result<(), QueueError> {
        let mut level = leaf_hashes.to_vec();
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| combine(&pair[0], &pair[1]))
                .collect();
        }
        let actual = level[0];

        let expected = if task.leaf_count == 1 {
            *reference.hash_for_leaf(task.first_leaf)?
        } else {
            *reference.hash_for_node(task.node_index)?
        };

        if actual != expected {
            return Err(QueueError::HashMismatch {
                leaf: task.first_leaf,
                expected: to_hex(&expected),
                actual: to_hex(&actual),
            });
        }
        Ok(())
    }
}
