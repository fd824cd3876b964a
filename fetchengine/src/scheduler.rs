//! Converts a byte range on the virtual file into the minimal set of
//! node-tasks a [`crate::queue::ChunkQueue`] needs to fetch and verify.
//!
//! Three strategies are provided behind one [`SchedulingStrategy`] trait, as
//! required: [`DefaultScheduler`] (leaf-level only), [`AggressiveScheduler`]
//! (promotes contiguous unset runs to internal-node tasks), and
//! [`AdaptiveScheduler`] (picks between the two based on how much of the
//! range is already valid).

use crate::merkle::BitSetSnapshot;
use crate::shape::Shape;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("range [{start}, {end}) exceeds content size {size}")]
    OutOfRange { start: u64, end: u64, size: u64 },

    #[error("empty range [{start}, {end})")]
    EmptyRange { start: u64, end: u64 },
}

/// One unit of fetch-and-verify work: the flat node index to fetch, the
/// leaves its subtree covers, and the byte range on the virtual file those
/// leaves occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeTask {
    pub node_index: u64,
    pub first_leaf: u64,
    pub leaf_count: u64,
    pub byte_offset: u64,
    pub byte_length: u64,
}

impl NodeTask {
    fn for_leaf(shape: &Shape, leaf: u64) -> NodeTask {
        let (offset, length) = shape.for_leaf(leaf);
        NodeTask {
            node_index: shape.node_index_of_leaf(leaf),
            first_leaf: leaf,
            leaf_count: 1,
            byte_offset: offset,
            byte_length: length,
        }
    }

    fn for_node(shape: &Shape, node_index: u64, first_leaf: u64, leaf_count: u64) -> NodeTask {
        let (start_offset, _) = shape.for_leaf(first_leaf);
        let (last_offset, last_length) = shape.for_leaf(first_leaf + leaf_count - 1);
        NodeTask {
            node_index,
            first_leaf,
            leaf_count,
            byte_offset: start_offset,
            byte_length: last_offset + last_length - start_offset,
        }
    }
}

/// Produces an ordered, non-overlapping, range-covering list of node-tasks
/// for the leaves still unset within `[start, end)`.
pub trait SchedulingStrategy: Send + Sync {
    fn plan(
        &self,
        start: u64,
        end: u64,
        shape: &Shape,
        valid_bits: &BitSetSnapshot,
    ) -> Result<Vec<NodeTask>, SchedulerError>;
}

fn leaf_span(start: u64, end: u64, shape: &Shape) -> Result<(u64, u64), SchedulerError> {
    let size = shape.total_content_size();
    if end > size {
        return Err(SchedulerError::OutOfRange { start, end, size });
    }
    if start >= end {
        return Err(SchedulerError::EmptyRange { start, end });
    }
    let first_leaf = shape.chunk_index_for_offset(start).expect("start < size");
    let last_leaf = shape
        .chunk_index_for_offset(end - 1)
        .expect("end - 1 < size");
    Ok((first_leaf, last_leaf))
}

fn missing_runs(first_leaf: u64, last_leaf: u64, valid_bits: &BitSetSnapshot) -> Vec<(u64, u64)> {
    let mut runs = Vec::new();
    let mut run_start: Option<u64> = None;
    for i in first_leaf..=last_leaf {
        if valid_bits.is_set(i) {
            if let Some(s) = run_start.take() {
                runs.push((s, i));
            }
        } else if run_start.is_none() {
            run_start = Some(i);
        }
    }
    if let Some(s) = run_start {
        runs.push((s, last_leaf + 1));
    }
    runs
}

fn sort_by_node_index(tasks: &mut [NodeTask]) {
    tasks.sort_by_key(|t| t.node_index);
}

/// Leaf-level only: one leaf task per unset leaf intersecting the range.
/// Minimizes over-fetching at the cost of more, smaller requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultScheduler;

impl SchedulingStrategy for DefaultScheduler {
    fn plan(
        &self,
        start: u64,
        end: u64,
        shape: &Shape,
        valid_bits: &BitSetSnapshot,
    ) -> Result<Vec<NodeTask>, SchedulerError> {
        let (first_leaf, last_leaf) = leaf_span(start, end, shape)?;
        let mut tasks: Vec<NodeTask> = (first_leaf..=last_leaf)
            .filter(|&i| !valid_bits.is_set(i))
            .map(|i| NodeTask::for_leaf(shape, i))
            .collect();
        sort_by_node_index(&mut tasks);
        Ok(tasks)
    }
}

/// Promotes contiguous runs of unset sibling leaves to internal-node tasks,
/// capped by `max_bytes_per_request`, to cut down the number of requests at
/// the cost of re-fetching a little more than the strict minimum.
#[derive(Debug, Clone, Copy)]
pub struct AggressiveScheduler {
    pub max_bytes_per_request: u64,
}

impl AggressiveScheduler {
    pub fn new(max_bytes_per_request: u64) -> Self {
        AggressiveScheduler {
            max_bytes_per_request,
        }
    }

    /// Greedily covers `[run_start, run_end)` with the fewest, largest
    /// aligned internal-node tasks that fit under `max_bytes_per_request`,
    /// falling back to individual leaf tasks where no aligned block applies.
    fn plan_run(&self, shape: &Shape, run_start: u64, run_end: u64, out: &mut Vec<NodeTask>) {
        let mut cursor = run_start;
        while cursor < run_end {
            let remaining = run_end - cursor;
            let max_by_budget = (self.max_bytes_per_request / shape.chunk_size()).max(1);

            let mut block = 1u64;
            while block * 2 <= remaining && block * 2 <= max_by_budget {
                if shape.node_for_leaf_range(cursor, block * 2).is_some() {
                    block *= 2;
                } else {
                    break;
                }
            }

            match shape.node_for_leaf_range(cursor, block) {
                Some(node) if block > 1 => {
                    out.push(NodeTask::for_node(shape, node, cursor, block));
                }
                _ => {
                    out.push(NodeTask::for_leaf(shape, cursor));
                    block = 1;
                }
            }
            cursor += block;
        }
    }
}

impl SchedulingStrategy for AggressiveScheduler {
    fn plan(
        &self,
        start: u64,
        end: u64,
        shape: &Shape,
        valid_bits: &BitSetSnapshot,
    ) -> Result<Vec<NodeTask>, SchedulerError> {
        let (first_leaf, last_leaf) = leaf_span(start, end, shape)?;
        let mut tasks = Vec::new();
        for (run_start, run_end) in missing_runs(first_leaf, last_leaf, valid_bits) {
            self.plan_run(shape, run_start, run_end, &mut tasks);
        }
        sort_by_node_index(&mut tasks);
        Ok(tasks)
    }
}

/// Chooses between [`DefaultScheduler`] and [`AggressiveScheduler`] based on
/// the observed fraction of the requested range already valid: a mostly
/// valid range has few, small gaps worth fetching precisely; a mostly empty
/// range benefits from coalescing into fewer, larger requests.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveScheduler {
    default: DefaultScheduler,
    aggressive: AggressiveScheduler,
    /// Fraction (0.0-1.0) of the range that must already be valid before
    /// falling back to the default, leaf-precise strategy.
    pub valid_fraction_threshold: f64,
}

impl AdaptiveScheduler {
    pub fn new(max_bytes_per_request: u64, valid_fraction_threshold: f64) -> Self {
        AdaptiveScheduler {
            default: DefaultScheduler,
            aggressive: AggressiveScheduler::new(max_bytes_per_request),
            valid_fraction_threshold,
        }
    }
}

impl SchedulingStrategy for AdaptiveScheduler {
    fn plan(
        &self,
        start: u64,
        end: u64,
        shape: &Shape,
        valid_bits: &BitSetSnapshot,
    ) -> Result<Vec<NodeTask>, SchedulerError> {
        let (first_leaf, last_leaf) = leaf_span(start, end, shape)?;
        let span = last_leaf - first_leaf + 1;
        let valid_in_range = (first_leaf..=last_leaf)
            .filter(|&i| valid_bits.is_set(i))
            .count() as u64;
        let valid_fraction = valid_in_range as f64 / span as f64;

        if valid_fraction >= self.valid_fraction_threshold {
            self.default.plan(start, end, shape, valid_bits)
        } else {
            self.aggressive.plan(start, end, shape, valid_bits)
        }
    }
}
