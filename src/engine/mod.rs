//! Sign evaluation engine
//!
//! Every candidate function is evaluated over the whole packet pool by a
//! two-level worker pool: function tasks run on the outer pool and each of them
//! fans out one split task per split onto its own inner pool. The per-split
//! value counts are merged into appearance ratios, and the effectiveness test
//! decides which of the most frequent values become signs.

pub mod pool;
pub mod stats;

use log::{debug, trace};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::packet::{Packet, Split};
use crate::synthesis::PacketFunction;
pub use pool::{ResultSender, WorkerPool};
pub use stats::{effectiveness, sample_variance};

/// A packet predicate: `function(packet) == value`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sign {
    pub function: PacketFunction,
    pub value: u32,
}

impl Sign {
    pub fn new(function: PacketFunction, value: u32) -> Self {
        Self { function, value }
    }

    pub fn matches(&self, packet: &Packet) -> bool {
        self.function.apply(packet) == self.value
    }
}

/// A sign together with the population index of its function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionResult {
    pub sign: Sign,
    pub index: usize,
}

/// Share of packets on which a function produced `value`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppearanceRatio {
    pub value: u32,
    pub ratio: f64,
}

/// Value counts of one function over one split
#[derive(Debug, Clone, Default)]
pub struct SplitCounts {
    pub counts: HashMap<u32, usize>,
    pub size: usize,
}

/// Knobs for one evaluation pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationParams {
    /// A candidate value passes when its effectiveness score exceeds this
    pub threshold: f64,
    /// Number of most frequent values tested per function
    pub max_candidates: usize,
    pub function_workers: usize,
    pub split_workers: usize,
}

impl Default for EvaluationParams {
    fn default() -> Self {
        Self {
            threshold: 1000.0,
            max_candidates: 10,
            function_workers: 56,
            split_workers: 3,
        }
    }
}

impl EvaluationParams {
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }
}

/// Evaluate every function of the population that is not excluded
pub async fn find_effective_signs(
    functions: Arc<Vec<PacketFunction>>,
    splits: Arc<Vec<Split>>,
    params: EvaluationParams,
    excluded: &BTreeSet<usize>,
) -> Vec<FunctionResult> {
    let candidates = (0..functions.len()).collect();
    evaluate_candidates(functions, candidates, splits, params, excluded).await
}

/// Evaluate only the functions at the given population indices.
///
/// Results keep the global population index, so a pass restricted to a few
/// candidates can be compared against a pass over the whole population.
/// Results are ordered by function index and, within a function, by
/// descending appearance ratio.
pub async fn evaluate_candidates(
    functions: Arc<Vec<PacketFunction>>,
    candidates: Vec<usize>,
    splits: Arc<Vec<Split>>,
    params: EvaluationParams,
    excluded: &BTreeSet<usize>,
) -> Vec<FunctionResult> {
    let tasks: Vec<usize> = candidates
        .into_iter()
        .filter(|idx| *idx < functions.len() && !excluded.contains(idx))
        .collect();
    debug!(
        "Evaluating {} functions over {} splits",
        tasks.len(),
        splits.len()
    );

    let outer = WorkerPool::new("function", params.function_workers);
    let queue_capacity = tasks.len();
    let mut results = outer
        .collect(tasks, queue_capacity, move |index, tx: ResultSender<FunctionResult>| {
            let functions = functions.clone();
            let splits = splits.clone();
            async move {
                let function = functions[index].clone();
                for result in evaluate_function(function, index, splits, params).await {
                    if tx.send(result).await.is_err() {
                        break;
                    }
                }
            }
        })
        .await;

    // a function's signs arrive in ratio order from a single worker
    results.sort_by_key(|r| r.index);
    results
}

/// Evaluate one function over all splits on an inner pool
async fn evaluate_function(
    function: PacketFunction,
    index: usize,
    splits: Arc<Vec<Split>>,
    params: EvaluationParams,
) -> Vec<FunctionResult> {
    let inner = WorkerPool::new("split", params.split_workers);
    let n_splits = splits.len();
    let f = function.clone();
    let mut split_rx = inner.run(0..n_splits, n_splits, move |split_idx: usize, tx: ResultSender<SplitCounts>| {
        let f = f.clone();
        let splits = splits.clone();
        async move {
            let _ = tx.send(count_values(&f, &splits[split_idx])).await;
        }
    });

    let mut counts: HashMap<u32, usize> = HashMap::new();
    let mut total = 0;
    while let Some(split_counts) = split_rx.recv().await {
        total += split_counts.size;
        for (value, count) in split_counts.counts {
            *counts.entry(value).or_insert(0) += count;
        }
    }

    let ratios = appearance_ratios(&counts, total);
    select_signs(&ratios, params.threshold, params.max_candidates)
        .into_iter()
        .map(|r| FunctionResult {
            sign: Sign::new(function.clone(), r.value),
            index,
        })
        .collect()
}

/// Count how often the function yields each value within one split
pub fn count_values(function: &PacketFunction, split: &Split) -> SplitCounts {
    let mut counts = HashMap::new();
    for packet in &split.packets {
        *counts.entry(function.apply(packet)).or_insert(0) += 1;
    }
    SplitCounts {
        counts,
        size: split.len(),
    }
}

/// Turn merged counts into ratios, most frequent first.
///
/// Equal ratios are ordered by value so that sign selection does not depend on
/// hash iteration order.
pub fn appearance_ratios(counts: &HashMap<u32, usize>, total: usize) -> Vec<AppearanceRatio> {
    if total == 0 {
        return Vec::new();
    }
    let mut ratios: Vec<AppearanceRatio> = counts
        .iter()
        .map(|(value, count)| AppearanceRatio {
            value: *value,
            ratio: *count as f64 / total as f64,
        })
        .collect();
    ratios.sort_by(|a, b| match b.ratio.total_cmp(&a.ratio) {
        Ordering::Equal => a.value.cmp(&b.value),
        other => other,
    });
    ratios
}

/// Pick the signs of one function from its sorted ratios.
///
/// The top `max_candidates` ratios are tested. With `max_idx` the last passing
/// position, every ratio ranked strictly above it is accepted; the passing
/// ratio itself only marks the cut.
pub fn select_signs(
    ratios: &[AppearanceRatio],
    threshold: f64,
    max_candidates: usize,
) -> Vec<AppearanceRatio> {
    let distribution: Vec<f64> = ratios.iter().map(|r| r.ratio).collect();
    let mut max_idx = None;
    for (i, candidate) in ratios.iter().take(max_candidates).enumerate() {
        match effectiveness(candidate.ratio, &distribution) {
            Ok(score) if score > threshold => max_idx = Some(i),
            Ok(_) => {}
            Err(e) => trace!("Value {} skipped: {}", candidate.value, e),
        }
    }
    match max_idx {
        Some(cut) => ratios[..cut].to_vec(),
        None => Vec::new(),
    }
}
