//! Iterative sampling controller
//!
//! Each iteration samples the remaining packets, evaluates the function
//! population on the sample, confirms the surviving functions on the full
//! remaining pool with a stricter threshold and consolidates the confirmed
//! signs. Packets claimed by an accepted intersection are removed before the
//! next iteration, so every packet belongs to at most one fingerprint.

pub mod sampling;
pub mod tuning;

use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::config::IdentConfig;
use crate::consolidate::{consolidate_signs, merge_intersections, Consolidation, Intersection};
use crate::engine::{evaluate_candidates, find_effective_signs, FunctionResult};
use crate::error::{IdentError, IdentResult};
use crate::packet::{filter_splits, split_len, split_similarity, PacketIndex, Split};
use crate::synthesis::{initial_set, PacketFunction};
pub use sampling::{iteration_rng, rotate_seeds, sample_splits};
pub use tuning::{IterationOutcome, ThresholdTuner};

/// Why a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    BudgetExhausted,
    ThresholdFloor,
    CorpusDepleted,
    NoProgress,
    SamplingExhausted,
    Aborted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            StopReason::BudgetExhausted => "iteration budget exhausted",
            StopReason::ThresholdFloor => "threshold dropped to the floor",
            StopReason::CorpusDepleted => "not enough packets left",
            StopReason::NoProgress => "no progress",
            StopReason::SamplingExhausted => "sampling exhausted",
            StopReason::Aborted => "aborted",
        };
        f.write_str(reason)
    }
}

/// Signs confirmed on the full pool and their consolidation
#[derive(Debug, Clone)]
pub struct SampleFindings {
    pub consolidation: Consolidation,
    pub function_results: Vec<FunctionResult>,
}

/// Everything a run accumulated
#[derive(Debug, Clone)]
pub struct IdentificationOutcome {
    /// Accepted intersections, packet indices in corpus coordinates
    pub intersections: Vec<Intersection>,
    /// Signs referenced by `Intersection::idxs`
    pub function_results: Vec<FunctionResult>,
    pub functions: Arc<Vec<PacketFunction>>,
    /// The corpus as loaded
    pub corpus: Arc<Vec<Split>>,
    /// Packets no fingerprint claimed
    pub remaining: Vec<Split>,
    pub bad_functions: BTreeSet<usize>,
    pub seeds: (u64, u64),
    pub iterations: usize,
    pub threshold: f64,
    pub fingerprinted_packets: usize,
    pub stop_reason: StopReason,
}

/// Drives identification runs with a fixed configuration
#[derive(Debug, Clone)]
pub struct FingerprintIdentifier {
    config: IdentConfig,
}

impl FingerprintIdentifier {
    pub fn new(config: IdentConfig) -> IdentResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &IdentConfig {
        &self.config
    }

    /// Synthesize the function population for a run
    pub fn generate_functions(&self, seed1: u64, seed2: u64) -> Vec<PacketFunction> {
        let mut rng = StdRng::seed_from_u64(seed1 ^ seed2);
        self.config
            .synthesizer()
            .generate(self.config.n_functions, initial_set(), &mut rng)
    }

    /// Run identification over `splits` until an end condition fires.
    ///
    /// Never fails: whatever was accumulated when the run stops is returned.
    pub async fn run(&self, splits: Vec<Split>) -> IdentificationOutcome {
        let config = &self.config;
        let (seed1, seed2) = config.resolve_seeds();
        info!("SEEDS: {}, {}", seed1, seed2);

        info!("Generating {} functions", config.n_functions);
        let functions = Arc::new(self.generate_functions(seed1, seed2));

        let corpus = Arc::new(splits);
        let mut current = corpus.clone();

        let mut tuner = ThresholdTuner::new(config.threshold, config.threshold_step, config.threshold_floor)
            .with_max_no_progress(config.max_no_progress)
            .with_max_extension(config.max_budget_extension);
        let mut intersections: Vec<Intersection> = Vec::new();
        let mut function_results: Vec<FunctionResult> = Vec::new();
        let mut bad_functions: BTreeSet<usize> = BTreeSet::new();
        let mut prev_sample: Option<Arc<Vec<Split>>> = None;
        let max_tries = config.n_samples.saturating_mul(10);
        let mut iterations_left = config.iterations;
        let mut iterations = 0;
        let mut fingerprinted_packets = 0;

        info!("Starting {} iterations", config.iterations);
        let stop_reason = loop {
            if iterations_left == 0 {
                break StopReason::BudgetExhausted;
            }
            if tuner.below_floor() {
                warn!("Sign threshold too low: {}", tuner.threshold());
                break StopReason::ThresholdFloor;
            }
            let remaining = split_len(&current);
            if remaining < config.n_samples {
                info!("Not enough packets left ({}), returning results", remaining);
                break StopReason::CorpusDepleted;
            }

            info!("Iterations left: {}", iterations_left);
            let rotation = iterations_left;
            iterations_left -= 1;
            iterations += 1;

            debug!("Sampling {} packets", config.n_samples);
            let mut rng = iteration_rng(seed1, seed2, rotation);
            let sample = match sample_splits(&current, config.n_samples, remaining, max_tries, &mut rng) {
                Ok(sample) => Arc::new(sample),
                Err(e) => {
                    error!("{}", e);
                    break StopReason::SamplingExhausted;
                }
            };
            info!("Got {} samples", split_len(&sample));
            if let Some(prev) = &prev_sample {
                info!(
                    "Split similarity: {:.6}",
                    split_similarity(prev, &sample, config.n_samples)
                );
            }
            prev_sample = Some(sample.clone());

            if tuner.should_give_up() {
                info!("Found nothing {} times, returning", tuner.no_progress());
                break StopReason::NoProgress;
            }
            let refund = tuner.apply_pending();
            if refund > 0 {
                debug!("Refunding {} tuning iterations", refund);
                iterations_left += refund;
            }

            let findings = self
                .compute_for_sample(
                    functions.clone(),
                    sample,
                    current.clone(),
                    tuner.threshold(),
                    &bad_functions,
                    function_results.len(),
                )
                .await;

            let findings = match findings {
                Ok(findings) => findings,
                Err(e) => {
                    warn!("{}", e);
                    if let Some(partial) = e.partial_bad_functions() {
                        bad_functions.extend(partial.iter().copied());
                    }
                    if !e.is_recoverable() {
                        break StopReason::Aborted;
                    }
                    tuner.record(IterationOutcome::Error);
                    continue;
                }
            };

            if findings.consolidation.intersections.is_empty() {
                info!("No intersections found");
                tuner.record(IterationOutcome::Empty);
                continue;
            }
            tuner.record(IterationOutcome::Success);

            let SampleFindings {
                consolidation,
                function_results: confirmed,
            } = findings;
            let visited: HashSet<PacketIndex> = consolidation
                .intersections
                .iter()
                .flat_map(|i| i.packets.iter().copied())
                .collect();

            info!("Accepted {} intersections", consolidation.intersections.len());
            merge_intersections(&mut intersections, consolidation.intersections);
            function_results.extend(confirmed);
            bad_functions.extend(consolidation.bad_functions);

            current = Arc::new(filter_splits(&visited, &current));
            fingerprinted_packets += visited.len();
            info!("Currently fingerprinted {} packets", fingerprinted_packets);
        };

        info!(
            "Run finished after {} iterations: {}",
            iterations, stop_reason
        );
        IdentificationOutcome {
            intersections,
            function_results,
            functions,
            corpus,
            remaining: Arc::try_unwrap(current).unwrap_or_else(|shared| (*shared).clone()),
            bad_functions,
            seeds: (seed1, seed2),
            iterations,
            threshold: tuner.threshold(),
            fingerprinted_packets,
            stop_reason,
        }
    }

    /// One iteration's search: sample pass, full-pool confirmation, consolidation.
    ///
    /// Sign indices of the returned intersections start at `base_index`.
    pub async fn compute_for_sample(
        &self,
        functions: Arc<Vec<PacketFunction>>,
        sample: Arc<Vec<Split>>,
        full: Arc<Vec<Split>>,
        threshold: f64,
        excluded: &BTreeSet<usize>,
        base_index: usize,
    ) -> IdentResult<SampleFindings> {
        let config = &self.config;

        info!("Finding effective signs with threshold: {:.0}", threshold);
        let sample_results = find_effective_signs(
            functions.clone(),
            sample,
            config.evaluation_params(threshold),
            excluded,
        )
        .await;
        if sample_results.len() > config.max_sample_signs {
            return Err(IdentError::TooManySigns {
                count: sample_results.len(),
            });
        }

        let candidates: Vec<usize> = sample_results
            .iter()
            .map(|r| r.index)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let full_threshold = threshold * config.full_threshold_factor;
        debug!(
            "Confirming {} functions on the full pool with threshold {:.0}",
            candidates.len(),
            full_threshold
        );
        let confirmed = Arc::new(
            evaluate_candidates(
                functions,
                candidates,
                full.clone(),
                config.evaluation_params(full_threshold),
                excluded,
            )
            .await,
        );

        info!("Consolidating {} signs", confirmed.len());
        let consolidation =
            consolidate_signs(full, confirmed.clone(), config.consolidation_params(), base_index).await?;

        Ok(SampleFindings {
            consolidation,
            function_results: Arc::try_unwrap(confirmed).unwrap_or_else(|shared| (*shared).clone()),
        })
    }
}
