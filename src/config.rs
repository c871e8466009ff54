//! Configuration module for fingerprint identification runs

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::consolidate::ConsolidationParams;
use crate::engine::EvaluationParams;
use crate::error::{IdentError, IdentResult};
use crate::synthesis::{BinaryOp, FunctionSynthesizer, UnaryOp, DEFAULT_BINARY_OPS, DEFAULT_UNARY_OPS};

/// Main configuration structure for identification runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentConfig {
    /// Number of functions synthesized on top of the seed extractors
    pub n_functions: usize,

    /// Packets drawn per iteration
    pub n_samples: usize,

    /// Initial effectiveness threshold
    pub threshold: f64,

    /// Iteration budget
    pub iterations: usize,

    /// Probability that a synthesis step is a feature extraction
    pub featext_probability: f64,

    /// Binary operations available to synthesis
    pub binary_ops: Vec<BinaryOp>,

    /// Feature extractions available to synthesis
    pub unary_ops: Vec<UnaryOp>,

    /// Most frequent values tested per function
    pub max_candidates: usize,

    /// Outer evaluation pool size
    pub function_workers: usize,

    /// Inner evaluation pool size, per function task
    pub split_workers: usize,

    /// Packet filter pool size
    pub filter_workers: usize,

    /// Subset combination pool size
    pub subset_workers: usize,

    /// Round budget of the subset search
    pub consolidation_rounds: usize,

    /// Share of every member a merged intersection must keep
    pub min_overlap: f64,

    /// The run stops once the threshold drops to this value
    pub threshold_floor: f64,

    /// Threshold adjustment per tuning step
    pub threshold_step: f64,

    /// Threshold multiplier for the full-corpus confirmation pass
    pub full_threshold_factor: f64,

    /// More signs than this on a sample is treated as a too permissive threshold
    pub max_sample_signs: usize,

    /// More single-sign intersections than this aborts consolidation
    pub max_true_signs: usize,

    /// Destination ports a sign may span within one split
    pub max_ports: usize,

    /// Iterations without progress tolerated after the first success
    pub max_no_progress: usize,

    /// Cap on iterations added back to the budget by threshold tuning.
    ///
    /// Raising the threshold after a streak of errors extends the budget by
    /// the streak's length. Here the extension is not unconditional: once this
    /// many iterations have been refunded over the whole run, further raises
    /// add nothing, so a threshold stuck in error streaks cannot extend the run
    /// forever. `usize::MAX` restores a full refund for every streak.
    pub max_budget_extension: usize,

    /// Base seeds; drawn at random when absent
    pub seed1: Option<u64>,
    pub seed2: Option<u64>,

    /// Time labels file, one label per line
    pub times_file: Option<PathBuf>,

    /// Per-split packet limit
    pub limit: Option<usize>,

    /// Drop ZMap scan packets while loading
    pub exclude_zmap: bool,

    /// Directory receiving report files
    pub output_dir: PathBuf,
}

impl Default for IdentConfig {
    fn default() -> Self {
        Self {
            n_functions: 2000,
            n_samples: 100_000,
            threshold: 1000.0,
            iterations: 50,
            featext_probability: 0.1,
            binary_ops: DEFAULT_BINARY_OPS.to_vec(),
            unary_ops: DEFAULT_UNARY_OPS.to_vec(),
            max_candidates: 10,
            function_workers: 56,
            split_workers: 3,
            filter_workers: 225,
            subset_workers: 32,
            consolidation_rounds: 10,
            min_overlap: 0.90,
            threshold_floor: 50.0,
            threshold_step: 25.0,
            full_threshold_factor: 3.0,
            max_sample_signs: 20,
            max_true_signs: 15,
            max_ports: 20,
            max_no_progress: 20,
            max_budget_extension: 50,
            seed1: None,
            seed2: None,
            times_file: None,
            limit: None,
            exclude_zmap: false,
            output_dir: PathBuf::from("tmp"),
        }
    }
}

impl IdentConfig {
    /// Set the number of synthesized functions
    pub fn with_functions(mut self, n_functions: usize) -> Self {
        self.n_functions = n_functions;
        self
    }

    /// Set the per-iteration sample size
    pub fn with_samples(mut self, n_samples: usize) -> Self {
        self.n_samples = n_samples;
        self
    }

    /// Set the initial effectiveness threshold
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the iteration budget
    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    /// Fix both base seeds
    pub fn with_seeds(mut self, seed1: u64, seed2: u64) -> Self {
        self.seed1 = Some(seed1);
        self.seed2 = Some(seed2);
        self
    }

    /// Size every worker pool at once
    pub fn with_workers(mut self, function: usize, split: usize, filter: usize, subset: usize) -> Self {
        self.function_workers = function;
        self.split_workers = split;
        self.filter_workers = filter;
        self.subset_workers = subset;
        self
    }

    pub fn with_output_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Seeds of the run, drawing the missing ones at random
    pub fn resolve_seeds(&self) -> (u64, u64) {
        (
            self.seed1.unwrap_or_else(|| rand::random::<u64>() / 2),
            self.seed2.unwrap_or_else(|| rand::random::<u64>() / 2),
        )
    }

    /// Evaluation knobs for the sample pass at `threshold`
    pub fn evaluation_params(&self, threshold: f64) -> EvaluationParams {
        EvaluationParams {
            threshold,
            max_candidates: self.max_candidates,
            function_workers: self.function_workers,
            split_workers: self.split_workers,
        }
    }

    pub fn consolidation_params(&self) -> ConsolidationParams {
        ConsolidationParams {
            filter_workers: self.filter_workers,
            subset_workers: self.subset_workers,
            max_rounds: self.consolidation_rounds,
            min_overlap: self.min_overlap,
            max_true_signs: self.max_true_signs,
            max_ports: self.max_ports,
        }
    }

    pub fn synthesizer(&self) -> FunctionSynthesizer {
        FunctionSynthesizer::new(
            self.featext_probability,
            self.binary_ops.clone(),
            self.unary_ops.clone(),
        )
    }

    /// Load configuration from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> IdentResult<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            IdentError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: IdentConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from ~/.fgpt-ident.toml, falling back to defaults
    pub fn load_default_config() -> Self {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let config_path = home_dir.join(".fgpt-ident.toml");

        if config_path.exists() {
            match Self::from_toml_file(&config_path) {
                Ok(config) => {
                    log::info!("Loaded config from {}", config_path.display());
                    return config;
                }
                Err(e) => log::warn!("Ignoring {}: {}", config_path.display(), e),
            }
        }

        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> IdentResult<()> {
        if self.n_samples == 0 {
            return Err(IdentError::ConfigError("Sample size must be greater than 0".to_string()));
        }

        if !(0.0..=1.0).contains(&self.featext_probability) {
            return Err(IdentError::ConfigError(format!(
                "Feature extraction probability must be within [0, 1], got {}",
                self.featext_probability
            )));
        }

        if !(0.0..=1.0).contains(&self.min_overlap) {
            return Err(IdentError::ConfigError(format!(
                "Minimum overlap must be within [0, 1], got {}",
                self.min_overlap
            )));
        }

        if self.threshold_step <= 0.0 || self.full_threshold_factor <= 0.0 {
            return Err(IdentError::ConfigError(
                "Threshold step and full-corpus factor must be positive".to_string(),
            ));
        }

        if self.max_candidates == 0 {
            return Err(IdentError::ConfigError(
                "At least one candidate value per function must be tested".to_string(),
            ));
        }

        if self.function_workers == 0
            || self.split_workers == 0
            || self.filter_workers == 0
            || self.subset_workers == 0
        {
            return Err(IdentError::ConfigError(
                "Worker counts must be greater than 0".to_string(),
            ));
        }

        if self.max_true_signs >= usize::BITS as usize {
            return Err(IdentError::ConfigError(format!(
                "True sign bound {} makes the subset search unbounded",
                self.max_true_signs
            )));
        }

        Ok(())
    }
}
