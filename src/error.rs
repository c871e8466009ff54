//! Error handling for the fingerprint identifier
//!
//! Most failures inside an identification run are recoverable: they are turned
//! into threshold-tuning signals by the controller instead of aborting the run.
//! Only sampling exhaustion and collaborator failures (I/O, configuration) stop
//! a run outright. [`StatError`] never leaves the engine: a candidate value
//! whose score is undefined is simply not accepted.

use std::collections::BTreeSet;
use thiserror::Error;

use crate::consolidate::Consolidation;

/// Failures of the sign effectiveness test for a single candidate value
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StatError {
    #[error("Variance undefined: {0} sample(s), need at least 2")]
    InsufficientSamples(usize),

    #[error("No discriminating variance below candidate ratio")]
    NoDiscriminatingVariance,
}

/// Main error type for identification operations
#[derive(Debug, Error)]
pub enum IdentError {
    #[error("Found too many possible signs: {count}")]
    TooManySigns { count: usize },

    #[error("Found too many true signs: {count}")]
    TooManyTrueSigns {
        count: usize,
        partial: Box<Consolidation>,
    },

    #[error("Unable to sample: exceeded {tries} sample tries")]
    SamplingExhausted { tries: usize },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type alias for identification operations
pub type IdentResult<T> = Result<T, IdentError>;

/// What the controller does after an iteration failed with a given error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// The threshold let too much through; count it towards threshold tuning
    RetuneThreshold,
    /// Stop the run and return what has accumulated so far
    Abort,
}

impl IdentError {
    /// Determine how the controller recovers from this error
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            IdentError::TooManySigns { .. } | IdentError::TooManyTrueSigns { .. } => {
                RecoveryStrategy::RetuneThreshold
            }
            _ => RecoveryStrategy::Abort,
        }
    }

    /// Check if the run can continue after this error
    pub fn is_recoverable(&self) -> bool {
        self.recovery_strategy() != RecoveryStrategy::Abort
    }

    /// Bad functions discovered before the error, if the error carries any
    pub fn partial_bad_functions(&self) -> Option<&BTreeSet<usize>> {
        match self {
            IdentError::TooManyTrueSigns { partial, .. } => Some(&partial.bad_functions),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_strategy() {
        let too_many = IdentError::TooManySigns { count: 21 };
        assert_eq!(too_many.recovery_strategy(), RecoveryStrategy::RetuneThreshold);
        assert!(too_many.is_recoverable());

        let exhausted = IdentError::SamplingExhausted { tries: 100 };
        assert_eq!(exhausted.recovery_strategy(), RecoveryStrategy::Abort);
        assert!(!exhausted.is_recoverable());
    }

    #[test]
    fn test_partial_bad_functions() {
        let partial = Consolidation {
            intersections: Vec::new(),
            bad_functions: [3, 9].into_iter().collect(),
        };
        let err = IdentError::TooManyTrueSigns {
            count: 16,
            partial: Box::new(partial),
        };
        let bad = err.partial_bad_functions().unwrap();
        assert_eq!(bad.iter().copied().collect::<Vec<_>>(), vec![3, 9]);
        assert!(IdentError::TooManySigns { count: 30 }.partial_bad_functions().is_none());
    }

    #[test]
    fn test_error_display() {
        let err = IdentError::SamplingExhausted { tries: 5000 };
        assert_eq!(err.to_string(), "Unable to sample: exceeded 5000 sample tries");
    }
}
