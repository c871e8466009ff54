//! Effectiveness threshold auto-tuning
//!
//! Until the first iteration produces a fingerprint the threshold is still
//! being searched for: repeated errors mean it lets too much through and it is
//! raised, repeated empty results mean it is too strict and it is lowered.
//! After that, failed iterations only count towards giving up.

/// How one iteration ended, as far as tuning is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Too many signs or true signs
    Error,
    /// No intersections
    Empty,
    Success,
}

/// Threshold state carried across iterations
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdTuner {
    threshold: f64,
    step: f64,
    floor: f64,
    too_many: usize,
    too_few: usize,
    no_progress: usize,
    max_no_progress: usize,
    threshold_set: bool,
    extension_used: usize,
    max_extension: usize,
}

impl ThresholdTuner {
    pub fn new(threshold: f64, step: f64, floor: f64) -> Self {
        Self {
            threshold,
            step,
            floor,
            too_many: 0,
            too_few: 0,
            no_progress: 0,
            max_no_progress: 20,
            threshold_set: false,
            extension_used: 0,
            max_extension: usize::MAX,
        }
    }

    /// Stop after this many consecutive failed iterations once the threshold is set
    pub fn with_max_no_progress(mut self, max_no_progress: usize) -> Self {
        self.max_no_progress = max_no_progress;
        self
    }

    /// Cap the iterations the tuner may add back to the budget over a whole run
    pub fn with_max_extension(mut self, max_extension: usize) -> Self {
        self.max_extension = max_extension;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn threshold_set(&self) -> bool {
        self.threshold_set
    }

    pub fn no_progress(&self) -> usize {
        self.no_progress
    }

    pub fn below_floor(&self) -> bool {
        self.threshold <= self.floor
    }

    pub fn should_give_up(&self) -> bool {
        self.threshold_set && self.no_progress >= self.max_no_progress
    }

    /// Apply pending adjustments before an iteration runs.
    ///
    /// Returns the number of iterations to add back to the budget. Raising the
    /// threshold after a streak of errors refunds the streak's iterations, so
    /// tuning does not eat the budget, but never more than the configured cap
    /// over the whole run.
    pub fn apply_pending(&mut self) -> usize {
        let mut extension = 0;
        if self.too_many > 1 {
            self.threshold += self.step;
            extension = self
                .too_many
                .min(self.max_extension.saturating_sub(self.extension_used));
            self.extension_used += extension;
            self.too_many = 0;
        }
        if self.too_few > 1 {
            self.threshold -= self.step;
            self.too_few = 0;
        }
        extension
    }

    /// Record how an iteration ended
    pub fn record(&mut self, outcome: IterationOutcome) {
        if !self.threshold_set {
            match outcome {
                IterationOutcome::Error => {
                    self.too_many += 1;
                    self.too_few = 0;
                }
                IterationOutcome::Empty => {
                    self.too_few += 1;
                    self.too_many = 0;
                }
                IterationOutcome::Success => {
                    self.threshold_set = true;
                    self.no_progress = 0;
                }
            }
            return;
        }

        match outcome {
            IterationOutcome::Success => self.no_progress = 0,
            IterationOutcome::Error | IterationOutcome::Empty => self.no_progress += 1,
        }
    }
}
