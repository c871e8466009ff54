//! Appearance-ratio statistics for the sign effectiveness test

use crate::error::StatError;

/// Unbiased sample variance (divides by `n - 1`)
pub fn sample_variance(values: &[f64]) -> Result<f64, StatError> {
    let n = values.len();
    if n < 2 {
        return Err(StatError::InsufficientSamples(n));
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let squares: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    Ok(squares / (n - 1) as f64)
}

/// Score how distinctly ratio `x` stands out from the distribution `ratios`.
///
/// `L` holds the ratios strictly below `x` and `LE` those at or below it. A
/// value with nothing below it scores 1. Otherwise the score is
/// `var(LE)² / var(L)²`: note that this squares a variance ratio rather than
/// comparing the variances directly, so scores grow quadratically in the
/// plain ratio and thresholds are calibrated against that.
pub fn effectiveness(x: f64, ratios: &[f64]) -> Result<f64, StatError> {
    let less: Vec<f64> = ratios.iter().copied().filter(|r| *r < x).collect();
    if less.is_empty() {
        return Ok(1.0);
    }
    let less_var = sample_variance(&less)?;

    let less_eq: Vec<f64> = ratios.iter().copied().filter(|r| *r <= x).collect();
    let less_eq_var = sample_variance(&less_eq)?;

    if less_var > 0.0 {
        Ok(less_eq_var.powi(2) / less_var.powi(2))
    } else {
        Err(StatError::NoDiscriminatingVariance)
    }
}
