//! Multinomial resampling.

use crate::config::ResampleMode;
use crate::error::Result;
use crate::rng::PrngKey;
use crate::sampler::sample_indices;

/// Draws `N` ancestor indices with probability proportional to `exp(log_w)`.
///
/// Fails with `DegenerateWeights` when every weight is `-inf`.
pub fn resample(key: PrngKey, log_weights: &[f32]) -> Result<(Vec<usize>, PrngKey)> {
    sample_indices(key, log_weights, log_weights.len())
}

/// Whether a step with effective sample size `ess` over `n` particles resamples.
pub fn should_resample(mode: ResampleMode, ess: f32, n: usize) -> bool {
    match mode {
        ResampleMode::Always => true,
        ResampleMode::Never => false,
        ResampleMode::Adaptive { ess_fraction } => ess < ess_fraction * n as f32,
    }
}

/// Gathers `values[ancestors[i]]`.
pub fn reindex<T: Clone>(values: &[T], ancestors: &[usize]) -> Vec<T> {
    ancestors.iter().map(|&a| values[a].clone()).collect()
}
