//! Host-side log-space arithmetic.
//!
//! Particle weights, proposal rows and enumerated tables are small `f32`
//! vectors; reductions accumulate in `f64` after a max shift.

/// `log(sum(exp(xs)))`. Empty or all `-inf` input gives `-inf`.
pub fn log_sum_exp(xs: &[f32]) -> f32 {
    let max = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return f32::NEG_INFINITY;
    }
    if max == f32::INFINITY {
        return f32::INFINITY;
    }
    let sum: f64 = xs.iter().map(|&x| ((x - max) as f64).exp()).sum();
    max + sum.ln() as f32
}

/// `log(mean(exp(xs)))`.
pub fn log_mean_exp(xs: &[f32]) -> f32 {
    log_sum_exp(xs) - (xs.len() as f32).ln()
}

/// Normalizes log-values into log-probabilities.
pub fn log_normalize(xs: &[f32]) -> Vec<f32> {
    let z = log_sum_exp(xs);
    xs.iter().map(|&x| x - z).collect()
}

/// Effective sample size `(sum w)^2 / sum w^2` of log-weights.
pub fn effective_sample_size(log_weights: &[f32]) -> f32 {
    let a = log_sum_exp(log_weights);
    if a == f32::NEG_INFINITY {
        return 0.0;
    }
    let doubled: Vec<f32> = log_weights.iter().map(|&w| 2.0 * w).collect();
    (2.0 * a - log_sum_exp(&doubled)).exp()
}

/// Arithmetic mean.
pub fn mean(xs: &[f32]) -> f32 {
    if xs.is_empty() {
        return f32::NAN;
    }
    (xs.iter().map(|&x| x as f64).sum::<f64>() / xs.len() as f64) as f32
}
