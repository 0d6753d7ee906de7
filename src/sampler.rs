//! Token sampling.
//!
//! Draws the next token of every particle from the unnormalized twisted
//! proposal, or from the plain model:
//!
//! ```text
//! prefixes [N, L]
//!     │
//!     ├──► model ──► log_softmax (last position) ──► log p   [N, V]
//!     │
//!     └──► twist ──► extension values            ──► psi     [N, V]
//!                                                     │
//!                        combined = log p + psi ◄─────┘
//!                             │
//!                             ├──► Z = logsumexp(combined)
//!                             ▼
//!                      categorical draw ──► token
//! ```
//!
//! All draws of one call come from a single `StdRng` seeded by a sub-key;
//! the continuation key is returned.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;

use crate::error::{Error, Result};
use crate::logspace::log_sum_exp;
use crate::rng::PrngKey;
use crate::scorer::{self, CausalScorer};
use crate::twist::Twist;

/// Per-particle result of one proposal step.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    /// Sampled next token.
    pub tokens: Vec<u32>,
    /// `log p(token | prefix)`.
    pub log_p: Vec<f32>,
    /// Twist value of `prefix + token`.
    pub log_twist: Vec<f32>,
    /// `logsumexp` of the combined row.
    pub log_z: Vec<f32>,
}

/// Builds a sampling distribution from unnormalized log values.
///
/// Returns `None` when no entry has positive mass.
fn weighted_index(log_values: &[f32]) -> Option<WeightedIndex<f64>> {
    let max = log_values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return None;
    }
    let weights = log_values.iter().map(|&x| ((x - max) as f64).exp());
    WeightedIndex::new(weights).ok()
}

fn draw_row(rng: &mut StdRng, log_values: &[f32], particle: usize) -> Result<usize> {
    match weighted_index(log_values) {
        Some(dist) => Ok(dist.sample(rng)),
        None => {
            tracing::warn!(particle, "Proposal row has no finite mass");
            Err(Error::DegenerateProposal { particle })
        }
    }
}

/// Draws one index from unnormalized log values.
pub fn sample_categorical(key: PrngKey, log_values: &[f32]) -> Result<(usize, PrngKey)> {
    let (next, sub) = key.split();
    let mut rng = sub.into_rng();
    Ok((draw_row(&mut rng, log_values, 0)?, next))
}

/// Draws one index per row. Row `i` failing reports particle `i`.
pub fn sample_rows(key: PrngKey, rows: &[Vec<f32>]) -> Result<(Vec<u32>, PrngKey)> {
    let (next, sub) = key.split();
    let mut rng = sub.into_rng();
    let tokens = rows
        .iter()
        .enumerate()
        .map(|(i, row)| draw_row(&mut rng, row, i).map(|idx| idx as u32))
        .collect::<Result<Vec<_>>>()?;
    Ok((tokens, next))
}

/// Draws `n` indices from one categorical over log-weights.
///
/// An all `-inf` (or NaN) weight vector is [`Error::DegenerateWeights`].
pub fn sample_indices(key: PrngKey, log_weights: &[f32], n: usize) -> Result<(Vec<usize>, PrngKey)> {
    let (next, sub) = key.split();
    let dist = weighted_index(log_weights).ok_or_else(|| {
        tracing::warn!(n = log_weights.len(), "All particle weights are degenerate");
        Error::DegenerateWeights
    })?;
    let mut rng = sub.into_rng();
    Ok(((0..n).map(|_| dist.sample(&mut rng)).collect(), next))
}

/// Samples the next token of every prefix from `p(v | prefix) * twist(prefix + v)`.
pub fn propose(
    key: PrngKey,
    model: &dyn CausalScorer,
    twist: &Twist<'_>,
    prefixes: &[Vec<u32>],
    prompt_len: usize,
    n_vocab: usize,
) -> Result<(Proposal, PrngKey)> {
    let log_p_rows = scorer::next_token_log_probs(model, prefixes, n_vocab)?;
    let twist_rows = twist.evaluate_extensions(prefixes, prompt_len, n_vocab)?;
    if let Some(bad) = twist_rows.iter().find(|r| r.len() != n_vocab) {
        return Err(Error::ShapeMismatch {
            what: "twist vocabulary",
            expected: n_vocab,
            actual: bad.len(),
        });
    }

    let combined: Vec<Vec<f32>> = log_p_rows
        .iter()
        .zip(&twist_rows)
        .map(|(lp, tw)| lp.iter().zip(tw).map(|(a, b)| a + b).collect())
        .collect();
    let (tokens, key) = sample_rows(key, &combined)?;

    let mut proposal = Proposal {
        log_p: Vec::with_capacity(tokens.len()),
        log_twist: Vec::with_capacity(tokens.len()),
        log_z: Vec::with_capacity(tokens.len()),
        tokens,
    };
    for (i, &tok) in proposal.tokens.iter().enumerate() {
        let v = tok as usize;
        proposal.log_p.push(log_p_rows[i][v]);
        proposal.log_twist.push(twist_rows[i][v]);
        proposal.log_z.push(log_sum_exp(&combined[i]));
    }
    Ok((proposal, key))
}

/// Autoregressive samples from the plain model, `n` copies of `prompt`
/// extended by `output_len` tokens.
pub fn sample_model(
    key: PrngKey,
    model: &dyn CausalScorer,
    prompt: &[u32],
    output_len: usize,
    n: usize,
    n_vocab: usize,
) -> Result<(Vec<Vec<u32>>, PrngKey)> {
    let mut seqs = vec![prompt.to_vec(); n];
    let mut key = key;
    for _ in 0..output_len {
        let rows = scorer::next_token_log_probs(model, &seqs, n_vocab)?;
        let (tokens, next) = sample_rows(key, &rows)?;
        key = next;
        for (s, t) in seqs.iter_mut().zip(tokens) {
            s.push(t);
        }
    }
    Ok((seqs, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_categorical_respects_support() {
        let mut key = PrngKey::new(3);
        for _ in 0..50 {
            let (idx, next) = sample_categorical(key, &[f32::NEG_INFINITY, 0.0, f32::NEG_INFINITY]).unwrap();
            assert_eq!(idx, 1);
            key = next;
        }
    }

    #[test]
    fn test_sample_categorical_reproducible() {
        let logits = [0.1f32, 0.5, -0.3, 1.2];
        let (a, _) = sample_categorical(PrngKey::new(9), &logits).unwrap();
        let (b, _) = sample_categorical(PrngKey::new(9), &logits).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_degenerate_row_reports_particle() {
        let rows = vec![vec![0.0, 0.0], vec![f32::NEG_INFINITY, f32::NEG_INFINITY]];
        let err = sample_rows(PrngKey::new(0), &rows).unwrap_err();
        assert!(matches!(err, Error::DegenerateProposal { particle: 1 }));
    }

    #[test]
    fn test_degenerate_weights() {
        let err = sample_indices(PrngKey::new(0), &[f32::NEG_INFINITY; 4], 4).unwrap_err();
        assert!(matches!(err, Error::DegenerateWeights));
    }

    #[test]
    fn test_unnormalized_values_allowed() {
        // Large shared offsets do not change the distribution
        let (a, _) = sample_categorical(PrngKey::new(1), &[500.0, 501.0]).unwrap();
        let (b, _) = sample_categorical(PrngKey::new(1), &[0.0, 1.0]).unwrap();
        assert_eq!(a, b);
    }
}
