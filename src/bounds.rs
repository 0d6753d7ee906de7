//! Bounds on `log Z`.
//!
//! With `q` the twisted proposal (learned twist on every step, no
//! resampling) and `log w(s) = log p(s) + log phi(s) - log q(s)`:
//!
//! - `E_q[log w] <= log Z` ([`lower_bound`])
//! - `log mean_i w_i` is a tighter multi-sample lower bound ([`iwae_lower_bound`])
//! - `E_sigma[log w] >= log Z` ([`upper_bound`])
//!
//! The gap `upper - lower = KL(q || sigma) + KL(sigma || q)`.

use crate::error::{Error, Result};
use crate::exact::ExactTable;
use crate::logspace::{log_mean_exp, log_sum_exp, mean};
use crate::rng::PrngKey;
use crate::sampler::{propose, sample_model};
use crate::scorer;
use crate::smc::Target;
use crate::twist::Twist;

/// Proposal samples with one-shot importance weights.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalWeights {
    pub sequences: Vec<Vec<u32>>,
    pub log_weights: Vec<f32>,
}

/// Exact bound values computed by enumeration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExactBounds {
    pub lower: f32,
    pub upper: f32,
    pub log_z: f32,
}

impl ExactBounds {
    pub fn kl_gap(&self) -> f32 {
        kl_gap(self.upper, self.lower)
    }
}

/// Samples `n` sequences from the twisted proposal and weights them against
/// the terminal potential.
pub fn proposal_log_weights(
    key: PrngKey,
    target: &Target<'_>,
    twist: &Twist<'_>,
    output_len: usize,
    n: usize,
) -> Result<(ProposalWeights, PrngKey)> {
    let mut key = key;
    let mut sequences = vec![target.prompt.to_vec(); n];
    let mut log_p = vec![0.0f32; n];
    let mut log_q = vec![0.0f32; n];
    for _ in 0..output_len {
        let (proposal, next) = propose(
            key,
            target.model,
            twist,
            &sequences,
            target.prompt_len(),
            target.n_vocab,
        )?;
        key = next;
        for i in 0..n {
            sequences[i].push(proposal.tokens[i]);
            log_p[i] += proposal.log_p[i];
            log_q[i] += proposal.log_p[i] + proposal.log_twist[i] - proposal.log_z[i];
        }
    }
    let log_phi = target.terminal.evaluate(&sequences, target.prompt_len())?;
    let log_weights = importance_log_weights(&log_p, &log_phi, &log_q);
    Ok((
        ProposalWeights {
            sequences,
            log_weights,
        },
        key,
    ))
}

fn importance_log_weights(log_p: &[f32], log_phi: &[f32], log_q: &[f32]) -> Vec<f32> {
    log_p
        .iter()
        .zip(log_phi)
        .zip(log_q)
        .map(|((p, f), q)| p + f - q)
        .collect()
}

/// Rejects ragged batches, sequences shorter than the prompt and tokens
/// outside the vocabulary.
fn check_sequences(sequences: &[Vec<u32>], full_len: usize, prompt_len: usize, n_vocab: usize) -> Result<()> {
    if let Some(bad) = sequences.iter().find(|s| s.len() != full_len) {
        return Err(Error::ShapeMismatch {
            what: "sequence length",
            expected: full_len,
            actual: bad.len(),
        });
    }
    if full_len < prompt_len {
        return Err(Error::InvalidArgument(format!(
            "sequences of length {full_len} are shorter than the prompt ({prompt_len})"
        )));
    }
    if let Some(&token) = sequences.iter().flatten().find(|&&t| t as usize >= n_vocab) {
        return Err(Error::InvalidArgument(format!(
            "token {token} outside vocabulary of {n_vocab}"
        )));
    }
    Ok(())
}

/// Normalized proposal log-density of given complete sequences, scored step by step along them.
pub fn proposal_log_probs(
    target: &Target<'_>,
    twist: &Twist<'_>,
    sequences: &[Vec<u32>],
) -> Result<Vec<f32>> {
    let prompt_len = target.prompt_len();
    let full_len = sequences.first().map_or(prompt_len, |s| s.len());
    check_sequences(sequences, full_len, prompt_len, target.n_vocab)?;
    let mut log_q = vec![0.0f32; sequences.len()];
    for len in prompt_len..full_len {
        let prefixes: Vec<Vec<u32>> = sequences.iter().map(|s| s[..len].to_vec()).collect();
        let rows = scorer::next_token_log_probs(target.model, &prefixes, target.n_vocab)?;
        let ext = twist.evaluate_extensions(&prefixes, prompt_len, target.n_vocab)?;
        for (i, seq) in sequences.iter().enumerate() {
            let combined: Vec<f32> = rows[i].iter().zip(&ext[i]).map(|(a, b)| a + b).collect();
            log_q[i] += combined[seq[len] as usize] - log_sum_exp(&combined);
        }
    }
    Ok(log_q)
}

/// Mean one-shot log-weight.
pub fn lower_bound(log_weights: &[f32]) -> f32 {
    mean(log_weights)
}

/// `logsumexp(log_w) - log N`.
pub fn iwae_lower_bound(log_weights: &[f32]) -> f32 {
    log_mean_exp(log_weights)
}

/// Mean log-weight of posterior samples.
pub fn upper_bound(target: &Target<'_>, twist: &Twist<'_>, sigma_samples: &[Vec<u32>]) -> Result<f32> {
    if sigma_samples.is_empty() {
        return Err(Error::InvalidArgument("upper bound needs posterior samples".into()));
    }
    let prompt_len = target.prompt_len();
    let ids = scorer::batch_tensor(sigma_samples, target.model.device())?;
    let log_p: Vec<f32> = scorer::sequence_log_probs(target.model, &ids, prompt_len, target.n_vocab)?.to_vec1()?;
    let log_phi = target.terminal.evaluate(sigma_samples, prompt_len)?;
    let log_q = proposal_log_probs(target, twist, sigma_samples)?;
    Ok(mean(&importance_log_weights(&log_p, &log_phi, &log_q)))
}

/// `upper - lower`.
pub fn kl_gap(upper: f32, lower: f32) -> f32 {
    upper - lower
}

/// Exact expectations of the log-weight under `q` and under sigma.
///
/// Sequences with zero probability under the averaging distribution do not
/// contribute.
pub fn exact_bounds(table: &ExactTable, twist: &Twist<'_>) -> Result<ExactBounds> {
    let log_q = table.proposal_log_probs(twist, None)?;
    let log_w = importance_log_weights(&table.log_p, &table.log_phi, &log_q);
    let expectation = |log_probs: &[f32]| -> f32 {
        log_probs
            .iter()
            .zip(&log_w)
            .filter(|(lp, _)| **lp > f32::NEG_INFINITY)
            .map(|(lp, w)| (*lp as f64).exp() * *w as f64)
            .sum::<f64>() as f32
    };
    Ok(ExactBounds {
        lower: expectation(&log_q),
        upper: expectation(&table.log_sigma),
        log_z: table.log_z,
    })
}

/// Draws `n_draws` plain model samples and keeps those with finite terminal
/// potential.
///
/// Under a hard 0/1 evidence potential the survivors are exact posterior
/// samples.
pub fn rejection_posterior_samples(
    key: PrngKey,
    target: &Target<'_>,
    output_len: usize,
    n_draws: usize,
) -> Result<(Vec<Vec<u32>>, PrngKey)> {
    let (samples, key) = sample_model(
        key,
        target.model,
        target.prompt,
        output_len,
        n_draws,
        target.n_vocab,
    )?;
    let log_phi = target.terminal.evaluate(&samples, target.prompt_len())?;
    let accepted: Vec<Vec<u32>> = samples
        .into_iter()
        .zip(log_phi)
        .filter(|(_, f)| f.is_finite())
        .map(|(s, _)| s)
        .collect();
    tracing::debug!(accepted = accepted.len(), n_draws, "Rejection sampling finished");
    Ok((accepted, key))
}
