//! Exact enumeration of small generation trees.
//!
//! Every output of length `T` over a vocabulary of `V` tokens is enumerated.
//! Prefixes with `l` generated tokens are stored level by level; the children
//! of prefix `i` at level `l` are `i * V + v` at level `l + 1`, so the last
//! level is in lexicographic order of the generated suffix.
//!
//! From the tree the table derives:
//!
//! - exact `log p`, `log phi` and normalized `log sigma` of every sequence
//! - the exact log partition function `log Z`
//! - optimal twists by backward marginalization:
//!   `opt(prefix) = lse_v[log p(v | prefix) + opt(prefix + v)]`, seeded with
//!   `log phi` on complete sequences
//!
//! Only intended for `V^T` up to [`ExactLimits::max_sequences`].

use candle_core::Tensor;

use crate::config::ExactLimits;
use crate::error::{Error, Result};
use crate::logspace::{log_normalize, log_sum_exp};
use crate::rng::PrngKey;
use crate::sampler::sample_indices;
use crate::scorer::{self, CausalScorer};
use crate::smc::Target;
use crate::twist::Twist;

/// Fully enumerated target distribution.
#[derive(Debug, Clone)]
pub struct ExactTable {
    prompt_len: usize,
    n_vocab: usize,
    output_len: usize,
    /// `levels[l]` holds every prefix with `l` generated tokens.
    levels: Vec<Vec<Vec<u32>>>,
    /// `cond[l][i][v] = log p(v | levels[l][i])`, for `l < T`.
    cond: Vec<Vec<Vec<f32>>>,
    /// `optimal[l - 1]` are the optimal twists of `levels[l]`, `l` in `1..T`.
    optimal: Vec<Vec<f32>>,
    /// Complete sequences, prompt included.
    pub sequences: Vec<Vec<u32>>,
    pub log_p: Vec<f32>,
    pub log_phi: Vec<f32>,
    pub log_sigma: Vec<f32>,
    pub log_z: f32,
}

impl ExactTable {
    /// Enumerates all `V^T` continuations of the target's prompt.
    ///
    /// Fails with `UnsupportedConfiguration` before any model call when the
    /// tree exceeds `limits`.
    pub fn build(target: &Target<'_>, output_len: usize, limits: &ExactLimits) -> Result<Self> {
        let n_vocab = target.n_vocab;
        let total = limits.check(n_vocab, output_len)?;
        if output_len == 0 {
            return Err(Error::InvalidArgument("output_len must be positive".into()));
        }

        let mut levels = vec![vec![target.prompt.to_vec()]];
        let mut cond = Vec::with_capacity(output_len);
        let mut log_p = vec![0.0f32];
        for l in 0..output_len {
            let rows = scorer::next_token_log_probs(target.model, &levels[l], n_vocab)?;
            let mut children = Vec::with_capacity(levels[l].len() * n_vocab);
            let mut child_log_p = Vec::with_capacity(levels[l].len() * n_vocab);
            for (i, prefix) in levels[l].iter().enumerate() {
                for v in 0..n_vocab {
                    let mut child = prefix.clone();
                    child.push(v as u32);
                    children.push(child);
                    child_log_p.push(log_p[i] + rows[i][v]);
                }
            }
            cond.push(rows);
            levels.push(children);
            log_p = child_log_p;
        }

        let sequences = levels[output_len].clone();
        let log_phi = target.terminal.evaluate(&sequences, target.prompt_len())?;
        let joint: Vec<f32> = log_p.iter().zip(&log_phi).map(|(p, f)| p + f).collect();
        let log_z = log_sum_exp(&joint);
        if log_z == f32::NEG_INFINITY {
            return Err(Error::DegenerateWeights);
        }
        let log_sigma = log_normalize(&joint);

        // Backward recursion from complete sequences down to one generated token
        let mut optimal = vec![Vec::new(); output_len.saturating_sub(1)];
        let mut next = log_phi.clone();
        for l in (1..output_len).rev() {
            let values: Vec<f32> = cond[l]
                .iter()
                .enumerate()
                .map(|(i, row)| {
                    let terms: Vec<f32> = (0..n_vocab).map(|v| row[v] + next[i * n_vocab + v]).collect();
                    log_sum_exp(&terms)
                })
                .collect();
            optimal[l - 1] = values.clone();
            next = values;
        }

        tracing::debug!(sequences = total, log_z, "Exact table enumerated");
        Ok(Self {
            prompt_len: target.prompt_len(),
            n_vocab,
            output_len,
            levels,
            cond,
            optimal,
            sequences,
            log_p,
            log_phi,
            log_sigma,
            log_z,
        })
    }

    pub fn output_len(&self) -> usize {
        self.output_len
    }

    pub fn n_vocab(&self) -> usize {
        self.n_vocab
    }

    /// Prefixes with `len` generated tokens, in enumeration order.
    pub fn prefixes(&self, len: usize) -> Result<&[Vec<u32>]> {
        self.levels
            .get(len)
            .map(|l| l.as_slice())
            .ok_or_else(|| Error::InvalidArgument(format!("prefix length {len} beyond horizon")))
    }

    /// Index of a complete sequence.
    pub fn index_of(&self, seq: &[u32]) -> Option<usize> {
        if seq.len() != self.prompt_len + self.output_len {
            return None;
        }
        seq[self.prompt_len..]
            .iter()
            .try_fold(0usize, |acc, &t| ((t as usize) < self.n_vocab).then(|| acc * self.n_vocab + t as usize))
    }

    /// Optimal log-twists for generated lengths `1..T`, entry `len - 1`
    /// aligned with [`Self::prefixes`]`(len)`.
    pub fn optimal_log_twists(&self) -> &[Vec<f32>] {
        &self.optimal
    }

    /// Learned twist values on the same prefixes as
    /// [`Self::optimal_log_twists`]. Differentiable.
    pub fn model_log_twists(&self, twist: &dyn CausalScorer) -> Result<Vec<Tensor>> {
        (1..self.output_len)
            .map(|len| {
                let ids = scorer::batch_tensor(&self.levels[len], twist.device())?;
                scorer::learned_twist_values(twist, &ids, self.n_vocab)
            })
            .collect()
    }

    /// Draws `n` complete sequences from sigma.
    pub fn sample(&self, key: PrngKey, n: usize) -> Result<(Vec<Vec<u32>>, PrngKey)> {
        let (indices, key) = sample_indices(key, &self.log_sigma, n)?;
        Ok((indices.into_iter().map(|i| self.sequences[i].clone()).collect(), key))
    }

    /// Sigma marginal of the output token at `position` (0-based).
    pub fn token_marginals(&self, position: usize) -> Result<Vec<f32>> {
        if position >= self.output_len {
            return Err(Error::InvalidArgument(format!(
                "position {position} beyond horizon {}",
                self.output_len
            )));
        }
        let mut marginals = vec![0.0f64; self.n_vocab];
        for (seq, lp) in self.sequences.iter().zip(&self.log_sigma) {
            marginals[seq[self.prompt_len + position] as usize] += (*lp as f64).exp();
        }
        Ok(marginals.into_iter().map(|m| m as f32).collect())
    }

    /// Normalized log-probability of every sequence under the twisted
    /// proposal `q_t(v) ∝ p(v | prefix) * twist(prefix + v)`.
    ///
    /// With `terminal` set, it replaces `twist` on the last step.
    pub fn proposal_log_probs(&self, twist: &Twist<'_>, terminal: Option<&Twist<'_>>) -> Result<Vec<f32>> {
        let mut log_q = vec![0.0f32];
        for l in 0..self.output_len {
            let step_twist = match terminal {
                Some(phi) if l + 1 == self.output_len => phi,
                _ => twist,
            };
            let ext = step_twist.evaluate_extensions(&self.levels[l], self.prompt_len, self.n_vocab)?;
            let mut next = Vec::with_capacity(log_q.len() * self.n_vocab);
            for (i, (row, tw)) in self.cond[l].iter().zip(&ext).enumerate() {
                let combined: Vec<f32> = row.iter().zip(tw).map(|(a, b)| a + b).collect();
                let z = log_sum_exp(&combined);
                if z == f32::NEG_INFINITY {
                    return Err(Error::DegenerateProposal { particle: i });
                }
                next.extend(combined.iter().map(|c| log_q[i] + c - z));
            }
            log_q = next;
        }
        Ok(log_q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::model::CausalTransformer;
    use candle_core::Device;

    fn test_device() -> Device {
        Device::Cpu
    }

    #[test]
    fn test_enumeration_order_and_normalization() {
        let model = CausalTransformer::new(&ModelConfig::default(), &test_device()).unwrap();
        let terminal = Twist::token_containment(1);
        let prompt = [0u32, 1];
        let target = Target::new(&model, &terminal, &prompt, 2).unwrap();
        let table = ExactTable::build(&target, 3, &ExactLimits::default()).unwrap();

        assert_eq!(table.sequences.len(), 8);
        assert_eq!(table.sequences[0], vec![0, 1, 0, 0, 0]);
        assert_eq!(table.sequences[5], vec![0, 1, 1, 0, 1]);
        assert_eq!(table.index_of(&[0, 1, 1, 0, 1]), Some(5));

        let total: f32 = table.log_sigma.iter().map(|x| x.exp()).sum();
        assert!((total - 1.0).abs() < 1e-5);
        let model_mass: f32 = table.log_p.iter().map(|x| x.exp()).sum();
        assert!((model_mass - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_limits_checked_before_enumeration() {
        let model = CausalTransformer::new(&ModelConfig::default(), &test_device()).unwrap();
        let terminal = Twist::token_containment(1);
        let prompt = [0u32];
        let target = Target::new(&model, &terminal, &prompt, 2).unwrap();
        let limits = ExactLimits { max_sequences: 4 };

        let err = ExactTable::build(&target, 3, &limits).unwrap_err();
        assert!(matches!(err, Error::UnsupportedConfiguration(_)));
    }

    #[test]
    fn test_optimal_twists_marginalize_to_log_z() {
        let model = CausalTransformer::new(&ModelConfig::default(), &test_device()).unwrap();
        let terminal = Twist::token_containment(0);
        let prompt = [1u32, 1];
        let target = Target::new(&model, &terminal, &prompt, 2).unwrap();
        let table = ExactTable::build(&target, 4, &ExactLimits::default()).unwrap();

        let first = &table.optimal_log_twists()[0];
        let terms: Vec<f32> = (0..2).map(|v| table.cond[0][0][v] + first[v]).collect();
        assert!((log_sum_exp(&terms) - table.log_z).abs() < 1e-4);
    }
}
