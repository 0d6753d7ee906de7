//! SMC state and the pure step transition.

use crate::error::{Error, Result};
use crate::logspace::{effective_sample_size, log_sum_exp};
use crate::rng::PrngKey;
use crate::sampler::propose;

use super::resample::{reindex, resample, should_resample};
use super::SmcContext;

/// Particle batch at time `t` (tokens generated so far).
#[derive(Debug, Clone, PartialEq)]
pub struct SmcState {
    pub sequences: Vec<Vec<u32>>,
    pub log_weights: Vec<f32>,
    /// Running unnormalized log target.
    pub log_gamma: Vec<f32>,
    /// Running `log p(generated | prompt)`.
    pub log_p: Vec<f32>,
    pub log_z_hat: f32,
    pub t: usize,
}

/// Diagnostics emitted by one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// Index of the generated token (0-based).
    pub t: usize,
    /// Effective sample size before resampling.
    pub ess: f32,
    /// Amount added to `log_z_hat`.
    pub log_z_increment: f32,
    pub resampled: bool,
    /// Weights after the update, before resampling.
    pub log_weights: Vec<f32>,
}

impl SmcState {
    /// `n` copies of the prompt with zero weights and accumulators.
    pub fn initial(prompt: &[u32], n: usize) -> Self {
        Self {
            sequences: vec![prompt.to_vec(); n],
            log_weights: vec![0.0; n],
            log_gamma: vec![0.0; n],
            log_p: vec![0.0; n],
            log_z_hat: 0.0,
            t: 0,
        }
    }

    pub fn n_particles(&self) -> usize {
        self.sequences.len()
    }

    /// Proposes one token per particle, reweights and optionally resamples.
    pub fn step(self, ctx: &SmcContext<'_>, key: PrngKey) -> Result<(Self, StepOutput, PrngKey)> {
        let target = ctx.target;
        let twist = ctx.step_twist(self.t);
        let (proposal, key) = propose(
            key,
            target.model,
            twist,
            &self.sequences,
            target.prompt_len(),
            target.n_vocab,
        )?;

        let Self {
            mut sequences,
            log_weights: prev_weights,
            log_gamma: prev_gamma,
            mut log_p,
            log_z_hat,
            t,
        } = self;

        let n = sequences.len();
        let mut log_gamma = Vec::with_capacity(n);
        let mut log_weights = Vec::with_capacity(n);
        for i in 0..n {
            sequences[i].push(proposal.tokens[i]);
            log_p[i] += proposal.log_p[i];
            let gamma = log_p[i] + proposal.log_twist[i];
            let log_q = proposal.log_p[i] + proposal.log_twist[i];
            let log_alpha = gamma - prev_gamma[i] - log_q + proposal.log_z[i];
            log_gamma.push(gamma);
            log_weights.push(if prev_weights[i] == f32::NEG_INFINITY {
                f32::NEG_INFINITY
            } else {
                prev_weights[i] + log_alpha
            });
        }

        let total = log_sum_exp(&log_weights);
        if !total.is_finite() {
            tracing::warn!(t, total, "Particle weights collapsed");
            return Err(Error::DegenerateWeights);
        }
        let log_z_increment = total - log_sum_exp(&prev_weights);
        let log_z_hat = log_z_hat + log_z_increment;
        let ess = effective_sample_size(&log_weights);
        let resampled = should_resample(ctx.config.resample, ess, n);

        tracing::debug!(t, ess, log_z_hat, resampled, "SMC step");

        let output = StepOutput {
            t,
            ess,
            log_z_increment,
            resampled,
            log_weights: log_weights.clone(),
        };

        let (state, key) = if resampled {
            let (ancestors, key) = resample(key, &log_weights)?;
            let state = Self {
                sequences: reindex(&sequences, &ancestors),
                log_weights: vec![0.0; n],
                log_gamma: reindex(&log_gamma, &ancestors),
                log_p: reindex(&log_p, &ancestors),
                log_z_hat,
                t: t + 1,
            };
            (state, key)
        } else {
            let state = Self {
                sequences,
                log_weights,
                log_gamma,
                log_p,
                log_z_hat,
                t: t + 1,
            };
            (state, key)
        };
        Ok((state, output, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, ResampleMode, SmcConfig};
    use crate::model::CausalTransformer;
    use crate::smc::Target;
    use crate::twist::Twist;
    use candle_core::Device;

    fn test_device() -> Device {
        Device::Cpu
    }

    #[test]
    fn test_step_advances_and_resets_weights() {
        let model = CausalTransformer::new(&ModelConfig::default(), &test_device()).unwrap();
        let twist_net = CausalTransformer::new(&ModelConfig::default().with_seed(3), &test_device()).unwrap();
        let terminal = Twist::token_containment(1);
        let twist = Twist::Learned(&twist_net);
        let prompt = [0u32, 1];
        let target = Target::new(&model, &terminal, &prompt, 2).unwrap();
        let config = SmcConfig::new(16, 3);
        let ctx = SmcContext::new(&target, &twist, &config);

        let state = SmcState::initial(&prompt, 16);
        let (state, out, _) = state.step(&ctx, PrngKey::new(0)).unwrap();

        assert_eq!(state.t, 1);
        assert!(state.sequences.iter().all(|s| s.len() == 3));
        assert!(out.resampled);
        assert_eq!(state.log_weights, vec![0.0; 16]);
        assert!(out.ess > 0.0 && out.ess <= 16.0 + 1e-3);
    }

    #[test]
    fn test_first_increment_is_proposal_normalizer() {
        let model = CausalTransformer::new(&ModelConfig::default(), &test_device()).unwrap();
        let terminal = Twist::token_containment(1);
        let twist = Twist::token_containment(1);
        let prompt = [0u32];
        let target = Target::new(&model, &terminal, &prompt, 2).unwrap();
        let config = SmcConfig::new(8, 2).resample(ResampleMode::Never);
        let ctx = SmcContext::new(&target, &twist, &config);

        let (state, out, _) = SmcState::initial(&prompt, 8).step(&ctx, PrngKey::new(4)).unwrap();

        // Every particle shares the prompt, so the increment is Z_0 itself
        let rows = crate::scorer::next_token_log_probs(&model, &[vec![0]], 2).unwrap();
        let ext = twist.evaluate_extensions(&[vec![0]], 1, 2).unwrap();
        let z0 = log_sum_exp(&[rows[0][0] + ext[0][0], rows[0][1] + ext[0][1]]);
        assert!((out.log_z_increment - z0).abs() < 1e-4);
        assert!((state.log_z_hat - z0).abs() < 1e-4);
    }
}
