//! REINFORCE-with-baseline policy loss for the base model.
//!
//! ```text
//! loss = -(mean((r - b) log p) - mean(log p) mean(r - b))
//!        + beta_kl  * -mean log p(s ~ p_0)
//!        - beta_ent * mean(-log p (sg(log p) + 1))
//!        + (b - mean r)^2
//! ```
//!
//! Rewards are taken on sigma samples from SMC. `b` is the scalar head of
//! the baseline network at the last prompt position; it is detached inside
//! the policy term and trained only by the squared error.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, D};

use crate::config::SmcConfig;
use crate::error::{Error, Result};
use crate::reward::RewardModel;
use crate::rng::PrngKey;
use crate::sampler::sample_model;
use crate::scorer::{self, CausalScorer};
use crate::smc::{run_smc, SmcContext, Target};
use crate::twist::Twist;

/// Inputs that stay fixed across policy updates.
pub struct PolicySetup<'a> {
    /// Reward defining the objective.
    pub reward: &'a RewardModel,
    /// Frozen initial model for the KL regularizer.
    pub reference: &'a dyn CausalScorer,
    /// Scalar-headed baseline network.
    pub baseline: &'a dyn CausalScorer,
    pub beta_kl: f32,
    pub beta_ent: f32,
}

/// Scalar diagnostics of one policy loss evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyStats {
    pub loss: f32,
    pub mean_reward: f32,
    pub baseline: f32,
}

/// Evaluates the policy loss and backpropagates it into both the model and
/// the baseline parameters.
pub fn policy_loss(
    key: PrngKey,
    target: &Target<'_>,
    twist: &Twist<'_>,
    setup: &PolicySetup<'_>,
    output_len: usize,
    n_samples: usize,
) -> Result<(PolicyStats, GradStore, PrngKey)> {
    if setup.baseline.output_size() != 1 {
        return Err(Error::ShapeMismatch {
            what: "baseline head",
            expected: 1,
            actual: setup.baseline.output_size(),
        });
    }
    let prompt_len = target.prompt_len();
    let device = target.model.device();
    let config = SmcConfig::new(n_samples, output_len);
    let ctx = SmcContext::new(target, twist, &config);
    let (sigma, key) = run_smc(key, &ctx)?;

    let rewards = setup.reward.rewards(&sigma.sequences, prompt_len)?;
    let rewards = Tensor::from_slice(&rewards, rewards.len(), device)?;
    let mean_reward = rewards.mean_all()?;

    let sigma_ids = scorer::batch_tensor(&sigma.sequences, device)?;
    let log_p = scorer::sequence_log_probs(target.model, &sigma_ids, prompt_len, target.n_vocab)?;

    let prompt_ids = scorer::batch_tensor(&[target.prompt.to_vec()], setup.baseline.device())?;
    let baseline = setup
        .baseline
        .forward_all(&prompt_ids)?
        .narrow(1, prompt_len - 1, 1)?
        .flatten_all()?
        .squeeze(0)?;

    let advantage = rewards.broadcast_sub(&baseline.detach())?;
    let first = (&advantage * &log_p)?.mean_all()?;
    let second = (log_p.mean_all()? * advantage.mean_all()?)?;
    let objective = (first - second)?;

    let (model_seqs, key) = sample_model(key, target.model, target.prompt, output_len, n_samples, target.n_vocab)?;
    let (reference_seqs, key) = sample_model(key, setup.reference, target.prompt, output_len, n_samples, target.n_vocab)?;
    let kl = kl_term(target, &reference_seqs)?;
    let entropy = entropy_term(target, &model_seqs)?;

    let baseline_loss = (&baseline - &mean_reward)?.sqr()?;
    let loss = ((objective.neg()? + (kl * setup.beta_kl as f64)?)? - (entropy * setup.beta_ent as f64)?)?;
    let loss = (loss + &baseline_loss)?;

    let stats = PolicyStats {
        loss: loss.to_scalar()?,
        mean_reward: mean_reward.to_scalar()?,
        baseline: baseline.to_scalar()?,
    };
    tracing::debug!(
        loss = stats.loss,
        mean_reward = stats.mean_reward,
        baseline = stats.baseline,
        "Policy loss evaluated"
    );
    let grads = loss.backward()?;
    Ok((stats, grads, key))
}

/// `-mean log p_theta(s)` over samples of the reference model.
fn kl_term(target: &Target<'_>, reference_seqs: &[Vec<u32>]) -> Result<Tensor> {
    let ids = scorer::batch_tensor(reference_seqs, target.model.device())?;
    let log_p = scorer::sequence_log_probs(target.model, &ids, target.prompt_len(), target.n_vocab)?;
    Ok(log_p.mean_all()?.neg()?)
}

/// `mean(-log p (sg(log p) + 1))`, whose gradient is the entropy gradient.
fn entropy_term(target: &Target<'_>, model_seqs: &[Vec<u32>]) -> Result<Tensor> {
    let ids = scorer::batch_tensor(model_seqs, target.model.device())?;
    let log_p = scorer::sequence_log_probs(target.model, &ids, target.prompt_len(), target.n_vocab)?;
    let weight = (log_p.detach() + 1.0)?;
    Ok((log_p.neg()? * weight)?.mean(D::Minus1)?)
}
