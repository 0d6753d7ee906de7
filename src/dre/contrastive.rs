//! Contrastive (binary-classifier) twist loss.

use candle_core::Tensor;

use super::{intermediate_twists, log_sigmoid, require_intermediate_steps};
use crate::config::SmcConfig;
use crate::error::Result;
use crate::rng::PrngKey;
use crate::sampler::sample_model;
use crate::scorer::CausalScorer;
use crate::smc::{run_smc, SmcContext, Target};
use crate::twist::Twist;

/// `-mean_t[mean log sigmoid(psi(sigma)) + mean log sigmoid(-psi(p))]`.
///
/// Sigma samples come from SMC with terminal substitution; negatives are
/// plain model samples. The terminal step is never scored.
pub fn contrastive_loss(
    key: PrngKey,
    target: &Target<'_>,
    twist_net: &dyn CausalScorer,
    output_len: usize,
    n_samples: usize,
) -> Result<(Tensor, PrngKey)> {
    require_intermediate_steps(output_len)?;
    let twist = Twist::Learned(twist_net);
    let config = SmcConfig::new(n_samples, output_len);
    let ctx = SmcContext::new(target, &twist, &config);

    let (sigma, key) = run_smc(key, &ctx)?;
    let (model_samples, key) = sample_model(
        key,
        target.model,
        target.prompt,
        output_len,
        n_samples,
        target.n_vocab,
    )?;

    let psi_sigma = intermediate_twists(twist_net, &sigma.sequences, target.prompt_len(), target.n_vocab)?;
    let psi_model = intermediate_twists(twist_net, &model_samples, target.prompt_len(), target.n_vocab)?;

    // Equal counts per step, so the flat mean is the mean over steps
    let positive = log_sigmoid(&psi_sigma)?.mean_all()?;
    let negative = log_sigmoid(&psi_model.neg()?)?.mean_all()?;
    Ok(((positive + negative)?.neg()?, key))
}
