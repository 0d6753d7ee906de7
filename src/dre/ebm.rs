//! Energy-based twist loss.

use candle_core::Tensor;

use super::{intermediate_twists, require_intermediate_steps};
use crate::config::SmcConfig;
use crate::error::Result;
use crate::rng::PrngKey;
use crate::scorer::{self, CausalScorer};
use crate::smc::{run_smc, SmcContext, Target};
use crate::twist::Twist;

/// `-mean_t[mean psi(sigma prefix_t) - mean psi(history_t)]`.
///
/// One SMC pass supplies both sets: its final particles approximate sigma
/// and its retained history holds the learned-twist proposal at every
/// intermediate step.
pub fn ebm_loss(
    key: PrngKey,
    target: &Target<'_>,
    twist_net: &dyn CausalScorer,
    output_len: usize,
    n_samples: usize,
) -> Result<(Tensor, PrngKey)> {
    require_intermediate_steps(output_len)?;
    let twist = Twist::Learned(twist_net);
    let config = SmcConfig::new(n_samples, output_len).keep_history(true);
    let ctx = SmcContext::new(target, &twist, &config);
    let (smc, key) = run_smc(key, &ctx)?;

    // [T - 1]
    let sigma_means = intermediate_twists(twist_net, &smc.sequences, target.prompt_len(), target.n_vocab)?
        .mean(0)?;
    let history_means = smc
        .history
        .iter()
        .map(|prefixes| -> Result<Tensor> {
            let ids = scorer::batch_tensor(prefixes, twist_net.device())?;
            Ok(scorer::learned_twist_values(twist_net, &ids, target.n_vocab)?.mean_all()?)
        })
        .collect::<Result<Vec<_>>>()?;
    let history_means = Tensor::stack(&history_means, 0)?;

    Ok(((sigma_means - history_means)?.mean_all()?.neg()?, key))
}
