//! Density-ratio estimation losses for learned twists.
//!
//! Each loss fits the twist network toward `log(sigma / p)` at every
//! intermediate prefix length `1..T` without touching the partition function:
//!
//! - [`contrastive_loss`]: per-step binary classifier between SMC samples
//!   approximating sigma and plain model samples
//! - [`ebm_loss`]: energy-based maximum likelihood against the SMC
//!   intermediate particle history
//! - [`analytic_mse_loss`]: squared error against exact optimal twists
//!
//! Losses are scalar tensors; [`twist_loss_and_grads`] runs the backward pass
//! and hands the gradients to the caller.

mod analytic;
mod contrastive;
mod ebm;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, D};

use crate::config::DreType;
use crate::error::{Error, Result};
use crate::exact::ExactTable;
use crate::rng::PrngKey;
use crate::scorer::{self, CausalScorer};
use crate::smc::Target;

pub use analytic::analytic_mse_loss;
pub use contrastive::contrastive_loss;
pub use ebm::ebm_loss;

/// `log(sigmoid(x)) = -(relu(-x) + log(1 + exp(-|x|)))`, stable for large `|x|`.
pub fn log_sigmoid(x: &Tensor) -> candle_core::Result<Tensor> {
    let soft = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    (x.neg()?.relu()? + soft)?.neg()
}

/// Learned twist values of the intermediate prefixes (1..T generated tokens),
/// [N, T - 1].
fn intermediate_twists(
    twist_net: &dyn CausalScorer,
    seqs: &[Vec<u32>],
    prompt_len: usize,
    n_vocab: usize,
) -> Result<Tensor> {
    let ids = scorer::batch_tensor(seqs, twist_net.device())?;
    let all = scorer::learned_twist_all_prefixes(twist_net, &ids, prompt_len, n_vocab)?;
    let steps = all.dim(D::Minus1)?;
    Ok(all.narrow(1, 0, steps - 1)?)
}

fn require_intermediate_steps(output_len: usize) -> Result<()> {
    if output_len < 2 {
        return Err(Error::InvalidArgument(format!(
            "twist losses need at least two generated tokens, got {output_len}"
        )));
    }
    Ok(())
}

/// Evaluates the configured loss and backpropagates it.
///
/// Analytic losses need `exact`; the sampled losses draw `n_samples`
/// particles per set.
pub fn twist_loss_and_grads(
    dre_type: DreType,
    key: PrngKey,
    target: &Target<'_>,
    twist_net: &dyn CausalScorer,
    output_len: usize,
    n_samples: usize,
    exact: Option<&ExactTable>,
) -> Result<(f32, GradStore, PrngKey)> {
    let (loss, key) = match dre_type {
        DreType::Contrastive => contrastive_loss(key, target, twist_net, output_len, n_samples)?,
        DreType::Ebm => ebm_loss(key, target, twist_net, output_len, n_samples)?,
        DreType::AnalyticMseRelative | DreType::AnalyticMseAbsolute => {
            let table = exact.ok_or_else(|| {
                Error::UnsupportedConfiguration("analytic MSE needs an exact table".into())
            })?;
            let relative = dre_type == DreType::AnalyticMseRelative;
            (analytic_mse_loss(table, twist_net, relative)?, key)
        }
    };
    let value = loss.to_scalar::<f32>()?;
    let grads = loss.backward()?;
    Ok((value, grads, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn test_device() -> Device {
        Device::Cpu
    }

    #[test]
    fn test_log_sigmoid_matches_naive_and_is_stable() {
        let x = Tensor::new(&[-200.0f32, -2.0, 0.0, 3.0, 200.0], &test_device()).unwrap();
        let y: Vec<f32> = log_sigmoid(&x).unwrap().to_vec1().unwrap();

        assert!((y[0] + 200.0).abs() < 1e-3);
        assert!((y[1] - (1.0 / (1.0 + 2f32.exp())).ln()).abs() < 1e-5);
        assert!((y[2] + 2f32.ln()).abs() < 1e-6);
        assert!((y[3] - (1.0 / (1.0 + (-3f32).exp())).ln()).abs() < 1e-5);
        assert!(y[4].abs() < 1e-6);
    }
}
