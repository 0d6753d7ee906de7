//! Horizon drivers.

use crate::error::{Error, Result};
use crate::logspace::{effective_sample_size, log_sum_exp};
use crate::rng::PrngKey;
use crate::sampler::propose;

use super::resample::{reindex, resample, should_resample};
use super::state::SmcState;
use super::{SmcContext, SmcOutput};

fn check_context(ctx: &SmcContext<'_>) -> Result<()> {
    ctx.config.validate()?;
    if ctx.target.prompt.len() + ctx.config.output_len > ctx.target.max_len() {
        return Err(Error::InvalidArgument(format!(
            "prompt of {} tokens plus {} generated exceeds the model context of {}",
            ctx.target.prompt.len(),
            ctx.config.output_len,
            ctx.target.max_len()
        )));
    }
    Ok(())
}

/// Folds [`SmcState::step`] over `t = 0..output_len`.
pub fn run_smc(key: PrngKey, ctx: &SmcContext<'_>) -> Result<(SmcOutput, PrngKey)> {
    check_context(ctx)?;
    let horizon = ctx.config.output_len;
    let n = ctx.config.n_particles;

    let init = (SmcState::initial(ctx.target.prompt, n), Vec::new(), Vec::new(), key);
    let (state, history, log_weights, key) = (0..horizon).try_fold(
        init,
        |(state, mut history, _, key), t| -> Result<_> {
            let (state, out, key) = state.step(ctx, key)?;
            if ctx.config.keep_history && t + 1 < horizon {
                history.push(state.sequences.clone());
            }
            Ok((state, history, out.log_weights, key))
        },
    )?;

    tracing::debug!(n, horizon, log_z_hat = state.log_z_hat, "SMC run finished");
    Ok((
        SmcOutput {
            sequences: state.sequences,
            log_z_hat: state.log_z_hat,
            log_weights,
            history,
        },
        key,
    ))
}

/// Plain loop over flat arrays, consuming keys exactly like [`run_smc`].
///
/// Exists to cross-check the step function; results are bit-identical.
pub fn run_smc_reference(key: PrngKey, ctx: &SmcContext<'_>) -> Result<(SmcOutput, PrngKey)> {
    check_context(ctx)?;
    let target = ctx.target;
    let horizon = ctx.config.output_len;
    let n = ctx.config.n_particles;

    let mut key = key;
    let mut sequences = vec![target.prompt.to_vec(); n];
    let mut log_w = vec![0.0f32; n];
    let mut log_gamma = vec![0.0f32; n];
    let mut log_p = vec![0.0f32; n];
    let mut log_z_hat = 0.0f32;
    let mut history = Vec::new();
    let mut last_weights = Vec::new();

    for t in 0..horizon {
        let twist = ctx.step_twist(t);
        let (proposal, next) = propose(
            key,
            target.model,
            twist,
            &sequences,
            target.prompt_len(),
            target.n_vocab,
        )?;
        key = next;

        let prev_w = log_w.clone();
        for i in 0..n {
            sequences[i].push(proposal.tokens[i]);
            log_p[i] += proposal.log_p[i];
            let gamma = log_p[i] + proposal.log_twist[i];
            let log_q = proposal.log_p[i] + proposal.log_twist[i];
            let log_alpha = gamma - log_gamma[i] - log_q + proposal.log_z[i];
            log_gamma[i] = gamma;
            if log_w[i] != f32::NEG_INFINITY {
                log_w[i] += log_alpha;
            }
        }

        let total = log_sum_exp(&log_w);
        if !total.is_finite() {
            return Err(Error::DegenerateWeights);
        }
        log_z_hat += total - log_sum_exp(&prev_w);
        last_weights = log_w.clone();

        if should_resample(ctx.config.resample, effective_sample_size(&log_w), n) {
            let (ancestors, next) = resample(key, &log_w)?;
            key = next;
            sequences = reindex(&sequences, &ancestors);
            log_gamma = reindex(&log_gamma, &ancestors);
            log_p = reindex(&log_p, &ancestors);
            log_w = vec![0.0; n];
        }
        if ctx.config.keep_history && t + 1 < horizon {
            history.push(sequences.clone());
        }
    }

    Ok((
        SmcOutput {
            sequences,
            log_z_hat,
            log_weights: last_weights,
            history,
        },
        key,
    ))
}
