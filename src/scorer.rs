//! Sequence scorer adapter.
//!
//! Wraps a causal network and turns its `[N, L, V]` outputs into the
//! quantities the sampler and losses need:
//!
//! - next-token log-probabilities of a prefix batch (host rows)
//! - per-token and whole-sequence log-probabilities (differentiable)
//! - learned-twist values of prefixes (differentiable)
//!
//! Every entry point checks the output width against the configured
//! vocabulary and fails with [`Error::ShapeMismatch`] otherwise.

use candle_core::{DType, Device, Tensor, D};

use crate::error::{Error, Result};

/// A causal network: output at position `j` depends only on tokens `0..=j`.
pub trait CausalScorer {
    /// Outputs for all positions, [batch, seq_len, output_size].
    fn forward_all(&self, input_ids: &Tensor) -> candle_core::Result<Tensor>;

    /// Width of the last output dimension.
    fn output_size(&self) -> usize;

    /// Device the parameters live on.
    fn device(&self) -> &Device;

    /// Longest sequence the network accepts.
    fn max_seq_len(&self) -> usize;
}

/// Stacks equal-length sequences into a u32 tensor [N, L].
pub fn batch_tensor(seqs: &[Vec<u32>], device: &Device) -> Result<Tensor> {
    let len = seqs.first().map(|s| s.len()).ok_or_else(|| {
        Error::InvalidArgument("cannot score an empty batch".into())
    })?;
    if let Some(bad) = seqs.iter().find(|s| s.len() != len) {
        return Err(Error::ShapeMismatch {
            what: "sequence length",
            expected: len,
            actual: bad.len(),
        });
    }
    let flat: Vec<u32> = seqs.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (seqs.len(), len), device)?)
}

/// Runs the network and checks its output width.
fn checked_forward(model: &dyn CausalScorer, ids: &Tensor, vocab: usize) -> Result<Tensor> {
    let out = model.forward_all(ids)?;
    let (_, _, width) = out.dims3()?;
    if width != vocab {
        return Err(Error::ShapeMismatch {
            what: "scorer vocabulary",
            expected: vocab,
            actual: width,
        });
    }
    Ok(out)
}

/// Raw outputs at the last position of every prefix, [N][vocab].
pub fn last_position_outputs(
    model: &dyn CausalScorer,
    prefixes: &[Vec<u32>],
    vocab: usize,
) -> Result<Vec<Vec<f32>>> {
    let ids = batch_tensor(prefixes, model.device())?;
    let out = checked_forward(model, &ids, vocab)?;
    let len = out.dim(1)?;
    let last = out.narrow(1, len - 1, 1)?.squeeze(1)?;
    Ok(last.to_dtype(DType::F32)?.to_vec2()?)
}

/// `log p(v | prefix)` for every prefix and token, [N][vocab].
pub fn next_token_log_probs(
    model: &dyn CausalScorer,
    prefixes: &[Vec<u32>],
    vocab: usize,
) -> Result<Vec<Vec<f32>>> {
    let ids = batch_tensor(prefixes, model.device())?;
    let out = checked_forward(model, &ids, vocab)?;
    let len = out.dim(1)?;
    let last = out.narrow(1, len - 1, 1)?.squeeze(1)?;
    let log_probs = candle_nn::ops::log_softmax(&last, D::Minus1)?;
    Ok(log_probs.to_dtype(DType::F32)?.to_vec2()?)
}

/// Selects `values[n, positions..positions+count, ids[n, positions+1..]]`.
///
/// `values` is [N, L, V]; the result is [N, count] where entry `j` is the
/// output at position `start + j` indexed by the token at `start + j + 1`.
fn gather_next_tokens(values: &Tensor, ids: &Tensor, start: usize, count: usize) -> Result<Tensor> {
    let selected = values.narrow(1, start, count)?;
    let tokens = ids.narrow(1, start + 1, count)?.contiguous()?.unsqueeze(2)?;
    Ok(selected.contiguous()?.gather(&tokens, 2)?.squeeze(2)?)
}

/// `log p(s_t | s_{<t})` for each generated token, [N, T]. Differentiable.
pub fn token_log_probs(
    model: &dyn CausalScorer,
    seqs: &Tensor,
    prompt_len: usize,
    vocab: usize,
) -> Result<Tensor> {
    let (_, len) = seqs.dims2()?;
    if prompt_len == 0 || prompt_len >= len {
        return Err(Error::InvalidArgument(format!(
            "prompt length {prompt_len} must be in 1..{len}"
        )));
    }
    let out = checked_forward(model, seqs, vocab)?;
    let log_probs = candle_nn::ops::log_softmax(&out, D::Minus1)?;
    gather_next_tokens(&log_probs, seqs, prompt_len - 1, len - prompt_len)
}

/// `log p(s_{prompt..} | prompt)` per sequence, [N]. Differentiable.
pub fn sequence_log_probs(
    model: &dyn CausalScorer,
    seqs: &Tensor,
    prompt_len: usize,
    vocab: usize,
) -> Result<Tensor> {
    Ok(token_log_probs(model, seqs, prompt_len, vocab)?.sum(1)?)
}

/// Learned twist of every prefix `s_{1:t}` for `t` in `prompt_len+1..=L`,
/// [N, L - prompt_len]. Column `j` is the value of the prefix holding `j + 1`
/// generated tokens. Differentiable.
pub fn learned_twist_all_prefixes(
    twist: &dyn CausalScorer,
    seqs: &Tensor,
    prompt_len: usize,
    vocab: usize,
) -> Result<Tensor> {
    let (_, len) = seqs.dims2()?;
    if prompt_len == 0 || prompt_len >= len {
        return Err(Error::InvalidArgument(format!(
            "prompt length {prompt_len} must be in 1..{len}"
        )));
    }
    let out = checked_forward(twist, seqs, vocab)?;
    gather_next_tokens(&out, seqs, prompt_len - 1, len - prompt_len)
}

/// Learned twist of the whole sequence (output at `L-2` indexed by `s_L`), [N].
pub fn learned_twist_values(twist: &dyn CausalScorer, seqs: &Tensor, vocab: usize) -> Result<Tensor> {
    let (_, len) = seqs.dims2()?;
    if len < 2 {
        return Err(Error::InvalidArgument(
            "learned twist needs at least one token before the scored one".into(),
        ));
    }
    let out = checked_forward(twist, seqs, vocab)?;
    Ok(gather_next_tokens(&out, seqs, len - 2, 1)?.squeeze(1)?)
}
