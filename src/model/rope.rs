//! Rotary position embeddings.
//!
//! Positions are encoded by rotating pairs of query/key features, so the
//! attention score between two tokens depends on their relative offset.
//!
//! Reference: <https://arxiv.org/abs/2104.09864>

use candle_core::{DType, Device, Result, Tensor};

/// Precomputed rotary tables.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// Cosine table [max_seq_len, head_dim].
    cos_cache: Tensor,
    /// Sine table [max_seq_len, head_dim].
    sin_cache: Tensor,
}

impl RotaryEmbedding {
    /// Builds cos/sin tables for positions `0..max_seq_len`.
    ///
    /// # Arguments
    ///
    /// * `dim` - Head dimension (must be even)
    /// * `max_seq_len` - Maximum sequence length to support
    /// * `theta` - Base frequency
    /// * `dtype` - Data type for the tables
    /// * `device` - Device to create tensors on
    pub fn new(
        dim: usize,
        max_seq_len: usize,
        theta: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        if dim % 2 != 0 {
            candle_core::bail!("rotary dimension must be even, got {dim}");
        }

        let half_dim = dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| 1.0 / theta.powf(2.0 * i as f64 / dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::new(inv_freq.as_slice(), device)?;

        let positions: Vec<f32> = (0..max_seq_len).map(|p| p as f32).collect();
        let positions = Tensor::new(positions.as_slice(), device)?.reshape((max_seq_len, 1))?;

        // [max_seq_len, dim/2] duplicated to [max_seq_len, dim]
        let freqs = positions.broadcast_mul(&inv_freq)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], 1)?;

        Ok(Self {
            cos_cache: freqs.cos()?.to_dtype(dtype)?,
            sin_cache: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    /// Maximum supported sequence length.
    pub fn max_seq_len(&self) -> usize {
        self.cos_cache.dims()[0]
    }

    /// Rotates query and key tensors [batch, seq_len, heads, head_dim].
    pub fn apply(&self, q: &Tensor, k: &Tensor) -> Result<(Tensor, Tensor)> {
        let (_, seq_len, _, _) = q.dims4()?;
        if seq_len > self.max_seq_len() {
            candle_core::bail!(
                "sequence length {seq_len} exceeds rotary table of {}",
                self.max_seq_len()
            );
        }

        // [1, seq_len, 1, dim]
        let cos = self.cos_cache.narrow(0, 0, seq_len)?.unsqueeze(0)?.unsqueeze(2)?;
        let sin = self.sin_cache.narrow(0, 0, seq_len)?.unsqueeze(0)?.unsqueeze(2)?;

        Ok((
            Self::rotate(q, &cos, &sin)?,
            Self::rotate(k, &cos, &sin)?,
        ))
    }

    /// `x * cos + rotate_half(x) * sin`, with `rotate_half([x1, x2]) = [-x2, x1]`.
    fn rotate(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let last = x.rank() - 1;
        let half = x.dim(last)? / 2;
        let x1 = x.narrow(last, 0, half)?;
        let x2 = x.narrow(last, half, half)?;
        let rotated = Tensor::cat(&[&x2.neg()?, &x1], last)?;
        x.broadcast_mul(cos)?.add(&rotated.broadcast_mul(sin)?)
    }
}
