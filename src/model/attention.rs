//! Causal multi-head self-attention with rotary position embeddings.
//!
//! Every forward pass sees the whole prefix at once; there is no KV cache
//! because particle prefixes are reshuffled by resampling between steps.

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

use super::rope::RotaryEmbedding;

/// Multi-head causal self-attention.
#[derive(Debug, Clone)]
pub struct CausalSelfAttention {
    /// Query projection [hidden_size] -> [num_heads * head_dim].
    q_proj: Linear,
    /// Key projection [hidden_size] -> [num_heads * head_dim].
    k_proj: Linear,
    /// Value projection [hidden_size] -> [num_heads * head_dim].
    v_proj: Linear,
    /// Output projection [num_heads * head_dim] -> [hidden_size].
    o_proj: Linear,
    /// Rotary position embeddings.
    rotary_emb: RotaryEmbedding,
    /// Number of heads.
    num_heads: usize,
    /// Dimension per head.
    head_dim: usize,
    /// Scaling factor for attention scores.
    scale: f64,
}

impl CausalSelfAttention {
    /// Creates the attention block from a VarBuilder.
    ///
    /// # Arguments
    ///
    /// * `hidden_size` - Model hidden dimension
    /// * `num_heads` - Number of attention heads
    /// * `max_seq_len` - Maximum sequence length for RoPE
    /// * `rope_theta` - RoPE frequency base
    /// * `vb` - VarBuilder owning the projection weights
    pub fn new(
        hidden_size: usize,
        num_heads: usize,
        max_seq_len: usize,
        rope_theta: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let head_dim = hidden_size / num_heads;
        let q_proj = linear_no_bias(hidden_size, num_heads * head_dim, vb.pp("q_proj"))?;
        let k_proj = linear_no_bias(hidden_size, num_heads * head_dim, vb.pp("k_proj"))?;
        let v_proj = linear_no_bias(hidden_size, num_heads * head_dim, vb.pp("v_proj"))?;
        let o_proj = linear_no_bias(num_heads * head_dim, hidden_size, vb.pp("o_proj"))?;

        let rotary_emb =
            RotaryEmbedding::new(head_dim, max_seq_len, rope_theta, vb.dtype(), vb.device())?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            rotary_emb,
            num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    /// Returns the number of heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Forward pass over a full prefix.
    ///
    /// # Arguments
    ///
    /// * `hidden_states` - Input tensor [batch, seq_len, hidden_size]
    ///
    /// # Returns
    ///
    /// Output tensor [batch, seq_len, hidden_size]
    pub fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = hidden_states.dims3()?;

        let q = self.q_proj.forward(hidden_states)?;
        let k = self.k_proj.forward(hidden_states)?;
        let v = self.v_proj.forward(hidden_states)?;

        // [batch, seq_len, num_heads, head_dim]
        let q = q.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?;
        let k = k.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?;
        let v = v.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?;

        let (q, k) = self.rotary_emb.apply(&q, &k)?;

        // [batch, num_heads, seq_len, head_dim]
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;

        let attn_weights = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? * self.scale)?;
        let mask = causal_mask(seq_len, q.dtype(), q.device())?;
        let attn_weights = attn_weights.broadcast_add(&mask)?;
        let attn_weights = candle_nn::ops::softmax(&attn_weights, D::Minus1)?;

        let attn_output = attn_weights.matmul(&v)?;
        let attn_output = attn_output.transpose(1, 2)?.contiguous()?.reshape((
            batch_size,
            seq_len,
            self.num_heads * self.head_dim,
        ))?;

        self.o_proj.forward(&attn_output)
    }
}

/// Additive mask [1, 1, seq_len, seq_len]: 0 on and below the diagonal, -inf above.
pub fn causal_mask(seq_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)
}
