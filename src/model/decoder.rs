//! Pre-norm decoder block.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::attention::CausalSelfAttention;
use super::mlp::SwiGluMlp;
use super::norm::RmsNorm;
use crate::config::ModelConfig;

/// One transformer block.
///
/// ```text
/// x ──► input_norm ──► self_attn ──► + ──► post_attn_norm ──► mlp ──► + ──► out
/// │                                  ▲  │                              ▲
/// └──────────────────────────────────┘  └──────────────────────────────┘
/// ```
#[derive(Debug, Clone)]
pub struct DecoderBlock {
    input_layernorm: RmsNorm,
    self_attn: CausalSelfAttention,
    post_attention_layernorm: RmsNorm,
    mlp: SwiGluMlp,
}

impl DecoderBlock {
    /// Creates a block from a VarBuilder.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            input_layernorm: RmsNorm::new(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            self_attn: CausalSelfAttention::new(
                config.hidden_size,
                config.num_attention_heads,
                config.max_position_embeddings,
                config.rope_theta,
                vb.pp("self_attn"),
            )?,
            post_attention_layernorm: RmsNorm::new(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
            mlp: SwiGluMlp::new(config.hidden_size, config.intermediate_size, vb.pp("mlp"))?,
        })
    }

    /// Forward pass: [batch, seq_len, hidden] -> [batch, seq_len, hidden].
    pub fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let residual = hidden_states;
        let h = self.input_layernorm.forward(hidden_states)?;
        let h = (residual + self.self_attn.forward(&h)?)?;

        let residual = &h;
        let out = self.post_attention_layernorm.forward(&h)?;
        residual + self.mlp.forward(&out)?
    }
}
