//! RMS Normalization.
//!
//! Rescales inputs by their root mean square without centering.
//!
//! Reference: <https://arxiv.org/abs/1910.07467>

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;

/// RMS Normalization layer.
///
/// Formula: `output = (x / rms(x)) * weight`
/// where `rms(x) = sqrt(mean(x^2) + eps)`
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable gain [hidden_size].
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
}

impl RmsNorm {
    /// Creates a trainable RmsNorm whose gain starts at one.
    ///
    /// # Arguments
    ///
    /// * `hidden_size` - Size of the normalized dimension
    /// * `eps` - Small constant for numerical stability
    /// * `vb` - VarBuilder owning the gain variable
    pub fn new(hidden_size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(hidden_size, "weight", candle_nn::Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }

    /// Creates a frozen RmsNorm with unit gain.
    pub fn new_ones(hidden_size: usize, eps: f64, dtype: DType, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(hidden_size, dtype, device)?;
        Ok(Self { weight, eps })
    }

    /// Returns a reference to the gain tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Applies RMS normalization over the last dimension.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of shape [..., hidden_size]
    ///
    /// # Returns
    ///
    /// Normalized tensor of the same shape as input.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let variance = x.sqr()?.mean_keepdim(candle_core::D::Minus1)?;
        let rms = (variance + self.eps)?.sqrt()?;
        x.broadcast_div(&rms)?.broadcast_mul(&self.weight)
    }
}
