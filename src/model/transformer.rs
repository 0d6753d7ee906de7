//! Small causal transformer.
//!
//! One architecture serves three roles: the base model `p`, the learned twist
//! network `psi` (head width = vocab) and the RL baseline (head width = 1).
//!
//! ## Architecture
//!
//! ```text
//! Token IDs [N, L]
//!       │
//!       ▼
//! ┌───────────────┐
//! │  Embedding    │  vocab_size → hidden_size
//! └───────────────┘
//!       │
//!       ▼
//! ┌───────────────┐
//! │ DecoderBlock  │ × num_hidden_layers
//! └───────────────┘
//!       │
//!       ▼
//! ┌───────────────┐
//! │   RMSNorm     │
//! └───────────────┘
//!       │
//!       ▼
//! ┌───────────────┐
//! │     Head      │  hidden_size → output_size
//! └───────────────┘
//!       │
//!       ▼
//! Outputs [N, L, output_size]
//! ```

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, linear, Embedding, Linear, VarBuilder, VarMap};
use rand_distr::{Distribution, Normal};

use super::decoder::DecoderBlock;
use super::norm::RmsNorm;
use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::rng::PrngKey;
use crate::scorer::CausalScorer;

/// Causal transformer whose parameters live in an owned [`VarMap`].
pub struct CausalTransformer {
    embed_tokens: Embedding,
    layers: Vec<DecoderBlock>,
    norm: RmsNorm,
    head: Linear,
    varmap: VarMap,
    config: ModelConfig,
    device: Device,
}

impl CausalTransformer {
    /// Builds the network and initializes it deterministically from
    /// `config.init_seed`.
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let embed_tokens = embedding(config.vocab_size, config.hidden_size, vb.pp("embed_tokens"))?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| DecoderBlock::new(config, vb.pp(format!("layers.{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let norm = RmsNorm::new(config.hidden_size, config.rms_norm_eps, vb.pp("norm"))?;
        let head = linear(config.hidden_size, config.output_size(), vb.pp("head"))?;

        initialize(&varmap, config.init_seed)?;
        tracing::debug!(
            vocab_size = config.vocab_size,
            output_size = config.output_size(),
            hidden_size = config.hidden_size,
            layers = config.num_hidden_layers,
            params = varmap.all_vars().iter().map(|v| v.elem_count()).sum::<usize>(),
            "Causal transformer initialized"
        );

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            head,
            varmap,
            config: config.clone(),
            device: device.clone(),
        })
    }

    /// Parameter store, for optimizers and gradient lookups.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Architecture this network was built from.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Returns the number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

impl CausalScorer for CausalTransformer {
    /// # Arguments
    ///
    /// * `input_ids` - Token IDs [batch, seq_len] (u32)
    ///
    /// # Returns
    ///
    /// Head outputs for all positions [batch, seq_len, output_size]
    fn forward_all(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        let mut hidden_states = self.embed_tokens.forward(input_ids)?;
        for layer in &self.layers {
            hidden_states = layer.forward(&hidden_states)?;
        }
        let hidden_states = self.norm.forward(&hidden_states)?;
        self.head.forward(&hidden_states)
    }

    fn output_size(&self) -> usize {
        self.config.output_size()
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn max_seq_len(&self) -> usize {
        self.config.max_position_embeddings
    }
}

/// Overwrites every variable in name order from one seeded stream.
///
/// Norm gains start at one, biases at zero, matrices at
/// `Normal(0, sqrt(2 / (rows + cols)))`.
fn initialize(varmap: &VarMap, seed: u64) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::Config("parameter store lock poisoned".into()))?;
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    let mut rng = PrngKey::new(seed).into_rng();
    for name in names {
        let var = &data[name];
        let dims = var.dims().to_vec();
        let count = var.elem_count();
        let values: Vec<f32> = if name.contains("norm") {
            vec![1.0; count]
        } else if name.ends_with("bias") {
            vec![0.0; count]
        } else {
            let std = match dims.as_slice() {
                [rows, cols] => (2.0 / (rows + cols) as f64).sqrt(),
                _ => 0.02,
            };
            let normal = Normal::new(0.0, std).map_err(|e| Error::Config(e.to_string()))?;
            (0..count).map(|_| normal.sample(&mut rng) as f32).collect()
        };
        var.set(&Tensor::from_vec(values, dims, var.device())?.to_dtype(var.dtype())?)?;
    }
    Ok(())
}
