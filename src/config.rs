//! Configuration types for twisted SMC.
//!
//! All reward magnitudes, token lists and limits live here as plain values
//! that are handed to components at construction time.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::reward::RewardModel;
use crate::twist::Twist;

/// Causal transformer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size (input tokens).
    pub vocab_size: usize,
    /// Output width of the head. `None` means `vocab_size`.
    #[serde(default)]
    pub output_size: Option<usize>,
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Intermediate dimension (MLP).
    pub intermediate_size: usize,
    /// Number of transformer layers.
    pub num_hidden_layers: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// RMSNorm epsilon.
    pub rms_norm_eps: f64,
    /// RoPE theta.
    pub rope_theta: f64,
    /// Maximum sequence length (prompt + output).
    pub max_position_embeddings: usize,
    /// Seed for deterministic parameter initialization.
    pub init_seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 2,
            output_size: None,
            hidden_size: 32,
            intermediate_size: 64,
            num_hidden_layers: 1,
            num_attention_heads: 2,
            rms_norm_eps: 1e-6,
            rope_theta: 10000.0,
            max_position_embeddings: 64,
            init_seed: 0,
        }
    }
}

impl ModelConfig {
    /// Head dimension (hidden_size / num_attention_heads).
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Width of the output head.
    pub fn output_size(&self) -> usize {
        self.output_size.unwrap_or(self.vocab_size)
    }

    /// Same architecture with a scalar head, as used by an RL baseline.
    pub fn scalar_head(&self) -> Self {
        Self {
            output_size: Some(1),
            ..self.clone()
        }
    }

    /// Same architecture with a different initialization seed.
    pub fn with_seed(&self, init_seed: u64) -> Self {
        Self {
            init_seed,
            ..self.clone()
        }
    }

    /// Checks the architecture is buildable.
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.output_size() == 0 {
            return Err(Error::Config("vocab and output size must be non-zero".into()));
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(Error::Config(format!(
                "hidden_size {} is not divisible by {} heads",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(Error::Config("rotary embedding needs an even head dimension".into()));
        }
        Ok(())
    }
}

/// When the SMC driver resamples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResampleMode {
    /// Resample after every step.
    Always,
    /// Never resample; weights accumulate over the horizon.
    Never,
    /// Resample when ESS drops below `ess_fraction * N`.
    Adaptive { ess_fraction: f32 },
}

/// SMC driver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmcConfig {
    /// Number of particles N.
    pub n_particles: usize,
    /// Number of tokens generated after the prompt (T).
    pub output_len: usize,
    /// Resampling policy.
    pub resample: ResampleMode,
    /// Substitute the terminal potential for the learned twist on the last step.
    pub use_final_twist: bool,
    /// Retain the resampled particle set after every non-final step.
    pub keep_history: bool,
}

impl Default for SmcConfig {
    fn default() -> Self {
        Self {
            n_particles: 1000,
            output_len: 5,
            resample: ResampleMode::Always,
            use_final_twist: true,
            keep_history: false,
        }
    }
}

impl SmcConfig {
    /// Creates a config with N particles over a horizon of T tokens.
    pub fn new(n_particles: usize, output_len: usize) -> Self {
        Self {
            n_particles,
            output_len,
            ..Default::default()
        }
    }

    /// Sets the resampling policy.
    pub fn resample(mut self, mode: ResampleMode) -> Self {
        self.resample = mode;
        self
    }

    /// Enables or disables terminal substitution.
    pub fn use_final_twist(mut self, enabled: bool) -> Self {
        self.use_final_twist = enabled;
        self
    }

    /// Enables or disables intermediate history retention.
    pub fn keep_history(mut self, enabled: bool) -> Self {
        self.keep_history = enabled;
        self
    }

    /// Rejects empty batches and horizons.
    pub fn validate(&self) -> Result<()> {
        if self.n_particles == 0 {
            return Err(Error::InvalidArgument("n_particles must be positive".into()));
        }
        if self.output_len == 0 {
            return Err(Error::InvalidArgument("output_len must be positive".into()));
        }
        if let ResampleMode::Adaptive { ess_fraction } = self.resample {
            if !(0.0..=1.0).contains(&ess_fraction) {
                return Err(Error::InvalidArgument(format!(
                    "ess_fraction {ess_fraction} outside [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

/// Density-ratio estimation objective used to fit the twist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DreType {
    /// Binary classifier between target and base-model samples.
    Contrastive,
    /// Energy-based maximum likelihood against the proposal history.
    Ebm,
    /// Mean-centered squared error against exact optimal twists.
    AnalyticMseRelative,
    /// Plain squared error against exact optimal twists.
    AnalyticMseAbsolute,
}

impl DreType {
    /// Whether the loss needs the exact enumeration engine.
    pub fn needs_enumeration(&self) -> bool {
        matches!(self, Self::AnalyticMseRelative | Self::AnalyticMseAbsolute)
    }
}

impl std::str::FromStr for DreType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "contrastive" | "sixo" => Ok(Self::Contrastive),
            "ebm" | "roger" => Ok(Self::Ebm),
            "analytic_mse_rel" | "analytic_mse_relative" => Ok(Self::AnalyticMseRelative),
            "analytic_mse_abs" | "analytic_mse_absolute" => Ok(Self::AnalyticMseAbsolute),
            other => Err(Error::Config(format!("unknown dre type: {other}"))),
        }
    }
}

/// Twist training configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Loss family.
    pub dre_type: DreType,
    /// Particles/samples drawn per loss evaluation.
    pub n_twist: usize,
    /// Base learning rate for AdamW.
    pub learning_rate: f64,
    /// Adam first-moment decay.
    pub beta1: f64,
    /// Adam second-moment decay.
    pub beta2: f64,
    /// Decoupled weight decay.
    pub weight_decay: f64,
    /// Number of optimizer steps.
    pub steps: usize,
    /// Linear warmup steps; 0 keeps the rate constant.
    pub warmup_steps: usize,
    /// Apply cosine decay after warmup.
    pub cosine_decay: bool,
    /// Steps between `info` log lines.
    pub log_interval: usize,
    /// Seed of the training key stream.
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            dre_type: DreType::Ebm,
            n_twist: 500,
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.0,
            steps: 100,
            warmup_steps: 0,
            cosine_decay: false,
            log_interval: 10,
            seed: 0,
        }
    }
}

/// Bounds on the exact enumeration engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExactLimits {
    /// Maximum number of complete sequences (vocab^output_len).
    pub max_sequences: usize,
}

impl Default for ExactLimits {
    fn default() -> Self {
        Self {
            max_sequences: 1 << 16,
        }
    }
}

impl ExactLimits {
    /// Rejects horizons whose full tree exceeds the limit.
    pub fn check(&self, n_vocab: usize, output_len: usize) -> Result<usize> {
        let total = u32::try_from(output_len)
            .ok()
            .and_then(|t| n_vocab.checked_pow(t))
            .filter(|&n| n <= self.max_sequences);
        total.ok_or_else(|| {
            Error::UnsupportedConfiguration(format!(
                "exact enumeration of {n_vocab}^{output_len} sequences exceeds limit {}",
                self.max_sequences
            ))
        })
    }
}

/// Reward magnitudes and token lists of the toy reward models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardConfig {
    /// One-bad reward for every non-penalized output.
    pub base_reward: f32,
    /// One-bad reward for the all-zero output; also the bad-word penalty.
    pub bad_reward: f32,
    /// Varied reward indexed by the number of 1-tokens in the output.
    pub varied_rewards: Vec<f32>,
    /// Bad-word baseline for any output.
    pub nonsense_reward: f32,
    /// Bad-word bonus for the desired answer.
    pub good_reward: f32,
    /// Bad-word bonus for the evasive answer.
    pub evasive_reward: f32,
    /// Ordered token vocabulary of the bad-word environment.
    pub token_list: Vec<String>,
    /// Desired output prefix.
    pub good_output: Vec<String>,
    /// Evasive output prefix.
    pub evasive_output: Vec<String>,
    /// Penalized token.
    pub bad_word: String,
}

impl Default for RewardConfig {
    fn default() -> Self {
        let words = |ws: &[&str]| ws.iter().map(|w| w.to_string()).collect::<Vec<_>>();
        Self {
            base_reward: 1.0,
            bad_reward: -10.0,
            varied_rewards: vec![-4.0, -3.0, -2.0, -1.0, 0.0, 1.0],
            nonsense_reward: 0.0,
            good_reward: 2.0,
            evasive_reward: 1.0,
            token_list: words(&[
                "what",
                "is",
                "the",
                "term",
                "for",
                "neutral_term",
                "bad_term",
                "unsure",
                "_",
            ]),
            good_output: words(&["neutral_term", "_"]),
            evasive_output: words(&["unsure", "_"]),
            bad_word: "bad_term".to_string(),
        }
    }
}

/// Which reward model defines the terminal potential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardKind {
    OneBad,
    Varied,
    BadWord,
}

/// Full experiment description, loadable from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Prompt token ids.
    pub prompt: Vec<u32>,
    /// Base model architecture.
    pub model: ModelConfig,
    /// Twist network architecture.
    pub twist_model: ModelConfig,
    /// SMC driver settings.
    pub smc: SmcConfig,
    /// Twist training settings.
    pub training: TrainingConfig,
    /// Reward model selection.
    pub reward_kind: RewardKind,
    /// Reward magnitudes and token lists.
    pub reward: RewardConfig,
    /// Inverse temperature of the terminal potential.
    pub beta: f32,
    /// Use `exp(beta * r)` instead of `exp(-beta * r)` as the potential.
    pub positive_reward: bool,
    /// Enumeration limits.
    pub exact: ExactLimits,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        let model = ModelConfig::default();
        Self {
            prompt: vec![0, 1, 0, 1],
            twist_model: model.with_seed(1),
            model,
            smc: SmcConfig::default(),
            training: TrainingConfig::default(),
            reward_kind: RewardKind::OneBad,
            reward: RewardConfig::default(),
            beta: 1.0,
            positive_reward: true,
            exact: ExactLimits::default(),
        }
    }
}

impl ExperimentConfig {
    /// Terminal potential for `reward` at inverse temperature `beta`, with
    /// the sign picked by `positive_reward`.
    pub fn terminal_twist<'a>(&self, reward: &'a RewardModel) -> Twist<'a> {
        if self.positive_reward {
            Twist::pos_beta_reward(reward, self.beta)
        } else {
            Twist::neg_beta_reward(reward, self.beta)
        }
    }

    /// Loads a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section and their consistency.
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.twist_model.validate()?;
        self.smc.validate()?;
        if self.prompt.is_empty() {
            return Err(Error::InvalidArgument("prompt must not be empty".into()));
        }
        if self.twist_model.output_size() != self.model.vocab_size {
            return Err(Error::ShapeMismatch {
                what: "twist output size",
                expected: self.model.vocab_size,
                actual: self.twist_model.output_size(),
            });
        }
        if let Some(&bad) = self.prompt.iter().find(|&&t| t as usize >= self.model.vocab_size) {
            return Err(Error::InvalidArgument(format!(
                "prompt token {bad} outside vocabulary of {}",
                self.model.vocab_size
            )));
        }
        if self.prompt.len() + self.smc.output_len > self.model.max_position_embeddings {
            return Err(Error::Config(
                "prompt + output exceeds max_position_embeddings".into(),
            ));
        }
        if self.training.dre_type.needs_enumeration() {
            self.exact.check(self.model.vocab_size, self.smc.output_len)?;
        }
        Ok(())
    }
}
