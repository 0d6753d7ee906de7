//! Twisted sequential Monte Carlo.
//!
//! ## Step state machine
//!
//! ```text
//! SmcState(t) ──propose──► tokens, log p, psi, Z
//!      │                        │
//!      │          log_gamma = log_p_acc + psi(new prefix)
//!      │          log_alpha = log_gamma - log_gamma_prev - log_q + Z
//!      │                        │
//!      │                 log_w += log_alpha
//!      │          log_Z_hat += lse(log_w) - lse(log_w_prev)
//!      │                        │
//!      └────────────── resample? (ResampleMode) ──► SmcState(t+1)
//! ```
//!
//! On the last step the terminal potential replaces the learned twist when
//! `use_final_twist` is set. [`run_smc`] folds [`SmcState::step`] over the
//! horizon; [`run_smc_reference`] spells the same recursion out as a plain
//! loop.

pub mod driver;
pub mod resample;
pub mod state;

use crate::config::SmcConfig;
use crate::error::{Error, Result};
use crate::exact::ExactTable;
use crate::rng::PrngKey;
use crate::scorer::CausalScorer;
use crate::twist::Twist;

pub use driver::{run_smc, run_smc_reference};
pub use resample::{resample, should_resample};
pub use state::{SmcState, StepOutput};

/// The reward-tilted target `sigma(s) ∝ p(s | prompt) * phi(s)`.
pub struct Target<'a> {
    /// Base model `p`.
    pub model: &'a dyn CausalScorer,
    /// Terminal potential `log phi`.
    pub terminal: &'a Twist<'a>,
    /// Prompt shared by all particles.
    pub prompt: &'a [u32],
    /// Vocabulary size.
    pub n_vocab: usize,
}

impl<'a> Target<'a> {
    /// Checks the prompt and the model head against the vocabulary.
    pub fn new(
        model: &'a dyn CausalScorer,
        terminal: &'a Twist<'a>,
        prompt: &'a [u32],
        n_vocab: usize,
    ) -> Result<Self> {
        if prompt.is_empty() {
            return Err(Error::InvalidArgument("prompt must not be empty".into()));
        }
        if let Some(&bad) = prompt.iter().find(|&&t| t as usize >= n_vocab) {
            return Err(Error::InvalidArgument(format!(
                "prompt token {bad} outside vocabulary of {n_vocab}"
            )));
        }
        if model.output_size() != n_vocab {
            return Err(Error::ShapeMismatch {
                what: "model vocabulary",
                expected: n_vocab,
                actual: model.output_size(),
            });
        }
        Ok(Self {
            model,
            terminal,
            prompt,
            n_vocab,
        })
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt.len()
    }

    /// Longest sequence the base model accepts.
    pub fn max_len(&self) -> usize {
        self.model.max_seq_len()
    }
}

/// Everything a step needs besides the state and a key.
pub struct SmcContext<'a> {
    pub target: &'a Target<'a>,
    /// Twist used on non-final steps.
    pub twist: &'a Twist<'a>,
    pub config: &'a SmcConfig,
}

impl<'a> SmcContext<'a> {
    pub fn new(target: &'a Target<'a>, twist: &'a Twist<'a>, config: &'a SmcConfig) -> Self {
        Self {
            target,
            twist,
            config,
        }
    }

    /// Twist applied when generating token `t` (0-based).
    pub fn step_twist(&self, t: usize) -> &'a Twist<'a> {
        if t + 1 == self.config.output_len && self.config.use_final_twist {
            self.target.terminal
        } else {
            self.twist
        }
    }
}

/// Result of a full SMC run.
#[derive(Debug, Clone, PartialEq)]
pub struct SmcOutput {
    /// Final particle sequences (prompt included).
    pub sequences: Vec<Vec<u32>>,
    /// Running log-evidence estimate.
    pub log_z_hat: f32,
    /// Log-weights of the last step, before its resampling.
    pub log_weights: Vec<f32>,
    /// Resampled sequences after each non-final step, when requested.
    pub history: Vec<Vec<Vec<u32>>>,
}

/// Where samples approximating sigma come from.
#[derive(Clone, Copy)]
pub enum SamplingMode<'t> {
    /// Run the particle filter.
    Smc,
    /// Draw exactly from an enumerated table.
    ExactSigma(&'t ExactTable),
}

/// Runs SMC, or bypasses it with exact sigma samples.
pub fn smc_procedure(
    key: PrngKey,
    ctx: &SmcContext<'_>,
    mode: SamplingMode<'_>,
) -> Result<(SmcOutput, PrngKey)> {
    match mode {
        SamplingMode::Smc => run_smc(key, ctx),
        SamplingMode::ExactSigma(table) => {
            let n = ctx.config.n_particles;
            let (sequences, key) = table.sample(key, n)?;
            Ok((
                SmcOutput {
                    sequences,
                    log_z_hat: table.log_z,
                    log_weights: vec![0.0; n],
                    history: Vec::new(),
                },
                key,
            ))
        }
    }
}
