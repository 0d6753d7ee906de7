//! Twist training loop.
//!
//! Evaluates the configured density-ratio loss, applies AdamW to the twist
//! network's parameters and follows a warmup + cosine learning-rate schedule.

use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use crate::config::{ExactLimits, TrainingConfig};
use crate::dre::twist_loss_and_grads;
use crate::error::Result;
use crate::exact::ExactTable;
use crate::model::CausalTransformer;
use crate::rng::PrngKey;
use crate::smc::Target;

/// Learning rate at `step`.
///
/// Linear warmup over `warmup_steps`, then either constant or cosine decay
/// to zero at `total_steps`.
pub fn lr_schedule(base_lr: f64, warmup_steps: usize, total_steps: usize, step: usize, cosine: bool) -> f64 {
    if warmup_steps > 0 && step < warmup_steps {
        base_lr * (step + 1) as f64 / warmup_steps as f64
    } else if cosine {
        let decay_steps = total_steps.saturating_sub(warmup_steps).max(1);
        let progress = (step.saturating_sub(warmup_steps) as f64 / decay_steps as f64).min(1.0);
        base_lr * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
    } else {
        base_lr
    }
}

/// Fits a learned twist to a fixed target.
pub struct TwistTrainer<'a> {
    target: &'a Target<'a>,
    twist_net: &'a CausalTransformer,
    optimizer: AdamW,
    config: TrainingConfig,
    output_len: usize,
    exact: Option<ExactTable>,
    key: PrngKey,
    step: usize,
}

impl<'a> TwistTrainer<'a> {
    /// Creates a trainer over the twist network's parameters.
    ///
    /// Analytic losses enumerate the target here, so oversized horizons fail
    /// before any training work.
    pub fn new(
        target: &'a Target<'a>,
        twist_net: &'a CausalTransformer,
        output_len: usize,
        config: TrainingConfig,
        limits: &ExactLimits,
    ) -> Result<Self> {
        let exact = if config.dre_type.needs_enumeration() {
            Some(ExactTable::build(target, output_len, limits)?)
        } else {
            None
        };
        let params = ParamsAdamW {
            lr: lr_schedule(config.learning_rate, config.warmup_steps, config.steps, 0, config.cosine_decay),
            beta1: config.beta1,
            beta2: config.beta2,
            eps: 1e-8,
            weight_decay: config.weight_decay,
        };
        let optimizer = AdamW::new(twist_net.varmap().all_vars(), params)?;

        tracing::info!(
            dre_type = ?config.dre_type,
            lr = config.learning_rate,
            n_twist = config.n_twist,
            steps = config.steps,
            "Twist trainer ready"
        );
        Ok(Self {
            target,
            twist_net,
            optimizer,
            key: PrngKey::new(config.seed),
            config,
            output_len,
            exact,
            step: 0,
        })
    }

    /// Number of completed optimizer steps.
    pub fn step(&self) -> usize {
        self.step
    }

    /// The exact table, when the loss needed one.
    pub fn exact_table(&self) -> Option<&ExactTable> {
        self.exact.as_ref()
    }

    /// Continuation of the training key stream.
    pub fn key(&self) -> PrngKey {
        self.key
    }

    /// One loss evaluation and parameter update. Returns the loss.
    pub fn train_step(&mut self) -> Result<f32> {
        let lr = lr_schedule(
            self.config.learning_rate,
            self.config.warmup_steps,
            self.config.steps,
            self.step,
            self.config.cosine_decay,
        );
        self.optimizer.set_learning_rate(lr);

        let (loss, grads, key) = twist_loss_and_grads(
            self.config.dre_type,
            self.key,
            self.target,
            self.twist_net,
            self.output_len,
            self.config.n_twist,
            self.exact.as_ref(),
        )?;
        self.key = key;
        self.optimizer.step(&grads)?;

        if !loss.is_finite() {
            tracing::warn!(step = self.step, loss, "Non-finite twist loss");
        }
        if self.config.log_interval > 0 && self.step % self.config.log_interval == 0 {
            tracing::info!(step = self.step, loss, lr, "Twist training");
        } else {
            tracing::debug!(step = self.step, loss, lr, "Twist training");
        }
        self.step += 1;
        Ok(loss)
    }

    /// Runs `n` steps and returns the loss history.
    pub fn train(&mut self, n: usize) -> Result<Vec<f32>> {
        (0..n).map(|_| self.train_step()).collect()
    }
}
