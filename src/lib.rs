//! twisted-smc: controlled generation from an autoregressive model with
//! twisted sequential Monte Carlo.
//!
//! This crate implements:
//! - Twisted SMC over a reward-tilted target `sigma ∝ p * phi`
//! - Density-ratio training of learned twists (contrastive, EBM, analytic MSE)
//! - Exact enumeration of small generation trees and optimal twists
//! - Lower, IWAE and upper bounds on `log Z`
//! - A REINFORCE-with-baseline policy loss

pub mod config;
pub mod error;

pub mod bounds;
pub mod dre;
pub mod exact;
pub mod logspace;
pub mod model;
pub mod reward;
pub mod rl;
pub mod rng;
pub mod sampler;
pub mod scorer;
pub mod smc;
pub mod trainer;
pub mod twist;

pub use config::{
    DreType, ExactLimits, ExperimentConfig, ModelConfig, ResampleMode, RewardConfig, RewardKind, SmcConfig,
    TrainingConfig,
};
pub use error::{Error, Result};
pub use exact::ExactTable;
pub use model::CausalTransformer;
pub use reward::{RewardModel, TokenVocab};
pub use rng::PrngKey;
pub use sampler::{propose, sample_categorical, sample_model, Proposal};
pub use scorer::CausalScorer;
pub use smc::{run_smc, run_smc_reference, smc_procedure, SamplingMode, SmcContext, SmcOutput, SmcState, Target};
pub use trainer::{lr_schedule, TwistTrainer};
pub use twist::Twist;
