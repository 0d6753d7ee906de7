//! Model implementations.
//!
//! This module contains a pre-norm causal transformer (RMSNorm, RoPE,
//! multi-head attention, SwiGLU) used as base model, twist network and
//! RL baseline.

pub mod attention;
pub mod decoder;
pub mod mlp;
pub mod norm;
pub mod rope;
pub mod transformer;

pub use transformer::CausalTransformer;
