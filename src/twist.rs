//! Twist functions.
//!
//! A twist maps a sequence prefix to an unnormalized log value. All variants
//! share two evaluation forms:
//!
//! - [`Twist::evaluate`]: one value per sequence, `[N]`
//! - [`Twist::evaluate_extensions`]: the value of `prefix + v` for every next
//!   token `v`, `[N, V]`
//!
//! The learned variant answers the extension form with a single forward pass;
//! every other variant enumerates the `N * V` extended sequences.

use candle_core::DType;

use crate::error::{Error, Result};
use crate::reward::RewardModel;
use crate::scorer::{self, CausalScorer};

/// Default floor added inside `log(indicator + eps)`.
pub const DEFAULT_EPS: f32 = 1e-8;

/// Log-space prefix potential.
pub enum Twist<'a> {
    /// Neural twist. The value of `s_{1:t}` is output position `t-2`
    /// indexed by `s_t`.
    Learned(&'a dyn CausalScorer),
    /// `log 1[s_{prompt+position} == token]`. Prefixes that have not yet
    /// reached `position` score 0.
    PositionIndicator { token: u32, position: usize },
    /// `log(1[token in output] + eps)`.
    TokenContainment { token: u32, eps: f32 },
    /// `log(1[every output token in tokens] + eps)`.
    OnlyContains { tokens: Vec<u32>, eps: f32 },
    /// `log p(continuation | s)` under a reference model.
    ModelLikelihood {
        model: &'a dyn CausalScorer,
        continuation: Vec<u32>,
    },
    /// `scale * r(s)`.
    Reward { reward: &'a RewardModel, scale: f32 },
}

impl<'a> Twist<'a> {
    /// Terminal potential `exp(-beta * r)`.
    pub fn neg_beta_reward(reward: &'a RewardModel, beta: f32) -> Self {
        Self::Reward {
            reward,
            scale: -beta,
        }
    }

    /// Terminal potential `exp(beta * r)`.
    pub fn pos_beta_reward(reward: &'a RewardModel, beta: f32) -> Self {
        Self::Reward { reward, scale: beta }
    }

    /// Terminal potential `exp(r)`.
    pub fn positive_reward(reward: &'a RewardModel) -> Self {
        Self::pos_beta_reward(reward, 1.0)
    }

    /// Containment indicator with the default floor.
    pub fn token_containment(token: u32) -> Self {
        Self::TokenContainment {
            token,
            eps: DEFAULT_EPS,
        }
    }

    pub fn is_learned(&self) -> bool {
        matches!(self, Self::Learned(_))
    }

    /// Log value of every sequence, `[N]`.
    pub fn evaluate(&self, seqs: &[Vec<u32>], prompt_len: usize) -> Result<Vec<f32>> {
        if seqs.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(short) = seqs.iter().find(|s| s.len() < prompt_len) {
            return Err(Error::ShapeMismatch {
                what: "sequence shorter than prompt",
                expected: prompt_len,
                actual: short.len(),
            });
        }
        match self {
            Self::Learned(net) => {
                let ids = scorer::batch_tensor(seqs, net.device())?;
                let values = scorer::learned_twist_values(*net, &ids, net.output_size())?;
                Ok(values.to_dtype(DType::F32)?.to_vec1()?)
            }
            Self::PositionIndicator { token, position } => Ok(seqs
                .iter()
                .map(|s| match s.get(prompt_len + position) {
                    Some(t) if t == token => 0.0,
                    Some(_) => f32::NEG_INFINITY,
                    None => 0.0,
                })
                .collect()),
            Self::TokenContainment { token, eps } => Ok(seqs
                .iter()
                .map(|s| indicator_log(s[prompt_len..].contains(token), *eps))
                .collect()),
            Self::OnlyContains { tokens, eps } => Ok(seqs
                .iter()
                .map(|s| {
                    let only = s[prompt_len..].iter().all(|t| tokens.contains(t));
                    indicator_log(only, *eps)
                })
                .collect()),
            Self::ModelLikelihood {
                model,
                continuation,
            } => {
                if continuation.is_empty() {
                    return Ok(vec![0.0; seqs.len()]);
                }
                let extended: Vec<Vec<u32>> = seqs
                    .iter()
                    .map(|s| s.iter().chain(continuation).copied().collect())
                    .collect();
                let len = seqs[0].len();
                let ids = scorer::batch_tensor(&extended, model.device())?;
                let lp = scorer::sequence_log_probs(*model, &ids, len, model.output_size())?;
                Ok(lp.to_dtype(DType::F32)?.to_vec1()?)
            }
            Self::Reward { reward, scale } => Ok(reward
                .rewards(seqs, prompt_len)?
                .into_iter()
                .map(|r| scale * r)
                .collect()),
        }
    }

    /// Log value of `prefix + v` for every prefix and next token `v`, `[N, V]`.
    pub fn evaluate_extensions(
        &self,
        prefixes: &[Vec<u32>],
        prompt_len: usize,
        n_vocab: usize,
    ) -> Result<Vec<Vec<f32>>> {
        match self {
            Self::Learned(net) => scorer::last_position_outputs(*net, prefixes, n_vocab),
            _ => {
                let extended: Vec<Vec<u32>> = prefixes
                    .iter()
                    .flat_map(|p| {
                        (0..n_vocab as u32).map(move |v| {
                            let mut s = p.clone();
                            s.push(v);
                            s
                        })
                    })
                    .collect();
                let flat = self.evaluate(&extended, prompt_len)?;
                Ok(flat.chunks(n_vocab).map(|c| c.to_vec()).collect())
            }
        }
    }
}

fn indicator_log(holds: bool, eps: f32) -> f32 {
    (if holds { 1.0 + eps } else { eps }).ln()
}
