//! Toy reward models.
//!
//! A reward is a function of a complete sequence and the prompt length; only
//! the generated suffix is inspected. Magnitudes and token lists come from
//! [`RewardConfig`].

use crate::config::{RewardConfig, RewardKind};
use crate::error::{Error, Result};

/// Ordered token vocabulary with string lookups.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenVocab {
    tokens: Vec<String>,
}

impl TokenVocab {
    pub fn new(tokens: Vec<String>) -> Self {
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Index of a token string.
    pub fn index_of(&self, token: &str) -> Result<u32> {
        self.tokens
            .iter()
            .position(|t| t == token)
            .map(|i| i as u32)
            .ok_or_else(|| Error::Config(format!("token {token:?} not in vocabulary")))
    }

    /// Indices of a token string list.
    pub fn encode<S: AsRef<str>>(&self, words: &[S]) -> Result<Vec<u32>> {
        words.iter().map(|w| self.index_of(w.as_ref())).collect()
    }

    /// Token strings of an index list; unknown ids render as `<id>`.
    pub fn decode(&self, ids: &[u32]) -> Vec<String> {
        ids.iter()
            .map(|&id| {
                self.tokens
                    .get(id as usize)
                    .cloned()
                    .unwrap_or_else(|| format!("<{id}>"))
            })
            .collect()
    }
}

/// Reward over the generated suffix of a sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum RewardModel {
    /// `bad` when every output token is 0, `base` otherwise.
    OneBad { base: f32, bad: f32 },
    /// Reward indexed by the number of 1-tokens in the output; counts past
    /// the end of the table score 0.
    Varied { by_count: Vec<f32> },
    /// Phrase bonuses and a bad-word penalty.
    BadWord {
        nonsense: f32,
        good: f32,
        evasive: f32,
        bad: f32,
        good_ids: Vec<u32>,
        evasive_ids: Vec<u32>,
        bad_id: u32,
    },
}

impl RewardModel {
    /// Builds the selected reward from configuration values.
    pub fn from_config(kind: RewardKind, config: &RewardConfig) -> Result<Self> {
        match kind {
            RewardKind::OneBad => Ok(Self::OneBad {
                base: config.base_reward,
                bad: config.bad_reward,
            }),
            RewardKind::Varied => Ok(Self::Varied {
                by_count: config.varied_rewards.clone(),
            }),
            RewardKind::BadWord => {
                let vocab = TokenVocab::new(config.token_list.clone());
                Ok(Self::BadWord {
                    nonsense: config.nonsense_reward,
                    good: config.good_reward,
                    evasive: config.evasive_reward,
                    bad: config.bad_reward,
                    good_ids: vocab.encode(&config.good_output)?,
                    evasive_ids: vocab.encode(&config.evasive_output)?,
                    bad_id: vocab.index_of(&config.bad_word)?,
                })
            }
        }
    }

    /// Reward of one sequence.
    pub fn reward(&self, seq: &[u32], prompt_len: usize) -> Result<f32> {
        let output = seq.get(prompt_len..).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "sequence of length {} is shorter than the prompt ({prompt_len})",
                seq.len()
            ))
        })?;
        match self {
            Self::OneBad { base, bad } => {
                if output.iter().all(|&t| t == 0) {
                    Ok(*bad)
                } else {
                    Ok(*base)
                }
            }
            Self::Varied { by_count } => {
                let ones = output.iter().filter(|&&t| t == 1).count();
                Ok(by_count.get(ones).copied().unwrap_or(0.0))
            }
            Self::BadWord {
                nonsense,
                good,
                evasive,
                bad,
                good_ids,
                evasive_ids,
                bad_id,
            } => {
                let mut r = *nonsense;
                if output.starts_with(good_ids) {
                    r += good;
                }
                if output.starts_with(evasive_ids) {
                    r += evasive;
                }
                if output.contains(bad_id) {
                    r += bad;
                }
                Ok(r)
            }
        }
    }

    /// Rewards of a batch.
    pub fn rewards(&self, seqs: &[Vec<u32>], prompt_len: usize) -> Result<Vec<f32>> {
        seqs.iter().map(|s| self.reward(s, prompt_len)).collect()
    }
}
