//! Integration tests for the SMC driver.

use candle_core::Device;
use twisted_smc::config::{ExactLimits, ModelConfig, ResampleMode, RewardConfig, RewardKind, SmcConfig};
use twisted_smc::logspace::log_sum_exp;
use twisted_smc::smc::resample;
use twisted_smc::{
    run_smc, run_smc_reference, smc_procedure, CausalTransformer, Error, ExactTable, PrngKey, RewardModel,
    SamplingMode, SmcContext, Target, Twist,
};

fn test_device() -> Device {
    Device::Cpu
}

fn base_model() -> CausalTransformer {
    CausalTransformer::new(&ModelConfig::default(), &test_device()).unwrap()
}

fn twist_model() -> CausalTransformer {
    CausalTransformer::new(&ModelConfig::default().with_seed(1), &test_device()).unwrap()
}

fn varied_reward() -> RewardModel {
    RewardModel::from_config(RewardKind::Varied, &RewardConfig::default()).unwrap()
}

const PROMPT: [u32; 4] = [0, 1, 0, 1];

#[test]
fn test_token_frequencies_match_exact_sigma() {
    let model = base_model();
    let twist_net = twist_model();
    let reward = varied_reward();
    let terminal = Twist::neg_beta_reward(&reward, 1.0);
    let twist = Twist::Learned(&twist_net);
    let target = Target::new(&model, &terminal, &PROMPT, 2).unwrap();

    let output_len = 3;
    let config = SmcConfig::new(20_000, output_len);
    let ctx = SmcContext::new(&target, &twist, &config);
    let (out, _) = run_smc(PrngKey::new(0), &ctx).unwrap();
    let table = ExactTable::build(&target, output_len, &ExactLimits::default()).unwrap();

    let mut total_diff = 0.0f32;
    let mut entries = 0;
    for position in 0..output_len {
        let exact = table.token_marginals(position).unwrap();
        for (v, p) in exact.iter().enumerate() {
            let count = out
                .sequences
                .iter()
                .filter(|s| s[PROMPT.len() + position] as usize == v)
                .count();
            let freq = count as f32 / out.sequences.len() as f32;
            total_diff += (freq - p).abs();
            entries += 1;
        }
    }
    let mean_diff = total_diff / entries as f32;
    assert!(mean_diff < 1e-2, "mean abs difference {mean_diff}");
}

#[test]
fn test_step_fold_matches_reference_loop() {
    let model = base_model();
    let twist_net = twist_model();
    let reward = varied_reward();
    let terminal = Twist::positive_reward(&reward);
    let twist = Twist::Learned(&twist_net);
    let target = Target::new(&model, &terminal, &PROMPT, 2).unwrap();

    for mode in [
        ResampleMode::Always,
        ResampleMode::Never,
        ResampleMode::Adaptive { ess_fraction: 0.5 },
    ] {
        let config = SmcConfig::new(64, 4).resample(mode).keep_history(true);
        let ctx = SmcContext::new(&target, &twist, &config);

        let (folded, key_a) = run_smc(PrngKey::new(17), &ctx).unwrap();
        let (reference, key_b) = run_smc_reference(PrngKey::new(17), &ctx).unwrap();

        assert_eq!(folded.sequences, reference.sequences);
        assert_eq!(folded.log_z_hat.to_bits(), reference.log_z_hat.to_bits());
        assert_eq!(folded.log_weights, reference.log_weights);
        assert_eq!(folded.history, reference.history);
        assert_eq!(key_a, key_b);
    }
}

#[test]
fn test_runs_are_reproducible_per_seed() {
    let model = base_model();
    let twist_net = twist_model();
    let reward = varied_reward();
    let terminal = Twist::positive_reward(&reward);
    let twist = Twist::Learned(&twist_net);
    let target = Target::new(&model, &terminal, &PROMPT, 2).unwrap();
    let config = SmcConfig::new(32, 5);
    let ctx = SmcContext::new(&target, &twist, &config);

    let (a, _) = run_smc(PrngKey::new(5), &ctx).unwrap();
    let (b, _) = run_smc(PrngKey::new(5), &ctx).unwrap();
    let (c, _) = run_smc(PrngKey::new(6), &ctx).unwrap();
    assert_eq!(a, b);
    assert_ne!(a.sequences, c.sequences);
}

#[test]
fn test_log_z_hat_self_normalized_identity() {
    let model = base_model();
    let twist_net = twist_model();
    let reward = varied_reward();
    let terminal = Twist::neg_beta_reward(&reward, 1.0);
    let twist = Twist::Learned(&twist_net);
    let target = Target::new(&model, &terminal, &PROMPT, 2).unwrap();
    let config = SmcConfig::new(256, 5).resample(ResampleMode::Never);
    let ctx = SmcContext::new(&target, &twist, &config);

    let (out, _) = run_smc(PrngKey::new(2), &ctx).unwrap();
    let expected = log_sum_exp(&out.log_weights) - (256f32).ln();
    assert!((out.log_z_hat - expected).abs() < 1e-3);
}

#[test]
fn test_resampling_frequencies_chi_squared() {
    let probs = [0.1f64, 0.2, 0.3, 0.4];
    let log_weights: Vec<f32> = probs.iter().map(|p| (*p as f32).ln() + 3.0).collect();

    let mut counts = [0usize; 4];
    let mut key = PrngKey::new(99);
    for _ in 0..1000 {
        let (ancestors, next) = resample(key, &log_weights).unwrap();
        key = next;
        for a in ancestors {
            counts[a] += 1;
        }
    }

    let total: usize = counts.iter().sum();
    let chi2: f64 = counts
        .iter()
        .zip(probs)
        .map(|(&c, p)| {
            let expected = p * total as f64;
            (c as f64 - expected).powi(2) / expected
        })
        .sum();
    // 3 degrees of freedom, alpha = 0.001
    assert!(chi2 < 16.27, "chi2 = {chi2}, counts = {counts:?}");
}

#[test]
fn test_history_holds_intermediate_prefixes() {
    let model = base_model();
    let twist_net = twist_model();
    let reward = varied_reward();
    let terminal = Twist::positive_reward(&reward);
    let twist = Twist::Learned(&twist_net);
    let target = Target::new(&model, &terminal, &PROMPT, 2).unwrap();
    let config = SmcConfig::new(16, 4).keep_history(true);
    let ctx = SmcContext::new(&target, &twist, &config);

    let (out, _) = run_smc(PrngKey::new(1), &ctx).unwrap();
    assert_eq!(out.history.len(), 3);
    for (t, prefixes) in out.history.iter().enumerate() {
        assert_eq!(prefixes.len(), 16);
        assert!(prefixes.iter().all(|p| p.len() == PROMPT.len() + t + 1));
        assert!(prefixes.iter().all(|p| p[..PROMPT.len()] == PROMPT));
    }
    assert!(out.sequences.iter().all(|s| s.len() == PROMPT.len() + 4));
}

#[test]
fn test_single_step_horizon() {
    let model = base_model();
    let twist_net = twist_model();
    let reward = varied_reward();
    let terminal = Twist::positive_reward(&reward);
    let twist = Twist::Learned(&twist_net);
    let target = Target::new(&model, &terminal, &PROMPT, 2).unwrap();
    let config = SmcConfig::new(8, 1).keep_history(true);
    let ctx = SmcContext::new(&target, &twist, &config);

    let (out, _) = run_smc(PrngKey::new(1), &ctx).unwrap();
    assert!(out.history.is_empty());
    assert_eq!(out.log_weights.len(), 8);
}

#[test]
fn test_varied_reward_past_table_length() {
    let model = base_model();
    let twist_net = twist_model();
    let reward = varied_reward();
    let terminal = Twist::neg_beta_reward(&reward, 1.0);
    let twist = Twist::Learned(&twist_net);
    let target = Target::new(&model, &terminal, &PROMPT, 2).unwrap();
    // Six output tokens can hold more ones than the reward table covers
    let config = SmcConfig::new(512, 6);
    let ctx = SmcContext::new(&target, &twist, &config);

    let (out, _) = run_smc(PrngKey::new(4), &ctx).unwrap();
    assert!(out.log_z_hat.is_finite());
    assert!(out.log_weights.iter().all(|w| w.is_finite()));

    let all_ones: Vec<u32> = PROMPT.iter().copied().chain([1; 6]).collect();
    assert_eq!(reward.reward(&all_ones, PROMPT.len()).unwrap(), 0.0);
    let table = ExactTable::build(&target, 6, &ExactLimits::default()).unwrap();
    assert!(table.log_z.is_finite());
}

#[test]
fn test_final_twist_switch_changes_last_step() {
    let model = base_model();
    let twist_net = twist_model();
    // The terminal potential forbids token 0 at the last position
    let terminal = Twist::PositionIndicator { token: 1, position: 2 };
    let twist = Twist::Learned(&twist_net);
    let target = Target::new(&model, &terminal, &PROMPT, 2).unwrap();

    let config = SmcConfig::new(200, 3);
    let ctx = SmcContext::new(&target, &twist, &config);
    let (with_final, _) = run_smc(PrngKey::new(3), &ctx).unwrap();
    assert!(with_final.sequences.iter().all(|s| s[PROMPT.len() + 2] == 1));

    let config = config.clone().use_final_twist(false);
    let ctx = SmcContext::new(&target, &twist, &config);
    let (without_final, _) = run_smc(PrngKey::new(3), &ctx).unwrap();
    assert!(without_final.sequences.iter().any(|s| s[PROMPT.len() + 2] == 0));
}

#[test]
fn test_unreachable_evidence_is_degenerate_proposal() {
    let model = base_model();
    let twist_net = twist_model();
    let terminal = Twist::PositionIndicator { token: 7, position: 1 };
    let twist = Twist::Learned(&twist_net);
    let target = Target::new(&model, &terminal, &PROMPT, 2).unwrap();
    let config = SmcConfig::new(8, 2);
    let ctx = SmcContext::new(&target, &twist, &config);

    let err = run_smc(PrngKey::new(0), &ctx).unwrap_err();
    assert!(matches!(err, Error::DegenerateProposal { .. }));
}

#[test]
fn test_exact_sigma_mode_bypasses_driver() {
    let model = base_model();
    let twist_net = twist_model();
    let reward = varied_reward();
    let terminal = Twist::positive_reward(&reward);
    let twist = Twist::Learned(&twist_net);
    let target = Target::new(&model, &terminal, &PROMPT, 2).unwrap();
    let config = SmcConfig::new(50, 3);
    let ctx = SmcContext::new(&target, &twist, &config);
    let table = ExactTable::build(&target, 3, &ExactLimits::default()).unwrap();

    let (out, _) = smc_procedure(PrngKey::new(0), &ctx, SamplingMode::ExactSigma(&table)).unwrap();
    assert_eq!(out.sequences.len(), 50);
    assert_eq!(out.log_z_hat, table.log_z);
    assert!(out.sequences.iter().all(|s| table.index_of(s).is_some()));
}

#[test]
fn test_invalid_configs_rejected() {
    let model = base_model();
    let twist_net = twist_model();
    let reward = varied_reward();
    let terminal = Twist::positive_reward(&reward);
    let twist = Twist::Learned(&twist_net);
    let target = Target::new(&model, &terminal, &PROMPT, 2).unwrap();

    let config = SmcConfig::new(0, 3);
    let ctx = SmcContext::new(&target, &twist, &config);
    assert!(matches!(run_smc(PrngKey::new(0), &ctx), Err(Error::InvalidArgument(_))));

    let config = SmcConfig::new(4, 100);
    let ctx = SmcContext::new(&target, &twist, &config);
    assert!(matches!(run_smc(PrngKey::new(0), &ctx), Err(Error::InvalidArgument(_))));

    assert!(Target::new(&model, &terminal, &PROMPT, 3).is_err());
    assert!(Target::new(&model, &terminal, &[], 2).is_err());
}
