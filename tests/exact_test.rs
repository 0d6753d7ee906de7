//! Integration tests for the exact enumeration engine.

use candle_core::Device;
use twisted_smc::config::{ExactLimits, ModelConfig, RewardConfig, RewardKind};
use twisted_smc::logspace::log_sum_exp;
use twisted_smc::scorer::{batch_tensor, sequence_log_probs};
use twisted_smc::{CausalTransformer, Error, ExactTable, PrngKey, RewardModel, Target, Twist};

fn test_device() -> Device {
    Device::Cpu
}

fn build_model(seed: u64) -> CausalTransformer {
    CausalTransformer::new(&ModelConfig::default().with_seed(seed), &test_device()).unwrap()
}

const PROMPT: [u32; 4] = [0, 1, 0, 1];

#[test]
fn test_log_z_is_joint_normalizer() {
    let model = build_model(0);
    let reward = RewardModel::from_config(RewardKind::Varied, &RewardConfig::default()).unwrap();
    let terminal = Twist::neg_beta_reward(&reward, 1.0);
    let target = Target::new(&model, &terminal, &PROMPT, 2).unwrap();
    let table = ExactTable::build(&target, 4, &ExactLimits::default()).unwrap();

    let joint: Vec<f32> = table.log_p.iter().zip(&table.log_phi).map(|(p, f)| p + f).collect();
    assert!((log_sum_exp(&joint) - table.log_z).abs() < 1e-5);
    for (j, s) in joint.iter().zip(&table.log_sigma) {
        assert!((j - table.log_z - s).abs() < 1e-5);
    }
}

#[test]
fn test_optimal_twists_recover_log_z_at_every_length() {
    let model = build_model(0);
    let reward = RewardModel::from_config(RewardKind::Varied, &RewardConfig::default()).unwrap();
    let terminal = Twist::neg_beta_reward(&reward, 1.0);
    let target = Target::new(&model, &terminal, &PROMPT, 2).unwrap();
    let output_len = 5;
    let table = ExactTable::build(&target, output_len, &ExactLimits::default()).unwrap();

    // sum over prefixes of p(prefix) * opt(prefix) is Z for every length
    for len in 1..output_len {
        let prefixes = table.prefixes(len).unwrap();
        let ids = batch_tensor(prefixes, &test_device()).unwrap();
        let log_p: Vec<f32> = sequence_log_probs(&model, &ids, PROMPT.len(), 2)
            .unwrap()
            .to_vec1()
            .unwrap();
        let terms: Vec<f32> = log_p
            .iter()
            .zip(&table.optimal_log_twists()[len - 1])
            .map(|(p, o)| p + o)
            .collect();
        assert!(
            (log_sum_exp(&terms) - table.log_z).abs() < 1e-4,
            "length {len}"
        );
    }
}

#[test]
fn test_exact_samples_follow_sigma() {
    let model = build_model(2);
    let reward = RewardModel::from_config(RewardKind::Varied, &RewardConfig::default()).unwrap();
    let terminal = Twist::positive_reward(&reward);
    let target = Target::new(&model, &terminal, &PROMPT, 2).unwrap();
    let table = ExactTable::build(&target, 3, &ExactLimits::default()).unwrap();

    let n = 20_000;
    let (samples, _) = table.sample(PrngKey::new(8), n).unwrap();
    let mut counts = vec![0usize; table.sequences.len()];
    for s in &samples {
        counts[table.index_of(s).unwrap()] += 1;
    }
    for (c, lp) in counts.iter().zip(&table.log_sigma) {
        assert!((*c as f32 / n as f32 - lp.exp()).abs() < 0.02);
    }
}

#[test]
fn test_marginals_and_proposal_are_normalized() {
    let model = build_model(0);
    let twist_net = build_model(4);
    let reward = RewardModel::from_config(RewardKind::OneBad, &RewardConfig::default()).unwrap();
    let terminal = Twist::positive_reward(&reward);
    let target = Target::new(&model, &terminal, &PROMPT, 2).unwrap();
    let table = ExactTable::build(&target, 4, &ExactLimits::default()).unwrap();

    for position in 0..4 {
        let m: f32 = table.token_marginals(position).unwrap().iter().sum();
        assert!((m - 1.0).abs() < 1e-5);
    }
    assert!(table.token_marginals(4).is_err());

    let twist = Twist::Learned(&twist_net);
    for last in [None, Some(&terminal)] {
        let log_q = table.proposal_log_probs(&twist, last).unwrap();
        let mass: f32 = log_q.iter().map(|x| x.exp()).sum();
        assert!((mass - 1.0).abs() < 1e-4);
    }
}

#[test]
fn test_model_log_twists_align_with_prefixes() {
    let model = build_model(0);
    let twist_net = build_model(3);
    let reward = RewardModel::from_config(RewardKind::OneBad, &RewardConfig::default()).unwrap();
    let terminal = Twist::positive_reward(&reward);
    let target = Target::new(&model, &terminal, &PROMPT, 2).unwrap();
    let table = ExactTable::build(&target, 3, &ExactLimits::default()).unwrap();

    let learned = table.model_log_twists(&twist_net).unwrap();
    assert_eq!(learned.len(), 2);
    let twist = Twist::Learned(&twist_net);
    for (len, values) in (1..3).zip(&learned) {
        let values: Vec<f32> = values.to_vec1().unwrap();
        let direct = twist.evaluate(table.prefixes(len).unwrap(), PROMPT.len()).unwrap();
        assert_eq!(values.len(), 1 << len);
        for (a, b) in values.iter().zip(&direct) {
            assert!((a - b).abs() < 1e-5);
        }
    }
}

#[test]
fn test_large_horizon_unsupported() {
    let model = build_model(0);
    let terminal = Twist::token_containment(1);
    let target = Target::new(&model, &terminal, &PROMPT, 2).unwrap();

    let err = ExactTable::build(&target, 17, &ExactLimits::default()).unwrap_err();
    assert!(matches!(err, Error::UnsupportedConfiguration(_)));
}
