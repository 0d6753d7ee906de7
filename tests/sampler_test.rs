//! Integration tests for the proposal sampler.

use candle_core::Device;
use twisted_smc::config::ModelConfig;
use twisted_smc::logspace::log_sum_exp;
use twisted_smc::scorer::next_token_log_probs;
use twisted_smc::{propose, sample_categorical, sample_model, CausalTransformer, Error, PrngKey, Twist};

fn test_device() -> Device {
    Device::Cpu
}

fn tiny_config(seed: u64) -> ModelConfig {
    ModelConfig {
        vocab_size: 3,
        hidden_size: 16,
        intermediate_size: 32,
        init_seed: seed,
        ..Default::default()
    }
}

#[test]
fn test_proposal_reports_model_twist_and_normalizer() {
    let device = test_device();
    let model = CausalTransformer::new(&tiny_config(0), &device).unwrap();
    let twist_net = CausalTransformer::new(&tiny_config(1), &device).unwrap();
    let twist = Twist::Learned(&twist_net);
    let prefixes = vec![vec![0, 1], vec![2, 0], vec![1, 1]];

    let (proposal, _) = propose(PrngKey::new(0), &model, &twist, &prefixes, 1, 3).unwrap();
    let log_p = next_token_log_probs(&model, &prefixes, 3).unwrap();
    let ext = twist.evaluate_extensions(&prefixes, 1, 3).unwrap();

    for i in 0..prefixes.len() {
        let tok = proposal.tokens[i] as usize;
        assert!(tok < 3);
        assert_eq!(proposal.log_p[i], log_p[i][tok]);
        assert_eq!(proposal.log_twist[i], ext[i][tok]);
        let combined: Vec<f32> = (0..3).map(|v| log_p[i][v] + ext[i][v]).collect();
        assert!((proposal.log_z[i] - log_sum_exp(&combined)).abs() < 1e-6);
    }
}

#[test]
fn test_hard_twist_forces_token() {
    let device = test_device();
    let model = CausalTransformer::new(&tiny_config(0), &device).unwrap();
    let twist = Twist::PositionIndicator { token: 2, position: 0 };
    let prefixes = vec![vec![0]; 32];

    let (proposal, _) = propose(PrngKey::new(1), &model, &twist, &prefixes, 1, 3).unwrap();
    assert!(proposal.tokens.iter().all(|&t| t == 2));
}

#[test]
fn test_twist_vocab_mismatch() {
    let device = test_device();
    let model = CausalTransformer::new(&tiny_config(0), &device).unwrap();
    let other = CausalTransformer::new(
        &ModelConfig {
            vocab_size: 4,
            ..tiny_config(1)
        },
        &device,
    )
    .unwrap();
    let twist = Twist::Learned(&other);

    let err = propose(PrngKey::new(0), &model, &twist, &[vec![0, 1]], 1, 3).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
}

#[test]
fn test_model_samples_follow_first_token_distribution() {
    let device = test_device();
    let model = CausalTransformer::new(&tiny_config(2), &device).unwrap();
    let prompt = [1u32, 0];
    let n = 10_000;

    let (samples, _) = sample_model(PrngKey::new(7), &model, &prompt, 2, n, 3).unwrap();
    assert!(samples.iter().all(|s| s.len() == 4 && s[..2] == prompt));

    let expected = &next_token_log_probs(&model, &[prompt.to_vec()], 3).unwrap()[0];
    for v in 0..3u32 {
        let freq = samples.iter().filter(|s| s[2] == v).count() as f32 / n as f32;
        assert!((freq - expected[v as usize].exp()).abs() < 0.02);
    }
}

#[test]
fn test_keys_advance() {
    let (a, key) = sample_categorical(PrngKey::new(0), &[0.0; 16]).unwrap();
    let (c, _) = sample_categorical(PrngKey::new(0), &[0.0; 16]).unwrap();
    assert_eq!(a, c);
    assert_ne!(key, PrngKey::new(0));
}
