use candle_core::Device;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use twisted_smc::bounds::{exact_bounds, iwae_lower_bound, kl_gap, lower_bound, proposal_log_weights, upper_bound};
use twisted_smc::{
    run_smc, CausalTransformer, DreType, ExactTable, ExperimentConfig, PrngKey, RewardModel, SmcContext, Target,
    Twist, TwistTrainer,
};

#[derive(Parser, Debug)]
#[command(name = "twisted-smc")]
#[command(about = "Train a twist on a toy reward and sample with twisted SMC")]
struct Args {
    /// Experiment config (JSON). Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Twist loss: contrastive, ebm, analytic_mse_rel, analytic_mse_abs
    #[arg(long)]
    dre_type: Option<DreType>,

    /// Training steps
    #[arg(long)]
    steps: Option<usize>,

    /// SMC particles
    #[arg(long)]
    particles: Option<usize>,

    /// Seed of the training and sampling key streams
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> twisted_smc::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ExperimentConfig::from_json_file(path)?,
        None => ExperimentConfig::default(),
    };
    if let Some(dre_type) = args.dre_type {
        config.training.dre_type = dre_type;
    }
    if let Some(steps) = args.steps {
        config.training.steps = steps;
    }
    if let Some(particles) = args.particles {
        config.smc.n_particles = particles;
        config.training.n_twist = particles;
    }
    if let Some(seed) = args.seed {
        config.training.seed = seed;
    }
    config.validate()?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), prompt = ?config.prompt, "twisted-smc");

    let device = Device::cuda_if_available(0)?;
    let model = CausalTransformer::new(&config.model, &device)?;
    let twist_net = CausalTransformer::new(&config.twist_model, &device)?;
    let reward = RewardModel::from_config(config.reward_kind, &config.reward)?;
    let terminal = config.terminal_twist(&reward);
    let target = Target::new(&model, &terminal, &config.prompt, config.model.vocab_size)?;
    let output_len = config.smc.output_len;

    let mut trainer = TwistTrainer::new(&target, &twist_net, output_len, config.training.clone(), &config.exact)?;
    let losses = trainer.train(config.training.steps)?;
    if let Some(last) = losses.last() {
        tracing::info!(steps = losses.len(), final_loss = last, "Training finished");
    }

    let twist = Twist::Learned(&twist_net);
    let ctx = SmcContext::new(&target, &twist, &config.smc);
    let key = trainer.key();
    let (smc, key) = run_smc(key, &ctx)?;
    tracing::info!(log_z_hat = smc.log_z_hat, n = smc.sequences.len(), "SMC finished");

    let (weights, key) = proposal_log_weights(key, &target, &twist, output_len, config.smc.n_particles)?;
    let lower = lower_bound(&weights.log_weights);
    let iwae = iwae_lower_bound(&weights.log_weights);

    match config.exact.check(config.model.vocab_size, output_len) {
        Ok(_) => {
            let table = ExactTable::build(&target, output_len, &config.exact)?;
            let (sigma_samples, _) = table.sample(key, config.smc.n_particles)?;
            let upper = upper_bound(&target, &twist, &sigma_samples)?;
            let exact = exact_bounds(&table, &twist)?;
            tracing::info!(
                log_z = table.log_z,
                lower,
                iwae,
                upper,
                kl_gap = kl_gap(upper, lower),
                exact_gap = exact.kl_gap(),
                "Bounds"
            );
        }
        Err(e) => {
            tracing::info!(lower, iwae, "Bounds (no exact upper bound: {e})");
        }
    }
    Ok(())
}
