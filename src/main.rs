use std::path::PathBuf;

use clap::Parser;
use moe_dispatch::{
    DeviceClass, FastDispatcher, RoutingConfig, extract_critical_with, routing::softmax,
};
use ndarray::Array2;
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "moe-dispatch")]
#[command(about = "Route a random batch through the MoE dispatcher and report drops and loss")]
struct Args {
    /// Number of tokens in the batch
    #[arg(long, default_value_t = 64)]
    tokens: usize,

    /// Number of global experts
    #[arg(long, default_value_t = 8)]
    experts: usize,

    /// Hidden width of each token
    #[arg(long, default_value_t = 16)]
    model_dim: usize,

    /// Experts per token (overrides the config file)
    #[arg(long)]
    top_k: Option<usize>,

    /// Capacity factor (overrides the config file)
    #[arg(long)]
    capacity_factor: Option<f64>,

    /// Assign capacity slots by descending gate confidence
    #[arg(long)]
    prioritized: bool,

    /// Run the kernels on the accelerator backend
    #[arg(long)]
    accelerator: bool,

    /// JSON routing config
    #[arg(long)]
    config: Option<PathBuf>,

    /// RNG seed for the synthetic logits and tokens
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> moe_dispatch::Result<()> {
    let args = Args::parse();

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = match &args.config {
        Some(path) => RoutingConfig::from_json_file(path)?,
        None => RoutingConfig::default(),
    };
    if let Some(top_k) = args.top_k {
        config.top_k = top_k;
    }
    if let Some(capacity_factor) = args.capacity_factor {
        config.capacity_factor = capacity_factor;
    }
    config.batch_prioritized_routing |= args.prioritized;
    if args.accelerator {
        config.device = DeviceClass::Accelerator;
    }
    config.validate()?;
    info!(?config, tokens = args.tokens, experts = args.experts, "Routing config");

    let mut rng = StdRng::seed_from_u64(args.seed);
    let normal = Normal::new(0.0f32, 1.0).map_err(|e| {
        moe_dispatch::DispatchError::InvalidInput {
            message: e.to_string(),
        }
    })?;
    let logits = Array2::from_shape_fn((args.tokens, args.experts), |_| normal.sample(&mut rng));
    let tokens = Array2::from_shape_fn((args.tokens, args.model_dim), |_| normal.sample(&mut rng));
    let scores = softmax(&logits);

    let (critical, l_loss) = extract_critical_with(&scores, &config)?;
    let dropped: usize = (0..critical.top_k()).map(|k| critical.dropped(k)).sum();

    let mut dispatcher =
        FastDispatcher::new(args.experts, 0, args.model_dim).with_device(config.device);
    dispatcher.update_from(&critical, config.is_postscore)?;
    let dispatched = dispatcher.encode(&tokens)?;
    let combined = dispatcher.decode(&dispatched)?;

    // With identity experts the round trip weights each kept (token, rank) once by its gate
    let mut expected = Array2::<f32>::zeros(tokens.raw_dim());
    for k in 0..critical.top_k() {
        for t in 0..critical.num_tokens() {
            if (critical.locations[k][t] as usize) < critical.capacity {
                let gate = critical.gates[k][t];
                expected.row_mut(t).scaled_add(gate, &tokens.row(t));
            }
        }
    }
    let max_error = (&combined - &expected)
        .iter()
        .fold(0.0f32, |m, v| m.max(v.abs()));

    if let Some(dispatch_config) = dispatcher.config() {
        println!("backend:          {}", dispatch_config.backend);
        println!(
            "buffer:           {} x {}",
            dispatch_config.slot_rows(),
            dispatch_config.model_dim
        );
    }
    println!("capacity:         {}", critical.capacity);
    println!("load balance:     {l_loss:.6}");
    println!(
        "dropped:          {dropped} of {} assignments",
        critical.num_tokens() * critical.top_k()
    );
    println!("round-trip error: {max_error:.3e}");
    Ok(())
}
