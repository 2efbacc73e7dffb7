mod generator;
mod sampler;
mod utils;

use std::{path::PathBuf, thread};

use anyhow::{anyhow, ensure, Result};
use clap::Parser;
use humansize::{format_size, DECIMAL};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rustic_shell::shell::{
    InMemoryWeights, Quantize, SafetensorsWeights, ShardContext, ShellConfig, ShellForCausalLM,
    WeightLayout, WeightSource,
};
use sampler::Sampler;

/// Run a tensor-parallel CodeShell model on prompt token ids.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Directory with config.json and *.safetensors; a random toy model is used when absent
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// Number of tensor-parallel shards, each run on its own thread
    #[arg(long, default_value_t = 1)]
    num_shard: usize,

    /// Quantization scheme of the checkpoint
    #[arg(long)]
    quantize: Option<String>,

    /// Linear weights are stored [in_features, out_features]
    #[arg(long)]
    transpose: bool,

    #[arg(long, value_delimiter = ',', default_value = "1")]
    prompt_ids: Vec<usize>,

    /// Total sequence length, prompt included
    #[arg(long, default_value_t = 64)]
    steps: usize,

    /// 0.0 is greedy
    #[arg(long, default_value_t = 0.0)]
    temperature: f32,

    #[arg(long, default_value_t = 16)]
    block_size: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn toy_config() -> ShellConfig {
    ShellConfig::new(64, 4, 8, 2, 256, 512)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();
    ensure!(args.num_shard > 0, "--num-shard must be at least 1");
    ensure!(args.block_size > 0, "--block-size must be at least 1");

    let config = match &args.model_dir {
        Some(dir) => ShellConfig::from_json_file(dir.join("config.json"))?,
        None => toy_config(),
    };
    let quantize = args
        .quantize
        .as_deref()
        .map(str::parse::<Quantize>)
        .transpose()?;
    let mut config = config
        .with_num_shard(args.num_shard)
        .with_quantize(quantize);
    if args.transpose {
        config = config.with_layout(WeightLayout::Transposed);
    }
    info!("config: {:?}", config);

    match &args.model_dir {
        Some(dir) => run(&config, &SafetensorsWeights::from_dir(dir)?, &args),
        None => run(&config, &InMemoryWeights::random(&config, args.seed)?, &args),
    }
}

fn run(config: &ShellConfig, weights: &(impl WeightSource + Sync), args: &Args) -> Result<()> {
    let shards = if args.num_shard == 1 {
        vec![ShardContext::single()]
    } else {
        ShardContext::local_group(args.num_shard)
    };

    let tokens = thread::scope(|s| {
        let handles: Vec<_> = shards
            .into_iter()
            .map(|shard| {
                s.spawn(move || -> Result<Vec<usize>> {
                    let lm = ShellForCausalLM::load(config, weights, &shard)?;
                    if shard.rank == 0 {
                        info!(
                            "model heap per shard: {}",
                            format_size(datasize::data_size(&lm), DECIMAL)
                        );
                    }
                    let mut sampler = Sampler::new(args.temperature, args.seed);
                    generator::generate(
                        &lm,
                        &shard,
                        &mut sampler,
                        &args.prompt_ids,
                        args.steps,
                        args.block_size,
                    )
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().map_err(|_| anyhow!("shard thread panicked"))?)
            .collect::<Result<Vec<_>>>()
    })?;

    info!(generated = tokens[0].len() - args.prompt_ids.len(), "done");
    Ok(())
}
