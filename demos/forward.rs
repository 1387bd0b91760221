//! Example: run one Lumina forward pass on a heterogeneous batch
//!
//! Packs two latents of different sizes with captions of different lengths
//! through a small randomly initialized model and prints the output shapes.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example forward --features cpu --release
//!
//! # Grouped kernels and sliced attention
//! cargo run --example forward --release -- --fused --slice-size 8
//!
//! # Packing layout at debug level
//! cargo run --example forward --release -- --verbose
//! ```

use std::path::PathBuf;

use burn::prelude::*;
use burn::tensor::Distribution;
use clap::Parser;
use lumina_burn::backend::{default_device, DefaultBackend};
use lumina_burn::{ExecutionStrategy, ImageBatch, LuminaBuilder, LuminaConfig, MemoryEstimate};
use tracing::Level;

#[derive(Parser)]
#[command(name = "forward")]
#[command(about = "Run a Lumina forward pass on a mixed-size batch")]
struct Args {
    /// Latent sizes as HxW, one per sample
    #[arg(long, value_delimiter = ',', default_value = "8x8,4x12")]
    sizes: Vec<String>,

    /// Valid caption tokens per sample
    #[arg(long, value_delimiter = ',', default_value = "5,3")]
    caption_lens: Vec<usize>,

    /// Diffusion timestep shared by the batch
    #[arg(long, default_value = "0.5")]
    timestep: f32,

    /// Use the fused execution strategy
    #[arg(long)]
    fused: bool,

    /// Query chunk length for sliced attention
    #[arg(long)]
    slice_size: Option<usize>,

    /// Weights for the tiny configuration (.safetensors or .bpk)
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Log packing details
    #[arg(short, long)]
    verbose: bool,
}

fn parse_size(size: &str) -> Result<(usize, usize), String> {
    let (h, w) = size
        .split_once('x')
        .ok_or_else(|| format!("expected HxW, got {size:?}"))?;
    let h = h.parse().map_err(|e| format!("bad height in {size:?}: {e}"))?;
    let w = w.parse().map_err(|e| format!("bad width in {size:?}: {e}"))?;
    Ok((h, w))
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    let sizes = args
        .sizes
        .iter()
        .map(|s| parse_size(s))
        .collect::<Result<Vec<_>, _>>()?;
    if sizes.len() != args.caption_lens.len() {
        return Err("--sizes and --caption-lens need one entry per sample".into());
    }

    let device = default_device();
    let config = LuminaConfig::tiny().with_attention_slice_size(args.slice_size);

    let mut builder = LuminaBuilder::<DefaultBackend>::new(device.clone()).with_config(config);
    if args.fused {
        builder = builder.with_execution(ExecutionStrategy::Fused);
    }
    if let Some(path) = args.weights {
        builder = builder.with_weights(path);
    }
    let model = builder.build()?;
    let config = model.config().clone();

    println!("Lumina forward");
    println!("==============");
    println!("  Hidden size: {}", config.dim);
    println!("  Layers: {} (+{} refiner)", config.n_layers, config.n_refiner_layers);
    println!("  Heads: {} query, {} kv", config.n_heads, config.kv_heads());
    println!("  Params: {}", config.num_params());

    // Inputs
    let batch = sizes.len();
    let cap_len = args.caption_lens.iter().copied().max().unwrap_or(0).max(1);
    let images: Vec<Tensor<DefaultBackend, 3>> = sizes
        .iter()
        .map(|&(h, w)| Tensor::random([config.in_channels, h, w], Distribution::Normal(0.0, 1.0), &device))
        .collect();
    let cap_feats = Tensor::<DefaultBackend, 3>::random(
        [batch, cap_len, config.cap_feat_dim],
        Distribution::Normal(0.0, 1.0),
        &device,
    );
    let flags: Vec<bool> = args
        .caption_lens
        .iter()
        .flat_map(|&len| (0..cap_len).map(move |i| i < len))
        .collect();
    let cap_mask = Tensor::<DefaultBackend, 2, Bool>::from_data(TensorData::new(flags, [batch, cap_len]), &device);
    let t = Tensor::<DefaultBackend, 1>::from_data(TensorData::new(vec![args.timestep; batch], [batch]), &device);

    let max_tokens = sizes
        .iter()
        .zip(&args.caption_lens)
        .map(|(&(h, w), cap)| cap + (h / config.patch_size) * (w / config.patch_size))
        .max()
        .unwrap_or(0);
    let estimate = MemoryEstimate::new(&config, batch, max_tokens, 4);
    println!("\nMemory estimate:");
    println!("  - Sequence length: {} tokens", estimate.num_tokens);
    println!("  - Attention per layer: {} bytes", estimate.attention_memory_per_layer);
    println!("  - Total: {:.6} GB", estimate.total_gb());

    let out = model.forward(ImageBatch::List(images), t, cap_feats, cap_mask)?;

    println!("\nOutputs:");
    for (i, image) in out.into_images().into_iter().enumerate() {
        let [c, h, w] = image.dims();
        let mean: f32 = image.abs().mean().into_scalar().elem();
        println!("  sample {i}: [{c}, {h}, {w}], mean |x| = {mean:.6}");
    }

    Ok(())
}
