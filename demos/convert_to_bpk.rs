//! Convert Lumina weights from safetensors to Burn's bpk format
//!
//! Usage:
//!   cargo run --example convert_to_bpk --release --features metal -- \
//!     --input /path/to/lumina_2b.safetensors \
//!     --output /path/to/lumina_2b.bpk

use std::path::PathBuf;

use clap::Parser;
use lumina_burn::backend::{default_device, DefaultBackend};
use lumina_burn::{Lumina, LuminaConfig};

#[derive(Parser)]
#[command(name = "convert_to_bpk")]
#[command(about = "Convert Lumina weights from safetensors to bpk format")]
struct Args {
    /// Input safetensors file
    #[arg(short, long)]
    input: PathBuf,

    /// Output bpk file
    #[arg(short, long)]
    output: PathBuf,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    println!("Lumina Converter - safetensors to bpk");
    println!("====================================");
    println!();
    println!("Input: {:?}", args.input);
    println!("Output: {:?}", args.output);

    let config = LuminaConfig::lumina_2b();
    println!("\nConfig:");
    println!("  Hidden size: {}", config.dim);
    println!("  Num layers: {}", config.n_layers);
    println!("  Num heads: {} ({} kv)", config.n_heads, config.kv_heads());
    println!("  FFN hidden: {}", config.ffn_hidden_dim());
    println!("  Approx params: {:.2}B", config.num_params() as f64 / 1e9);

    println!("\nInitializing model...");
    let device = default_device();
    let model: Lumina<DefaultBackend> = config.init(&device)?;

    println!("Loading weights from safetensors...");
    let model = model.with_weights(&args.input)?;

    println!("Saving to bpk format...");
    model.save_weights(&args.output)?;

    // Print file sizes
    if let Ok(meta) = std::fs::metadata(&args.input) {
        println!("\nInput size: {:.2} GB", meta.len() as f64 / 1e9);
    }
    if let Ok(meta) = std::fs::metadata(&args.output) {
        println!("Output size: {:.2} GB", meta.len() as f64 / 1e9);
    }

    println!("\nConversion complete!");

    Ok(())
}
