use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::Rng;
use std::path::PathBuf;

use sign_encoders::model::group_summary;
use sign_encoders::{build_encoder, AutoProvider, EncoderConfig, EncoderType};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() >= 3 && (args[1] == "inspect" || args[1] == "--inspect") {
        return run_inspect(
            &PathBuf::from(&args[2]),
            args.get(3).and_then(|v| v.parse().ok()).unwrap_or(2),
            args.get(4).and_then(|v| v.parse().ok()).unwrap_or(16),
        );
    }

    eprintln!("usage:");
    eprintln!("  {} inspect <config.json> [batch] [max_len]", args[0]);
    bail!("specify a mode: inspect");
}

/// Build the configured encoder on random inputs and report parameters and output shapes.
fn run_inspect(config_path: &PathBuf, batch: usize, max_len: usize) -> Result<()> {
    if batch == 0 || max_len == 0 {
        bail!("batch and max_len must be positive");
    }
    let device = match Device::new_cuda(0) {
        Ok(d) => {
            eprintln!("using device: CUDA(0)");
            d
        }
        Err(e) => {
            eprintln!("CUDA not available: {e}");
            Device::Cpu
        }
    };

    let config = EncoderConfig::from_json_file(config_path)?;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let encoder = build_encoder(&config, vb, &AutoProvider)?;

    println!("Encoder: {encoder}");
    let (mut total, mut trainable) = (0, 0);
    for (group, (n, t)) in &group_summary(encoder.parameters()) {
        println!(
            "  {group:<22} {:>10} params, {:>10} trainable",
            format_params(*n),
            format_params(*t)
        );
        total += n;
        trainable += t;
    }
    println!(
        "Parameters: {} total, {} trainable",
        format_params(total),
        format_params(trainable)
    );

    let emb_size = match config.encoder_type {
        EncoderType::Recurrent => config.embedding_size,
        _ => config.hidden_size,
    };
    // Recurrent inputs must be sorted by descending length; the first sequence is full.
    let mut rng = rand::thread_rng();
    let mut lengths: Vec<u32> = (0..batch)
        .map(|i| if i == 0 { max_len as u32 } else { rng.gen_range(1..=max_len as u32) })
        .collect();
    lengths.sort_unstable_by(|a, b| b.cmp(a));

    let mask: Vec<u8> = lengths
        .iter()
        .flat_map(|&l| (0..max_len as u32).map(move |t| u8::from(t < l)))
        .collect();
    let mask = Tensor::from_vec(mask, (batch, 1, max_len), &device)?;
    let src_length = Tensor::new(lengths.as_slice(), &device)?;
    let embed_src = Tensor::randn(0f32, 1f32, (batch, max_len, emb_size), &device)?;

    let output = encoder.forward(&embed_src, &src_length, &mask)?;
    println!("Lengths: {lengths:?}");
    println!("Sequence output: {:?}", output.sequence.dims());
    match &output.summary {
        Some(summary) => println!("Summary: {:?}", summary.dims()),
        None => println!("Summary: none"),
    }
    Ok(())
}

/// Format parameter count: <1M → k, <1B → M, ≥1B → B.
fn format_params(n: usize) -> String {
    const K: usize = 1_000;
    const M: usize = 1_000_000;
    const B: usize = 1_000_000_000;
    if n < M {
        format!("{:.1}k", n as f64 / K as f64)
    } else if n < B {
        format!("{:.2}M", n as f64 / M as f64)
    } else {
        format!("{:.2}B", n as f64 / B as f64)
    }
}
