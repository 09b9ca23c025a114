//! pose-vae CLI: build the model and run one encode/decode pass.
//!
//! Builds the encoder and decoder from a JSON config (defaults when omitted) and
//! either loads a safetensors checkpoint or initialises the weights randomly. Then
//! it runs both halves on random inputs.
//!
//! # Output
//!
//! Prints a one-line JSON summary of the produced shapes to stdout:
//!
//! ```json
//! {"mu":[10,2,256],"logvar":[10,2,256],"output":[2,10,7],"weights":"random"}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use pose_vae::{Batch, PoseVae, PoseVaeConfig};

#[derive(Parser, Debug)]
#[command(
    name = "pose-vae",
    about = "Audio-driven head pose VAE",
    long_about = "Run the pose encoder and decoder once on random inputs.\n\
                  A JSON summary line with the output shapes is printed to stdout."
)]
struct Args {
    /// JSON model config. Defaults are used for missing fields.
    #[arg(long)]
    config: Option<PathBuf>,

    /// safetensors checkpoint with `encoder.` / `decoder.` prefixes.
    /// Omit for random initialisation.
    #[arg(long, short = 'w')]
    weights: Option<PathBuf>,

    /// Batch size.
    #[arg(long, short = 'b', default_value_t = 2)]
    batch: usize,

    /// Frames per sample.
    #[arg(long, short = 'f', default_value_t = 10)]
    frames: usize,

    /// Force CPU even when a GPU is available.
    #[arg(long)]
    cpu: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.batch == 0 || args.frames == 0 {
        anyhow::bail!(
            "batch and frames must be positive, got {} and {}",
            args.batch,
            args.frames
        );
    }

    let cfg = match &args.config {
        Some(path) => PoseVaeConfig::from_json_file(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?,
        None => PoseVaeConfig::default(),
    };
    cfg.validate()?;
    if args.frames > cfg.max_positions {
        anyhow::bail!(
            "{} frames exceed the positional table ({} rows)",
            args.frames,
            cfg.max_positions
        );
    }

    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    let dtype = DType::F32;
    tracing::info!("Using device: {:?}", device);

    // Keep the VarMap alive for the lifetime of a randomly initialised model.
    let varmap = VarMap::new();
    let vb = match &args.weights {
        Some(path) => {
            tracing::info!("Loading weights from {}", path.display());
            // SAFETY: the checkpoint is not modified while mapped.
            unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, &device)? }
        }
        None => {
            tracing::info!("No weights given, using random initialisation");
            VarBuilder::from_varmap(&varmap, dtype, &device)
        }
    };
    let model = PoseVae::new(&cfg, vb).map_err(|e| anyhow::anyhow!("failed to build model: {e}"))?;

    let x = Tensor::randn(0f32, 1.0, (args.batch, args.frames, cfg.pos_dim), &device)?;
    let y = Tensor::randn(0f32, 1.0, (args.batch, args.frames, cfg.audio_dim), &device)?;
    let lengths = vec![args.frames; args.batch];
    let batch = Batch::from_lengths(x, y, &lengths)?;

    tracing::info!(
        "Running encoder and decoder on {} x {} frames...",
        args.batch,
        args.frames
    );
    let (batch, params) = model
        .forward(batch, false)
        .map_err(|e| anyhow::anyhow!("forward pass failed: {e}"))?;
    let output = batch
        .output
        .ok_or_else(|| anyhow::anyhow!("decoder produced no output"))?;

    let summary = serde_json::json!({
        "mu": params.mu.dims(),
        "logvar": params.logvar.dims(),
        "output": output.dims(),
        "weights": if args.weights.is_some() { "loaded" } else { "random" },
    });
    println!("{summary}");

    Ok(())
}
