use anyhow::{bail, Context, Result};
use attendance_core::liveness::{DEFAULT_MOTION_PIXEL_THRESHOLD, DEFAULT_PIXEL_DIFF_THRESHOLD};
use attendance_core::models::{self, MODELS};
use attendance_core::types::DEFAULT_MATCH_THRESHOLD;
use attendance_core::{
    decode, extract_enrollment, EmbeddingExtractor, LivenessDetector, MotionLiveness, OnnxExtractor,
};
use clap::{Args, Parser, Subcommand};
use image::RgbImage;
use serde_json::json;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "attendance", about = "Attendance face-matching diagnostics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ModelArgs {
    /// Directory containing det_10g.onnx and w600k_r50.onnx
    #[arg(long)]
    model_dir: Option<PathBuf>,
    /// Skip the SHA-256 check of the model files
    #[arg(long)]
    no_verify: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the embedding of every face in an image
    Embed {
        image: PathBuf,
        #[command(flatten)]
        models: ModelArgs,
    },
    /// Compare the first face of two images
    Compare {
        a: PathBuf,
        b: PathBuf,
        /// Distance a match must be strictly below
        #[arg(long, default_value_t = DEFAULT_MATCH_THRESHOLD)]
        threshold: f32,
        #[command(flatten)]
        models: ModelArgs,
    },
    /// Run the motion liveness check on frame files, in order
    Liveness {
        #[arg(required = true)]
        frames: Vec<PathBuf>,
        /// Per-pixel luminance difference that counts as motion
        #[arg(long, default_value_t = DEFAULT_PIXEL_DIFF_THRESHOLD)]
        pixel_diff: u8,
        /// Changed-pixel count a frame pair must exceed
        #[arg(long, default_value_t = DEFAULT_MOTION_PIXEL_THRESHOLD)]
        motion_pixels: usize,
    },
    /// Model file management
    Models {
        #[command(subcommand)]
        command: ModelCommands,
    },
}

#[derive(Subcommand)]
enum ModelCommands {
    /// Check model files against their pinned SHA-256
    Verify {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Embed { image, models } => {
            let extractor = load_extractor(&models)?;
            let faces = extractor.extract(&read_rgb(&image)?)?;
            let embeddings: Vec<_> = faces.iter().map(|e| &e.values).collect();
            println!(
                "{}",
                json!({ "image": image, "faces": faces.len(), "embeddings": embeddings })
            );
        }
        Commands::Compare {
            a,
            b,
            threshold,
            models,
        } => {
            let extractor = load_extractor(&models)?;
            let Some(ea) = extract_enrollment(&extractor, &read_rgb(&a)?)? else {
                bail!("no face found in {}", a.display());
            };
            let Some(eb) = extract_enrollment(&extractor, &read_rgb(&b)?)? else {
                bail!("no face found in {}", b.display());
            };
            let distance = ea.distance(&eb);
            println!(
                "{}",
                json!({
                    "distance": distance,
                    "threshold": threshold,
                    "match": distance < threshold,
                })
            );
        }
        Commands::Liveness {
            frames,
            pixel_diff,
            motion_pixels,
        } => {
            let bytes = frames
                .iter()
                .map(|p| {
                    std::fs::read(p).with_context(|| format!("failed to read {}", p.display()))
                })
                .collect::<Result<Vec<_>>>()?;
            let decision = MotionLiveness::new(pixel_diff, motion_pixels).check(&bytes);
            println!("{}", serde_json::to_string(&decision)?);
        }
        Commands::Models {
            command: ModelCommands::Verify { dir },
        } => {
            let dir = dir.unwrap_or_else(models::default_model_dir);
            for path in verify_models(&dir)? {
                println!("ok  {}", path.display());
            }
        }
    }

    Ok(())
}

/// Check every manifest model under `dir`; a failure names where to fetch it.
fn verify_models(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut verified = Vec::with_capacity(MODELS.len());
    for model in MODELS {
        let path = dir.join(model.name);
        models::verify_file_sha256(model.name, &path, model.sha256)
            .with_context(|| format!("fetch {} from {}", model.name, model.url))?;
        verified.push(path);
    }
    Ok(verified)
}

fn load_extractor(args: &ModelArgs) -> Result<OnnxExtractor> {
    let dir = args
        .model_dir
        .clone()
        .unwrap_or_else(models::default_model_dir);
    tracing::debug!(dir = %dir.display(), verify = !args.no_verify, "loading models");
    OnnxExtractor::from_model_dir(&dir, !args.no_verify)
        .with_context(|| format!("failed to load models from {}", dir.display()))
}

fn read_rgb(path: &Path) -> Result<RgbImage> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    decode::decode_rgb(&bytes).with_context(|| format!("failed to decode {}", path.display()))
}
