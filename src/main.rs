//! open-nsfw CLI - print the NSFW probability of images.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use open_nsfw::{Config, NsfwModel};

/// Score images with the open NSFW classifier.
#[derive(Parser, Debug)]
#[command(name = "open-nsfw")]
#[command(version, about, long_about = None)]
struct Args {
    /// Images to score.
    #[arg(value_name = "IMAGE", required = true)]
    images: Vec<PathBuf>,

    /// Directory holding the deploy definition and the weights.
    #[arg(long, default_value = "nsfw_model", value_name = "DIR")]
    model_dir: PathBuf,

    /// Deploy definition file name inside the model directory.
    #[arg(long, default_value = "deploy.prototxt", value_name = "FILE")]
    deploy: String,

    /// Weights file name inside the model directory (.caffemodel or .safetensors).
    #[arg(long, default_value = "resnet_50_1by2_nsfw.caffemodel", value_name = "FILE")]
    weights: String,

    /// Side of the square every image is resized to before cropping.
    #[arg(long, default_value = "256", value_name = "INT")]
    size: u32,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("open_nsfw={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every image was scored.
fn run(args: &Args) -> Result<bool> {
    let config = Config {
        model_dir: args.model_dir.clone(),
        deploy_file: args.deploy.clone(),
        weights_file: args.weights.clone(),
        resize: (args.size, args.size),
        ..Config::default()
    };

    let model = NsfwModel::new(config).context("Failed to load model")?;

    let mut all_ok = true;
    for path in &args.images {
        match model.predict(path) {
            Ok(score) => println!("{}\t{score:.3}", path.display()),
            Err(err) => {
                all_ok = false;
                tracing::error!("{}: {err:#}", path.display());
            }
        }
    }

    Ok(all_ok)
}
