use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use forge::builder::{GraphBuilder, UnknownLayerPolicy};
use log::{error, info};

/// Builds a model from `<model_path>/model_description.json` and saves it as
/// `<model_path>/Saved_<version>`.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    model_path: PathBuf,
    version: String,

    /// Seed for weight initialization, random if missing.
    #[arg(long)]
    seed: Option<u64>,

    /// Skip layers of unknown type instead of failing.
    #[arg(long)]
    skip_unsupported_layers: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let policy = if args.skip_unsupported_layers {
        UnknownLayerPolicy::Skip
    } else {
        UnknownLayerPolicy::Reject
    };
    let builder = GraphBuilder::new().with_policy(policy).with_seed(args.seed);

    match forge::build_model(&args.model_path, &args.version, &builder) {
        Ok(dir) => {
            info!("model built at {}", dir.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
