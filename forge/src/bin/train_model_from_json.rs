use std::{path::PathBuf, process::ExitCode};

use anyhow::Context;
use clap::Parser;
use forge::driver::{TrainRequest, run_training};
use log::{error, info};

/// Retrains `Saved_<input_version>` and saves it as `Saved_<output_version>`.
///
/// Without explicit files the training config and data are read from `<model_path>/train`.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    model_path: PathBuf,
    input_version: String,
    output_version: String,

    #[arg(requires = "train_data")]
    train_config: Option<PathBuf>,
    train_data: Option<PathBuf>,

    /// Seed for shuffling and dropout, random if missing.
    #[arg(long)]
    seed: Option<u64>,
}

fn run(args: Args) -> anyhow::Result<()> {
    let request = TrainRequest {
        model_path: args.model_path,
        input_version: args.input_version,
        output_version: args.output_version,
        files: args.train_config.zip(args.train_data),
        seed: args.seed,
    };

    let summary = run_training(&request).with_context(|| {
        format!(
            "training {} from version {}",
            request.model_path.display(),
            request.input_version
        )
    })?;

    if let Some(history) = &summary.supervised {
        info!(
            "supervised training ran {} epochs, final loss {:?}",
            history.epochs(),
            history.final_loss()
        );
    }
    if let Some(report) = &summary.reward {
        info!(
            "reward training ran {} epochs over {} samples, final loss {:?}",
            report.epochs, report.samples, report.final_loss
        );
    }

    info!("saved {}", summary.snapshot.display());
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
