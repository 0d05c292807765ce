use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use log::{error, info};

/// Converts an ONNX model into a saved model directory.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    onnx_model: PathBuf,
    output_dir: PathBuf,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match forge::onnx::convert_onnx_file(&args.onnx_model, &args.output_dir) {
        Ok(_) => {
            info!("saved model written to {}", args.output_dir.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
