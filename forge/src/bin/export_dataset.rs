use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use forge::export::{
    DEFAULT_CONFIG, DEFAULT_DATASET, DEFAULT_OUTPUT, DEFAULT_SPLIT, ExportOptions, HubSource,
    export_dataset,
};
use log::{error, info};

/// Downloads a labelled image dataset split into per-label folders of JPEG files.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[arg(long, default_value = DEFAULT_DATASET)]
    dataset: String,

    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: String,

    #[arg(long, default_value = DEFAULT_SPLIT)]
    split: String,

    #[arg(long, default_value = DEFAULT_OUTPUT)]
    output: PathBuf,

    /// Export at most this many images.
    #[arg(long)]
    limit: Option<usize>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let source = HubSource::new(&args.dataset, &args.config, &args.split);
    let mut opts = ExportOptions::new(&args.output);
    opts.limit = args.limit;

    match export_dataset(&source, &opts) {
        Ok(report) => {
            info!(
                "exported {} images over {} labels to {}",
                report.images,
                report.labels,
                args.output.display()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
