use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use forge::{
    configs::Layout,
    signature::{DEFAULT_SIGNATURE, extract_tensor_names, write_io_names},
    snapshot,
};
use log::{error, info};

/// Writes the io tensor names of a saved model to `cppflow_io_names.json`.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// The snapshot directory.
    model_path: PathBuf,

    #[arg(long, default_value = DEFAULT_SIGNATURE)]
    signature: String,

    /// Also writes the layout rebuilt from the loaded model to this file.
    #[arg(long)]
    layout: Option<PathBuf>,
}

fn run(args: &Args) -> forge::Result<()> {
    let names = extract_tensor_names(&args.model_path, &args.signature)?;
    for (alias, name) in &names.inputs {
        info!("input {alias}: {name}");
    }
    for (alias, name) in &names.outputs {
        info!("output {alias}: {name}");
    }

    write_io_names(&args.model_path, &names, 4)?;

    if let Some(path) = &args.layout {
        let loaded = snapshot::load(&args.model_path)?;
        Layout::from_graph(&loaded.graph)?.save(path)?;
        info!("layout written to {}", path.display());
    }

    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(&Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
