//! Builds, trains, converts and exports neural network models described by json files.

pub mod builder;
pub mod configs;
pub mod driver;
mod error;
pub mod export;
pub mod onnx;
pub mod paths;
pub mod signature;
pub mod snapshot;

use std::path::{Path, PathBuf};

use log::info;

pub use error::{ForgeError, Result};

use crate::{
    builder::GraphBuilder,
    configs::Layout,
    paths::ModelPaths,
    signature::{DEFAULT_SIGNATURE, extract_tensor_names, write_io_names},
};

/// Builds the model described by `<model_path>/model_description.json` and saves it as
/// version `version`, io names included.
///
/// # Arguments
/// * `model_path` - The model directory.
/// * `version` - The version of the new snapshot.
/// * `builder` - The builder to use, it decides the unknown layer policy and the seed.
///
/// # Returns
/// The directory of the new snapshot.
pub fn build_model(model_path: &Path, version: &str, builder: &GraphBuilder) -> Result<PathBuf> {
    let paths = ModelPaths::new(model_path);
    let description = paths.description();
    if !description.is_file() {
        return Err(ForgeError::MissingFile {
            what: "Missing Model Description Json File.",
            path: description,
        });
    }

    let layout = Layout::load(&description)?;
    let graph = builder.build(&layout)?;

    let dir = paths.snapshot(version);
    snapshot::save(&dir, &layout, &graph)?;

    let names = extract_tensor_names(&dir, DEFAULT_SIGNATURE)?;
    write_io_names(&dir, &names, 2)?;

    info!("model '{}' saved to {}", layout.model_name, dir.display());
    Ok(dir)
}
