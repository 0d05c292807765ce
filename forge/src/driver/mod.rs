//! Retrains a stored model version on supervised or reward data and stores the result as a
//! new version.

mod reward;
mod supervised;
mod tensors;

use std::path::{Path, PathBuf};

use log::info;
use machine_learning::training::History;
use rand::{SeedableRng, rngs::StdRng};

pub use reward::{RewardReport, check_reward_model, q_targets, train_with_reward};
pub use supervised::train_supervised;
pub use tensors::{data_tensor, image_tensor, input_tensor};

use crate::{
    ForgeError, Result,
    configs::{Layout, RewardSample, SupervisedData, TrainConfig, TrainingData, read_json},
    paths::ModelPaths,
    signature::{DEFAULT_SIGNATURE, extract_tensor_names, write_io_names},
    snapshot,
};

const MISSING_DESCRIPTION: &str = "Missing Model Description Json File.";
const MISSING_CONFIG: &str = "Missing Training Config Json File.";
const MISSING_DATA: &str = "Missing Training Data Json File.";

/// A training run over a model directory.
#[derive(Debug, Clone)]
pub struct TrainRequest {
    pub model_path: PathBuf,
    pub input_version: String,
    pub output_version: String,
    /// Explicit `(train_config, train_data)` files, the model's `train/` files otherwise.
    pub files: Option<(PathBuf, PathBuf)>,
    pub seed: Option<u64>,
}

/// What a training run did.
#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub snapshot: PathBuf,
    pub supervised: Option<History>,
    pub reward: Option<RewardReport>,
}

#[derive(Debug, Default)]
struct TrainingSet {
    supervised: Option<SupervisedData>,
    reward: Option<Vec<RewardSample>>,
}

/// Loads `Saved_<input_version>`, trains it on every kind of data available and saves it
/// as `Saved_<output_version>` along with its io names.
///
/// # Errors
/// `ForgeError::MissingFile` if the description, the config or every data file is missing,
/// `ForgeError::SnapshotExists` if the output version already exists. Both are checked
/// before any training happens.
pub fn run_training(req: &TrainRequest) -> Result<TrainSummary> {
    let paths = ModelPaths::new(&req.model_path);
    let description = require(paths.description(), MISSING_DESCRIPTION)?;

    let (config_path, data) = match &req.files {
        Some((config, data)) => {
            let config = require(config.clone(), MISSING_CONFIG)?;
            let data = require(data.clone(), MISSING_DATA)?;
            (config, load_explicit(&data)?)
        }
        None => {
            let config = require(paths.train_config(), MISSING_CONFIG)?;
            (config, discover(&paths)?)
        }
    };

    let output = paths.snapshot(&req.output_version);
    if output.exists() {
        return Err(ForgeError::SnapshotExists(output));
    }

    let config: TrainConfig = read_json(&config_path)?;
    let layout = Layout::load(&description)?;
    let mut model = snapshot::load(&paths.snapshot(&req.input_version))?;

    let mut rng = match req.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let supervised = data
        .supervised
        .as_ref()
        .map(|data| {
            let rng = StdRng::from_rng(&mut rng);
            train_supervised(&mut model.graph, &layout, &config, data, rng)
        })
        .transpose()?;

    let reward = data
        .reward
        .as_deref()
        .map(|samples| {
            let rng = StdRng::from_rng(&mut rng);
            train_with_reward(&mut model.graph, &config, samples, rng)
        })
        .transpose()?;

    snapshot::save(&output, &model.layout, &model.graph)?;
    let names = extract_tensor_names(&output, DEFAULT_SIGNATURE)?;
    write_io_names(&output, &names, 2)?;

    info!("model retrained and saved to {}", output.display());
    Ok(TrainSummary {
        snapshot: output,
        supervised,
        reward,
    })
}

fn require(path: PathBuf, what: &'static str) -> Result<PathBuf> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(ForgeError::MissingFile { what, path })
    }
}

fn discover(paths: &ModelPaths) -> Result<TrainingSet> {
    let supervised = paths.supervised_data();
    let reward = paths.reward_data();

    if !supervised.is_file() && !reward.is_file() {
        return Err(ForgeError::MissingFile {
            what: MISSING_DATA,
            path: paths.root().join("train"),
        });
    }

    Ok(TrainingSet {
        supervised: load_if_present(&supervised)?,
        reward: load_if_present(&reward)?,
    })
}

fn load_if_present<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    path.is_file().then(|| read_json(path)).transpose()
}

/// The json shape of an explicit data file selects the training mode.
fn load_explicit(path: &Path) -> Result<TrainingSet> {
    let set = match read_json(path)? {
        TrainingData::Supervised(data) => TrainingSet {
            supervised: Some(data),
            ..Default::default()
        },
        TrainingData::Reward(samples) => TrainingSet {
            reward: Some(samples),
            ..Default::default()
        },
    };

    Ok(set)
}
