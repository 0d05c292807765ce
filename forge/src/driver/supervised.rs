use std::num::NonZeroUsize;

use log::{debug, info};
use machine_learning::{
    arch::{Graph, loss::CategoricalCrossentropy},
    dataset::Dataset,
    optimization::Adam,
    training::{History, ModelTrainer},
};
use ndarray::ArrayD;
use rand::rngs::StdRng;

use super::tensors::{data_tensor, input_tensor};
use crate::{
    ForgeError, Result,
    configs::{DType, Layout, SupervisedData, TrainConfig},
};

const LEARNING_RATE: f32 = 1e-3;

/// Fits `graph` to labeled samples.
///
/// Supervised runs always use Adam with its default learning rate and categorical
/// cross-entropy. The configured `learning_rate`, `shuffle` and `validation_split` don't
/// apply here, samples are shuffled every epoch.
///
/// # Arguments
/// * `graph` - The model, updated in place.
/// * `layout` - The model description, it declares the dtype and domain of every input.
/// * `config` - The training hyperparameters.
/// * `data` - The samples, keyed by input and output name.
/// * `rng` - Drives the shuffling.
pub fn train_supervised(
    graph: &mut Graph,
    layout: &Layout,
    config: &TrainConfig,
    data: &SupervisedData,
    rng: StdRng,
) -> Result<History> {
    info!("supervised training detected");
    debug!(
        learning_rate = config.learning_rate,
        shuffle = config.shuffle,
        validation_split = config.validation_split;
        "ignoring config keys in supervised mode"
    );

    let inputs = graph
        .input_names()
        .into_iter()
        .map(|name| {
            let spec = layout.input(name).ok_or_else(|| {
                ForgeError::InvalidLayout(format!("the description doesn't declare input '{name}'"))
            })?;
            let value = data
                .inputs
                .get(name)
                .ok_or_else(|| ForgeError::InvalidData(format!("no values for input '{name}'")))?;
            input_tensor(spec, value)
        })
        .collect::<Result<Vec<_>>>()?;

    let labels = graph
        .output_names()
        .into_iter()
        .zip(graph.output_shapes())
        .map(|(name, shape)| {
            let value = data
                .labels
                .get(name)
                .ok_or_else(|| ForgeError::InvalidData(format!("no labels for output '{name}'")))?;
            data_tensor(name, value, shape, DType::Float32)
        })
        .collect::<Result<Vec<ArrayD<f32>>>>()?;

    let batch_size = NonZeroUsize::new(config.batch_size)
        .ok_or_else(|| ForgeError::InvalidData("batch_size must be positive".into()))?;

    let mut dataset = Dataset::new(inputs, labels)?;
    let optimizer = Adam::with_learning_rate(graph.size(), LEARNING_RATE);
    let loss_fn = CategoricalCrossentropy::new();
    let mut trainer = ModelTrainer::new(optimizer, loss_fn, config.epochs, batch_size, true, rng);

    let history = trainer.fit(graph, &mut dataset, &mut [])?;
    if let Some(loss) = history.final_loss() {
        info!("supervised training finished with loss {loss:.4} over {} samples", dataset.len());
    }

    Ok(history)
}
