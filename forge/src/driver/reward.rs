use std::num::NonZeroUsize;

use log::{debug, info};
use machine_learning::{
    arch::{Graph, loss::Mse},
    dataset::Dataset,
    optimization::Adam,
    training::{EarlyStopping, ModelTrainer},
};
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use serde_json::Value;

use super::tensors::{flatten_into, to_batch};
use crate::{
    ForgeError, Result,
    configs::{DType, RewardSample, TrainConfig},
};

const PATIENCE: usize = 5;

/// The outcome of a reward training run.
#[derive(Debug, Clone, PartialEq)]
pub struct RewardReport {
    /// The training loss of the last epoch that ran.
    pub final_loss: Option<f32>,
    pub samples: usize,
    pub epochs: usize,
}

/// Checks that `graph` can be trained as a Q-value regressor: one scalar output and a
/// state input, optionally followed by an action input.
pub fn check_reward_model(graph: &Graph) -> Result<()> {
    let outputs = graph.output_shapes();
    let [output] = outputs.as_slice() else {
        return Err(ForgeError::RewardConfig(format!(
            "the model has {} outputs, Q-learning needs a single scalar output",
            outputs.len()
        )));
    };

    if output.last() != Some(&1) {
        return Err(ForgeError::RewardConfig(format!(
            "the output's last dimension must be 1 (a scalar Q-value), got shape {output:?}"
        )));
    }

    if output.iter().product::<usize>() != 1 {
        return Err(ForgeError::RewardConfig(format!(
            "the model must output one value per sample, got shape {output:?}"
        )));
    }

    let inputs = graph.input_names().len();
    if !(1..=2).contains(&inputs) {
        return Err(ForgeError::RewardConfig(format!(
            "the model must take a state and optionally an action, it has {inputs} inputs"
        )));
    }

    Ok(())
}

/// Computes one step Q-learning targets, `reward + gamma * (1 - done) * bootstrap`.
///
/// # Arguments
/// * `rewards` - The reward of every transition.
/// * `dones` - `1.` where the episode ended.
/// * `bootstrap` - The estimated value of the next state, `0.` where there's none.
/// * `gamma` - The discount factor.
pub fn q_targets(rewards: &[f32], dones: &[f32], bootstrap: &[f32], gamma: f32) -> Vec<f32> {
    rewards
        .iter()
        .zip(dones)
        .zip(bootstrap)
        .map(|((r, done), q)| r + gamma * (1. - done) * q)
        .collect()
}

/// Fits `graph` to Q-learning targets built from transitions.
///
/// # Arguments
/// * `graph` - The model, updated in place.
/// * `config` - The training hyperparameters, `learning_rate` and `gamma` included.
/// * `samples` - The transitions, in order.
/// * `rng` - Drives the shuffling.
///
/// # Errors
/// `ForgeError::RewardConfig` if the model doesn't fit `check_reward_model`, checked before
/// any tensor is built.
pub fn train_with_reward(
    graph: &mut Graph,
    config: &TrainConfig,
    samples: &[RewardSample],
    rng: StdRng,
) -> Result<RewardReport> {
    info!("reward based training detected");
    check_reward_model(graph)?;

    if samples.is_empty() {
        return Err(ForgeError::InvalidData("there are no reward samples".into()));
    }

    let batch_size = NonZeroUsize::new(config.batch_size)
        .ok_or_else(|| ForgeError::InvalidData("batch_size must be positive".into()))?;

    let shapes: Vec<Vec<usize>> = graph.input_shapes().iter().map(|s| s.to_vec()).collect();
    let with_action = shapes.len() == 2;
    let n = samples.len();

    let states = stack("state", samples.iter().map(|s| &s.state), &shapes[0], DType::Float32, n)?;
    let actions = if with_action {
        let actions = samples.iter().map(|s| &s.action);
        Some(stack("action", actions, &shapes[1], DType::Int32, n)?)
    } else {
        None
    };

    let rewards: Vec<f32> = samples.iter().map(|s| s.reward).collect();
    let dones: Vec<f32> = samples.iter().map(RewardSample::done).collect();
    let bootstrap = bootstrap_values(graph, samples, &shapes, config.batch_size)?;
    let targets = q_targets(&rewards, &dones, &bootstrap, config.gamma);

    let mut target_shape = vec![n];
    target_shape.extend_from_slice(graph.output_shapes()[0]);
    let targets = ArrayD::from_shape_vec(IxDyn(&target_shape), targets)
        .map_err(machine_learning::MlErr::from)?;

    let mut inputs = vec![states];
    inputs.extend(actions);
    let mut dataset = Dataset::new(inputs, vec![targets])?;

    let optimizer = Adam::with_learning_rate(graph.size(), config.learning_rate);
    let mut trainer = ModelTrainer::new(optimizer, Mse::new(), config.epochs, batch_size, true, rng);
    let mut early_stop = EarlyStopping::new(PATIENCE, 0., true);

    let history = trainer.fit(graph, &mut dataset, &mut [&mut early_stop])?;
    let report = RewardReport {
        final_loss: history.final_loss(),
        samples: n,
        epochs: history.epochs(),
    };

    if let Some(loss) = report.final_loss {
        info!("final loss {loss:.4} from {n} samples");
    }

    Ok(report)
}

/// Runs the model over every transition that has a next state.
fn bootstrap_values(
    graph: &mut Graph,
    samples: &[RewardSample],
    shapes: &[Vec<usize>],
    batch_size: usize,
) -> Result<Vec<f32>> {
    let mut values = vec![0.; samples.len()];
    let with_next: Vec<usize> = (0..samples.len())
        .filter(|&i| samples[i].next_state.is_some())
        .collect();

    if with_next.is_empty() {
        return Ok(values);
    }

    debug!("bootstrapping {} of {} transitions", with_next.len(), samples.len());

    let k = with_next.len();
    let next_states = with_next
        .iter()
        .filter_map(|&i| samples[i].next_state.as_ref());
    let mut inputs = vec![stack("next_state", next_states, &shapes[0], DType::Float32, k)?];

    // Explicit next actions are read as floats, the fallback is the integer action
    if let Some(action_shape) = shapes.get(1) {
        let next_actions = with_next.iter().map(|&i| {
            let s = &samples[i];
            match &s.next_action {
                Some(next) => (next, DType::Float32),
                None => (&s.action, DType::Int32),
            }
        });
        inputs.push(stack_cast("next_action", next_actions, action_shape, k)?);
    }

    let q = graph.predict(&inputs, batch_size)?;
    let q = q.first().ok_or_else(|| ForgeError::RewardConfig("the model has no output".into()))?;
    for (&i, &v) in with_next.iter().zip(q.iter()) {
        values[i] = v;
    }

    Ok(values)
}

/// Stacks one json value per transition into a batch of `expected` samples.
fn stack<'a>(
    name: &str,
    values: impl Iterator<Item = &'a Value>,
    features: &[usize],
    dtype: DType,
    expected: usize,
) -> Result<ArrayD<f32>> {
    stack_cast(name, values.map(|v| (v, dtype)), features, expected)
}

fn stack_cast<'a>(
    name: &str,
    values: impl Iterator<Item = (&'a Value, DType)>,
    features: &[usize],
    expected: usize,
) -> Result<ArrayD<f32>> {
    let mut flat = Vec::new();
    for (value, dtype) in values {
        let start = flat.len();
        flatten_into(name, value, &mut flat)?;
        flat[start..].iter_mut().for_each(|v| *v = dtype.cast(*v));
    }

    let batch = to_batch(name, flat, features)?;

    if batch.shape()[0] != expected {
        return Err(ForgeError::ShapeMismatch {
            name: name.to_string(),
            msg: format!(
                "got {} samples of shape {features:?}, expected {expected}",
                batch.shape()[0]
            ),
        });
    }

    Ok(batch)
}

#[cfg(test)]
mod tests {
    use machine_learning::arch::Graph;
    use ndarray::{ArrayD, IxDyn};
    use rand::{SeedableRng, rngs::StdRng};
    use serde_json::json;

    use super::{bootstrap_values, check_reward_model, q_targets, train_with_reward};
    use crate::{
        ForgeError,
        builder::GraphBuilder,
        configs::{Layout, RewardSample, TrainConfig},
    };

    fn q_net(inputs: serde_json::Value, units: usize) -> Layout {
        serde_json::from_value(json!({
            "model_name": "q",
            "inputs": inputs,
            "outputs": [{"name": "q"}],
            "layers": [
                {"type": "Dense", "params": {"units": 8, "activation": "relu", "input_name": "state", "output_name": "h"}},
                {"type": "Dense", "params": {"units": units, "input_name": "h", "output_name": "q"}}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn terminal_transitions_keep_their_reward() {
        let targets = q_targets(&[1., 1., 1.], &[0., 0., 1.], &[0., 0., 0.], 0.9);
        assert_eq!(targets, vec![1., 1., 1.]);

        let targets = q_targets(&[2.5], &[1.], &[100.], 0.99);
        assert_eq!(targets, vec![2.5]);

        let targets = q_targets(&[1.], &[0.], &[2.], 0.5);
        assert_eq!(targets, vec![2.]);
    }

    #[test]
    fn vector_outputs_are_rejected_before_training() {
        let layout = q_net(json!([{"name": "state", "shape": [-1, 3]}]), 2);
        let mut graph = GraphBuilder::new().build(&layout).unwrap();
        let before = graph.params().to_vec();

        assert!(matches!(check_reward_model(&graph), Err(ForgeError::RewardConfig(_))));

        // Broken samples would fail later, the precondition has to fire first
        let samples: Vec<RewardSample> =
            serde_json::from_value(json!([{"state": "??", "action": 0, "reward": 1.0}])).unwrap();
        let err = train_with_reward(
            &mut graph,
            &TrainConfig::default(),
            &samples,
            StdRng::seed_from_u64(0),
        )
        .unwrap_err();

        assert!(matches!(err, ForgeError::RewardConfig(_)));
        assert_eq!(graph.params(), before.as_slice());
    }

    #[test]
    fn reward_training_fits_the_targets() {
        let layout = q_net(json!([{"name": "state", "shape": [-1, 2]}]), 1);
        let mut graph = GraphBuilder::new().with_seed(Some(2)).build(&layout).unwrap();
        let samples: Vec<RewardSample> = serde_json::from_value(json!([
            {"state": [0, 1], "action": 0, "reward": 1.0, "done": true},
            {"state": [1, 0], "action": 1, "reward": 0.0, "done": 1},
            {"state": [1, 1], "action": 1, "reward": 0.5, "done": false, "next_state": [0, 1]}
        ]))
        .unwrap();
        let config = TrainConfig {
            epochs: 40,
            batch_size: 3,
            learning_rate: 1e-2,
            ..TrainConfig::default()
        };

        let report =
            train_with_reward(&mut graph, &config, &samples, StdRng::seed_from_u64(4)).unwrap();

        assert_eq!(report.samples, 3);
        assert!(report.epochs >= 1 && report.epochs <= 40);
        assert!(report.final_loss.unwrap().is_finite());
    }

    fn mse_to(graph: &mut Graph, states: &ArrayD<f32>, targets: &[f32]) -> f32 {
        let q = graph.predict(&[states.clone()], 4).unwrap();
        q[0].iter()
            .zip(targets)
            .map(|(q, t)| (q - t).powi(2))
            .sum::<f32>()
            / targets.len() as f32
    }

    #[test]
    fn terminal_only_training_moves_q_values_to_the_rewards() {
        let layout = q_net(json!([{"name": "state", "shape": [-1, 2]}]), 1);
        let mut graph = GraphBuilder::new().with_seed(Some(5)).build(&layout).unwrap();
        let samples: Vec<RewardSample> = serde_json::from_value(json!([
            {"state": [0, 1], "action": 0, "reward": 1.0, "done": true},
            {"state": [1, 0], "action": 0, "reward": -1.0, "done": true},
            {"state": [1, 1], "action": 0, "reward": 0.5, "done": true},
            {"state": [0, 0], "action": 0, "reward": 0.0, "done": true}
        ]))
        .unwrap();
        let rewards = [1., -1., 0.5, 0.];
        let states =
            ArrayD::from_shape_vec(IxDyn(&[4, 2]), vec![0., 1., 1., 0., 1., 1., 0., 0.]).unwrap();

        let before = mse_to(&mut graph, &states, &rewards);
        let config = TrainConfig {
            epochs: 300,
            batch_size: 4,
            learning_rate: 1e-2,
            ..TrainConfig::default()
        };
        let report =
            train_with_reward(&mut graph, &config, &samples, StdRng::seed_from_u64(6)).unwrap();
        let after = mse_to(&mut graph, &states, &rewards);

        assert!(after < before / 2., "loss went from {before} to {after}");
        assert!(report.final_loss.unwrap() < before);
    }

    #[test]
    fn two_sample_reward_data_trains_through_a_scalar_head() {
        let layout = q_net(json!([{"name": "state", "shape": [-1, 2]}]), 1);
        let mut graph = GraphBuilder::new().with_seed(Some(3)).build(&layout).unwrap();
        let samples: Vec<RewardSample> = serde_json::from_value(json!([
            {"state": [0, 1], "action": 1, "reward": 0.5, "done": true},
            {"state": [1, 1], "action": 0, "reward": 1.0, "next_state": [1, 0], "done": 0}
        ]))
        .unwrap();
        let config = TrainConfig {
            epochs: 5,
            batch_size: 2,
            ..TrainConfig::default()
        };

        let report =
            train_with_reward(&mut graph, &config, &samples, StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(report.samples, 2);
        assert!(report.final_loss.unwrap().is_finite());
    }

    #[test]
    fn explicit_next_actions_keep_their_fraction() {
        // q = action, so the bootstrap value is the next action itself
        let layout: Layout = serde_json::from_value(json!({
            "model_name": "q",
            "inputs": [
                {"name": "state", "shape": [-1, 1]},
                {"name": "action", "shape": [-1, 1]}
            ],
            "outputs": [{"name": "q"}],
            "layers": [
                {"type": "Multiply", "params": {"input_names": ["state", "action"], "output_name": "q"}}
            ]
        }))
        .unwrap();
        let mut graph = GraphBuilder::new().build(&layout).unwrap();
        let samples: Vec<RewardSample> = serde_json::from_value(json!([
            {"state": [1], "action": 2.7, "reward": 0.0, "next_state": [1], "next_action": 0.5},
            {"state": [1], "action": 2.7, "reward": 0.0, "next_state": [1]},
            {"state": [1], "action": 1, "reward": 0.0, "done": true}
        ]))
        .unwrap();

        let shapes = vec![vec![1], vec![1]];
        let values = bootstrap_values(&mut graph, &samples, &shapes, 4).unwrap();
        assert_eq!(values, vec![0.5, 2., 0.]);
    }

    #[test]
    fn action_inputs_are_fed_alongside_states() {
        let layout: Layout = serde_json::from_value(json!({
            "model_name": "q",
            "inputs": [
                {"name": "state", "shape": [-1, 2]},
                {"name": "action", "shape": [-1, 1], "dtype": "int32"}
            ],
            "outputs": [{"name": "q"}],
            "layers": [
                {"type": "Dense", "params": {"units": 4, "input_name": "state", "output_name": "hs"}},
                {"type": "Dense", "params": {"units": 4, "input_name": "action", "output_name": "ha"}},
                {"type": "Add", "params": {"input_names": ["hs", "ha"], "output_name": "h"}},
                {"type": "Dense", "params": {"units": 1, "input_name": "h", "output_name": "q"}}
            ]
        }))
        .unwrap();
        let mut graph = GraphBuilder::new().with_seed(Some(8)).build(&layout).unwrap();
        let samples: Vec<RewardSample> = serde_json::from_value(json!([
            {"state": [0, 1], "action": 1, "reward": 1.0, "next_state": [1, 1]},
            {"state": [1, 1], "action": 0, "reward": 0.0, "next_state": [1, 0], "next_action": 1},
            {"state": [1, 0], "action": 1, "reward": 2.0, "done": 1}
        ]))
        .unwrap();
        let config = TrainConfig {
            epochs: 3,
            ..TrainConfig::default()
        };

        let report =
            train_with_reward(&mut graph, &config, &samples, StdRng::seed_from_u64(4)).unwrap();
        assert_eq!(report.samples, 3);
    }
}
