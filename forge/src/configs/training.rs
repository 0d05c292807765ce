use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hyperparameters of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
    #[serde(default)]
    pub validation_split: f32,
    /// The discount factor of reward training.
    #[serde(default = "default_gamma")]
    pub gamma: f32,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            shuffle: default_shuffle(),
            validation_split: 0.,
            gamma: default_gamma(),
        }
    }
}

fn default_epochs() -> usize {
    1
}

fn default_batch_size() -> usize {
    32
}

fn default_learning_rate() -> f32 {
    1e-3
}

fn default_shuffle() -> bool {
    true
}

fn default_gamma() -> f32 {
    0.95
}

/// Labeled samples keyed by tensor name, values are nested arrays or image paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisedData {
    pub inputs: BTreeMap<String, Value>,
    pub labels: BTreeMap<String, Value>,
}

/// One transition of reward training data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardSample {
    pub state: Value,
    pub action: Value,
    pub reward: f32,
    #[serde(default)]
    pub next_state: Option<Value>,
    #[serde(default)]
    pub next_action: Option<Value>,
    #[serde(default)]
    pub done: Option<Done>,
}

impl RewardSample {
    /// Whether the episode ended with this transition, as `0.` or `1.`.
    pub fn done(&self) -> f32 {
        match self.done {
            Some(Done::Flag(true)) => 1.,
            Some(Done::Flag(false)) | None => 0.,
            Some(Done::Value(v)) => v,
        }
    }
}

/// The end of episode marker, written as a boolean or a number.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Done {
    Flag(bool),
    Value(f32),
}

/// A training data file, its json shape selects the training mode.
///
/// `Reward` is tried first: a struct also deserializes from a json array of as many elements
/// as it has fields, so a two sample reward file would otherwise parse as supervised data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrainingData {
    Reward(Vec<RewardSample>),
    Supervised(SupervisedData),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{TrainConfig, TrainingData};

    #[test]
    fn missing_config_keys_take_defaults() {
        let config: TrainConfig = serde_json::from_value(json!({"epochs": 3})).unwrap();
        assert_eq!(
            config,
            TrainConfig {
                epochs: 3,
                ..TrainConfig::default()
            }
        );
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.gamma, 0.95);
    }

    #[test]
    fn data_shape_selects_the_mode() {
        let supervised: TrainingData = serde_json::from_value(json!({
            "inputs": {"x": [[0, 1]]},
            "labels": {"y": [[1]]}
        }))
        .unwrap();
        assert!(matches!(supervised, TrainingData::Supervised(_)));

        let reward: TrainingData = serde_json::from_value(json!([
            {"state": [0, 1], "action": 1, "reward": 0.5, "done": true},
            {"state": [1, 1], "action": 0, "reward": 1.0, "next_state": [1, 0], "done": 0}
        ]))
        .unwrap();
        let TrainingData::Reward(samples) = reward else {
            panic!("expected reward data");
        };
        assert_eq!(samples[0].done(), 1.);
        assert_eq!(samples[1].done(), 0.);
        assert!(samples[1].next_state.is_some());
    }

    #[test]
    fn reward_arrays_of_any_length_are_reward_data() {
        let sample = json!({"state": [0.5, -0.5], "action": 0, "reward": 1.0, "done": true});

        for len in 1..=3 {
            let samples = vec![sample.clone(); len];
            let data: TrainingData = serde_json::from_value(json!(samples)).unwrap();
            let TrainingData::Reward(samples) = data else {
                panic!("{len} samples parsed as supervised data");
            };
            assert_eq!(samples.len(), len);
        }
    }

    #[test]
    fn unrelated_json_is_rejected() {
        assert!(serde_json::from_value::<TrainingData>(json!({"foo": 1})).is_err());
    }
}
