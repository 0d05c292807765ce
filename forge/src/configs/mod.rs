mod json;
mod layers;
mod layout;
mod training;

pub use json::{read_json, write_json};
pub use layers::{
    ActivationParams, BatchNormParams, ConvParams, DenseParams, DropoutParams, IntOrList,
    IoParams, LayerKind, MergeParams, PaddingConfig, PermuteParams, PoolParams,
};
pub use layout::{DType, Domain, InputSpec, LayerEntry, Layout, OutputSpec};
pub use training::{Done, RewardSample, SupervisedData, TrainConfig, TrainingData};
