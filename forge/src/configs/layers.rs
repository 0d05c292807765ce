use machine_learning::arch::layers::{Layer, MergeOp, Padding};
use serde::{Deserialize, Serialize};

/// A decoded layout layer entry, one variant per supported layer type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum LayerKind {
    Add(MergeParams),
    Multiply(MergeParams),
    Dense(DenseParams),
    Flatten(IoParams),
    Activation(ActivationParams),
    Dropout(DropoutParams),
    Conv1D(ConvParams),
    Conv2D(ConvParams),
    MaxPooling2D(PoolParams),
    BatchNormalization(BatchNormParams),
    Permute(PermuteParams),
}

impl LayerKind {
    /// Every layer type name a layout may use.
    pub const NAMES: &[&str] = &[
        "Add",
        "Multiply",
        "Dense",
        "Flatten",
        "Activation",
        "Dropout",
        "Conv1D",
        "Conv2D",
        "MaxPooling2D",
        "BatchNormalization",
        "Permute",
    ];

    /// The names of the tensors this layer consumes.
    pub fn inputs(&self) -> Vec<&str> {
        match self {
            LayerKind::Add(p) | LayerKind::Multiply(p) => {
                p.input_names.iter().map(String::as_str).collect()
            }
            _ => self.io().map(|io| vec![io.input_name.as_str()]).unwrap_or_default(),
        }
    }

    /// The name of the tensor this layer defines.
    pub fn output_name(&self) -> &str {
        match self {
            LayerKind::Add(p) | LayerKind::Multiply(p) => &p.output_name,
            _ => self.io().map(|io| io.output_name.as_str()).unwrap_or_default(),
        }
    }

    /// Renames every tensor reference, inputs and output alike.
    pub fn rename_tensors(&mut self, mut f: impl FnMut(&str) -> Option<String>) {
        let mut rename = |name: &mut String| {
            if let Some(new) = f(name) {
                *name = new;
            }
        };

        match self {
            LayerKind::Add(p) | LayerKind::Multiply(p) => {
                p.input_names.iter_mut().for_each(&mut rename);
                rename(&mut p.output_name);
            }
            _ => {
                if let Some(io) = self.io_mut() {
                    rename(&mut io.input_name);
                    rename(&mut io.output_name);
                }
            }
        }
    }

    /// Describes a built layer as a layout entry, the inverse of what the graph builder does.
    ///
    /// # Arguments
    /// * `layer` - The layer.
    /// * `inputs` - The names of the tensors it consumes.
    /// * `output` - The name of the tensor it defines.
    pub fn from_layer(layer: &Layer, inputs: Vec<String>, output: String) -> Self {
        let io = IoParams {
            input_name: inputs.first().cloned().unwrap_or_default(),
            output_name: output.clone(),
        };
        let activation = |name: &str| (name != "linear").then(|| name.to_string());

        match layer {
            Layer::Merge(merge) => {
                let params = MergeParams {
                    input_names: inputs,
                    output_name: output,
                };
                match merge.op() {
                    MergeOp::Add => LayerKind::Add(params),
                    MergeOp::Multiply => LayerKind::Multiply(params),
                }
            }
            Layer::Dense(dense) => LayerKind::Dense(DenseParams {
                units: dense.units(),
                activation: activation(dense.act_fn().name()),
                io,
            }),
            Layer::Flatten(_) => LayerKind::Flatten(io),
            Layer::Activation(a) => LayerKind::Activation(ActivationParams {
                activation: a.act_fn().name().to_string(),
                io,
            }),
            Layer::Dropout(dropout) => LayerKind::Dropout(DropoutParams {
                rate: dropout.rate(),
                seed: dropout.seed(),
                io,
            }),
            Layer::Conv(conv) => {
                let ((kh, kw), (sh, sw)) = (conv.kernel(), conv.strides());
                let (kernel_size, strides) = if conv.is_1d() {
                    (IntOrList::Int(kw), IntOrList::Int(sw))
                } else {
                    (IntOrList::List(vec![kh, kw]), IntOrList::List(vec![sh, sw]))
                };
                let params = ConvParams {
                    filters: conv.filters(),
                    kernel_size,
                    strides,
                    padding: conv.padding().into(),
                    activation: activation(conv.act_fn().name()),
                    io,
                };

                if conv.is_1d() {
                    LayerKind::Conv1D(params)
                } else {
                    LayerKind::Conv2D(params)
                }
            }
            Layer::MaxPool2d(pool) => {
                let ((ph, pw), (sh, sw)) = (pool.pool(), pool.strides());
                LayerKind::MaxPooling2D(PoolParams {
                    pool_size: IntOrList::List(vec![ph, pw]),
                    strides: IntOrList::List(vec![sh, sw]),
                    padding: pool.padding().into(),
                    io,
                })
            }
            Layer::BatchNorm(bn) => LayerKind::BatchNormalization(BatchNormParams {
                momentum: bn.momentum(),
                epsilon: bn.epsilon(),
                io,
            }),
            Layer::Permute(permute) => LayerKind::Permute(PermuteParams {
                dims: permute.dims().iter().map(|d| d + 1).collect(),
                io,
            }),
        }
    }

    fn io(&self) -> Option<&IoParams> {
        match self {
            LayerKind::Flatten(io) => Some(io),
            LayerKind::Dense(p) => Some(&p.io),
            LayerKind::Activation(p) => Some(&p.io),
            LayerKind::Dropout(p) => Some(&p.io),
            LayerKind::Conv1D(p) | LayerKind::Conv2D(p) => Some(&p.io),
            LayerKind::MaxPooling2D(p) => Some(&p.io),
            LayerKind::BatchNormalization(p) => Some(&p.io),
            LayerKind::Permute(p) => Some(&p.io),
            LayerKind::Add(_) | LayerKind::Multiply(_) => None,
        }
    }

    fn io_mut(&mut self) -> Option<&mut IoParams> {
        match self {
            LayerKind::Flatten(io) => Some(io),
            LayerKind::Dense(p) => Some(&mut p.io),
            LayerKind::Activation(p) => Some(&mut p.io),
            LayerKind::Dropout(p) => Some(&mut p.io),
            LayerKind::Conv1D(p) | LayerKind::Conv2D(p) => Some(&mut p.io),
            LayerKind::MaxPooling2D(p) => Some(&mut p.io),
            LayerKind::BatchNormalization(p) => Some(&mut p.io),
            LayerKind::Permute(p) => Some(&mut p.io),
            LayerKind::Add(_) | LayerKind::Multiply(_) => None,
        }
    }
}

/// The single input and output of most layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoParams {
    pub input_name: String,
    pub output_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeParams {
    pub input_names: Vec<String>,
    pub output_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenseParams {
    pub units: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation: Option<String>,
    #[serde(flatten)]
    pub io: IoParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationParams {
    pub activation: String,
    #[serde(flatten)]
    pub io: IoParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropoutParams {
    pub rate: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(flatten)]
    pub io: IoParams,
}

/// Params shared by `Conv1D` and `Conv2D`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvParams {
    pub filters: usize,
    pub kernel_size: IntOrList,
    #[serde(default = "IntOrList::one")]
    pub strides: IntOrList,
    #[serde(default)]
    pub padding: PaddingConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation: Option<String>,
    #[serde(flatten)]
    pub io: IoParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolParams {
    #[serde(default = "IntOrList::two")]
    pub pool_size: IntOrList,
    #[serde(default = "IntOrList::two")]
    pub strides: IntOrList,
    #[serde(default)]
    pub padding: PaddingConfig,
    #[serde(flatten)]
    pub io: IoParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNormParams {
    #[serde(default = "default_momentum")]
    pub momentum: f32,
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
    #[serde(flatten)]
    pub io: IoParams,
}

fn default_momentum() -> f32 {
    0.99
}

fn default_epsilon() -> f32 {
    1e-3
}

/// A permutation of the feature axes, numbered from 1 since axis 0 is the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermuteParams {
    pub dims: Vec<usize>,
    #[serde(flatten)]
    pub io: IoParams,
}

/// A window or stride size, written either as a single integer or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntOrList {
    Int(usize),
    List(Vec<usize>),
}

impl IntOrList {
    fn one() -> Self {
        IntOrList::Int(1)
    }

    fn two() -> Self {
        IntOrList::List(vec![2, 2])
    }

    /// The value for a two dimensional window, a single integer applies to both axes.
    pub fn pair(&self) -> Option<(usize, usize)> {
        match self {
            IntOrList::Int(n) => Some((*n, *n)),
            IntOrList::List(v) => match v.as_slice() {
                &[n] => Some((n, n)),
                &[h, w] => Some((h, w)),
                _ => None,
            },
        }
    }

    /// The value for a one dimensional window.
    pub fn single(&self) -> Option<usize> {
        match self {
            IntOrList::Int(n) => Some(*n),
            IntOrList::List(v) => match v.as_slice() {
                &[n] => Some(n),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaddingConfig {
    #[default]
    Valid,
    Same,
}

impl From<Padding> for PaddingConfig {
    fn from(p: Padding) -> Self {
        match p {
            Padding::Valid => PaddingConfig::Valid,
            Padding::Same => PaddingConfig::Same,
        }
    }
}

impl From<PaddingConfig> for Padding {
    fn from(p: PaddingConfig) -> Self {
        match p {
            PaddingConfig::Valid => Padding::Valid,
            PaddingConfig::Same => Padding::Same,
        }
    }
}
