use std::path::Path;

use machine_learning::arch::Graph;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::{LayerKind, read_json, write_json};
use crate::{ForgeError, Result};

/// A declarative description of a model's inputs, layer graph and outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    #[serde(default)]
    pub model_name: String,
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
    #[serde(default)]
    pub layers: Vec<LayerEntry>,
}

impl Layout {
    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self, 2)
    }

    /// Rebuilds the layout of a built graph.
    ///
    /// Inputs are declared as `float32` data with a dynamic batch dimension, since a graph
    /// doesn't keep how its inputs were cast.
    ///
    /// # Errors
    /// `ForgeError::InvalidLayout` if a node refers to a tensor the graph doesn't define.
    pub fn from_graph(graph: &Graph) -> Result<Self> {
        let name_of = |id: usize| {
            graph
                .tensor_name(id)
                .map(str::to_string)
                .ok_or_else(|| ForgeError::InvalidLayout(format!("tensor #{id} isn't defined")))
        };

        let inputs = graph
            .input_names()
            .into_iter()
            .zip(graph.input_shapes())
            .map(|(name, shape)| InputSpec {
                name: name.to_string(),
                shape: std::iter::once(-1)
                    .chain(shape.iter().map(|&d| d as i64))
                    .collect(),
                dtype: DType::Float32,
                domain: Domain::Data,
            })
            .collect();

        let outputs = graph
            .output_names()
            .into_iter()
            .map(|name| OutputSpec {
                name: name.to_string(),
            })
            .collect();

        let layers = graph
            .nodes()
            .map(|node| {
                let inputs = node.inputs.iter().map(|&i| name_of(i)).collect::<Result<_>>()?;
                let kind = LayerKind::from_layer(node.layer, inputs, name_of(node.output)?);
                LayerEntry::try_from(&kind)
            })
            .collect::<Result<_>>()?;

        Ok(Self {
            model_name: graph.name().to_string(),
            inputs,
            outputs,
            layers,
        })
    }

    /// Looks up a declared input by name.
    pub fn input(&self, name: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|i| i.name == name)
    }
}

/// A model input placeholder. `shape[0]` is the batch dimension, usually `-1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    pub shape: Vec<i64>,
    #[serde(default)]
    pub dtype: DType,
    #[serde(default, alias = "input_type")]
    pub domain: Domain,
}

impl InputSpec {
    /// The shape of a single sample, that is, `shape` without its batch dimension.
    ///
    /// # Errors
    /// `ForgeError::InvalidLayout` if there's no batch dimension and
    /// `ForgeError::DynamicDimension` if any feature dimension isn't positive.
    pub fn feature_shape(&self) -> Result<Vec<usize>> {
        let Some((_, features)) = self.shape.split_first() else {
            return Err(ForgeError::InvalidLayout(format!(
                "input '{}' has an empty shape, the batch dimension is required",
                self.name
            )));
        };

        features
            .iter()
            .map(|&d| usize::try_from(d).ok().filter(|&d| d > 0))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| ForgeError::DynamicDimension {
                name: self.name.clone(),
                shape: self.shape.clone(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
}

/// The declared element type of an input. All computation happens in `f32`, the dtype
/// only decides how raw values are cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    Uint8,
    #[default]
    Float32,
    Float64,
    Double,
    Int32,
    Int64,
}

impl DType {
    pub fn name(&self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Uint8 => "uint8",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Double => "double",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::Float32 | DType::Float64 | DType::Double)
    }

    /// Casts a raw value the way a conversion to this dtype would.
    ///
    /// Integer types truncate toward zero and saturate at their bounds.
    pub fn cast(&self, v: f32) -> f32 {
        match self {
            DType::Float32 | DType::Float64 | DType::Double => v,
            DType::Bool => (v != 0.) as u8 as f32,
            DType::Uint8 => v as u8 as f32,
            DType::Int32 => v as i32 as f32,
            DType::Int64 => v as i64 as f32,
        }
    }
}

/// Where the values of an input come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    #[default]
    Data,
    Image,
}

/// A raw layer entry, kept as written so layouts round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl LayerEntry {
    /// Decodes this entry into its typed variant.
    ///
    /// # Arguments
    /// * `index` - The entry's position in the layout, used in errors.
    ///
    /// # Errors
    /// `ForgeError::UnsupportedLayer` if the type isn't in the registry and
    /// `ForgeError::InvalidLayerParams` if its params don't match the type.
    pub fn decode(&self, index: usize) -> Result<LayerKind> {
        if !LayerKind::NAMES.contains(&self.kind.as_str()) {
            return Err(ForgeError::UnsupportedLayer {
                index,
                kind: self.kind.clone(),
            });
        }

        let tagged = json!({ "type": self.kind, "params": self.params });
        serde_json::from_value(tagged).map_err(|e| ForgeError::InvalidLayerParams {
            index,
            kind: self.kind.clone(),
            msg: e.to_string(),
        })
    }
}

impl TryFrom<&LayerKind> for LayerEntry {
    type Error = ForgeError;

    fn try_from(kind: &LayerKind) -> Result<Self> {
        let invalid = |msg: String| ForgeError::InvalidLayout(msg);

        let value = serde_json::to_value(kind).map_err(|e| invalid(e.to_string()))?;
        let Value::Object(mut tagged) = value else {
            return Err(invalid(format!("{kind:?} didn't serialize to an object")));
        };

        let kind = match tagged.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => return Err(invalid("layer without a type".into())),
        };
        let params = match tagged.remove("params") {
            Some(Value::Object(params)) => params,
            _ => Map::new(),
        };

        Ok(Self { kind, params })
    }
}

#[cfg(test)]
mod tests {
    use super::{DType, Domain, Layout};
    use crate::{ForgeError, builder::GraphBuilder, configs::LayerKind};

    const LAYOUT: &str = r#"{
        "model_name": "tiny",
        "inputs": [
            {"name": "state", "shape": [-1, 4], "dtype": "float32", "input_type": "data"},
            {"name": "frame", "shape": [-1, 8, 8, 3], "dtype": "uint8", "domain": "image"},
            {"name": "raw", "shape": [-1, 2]}
        ],
        "outputs": [{"name": "q"}],
        "layers": [
            {"type": "Dense", "params": {"units": 1, "input_name": "state", "output_name": "q"}}
        ]
    }"#;

    #[test]
    fn parses_inputs_with_defaults_and_aliases() {
        let layout: Layout = serde_json::from_str(LAYOUT).unwrap();

        assert_eq!(layout.inputs[0].domain, Domain::Data);
        assert_eq!(layout.inputs[1].dtype, DType::Uint8);
        assert_eq!(layout.inputs[1].domain, Domain::Image);
        assert_eq!(layout.inputs[2].dtype, DType::Float32);
        assert_eq!(layout.inputs[1].feature_shape().unwrap(), vec![8, 8, 3]);
    }

    #[test]
    fn layout_round_trips_unchanged() {
        let layout: Layout = serde_json::from_str(LAYOUT).unwrap();
        let json = serde_json::to_string(&layout).unwrap();
        let again: Layout = serde_json::from_str(&json).unwrap();
        assert_eq!(layout, again);
    }

    #[test]
    fn built_graphs_describe_their_layout() {
        let layout: Layout = serde_json::from_value(serde_json::json!({
            "model_name": "cnn",
            "inputs": [
                {"name": "img", "shape": [-1, 6, 6, 2]},
                {"name": "seq", "shape": [-1, 5, 2]}
            ],
            "outputs": [{"name": "out"}, {"name": "s"}],
            "layers": [
                {"type": "Conv2D", "params": {"filters": 3, "kernel_size": [3, 3], "strides": [1, 1], "padding": "same", "activation": "relu", "input_name": "img", "output_name": "c"}},
                {"type": "MaxPooling2D", "params": {"pool_size": [2, 2], "strides": [2, 2], "input_name": "c", "output_name": "p"}},
                {"type": "BatchNormalization", "params": {"momentum": 0.9, "epsilon": 0.001, "input_name": "p", "output_name": "bn"}},
                {"type": "Permute", "params": {"dims": [3, 1, 2], "input_name": "bn", "output_name": "chw"}},
                {"type": "Flatten", "params": {"input_name": "chw", "output_name": "flat"}},
                {"type": "Dropout", "params": {"rate": 0.25, "seed": 4, "input_name": "flat", "output_name": "drop"}},
                {"type": "Dense", "params": {"units": 2, "activation": "softmax", "input_name": "drop", "output_name": "out"}},
                {"type": "Conv1D", "params": {"filters": 2, "kernel_size": 2, "strides": 1, "input_name": "seq", "output_name": "s1"}},
                {"type": "Activation", "params": {"activation": "tanh", "input_name": "s1", "output_name": "s2"}},
                {"type": "Multiply", "params": {"input_names": ["s1", "s2"], "output_name": "s"}}
            ]
        }))
        .unwrap();

        let graph = GraphBuilder::new().with_seed(Some(1)).build(&layout).unwrap();
        let rebuilt = Layout::from_graph(&graph).unwrap();

        assert_eq!(rebuilt.model_name, "cnn");
        assert_eq!(rebuilt.inputs, layout.inputs);
        assert_eq!(rebuilt.outputs, layout.outputs);
        let kinds = |l: &Layout| -> Vec<LayerKind> {
            l.layers.iter().enumerate().map(|(i, e)| e.decode(i).unwrap()).collect()
        };
        assert_eq!(kinds(&rebuilt), kinds(&layout));

        let again = GraphBuilder::new().build(&rebuilt).unwrap();
        assert_eq!(again.size(), graph.size());
    }

    #[test]
    fn dynamic_feature_dimensions_are_rejected() {
        let mut layout: Layout = serde_json::from_str(LAYOUT).unwrap();
        layout.inputs[0].shape = vec![-1, -1, 4];
        assert!(matches!(
            layout.inputs[0].feature_shape(),
            Err(ForgeError::DynamicDimension { .. })
        ));
    }

    #[test]
    fn unknown_dtypes_are_rejected() {
        let bad = LAYOUT.replace("\"uint8\"", "\"float16\"");
        assert!(serde_json::from_str::<Layout>(&bad).is_err());
    }

    #[test]
    fn casts_follow_the_dtype() {
        assert_eq!(DType::Int32.cast(-2.7), -2.);
        assert_eq!(DType::Uint8.cast(300.), 255.);
        assert_eq!(DType::Uint8.cast(-4.), 0.);
        assert_eq!(DType::Bool.cast(0.3), 1.);
        assert_eq!(DType::Float32.cast(0.3), 0.3);
    }
}
