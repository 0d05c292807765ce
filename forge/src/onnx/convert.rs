use std::{
    collections::{HashMap, HashSet},
    fs,
    path::Path,
};

use log::{debug, info};
use machine_learning::arch::{Graph, layers::Padding};
use ndarray::{Array1, ArrayD, Ix2, IxDyn};
use prost::Message;

use super::proto::{AttributeProto, GraphProto, ModelProto, NodeProto, TensorProto, data_type};
use crate::{
    ForgeError, Result,
    builder::GraphBuilder,
    configs::{
        ActivationParams, BatchNormParams, ConvParams, DType, DenseParams, Domain, InputSpec,
        IntOrList, IoParams, LayerEntry, LayerKind, Layout, MergeParams, OutputSpec,
        PaddingConfig, PermuteParams, PoolParams,
    },
    signature::{DEFAULT_SIGNATURE, IoNames, extract_tensor_names, write_io_names},
    snapshot,
};

/// Converts the ONNX model at `onnx_path` into a snapshot at `out_dir`.
///
/// # Returns
/// The io names of the new snapshot, also written next to it.
pub fn convert_onnx_file(onnx_path: &Path, out_dir: &Path) -> Result<IoNames> {
    let bytes = fs::read(onnx_path).map_err(|e| ForgeError::io(onnx_path, e))?;
    let model = ModelProto::decode(bytes.as_slice())?;
    let (layout, graph) = convert(&model)?;

    info!(
        "input names: {:?}, output names: {:?}",
        graph.input_names(),
        graph.output_names()
    );

    snapshot::save(out_dir, &layout, &graph)?;
    let names = extract_tensor_names(out_dir, DEFAULT_SIGNATURE)?;
    write_io_names(out_dir, &names, 2)?;

    Ok(names)
}

/// Converts a decoded ONNX model into a layout and the graph built from it, weights
/// included.
///
/// Channels first ONNX tensors are bridged to the channels last layers with `Permute`
/// layers, so the converted model takes and returns tensors shaped like the ONNX one.
pub fn convert(model: &ModelProto) -> Result<(Layout, Graph)> {
    let onnx = model
        .graph
        .as_ref()
        .ok_or_else(|| ForgeError::Onnx("the model has no graph".into()))?;

    let opset = model
        .opset_import
        .iter()
        .find(|o| o.domain.is_empty() || o.domain == "ai.onnx")
        .map(|o| o.version)
        .unwrap_or(13);

    let mut converter = Converter::new(onnx, opset);
    let inputs = converter.declare_inputs()?;

    for (i, node) in onnx.node.iter().enumerate() {
        if converter.folded.contains(&i) {
            continue;
        }

        converter.convert_node(i, node).map_err(|e| match e {
            ForgeError::Onnx(msg) => {
                ForgeError::Onnx(format!("node '{}' ({}): {msg}", node.name, node.op_type))
            }
            e => e,
        })?;
    }

    let outputs = converter.declare_outputs()?;
    let layers = converter
        .layers
        .iter()
        .map(LayerEntry::try_from)
        .collect::<Result<Vec<_>>>()?;

    let model_name = if onnx.name.is_empty() {
        "converted".to_string()
    } else {
        onnx.name.clone()
    };

    let layout = Layout {
        model_name,
        inputs,
        outputs,
        layers,
    };

    let mut graph = GraphBuilder::new().with_seed(Some(0)).build(&layout)?;
    converter.load_weights(&mut graph)?;

    info!(
        "converted {} onnx nodes into {} layers",
        onnx.node.len(),
        layout.layers.len()
    );
    Ok((layout, graph))
}

/// An ONNX tensor as seen by the layout.
///
/// `shape` is the ONNX feature shape. When `channels_last` is set, the layout tensor holds
/// the same values with the channel axis moved to the end.
#[derive(Debug, Clone)]
struct TensorRef {
    name: String,
    shape: Vec<usize>,
    channels_last: bool,
}

struct Converter<'a> {
    onnx: &'a GraphProto,
    opset: i64,
    initializers: HashMap<&'a str, &'a TensorProto>,
    consumers: HashMap<&'a str, Vec<usize>>,
    graph_outputs: HashSet<&'a str>,

    tensors: HashMap<String, TensorRef>,
    used: HashSet<String>,
    permuted: HashMap<(String, bool), TensorRef>,
    layers: Vec<LayerKind>,
    weights: HashMap<String, ArrayD<f32>>,
    folded: HashSet<usize>,
}

impl<'a> Converter<'a> {
    fn new(onnx: &'a GraphProto, opset: i64) -> Self {
        let initializers: HashMap<_, _> = onnx
            .initializer
            .iter()
            .map(|t| (t.name.as_str(), t))
            .collect();

        let mut consumers: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, node) in onnx.node.iter().enumerate() {
            for input in &node.input {
                consumers.entry(input.as_str()).or_default().push(i);
            }
        }

        let used = onnx
            .input
            .iter()
            .chain(&onnx.output)
            .map(|v| v.name.clone())
            .chain(onnx.node.iter().flat_map(|n| n.output.iter().cloned()))
            .chain(initializers.keys().map(|k| k.to_string()))
            .collect();

        Self {
            onnx,
            opset,
            initializers,
            consumers,
            graph_outputs: onnx.output.iter().map(|v| v.name.as_str()).collect(),
            tensors: HashMap::new(),
            used,
            permuted: HashMap::new(),
            layers: Vec::new(),
            weights: HashMap::new(),
            folded: HashSet::new(),
        }
    }

    fn declare_inputs(&mut self) -> Result<Vec<InputSpec>> {
        let onnx = self.onnx;
        let mut inputs = Vec::new();

        for value in &onnx.input {
            if self.initializers.contains_key(value.name.as_str()) {
                continue;
            }

            let tensor_type = value
                .r#type
                .as_ref()
                .and_then(|t| t.tensor_type.as_ref())
                .ok_or_else(|| ForgeError::Onnx(format!("input '{}' isn't a tensor", value.name)))?;

            let dtype = match tensor_type.elem_type {
                data_type::FLOAT => DType::Float32,
                data_type::DOUBLE => DType::Float64,
                data_type::INT32 => DType::Int32,
                data_type::INT64 => DType::Int64,
                data_type::UINT8 => DType::Uint8,
                data_type::BOOL => DType::Bool,
                other => {
                    return Err(ForgeError::Onnx(format!(
                        "input '{}' has unsupported element type {other}",
                        value.name
                    )));
                }
            };

            let mut shape: Vec<i64> = tensor_type
                .shape
                .iter()
                .flat_map(|s| &s.dim)
                .map(|d| d.dim_value.filter(|&v| v > 0).unwrap_or(-1))
                .collect();
            if let Some(batch) = shape.first_mut() {
                *batch = -1;
            }

            let spec = InputSpec {
                name: value.name.clone(),
                shape,
                dtype,
                domain: Domain::Data,
            };

            let features = spec.feature_shape()?;
            debug!("input '{}' with feature shape {features:?}", spec.name);
            self.tensors.insert(
                spec.name.clone(),
                TensorRef {
                    name: spec.name.clone(),
                    shape: features,
                    channels_last: false,
                },
            );
            inputs.push(spec);
        }

        Ok(inputs)
    }

    fn declare_outputs(&mut self) -> Result<Vec<OutputSpec>> {
        let onnx = self.onnx;
        let mut outputs = Vec::new();

        for value in &onnx.output {
            let r = self.lookup("outputs", &value.name)?;
            let r = self.permute(&r, false, Some(&value.name));

            if r.name != value.name {
                let io = IoParams {
                    input_name: r.name.clone(),
                    output_name: value.name.clone(),
                };
                self.layers.push(LayerKind::Activation(ActivationParams {
                    activation: "linear".into(),
                    io,
                }));
            }

            outputs.push(OutputSpec {
                name: value.name.clone(),
            });
        }

        Ok(outputs)
    }

    fn load_weights(&self, graph: &mut Graph) -> Result<()> {
        for p in graph.named_params() {
            let w = self
                .weights
                .get(&p.name)
                .ok_or_else(|| ForgeError::Onnx(format!("no weights for '{}'", p.name)))?;

            if w.shape() != p.shape.as_slice() {
                return Err(ForgeError::Onnx(format!(
                    "weights for '{}' have shape {:?}, expected {:?}",
                    p.name,
                    w.shape(),
                    p.shape
                )));
            }

            let dst = &mut graph.params_mut()[p.range];
            dst.iter_mut().zip(w.iter()).for_each(|(d, &v)| *d = v);
        }

        Ok(())
    }

    fn convert_node(&mut self, index: usize, node: &NodeProto) -> Result<()> {
        if !node.domain.is_empty() && node.domain != "ai.onnx" {
            return Err(ForgeError::Onnx(format!("unsupported domain '{}'", node.domain)));
        }

        match node.op_type.as_str() {
            "Gemm" => self.gemm(node),
            "MatMul" => self.matmul(index, node),
            "Add" => self.merge(node, false),
            "Mul" => self.merge(node, true),
            "Relu" | "Sigmoid" | "Tanh" | "Elu" | "Selu" | "Softplus" | "Softsign" => {
                self.activation(node)
            }
            "Softmax" => self.softmax(node),
            "Flatten" => self.flatten(node),
            "Conv" => self.conv(node),
            "MaxPool" => self.max_pool(node),
            "BatchNormalization" => self.batch_norm(node),
            "Dropout" | "Identity" => self.alias(node),
            other => Err(ForgeError::Onnx(format!("unsupported op '{other}'"))),
        }
    }

    fn gemm(&mut self, node: &NodeProto) -> Result<()> {
        if attr_int(node, "transA", 0) != 0 {
            return Err(ForgeError::Onnx("transA isn't supported".into()));
        }
        if attr_float(node, "alpha", 1.) != 1. || attr_float(node, "beta", 1.) != 1. {
            return Err(ForgeError::Onnx("alpha and beta must be 1".into()));
        }

        let a = self.input(node, 0)?;
        let &[k] = a.shape.as_slice() else {
            return Err(ForgeError::Onnx(format!(
                "Gemm needs a 2-D input, got feature shape {:?}",
                a.shape
            )));
        };

        let b = self.weight(node, 1)?.into_dimensionality::<Ix2>().map_err(|_| {
            ForgeError::Onnx("the Gemm weight must be a matrix".into())
        })?;
        let kernel = if attr_int(node, "transB", 0) != 0 {
            b.reversed_axes()
        } else {
            b
        };

        if kernel.nrows() != k {
            return Err(ForgeError::Onnx(format!(
                "the Gemm weight has shape {:?}, it can't multiply {k} features",
                kernel.shape()
            )));
        }

        let units = kernel.ncols();
        let bias = match node.input.get(2).filter(|n| !n.is_empty()) {
            Some(_) => broadcast_bias(self.weight(node, 2)?, units)?,
            None => Array1::zeros(units),
        };

        let name = self.layer_name(output(node)?, false);
        self.push_dense(&a, &name, kernel.into_dyn(), bias)?;
        self.tensors.insert(
            output(node)?.to_string(),
            TensorRef {
                name,
                shape: vec![units],
                channels_last: false,
            },
        );

        Ok(())
    }

    fn matmul(&mut self, index: usize, node: &NodeProto) -> Result<()> {
        let a = self.input(node, 0)?;
        let a = self.permute(&a, false, None);
        let k = a.shape.last().copied().unwrap_or(0);

        let kernel = self.weight(node, 1)?.into_dimensionality::<Ix2>().map_err(|_| {
            ForgeError::Onnx("only MatMul by a constant matrix is supported".into())
        })?;
        if kernel.nrows() != k {
            return Err(ForgeError::Onnx(format!(
                "the MatMul weight has shape {:?}, it can't multiply {k} features",
                kernel.shape()
            )));
        }

        let units = kernel.ncols();
        let (out, bias) = match self.foldable_bias(index, node, units) {
            Some((j, out, bias)) => {
                debug!("folding bias of '{out}' into its MatMul");
                self.folded.insert(j);
                (out, bias)
            }
            None => (output(node)?.to_string(), Array1::zeros(units)),
        };

        let mut shape = a.shape.clone();
        if let Some(last) = shape.last_mut() {
            *last = units;
        }

        let name = self.layer_name(&out, false);
        self.push_dense(&a, &name, kernel.into_dyn(), bias)?;
        self.tensors.insert(
            out,
            TensorRef {
                name,
                shape,
                channels_last: false,
            },
        );

        Ok(())
    }

    /// Finds an `Add` of a constant vector as the only consumer of a `MatMul`.
    ///
    /// # Returns
    /// The `Add` node's index, its output and the bias.
    fn foldable_bias(
        &self,
        index: usize,
        node: &NodeProto,
        units: usize,
    ) -> Option<(usize, String, Array1<f32>)> {
        let out = node.output.first()?;
        if self.graph_outputs.contains(out.as_str()) {
            return None;
        }

        let &[j] = self.consumers.get(out.as_str())?.as_slice() else {
            return None;
        };
        let add = self.onnx.node.get(j)?;
        if j <= index || add.op_type != "Add" || add.input.len() != 2 {
            return None;
        }

        let other = add.input.iter().find(|n| *n != out)?;
        let bias = tensor_data(self.initializers.get(other.as_str())?).ok()?;
        if bias.len() != units {
            return None;
        }

        let bias = Array1::from_iter(bias.iter().copied());
        Some((j, add.output.first()?.clone(), bias))
    }

    fn push_dense(
        &mut self,
        a: &TensorRef,
        name: &str,
        kernel: ArrayD<f32>,
        bias: Array1<f32>,
    ) -> Result<()> {
        let units = bias.len();
        self.weights.insert(format!("{name}/kernel"), kernel);
        self.weights.insert(format!("{name}/bias"), bias.into_dyn());
        self.layers.push(LayerKind::Dense(DenseParams {
            units,
            activation: None,
            io: IoParams {
                input_name: a.name.clone(),
                output_name: name.to_string(),
            },
        }));

        Ok(())
    }

    fn merge(&mut self, node: &NodeProto, multiply: bool) -> Result<()> {
        if node.input.len() < 2 {
            return Err(ForgeError::Onnx("elementwise ops need two inputs".into()));
        }

        let mut refs = (0..node.input.len())
            .map(|k| self.input(node, k))
            .collect::<Result<Vec<_>>>()?;

        if refs.iter().any(|r| r.channels_last != refs[0].channels_last) {
            refs = refs.iter().map(|r| self.permute(r, false, None)).collect();
        }

        if refs.iter().any(|r| r.shape != refs[0].shape) {
            return Err(ForgeError::Onnx(format!(
                "broadcasting isn't supported, got shapes {:?}",
                refs.iter().map(|r| &r.shape).collect::<Vec<_>>()
            )));
        }

        let channels_last = refs[0].channels_last;
        let name = self.layer_name(output(node)?, channels_last);
        let params = MergeParams {
            input_names: refs.iter().map(|r| r.name.clone()).collect(),
            output_name: name.clone(),
        };
        self.layers.push(if multiply {
            LayerKind::Multiply(params)
        } else {
            LayerKind::Add(params)
        });

        self.define(node, name, refs[0].shape.clone(), channels_last)
    }

    fn activation(&mut self, node: &NodeProto) -> Result<()> {
        let activation = match node.op_type.as_str() {
            "Relu" => "relu",
            "Sigmoid" => "sigmoid",
            "Tanh" => "tanh",
            "Softplus" => "softplus",
            "Softsign" => "softsign",
            "Elu" => {
                if attr_float(node, "alpha", 1.) != 1. {
                    return Err(ForgeError::Onnx("only Elu with alpha 1 is supported".into()));
                }
                "elu"
            }
            "Selu" => {
                let alpha = attr_float(node, "alpha", 1.673_263_2);
                let gamma = attr_float(node, "gamma", 1.050_701);
                if (alpha - 1.673_263_2).abs() > 1e-4 || (gamma - 1.050_701).abs() > 1e-4 {
                    return Err(ForgeError::Onnx("only the standard Selu is supported".into()));
                }
                "selu"
            }
            other => return Err(ForgeError::Onnx(format!("unsupported activation '{other}'"))),
        };

        let a = self.input(node, 0)?;
        self.push_activation(node, &a, activation)
    }

    fn softmax(&mut self, node: &NodeProto) -> Result<()> {
        let a = self.input(node, 0)?;
        let rank = a.shape.len() as i64 + 1;
        let default = if self.opset >= 13 { -1 } else { 1 };
        let axis = attr_int(node, "axis", default);
        let axis = if axis < 0 { axis + rank } else { axis };

        if axis != rank - 1 {
            return Err(ForgeError::Onnx(format!(
                "softmax over axis {axis} of a rank {rank} tensor isn't supported"
            )));
        }

        let a = self.permute(&a, false, None);
        self.push_activation(node, &a, "softmax")
    }

    fn push_activation(&mut self, node: &NodeProto, a: &TensorRef, activation: &str) -> Result<()> {
        let name = self.layer_name(output(node)?, a.channels_last);
        self.layers.push(LayerKind::Activation(ActivationParams {
            activation: activation.to_string(),
            io: IoParams {
                input_name: a.name.clone(),
                output_name: name.clone(),
            },
        }));

        self.define(node, name, a.shape.clone(), a.channels_last)
    }

    fn flatten(&mut self, node: &NodeProto) -> Result<()> {
        if attr_int(node, "axis", 1) != 1 {
            return Err(ForgeError::Onnx("only Flatten with axis 1 is supported".into()));
        }

        let a = self.input(node, 0)?;
        let a = self.permute(&a, false, None);
        let name = self.layer_name(output(node)?, false);
        self.layers.push(LayerKind::Flatten(IoParams {
            input_name: a.name.clone(),
            output_name: name.clone(),
        }));

        self.define(node, name, vec![a.shape.iter().product()], false)
    }

    fn conv(&mut self, node: &NodeProto) -> Result<()> {
        let x = self.input(node, 0)?;
        let spatial = x.shape.len().saturating_sub(1);
        if !(1..=2).contains(&spatial) {
            return Err(ForgeError::Onnx(format!(
                "only 1-D and 2-D convolutions are supported, got feature shape {:?}",
                x.shape
            )));
        }

        let w = self.weight(node, 1)?;
        let &[filters, channels, ..] = w.shape() else {
            return Err(ForgeError::Onnx("the Conv weight must be [filters, channels, ...]".into()));
        };
        if w.ndim() != spatial + 2 || channels != x.shape[0] {
            return Err(ForgeError::Onnx(format!(
                "the Conv weight has shape {:?}, the input {:?}",
                w.shape(),
                x.shape
            )));
        }

        if attr_int(node, "group", 1) != 1 {
            return Err(ForgeError::Onnx("grouped convolutions aren't supported".into()));
        }
        check_ones(node, "dilations")?;

        let kernel: Vec<usize> = w.shape()[2..].to_vec();
        if let Some(declared) = attr_ints(node, "kernel_shape") {
            if declared.iter().map(|&d| d as usize).ne(kernel.iter().copied()) {
                return Err(ForgeError::Onnx("kernel_shape doesn't match the weight".into()));
            }
        }

        let strides = strides(node, spatial)?;
        let padding = resolve_padding(node, &x.shape[1..], &kernel, &strides)?;
        let out_spatial = out_lens(padding, &x.shape[1..], &kernel, &strides)?;

        let bias = match node.input.get(2).filter(|n| !n.is_empty()) {
            Some(_) => broadcast_bias(self.weight(node, 2)?, filters)?,
            None => Array1::zeros(filters),
        };

        // [filters, channels, k...] -> [k..., channels, filters]
        let axes: Vec<usize> = (2..w.ndim()).chain([1, 0]).collect();
        let kernel_weights = w.permuted_axes(axes).as_standard_layout().into_owned();

        let x = self.permute(&x, true, None);
        let name = self.layer_name(output(node)?, true);
        let io = IoParams {
            input_name: x.name.clone(),
            output_name: name.clone(),
        };

        let layer = if spatial == 1 {
            LayerKind::Conv1D(ConvParams {
                filters,
                kernel_size: IntOrList::Int(kernel[0]),
                strides: IntOrList::Int(strides[0]),
                padding,
                activation: None,
                io,
            })
        } else {
            LayerKind::Conv2D(ConvParams {
                filters,
                kernel_size: IntOrList::List(kernel),
                strides: IntOrList::List(strides),
                padding,
                activation: None,
                io,
            })
        };

        self.layers.push(layer);
        self.weights.insert(format!("{name}/kernel"), kernel_weights);
        self.weights.insert(format!("{name}/bias"), bias.into_dyn());

        let shape = std::iter::once(filters).chain(out_spatial).collect();
        self.define(node, name, shape, true)
    }

    fn max_pool(&mut self, node: &NodeProto) -> Result<()> {
        let x = self.input(node, 0)?;
        if x.shape.len() != 3 {
            return Err(ForgeError::Onnx(format!(
                "only 2-D max pooling is supported, got feature shape {:?}",
                x.shape
            )));
        }
        if node.output.get(1).is_some_and(|n| !n.is_empty()) {
            return Err(ForgeError::Onnx("max pooling indices aren't supported".into()));
        }
        if attr_int(node, "ceil_mode", 0) != 0 {
            return Err(ForgeError::Onnx("ceil_mode isn't supported".into()));
        }
        check_ones(node, "dilations")?;

        let pool: Vec<usize> = attr_ints(node, "kernel_shape")
            .ok_or_else(|| ForgeError::Onnx("kernel_shape is required".into()))?
            .iter()
            .map(|&k| k as usize)
            .collect();
        if pool.len() != 2 {
            return Err(ForgeError::Onnx(format!("expected a 2-D pool, got {pool:?}")));
        }

        let strides = strides(node, 2)?;
        let padding = resolve_padding(node, &x.shape[1..], &pool, &strides)?;
        let out_spatial = out_lens(padding, &x.shape[1..], &pool, &strides)?;
        let channels = x.shape[0];

        let x = self.permute(&x, true, None);
        let name = self.layer_name(output(node)?, true);
        self.layers.push(LayerKind::MaxPooling2D(PoolParams {
            pool_size: IntOrList::List(pool),
            strides: IntOrList::List(strides),
            padding,
            io: IoParams {
                input_name: x.name.clone(),
                output_name: name.clone(),
            },
        }));

        let shape = std::iter::once(channels).chain(out_spatial).collect();
        self.define(node, name, shape, true)
    }

    fn batch_norm(&mut self, node: &NodeProto) -> Result<()> {
        if node.output.iter().skip(1).any(|n| !n.is_empty()) {
            return Err(ForgeError::Onnx("training mode batch normalization isn't supported".into()));
        }

        let x = self.input(node, 0)?;
        let channels = x.shape.first().copied().unwrap_or(0);

        let mut stats = Vec::with_capacity(4);
        for k in 1..=4 {
            let t = self.weight(node, k)?;
            if t.len() != channels {
                return Err(ForgeError::Onnx(format!(
                    "batch normalization input #{k} has {} values for {channels} channels",
                    t.len()
                )));
            }
            stats.push(t.into_shape_with_order(IxDyn(&[channels])).map_err(machine_learning::MlErr::from)?);
        }

        let epsilon = attr_float(node, "epsilon", 1e-5);
        let momentum = attr_float(node, "momentum", 0.9);

        let channels_last = x.shape.len() >= 2;
        let x = self.permute(&x, true, None);
        let name = self.layer_name(output(node)?, channels_last);
        self.layers.push(LayerKind::BatchNormalization(BatchNormParams {
            momentum,
            epsilon,
            io: IoParams {
                input_name: x.name.clone(),
                output_name: name.clone(),
            },
        }));

        for (param, values) in ["gamma", "beta", "moving_mean", "moving_variance"]
            .into_iter()
            .zip(stats)
        {
            self.weights.insert(format!("{name}/{param}"), values);
        }

        self.define(node, name, x.shape.clone(), channels_last)
    }

    fn alias(&mut self, node: &NodeProto) -> Result<()> {
        let a = self.input(node, 0)?;
        self.tensors.insert(output(node)?.to_string(), a);
        Ok(())
    }

    /// Registers the output of the layer just pushed for `node`.
    fn define(
        &mut self,
        node: &NodeProto,
        name: String,
        shape: Vec<usize>,
        channels_last: bool,
    ) -> Result<()> {
        let r = TensorRef {
            name,
            channels_last: channels_last && shape.len() >= 2,
            shape,
        };
        self.tensors.insert(output(node)?.to_string(), r);
        Ok(())
    }

    /// The layout name of a new layer output, its ONNX name unless it holds channels last
    /// values.
    fn layer_name(&mut self, onnx_name: &str, channels_last: bool) -> String {
        if channels_last {
            self.fresh(&format!("{onnx_name}_channels_last"))
        } else {
            onnx_name.to_string()
        }
    }

    fn fresh(&mut self, base: &str) -> String {
        let mut name = base.to_string();
        let mut n = 1;
        while self.used.contains(&name) {
            name = format!("{base}_{n}");
            n += 1;
        }

        self.used.insert(name.clone());
        name
    }

    /// Moves the channel axis of `r` to the end, or back to the front, with a `Permute`.
    fn permute(&mut self, r: &TensorRef, channels_last: bool, name: Option<&str>) -> TensorRef {
        let rank = r.shape.len();
        if r.channels_last == channels_last || rank < 2 {
            return r.clone();
        }

        let key = (r.name.clone(), channels_last);
        if let Some(cached) = self.permuted.get(&key) {
            return cached.clone();
        }

        let dims: Vec<usize> = if channels_last {
            (2..=rank).chain([1]).collect()
        } else {
            std::iter::once(rank).chain(1..rank).collect()
        };

        let name = match name {
            Some(name) if !self.tensors.values().any(|t| t.name == name) => name.to_string(),
            _ => {
                let suffix = if channels_last { "channels_last" } else { "channels_first" };
                self.fresh(&format!("{}_{suffix}", r.name))
            }
        };

        self.layers.push(LayerKind::Permute(PermuteParams {
            dims,
            io: IoParams {
                input_name: r.name.clone(),
                output_name: name.clone(),
            },
        }));

        let permuted = TensorRef {
            name,
            shape: r.shape.clone(),
            channels_last,
        };
        self.permuted.insert(key, permuted.clone());
        permuted
    }

    fn lookup(&self, layer: &str, name: &str) -> Result<TensorRef> {
        if let Some(r) = self.tensors.get(name) {
            return Ok(r.clone());
        }

        if self.initializers.contains_key(name) {
            return Err(ForgeError::Onnx(format!(
                "constant operand '{name}' isn't supported here"
            )));
        }

        Err(ForgeError::UndefinedTensor {
            layer: layer.to_string(),
            name: name.to_string(),
        })
    }

    fn input(&self, node: &NodeProto, k: usize) -> Result<TensorRef> {
        let name = node
            .input
            .get(k)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ForgeError::Onnx(format!("missing input #{k}")))?;
        self.lookup(&node.name, name)
    }

    fn weight(&self, node: &NodeProto, k: usize) -> Result<ArrayD<f32>> {
        let name = node
            .input
            .get(k)
            .ok_or_else(|| ForgeError::Onnx(format!("missing input #{k}")))?;
        let tensor = self
            .initializers
            .get(name.as_str())
            .ok_or_else(|| ForgeError::Onnx(format!("'{name}' must be a constant")))?;
        tensor_data(tensor)
    }
}

fn output(node: &NodeProto) -> Result<&str> {
    node.output
        .first()
        .map(String::as_str)
        .ok_or_else(|| ForgeError::Onnx("the node has no output".into()))
}

fn attr<'n>(node: &'n NodeProto, name: &str) -> Option<&'n AttributeProto> {
    node.attribute.iter().find(|a| a.name == name)
}

fn attr_int(node: &NodeProto, name: &str, default: i64) -> i64 {
    attr(node, name).map(|a| a.i).unwrap_or(default)
}

fn attr_float(node: &NodeProto, name: &str, default: f32) -> f32 {
    attr(node, name).map(|a| a.f).unwrap_or(default)
}

fn attr_ints(node: &NodeProto, name: &str) -> Option<Vec<i64>> {
    attr(node, name).map(|a| a.ints.clone())
}

fn attr_str(node: &NodeProto, name: &str) -> Option<String> {
    attr(node, name).map(|a| String::from_utf8_lossy(&a.s).into_owned())
}

fn check_ones(node: &NodeProto, name: &str) -> Result<()> {
    match attr_ints(node, name) {
        Some(values) if values.iter().any(|&v| v != 1) => {
            Err(ForgeError::Onnx(format!("{name} other than 1 aren't supported")))
        }
        _ => Ok(()),
    }
}

fn strides(node: &NodeProto, spatial: usize) -> Result<Vec<usize>> {
    let strides = attr_ints(node, "strides").unwrap_or_else(|| vec![1; spatial]);
    if strides.len() != spatial || strides.iter().any(|&s| s <= 0) {
        return Err(ForgeError::Onnx(format!("invalid strides {strides:?}")));
    }

    Ok(strides.into_iter().map(|s| s as usize).collect())
}

/// Maps ONNX padding to the layout's `valid` or `same`. Explicit pads must be zero or
/// exactly what `same` would add.
fn resolve_padding(
    node: &NodeProto,
    lens: &[usize],
    window: &[usize],
    strides: &[usize],
) -> Result<PaddingConfig> {
    let auto_pad = attr_str(node, "auto_pad").unwrap_or_default();
    match auto_pad.as_str() {
        "VALID" => return Ok(PaddingConfig::Valid),
        "SAME_UPPER" => return Ok(PaddingConfig::Same),
        "" | "NOTSET" => {}
        other => return Err(ForgeError::Onnx(format!("auto_pad {other} isn't supported"))),
    }

    let n = lens.len();
    let pads = attr_ints(node, "pads").unwrap_or_else(|| vec![0; 2 * n]);
    if pads.len() != 2 * n {
        return Err(ForgeError::Onnx(format!("invalid pads {pads:?}")));
    }
    if pads.iter().all(|&p| p == 0) {
        return Ok(PaddingConfig::Valid);
    }

    let same = (0..n).all(|i| {
        let out = lens[i].div_ceil(strides[i]);
        let total = ((out.max(1) - 1) * strides[i] + window[i]).saturating_sub(lens[i]);
        let before = total / 2;
        pads[i] == before as i64 && pads[n + i] == (total - before) as i64
    });

    if same {
        Ok(PaddingConfig::Same)
    } else {
        Err(ForgeError::Onnx(format!(
            "pads {pads:?} are neither valid nor same padding"
        )))
    }
}

fn out_lens(
    padding: PaddingConfig,
    lens: &[usize],
    window: &[usize],
    strides: &[usize],
) -> Result<Vec<usize>> {
    let padding = Padding::from(padding);
    lens.iter()
        .zip(window)
        .zip(strides)
        .map(|((&len, &k), &s)| {
            padding
                .out_len(len, k, s)
                .map(|(out, _)| out)
                .ok_or_else(|| ForgeError::Onnx(format!("window {k} doesn't fit length {len}")))
        })
        .collect()
}

fn broadcast_bias(bias: ArrayD<f32>, units: usize) -> Result<Array1<f32>> {
    match bias.len() {
        n if n == units => Ok(Array1::from_iter(bias.iter().copied())),
        1 => Ok(Array1::from_elem(units, bias.iter().copied().next().unwrap_or(0.))),
        n => Err(ForgeError::Onnx(format!("a bias of {n} values can't apply to {units} units"))),
    }
}

/// Reads the values of a constant tensor as `f32`.
fn tensor_data(t: &TensorProto) -> Result<ArrayD<f32>> {
    let shape = t
        .dims
        .iter()
        .map(|&d| usize::try_from(d))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| ForgeError::Onnx(format!("tensor '{}' has negative dims", t.name)))?;

    let values: Vec<f32> = match t.data_type {
        data_type::FLOAT if !t.raw_data.is_empty() => t
            .raw_data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        data_type::FLOAT => t.float_data.clone(),
        data_type::DOUBLE if !t.raw_data.is_empty() => t
            .raw_data
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
            .collect(),
        data_type::DOUBLE => t.double_data.iter().map(|&v| v as f32).collect(),
        other => {
            return Err(ForgeError::Onnx(format!(
                "tensor '{}' has unsupported element type {other}",
                t.name
            )));
        }
    };

    let expected: usize = shape.iter().product();
    if values.len() != expected {
        return Err(ForgeError::Onnx(format!(
            "tensor '{}' has {} values for shape {shape:?}",
            t.name,
            values.len()
        )));
    }

    Ok(ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(machine_learning::MlErr::from)?)
}
