use log::{debug, info, warn};
use machine_learning::{
    MlErr,
    arch::{
        Graph,
        activations::ActFn,
        layers::{
            Activation, BatchNorm, Conv, Dense, Dropout, Flatten, Layer, MaxPool2d, Merge, MergeOp,
            Permute,
        },
    },
};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    ForgeError, Result,
    configs::{IntOrList, LayerKind, Layout},
};

/// What to do with layer entries whose type isn't in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownLayerPolicy {
    /// Fail with `ForgeError::UnsupportedLayer`.
    #[default]
    Reject,
    /// Warn and leave the entry out, later references to its output fail to resolve.
    Skip,
}

/// Builds `Graph`s from layouts.
#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    policy: UnknownLayerPolicy,
    seed: Option<u64>,
}

impl GraphBuilder {
    /// Creates a new `GraphBuilder` that rejects unknown layers and seeds from the OS.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: UnknownLayerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Builds a new initialized `Graph` following a layout.
    ///
    /// # Arguments
    /// * `layout` - The model description.
    ///
    /// # Returns
    /// A graph whose inputs and outputs are the layout's, in the same order.
    pub fn build(&self, layout: &Layout) -> Result<Graph> {
        let mut rng = self.generate_rng();
        let mut graph = Graph::new(&layout.model_name);

        for input in &layout.inputs {
            let shape = input.feature_shape()?;
            graph
                .add_input(&input.name, &shape)
                .map_err(|e| self.resolve_err(e.into(), &input.name, 0, "input"))?;
        }

        for (index, entry) in layout.layers.iter().enumerate() {
            let kind = match entry.decode(index) {
                Ok(kind) => kind,
                Err(ForgeError::UnsupportedLayer { kind, .. })
                    if self.policy == UnknownLayerPolicy::Skip =>
                {
                    warn!("skipping layer #{index} with unsupported type '{kind}'");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let output = kind.output_name();
            let ids = kind
                .inputs()
                .into_iter()
                .map(|name| {
                    graph.tensor_id(name).ok_or_else(|| ForgeError::UndefinedTensor {
                        layer: output.to_string(),
                        name: name.to_string(),
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let shapes: Vec<&[usize]> = ids
                .iter()
                .filter_map(|&id| graph.tensor_shape(id))
                .collect();

            let layer = self
                .resolve_layer(&kind, &shapes, &mut rng)
                .map_err(|e| self.resolve_err(e, output, index, &entry.kind))?;

            debug!("layer #{index} {} -> '{output}' {:?}", entry.kind, layer.output_shape());
            graph
                .add_layer(output, ids, layer)
                .map_err(|e| self.resolve_err(e.into(), output, index, &entry.kind))?;
        }

        let outputs = layout
            .outputs
            .iter()
            .map(|o| {
                graph.tensor_id(&o.name).ok_or_else(|| ForgeError::UndefinedTensor {
                    layer: "outputs".to_string(),
                    name: o.name.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        graph.set_outputs(outputs)?;
        graph.initialize(&mut rng)?;

        info!(
            "built model '{}' with {} parameters",
            layout.model_name,
            graph.size()
        );

        Ok(graph)
    }

    fn resolve_layer<R: Rng>(
        &self,
        kind: &LayerKind,
        shapes: &[&[usize]],
        rng: &mut R,
    ) -> Result<Layer> {
        let shape = || {
            shapes.first().copied().ok_or_else(|| {
                ForgeError::InvalidLayout(format!("'{}' has no input", kind.output_name()))
            })
        };

        let layer = match kind {
            LayerKind::Add(_) => Layer::Merge(Merge::new(MergeOp::Add, shapes)?),
            LayerKind::Multiply(_) => Layer::Merge(Merge::new(MergeOp::Multiply, shapes)?),
            LayerKind::Dense(p) => {
                let act_fn = self.resolve_act_fn(p.activation.as_deref())?;
                Layer::Dense(Dense::new(shape()?, p.units, act_fn)?)
            }
            LayerKind::Flatten(_) => Layer::Flatten(Flatten::new(shape()?)),
            LayerKind::Activation(p) => {
                let act_fn = self.resolve_act_fn(Some(&p.activation))?;
                Layer::Activation(Activation::new(shape()?, act_fn))
            }
            LayerKind::Dropout(p) => {
                let seed = p.seed.or_else(|| self.seed.map(|_| rng.random()));
                Layer::Dropout(Dropout::new(shape()?, p.rate, seed)?)
            }
            LayerKind::Conv1D(p) => {
                let act_fn = self.resolve_act_fn(p.activation.as_deref())?;
                let kernel = self.resolve_single(&p.kernel_size, "kernel_size")?;
                let stride = self.resolve_single(&p.strides, "strides")?;
                Layer::Conv(Conv::conv1d(
                    shape()?,
                    p.filters,
                    kernel,
                    stride,
                    p.padding.into(),
                    act_fn,
                )?)
            }
            LayerKind::Conv2D(p) => {
                let act_fn = self.resolve_act_fn(p.activation.as_deref())?;
                let kernel = self.resolve_pair(&p.kernel_size, "kernel_size")?;
                let strides = self.resolve_pair(&p.strides, "strides")?;
                Layer::Conv(Conv::conv2d(
                    shape()?,
                    p.filters,
                    kernel,
                    strides,
                    p.padding.into(),
                    act_fn,
                )?)
            }
            LayerKind::MaxPooling2D(p) => {
                let pool = self.resolve_pair(&p.pool_size, "pool_size")?;
                let strides = self.resolve_pair(&p.strides, "strides")?;
                Layer::MaxPool2d(MaxPool2d::new(shape()?, pool, strides, p.padding.into())?)
            }
            LayerKind::BatchNormalization(p) => {
                Layer::BatchNorm(BatchNorm::new(shape()?, p.momentum, p.epsilon)?)
            }
            LayerKind::Permute(p) => {
                let dims = p
                    .dims
                    .iter()
                    .map(|&d| d.checked_sub(1))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| {
                        MlErr::InvalidLayer("permute dims are numbered from 1".into())
                    })?;
                Layer::Permute(Permute::new(shape()?, &dims)?)
            }
        };

        Ok(layer)
    }

    fn resolve_act_fn(&self, name: Option<&str>) -> Result<ActFn> {
        let Some(name) = name else {
            return Ok(ActFn::Linear);
        };

        ActFn::from_name(name).ok_or_else(|| ForgeError::UnknownActivation(name.to_string()))
    }

    fn resolve_pair(&self, value: &IntOrList, what: &str) -> Result<(usize, usize)> {
        value.pair().ok_or_else(|| {
            MlErr::InvalidLayer(format!("{what} must be an int or two ints, got {value:?}")).into()
        })
    }

    fn resolve_single(&self, value: &IntOrList, what: &str) -> Result<usize> {
        value.single().ok_or_else(|| {
            MlErr::InvalidLayer(format!("{what} must be an int or one int, got {value:?}")).into()
        })
    }

    /// Attaches layout context to errors raised while wiring a layer.
    fn resolve_err(&self, e: ForgeError, output: &str, index: usize, kind: &str) -> ForgeError {
        match e {
            ForgeError::Ml(MlErr::DuplicateTensor(name)) => ForgeError::DuplicateTensor(name),
            ForgeError::Ml(MlErr::InvalidLayer(msg)) => ForgeError::InvalidLayerParams {
                index,
                kind: kind.to_string(),
                msg,
            },
            ForgeError::Ml(MlErr::ShapeMismatch {
                what,
                got,
                expected,
            }) => ForgeError::ShapeMismatch {
                name: output.to_string(),
                msg: format!("{what}: got {got:?}, expected {expected:?}"),
            },
            e => e,
        }
    }

    fn generate_rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{GraphBuilder, UnknownLayerPolicy};
    use crate::{ForgeError, configs::Layout};

    fn layout(layers: serde_json::Value, outputs: &[&str]) -> Layout {
        let outputs: Vec<_> = outputs.iter().map(|name| json!({ "name": name })).collect();
        serde_json::from_value(json!({
            "model_name": "test",
            "inputs": [
                {"name": "a", "shape": [-1, 4]},
                {"name": "b", "shape": [-1, 4]}
            ],
            "outputs": outputs,
            "layers": layers
        }))
        .unwrap()
    }

    #[test]
    fn outputs_follow_the_layout_order() {
        let layout = layout(
            json!([
                {"type": "Dense", "params": {"units": 3, "activation": "relu", "input_name": "a", "output_name": "h"}},
                {"type": "Dense", "params": {"units": 3, "input_name": "b", "output_name": "g"}},
                {"type": "Add", "params": {"input_names": ["h", "g"], "output_name": "sum"}},
                {"type": "Dense", "params": {"units": 2, "activation": "softmax", "input_name": "sum", "output_name": "probs"}}
            ]),
            &["probs", "h"],
        );

        let graph = GraphBuilder::new().with_seed(Some(1)).build(&layout).unwrap();

        assert_eq!(graph.input_names(), vec!["a", "b"]);
        assert_eq!(graph.output_names(), vec!["probs", "h"]);
        assert_eq!(graph.size(), (4 * 3 + 3) * 2 + 3 * 2 + 2);
    }

    #[test]
    fn unknown_layers_are_rejected_by_default() {
        let layout = layout(
            json!([{"type": "LSTM", "params": {"units": 3, "input_name": "a", "output_name": "h"}}]),
            &["h"],
        );

        let err = GraphBuilder::new().build(&layout).unwrap_err();
        assert!(matches!(err, ForgeError::UnsupportedLayer { index: 0, ref kind } if kind == "LSTM"));
    }

    #[test]
    fn skipped_layers_fail_on_reference() {
        let layout = layout(
            json!([
                {"type": "LSTM", "params": {"units": 3, "input_name": "a", "output_name": "h"}},
                {"type": "Dense", "params": {"units": 1, "input_name": "h", "output_name": "q"}}
            ]),
            &["q"],
        );

        let err = GraphBuilder::new()
            .with_policy(UnknownLayerPolicy::Skip)
            .build(&layout)
            .unwrap_err();
        assert!(matches!(err, ForgeError::UndefinedTensor { ref name, .. } if name == "h"));
    }

    #[test]
    fn wiring_errors_are_reported_with_context() {
        let duplicate = layout(
            json!([{"type": "Dense", "params": {"units": 3, "input_name": "a", "output_name": "b"}}]),
            &["b"],
        );
        assert!(matches!(
            GraphBuilder::new().build(&duplicate),
            Err(ForgeError::DuplicateTensor(_))
        ));

        let bad_activation = layout(
            json!([{"type": "Dense", "params": {"units": 3, "activation": "mish", "input_name": "a", "output_name": "h"}}]),
            &["h"],
        );
        assert!(matches!(
            GraphBuilder::new().build(&bad_activation),
            Err(ForgeError::UnknownActivation(_))
        ));

        let bad_output = layout(json!([]), &["nope"]);
        assert!(matches!(
            GraphBuilder::new().build(&bad_output),
            Err(ForgeError::UndefinedTensor { .. })
        ));
    }

    #[test]
    fn same_seed_builds_the_same_parameters() {
        let layout = layout(
            json!([{"type": "Dense", "params": {"units": 3, "input_name": "a", "output_name": "h"}}]),
            &["h"],
        );

        let builder = GraphBuilder::new().with_seed(Some(7));
        let first = builder.build(&layout).unwrap();
        let second = builder.build(&layout).unwrap();
        assert_eq!(first.params(), second.params());
    }

    #[test]
    fn image_layers_infer_their_shapes() {
        let layout: Layout = serde_json::from_value(json!({
            "model_name": "cnn",
            "inputs": [{"name": "img", "shape": [-1, 8, 8, 3], "domain": "image"}],
            "outputs": [{"name": "out"}],
            "layers": [
                {"type": "Conv2D", "params": {"filters": 4, "kernel_size": [3, 3], "padding": "same", "activation": "relu", "input_name": "img", "output_name": "c1"}},
                {"type": "BatchNormalization", "params": {"input_name": "c1", "output_name": "bn"}},
                {"type": "MaxPooling2D", "params": {"input_name": "bn", "output_name": "p1"}},
                {"type": "Dropout", "params": {"rate": 0.25, "input_name": "p1", "output_name": "d1"}},
                {"type": "Flatten", "params": {"input_name": "d1", "output_name": "flat"}},
                {"type": "Dense", "params": {"units": 2, "activation": "softmax", "input_name": "flat", "output_name": "out"}}
            ]
        }))
        .unwrap();

        let graph = GraphBuilder::new().with_seed(Some(3)).build(&layout).unwrap();
        let shapes: Vec<Vec<usize>> = graph.output_shapes().iter().map(|s| s.to_vec()).collect();
        assert_eq!(shapes, vec![vec![2]]);
        assert_eq!(graph.tensor_shape(graph.tensor_id("p1").unwrap()), Some(&[4, 4, 4][..]));
    }
}
