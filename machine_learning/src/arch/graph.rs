use std::ops::Range;

use log::trace;
use ndarray::{ArrayD, Axis, concatenate};
use rand::Rng;

use super::layers::Layer;
use crate::{MlErr, Result, optimization::Optimizer};

#[derive(Debug, Clone)]
struct Tensor {
    name: String,
    shape: Vec<usize>,
}

#[derive(Debug, Clone)]
struct Node {
    inputs: Vec<usize>,
    output: usize,
    layer: Layer,
    offset: usize,
}

/// A parameter tensor of a `Graph`, located in its flat parameter buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedParam {
    /// `<layer output name>/<parameter name>`, e.g. `dense_1/kernel`.
    pub name: String,
    pub shape: Vec<usize>,
    pub range: Range<usize>,
}

/// A read only view of one node of a `Graph`.
#[derive(Debug, Clone, Copy)]
pub struct NodeView<'a> {
    pub layer: &'a Layer,
    pub inputs: &'a [usize],
    pub output: usize,
}

/// A directed acyclic graph of layers over named tensors.
///
/// Nodes are kept in insertion order, which is a topological order since a node can only
/// consume tensors defined before it. Every parameter lives in one flat buffer with a parallel
/// gradient buffer, each node owning a contiguous slice of both.
#[derive(Debug, Clone)]
pub struct Graph {
    name: String,
    tensors: Vec<Tensor>,
    inputs: Vec<usize>,
    nodes: Vec<Node>,
    outputs: Vec<usize>,
    params: Vec<f32>,
    grad: Vec<f32>,
}

impl Graph {
    /// Returns a new empty `Graph`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tensors: Vec::new(),
            inputs: Vec::new(),
            nodes: Vec::new(),
            outputs: Vec::new(),
            params: Vec::new(),
            grad: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn define(&mut self, name: &str, shape: Vec<usize>) -> Result<usize> {
        if self.tensor_id(name).is_some() {
            return Err(MlErr::DuplicateTensor(name.to_string()));
        }

        self.tensors.push(Tensor {
            name: name.to_string(),
            shape,
        });
        Ok(self.tensors.len() - 1)
    }

    /// Declares a model input.
    ///
    /// # Arguments
    /// * `name` - The tensor's name.
    /// * `shape` - The feature shape of a single sample.
    ///
    /// # Returns
    /// The id of the new tensor.
    pub fn add_input(&mut self, name: &str, shape: &[usize]) -> Result<usize> {
        let id = self.define(name, shape.to_vec())?;
        self.inputs.push(id);
        Ok(id)
    }

    /// Appends a layer to the graph.
    ///
    /// # Arguments
    /// * `output` - The name of the tensor the layer defines.
    /// * `inputs` - The ids of the tensors the layer consumes, all already defined.
    /// * `layer` - The layer, built for the shapes of `inputs`.
    ///
    /// # Returns
    /// The id of the layer's output tensor.
    pub fn add_layer(&mut self, output: &str, inputs: Vec<usize>, layer: Layer) -> Result<usize> {
        if let Some(&bad) = inputs.iter().find(|&&id| id >= self.tensors.len()) {
            return Err(MlErr::InvalidLayer(format!(
                "'{output}' consumes tensor #{bad}, which isn't defined"
            )));
        }

        let id = self.define(output, layer.output_shape())?;
        let offset = self.params.len();
        let size = layer.size();

        self.params.resize(offset + size, 0.);
        self.grad.resize(offset + size, 0.);
        self.nodes.push(Node {
            inputs,
            output: id,
            layer,
            offset,
        });

        Ok(id)
    }

    /// Sets which tensors the model returns, in order.
    pub fn set_outputs(&mut self, outputs: Vec<usize>) -> Result<()> {
        if let Some(&bad) = outputs.iter().find(|&&id| id >= self.tensors.len()) {
            return Err(MlErr::InvalidLayer(format!(
                "output tensor #{bad} isn't defined"
            )));
        }

        self.outputs = outputs;
        Ok(())
    }

    /// Looks up a tensor id by name.
    pub fn tensor_id(&self, name: &str) -> Option<usize> {
        self.tensors.iter().position(|t| t.name == name)
    }

    /// The name of a tensor.
    pub fn tensor_name(&self, id: usize) -> Option<&str> {
        self.tensors.get(id).map(|t| t.name.as_str())
    }

    /// The graph's nodes in evaluation order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeView<'_>> {
        self.nodes.iter().map(|node| NodeView {
            layer: &node.layer,
            inputs: &node.inputs,
            output: node.output,
        })
    }

    /// The feature shape of a tensor.
    pub fn tensor_shape(&self, id: usize) -> Option<&[usize]> {
        self.tensors.get(id).map(|t| t.shape.as_slice())
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.iter().map(|&i| self.tensors[i].name.as_str()).collect()
    }

    pub fn input_shapes(&self) -> Vec<&[usize]> {
        self.inputs.iter().map(|&i| self.tensors[i].shape.as_slice()).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|&i| self.tensors[i].name.as_str()).collect()
    }

    pub fn output_shapes(&self) -> Vec<&[usize]> {
        self.outputs.iter().map(|&i| self.tensors[i].shape.as_slice()).collect()
    }

    /// Returns the size of this model.
    ///
    /// # Returns
    /// The amount of parameters in the model.
    pub fn size(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    pub fn grad(&self) -> &[f32] {
        &self.grad
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.);
    }

    /// Every parameter tensor of the graph, in buffer order.
    pub fn named_params(&self) -> Vec<NamedParam> {
        let mut named = Vec::new();
        for node in &self.nodes {
            let mut offset = node.offset;
            for spec in node.layer.param_specs() {
                let len = spec.len();
                named.push(NamedParam {
                    name: format!("{}/{}", self.tensors[node.output].name, spec.name),
                    shape: spec.shape,
                    range: offset..offset + len,
                });
                offset += len;
            }
        }

        named
    }

    /// Initializes every parameter with its layer's initializer.
    pub fn initialize<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        for node in &self.nodes {
            let mut offset = node.offset;
            for spec in node.layer.param_specs() {
                let len = spec.len();
                spec.init.fill(&mut self.params[offset..offset + len], rng)?;
                offset += len;
            }
        }

        Ok(())
    }

    /// Runs the graph over a batch.
    ///
    /// # Arguments
    /// * `inputs` - One batched tensor per model input, in declaration order.
    /// * `training` - Whether this pass is part of a training step.
    ///
    /// # Returns
    /// One batched tensor per model output.
    pub fn forward(&mut self, inputs: &[ArrayD<f32>], training: bool) -> Result<Vec<ArrayD<f32>>> {
        if inputs.len() != self.inputs.len() {
            return Err(MlErr::SizeMismatch {
                a: "inputs",
                b: "model inputs",
                got: inputs.len(),
                expected: self.inputs.len(),
            });
        }

        let mut values: Vec<Option<ArrayD<f32>>> = vec![None; self.tensors.len()];
        for (&id, x) in self.inputs.iter().zip(inputs) {
            let features = &self.tensors[id].shape;
            if x.ndim() == 0 || &x.shape()[1..] != features.as_slice() {
                let mut expected = vec![x.shape().first().copied().unwrap_or(0)];
                expected.extend_from_slice(features);
                return Err(MlErr::shape(&self.tensors[id].name, x.shape(), &expected));
            }
            values[id] = Some(x.clone());
        }

        let Self {
            tensors,
            nodes,
            params,
            ..
        } = self;

        for node in nodes.iter_mut() {
            let args = node
                .inputs
                .iter()
                .map(|&i| {
                    values[i]
                        .as_ref()
                        .ok_or_else(|| MlErr::MissingForwardPass(tensors[i].name.clone()))
                })
                .collect::<Result<Vec<_>>>()?;

            let size = node.layer.size();
            let slice = &mut params[node.offset..node.offset + size];
            let y = node.layer.forward(slice, &args, training)?;
            values[node.output] = Some(y);
        }

        self.outputs
            .iter()
            .map(|&id| {
                values[id]
                    .clone()
                    .ok_or_else(|| MlErr::MissingForwardPass(self.tensors[id].name.clone()))
            })
            .collect()
    }

    /// Backpropagates the gradient of the loss through the last forward pass, **accumulating**
    /// the parameter gradient.
    ///
    /// # Arguments
    /// * `d` - The gradient of the loss with respect to each model output.
    pub fn backward(&mut self, d: Vec<ArrayD<f32>>) -> Result<()> {
        if d.len() != self.outputs.len() {
            return Err(MlErr::SizeMismatch {
                a: "output gradients",
                b: "model outputs",
                got: d.len(),
                expected: self.outputs.len(),
            });
        }

        let mut deltas: Vec<Option<ArrayD<f32>>> = vec![None; self.tensors.len()];
        for (&id, d) in self.outputs.iter().zip(d) {
            accumulate(&mut deltas[id], d);
        }

        let Self {
            nodes,
            params,
            grad,
            ..
        } = self;

        for node in nodes.iter_mut().rev() {
            let Some(d) = deltas[node.output].take() else {
                continue;
            };

            let range = node.offset..node.offset + node.layer.size();
            let dxs = node
                .layer
                .backward(&params[range.clone()], &mut grad[range], d)?;

            for (&i, dx) in node.inputs.iter().zip(dxs) {
                accumulate(&mut deltas[i], dx);
            }
        }

        Ok(())
    }

    /// Takes an optimization step with the accumulated gradient.
    pub fn step<O: Optimizer + ?Sized>(&mut self, optimizer: &mut O) -> Result<()> {
        optimizer.update_params(&self.grad, &mut self.params)
    }

    /// Runs inference over `inputs` in batches of at most `batch_size` samples.
    ///
    /// # Returns
    /// One tensor per model output, holding every sample.
    pub fn predict(&mut self, inputs: &[ArrayD<f32>], batch_size: usize) -> Result<Vec<ArrayD<f32>>> {
        let len = inputs.first().map(|x| x.len_of(Axis(0))).unwrap_or(0);
        if let Some(x) = inputs.iter().find(|x| x.len_of(Axis(0)) != len) {
            return Err(MlErr::SizeMismatch {
                a: "input samples",
                b: "first input samples",
                got: x.len_of(Axis(0)),
                expected: len,
            });
        }

        let batch_size = batch_size.max(1);
        let mut chunks: Vec<Vec<ArrayD<f32>>> = vec![Vec::new(); self.outputs.len()];

        for start in (0..len.max(1)).step_by(batch_size) {
            let end = (start + batch_size).min(len);
            let batch: Vec<_> = inputs
                .iter()
                .map(|x| x.slice_axis(Axis(0), (start..end).into()).to_owned())
                .collect();

            trace!("predicting samples {start}..{end}");
            for (chunk, y) in chunks.iter_mut().zip(self.forward(&batch, false)?) {
                chunk.push(y);
            }
        }

        chunks
            .into_iter()
            .map(|ys| {
                let views: Vec<_> = ys.iter().map(|y| y.view()).collect();
                Ok(concatenate(Axis(0), &views)?)
            })
            .collect()
    }
}

fn accumulate(slot: &mut Option<ArrayD<f32>>, d: ArrayD<f32>) {
    match slot {
        Some(acc) => *acc += &d,
        None => *slot = Some(d),
    }
}
