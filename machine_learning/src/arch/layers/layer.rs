use ndarray::ArrayD;

use super::{
    Activation, BatchNorm, Conv, Dense, Dropout, Flatten, MaxPool2d, Merge, ParamSpec, Permute,
};
use crate::Result;

/// Every layer kind a `Graph` node can hold.
#[derive(Debug, Clone)]
pub enum Layer {
    Dense(Dense),
    Conv(Conv),
    MaxPool2d(MaxPool2d),
    BatchNorm(BatchNorm),
    Dropout(Dropout),
    Flatten(Flatten),
    Permute(Permute),
    Activation(Activation),
    Merge(Merge),
}
use Layer::*;

impl Layer {
    /// Returns the size of this layer.
    ///
    /// # Returns
    /// The amount of parameters this layer has.
    pub fn size(&self) -> usize {
        match self {
            Dense(l) => l.size(),
            Conv(l) => l.size(),
            BatchNorm(l) => l.size(),
            MaxPool2d(_) | Dropout(_) | Flatten(_) | Permute(_) | Activation(_) | Merge(_) => 0,
        }
    }

    /// The feature shape of this layer's output, without the batch axis.
    pub fn output_shape(&self) -> Vec<usize> {
        match self {
            Dense(l) => l.output_shape(),
            Conv(l) => l.output_shape(),
            MaxPool2d(l) => l.output_shape(),
            BatchNorm(l) => l.output_shape(),
            Dropout(l) => l.output_shape(),
            Flatten(l) => l.output_shape(),
            Permute(l) => l.output_shape(),
            Activation(l) => l.output_shape(),
            Merge(l) => l.output_shape(),
        }
    }

    /// The parameter tensors of this layer, in the order they're laid out in its slice.
    pub fn param_specs(&self) -> Vec<ParamSpec> {
        match self {
            Dense(l) => l.param_specs(),
            Conv(l) => l.param_specs(),
            BatchNorm(l) => l.param_specs(),
            _ => Vec::new(),
        }
    }

    /// Makes a forward pass, caching whatever the backward pass will need.
    ///
    /// # Arguments
    /// * `params` - This layer's slice of the model parameters. Only batch normalization writes
    ///   to it, updating its moving statistics while training.
    /// * `inputs` - The batched inputs, in the order the layer was wired.
    /// * `training` - Whether this pass is part of a training step.
    ///
    /// # Returns
    /// The batched output.
    pub fn forward(
        &mut self,
        params: &mut [f32],
        inputs: &[&ArrayD<f32>],
        training: bool,
    ) -> Result<ArrayD<f32>> {
        match self {
            Dense(l) => l.forward(params, inputs),
            Conv(l) => l.forward(params, inputs),
            MaxPool2d(l) => l.forward(inputs),
            BatchNorm(l) => l.forward(params, inputs, training),
            Dropout(l) => l.forward(inputs, training),
            Flatten(l) => l.forward(inputs),
            Permute(l) => l.forward(inputs),
            Activation(l) => l.forward(inputs),
            Merge(l) => l.forward(inputs),
        }
    }

    /// Makes a backward pass, **accumulating** this layer's parameter gradient into `grad`.
    ///
    /// # Arguments
    /// * `params` - This layer's slice of the model parameters.
    /// * `grad` - This layer's slice of the gradient buffer.
    /// * `d` - The gradient with respect to this layer's last output.
    ///
    /// # Returns
    /// The gradient with respect to each of the layer's inputs.
    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayD<f32>,
    ) -> Result<Vec<ArrayD<f32>>> {
        match self {
            Dense(l) => l.backward(params, grad, d),
            Conv(l) => l.backward(params, grad, d),
            MaxPool2d(l) => l.backward(d),
            BatchNorm(l) => l.backward(params, grad, d),
            Dropout(l) => Ok(l.backward(d)),
            Flatten(l) => l.backward(d),
            Permute(l) => Ok(l.backward(d)),
            Activation(l) => l.backward(d),
            Merge(l) => l.backward(d),
        }
    }
}
