mod activation;
mod batch_norm;
mod conv;
mod dense;
mod dropout;
mod layer;
mod merge;
mod pooling;
mod reshape;

pub use activation::Activation;
pub use batch_norm::BatchNorm;
pub use conv::Conv;
pub use dense::Dense;
pub use dropout::Dropout;
pub use layer::Layer;
pub use merge::{Merge, MergeOp};
pub use pooling::MaxPool2d;
pub use reshape::{Flatten, Permute};

use ndarray::{ArrayD, Dimension, IxDyn};

use crate::{MlErr, Result, initialization::Init};

/// A named parameter tensor owned by a layer, in the order it's laid out in the layer's slice.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub shape: Vec<usize>,
    pub init: Init,
}

impl ParamSpec {
    fn new(name: &'static str, shape: Vec<usize>, init: Init) -> Self {
        Self { name, shape, init }
    }

    /// The amount of scalars in this tensor.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The padding scheme of a sliding window layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Padding {
    #[default]
    Valid,
    Same,
}

impl Padding {
    /// Computes the output length of a window sliding over a spatial axis.
    ///
    /// # Arguments
    /// * `len` - The length of the axis.
    /// * `window` - The window length.
    /// * `stride` - The step between windows.
    ///
    /// # Returns
    /// The output length and the padding added before the axis, or `None` if the window
    /// doesn't fit.
    pub fn out_len(&self, len: usize, window: usize, stride: usize) -> Option<(usize, usize)> {
        if window == 0 || stride == 0 {
            return None;
        }

        match self {
            Padding::Valid => (len >= window).then(|| ((len - window) / stride + 1, 0)),
            Padding::Same => {
                let out = len.div_ceil(stride);
                let total = ((out - 1) * stride + window).saturating_sub(len);
                (out > 0).then_some((out, total / 2))
            }
        }
    }
}

/// Prepends the batch dimension to a feature shape.
pub(crate) fn batched(batch: usize, features: &[usize]) -> IxDyn {
    let mut shape = Vec::with_capacity(features.len() + 1);
    shape.push(batch);
    shape.extend_from_slice(features);
    IxDyn(&shape)
}

/// Checks that `x` is a batch of tensors shaped `features`.
pub(crate) fn check_batch(what: &str, x: &ArrayD<f32>, features: &[usize]) -> Result<usize> {
    match x.shape().split_first() {
        Some((&batch, rest)) if rest == features => Ok(batch),
        _ => {
            let expected = batched(x.shape().first().copied().unwrap_or(0), features);
            Err(MlErr::shape(what, x.shape(), expected.slice()))
        }
    }
}

/// Returns the single input of a one-input layer.
pub(crate) fn single<'a>(what: &str, inputs: &[&'a ArrayD<f32>]) -> Result<&'a ArrayD<f32>> {
    match inputs {
        [x] => Ok(x),
        _ => Err(MlErr::InvalidLayer(format!(
            "{what} expects one input, got {}",
            inputs.len()
        ))),
    }
}
