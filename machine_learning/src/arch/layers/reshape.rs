use ndarray::ArrayD;

use super::{batched, check_batch, single};
use crate::{MlErr, Result};

/// Collapses every feature axis into one.
#[derive(Debug, Clone)]
pub struct Flatten {
    in_shape: Vec<usize>,
}

impl Flatten {
    pub fn new(in_shape: &[usize]) -> Self {
        Self {
            in_shape: in_shape.to_vec(),
        }
    }

    pub fn output_shape(&self) -> Vec<usize> {
        vec![self.in_shape.iter().product()]
    }

    pub fn forward(&self, inputs: &[&ArrayD<f32>]) -> Result<ArrayD<f32>> {
        let x = single("flatten", inputs)?;
        let batch = check_batch("flatten input", x, &self.in_shape)?;
        let shape = batched(batch, &self.output_shape());
        Ok(x.to_shape(shape)?.into_owned())
    }

    pub fn backward(&self, d: ArrayD<f32>) -> Result<Vec<ArrayD<f32>>> {
        let shape = batched(d.shape()[0], &self.in_shape);
        Ok(vec![d.to_shape(shape)?.into_owned()])
    }
}

/// Reorders the feature axes, the batch axis stays in place.
#[derive(Debug, Clone)]
pub struct Permute {
    in_shape: Vec<usize>,
    // Full permutation over the batched tensor and its inverse
    axes: Vec<usize>,
    inverse: Vec<usize>,
}

impl Permute {
    /// Returns a new `Permute`.
    ///
    /// # Arguments
    /// * `in_shape` - The feature shape of the input.
    /// * `dims` - A zero based permutation of the feature axes.
    pub fn new(in_shape: &[usize], dims: &[usize]) -> Result<Self> {
        let mut seen = vec![false; in_shape.len()];
        let valid = dims.len() == in_shape.len()
            && dims
                .iter()
                .all(|&d| d < seen.len() && !std::mem::replace(&mut seen[d], true));

        if !valid {
            return Err(MlErr::InvalidLayer(format!(
                "{dims:?} is not a permutation of the axes of {in_shape:?}"
            )));
        }

        let axes: Vec<usize> = std::iter::once(0).chain(dims.iter().map(|d| d + 1)).collect();
        let mut inverse = vec![0; axes.len()];
        for (i, &axis) in axes.iter().enumerate() {
            inverse[axis] = i;
        }

        Ok(Self {
            in_shape: in_shape.to_vec(),
            axes,
            inverse,
        })
    }

    /// The zero based permutation of the feature axes.
    pub fn dims(&self) -> Vec<usize> {
        self.axes[1..].iter().map(|a| a - 1).collect()
    }

    pub fn output_shape(&self) -> Vec<usize> {
        self.axes[1..].iter().map(|&a| self.in_shape[a - 1]).collect()
    }

    pub fn forward(&self, inputs: &[&ArrayD<f32>]) -> Result<ArrayD<f32>> {
        let x = single("permute", inputs)?;
        check_batch("permute input", x, &self.in_shape)?;
        Ok(x.view()
            .permuted_axes(self.axes.clone())
            .as_standard_layout()
            .into_owned())
    }

    pub fn backward(&self, d: ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let dx = d
            .permuted_axes(self.inverse.clone())
            .as_standard_layout()
            .into_owned();
        vec![dx]
    }
}
