use ndarray::{Array4, ArrayD, ArrayView4};

use super::{Padding, batched, check_batch, single};
use crate::{MlErr, Result};

/// A channels-last two dimensional max pooling layer.
#[derive(Debug, Clone)]
pub struct MaxPool2d {
    in_shape: [usize; 3],
    out_hw: (usize, usize),
    pool: (usize, usize),
    strides: (usize, usize),
    padding: Padding,
    pads: (usize, usize),

    // For every output element, the position of the input it was taken from
    argmax: Option<Vec<[usize; 4]>>,
}

impl MaxPool2d {
    /// Returns a new `MaxPool2d`.
    ///
    /// # Arguments
    /// * `in_shape` - The `[height, width, channels]` feature shape of the input.
    /// * `pool` - The window's height and width.
    /// * `strides` - The steps between windows.
    /// * `padding` - The padding scheme, padded positions never win the max.
    pub fn new(
        in_shape: &[usize],
        pool: (usize, usize),
        strides: (usize, usize),
        padding: Padding,
    ) -> Result<Self> {
        let &[h, w, c] = in_shape else {
            return Err(MlErr::InvalidLayer(format!(
                "max pooling expects a [height, width, channels] input, got {in_shape:?}"
            )));
        };

        let rows = padding.out_len(h, pool.0, strides.0);
        let cols = padding.out_len(w, pool.1, strides.1);
        let (Some((oh, top)), Some((ow, left))) = (rows, cols) else {
            return Err(MlErr::InvalidLayer(format!(
                "pool {pool:?} with strides {strides:?} doesn't fit input {in_shape:?}"
            )));
        };

        Ok(Self {
            in_shape: [h, w, c],
            out_hw: (oh, ow),
            pool,
            strides,
            padding,
            pads: (top, left),
            argmax: None,
        })
    }

    pub fn pool(&self) -> (usize, usize) {
        self.pool
    }

    pub fn strides(&self) -> (usize, usize) {
        self.strides
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }

    pub fn output_shape(&self) -> Vec<usize> {
        vec![self.out_hw.0, self.out_hw.1, self.in_shape[2]]
    }

    pub fn forward(&mut self, inputs: &[&ArrayD<f32>]) -> Result<ArrayD<f32>> {
        let x = single("max pooling", inputs)?;
        let batch = check_batch("max pooling input", x, &self.in_shape)?;

        let [h, w, c] = self.in_shape;
        let x4 = x.to_shape((batch, h, w, c))?;
        let (out, argmax) = self.pool_max(x4.view());

        self.argmax = Some(argmax);
        let out = out.as_standard_layout().into_owned();
        Ok(out.into_shape_with_order(batched(batch, &self.output_shape()))?)
    }

    pub fn backward(&mut self, d: ArrayD<f32>) -> Result<Vec<ArrayD<f32>>> {
        let Some(argmax) = &self.argmax else {
            return Err(MlErr::MissingForwardPass("max pooling".into()));
        };

        let batch = d.shape()[0];
        let [h, w, c] = self.in_shape;
        let mut dx = Array4::zeros((batch, h, w, c));
        for (&[n, i, j, k], &g) in argmax.iter().zip(d.iter()) {
            dx[[n, i, j, k]] += g;
        }

        Ok(vec![dx.into_dyn()])
    }

    fn pool_max(&self, x: ArrayView4<f32>) -> (Array4<f32>, Vec<[usize; 4]>) {
        let (batch, h, w, c) = x.dim();
        let (oh, ow) = self.out_hw;
        let (ph, pw) = self.pool;
        let (sh, sw) = self.strides;
        let (top, left) = self.pads;

        let mut out = Array4::zeros((batch, oh, ow, c));
        let mut argmax = Vec::with_capacity(out.len());

        for n in 0..batch {
            for i in 0..oh {
                let rows = (i * sh).saturating_sub(top)..(i * sh + ph).saturating_sub(top).min(h);
                for j in 0..ow {
                    let cols =
                        (j * sw).saturating_sub(left)..(j * sw + pw).saturating_sub(left).min(w);
                    for k in 0..c {
                        let mut best = [n, rows.start, cols.start, k];
                        let mut max = f32::NEG_INFINITY;
                        for r in rows.clone() {
                            for q in cols.clone() {
                                let v = x[[n, r, q, k]];
                                if v > max {
                                    max = v;
                                    best = [n, r, q, k];
                                }
                            }
                        }

                        out[[n, i, j, k]] = max;
                        argmax.push(best);
                    }
                }
            }
        }

        (out, argmax)
    }
}
