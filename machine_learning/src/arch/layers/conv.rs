use ndarray::{
    Array2, Array4, ArrayD, ArrayView1, ArrayView2, ArrayView4, ArrayViewMut1, ArrayViewMut2, Axis, s,
};

use super::{Padding, ParamSpec, batched, check_batch, single};
use crate::{MlErr, Result, arch::activations::ActFn, initialization::Init};

/// A channels-last convolution over one or two spatial axes.
///
/// One dimensional convolutions are run as two dimensional ones over a unit height, their
/// kernel `[k, C, F]` has the same memory layout as `[1, k, C, F]`.
#[derive(Debug, Clone)]
pub struct Conv {
    in_shape: Vec<usize>,
    out_shape: Vec<usize>,
    filters: usize,
    kernel: (usize, usize),
    strides: (usize, usize),
    padding: Padding,
    pads: (usize, usize),
    act_fn: ActFn,

    // (height, width, channels) of the input viewed as 2D
    in_hwc: (usize, usize, usize),
    out_hw: (usize, usize),

    // Forward metadata
    cols: Option<Array2<f32>>,
    z: Option<ArrayD<f32>>,
    a: Option<ArrayD<f32>>,
}

impl Conv {
    /// Returns a new one dimensional `Conv` over inputs shaped `[length, channels]`.
    pub fn conv1d(
        in_shape: &[usize],
        filters: usize,
        kernel: usize,
        stride: usize,
        padding: Padding,
        act_fn: ActFn,
    ) -> Result<Self> {
        let &[len, channels] = in_shape else {
            return Err(MlErr::InvalidLayer(format!(
                "conv1d expects a [length, channels] input, got {in_shape:?}"
            )));
        };

        Self::new(
            in_shape,
            (1, len, channels),
            filters,
            (1, kernel),
            (1, stride),
            padding,
            act_fn,
        )
    }

    /// Returns a new two dimensional `Conv` over inputs shaped `[height, width, channels]`.
    ///
    /// # Arguments
    /// * `in_shape` - The feature shape of the input.
    /// * `filters` - The amount of output channels.
    /// * `kernel` - The kernel's height and width.
    /// * `strides` - The vertical and horizontal steps between windows.
    /// * `padding` - The padding scheme.
    /// * `act_fn` - The activation applied to the convolution's output.
    pub fn conv2d(
        in_shape: &[usize],
        filters: usize,
        kernel: (usize, usize),
        strides: (usize, usize),
        padding: Padding,
        act_fn: ActFn,
    ) -> Result<Self> {
        let &[h, w, channels] = in_shape else {
            return Err(MlErr::InvalidLayer(format!(
                "conv2d expects a [height, width, channels] input, got {in_shape:?}"
            )));
        };

        Self::new(
            in_shape,
            (h, w, channels),
            filters,
            kernel,
            strides,
            padding,
            act_fn,
        )
    }

    fn new(
        in_shape: &[usize],
        in_hwc: (usize, usize, usize),
        filters: usize,
        kernel: (usize, usize),
        strides: (usize, usize),
        padding: Padding,
        act_fn: ActFn,
    ) -> Result<Self> {
        let (h, w, channels) = in_hwc;
        if filters == 0 || channels == 0 {
            return Err(MlErr::InvalidLayer(
                "convolutions need at least one filter and one channel".into(),
            ));
        }

        let rows = padding.out_len(h, kernel.0, strides.0);
        let cols = padding.out_len(w, kernel.1, strides.1);
        let (Some((oh, pad_top)), Some((ow, pad_left))) = (rows, cols) else {
            return Err(MlErr::InvalidLayer(format!(
                "kernel {kernel:?} with strides {strides:?} doesn't fit input {in_shape:?}"
            )));
        };

        let out_shape = if in_shape.len() == 2 {
            vec![ow, filters]
        } else {
            vec![oh, ow, filters]
        };

        Ok(Self {
            in_shape: in_shape.to_vec(),
            out_shape,
            filters,
            kernel,
            strides,
            padding,
            pads: (pad_top, pad_left),
            act_fn,
            in_hwc,
            out_hw: (oh, ow),
            cols: None,
            z: None,
            a: None,
        })
    }

    /// Whether this convolution runs over a single spatial axis.
    pub fn is_1d(&self) -> bool {
        self.in_shape.len() == 2
    }

    pub fn filters(&self) -> usize {
        self.filters
    }

    /// The kernel's height and width, the height of a one dimensional kernel is 1.
    pub fn kernel(&self) -> (usize, usize) {
        self.kernel
    }

    pub fn strides(&self) -> (usize, usize) {
        self.strides
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }

    pub fn act_fn(&self) -> ActFn {
        self.act_fn
    }

    fn patch_len(&self) -> usize {
        self.kernel.0 * self.kernel.1 * self.in_hwc.2
    }

    pub fn size(&self) -> usize {
        (self.patch_len() + 1) * self.filters
    }

    pub fn output_shape(&self) -> Vec<usize> {
        self.out_shape.clone()
    }

    pub fn param_specs(&self) -> Vec<ParamSpec> {
        let (kh, kw) = self.kernel;
        let channels = self.in_hwc.2;
        let kernel_shape = if self.in_shape.len() == 2 {
            vec![kw, channels, self.filters]
        } else {
            vec![kh, kw, channels, self.filters]
        };

        let receptive = kh * kw;
        vec![
            ParamSpec::new(
                "kernel",
                kernel_shape,
                Init::GlorotUniform {
                    fan_in: receptive * channels,
                    fan_out: receptive * self.filters,
                },
            ),
            ParamSpec::new("bias", vec![self.filters], Init::Zeros),
        ]
    }

    pub fn forward(&mut self, params: &[f32], inputs: &[&ArrayD<f32>]) -> Result<ArrayD<f32>> {
        let x = single("conv", inputs)?;
        let batch = check_batch("conv input", x, &self.in_shape)?;

        let (h, w, c) = self.in_hwc;
        let x4 = x.to_shape((batch, h, w, c))?;
        let padded = self.pad(x4.view());
        let cols = self.im2col(padded.view());

        let (k, b) = self.view_params(params)?;
        let z = (cols.dot(&k) + &b)
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order(batched(batch, &self.out_shape))?;
        let a = self.act_fn.forward(&z);

        self.cols = Some(cols);
        self.z = Some(z);
        self.a = Some(a.clone());
        Ok(a)
    }

    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayD<f32>,
    ) -> Result<Vec<ArrayD<f32>>> {
        let (Some(cols), Some(z), Some(a)) = (&self.cols, &self.z, &self.a) else {
            return Err(MlErr::MissingForwardPass("conv".into()));
        };

        let batch = d.shape()[0];
        let dz = self.act_fn.backward(z, a, d);
        let dz = dz.to_shape((cols.nrows(), self.filters))?;

        let k_size = self.patch_len() * self.filters;
        let (dk_raw, db_raw) = grad.split_at_mut(k_size);
        let mut dk = ArrayViewMut2::from_shape((self.patch_len(), self.filters), dk_raw)?;
        let mut db = ArrayViewMut1::from_shape(self.filters, db_raw)?;
        dk += &cols.t().dot(&dz);
        db += &dz.sum_axis(Axis(0));

        let (k, _) = self.view_params(params)?;
        let dcols = dz.dot(&k.t());
        let dx = self.col2im(batch, dcols.view());

        let dx = dx.as_standard_layout().into_owned();
        Ok(vec![dx.into_shape_with_order(batched(batch, &self.in_shape))?])
    }

    fn padded_hw(&self) -> (usize, usize) {
        let (oh, ow) = self.out_hw;
        let (h, w, _) = self.in_hwc;
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.strides;
        let ph = ((oh - 1) * sh + kh).max(h + self.pads.0);
        let pw = ((ow - 1) * sw + kw).max(w + self.pads.1);
        (ph, pw)
    }

    fn pad(&self, x: ArrayView4<f32>) -> Array4<f32> {
        let (batch, h, w, c) = x.dim();
        let (ph, pw) = self.padded_hw();
        let (top, left) = self.pads;

        let mut padded = Array4::zeros((batch, ph, pw, c));
        padded
            .slice_mut(s![.., top..top + h, left..left + w, ..])
            .assign(&x);
        padded
    }

    /// Unrolls every window of `x` into a row ordered as the kernel's `[kh, kw, C]` axes.
    fn im2col(&self, x: ArrayView4<f32>) -> Array2<f32> {
        let batch = x.dim().0;
        let (oh, ow) = self.out_hw;
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.strides;

        let mut cols = Array2::zeros((batch * oh * ow, self.patch_len()));
        for n in 0..batch {
            for i in 0..oh {
                for j in 0..ow {
                    let row = (n * oh + i) * ow + j;
                    let patch = x.slice(s![n, i * sh..i * sh + kh, j * sw..j * sw + kw, ..]);
                    cols.row_mut(row)
                        .iter_mut()
                        .zip(patch.iter())
                        .for_each(|(dst, &src)| *dst = src);
                }
            }
        }

        cols
    }

    /// Scatters window gradients back onto the unpadded input.
    fn col2im(&self, batch: usize, dcols: ArrayView2<f32>) -> Array4<f32> {
        let (h, w, c) = self.in_hwc;
        let (ph, pw) = self.padded_hw();
        let (oh, ow) = self.out_hw;
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.strides;
        let (top, left) = self.pads;

        let mut dx = Array4::zeros((batch, ph, pw, c));
        for n in 0..batch {
            for i in 0..oh {
                for j in 0..ow {
                    let row = (n * oh + i) * ow + j;
                    dx.slice_mut(s![n, i * sh..i * sh + kh, j * sw..j * sw + kw, ..])
                        .iter_mut()
                        .zip(dcols.row(row))
                        .for_each(|(dst, &g)| *dst += g);
                }
            }
        }

        dx.slice(s![.., top..top + h, left..left + w, ..]).to_owned()
    }

    fn view_params<'a>(&self, params: &'a [f32]) -> Result<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)> {
        let (k_raw, b_raw) = params.split_at(self.patch_len() * self.filters);
        let k = ArrayView2::from_shape((self.patch_len(), self.filters), k_raw)?;
        let b = ArrayView1::from_shape(self.filters, b_raw)?;
        Ok((k, b))
    }
}
