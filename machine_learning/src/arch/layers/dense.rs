use ndarray::{Array2, ArrayD, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis};

use super::{ParamSpec, batched, check_batch, single};
use crate::{MlErr, Result, arch::activations::ActFn, initialization::Init};

/// A fully connected layer applied over the last axis of its input.
#[derive(Debug, Clone)]
pub struct Dense {
    in_shape: Vec<usize>,
    units: usize,
    act_fn: ActFn,

    // Forward metadata
    x: Option<Array2<f32>>,
    z: Option<ArrayD<f32>>,
    a: Option<ArrayD<f32>>,
}

impl Dense {
    /// Returns a new `Dense`.
    ///
    /// # Arguments
    /// * `in_shape` - The feature shape of the input, its last axis is contracted.
    /// * `units` - The amount of output units.
    /// * `act_fn` - The activation applied to the affine output.
    pub fn new(in_shape: &[usize], units: usize, act_fn: ActFn) -> Result<Self> {
        if in_shape.is_empty() || units == 0 {
            return Err(MlErr::InvalidLayer(format!(
                "dense needs a non scalar input and at least one unit, got input {in_shape:?} and {units} units"
            )));
        }

        Ok(Self {
            in_shape: in_shape.to_vec(),
            units,
            act_fn,
            x: None,
            z: None,
            a: None,
        })
    }

    pub fn units(&self) -> usize {
        self.units
    }

    pub fn act_fn(&self) -> ActFn {
        self.act_fn
    }

    fn fan_in(&self) -> usize {
        self.in_shape[self.in_shape.len() - 1]
    }

    pub fn size(&self) -> usize {
        (self.fan_in() + 1) * self.units
    }

    pub fn output_shape(&self) -> Vec<usize> {
        let mut shape = self.in_shape.clone();
        let last = shape.len() - 1;
        shape[last] = self.units;
        shape
    }

    pub fn param_specs(&self) -> Vec<ParamSpec> {
        let (fan_in, units) = (self.fan_in(), self.units);
        vec![
            ParamSpec::new(
                "kernel",
                vec![fan_in, units],
                Init::GlorotUniform {
                    fan_in,
                    fan_out: units,
                },
            ),
            ParamSpec::new("bias", vec![units], Init::Zeros),
        ]
    }

    pub fn forward(&mut self, params: &[f32], inputs: &[&ArrayD<f32>]) -> Result<ArrayD<f32>> {
        let x = single("dense", inputs)?;
        let batch = check_batch("dense input", x, &self.in_shape)?;

        let (w, b) = self.view_params(params)?;
        let rows = x.len() / self.fan_in();
        let x2 = x
            .to_shape((rows, self.fan_in()))?
            .into_owned();

        let z = (x2.dot(&w) + b)
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order(batched(batch, &self.output_shape()))?;
        let a = self.act_fn.forward(&z);

        self.x = Some(x2);
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
        let (Some(x), Some(z), Some(a)) = (&self.x, &self.z, &self.a) else {
            return Err(MlErr::MissingForwardPass("dense".into()));
        };

        let in_batch = batched(d.shape()[0], &self.in_shape);
        let dz = self.act_fn.backward(z, a, d);
        let dz = dz.to_shape((x.nrows(), self.units))?;

        let (mut dw, mut db) = self.view_grad(grad)?;
        dw += &x.t().dot(&dz);
        db += &dz.sum_axis(Axis(0));

        let (w, _) = self.view_params(params)?;
        let dx = dz
            .dot(&w.t())
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order(in_batch)?;
        Ok(vec![dx])
    }

    /// Gives a view of the raw parameter slice as the kernel and bias of this layer.
    ///
    /// # Arguments
    /// * `params` - A slice of parameters.
    ///
    /// # Returns
    /// A tuple containing the kernel and the bias.
    fn view_params<'a>(&self, params: &'a [f32]) -> Result<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)> {
        let w_size = self.fan_in() * self.units;
        let (w_raw, b_raw) = params.split_at(w_size);
        let w = ArrayView2::from_shape((self.fan_in(), self.units), w_raw)?;
        let b = ArrayView1::from_shape(self.units, b_raw)?;
        Ok((w, b))
    }

    /// Gives a view of the raw gradient slice as the delta kernel and delta bias of this layer.
    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> Result<(ArrayViewMut2<'a, f32>, ArrayViewMut1<'a, f32>)> {
        let w_size = self.fan_in() * self.units;
        let (dw_raw, db_raw) = grad.split_at_mut(w_size);
        let dw = ArrayViewMut2::from_shape((self.fan_in(), self.units), dw_raw)?;
        let db = ArrayViewMut1::from_shape(self.units, db_raw)?;
        Ok((dw, db))
    }
}
