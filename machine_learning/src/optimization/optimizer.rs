use crate::Result;

/// A parameter update rule.
pub trait Optimizer {
    /// Takes one step over `params` given their gradient.
    ///
    /// # Errors
    /// `MlErr::SizeMismatch` if `grad`, `params` and the optimizer's state disagree in length.
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()>;
}
