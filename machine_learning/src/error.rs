use thiserror::Error;

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug, Error)]
pub enum MlErr {
    #[error("there's a size mismatch between {a} and {b}, got {got} and expected {expected}")]
    SizeMismatch {
        a: &'static str,
        b: &'static str,
        got: usize,
        expected: usize,
    },

    #[error("shape mismatch for {what}: got {got:?}, expected {expected:?}")]
    ShapeMismatch {
        what: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },

    #[error("tensor '{0}' is defined more than once")]
    DuplicateTensor(String),

    #[error("invalid layer configuration: {0}")]
    InvalidLayer(String),

    #[error("layer '{0}' was asked for a backward pass without a forward pass")]
    MissingForwardPass(String),

    #[error("the dataset has no samples")]
    EmptyDataset,

    #[error("invalid initializer range: {0}")]
    InvalidInit(String),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

impl MlErr {
    /// Shorthand for a `ShapeMismatch` error.
    pub fn shape(what: impl Into<String>, got: &[usize], expected: &[usize]) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            got: got.to_vec(),
            expected: expected.to_vec(),
        }
    }
}
