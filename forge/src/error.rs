use std::path::PathBuf;

use machine_learning::MlErr;
use thiserror::Error;

/// The result type used in the entire forge crate.
pub type Result<T> = std::result::Result<T, ForgeError>;

/// All errors that can occur while building, training, converting or exporting models.
#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("i/o error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid json in '{path}': {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// A required file is missing, `what` is the message shown to the user.
    #[error("{what} ({})", path.display())]
    MissingFile { what: &'static str, path: PathBuf },

    #[error("layer #{index} has unsupported type '{kind}'")]
    UnsupportedLayer { index: usize, kind: String },

    #[error("layer #{index} ({kind}) has invalid params: {msg}")]
    InvalidLayerParams {
        index: usize,
        kind: String,
        msg: String,
    },

    #[error("'{layer}' references undefined tensor '{name}'")]
    UndefinedTensor { layer: String, name: String },

    #[error("tensor '{0}' is defined more than once")]
    DuplicateTensor(String),

    #[error("input '{name}' has non positive feature dimension in shape {shape:?}")]
    DynamicDimension { name: String, shape: Vec<i64> },

    #[error("unknown activation '{0}'")]
    UnknownActivation(String),

    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    #[error("snapshot '{}' already exists", .0.display())]
    SnapshotExists(PathBuf),

    #[error("invalid snapshot '{}': {msg}", path.display())]
    InvalidSnapshot { path: PathBuf, msg: String },

    #[error("signature '{key}' not found, available: {available:?}")]
    SignatureNotFound { key: String, available: Vec<String> },

    #[error("invalid training data: {0}")]
    InvalidData(String),

    #[error("shape mismatch for '{name}': {msg}")]
    ShapeMismatch { name: String, msg: String },

    /// Reward training preconditions failed, checked before any tensor is built.
    #[error("reward training misconfigured: {0}")]
    RewardConfig(String),

    #[error("image '{}': {source}", path.display())]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("onnx conversion failed: {0}")]
    Onnx(String),

    #[error("onnx decoding failed: {0}")]
    OnnxDecode(#[from] prost::DecodeError),

    #[error("http request failed: {0}")]
    Http(#[from] Box<ureq::Error>),

    #[error("failed to read response from '{url}': {source}")]
    Download {
        url: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Ml(#[from] MlErr),

    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

impl ForgeError {
    /// Wraps an i/o error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wraps a json error with the path of the offending file.
    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}
