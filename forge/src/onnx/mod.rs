//! Converts ONNX models into layouts and snapshots.

mod convert;
pub mod proto;

pub use convert::{convert, convert_onnx_file};
