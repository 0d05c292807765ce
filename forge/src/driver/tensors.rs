use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use log::info;
use ndarray::{ArrayD, IxDyn};
use rayon::prelude::*;
use serde_json::Value;

use crate::{
    ForgeError, Result,
    configs::{DType, Domain, InputSpec},
};

/// Builds the batched tensor of a model input from its raw training values.
pub fn input_tensor(spec: &InputSpec, value: &Value) -> Result<ArrayD<f32>> {
    let features = spec.feature_shape()?;
    match spec.domain {
        Domain::Data => data_tensor(&spec.name, value, &features, spec.dtype),
        Domain::Image => {
            info!("loading image inputs for '{}'", spec.name);
            image_tensor(&spec.name, value, &features, spec.dtype)
        }
    }
}

/// Flattens a nested json array, casts it and reshapes it to `[-1] + features`.
///
/// # Errors
/// `ForgeError::InvalidData` on non numeric values and `ForgeError::ShapeMismatch` if the
/// amount of values isn't a multiple of the feature size.
pub fn data_tensor(
    name: &str,
    value: &Value,
    features: &[usize],
    dtype: DType,
) -> Result<ArrayD<f32>> {
    let mut values = Vec::new();
    flatten_into(name, value, &mut values)?;
    values.iter_mut().for_each(|v| *v = dtype.cast(*v));
    to_batch(name, values, features)
}

/// Collects every number of a nested json array in row major order.
pub(crate) fn flatten_into(name: &str, value: &Value, out: &mut Vec<f32>) -> Result<()> {
    match value {
        Value::Array(items) => {
            for item in items {
                flatten_into(name, item, out)?;
            }
        }
        Value::Number(n) => {
            let n = n.as_f64().ok_or_else(|| {
                ForgeError::InvalidData(format!("'{name}' holds a non finite number {n}"))
            })?;
            out.push(n as f32);
        }
        Value::Bool(b) => out.push(*b as u8 as f32),
        other => {
            return Err(ForgeError::InvalidData(format!(
                "'{name}' holds a non numeric value {other}"
            )));
        }
    }

    Ok(())
}

/// Reshapes flat values to `[-1] + features`.
pub(crate) fn to_batch(name: &str, values: Vec<f32>, features: &[usize]) -> Result<ArrayD<f32>> {
    let size: usize = features.iter().product();
    if size == 0 || values.len() % size != 0 {
        return Err(ForgeError::ShapeMismatch {
            name: name.to_string(),
            msg: format!(
                "{} values can't be split in samples of shape {features:?}",
                values.len()
            ),
        });
    }

    let mut shape = vec![values.len() / size];
    shape.extend_from_slice(features);
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(machine_learning::MlErr::from)?)
}

/// Decodes, resizes and stacks the images listed for an image input.
///
/// Every sample is either a path or a list whose first element is the path. Float dtypes
/// keep pixels in `[0, 1]`, integer dtypes in `[0, 255]`.
pub fn image_tensor(
    name: &str,
    value: &Value,
    features: &[usize],
    dtype: DType,
) -> Result<ArrayD<f32>> {
    let &[h, w, c] = features else {
        return Err(ForgeError::ShapeMismatch {
            name: name.to_string(),
            msg: format!("image inputs need a [height, width, channels] shape, got {features:?}"),
        });
    };

    let paths = image_paths(name, value)?;
    let images = paths
        .par_iter()
        .map(|path| load_image(path, h, w, c, dtype))
        .collect::<Result<Vec<_>>>()?;

    to_batch(name, images.concat(), features)
}

fn image_paths(name: &str, value: &Value) -> Result<Vec<PathBuf>> {
    let Value::Array(samples) = value else {
        return Err(ForgeError::InvalidData(format!(
            "'{name}' must list one image per sample"
        )));
    };

    samples
        .iter()
        .map(|sample| {
            let path = match sample {
                Value::String(path) => Some(path.as_str()),
                Value::Array(list) => list.first().and_then(Value::as_str),
                _ => None,
            };

            path.map(PathBuf::from).ok_or_else(|| {
                ForgeError::InvalidData(format!("'{name}' has a sample without a path: {sample}"))
            })
        })
        .collect()
}

fn load_image(path: &Path, h: usize, w: usize, c: usize, dtype: DType) -> Result<Vec<f32>> {
    let image_err = |source| ForgeError::Image {
        path: path.to_path_buf(),
        source,
    };

    let img = image::open(path).map_err(image_err)?;
    let img = img.resize_exact(w as u32, h as u32, FilterType::Triangle);

    let pixels = match c {
        1 => img.to_luma32f().into_raw(),
        3 => img.to_rgb32f().into_raw(),
        4 => img.to_rgba32f().into_raw(),
        _ => {
            return Err(ForgeError::ShapeMismatch {
                name: path.display().to_string(),
                msg: format!("images can have 1, 3 or 4 channels, not {c}"),
            });
        }
    };

    let pixels = if dtype.is_float() {
        pixels
    } else {
        pixels
            .into_iter()
            .map(|v| dtype.cast((v * 255.).round()))
            .collect()
    };

    Ok(pixels)
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};
    use serde_json::json;

    use super::{data_tensor, image_tensor};
    use crate::{ForgeError, configs::DType};

    #[test]
    fn nested_values_are_batched_by_feature_shape() {
        let value = json!([[[1, 2], [3, 4]], [[5, 6], [7, 8]], [[9, 10], [11, 12]]]);
        let x = data_tensor("x", &value, &[2, 2], DType::Float32).unwrap();
        assert_eq!(x.shape(), &[3, 2, 2]);

        let flat = data_tensor("x", &json!([1.5, 2.5, -3.5, 4.0]), &[2], DType::Int32).unwrap();
        assert_eq!(flat.shape(), &[2, 2]);
        assert_eq!(flat.iter().copied().collect::<Vec<_>>(), vec![1., 2., -3., 4.]);
    }

    #[test]
    fn uneven_values_are_a_shape_mismatch() {
        let err = data_tensor("x", &json!([1, 2, 3]), &[2], DType::Float32).unwrap_err();
        assert!(matches!(err, ForgeError::ShapeMismatch { .. }));
    }

    #[test]
    fn non_numeric_values_are_rejected() {
        let err = data_tensor("x", &json!([1, "two"]), &[1], DType::Float32).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidData(_)));
    }

    #[test]
    fn images_are_resized_and_scaled() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("red.png");
        RgbImage::from_pixel(6, 4, Rgb([255, 0, 0])).save(&path).unwrap();
        let path = path.to_string_lossy().to_string();

        let value = json!([path.clone(), [path, 3]]);
        let float = image_tensor("img", &value, &[2, 3, 3], DType::Float32).unwrap();
        assert_eq!(float.shape(), &[2, 2, 3, 3]);
        assert!((float[[0, 0, 0, 0]] - 1.).abs() < 1e-6);
        assert!(float[[1, 1, 2, 1]].abs() < 1e-6);

        let bytes = image_tensor("img", &value, &[2, 3, 1], DType::Uint8).unwrap();
        assert_eq!(bytes.shape(), &[2, 2, 3, 1]);
        assert!(bytes.iter().all(|&v| v == v.trunc() && (0. ..=255.).contains(&v)));
    }
}
