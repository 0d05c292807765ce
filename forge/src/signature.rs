use std::{collections::BTreeMap, path::Path};

use log::info;
use machine_learning::arch::Graph;
use serde::{Deserialize, Serialize};

use crate::{
    ForgeError, Result,
    configs::{Layout, read_json, write_json},
    snapshot::{IO_NAMES_FILE, SAVED_MODEL_FILE},
};

/// The signature key models are served under unless asked otherwise.
pub const DEFAULT_SIGNATURE: &str = "serving_default";

const SAVED_MODEL_VERSION: u32 = 1;

/// The serving metadata of a snapshot, stored as `saved_model.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedModel {
    pub format_version: u32,
    pub model_name: String,
    pub tags: Vec<String>,
    pub signature_defs: BTreeMap<String, SignatureDef>,
}

impl SavedModel {
    /// Describes a graph built from `layout` with a single default signature.
    pub fn new(layout: &Layout, graph: &Graph) -> Self {
        let mut signature_defs = BTreeMap::new();
        signature_defs.insert(DEFAULT_SIGNATURE.to_string(), SignatureDef::new(layout, graph));

        Self {
            format_version: SAVED_MODEL_VERSION,
            model_name: layout.model_name.clone(),
            tags: vec!["serve".to_string()],
            signature_defs,
        }
    }
}

/// The named inputs and outputs a model is served with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureDef {
    pub inputs: BTreeMap<String, TensorInfo>,
    pub outputs: BTreeMap<String, TensorInfo>,
}

impl SignatureDef {
    fn new(layout: &Layout, graph: &Graph) -> Self {
        let inputs = layout
            .inputs
            .iter()
            .map(|input| {
                let info = TensorInfo {
                    name: format!("{DEFAULT_SIGNATURE}_{}:0", input.name),
                    dtype: input.dtype.name().to_string(),
                    shape: input.shape.clone(),
                };
                (input.name.clone(), info)
            })
            .collect();

        // Served outputs are numbered in alias order
        let mut aliases: Vec<_> = graph.output_names().into_iter().zip(graph.output_shapes()).collect();
        aliases.sort_by_key(|(name, _)| *name);

        let outputs = aliases
            .into_iter()
            .enumerate()
            .map(|(i, (name, shape))| {
                let info = TensorInfo {
                    name: format!("StatefulPartitionedCall:{i}"),
                    dtype: "float32".to_string(),
                    shape: std::iter::once(-1)
                        .chain(shape.iter().map(|&d| d as i64))
                        .collect(),
                };
                (name.to_string(), info)
            })
            .collect();

        Self { inputs, outputs }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<i64>,
}

/// The tensor name of every input and output alias of a signature.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IoNames {
    pub inputs: BTreeMap<String, String>,
    pub outputs: BTreeMap<String, String>,
}

impl From<&SignatureDef> for IoNames {
    fn from(def: &SignatureDef) -> Self {
        let names = |infos: &BTreeMap<String, TensorInfo>| {
            infos
                .iter()
                .map(|(alias, info)| (alias.clone(), info.name.clone()))
                .collect()
        };

        Self {
            inputs: names(&def.inputs),
            outputs: names(&def.outputs),
        }
    }
}

/// Reads the tensor names a snapshot is served with.
///
/// # Arguments
/// * `snapshot` - The snapshot directory.
/// * `key` - The signature to read, usually `DEFAULT_SIGNATURE`.
///
/// # Errors
/// `ForgeError::MissingFile` if the snapshot has no serving metadata and
/// `ForgeError::SignatureNotFound` if it has no signature under `key`.
pub fn extract_tensor_names(snapshot: &Path, key: &str) -> Result<IoNames> {
    let path = snapshot.join(SAVED_MODEL_FILE);
    if !path.is_file() {
        return Err(ForgeError::MissingFile {
            what: "Missing Saved Model Metadata File.",
            path,
        });
    }

    let saved: SavedModel = read_json(&path)?;
    let def = saved
        .signature_defs
        .get(key)
        .ok_or_else(|| ForgeError::SignatureNotFound {
            key: key.to_string(),
            available: saved.signature_defs.keys().cloned().collect(),
        })?;

    Ok(def.into())
}

/// Writes `names` next to the snapshot as `cppflow_io_names.json`.
pub fn write_io_names(snapshot: &Path, names: &IoNames, indent: usize) -> Result<()> {
    let path = snapshot.join(IO_NAMES_FILE);
    write_json(&path, names, indent)?;

    info!("wrote io names to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{IoNames, SignatureDef, TensorInfo};

    fn info(name: &str) -> TensorInfo {
        TensorInfo {
            name: name.to_string(),
            dtype: "float32".to_string(),
            shape: vec![-1, 1],
        }
    }

    #[test]
    fn io_names_map_aliases_to_tensor_names() {
        let def = SignatureDef {
            inputs: BTreeMap::from([("state".to_string(), info("serving_default_state:0"))]),
            outputs: BTreeMap::from([("q".to_string(), info("StatefulPartitionedCall:0"))]),
        };

        let names = IoNames::from(&def);
        assert_eq!(names.inputs["state"], "serving_default_state:0");
        assert_eq!(names.outputs["q"], "StatefulPartitionedCall:0");
    }
}
