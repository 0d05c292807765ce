use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use machine_learning::arch::Graph;
use safetensors::{Dtype, SafeTensors, serialize_to_file, tensor::TensorView};

use crate::{
    ForgeError, Result,
    builder::{GraphBuilder, UnknownLayerPolicy},
    configs::{Layout, write_json},
    signature::SavedModel,
};

pub const LAYOUT_FILE: &str = "layout.json";
pub const VARIABLES_FILE: &str = "variables.safetensors";
pub const SAVED_MODEL_FILE: &str = "saved_model.json";
pub const IO_NAMES_FILE: &str = "cppflow_io_names.json";

/// A model loaded back from a snapshot directory.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub layout: Layout,
    pub graph: Graph,
}

/// Writes a new snapshot of `graph` at `dir`.
///
/// The snapshot is written to a sibling directory first and renamed into place, so `dir`
/// either doesn't exist or holds a complete snapshot.
///
/// # Arguments
/// * `dir` - The snapshot directory, it must not exist.
/// * `layout` - The layout `graph` was built from.
/// * `graph` - The model.
///
/// # Errors
/// `ForgeError::SnapshotExists` if `dir` already exists.
pub fn save(dir: &Path, layout: &Layout, graph: &Graph) -> Result<()> {
    if dir.exists() {
        return Err(ForgeError::SnapshotExists(dir.to_path_buf()));
    }

    let staging = staging_dir(dir)?;
    if staging.exists() {
        warn!("removing stale staging directory {}", staging.display());
        fs::remove_dir_all(&staging).map_err(|e| ForgeError::io(&staging, e))?;
    }
    fs::create_dir_all(&staging).map_err(|e| ForgeError::io(&staging, e))?;

    let written = write_contents(&staging, layout, graph).and_then(|()| {
        if dir.exists() {
            return Err(ForgeError::SnapshotExists(dir.to_path_buf()));
        }
        fs::rename(&staging, dir).map_err(|e| ForgeError::io(dir, e))
    });

    if let Err(e) = written {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }

    info!("saved snapshot {}", dir.display());
    Ok(())
}

fn staging_dir(dir: &Path) -> Result<PathBuf> {
    let name = dir
        .file_name()
        .ok_or_else(|| ForgeError::InvalidSnapshot {
            path: dir.to_path_buf(),
            msg: "a snapshot directory needs a name".into(),
        })?
        .to_string_lossy();

    let parent = dir.parent().unwrap_or(Path::new(""));
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent).map_err(|e| ForgeError::io(parent, e))?;
    }

    Ok(parent.join(format!(".{name}.partial-{}", std::process::id())))
}

fn write_contents(dir: &Path, layout: &Layout, graph: &Graph) -> Result<()> {
    layout.save(&dir.join(LAYOUT_FILE))?;
    write_variables(&dir.join(VARIABLES_FILE), graph)?;
    write_json(&dir.join(SAVED_MODEL_FILE), &SavedModel::new(layout, graph), 2)
}

fn write_variables(path: &Path, graph: &Graph) -> Result<()> {
    let params = graph.params();
    let named = graph.named_params();

    let mut views = Vec::with_capacity(named.len());
    for p in &named {
        let bytes: &[u8] = bytemuck::cast_slice(&params[p.range.clone()]);
        views.push((p.name.as_str(), TensorView::new(Dtype::F32, p.shape.clone(), bytes)?));
    }

    debug!("writing {} tensors to {}", views.len(), path.display());
    serialize_to_file(views, &None, path)?;
    Ok(())
}

/// Loads the snapshot at `dir`.
///
/// The graph is rebuilt from the stored layout and every parameter tensor is read back by
/// name. Layer types the builder doesn't know were skipped when the snapshot was saved, so
/// they're skipped again here.
///
/// # Errors
/// `ForgeError::InvalidSnapshot` if a stored tensor is missing or doesn't match the graph.
pub fn load(dir: &Path) -> Result<Snapshot> {
    let invalid = |msg: String| ForgeError::InvalidSnapshot {
        path: dir.to_path_buf(),
        msg,
    };

    if !dir.is_dir() {
        return Err(invalid("not a snapshot directory".into()));
    }

    let layout = Layout::load(&dir.join(LAYOUT_FILE))?;
    let mut graph = GraphBuilder::new()
        .with_policy(UnknownLayerPolicy::Skip)
        .build(&layout)?;

    let path = dir.join(VARIABLES_FILE);
    let buf = fs::read(&path).map_err(|e| ForgeError::io(&path, e))?;
    let tensors = SafeTensors::deserialize(&buf)?;

    for p in graph.named_params() {
        let tensor = tensors
            .tensor(&p.name)
            .map_err(|_| invalid(format!("tensor '{}' is missing", p.name)))?;

        if tensor.dtype() != Dtype::F32 || tensor.shape() != p.shape.as_slice() {
            return Err(invalid(format!(
                "tensor '{}' is {:?} {:?}, expected F32 {:?}",
                p.name,
                tensor.dtype(),
                tensor.shape(),
                p.shape
            )));
        }

        let dst = &mut graph.params_mut()[p.range];
        for (x, chunk) in dst.iter_mut().zip(tensor.data().chunks_exact(4)) {
            *x = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
    }

    info!("loaded snapshot {} ({} parameters)", dir.display(), graph.size());
    Ok(Snapshot { layout, graph })
}
