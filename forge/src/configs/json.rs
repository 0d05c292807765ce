use std::{fs, path::Path};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::ser::PrettyFormatter;

use crate::{ForgeError, Result};

/// Reads and deserializes a json file.
///
/// # Errors
/// `ForgeError::Io` if the file can't be read, `ForgeError::Json` if it doesn't parse as `T`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).map_err(|e| ForgeError::io(path, e))?;
    serde_json::from_str(&content).map_err(|e| ForgeError::json(path, e))
}

/// Serializes `value` as json indented by `indent` spaces and writes it to `path`.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T, indent: usize) -> Result<()> {
    let spaces = vec![b' '; indent];
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(&spaces));
    value
        .serialize(&mut ser)
        .map_err(|e| ForgeError::json(path, e))?;

    fs::write(path, buf).map_err(|e| ForgeError::io(path, e))
}
