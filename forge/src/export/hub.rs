use std::{io::Read, time::Duration};

use log::debug;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;
use ureq::Agent;

use super::{Page, Row, RowSource};
use crate::{ForgeError, Result};

pub const DATASETS_SERVER: &str = "https://datasets-server.huggingface.co";
pub const DEFAULT_DATASET: &str = "yashikota/birds-525-species-image-classification";
pub const DEFAULT_CONFIG: &str = "default";
pub const DEFAULT_SPLIT: &str = "test";
pub const DEFAULT_OUTPUT: &str = "birds_525_images";

const MAX_IMAGE_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct InfoResponse {
    dataset_info: DatasetInfo,
}

#[derive(Debug, Deserialize)]
struct DatasetInfo {
    features: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RowsResponse {
    rows: Vec<RowEntry>,
    num_rows_total: usize,
}

#[derive(Debug, Deserialize)]
struct RowEntry {
    row_idx: usize,
    row: Value,
}

/// Reads a dataset split through the Hugging Face datasets server.
#[derive(Debug, Clone)]
pub struct HubSource {
    agent: Agent,
    base_url: String,
    dataset: String,
    config: String,
    split: String,
}

impl HubSource {
    pub fn new(dataset: &str, config: &str, split: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(60))
            .build();

        Self {
            agent,
            base_url: DATASETS_SERVER.to_string(),
            dataset: dataset.to_string(),
            config: config.to_string(),
            split: split.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn get_json<T: DeserializeOwned>(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = format!("{}/{endpoint}", self.base_url);
        debug!("GET {url} {query:?}");

        let response = self
            .agent
            .get(&url)
            .query_pairs(query.iter().copied())
            .call()
            .map_err(Box::new)?;

        response
            .into_json()
            .map_err(|source| ForgeError::Download { url, source })
    }
}

impl RowSource for HubSource {
    fn label_names(&self) -> Result<Vec<String>> {
        let info: InfoResponse = self.get_json(
            "info",
            &[("dataset", self.dataset.as_str()), ("config", self.config.as_str())],
        )?;

        let names = info
            .dataset_info
            .features
            .get("label")
            .and_then(|label| label.get("names"))
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ForgeError::InvalidData(format!("'{}' has no label names", self.dataset))
            })?;

        names
            .iter()
            .map(|n| {
                n.as_str().map(str::to_string).ok_or_else(|| {
                    ForgeError::InvalidData(format!("label name {n} isn't a string"))
                })
            })
            .collect()
    }

    fn rows(&self, offset: usize, length: usize) -> Result<Page> {
        let (offset, length) = (offset.to_string(), length.to_string());
        let response: RowsResponse = self.get_json(
            "rows",
            &[
                ("dataset", self.dataset.as_str()),
                ("config", self.config.as_str()),
                ("split", self.split.as_str()),
                ("offset", offset.as_str()),
                ("length", length.as_str()),
            ],
        )?;

        let rows = response
            .rows
            .into_iter()
            .map(|entry| {
                let label = entry.row.get("label").and_then(Value::as_u64);
                let src = entry
                    .row
                    .get("image")
                    .and_then(|image| image.get("src"))
                    .and_then(Value::as_str);

                match (label, src) {
                    (Some(label), Some(src)) => Ok(Row {
                        row_idx: entry.row_idx,
                        label: label as usize,
                        image_src: src.to_string(),
                    }),
                    _ => Err(ForgeError::InvalidData(format!(
                        "row {} has no label or image",
                        entry.row_idx
                    ))),
                }
            })
            .collect::<Result<_>>()?;

        Ok(Page {
            rows,
            total: response.num_rows_total,
        })
    }

    fn image_bytes(&self, row: &Row) -> Result<Vec<u8>> {
        let url = &row.image_src;
        let response = self.agent.get(url).call().map_err(Box::new)?;

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_IMAGE_BYTES)
            .read_to_end(&mut bytes)
            .map_err(|source| ForgeError::Download {
                url: url.clone(),
                source,
            })?;

        Ok(bytes)
    }
}
