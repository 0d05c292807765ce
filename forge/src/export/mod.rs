//! Exports labelled image datasets as a directory tree of JPEG files, used to produce
//! image fixtures for training tests.

mod hub;

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use image::ImageFormat;
use log::{debug, info};

pub use hub::{DEFAULT_CONFIG, DEFAULT_DATASET, DEFAULT_OUTPUT, DEFAULT_SPLIT, HubSource};

use crate::{ForgeError, Result, configs::write_json};

/// Name of the file mapping label indices to label names.
pub const LABEL_MAP_FILE: &str = "label_map.json";

/// A dataset row, pointing at its image.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub row_idx: usize,
    pub label: usize,
    pub image_src: String,
}

/// A page of rows and the total amount of rows in the split.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub rows: Vec<Row>,
    pub total: usize,
}

/// A paginated source of labelled images.
pub trait RowSource {
    /// The label names, indexed by label.
    fn label_names(&self) -> Result<Vec<String>>;

    /// Fetches at most `length` rows starting at `offset`.
    fn rows(&self, offset: usize, length: usize) -> Result<Page>;

    /// Fetches the encoded image of `row`.
    fn image_bytes(&self, row: &Row) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub output: PathBuf,
    pub page_size: usize,
    pub limit: Option<usize>,
}

impl ExportOptions {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            page_size: 100,
            limit: None,
        }
    }
}

/// What an export wrote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportReport {
    pub labels: usize,
    pub images: usize,
}

/// Writes `<output>/label_map.json` and one JPEG per row at
/// `<output>/<label>/<label>_<row index>.jpg`, spaces in label names replaced by `_`.
///
/// # Arguments
/// * `source` - Where the labels, rows and images come from.
/// * `opts` - The output directory, the page size and an optional limit on exported rows.
///
/// # Errors
/// `ForgeError::InvalidData` if a row's label has no name, plus whatever the source,
/// the image codec or the filesystem fail with.
pub fn export_dataset(source: &impl RowSource, opts: &ExportOptions) -> Result<ExportReport> {
    let out = &opts.output;
    fs::create_dir_all(out).map_err(|e| ForgeError::io(out, e))?;

    let names = source.label_names()?;
    let label_map: BTreeMap<usize, &str> =
        names.iter().enumerate().map(|(i, n)| (i, n.as_str())).collect();
    write_json(&out.join(LABEL_MAP_FILE), &label_map, 4)?;
    info!("saved {} labels to {LABEL_MAP_FILE}", names.len());

    let page_size = opts.page_size.max(1);
    let mut offset = 0;
    let mut images = 0;

    loop {
        let length = match opts.limit {
            Some(limit) if images >= limit => break,
            Some(limit) => page_size.min(limit - images),
            None => page_size,
        };

        let page = source.rows(offset, length)?;
        if page.rows.is_empty() {
            break;
        }

        for row in page.rows.iter().take(length) {
            let name = names.get(row.label).ok_or_else(|| {
                ForgeError::InvalidData(format!(
                    "row {} has label {} but there are {} label names",
                    row.row_idx,
                    row.label,
                    names.len()
                ))
            })?;

            let bytes = source.image_bytes(row)?;
            let path = image_path(out, name, row.row_idx);
            save_jpeg(&bytes, &path)?;
            debug!(row = row.row_idx, label = name.as_str(); "image saved");
            images += 1;
        }

        offset += page.rows.len();
        info!("saved {images} of {} images", page.total);
        if offset >= page.total {
            break;
        }
    }

    Ok(ExportReport {
        labels: names.len(),
        images,
    })
}

fn image_path(out: &Path, label: &str, row_idx: usize) -> PathBuf {
    let label = label.replace([' ', '/', '\\'], "_");
    out.join(&label).join(format!("{label}_{row_idx}.jpg"))
}

fn save_jpeg(bytes: &[u8], path: &Path) -> Result<()> {
    let image_err = |source| ForgeError::Image {
        path: path.to_path_buf(),
        source,
    };

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| ForgeError::io(dir, e))?;
    }

    let img = image::load_from_memory(bytes).map_err(image_err)?;
    img.to_rgb8()
        .save_with_format(path, ImageFormat::Jpeg)
        .map_err(image_err)
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::BTreeMap, io::Cursor};

    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

    use super::{ExportOptions, LABEL_MAP_FILE, Page, Row, RowSource, export_dataset};
    use crate::{ForgeError, Result, configs::read_json};

    struct FakeSource {
        labels: Vec<String>,
        rows: Vec<Row>,
        requested: RefCell<Vec<(usize, usize)>>,
    }

    impl FakeSource {
        fn new(labels: &[usize]) -> Self {
            let rows = labels
                .iter()
                .enumerate()
                .map(|(i, &label)| Row {
                    row_idx: i,
                    label,
                    image_src: format!("mem://{i}"),
                })
                .collect();

            Self {
                labels: vec!["black swan".into(), "crow".into()],
                rows,
                requested: RefCell::default(),
            }
        }
    }

    impl RowSource for FakeSource {
        fn label_names(&self) -> Result<Vec<String>> {
            Ok(self.labels.clone())
        }

        fn rows(&self, offset: usize, length: usize) -> Result<Page> {
            self.requested.borrow_mut().push((offset, length));
            let rows = self.rows.iter().skip(offset).take(length).cloned().collect();
            Ok(Page {
                rows,
                total: self.rows.len(),
            })
        }

        fn image_bytes(&self, _row: &Row) -> Result<Vec<u8>> {
            let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([10, 200, 30])));
            let mut buf = Cursor::new(Vec::new());
            img.write_to(&mut buf, ImageFormat::Png).unwrap();
            Ok(buf.into_inner())
        }
    }

    #[test]
    fn writes_label_map_and_images_per_label() {
        let tmp = tempfile::tempdir().unwrap();
        let source = FakeSource::new(&[0, 1, 0, 1, 1]);
        let mut opts = ExportOptions::new(tmp.path().join("birds"));
        opts.page_size = 2;

        let report = export_dataset(&source, &opts).unwrap();
        assert_eq!(report.images, 5);
        assert_eq!(report.labels, 2);
        assert_eq!(*source.requested.borrow(), vec![(0, 2), (2, 2), (4, 2)]);

        let map: BTreeMap<String, String> = read_json(&opts.output.join(LABEL_MAP_FILE)).unwrap();
        assert_eq!(map["0"], "black swan");
        assert_eq!(map["1"], "crow");

        let swan = opts.output.join("black_swan").join("black_swan_2.jpg");
        assert!(swan.is_file());
        assert_eq!(image::open(&swan).unwrap().width(), 4);
        assert!(opts.output.join("crow").join("crow_4.jpg").is_file());
    }

    #[test]
    fn limit_caps_exported_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let source = FakeSource::new(&[0, 1, 0, 1, 1]);
        let mut opts = ExportOptions::new(tmp.path());
        opts.page_size = 2;
        opts.limit = Some(3);

        let report = export_dataset(&source, &opts).unwrap();
        assert_eq!(report.images, 3);
        assert_eq!(*source.requested.borrow(), vec![(0, 2), (2, 1)]);
        assert!(!tmp.path().join("crow").join("crow_3.jpg").exists());
    }

    #[test]
    fn unnamed_labels_are_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let source = FakeSource::new(&[0, 7]);

        let err = export_dataset(&source, &ExportOptions::new(tmp.path())).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidData(_)));
    }
}
