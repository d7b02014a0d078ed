//! Local crop-and-save delivery
//!
//! The crop-mode sink: decode fetched bytes, cut out the annotation box,
//! write the crop as PNG under the output directory, and append a
//! `(path, label)` row to `labels.csv`. Rows already present from earlier
//! runs are loaded at construction so re-running an unchanged manifest is
//! idempotent.

use crate::coco::BBox;
use crate::error::{Result, TransferError};
use crate::fetch::FetchedAsset;
use crate::pipeline::{DeliveredItem, TransferSink, TransferTask};
use async_trait::async_trait;
use image::DynamicImage;
use std::borrow::Cow;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Name of the label index written next to the crops.
pub const LABELS_FILE: &str = "labels.csv";

const LABELS_HEADER: &str = "path,label";

/// Crop an image to a COCO box.
///
/// The box is resolved against the decoded image's actual dimensions, so a
/// manifest that lies about its sizes still produces a valid crop. An
/// interior box of `(x, y, w, h)` yields exactly `(w, h)` pixels.
///
/// # Errors
/// - Box rounds to zero area or exceeds the image in either dimension
pub fn crop_image(image: &DynamicImage, bbox: &BBox) -> Result<DynamicImage> {
    let px = bbox.to_pixels(image.width(), image.height()).ok_or_else(|| {
        TransferError::image_error(format!(
            "crop box [{}, {}, {}, {}] does not fit a {}x{} image",
            bbox.x,
            bbox.y,
            bbox.width,
            bbox.height,
            image.width(),
            image.height()
        ))
    })?;
    Ok(image.crop_imm(px.x, px.y, px.width, px.height))
}

/// Sink that persists crops locally and maintains the label index.
pub struct CropExportSink {
    output_dir: PathBuf,
    labels: Mutex<LabelIndex>,
}

struct LabelIndex {
    file: File,
    recorded: HashSet<String>,
}

impl CropExportSink {
    /// Open (or create) an output directory and its label index.
    ///
    /// Existing `labels.csv` rows are loaded so previously delivered tasks
    /// are skipped rather than re-recorded.
    ///
    /// # Errors
    /// - Output directory cannot be created
    /// - Label index cannot be read or opened for append
    pub fn create<P: AsRef<Path>>(output_dir: P) -> Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&output_dir)
            .map_err(|e| TransferError::file_io_error("create output directory", &output_dir, &e))?;

        let labels_path = output_dir.join(LABELS_FILE);
        let recorded = load_recorded(&labels_path)?;
        let is_new = !labels_path.exists();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&labels_path)
            .map_err(|e| TransferError::file_io_error("open label index", &labels_path, &e))?;

        if is_new {
            writeln!(file, "{}", LABELS_HEADER)
                .map_err(|e| TransferError::file_io_error("write label header", &labels_path, &e))?;
        }

        log::debug!(
            "label index at {} with {} existing row(s)",
            labels_path.display(),
            recorded.len()
        );

        Ok(Self {
            output_dir,
            labels: Mutex::new(LabelIndex { file, recorded }),
        })
    }

    /// Number of rows currently recorded in the label index.
    #[must_use]
    pub fn recorded_rows(&self) -> usize {
        self.labels.lock().map(|index| index.recorded.len()).unwrap_or(0)
    }

    fn append_row(&self, target: &str, label: &str) -> Result<()> {
        let labels_path = self.output_dir.join(LABELS_FILE);
        let mut index = self
            .labels
            .lock()
            .map_err(|_| TransferError::image_error("label index lock poisoned"))?;
        if index.recorded.contains(target) {
            return Ok(());
        }
        writeln!(index.file, "{},{}", escape_field(target), escape_field(label))
            .map_err(|e| TransferError::file_io_error("append label row", &labels_path, &e))?;
        index
            .file
            .flush()
            .map_err(|e| TransferError::file_io_error("flush label index", &labels_path, &e))?;
        index.recorded.insert(target.to_string());
        Ok(())
    }
}

#[async_trait]
impl TransferSink for CropExportSink {
    async fn is_delivered(&self, task: &TransferTask) -> Result<bool> {
        let file_present = self.output_dir.join(&task.target).exists();
        let row_present = self
            .labels
            .lock()
            .map(|index| index.recorded.contains(&task.target))
            .unwrap_or(false);
        Ok(file_present && row_present)
    }

    async fn deliver(&self, task: &TransferTask, asset: FetchedAsset) -> Result<DeliveredItem> {
        let image = image::load_from_memory(&asset.bytes).map_err(|e| {
            TransferError::image_error(format!("failed to decode {}: {}", task.url, e))
        })?;

        let output = match &task.crop {
            Some(bbox) => crop_image(&image, bbox)?,
            None => image,
        };

        let dest = self.output_dir.join(&task.target);
        output
            .save_with_format(&dest, image::ImageFormat::Png)
            .map_err(|e| TransferError::image_error(format!("failed to save {}: {}", dest.display(), e)))?;

        self.append_row(&task.target, task.label.as_deref().unwrap_or("unknown"))?;

        Ok(DeliveredItem {
            location: dest.display().to_string(),
        })
    }
}

fn load_recorded(labels_path: &Path) -> Result<HashSet<String>> {
    if !labels_path.exists() {
        return Ok(HashSet::new());
    }
    let file = File::open(labels_path)
        .map_err(|e| TransferError::file_io_error("read label index", labels_path, &e))?;
    let mut recorded = HashSet::new();
    for line in BufReader::new(file).lines() {
        let line =
            line.map_err(|e| TransferError::file_io_error("read label index", labels_path, &e))?;
        if line.is_empty() || line == LABELS_HEADER {
            continue;
        }
        if let Some(path) = first_field(&line) {
            recorded.insert(path);
        }
    }
    Ok(recorded)
}

/// Quote a CSV field when it needs it.
fn escape_field(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\n']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

/// First field of a CSV row, honoring the quoting `escape_field` produces.
fn first_field(line: &str) -> Option<String> {
    let mut chars = line.chars();
    if line.starts_with('"') {
        chars.next();
        let mut field = String::new();
        let mut quoted = false;
        for c in chars {
            if quoted {
                if c == '"' {
                    field.push('"');
                    quoted = false;
                } else {
                    // Closing quote followed by the separator.
                    return Some(field);
                }
            } else if c == '"' {
                quoted = true;
            } else {
                field.push(c);
            }
        }
        Some(field)
    } else {
        Some(line.split(',').next().unwrap_or(line).to_string())
    }
}
