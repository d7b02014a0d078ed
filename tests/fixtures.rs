//! Shared test fixtures: manifest builders, canned sources and sinks.

#![allow(dead_code)]
#![allow(unreachable_pub)]

use async_trait::async_trait;
use fathomnet_transfer::{
    CocoManifest, DeliveredItem, FetchedAsset, ImageSource, Result, TransferError, TransferSink,
    TransferTask,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Build a manifest with `images` images, one annotation per image, and a
/// single shared category.
#[must_use]
pub fn sample_manifest(images: usize) -> CocoManifest {
    let image_records: Vec<String> = (0..images)
        .map(|i| {
            format!(
                r#"{{"id": {id}, "file_name": "img{id}.png", "coco_url": "https://images.test/img{id}.png", "width": 64, "height": 48}}"#,
                id = i
            )
        })
        .collect();
    let annotation_records: Vec<String> = (0..images)
        .map(|i| {
            format!(
                r#"{{"id": {ann}, "image_id": {id}, "category_id": 1, "bbox": [8.0, 8.0, 16.0, 12.0]}}"#,
                ann = 100 + i,
                id = i
            )
        })
        .collect();

    CocoManifest::parse(&format!(
        r#"{{
            "images": [{images}],
            "annotations": [{annotations}],
            "categories": [{{"id": 1, "name": "Sebastes"}}]
        }}"#,
        images = image_records.join(","),
        annotations = annotation_records.join(",")
    ))
    .expect("fixture manifest parses")
}

/// PNG bytes for a solid image of the given size.
#[must_use]
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = image::DynamicImage::new_rgb8(width, height);
    let mut bytes = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .expect("png encodes");
    bytes
}

/// Image source serving generated PNGs, with configurable failures and
/// in-flight accounting.
pub struct MockSource {
    /// URLs that answer with an HTTP 500.
    pub fail_urls: HashSet<String>,
    fetches: AtomicUsize,
    in_flight: AtomicUsize,
    high_water: AtomicUsize,
}

impl MockSource {
    #[must_use]
    pub fn new() -> Self {
        Self::failing(HashSet::new())
    }

    #[must_use]
    pub fn failing(fail_urls: HashSet<String>) -> Self {
        Self {
            fail_urls,
            fetches: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
        }
    }

    /// Total number of fetch calls observed.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously in-flight fetches observed.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageSource for MockSource {
    async fn fetch(&self, url: &str) -> Result<FetchedAsset> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
        // Suspend like real network I/O so admissions overlap.
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_urls.contains(url) {
            return Err(TransferError::Status {
                status: 500,
                url: url.to_string(),
            });
        }
        Ok(FetchedAsset {
            bytes: png_bytes(64, 48),
            content_type: Some("image/png".to_string()),
        })
    }
}

/// Sink that remembers deliveries in memory.
#[derive(Default)]
pub struct MemorySink {
    pub delivered: Mutex<Vec<String>>,
    /// Targets treated as already delivered.
    pub preloaded: HashSet<String>,
}

#[async_trait]
impl TransferSink for MemorySink {
    async fn is_delivered(&self, task: &TransferTask) -> Result<bool> {
        if self.preloaded.contains(&task.target) {
            return Ok(true);
        }
        Ok(self
            .delivered
            .lock()
            .expect("sink lock")
            .iter()
            .any(|t| *t == task.target))
    }

    async fn deliver(&self, task: &TransferTask, _asset: FetchedAsset) -> Result<DeliveredItem> {
        self.delivered
            .lock()
            .expect("sink lock")
            .push(task.target.clone());
        Ok(DeliveredItem {
            location: format!("mem://{}", task.target),
        })
    }
}
