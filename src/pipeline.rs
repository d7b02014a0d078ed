//! Bounded concurrent transfer scheduler
//!
//! Given N transfer tasks and a concurrency limit K, run every task with at
//! most K concurrently in flight. Tasks are admitted FIFO (the semaphore is
//! fair), run to completion without cancellation, and resolve to a per-task
//! outcome; individual failures are logged and counted, never fatal to the
//! batch.

use crate::coco::{BBox, CocoManifest};
use crate::error::Result;
use crate::fetch::{FetchedAsset, ImageSource};
use async_trait::async_trait;
#[cfg(feature = "cli")]
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// One unit of work: fetch a URL and deliver its bytes to a target.
#[derive(Debug, Clone)]
pub struct TransferTask {
    /// Image record this task came from.
    pub image_id: u64,
    /// Annotation record, when the task is a crop.
    pub annotation_id: Option<u64>,
    /// Remote source URL.
    pub url: String,
    /// Destination name: a file name in crop mode, an object key in upload
    /// mode.
    pub target: String,
    /// Box to crop, in source-image pixel units.
    pub crop: Option<BBox>,
    /// Category label recorded alongside crops.
    pub label: Option<String>,
    /// Source image dimensions, for resolving the crop box.
    pub image_width: u32,
    pub image_height: u32,
}

/// Where delivered bytes ended up.
#[derive(Debug, Clone)]
pub struct DeliveredItem {
    /// Final location: a filesystem path or a `gs://` URI.
    pub location: String,
}

/// Destination for fetched bytes. Implementations decide what "delivered"
/// means (a cropped file on disk, an object in a bucket).
#[async_trait]
pub trait TransferSink: Send + Sync {
    /// Cheap pre-check: was this task already delivered by an earlier run?
    /// Lets the scheduler skip the fetch entirely.
    async fn is_delivered(&self, task: &TransferTask) -> Result<bool>;

    /// Deliver fetched bytes for a task.
    async fn deliver(&self, task: &TransferTask, asset: FetchedAsset) -> Result<DeliveredItem>;
}

/// Terminal state of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Fetched and delivered.
    Completed,
    /// Already delivered by an earlier run; no fetch performed.
    Skipped,
    /// Fetch or delivery failed; logged and counted.
    Failed,
}

/// Outcome of one task, with failure detail when there is any.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub target: String,
    pub status: TaskStatus,
    pub detail: Option<String>,
}

impl TaskOutcome {
    fn completed(target: String) -> Self {
        Self {
            target,
            status: TaskStatus::Completed,
            detail: None,
        }
    }

    fn skipped(target: String) -> Self {
        Self {
            target,
            status: TaskStatus::Skipped,
            detail: None,
        }
    }

    fn failed(target: String, detail: String) -> Self {
        Self {
            target,
            status: TaskStatus::Failed,
            detail: Some(detail),
        }
    }
}

/// Aggregate result of a batch run.
#[derive(Debug, Default)]
pub struct TransferSummary {
    outcomes: Vec<TaskOutcome>,
}

impl TransferSummary {
    fn record(&mut self, outcome: TaskOutcome) {
        self.outcomes.push(outcome);
    }

    /// Number of delivered tasks.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.count(TaskStatus::Completed)
    }

    /// Number of tasks skipped as already delivered.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(TaskStatus::Skipped)
    }

    /// Number of failed tasks.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(TaskStatus::Failed)
    }

    /// Total tasks the batch ran.
    #[must_use]
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    /// All per-task outcomes, in task-admission order.
    #[must_use]
    pub fn outcomes(&self) -> &[TaskOutcome] {
        &self.outcomes
    }

    /// Failed outcomes only.
    pub fn failures(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == TaskStatus::Failed)
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

impl std::fmt::Display for TransferSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} completed, {} skipped, {} failed",
            self.completed(),
            self.skipped(),
            self.failed()
        )
    }
}

/// Progress indicator that works with and without the CLI feature.
#[derive(Debug, Clone)]
pub enum ProgressIndicator {
    #[cfg(feature = "cli")]
    Indicatif(ProgressBar),
    NoOp,
}

impl ProgressIndicator {
    /// Bar for a batch of `len` tasks.
    #[cfg(feature = "cli")]
    #[must_use]
    pub fn for_batch(len: u64) -> Self {
        let pb = ProgressBar::new(len);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        Self::Indicatif(pb)
    }

    /// Advance by one finished task.
    pub fn tick(&self) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.inc(1),
            Self::NoOp => {},
        }
    }

    /// Finish the bar with a closing message.
    pub fn finish_with_message(&self, msg: String) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.finish_with_message(msg),
            Self::NoOp => {},
        }
    }
}

/// The bounded concurrent transfer scheduler.
pub struct TransferPipeline {
    source: Arc<dyn ImageSource>,
    sink: Arc<dyn TransferSink>,
    concurrency: usize,
    progress: ProgressIndicator,
}

impl TransferPipeline {
    /// Create a pipeline over a source and sink with the given budget.
    #[must_use]
    pub fn new(
        source: Arc<dyn ImageSource>,
        sink: Arc<dyn TransferSink>,
        concurrency: usize,
    ) -> Self {
        Self {
            source,
            sink,
            concurrency: concurrency.max(1),
            progress: ProgressIndicator::NoOp,
        }
    }

    /// Attach a progress indicator, ticked once per finished task.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressIndicator) -> Self {
        self.progress = progress;
        self
    }

    /// Run the batch to completion.
    ///
    /// All tasks are spawned up front in admission order; each acquires a
    /// permit from the shared budget before any I/O and holds it until it
    /// finishes, success or failure. A panicking task is recorded as a
    /// failure through its join error.
    pub async fn run(&self, tasks: Vec<TransferTask>) -> TransferSummary {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(tasks.len());

        log::info!(
            "transferring {} task(s), at most {} in flight",
            tasks.len(),
            self.concurrency
        );

        for task in tasks {
            let source = Arc::clone(&self.source);
            let sink = Arc::clone(&self.sink);
            let semaphore = Arc::clone(&semaphore);
            let progress = self.progress.clone();

            handles.push(tokio::spawn(async move {
                let target = task.target.clone();
                let permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        // The semaphore lives as long as the batch; closure
                        // here means the runtime is tearing down.
                        return TaskOutcome::failed(target, "concurrency budget closed".to_string());
                    },
                };
                let outcome = run_task(source.as_ref(), sink.as_ref(), &task).await;
                drop(permit);
                progress.tick();
                outcome
            }));
        }

        let mut summary = TransferSummary::default();
        for result in futures::future::join_all(handles).await {
            match result {
                Ok(outcome) => summary.record(outcome),
                Err(join_err) => {
                    log::warn!("transfer task aborted: {}", join_err);
                    summary.record(TaskOutcome::failed(
                        "<unknown>".to_string(),
                        format!("task aborted: {}", join_err),
                    ));
                },
            }
        }

        self.progress.finish_with_message(summary.to_string());
        log::info!("batch finished: {}", summary);
        summary
    }
}

async fn run_task(
    source: &dyn ImageSource,
    sink: &dyn TransferSink,
    task: &TransferTask,
) -> TaskOutcome {
    match sink.is_delivered(task).await {
        Ok(true) => {
            log::debug!("{} already delivered, skipping", task.target);
            return TaskOutcome::skipped(task.target.clone());
        },
        Ok(false) => {},
        Err(e) => {
            // A failed pre-check is not a failed task; fall through and let
            // the delivery itself decide.
            log::warn!("delivery pre-check failed for {}: {}", task.target, e);
        },
    }

    let asset = match source.fetch(&task.url).await {
        Ok(asset) => asset,
        Err(e) => {
            log::warn!("fetch failed for {} ({}): {}", task.target, task.url, e);
            return TaskOutcome::failed(task.target.clone(), e.to_string());
        },
    };

    match sink.deliver(task, asset).await {
        Ok(item) => {
            log::debug!("delivered {} -> {}", task.target, item.location);
            TaskOutcome::completed(task.target.clone())
        },
        Err(e) => {
            log::warn!("delivery failed for {}: {}", task.target, e);
            TaskOutcome::failed(task.target.clone(), e.to_string())
        },
    }
}

/// Build one task per annotation for crop mode.
///
/// Annotations whose image record is missing from the manifest are logged
/// and dropped; there is no URL to fetch for them.
#[must_use]
pub fn crop_tasks(manifest: &CocoManifest, limit: Option<usize>) -> Vec<TransferTask> {
    let images = manifest.images_by_id();
    let categories = manifest.category_names();

    let mut tasks = Vec::new();
    for ann in &manifest.annotations {
        if let Some(cap) = limit {
            if tasks.len() >= cap {
                break;
            }
        }
        let Some(image) = images.get(&ann.image_id) else {
            log::warn!(
                "annotation {} references missing image {}, dropping",
                ann.id,
                ann.image_id
            );
            continue;
        };
        let label = categories
            .get(&ann.category_id)
            .map_or("unknown", |name| *name);
        tasks.push(TransferTask {
            image_id: image.id,
            annotation_id: Some(ann.id),
            url: image.coco_url.clone(),
            target: format!("{}_{}.png", image.file_stem(), ann.id),
            crop: Some(ann.bbox),
            label: Some(label.to_string()),
            image_width: image.width,
            image_height: image.height,
        });
    }
    tasks
}

/// Build one task per image for upload mode; `prefix` becomes part of the
/// object key.
#[must_use]
pub fn upload_tasks(manifest: &CocoManifest, prefix: &str, limit: Option<usize>) -> Vec<TransferTask> {
    manifest
        .images
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(|image| TransferTask {
            image_id: image.id,
            annotation_id: None,
            url: image.coco_url.clone(),
            target: format!("{}{}", prefix, image.safe_file_name()),
            crop: None,
            label: None,
            image_width: image.width,
            image_height: image.height,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransferError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticSource {
        fail_urls: Vec<String>,
        in_flight: AtomicUsize,
        high_water: AtomicUsize,
    }

    impl StaticSource {
        fn new(fail_urls: Vec<String>) -> Self {
            Self {
                fail_urls,
                in_flight: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ImageSource for StaticSource {
        async fn fetch(&self, url: &str) -> Result<FetchedAsset> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.high_water.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_urls.iter().any(|u| u == url) {
                return Err(TransferError::Status {
                    status: 500,
                    url: url.to_string(),
                });
            }
            Ok(FetchedAsset {
                bytes: vec![0u8; 4],
                content_type: Some("image/png".to_string()),
            })
        }
    }

    struct CountingSink {
        delivered: AtomicUsize,
        already_delivered: Vec<String>,
    }

    impl CountingSink {
        fn new() -> Self {
            Self {
                delivered: AtomicUsize::new(0),
                already_delivered: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl TransferSink for CountingSink {
        async fn is_delivered(&self, task: &TransferTask) -> Result<bool> {
            Ok(self.already_delivered.iter().any(|t| *t == task.target))
        }

        async fn deliver(&self, task: &TransferTask, _asset: FetchedAsset) -> Result<DeliveredItem> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(DeliveredItem {
                location: task.target.clone(),
            })
        }
    }

    fn task(n: usize) -> TransferTask {
        TransferTask {
            image_id: n as u64,
            annotation_id: None,
            url: format!("https://host/{}.png", n),
            target: format!("{}.png", n),
            crop: None,
            label: None,
            image_width: 64,
            image_height: 64,
        }
    }

    #[tokio::test]
    async fn test_all_tasks_complete() {
        let source = Arc::new(StaticSource::new(vec![]));
        let sink = Arc::new(CountingSink::new());
        let pipeline =
            TransferPipeline::new(source, Arc::clone(&sink) as Arc<dyn TransferSink>, 4);

        let summary = pipeline.run((0..10).map(task).collect()).await;
        assert_eq!(summary.completed(), 10);
        assert_eq!(summary.failed(), 0);
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_fatal() {
        let source = Arc::new(StaticSource::new(vec![
            "https://host/3.png".to_string(),
            "https://host/7.png".to_string(),
        ]));
        let sink = Arc::new(CountingSink::new());
        let pipeline = TransferPipeline::new(source, sink, 4);

        let summary = pipeline.run((0..10).map(task).collect()).await;
        assert_eq!(summary.completed(), 8);
        assert_eq!(summary.failed(), 2);
        assert_eq!(summary.total(), 10);
        let reasons: Vec<_> = summary.failures().map(|o| o.target.clone()).collect();
        assert!(reasons.contains(&"3.png".to_string()));
        assert!(reasons.contains(&"7.png".to_string()));
    }

    #[tokio::test]
    async fn test_concurrency_budget_not_exceeded() {
        let source = Arc::new(StaticSource::new(vec![]));
        let sink = Arc::new(CountingSink::new());
        let pipeline =
            TransferPipeline::new(Arc::clone(&source) as Arc<dyn ImageSource>, sink, 3);

        pipeline.run((0..50).map(task).collect()).await;
        assert!(source.high_water.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_already_delivered_is_skipped_without_fetch() {
        let source = Arc::new(StaticSource::new(vec![]));
        let mut sink = CountingSink::new();
        sink.already_delivered.push("0.png".to_string());
        let pipeline =
            TransferPipeline::new(Arc::clone(&source) as Arc<dyn ImageSource>, Arc::new(sink), 2);

        let summary = pipeline.run((0..3).map(task).collect()).await;
        assert_eq!(summary.skipped(), 1);
        assert_eq!(summary.completed(), 2);
    }

    #[test]
    fn test_crop_tasks_from_manifest() {
        let manifest = CocoManifest::parse(
            r#"{
                "images": [{"id": 1, "file_name": "a.png", "coco_url": "https://h/a.png", "width": 640, "height": 480}],
                "annotations": [
                    {"id": 10, "image_id": 1, "category_id": 7, "bbox": [1.0, 2.0, 3.0, 4.0]},
                    {"id": 11, "image_id": 99, "category_id": 7, "bbox": [1.0, 2.0, 3.0, 4.0]}
                ],
                "categories": [{"id": 7, "name": "Sebastes"}]
            }"#,
        )
        .unwrap();

        let tasks = crop_tasks(&manifest, None);
        // The dangling annotation is dropped.
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].target, "a_10.png");
        assert_eq!(tasks[0].label.as_deref(), Some("Sebastes"));
        assert!(tasks[0].crop.is_some());
    }

    #[test]
    fn test_upload_tasks_respect_limit_and_prefix() {
        let manifest = CocoManifest::parse(
            r#"{
                "images": [
                    {"id": 1, "file_name": "a.png", "coco_url": "https://h/a.png", "width": 1, "height": 1},
                    {"id": 2, "file_name": "b.png", "coco_url": "https://h/b.png", "width": 1, "height": 1},
                    {"id": 3, "file_name": "c.png", "coco_url": "https://h/c.png", "width": 1, "height": 1}
                ]
            }"#,
        )
        .unwrap();

        let tasks = upload_tasks(&manifest, "fathomnet/train_images/", Some(2));
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].target, "fathomnet/train_images/a.png");
        assert!(tasks[0].crop.is_none());
    }

    #[test]
    fn test_summary_display() {
        let mut summary = TransferSummary::default();
        summary.record(TaskOutcome::completed("a".to_string()));
        summary.record(TaskOutcome::skipped("b".to_string()));
        summary.record(TaskOutcome::failed("c".to_string(), "boom".to_string()));
        assert_eq!(summary.to_string(), "1 completed, 1 skipped, 1 failed");
    }
}
