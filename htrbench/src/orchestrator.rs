//! Dispatch of one normalized image to every selected backend.
//!
//! Concurrency model: one task per adapter, bounded by a semaphore sized
//! `min(workers, adapters)`. With one worker no tasks are spawned at all;
//! the adapters run inline, serially, in declaration order. Results are
//! collected in declaration order regardless
//! of completion order, so artifact generation is deterministic across
//! runs. Annotated-image rendering is serialized behind one shared lock;
//! the drawing path is not safe to run concurrently.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::annotate::Annotator;
use crate::compare::{compare, ComparisonReport};
use crate::config::{CompareMode, Config, DERIVED_INFIX};
use crate::error::{HtrError, Result};
use crate::models::{ConstraintSet, Item, NormalizedImage, Recognition, ServiceOutcome};
use crate::normalize::Normalizer;
use crate::services::ServiceAdapter;

type RecognitionCache = HashMap<(PathBuf, String), Recognition>;

pub struct Manager {
    adapters: Vec<Arc<dyn ServiceAdapter>>,
    normalizer: Normalizer,
    annotator: Arc<Annotator>,
    config: Config,
    cancel: CancellationToken,
    render_lock: Arc<Mutex<()>>,
    /// Adapters knocked out by an auth failure, for the rest of the run.
    disabled: Mutex<HashSet<String>>,
    /// Per-process result reuse keyed by (normalized path, service).
    cache: Arc<Mutex<RecognitionCache>>,
}

impl Manager {
    pub fn new(
        adapters: Vec<Arc<dyn ServiceAdapter>>,
        config: Config,
        cancel: CancellationToken,
    ) -> Self {
        let constraints = adapters.iter().fold(ConstraintSet::unbounded(), |set, a| {
            set.intersect(a.max_size(), a.max_dimensions(), a.max_rate())
        });
        debug!("Run constraints: {:?}", constraints);
        let annotator = Arc::new(Annotator::new(config.font_path.as_deref()));
        Self {
            adapters,
            normalizer: Normalizer::new(constraints),
            annotator,
            config,
            cancel,
            render_lock: Arc::new(Mutex::new(())),
            disabled: Mutex::new(HashSet::new()),
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn constraints(&self) -> ConstraintSet {
        self.normalizer.constraints()
    }

    /// Run every still-enabled adapter over one item and write its
    /// artifacts into `dest_dir`. Outcomes come back in adapter declaration
    /// order; per-adapter failures are recorded in the outcome rather than
    /// aborting the item.
    pub async fn process_item(&self, item: &Item, dest_dir: &Path) -> Result<Vec<ServiceOutcome>> {
        if self.cancel.is_cancelled() {
            return Err(HtrError::Cancelled);
        }

        let disabled = self.disabled.lock().await.clone();
        let active: Vec<Arc<dyn ServiceAdapter>> = self
            .adapters
            .iter()
            .filter(|a| !disabled.contains(a.name()))
            .cloned()
            .collect();
        if active.is_empty() {
            return Err(HtrError::Service(
                "No usable services remain in this run".to_string(),
            ));
        }

        info!("Processing {}", item.source);
        let normalized = self.normalizer.normalize(item, dest_dir)?;

        let workers = self.config.workers.clamp(1, active.len());
        let results: Vec<Result<Recognition>> = if workers == 1 {
            // One worker means serial execution in declaration order; an
            // inline loop guarantees that where spawned tasks would not.
            let mut results = Vec::with_capacity(active.len());
            for adapter in &active {
                results.push(
                    run_service(
                        Arc::clone(adapter),
                        normalized.file.clone(),
                        Arc::clone(&self.cache),
                        self.config.max_attempts,
                        self.cancel.clone(),
                    )
                    .await,
                );
            }
            results
        } else {
            let semaphore = Arc::new(Semaphore::new(workers));
            let mut handles = Vec::with_capacity(active.len());
            for adapter in &active {
                let adapter = Arc::clone(adapter);
                let semaphore = Arc::clone(&semaphore);
                let cache = Arc::clone(&self.cache);
                let cancel = self.cancel.clone();
                let image = normalized.file.clone();
                let max_attempts = self.config.max_attempts;
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| HtrError::Cancelled)?;
                    run_service(adapter, image, cache, max_attempts, cancel).await
                }));
            }
            futures::future::join_all(handles)
                .await
                .into_iter()
                .zip(active.iter())
                .map(|(join_result, adapter)| match join_result {
                    Ok(result) => result,
                    Err(e) => Err(HtrError::Internal(format!(
                        "{} task failed: {e}",
                        adapter.name()
                    ))),
                })
                .collect()
        };

        let mut outcomes = Vec::with_capacity(active.len());
        for (adapter, result) in active.iter().zip(results) {
            let outcome = match result {
                Ok(recognition) => self.render_outcome(adapter.as_ref(), &normalized, recognition).await,
                Err(error) => {
                    if error.is_auth() {
                        warn!(
                            "Disabling {} for the rest of this run: {error}",
                            adapter.name()
                        );
                        self.disabled.lock().await.insert(adapter.name().to_string());
                    } else if !error.is_cancelled() {
                        warn!("{} failed on {}: {error}", adapter.name(), item.source);
                    }
                    ServiceOutcome {
                        service: adapter.name().to_string(),
                        annotated: None,
                        report: None,
                        error: Some(error),
                    }
                }
            };
            outcomes.push(outcome);
        }

        self.cleanup(&normalized, &mut outcomes);
        Ok(outcomes)
    }

    async fn render_outcome(
        &self,
        adapter: &dyn ServiceAdapter,
        normalized: &NormalizedImage,
        recognition: Recognition,
    ) -> ServiceOutcome {
        let service = adapter.name();
        let mut outcome = ServiceOutcome {
            service: service.to_string(),
            annotated: None,
            report: None,
            error: None,
        };

        let annotated = self.artifact_path(normalized, service, "png");
        {
            let _guard = self.render_lock.lock().await;
            match self
                .annotator
                .annotate(&normalized.file, &recognition.boxes, &annotated)
            {
                Ok(()) => outcome.annotated = Some(annotated),
                Err(e) => {
                    warn!("Cannot render annotated image for {service}: {e}");
                    outcome.error = Some(e);
                    return outcome;
                }
            }
        }

        if self.config.extended {
            if let Err(e) = self.write_extended(normalized, service, &recognition) {
                warn!("Cannot write extended results for {service}: {e}");
                outcome.error = Some(e);
                return outcome;
            }
        }

        if self.config.compare != CompareMode::Off {
            match self.write_report(normalized, service, &recognition.text) {
                Ok(report) => outcome.report = report,
                Err(e) => {
                    warn!("Cannot write comparison report for {service}: {e}");
                    outcome.error = Some(e);
                }
            }
        }
        outcome
    }

    fn write_extended(
        &self,
        normalized: &NormalizedImage,
        service: &str,
        recognition: &Recognition,
    ) -> Result<()> {
        let json_path = self.artifact_path(normalized, service, "json");
        std::fs::write(&json_path, serde_json::to_string_pretty(&recognition.data)?)?;
        let text_path = self.artifact_path(normalized, service, "txt");
        std::fs::write(&text_path, format!("{}\n", recognition.text))?;
        debug!("Wrote {} and {}", json_path.display(), text_path.display());
        Ok(())
    }

    /// Score recognized text against the item's `<stem>.gt.txt` sibling, if
    /// one exists with content, and write the TSV report.
    fn write_report(
        &self,
        normalized: &NormalizedImage,
        service: &str,
        text: &str,
    ) -> Result<Option<PathBuf>> {
        let Some(gt_path) = ground_truth_path(&normalized.item_file) else {
            return Ok(None);
        };
        if !gt_path.exists() {
            debug!("No ground truth file {}; skipping comparison", gt_path.display());
            return Ok(None);
        }
        let ground_truth = std::fs::read_to_string(&gt_path)?;
        if ground_truth.trim().is_empty() {
            warn!("Ground truth file {} is empty; skipping", gt_path.display());
            return Ok(None);
        }

        let relaxed = self.config.compare == CompareMode::Relaxed;
        let report: ComparisonReport = compare(text, &ground_truth, relaxed);
        let report_path = self.artifact_path(normalized, service, "tsv");
        std::fs::write(&report_path, report.to_tsv())?;
        info!(
            "{service}: {} total errors against {}",
            report.total_errors,
            gt_path.display()
        );
        Ok(Some(report_path))
    }

    /// `<dest_dir>/<stem>.htrbench-<service>.<ext>`
    fn artifact_path(&self, normalized: &NormalizedImage, service: &str, ext: &str) -> PathBuf {
        let stem = item_stem(&normalized.item_file);
        normalized
            .dest_dir
            .join(format!("{stem}{DERIVED_INFIX}-{service}.{ext}"))
    }

    /// Derived temp files and annotated artifacts are per-item scratch
    /// unless extended retention was requested. Reports always survive.
    fn cleanup(&self, normalized: &NormalizedImage, outcomes: &mut [ServiceOutcome]) {
        if self.config.extended {
            return;
        }
        for path in &normalized.temp_files {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Cannot remove temp file {}: {e}", path.display());
            }
        }
        for outcome in outcomes {
            if let Some(path) = outcome.annotated.take() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("Cannot remove annotated image {}: {e}", path.display());
                }
            }
        }
    }
}

fn item_stem(item_file: &Path) -> String {
    item_file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string())
}

/// Ground truth lives next to the input as `<stem>.gt.txt`.
pub fn ground_truth_path(item_file: &Path) -> Option<PathBuf> {
    let stem = item_file.file_stem()?.to_string_lossy();
    Some(item_file.with_file_name(format!("{stem}.gt.txt")))
}

async fn run_service(
    adapter: Arc<dyn ServiceAdapter>,
    image: PathBuf,
    cache: Arc<Mutex<RecognitionCache>>,
    max_attempts: u32,
    cancel: CancellationToken,
) -> Result<Recognition> {
    let key = (image.clone(), adapter.name().to_string());
    if let Some(hit) = cache.lock().await.get(&key).cloned() {
        debug!("Reusing cached {} result for {}", adapter.name(), image.display());
        return Ok(hit);
    }

    let mut attempt = 1u32;
    loop {
        if cancel.is_cancelled() {
            return Err(HtrError::Cancelled);
        }
        let started = Instant::now();
        let result = tokio::select! {
            r = adapter.recognize(&image) => r,
            _ = cancel.cancelled() => Err(HtrError::Cancelled),
        };
        match result {
            Ok(recognition) => {
                cache.lock().await.insert(key, recognition.clone());
                return Ok(recognition);
            }
            Err(HtrError::RateLimit { retry_after }) => {
                if attempt >= max_attempts {
                    return Err(HtrError::Service(format!(
                        "{} still rate limited after {max_attempts} attempts",
                        adapter.name()
                    )));
                }
                let wait = rate_limit_wait(adapter.max_rate(), started.elapsed(), retry_after);
                warn!(
                    "{} rate limited; pausing {:.1}s before attempt {}",
                    adapter.name(),
                    wait.as_secs_f64(),
                    attempt + 1
                );
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancel.cancelled() => return Err(HtrError::Cancelled),
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Pause before retrying a throttled call: the remainder of the adapter's
/// minimum call interval, or the server's own `Retry-After` when it asks
/// for longer.
fn rate_limit_wait(max_rate: f64, elapsed: Duration, retry_after: Option<u64>) -> Duration {
    let interval = if max_rate.is_finite() && max_rate > 0.0 {
        Duration::from_secs_f64(1.0 / max_rate)
    } else {
        Duration::ZERO
    };
    let remaining = interval.saturating_sub(elapsed);
    match retry_after {
        Some(secs) => remaining.max(Duration::from_secs(secs)),
        None => remaining,
    }
}
