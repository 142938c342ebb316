//! Main screenshot service orchestrating the capture and upload pipeline
//!
//! This module provides the primary `ScreenshotService` that runs the full
//! control flow for one release: cutoff check, cache-first reuse, timestamp
//! selection, capture with retakes, optimization, and upload with host
//! failover.

use crate::{
    sanitize_filename, select_timestamps, trim_to_requested, validate_existing_hosting,
    CaptureOptions, CapturePlan, CancellationScope, Config, FfmpegExtractor, FrameCaptureEngine,
    FrameExtractor, HostFailover, HostRegistry, Metrics, OptimizationPool, ReuploadCache,
    RunContext, Screenshot, ScreenshotStatus, ScreensError, SizePolicy, SourceDescriptor,
    TimestampRequest, UploadDispatcher, UploadJob, UploadedImageRecord, ValidationRetryLoop,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Accepted screenshots of one capture pass.
#[derive(Debug, Clone, Default)]
pub struct CaptureBatch {
    /// Accepted screenshots sorted by index, at most the number requested.
    pub screenshots: Vec<Screenshot>,
    /// Screenshots given up on after exhausting their retakes.
    pub failed_indices: Vec<usize>,
    /// One `ValidationFailed` per entry of `failed_indices`.
    pub failures: Vec<ScreensError>,
    pub retakes: usize,
}

/// What a batch produced, and why it fell short when it did.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Hosted images sorted by screenshot index, one per index.
    pub records: Vec<UploadedImageRecord>,
    pub success_count: usize,
    /// Images this run was asked to produce after the cutoff.
    pub requested: usize,
    /// Screenshots available for hosting: reused ones plus those that passed validation.
    pub produced: usize,
    pub failed_indices: Vec<usize>,
    /// Per-image failures, such as screenshots out of retakes.
    pub image_failures: Vec<ScreensError>,
    /// Hosts an upload was attempted on, in failover order.
    pub attempted_hosts: Vec<String>,
    pub active_host: Option<String>,
    pub active_index: usize,
    /// Records came from the re-upload cache; nothing was captured.
    pub reused: bool,
    /// Cached records carried into this outcome.
    pub reused_count: usize,
    pub failure: Option<ScreensError>,
    pub shortfall_reason: Option<String>,
}

impl BatchOutcome {
    fn empty(requested: usize) -> Self {
        Self {
            records: Vec::new(),
            success_count: 0,
            requested,
            produced: 0,
            failed_indices: Vec::new(),
            image_failures: Vec::new(),
            attempted_hosts: Vec::new(),
            active_host: None,
            active_index: 0,
            reused: false,
            reused_count: 0,
            failure: None,
            shortfall_reason: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.success_count >= self.requested
    }

    /// One-line human-readable result.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{}/{} screenshots uploaded",
            self.success_count, self.requested
        );
        if let Some(host) = &self.active_host {
            line.push_str(&format!(" (host: {host})"));
        }
        if self.reused {
            line.push_str(" from cache");
        } else if self.reused_count > 0 {
            line.push_str(&format!(" ({} from cache)", self.reused_count));
        }
        if let Some(reason) = &self.shortfall_reason {
            line.push_str(&format!(": {reason}"));
        }
        line
    }
}

/// Release screenshot service
///
/// Owns the immutable configuration, the frame extractor, the host backends
/// and the run's [`CancellationScope`]. Every per-run detail arrives through
/// the [`RunContext`].
///
/// # Examples
///
/// ```rust,no_run
/// use release_screens::{
///     CancellationScope, Config, RunContext, ScreenshotService, SourceDescriptor, TrackerScope,
/// };
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::default();
///     let scope = CancellationScope::new(Duration::from_secs(2));
///     let service = ScreenshotService::new(config.clone(), scope)?;
///
///     let ctx = RunContext::from_config(&config, TrackerScope::new("Some.Release", "tracker"));
///     let source = SourceDescriptor::new("/media/title.mkv", 5400.0, 23.976);
///     let outcome = service.capture_and_upload_batch(&ctx, &source).await?;
///     println!("{}", outcome.summary());
///     Ok(())
/// }
/// ```
pub struct ScreenshotService {
    config: Arc<Config>,
    extractor: Arc<dyn FrameExtractor>,
    registry: HostRegistry,
    scope: CancellationScope,
    metrics: Arc<Metrics>,
}

impl ScreenshotService {
    /// Service using ffmpeg for extraction and one HTTP backend per configured host.
    pub fn new(config: Config, scope: CancellationScope) -> Result<Self, ScreensError> {
        let extractor = Arc::new(FfmpegExtractor::new(&config.capture, config.debug));
        let registry = HostRegistry::from_config(&config)?;
        Ok(Self::with_components(config, extractor, registry, scope))
    }

    pub fn with_components(
        config: Config,
        extractor: Arc<dyn FrameExtractor>,
        registry: HostRegistry,
        scope: CancellationScope,
    ) -> Self {
        Self {
            config: Arc::new(config),
            extractor,
            registry,
            scope,
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Captures, optimizes and validates the screenshots still needed for a run.
    pub async fn capture_screenshots(
        &self,
        ctx: &RunContext,
        source: &SourceDescriptor,
    ) -> Result<CaptureBatch, ScreensError> {
        let slots: Vec<usize> = (0..ctx.images_needed()).collect();
        self.capture_slots(ctx, source, &slots).await
    }

    /// Captures the screenshots for `slots` only, at the offsets those indices
    /// get in the full selection. A spare disc frame takes over a slot left
    /// empty by a failed or trimmed frame.
    async fn capture_slots(
        &self,
        ctx: &RunContext,
        source: &SourceDescriptor,
        slots: &[usize],
    ) -> Result<CaptureBatch, ScreensError> {
        if slots.is_empty() {
            return Ok(CaptureBatch::default());
        }
        check_source(source).await?;
        tokio::fs::create_dir_all(&ctx.scratch_dir).await?;

        let needed = ctx.images_needed();
        let timestamps = select_timestamps(&TimestampRequest {
            duration_secs: source.duration_secs,
            frame_rate: source.frame_rate,
            count: needed,
            retake_ordinal: ctx.retake_ordinal,
            source_kind: source.kind,
            category: source.category,
        });
        let mut shots: Vec<Screenshot> = timestamps
            .into_iter()
            .enumerate()
            .filter(|(index, _)| *index >= needed || slots.contains(index))
            .map(|(index, offset)| Screenshot::new(index, offset))
            .collect();
        info!(
            "Capturing {} screenshots from {}",
            shots.len(),
            source.path.display()
        );

        let plan = CapturePlan {
            source: source.path.clone(),
            options: CaptureOptions::for_run(&self.config.capture, ctx, source),
            scratch_dir: ctx.scratch_dir.clone(),
            stem: run_stem(&ctx.scope.release_key),
        };
        let engine = FrameCaptureEngine::new(
            self.extractor.clone(),
            self.config.capture.max_concurrent_captures,
            self.scope.token(),
        );
        let pool = if self.config.optimization.enabled {
            Some(OptimizationPool::new(
                &self.config.optimization,
                self.scope.clone(),
            )?)
        } else {
            None
        };

        let policy = match self.validation_host(ctx) {
            Some(host) => {
                debug!("Validating sizes against {}", host);
                ctx.policy.for_host(&host)
            }
            None => SizePolicy::default(),
        };
        let retry = ValidationRetryLoop::new(
            &engine,
            pool.as_ref(),
            &self.config.validation,
            &self.metrics,
            self.scope.token(),
        );
        let summary = retry
            .run(
                &mut shots,
                &plan,
                policy,
                ctx.policy.floor(),
                source.duration_secs,
            )
            .await?;

        let failures: Vec<ScreensError> = shots
            .iter()
            .filter(|s| s.status == ScreenshotStatus::Failed)
            .map(|s| ScreensError::ValidationFailed {
                index: s.index,
                attempts: s.attempts + 1,
            })
            .collect();

        let mut accepted: Vec<Screenshot> = shots.into_iter().filter(|s| s.is_accepted()).collect();
        for discarded in trim_to_requested(&mut accepted, slots.len()) {
            debug!(
                "Discarding screenshot {} ({} bytes) over the requested count",
                discarded.index,
                discarded.byte_size.unwrap_or(0)
            );
            if let Some(path) = discarded.file_path {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
        accepted.sort_by_key(|s| s.index);
        assign_spare_frames(&mut accepted, slots, needed);

        info!(
            "{} screenshots accepted ({} retakes, {} failed)",
            accepted.len(),
            summary.retakes,
            summary.failed_indices.len()
        );
        Ok(CaptureBatch {
            screenshots: accepted,
            failed_indices: summary.failed_indices,
            failures,
            retakes: summary.retakes,
        })
    }

    /// Produces hosted screenshots for a release and tracker.
    ///
    /// Cached records on approved hosts are reused; only the screenshot
    /// indices they do not cover are captured and uploaded.
    ///
    /// Returns an error only for an invalid source or a cancelled run; every
    /// other shortfall, host exhaustion included, is reported in the outcome.
    pub async fn capture_and_upload_batch(
        &self,
        ctx: &RunContext,
        source: &SourceDescriptor,
    ) -> Result<BatchOutcome, ScreensError> {
        let needed = ctx.images_needed();
        if needed == 0 {
            info!(
                "{} of {} screenshots already satisfied, nothing to capture",
                ctx.already_satisfied, ctx.requested_count
            );
            return Ok(BatchOutcome::empty(0));
        }

        let mut cache = match ReuploadCache::open(&self.config.cache_dir, &ctx.scope.release_key).await {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!("Continuing without re-upload cache: {}", e);
                None
            }
        };

        let cached = cache
            .as_ref()
            .map(|c| self.cached_records(c, ctx, needed))
            .unwrap_or_default();
        let missing: Vec<usize> = (0..needed)
            .filter(|index| !cached.iter().any(|r| r.source_screenshot_index == *index))
            .collect();

        let mut outcome = BatchOutcome::empty(needed);
        outcome.reused_count = cached.len();
        if missing.is_empty() {
            info!(
                "Reusing {} cached images for {}",
                cached.len(),
                ctx.scope.cache_key()
            );
            outcome.success_count = cached.len();
            outcome.produced = cached.len();
            outcome.active_host = cached.first().and_then(|r| r.host_name.clone());
            outcome.records = cached;
            outcome.reused = true;
            return Ok(outcome);
        }
        if !cached.is_empty() {
            info!(
                "Reusing {} cached images for {}, capturing {} more",
                cached.len(),
                ctx.scope.cache_key(),
                missing.len()
            );
        }

        let batch = match self.capture_slots(ctx, source, &missing).await {
            Ok(batch) => batch,
            Err(ScreensError::Cancelled) => {
                self.scope.sweep_children().await;
                return Err(ScreensError::Cancelled);
            }
            Err(e) => return Err(e),
        };
        outcome.produced = cached.len() + batch.screenshots.len();
        outcome.failed_indices = batch.failed_indices.clone();
        outcome.image_failures = batch.failures.clone();

        let mut records = cached;
        if batch.screenshots.is_empty() {
            self.scope.sweep_children().await;
            outcome.active_host = records.first().and_then(|r| r.host_name.clone());
            outcome.success_count = records.len();
            outcome.records = records;
            outcome.shortfall_reason = Some("no screenshot passed validation".to_string());
            return Ok(outcome);
        }

        let jobs: Vec<UploadJob> = batch
            .screenshots
            .iter()
            .filter_map(|shot| {
                shot.file_path.as_ref().map(|path| UploadJob {
                    index: shot.index,
                    path: path.clone(),
                })
            })
            .collect();

        let dispatcher =
            UploadDispatcher::new(self.config.upload.clone(), self.metrics.clone(), self.scope.token());
        let failover = HostFailover::new(
            &self.config.hosts,
            &self.registry,
            &dispatcher,
            self.metrics.clone(),
        );
        let uploaded = failover.run(ctx, jobs, cache.as_mut()).await;

        self.scope.sweep_children().await;
        if !self.config.debug {
            remove_frames(&batch.screenshots).await;
        }
        if self.scope.is_cancelled() {
            return Err(ScreensError::Cancelled);
        }

        records.extend(uploaded.records);
        records.sort_by_key(|r| r.source_screenshot_index);
        outcome.success_count = records.len();
        outcome.records = records;
        outcome.attempted_hosts = uploaded.attempted;
        outcome.active_host = uploaded.active_host;
        outcome.active_index = uploaded.active_index;
        outcome.shortfall_reason = match &uploaded.error {
            Some(error) => Some(error.to_string()),
            None if outcome.produced < needed => Some(format!(
                "{} of {} screenshots failed validation",
                needed - outcome.produced,
                needed
            )),
            None => None,
        };
        outcome.failure = uploaded.error;

        if outcome.shortfall_reason.is_some() {
            warn!("{}", outcome.summary());
        } else {
            info!("{}", outcome.summary());
        }
        Ok(outcome)
    }

    /// Cached records on approved hosts, one per screenshot index below `needed`.
    fn cached_records(
        &self,
        cache: &ReuploadCache,
        ctx: &RunContext,
        needed: usize,
    ) -> Vec<UploadedImageRecord> {
        let cached = cache.lookup(&ctx.scope);
        if cached.is_empty() {
            return Vec::new();
        }

        let approved = ctx
            .approved_hosts
            .clone()
            .unwrap_or_else(|| self.config.host_names());
        let (kept, needs_reupload) =
            validate_existing_hosting(&cached, &approved, &self.config.hosts);
        if needs_reupload {
            info!(
                "{} of {} cached images for {} are not on an approved host",
                cached.len() - kept.len(),
                cached.len(),
                ctx.scope.cache_key()
            );
        }
        latest_per_index(kept, needed)
    }

    /// Host whose size policy applies: the explicit host, otherwise the first
    /// approved host with a backend.
    fn validation_host(&self, ctx: &RunContext) -> Option<String> {
        ctx.explicit_host.clone().or_else(|| {
            self.config
                .hosts
                .iter()
                .map(|h| &h.name)
                .find(|name| ctx.is_host_approved(name) && self.registry.contains(name))
                .cloned()
        })
    }
}

/// Keeps the last record seen for each index below `needed`, sorted by index.
/// Cache entries are in append order, so the last one is the latest upload.
fn latest_per_index(records: Vec<UploadedImageRecord>, needed: usize) -> Vec<UploadedImageRecord> {
    let mut by_index = BTreeMap::new();
    for record in records {
        if record.source_screenshot_index < needed {
            by_index.insert(record.source_screenshot_index, record);
        }
    }
    by_index.into_values().collect()
}

/// Moves accepted spare frames (index `>= needed`) onto the slots nothing else
/// filled. `shots` must be sorted by index.
fn assign_spare_frames(shots: &mut [Screenshot], slots: &[usize], needed: usize) {
    let mut open = slots
        .iter()
        .copied()
        .filter(|slot| !shots.iter().any(|s| s.index == *slot))
        .collect::<Vec<_>>()
        .into_iter();
    for shot in shots.iter_mut().filter(|s| s.index >= needed) {
        if let Some(slot) = open.next() {
            debug!("Spare frame {} fills slot {}", shot.index, slot);
            shot.index = slot;
        }
    }
    shots.sort_by_key(|s| s.index);
}

async fn remove_frames(shots: &[Screenshot]) {
    for path in shots.iter().filter_map(|s| s.file_path.as_ref()) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            debug!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

async fn check_source(source: &SourceDescriptor) -> Result<(), ScreensError> {
    if !(source.duration_secs.is_finite() && source.duration_secs > 0.0) {
        return Err(ScreensError::InvalidSource(format!(
            "invalid duration {} for {}",
            source.duration_secs,
            source.path.display()
        )));
    }
    if !(source.frame_rate.is_finite() && source.frame_rate > 0.0) {
        return Err(ScreensError::InvalidSource(format!(
            "invalid frame rate {} for {}",
            source.frame_rate,
            source.path.display()
        )));
    }
    if tokio::fs::metadata(&source.path).await.is_err() {
        return Err(ScreensError::InvalidSource(format!(
            "{} does not exist",
            source.path.display()
        )));
    }
    Ok(())
}

/// File name stem for a run; the suffix keeps runs sharing a scratch dir apart.
fn run_stem(release_key: &str) -> String {
    let run_id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", sanitize_filename(release_key), &run_id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        CaptureOutcome, CaptureRequest, HostConfig, HostedImage, MockFrameExtractor,
        MockImageHost, ResponseMapping, TrackerScope, UploadError,
    };
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::time::Duration;

    fn host_config(name: &str, min: Option<u64>) -> HostConfig {
        HostConfig {
            name: name.to_string(),
            endpoint: format!("https://{name}.example/upload"),
            api_key: None,
            api_key_field: "key".to_string(),
            api_key_header: None,
            file_field: "image".to_string(),
            form_fields: BTreeMap::new(),
            response: ResponseMapping::default(),
            max_concurrency: None,
            min_image_size: min,
            max_image_size: None,
            duplicate_markers: Vec::new(),
            domains: vec![format!("{name}.example")],
        }
    }

    fn config(dir: &Path, hosts: Vec<HostConfig>) -> Config {
        let mut config = Config {
            screenshot_count: 4,
            scratch_dir: dir.join("scratch"),
            cache_dir: dir.join("cache"),
            hosts,
            ..Default::default()
        };
        config.optimization.enabled = false;
        config.upload.retry_delay = Duration::from_millis(1);
        config
    }

    fn isolated_scope() -> CancellationScope {
        CancellationScope::for_process_tree(Duration::from_millis(10), 999_999_999)
    }

    fn source(dir: &Path) -> SourceDescriptor {
        let path = dir.join("title.mkv");
        std::fs::write(&path, b"video").unwrap();
        SourceDescriptor::new(path, 3600.0, 24.0)
    }

    fn sized_extractor(size: usize) -> MockFrameExtractor {
        let mut extractor = MockFrameExtractor::new();
        extractor.expect_extract().returning(move |req: CaptureRequest| {
            std::fs::write(&req.destination, vec![1u8; size]).unwrap();
            CaptureOutcome {
                index: req.index,
                path: Some(req.destination),
                frame_meta: None,
            }
        });
        extractor
    }

    fn accepting(domain: &'static str) -> MockImageHost {
        let mut host = MockImageHost::new();
        host.expect_upload().returning(move |path| {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            Ok(HostedImage {
                img_url: format!("https://{domain}/t/{name}"),
                raw_url: format!("https://{domain}/{name}"),
                web_url: format!("https://{domain}/v/{name}"),
            })
        });
        host
    }

    #[tokio::test]
    async fn test_cutoff_skips_capture() {
        let dir = tempfile::tempdir().unwrap();
        let mut extractor = MockFrameExtractor::new();
        extractor.expect_extract().never();
        let config = config(dir.path(), vec![host_config("alpha", None)]);
        let service = ScreenshotService::with_components(
            config.clone(),
            Arc::new(extractor),
            HostRegistry::new(),
            isolated_scope(),
        );

        let mut ctx = RunContext::from_config(&config, TrackerScope::new("rel", "tracker"));
        ctx.already_satisfied = 4;
        let outcome = service
            .capture_and_upload_batch(&ctx, &source(dir.path()))
            .await
            .unwrap();
        assert_eq!(outcome.success_count, 0);
        assert_eq!(outcome.requested, 0);
        assert!(outcome.is_complete());
    }

    #[tokio::test]
    async fn test_invalid_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), vec![host_config("alpha", None)]);
        let service = ScreenshotService::with_components(
            config.clone(),
            Arc::new(MockFrameExtractor::new()),
            HostRegistry::new(),
            isolated_scope(),
        );
        let ctx = RunContext::from_config(&config, TrackerScope::new("rel", "tracker"));

        let missing = SourceDescriptor::new(dir.path().join("missing.mkv"), 3600.0, 24.0);
        assert!(matches!(
            service.capture_and_upload_batch(&ctx, &missing).await,
            Err(ScreensError::InvalidSource(_))
        ));

        let mut zero = source(dir.path());
        zero.duration_secs = 0.0;
        assert!(matches!(
            service.capture_and_upload_batch(&ctx, &zero).await,
            Err(ScreensError::InvalidSource(_))
        ));
    }

    #[tokio::test]
    async fn test_disc_capture_trims_extra_frame() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), vec![host_config("alpha", None)]);
        let service = ScreenshotService::with_components(
            config.clone(),
            Arc::new(sized_extractor(50_000)),
            HostRegistry::new(),
            isolated_scope(),
        );
        let ctx = RunContext::from_config(&config, TrackerScope::new("rel", "tracker"));
        let mut disc = source(dir.path());
        disc.kind = crate::SourceKind::Bluray;

        let batch = service.capture_screenshots(&ctx, &disc).await.unwrap();
        assert_eq!(batch.screenshots.len(), 4);
        // Equal sizes trim the first frame; the spare takes its slot.
        let indices: Vec<usize> = batch.screenshots.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        let remaining = std::fs::read_dir(&ctx.scratch_dir).unwrap().count();
        assert_eq!(remaining, 4);
    }

    #[tokio::test]
    async fn test_capture_and_upload_then_reuse_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), vec![host_config("alpha", Some(75_000))]);
        let mut registry = HostRegistry::new();
        registry.insert("alpha", Arc::new(accepting("alpha.example")));
        let service = ScreenshotService::with_components(
            config.clone(),
            Arc::new(sized_extractor(100_000)),
            registry,
            isolated_scope(),
        );
        let ctx = RunContext::from_config(&config, TrackerScope::new("rel", "tracker"));

        let first = service
            .capture_and_upload_batch(&ctx, &source(dir.path()))
            .await
            .unwrap();
        assert_eq!(first.success_count, 4);
        assert!(first.shortfall_reason.is_none());
        assert!(!first.reused);
        assert_eq!(first.active_host.as_deref(), Some("alpha"));
        // Uploaded frames do not outlive the run.
        assert_eq!(std::fs::read_dir(&ctx.scratch_dir).unwrap().count(), 0);

        // A second run must not capture again.
        let mut extractor = MockFrameExtractor::new();
        extractor.expect_extract().never();
        let second_service = ScreenshotService::with_components(
            config.clone(),
            Arc::new(extractor),
            HostRegistry::new(),
            isolated_scope(),
        );
        let second = second_service
            .capture_and_upload_batch(&ctx, &source(dir.path()))
            .await
            .unwrap();
        assert!(second.reused);
        assert_eq!(second.records, first.records);
    }

    #[tokio::test]
    async fn test_exhaustion_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), vec![host_config("alpha", None)]);
        let mut alpha = MockImageHost::new();
        alpha
            .expect_upload()
            .returning(|_| Err(UploadError::transient("HTTP 503")));
        let mut registry = HostRegistry::new();
        registry.insert("alpha", Arc::new(alpha));
        let service = ScreenshotService::with_components(
            config.clone(),
            Arc::new(sized_extractor(100_000)),
            registry,
            isolated_scope(),
        );
        let ctx = RunContext::from_config(&config, TrackerScope::new("rel", "tracker"));

        let outcome = service
            .capture_and_upload_batch(&ctx, &source(dir.path()))
            .await
            .unwrap();
        assert_eq!(outcome.success_count, 0);
        assert_eq!(outcome.produced, 4);
        assert!(matches!(outcome.failure, Some(ScreensError::HostExhaustion { .. })));
        assert!(outcome
            .shortfall_reason
            .unwrap()
            .contains("all configured image hosts exhausted"));
    }

    #[tokio::test]
    async fn test_partial_cache_uploads_only_missing_indices() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), vec![host_config("alpha", Some(75_000))]);
        let ctx = RunContext::from_config(&config, TrackerScope::new("rel", "tracker"));
        fn indices(records: &[UploadedImageRecord]) -> Vec<usize> {
            records.iter().map(|r| r.source_screenshot_index).collect()
        }

        // First run: the host only takes screenshots 0 and 1.
        let mut flaky = MockImageHost::new();
        flaky.expect_upload().returning(|path| {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            if name.contains("-00.") || name.contains("-01.") {
                Ok(HostedImage {
                    img_url: format!("https://alpha.example/t/{name}"),
                    raw_url: format!("https://alpha.example/{name}"),
                    web_url: format!("https://alpha.example/v/{name}"),
                })
            } else {
                Err(UploadError::transient("HTTP 503"))
            }
        });
        let mut registry = HostRegistry::new();
        registry.insert("alpha", Arc::new(flaky));
        let first = ScreenshotService::with_components(
            config.clone(),
            Arc::new(sized_extractor(100_000)),
            registry,
            isolated_scope(),
        )
        .capture_and_upload_batch(&ctx, &source(dir.path()))
        .await
        .unwrap();
        assert_eq!(first.success_count, 2);
        assert_eq!(indices(&first.records), vec![0, 1]);

        // Second run captures and uploads the two missing screenshots only.
        let mut extractor = MockFrameExtractor::new();
        extractor.expect_extract().times(2).returning(|req: CaptureRequest| {
            assert!(req.index >= 2);
            std::fs::write(&req.destination, vec![1u8; 100_000]).unwrap();
            CaptureOutcome {
                index: req.index,
                path: Some(req.destination),
                frame_meta: None,
            }
        });
        let mut alpha = MockImageHost::new();
        alpha.expect_upload().times(2).returning(|path| {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            Ok(HostedImage {
                img_url: format!("https://alpha.example/t/{name}"),
                raw_url: format!("https://alpha.example/{name}"),
                web_url: format!("https://alpha.example/v/{name}"),
            })
        });
        let mut registry = HostRegistry::new();
        registry.insert("alpha", Arc::new(alpha));
        let second = ScreenshotService::with_components(
            config.clone(),
            Arc::new(extractor),
            registry,
            isolated_scope(),
        )
        .capture_and_upload_batch(&ctx, &source(dir.path()))
        .await
        .unwrap();
        assert_eq!(second.success_count, 4);
        assert_eq!(second.reused_count, 2);
        assert!(!second.reused);
        assert!(second.shortfall_reason.is_none());
        assert_eq!(indices(&second.records), vec![0, 1, 2, 3]);
        assert_eq!(&second.records[..2], &first.records[..]);

        // Third run is served entirely from the cache, one record per index.
        let mut idle = MockFrameExtractor::new();
        idle.expect_extract().never();
        let third = ScreenshotService::with_components(
            config.clone(),
            Arc::new(idle),
            HostRegistry::new(),
            isolated_scope(),
        )
        .capture_and_upload_batch(&ctx, &source(dir.path()))
        .await
        .unwrap();
        assert!(third.reused);
        assert_eq!(indices(&third.records), vec![0, 1, 2, 3]);
        assert_eq!(third.records, second.records);
    }

    #[test]
    fn test_latest_record_wins_per_index() {
        let record = |index: usize, name: &str| UploadedImageRecord {
            img_url: format!("https://alpha.example/t/{name}.png"),
            raw_url: format!("https://alpha.example/{name}.png"),
            web_url: format!("https://alpha.example/v/{name}"),
            host_name: Some("alpha".to_string()),
            source_screenshot_index: index,
            release_url: None,
        };
        let records = vec![
            record(1, "b"),
            record(0, "old"),
            record(0, "new"),
            record(7, "beyond"),
        ];

        let kept = latest_per_index(records, 4);
        let names: Vec<&str> = kept.iter().map(|r| r.raw_url.as_str()).collect();
        assert_eq!(
            names,
            vec!["https://alpha.example/new.png", "https://alpha.example/b.png"]
        );
    }

    #[test]
    fn test_spare_frame_fills_failed_slot() {
        let mut shots = vec![
            Screenshot::new(0, 10.0),
            Screenshot::new(2, 30.0),
            Screenshot::new(3, 40.0),
            Screenshot::new(4, 50.0),
        ];
        assign_spare_frames(&mut shots, &[0, 1, 2, 3], 4);
        let indices: Vec<usize> = shots.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(shots[1].source_offset_seconds, 50.0);
    }

    #[tokio::test]
    async fn test_screenshots_out_of_retakes_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), vec![host_config("alpha", None)]);
        let mut alpha = MockImageHost::new();
        alpha.expect_upload().never();
        let mut registry = HostRegistry::new();
        registry.insert("alpha", Arc::new(alpha));
        // Below the degenerate-frame floor on every attempt.
        let service = ScreenshotService::with_components(
            config.clone(),
            Arc::new(sized_extractor(5_000)),
            registry,
            isolated_scope(),
        );
        let ctx = RunContext::from_config(&config, TrackerScope::new("rel", "tracker"));

        let outcome = service
            .capture_and_upload_batch(&ctx, &source(dir.path()))
            .await
            .unwrap();
        assert_eq!(outcome.produced, 0);
        assert_eq!(outcome.failed_indices, vec![0, 1, 2, 3]);
        assert_eq!(outcome.image_failures.len(), 4);
        assert!(outcome.image_failures.iter().all(|e| matches!(
            e,
            ScreensError::ValidationFailed { attempts: 6, .. }
        )));
        assert_eq!(
            outcome.shortfall_reason.as_deref(),
            Some("no screenshot passed validation")
        );
    }

    #[tokio::test]
    async fn test_failover_host_gets_sizes_validated_for_first_host() {
        let dir = tempfile::tempdir().unwrap();
        let mut beta = host_config("beta", None);
        beta.max_image_size = Some(50_000);
        let config = config(dir.path(), vec![host_config("alpha", Some(75_000)), beta]);
        let mut alpha = MockImageHost::new();
        alpha
            .expect_upload()
            .returning(|_| Err(UploadError::transient("HTTP 502")));
        let mut registry = HostRegistry::new();
        registry.insert("alpha", Arc::new(alpha));
        registry.insert("beta", Arc::new(accepting("beta.example")));
        let service = ScreenshotService::with_components(
            config.clone(),
            Arc::new(sized_extractor(100_000)),
            registry,
            isolated_scope(),
        );
        let ctx = RunContext::from_config(&config, TrackerScope::new("rel", "tracker"));

        // Frames sized for alpha go to beta as they are, above beta's maximum.
        let outcome = service
            .capture_and_upload_batch(&ctx, &source(dir.path()))
            .await
            .unwrap();
        assert_eq!(outcome.success_count, 4);
        assert_eq!(outcome.active_host.as_deref(), Some("beta"));
        assert_eq!(outcome.active_index, 1);
        assert_eq!(outcome.attempted_hosts, vec!["alpha", "beta"]);
        assert!(outcome
            .records
            .iter()
            .all(|r| r.raw_url.starts_with("https://beta.example/")));
    }
}
