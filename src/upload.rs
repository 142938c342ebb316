//! Concurrent upload of a batch of images to one host.

use crate::{ImageHost, Metrics, UploadError, UploadSettings, UploadedImageRecord};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadJob {
    /// Index of the screenshot the file belongs to.
    pub index: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub job: UploadJob,
    pub result: Result<UploadedImageRecord, UploadError>,
    pub attempts: usize,
}

#[derive(Debug, Clone)]
pub struct UploadReport {
    pub host: String,
    /// Sorted by screenshot index.
    pub outcomes: Vec<UploadOutcome>,
}

impl UploadReport {
    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn records(&self) -> Vec<UploadedImageRecord> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().cloned())
            .collect()
    }

    pub fn failed_jobs(&self) -> Vec<UploadJob> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.job.clone())
            .collect()
    }

    pub fn last_error(&self) -> Option<&UploadError> {
        self.outcomes.iter().rev().find_map(|o| o.result.as_ref().err())
    }
}

/// Semaphore size for one batch: the host's own limit when it has one,
/// otherwise the batch size capped by the global ceiling.
pub fn upload_concurrency(host_limit: Option<usize>, batch: usize, ceiling: usize) -> usize {
    host_limit.unwrap_or_else(|| batch.min(ceiling)).max(1)
}

pub struct UploadDispatcher {
    settings: UploadSettings,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl UploadDispatcher {
    pub fn new(settings: UploadSettings, metrics: Arc<Metrics>, cancel: CancellationToken) -> Self {
        Self {
            settings,
            metrics,
            cancel,
        }
    }

    /// Uploads every job to `host`. Individual failures are reported in the
    /// outcome list; they never abort the batch.
    pub async fn upload(
        &self,
        jobs: &[UploadJob],
        host_name: &str,
        host: Arc<dyn ImageHost>,
        host_limit: Option<usize>,
        release_url: Option<&str>,
    ) -> UploadReport {
        let concurrency =
            upload_concurrency(host_limit, jobs.len(), self.settings.max_concurrent_uploads);
        info!(
            "Uploading {} images to {} ({} at a time)",
            jobs.len(),
            host_name,
            concurrency
        );

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let tasks: Vec<_> = jobs
            .iter()
            .cloned()
            .map(|job| {
                let semaphore = semaphore.clone();
                let host = host.clone();
                let unit = UploadUnit {
                    host_name: host_name.to_string(),
                    release_url: release_url.map(str::to_string),
                    settings: self.settings.clone(),
                    metrics: self.metrics.clone(),
                    cancel: self.cancel.clone(),
                };

                tokio::spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(e) => {
                            return UploadOutcome {
                                job,
                                result: Err(UploadError::transient(e.to_string())),
                                attempts: 0,
                            }
                        }
                    };
                    unit.run(job, host).await
                })
            })
            .collect();

        let mut outcomes: Vec<UploadOutcome> = join_all(tasks)
            .await
            .into_iter()
            .zip(jobs.iter())
            .map(|(joined, job)| match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Upload task for screenshot {} failed: {}", job.index, e);
                    UploadOutcome {
                        job: job.clone(),
                        result: Err(UploadError::transient(e.to_string())),
                        attempts: 0,
                    }
                }
            })
            .collect();

        outcomes.sort_by_key(|o| o.job.index);
        let report = UploadReport {
            host: host_name.to_string(),
            outcomes,
        };
        info!(
            "{} accepted {}/{} images",
            host_name,
            report.success_count(),
            jobs.len()
        );
        report
    }
}

struct UploadUnit {
    host_name: String,
    release_url: Option<String>,
    settings: UploadSettings,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl UploadUnit {
    async fn run(self, job: UploadJob, host: Arc<dyn ImageHost>) -> UploadOutcome {
        let max_attempts = self.settings.retry_attempts.max(1);
        let mut last_error = UploadError::transient("not attempted");

        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                return self.outcome(job, Err(UploadError::transient("cancelled")), attempt - 1);
            }

            let path = job.path.clone();
            let started = Instant::now();
            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return self.outcome(job, Err(UploadError::transient("cancelled")), attempt);
                }
                result = timeout(self.settings.unit_timeout, host.upload(&path)) => result,
            };
            let elapsed = started.elapsed();

            match result {
                Ok(Ok(image)) => {
                    self.metrics.record_upload(elapsed, true);
                    debug!(
                        "Screenshot {} hosted on {}: {}",
                        job.index, self.host_name, image.raw_url
                    );
                    let record = UploadedImageRecord {
                        img_url: image.img_url,
                        raw_url: image.raw_url,
                        web_url: image.web_url,
                        host_name: Some(self.host_name.clone()),
                        source_screenshot_index: job.index,
                        release_url: self.release_url.clone(),
                    };
                    return self.outcome(job, Ok(record), attempt);
                }
                Ok(Err(e)) if e.is_terminal() => {
                    self.metrics.record_upload(elapsed, false);
                    warn!(
                        "Screenshot {} rejected by {}: {}",
                        job.index, self.host_name, e
                    );
                    return self.outcome(job, Err(e), attempt);
                }
                Ok(Err(e)) => {
                    self.metrics.record_upload(elapsed, false);
                    last_error = e;
                }
                Err(_) => {
                    self.metrics.record_upload(elapsed, false);
                    last_error = UploadError::transient(format!(
                        "upload timed out after {:?}",
                        self.settings.unit_timeout
                    ));
                }
            }

            warn!(
                "Upload of screenshot {} to {} failed (attempt {}/{}): {}",
                job.index, self.host_name, attempt, max_attempts, last_error
            );
            if attempt < max_attempts {
                sleep(self.backoff(attempt)).await;
            }
        }

        self.outcome(job, Err(last_error), max_attempts)
    }

    /// Linear backoff: `retry_delay * attempt`.
    fn backoff(&self, attempt: usize) -> Duration {
        self.settings.retry_delay * attempt as u32
    }

    fn outcome(
        &self,
        job: UploadJob,
        result: Result<UploadedImageRecord, UploadError>,
        attempts: usize,
    ) -> UploadOutcome {
        UploadOutcome {
            job,
            result,
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HostedImage, MockImageHost, UploadFailureKind};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings() -> UploadSettings {
        UploadSettings {
            retry_attempts: 3,
            retry_delay: Duration::from_millis(1),
            unit_timeout: Duration::from_millis(200),
            max_concurrent_uploads: 10,
        }
    }

    fn dispatcher() -> UploadDispatcher {
        UploadDispatcher::new(settings(), Arc::new(Metrics::new()), CancellationToken::new())
    }

    fn jobs(count: usize) -> Vec<UploadJob> {
        (0..count)
            .map(|index| UploadJob {
                index,
                path: PathBuf::from(format!("/scratch/shot-{index:02}.png")),
            })
            .collect()
    }

    fn hosted(path: &Path) -> HostedImage {
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        HostedImage {
            img_url: format!("https://i.alpha.example/th/{name}"),
            raw_url: format!("https://i.alpha.example/{name}"),
            web_url: format!("https://alpha.example/v/{name}"),
        }
    }

    #[test]
    fn test_concurrency_limits() {
        assert_eq!(upload_concurrency(Some(1), 6, 10), 1);
        assert_eq!(upload_concurrency(None, 6, 10), 6);
        assert_eq!(upload_concurrency(None, 30, 10), 10);
        assert_eq!(upload_concurrency(None, 0, 10), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut host = MockImageHost::new();
        host.expect_upload().returning(move |path| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(UploadError::transient("HTTP 503"))
            } else {
                Ok(hosted(path))
            }
        });

        let report = dispatcher()
            .upload(&jobs(1), "alpha", Arc::new(host), None, None)
            .await;
        assert_eq!(report.success_count(), 1);
        assert_eq!(report.outcomes[0].attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let record = &report.records()[0];
        assert_eq!(record.host_name.as_deref(), Some("alpha"));
        assert_eq!(record.source_screenshot_index, 0);
    }

    #[tokio::test]
    async fn test_terminal_failures_stop_immediately() {
        let mut host = MockImageHost::new();
        host.expect_upload()
            .times(2)
            .returning(|path| {
                if path.to_string_lossy().contains("00") {
                    Err(UploadError::duplicate("already hosted"))
                } else {
                    Err(UploadError::auth("invalid API key"))
                }
            });

        let report = dispatcher()
            .upload(&jobs(2), "alpha", Arc::new(host), None, None)
            .await;
        assert_eq!(report.success_count(), 0);
        assert!(report.outcomes.iter().all(|o| o.attempts == 1));
        assert_eq!(
            report.outcomes[0].result.as_ref().unwrap_err().kind,
            UploadFailureKind::Duplicate
        );
        assert_eq!(
            report.outcomes[1].result.as_ref().unwrap_err().kind,
            UploadFailureKind::AuthFailure
        );
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let mut host = MockImageHost::new();
        host.expect_upload()
            .times(3)
            .returning(|_| Err(UploadError::transient("HTTP 502")));

        let report = dispatcher()
            .upload(&jobs(1), "alpha", Arc::new(host), None, None)
            .await;
        assert_eq!(report.failed_jobs(), jobs(1));
        assert_eq!(report.last_error().unwrap().kind, UploadFailureKind::Transient);
    }

    /// Later screenshots answer first; optionally hangs on one index.
    struct SlowHost {
        count: usize,
        hang_on: Option<usize>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SlowHost {
        fn new(count: usize, hang_on: Option<usize>) -> Self {
            Self {
                count,
                hang_on,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ImageHost for SlowHost {
        async fn upload(&self, path: &Path) -> Result<HostedImage, UploadError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let index: usize = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.rsplit('-').next())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let delay = if Some(index) == self.hang_on {
                Duration::from_secs(30)
            } else {
                Duration::from_millis(10 * (self.count - index) as u64)
            };
            tokio::time::sleep(delay).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(hosted(path))
        }
    }

    #[tokio::test]
    async fn test_results_follow_capture_order() {
        let host = Arc::new(SlowHost::new(6, None));
        let report = dispatcher().upload(&jobs(6), "alpha", host, None, None).await;

        let order: Vec<usize> = report
            .records()
            .iter()
            .map(|r| r.source_screenshot_index)
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_host_limit_bounds_concurrency() {
        let host = Arc::new(SlowHost::new(4, None));
        let report = dispatcher()
            .upload(&jobs(4), "alpha", host.clone(), Some(1), None)
            .await;
        assert_eq!(report.success_count(), 4);
        assert_eq!(host.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unit_timeout_counts_as_transient() {
        let host = Arc::new(SlowHost::new(2, Some(1)));
        let report = dispatcher()
            .upload(&jobs(2), "alpha", host, None, Some("https://db.example/r/1"))
            .await;

        assert_eq!(report.success_count(), 1);
        let failed = &report.outcomes[1];
        assert_eq!(failed.attempts, 3);
        assert!(failed.result.as_ref().unwrap_err().message.contains("timed out"));
        assert_eq!(
            report.records()[0].release_url.as_deref(),
            Some("https://db.example/r/1")
        );
    }
}
