//! Host selection and failover across the configured image hosts.
//!
//! ```text
//! UsingHost(n) --all uploaded--------------------------> Done
//! UsingHost(n) --outstanding, auto-selected host-------> UsingHost(n + 1)
//! UsingHost(n) --outstanding, explicit host------------> Done (partial)
//! UsingHost(n) --n + 1 == host count-------------------> Exhausted
//! ```
//!
//! Hosts the tracker does not approve, or without a backend, are skipped before
//! any upload is attempted.

use crate::{
    domain_matches, extract_domain, HostConfig, HostRegistry, Metrics, ReuploadCache, RunContext,
    ScreensError, UploadDispatcher, UploadError, UploadJob, UploadedImageRecord,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Ordered host names with a cursor that only moves forward.
#[derive(Debug, Clone)]
pub struct HostQueue {
    hosts: Vec<String>,
    active_index: usize,
}

impl HostQueue {
    pub fn new(hosts: Vec<String>) -> Self {
        Self {
            hosts,
            active_index: 0,
        }
    }

    pub fn active(&self) -> Option<&str> {
        self.hosts.get(self.active_index).map(String::as_str)
    }

    pub fn active_index(&self) -> usize {
        self.active_index
    }

    /// Moves to the next host. Once past the end the queue stays exhausted.
    pub fn advance(&mut self) -> Option<&str> {
        if self.active_index < self.hosts.len() {
            self.active_index += 1;
        }
        self.active()
    }

    pub fn is_exhausted(&self) -> bool {
        self.active_index >= self.hosts.len()
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }
}

#[derive(Debug, Clone)]
pub struct FailoverOutcome {
    /// Uploaded records sorted by screenshot index.
    pub records: Vec<UploadedImageRecord>,
    /// Hosts an upload was actually attempted on, in order.
    pub attempted: Vec<String>,
    /// Host the chain ended on; `None` when exhausted.
    pub active_host: Option<String>,
    pub active_index: usize,
    /// Jobs that no host accepted.
    pub outstanding: Vec<UploadJob>,
    pub error: Option<ScreensError>,
}

impl FailoverOutcome {
    pub fn success_count(&self) -> usize {
        self.records.len()
    }
}

pub struct HostFailover<'a> {
    hosts: &'a [HostConfig],
    registry: &'a HostRegistry,
    dispatcher: &'a UploadDispatcher,
    metrics: Arc<Metrics>,
}

impl<'a> HostFailover<'a> {
    pub fn new(
        hosts: &'a [HostConfig],
        registry: &'a HostRegistry,
        dispatcher: &'a UploadDispatcher,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            hosts,
            registry,
            dispatcher,
            metrics,
        }
    }

    /// Host order for a run: the explicit host alone, or every configured host.
    pub fn queue_for(&self, ctx: &RunContext) -> HostQueue {
        match &ctx.explicit_host {
            Some(host) => HostQueue::new(vec![host.clone()]),
            None => HostQueue::new(self.hosts.iter().map(|h| h.name.clone()).collect()),
        }
    }

    /// Uploads `jobs`, moving down the host queue while uploads remain
    /// outstanding. Successful records are mirrored to `cache` as each host
    /// finishes.
    pub async fn run(
        &self,
        ctx: &RunContext,
        jobs: Vec<UploadJob>,
        mut cache: Option<&mut ReuploadCache>,
    ) -> FailoverOutcome {
        let mut queue = self.queue_for(ctx);
        let auto_failover = ctx.explicit_host.is_none();
        let mut outstanding = jobs;
        let mut records: Vec<UploadedImageRecord> = Vec::new();
        let mut attempted = Vec::new();
        let mut last_error: Option<(String, UploadError)> = None;

        while let Some(host_name) = queue.active().map(str::to_string) {
            if outstanding.is_empty() {
                break;
            }

            let backend = match self.registry.get(&host_name) {
                Some(backend) if ctx.is_host_approved(&host_name) => backend,
                Some(_) => {
                    info!("Skipping {}: not approved for {}", host_name, ctx.scope.tracker);
                    if !auto_failover {
                        break;
                    }
                    queue.advance();
                    continue;
                }
                None => {
                    warn!("Skipping {}: no backend configured", host_name);
                    if !auto_failover {
                        break;
                    }
                    queue.advance();
                    continue;
                }
            };

            attempted.push(host_name.clone());
            let limit = self
                .hosts
                .iter()
                .find(|h| h.name == host_name)
                .and_then(|h| h.max_concurrency);
            let report = self
                .dispatcher
                .upload(
                    &outstanding,
                    &host_name,
                    backend,
                    limit,
                    ctx.scope.release_url.as_deref(),
                )
                .await;

            let uploaded = report.records();
            if !uploaded.is_empty() {
                if let Some(cache) = cache.as_deref_mut() {
                    if let Err(e) = cache.append(&ctx.scope, &uploaded).await {
                        warn!("Failed to update re-upload cache: {}", e);
                    }
                }
                records.extend(uploaded);
            }

            if let Some(error) = report.last_error() {
                last_error = Some((host_name.clone(), error.clone()));
            }
            outstanding = report.failed_jobs();
            if outstanding.is_empty() || !auto_failover {
                break;
            }

            warn!(
                "{} left {} uploads outstanding, failing over",
                host_name,
                outstanding.len()
            );
            self.metrics.record_failover();
            queue.advance();
        }

        records.sort_by_key(|r| r.source_screenshot_index);

        let error = if outstanding.is_empty() {
            None
        } else if auto_failover && queue.is_exhausted() {
            Some(ScreensError::HostExhaustion {
                attempted: attempted.clone(),
            })
        } else {
            let (host, error) = last_error.unwrap_or_else(|| {
                let host = queue.active().unwrap_or_default().to_string();
                (host, UploadError::auth("host not approved or not configured"))
            });
            Some(ScreensError::UploadFailed { host, error })
        };

        FailoverOutcome {
            records,
            attempted,
            active_host: queue.active().map(str::to_string),
            active_index: queue.active_index(),
            outstanding,
            error,
        }
    }
}

/// Host a record was uploaded to, by name or by the domain of its image URL.
pub fn identify_host<'h>(record: &UploadedImageRecord, hosts: &'h [HostConfig]) -> Option<&'h str> {
    if let Some(name) = &record.host_name {
        return hosts
            .iter()
            .find(|h| &h.name == name)
            .map(|h| h.name.as_str());
    }

    let domain = extract_domain(&record.raw_url)?;
    hosts
        .iter()
        .find(|h| h.domains.iter().any(|d| domain_matches(&domain, d)))
        .map(|h| h.name.as_str())
}

/// Splits previously uploaded records into those on an approved host and a
/// flag telling whether the batch has to be uploaded again.
///
/// An empty input, or any record on an unknown or unapproved host, requires a
/// re-upload. Feeding the kept records back in returns them unchanged with no
/// re-upload needed.
pub fn validate_existing_hosting(
    records: &[UploadedImageRecord],
    approved_hosts: &[String],
    hosts: &[HostConfig],
) -> (Vec<UploadedImageRecord>, bool) {
    let kept: Vec<UploadedImageRecord> = records
        .iter()
        .filter(|record| {
            identify_host(record, hosts)
                .is_some_and(|name| approved_hosts.iter().any(|a| a == name))
        })
        .cloned()
        .collect();

    let needs_reupload = kept.is_empty() || kept.len() < records.len();
    (kept, needs_reupload)
}
