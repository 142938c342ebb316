//! Byte-size validation of captured frames and the retake loop around it.

use crate::{
    CapturePlan, FrameCaptureEngine, Metrics, OptimizationJob, OptimizationPool, Screenshot,
    ScreenshotStatus, ScreensError, ValidationSettings,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accepted byte-size range of one host. Unset bounds are open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizePolicy {
    pub min_bytes: Option<u64>,
    pub max_bytes: Option<u64>,
}

/// Size policies keyed by host name, plus the host-independent floor.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    floor: u64,
    hosts: HashMap<String, SizePolicy>,
}

impl PolicyTable {
    pub fn new(floor: u64) -> Self {
        Self {
            floor,
            hosts: HashMap::new(),
        }
    }

    pub fn insert(&mut self, host: impl Into<String>, policy: SizePolicy) {
        self.hosts.insert(host.into(), policy);
    }

    /// Policy of `host`; hosts without one accept any size above the floor.
    pub fn for_host(&self, host: &str) -> SizePolicy {
        self.hosts.get(host).copied().unwrap_or_default()
    }

    pub fn floor(&self) -> u64 {
        self.floor
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    /// At or below the absolute floor: black, blank or corrupt.
    Degenerate,
    TooSmall,
    TooLarge,
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

/// Floor first, then the host range.
pub fn classify(size: u64, floor: u64, policy: &SizePolicy) -> Verdict {
    if size <= floor {
        return Verdict::Degenerate;
    }
    if policy.min_bytes.is_some_and(|min| size < min) {
        return Verdict::TooSmall;
    }
    if policy.max_bytes.is_some_and(|max| size > max) {
        return Verdict::TooLarge;
    }
    Verdict::Accepted
}

/// Offset for retake number `attempt` (1-based), clamped into `[0, duration]`.
///
/// Perturbations are applied to the original offset in order and wrap around
/// when there are more retakes than perturbations.
pub fn retake_offset(original: f64, attempt: usize, perturbations: &[f64], duration: f64) -> f64 {
    let shift = if perturbations.is_empty() || attempt == 0 {
        0.0
    } else {
        perturbations[(attempt - 1) % perturbations.len()]
    };
    (original + shift).clamp(0.0, duration.max(0.0))
}

/// Drops the smallest accepted frames until at most `requested` remain.
///
/// Returns the discarded screenshots; their files are left to the caller.
pub fn trim_to_requested(shots: &mut Vec<Screenshot>, requested: usize) -> Vec<Screenshot> {
    let mut discarded = Vec::new();
    while shots.len() > requested {
        let smallest = shots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.byte_size.unwrap_or(0))
            .map(|(pos, _)| pos);
        match smallest {
            Some(pos) => discarded.push(shots.remove(pos)),
            None => break,
        }
    }
    discarded
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationSummary {
    pub accepted: usize,
    pub failed_indices: Vec<usize>,
    pub retakes: usize,
}

/// Captures, optimizes and validates screenshots, retaking rejected ones.
///
/// Screenshots move in waves: every pending screenshot is captured, optimized
/// and classified together; rejected ones get a perturbed offset and form the
/// next wave. A screenshot out of retakes is marked failed and the rest carry on.
pub struct ValidationRetryLoop<'a> {
    engine: &'a FrameCaptureEngine,
    pool: Option<&'a OptimizationPool>,
    settings: &'a ValidationSettings,
    metrics: &'a Metrics,
    cancel: CancellationToken,
}

impl<'a> ValidationRetryLoop<'a> {
    pub fn new(
        engine: &'a FrameCaptureEngine,
        pool: Option<&'a OptimizationPool>,
        settings: &'a ValidationSettings,
        metrics: &'a Metrics,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            pool,
            settings,
            metrics,
            cancel,
        }
    }

    pub async fn run(
        &self,
        shots: &mut [Screenshot],
        plan: &CapturePlan,
        policy: SizePolicy,
        floor: u64,
        duration: f64,
    ) -> Result<ValidationSummary, ScreensError> {
        let mut summary = ValidationSummary::default();
        let mut wave: Vec<usize> = shots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == ScreenshotStatus::Pending)
            .map(|(pos, _)| pos)
            .collect();

        while !wave.is_empty() {
            if self.cancel.is_cancelled() {
                return Err(ScreensError::Cancelled);
            }

            self.capture_wave(shots, &wave, plan).await?;
            self.optimize_wave(shots, &wave).await?;

            let mut next_wave = Vec::new();
            for &pos in &wave {
                let shot = &mut shots[pos];
                let verdict = match (shot.file_path.as_ref(), shot.byte_size) {
                    (Some(_), Some(size)) => Some(classify(size, floor, &policy)),
                    _ => None,
                };

                if verdict.is_some_and(|v| v.is_accepted()) {
                    shot.status = ScreenshotStatus::Accepted;
                    summary.accepted += 1;
                    continue;
                }

                shot.status = ScreenshotStatus::Rejected;
                match verdict {
                    Some(v) => debug!(
                        "Screenshot {} rejected: {:?} at {} bytes",
                        shot.index,
                        v,
                        shot.byte_size.unwrap_or(0)
                    ),
                    None => debug!("Screenshot {} rejected: capture failed", shot.index),
                }

                if shot.attempts >= self.settings.max_retakes {
                    warn!(
                        "Screenshot {} failed after {} retakes",
                        shot.index, shot.attempts
                    );
                    if let Some(path) = shot.file_path.take() {
                        let _ = std::fs::remove_file(path);
                    }
                    shot.status = ScreenshotStatus::Failed;
                    summary.failed_indices.push(shot.index);
                    self.metrics.record_screenshot_failed();
                    continue;
                }

                let offset = retake_offset(
                    shot.original_offset_seconds,
                    shot.attempts + 1,
                    &self.settings.retake_offsets,
                    duration,
                );
                info!(
                    "Retaking screenshot {} at {} (attempt {}/{})",
                    shot.index,
                    crate::format_timestamp(offset),
                    shot.attempts + 1,
                    self.settings.max_retakes
                );
                shot.reset_for_retake(offset);
                self.metrics.record_retake();
                summary.retakes += 1;
                next_wave.push(pos);
            }

            wave = next_wave;
        }

        summary.failed_indices.sort_unstable();
        Ok(summary)
    }

    async fn capture_wave(
        &self,
        shots: &mut [Screenshot],
        wave: &[usize],
        plan: &CapturePlan,
    ) -> Result<(), ScreensError> {
        let requests = wave.iter().map(|&pos| plan.request(&shots[pos])).collect();
        let outcomes = self.engine.capture_batch(requests).await;

        if self.cancel.is_cancelled() {
            return Err(ScreensError::Cancelled);
        }

        for outcome in outcomes {
            let Some(shot) = shots.iter_mut().find(|s| s.index == outcome.index) else {
                continue;
            };
            let size = match &outcome.path {
                Some(path) => tokio::fs::metadata(path).await.ok().map(|m| m.len()),
                None => None,
            };

            match (outcome.path, size) {
                (Some(path), Some(size)) => {
                    shot.mark_captured(path, size);
                    shot.frame_meta = outcome.frame_meta;
                    self.metrics.record_capture(true);
                }
                _ => {
                    self.metrics.record_capture(false);
                    warn!(
                        "Screenshot {} not captured at {}",
                        shot.index,
                        crate::format_timestamp(shot.source_offset_seconds)
                    );
                }
            }
        }
        Ok(())
    }

    async fn optimize_wave(&self, shots: &mut [Screenshot], wave: &[usize]) -> Result<(), ScreensError> {
        let captured: Vec<OptimizationJob> = wave
            .iter()
            .filter_map(|&pos| {
                let shot = &shots[pos];
                match (&shot.status, &shot.file_path) {
                    (ScreenshotStatus::Captured, Some(path)) => Some(OptimizationJob {
                        index: shot.index,
                        path: path.clone(),
                    }),
                    _ => None,
                }
            })
            .collect();

        let mut optimized: HashMap<usize, bool> = HashMap::new();
        if let Some(pool) = self.pool {
            match pool.optimize_batch(captured.clone()).await {
                Ok(batch) => {
                    for result in batch.results {
                        optimized.insert(result.index, result.outcome.is_ok());
                    }
                }
                Err(ScreensError::Cancelled) => return Err(ScreensError::Cancelled),
                Err(e) => warn!("Optimization batch failed, keeping originals: {}", e),
            }
        }

        for job in captured {
            let Some(shot) = shots.iter_mut().find(|s| s.index == job.index) else {
                continue;
            };
            if self.pool.is_some() && !optimized.get(&job.index).copied().unwrap_or(false) {
                self.metrics.record_optimization_failure();
                warn!("Screenshot {} kept unoptimized", job.index);
            }
            // Re-read the size; an optimized file is smaller.
            let size = tokio::fs::metadata(&job.path)
                .await
                .map(|m| m.len())
                .unwrap_or_else(|_| shot.byte_size.unwrap_or(0));
            shot.mark_optimized(size);
        }
        Ok(())
    }
}
