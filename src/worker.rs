//! Per-batch pool of OS worker processes running the lossless optimizer.

use crate::{CancellationScope, OptimizationSettings, ScreensError, WorkerReply};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Argument that switches the binary into worker mode.
pub const WORKER_ARG: &str = "optimize-worker";

#[derive(Debug, Clone)]
pub struct OptimizationJob {
    pub index: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationResult {
    pub index: usize,
    /// Optimized path, or the message of the worker's error marker.
    pub outcome: Result<PathBuf, String>,
}

impl OptimizationResult {
    fn failed(index: usize, message: impl Into<String>) -> Self {
        Self {
            index,
            outcome: Err(message.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub id: usize,
    pub is_running: bool,
    pub processed_count: usize,
    pub error_count: usize,
}

#[derive(Debug, Clone)]
pub struct OptimizationBatch {
    /// One result per job, sorted by index.
    pub results: Vec<OptimizationResult>,
    pub workers: Vec<WorkerStats>,
}

impl OptimizationBatch {
    /// Paths that came back without an error marker.
    pub fn accepted(&self) -> Vec<(usize, PathBuf)> {
        self.results
            .iter()
            .filter_map(|r| r.outcome.as_ref().ok().map(|p| (r.index, p.clone())))
            .collect()
    }
}

struct OptimizationWorker {
    id: usize,
    command: Arc<Vec<String>>,
    cancel: CancellationToken,
    is_running: Arc<AtomicBool>,
    processed_count: Arc<AtomicUsize>,
    error_count: Arc<AtomicUsize>,
}

struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    replies: Lines<BufReader<ChildStdout>>,
}

impl OptimizationWorker {
    fn new(id: usize, command: Arc<Vec<String>>, cancel: CancellationToken) -> Self {
        Self {
            id,
            command,
            cancel,
            is_running: Arc::new(AtomicBool::new(false)),
            processed_count: Arc::new(AtomicUsize::new(0)),
            error_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn spawn_process(&self) -> Result<WorkerProcess, ScreensError> {
        let (program, args) = self.command.split_first().ok_or_else(|| {
            ScreensError::ConfigurationError("Empty optimization worker command".to_string())
        })?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            ScreensError::OptimizationFailed("worker stdin unavailable".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ScreensError::OptimizationFailed("worker stdout unavailable".to_string())
        })?;

        Ok(WorkerProcess {
            child,
            stdin,
            replies: BufReader::new(stdout).lines(),
        })
    }

    async fn run_with_shared_receiver(
        &self,
        jobs: Arc<Mutex<mpsc::Receiver<OptimizationJob>>>,
        results: mpsc::Sender<OptimizationResult>,
    ) {
        debug!("Starting optimization worker {}", self.id);
        self.is_running.store(true, Ordering::Relaxed);

        let mut process = match self.spawn_process() {
            Ok(process) => Some(process),
            Err(e) => {
                error!("Optimization worker {} failed to start: {}", self.id, e);
                None
            }
        };

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let job = {
                let mut receiver = jobs.lock().await;
                receiver.recv().await
            };
            let Some(job) = job else { break };

            let result = match process.as_mut() {
                Some(proc) => match self.process_job(proc, &job).await {
                    Some(result) => result,
                    None => {
                        // The process is gone; later jobs fail fast.
                        process = None;
                        OptimizationResult::failed(job.index, "worker exited")
                    }
                },
                None => OptimizationResult::failed(job.index, "worker unavailable"),
            };

            match &result.outcome {
                Ok(_) => {
                    self.processed_count.fetch_add(1, Ordering::Relaxed);
                }
                Err(message) => {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Worker {} could not optimize screenshot {}: {}",
                        self.id, job.index, message
                    );
                }
            }

            if let Err(e) = results.send(result).await {
                error!("Worker {} failed to send result: {}", self.id, e);
                break;
            }
        }

        if let Some(WorkerProcess {
            mut child, stdin, ..
        }) = process
        {
            // Closing stdin ends the worker loop.
            drop(stdin);
            match child.wait().await {
                Ok(status) if !status.success() => {
                    debug!("Optimization worker {} exited with {}", self.id, status)
                }
                Err(e) => warn!("Failed to reap optimization worker {}: {}", self.id, e),
                _ => {}
            }
        }

        self.is_running.store(false, Ordering::Relaxed);
        debug!("Optimization worker {} stopped", self.id);
    }

    /// `None` when the worker process died mid-job.
    async fn process_job(
        &self,
        process: &mut WorkerProcess,
        job: &OptimizationJob,
    ) -> Option<OptimizationResult> {
        let line = format!("{}\n", job.path.display());
        if let Err(e) = process.stdin.write_all(line.as_bytes()).await {
            warn!("Worker {} stdin closed: {}", self.id, e);
            return None;
        }
        if let Err(e) = process.stdin.flush().await {
            warn!("Worker {} stdin flush failed: {}", self.id, e);
            return None;
        }

        let reply = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Some(OptimizationResult::failed(job.index, "cancelled"));
            }
            reply = process.replies.next_line() => reply,
        };

        match reply {
            Ok(Some(line)) => Some(match WorkerReply::parse(&line) {
                WorkerReply::Optimized(path) => OptimizationResult {
                    index: job.index,
                    outcome: Ok(path),
                },
                WorkerReply::Failed(message) => OptimizationResult::failed(job.index, message),
            }),
            Ok(None) => None,
            Err(e) => {
                warn!("Worker {} reply unreadable: {}", self.id, e);
                None
            }
        }
    }

    fn stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id,
            is_running: self.is_running.load(Ordering::Relaxed),
            processed_count: self.processed_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}

impl Clone for OptimizationWorker {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            command: self.command.clone(),
            cancel: self.cancel.clone(),
            is_running: self.is_running.clone(),
            processed_count: self.processed_count.clone(),
            error_count: self.error_count.clone(),
        }
    }
}

/// Runs lossless recompression in separate OS processes.
///
/// Processes are started per batch, `min(jobs, max_workers)` of them, and torn
/// down when the batch completes. On cancellation the batch returns at once;
/// worker tasks are aborted and their processes killed on drop.
pub struct OptimizationPool {
    command: Arc<Vec<String>>,
    max_workers: usize,
    scope: CancellationScope,
}

impl OptimizationPool {
    pub fn new(settings: &OptimizationSettings, scope: CancellationScope) -> Result<Self, ScreensError> {
        let command = if settings.worker_command.is_empty() {
            let exe = std::env::current_exe()?;
            vec![exe.to_string_lossy().into_owned(), WORKER_ARG.to_string()]
        } else {
            settings.worker_command.clone()
        };

        Ok(Self {
            command: Arc::new(command),
            max_workers: settings.max_workers.max(1),
            scope,
        })
    }

    pub fn worker_count_for(&self, jobs: usize) -> usize {
        jobs.min(self.max_workers)
    }

    pub async fn optimize_batch(
        &self,
        jobs: Vec<OptimizationJob>,
    ) -> Result<OptimizationBatch, ScreensError> {
        if jobs.is_empty() {
            return Ok(OptimizationBatch {
                results: Vec::new(),
                workers: Vec::new(),
            });
        }

        let cancel = self.scope.token();
        if cancel.is_cancelled() {
            return Err(ScreensError::Cancelled);
        }

        let total = jobs.len();
        let worker_count = self.worker_count_for(total);
        let indices: Vec<usize> = jobs.iter().map(|j| j.index).collect();
        info!(
            "Optimizing {} screenshots with {} worker processes",
            total, worker_count
        );

        let (job_sender, job_receiver) = mpsc::channel(total);
        let (result_sender, mut result_receiver) = mpsc::channel(total);
        for job in jobs {
            job_sender
                .send(job)
                .await
                .map_err(|e| ScreensError::OptimizationFailed(e.to_string()))?;
        }
        drop(job_sender);

        let shared_receiver = Arc::new(Mutex::new(job_receiver));
        let workers: Vec<OptimizationWorker> = (0..worker_count)
            .map(|id| OptimizationWorker::new(id, self.command.clone(), cancel.clone()))
            .collect();

        let handles: Vec<_> = workers
            .iter()
            .map(|worker| {
                let worker = worker.clone();
                let rx = shared_receiver.clone();
                let tx = result_sender.clone();
                let handle = tokio::spawn(async move {
                    worker.run_with_shared_receiver(rx, tx).await;
                });
                self.scope.register(handle.abort_handle());
                handle
            })
            .collect();
        drop(result_sender);

        let mut results = Vec::with_capacity(total);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("Optimization batch cancelled, stopping {} workers", handles.len());
                    for handle in &handles {
                        handle.abort();
                    }
                    return Err(ScreensError::Cancelled);
                }
                result = result_receiver.recv() => match result {
                    Some(result) => results.push(result),
                    None => break,
                },
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Optimization worker task failed: {}", e);
            }
        }

        for index in indices {
            if !results.iter().any(|r| r.index == index) {
                results.push(OptimizationResult::failed(index, "no reply from worker"));
            }
        }
        results.sort_by_key(|r| r.index);

        Ok(OptimizationBatch {
            results,
            workers: workers.iter().map(|w| w.stats()).collect(),
        })
    }
}
