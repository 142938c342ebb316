//! Run-wide cancellation: one token for every stage, plus the interrupt
//! sequence that stops spawned tasks and reaps orphaned child processes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What an interrupt or sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub aborted_tasks: usize,
    pub terminated: usize,
    pub killed: usize,
}

/// Owns cancellation for a run.
///
/// Stages only ever see [`CancellationToken`]s handed out by [`token`]; the
/// scope itself keeps the abort handles of long-running tasks and knows how to
/// clean up the process tree.
///
/// [`token`]: CancellationScope::token
#[derive(Clone)]
pub struct CancellationScope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    token: CancellationToken,
    tasks: Mutex<Vec<AbortHandle>>,
    grace: Duration,
    /// Process whose descendants are swept; the current process when unset
    root: Option<Pid>,
}

impl CancellationScope {
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                token: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                grace,
                root: None,
            }),
        }
    }

    /// Scope whose sweep covers the descendants of `pid` instead of this process.
    pub fn for_process_tree(grace: Duration, pid: u32) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                token: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                grace,
                root: Some(Pid::from_u32(pid)),
            }),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn cancel(&self) {
        self.inner.token.cancel();
    }

    /// Registers a task to be aborted on interrupt. Finished handles are pruned.
    pub fn register(&self, handle: AbortHandle) {
        let mut tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    fn abort_registered(&self) -> usize {
        let handles: Vec<AbortHandle> = {
            let mut tasks = self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tasks.drain(..).collect()
        };

        let mut aborted = 0;
        for handle in handles {
            if !handle.is_finished() {
                handle.abort();
                aborted += 1;
            }
        }
        aborted
    }

    /// Cancels the token, aborts registered tasks and sweeps child processes.
    ///
    /// Each step runs whatever happened in the previous ones.
    pub async fn interrupt(&self) -> SweepReport {
        warn!("Interrupt received, cancelling run");
        self.cancel();

        let aborted_tasks = self.abort_registered();
        // Let aborted tasks drop their children before sweeping.
        tokio::task::yield_now().await;

        let mut report = self.sweep_children().await;
        report.aborted_tasks = aborted_tasks;
        info!(
            "Interrupt cleanup: {} tasks aborted, {} processes terminated, {} killed",
            report.aborted_tasks, report.terminated, report.killed
        );
        report
    }

    /// Terminates every descendant of the current process: SIGTERM first, then
    /// SIGKILL for whatever is still alive after the grace period.
    pub async fn sweep_children(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let root = match self.inner.root {
            Some(pid) => pid,
            None => match sysinfo::get_current_pid() {
                Ok(pid) => pid,
                Err(e) => {
                    warn!("Cannot determine current pid, skipping child sweep: {}", e);
                    return report;
                }
            },
        };

        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        let descendants = descendant_pids(&system, root);
        if descendants.is_empty() {
            return report;
        }

        debug!("Sweeping {} child processes", descendants.len());
        for pid in &descendants {
            if let Some(process) = system.process(*pid) {
                match process.kill_with(Signal::Term) {
                    Some(true) => report.terminated += 1,
                    Some(false) => debug!("SIGTERM to {} failed", pid),
                    None => {
                        if process.kill() {
                            report.killed += 1;
                        }
                    }
                }
            }
        }

        if report.terminated == 0 {
            return report;
        }

        tokio::time::sleep(self.inner.grace).await;
        system.refresh_processes(ProcessesToUpdate::All, true);
        for pid in &descendants {
            if let Some(process) = system.process(*pid) {
                warn!("Process {} survived SIGTERM, killing", pid);
                if process.kill() {
                    report.killed += 1;
                }
            }
        }

        report
    }
}

/// Pids below `root` in the process tree, parents before children.
fn descendant_pids(system: &System, root: Pid) -> Vec<Pid> {
    let mut found = Vec::new();
    let mut seen = HashSet::new();
    let mut frontier = vec![root];

    while let Some(parent) = frontier.pop() {
        for (pid, process) in system.processes() {
            // Threads show up as processes on Linux.
            if process.thread_kind().is_some() {
                continue;
            }
            if process.parent() == Some(parent) && *pid != root && seen.insert(*pid) {
                found.push(*pid);
                frontier.push(*pid);
            }
        }
    }

    found
}

/// Signal task started by [`install_signal_handlers`].
pub struct SignalHandler {
    scope: CancellationScope,
    task: JoinHandle<Option<SweepReport>>,
}

impl SignalHandler {
    /// Stops listening for signals and waits out an interrupt sequence already
    /// under way, so SIGKILL escalation finishes before the process exits.
    ///
    /// Returns the sweep report when a signal interrupted the run.
    pub async fn shutdown(self) -> Option<SweepReport> {
        self.scope.cancel();
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                warn!("Signal handler task failed: {}", e);
                None
            }
        }
    }
}

/// Spawns a task that runs the interrupt sequence on SIGINT or SIGTERM.
#[cfg(unix)]
pub fn install_signal_handlers(scope: CancellationScope) -> std::io::Result<SignalHandler> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let listener = scope.clone();
    let task = tokio::spawn(async move {
        let token = listener.token();
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = token.cancelled() => return None,
        }
        Some(listener.interrupt().await)
    });
    Ok(SignalHandler { scope, task })
}
