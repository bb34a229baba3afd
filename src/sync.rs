use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connectivity::ConnectivityMonitor;
use crate::notify::{Notification, Notifier};
use crate::queue::{QueueError, QueueOps, QueuedOperation};
use crate::router::{DispatchError, DispatchRouter};

/// Configuration for queue replay
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Replay queued operations at all
    pub enabled: bool,
    /// Replay attempts after which a queued operation is discarded
    pub max_retries: u32,
    /// Drain periodically in addition to draining on reconnect
    pub background_sync: bool,
    /// Period of the background drain in seconds
    pub sync_interval_seconds: u64,
    /// Period of the reachability probe in seconds
    pub probe_interval_seconds: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            background_sync: false,
            sync_interval_seconds: 300, // 5 minutes
            probe_interval_seconds: 30,
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("Unknown operations left in queue: {}", .operations.join(", "))]
    UnknownOperations {
        operations: Vec<String>,
        report: SyncReport,
    },
}

/// Aggregate result of one drain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Entries replayed successfully and removed
    pub succeeded: usize,
    /// Entries that failed and stay queued with a higher retry count
    pub failed: usize,
    /// Entries removed after reaching the retry ceiling
    pub discarded: usize,
    /// Entries in the snapshot taken at the start of the drain
    pub total: usize,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyRunning,
    Offline,
    Disabled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::AlreadyRunning => "sync already in progress",
            Self::Offline => "offline",
            Self::Disabled => "sync disabled",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    Skipped(SkipReason),
}

/// Always-visible sync indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncIndicator {
    pub queue_depth: usize,
    pub is_syncing: bool,
    pub online: bool,
}

/// Holds the single-flight flag for the duration of one drain
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Replays queued operations against the remote store.
///
/// At most one drain runs at a time. A drain works over the snapshot of
/// entries read when it starts and processes them strictly one after another
/// in queue order.
pub struct SyncOrchestrator {
    queue: Arc<dyn QueueOps>,
    router: Arc<DispatchRouter>,
    connectivity: ConnectivityMonitor,
    notifier: Arc<dyn Notifier>,
    config: SyncConfig,
    in_progress: AtomicBool,
    queue_depth: watch::Sender<usize>,
}

impl SyncOrchestrator {
    pub fn new(
        queue: Arc<dyn QueueOps>,
        router: Arc<DispatchRouter>,
        connectivity: ConnectivityMonitor,
        notifier: Arc<dyn Notifier>,
        config: SyncConfig,
    ) -> Self {
        let initial_depth = queue.count().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to read initial queue depth");
            0
        });
        let (queue_depth, _) = watch::channel(initial_depth);

        Self {
            queue,
            router,
            connectivity,
            notifier,
            config,
            in_progress: AtomicBool::new(false),
            queue_depth,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn indicator(&self) -> SyncIndicator {
        SyncIndicator {
            queue_depth: *self.queue_depth.borrow(),
            is_syncing: self.is_syncing(),
            online: self.connectivity.is_online(),
        }
    }

    pub fn subscribe_queue_depth(&self) -> watch::Receiver<usize> {
        self.queue_depth.subscribe()
    }

    /// Re-read the queue size and publish it to subscribers
    pub fn refresh_queue_depth(&self) -> Result<usize, QueueError> {
        let depth = self.queue.count()?;
        self.queue_depth.send_replace(depth);
        Ok(depth)
    }

    /// Drain the queue once.
    ///
    /// Returns [`SyncOutcome::Skipped`] without touching the queue when sync is
    /// disabled, a drain is already running, or the device is offline.
    pub async fn sync_queue(&self) -> Result<SyncOutcome, SyncError> {
        if !self.config.enabled {
            tracing::debug!("Sync is disabled in configuration");
            return Ok(SyncOutcome::Skipped(SkipReason::Disabled));
        }

        let Some(_guard) = DrainGuard::acquire(&self.in_progress) else {
            tracing::debug!("Sync already in progress, ignoring trigger");
            return Ok(SyncOutcome::Skipped(SkipReason::AlreadyRunning));
        };

        if !self.connectivity.is_online() {
            tracing::debug!("Offline, skipping sync");
            return Ok(SyncOutcome::Skipped(SkipReason::Offline));
        }

        let result = self.drain().await;

        if let Err(SyncError::Queue(ref e)) = result {
            tracing::error!(error = %e, "Sync aborted by storage error");
            self.notifier
                .notify(Notification::error(format!("Sync failed: {}", e)));
            if let Err(e) = self.refresh_queue_depth() {
                tracing::warn!(error = %e, "Failed to refresh queue depth");
            }
        }

        result.map(SyncOutcome::Completed)
    }

    async fn drain(&self) -> Result<SyncReport, SyncError> {
        let start_time = Instant::now();
        let entries = self.queue.list_all()?;

        if entries.is_empty() {
            tracing::debug!("No queued operations to sync");
            return Ok(SyncReport::default());
        }

        tracing::info!(queue_size = entries.len(), "Starting queue drain");

        let mut report = SyncReport {
            total: entries.len(),
            ..SyncReport::default()
        };
        let mut unknown_operations = Vec::new();

        for entry in &entries {
            if let Err(e) = self.replay(entry, &mut report, &mut unknown_operations).await {
                // Announce what was already applied before reporting the abort
                report.duration = start_time.elapsed();
                self.announce(&report);
                return Err(e.into());
            }
        }

        report.duration = start_time.elapsed();
        self.announce(&report);

        let remaining = self.refresh_queue_depth()?;
        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            discarded = report.discarded,
            queue_size = remaining,
            duration_ms = report.duration.as_millis() as u64,
            "Queue drain completed"
        );

        if unknown_operations.is_empty() {
            Ok(report)
        } else {
            Err(SyncError::UnknownOperations {
                operations: unknown_operations,
                report,
            })
        }
    }

    /// Replay one entry and record its outcome in `report`
    async fn replay(
        &self,
        entry: &QueuedOperation,
        report: &mut SyncReport,
        unknown_operations: &mut Vec<String>,
    ) -> Result<(), QueueError> {
        match self
            .router
            .dispatch(&entry.operation_name, &entry.arguments)
            .await
        {
            Ok(_) => {
                self.queue.remove(&entry.id)?;
                report.succeeded += 1;
                tracing::debug!(
                    operation = %entry.operation_name,
                    operation_id = %entry.id,
                    "Replayed queued operation"
                );
            }
            Err(DispatchError::UnknownOperation(name)) => {
                tracing::error!(
                    operation = %name,
                    operation_id = %entry.id,
                    "Queued operation has no registered handler"
                );
                if !unknown_operations.contains(&name) {
                    unknown_operations.push(name);
                }
            }
            Err(e) if entry.retry_count >= self.config.max_retries => {
                self.queue.remove(&entry.id)?;
                report.discarded += 1;
                tracing::warn!(
                    operation = %entry.operation_name,
                    operation_id = %entry.id,
                    retry_count = entry.retry_count,
                    error = %e,
                    "Discarding queued operation after repeated failures"
                );
            }
            Err(e) => {
                self.queue.update_retry_count(&entry.id, entry.retry_count + 1)?;
                report.failed += 1;
                tracing::warn!(
                    operation = %entry.operation_name,
                    operation_id = %entry.id,
                    retry_count = entry.retry_count + 1,
                    error = %e,
                    "Replay failed, will retry"
                );
            }
        }
        Ok(())
    }

    fn announce(&self, report: &SyncReport) {
        if report.succeeded > 0 {
            self.notifier.notify(Notification::success(format!(
                "{} operations synced",
                report.succeeded
            )));
        }
        if report.failed > 0 {
            self.notifier.notify(Notification::warning(format!(
                "{} failed, will retry",
                report.failed
            )));
        }
        if report.discarded > 0 {
            self.notifier.notify(Notification::error(format!(
                "{} operations discarded after repeated failures",
                report.discarded
            )));
        }
    }

    /// Drain on reconnect, and periodically when background sync is on.
    ///
    /// Runs until `cancel` fires.
    pub fn spawn_auto_sync(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut status = self.connectivity.subscribe();
        // Read before spawning so a transition racing the task start is not lost
        let mut was_online = *status.borrow_and_update();
        let background = self.config.background_sync;
        let period = Duration::from_secs(self.config.sync_interval_seconds.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            if background {
                tracing::info!(interval_secs = period.as_secs(), "Starting background sync");
            }

            // Entries left from an earlier run are not followed by a reconnect
            if was_online {
                orchestrator.sync_pending("startup").await;
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Auto sync stopped");
                        break;
                    }
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *status.borrow_and_update();
                        let reconnected = online && !was_online;
                        was_online = online;
                        if reconnected {
                            orchestrator.sync_pending("reconnect").await;
                        }
                    }
                    _ = ticker.tick(), if background => {
                        orchestrator.run_triggered("periodic").await;
                    }
                }
            }
        })
    }

    async fn sync_pending(&self, trigger: &'static str) {
        match self.refresh_queue_depth() {
            Ok(0) => tracing::debug!(trigger, "Queue empty, nothing to sync"),
            Ok(depth) => {
                tracing::info!(trigger, queue_size = depth, "Draining queue");
                self.run_triggered(trigger).await;
            }
            Err(e) => tracing::warn!(trigger, error = %e, "Failed to read queue"),
        }
    }

    async fn run_triggered(&self, trigger: &'static str) {
        match self.sync_queue().await {
            Ok(SyncOutcome::Completed(report)) if report.total > 0 => {
                tracing::info!(
                    trigger,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    "Triggered sync completed"
                );
            }
            Ok(SyncOutcome::Completed(_)) => {}
            Ok(SyncOutcome::Skipped(reason)) => {
                tracing::debug!(trigger, %reason, "Triggered sync skipped");
            }
            Err(e) => tracing::error!(trigger, error = %e, "Triggered sync failed"),
        }
    }
}
