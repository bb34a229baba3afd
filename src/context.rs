//! Service object wiring the offline sync components together.
//!
//! A [`SyncContext`] is built once at startup and handed to whatever needs to
//! issue mutations. It owns the queue, router, connectivity monitor, notifier
//! and orchestrator, and hands out [`OfflineGate`]s bound to them.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, ReachabilityProbe};
use crate::gate::OfflineGate;
use crate::notify::{Notification, Notifier};
use crate::queue::QueueOps;
use crate::remote::ApiClient;
use crate::retry::{RetryExecutor, RetryOptions};
use crate::router::{DispatchError, DispatchRouter};
use crate::sync::{SyncConfig, SyncOrchestrator};

pub struct SyncContext {
    queue: Arc<dyn QueueOps>,
    router: Arc<DispatchRouter>,
    connectivity: ConnectivityMonitor,
    notifier: Arc<dyn Notifier>,
    orchestrator: Arc<SyncOrchestrator>,
    /// Backoff for direct calls; `None` calls the remote once
    retry_options: Option<RetryOptions>,
}

impl SyncContext {
    pub fn new(
        queue: Arc<dyn QueueOps>,
        router: DispatchRouter,
        connectivity: ConnectivityMonitor,
        notifier: Arc<dyn Notifier>,
        sync_config: SyncConfig,
        retry_options: Option<RetryOptions>,
    ) -> Self {
        let router = Arc::new(router);
        let orchestrator = Arc::new(SyncOrchestrator::new(
            queue.clone(),
            router.clone(),
            connectivity.clone(),
            notifier.clone(),
            sync_config,
        ));

        Self {
            queue,
            router,
            connectivity,
            notifier,
            orchestrator,
            retry_options,
        }
    }

    /// Standard operations bound to `client`, tuned by `config`
    pub fn from_config(
        config: &Config,
        client: &ApiClient,
        queue: Arc<dyn QueueOps>,
        connectivity: ConnectivityMonitor,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let retry_options = config
            .retry_config
            .direct_calls
            .then(|| config.retry_config.to_options());

        Self::new(
            queue,
            DispatchRouter::standard(client),
            connectivity,
            notifier,
            config.sync_config.clone(),
            retry_options,
        )
    }

    pub fn queue(&self) -> &Arc<dyn QueueOps> {
        &self.queue
    }

    pub fn router(&self) -> &DispatchRouter {
        &self.router
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    /// Gate for a registered operation.
    ///
    /// Unregistered names fail here rather than at call time, so a gate never
    /// queues an operation the router could not replay.
    pub fn gate(&self, operation_name: &str) -> Result<OfflineGate, DispatchError> {
        let invoker = self
            .router
            .get(operation_name)
            .ok_or_else(|| DispatchError::UnknownOperation(operation_name.to_string()))?;

        let gate = OfflineGate::new(
            operation_name,
            invoker,
            self.queue.clone(),
            self.connectivity.clone(),
            self.notifier.clone(),
        )
        .with_orchestrator(self.orchestrator.clone());

        Ok(match &self.retry_options {
            Some(options) => gate.with_retry(Arc::new(self.retry_executor(operation_name, options))),
            None => gate,
        })
    }

    fn retry_executor(&self, operation_name: &str, options: &RetryOptions) -> RetryExecutor {
        let notifier = self.notifier.clone();
        let name = operation_name.to_string();

        RetryExecutor::new(options.clone().with_on_retry(move |attempt, error| {
            notifier.notify(Notification::warning(format!(
                "Retrying {} (attempt {}): {}",
                name, attempt, error
            )));
        }))
    }

    /// Start the reachability probe (unless pinned offline) and auto sync.
    ///
    /// Both tasks stop when `cancel` fires.
    pub fn spawn_background(
        &self,
        probe: Arc<dyn ReachabilityProbe>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);

        if !self.connectivity.is_pinned_offline() {
            let interval = Duration::from_secs(self.orchestrator.config().probe_interval_seconds);
            handles.push(self.connectivity.spawn_probe(probe, interval, cancel.child_token()));
        }

        handles.push(self.orchestrator.spawn_auto_sync(cancel.child_token()));
        handles
    }
}
