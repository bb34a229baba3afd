//! Offline mutation gate.
//!
//! Wraps one remote operation with connectivity awareness. Online calls go
//! straight to the remote store, optionally through a [`RetryExecutor`].
//! Offline calls are persisted to the durable queue and return `None`, since
//! the effect has not been applied yet.

use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::connectivity::ConnectivityMonitor;
use crate::notify::{Notification, Notifier};
use crate::queue::{Arguments, QueueError, QueueOps};
use crate::remote::{RemoteError, RemoteInvoker};
use crate::retry::{RetryError, RetryExecutor};
use crate::sync::SyncOrchestrator;

#[derive(Error, Debug)]
pub enum GateError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Retry(#[from] RetryError<RemoteError>),
    #[error("Failed to queue operation: {0}")]
    Queue(#[from] QueueError),
}

pub struct OfflineGate {
    operation_name: String,
    invoker: Arc<dyn RemoteInvoker>,
    queue: Arc<dyn QueueOps>,
    connectivity: ConnectivityMonitor,
    notifier: Arc<dyn Notifier>,
    retry: Option<Arc<RetryExecutor>>,
    orchestrator: Option<Arc<SyncOrchestrator>>,
}

impl OfflineGate {
    pub fn new(
        operation_name: &str,
        invoker: Arc<dyn RemoteInvoker>,
        queue: Arc<dyn QueueOps>,
        connectivity: ConnectivityMonitor,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            operation_name: operation_name.to_string(),
            invoker,
            queue,
            connectivity,
            notifier,
            retry: None,
            orchestrator: None,
        }
    }

    /// Route online calls through `executor`
    pub fn with_retry(mut self, executor: Arc<RetryExecutor>) -> Self {
        self.retry = Some(executor);
        self
    }

    /// Refresh the orchestrator's queue depth after each enqueue
    pub fn with_orchestrator(mut self, orchestrator: Arc<SyncOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    /// Apply the operation now if online, otherwise queue it.
    ///
    /// Returns `Ok(None)` when the operation was queued.
    pub async fn call(&self, arguments: Arguments) -> Result<Option<Value>, GateError> {
        if self.connectivity.is_online() {
            tracing::debug!(operation = %self.operation_name, "Online, calling remote directly");
            return self.call_remote(&arguments).await.map(Some);
        }

        match self.queue.enqueue(&self.operation_name, arguments) {
            Ok(id) => {
                tracing::info!(
                    operation = %self.operation_name,
                    operation_id = %id,
                    "Offline, operation queued for later sync"
                );
                self.notifier.notify(
                    Notification::info(format!("{} queued for later sync", self.operation_name))
                        .with_dedup_key(id),
                );

                if let Some(orchestrator) = &self.orchestrator {
                    if let Err(e) = orchestrator.refresh_queue_depth() {
                        tracing::warn!(error = %e, "Failed to refresh queue depth");
                    }
                }

                Ok(None)
            }
            Err(e) => {
                tracing::error!(
                    operation = %self.operation_name,
                    error = %e,
                    "Failed to queue operation"
                );
                self.notifier.notify(Notification::error(format!(
                    "Could not save {} for later sync: {}",
                    self.operation_name, e
                )));
                Err(e.into())
            }
        }
    }

    async fn call_remote(&self, arguments: &Arguments) -> Result<Value, GateError> {
        match &self.retry {
            Some(executor) => {
                let invoker = &self.invoker;
                Ok(executor.execute(move || invoker.invoke(arguments)).await?)
            }
            None => Ok(self.invoker.invoke(arguments).await?),
        }
    }
}
