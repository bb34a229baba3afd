//! Connectivity monitor.
//!
//! Holds the current online/offline status in a `watch` channel. Readers take
//! the latest value synchronously; subscribers are woken on each transition
//! but only ever see the newest status, never a backlog.
//!
//! The status comes from a [`ReachabilityProbe`] polled by
//! [`ConnectivityMonitor::spawn_probe`], or from explicit calls to
//! [`ConnectivityMonitor::set_online`].

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::remote::ApiClient;

/// Source of the platform connectivity signal
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

#[async_trait]
impl ReachabilityProbe for ApiClient {
    async fn is_reachable(&self) -> bool {
        self.check_connectivity().await
    }
}

#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    status: Arc<watch::Sender<bool>>,
    pinned_offline: bool,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (status, _) = watch::channel(initially_online);
        Self {
            status: Arc::new(status),
            pinned_offline: false,
        }
    }

    /// A monitor that reports offline no matter what the probe says
    pub fn pinned_offline() -> Self {
        Self {
            pinned_offline: true,
            ..Self::new(false)
        }
    }

    /// Start from a single probe result
    pub async fn detect(probe: &dyn ReachabilityProbe) -> Self {
        let online = probe.is_reachable().await;
        debug!(online, "Initial connectivity detected");
        Self::new(online)
    }

    pub fn is_online(&self) -> bool {
        *self.status.borrow()
    }

    pub fn is_pinned_offline(&self) -> bool {
        self.pinned_offline
    }

    /// Record a new status. Returns true only on an actual transition.
    pub fn set_online(&self, online: bool) -> bool {
        let online = online && !self.pinned_offline;
        let changed = self.status.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            info!(online, "Connectivity changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.status.subscribe()
    }

    /// Poll `probe` every `interval` until `cancel` fires.
    pub fn spawn_probe(
        &self,
        probe: Arc<dyn ReachabilityProbe>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = self.clone();

        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Connectivity probe started");

            loop {
                let online = probe.is_reachable().await;
                monitor.set_online(online);

                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Connectivity probe cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }
}
