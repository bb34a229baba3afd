//! Session Sync Library
//!
//! Offline-first mutation queue and sync engine: state-changing remote calls
//! are applied directly when online, persisted to a durable queue when
//! offline, and replayed in order once connectivity returns.

pub mod cli;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod gate;
pub mod logger;
pub mod notify;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod router;
pub mod sync;
pub mod user_agent;

// Re-export commonly used types for easier access
pub use cli::Cli;
pub use config::Config;
pub use connectivity::ConnectivityMonitor;
pub use context::SyncContext;
pub use gate::{GateError, OfflineGate};
pub use queue::{Arguments, Queue, QueueOps, QueuedOperation};
pub use remote::{ApiClient, RemoteInvoker};
pub use retry::{RetryExecutor, RetryOptions};
pub use router::DispatchRouter;
pub use sync::{SyncConfig, SyncOrchestrator, SyncOutcome, SyncReport};
