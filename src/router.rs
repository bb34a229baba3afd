use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::queue::Arguments;
use crate::remote::{ApiClient, RemoteError, RemoteInvoker};

/// Names of the remote procedures that can be queued while offline
pub mod operations {
    pub const START_SESSION: &str = "sessions.start";
    pub const COMPLETE_SESSION: &str = "sessions.complete";
    pub const UPDATE_PREFERENCES: &str = "preferences.update";

    pub const ALL: [&str; 3] = [START_SESSION, COMPLETE_SESSION, UPDATE_PREFERENCES];
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl DispatchError {
    /// Unknown names are programming errors and never worth retrying
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::UnknownOperation(_))
    }
}

/// Registration table mapping operation names to their invokers.
///
/// Built once at startup. Adding a syncable operation means adding one
/// `register` call here and nothing else.
#[derive(Default, Clone)]
pub struct DispatchRouter {
    handlers: HashMap<String, Arc<dyn RemoteInvoker>>,
}

impl std::fmt::Debug for DispatchRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRouter")
            .field("operations", &self.names())
            .finish()
    }
}

impl DispatchRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Router with every standard operation bound to `client`
    pub fn standard(client: &ApiClient) -> Self {
        operations::ALL
            .iter()
            .fold(Self::new(), |router, name| {
                router.register(name, Arc::new(client.procedure(name)))
            })
    }

    /// Register `invoker` under `name`, replacing any previous binding
    pub fn register(mut self, name: &str, invoker: Arc<dyn RemoteInvoker>) -> Self {
        if self.handlers.insert(name.to_string(), invoker).is_some() {
            tracing::warn!(operation = name, "Replacing existing operation binding");
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RemoteInvoker>> {
        self.handlers.get(name).cloned()
    }

    /// Registered names in sorted order
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn dispatch(&self, name: &str, arguments: &Arguments) -> Result<Value, DispatchError> {
        let invoker = self
            .handlers
            .get(name)
            .ok_or_else(|| DispatchError::UnknownOperation(name.to_string()))?;

        tracing::debug!(operation = name, "Dispatching operation");
        Ok(invoker.invoke(arguments).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::invoker_fn;
    use serde_json::json;

    fn echo_router() -> DispatchRouter {
        DispatchRouter::new().register(
            "echo",
            Arc::new(invoker_fn(|args: Arguments| async move { Ok(Value::Object(args)) })),
        )
    }

    #[tokio::test]
    async fn test_dispatch_registered_operation() {
        let router = echo_router();
        let mut args = Arguments::new();
        args.insert("value".to_string(), json!(5));

        let result = router.dispatch("echo", &args).await.unwrap();
        assert_eq!(result, json!({"value": 5}));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_operation() {
        let router = echo_router();
        let result = router.dispatch("missing", &Arguments::new()).await;

        match result {
            Err(err @ DispatchError::UnknownOperation(_)) => {
                assert!(!err.is_retryable());
                assert_eq!(err.to_string(), "Unknown operation: missing");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_remote_failure_is_retryable() {
        let router = DispatchRouter::new().register(
            "flaky",
            Arc::new(invoker_fn(|_args: Arguments| async {
                Err(RemoteError::Rejected("unavailable".to_string()))
            })),
        );

        let err = router.dispatch("flaky", &Arguments::new()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Remote(RemoteError::Rejected(_))));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_standard_router_registers_all_operations() {
        let client = ApiClient::new("http://localhost:9".to_string()).unwrap();
        let router = DispatchRouter::standard(&client);

        for name in operations::ALL {
            assert!(router.contains(name), "missing {}", name);
        }
        assert_eq!(
            router.names(),
            vec!["preferences.update", "sessions.complete", "sessions.start"]
        );
    }

    #[test]
    fn test_register_replaces_binding() {
        let router = echo_router().register(
            "echo",
            Arc::new(invoker_fn(|_args: Arguments| async { Ok(Value::Null) })),
        );
        assert_eq!(router.names(), vec!["echo"]);
        assert!(router.get("echo").is_some());
        assert!(router.get("other").is_none());
    }
}
