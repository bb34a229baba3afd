use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::queue::Arguments;
use crate::user_agent::generate_user_agent;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("API error: {0} - {1}")]
    Api(String, String),
    #[error("Authentication error: {0}")]
    Auth(String),
    #[error("Rate limited: {0}")]
    RateLimit(String),
    #[error("Invalid response: {0}")]
    Decode(String),
    #[error("Remote operation failed: {0}")]
    Rejected(String),
}

/// A single named remote procedure bound to its transport.
///
/// Invokers make no idempotency promise; replaying after a partial failure may
/// apply the effect twice unless the remote side deduplicates.
#[async_trait]
pub trait RemoteInvoker: Send + Sync {
    async fn invoke(&self, arguments: &Arguments) -> Result<Value, RemoteError>;
}

/// Adapter turning an async closure into a [`RemoteInvoker`].
pub struct FnInvoker<F> {
    f: F,
}

/// Wrap `f` so it can be registered in a router or gated.
///
/// ```rust,ignore
/// let ping = invoker_fn(|_args| async { Ok(serde_json::json!("pong")) });
/// ```
pub fn invoker_fn<F, Fut>(f: F) -> FnInvoker<F>
where
    F: Fn(Arguments) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RemoteError>> + Send,
{
    FnInvoker { f }
}

#[async_trait]
impl<F, Fut> RemoteInvoker for FnInvoker<F>
where
    F: Fn(Arguments) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RemoteError>> + Send,
{
    async fn invoke(&self, arguments: &Arguments) -> Result<Value, RemoteError> {
        (self.f)(arguments.clone()).await
    }
}

/// HTTP client for the remote authoritative store.
///
/// Every procedure is exposed as `POST {base_url}/rpc/{operation_name}` taking
/// the argument bag as the JSON body.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    user_agent: String,
}

impl ApiClient {
    pub fn new(base_url: String) -> Result<Self, RemoteError> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: String, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url,
            api_key: None,
            user_agent: generate_user_agent(None),
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    /// Identify the front end in the User-Agent header
    pub fn with_client(mut self, client: Option<&str>) -> Self {
        self.user_agent = generate_user_agent(client);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn procedure_url(&self, operation_name: &str) -> String {
        format!("{}/rpc/{}", self.base_url.trim_end_matches('/'), operation_name)
    }

    /// Invoke a named remote procedure with an argument bag
    pub async fn call(&self, operation_name: &str, arguments: &Arguments) -> Result<Value, RemoteError> {
        let url = self.procedure_url(operation_name);
        tracing::debug!(operation_name, url = %url, "Calling remote procedure");

        let mut request_builder = self
            .client
            .post(&url)
            .header("User-Agent", &self.user_agent)
            .json(arguments);
        if let Some(ref api_key) = self.api_key {
            request_builder = request_builder.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request_builder.send().await?;
        let response = self.handle_response(response).await?;

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&body).map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn handle_response(&self, response: Response) -> Result<Response, RemoteError> {
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        let error_body = response.text().await.unwrap_or_default();

        match status.as_u16() {
            401 => Err(RemoteError::Auth("Invalid API key".to_string())),
            403 => Err(RemoteError::Auth("Access denied".to_string())),
            429 => Err(RemoteError::RateLimit("Rate limit exceeded".to_string())),
            400..=499 => Err(RemoteError::Api(format!("Client error: {}", status), error_body)),
            500..=599 => Err(RemoteError::Api(format!("Server error: {}", status), error_body)),
            _ => Err(RemoteError::Api(format!("Unexpected status: {}", status), error_body)),
        }
    }

    /// Check network connectivity by attempting to reach the API server
    pub async fn check_connectivity(&self) -> bool {
        let url = format!("{}/", self.base_url.trim_end_matches('/'));

        match self.client.head(&url).send().await {
            Ok(response) => {
                // Any response, even 4xx/5xx, means the server is reachable
                tracing::debug!(status = %response.status(), "Connectivity check successful");
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "Connectivity check failed");
                false
            }
        }
    }

    /// Bind one procedure name to this client
    pub fn procedure(&self, operation_name: &str) -> RemoteProcedure {
        RemoteProcedure {
            client: self.clone(),
            operation_name: operation_name.to_string(),
        }
    }
}

/// A remote procedure bound to an [`ApiClient`].
#[derive(Debug, Clone)]
pub struct RemoteProcedure {
    client: ApiClient,
    operation_name: String,
}

#[async_trait]
impl RemoteInvoker for RemoteProcedure {
    async fn invoke(&self, arguments: &Arguments) -> Result<Value, RemoteError> {
        self.client.call(&self.operation_name, arguments).await
    }
}
