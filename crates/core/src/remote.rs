//! AIDIS Service Client
//!
//! Manages the connection to the downstream knowledge/task service and
//! executes its named operations. Every operation shares one request shape:
//! `POST <base>/mcp/tools/<operation>` with `{ "arguments": { ... } }`, where
//! the arguments always carry the caller identity field. Transport failures
//! and service rejections are both folded into a [`ServiceCallResult`], so
//! callers handle a single result shape.

use crate::schema::{CONTEXT_STORE, CreateTaskArgs, StoreContextArgs, TASK_CREATE};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Path prefix under which the service exposes its operations.
pub const OPERATION_PATH: &str = "mcp/tools";
/// Path of the lightweight health check used by `connect`.
pub const HEALTH_PATH: &str = "healthz";
/// Payload field identifying this client on every call.
pub const IDENTITY_FIELD: &str = "clientId";

/// Operation names understood by the service.
pub mod operations {
    pub const PING: &str = "aidis_ping";
    pub const LIST: &str = "aidis_help";
    pub const STORE_CONTEXT: &str = super::CONTEXT_STORE;
    pub const CREATE_TASK: &str = super::TASK_CREATE;
}

/// Failure below the service protocol: the request never produced a usable answer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Not connected to AIDIS service")]
    NotConnected,
    #[error("Failed to connect to AIDIS after {attempts} attempt(s): {last_error}")]
    ConnectionFailed { attempts: u32, last_error: String },
}

/// The wire underneath [`RemoteServiceClient`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceTransport: Send + Sync {
    /// Succeeds when the service answers its health endpoint.
    async fn health_check(&self) -> Result<(), TransportError>;

    /// POSTs a JSON body to `path` (relative to the service base URL).
    async fn post(&self, path: &str, body: Value) -> Result<Value, TransportError>;
}

/// [`ServiceTransport`] over HTTP.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Creates a transport for `base_url` with a per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl ServiceTransport for HttpTransport {
    async fn health_check(&self) -> Result<(), TransportError> {
        let response = self.client.get(self.url(HEALTH_PATH)).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, TransportError> {
        let response = self.client.post(self.url(path)).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json::<Value>().await?)
    }
}

/// Connect-time retry schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total health-check attempts before giving up.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// `min(base_delay * 2^attempt, max_delay)`, without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// [`RetryPolicy::delay_for`] plus up to 10% random jitter.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        delay + delay.mul_f64(rand::random::<f64>() * 0.1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Outcome of a data-plane operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceCallResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ServiceCallResult {
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Response envelope returned by the service.
#[derive(Deserialize)]
struct ServiceResponse {
    #[serde(default)]
    success: bool,
    result: Option<Value>,
    error: Option<String>,
}

/// Client for the AIDIS service.
///
/// The connection is established explicitly with [`connect`](Self::connect)
/// and is never re-established behind a caller's back. State transitions take
/// `&mut self`; data-plane calls only need `&self`.
pub struct RemoteServiceClient {
    transport: Box<dyn ServiceTransport>,
    retry: RetryPolicy,
    client_id: String,
    state: ConnectionState,
}

impl RemoteServiceClient {
    pub fn new(
        transport: impl ServiceTransport + 'static,
        retry: RetryPolicy,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            transport: Box::new(transport),
            retry,
            client_id: client_id.into(),
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Verifies the service is reachable, retrying with exponential backoff.
    ///
    /// A no-op when already connected.
    #[instrument(skip(self), fields(max_attempts = self.retry.max_retries))]
    pub async fn connect(&mut self) -> Result<(), RemoteError> {
        if self.is_connected() {
            debug!("Already connected to AIDIS service");
            return Ok(());
        }

        let attempts = self.retry.max_retries.max(1);
        let mut last_error = String::new();
        for attempt in 0..attempts {
            match self.transport.health_check().await {
                Ok(()) => {
                    self.state = ConnectionState::Connected;
                    info!(attempt = attempt + 1, "Connected to AIDIS service");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "AIDIS health check failed");
                    last_error = e.to_string();
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.retry.jittered_delay(attempt)).await;
                    }
                }
            }
        }

        Err(RemoteError::ConnectionFailed {
            attempts,
            last_error,
        })
    }

    /// Marks the client disconnected. Idempotent; nothing is sent over the wire.
    pub fn disconnect(&mut self) {
        if self.is_connected() {
            info!("Disconnected from AIDIS service");
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Executes a named operation with the caller identity injected.
    #[instrument(skip(self, payload))]
    pub async fn execute(&self, operation: &str, mut payload: Map<String, Value>) -> ServiceCallResult {
        if !self.is_connected() {
            return ServiceCallResult::failure(RemoteError::NotConnected.to_string());
        }

        payload.insert(
            IDENTITY_FIELD.to_string(),
            Value::String(self.client_id.clone()),
        );
        let path = format!("{}/{}", OPERATION_PATH, operation);
        let body = json!({ "arguments": payload });

        match self.transport.post(&path, body).await {
            Ok(response) => match serde_json::from_value::<ServiceResponse>(response) {
                Ok(ServiceResponse {
                    success: true,
                    result,
                    ..
                }) => {
                    debug!("AIDIS operation succeeded");
                    ServiceCallResult::ok(result)
                }
                Ok(ServiceResponse { error, .. }) => {
                    let reason = error.unwrap_or_else(|| "no reason given".to_string());
                    warn!(%reason, "AIDIS rejected operation");
                    ServiceCallResult::failure(format!("AIDIS rejected {}: {}", operation, reason))
                }
                Err(e) => ServiceCallResult::failure(format!(
                    "Invalid response from AIDIS for {}: {}",
                    operation, e
                )),
            },
            Err(e) => {
                warn!(error = %e, "AIDIS request failed");
                ServiceCallResult::failure(format!("Request to AIDIS failed for {}: {}", operation, e))
            }
        }
    }

    pub async fn ping(&self) -> ServiceCallResult {
        self.execute(operations::PING, Map::new()).await
    }

    /// Stores a knowledge entry.
    pub async fn store_context(&self, args: &StoreContextArgs) -> ServiceCallResult {
        self.execute_typed(operations::STORE_CONTEXT, args).await
    }

    /// Creates a task.
    pub async fn create_task(&self, args: &CreateTaskArgs) -> ServiceCallResult {
        self.execute_typed(operations::CREATE_TASK, args).await
    }

    /// Lists the operations the service offers.
    pub async fn list_operations(&self) -> ServiceCallResult {
        self.execute(operations::LIST, Map::new()).await
    }

    async fn execute_typed<T: Serialize>(&self, operation: &str, args: &T) -> ServiceCallResult {
        match serde_json::to_value(args) {
            Ok(Value::Object(payload)) => self.execute(operation, payload).await,
            Ok(_) => ServiceCallResult::failure(format!("Payload for {} is not an object", operation)),
            Err(e) => ServiceCallResult::failure(format!(
                "Failed to serialize payload for {}: {}",
                operation, e
            )),
        }
    }
}
