use async_trait::async_trait;
use jobdash_core::{DiscoveryResponse, JobListParams, JobsResponse, PendingResponse, PipelineSnapshot};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("{}", describe_status(.status, .message))]
    Status { status: u16, message: Option<String> },
    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl GatewayError {
    /// The backend's own explanation, when the response carried one.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            GatewayError::Status {
                message: Some(message),
                ..
            } => Some(message.as_str()),
            _ => None,
        }
    }
}

fn describe_status(status: &u16, message: &Option<String>) -> String {
    match message {
        Some(message) => format!("server returned {status}: {message}"),
        None => format!("server returned {status}"),
    }
}

/// Request/response access to the backend. Reads return full snapshots;
/// mutating calls return the backend's acknowledgement verbatim.
#[async_trait]
pub trait ActionGateway: Send + Sync {
    async fn list_jobs(&self, params: &JobListParams) -> Result<JobsResponse, GatewayError>;
    async fn retry_job(&self, id: &str) -> Result<Value, GatewayError>;
    async fn pipeline_status(&self) -> Result<PipelineSnapshot, GatewayError>;
    async fn list_pending(&self, limit: u32) -> Result<PendingResponse, GatewayError>;
    async fn approve_job(&self, id: &str) -> Result<Value, GatewayError>;
    async fn reject_job(&self, id: &str, reason: &str) -> Result<Value, GatewayError>;
    async fn discover(&self) -> Result<DiscoveryResponse, GatewayError>;
}

#[derive(Clone)]
pub struct HttpGateway {
    base_url: Url,
    http: reqwest::Client,
}

impl HttpGateway {
    pub fn new(base_url: Url, request_timeout: Duration) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| GatewayError::Transport(err.to_string()))?;
        Ok(Self { base_url, http })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn get<T, Q>(&self, path: &str, query: &Q) -> Result<T, GatewayError>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let url = self.endpoint(path);
        debug!(event = "gateway_request", method = "GET", url = %url);
        let response = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|err| GatewayError::Transport(err.to_string()))?;
        read_json(response).await
    }

    async fn post<T>(&self, path: &str, body: Option<Value>) -> Result<T, GatewayError>
    where
        T: DeserializeOwned,
    {
        let url = self.endpoint(path);
        debug!(event = "gateway_request", method = "POST", url = %url);
        let mut request = self.http.post(&url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|err| GatewayError::Transport(err.to_string()))?;
        read_json(response).await
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, GatewayError> {
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| GatewayError::Transport(err.to_string()))?;
    if !status.is_success() {
        return Err(status_error(status, &bytes));
    }
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return serde_json::from_value(Value::Null)
            .map_err(|err| GatewayError::Decode(err.to_string()));
    }
    serde_json::from_slice(&bytes).map_err(|err| GatewayError::Decode(err.to_string()))
}

fn status_error(status: StatusCode, body: &[u8]) -> GatewayError {
    GatewayError::Status {
        status: status.as_u16(),
        message: server_message(body),
    }
}

/// Pulls `message`, `detail` or `error` out of a JSON error body, falling
/// back to the raw text.
pub fn server_message(body: &[u8]) -> Option<String> {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        for key in ["message", "detail", "error"] {
            if let Some(Value::String(text)) = value.get(key) {
                if !text.trim().is_empty() {
                    return Some(text.trim().to_string());
                }
            }
        }
        return None;
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(text.chars().take(MAX_ERROR_BODY_CHARS).collect())
}

#[async_trait]
impl ActionGateway for HttpGateway {
    async fn list_jobs(&self, params: &JobListParams) -> Result<JobsResponse, GatewayError> {
        self.get("jobs", params).await
    }

    async fn retry_job(&self, id: &str) -> Result<Value, GatewayError> {
        self.post(&format!("jobs/{id}/retry"), None).await
    }

    async fn pipeline_status(&self) -> Result<PipelineSnapshot, GatewayError> {
        self.get("pipeline/status", &()).await
    }

    async fn list_pending(&self, limit: u32) -> Result<PendingResponse, GatewayError> {
        self.get("pending", &[("limit", limit)]).await
    }

    async fn approve_job(&self, id: &str) -> Result<Value, GatewayError> {
        self.post(&format!("pending/{id}/approve"), None).await
    }

    async fn reject_job(&self, id: &str, reason: &str) -> Result<Value, GatewayError> {
        self.post(&format!("pending/{id}/reject"), Some(json!({ "reason": reason })))
            .await
    }

    async fn discover(&self) -> Result<DiscoveryResponse, GatewayError> {
        self.post("discovery/discover", None).await
    }
}
