use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use sparkq_db::models::queue::Queue;
use sparkq_db::models::task::{Task, TaskWithQueue};
use sparkq_db::pagination::Page;
use sparkq_utils::response::ApiResponse;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiClientError {
    #[error("request to {url} failed: {source}")]
    Transport { url: String, source: reqwest::Error },
    #[error("{code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
    #[error("malformed response from {url}")]
    Malformed { url: String },
}

impl ApiClientError {
    /// Worth retrying: the wire failed, or the server said Busy.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiClientError::Transport { .. } => true,
            ApiClientError::Api { status, .. } => *status == 503,
            ApiClientError::Malformed { .. } => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiClientError::Api { status: 404, .. })
    }
}

/// Typed client for the sparkq REST surface, used by the queue runner and
/// the CLI commands that address a running server.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn health(&self) -> Result<Value, ApiClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| ApiClientError::Transport {
                url: url.clone(),
                source,
            })?;
        response
            .json()
            .await
            .map_err(|_| ApiClientError::Malformed { url })
    }

    pub async fn get_queue(&self, queue_id: &str) -> Result<Queue, ApiClientError> {
        self.get(&format!("/api/queues/{queue_id}")).await
    }

    /// Head of the queue: oldest queued task, or None when it is drained.
    pub async fn oldest_queued(&self, queue_id: &str) -> Result<Option<TaskWithQueue>, ApiClientError> {
        let page: Page<TaskWithQueue> = self
            .get(&format!(
                "/api/tasks?queue_id={queue_id}&status=queued&limit=1&sort_by=created_at&sort_dir=asc"
            ))
            .await?;
        Ok(page.items.into_iter().next())
    }

    pub async fn claim(&self, task_id: &str) -> Result<Task, ApiClientError> {
        self.post(&format!("/api/tasks/{task_id}/claim"), &json!({}))
            .await
    }

    pub async fn complete(
        &self,
        task_id: &str,
        result: &Value,
        stdout: Option<&str>,
        stderr: Option<&str>,
    ) -> Result<Task, ApiClientError> {
        self.post(
            &format!("/api/tasks/{task_id}/complete"),
            &json!({ "result": result, "stdout": stdout, "stderr": stderr }),
        )
        .await
    }

    pub async fn fail(
        &self,
        task_id: &str,
        error: &str,
        stdout: Option<&str>,
        stderr: Option<&str>,
    ) -> Result<Task, ApiClientError> {
        self.post(
            &format!("/api/tasks/{task_id}/fail"),
            &json!({ "error": error, "stdout": stdout, "stderr": stderr }),
        )
        .await
    }

    pub async fn reload(&self) -> Result<Value, ApiClientError> {
        self.post("/api/reload", &json!({})).await
    }

    pub async fn shutdown(&self) -> Result<Value, ApiClientError> {
        self.post("/api/shutdown", &json!({})).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiClientError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| ApiClientError::Transport {
                url: url.clone(),
                source,
            })?;
        Self::decode(url, response).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, ApiClientError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|source| ApiClientError::Transport {
                url: url.clone(),
                source,
            })?;
        Self::decode(url, response).await
    }

    async fn decode<T: DeserializeOwned>(
        url: String,
        response: reqwest::Response,
    ) -> Result<T, ApiClientError> {
        let status = response.status().as_u16();
        let envelope: ApiResponse<T> = response
            .json()
            .await
            .map_err(|_| ApiClientError::Malformed { url: url.clone() })?;

        if let Some(data) = envelope.data {
            return Ok(data);
        }
        match envelope.error {
            Some(err) => Err(ApiClientError::Api {
                status,
                code: err.code,
                message: err.message,
            }),
            None => Err(ApiClientError::Malformed { url }),
        }
    }
}
