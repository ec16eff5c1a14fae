//! HTTP implementation of [`TaskService`].

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use voxrun_core::{JobStats, ProgressEvent, QueueEvent, Task, TaskId, TaskKind};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::service::{
    ChainStep, CleaningRequest, JobList, ListFilter, ProgressStream, QueueStream, SubmitRequest,
    TaskService,
};
use crate::sse::{sse_frames, SseFrame};

/// Header carrying the session id on every request.
pub const SESSION_HEADER: &str = "X-Session-Id";

const QUEUE_PREFIX: &str = "/api/queue";

/// [`TaskService`] over the service's REST and SSE endpoints.
pub struct HttpTaskService {
    inner: reqwest::Client,
    base_url: String,
    session_id: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: Value,
}

#[derive(Deserialize)]
struct Cleared {
    #[serde(default)]
    cleared: u64,
}

#[derive(Deserialize)]
struct CleaningAccepted {
    task_id: TaskId,
}

impl HttpTaskService {
    /// Create a client for the service described by `config`.
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self {
            inner: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            session_id: config.session_id.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, url = %url, "HTTP request");
        self.inner
            .request(method, url)
            .header(SESSION_HEADER, &self.session_id)
    }

    /// Turn a non-success response into an error carrying the service detail.
    async fn check(response: Response, path: &str) -> Result<Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(ErrorBody {
                detail: Value::String(detail),
            }) => detail,
            Ok(ErrorBody { detail }) => detail.to_string(),
            Err(_) if body.is_empty() => path.to_string(),
            Err(_) => body,
        };

        if status == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(message));
        }
        Err(ClientError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        path: &str,
    ) -> Result<T, ClientError> {
        let response = Self::check(request.send().await?, path).await?;
        response
            .json()
            .await
            .map_err(|e| ClientError::Serialization(e.to_string()))
    }

    async fn send_empty(&self, request: RequestBuilder, path: &str) -> Result<(), ClientError> {
        Self::check(request.send().await?, path).await?;
        Ok(())
    }

    async fn post_action(&self, id: &TaskId, action: &str) -> Result<(), ClientError> {
        let path = format!("{}/jobs/{}/{}", QUEUE_PREFIX, id, action);
        self.send_empty(self.request(reqwest::Method::POST, &path), &path)
            .await
    }

    async fn open_sse(
        &self,
        path: &str,
    ) -> Result<impl Stream<Item = Result<SseFrame, ClientError>> + Send, ClientError> {
        let request = self
            .request(reqwest::Method::GET, path)
            .header(ACCEPT, "text/event-stream");
        let response = Self::check(request.send().await?, path).await?;
        Ok(sse_frames(Box::pin(response.bytes_stream())))
    }
}

#[async_trait]
impl TaskService for HttpTaskService {
    async fn submit(&self, request: &SubmitRequest) -> Result<Task, ClientError> {
        let path = format!("{}/submit", QUEUE_PREFIX);
        self.send_json(self.request(reqwest::Method::POST, &path).json(request), &path)
            .await
    }

    async fn submit_chain(&self, steps: &[ChainStep]) -> Result<Vec<Task>, ClientError> {
        let path = format!("{}/submit-chain", QUEUE_PREFIX);
        let body = serde_json::json!({ "steps": steps });
        self.send_json(self.request(reqwest::Method::POST, &path).json(&body), &path)
            .await
    }

    async fn get(&self, id: &TaskId) -> Result<Task, ClientError> {
        let path = format!("{}/jobs/{}", QUEUE_PREFIX, id);
        self.send_json(self.request(reqwest::Method::GET, &path), &path)
            .await
    }

    async fn list(&self, filter: &ListFilter) -> Result<JobList, ClientError> {
        let path = format!("{}/jobs", QUEUE_PREFIX);
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(status) = filter.status {
            query.push(("status", status.as_str().to_string()));
        }
        if let Some(kind) = filter.kind {
            query.push(("job_type", kind.as_str().to_string()));
        }
        if let Some(limit) = filter.limit {
            query.push(("limit", limit.to_string()));
        }
        self.send_json(self.request(reqwest::Method::GET, &path).query(&query), &path)
            .await
    }

    async fn stats(&self) -> Result<JobStats, ClientError> {
        let path = format!("{}/stats", QUEUE_PREFIX);
        self.send_json(self.request(reqwest::Method::GET, &path), &path)
            .await
    }

    async fn cancel(&self, id: &TaskId) -> Result<(), ClientError> {
        self.post_action(id, "cancel").await
    }

    async fn pause(&self, id: &TaskId) -> Result<(), ClientError> {
        self.post_action(id, "pause").await
    }

    async fn resume(&self, id: &TaskId) -> Result<(), ClientError> {
        self.post_action(id, "resume").await
    }

    async fn delete(&self, id: &TaskId) -> Result<(), ClientError> {
        let path = format!("{}/jobs/{}", QUEUE_PREFIX, id);
        self.send_empty(self.request(reqwest::Method::DELETE, &path), &path)
            .await
    }

    async fn reorder(&self, ids: &[TaskId]) -> Result<(), ClientError> {
        let path = format!("{}/reorder", QUEUE_PREFIX);
        self.send_empty(self.request(reqwest::Method::POST, &path).json(ids), &path)
            .await
    }

    async fn clear_completed(&self) -> Result<u64, ClientError> {
        let path = format!("{}/clear-completed", QUEUE_PREFIX);
        let cleared: Cleared = self
            .send_json(self.request(reqwest::Method::POST, &path), &path)
            .await?;
        Ok(cleared.cleared)
    }

    async fn submit_cleaning(&self, request: &CleaningRequest<'_>) -> Result<TaskId, ClientError> {
        let path = "/api/cleaning/process";
        let accepted: CleaningAccepted = self
            .send_json(self.request(reqwest::Method::POST, path).json(request), path)
            .await?;
        Ok(accepted.task_id)
    }

    async fn open_progress_stream(&self, id: &TaskId, kind: TaskKind) -> Result<ProgressStream, ClientError> {
        let route = kind
            .stream_route()
            .ok_or_else(|| ClientError::Stream(format!("{} tasks have no progress stream", kind)))?;
        let path = format!("/api/{}/stream/{}", route, id);
        let frames = self.open_sse(&path).await?;

        let events = frames.filter_map(|frame| async move {
            match frame {
                Ok(frame) => ProgressEvent::from_frame(&frame.event, &frame.data)
                    .map_err(ClientError::from)
                    .transpose(),
                Err(e) => Some(Err(e)),
            }
        });
        Ok(Box::pin(events))
    }

    async fn open_queue_stream(&self) -> Result<QueueStream, ClientError> {
        let path = format!("{}/stream", QUEUE_PREFIX);
        let frames = self.open_sse(&path).await?;

        let events = frames.filter_map(|frame| async move {
            match frame {
                Ok(frame) => QueueEvent::from_json(&frame.data)
                    .map_err(ClientError::from)
                    .transpose(),
                Err(e) => Some(Err(e)),
            }
        });
        Ok(Box::pin(events))
    }
}
