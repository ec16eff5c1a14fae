//! The remote task service seam.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use voxrun_core::{JobStats, ProgressEvent, QueueEvent, Task, TaskId, TaskKind, TaskStatus, DEFAULT_PRIORITY};

use crate::error::ClientError;
use crate::preset::CleaningOptions;

/// Per-task progress events, in the order the service sent them.
pub type ProgressStream = Pin<Box<dyn Stream<Item = Result<ProgressEvent, ClientError>> + Send>>;

/// Process-wide queue events.
pub type QueueStream = Pin<Box<dyn Stream<Item = Result<QueueEvent, ClientError>> + Send>>;

/// Body of a task submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitRequest {
    #[serde(rename = "job_type")]
    pub kind: TaskKind,
    pub payload: Value,
    pub priority: i32,
    pub dependencies: Vec<TaskId>,
}

impl SubmitRequest {
    pub fn new(kind: TaskKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            priority: DEFAULT_PRIORITY,
            dependencies: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<TaskId>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

impl From<&Task> for SubmitRequest {
    fn from(task: &Task) -> Self {
        Self {
            kind: task.kind,
            payload: task.payload.clone(),
            priority: task.priority,
            dependencies: task.dependencies.clone(),
        }
    }
}

/// One step of a chain; each step depends on the one before it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainStep {
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

impl ChainStep {
    pub fn new(kind: TaskKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            priority: None,
        }
    }
}

/// Filter for listing tasks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListFilter {
    pub status: Option<TaskStatus>,
    pub kind: Option<TaskKind>,
    pub limit: Option<u32>,
}

/// A page of tasks.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobList {
    #[serde(default)]
    pub jobs: Vec<Task>,
    #[serde(default)]
    pub total: u64,
}

/// Body of a remote cleaning request.
#[derive(Debug, Clone, Serialize)]
pub struct CleaningRequest<'a> {
    pub text: &'a str,
    pub preset: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_prompt: Option<&'a str>,
}

impl<'a> CleaningRequest<'a> {
    pub fn new(text: &'a str, options: &'a CleaningOptions) -> Self {
        Self {
            text,
            preset: options.preset.as_str(),
            custom_prompt: options.custom_prompt.as_deref(),
        }
    }
}

/// Remote service that executes tasks and reports on them.
///
/// Implement this trait to point the client at a different backend.
#[async_trait]
pub trait TaskService: Send + Sync {
    /// Submit a task; the returned record carries the service-assigned id.
    async fn submit(&self, request: &SubmitRequest) -> Result<Task, ClientError>;

    /// Submit dependent steps; returned in execution order.
    async fn submit_chain(&self, steps: &[ChainStep]) -> Result<Vec<Task>, ClientError>;

    /// Fetch the authoritative record of one task.
    async fn get(&self, id: &TaskId) -> Result<Task, ClientError>;

    async fn list(&self, filter: &ListFilter) -> Result<JobList, ClientError>;

    async fn stats(&self) -> Result<JobStats, ClientError>;

    async fn cancel(&self, id: &TaskId) -> Result<(), ClientError>;

    async fn pause(&self, id: &TaskId) -> Result<(), ClientError>;

    async fn resume(&self, id: &TaskId) -> Result<(), ClientError>;

    async fn delete(&self, id: &TaskId) -> Result<(), ClientError>;

    /// Persist a new pending order; earlier ids run first.
    async fn reorder(&self, ids: &[TaskId]) -> Result<(), ClientError>;

    /// Remove terminal tasks. Returns how many were removed.
    async fn clear_completed(&self) -> Result<u64, ClientError>;

    /// Start a cleaning task and return its id.
    async fn submit_cleaning(&self, request: &CleaningRequest<'_>) -> Result<TaskId, ClientError>;

    /// Open the progress channel of one task.
    async fn open_progress_stream(&self, id: &TaskId, kind: TaskKind) -> Result<ProgressStream, ClientError>;

    /// Open the process-wide queue stream.
    async fn open_queue_stream(&self) -> Result<QueueStream, ClientError>;
}
