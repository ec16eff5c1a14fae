//! In-memory [`TaskService`] for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;
use voxrun_core::{CoreError, JobStats, ProgressEvent, QueueEvent, Task, TaskId, TaskKind};

use crate::error::ClientError;
use crate::service::{
    ChainStep, CleaningRequest, JobList, ListFilter, ProgressStream, QueueStream, SubmitRequest,
    TaskService,
};

type ProgressItem = Result<ProgressEvent, ClientError>;
type QueueItem = Result<QueueEvent, ClientError>;

/// Scriptable stand-in for the remote service.
#[derive(Default)]
pub struct FakeTaskService {
    tasks: Mutex<HashMap<TaskId, Task>>,
    progress: Mutex<HashMap<TaskId, mpsc::UnboundedReceiver<ProgressItem>>>,
    queue: Mutex<Option<mpsc::UnboundedReceiver<QueueItem>>>,
    failing: Mutex<HashSet<&'static str>>,
    calls: Mutex<Vec<String>>,
    next_id: AtomicU64,
    streams_opened: AtomicUsize,
    submit_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeTaskService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or replace a task record.
    pub async fn put(&self, task: Task) {
        self.tasks.lock().await.insert(task.id.clone(), task);
    }

    /// Script the progress stream of `id`; dropping the sender ends it.
    pub async fn progress_sender(&self, id: &TaskId) -> mpsc::UnboundedSender<ProgressItem> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.progress.lock().await.insert(id.clone(), rx);
        tx
    }

    /// Script the queue stream.
    pub async fn queue_sender(&self) -> mpsc::UnboundedSender<QueueItem> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.queue.lock().await = Some(rx);
        tx
    }

    /// Hold every later `submit` until the returned gate is notified.
    pub async fn hold_submit(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.submit_gate.lock().await = Some(Arc::clone(&gate));
        gate
    }

    /// Make every later call of `op` fail.
    pub async fn fail_on(&self, op: &'static str) {
        self.failing.lock().await.insert(op);
    }

    /// Calls made so far, as `"op id"` strings.
    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    pub fn streams_opened(&self) -> usize {
        self.streams_opened.load(Ordering::SeqCst)
    }

    async fn record(&self, op: &'static str, detail: impl std::fmt::Display) -> Result<(), ClientError> {
        self.calls.lock().await.push(format!("{} {}", op, detail));
        if self.failing.lock().await.contains(op) {
            return Err(ClientError::Status {
                status: 500,
                message: format!("{} failed", op),
            });
        }
        Ok(())
    }

    fn next_id(&self) -> TaskId {
        TaskId::new(format!("job-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn with_task<F>(&self, id: &TaskId, op: F) -> Result<(), ClientError>
    where
        F: FnOnce(&mut Task) -> Result<(), CoreError>,
    {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| ClientError::NotFound(format!("Job {} not found", id)))?;
        op(task).map_err(|e| ClientError::Status {
            status: 400,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl TaskService for FakeTaskService {
    async fn submit(&self, request: &SubmitRequest) -> Result<Task, ClientError> {
        let gate = self.submit_gate.lock().await.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.record("submit", request.kind).await?;
        let task = Task::new(request.kind, request.payload.clone())
            .with_id(self.next_id())
            .with_priority(request.priority)
            .with_dependencies(request.dependencies.clone());
        self.put(task.clone()).await;
        Ok(task)
    }

    async fn submit_chain(&self, steps: &[ChainStep]) -> Result<Vec<Task>, ClientError> {
        self.record("submit_chain", steps.len()).await?;
        let mut created: Vec<Task> = Vec::new();
        for step in steps {
            let mut task = Task::new(step.kind, step.payload.clone())
                .with_id(self.next_id())
                .with_priority(step.priority.unwrap_or(voxrun_core::DEFAULT_PRIORITY));
            if let Some(previous) = created.last() {
                task = task.with_dependencies(vec![previous.id.clone()]);
            }
            if let Some(first) = created.first() {
                task = task.with_parent(first.id.clone());
            }
            created.push(task);
        }
        for task in &created {
            self.put(task.clone()).await;
        }
        Ok(created)
    }

    async fn get(&self, id: &TaskId) -> Result<Task, ClientError> {
        self.tasks
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("Job {} not found", id)))
    }

    async fn list(&self, filter: &ListFilter) -> Result<JobList, ClientError> {
        self.record("list", "").await?;
        let tasks = self.tasks.lock().await;
        let mut jobs: Vec<Task> = tasks
            .values()
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .filter(|t| filter.kind.map_or(true, |k| t.kind == k))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| (a.priority, a.created_at).cmp(&(b.priority, b.created_at)));
        let total = jobs.len() as u64;
        if let Some(limit) = filter.limit {
            jobs.truncate(limit as usize);
        }
        Ok(JobList { jobs, total })
    }

    async fn stats(&self) -> Result<JobStats, ClientError> {
        Ok(JobStats::from_tasks(self.tasks.lock().await.values()))
    }

    async fn cancel(&self, id: &TaskId) -> Result<(), ClientError> {
        self.record("cancel", id).await?;
        self.with_task(id, Task::cancel).await
    }

    async fn pause(&self, id: &TaskId) -> Result<(), ClientError> {
        self.record("pause", id).await?;
        self.with_task(id, Task::pause).await
    }

    async fn resume(&self, id: &TaskId) -> Result<(), ClientError> {
        self.record("resume", id).await?;
        self.with_task(id, Task::resume).await
    }

    async fn delete(&self, id: &TaskId) -> Result<(), ClientError> {
        self.record("delete", id).await?;
        self.tasks.lock().await.remove(id);
        Ok(())
    }

    async fn reorder(&self, ids: &[TaskId]) -> Result<(), ClientError> {
        self.record("reorder", ids.len()).await?;
        for (position, id) in ids.iter().enumerate() {
            self.with_task(id, |task| task.set_rank(position)).await?;
        }
        Ok(())
    }

    async fn clear_completed(&self) -> Result<u64, ClientError> {
        self.record("clear_completed", "").await?;
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|_, task| !task.is_terminal());
        Ok((before - tasks.len()) as u64)
    }

    async fn submit_cleaning(&self, request: &CleaningRequest<'_>) -> Result<TaskId, ClientError> {
        self.record("submit_cleaning", request.preset).await?;
        let id = self.next_id();
        let task = Task::new(TaskKind::Cleaning, serde_json::json!({ "text": request.text }))
            .with_id(id.clone());
        self.put(task).await;
        Ok(id)
    }

    async fn open_progress_stream(&self, id: &TaskId, _kind: TaskKind) -> Result<ProgressStream, ClientError> {
        self.streams_opened.fetch_add(1, Ordering::SeqCst);
        let rx = self
            .progress
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| ClientError::NotFound(format!("no stream for {}", id)))?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn open_queue_stream(&self) -> Result<QueueStream, ClientError> {
        let rx = self
            .queue
            .lock()
            .await
            .take()
            .ok_or_else(|| ClientError::Stream("queue stream unavailable".to_string()))?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
