//! Queue control: producer entry points, user actions and observation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voxrun_core::{JobStats, QueueTab, Task, TaskId, TaskKind, TaskStatus};

use crate::channel::ProgressHub;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::preset::CleaningOptions;
use crate::reconcile::{PollReport, QueueStreamSync, Reconciler};
use crate::registry::{RegistryEvent, TaskRegistry};
use crate::service::{ChainStep, CleaningRequest, SubmitRequest, TaskService};

/// Callbacks for following one task to completion.
#[async_trait]
pub trait TaskObserver: Send + Sync {
    /// Progress changed.
    async fn on_progress(&self, _fraction: f64, _message: &str) {}

    /// The task completed or was cancelled.
    async fn on_done(&self, _task: &Task) {}

    /// The task failed.
    async fn on_error(&self, _message: &str) {}
}

struct Silent;

impl TaskObserver for Silent {}

/// Front door for producers and for the queue view.
pub struct QueueController {
    config: ClientConfig,
    service: Arc<dyn TaskService>,
    registry: Arc<TaskRegistry>,
    hub: ProgressHub,
    stats: Arc<watch::Sender<JobStats>>,
    expanded: Mutex<HashSet<TaskId>>,
}

impl QueueController {
    pub fn new(config: ClientConfig, service: Arc<dyn TaskService>) -> Self {
        let registry = Arc::new(TaskRegistry::new().with_retention(config.retention));
        let hub = ProgressHub::new(Arc::clone(&service), Arc::clone(&registry))
            .with_verify_on_disconnect(config.verify_on_disconnect);
        let (stats, _) = watch::channel(JobStats::default());

        Self {
            config,
            service,
            registry,
            hub,
            stats: Arc::new(stats),
            expanded: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &ProgressHub {
        &self.hub
    }

    pub fn service(&self) -> &Arc<dyn TaskService> {
        &self.service
    }

    /// Latest stats reported by the service.
    pub fn stats(&self) -> JobStats {
        *self.stats.borrow()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<JobStats> {
        self.stats.subscribe()
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            Arc::clone(&self.service),
            Arc::clone(&self.registry),
            self.hub.clone(),
            Arc::clone(&self.stats),
            self.config.poll_interval,
            self.config.list_limit,
        )
    }

    pub fn queue_sync(&self) -> QueueStreamSync {
        QueueStreamSync::new(
            Arc::clone(&self.service),
            Arc::clone(&self.registry),
            self.hub.clone(),
            Arc::clone(&self.stats),
        )
    }

    /// Start the poller and the queue stream follower.
    pub fn spawn_background(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            self.reconciler().spawn(shutdown.clone()),
            self.queue_sync().spawn(shutdown, self.config.poll_interval),
        ]
    }

    // ---- producers ----

    /// Submit a task with default priority and no dependencies.
    pub async fn create_task(&self, kind: TaskKind, payload: Value) -> Result<TaskId, ClientError> {
        self.submit(SubmitRequest::new(kind, payload)).await
    }

    /// Register a task, submit it and open its progress channel.
    ///
    /// The task is registered before the service is called; if submission
    /// fails it stays in the registry as failed.
    pub async fn submit(&self, request: SubmitRequest) -> Result<TaskId, ClientError> {
        let local = self
            .registry
            .create(
                request.kind,
                request.payload,
                request.dependencies,
                request.priority,
            )
            .await;

        match self.service.submit(&SubmitRequest::from(&local)).await {
            Ok(remote) => Ok(self.adopt(&local.id, remote).await?),
            Err(e) => {
                self.registry.fail(&local.id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Submit dependent steps; each waits for the one before it.
    pub async fn submit_chain(&self, steps: Vec<ChainStep>) -> Result<Vec<TaskId>, ClientError> {
        let mut locals: Vec<Task> = Vec::with_capacity(steps.len());
        for step in &steps {
            let dependencies = locals.last().map(|t| vec![t.id.clone()]).unwrap_or_default();
            let priority = step.priority.unwrap_or(voxrun_core::DEFAULT_PRIORITY);
            let task = self
                .registry
                .create(step.kind, step.payload.clone(), dependencies, priority)
                .await;
            locals.push(task);
        }

        let remotes = match self.service.submit_chain(&steps).await {
            Ok(remotes) => remotes,
            Err(e) => {
                for local in &locals {
                    self.registry.fail(&local.id, &e.to_string()).await;
                }
                return Err(e);
            }
        };

        let mut ids = Vec::with_capacity(remotes.len());
        let mut remotes = remotes.into_iter();
        for local in &locals {
            match remotes.next() {
                Some(remote) => ids.push(self.adopt(&local.id, remote).await?),
                None => {
                    self.registry
                        .fail(&local.id, "step not accepted by service")
                        .await;
                }
            }
        }
        info!(steps = ids.len(), "Chain submitted");
        Ok(ids)
    }

    /// Start a remote cleaning task.
    pub async fn submit_cleaning(&self, text: &str, options: &CleaningOptions) -> Result<TaskId, ClientError> {
        let payload = json!({ "preset": options.preset.as_str(), "chars": text.chars().count() });
        let local = self
            .registry
            .create(TaskKind::Cleaning, payload, Vec::new(), voxrun_core::DEFAULT_PRIORITY)
            .await;

        match self
            .service
            .submit_cleaning(&CleaningRequest::new(text, options))
            .await
        {
            Ok(service_id) => {
                let status = self.registry.rebind(&local.id, service_id.clone()).await?;
                if status == TaskStatus::Cancelled {
                    self.cancel_after_submit(&service_id).await;
                } else {
                    self.hub.subscribe(service_id.clone(), TaskKind::Cleaning);
                }
                Ok(service_id)
            }
            Err(e) => {
                self.registry.fail(&local.id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Start following a task created elsewhere.
    ///
    /// Fetches the service record, registers it and opens its progress
    /// channel while it is still running.
    pub async fn track(&self, id: &TaskId) -> Result<Task, ClientError> {
        let remote = self.service.get(id).await?;
        let kind = remote.kind;
        let active = !remote.is_terminal();
        self.registry.reconcile(remote).await;
        if active && kind.stream_route().is_some() {
            self.hub.subscribe(id.clone(), kind);
        }
        self.registry
            .get(id)
            .await
            .ok_or_else(|| ClientError::NotFound(id.to_string()))
    }

    async fn adopt(&self, provisional: &TaskId, remote: Task) -> Result<TaskId, ClientError> {
        let id = remote.id.clone();
        let kind = remote.kind;
        let status = self.registry.rebind(provisional, id.clone()).await?;
        self.registry.reconcile(remote).await;
        if status == TaskStatus::Cancelled {
            self.cancel_after_submit(&id).await;
        } else if kind.stream_route().is_some() {
            self.hub.subscribe(id.clone(), kind);
        }
        Ok(id)
    }

    /// The user cancelled while the submit was in flight; forward the
    /// cancel now that the service id is known.
    async fn cancel_after_submit(&self, id: &TaskId) {
        info!(task_id = %id, "Task cancelled during submission");
        let still_active = self
            .registry
            .get(id)
            .await
            .is_some_and(|task| !task.is_terminal());
        if still_active {
            // The service id was already registered by the queue stream.
            if let Err(e) = self.registry.request_cancel(id).await {
                debug!(task_id = %id, error = %e, "Local cancel after submit rejected");
            }
        }
        self.spawn_remote_cancel(id.clone());
    }

    fn spawn_remote_cancel(&self, id: TaskId) {
        let service = Arc::clone(&self.service);
        tokio::spawn(async move {
            if let Err(e) = service.cancel(&id).await {
                warn!(task_id = %id, error = %e, "Remote cancel failed");
            }
        });
    }

    // ---- observing ----

    /// Follow `id` until it is terminal, reporting through `observer`.
    ///
    /// Returns the terminal task, whatever its outcome.
    pub async fn observe(&self, id: &TaskId, observer: &dyn TaskObserver) -> Result<Task, ClientError> {
        let mut events = self.registry.subscribe();
        let mut id = id.clone();

        let current = self
            .registry
            .get(&id)
            .await
            .ok_or_else(|| ClientError::NotFound(id.to_string()))?;
        if let Some(done) = report(&current, observer).await {
            return Ok(done);
        }

        loop {
            match events.recv().await {
                Ok(RegistryEvent::Updated(task)) | Ok(RegistryEvent::Created(task)) if task.id == id => {
                    if let Some(done) = report(&task, observer).await {
                        return Ok(done);
                    }
                }
                Ok(RegistryEvent::Rebound { from, to }) if from == id => {
                    debug!(from = %from, to = %to, "Observed task rebound");
                    id = to;
                }
                Ok(RegistryEvent::Removed(removed)) if removed == id => {
                    return Err(ClientError::NotFound(id.to_string()));
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(task_id = %id, skipped, "Observer lagged, re-reading task");
                    let current = self
                        .registry
                        .get(&id)
                        .await
                        .ok_or_else(|| ClientError::NotFound(id.to_string()))?;
                    if let Some(done) = report(&current, observer).await {
                        return Ok(done);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(ClientError::ConnectionLost),
            }
        }
    }

    /// Wait for `id` to reach a terminal state.
    pub async fn wait(&self, id: &TaskId) -> Result<Task, ClientError> {
        self.observe(id, &Silent).await
    }

    // ---- user actions ----

    /// Cancel a task.
    ///
    /// The registry changes immediately; the remote cancel runs in the
    /// background and a failure is only logged.
    pub async fn cancel(&self, id: &TaskId) -> Result<(), ClientError> {
        self.registry.request_cancel(id).await?;
        self.hub.close(id);

        // A provisional task is cancelled remotely once its submit returns.
        if !id.is_provisional() {
            self.spawn_remote_cancel(id.clone());
        }
        Ok(())
    }

    pub async fn pause(&self, id: &TaskId) -> Result<(), ClientError> {
        self.service.pause(id).await?;
        if let Err(e) = self.registry.pause(id).await {
            debug!(task_id = %id, error = %e, "Local pause rejected, adopting service state");
            self.resync(id).await?;
        }
        Ok(())
    }

    pub async fn resume(&self, id: &TaskId) -> Result<(), ClientError> {
        self.service.resume(id).await?;
        if let Err(e) = self.registry.resume(id).await {
            debug!(task_id = %id, error = %e, "Local resume rejected, adopting service state");
            self.resync(id).await?;
        }
        Ok(())
    }

    /// Delete a terminal task here and on the service.
    pub async fn delete(&self, id: &TaskId) -> Result<(), ClientError> {
        let task = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| ClientError::NotFound(id.to_string()))?;
        task.ensure_deletable()?;

        if !id.is_provisional() {
            self.service.delete(id).await?;
        }
        self.registry.delete(id).await?;
        self.expanded().remove(id);
        Ok(())
    }

    /// Reorder pending tasks; rolled back if the service rejects it.
    pub async fn reorder(&self, ids: &[TaskId]) -> Result<(), ClientError> {
        let snapshot = self.registry.reorder(ids).await?;
        if let Err(e) = self.service.reorder(ids).await {
            warn!(error = %e, "Reorder rejected by service, rolling back");
            self.registry.restore(snapshot).await;
            return Err(e);
        }
        Ok(())
    }

    /// Poll the service once.
    pub async fn refresh(&self) -> Result<PollReport, ClientError> {
        self.reconciler().poll_once().await
    }

    /// Remove terminal tasks here and on the service.
    pub async fn clear_completed(&self) -> Result<u64, ClientError> {
        let cleared = self.service.clear_completed().await?;
        let local = self.registry.clear_terminal().await;
        info!(cleared, local, "Cleared finished tasks");
        Ok(cleared)
    }

    async fn resync(&self, id: &TaskId) -> Result<(), ClientError> {
        let remote = self.service.get(id).await?;
        self.registry.reconcile(remote).await;
        Ok(())
    }

    // ---- view ----

    /// Tasks on `tab` in display order.
    pub async fn list(&self, tab: QueueTab) -> Vec<Task> {
        self.registry.list(Some(tab)).await
    }

    /// Badge counts per tab, from the registry.
    pub async fn tab_counts(&self) -> Vec<(QueueTab, u64)> {
        let stats = self.registry.stats().await;
        QueueTab::all()
            .iter()
            .map(|tab| (*tab, stats.count_for(*tab)))
            .collect()
    }

    fn expanded(&self) -> MutexGuard<'_, HashSet<TaskId>> {
        self.expanded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Toggle the detail view of a task. Returns the new state.
    pub fn toggle_expanded(&self, id: &TaskId) -> bool {
        let mut expanded = self.expanded();
        if expanded.remove(id) {
            false
        } else {
            expanded.insert(id.clone());
            true
        }
    }

    pub fn is_expanded(&self, id: &TaskId) -> bool {
        self.expanded().contains(id)
    }
}

async fn report(task: &Task, observer: &dyn TaskObserver) -> Option<Task> {
    match task.status {
        TaskStatus::Completed | TaskStatus::Cancelled => {
            observer.on_done(task).await;
            Some(task.clone())
        }
        TaskStatus::Failed => {
            observer
                .on_error(task.error_message.as_deref().unwrap_or("Task failed"))
                .await;
            Some(task.clone())
        }
        TaskStatus::Pending | TaskStatus::Running | TaskStatus::Paused => {
            observer
                .on_progress(task.progress, &task.progress_message)
                .await;
            None
        }
    }
}
