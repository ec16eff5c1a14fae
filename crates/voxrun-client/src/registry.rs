//! In-memory registry of every Task the client knows about.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use voxrun_core::{CoreError, JobStats, QueueTab, Task, TaskId, TaskKind, TaskStatus, Transition};

const EVENT_CAPACITY: usize = 256;

/// Change notification published after every applied mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// A task was registered.
    Created(Task),
    /// A task changed; carries the new state.
    Updated(Task),
    /// A provisional id was replaced by the service id.
    Rebound { from: TaskId, to: TaskId },
    /// A task was removed.
    Removed(TaskId),
}

/// Priorities of a set of tasks before a reorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrioritySnapshot {
    priorities: Vec<(TaskId, i32)>,
}

impl PrioritySnapshot {
    pub fn len(&self) -> usize {
        self.priorities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.priorities.is_empty()
    }
}

/// Authoritative in-memory Task set.
///
/// Every mutation goes through one of the methods below under the
/// registry's write lock.
pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskId, Task>>,
    events: broadcast::Sender<RegistryEvent>,
    retention: chrono::Duration,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tasks: RwLock::new(HashMap::new()),
            events,
            retention: chrono::Duration::days(voxrun_core::DEFAULT_RETENTION_DAYS),
        }
    }

    /// Set how long tasks created here are retained once terminal.
    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Register a new pending task under a provisional id.
    pub async fn create(
        &self,
        kind: TaskKind,
        payload: Value,
        dependencies: Vec<TaskId>,
        priority: i32,
    ) -> Task {
        let task = Task::new(kind, payload)
            .with_dependencies(dependencies)
            .with_priority(priority)
            .with_retention(self.retention);

        self.tasks.write().await.insert(task.id.clone(), task.clone());
        info!(task_id = %task.id, kind = %kind, priority = task.priority, "Task registered");
        self.publish(RegistryEvent::Created(task.clone()));
        task
    }

    /// Register a task the service already knows about.
    pub async fn insert(&self, task: Task) -> Result<(), CoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(CoreError::DuplicateTask(task.id));
        }
        debug!(task_id = %task.id, status = %task.status, "Task inserted");
        tasks.insert(task.id.clone(), task.clone());
        drop(tasks);
        self.publish(RegistryEvent::Created(task));
        Ok(())
    }

    /// Re-key a provisional task under the id the service assigned.
    ///
    /// If the service id is already registered (the queue stream can
    /// announce a task before the submit call returns) the provisional
    /// entry is dropped in favour of it.
    ///
    /// Returns the status the provisional entry had when it was re-keyed.
    pub async fn rebind(&self, provisional: &TaskId, service_id: TaskId) -> Result<TaskStatus, CoreError> {
        let mut tasks = self.tasks.write().await;
        let mut task = tasks
            .remove(provisional)
            .ok_or_else(|| CoreError::TaskNotFound(provisional.clone()))?;
        let status = task.status;

        if tasks.contains_key(&service_id) {
            debug!(from = %provisional, to = %service_id, "Service id already registered, dropping provisional entry");
        } else {
            task.id = service_id.clone();
            tasks.insert(service_id.clone(), task);
        }
        drop(tasks);

        info!(from = %provisional, to = %service_id, "Task rebound to service id");
        self.publish(RegistryEvent::Rebound {
            from: provisional.clone(),
            to: service_id,
        });
        Ok(status)
    }

    /// Run `op` on one task and publish the result if it applied.
    async fn mutate<F>(&self, id: &TaskId, op_name: &'static str, op: F) -> Transition
    where
        F: FnOnce(&mut Task) -> Transition,
    {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(id) else {
            debug!(task_id = %id, op = op_name, "Ignoring event for unknown task");
            return Transition::Ignored("unknown task");
        };

        let transition = op(task);
        match transition {
            Transition::Applied => {
                let snapshot = task.clone();
                drop(tasks);
                self.publish(RegistryEvent::Updated(snapshot));
            }
            Transition::Ignored(reason) => {
                debug!(task_id = %id, op = op_name, reason, "Transition ignored");
            }
        }
        transition
    }

    /// Run a user action on one task.
    async fn act<F>(&self, id: &TaskId, op: F) -> Result<(), CoreError>
    where
        F: FnOnce(&mut Task) -> Result<(), CoreError>,
    {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| CoreError::TaskNotFound(id.clone()))?;

        if let Err(e) = op(task) {
            warn!(task_id = %id, error = %e, "Action rejected");
            return Err(e);
        }
        let snapshot = task.clone();
        drop(tasks);
        self.publish(RegistryEvent::Updated(snapshot));
        Ok(())
    }

    /// Record progress. Unknown or terminal tasks are left untouched.
    pub async fn apply_progress(&self, id: &TaskId, fraction: f64, message: &str) -> Transition {
        self.mutate(id, "progress", |task| task.apply_progress(fraction, message))
            .await
    }

    /// Complete a running or pending task.
    pub async fn complete(&self, id: &TaskId, result: Value) -> Transition {
        let transition = self
            .mutate(id, "complete", |task| task.complete(result))
            .await;
        if transition.is_applied() {
            info!(task_id = %id, "Task completed");
        }
        transition
    }

    /// Fail a non-terminal task.
    pub async fn fail(&self, id: &TaskId, message: &str) -> Transition {
        let transition = self.mutate(id, "fail", |task| task.fail(message)).await;
        if transition.is_applied() {
            warn!(task_id = %id, error = %message, "Task failed");
        }
        transition
    }

    /// Cancel a pending or running task immediately.
    pub async fn request_cancel(&self, id: &TaskId) -> Result<(), CoreError> {
        self.act(id, Task::cancel).await?;
        info!(task_id = %id, "Task cancelled");
        Ok(())
    }

    pub async fn pause(&self, id: &TaskId) -> Result<(), CoreError> {
        self.act(id, Task::pause).await?;
        info!(task_id = %id, "Task paused");
        Ok(())
    }

    /// Return a paused task to the pending pool with its progress reset.
    pub async fn resume(&self, id: &TaskId) -> Result<(), CoreError> {
        self.act(id, Task::resume).await?;
        info!(task_id = %id, "Task resumed");
        Ok(())
    }

    /// Remove a terminal task.
    pub async fn delete(&self, id: &TaskId) -> Result<Task, CoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get(id)
            .ok_or_else(|| CoreError::TaskNotFound(id.clone()))?;
        task.ensure_deletable()?;

        let removed = tasks
            .remove(id)
            .ok_or_else(|| CoreError::TaskNotFound(id.clone()))?;
        drop(tasks);

        info!(task_id = %id, "Task deleted");
        self.publish(RegistryEvent::Removed(id.clone()));
        Ok(removed)
    }

    /// Assign priorities `1..=n` in the order given.
    ///
    /// Every id must be registered and pending, and appear once; otherwise
    /// nothing changes. The returned snapshot restores the previous order.
    pub async fn reorder(&self, ids: &[TaskId]) -> Result<PrioritySnapshot, CoreError> {
        let mut tasks = self.tasks.write().await;

        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(id) {
                return Err(CoreError::InvalidInput(format!("task {} listed twice", id)));
            }
            let task = tasks
                .get(id)
                .ok_or_else(|| CoreError::TaskNotFound(id.clone()))?;
            if task.status != TaskStatus::Pending {
                return Err(CoreError::InvalidStateTransition {
                    task_id: id.clone(),
                    from: task.status,
                    action: "reorder",
                });
            }
        }

        let mut snapshot = PrioritySnapshot {
            priorities: Vec::with_capacity(ids.len()),
        };
        let mut updated = Vec::with_capacity(ids.len());
        for (position, id) in ids.iter().enumerate() {
            if let Some(task) = tasks.get_mut(id) {
                snapshot.priorities.push((id.clone(), task.priority));
                task.set_rank(position)?;
                updated.push(task.clone());
            }
        }
        drop(tasks);

        info!(count = ids.len(), "Tasks reordered");
        for task in updated {
            self.publish(RegistryEvent::Updated(task));
        }
        Ok(snapshot)
    }

    /// Put back the priorities captured by [`Self::reorder`].
    ///
    /// Tasks that left the pending set since the snapshot keep their
    /// current priority.
    pub async fn restore(&self, snapshot: PrioritySnapshot) {
        let mut tasks = self.tasks.write().await;
        let mut updated = Vec::with_capacity(snapshot.priorities.len());
        for (id, priority) in snapshot.priorities {
            let Some(task) = tasks.get_mut(&id) else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                debug!(task_id = %id, status = %task.status, "Not restoring priority of started task");
                continue;
            }
            task.priority = priority;
            updated.push(task.clone());
        }
        drop(tasks);

        warn!(count = updated.len(), "Task order rolled back");
        for task in updated {
            self.publish(RegistryEvent::Updated(task));
        }
    }

    /// Apply the service's record of a task, registering it if unknown.
    pub async fn reconcile(&self, remote: Task) -> Transition {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(&remote.id) else {
            debug!(task_id = %remote.id, status = %remote.status, "Registering task reported by service");
            tasks.insert(remote.id.clone(), remote.clone());
            drop(tasks);
            self.publish(RegistryEvent::Created(remote));
            return Transition::Applied;
        };

        let before = task.status;
        let transition = task.reconcile(&remote);
        match transition {
            Transition::Applied => {
                if before != task.status {
                    info!(task_id = %task.id, from = %before, to = %task.status, "Task reconciled with service");
                }
                let snapshot = task.clone();
                drop(tasks);
                self.publish(RegistryEvent::Updated(snapshot));
            }
            Transition::Ignored(reason) => {
                debug!(task_id = %remote.id, reason, "Reconcile ignored");
            }
        }
        transition
    }

    /// Drop terminal tasks whose retention window has passed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Vec<TaskId> {
        self.remove_where(|task| task.is_expired(now)).await
    }

    /// Drop every terminal task. Returns how many were removed.
    pub async fn clear_terminal(&self) -> usize {
        self.remove_where(Task::is_terminal).await.len()
    }

    async fn remove_where(&self, predicate: impl Fn(&Task) -> bool) -> Vec<TaskId> {
        let mut tasks = self.tasks.write().await;
        let doomed: Vec<TaskId> = tasks
            .values()
            .filter(|task| task.is_terminal() && predicate(task))
            .map(|task| task.id.clone())
            .collect();
        for id in &doomed {
            tasks.remove(id);
        }
        drop(tasks);

        if !doomed.is_empty() {
            info!(count = doomed.len(), "Removed terminal tasks");
        }
        for id in &doomed {
            self.publish(RegistryEvent::Removed(id.clone()));
        }
        doomed
    }

    pub async fn get(&self, id: &TaskId) -> Option<Task> {
        self.tasks.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &TaskId) -> bool {
        self.tasks.read().await.contains_key(id)
    }

    /// Tasks on `tab` (all tasks for `None`) in display order.
    pub async fn list(&self, tab: Option<QueueTab>) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut list: Vec<Task> = tasks
            .values()
            .filter(|task| tab.map_or(true, |tab| tab.contains(task.status)))
            .cloned()
            .collect();
        list.sort_by(|a, b| (a.priority, a.created_at).cmp(&(b.priority, b.created_at)));
        list
    }

    /// Ids of pending tasks in run order.
    pub async fn pending_order(&self) -> Vec<TaskId> {
        self.list(None)
            .await
            .into_iter()
            .filter(|task| task.status == TaskStatus::Pending)
            .map(|task| task.id)
            .collect()
    }

    pub async fn stats(&self) -> JobStats {
        JobStats::from_tasks(self.tasks.read().await.values())
    }

    /// Whether any task is still non-terminal.
    pub async fn has_active(&self) -> bool {
        self.tasks.read().await.values().any(|task| !task.is_terminal())
    }

    /// Dependencies of `id` that have not completed.
    ///
    /// Dependencies are advisory; the client only reports them.
    pub async fn unmet_dependencies(&self, id: &TaskId) -> Result<Vec<TaskId>, CoreError> {
        let tasks = self.tasks.read().await;
        let task = tasks
            .get(id)
            .ok_or_else(|| CoreError::TaskNotFound(id.clone()))?;
        Ok(task
            .dependencies
            .iter()
            .filter(|dep| {
                tasks
                    .get(dep)
                    .map_or(true, |dep| dep.status != TaskStatus::Completed)
            })
            .cloned()
            .collect())
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}
