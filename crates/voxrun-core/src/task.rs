//! Task record and its lifecycle state machine.
//!
//! ```text
//! pending ──▶ running ──▶ completed | failed | cancelled
//!    │          ▲  │
//!    │   resume │  ▼ pause
//!    │        paused
//!    └──▶ cancelled
//! ```
//!
//! Event-driven mutations (`apply_progress`, `complete`, `fail`) never error:
//! a late or duplicate event yields [`Transition::Ignored`]. User actions
//! (`cancel`, `pause`, `resume`, delete) return
//! [`CoreError::InvalidStateTransition`] when the current status forbids them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::wire_time;
use crate::{CoreError, TaskId, TaskKind, TaskStatus};

/// Priority given to tasks that do not ask for one.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Highest priority (runs first).
pub const MIN_PRIORITY: i32 = 1;

/// Lowest priority.
pub const MAX_PRIORITY: i32 = 10;

/// Days a task record is retained after creation.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Upper bound for progress reported before completion. A fraction of
/// exactly 1 is reserved for completed tasks.
pub const PROGRESS_CEILING: f64 = 0.999;

const DEFAULT_FAILURE_MESSAGE: &str = "Task failed";

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

/// Outcome of an event-driven mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The task changed.
    Applied,
    /// The event was a no-op; the reason is for logging.
    Ignored(&'static str),
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// A Task represents one unit of long-running, trackable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// What kind of work this is.
    #[serde(rename = "job_type")]
    pub kind: TaskKind,

    /// Current task status.
    #[serde(default)]
    pub status: TaskStatus,

    /// Request parameters. Immutable after creation.
    #[serde(default)]
    pub payload: Value,

    /// Success payload; set only when completed.
    #[serde(default)]
    pub result: Option<Value>,

    /// Failure reason; set only when failed.
    #[serde(default)]
    pub error_message: Option<String>,

    /// Tasks that must complete before this one may run.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,

    /// Owning task for sub-tasks of batch or chained work.
    #[serde(default, rename = "parent_job_id")]
    pub parent_id: Option<TaskId>,

    /// Lower runs first.
    #[serde(default = "default_priority")]
    pub priority: i32,

    /// Completion fraction in `[0, 1]`.
    #[serde(default)]
    pub progress: f64,

    /// Last human-readable status line.
    #[serde(default)]
    pub progress_message: String,

    #[serde(default = "Utc::now", deserialize_with = "wire_time::or_now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now", deserialize_with = "wire_time::or_now")]
    pub updated_at: DateTime<Utc>,

    #[serde(default, deserialize_with = "wire_time::optional")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, deserialize_with = "wire_time::optional")]
    pub completed_at: Option<DateTime<Utc>>,

    /// When the record may be purged (only once terminal).
    #[serde(
        default = "wire_time::default_expiry",
        deserialize_with = "wire_time::or_retention"
    )]
    pub expires_at: DateTime<Utc>,
}

impl Task {
    /// Create a new pending Task under a provisional id.
    pub fn new(kind: TaskKind, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::provisional(),
            kind,
            status: TaskStatus::Pending,
            payload,
            result: None,
            error_message: None,
            dependencies: Vec::new(),
            parent_id: None,
            priority: DEFAULT_PRIORITY,
            progress: 0.0,
            progress_message: String::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            expires_at: now + Duration::days(DEFAULT_RETENTION_DAYS),
        }
    }

    /// Builder method to set a specific ID.
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Builder method to set the priority (clamped to 1..=10).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = clamp_priority(priority);
        self
    }

    /// Builder method to set dependencies.
    pub fn with_dependencies(mut self, dependencies: Vec<TaskId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Builder method to set the owning task.
    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    /// Builder method to override the retention window.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.expires_at = self.created_at + retention;
        self
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Terminal and past its retention window.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_terminal() && now >= self.expires_at
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn reject(&self, action: &'static str) -> CoreError {
        CoreError::InvalidStateTransition {
            task_id: self.id.clone(),
            from: self.status,
            action,
        }
    }

    /// Record reported progress.
    ///
    /// The fraction never decreases and stays below 1 until completion. The
    /// first progress report moves a pending task to running.
    pub fn apply_progress(&mut self, fraction: f64, message: &str) -> Transition {
        if self.is_terminal() {
            return Transition::Ignored("task is terminal");
        }
        if !fraction.is_finite() {
            return Transition::Ignored("non-finite fraction");
        }

        if self.status == TaskStatus::Pending {
            self.status = TaskStatus::Running;
            self.started_at.get_or_insert_with(Utc::now);
        }
        self.progress = self.progress.max(fraction.clamp(0.0, PROGRESS_CEILING));
        if !message.is_empty() {
            self.progress_message = message.to_string();
        }
        self.touch();
        Transition::Applied
    }

    /// Mark the task as completed with `result`.
    ///
    /// Valid from running, or from pending for instantaneous completions.
    pub fn complete(&mut self, result: Value) -> Transition {
        match self.status {
            TaskStatus::Pending | TaskStatus::Running => {
                let now = Utc::now();
                self.status = TaskStatus::Completed;
                self.progress = 1.0;
                self.result = Some(result);
                self.error_message = None;
                self.started_at.get_or_insert(now);
                self.completed_at = Some(now);
                self.updated_at = now;
                Transition::Applied
            }
            TaskStatus::Paused => Transition::Ignored("completion while paused"),
            _ => Transition::Ignored("late or duplicate completion"),
        }
    }

    /// Mark the task as failed.
    pub fn fail(&mut self, message: impl Into<String>) -> Transition {
        if self.is_terminal() {
            return Transition::Ignored("late or duplicate failure");
        }
        let now = Utc::now();
        self.status = TaskStatus::Failed;
        self.error_message = Some(message.into());
        self.result = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        Transition::Applied
    }

    /// Cancel a pending or running task.
    pub fn cancel(&mut self) -> Result<(), CoreError> {
        match self.status {
            TaskStatus::Pending | TaskStatus::Running => {
                let now = Utc::now();
                self.status = TaskStatus::Cancelled;
                self.completed_at = Some(now);
                self.updated_at = now;
                Ok(())
            }
            _ => Err(self.reject("cancel")),
        }
    }

    /// Pause a running task.
    pub fn pause(&mut self) -> Result<(), CoreError> {
        if self.status != TaskStatus::Running {
            return Err(self.reject("pause"));
        }
        self.status = TaskStatus::Paused;
        self.touch();
        Ok(())
    }

    /// Return a paused task to the pending pool. The task restarts from
    /// scratch, so its progress is reset.
    pub fn resume(&mut self) -> Result<(), CoreError> {
        if self.status != TaskStatus::Paused {
            return Err(self.reject("resume"));
        }
        self.status = TaskStatus::Pending;
        self.progress = 0.0;
        self.progress_message = "Queued".to_string();
        self.touch();
        Ok(())
    }

    /// Only terminal tasks may be deleted.
    pub fn ensure_deletable(&self) -> Result<(), CoreError> {
        if self.is_terminal() {
            Ok(())
        } else {
            Err(self.reject("delete"))
        }
    }

    /// Change the priority of a pending task.
    pub fn set_priority(&mut self, priority: i32) -> Result<(), CoreError> {
        if self.status != TaskStatus::Pending {
            return Err(self.reject("reorder"));
        }
        self.priority = clamp_priority(priority);
        self.touch();
        Ok(())
    }

    /// Place a pending task at `position` (0-based) of a reordered queue.
    ///
    /// Ranks start at 1 and are not capped, so queues longer than the
    /// submission priority range keep their order.
    pub fn set_rank(&mut self, position: usize) -> Result<(), CoreError> {
        if self.status != TaskStatus::Pending {
            return Err(self.reject("reorder"));
        }
        self.priority = i32::try_from(position + 1).unwrap_or(i32::MAX);
        self.touch();
        Ok(())
    }

    /// Adopt the service's authoritative view of this task.
    ///
    /// A terminal record from the service always wins, including over a
    /// terminal state the client derived locally (e.g. a lost connection).
    /// A non-terminal record never reopens a task the client already
    /// considers terminal.
    pub fn reconcile(&mut self, remote: &Task) -> Transition {
        if remote.status.is_terminal() {
            if self.status == remote.status
                && self.result == remote.result
                && self.error_message == remote.error_message
            {
                return Transition::Ignored("already in sync");
            }

            self.status = remote.status;
            match remote.status {
                TaskStatus::Completed => {
                    self.progress = 1.0;
                    self.result = Some(remote.result.clone().unwrap_or(Value::Null));
                    self.error_message = None;
                }
                TaskStatus::Failed => {
                    self.progress = self.progress.min(PROGRESS_CEILING);
                    self.result = None;
                    self.error_message = Some(
                        remote
                            .error_message
                            .clone()
                            .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string()),
                    );
                }
                _ => {
                    self.progress = self.progress.min(PROGRESS_CEILING);
                    self.result = None;
                    self.error_message = None;
                }
            }
            if !remote.progress_message.is_empty() {
                self.progress_message = remote.progress_message.clone();
            }
            self.started_at = self.started_at.or(remote.started_at);
            self.completed_at = remote.completed_at.or_else(|| Some(Utc::now()));
            self.touch();
            return Transition::Applied;
        }

        if self.is_terminal() {
            return Transition::Ignored("local terminal state kept");
        }

        let reported = if remote.progress.is_finite() {
            remote.progress.clamp(0.0, PROGRESS_CEILING)
        } else {
            0.0
        };
        let progress = if self.status == TaskStatus::Running && remote.status == TaskStatus::Running
        {
            self.progress.max(reported)
        } else {
            reported
        };

        if self.status == remote.status
            && self.progress == progress
            && self.priority == remote.priority
            && self.dependencies == remote.dependencies
            && self.parent_id == remote.parent_id
            && (remote.progress_message.is_empty()
                || self.progress_message == remote.progress_message)
        {
            return Transition::Ignored("already in sync");
        }

        self.status = remote.status;
        self.progress = progress;
        self.priority = remote.priority;
        self.dependencies = remote.dependencies.clone();
        self.parent_id = remote.parent_id.clone();
        if !remote.progress_message.is_empty() {
            self.progress_message = remote.progress_message.clone();
        }
        self.started_at = remote.started_at.or(self.started_at);
        self.touch();
        Transition::Applied
    }
}

fn clamp_priority(priority: i32) -> i32 {
    priority.clamp(MIN_PRIORITY, MAX_PRIORITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn running_task() -> Task {
        let mut task = Task::new(TaskKind::Synthesis, json!({"text": "hi"}));
        task.apply_progress(0.1, "started");
        task
    }

    #[test]
    fn test_new_task_is_pending() {
        let task = Task::new(TaskKind::Cleaning, json!({}));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0.0);
        assert_eq!(task.priority, DEFAULT_PRIORITY);
        assert!(task.id.is_provisional());
        assert!(task.expires_at > task.created_at);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut task = running_task();
        for fraction in [0.5, 0.3, 0.7, 0.2, 0.9] {
            let before = task.progress;
            task.apply_progress(fraction, "");
            assert!(task.progress >= before);
        }
        assert_eq!(task.progress, 0.9);
    }

    #[test]
    fn test_progress_below_one_until_complete() {
        let mut task = running_task();
        task.apply_progress(1.0, "almost");
        assert!(task.progress < 1.0);
        assert_eq!(task.status, TaskStatus::Running);

        assert!(task.complete(json!({"ok": true})).is_applied());
        assert_eq!(task.progress, 1.0);
    }

    #[test]
    fn test_first_progress_starts_pending_task() {
        let mut task = Task::new(TaskKind::Audiobook, json!({}));
        assert!(task.apply_progress(0.2, "Parsing").is_applied());
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());
        assert_eq!(task.progress_message, "Parsing");
    }

    #[test]
    fn test_late_progress_after_complete_is_ignored() {
        let mut task = running_task();
        task.complete(json!("done"));

        let outcome = task.apply_progress(0.4, "late");
        assert!(!outcome.is_applied());
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 1.0);
    }

    #[test]
    fn test_nan_progress_ignored() {
        let mut task = running_task();
        assert_eq!(
            task.apply_progress(f64::NAN, ""),
            Transition::Ignored("non-finite fraction")
        );
    }

    #[test]
    fn test_complete_from_pending() {
        let mut task = Task::new(TaskKind::Fetch, json!({}));
        assert!(task.complete(json!({})).is_applied());
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn test_duplicate_complete_ignored() {
        let mut task = running_task();
        task.complete(json!(1));
        assert!(!task.complete(json!(2)).is_applied());
        assert_eq!(task.result, Some(json!(1)));
    }

    #[test]
    fn test_fail_sets_error_only_when_failed() {
        let mut task = running_task();
        task.pause().unwrap();
        assert!(task.fail("boom").is_applied());
        assert_eq!(task.error_message.as_deref(), Some("boom"));
        assert!(task.result.is_none());
        assert!(!task.fail("again").is_applied());
    }

    #[test]
    fn test_cancel_rules() {
        let mut pending = Task::new(TaskKind::Batch, json!({}));
        pending.cancel().unwrap();
        assert_eq!(pending.status, TaskStatus::Cancelled);
        assert!(pending.cancel().is_err());

        let mut paused = running_task();
        paused.pause().unwrap();
        assert!(matches!(
            paused.cancel(),
            Err(CoreError::InvalidStateTransition { action: "cancel", .. })
        ));
    }

    #[test]
    fn test_pause_resume_returns_to_pending() {
        let mut task = running_task();
        task.apply_progress(0.6, "");
        task.pause().unwrap();
        assert_eq!(task.status, TaskStatus::Paused);
        task.resume().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0.0);
        assert!(task.resume().is_err());
    }

    #[test]
    fn test_delete_requires_terminal() {
        let mut task = running_task();
        assert!(task.ensure_deletable().is_err());
        task.fail("x");
        assert!(task.ensure_deletable().is_ok());
    }

    #[test]
    fn test_set_rank_is_uncapped() {
        let mut task = Task::new(TaskKind::Synthesis, json!({}));
        task.set_rank(11).unwrap();
        assert_eq!(task.priority, 12);

        task.apply_progress(0.1, "");
        assert!(task.set_rank(0).is_err());
    }

    #[test]
    fn test_set_priority_clamps() {
        let mut task = Task::new(TaskKind::Synthesis, json!({}));
        task.set_priority(42).unwrap();
        assert_eq!(task.priority, MAX_PRIORITY);
        task.set_priority(-3).unwrap();
        assert_eq!(task.priority, MIN_PRIORITY);
    }

    #[test]
    fn test_reconcile_terminal_remote_overrides_local_failure() {
        let mut local = running_task();
        local.fail("connection lost");

        let mut remote = local.clone();
        remote.status = TaskStatus::Completed;
        remote.error_message = None;
        remote.result = Some(json!({"audio_url": "/a.wav"}));
        remote.progress = 1.0;

        assert!(local.reconcile(&remote).is_applied());
        assert_eq!(local.status, TaskStatus::Completed);
        assert_eq!(local.progress, 1.0);
        assert!(local.error_message.is_none());
        assert_eq!(local.result, Some(json!({"audio_url": "/a.wav"})));
    }

    #[test]
    fn test_reconcile_keeps_local_terminal_over_active_remote() {
        let mut local = running_task();
        local.cancel().unwrap();

        let remote = running_task().with_id(local.id.clone());
        assert_eq!(
            local.reconcile(&remote),
            Transition::Ignored("local terminal state kept")
        );
        assert_eq!(local.status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_reconcile_running_progress_stays_monotonic() {
        let mut local = running_task();
        local.apply_progress(0.8, "");
        let mut remote = local.clone();
        remote.progress = 0.5;

        local.reconcile(&remote);
        assert_eq!(local.progress, 0.8);
    }

    #[test]
    fn test_deserialize_service_record() {
        let raw = json!({
            "id": "a1b2c3",
            "session_id": "s",
            "status": "running",
            "job_type": "tts",
            "payload": {"text": "hello"},
            "result": null,
            "error_message": null,
            "dependencies": [],
            "parent_job_id": null,
            "priority": 3,
            "progress": 0.25,
            "progress_message": "Synthesizing",
            "created_at": "2025-01-01T10:00:00.000001",
            "updated_at": null,
            "expires_at": "2025-01-31T10:00:00",
            "started_at": "2025-01-01T10:00:01",
            "completed_at": null
        });

        let task: Task = serde_json::from_value(raw).unwrap();
        assert_eq!(task.id, TaskId::new("a1b2c3"));
        assert_eq!(task.kind, TaskKind::Synthesis);
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.priority, 3);
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_none());
    }
}
