//! Status, kind and tab enums for Tasks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Status of a Task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task registered but not yet started.
    #[default]
    Pending,
    /// Task is executing.
    Running,
    /// Task was paused by the user; resuming returns it to `Pending`.
    Paused,
    /// Task completed successfully.
    Completed,
    /// Task failed.
    Failed,
    /// Task was cancelled by user or system.
    Cancelled,
}

impl TaskStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [TaskStatus; 6] = [
        Self::Pending,
        Self::Running,
        Self::Paused,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Returns true if no further transition may leave this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the task still occupies the queue.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::UnknownStatus(s.to_string()))
    }
}

/// Kind of work a Task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    /// Speech synthesis.
    #[serde(rename = "tts")]
    Synthesis,
    /// Fetching and extracting a document from a URL.
    #[serde(rename = "url_fetch")]
    Fetch,
    /// Summarizing fetched content.
    #[serde(rename = "summarize")]
    Summarize,
    /// Whole-book conversion.
    #[serde(rename = "audiobook")]
    Audiobook,
    /// AI-assisted text cleaning.
    #[serde(rename = "cleaning")]
    Cleaning,
    /// Parent of a set of sub-tasks.
    #[serde(rename = "batch")]
    Batch,
}

impl TaskKind {
    /// All kinds.
    pub const ALL: [TaskKind; 6] = [
        Self::Synthesis,
        Self::Fetch,
        Self::Summarize,
        Self::Audiobook,
        Self::Cleaning,
        Self::Batch,
    ];

    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synthesis => "tts",
            Self::Fetch => "url_fetch",
            Self::Summarize => "summarize",
            Self::Audiobook => "audiobook",
            Self::Cleaning => "cleaning",
            Self::Batch => "batch",
        }
    }

    /// Route segment of the service whose per-task progress stream serves
    /// this kind. Batch parents have no stream of their own.
    pub fn stream_route(&self) -> Option<&'static str> {
        match self {
            Self::Synthesis => Some("tts"),
            Self::Fetch | Self::Summarize => Some("url-reader"),
            Self::Audiobook => Some("audiobook"),
            Self::Cleaning => Some("cleaning"),
            Self::Batch => None,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synthesis" => Ok(Self::Synthesis),
            "fetch" => Ok(Self::Fetch),
            other => Self::ALL
                .into_iter()
                .find(|kind| kind.as_str() == other)
                .ok_or_else(|| CoreError::UnknownKind(other.to_string())),
        }
    }
}

/// Filter tabs of the queue view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueTab {
    /// Pending and running tasks.
    #[default]
    Active,
    /// Paused tasks.
    Paused,
    /// Completed tasks.
    Completed,
    /// Failed and cancelled tasks.
    Failed,
}

impl QueueTab {
    /// Tabs in display order.
    pub fn all() -> &'static [QueueTab] {
        &[Self::Active, Self::Paused, Self::Completed, Self::Failed]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Paused => "Paused",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }

    /// Whether a task with `status` belongs on this tab.
    pub fn contains(&self, status: TaskStatus) -> bool {
        match self {
            Self::Active => matches!(status, TaskStatus::Pending | TaskStatus::Running),
            Self::Paused => status == TaskStatus::Paused,
            Self::Completed => status == TaskStatus::Completed,
            Self::Failed => matches!(status, TaskStatus::Failed | TaskStatus::Cancelled),
        }
    }

    /// Status filter to send to the service, when the tab maps to exactly one.
    pub fn server_filter(&self) -> Option<TaskStatus> {
        match self {
            Self::Paused => Some(TaskStatus::Paused),
            Self::Completed => Some(TaskStatus::Completed),
            Self::Active | Self::Failed => None,
        }
    }
}

impl FromStr for QueueTab {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(CoreError::InvalidInput(format!("unknown tab '{s}'"))),
        }
    }
}
