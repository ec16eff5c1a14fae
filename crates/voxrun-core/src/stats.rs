//! Aggregate counts of tasks by status.

use serde::{Deserialize, Serialize};

use crate::{QueueTab, Task, TaskStatus};

/// Task counts by status, as reported by the queue service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    #[serde(default)]
    pub pending: u64,
    #[serde(default)]
    pub running: u64,
    #[serde(default)]
    pub paused: u64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub cancelled: u64,
    /// `pending + running + paused`.
    #[serde(default)]
    pub total_active: u64,
}

impl JobStats {
    /// Count a set of tasks.
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut stats = Self::default();
        for task in tasks {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Paused => stats.paused += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats.total_active = stats.pending + stats.running + stats.paused;
        stats
    }

    /// Badge count for a queue tab.
    pub fn count_for(&self, tab: QueueTab) -> u64 {
        match tab {
            QueueTab::Active => self.pending + self.running,
            QueueTab::Paused => self.paused,
            QueueTab::Completed => self.completed,
            QueueTab::Failed => self.failed + self.cancelled,
        }
    }
}
