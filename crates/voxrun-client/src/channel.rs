//! Per-task progress channels.
//!
//! Each channel is an independent tokio task reading one task's event
//! stream and applying it to the [`TaskRegistry`] in receipt order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voxrun_core::{ProgressEvent, TaskId, TaskKind};

use crate::error::ClientError;
use crate::registry::TaskRegistry;
use crate::service::TaskService;

/// Failure message for a task whose channel dropped before it finished.
pub const CONNECTION_LOST: &str = "connection lost";

/// Handle to an open progress channel.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    task_id: TaskId,
    serial: u64,
    stop: CancellationToken,
    finished: CancellationToken,
}

impl ChannelHandle {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Stop the subscription without touching the task.
    pub fn close(&self) {
        self.stop.cancel();
    }

    /// Whether the channel has ended.
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Wait for the channel to end.
    pub async fn finished(&self) {
        self.finished.cancelled().await;
    }
}

enum ChannelEnd {
    /// Closed by the client.
    Closed,
    /// The task reached a terminal event.
    Terminal,
    /// The transport went away first.
    Disconnected(String),
}

struct HubInner {
    service: Arc<dyn TaskService>,
    registry: Arc<TaskRegistry>,
    channels: Mutex<HashMap<TaskId, ChannelHandle>>,
    next_serial: AtomicU64,
    verify_on_disconnect: AtomicBool,
}

impl HubInner {
    fn channels(&self) -> MutexGuard<'_, HashMap<TaskId, ChannelHandle>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owner of every open progress channel in the process.
#[derive(Clone)]
pub struct ProgressHub {
    inner: Arc<HubInner>,
}

impl ProgressHub {
    pub fn new(service: Arc<dyn TaskService>, registry: Arc<TaskRegistry>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                service,
                registry,
                channels: Mutex::new(HashMap::new()),
                next_serial: AtomicU64::new(0),
                verify_on_disconnect: AtomicBool::new(false),
            }),
        }
    }

    /// Query the service once before failing a task whose channel dropped.
    pub fn with_verify_on_disconnect(self, verify: bool) -> Self {
        self.inner.verify_on_disconnect.store(verify, Ordering::Relaxed);
        self
    }

    /// Open the progress channel for `task_id`.
    ///
    /// A task has at most one channel; subscribing again returns the
    /// existing handle.
    pub fn subscribe(&self, task_id: TaskId, kind: TaskKind) -> ChannelHandle {
        let mut channels = self.inner.channels();
        if let Some(existing) = channels.get(&task_id) {
            debug!(task_id = %task_id, "Reusing open progress channel");
            return existing.clone();
        }

        let handle = ChannelHandle {
            task_id: task_id.clone(),
            serial: self.inner.next_serial.fetch_add(1, Ordering::Relaxed),
            stop: CancellationToken::new(),
            finished: CancellationToken::new(),
        };
        channels.insert(task_id.clone(), handle.clone());
        drop(channels);

        info!(task_id = %task_id, kind = %kind, "Opening progress channel");
        let inner = Arc::clone(&self.inner);
        let channel = handle.clone();
        tokio::spawn(async move {
            let end = tokio::select! {
                _ = channel.stop.cancelled() => ChannelEnd::Closed,
                end = pump(&inner, &channel.task_id, kind) => end,
            };

            match end {
                ChannelEnd::Closed => debug!(task_id = %channel.task_id, "Progress channel closed"),
                ChannelEnd::Terminal => debug!(task_id = %channel.task_id, "Progress channel finished"),
                ChannelEnd::Disconnected(reason) => {
                    disconnected(&inner, &channel.task_id, &reason).await
                }
            }

            let mut channels = inner.channels();
            if channels
                .get(&channel.task_id)
                .is_some_and(|open| open.serial == channel.serial)
            {
                channels.remove(&channel.task_id);
            }
            drop(channels);
            channel.finished.cancel();
        });

        handle
    }

    /// Close the channel of `task_id`. Returns false if none was open.
    pub fn close(&self, task_id: &TaskId) -> bool {
        match self.inner.channels().remove(task_id) {
            Some(handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let handles: Vec<_> = self.inner.channels().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.close();
        }
    }

    pub fn is_open(&self, task_id: &TaskId) -> bool {
        self.inner.channels().contains_key(task_id)
    }

    pub fn handle(&self, task_id: &TaskId) -> Option<ChannelHandle> {
        self.inner.channels().get(task_id).cloned()
    }

    pub fn open_count(&self) -> usize {
        self.inner.channels().len()
    }
}

/// Read one channel until it ends.
async fn pump(inner: &HubInner, task_id: &TaskId, kind: TaskKind) -> ChannelEnd {
    let mut events = match inner.service.open_progress_stream(task_id, kind).await {
        Ok(events) => events,
        Err(e) => return ChannelEnd::Disconnected(e.to_string()),
    };

    while let Some(event) = events.next().await {
        match event {
            Ok(ProgressEvent::Progress { fraction, message }) => {
                inner.registry.apply_progress(task_id, fraction, &message).await;
            }
            Ok(ProgressEvent::Complete(result)) => {
                inner.registry.complete(task_id, result).await;
                return ChannelEnd::Terminal;
            }
            Ok(ProgressEvent::Error { message }) => {
                inner.registry.fail(task_id, &message).await;
                return ChannelEnd::Terminal;
            }
            Err(ClientError::Core(e)) => {
                warn!(task_id = %task_id, error = %e, "Skipping malformed progress frame");
            }
            Err(e) => return ChannelEnd::Disconnected(e.to_string()),
        }
    }
    ChannelEnd::Disconnected("stream ended".to_string())
}

async fn disconnected(inner: &HubInner, task_id: &TaskId, reason: &str) {
    let still_active = inner
        .registry
        .get(task_id)
        .await
        .is_some_and(|task| !task.is_terminal());
    if !still_active {
        debug!(task_id = %task_id, reason, "Channel ended after task finished");
        return;
    }

    warn!(task_id = %task_id, reason, "Progress channel lost");
    if inner.verify_on_disconnect.load(Ordering::Relaxed) {
        match inner.service.get(task_id).await {
            Ok(remote) => {
                let terminal = remote.is_terminal();
                inner.registry.reconcile(remote).await;
                if !terminal {
                    info!(task_id = %task_id, "Task still active on service, leaving it to polling");
                }
                return;
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Status check after disconnect failed");
            }
        }
    }
    inner.registry.fail(task_id, CONNECTION_LOST).await;
}
