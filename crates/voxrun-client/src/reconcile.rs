//! Authoritative reconciliation with the task service.
//!
//! [`Reconciler`] polls the service on a fixed interval while anything is in
//! flight. [`QueueStreamSync`] follows the process-wide queue stream instead.
//! Both feed records through [`TaskRegistry::reconcile`], which lets a
//! terminal service record win over anything the client derived locally.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voxrun_core::{JobStats, QueueEvent};

use crate::channel::ProgressHub;
use crate::error::ClientError;
use crate::registry::TaskRegistry;
use crate::service::{ListFilter, TaskService};

/// Summary of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub stats: JobStats,
    /// Records fetched.
    pub seen: usize,
    /// Records that changed the registry.
    pub applied: usize,
    /// Channels closed because the service reported the task finished.
    pub closed: usize,
}

/// Periodic status poller.
pub struct Reconciler {
    service: Arc<dyn TaskService>,
    registry: Arc<TaskRegistry>,
    hub: ProgressHub,
    stats: Arc<watch::Sender<JobStats>>,
    interval: Duration,
    list_limit: u32,
}

impl Reconciler {
    pub fn new(
        service: Arc<dyn TaskService>,
        registry: Arc<TaskRegistry>,
        hub: ProgressHub,
        stats: Arc<watch::Sender<JobStats>>,
        interval: Duration,
        list_limit: u32,
    ) -> Self {
        Self {
            service,
            registry,
            hub,
            stats,
            interval,
            list_limit,
        }
    }

    /// Fetch the task list and stats once and apply them.
    pub async fn poll_once(&self) -> Result<PollReport, ClientError> {
        let filter = ListFilter {
            limit: Some(self.list_limit),
            ..ListFilter::default()
        };
        let list = self.service.list(&filter).await?;
        let stats = self.service.stats().await?;

        let seen = list.jobs.len();
        let mut applied = 0;
        let mut closed = 0;
        for remote in list.jobs {
            let id = remote.id.clone();
            let terminal = remote.is_terminal();
            if self.registry.reconcile(remote).await.is_applied() {
                applied += 1;
            }
            // The poll wins over a channel that has not delivered its end yet.
            if terminal && self.hub.close(&id) {
                debug!(task_id = %id, "Closed channel of task finished on service");
                closed += 1;
            }
        }

        self.registry.purge_expired(Utc::now()).await;
        self.stats.send_replace(stats);

        Ok(PollReport {
            stats,
            seen,
            applied,
            closed,
        })
    }

    /// Whether polling is needed right now.
    pub async fn has_work(&self) -> bool {
        self.hub.open_count() > 0 || self.registry.has_active().await
    }

    /// Poll on the configured interval until `shutdown` fires.
    ///
    /// Ticks are skipped while no channel is open and no task is active.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = self.interval.as_millis() as u64, "Reconciler started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !self.has_work().await {
                    continue;
                }
                match self.poll_once().await {
                    Ok(report) => debug!(
                        seen = report.seen,
                        applied = report.applied,
                        closed = report.closed,
                        "Poll complete"
                    ),
                    Err(e) => warn!(error = %e, "Poll failed"),
                }
            }
            info!("Reconciler stopped");
        })
    }
}

/// Follower of the process-wide queue stream.
pub struct QueueStreamSync {
    service: Arc<dyn TaskService>,
    registry: Arc<TaskRegistry>,
    hub: ProgressHub,
    stats: Arc<watch::Sender<JobStats>>,
}

impl QueueStreamSync {
    pub fn new(
        service: Arc<dyn TaskService>,
        registry: Arc<TaskRegistry>,
        hub: ProgressHub,
        stats: Arc<watch::Sender<JobStats>>,
    ) -> Self {
        Self {
            service,
            registry,
            hub,
            stats,
        }
    }

    /// Apply one queue event.
    pub async fn apply(&self, event: QueueEvent) {
        match event {
            QueueEvent::JobCreated(task) | QueueEvent::JobUpdate(task) | QueueEvent::JobCompleted(task) => {
                let id = task.id.clone();
                let terminal = task.is_terminal();
                self.registry.reconcile(task).await;
                if terminal {
                    self.hub.close(&id);
                }
            }
            QueueEvent::JobFailed { job_id, error } => {
                self.registry.fail(&job_id, &error).await;
                self.hub.close(&job_id);
            }
            QueueEvent::StatsUpdate(stats) => {
                self.stats.send_replace(stats);
            }
            QueueEvent::Ping => {}
        }
    }

    /// Follow the stream until it ends or `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ClientError> {
        let mut events = self.service.open_queue_stream().await?;
        info!("Following queue stream");

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                next = events.next() => next,
            };
            match next {
                Some(Ok(event)) => self.apply(event).await,
                Some(Err(ClientError::Core(e))) => {
                    warn!(error = %e, "Skipping malformed queue event");
                }
                Some(Err(e)) => return Err(e),
                None => return Err(ClientError::ConnectionLost),
            }
        }
    }

    /// Follow the stream, reopening it after `retry` whenever it drops.
    pub fn spawn(self, shutdown: CancellationToken, retry: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.run(shutdown.clone()).await {
                    Ok(()) => break,
                    Err(e) => warn!(error = %e, "Queue stream dropped, retrying"),
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(retry) => {}
                }
            }
            info!("Queue stream follower stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::CONNECTION_LOST;
    use crate::testing::FakeTaskService;
    use serde_json::json;
    use voxrun_core::{ProgressEvent, Task, TaskId, TaskKind, TaskStatus};

    struct Fixture {
        fake: Arc<FakeTaskService>,
        registry: Arc<TaskRegistry>,
        hub: ProgressHub,
        stats: Arc<watch::Sender<JobStats>>,
    }

    impl Fixture {
        fn new() -> Self {
            let fake = Arc::new(FakeTaskService::new());
            let registry = Arc::new(TaskRegistry::new());
            let hub = ProgressHub::new(fake.clone(), Arc::clone(&registry));
            let (stats, _) = watch::channel(JobStats::default());
            Self {
                fake,
                registry,
                hub,
                stats: Arc::new(stats),
            }
        }

        fn reconciler(&self) -> Reconciler {
            Reconciler::new(
                self.fake.clone(),
                Arc::clone(&self.registry),
                self.hub.clone(),
                Arc::clone(&self.stats),
                Duration::from_secs(2),
                100,
            )
        }

        fn queue_sync(&self) -> QueueStreamSync {
            QueueStreamSync::new(
                self.fake.clone(),
                Arc::clone(&self.registry),
                self.hub.clone(),
                Arc::clone(&self.stats),
            )
        }
    }

    #[tokio::test]
    async fn test_poll_overrides_connection_lost() {
        let fx = Fixture::new();
        let task = Task::new(TaskKind::Synthesis, json!({})).with_id(TaskId::new("t1"));
        fx.registry.insert(task.clone()).await.unwrap();
        fx.fake.put(task).await;
        let id = TaskId::new("t1");

        let sender = fx.fake.progress_sender(&id).await;
        let handle = fx.hub.subscribe(id.clone(), TaskKind::Synthesis);
        sender
            .send(Ok(ProgressEvent::Progress { fraction: 0.5, message: "Synthesizing".into() }))
            .unwrap();
        drop(sender);
        handle.finished().await;
        assert_eq!(
            fx.registry.get(&id).await.unwrap().error_message.as_deref(),
            Some(CONNECTION_LOST)
        );

        let mut remote = fx.fake.get(&id).await.unwrap();
        remote.apply_progress(0.9, "");
        remote.complete(json!({ "audio_url": "/t1.wav" }));
        fx.fake.put(remote).await;

        let report = fx.reconciler().poll_once().await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.stats.completed, 1);

        let task = fx.registry.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 1.0);
        assert_eq!(*fx.stats.borrow(), report.stats);
    }

    #[tokio::test]
    async fn test_poll_closes_channel_of_finished_task() {
        let fx = Fixture::new();
        let mut task = Task::new(TaskKind::Fetch, json!({})).with_id(TaskId::new("t2"));
        fx.registry.insert(task.clone()).await.unwrap();
        let _sender = fx.fake.progress_sender(&task.id).await;
        let handle = fx.hub.subscribe(task.id.clone(), TaskKind::Fetch);

        task.complete(json!({ "title": "Article" }));
        fx.fake.put(task.clone()).await;

        let report = fx.reconciler().poll_once().await.unwrap();
        assert_eq!(report.closed, 1);
        handle.finished().await;
        assert!(!fx.hub.is_open(&task.id));
        assert_eq!(fx.registry.get(&task.id).await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_has_work() {
        let fx = Fixture::new();
        let reconciler = fx.reconciler();
        assert!(!reconciler.has_work().await);

        fx.registry
            .create(TaskKind::Audiobook, json!({}), vec![], 5)
            .await;
        assert!(reconciler.has_work().await);
    }

    #[tokio::test]
    async fn test_queue_events_applied() {
        let fx = Fixture::new();
        let sync = fx.queue_sync();
        let mut task = Task::new(TaskKind::Summarize, json!({})).with_id(TaskId::new("q1"));

        sync.apply(QueueEvent::JobCreated(task.clone())).await;
        assert_eq!(fx.registry.get(&task.id).await.unwrap().status, TaskStatus::Pending);

        task.apply_progress(0.4, "Summarizing");
        sync.apply(QueueEvent::JobUpdate(task.clone())).await;
        assert_eq!(fx.registry.get(&task.id).await.unwrap().progress, 0.4);

        sync.apply(QueueEvent::JobFailed {
            job_id: task.id.clone(),
            error: "model unavailable".to_string(),
        })
        .await;
        let stored = fx.registry.get(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("model unavailable"));

        let stats = JobStats {
            failed: 1,
            ..JobStats::default()
        };
        sync.apply(QueueEvent::StatsUpdate(stats)).await;
        assert_eq!(*fx.stats.borrow(), stats);
    }

    #[tokio::test]
    async fn test_queue_stream_run_until_closed() {
        let fx = Fixture::new();
        let sender = fx.fake.queue_sender().await;
        let task = Task::new(TaskKind::Batch, json!({})).with_id(TaskId::new("b1"));
        sender.send(Ok(QueueEvent::JobCreated(task))).unwrap();
        sender.send(Ok(QueueEvent::Ping)).unwrap();
        drop(sender);

        let result = fx.queue_sync().run(CancellationToken::new()).await;
        assert!(matches!(result, Err(ClientError::ConnectionLost)));
        assert!(fx.registry.contains(&TaskId::new("b1")).await);
    }
}
