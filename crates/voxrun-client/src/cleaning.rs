//! Chunked text cleaning, on the local inference worker or the service.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use voxrun_core::{Task, TaskId, TaskKind, TaskStatus, DEFAULT_PRIORITY};
use voxrun_inference::{InferenceError, InferenceProxy};

use crate::controller::{QueueController, TaskObserver};
use crate::error::ClientError;
use crate::preset::CleaningOptions;
use crate::registry::TaskRegistry;

/// Characters cleaned by [`CleaningPipeline::preview`].
pub const PREVIEW_CHARS: usize = 500;

const CHUNK_SEPARATOR: &str = "\n\n";

/// Progress callback: fraction in `[0, 1]` and a status line.
pub type ProgressFn<'a> = &'a (dyn Fn(f64, &str) + Send + Sync);

/// Something that can clean one chunk at a time.
#[async_trait]
pub trait ChunkGenerator: Send + Sync {
    fn is_ready(&self) -> bool;

    async fn generate(
        &self,
        system_prompt: &str,
        content: &str,
        chunk_index: usize,
    ) -> Result<String, InferenceError>;

    /// Drop every outstanding generation.
    fn abort(&self);
}

#[async_trait]
impl ChunkGenerator for InferenceProxy {
    fn is_ready(&self) -> bool {
        InferenceProxy::is_ready(self)
    }

    async fn generate(
        &self,
        system_prompt: &str,
        content: &str,
        chunk_index: usize,
    ) -> Result<String, InferenceError> {
        InferenceProxy::generate(self, system_prompt, content, chunk_index).await
    }

    fn abort(&self) {
        InferenceProxy::abort(self);
    }
}

/// Split `text` at runs of two or more newlines, dropping chunks that are
/// only whitespace. CRLF line endings are treated as LF.
pub fn split_chunks(text: &str) -> Vec<String> {
    text.replace("\r\n", "\n")
        .split("\n\n")
        .map(|chunk| chunk.trim_start_matches('\n'))
        .filter(|chunk| !chunk.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// Where cleaning runs.
#[derive(Clone)]
pub enum CleaningBackend {
    /// In-process, one chunk at a time.
    Local(Arc<dyn ChunkGenerator>),
    /// As a single cleaning task on the service.
    Remote(Arc<QueueController>),
}

pub struct CleaningPipeline {
    backend: CleaningBackend,
    options: CleaningOptions,
    registry: Option<Arc<TaskRegistry>>,
}

impl CleaningPipeline {
    pub fn new(backend: CleaningBackend, options: CleaningOptions) -> Self {
        Self {
            backend,
            options,
            registry: None,
        }
    }

    /// Track local runs as cleaning tasks in `registry`.
    pub fn with_registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn options(&self) -> &CleaningOptions {
        &self.options
    }

    /// Clean `text`, reporting progress through `on_progress`.
    pub async fn clean(&self, text: &str, on_progress: ProgressFn<'_>) -> Result<String, ClientError> {
        let chunks = split_chunks(text);
        if chunks.is_empty() {
            on_progress(1.0, "Nothing to clean");
            return Ok(text.to_string());
        }

        match &self.backend {
            CleaningBackend::Local(generator) => {
                self.clean_local(generator.as_ref(), &chunks, on_progress).await
            }
            CleaningBackend::Remote(controller) => {
                self.clean_remote(controller, text, on_progress).await
            }
        }
    }

    /// Clean only the start of `text`, as a single chunk.
    pub async fn preview(&self, text: &str, on_progress: ProgressFn<'_>) -> Result<String, ClientError> {
        let head: String = text.chars().take(PREVIEW_CHARS).collect();
        if head.trim().is_empty() {
            on_progress(1.0, "Nothing to clean");
            return Ok(head);
        }

        match &self.backend {
            CleaningBackend::Local(generator) => {
                self.clean_local(generator.as_ref(), &[head], on_progress).await
            }
            CleaningBackend::Remote(controller) => {
                self.clean_remote(controller, &head, on_progress).await
            }
        }
    }

    async fn clean_local(
        &self,
        generator: &dyn ChunkGenerator,
        chunks: &[String],
        on_progress: ProgressFn<'_>,
    ) -> Result<String, ClientError> {
        if !generator.is_ready() {
            return Err(InferenceError::NotReady.into());
        }

        let mut run = TrackedRun { tracked: None };
        if let Some(registry) = &self.registry {
            let payload = json!({
                "preset": self.options.preset.as_str(),
                "chunks": chunks.len(),
                "backend": "local",
            });
            let task = registry
                .create(TaskKind::Cleaning, payload, Vec::new(), DEFAULT_PRIORITY)
                .await;
            run.tracked = Some((Arc::clone(registry), task.id));
        }

        let total = chunks.len();
        let system_prompt = self.options.system_prompt();
        let mut cleaned = Vec::with_capacity(total);

        for (index, chunk) in chunks.iter().enumerate() {
            match generator.generate(system_prompt, chunk, index).await {
                Ok(text) => cleaned.push(text),
                Err(e) => {
                    warn!(chunk = index, total, error = %e, "Chunk cleaning failed, aborting");
                    generator.abort();
                    if let Some((registry, id)) = run.finish() {
                        registry.fail(&id, &e.to_string()).await;
                    }
                    return Err(e.into());
                }
            }

            let fraction = (index + 1) as f64 / total as f64;
            let message = format!("Cleaning chunk {}/{}", index + 1, total);
            debug!(chunk = index, total, "Chunk cleaned");
            if let Some((registry, id)) = &run.tracked {
                registry.apply_progress(id, fraction, &message).await;
            }
            on_progress(fraction, &message);
        }

        let output = cleaned.join(CHUNK_SEPARATOR);
        if let Some((registry, id)) = run.finish() {
            registry
                .complete(&id, json!({ "cleaned_text": output }))
                .await;
        }
        info!(chunks = total, "Local cleaning finished");
        Ok(output)
    }

    async fn clean_remote(
        &self,
        controller: &QueueController,
        text: &str,
        on_progress: ProgressFn<'_>,
    ) -> Result<String, ClientError> {
        let id = controller.submit_cleaning(text, &self.options).await?;
        let forward = Forward(on_progress);
        let task = controller.observe(&id, &forward).await?;
        cleaned_text(task)
    }
}

/// Registry task of a local run; cancelled if the run is dropped unfinished.
struct TrackedRun {
    tracked: Option<(Arc<TaskRegistry>, TaskId)>,
}

impl TrackedRun {
    fn finish(&mut self) -> Option<(Arc<TaskRegistry>, TaskId)> {
        self.tracked.take()
    }
}

impl Drop for TrackedRun {
    fn drop(&mut self) {
        let Some((registry, id)) = self.tracked.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = registry.request_cancel(&id).await {
                        debug!(task_id = %id, error = %e, "Interrupted cleaning already finished");
                    }
                });
            }
            Err(_) => warn!(task_id = %id, "Local cleaning dropped outside a runtime"),
        }
    }
}

struct Forward<'a>(ProgressFn<'a>);

#[async_trait]
impl TaskObserver for Forward<'_> {
    async fn on_progress(&self, fraction: f64, message: &str) {
        (self.0)(fraction, message);
    }

    async fn on_done(&self, task: &Task) {
        if task.status == TaskStatus::Completed {
            (self.0)(1.0, "Cleaning complete");
        }
    }
}

fn cleaned_text(task: Task) -> Result<String, ClientError> {
    match task.status {
        TaskStatus::Completed => task
            .result
            .as_ref()
            .and_then(|result| result.get("cleaned_text"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::Serialization("result has no cleaned_text".to_string())),
        TaskStatus::Cancelled => Err(ClientError::Cancelled(task.id)),
        _ => Err(failed(task.id, task.error_message)),
    }
}

fn failed(task_id: TaskId, message: Option<String>) -> ClientError {
    ClientError::TaskFailed {
        task_id,
        message: message.unwrap_or_else(|| "Task failed".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::config::ClientConfig;
    use crate::preset::CleaningPreset;
    use crate::testing::FakeTaskService;
    use voxrun_core::ProgressEvent;
    use voxrun_inference::{InferenceEngine, LoadProgressFn};

    /// Uppercases chunks; shorter chunks finish sooner.
    #[derive(Default)]
    struct UpperGenerator {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
        aborted: AtomicBool,
        fail_on: Option<usize>,
        hang_on: Option<usize>,
    }

    #[async_trait]
    impl ChunkGenerator for UpperGenerator {
        fn is_ready(&self) -> bool {
            true
        }

        async fn generate(
            &self,
            _system_prompt: &str,
            content: &str,
            chunk_index: usize,
        ) -> Result<String, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang_on == Some(chunk_index) {
                std::future::pending::<()>().await;
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50 / (content.len() as u64).max(1))).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_on == Some(chunk_index) {
                return Err(InferenceError::Generation {
                    chunk_index,
                    message: "out of memory".to_string(),
                });
            }
            Ok(content.to_uppercase())
        }

        fn abort(&self) {
            self.aborted.store(true, Ordering::SeqCst);
        }
    }

    struct NotLoaded;

    #[async_trait]
    impl ChunkGenerator for NotLoaded {
        fn is_ready(&self) -> bool {
            false
        }

        async fn generate(&self, _: &str, _: &str, _: usize) -> Result<String, InferenceError> {
            panic!("generate called on an unloaded model");
        }

        fn abort(&self) {}
    }

    fn local(generator: Arc<dyn ChunkGenerator>) -> CleaningPipeline {
        CleaningPipeline::new(CleaningBackend::Local(generator), CleaningOptions::default())
    }

    fn record() -> (Arc<Mutex<Vec<(f64, String)>>>, impl Fn(f64, &str) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |fraction: f64, message: &str| {
            sink.lock().unwrap().push((fraction, message.to_string()));
        })
    }

    #[test]
    fn test_split_chunks() {
        let chunks = split_chunks("First para\nline two\n\n   \n\nSecond\n\n");
        assert_eq!(chunks, vec!["First para\nline two".to_string(), "Second".to_string()]);
        assert!(split_chunks(" \n\n \t\n").is_empty());
        assert_eq!(split_chunks("a\n\n\n\n\nb"), vec!["a", "b"]);
        assert_eq!(split_chunks("one\n  \ntwo"), vec!["one\n  \ntwo"]);
        assert_eq!(split_chunks("a\r\n\r\nb"), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_chunks_are_cleaned_in_order_one_at_a_time() {
        let generator = Arc::new(UpperGenerator::default());
        let pipeline = local(generator.clone());
        let (seen, on_progress) = record();

        let output = pipeline
            .clean("a much longer first paragraph\n\nb", &on_progress)
            .await
            .unwrap();

        assert_eq!(output, "A MUCH LONGER FIRST PARAGRAPH\n\nB");
        assert_eq!(generator.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (0.5, "Cleaning chunk 1/2".to_string()),
                (1.0, "Cleaning chunk 2/2".to_string()),
            ]
        );
    }

    /// Worker replies arrive in the order B, A, C; output keeps A, B, C.
    struct OutOfOrder {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl ChunkGenerator for OutOfOrder {
        fn is_ready(&self) -> bool {
            true
        }

        async fn generate(&self, _: &str, content: &str, _: usize) -> Result<String, InferenceError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let delay = match content {
                "A" => 30,
                "B" => 1,
                _ => 10,
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(format!("{}'", content))
        }

        fn abort(&self) {}
    }

    #[tokio::test]
    async fn test_three_chunks_join_in_input_order() {
        let generator = Arc::new(OutOfOrder {
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let pipeline = local(generator.clone());
        let (seen, on_progress) = record();

        let output = pipeline.clean("A\n\nB\n\nC", &on_progress).await.unwrap();
        assert_eq!(output, "A'\n\nB'\n\nC'");
        assert_eq!(generator.max_in_flight.load(Ordering::SeqCst), 1);
        let fractions: Vec<f64> = seen.lock().unwrap().iter().map(|(f, _)| *f).collect();
        assert_eq!(fractions, vec![1.0 / 3.0, 2.0 / 3.0, 1.0]);
    }

    #[tokio::test]
    async fn test_dropped_run_cancels_tracked_task() {
        let registry = Arc::new(TaskRegistry::new());
        let generator = Arc::new(UpperGenerator {
            hang_on: Some(1),
            ..Default::default()
        });
        let pipeline = Arc::new(local(generator).with_registry(Arc::clone(&registry)));

        let run = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.clean("one\n\ntwo", &|_: f64, _: &str| {}).await })
        };
        loop {
            let tasks = registry.list(None).await;
            if tasks.first().is_some_and(|t| t.status == TaskStatus::Running) {
                break;
            }
            tokio::task::yield_now().await;
        }

        run.abort();
        assert!(run.await.unwrap_err().is_cancelled());
        loop {
            let task = registry.list(None).await.remove(0);
            if task.status == TaskStatus::Cancelled {
                break;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_calls() {
        let generator = Arc::new(UpperGenerator::default());
        let pipeline = local(generator.clone());
        let (seen, on_progress) = record();

        let output = pipeline.clean("  \n\n", &on_progress).await.unwrap();
        assert_eq!(output, "  \n\n");
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(seen.lock().unwrap()[0].0, 1.0);
    }

    #[tokio::test]
    async fn test_error_aborts_and_discards_output() {
        let generator = Arc::new(UpperGenerator {
            fail_on: Some(1),
            ..Default::default()
        });
        let registry = Arc::new(TaskRegistry::new());
        let pipeline = local(generator.clone()).with_registry(Arc::clone(&registry));

        let err = pipeline
            .clean("one\n\ntwo\n\nthree", &|_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Inference(InferenceError::Generation { chunk_index: 1, .. })
        ));
        assert!(generator.aborted.load(Ordering::SeqCst));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);

        let tasks = registry.list(None).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_requires_loaded_model() {
        let pipeline = local(Arc::new(NotLoaded));
        let err = pipeline.clean("text", &|_, _| {}).await.unwrap_err();
        assert!(matches!(err, ClientError::Inference(InferenceError::NotReady)));
    }

    #[tokio::test]
    async fn test_local_run_is_tracked_in_registry() {
        let registry = Arc::new(TaskRegistry::new());
        let pipeline = local(Arc::new(UpperGenerator::default())).with_registry(Arc::clone(&registry));

        pipeline.clean("x\n\ny", &|_, _| {}).await.unwrap();
        let task = registry.list(None).await.remove(0);
        assert_eq!(task.kind, TaskKind::Cleaning);
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.unwrap()["cleaned_text"], "X\n\nY");
    }

    #[tokio::test]
    async fn test_preview_cleans_first_chars_as_one_chunk() {
        let generator = Arc::new(UpperGenerator::default());
        let pipeline = local(generator.clone());
        let text = format!("{}\n\n{}", "a".repeat(300), "b".repeat(400));

        let output = pipeline.preview(&text, &|_, _| {}).await.unwrap();
        assert_eq!(output.chars().count(), PREVIEW_CHARS);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    /// Engine whose first chunk is slowest, so replies arrive out of order
    /// if more than one is in flight.
    struct SlowFirst;

    #[async_trait]
    impl InferenceEngine for SlowFirst {
        async fn load(&self, _model_id: &str, _progress: LoadProgressFn<'_>) -> Result<(), InferenceError> {
            Ok(())
        }

        async fn generate(&self, system_prompt: &str, user_content: &str) -> Result<String, InferenceError> {
            let delay = if user_content.starts_with('A') { 80 } else { 5 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(format!("{}:{}", system_prompt.len(), user_content.to_lowercase()))
        }
    }

    #[tokio::test]
    async fn test_through_inference_proxy() {
        let proxy = Arc::new(InferenceProxy::spawn(Arc::new(SlowFirst)));
        proxy.load("tiny").unwrap();
        proxy.wait_ready().await.unwrap();

        let options = CleaningOptions::new(CleaningPreset::LightTouch);
        let prompt_len = options.system_prompt().len();
        let pipeline = CleaningPipeline::new(CleaningBackend::Local(proxy), options);

        let output = pipeline
            .clean("A first\n\nB second\n\nC third", &|_, _| {})
            .await
            .unwrap();
        assert_eq!(
            output,
            format!("{prompt_len}:a first\n\n{prompt_len}:b second\n\n{prompt_len}:c third")
        );
    }

    #[tokio::test]
    async fn test_remote_cleaning_returns_cleaned_text() {
        let fake = Arc::new(FakeTaskService::new());
        let sender = fake.progress_sender(&TaskId::new("job-1")).await;
        let controller = Arc::new(QueueController::new(ClientConfig::default(), fake.clone()));
        let pipeline = CleaningPipeline::new(
            CleaningBackend::Remote(controller),
            CleaningOptions::new(CleaningPreset::TtsOptimization),
        );

        sender.send(Ok(ProgressEvent::Progress { fraction: 0.5, message: "Chunk 1/2".into() })).unwrap();
        sender.send(Ok(ProgressEvent::Complete(json!({ "cleaned_text": "clean" })))).unwrap();

        let (seen, on_progress) = record();
        let output = pipeline.clean("dirty\n\ntext", &on_progress).await.unwrap();
        assert_eq!(output, "clean");
        assert_eq!(seen.lock().unwrap().last().unwrap().0, 1.0);
        assert!(fake
            .calls()
            .await
            .contains(&"submit_cleaning tts_optimization".to_string()));
    }

    #[tokio::test]
    async fn test_remote_failure_is_task_failed() {
        let fake = Arc::new(FakeTaskService::new());
        let sender = fake.progress_sender(&TaskId::new("job-1")).await;
        let controller = Arc::new(QueueController::new(ClientConfig::default(), fake.clone()));
        let pipeline = CleaningPipeline::new(CleaningBackend::Remote(controller), CleaningOptions::default());

        sender.send(Ok(ProgressEvent::Error { message: "backend offline".into() })).unwrap();
        let err = pipeline.clean("text", &|_, _| {}).await.unwrap_err();
        match err {
            ClientError::TaskFailed { task_id, message } => {
                assert_eq!(task_id, TaskId::new("job-1"));
                assert_eq!(message, "backend offline");
            }
            other => panic!("Expected TaskFailed, got {:?}", other),
        }
    }
}
