//! The inference worker: owns the engine and serves requests from the proxy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::InferenceError;
use crate::protocol::{WorkerRequest, WorkerResponse};

/// Callback for model load progress: `(fraction, description)`.
pub type LoadProgressFn<'a> = &'a (dyn Fn(f32, &str) + Send + Sync);

/// Text generation backend driven by the worker.
///
/// Implement this trait to plug a model runtime into the worker. The
/// worker only calls `generate` after `load` has succeeded.
#[async_trait]
pub trait InferenceEngine: Send + Sync + 'static {
    /// Load `model_id`, reporting progress as it goes.
    async fn load(&self, model_id: &str, progress: LoadProgressFn<'_>) -> Result<(), InferenceError>;

    /// Generate a completion of `user_content` under `system_prompt`.
    async fn generate(&self, system_prompt: &str, user_content: &str) -> Result<String, InferenceError>;

    /// Reset conversational state after an abort.
    async fn reset(&self) {}
}

/// Channel ends connecting a proxy to a running worker.
pub struct WorkerLink {
    pub requests: mpsc::UnboundedSender<WorkerRequest>,
    pub responses: mpsc::UnboundedReceiver<WorkerResponse>,
}

/// Start a worker for `engine` on its own task.
///
/// The worker runs until the request sender is dropped.
pub fn spawn_worker(engine: Arc<dyn InferenceEngine>) -> WorkerLink {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (response_tx, response_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        info!("Inference worker started");
        serve(engine, request_rx, response_tx).await;
        info!("Inference worker stopped");
    });

    WorkerLink {
        requests: request_tx,
        responses: response_rx,
    }
}

async fn serve(
    engine: Arc<dyn InferenceEngine>,
    mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
    responses: mpsc::UnboundedSender<WorkerResponse>,
) {
    let ready = Arc::new(AtomicBool::new(false));
    let mut load_task: Option<JoinHandle<()>> = None;
    let mut generations = JoinSet::new();

    while let Some(request) = requests.recv().await {
        while generations.try_join_next().is_some() {}

        match request {
            WorkerRequest::Load { model_id } => {
                // A new load supersedes any load still in progress.
                if let Some(previous) = load_task.take() {
                    previous.abort();
                }
                ready.store(false, Ordering::SeqCst);
                info!(model_id = %model_id, "Loading model");

                let engine = Arc::clone(&engine);
                let ready = Arc::clone(&ready);
                let responses = responses.clone();
                load_task = Some(tokio::spawn(async move {
                    let progress_tx = responses.clone();
                    let report = move |progress: f32, text: &str| {
                        let _ = progress_tx.send(WorkerResponse::LoadProgress {
                            progress,
                            text: text.to_string(),
                        });
                    };

                    let response = match engine.load(&model_id, &report).await {
                        Ok(()) => {
                            ready.store(true, Ordering::SeqCst);
                            info!(model_id = %model_id, "Model ready");
                            WorkerResponse::LoadComplete { model_id }
                        }
                        Err(e) => {
                            warn!(model_id = %model_id, error = %e, "Model load failed");
                            let error = match e {
                                InferenceError::LoadFailed(message) => message,
                                other => other.to_string(),
                            };
                            WorkerResponse::LoadError { model_id, error }
                        }
                    };
                    let _ = responses.send(response);
                }));
            }

            WorkerRequest::Generate {
                request_id,
                chunk_index,
                system_prompt,
                user_content,
            } => {
                if !ready.load(Ordering::SeqCst) {
                    let _ = responses.send(WorkerResponse::GenerateError {
                        request_id,
                        chunk_index,
                        error: "Model not loaded".to_string(),
                    });
                    continue;
                }

                debug!(request_id, chunk_index, "Starting generation");
                let engine = Arc::clone(&engine);
                let responses = responses.clone();
                generations.spawn(async move {
                    let response = match engine.generate(&system_prompt, &user_content).await {
                        Ok(text) => WorkerResponse::GenerateComplete {
                            request_id,
                            chunk_index,
                            text,
                        },
                        Err(e) => WorkerResponse::GenerateError {
                            request_id,
                            chunk_index,
                            error: e.to_string(),
                        },
                    };
                    let _ = responses.send(response);
                });
            }

            WorkerRequest::Abort => {
                let in_flight = generations.len();
                generations.abort_all();
                engine.reset().await;
                info!(in_flight, "Worker aborted in-flight generations");
            }
        }
    }

    generations.abort_all();
    if let Some(task) = load_task {
        task.abort();
    }
}
