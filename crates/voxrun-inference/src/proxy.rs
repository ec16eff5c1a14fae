//! Single-owner proxy in front of the inference worker.
//!
//! Callers `await` a generation while the worker runs elsewhere. Each call
//! is registered in a [`CorrelationMap`] before its request is sent, and a
//! dispatcher task routes worker replies back to the matching caller.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::correlation::{CorrelationKey, CorrelationMap};
use crate::error::InferenceError;
use crate::protocol::{WorkerRequest, WorkerResponse};
use crate::worker::{spawn_worker, InferenceEngine, WorkerLink};

/// Lifecycle of the local model.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ModelState {
    #[default]
    Idle,
    Loading {
        model_id: String,
        progress: f32,
        text: String,
    },
    Ready {
        model_id: String,
    },
    Failed {
        model_id: String,
        error: String,
    },
}

impl ModelState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Handle used by callers to drive the inference worker.
pub struct InferenceProxy {
    requests: mpsc::UnboundedSender<WorkerRequest>,
    correlations: Arc<CorrelationMap>,
    state: Arc<watch::Sender<ModelState>>,
    dispatcher: JoinHandle<()>,
}

impl InferenceProxy {
    /// Start a worker for `engine` and a proxy in front of it.
    pub fn spawn(engine: Arc<dyn InferenceEngine>) -> Self {
        Self::from_link(spawn_worker(engine))
    }

    /// Build a proxy over an existing worker link.
    pub fn from_link(link: WorkerLink) -> Self {
        let correlations = Arc::new(CorrelationMap::new());
        let (state, _) = watch::channel(ModelState::Idle);
        let state = Arc::new(state);

        let dispatcher = tokio::spawn(dispatch(
            link.responses,
            Arc::clone(&correlations),
            Arc::clone(&state),
        ));

        Self {
            requests: link.requests,
            correlations,
            state,
            dispatcher,
        }
    }

    /// Start loading `model_id`. Progress is published through [`Self::subscribe`].
    pub fn load(&self, model_id: impl Into<String>) -> Result<(), InferenceError> {
        let model_id = model_id.into();
        self.state.send_replace(ModelState::Loading {
            model_id: model_id.clone(),
            progress: 0.0,
            text: "Starting".to_string(),
        });
        self.requests
            .send(WorkerRequest::Load { model_id })
            .map_err(|_| InferenceError::WorkerGone)
    }

    pub fn state(&self) -> ModelState {
        self.state.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state.borrow().is_ready()
    }

    /// Watch model state changes.
    pub fn subscribe(&self) -> watch::Receiver<ModelState> {
        self.state.subscribe()
    }

    /// Wait until the current load finishes.
    pub async fn wait_ready(&self) -> Result<(), InferenceError> {
        let mut rx = self.subscribe();
        loop {
            let outcome = match &*rx.borrow_and_update() {
                ModelState::Ready { .. } => Some(Ok(())),
                ModelState::Failed { error, .. } => Some(Err(InferenceError::LoadFailed(error.clone()))),
                ModelState::Idle => Some(Err(InferenceError::NotReady)),
                ModelState::Loading { .. } => None,
            };
            if let Some(outcome) = outcome {
                return outcome;
            }
            rx.changed().await.map_err(|_| InferenceError::WorkerGone)?;
        }
    }

    /// Generate a completion for one chunk.
    ///
    /// Fails with [`InferenceError::NotReady`] until the model is loaded.
    pub async fn generate(
        &self,
        system_prompt: &str,
        user_content: &str,
        chunk_index: usize,
    ) -> Result<String, InferenceError> {
        if !self.is_ready() {
            return Err(InferenceError::NotReady);
        }

        let (key, reply) = self.correlations.register(chunk_index);
        let request = WorkerRequest::Generate {
            request_id: key.request_id,
            chunk_index,
            system_prompt: system_prompt.to_string(),
            user_content: user_content.to_string(),
        };
        if self.requests.send(request).is_err() {
            self.correlations.remove(key);
            return Err(InferenceError::WorkerGone);
        }

        reply.await.unwrap_or(Err(InferenceError::Cancelled))
    }

    /// Tell the worker to reset and reject every outstanding generation.
    ///
    /// The worker may still finish work it already started; those replies
    /// are discarded. A `generate` racing with this call may be rejected
    /// too. Returns how many callers were rejected.
    pub fn abort(&self) -> usize {
        // Queue Abort before the sweep: every Generate ahead of it is then
        // already registered and gets rejected.
        if self.requests.send(WorkerRequest::Abort).is_err() {
            debug!("Abort sent to a stopped worker");
        }
        let rejected = self.correlations.reject_all(|| InferenceError::Cancelled);
        info!(rejected, "Inference aborted");
        rejected
    }

    /// Number of generations awaiting a reply.
    pub fn pending(&self) -> usize {
        self.correlations.len()
    }
}

impl Drop for InferenceProxy {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch(
    mut responses: mpsc::UnboundedReceiver<WorkerResponse>,
    correlations: Arc<CorrelationMap>,
    state: Arc<watch::Sender<ModelState>>,
) {
    while let Some(response) = responses.recv().await {
        trace!(kind = response.kind(), "Worker response");
        match response {
            WorkerResponse::LoadProgress { progress, text } => {
                state.send_if_modified(|current| match current {
                    ModelState::Loading {
                        progress: p,
                        text: t,
                        ..
                    } => {
                        *p = progress;
                        *t = text;
                        true
                    }
                    _ => false,
                });
            }
            WorkerResponse::LoadComplete { model_id } => {
                state.send_if_modified(|current| {
                    let matches = is_loading(current, &model_id);
                    if matches {
                        *current = ModelState::Ready { model_id };
                    }
                    matches
                });
            }
            WorkerResponse::LoadError { model_id, error } => {
                state.send_if_modified(|current| {
                    let matches = is_loading(current, &model_id);
                    if matches {
                        *current = ModelState::Failed { model_id, error };
                    }
                    matches
                });
            }
            WorkerResponse::GenerateComplete {
                request_id,
                chunk_index,
                text,
            } => {
                correlations.resolve(
                    CorrelationKey {
                        chunk_index,
                        request_id,
                    },
                    Ok(text),
                );
            }
            WorkerResponse::GenerateError {
                request_id,
                chunk_index,
                error,
            } => {
                correlations.resolve(
                    CorrelationKey {
                        chunk_index,
                        request_id,
                    },
                    Err(InferenceError::Generation {
                        chunk_index,
                        message: error,
                    }),
                );
            }
        }
    }

    let rejected = correlations.reject_all(|| InferenceError::WorkerGone);
    warn!(rejected, "Inference worker closed its response channel");
}

fn is_loading(state: &ModelState, model_id: &str) -> bool {
    matches!(state, ModelState::Loading { model_id: current, .. } if current == model_id)
}
