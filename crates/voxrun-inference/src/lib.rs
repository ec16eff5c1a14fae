//! Local inference for voxrun.
//!
//! A single worker task owns the model engine. Callers go through an
//! [`InferenceProxy`], which correlates each `generate` call with the
//! worker's reply so many calls can be in flight at once.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voxrun_inference::{ChatCompletionsEngine, InferenceProxy};
//!
//! async fn clean() -> Result<(), Box<dyn std::error::Error>> {
//!     let proxy = InferenceProxy::spawn(Arc::new(ChatCompletionsEngine::new(
//!         voxrun_inference::DEFAULT_ENGINE_URL,
//!     )));
//!     proxy.load("qwen2.5-1.5b-instruct")?;
//!     proxy.wait_ready().await?;
//!
//!     let text = proxy.generate("Fix OCR errors.", "teh cat sat", 0).await?;
//!     println!("{}", text);
//!     Ok(())
//! }
//! ```

mod correlation;
mod engine;
mod error;
mod protocol;
mod proxy;
mod worker;

pub use correlation::{CorrelationKey, CorrelationMap, Reply};
pub use engine::{ChatCompletionsEngine, DEFAULT_ENGINE_URL, DEFAULT_TEMPERATURE};
pub use error::InferenceError;
pub use protocol::{WorkerRequest, WorkerResponse};
pub use proxy::{InferenceProxy, ModelState};
pub use worker::{spawn_worker, InferenceEngine, LoadProgressFn, WorkerLink};
