//! Engine backed by a local OpenAI-compatible chat completions server.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::InferenceError;
use crate::worker::{InferenceEngine, LoadProgressFn};

/// Default address of a locally hosted engine server.
pub const DEFAULT_ENGINE_URL: &str = "http://127.0.0.1:8080/v1";

/// Sampling temperature used for cleaning passes.
pub const DEFAULT_TEMPERATURE: f32 = 0.3;

/// Inference engine that talks to a chat completions server on this machine.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use voxrun_inference::{ChatCompletionsEngine, InferenceProxy};
///
/// async fn run() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = ChatCompletionsEngine::new("http://127.0.0.1:8080/v1");
///     let proxy = InferenceProxy::spawn(Arc::new(engine));
///     proxy.load("qwen2.5-1.5b-instruct")?;
///     proxy.wait_ready().await?;
///
///     let text = proxy.generate("Fix OCR errors.", "teh cat", 0).await?;
///     println!("{}", text);
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct ChatCompletionsEngine {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    temperature: f32,
    model: RwLock<Option<String>>,
}

impl ChatCompletionsEngine {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: None,
            temperature: DEFAULT_TEMPERATURE,
            model: RwLock::new(None),
        }
    }

    /// Send a bearer token with every request.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn loaded_model(&self) -> Option<String> {
        self.model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// An empty reply leaves the input unchanged.
fn reply_or_input(reply: Option<String>, input: &str) -> String {
    match reply {
        Some(text) if !text.trim().is_empty() => text,
        _ => input.to_string(),
    }
}

#[async_trait]
impl InferenceEngine for ChatCompletionsEngine {
    async fn load(&self, model_id: &str, progress: LoadProgressFn<'_>) -> Result<(), InferenceError> {
        progress(0.0, "Connecting to engine");

        let response = self
            .authorize(self.client.get(self.url("models")))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(InferenceError::LoadFailed(format!(
                "engine returned {}",
                response.status()
            )));
        }

        let models: ModelList = response.json().await?;
        progress(0.5, "Checking model");
        if !models.data.iter().any(|m| m.id == model_id) {
            return Err(InferenceError::LoadFailed(format!(
                "model {} is not served by {}",
                model_id, self.base_url
            )));
        }

        *self.model.write().unwrap_or_else(PoisonError::into_inner) = Some(model_id.to_string());
        progress(1.0, "Model ready");
        info!(model_id = %model_id, base_url = %self.base_url, "Engine model selected");
        Ok(())
    }

    async fn generate(&self, system_prompt: &str, user_content: &str) -> Result<String, InferenceError> {
        let model = self.loaded_model().ok_or(InferenceError::NotReady)?;
        let body = ChatRequest {
            model: &model,
            temperature: self.temperature,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_content,
                },
            ],
        };

        debug!(model = %model, input_len = user_content.len(), "Requesting completion");
        let response = self
            .authorize(self.client.post(self.url("chat/completions")))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(InferenceError::Engine(format!(
                "engine returned {}",
                response.status()
            )));
        }

        let completion: ChatResponse = response.json().await?;
        let reply = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content);
        Ok(reply_or_input(reply, user_content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join() {
        let engine = ChatCompletionsEngine::new("http://localhost:8080/v1/");
        assert_eq!(engine.url("models"), "http://localhost:8080/v1/models");
    }

    #[test]
    fn test_empty_reply_keeps_input() {
        assert_eq!(reply_or_input(None, "abc"), "abc");
        assert_eq!(reply_or_input(Some("  \n".to_string()), "abc"), "abc");
        assert_eq!(reply_or_input(Some("fixed".to_string()), "abc"), "fixed");
    }

    #[tokio::test]
    async fn test_generate_without_model_is_not_ready() {
        let engine = ChatCompletionsEngine::new(DEFAULT_ENGINE_URL);
        let err = engine.generate("sys", "text").await.unwrap_err();
        assert!(matches!(err, InferenceError::NotReady));
    }
}
