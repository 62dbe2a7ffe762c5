pub mod providers;

use crate::config::LlmConfig;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM connection error: {0}")]
    Connection(String),
    #[error("LLM response error: {0}")]
    Response(String),
    #[error("LLM configuration error: {0}")]
    Config(String),
}

/// One system + user prompt exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    /// Ask the backend for a JSON object rather than free text.
    pub json: bool,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            temperature: 0.2,
            json: false,
        }
    }

    pub fn json(mut self) -> Self {
        self.json = true;
        self.temperature = 0.0;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

pub type TextStream = BoxStream<'static, Result<String, LlmError>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;

    /// Chunks of the completion as they arrive. Backends without streaming
    /// yield the whole completion as one chunk.
    async fn complete_stream(&self, request: &CompletionRequest) -> Result<TextStream, LlmError> {
        let text = self.complete(request).await?;
        Ok(Box::pin(stream::once(async move { Ok(text) })))
    }
}

/// Pulls a JSON object out of model output: a fenced block, or the outermost
/// braces when the model wrapped it in prose.
pub fn extract_json(content: &str) -> Option<serde_json::Value> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return value.is_object().then_some(value);
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(after[..end].trim()) {
                debug!("Extracted JSON from fenced block");
                return value.is_object().then_some(value);
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<serde_json::Value>(&trimmed[start..=end])
        .ok()
        .filter(serde_json::Value::is_object)
}

pub struct LlmManager {
    backend: Box<dyn LanguageModel>,
}

impl LlmManager {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let backend: Box<dyn LanguageModel> = match config.backend.as_str() {
            "remote" | "openai" => Box::new(providers::remote::RemoteLlmProvider::new(config)?),
            "ollama" => Box::new(providers::ollama::OllamaProvider::new(config)?),
            _ => {
                return Err(LlmError::Config(format!(
                    "Unsupported LLM backend: {}",
                    config.backend
                )))
            }
        };
        info!("LLM backend {} ready with model {}", config.backend, config.model);

        Ok(Self { backend })
    }
}

#[async_trait]
impl LanguageModel for LlmManager {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        self.backend.complete(request).await
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<TextStream, LlmError> {
        self.backend.complete_stream(request).await
    }
}
