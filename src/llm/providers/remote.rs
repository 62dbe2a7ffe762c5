use crate::config::LlmConfig;
use crate::llm::{CompletionRequest, LanguageModel, LlmError, TextStream};
use async_stream::try_stream;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

/// OpenAI-compatible chat completions endpoint.
pub struct RemoteLlmProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    max_tokens: usize,
}

#[derive(Serialize)]
struct PromptRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    max_tokens: usize,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct PromptResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

impl RemoteLlmProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_url = config.api_url.clone().ok_or_else(|| {
            LlmError::Config("API URL is required for remote LLM provider".to_string())
        })?;

        let api_key = config.api_key.clone().ok_or_else(|| {
            LlmError::Config("API key is required for remote LLM provider".to_string())
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    fn body<'a>(&'a self, request: &'a CompletionRequest, stream: bool) -> PromptRequest<'a> {
        PromptRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: &request.system,
                },
                Message {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            temperature: request.temperature,
            max_tokens: self.max_tokens,
            stream,
            response_format: request.json.then_some(ResponseFormat { kind: "json_object" }),
        }
    }

    async fn send(&self, request: &CompletionRequest, stream: bool) -> Result<reqwest::Response, LlmError> {
        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&self.body(request, stream))
            .send()
            .await
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            error!("LLM API responded with status code: {}", status);
            return Err(LlmError::Response(format!(
                "API responded with status code: {}",
                status
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl LanguageModel for RemoteLlmProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        debug!("Sending completion request to {} ({})", self.api_url, self.model);
        let prompt_response: PromptResponse = self
            .send(request, false)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::Response(e.to_string()))?;

        prompt_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Response("No choices in response".to_string()))
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<TextStream, LlmError> {
        let response = self.send(request, true).await?;
        let mut events = Box::pin(response.bytes_stream().eventsource());

        Ok(Box::pin(try_stream! {
            while let Some(event) = events.next().await {
                let event = event.map_err(|e| LlmError::Connection(format!("SSE stream error: {e}")))?;
                if event.data.trim() == "[DONE]" {
                    break;
                }
                let chunk: StreamChunk = serde_json::from_str(&event.data)
                    .map_err(|e| LlmError::Response(format!("failed to parse stream chunk: {e}")))?;
                for choice in chunk.choices {
                    if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                        yield text;
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LlmConfig {
        LlmConfig {
            backend: "remote".into(),
            model: "gpt-4o-mini".into(),
            api_key: Some("sk-test".into()),
            api_url: Some("https://example.invalid/v1/chat/completions".into()),
            ..LlmConfig::default()
        }
    }

    #[test]
    fn json_requests_ask_for_json_objects() {
        let provider = RemoteLlmProvider::new(&config()).unwrap();
        let request = CompletionRequest::new("sys", "classify this").json();
        let body = serde_json::to_value(provider.body(&request, false)).unwrap();
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "classify this");

        let plain = serde_json::to_value(provider.body(&CompletionRequest::new("s", "p"), true)).unwrap();
        assert!(plain.get("response_format").is_none());
        assert_eq!(plain["stream"], true);
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let mut cfg = config();
        cfg.api_key = None;
        assert!(matches!(RemoteLlmProvider::new(&cfg), Err(LlmError::Config(_))));
    }

    #[test]
    fn stream_chunks_tolerate_missing_fields() {
        let chunk: StreamChunk =
            serde_json::from_str(r#"{"choices":[{"delta":{"content":"Hel"}},{"delta":{}}]}"#).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hel"));
        assert!(chunk.choices[1].delta.content.is_none());
    }
}
