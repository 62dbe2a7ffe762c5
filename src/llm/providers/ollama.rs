use crate::config::LlmConfig;
use crate::llm::{CompletionRequest, LanguageModel, LlmError, TextStream};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

pub struct OllamaProvider {
    client: reqwest::Client,
    api_url: String,
    model: String,
}

#[derive(Serialize, Debug)]
struct OllamaRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
    options: OllamaOptions,
}

#[derive(Serialize, Debug)]
struct OllamaOptions {
    temperature: f32,
}

/// One generate response, or one NDJSON line of a streamed one.
#[derive(Deserialize, Debug)]
struct OllamaResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

impl OllamaProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_url = config
            .api_url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434/api/generate".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            model: config.model.clone(),
        })
    }

    fn body<'a>(&'a self, request: &'a CompletionRequest, stream: bool) -> OllamaRequest<'a> {
        OllamaRequest {
            model: &self.model,
            system: &request.system,
            prompt: &request.prompt,
            stream,
            format: request.json.then_some("json"),
            options: OllamaOptions {
                temperature: request.temperature,
            },
        }
    }

    async fn send(&self, request: &CompletionRequest, stream: bool) -> Result<reqwest::Response, LlmError> {
        info!("Sending request to Ollama with model: {}", self.model);
        debug!("API URL: {}", self.api_url);

        let response = self
            .client
            .post(&self.api_url)
            .json(&self.body(request, stream))
            .send()
            .await
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = match response.text().await {
                Ok(body) => format!(" - Response body: {}", body),
                Err(_) => String::new(),
            };

            error!("Ollama API responded with status code: {}{}", status, error_body);
            return Err(LlmError::Response(format!(
                "Ollama API responded with status code: {}{}",
                status, error_body
            )));
        }
        Ok(response)
    }
}

fn parse_line(line: &str) -> Result<OllamaResponse, LlmError> {
    let parsed: OllamaResponse = serde_json::from_str(line).map_err(|e| {
        LlmError::Response(format!("Failed to parse Ollama response: {} - Response was: {}", e, line))
    })?;
    match parsed.error {
        Some(message) => Err(LlmError::Response(message)),
        None => Ok(parsed),
    }
}

#[async_trait]
impl LanguageModel for OllamaProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let response_text = self
            .send(request, false)
            .await?
            .text()
            .await
            .map_err(|e| LlmError::Response(format!("Failed to read response body: {}", e)))?;

        debug!("Raw response from Ollama: {}", response_text);
        let content = parse_line(&response_text)?.response;

        if content.trim().is_empty() {
            return Err(LlmError::Response("Ollama returned an empty completion".to_string()));
        }
        Ok(content)
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<TextStream, LlmError> {
        let mut bytes = Box::pin(self.send(request, true).await?.bytes_stream());

        Ok(Box::pin(try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            let mut finished = false;
            while !finished {
                let Some(chunk) = bytes.next().await else { break };
                let chunk = chunk.map_err(|e| LlmError::Connection(e.to_string()))?;
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    if line.trim().is_empty() {
                        continue;
                    }
                    let parsed = parse_line(line.trim())?;
                    if !parsed.response.is_empty() {
                        yield parsed.response;
                    }
                    if parsed.done {
                        finished = true;
                        break;
                    }
                }
            }
        }))
    }
}
