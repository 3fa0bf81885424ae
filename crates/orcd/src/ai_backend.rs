//! AI backend abstraction (Section 4.3.5, 9).
//!
//! The model-catalog, skill-library, and detailed AI tool set are out of
//! core scope (Section 1); this trait is the single opaque seam the AI
//! worker calls through, with a production HTTP-calling implementation
//! and a deterministic mock wired in at startup based on `ai.useMock`.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AiBackendError {
    #[error("ai backend request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("ai backend returned an error status: {0}")]
    Status(reqwest::StatusCode),
}

#[async_trait]
pub trait AiBackend: Send + Sync {
    async fn send_prompt(&self, prompt: &str, model: Option<&str>) -> Result<String, AiBackendError>;
}

/// Calls a configured HTTP completion endpoint. The wire contract of that
/// endpoint is an external collaborator (Section 1); this client only
/// needs `{prompt, model}` in, text out.
pub struct HttpAiBackend {
    client: reqwest::Client,
    endpoint: String,
    default_model: String,
}

impl HttpAiBackend {
    pub fn new(endpoint: String, default_model: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("reqwest client builds"),
            endpoint,
            default_model,
        }
    }
}

#[derive(serde::Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    model: &'a str,
}

#[derive(serde::Deserialize)]
struct CompletionResponse {
    text: String,
}

#[async_trait]
impl AiBackend for HttpAiBackend {
    async fn send_prompt(&self, prompt: &str, model: Option<&str>) -> Result<String, AiBackendError> {
        let model = model.unwrap_or(&self.default_model);
        let response = self
            .client
            .post(&self.endpoint)
            .json(&CompletionRequest { prompt, model })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AiBackendError::Status(response.status()));
        }
        let body: CompletionResponse = response.json().await?;
        Ok(body.text)
    }
}

/// Deterministic, input-derived backend used when `ai.useMock = true`, and
/// in tests so the worker suite runs offline.
pub struct MockAiBackend;

#[async_trait]
impl AiBackend for MockAiBackend {
    async fn send_prompt(&self, prompt: &str, model: Option<&str>) -> Result<String, AiBackendError> {
        let model = model.unwrap_or("mock");
        Ok(format!("[mock:{model}] {prompt}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_backend_echoes_prompt() {
        let backend = MockAiBackend;
        let result = backend.send_prompt("Weather for Mooresville, NC", None).await.unwrap();
        assert!(result.contains("Weather for Mooresville, NC"));
    }
}
