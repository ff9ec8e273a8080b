//! The completion capability as seen by the pipeline.
//!
//! Both the relevance selector and the answer synthesizer send one
//! system + user message pair and read back a single reply. Backends differ only
//! in wire format, so the pipeline holds an `Arc<dyn CompletionBackend>`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{AppConfig, BackendKind};
use crate::error::CompletionError;
use crate::ollama::OllamaClient;
use crate::openai::OpenAiClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub mode: OutputMode,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError>;
}

pub fn backend_from_config(
    config: &AppConfig,
) -> Result<Arc<dyn CompletionBackend>, CompletionError> {
    let timeout = config.completion.timeout();
    let backend: Arc<dyn CompletionBackend> = match config.completion.backend {
        BackendKind::OpenAi => Arc::new(OpenAiClient::new(
            config.completion.openai_base_url.clone(),
            config.completion.openai_api_key.clone(),
            timeout,
        )?),
        BackendKind::Ollama => Arc::new(OllamaClient::new(
            config.completion.ollama_base_url.clone(),
            timeout,
        )?),
    };
    tracing::info!(backend = backend.name(), "completion backend ready");
    Ok(backend)
}

/// Reduces an upstream error body to its `error` message when it is JSON.
pub(crate) fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(err) = json.get("error").and_then(|v| v.as_str()) {
            return err.to_string();
        }
        if let Some(err) = json
            .get("error")
            .and_then(|v| v.get("message"))
            .and_then(|v| v.as_str())
        {
            return err.to_string();
        }
    }

    trimmed.to_string()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_prefers_json_error_message() {
        assert_eq!(normalize_err_body(""), "<empty body>");
        assert_eq!(
            normalize_err_body(r#"{"error":"model 'x' not found"}"#),
            "model 'x' not found"
        );
        assert_eq!(
            normalize_err_body(r#"{"error":{"message":"Incorrect API key","type":"auth"}}"#),
            "Incorrect API key"
        );
        assert_eq!(normalize_err_body(" bad gateway "), "bad gateway");
    }
}
