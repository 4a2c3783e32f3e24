use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use palaver_common::{ChatMessage, Error, Result, ToolCall, UsageInfo};
use palaver_config::ProviderConfig;
use serde::{Deserialize, Serialize};

pub mod anthropic;
pub mod gemini;
pub mod ollama;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use ollama::{OllamaEmbeddings, OllamaProvider};
pub use openai::OpenAiProvider;

/// A tool definition as exposed to the model and cached by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub origin_host: String,
}

/// One request to a provider, streaming or not.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub tools: Vec<ToolSchema>,
}

/// A full (non-streaming) completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub message: ChatMessage,
    pub usage: Option<UsageInfo>,
    pub model: String,
    pub provider: String,
    pub latency_ms: u64,
}

/// One increment of a streaming completion.
#[derive(Debug, Clone, Default)]
pub struct ProviderChunk {
    pub content: String,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub done: bool,
    pub usage: Option<UsageInfo>,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ProviderChunk>> + Send>>;

/// Trait for LLM provider integrations (Ollama, OpenAI, Anthropic, Gemini).
///
/// The streamed sequence is finite; dropping the stream closes the
/// underlying HTTP response, which is how cancellation propagates upstream.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g. "ollama", "openai").
    fn name(&self) -> &str;

    /// Send a completion request and wait for the full response.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Send a streaming completion request and return a stream of chunks.
    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream>;

    /// Check if the provider is reachable and configured.
    async fn health_check(&self) -> Result<bool>;
}

/// Build the configured provider variant by name.
pub fn build_provider(cfg: &ProviderConfig) -> Result<Arc<dyn LlmProvider>> {
    match cfg.default_provider.as_str() {
        "ollama" => Ok(Arc::new(OllamaProvider::new(cfg.ollama_base_url.clone()))),
        "openai" => {
            let key = cfg
                .openai_api_key
                .clone()
                .ok_or_else(|| Error::Config("OPENAI_API_KEY not set".into()))?;
            Ok(Arc::new(OpenAiProvider::new(key, cfg.openai_base_url.clone())))
        }
        "anthropic" => {
            let key = cfg
                .anthropic_api_key
                .clone()
                .ok_or_else(|| Error::Config("ANTHROPIC_API_KEY not set".into()))?;
            Ok(Arc::new(AnthropicProvider::new(key, cfg.anthropic_base_url.clone())))
        }
        "gemini" => {
            let key = cfg
                .gemini_api_key
                .clone()
                .ok_or_else(|| Error::Config("GEMINI_API_KEY not set".into()))?;
            Ok(Arc::new(GeminiProvider::new(key, cfg.gemini_base_url.clone())))
        }
        other => Err(Error::Config(format!("unknown provider '{other}'"))),
    }
}

/// Split a streaming HTTP body into lines. Used for both NDJSON bodies
/// (Ollama) and SSE bodies (hosted providers), which are newline-framed
/// either way. Trailing un-terminated data is flushed at end of stream.
pub(crate) fn line_stream(response: reqwest::Response) -> BoxStream<'static, Result<String>> {
    let bytes = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(|e| Error::Provider(format!("stream read failed: {e}"))));
    let bytes: BoxStream<'static, Result<Bytes>> = Box::pin(bytes);

    let stream = futures::stream::unfold(
        (bytes, Vec::new()),
        |(mut bytes, mut buffer): (BoxStream<'static, Result<Bytes>>, Vec<u8>)| async move {
            loop {
                if let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(0..=pos).collect();
                    let text = String::from_utf8_lossy(&line[..line.len() - 1])
                        .trim_end_matches('\r')
                        .to_string();
                    if !text.is_empty() {
                        return Some((Ok(text), (bytes, buffer)));
                    }
                    continue;
                }

                match bytes.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(e), (bytes, buffer))),
                    None => {
                        if buffer.is_empty() {
                            return None;
                        }
                        let text = String::from_utf8_lossy(&buffer).trim().to_string();
                        buffer.clear();
                        if text.is_empty() {
                            return None;
                        }
                        return Some((Ok(text), (bytes, buffer)));
                    }
                }
            }
        },
    );

    Box::pin(stream)
}

/// Read the non-success body into a typed provider error.
pub(crate) async fn status_error(provider: &str, response: reqwest::Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Error::Provider(format!("{provider} API error: status={status}, body={body}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_config::ProviderConfig;

    #[test]
    fn factory_selects_by_name() {
        let mut cfg = ProviderConfig::default();
        assert_eq!(build_provider(&cfg).unwrap().name(), "ollama");

        cfg.default_provider = "openai".into();
        assert!(build_provider(&cfg).is_err(), "missing key must fail");
        cfg.openai_api_key = Some("sk-test".into());
        assert_eq!(build_provider(&cfg).unwrap().name(), "openai");

        cfg.default_provider = "hal9000".into();
        assert!(build_provider(&cfg).is_err());
    }
}
