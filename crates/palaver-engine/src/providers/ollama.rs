use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use palaver_common::{ChatMessage, Error, Result, Role, ToolCall, UsageInfo};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::{
    line_stream, status_error, ChatRequest, ChatResponse, ChunkStream, LlmProvider, ProviderChunk,
};

/// Local inference over the Ollama HTTP API. Streaming responses are
/// newline-delimited JSON objects; tool calls arrive structured on the
/// `message.tool_calls` field for models that support them.
#[derive(Clone)]
pub struct OllamaProvider {
    base_url: String,
    client: Client,
}

impl OllamaProvider {
    pub fn new(base_url: String) -> Self {
        Self { base_url, client: Client::new() }
    }

    fn build_request_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(format_message).collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": stream,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
        });

        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }

        body
    }
}

fn format_message(msg: &ChatMessage) -> Value {
    let mut out = json!({
        "role": msg.role.as_str(),
        "content": msg.content,
    });

    if let Some(calls) = &msg.tool_calls {
        out["tool_calls"] = Value::Array(
            calls
                .iter()
                .map(|c| {
                    json!({
                        "type": "function",
                        "function": { "name": c.name, "arguments": c.arguments },
                    })
                })
                .collect(),
        );
    }

    // Multimodal side-channel: Ollama expects base64 image data per message.
    if msg.role == Role::User {
        if let Some(attachments) = &msg.attachments {
            let images: Vec<&str> = attachments
                .iter()
                .filter(|a| a.is_image())
                .filter_map(|a| a.base64_data.as_deref())
                .collect();
            if !images.is_empty() {
                out["images"] = json!(images);
            }
        }
    }

    out
}

#[derive(Deserialize)]
struct OllamaResponse {
    model: Option<String>,
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}

#[derive(Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
    tool_calls: Option<Vec<OllamaToolCall>>,
}

#[derive(Deserialize)]
struct OllamaToolCall {
    function: OllamaFunction,
}

#[derive(Deserialize)]
struct OllamaFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

impl OllamaResponse {
    fn tool_calls(&self) -> Option<Vec<ToolCall>> {
        let calls = self.message.as_ref()?.tool_calls.as_ref()?;
        if calls.is_empty() {
            return None;
        }
        Some(
            calls
                .iter()
                .map(|c| ToolCall::new(c.function.name.clone(), c.function.arguments.clone()))
                .collect(),
        )
    }

    fn usage(&self) -> Option<UsageInfo> {
        if !self.done {
            return None;
        }
        Some(UsageInfo {
            prompt_tokens: self.prompt_eval_count,
            completion_tokens: self.eval_count,
            total_tokens: self.prompt_eval_count + self.eval_count,
        })
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let start = Instant::now();
        let body = self.build_request_body(request, false);
        let url = format!("{}/api/chat", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("ollama request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(status_error("ollama", response).await);
        }

        let parsed: OllamaResponse = response
            .json()
            .await
            .map_err(|e| Error::ProviderOutput(format!("failed to parse ollama response: {e}")))?;

        let tool_calls = parsed.tool_calls();
        let content = parsed.message.as_ref().map(|m| m.content.clone()).unwrap_or_default();
        let usage = parsed.usage();

        Ok(ChatResponse {
            message: ChatMessage {
                role: Role::Assistant,
                content,
                tool_calls,
                tool_call_id: None,
                attachments: None,
            },
            usage,
            model: parsed.model.unwrap_or_else(|| request.model.clone()),
            provider: "ollama".into(),
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream> {
        let body = self.build_request_body(request, true);
        let url = format!("{}/api/chat", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("ollama request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(status_error("ollama", response).await);
        }

        let chunks = line_stream(response).map(|line| {
            let line = line?;
            let parsed: OllamaResponse = serde_json::from_str(&line)
                .map_err(|e| Error::ProviderOutput(format!("bad ollama stream frame: {e}")))?;

            Ok(ProviderChunk {
                content: parsed.message.as_ref().map(|m| m.content.clone()).unwrap_or_default(),
                tool_calls: parsed.tool_calls(),
                done: parsed.done,
                usage: parsed.usage(),
            })
        });

        Ok(Box::pin(chunks))
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(e) => {
                warn!("ollama health check failed: {e}");
                Ok(false)
            }
        }
    }
}

/// Embedding client over the same Ollama instance. Kept local even when
/// the chat provider is hosted, so message text never leaves the machine
/// for recall purposes.
#[derive(Clone)]
pub struct OllamaEmbeddings {
    base_url: String,
    model: String,
    dim: usize,
    client: Client,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbeddings {
    pub fn new(base_url: String, model: String, dim: usize) -> Self {
        Self { base_url, model, dim, client: Client::new() }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Embed one text. Dimensionality mismatches are rejected, not coerced.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.is_empty() {
            return Err(Error::ProviderOutput("cannot embed empty text".into()));
        }

        let url = format!("{}/api/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "model": self.model, "prompt": text }))
            .send()
            .await
            .map_err(|e| Error::Provider(format!("embedding request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(status_error("ollama embeddings", response).await);
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::ProviderOutput(format!("bad embedding response: {e}")))?;

        if parsed.embedding.len() != self.dim {
            return Err(Error::ProviderOutput(format!(
                "embedding dimension mismatch: got {}, expected {}",
                parsed.embedding.len(),
                self.dim
            )));
        }

        Ok(parsed.embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ToolSchema;
    use palaver_common::Attachment;

    fn request(messages: Vec<ChatMessage>, tools: Vec<ToolSchema>) -> ChatRequest {
        ChatRequest { messages, model: "llama3.2".into(), temperature: 0.7, max_tokens: 256, tools }
    }

    #[test]
    fn request_body_carries_options_and_tools() {
        let provider = OllamaProvider::new("http://localhost:11434".into());
        let tools = vec![ToolSchema {
            name: "read_file".into(),
            description: "Read a file".into(),
            parameters: json!({"type": "object"}),
            origin_host: "filesystem".into(),
        }];
        let body = provider.build_request_body(&request(vec![ChatMessage::user("hi")], tools), true);

        assert_eq!(body["model"], "llama3.2");
        assert_eq!(body["stream"], true);
        assert_eq!(body["options"]["temperature"], 0.7);
        assert_eq!(body["options"]["num_predict"], 256);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["tools"][0]["function"]["name"], "read_file");
    }

    #[test]
    fn image_attachments_become_images_field() {
        let msg = ChatMessage {
            attachments: Some(vec![Attachment {
                kind: "image".into(),
                base64_data: Some("aGVsbG8=".into()),
                transcription: None,
            }]),
            ..ChatMessage::user("what is this?")
        };
        let body = format_message(&msg);
        assert_eq!(body["images"][0], "aGVsbG8=");
    }

    #[test]
    fn assistant_tool_calls_are_replayed_to_the_model() {
        let msg = ChatMessage {
            tool_calls: Some(vec![ToolCall::new("git_status", json!({}))]),
            ..ChatMessage::assistant("")
        };
        let body = format_message(&msg);
        assert_eq!(body["tool_calls"][0]["function"]["name"], "git_status");
    }

    // Integration tests against a mock Ollama server.
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use tokio::sync::oneshot;

    async fn run_mock_server() -> (String, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel::<()>();

        let app = Router::new()
            .route(
                "/api/tags",
                get(|| async { Json(json!({ "models": [{ "name": "llama3.2" }] })) }),
            )
            .route(
                "/api/chat",
                post(|Json(payload): Json<Value>| async move {
                    let stream = payload["stream"].as_bool().unwrap_or(false);
                    if stream {
                        concat!(
                            "{\"model\":\"llama3.2\",\"message\":{\"role\":\"assistant\",\"content\":\"Hello\"},\"done\":false}\n",
                            "{\"model\":\"llama3.2\",\"message\":{\"role\":\"assistant\",\"content\":\" there\"},\"done\":false}\n",
                            "{\"model\":\"llama3.2\",\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"prompt_eval_count\":7,\"eval_count\":2}\n",
                        )
                        .to_string()
                    } else {
                        json!({
                            "model": "llama3.2",
                            "message": {
                                "role": "assistant",
                                "content": "",
                                "tool_calls": [
                                    {"function": {"name": "read_file", "arguments": {"path": "README.md"}}}
                                ]
                            },
                            "done": true,
                            "prompt_eval_count": 11,
                            "eval_count": 3
                        })
                        .to_string()
                    }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}");

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    rx.await.ok();
                })
                .await
                .unwrap();
        });

        (url, tx)
    }

    #[tokio::test]
    async fn complete_surfaces_structured_tool_calls() {
        let (url, stop) = run_mock_server().await;
        let provider = OllamaProvider::new(url);

        let response = provider
            .complete(&request(vec![ChatMessage::user("read the readme")], vec![]))
            .await
            .unwrap();

        let calls = response.message.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].arguments["path"], "README.md");
        assert!(!calls[0].id.is_empty());
        assert_eq!(response.usage.unwrap().prompt_tokens, 11);

        let _ = stop.send(());
    }

    #[tokio::test]
    async fn stream_yields_content_then_done() {
        let (url, stop) = run_mock_server().await;
        let provider = OllamaProvider::new(url);

        let mut stream = provider
            .stream(&request(vec![ChatMessage::user("hi")], vec![]))
            .await
            .unwrap();

        let mut text = String::new();
        let mut saw_done = false;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            text.push_str(&chunk.content);
            if chunk.done {
                saw_done = true;
                assert_eq!(chunk.usage.unwrap().completion_tokens, 2);
            }
        }
        assert_eq!(text, "Hello there");
        assert!(saw_done);

        let _ = stop.send(());
    }

    #[tokio::test]
    async fn health_check_reports_reachability() {
        let (url, stop) = run_mock_server().await;
        let provider = OllamaProvider::new(url);
        assert!(provider.health_check().await.unwrap());
        let _ = stop.send(());

        let dead = OllamaProvider::new("http://127.0.0.1:1".into());
        assert!(!dead.health_check().await.unwrap());
    }
}
