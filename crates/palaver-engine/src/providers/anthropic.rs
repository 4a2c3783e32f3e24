use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use palaver_common::{ChatMessage, Error, Result, Role, ToolCall, UsageInfo};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

use super::{
    line_stream, status_error, ChatRequest, ChatResponse, ChunkStream, LlmProvider, ProviderChunk,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Hosted chat over the Anthropic Messages API. The system prompt rides in
/// the dedicated `system` field; tool results go back as `tool_result`
/// blocks inside user-role messages.
#[derive(Clone)]
pub struct AnthropicProvider {
    api_key: String,
    base_url: String,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self { api_key, base_url, client: Client::new() }
    }

    fn build_request_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut system_parts = Vec::new();
        let mut messages = Vec::new();

        for msg in &request.messages {
            match msg.role {
                Role::System => system_parts.push(msg.content.clone()),
                Role::User => {
                    messages.push(json!({ "role": "user", "content": msg.content }));
                }
                Role::Assistant => {
                    let mut blocks = Vec::new();
                    if !msg.content.is_empty() {
                        blocks.push(json!({ "type": "text", "text": msg.content }));
                    }
                    for call in msg.tool_calls.as_deref().unwrap_or_default() {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": call.arguments,
                        }));
                    }
                    if blocks.is_empty() {
                        blocks.push(json!({ "type": "text", "text": "" }));
                    }
                    messages.push(json!({ "role": "assistant", "content": blocks }));
                }
                // Tool results are user-role tool_result blocks on this API.
                Role::Tool => {
                    messages.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": msg.tool_call_id,
                            "content": msg.content,
                        }],
                    }));
                }
            }
        }

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": stream,
        });

        if !system_parts.is_empty() {
            body["system"] = json!(system_parts.join("\n\n"));
        }

        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect(),
            );
        }

        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        self.client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("anthropic request failed: {e}")))
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let start = Instant::now();
        let body = self.build_request_body(request, false);
        let response = self.post(&body).await?;

        if !response.status().is_success() {
            return Err(status_error("anthropic", response).await);
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| Error::ProviderOutput(format!("failed to parse anthropic response: {e}")))?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in raw["content"].as_array().into_iter().flatten() {
            match block["type"].as_str() {
                Some("text") => content.push_str(block["text"].as_str().unwrap_or_default()),
                Some("tool_use") => tool_calls.push(ToolCall {
                    id: block["id"].as_str().unwrap_or_default().to_string(),
                    name: block["name"].as_str().unwrap_or_default().to_string(),
                    arguments: block["input"].clone(),
                }),
                _ => {}
            }
        }

        let usage = raw["usage"].as_object().map(|u| {
            let prompt = u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0) as u32;
            let completion = u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0) as u32;
            UsageInfo { prompt_tokens: prompt, completion_tokens: completion, total_tokens: prompt + completion }
        });

        Ok(ChatResponse {
            message: ChatMessage {
                role: Role::Assistant,
                content,
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                tool_call_id: None,
                attachments: None,
            },
            usage,
            model: raw["model"].as_str().unwrap_or(&request.model).to_string(),
            provider: "anthropic".into(),
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream> {
        let body = self.build_request_body(request, true);
        let response = self.post(&body).await?;

        if !response.status().is_success() {
            return Err(status_error("anthropic", response).await);
        }

        let (tx, rx) = mpsc::channel::<Result<ProviderChunk>>(16);
        tokio::spawn(async move {
            let mut lines = line_stream(response);
            // In-flight tool_use block: (id, name, partial input json).
            let mut current_tool: Option<(String, String, String)> = None;
            let mut tool_calls: Vec<ToolCall> = Vec::new();
            let mut usage: Option<UsageInfo> = None;

            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                let Some(data) = line.strip_prefix("data: ") else { continue };
                let Ok(event) = serde_json::from_str::<Value>(data) else { continue };

                match event["type"].as_str().unwrap_or_default() {
                    "content_block_start" => {
                        let block = &event["content_block"];
                        if block["type"] == "tool_use" {
                            current_tool = Some((
                                block["id"].as_str().unwrap_or_default().to_string(),
                                block["name"].as_str().unwrap_or_default().to_string(),
                                String::new(),
                            ));
                        }
                    }
                    "content_block_delta" => {
                        let delta = &event["delta"];
                        match delta["type"].as_str().unwrap_or_default() {
                            "text_delta" => {
                                let text = delta["text"].as_str().unwrap_or_default().to_string();
                                if !text.is_empty()
                                    && tx
                                        .send(Ok(ProviderChunk { content: text, ..Default::default() }))
                                        .await
                                        .is_err()
                                {
                                    return;
                                }
                            }
                            "input_json_delta" => {
                                if let Some((_, _, input)) = current_tool.as_mut() {
                                    input.push_str(delta["partial_json"].as_str().unwrap_or_default());
                                }
                            }
                            _ => {}
                        }
                    }
                    "content_block_stop" => {
                        if let Some((id, name, input)) = current_tool.take() {
                            tool_calls.push(ToolCall {
                                id,
                                name,
                                arguments: serde_json::from_str(&input)
                                    .unwrap_or(Value::Object(Default::default())),
                            });
                        }
                    }
                    "message_delta" => {
                        if let Some(output) = event["usage"]["output_tokens"].as_u64() {
                            usage = Some(UsageInfo {
                                prompt_tokens: 0,
                                completion_tokens: output as u32,
                                total_tokens: output as u32,
                            });
                        }
                    }
                    "message_stop" => break,
                    _ => {}
                }
            }

            let final_chunk = ProviderChunk {
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                done: true,
                usage,
                ..Default::default()
            };
            let _ = tx.send(Ok(final_chunk)).await;
        });

        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    async fn health_check(&self) -> Result<bool> {
        let body = json!({
            "model": "claude-3-5-haiku-latest",
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "ping"}],
        });
        match self.post(&body).await {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(e) => {
                warn!("anthropic health check failed: {e}");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            messages,
            model: "claude-3-5-haiku-latest".into(),
            temperature: 0.5,
            max_tokens: 128,
            tools: vec![],
        }
    }

    #[test]
    fn system_messages_ride_the_system_field() {
        let provider = AnthropicProvider::new("key".into(), "http://localhost".into());
        let body = provider.build_request_body(
            &request(vec![ChatMessage::system("be terse"), ChatMessage::user("hi")]),
            false,
        );
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn tool_results_become_user_tool_result_blocks() {
        let provider = AnthropicProvider::new("key".into(), "http://localhost".into());
        let body = provider.build_request_body(
            &request(vec![ChatMessage::tool_result("t1", "file contents")]),
            false,
        );
        let block = &body["messages"][0]["content"][0];
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(block["type"], "tool_result");
        assert_eq!(block["tool_use_id"], "t1");
        assert_eq!(block["content"], "file contents");
    }

    #[test]
    fn assistant_tool_calls_become_tool_use_blocks() {
        let provider = AnthropicProvider::new("key".into(), "http://localhost".into());
        let msg = ChatMessage {
            tool_calls: Some(vec![ToolCall {
                id: "t1".into(),
                name: "git_diff".into(),
                arguments: json!({"staged": true}),
            }]),
            ..ChatMessage::assistant("checking the diff")
        };
        let body = provider.build_request_body(&request(vec![msg]), false);
        let blocks = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "text");
        assert_eq!(blocks[1]["type"], "tool_use");
        assert_eq!(blocks[1]["name"], "git_diff");
        assert_eq!(blocks[1]["input"]["staged"], true);
    }

    // Streaming test against a mock SSE endpoint.
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn stream_assembles_tool_use_from_input_deltas() {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let body = concat!(
            "data: {\"type\":\"message_start\"}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Let me check.\"}}\n\n",
            "data: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"tu_1\",\"name\":\"read_file\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"path\\\":\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"\\\"README.md\\\"}\"}}\n\n",
            "data: {\"type\":\"content_block_stop\",\"index\":1}\n\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"},\"usage\":{\"output_tokens\":9}}\n\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );

        let app = Router::new().route(
            "/v1/messages",
            post(move |Json(_): Json<Value>| async move { body.to_string() }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    stop_rx.await.ok();
                })
                .await
                .unwrap();
        });

        let provider = AnthropicProvider::new("key".into(), format!("http://{addr}"));
        let mut stream = provider.stream(&request(vec![ChatMessage::user("read it")])).await.unwrap();

        let mut text = String::new();
        let mut final_calls = None;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            text.push_str(&chunk.content);
            if chunk.done {
                final_calls = chunk.tool_calls;
                assert_eq!(chunk.usage.unwrap().completion_tokens, 9);
            }
        }

        assert_eq!(text, "Let me check.");
        let calls = final_calls.unwrap();
        assert_eq!(calls[0].id, "tu_1");
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].arguments["path"], "README.md");

        let _ = stop_tx.send(());
    }
}
