use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use palaver_common::{ChatMessage, Error, Result, Role, ToolCall, UsageInfo};
use reqwest::Client;
use serde_json::{json, Value};

use super::{
    line_stream, status_error, ChatRequest, ChatResponse, ChunkStream, LlmProvider, ProviderChunk,
};

/// Hosted chat over the Gemini REST API. Streaming uses
/// `:streamGenerateContent?alt=sse`, which frames ordinary JSON
/// candidates as SSE data lines; `functionCall` parts map to tool calls.
#[derive(Clone)]
pub struct GeminiProvider {
    api_key: String,
    base_url: String,
    client: Client,
}

impl GeminiProvider {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self { api_key, base_url, client: Client::new() }
    }

    fn build_request_body(&self, request: &ChatRequest) -> Value {
        let contents: Vec<Value> = request
            .messages
            .iter()
            .map(|msg| {
                // Gemini has no system/tool roles in contents; system text and
                // tool results are folded into user turns.
                let role = match msg.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                let text = if msg.role == Role::Tool {
                    format!("[tool result] {}", msg.content)
                } else {
                    msg.content.clone()
                };
                json!({ "role": role, "parts": [{ "text": text }] })
            })
            .collect();

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": request.temperature,
                "maxOutputTokens": request.max_tokens,
            },
        });

        if !request.tools.is_empty() {
            body["tools"] = json!([{
                "functionDeclarations": request
                    .tools
                    .iter()
                    .map(|t| json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }))
                    .collect::<Vec<_>>(),
            }]);
        }

        body
    }
}

fn parse_candidate(frame: &Value) -> (String, Vec<ToolCall>) {
    let mut text = String::new();
    let mut calls = Vec::new();

    let parts = frame["candidates"][0]["content"]["parts"].as_array();
    for part in parts.into_iter().flatten() {
        if let Some(t) = part["text"].as_str() {
            text.push_str(t);
        }
        if let Some(call) = part.get("functionCall") {
            calls.push(ToolCall::new(
                call["name"].as_str().unwrap_or_default().to_string(),
                call["args"].clone(),
            ));
        }
    }

    (text, calls)
}

fn parse_usage(frame: &Value) -> Option<UsageInfo> {
    let meta = frame.get("usageMetadata")?;
    Some(UsageInfo {
        prompt_tokens: meta["promptTokenCount"].as_u64().unwrap_or(0) as u32,
        completion_tokens: meta["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
        total_tokens: meta["totalTokenCount"].as_u64().unwrap_or(0) as u32,
    })
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let start = Instant::now();
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, request.model, self.api_key
        );

        let response = self
            .client
            .post(&url)
            .json(&self.build_request_body(request))
            .send()
            .await
            .map_err(|e| Error::Provider(format!("gemini request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(status_error("gemini", response).await);
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| Error::ProviderOutput(format!("failed to parse gemini response: {e}")))?;

        let (content, tool_calls) = parse_candidate(&raw);
        let usage = parse_usage(&raw);

        Ok(ChatResponse {
            message: ChatMessage {
                role: Role::Assistant,
                content,
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                tool_call_id: None,
                attachments: None,
            },
            usage,
            model: request.model.clone(),
            provider: "gemini".into(),
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, request.model, self.api_key
        );

        let response = self
            .client
            .post(&url)
            .json(&self.build_request_body(request))
            .send()
            .await
            .map_err(|e| Error::Provider(format!("gemini request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(status_error("gemini", response).await);
        }

        let chunks = line_stream(response).filter_map(|line| async move {
            let line = match line {
                Ok(line) => line,
                Err(e) => return Some(Err(e)),
            };
            let data = line.strip_prefix("data: ")?;
            let frame: Value = serde_json::from_str(data).ok()?;

            let (content, tool_calls) = parse_candidate(&frame);
            let usage = parse_usage(&frame);
            let done = frame["candidates"][0]["finishReason"].is_string();
            if content.is_empty() && tool_calls.is_empty() && !done {
                return None;
            }
            Some(Ok(ProviderChunk {
                content,
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                done,
                usage,
            }))
        });

        Ok(Box::pin(chunks))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.api_key.is_empty())
    }
}
