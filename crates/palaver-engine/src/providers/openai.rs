use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use palaver_common::{ChatMessage, Error, Result, Role, ToolCall, UsageInfo};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use super::{
    line_stream, status_error, ChatRequest, ChatResponse, ChunkStream, LlmProvider, ProviderChunk,
    ToolSchema,
};

/// Hosted chat completions over the OpenAI REST API. Streaming bodies are
/// server-sent events; tool-call argument fragments are accumulated by
/// index and emitted once complete, so downstream consumers only ever see
/// whole tool calls.
#[derive(Clone)]
pub struct OpenAiProvider {
    api_key: String,
    base_url: String,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self { api_key, base_url, client: Client::new() }
    }

    fn convert_request(&self, request: &ChatRequest, stream: bool) -> WireRequest {
        WireRequest {
            model: request.model.clone(),
            messages: request.messages.iter().map(convert_message).collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(request.tools.iter().map(convert_tool).collect())
            },
            tool_choice: if request.tools.is_empty() { None } else { Some("auto".into()) },
            stream,
            stream_options: stream.then_some(WireStreamOptions { include_usage: true }),
        }
    }
}

fn convert_tool(schema: &ToolSchema) -> WireTool {
    WireTool {
        kind: "function".into(),
        function: WireFunctionDef {
            name: schema.name.clone(),
            description: schema.description.clone(),
            parameters: schema.parameters.clone(),
        },
    }
}

fn convert_message(msg: &ChatMessage) -> WireMessage {
    let tool_calls = msg.tool_calls.as_ref().map(|calls| {
        calls
            .iter()
            .map(|c| WireToolCall {
                id: c.id.clone(),
                kind: "function".into(),
                function: WireFunctionCall {
                    name: c.name.clone(),
                    arguments: c.arguments.to_string(),
                },
            })
            .collect()
    });

    WireMessage {
        role: msg.role.as_str().to_string(),
        // The API requires null content when tool_calls are present.
        content: if msg.content.is_empty() && tool_calls.is_some() {
            None
        } else {
            Some(msg.content.clone())
        },
        tool_calls,
        tool_call_id: msg.tool_call_id.clone(),
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let start = Instant::now();
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.convert_request(request, false);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("openai request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(status_error("openai", response).await);
        }

        let parsed: WireResponse = response
            .json()
            .await
            .map_err(|e| Error::ProviderOutput(format!("failed to parse openai response: {e}")))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::ProviderOutput("openai response had no choices".into()))?;

        let tool_calls = choice.message.tool_calls.map(|calls| {
            calls
                .into_iter()
                .map(|c| ToolCall {
                    id: c.id,
                    name: c.function.name,
                    arguments: serde_json::from_str(&c.function.arguments)
                        .unwrap_or(Value::Object(Default::default())),
                })
                .collect()
        });

        Ok(ChatResponse {
            message: ChatMessage {
                role: Role::Assistant,
                content: choice.message.content.unwrap_or_default(),
                tool_calls,
                tool_call_id: None,
                attachments: None,
            },
            usage: parsed.usage.map(Into::into),
            model: parsed.model,
            provider: "openai".into(),
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.convert_request(request, true);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("openai request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(status_error("openai", response).await);
        }

        let (tx, rx) = mpsc::channel::<Result<ProviderChunk>>(16);
        tokio::spawn(async move {
            let mut lines = line_stream(response);
            let mut pending = ToolCallAccumulator::default();
            let mut usage = None;

            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                let Some(data) = line.strip_prefix("data: ") else { continue };
                if data.trim() == "[DONE]" {
                    break;
                }

                let frame: WireStreamChunk = match serde_json::from_str(data) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = tx
                            .send(Err(Error::ProviderOutput(format!("bad openai SSE frame: {e}"))))
                            .await;
                        return;
                    }
                };

                if let Some(u) = frame.usage {
                    usage = Some(u.into());
                }

                for choice in frame.choices {
                    if let Some(calls) = choice.delta.tool_calls {
                        for delta in calls {
                            pending.push(delta);
                        }
                    }
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty()
                            && tx.send(Ok(ProviderChunk { content, ..Default::default() })).await.is_err()
                        {
                            return;
                        }
                    }
                }
            }

            let tool_calls = pending.finish();
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
        let url = format!("{}/models", self.base_url);
        match self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
        {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(e) => {
                warn!("openai health check failed: {e}");
                Ok(false)
            }
        }
    }
}

/// Reassembles streamed tool-call fragments, keyed by choice index.
#[derive(Default)]
struct ToolCallAccumulator {
    slots: Vec<(Option<String>, String, String)>, // (id, name, argument json)
}

impl ToolCallAccumulator {
    fn push(&mut self, delta: WireStreamToolCall) {
        let index = delta.index as usize;
        while self.slots.len() <= index {
            self.slots.push((None, String::new(), String::new()));
        }
        let slot = &mut self.slots[index];
        if let Some(id) = delta.id {
            slot.0 = Some(id);
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                slot.1.push_str(&name);
            }
            if let Some(arguments) = function.arguments {
                slot.2.push_str(&arguments);
            }
        }
    }

    fn finish(self) -> Vec<ToolCall> {
        self.slots
            .into_iter()
            .filter(|(_, name, _)| !name.is_empty())
            .map(|(id, name, arguments)| ToolCall {
                id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                name,
                arguments: serde_json::from_str(&arguments)
                    .unwrap_or(Value::Object(Default::default())),
            })
            .collect()
    }
}

// Wire types.

#[derive(Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    temperature: f64,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<WireStreamOptions>,
}

#[derive(Serialize)]
struct WireStreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct WireMessage {
    role: String,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: String,
    function: WireFunctionDef,
}

#[derive(Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Deserialize)]
struct WireResponse {
    model: String,
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize, Clone, Copy)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<WireUsage> for UsageInfo {
    fn from(u: WireUsage) -> Self {
        UsageInfo {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Deserialize)]
struct WireStreamChunk {
    #[serde(default)]
    choices: Vec<WireStreamChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireStreamChoice {
    delta: WireStreamDelta,
}

#[derive(Deserialize)]
struct WireStreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<WireStreamToolCall>>,
}

#[derive(Deserialize)]
struct WireStreamToolCall {
    index: u32,
    id: Option<String>,
    function: Option<WireStreamFunction>,
}

#[derive(Deserialize)]
struct WireStreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}
