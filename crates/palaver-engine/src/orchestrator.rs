use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use palaver_common::{ChatMessage, Error, Result, Role, StreamChunk, ToolCall, UsageInfo};
use palaver_config::AppConfig;
use palaver_db::{ConversationStore, MessageMetrics, NewMessage};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::agentic;
use crate::classifier::{self, Complexity};
use crate::mcp::ToolRegistry;
use crate::memory::{BackgroundMemory, ContextAssembler};
use crate::providers::{ChatRequest, LlmProvider, ToolSchema};
use crate::salvage::salvage_tool_calls;

/// One inbound turn as received from the transport.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub model: Option<String>,
}

impl TurnRequest {
    /// The new user input for this turn: the last user-role message.
    pub fn user_message(&self) -> Option<&ChatMessage> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }
}

/// Drives a whole user turn: classification, path selection, the bounded
/// LLM/tool loop, streaming to the client, and persistence.
pub struct ChatOrchestrator {
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    assembler: ContextAssembler,
    background: BackgroundMemory,
    store: ConversationStore,
    config: Arc<AppConfig>,
}

/// What one LLM streaming call produced.
pub(crate) struct IterationOutcome {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<UsageInfo>,
    pub latency_ms: u64,
}

impl ChatOrchestrator {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        assembler: ContextAssembler,
        background: BackgroundMemory,
        store: ConversationStore,
        config: Arc<AppConfig>,
    ) -> Self {
        Self { provider, registry, assembler, background, store, config }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run one turn, streaming chunks into `tx`. Terminal frames (one
    /// `done` on success, one `error` otherwise) are emitted here; a
    /// cancelled client produces no frame at all.
    pub async fn run(&self, request: TurnRequest, tx: mpsc::Sender<StreamChunk>) {
        let deadline = Duration::from_millis(self.config.provider.turn_timeout_ms);
        match tokio::time::timeout(deadline, self.run_turn(&request, &tx)).await {
            Ok(Ok(())) => {}
            Ok(Err(Error::Cancelled)) => {
                debug!("client disconnected mid-turn");
            }
            Ok(Err(e)) => {
                error!("turn failed: {e}");
                let _ = tx.send(StreamChunk::error(e.to_string())).await;
            }
            Err(_) => {
                warn!("turn exceeded {}ms ceiling", deadline.as_millis());
                let _ = tx.send(StreamChunk::error("turn deadline exceeded")).await;
            }
        }
    }

    async fn run_turn(&self, request: &TurnRequest, tx: &mpsc::Sender<StreamChunk>) -> Result<()> {
        let user = request
            .user_message()
            .cloned()
            .filter(|m| !m.content.trim().is_empty() || m.attachments.is_some())
            .ok_or_else(|| Error::Invariant("turn has no user content".into()))?;

        let conversation_id = request
            .conversation_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // Fold media transcriptions into the text channel before anything
        // reads the content.
        let user_text = fold_transcriptions(&user);
        let has_images = user.has_images();

        self.store
            .ensure_conversation(&conversation_id, Some(&title_from(&user_text)))?;

        let user_seq = self.store.next_sequence_number(&conversation_id)?;
        let user_msg_id = self.store.append_message(&NewMessage {
            conversation_id: conversation_id.clone(),
            role: Role::User,
            content: user_text.clone(),
            tool_calls: None,
            tool_call_id: None,
            sequence_number: user_seq,
            metrics: MessageMetrics::default(),
        })?;
        self.background.spawn_embedding(user_msg_id, user_text.clone());

        // Image turns switch to the vision model and skip classification.
        let model = if has_images {
            self.config.provider.vision_model.clone()
        } else {
            request.model.clone().unwrap_or_else(|| self.config.provider.model.clone())
        };

        let categories = self.registry.categories().await;
        let classification = classifier::classify(
            &self.provider,
            &self.config.provider.model,
            &user_text,
            &categories,
            has_images || user_has_transcription(&user),
        )
        .await;

        let tools = match classification.complexity {
            Complexity::Complex => {
                self.registry.expanded_schemas_for(&classification.intent, &user_text).await
            }
            Complexity::Simple => {
                self.registry.schemas_for(&classification.intent, &user_text).await
            }
        };
        info!(
            intent = %classification.intent,
            tools = tools.len(),
            "selected {} path",
            match (classification.complexity, tools.is_empty()) {
                (Complexity::Complex, false) => "agentic",
                (_, false) => "tool",
                _ => "fast",
            }
        );

        let persona = system_prompt(!tools.is_empty());
        let context = self.assembler.assemble(&conversation_id, &user_text, &persona).await?;

        let final_seq = if tools.is_empty() {
            self.run_fast_path(&conversation_id, context.messages, &model, tx).await?
        } else if classification.complexity == Complexity::Complex {
            agentic::run_agentic_path(
                self,
                &conversation_id,
                context.messages.clone(),
                &model,
                tools,
                &user_text,
                context.summary.as_deref(),
                tx,
            )
            .await?
        } else {
            self.run_tool_path(&conversation_id, context.messages, &model, tools, tx).await?
        };

        emit(tx, StreamChunk::finished(conversation_id.clone())).await?;

        self.background.spawn_summarize_if_due(
            conversation_id,
            final_seq,
            context.last_summarized_seq,
        );
        Ok(())
    }

    /// Fast path: one streaming call, content forwarded live.
    async fn run_fast_path(
        &self,
        conversation_id: &str,
        messages: Vec<ChatMessage>,
        model: &str,
        tx: &mpsc::Sender<StreamChunk>,
    ) -> Result<i64> {
        let outcome = self.stream_once(messages, model, vec![], Some(tx)).await?;
        self.persist_assistant(conversation_id, &outcome.content, None, &outcome, model)
    }

    /// Tool path: up to `max_tool_turns` iterations of stream + execute.
    /// Content on tool-capable iterations is buffered; it is emitted only
    /// when an iteration produces no tool calls and therefore is the final
    /// answer.
    async fn run_tool_path(
        &self,
        conversation_id: &str,
        mut messages: Vec<ChatMessage>,
        model: &str,
        tools: Vec<ToolSchema>,
        tx: &mpsc::Sender<StreamChunk>,
    ) -> Result<i64> {
        let max_turns = self.config.tools.max_tool_turns;
        let active: HashSet<String> = tools.iter().map(|t| t.name.clone()).collect();

        for _iteration in 0..max_turns {
            let outcome = self.stream_once(messages.clone(), model, tools.clone(), None).await?;

            let mut content = outcome.content.clone();
            let mut calls = outcome.tool_calls.clone();

            // Weak models print the call as raw JSON instead of using the
            // structured field. Salvage it; the raw JSON never reaches the
            // client or the persisted content.
            if calls.is_empty() && !content.is_empty() {
                let salvaged = salvage_tool_calls(&content, &active);
                if !salvaged.is_empty() {
                    calls = salvaged;
                    content.clear();
                }
            }

            if calls.is_empty() {
                if !content.is_empty() {
                    emit(tx, StreamChunk::content(content.clone())).await?;
                }
                return self.persist_assistant(conversation_id, &content, None, &outcome, model);
            }

            // Tool-using iteration: strip the content channel entirely so
            // raw call JSON never leaks into history fed back to the model.
            self.persist_assistant(conversation_id, "", Some(calls.clone()), &outcome, model)?;
            messages.push(ChatMessage {
                role: Role::Assistant,
                content: String::new(),
                tool_calls: Some(calls.clone()),
                tool_call_id: None,
                attachments: None,
            });
            emit(tx, StreamChunk { tool_calls: Some(calls.clone()), ..Default::default() }).await?;

            for call in &calls {
                emit(tx, StreamChunk::status(format!("Using {}...", call.name))).await?;
                let result = self.execute_tool(call).await;
                let seq = self.store.next_sequence_number(conversation_id)?;
                self.store.append_message(&NewMessage {
                    conversation_id: conversation_id.to_string(),
                    role: Role::Tool,
                    content: result.clone(),
                    tool_calls: None,
                    tool_call_id: Some(call.id.clone()),
                    sequence_number: seq,
                    metrics: MessageMetrics::default(),
                })?;
                messages.push(ChatMessage::tool_result(call.id.clone(), result));
            }
        }

        // The model is still asking for tools after the ceiling. Surface
        // the limit instead of hanging; the partial history is persisted.
        emit(
            tx,
            StreamChunk::status(format!(
                "Stopped after {max_turns} tool rounds without a final answer."
            )),
        )
        .await?;
        Err(Error::IterationLimit(max_turns))
    }

    /// One provider streaming call under the per-iteration deadline.
    /// Provider-originated `done` frames are consumed here and never reach
    /// the client; `live` forwards content tokens as they arrive.
    pub(crate) async fn stream_once(
        &self,
        messages: Vec<ChatMessage>,
        model: &str,
        tools: Vec<ToolSchema>,
        live: Option<&mpsc::Sender<StreamChunk>>,
    ) -> Result<IterationOutcome> {
        let request = ChatRequest {
            messages,
            model: model.to_string(),
            temperature: self.config.provider.temperature,
            max_tokens: self.config.provider.max_tokens,
            tools,
        };
        let deadline = Duration::from_millis(self.config.provider.llm_timeout_ms);
        let start = Instant::now();

        let consume = async {
            let mut stream = self.provider.stream(&request).await?;
            let mut content = String::new();
            let mut tool_calls: Vec<ToolCall> = Vec::new();
            let mut usage = None;

            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                if !chunk.content.is_empty() {
                    content.push_str(&chunk.content);
                    if let Some(tx) = live {
                        emit(tx, StreamChunk::content(chunk.content.clone())).await?;
                    }
                }
                if let Some(calls) = chunk.tool_calls {
                    tool_calls.extend(calls);
                }
                if chunk.usage.is_some() {
                    usage = chunk.usage;
                }
                // A terminal frame or a structured tool call ends the
                // iteration; trailing provider output is irrelevant.
                if chunk.done || !tool_calls.is_empty() {
                    break;
                }
            }

            Ok::<_, Error>((content, tool_calls, usage))
        };

        let (content, tool_calls, usage) = tokio::time::timeout(deadline, consume)
            .await
            .map_err(|_| Error::Provider(format!("LLM call timed out after {}ms", deadline.as_millis())))??;

        Ok(IterationOutcome { content, tool_calls, usage, latency_ms: start.elapsed().as_millis() as u64 })
    }

    /// Execute one tool call. Recoverable tool errors come back as in-band
    /// text so the model can self-correct; results are truncated at the
    /// configured cap.
    pub(crate) async fn execute_tool(&self, call: &ToolCall) -> String {
        let result = self.registry.execute(&call.name, call.arguments.clone()).await;
        let text = match result {
            Ok(output) => output,
            Err(e) if e.is_tool_recoverable() => {
                warn!(tool = %call.name, "tool call failed: {e}");
                format!("Error executing tool {}: {e}", call.name)
            }
            Err(e) => format!("Error executing tool {}: {e}", call.name),
        };
        truncate_result(&text, self.config.tools.result_max_bytes)
    }

    /// Persist an assistant message and schedule its embedding. Returns
    /// the assigned sequence number.
    pub(crate) fn persist_assistant(
        &self,
        conversation_id: &str,
        content: &str,
        tool_calls: Option<Vec<ToolCall>>,
        outcome: &IterationOutcome,
        model: &str,
    ) -> Result<i64> {
        let seq = self.store.next_sequence_number(conversation_id)?;
        let id = self.store.append_message(&NewMessage {
            conversation_id: conversation_id.to_string(),
            role: Role::Assistant,
            content: content.to_string(),
            tool_calls,
            tool_call_id: None,
            sequence_number: seq,
            metrics: MessageMetrics {
                prompt_tokens: outcome.usage.map(|u| u.prompt_tokens),
                completion_tokens: outcome.usage.map(|u| u.completion_tokens),
                latency_ms: Some(outcome.latency_ms),
                model: Some(model.to_string()),
                provider: Some(self.provider.name().to_string()),
            },
        })?;
        self.background.spawn_embedding(id, content.to_string());
        Ok(seq)
    }

    pub(crate) fn config(&self) -> &AppConfig {
        &self.config
    }

    pub(crate) fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }
}

pub(crate) async fn emit(tx: &mpsc::Sender<StreamChunk>, chunk: StreamChunk) -> Result<()> {
    tx.send(chunk).await.map_err(|_| Error::Cancelled)
}

/// Truncate a tool result at the byte cap, on a char boundary, with an
/// explicit marker so the model knows data is missing.
pub(crate) fn truncate_result(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... [truncated]", &text[..cut])
}

fn title_from(user_text: &str) -> String {
    user_text.chars().take(50).collect()
}

fn user_has_transcription(msg: &ChatMessage) -> bool {
    msg.attachments
        .as_ref()
        .is_some_and(|atts| atts.iter().any(|a| a.transcription.is_some()))
}

/// Append audio/video transcriptions to the text channel, once.
fn fold_transcriptions(msg: &ChatMessage) -> String {
    let mut text = msg.content.clone();
    for att in msg.attachments.as_deref().unwrap_or_default() {
        let Some(transcription) = att.transcription.as_deref() else { continue };
        if text.contains(transcription) {
            continue;
        }
        let prefix = if att.kind == "video" {
            "[Video audio transcription]"
        } else {
            "[Audio transcription]"
        };
        text = format!("{text}\n\n{prefix}: {transcription}").trim().to_string();
    }
    text
}

fn system_prompt(has_tools: bool) -> String {
    let base = "You are a helpful AI assistant.";
    if !has_tools {
        return format!("{base}\nAnswer using your internal knowledge. Do not hallucinate tools.");
    }
    format!(
        "{base}\nYou have access to external tools.\n\
         1. If the user's request requires it, call the appropriate tool.\n\
         2. Use the tool result to answer the question.\n\
         3. Do not repeat a tool call once you have its result."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_appends_marker() {
        let long = "x".repeat(100);
        let cut = truncate_result(&long, 10);
        assert!(cut.starts_with("xxxxxxxxxx"));
        assert!(cut.ends_with("... [truncated]"));
        assert_eq!(truncate_result("short", 100), "short");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "héllo wörld ".repeat(20);
        let cut = truncate_result(&text, 13);
        assert!(cut.ends_with("... [truncated]"));
        // Must not panic and must still be valid UTF-8 (guaranteed by String).
    }

    #[test]
    fn transcriptions_fold_into_content_once() {
        let msg = ChatMessage {
            attachments: Some(vec![palaver_common::Attachment {
                kind: "audio".into(),
                base64_data: None,
                transcription: Some("hello from the mic".into()),
            }]),
            ..ChatMessage::user("listen to this")
        };
        let folded = fold_transcriptions(&msg);
        assert!(folded.contains("[Audio transcription]: hello from the mic"));

        // Already-injected transcriptions are not duplicated.
        let msg2 = ChatMessage { content: folded.clone(), ..msg };
        assert_eq!(fold_transcriptions(&msg2).matches("hello from the mic").count(), 1);
    }

    #[test]
    fn turn_request_finds_last_user_message() {
        let request = TurnRequest {
            conversation_id: None,
            messages: vec![
                ChatMessage::user("first"),
                ChatMessage::assistant("reply"),
                ChatMessage::user("second"),
            ],
            model: None,
        };
        assert_eq!(request.user_message().unwrap().content, "second");
    }
}
