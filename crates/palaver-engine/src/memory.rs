use std::sync::Arc;

use async_trait::async_trait;
use palaver_common::{ChatMessage, Result};
use palaver_config::MemoryConfig;
use palaver_db::{ConversationStore, MemoryStore};
use tracing::{info, warn};

use crate::providers::{ChatRequest, LlmProvider, OllamaEmbeddings};

/// Text embedding for cold recall. Kept behind a trait so tests can use a
/// deterministic embedder.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model(&self) -> &str;
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[async_trait]
impl Embedder for OllamaEmbeddings {
    fn model(&self) -> &str {
        OllamaEmbeddings::model(self)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        OllamaEmbeddings::embed(self, text).await
    }
}

/// The assembled context for one turn: a single ordered message list with
/// the three memory tiers already joined. This is the only place hot, warm
/// and cold meet; downstream components never see the tiers individually.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub messages: Vec<ChatMessage>,
    pub summary: Option<String>,
    pub last_summarized_seq: i64,
}

/// Joins persona, warm summary, cold recall and the hot window into the
/// message list fed to the provider.
#[derive(Clone)]
pub struct ContextAssembler {
    store: ConversationStore,
    memories: MemoryStore,
    embedder: Option<Arc<dyn Embedder>>,
    config: MemoryConfig,
}

impl ContextAssembler {
    pub fn new(
        store: ConversationStore,
        memories: MemoryStore,
        embedder: Option<Arc<dyn Embedder>>,
        config: MemoryConfig,
    ) -> Self {
        Self { store, memories, embedder, config }
    }

    pub async fn assemble(
        &self,
        conversation_id: &str,
        user_input: &str,
        persona: &str,
    ) -> Result<AssembledContext> {
        // Hot tier: the sliding window, re-read fresh each turn. Writes
        // commit before the next fetch, so there is no staleness to manage.
        let hot = self.store.recent_messages(conversation_id, self.config.hot_window_size)?;

        // Warm tier: the rolling summary covers everything at or below its
        // watermark; together with the window it partitions the history.
        let (summary, last_summarized_seq) = self
            .store
            .conversation_summary(conversation_id)?
            .unwrap_or((None, 0));

        // Cold tier: similarity recall over messages outside the window.
        let window_floor = hot.first().map(|m| m.sequence_number).unwrap_or(i64::MAX);
        let cold = match &self.embedder {
            Some(embedder) if !user_input.is_empty() => {
                match embedder.embed(user_input).await {
                    Ok(query) => self
                        .store
                        .similar_messages(
                            conversation_id,
                            &query,
                            self.config.cold_recall_limit,
                            window_floor,
                        )
                        .unwrap_or_else(|e| {
                            warn!("cold recall failed, continuing without it: {e}");
                            Vec::new()
                        }),
                    Err(e) => {
                        warn!("query embedding failed, continuing without cold recall: {e}");
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        };

        let mut system = String::from(persona);

        let facts = self.memories.facts().unwrap_or_default();
        if !facts.is_empty() {
            system.push_str("\n\nUser profile:");
            for fact in &facts {
                system.push_str(&format!("\n- {}", fact.content));
            }
        }

        if let Some(summary_text) = summary.as_deref().filter(|s| !s.is_empty()) {
            system.push_str("\n\nPrevious conversation summary:\n");
            system.push_str(summary_text);
        }

        if !cold.is_empty() {
            system.push_str("\n\nRelevant past messages:");
            for hit in &cold {
                system.push_str(&format!(
                    "\n- [{}] {}: {}",
                    hit.message.created_at.format("%Y-%m-%d %H:%M"),
                    hit.message.role.as_str(),
                    hit.message.content,
                ));
            }
        }

        let mut messages = Vec::with_capacity(hot.len() + 1);
        messages.push(ChatMessage::system(system));
        messages.extend(hot.iter().map(|m| m.to_chat_message()));

        Ok(AssembledContext { messages, summary, last_summarized_seq })
    }
}

/// True when the unsummarized delta has crossed the refresh threshold.
pub fn summary_due(current_seq: i64, last_summarized_seq: i64, threshold: i64) -> bool {
    current_seq - last_summarized_seq >= threshold
}

/// Background embedding and summarization. Holds its own store session so
/// a slow or failing background write can never poison the foreground
/// response; failures are logged and swallowed.
#[derive(Clone)]
pub struct BackgroundMemory {
    store: ConversationStore,
    provider: Arc<dyn LlmProvider>,
    embedder: Option<Arc<dyn Embedder>>,
    config: MemoryConfig,
    model: String,
}

impl BackgroundMemory {
    pub fn new(
        store: ConversationStore,
        provider: Arc<dyn LlmProvider>,
        embedder: Option<Arc<dyn Embedder>>,
        config: MemoryConfig,
        model: String,
    ) -> Self {
        Self { store, provider, embedder, config, model }
    }

    /// Fire-and-forget embedding of a persisted message.
    pub fn spawn_embedding(&self, message_id: String, text: String) {
        let Some(embedder) = self.embedder.clone() else { return };
        if text.is_empty() {
            return;
        }
        let store = self.store.clone();
        tokio::spawn(async move {
            match embedder.embed(&text).await {
                Ok(vector) => {
                    if let Err(e) = store.update_message_embedding(&message_id, &vector) {
                        warn!("embedding write failed for message {message_id}: {e}");
                    }
                }
                Err(e) => warn!("embedding generation failed for message {message_id}: {e}"),
            }
        });
    }

    /// Fire-and-forget warm-summary refresh, if the delta is large enough.
    pub fn spawn_summarize_if_due(
        &self,
        conversation_id: String,
        current_seq: i64,
        last_summarized_seq: i64,
    ) {
        if !summary_due(current_seq, last_summarized_seq, self.config.summary_threshold) {
            return;
        }
        let worker = self.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.summarize(&conversation_id, current_seq, last_summarized_seq).await
            {
                warn!("conversation summarization failed for {conversation_id}: {e}");
            }
        });
    }

    /// Summarize the unsummarized segment, consolidate with the previous
    /// summary when one exists, and advance the watermark atomically.
    pub async fn summarize(
        &self,
        conversation_id: &str,
        current_seq: i64,
        last_summarized_seq: i64,
    ) -> Result<()> {
        // Cap the fetch so a long-unsummarized backlog cannot blow up the
        // summarization context.
        let delta = (current_seq - last_summarized_seq).max(0) as usize;
        let fetch_limit = delta.min(100);
        let segment = self.store.messages_after(conversation_id, last_summarized_seq, fetch_limit)?;
        if segment.is_empty() {
            return Ok(());
        }

        let mut transcript = String::new();
        for msg in &segment {
            transcript.push_str(&format!("{}: {}\n", msg.role.as_str(), msg.content));
        }

        let segment_prompt = format!(
            "Summarize the following conversation segment efficiently. \
             Focus on key facts, user preferences, and important decisions. \
             Do not lose important details.\n\n{transcript}"
        );
        let segment_summary = self.complete_text(&segment_prompt, 200).await?;

        let (old_summary, _) = self
            .store
            .conversation_summary(conversation_id)?
            .unwrap_or((None, 0));

        let final_summary = match old_summary.filter(|s| !s.is_empty()) {
            Some(old) => {
                let consolidate_prompt = format!(
                    "Here is the previous conversation summary:\n{old}\n\n\
                     Here is the new conversation segment:\n{segment_summary}\n\n\
                     Create a consolidated summary of the entire conversation. Keep it concise."
                );
                self.complete_text(&consolidate_prompt, 300).await?
            }
            None => segment_summary,
        };

        self.store.update_summary(conversation_id, &final_summary, current_seq)?;
        info!(conversation = %conversation_id, seq = current_seq, "updated rolling summary");
        Ok(())
    }

    async fn complete_text(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let request = ChatRequest {
            messages: vec![ChatMessage::user(prompt)],
            model: self.model.clone(),
            temperature: 0.3,
            max_tokens,
            tools: vec![],
        };
        Ok(self.provider.complete(&request).await?.message.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_common::Role;
    use palaver_db::{MessageMetrics, NewMessage};

    const DIM: usize = 4;

    struct UnitEmbedder;

    #[async_trait]
    impl Embedder for UnitEmbedder {
        fn model(&self) -> &str {
            "unit"
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            // Deterministic: direction keyed on the first byte.
            let first = text.bytes().next().unwrap_or(0) as f32;
            Ok(vec![1.0, first, 0.0, 0.0])
        }
    }

    struct EchoSummarizer;

    #[async_trait]
    impl crate::providers::LlmProvider for EchoSummarizer {
        fn name(&self) -> &str {
            "mock"
        }

        async fn complete(
            &self,
            request: &ChatRequest,
        ) -> Result<crate::providers::ChatResponse> {
            let reply = if request.messages[0].content.contains("previous conversation summary") {
                "consolidated summary".to_string()
            } else {
                "segment summary".to_string()
            };
            Ok(crate::providers::ChatResponse {
                message: ChatMessage::assistant(reply),
                usage: None,
                model: "mock".into(),
                provider: "mock".into(),
                latency_ms: 1,
            })
        }

        async fn stream(&self, _request: &ChatRequest) -> Result<crate::providers::ChunkStream> {
            unimplemented!("summarizer only uses complete")
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    fn seed_store() -> ConversationStore {
        let store = ConversationStore::in_memory(DIM).unwrap();
        store.ensure_conversation("c1", Some("t")).unwrap();
        store
    }

    fn append(store: &ConversationStore, seq: i64, role: Role, content: &str) -> String {
        store
            .append_message(&NewMessage {
                conversation_id: "c1".into(),
                role,
                content: content.into(),
                tool_calls: None,
                tool_call_id: None,
                sequence_number: seq,
                metrics: MessageMetrics::default(),
            })
            .unwrap()
    }

    fn assembler(store: &ConversationStore, embedder: Option<Arc<dyn Embedder>>) -> ContextAssembler {
        let config = MemoryConfig { hot_window_size: 3, embedding_dim: DIM, ..Default::default() };
        ContextAssembler::new(store.clone(), MemoryStore::in_memory().unwrap(), embedder, config)
    }

    #[tokio::test]
    async fn composition_order_is_persona_summary_cold_then_window() {
        let store = seed_store();
        for seq in 1..=5 {
            append(&store, seq, Role::User, &format!("message {seq}"));
        }
        store.update_summary("c1", "they discussed setup", 2).unwrap();

        let ctx = assembler(&store, None).assemble("c1", "hello", "You are helpful.").await.unwrap();

        // One system message followed by the 3-message hot window.
        assert_eq!(ctx.messages.len(), 4);
        assert_eq!(ctx.messages[0].role, Role::System);
        let system = &ctx.messages[0].content;
        let persona_pos = system.find("You are helpful.").unwrap();
        let summary_pos = system.find("they discussed setup").unwrap();
        assert!(persona_pos < summary_pos);
        assert_eq!(ctx.messages[1].content, "message 3");
        assert_eq!(ctx.messages[3].content, "message 5");
        assert_eq!(ctx.last_summarized_seq, 2);
    }

    #[tokio::test]
    async fn cold_recall_excludes_the_hot_window() {
        let store = seed_store();
        for seq in 1..=5 {
            let id = append(&store, seq, Role::User, &format!("note {seq}"));
            store.update_message_embedding(&id, &[1.0, b'n' as f32, 0.0, 0.0]).unwrap();
        }

        let ctx = assembler(&store, Some(Arc::new(UnitEmbedder)))
            .assemble("c1", "note query", "persona")
            .await
            .unwrap();

        let system = &ctx.messages[0].content;
        assert!(system.contains("Relevant past messages"));
        // Window covers 3..=5, so only 1 and 2 are eligible cold hits.
        assert!(system.contains("note 1"));
        assert!(system.contains("note 2"));
        assert!(!system.contains("Relevant past messages:\n- [") || !system.contains("note 4"));
    }

    #[tokio::test]
    async fn user_facts_land_in_the_persona_block() {
        let store = seed_store();
        let memories = MemoryStore::in_memory().unwrap();
        memories.add_fact("prefers metric units").unwrap();
        let assembler = ContextAssembler::new(
            store.clone(),
            memories,
            None,
            MemoryConfig { embedding_dim: DIM, ..Default::default() },
        );

        let ctx = assembler.assemble("c1", "hi", "persona").await.unwrap();
        assert!(ctx.messages[0].content.contains("prefers metric units"));
    }

    #[test]
    fn summary_trigger_threshold() {
        assert!(!summary_due(19, 0, 20));
        assert!(summary_due(20, 0, 20));
        assert!(summary_due(45, 20, 20));
        assert!(!summary_due(39, 20, 20));
    }

    #[tokio::test]
    async fn summarize_first_time_uses_segment_summary() {
        let store = seed_store();
        for seq in 1..=4 {
            append(&store, seq, if seq % 2 == 1 { Role::User } else { Role::Assistant }, "talk");
        }

        let worker = BackgroundMemory::new(
            store.clone(),
            Arc::new(EchoSummarizer),
            None,
            MemoryConfig { embedding_dim: DIM, ..Default::default() },
            "mock-model".into(),
        );
        worker.summarize("c1", 4, 0).await.unwrap();

        let (summary, seq) = store.conversation_summary("c1").unwrap().unwrap();
        assert_eq!(summary.as_deref(), Some("segment summary"));
        assert_eq!(seq, 4);
    }

    #[tokio::test]
    async fn summarize_consolidates_with_existing_summary() {
        let store = seed_store();
        store.update_summary("c1", "old summary", 2).unwrap();
        for seq in 1..=6 {
            append(&store, seq, Role::User, "more talk");
        }

        let worker = BackgroundMemory::new(
            store.clone(),
            Arc::new(EchoSummarizer),
            None,
            MemoryConfig { embedding_dim: DIM, ..Default::default() },
            "mock-model".into(),
        );
        worker.summarize("c1", 6, 2).await.unwrap();

        let (summary, seq) = store.conversation_summary("c1").unwrap().unwrap();
        assert_eq!(summary.as_deref(), Some("consolidated summary"));
        assert_eq!(seq, 6);
    }

    #[tokio::test]
    async fn summarize_with_no_delta_is_a_no_op() {
        let store = seed_store();
        let worker = BackgroundMemory::new(
            store.clone(),
            Arc::new(EchoSummarizer),
            None,
            MemoryConfig { embedding_dim: DIM, ..Default::default() },
            "mock-model".into(),
        );
        worker.summarize("c1", 0, 0).await.unwrap();
        let (summary, _) = store.conversation_summary("c1").unwrap().unwrap();
        assert!(summary.is_none());
    }
}
