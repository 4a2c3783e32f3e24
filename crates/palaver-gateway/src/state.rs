use std::sync::Arc;

use palaver_common::Result;
use palaver_config::AppConfig;
use palaver_db::{ConversationStore, MemoryStore};
use palaver_engine::{
    BackgroundMemory, ChatOrchestrator, ContextAssembler, Embedder, LlmProvider, ToolRegistry,
};

/// Everything the handlers need, shared across connections.
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub provider: Arc<dyn LlmProvider>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub store: ConversationStore,
    pub registry: Arc<ToolRegistry>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire the orchestrator from its parts. Background memory gets its
    /// own store session so it can never contend with a foreground turn.
    pub fn new(
        config: Arc<AppConfig>,
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        store: ConversationStore,
        memories: MemoryStore,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Result<Self> {
        let assembler = ContextAssembler::new(
            store.clone(),
            memories,
            embedder.clone(),
            config.memory.clone(),
        );
        let background = BackgroundMemory::new(
            store.background_handle()?,
            Arc::clone(&provider),
            embedder,
            config.memory.clone(),
            config.provider.model.clone(),
        );
        let orchestrator = Arc::new(ChatOrchestrator::new(
            Arc::clone(&provider),
            Arc::clone(&registry),
            assembler,
            background,
            store.clone(),
            Arc::clone(&config),
        ));

        Ok(Self { config, provider, orchestrator, store, registry })
    }
}
