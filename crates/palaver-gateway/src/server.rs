use std::path::Path;
use std::sync::Arc;

use palaver_common::{Error, Result};
use palaver_config::AppConfig;
use palaver_db::{ConversationStore, MemoryStore};
use palaver_engine::{build_provider, Embedder, OllamaEmbeddings, ToolRegistry};
use tracing::info;

use crate::router::build_router;
use crate::state::AppState;

/// Bring up the whole service: stores, provider, tool hosts, router.
/// Blocks until shutdown (ctrl-c), then tears the tool hosts down.
pub async fn run(config: AppConfig) -> Result<()> {
    let config = Arc::new(config);

    let store = ConversationStore::open(
        Path::new(&config.database_path),
        config.memory.embedding_dim,
    )?;
    let memories = MemoryStore::open(Path::new(&config.database_path))?;

    let provider = build_provider(&config.provider)?;
    info!(provider = provider.name(), model = %config.provider.model, "provider ready");

    // Cold-memory embeddings stay on the local Ollama instance regardless
    // of which chat provider is configured.
    let embedder: Option<Arc<dyn Embedder>> = Some(Arc::new(OllamaEmbeddings::new(
        config.provider.ollama_base_url.clone(),
        config.memory.embedding_model.clone(),
        config.memory.embedding_dim,
    )));

    let registry = Arc::new(ToolRegistry::new(config.tools.clone()));
    registry.connect_hosts(&config.tool_hosts).await;

    let state = Arc::new(AppState::new(
        Arc::clone(&config),
        provider,
        Arc::clone(&registry),
        store,
        memories,
        embedder,
    )?);

    let app = build_router(state);
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Config(format!("failed to bind {addr}: {e}")))?;
    info!("listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    registry.shutdown().await;
    info!("tool hosts stopped");
    Ok(())
}
