pub mod agentic;
pub mod classifier;
pub mod mcp;
pub mod memory;
pub mod orchestrator;
pub mod providers;
pub mod salvage;

pub use mcp::{McpTool, Tool, ToolHostClient, ToolRegistry};
pub use memory::{BackgroundMemory, ContextAssembler, Embedder};
pub use orchestrator::{ChatOrchestrator, TurnRequest};
pub use providers::{
    build_provider, ChatRequest, ChatResponse, ChunkStream, LlmProvider, OllamaEmbeddings,
    ProviderChunk, ToolSchema,
};
pub use salvage::salvage_tool_calls;
