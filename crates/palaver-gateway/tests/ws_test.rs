use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use palaver_common::{ChatMessage, Result, StreamChunk};
use palaver_config::AppConfig;
use palaver_db::{ConversationStore, MemoryStore};
use palaver_engine::providers::{ChatRequest, ChatResponse, ChunkStream, ProviderChunk};
use palaver_engine::{LlmProvider, ToolRegistry};
use palaver_gateway::{build_router, AppState};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

struct GreetingProvider;

#[async_trait]
impl LlmProvider for GreetingProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse> {
        Ok(ChatResponse {
            message: ChatMessage::assistant("INTENT: GENERAL\nCOMPLEXITY: SIMPLE"),
            usage: None,
            model: "mock".into(),
            provider: "mock".into(),
            latency_ms: 1,
        })
    }

    async fn stream(&self, _request: &ChatRequest) -> Result<ChunkStream> {
        let chunks = vec![
            ProviderChunk { content: "Hello ".into(), ..Default::default() },
            ProviderChunk { content: "there!".into(), ..Default::default() },
            ProviderChunk { done: true, ..Default::default() },
        ];
        Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

async fn start_server() -> String {
    let config = Arc::new(AppConfig::default());
    let store = ConversationStore::in_memory(config.memory.embedding_dim).unwrap();
    let state = Arc::new(
        AppState::new(
            Arc::clone(&config),
            Arc::new(GreetingProvider),
            Arc::new(ToolRegistry::new(config.tools.clone())),
            store,
            MemoryStore::in_memory().unwrap(),
            None,
        )
        .unwrap(),
    );

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("ws://{addr}/api/chat/stream")
}

#[tokio::test]
async fn streams_a_turn_and_terminates_with_done() {
    let url = start_server().await;
    let (mut ws, _) = connect_async(url).await.expect("connect");

    let request = serde_json::json!({
        "messages": [{"role": "user", "content": "Hi, how are you?"}]
    });
    ws.send(WsMessage::Text(request.to_string().into())).await.unwrap();

    let mut content = String::new();
    let mut done_frames = 0;
    let mut conversation_id = None;

    while let Some(frame) = ws.next().await {
        let frame = frame.unwrap();
        let WsMessage::Text(text) = frame else { continue };
        let chunk: StreamChunk = serde_json::from_str(&text).unwrap();

        assert!(chunk.error.is_none(), "unexpected error frame: {text}");
        content.push_str(&chunk.content);
        if chunk.done {
            done_frames += 1;
            conversation_id = chunk.conversation_id.clone();
            break;
        }
    }

    assert_eq!(content, "Hello there!");
    assert_eq!(done_frames, 1);
    assert!(conversation_id.is_some(), "terminal frame carries the conversation id");
}

#[tokio::test]
async fn multiple_turns_share_one_connection() {
    let url = start_server().await;
    let (mut ws, _) = connect_async(url).await.expect("connect");

    let mut last_conversation = None;
    for _ in 0..2 {
        let request = serde_json::json!({
            "messages": [{"role": "user", "content": "hello again"}],
            "conversation_id": last_conversation,
        });
        ws.send(WsMessage::Text(request.to_string().into())).await.unwrap();

        loop {
            let frame = ws.next().await.unwrap().unwrap();
            let WsMessage::Text(text) = frame else { continue };
            let chunk: StreamChunk = serde_json::from_str(&text).unwrap();
            if chunk.done {
                last_conversation = chunk.conversation_id.clone();
                break;
            }
        }
    }

    assert!(last_conversation.is_some());
}

#[tokio::test]
async fn empty_user_content_gets_an_error_frame() {
    let url = start_server().await;
    let (mut ws, _) = connect_async(url).await.expect("connect");

    let request = serde_json::json!({
        "messages": [{"role": "user", "content": "   "}]
    });
    ws.send(WsMessage::Text(request.to_string().into())).await.unwrap();

    let frame = ws.next().await.unwrap().unwrap();
    let WsMessage::Text(text) = frame else { panic!("expected a text frame") };
    let chunk: StreamChunk = serde_json::from_str(&text).unwrap();
    assert!(chunk.error.as_deref().is_some_and(|e| e.contains("empty user content")));
}

#[tokio::test]
async fn malformed_json_gets_an_error_frame() {
    let url = start_server().await;
    let (mut ws, _) = connect_async(url).await.expect("connect");

    ws.send(WsMessage::Text("this is not json".into())).await.unwrap();

    let frame = ws.next().await.unwrap().unwrap();
    let WsMessage::Text(text) = frame else { panic!("expected a text frame") };
    let chunk: StreamChunk = serde_json::from_str(&text).unwrap();
    assert!(chunk.error.as_deref().is_some_and(|e| e.contains("invalid request")));
}
