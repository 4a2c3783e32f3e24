use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use palaver_common::{ChatMessage, StreamChunk, ToolCall, UsageInfo};
use palaver_engine::TurnRequest;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::state::SharedState;

/// Inbound chat frame, shared by the REST and WS surfaces.
#[derive(Debug, Deserialize)]
pub struct ChatRequestBody {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl ChatRequestBody {
    pub fn into_turn(self) -> TurnRequest {
        TurnRequest {
            conversation_id: self.conversation_id,
            messages: self.messages,
            model: self.model,
        }
    }

    /// True when there is no usable user input in the frame.
    pub fn is_empty(&self) -> bool {
        !self.messages.iter().any(|m| {
            m.role == palaver_common::Role::User
                && (!m.content.trim().is_empty() || m.attachments.is_some())
        })
    }
}

#[derive(Serialize)]
pub struct ChatResponseBody {
    pub content: String,
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,
}

#[derive(Serialize)]
pub struct ConversationInfo {
    pub id: String,
    pub title: Option<String>,
    pub message_count: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
pub struct StoredMessageBody {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub sequence_number: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// GET /health — provider reachability map.
pub async fn health(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let name = state.provider.name().to_string();
    let healthy = state.provider.health_check().await.unwrap_or(false);

    Json(serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "providers": { name: healthy },
    }))
}

/// POST /api/chat — run a full turn and return the concatenated response.
pub async fn chat(
    State(state): State<SharedState>,
    Json(body): Json<ChatRequestBody>,
) -> Result<Json<ChatResponseBody>, (StatusCode, String)> {
    if body.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "empty user content".into()));
    }

    let (tx, mut rx) = mpsc::channel::<StreamChunk>(16);
    let orchestrator = Arc::clone(&state.orchestrator);
    let turn = body.into_turn();
    let run = tokio::spawn(async move { orchestrator.run(turn, tx).await });

    let mut content = String::new();
    let mut conversation_id = None;
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut usage = None;
    let mut error = None;

    while let Some(chunk) = rx.recv().await {
        content.push_str(&chunk.content);
        if let Some(calls) = chunk.tool_calls {
            tool_calls.extend(calls);
        }
        if chunk.conversation_id.is_some() {
            conversation_id = chunk.conversation_id;
        }
        if chunk.usage.is_some() {
            usage = chunk.usage;
        }
        if chunk.error.is_some() {
            error = chunk.error;
        }
    }
    let _ = run.await;

    if let Some(message) = error {
        warn!("chat turn failed: {message}");
        return Err((StatusCode::INTERNAL_SERVER_ERROR, message));
    }

    Ok(Json(ChatResponseBody {
        content,
        conversation_id,
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        usage,
    }))
}

/// GET /api/conversations
pub async fn list_conversations(
    State(state): State<SharedState>,
) -> Result<Json<Vec<ConversationInfo>>, (StatusCode, String)> {
    let rows = state
        .store
        .list_conversations(50)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(
        rows.into_iter()
            .map(|row| ConversationInfo {
                id: row.id,
                title: row.title,
                message_count: row.message_count,
                created_at: row.created_at,
                updated_at: row.updated_at,
            })
            .collect(),
    ))
}

/// GET /api/conversations/{id}
pub async fn get_conversation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<StoredMessageBody>>, (StatusCode, String)> {
    if state
        .store
        .conversation(&id)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .is_none()
    {
        return Err((StatusCode::NOT_FOUND, "conversation not found".into()));
    }

    let messages = state
        .store
        .recent_messages(&id, usize::MAX / 2)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(
        messages
            .into_iter()
            .map(|m| StoredMessageBody {
                role: m.role.as_str().to_string(),
                content: m.content,
                tool_calls: m.tool_calls,
                tool_call_id: m.tool_call_id,
                sequence_number: m.sequence_number,
                created_at: m.created_at,
            })
            .collect(),
    ))
}

/// DELETE /api/conversations/{id}
pub async fn delete_conversation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let deleted = state
        .store
        .delete_conversation(&id)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if !deleted {
        return Err((StatusCode::NOT_FOUND, "conversation not found".into()));
    }
    Ok(Json(serde_json::json!({ "status": "deleted", "conversation_id": id })))
}
