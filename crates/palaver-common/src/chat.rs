use serde::{Deserialize, Serialize};

/// Role of a chat message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(crate::Error::Invariant(format!("unknown role '{other}'"))),
        }
    }
}

/// A structured tool invocation produced by the model. The id is unique
/// within a turn and referenced back by the matching tool-role message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            arguments,
        }
    }
}

/// Media attached to an inbound user message. Images switch the turn to
/// the vision model; audio/video carry a transcription produced upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base64_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription: Option<String>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.kind == "image" && self.base64_data.is_some()
    }
}

/// A single chat message, on the wire and in the reasoning loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// A tool-role message carrying the result for an earlier call.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            attachments: None,
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            attachments: None,
        }
    }

    pub fn has_images(&self) -> bool {
        self.attachments
            .as_ref()
            .is_some_and(|atts| atts.iter().any(Attachment::is_image))
    }
}

/// Token accounting reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInfo {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One frame of the outbound client stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default)]
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,
}

impl StreamChunk {
    pub fn content(text: impl Into<String>) -> Self {
        Self { content: text.into(), ..Default::default() }
    }

    pub fn status(text: impl Into<String>) -> Self {
        Self { status: Some(text.into()), ..Default::default() }
    }

    /// The single terminal frame of a successful turn.
    pub fn finished(conversation_id: impl Into<String>) -> Self {
        Self {
            done: true,
            conversation_id: Some(conversation_id.into()),
            ..Default::default()
        }
    }

    /// A terminal error frame; no frames follow it.
    pub fn error(message: impl Into<String>) -> Self {
        Self { error: Some(message.into()), done: true, ..Default::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trip() {
        for role in [Role::System, Role::User, Role::Assistant, Role::Tool] {
            let parsed: Role = role.as_str().parse().unwrap();
            assert_eq!(parsed, role);
        }
        assert!("robot".parse::<Role>().is_err());
    }

    #[test]
    fn chunk_serializes_sparsely() {
        let json = serde_json::to_value(StreamChunk::content("hi")).unwrap();
        assert_eq!(json["content"], "hi");
        assert!(json.get("status").is_none());
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn finished_chunk_carries_conversation_id() {
        let chunk = StreamChunk::finished("abc-123");
        assert!(chunk.done);
        assert_eq!(chunk.conversation_id.as_deref(), Some("abc-123"));
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["done"], true);
        assert_eq!(json["conversation_id"], "abc-123");
    }

    #[test]
    fn tool_call_ids_are_unique() {
        let a = ToolCall::new("read_file", serde_json::json!({"path": "a"}));
        let b = ToolCall::new("read_file", serde_json::json!({"path": "a"}));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn message_round_trips_through_json() {
        let msg = ChatMessage {
            role: Role::Assistant,
            content: "".into(),
            tool_calls: Some(vec![ToolCall::new("ls", serde_json::json!({"path": "."}))]),
            tool_call_id: None,
            attachments: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn image_detection() {
        let msg = ChatMessage {
            attachments: Some(vec![Attachment {
                kind: "image".into(),
                base64_data: Some("aGk=".into()),
                transcription: None,
            }]),
            ..ChatMessage::user("look at this")
        };
        assert!(msg.has_images());
        assert!(!ChatMessage::user("hi").has_images());
    }
}
