pub mod chat;

pub use chat::{
    Attachment, ChatMessage, Role, StreamChunk, ToolCall, UsageInfo,
};

/// Unified error type shared across all palaver crates.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    /// The provider could not be reached or returned a non-success status.
    #[error("provider unavailable: {0}")]
    Provider(String),

    /// The provider answered, but the payload could not be interpreted.
    #[error("provider returned malformed output: {0}")]
    ProviderOutput(String),

    #[error("tool '{0}' not found")]
    ToolNotFound(String),

    #[error("invalid arguments for tool '{name}': {reason}")]
    ToolArgs { name: String, reason: String },

    #[error("tool '{name}' timed out after {timeout_ms}ms")]
    ToolTimeout { name: String, timeout_ms: u64 },

    #[error("tool '{name}' failed: {reason}")]
    Tool { name: String, reason: String },

    /// The tool host process is gone; calls fail fast until restart.
    #[error("tool host '{0}' is dead")]
    HostDead(String),

    #[error("reasoning loop exceeded {0} tool turns")]
    IterationLimit(usize),

    /// The client went away; nothing is emitted beyond the closed stream.
    #[error("request cancelled")]
    Cancelled,

    #[error("internal invariant violated: {0}")]
    Invariant(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Tool-level errors are recovered locally: they become an in-band
    /// tool-role message so the model can self-correct. Everything else
    /// surfaces to the client as a terminal error frame.
    pub fn is_tool_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ToolNotFound(_)
                | Error::ToolArgs { .. }
                | Error::ToolTimeout { .. }
                | Error::Tool { .. }
                | Error::HostDead(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_errors_are_recoverable() {
        assert!(Error::ToolNotFound("x".into()).is_tool_recoverable());
        assert!(Error::ToolTimeout { name: "x".into(), timeout_ms: 5 }.is_tool_recoverable());
        assert!(Error::HostDead("fs".into()).is_tool_recoverable());
        assert!(!Error::Provider("down".into()).is_tool_recoverable());
        assert!(!Error::IterationLimit(5).is_tool_recoverable());
        assert!(!Error::Cancelled.is_tool_recoverable());
    }

    #[test]
    fn display_includes_context() {
        let err = Error::ToolTimeout { name: "read_file".into(), timeout_ms: 30_000 };
        assert_eq!(err.to_string(), "tool 'read_file' timed out after 30000ms");
    }
}
