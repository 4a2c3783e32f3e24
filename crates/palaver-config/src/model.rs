use serde::{Deserialize, Serialize};

/// Top-level application configuration. Loaded from the environment by
/// `loader::load_from_env`; every field has a working default so the
/// server comes up against a local Ollama with no configuration at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub provider: ProviderConfig,
    pub memory: MemoryConfig,
    pub tools: ToolConfig,
    pub tool_hosts: Vec<ToolHostConfig>,
    pub database_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Which provider variant the factory returns: "ollama", "openai",
    /// "anthropic" or "gemini".
    pub default_provider: String,
    /// Model id for chat completions.
    pub model: String,
    /// Model auto-selected when the turn carries image attachments.
    pub vision_model: String,
    pub temperature: f64,
    pub max_tokens: u32,

    pub ollama_base_url: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: String,
    pub gemini_api_key: Option<String>,
    pub gemini_base_url: String,

    /// Deadline for a single LLM streaming call within an iteration.
    pub llm_timeout_ms: u64,
    /// Whole-turn ceiling across all iterations and tool calls.
    pub turn_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// N for the hot sliding window.
    pub hot_window_size: usize,
    /// Unsummarized-message delta that triggers the warm summary refresh.
    pub summary_threshold: i64,
    /// Top-K for cold similarity recall.
    pub cold_recall_limit: usize,
    /// Local embedding model id (cold memory stays local for privacy).
    pub embedding_model: String,
    pub embedding_dim: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Static "essential" set; the hard ceiling on what any turn can see.
    pub allowlist: Vec<String>,
    /// Upper bound on tools exposed in a one-shot turn.
    pub filter_max: usize,
    /// Upper bound for the agentic path (cross-category expansion).
    pub agentic_max: usize,
    pub tool_timeout_ms: u64,
    /// Tool results larger than this are truncated with a marker suffix.
    pub result_max_bytes: usize,
    /// Hard ceiling on LLM-streaming iterations per turn.
    pub max_tool_turns: usize,
    pub keywords: Vec<IntentKeywords>,
}

/// Per-intent keyword table for the relevance filter. The token set is
/// configuration, not code: the defaults below cover the stock hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentKeywords {
    pub intent: String,
    pub tokens: Vec<String>,
}

/// One spawnable MCP tool host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolHostConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    /// Intent bucket this host's tools belong to ("GIT", "FILESYSTEM",
    /// "FETCH", "GENERAL", ...).
    #[serde(default = "default_intent")]
    pub intent: String,
}

fn default_intent() -> String {
    "GENERAL".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig { host: "127.0.0.1".into(), port: 8000 },
            provider: ProviderConfig::default(),
            memory: MemoryConfig::default(),
            tools: ToolConfig::default(),
            tool_hosts: default_tool_hosts(),
            database_path: "palaver.db".into(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            default_provider: "ollama".into(),
            model: "llama3.2".into(),
            vision_model: "llama3.2-vision".into(),
            temperature: 0.7,
            max_tokens: 1024,
            ollama_base_url: "http://localhost:11434".into(),
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".into(),
            anthropic_api_key: None,
            anthropic_base_url: "https://api.anthropic.com".into(),
            gemini_api_key: None,
            gemini_base_url: "https://generativelanguage.googleapis.com/v1beta".into(),
            llm_timeout_ms: 120_000,
            turn_timeout_ms: 600_000,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            hot_window_size: 50,
            summary_threshold: 20,
            cold_recall_limit: 5,
            embedding_model: "nomic-embed-text".into(),
            embedding_dim: 768,
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            allowlist: vec![
                "read_file".into(),
                "write_file".into(),
                "list_directory".into(),
                "search_files".into(),
                "get_file_info".into(),
                "git_status".into(),
                "git_diff".into(),
                "git_log".into(),
                "git_show".into(),
                "fetch_url".into(),
                "fetch_html".into(),
                "get_current_time".into(),
                "sequential_thinking".into(),
            ],
            filter_max: 5,
            agentic_max: 8,
            tool_timeout_ms: 30_000,
            result_max_bytes: 16_384,
            max_tool_turns: 5,
            keywords: default_keywords(),
        }
    }
}

fn default_keywords() -> Vec<IntentKeywords> {
    let table: &[(&str, &[&str])] = &[
        (
            "FILESYSTEM",
            &["file", "read", "write", "ls", "dir", "directory", "list", "show", "view", "path", "search"],
        ),
        (
            "GIT",
            &["git", "commit", "branch", "diff", "status", "log", "repo", "blame", "merge"],
        ),
        (
            "FETCH",
            &["fetch", "url", "http", "https", "web", "download", "page", "site"],
        ),
    ];
    table
        .iter()
        .map(|(intent, tokens)| IntentKeywords {
            intent: intent.to_string(),
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
        })
        .collect()
}

/// Stock tool hosts, matching the npm MCP servers the system ships with.
fn default_tool_hosts() -> Vec<ToolHostConfig> {
    let mut hosts = vec![
        ToolHostConfig {
            name: "filesystem".into(),
            command: "npx".into(),
            args: vec!["-y".into(), "@modelcontextprotocol/server-filesystem".into(), ".".into()],
            env: Default::default(),
            intent: "FILESYSTEM".into(),
        },
        ToolHostConfig {
            name: "git".into(),
            command: "npx".into(),
            args: vec!["-y".into(), "@mseep/git-mcp-server".into()],
            env: Default::default(),
            intent: "GIT".into(),
        },
        ToolHostConfig {
            name: "fetch".into(),
            command: "npx".into(),
            args: vec!["-y".into(), "zcaceres/fetch-mcp".into()],
            env: Default::default(),
            intent: "FETCH".into(),
        },
        ToolHostConfig {
            name: "sequential-thinking".into(),
            command: "npx".into(),
            args: vec!["-y".into(), "@modelcontextprotocol/server-sequential-thinking".into()],
            env: Default::default(),
            intent: "GENERAL".into(),
        },
    ];

    if let Ok(token) = std::env::var("GITHUB_TOKEN") {
        hosts.push(ToolHostConfig {
            name: "github".into(),
            command: "npx".into(),
            args: vec!["-y".into(), "@modelcontextprotocol/server-github".into()],
            env: [("GITHUB_TOKEN".to_string(), token)].into_iter().collect(),
            intent: "GIT".into(),
        });
    }

    hosts
}

impl ToolConfig {
    /// Tokens for an intent bucket, empty for unknown/GENERAL.
    pub fn tokens_for(&self, intent: &str) -> &[String] {
        self.keywords
            .iter()
            .find(|k| k.intent.eq_ignore_ascii_case(intent))
            .map(|k| k.tokens.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.tools.max_tool_turns, 5);
        assert_eq!(cfg.tools.filter_max, 5);
        assert_eq!(cfg.memory.hot_window_size, 50);
        assert_eq!(cfg.memory.summary_threshold, 20);
        assert!(cfg.tools.allowlist.len() <= 15);
    }

    #[test]
    fn keyword_lookup_is_case_insensitive() {
        let cfg = ToolConfig::default();
        assert!(cfg.tokens_for("filesystem").contains(&"ls".to_string()));
        assert!(cfg.tokens_for("GIT").contains(&"diff".to_string()));
        assert!(cfg.tokens_for("GENERAL").is_empty());
    }

    #[test]
    fn stock_hosts_carry_intent_buckets() {
        let cfg = AppConfig::default();
        let fs = cfg.tool_hosts.iter().find(|h| h.name == "filesystem").unwrap();
        assert_eq!(fs.intent, "FILESYSTEM");
    }
}
