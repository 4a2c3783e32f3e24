use std::env;

use palaver_common::{Error, Result};
use tracing::warn;

use crate::model::{AppConfig, ToolHostConfig};

/// Build an `AppConfig` from environment variables, starting from the
/// defaults. Unknown values fail loudly; absent values fall back.
pub fn load_from_env() -> Result<AppConfig> {
    let mut cfg = AppConfig::default();

    if let Ok(v) = env::var("HOST") {
        cfg.gateway.host = v;
    }
    if let Some(v) = parse_var::<u16>("PORT")? {
        cfg.gateway.port = v;
    }
    if let Ok(v) = env::var("DATABASE_PATH") {
        cfg.database_path = v;
    }

    if let Ok(v) = env::var("DEFAULT_PROVIDER") {
        let v = v.to_ascii_lowercase();
        match v.as_str() {
            "ollama" | "openai" | "anthropic" | "gemini" => cfg.provider.default_provider = v,
            other => {
                return Err(Error::Config(format!("unknown DEFAULT_PROVIDER '{other}'")));
            }
        }
    }
    if let Ok(v) = env::var("MODEL") {
        cfg.provider.model = v;
    }
    if let Ok(v) = env::var("VISION_MODEL") {
        cfg.provider.vision_model = v;
    }
    if let Ok(v) = env::var("OLLAMA_BASE_URL") {
        cfg.provider.ollama_base_url = v;
    }
    cfg.provider.openai_api_key = env::var("OPENAI_API_KEY").ok();
    cfg.provider.anthropic_api_key = env::var("ANTHROPIC_API_KEY").ok();
    cfg.provider.gemini_api_key = env::var("GEMINI_API_KEY").ok();
    if let Some(v) = parse_var::<u64>("LLM_TIMEOUT_MS")? {
        cfg.provider.llm_timeout_ms = v;
    }
    if let Some(v) = parse_var::<u64>("TURN_TIMEOUT_MS")? {
        cfg.provider.turn_timeout_ms = v;
    }

    if let Ok(v) = env::var("EMBEDDING_MODEL") {
        cfg.memory.embedding_model = v;
    }
    if let Some(v) = parse_var::<usize>("EMBEDDING_DIM")? {
        cfg.memory.embedding_dim = v;
    }
    if let Some(v) = parse_var::<usize>("HOT_WINDOW_SIZE")? {
        cfg.memory.hot_window_size = v;
    }
    if let Some(v) = parse_var::<i64>("SUMMARY_THRESHOLD")? {
        cfg.memory.summary_threshold = v;
    }

    if let Ok(v) = env::var("TOOL_ALLOWLIST") {
        let list: Vec<String> = v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if list.len() > 15 {
            warn!("TOOL_ALLOWLIST has {} entries; small models degrade past 15", list.len());
        }
        cfg.tools.allowlist = list;
    }
    if let Some(v) = parse_var::<usize>("TOOL_FILTER_MAX")? {
        cfg.tools.filter_max = v;
    }
    if let Some(v) = parse_var::<usize>("MAX_TOOL_TURNS")? {
        cfg.tools.max_tool_turns = v;
    }
    if let Some(v) = parse_var::<u64>("TOOL_TIMEOUT_MS")? {
        cfg.tools.tool_timeout_ms = v;
    }
    if let Some(v) = parse_var::<usize>("TOOL_RESULT_MAX_BYTES")? {
        cfg.tools.result_max_bytes = v;
    }

    // Tool hosts may be supplied wholesale as JSON, replacing the stock set.
    if let Ok(raw) = env::var("TOOL_HOSTS") {
        let hosts: Vec<ToolHostConfig> = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid TOOL_HOSTS json: {e}")))?;
        cfg.tool_hosts = hosts;
    }

    Ok(cfg)
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("invalid value for {key}: '{raw}'"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them serialized on one lock.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn loads_defaults_without_env() {
        let _guard = ENV_LOCK.lock().unwrap();
        for key in ["DEFAULT_PROVIDER", "MAX_TOOL_TURNS", "TOOL_ALLOWLIST"] {
            std::env::remove_var(key);
        }
        let cfg = load_from_env().unwrap();
        assert_eq!(cfg.provider.default_provider, "ollama");
        assert_eq!(cfg.tools.max_tool_turns, 5);
    }

    #[test]
    fn rejects_unknown_provider() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("DEFAULT_PROVIDER", "skynet");
        let err = load_from_env().unwrap_err();
        assert!(err.to_string().contains("skynet"));
        std::env::remove_var("DEFAULT_PROVIDER");
    }

    #[test]
    fn parses_allowlist_and_limits() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("TOOL_ALLOWLIST", "read_file, git_status ,fetch_url");
        std::env::set_var("MAX_TOOL_TURNS", "3");
        let cfg = load_from_env().unwrap();
        assert_eq!(cfg.tools.allowlist, vec!["read_file", "git_status", "fetch_url"]);
        assert_eq!(cfg.tools.max_tool_turns, 3);
        std::env::remove_var("TOOL_ALLOWLIST");
        std::env::remove_var("MAX_TOOL_TURNS");
    }

    #[test]
    fn rejects_garbage_numbers() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("MAX_TOOL_TURNS", "many");
        assert!(load_from_env().is_err());
        std::env::remove_var("MAX_TOOL_TURNS");
    }
}
