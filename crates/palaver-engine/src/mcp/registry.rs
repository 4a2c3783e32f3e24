use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use palaver_common::{Error, Result};
use palaver_config::{ToolConfig, ToolHostConfig};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::client::{restart_backoff, HostState, ToolHostClient};
use crate::classifier::GENERAL;
use crate::providers::ToolSchema;

/// A callable tool handle, however it is hosted.
#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> &ToolSchema;
    async fn call(&self, arguments: Value, timeout: Duration) -> Result<String>;
}

/// Bridge from a cached schema to its MCP host client.
pub struct McpTool {
    schema: ToolSchema,
    host: Arc<ToolHostClient>,
}

impl McpTool {
    pub fn new(schema: ToolSchema, host: Arc<ToolHostClient>) -> Self {
        Self { schema, host }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn call(&self, arguments: Value, timeout: Duration) -> Result<String> {
        self.host.call_tool(&self.schema.name, arguments, timeout).await
    }
}

struct RegisteredTool {
    intent: String,
    handle: Arc<dyn Tool>,
}

struct HostEntry {
    config: ToolHostConfig,
    client: Arc<ToolHostClient>,
}

/// Aggregates tools across hosts, caches their schemas, and narrows what
/// each turn can see.
///
/// Two orthogonal filters compose by intersection: the static allowlist
/// (the hard ceiling, sized for small-model context) and per-turn keyword
/// relevance. Registration order follows the host config order, which is
/// what breaks ties at the cap.
pub struct ToolRegistry {
    config: ToolConfig,
    tools: RwLock<Vec<RegisteredTool>>,
    hosts: RwLock<HashMap<String, HostEntry>>,
}

impl ToolRegistry {
    pub fn new(config: ToolConfig) -> Self {
        Self { config, tools: RwLock::new(Vec::new()), hosts: RwLock::new(HashMap::new()) }
    }

    /// Spawn the configured hosts and cache the union of their tools.
    /// A host that fails to come up is logged and skipped; the orchestrator
    /// still runs with whatever connected.
    pub async fn connect_hosts(self: &Arc<Self>, hosts: &[ToolHostConfig]) {
        for host_config in hosts {
            match ToolHostClient::spawn(host_config).await {
                Ok(client) => {
                    self.adopt_host(host_config.clone(), client).await;
                }
                Err(e) => {
                    warn!(host = %host_config.name, "tool host failed to start: {e}");
                }
            }
        }
        self.spawn_restart_monitor();
    }

    async fn adopt_host(&self, config: ToolHostConfig, client: Arc<ToolHostClient>) {
        let discovered = match client.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                warn!(host = %config.name, "tool listing failed: {e}");
                Vec::new()
            }
        };

        let mut registered = 0usize;
        for raw in &discovered {
            let Some(schema) = schema_from_listing(raw, &config.name) else { continue };
            let tool = McpTool::new(schema, Arc::clone(&client));
            if self.register(&config.intent, Arc::new(tool)).await {
                registered += 1;
            }
        }
        info!(host = %config.name, count = registered, "tool host connected");

        self.hosts.write().await.insert(config.name.clone(), HostEntry { config, client });
    }

    /// Register a tool handle under an intent bucket. Duplicate names keep
    /// the first registration; later ones are logged and skipped.
    pub async fn register(&self, intent: &str, handle: Arc<dyn Tool>) -> bool {
        let name = handle.schema().name.clone();
        let mut tools = self.tools.write().await;
        if tools.iter().any(|t| t.handle.schema().name == name) {
            warn!(tool = %name, "duplicate tool name, keeping first registration");
            return false;
        }
        tools.push(RegisteredTool { intent: intent.to_uppercase(), handle });
        true
    }

    /// Re-list every live host and atomically replace the cache.
    pub async fn refresh(&self) {
        let hosts: Vec<(ToolHostConfig, Arc<ToolHostClient>)> = {
            let guard = self.hosts.read().await;
            guard.values().map(|e| (e.config.clone(), Arc::clone(&e.client))).collect()
        };

        let mut fresh: Vec<RegisteredTool> = Vec::new();
        for (config, client) in hosts {
            if client.state() != HostState::Ready {
                continue;
            }
            let Ok(discovered) = client.list_tools().await else { continue };
            for raw in &discovered {
                let Some(schema) = schema_from_listing(raw, &config.name) else { continue };
                if fresh.iter().any(|t| t.handle.schema().name == schema.name) {
                    continue;
                }
                fresh.push(RegisteredTool {
                    intent: config.intent.to_uppercase(),
                    handle: Arc::new(McpTool::new(schema, Arc::clone(&client))),
                });
            }
        }

        let count = fresh.len();
        *self.tools.write().await = fresh;
        info!(count, "tool cache refreshed");
    }

    /// Distinct intent buckets present in the cache, GENERAL always included.
    pub async fn categories(&self) -> Vec<String> {
        let tools = self.tools.read().await;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for tool in tools.iter() {
            if seen.insert(tool.intent.clone()) {
                out.push(tool.intent.clone());
            }
        }
        if seen.insert(GENERAL.to_string()) {
            out.push(GENERAL.to_string());
        }
        out
    }

    /// The filtered tool set for a one-shot turn: allowlist ∩ relevance,
    /// capped at `filter_max`. GENERAL turns see no tools at all.
    pub async fn schemas_for(&self, intent: &str, query: &str) -> Vec<ToolSchema> {
        let intent = intent.to_uppercase();
        if intent == GENERAL {
            return Vec::new();
        }

        let matched = self.matched_tokens(&intent, query);
        let tools = self.tools.read().await;

        let mut out = Vec::new();
        for tool in tools.iter() {
            let schema = tool.handle.schema();
            if !self.allowed(&schema.name) {
                continue;
            }
            let relevant = tool.intent == intent
                || matched.iter().any(|token| {
                    schema.name.to_lowercase().contains(token)
                        || schema.description.to_lowercase().contains(token)
                });
            if relevant {
                out.push(schema.clone());
                if out.len() >= self.config.filter_max {
                    break;
                }
            }
        }
        out
    }

    /// The expanded set for the agentic path: the intent bucket first, then
    /// cross-category buckets named in the query, then GENERAL tools whose
    /// name tokens appear in the query. Deduplicated, allowlisted, capped
    /// at `agentic_max`.
    pub async fn expanded_schemas_for(&self, intent: &str, query: &str) -> Vec<ToolSchema> {
        let intent = intent.to_uppercase();
        let query_lower = query.to_lowercase();
        let tools = self.tools.read().await;

        let mut out: Vec<ToolSchema> = Vec::new();
        let push = |schema: &ToolSchema, out: &mut Vec<ToolSchema>| {
            if out.len() < self.config.agentic_max
                && self.allowed(&schema.name)
                && !out.iter().any(|s| s.name == schema.name)
            {
                out.push(schema.clone());
            }
        };

        for tool in tools.iter().filter(|t| t.intent == intent) {
            push(tool.handle.schema(), &mut out);
        }

        for tool in tools.iter() {
            if tool.intent == intent || tool.intent == GENERAL {
                continue;
            }
            if query_lower.contains(&tool.intent.to_lowercase()) {
                push(tool.handle.schema(), &mut out);
            }
        }

        for tool in tools.iter().filter(|t| t.intent == GENERAL) {
            let name = tool.handle.schema().name.to_lowercase();
            if name.split('_').any(|part| !part.is_empty() && query_lower.contains(part)) {
                push(tool.handle.schema(), &mut out);
            }
        }

        out
    }

    /// Allowlisted schemas in one intent bucket, registration order.
    pub async fn schemas_in_bucket(&self, intent: &str) -> Vec<ToolSchema> {
        let intent = intent.to_uppercase();
        self.tools
            .read()
            .await
            .iter()
            .filter(|t| t.intent == intent && self.allowed(&t.handle.schema().name))
            .map(|t| t.handle.schema().clone())
            .collect()
    }

    pub async fn get(&self, name: &str) -> Result<Arc<dyn Tool>> {
        self.tools
            .read()
            .await
            .iter()
            .find(|t| t.handle.schema().name == name)
            .map(|t| Arc::clone(&t.handle))
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))
    }

    /// Execute one tool under the configured per-call deadline.
    pub async fn execute(&self, name: &str, arguments: Value) -> Result<String> {
        let tool = self.get(name).await?;
        tool.call(arguments, Duration::from_millis(self.config.tool_timeout_ms)).await
    }

    pub async fn shutdown(&self) {
        let hosts = self.hosts.read().await;
        for entry in hosts.values() {
            entry.client.shutdown().await;
        }
    }

    fn allowed(&self, name: &str) -> bool {
        self.config.allowlist.iter().any(|allowed| allowed == name)
    }

    /// Query tokens that appear in the intent's keyword table.
    fn matched_tokens(&self, intent: &str, query: &str) -> Vec<String> {
        let table = self.config.tokens_for(intent);
        tokenize(query).into_iter().filter(|t| table.contains(t)).collect()
    }

    /// Dead hosts come back with bounded exponential backoff.
    fn spawn_restart_monitor(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut attempts: HashMap<String, u32> = HashMap::new();
            loop {
                tokio::time::sleep(Duration::from_secs(5)).await;

                let dead: Vec<ToolHostConfig> = {
                    let hosts = registry.hosts.read().await;
                    hosts
                        .values()
                        .filter(|e| e.client.state() == HostState::Dead)
                        .map(|e| e.config.clone())
                        .collect()
                };

                for config in dead {
                    let attempt = attempts.entry(config.name.clone()).or_insert(0);
                    tokio::time::sleep(restart_backoff(*attempt)).await;
                    *attempt += 1;

                    info!(host = %config.name, attempt = *attempt, "restarting dead tool host");
                    match ToolHostClient::spawn(&config).await {
                        Ok(client) => {
                            registry.adopt_host(config.clone(), client).await;
                            registry.refresh().await;
                            attempts.remove(&config.name);
                        }
                        Err(e) => {
                            warn!(host = %config.name, "restart failed: {e}");
                        }
                    }
                }
            }
        });
    }
}

fn schema_from_listing(raw: &Value, host: &str) -> Option<ToolSchema> {
    let name = raw.get("name")?.as_str()?.to_string();
    Some(ToolSchema {
        name,
        description: raw
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        parameters: raw
            .get("inputSchema")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({ "type": "object" })),
        origin_host: host.to_string(),
    })
}

/// Lowercase the query and split it on non-alphanumerics.
fn tokenize(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}
