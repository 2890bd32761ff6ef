//! MCP registry - remote tool servers as a black box
//!
//! The core consumes only `list_tools`, `call_tool`, and `read_resource`;
//! the wire protocol (stdio, streamable-HTTP, in-memory) lives behind the
//! `McpConnection` trait and is provided by the embedder. A server that is
//! absent, disconnected, or errored yields a structured "unserviceable"
//! tool error rather than failing the turn.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::tools::ToolOutput;

/// One server entry in the settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// `stdio` or `http`; informational for the transport provider.
    #[serde(default)]
    pub transport: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Tool definition advertised by a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

/// Result of one remote tool call.
#[derive(Debug, Clone)]
pub struct McpCallResult {
    pub content: String,
    pub is_error: bool,
}

/// Transport-agnostic connection to one server.
#[async_trait]
pub trait McpConnection: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpToolDef>>;

    async fn call_tool(&self, name: &str, args: Value) -> Result<McpCallResult>;

    async fn read_resource(&self, uri: &str) -> Result<String>;
}

/// Factory the embedder supplies to open connections from configs.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn connect(&self, name: &str, config: &McpServerConfig)
        -> Result<Arc<dyn McpConnection>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum McpServerStatus {
    Disconnected,
    Connected,
    Error(String),
}

impl std::fmt::Display for McpServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            McpServerStatus::Disconnected => write!(f, "disconnected"),
            McpServerStatus::Connected => write!(f, "connected"),
            McpServerStatus::Error(e) => write!(f, "error: {e}"),
        }
    }
}

struct ServerEntry {
    config: McpServerConfig,
    status: McpServerStatus,
    connection: Option<Arc<dyn McpConnection>>,
}

/// Registry of configured and connected MCP servers.
pub struct McpRegistry {
    servers: RwLock<HashMap<String, ServerEntry>>,
    transport: Option<Arc<dyn McpTransport>>,
}

impl Default for McpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl McpRegistry {
    pub fn new() -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            transport: None,
        }
    }

    /// Build from settings; connections open lazily via `reboot`.
    pub fn from_config(
        configs: HashMap<String, McpServerConfig>,
        transport: Option<Arc<dyn McpTransport>>,
    ) -> Self {
        let servers = configs
            .into_iter()
            .filter(|(_, c)| c.enabled)
            .map(|(name, config)| {
                (
                    name,
                    ServerEntry {
                        config,
                        status: McpServerStatus::Disconnected,
                        connection: None,
                    },
                )
            })
            .collect();
        Self {
            servers: RwLock::new(servers),
            transport,
        }
    }

    /// Attach a live connection directly (in-memory transport, tests).
    pub async fn attach(&self, name: &str, connection: Arc<dyn McpConnection>) {
        let mut servers = self.servers.write().await;
        servers.insert(
            name.to_string(),
            ServerEntry {
                config: McpServerConfig::default(),
                status: McpServerStatus::Connected,
                connection: Some(connection),
            },
        );
        info!(server = name, "mcp server attached");
    }

    /// (Re)connect one server through the transport factory. Consumed by
    /// the `mcp-reboot` bus topic.
    pub async fn reboot(&self, name: &str) {
        let Some(transport) = self.transport.clone() else {
            warn!(server = name, "mcp reboot requested but no transport is installed");
            return;
        };

        let config = {
            let servers = self.servers.read().await;
            match servers.get(name) {
                Some(entry) => entry.config.clone(),
                None => {
                    warn!(server = name, "mcp reboot requested for unknown server");
                    return;
                }
            }
        };

        let outcome = transport.connect(name, &config).await;
        let mut servers = self.servers.write().await;
        if let Some(entry) = servers.get_mut(name) {
            match outcome {
                Ok(connection) => {
                    entry.connection = Some(connection);
                    entry.status = McpServerStatus::Connected;
                    info!(server = name, "mcp server connected");
                }
                Err(e) => {
                    entry.connection = None;
                    entry.status = McpServerStatus::Error(e.to_string());
                    warn!(server = name, "mcp connect failed: {e:?}");
                }
            }
        }
    }

    /// Call a tool on a server. Arguments are parsed as JSON; invalid JSON
    /// yields an empty object.
    pub async fn call(&self, server: &str, tool: &str, raw_args: &str) -> ToolOutput {
        let connection = {
            let servers = self.servers.read().await;
            match servers.get(server) {
                Some(entry) => match (&entry.status, &entry.connection) {
                    (McpServerStatus::Connected, Some(conn)) => Arc::clone(conn),
                    (status, _) => {
                        return ToolOutput::error(format!(
                            "mcp server '{server}' unserviceable ({status})"
                        ));
                    }
                },
                None => {
                    return ToolOutput::error(format!(
                        "mcp server '{server}' unserviceable (not configured)"
                    ));
                }
            }
        };

        let args: Value =
            serde_json::from_str(raw_args).unwrap_or_else(|_| Value::Object(Default::default()));

        match connection.call_tool(tool, args).await {
            Ok(result) if result.is_error => ToolOutput::error(result.content),
            Ok(result) => ToolOutput::success(result.content),
            Err(e) => {
                self.mark_error(server, &e.to_string()).await;
                ToolOutput::error(format!("mcp call '{server}:{tool}' failed: {e}"))
            }
        }
    }

    async fn mark_error(&self, server: &str, message: &str) {
        let mut servers = self.servers.write().await;
        if let Some(entry) = servers.get_mut(server) {
            entry.status = McpServerStatus::Error(message.to_string());
        }
    }

    /// `(server, tool)` pairs across connected servers, for prompt assembly.
    pub async fn tool_digest(&self) -> Vec<(String, McpToolDef)> {
        let connections: Vec<(String, Arc<dyn McpConnection>)> = {
            let servers = self.servers.read().await;
            servers
                .iter()
                .filter_map(|(name, e)| e.connection.clone().map(|c| (name.clone(), c)))
                .collect()
        };

        let mut tools = Vec::new();
        for (name, connection) in connections {
            match connection.list_tools().await {
                Ok(defs) => tools.extend(defs.into_iter().map(|d| (name.clone(), d))),
                Err(e) => warn!(server = %name, "mcp list_tools failed: {e:?}"),
            }
        }
        tools.sort_by(|a, b| (&a.0, &a.1.name).cmp(&(&b.0, &b.1.name)));
        tools
    }

    /// Status lines for UI surfaces.
    pub async fn statuses(&self) -> Vec<(String, McpServerStatus)> {
        let servers = self.servers.read().await;
        let mut out: Vec<(String, McpServerStatus)> = servers
            .iter()
            .map(|(name, e)| (name.clone(), e.status.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedConnection;

    #[async_trait]
    impl McpConnection for FixedConnection {
        async fn list_tools(&self) -> Result<Vec<McpToolDef>> {
            Ok(vec![McpToolDef {
                name: "lookup".to_string(),
                description: "Look something up".to_string(),
                input_schema: json!({"type": "object"}),
            }])
        }

        async fn call_tool(&self, name: &str, args: Value) -> Result<McpCallResult> {
            Ok(McpCallResult {
                content: format!("{name}:{args}"),
                is_error: false,
            })
        }

        async fn read_resource(&self, uri: &str) -> Result<String> {
            Ok(format!("resource {uri}"))
        }
    }

    #[tokio::test]
    async fn unknown_server_is_unserviceable() {
        let registry = McpRegistry::new();
        let out = registry.call("nowhere", "lookup", "{}").await;
        assert!(out.is_error);
        assert!(out.text.contains("unserviceable"));
    }

    #[tokio::test]
    async fn configured_but_disconnected_server_is_unserviceable() {
        let mut configs = HashMap::new();
        configs.insert("search".to_string(), McpServerConfig::default());
        let registry = McpRegistry::from_config(configs, None);

        let out = registry.call("search", "lookup", "{}").await;
        assert!(out.is_error);
        assert!(out.text.contains("disconnected"));
    }

    #[tokio::test]
    async fn attached_server_serves_calls() {
        let registry = McpRegistry::new();
        registry.attach("search", Arc::new(FixedConnection)).await;

        let out = registry.call("search", "lookup", r#"{"q": 1}"#).await;
        assert!(!out.is_error);
        assert!(out.text.starts_with("lookup:"));
    }

    #[tokio::test]
    async fn invalid_json_args_degrade_to_empty_object() {
        let registry = McpRegistry::new();
        registry.attach("search", Arc::new(FixedConnection)).await;

        let out = registry.call("search", "lookup", "{oops").await;
        assert!(!out.is_error);
        assert_eq!(out.text, "lookup:{}");
    }

    #[tokio::test]
    async fn tool_digest_lists_connected_servers() {
        let registry = McpRegistry::new();
        registry.attach("search", Arc::new(FixedConnection)).await;

        let digest = registry.tool_digest().await;
        assert_eq!(digest.len(), 1);
        assert_eq!(digest[0].0, "search");
        assert_eq!(digest[0].1.name, "lookup");
    }
}
