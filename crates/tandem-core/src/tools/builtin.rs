//! Builtin tool registry - host-provided tools invoked by name
//!
//! `use-builtin-tool` dispatches here. The engine ships no catalogue of
//! its own; embedders register implementations at boot. Arguments arrive
//! as the model wrote them and are parsed as JSON (invalid JSON yields an
//! empty object, same as the MCP path).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::ToolOutput;

/// A host-provided tool.
#[async_trait]
pub trait BuiltinTool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn invoke(&self, args: Value) -> Result<String>;
}

/// Registry of builtin tools.
#[derive(Default)]
pub struct BuiltinRegistry {
    tools: RwLock<HashMap<String, Arc<dyn BuiltinTool>>>,
}

impl BuiltinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, tool: Arc<dyn BuiltinTool>) {
        let name = tool.name().to_string();
        self.tools.write().await.insert(name, tool);
    }

    pub async fn names(&self) -> Vec<String> {
        let tools = self.tools.read().await;
        let mut names: Vec<String> = tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn invoke(&self, name: &str, raw_args: &str) -> ToolOutput {
        let tool = {
            let tools = self.tools.read().await;
            tools.get(name).cloned()
        };
        let Some(tool) = tool else {
            return ToolOutput::error(format!("unknown builtin tool: {name}"));
        };

        let args: Value = serde_json::from_str(raw_args).unwrap_or_else(|_| Value::Object(Default::default()));

        match tool.invoke(args).await {
            Ok(output) => ToolOutput::success(output),
            Err(e) => ToolOutput::error(format!("builtin tool '{name}' failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl BuiltinTool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the given text back"
        }

        async fn invoke(&self, args: Value) -> Result<String> {
            Ok(args
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string())
        }
    }

    #[tokio::test]
    async fn invoke_round_trips_json_args() {
        let registry = BuiltinRegistry::new();
        registry.register(Arc::new(EchoTool)).await;

        let out = registry
            .invoke("echo", &json!({"text": "hello"}).to_string())
            .await;
        assert!(!out.is_error);
        assert_eq!(out.text, "hello");
    }

    #[tokio::test]
    async fn invalid_json_args_become_empty_object() {
        let registry = BuiltinRegistry::new();
        registry.register(Arc::new(EchoTool)).await;

        let out = registry.invoke("echo", "{not json").await;
        assert!(!out.is_error);
        assert_eq!(out.text, "");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let registry = BuiltinRegistry::new();
        let out = registry.invoke("nope", "{}").await;
        assert!(out.is_error);
    }
}
