//! Tool dispatch - execute one parsed action against the environment
//!
//! Each executable `ActionKind` maps to a handler here; the result lands in
//! the action's result slot and, serialised, in the synthetic tool-result
//! input for the next turn. Tool errors are data - they never fail the
//! turn loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub mod builtin;
pub mod fs;
pub mod sessions;
pub mod shell;
pub mod truncation;

pub use builtin::{BuiltinRegistry, BuiltinTool};
pub use sessions::SessionPool;

use crate::mcp::McpRegistry;
use crate::reply::ActionKind;

/// Caps applied to every tool result before it reaches the model.
pub const MAX_RESULT_LINES: usize = 2_000;
pub const MAX_RESULT_BYTES: usize = 50_000;

/// Outcome of one tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }

    /// Rendering stored into the action's result slot.
    pub fn into_result(self) -> String {
        if self.is_error {
            format!("ERROR: {}", self.text)
        } else {
            self.text
        }
    }
}

/// Execution environment handed to tool dispatch, scoped to one task turn.
#[derive(Clone)]
pub struct ToolEnv {
    pub task_uuid: String,
    pub workdir: PathBuf,
    pub command_timeout: Duration,
    pub sandbox_profile: Option<String>,
    /// Agent permission strings (`server:tool` / `server:*`).
    pub permissions: Vec<String>,
    pub sessions: Arc<SessionPool>,
    pub mcp: Arc<McpRegistry>,
    pub builtins: Arc<BuiltinRegistry>,
}

impl ToolEnv {
    fn permits_mcp(&self, server: &str, tool: &str) -> bool {
        self.permissions.iter().any(|p| {
            p == &format!("{server}:{tool}") || p == &format!("{server}:*") || p == "*"
        })
    }
}

/// Execute one action. Returns `None` for kinds that have no inline
/// execution here (boundaries, meta directives, sub-agent routing, and the
/// interactive `make-ask`, whose answer arrives as a later user-input).
pub async fn dispatch_tool(kind: &ActionKind, env: &ToolEnv) -> Option<ToolOutput> {
    let output = match kind {
        ActionKind::ListFiles { path } => fs::list_files(&env.workdir, path).await,
        ActionKind::GetContent { path } => fs::get_content(&env.workdir, path).await,
        ActionKind::PutContent { path, data } => fs::put_content(&env.workdir, path, data).await,
        ActionKind::ReplaceText { path, diff } => {
            fs::replace_text(&env.workdir, path, diff).await
        }
        ActionKind::ExecuteCommand { command } => {
            shell::execute_command(
                command,
                &env.workdir,
                env.command_timeout,
                env.sandbox_profile.as_deref(),
            )
            .await
        }
        ActionKind::StartAsyncCmd { session, command } => {
            env.sessions.start(session, command, &env.workdir).await
        }
        ActionKind::QueryAsyncCmd { session } => env.sessions.query(session).await,
        ActionKind::AbortAsyncCmd { session } => env.sessions.abort(session).await,
        ActionKind::UseMcpTool {
            server,
            tool,
            args,
            ..
        } => {
            if env.permits_mcp(server, tool) {
                env.mcp.call(server, tool, args).await
            } else {
                ToolOutput::error(format!(
                    "tool '{server}:{tool}' is not in this agent's permitted set"
                ))
            }
        }
        ActionKind::UseBuiltinTool { tool, args, .. } => env.builtins.invoke(tool, args).await,
        _ => return None,
    };

    Some(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(workdir: &std::path::Path) -> ToolEnv {
        ToolEnv {
            task_uuid: "t1".to_string(),
            workdir: workdir.to_path_buf(),
            command_timeout: Duration::from_secs(10),
            sandbox_profile: None,
            permissions: vec!["files:*".to_string()],
            sessions: Arc::new(SessionPool::new()),
            mcp: Arc::new(McpRegistry::new()),
            builtins: Arc::new(BuiltinRegistry::new()),
        }
    }

    #[tokio::test]
    async fn boundary_and_meta_kinds_have_no_inline_execution() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = env(dir.path());

        for kind in [
            ActionKind::ToolResult {
                content: "x".into(),
            },
            ActionKind::Complete {
                botname: "b".into(),
                content: "done".into(),
            },
            ActionKind::StartSubtask {
                sub_agent: "w".into(),
                task_desc: "d".into(),
                context: String::new(),
                require: String::new(),
            },
            ActionKind::MakeAsk {
                question: "?".into(),
                multiple: false,
                options: vec![],
            },
        ] {
            assert!(dispatch_tool(&kind, &env).await.is_none());
        }
    }

    #[tokio::test]
    async fn workdir_violation_performs_no_io() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = env(dir.path());

        let kind = ActionKind::PutContent {
            path: "/etc/hostile.txt".into(),
            data: "nope".into(),
        };
        let out = dispatch_tool(&kind, &env).await.expect("tool kind");
        assert!(out.is_error);
        assert!(out.text.contains("workdir violation"));
        assert!(!std::path::Path::new("/etc/hostile.txt").exists());
    }

    #[tokio::test]
    async fn mcp_without_permission_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = env(dir.path());

        let kind = ActionKind::UseMcpTool {
            desc: String::new(),
            server: "search".into(),
            tool: "query".into(),
            args: "{}".into(),
        };
        let out = dispatch_tool(&kind, &env).await.expect("tool kind");
        assert!(out.is_error);
        assert!(out.text.contains("permitted"));
    }
}
