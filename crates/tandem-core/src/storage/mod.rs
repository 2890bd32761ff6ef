//! Persistence layer
//!
//! The engine talks to a `Store` trait; any backend honouring the
//! operational semantics is acceptable. Shipped backends:
//! - `SqliteStore` - embedded rusqlite database
//! - `MemoryStore` - in-memory mock for tests and throwaway runs
//!
//! Messages are retained for three months by default; uploads and other
//! binary payloads never enter the primary store (they live on the
//! filesystem under the task workdir).

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Default message retention window.
pub fn default_retention_cutoff() -> DateTime<Utc> {
    Utc::now() - Duration::days(90)
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Waiting,
    Failed,
    Canceled,
    Completed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Running => "running",
            TaskState::Waiting => "waiting",
            TaskState::Failed => "failed",
            TaskState::Canceled => "canceled",
            TaskState::Completed => "completed",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for TaskState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(TaskState::Running),
            "waiting" => Ok(TaskState::Waiting),
            "failed" => Ok(TaskState::Failed),
            "canceled" => Ok(TaskState::Canceled),
            "completed" => Ok(TaskState::Completed),
            other => anyhow::bail!("unknown task state: {other}"),
        }
    }
}

/// Operation type of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpType {
    UserInput,
    ToolResult,
    Subtask,
    Crontab,
    BotReply,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::UserInput => "user-input",
            OpType::ToolResult => "tool-result",
            OpType::Subtask => "subtask",
            OpType::Crontab => "crontab",
            OpType::BotReply => "bot-reply",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OpType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user-input" => Ok(OpType::UserInput),
            "tool-result" => Ok(OpType::ToolResult),
            "subtask" => Ok(OpType::Subtask),
            "crontab" => Ok(OpType::Crontab),
            "bot-reply" => Ok(OpType::BotReply),
            other => anyhow::bail!("unknown op type: {other}"),
        }
    }
}

/// Coarse agent role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Leader,
    Worker,
    Basic,
    Debug,
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentRole::Leader => "leader",
            AgentRole::Worker => "worker",
            AgentRole::Basic => "basic",
            AgentRole::Debug => "debug",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for AgentRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "leader" => Ok(AgentRole::Leader),
            "worker" => Ok(AgentRole::Worker),
            "basic" => Ok(AgentRole::Basic),
            "debug" => Ok(AgentRole::Debug),
            other => anyhow::bail!("unknown agent role: {other}"),
        }
    }
}

/// A unit of work, created when a user starts something.
///
/// `group_id` equals the leader task's uuid for any subordinate task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub uuid: String,
    pub name: String,
    pub workdir: String,
    pub state: TaskState,
    pub group_id: String,
    pub leader_agent: Option<String>,
    /// Rolling context annotation maintained by `annotate` actions.
    pub annotation: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(name: impl Into<String>, workdir: impl Into<String>) -> Self {
        let uuid = uuid::Uuid::new_v4().to_string();
        Self {
            group_id: uuid.clone(),
            uuid,
            name: name.into(),
            workdir: workdir.into(),
            state: TaskState::Waiting,
            leader_agent: None,
            annotation: None,
            created_at: Utc::now(),
        }
    }
}

/// One persisted transcript row. Immutable once written.
///
/// A row carries either a request (input to the model) or a respond
/// (the model's reply); `prev_uuid` threads sibling tool-result rows onto
/// the user-input that spawned them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub uuid: String,
    pub task_id: String,
    pub prev_uuid: Option<String>,
    pub op_type: OpType,
    pub request: String,
    pub respond: String,
    pub sent_at: DateTime<Utc>,
    pub received_at: Option<DateTime<Utc>>,
}

impl MessageRecord {
    pub fn request(task_id: &str, op_type: OpType, content: &str) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            prev_uuid: None,
            op_type,
            request: content.to_string(),
            respond: String::new(),
            sent_at: Utc::now(),
            received_at: None,
        }
    }

    pub fn reply(task_id: &str, prev_uuid: &str, content: &str) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            prev_uuid: Some(prev_uuid.to_string()),
            op_type: OpType::BotReply,
            request: String::new(),
            respond: content.to_string(),
            sent_at: Utc::now(),
            received_at: Some(Utc::now()),
        }
    }

    pub fn with_prev(mut self, prev_uuid: Option<String>) -> Self {
        self.prev_uuid = prev_uuid;
        self
    }
}

/// A named persona with a prompt template and a permitted tool set.
///
/// `tool_permissions` entries are `"server:toolName"` or `"server:*"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub uuid: String,
    pub role: AgentRole,
    pub prompt_template: String,
    pub tool_permissions: Vec<String>,
    pub provider_key: Option<String>,
    pub home_dir: Option<String>,
}

impl AgentProfile {
    /// Check an MCP tool against the agent's permission set.
    pub fn permits(&self, server: &str, tool: &str) -> bool {
        self.tool_permissions.iter().any(|p| {
            p == &format!("{server}:{tool}") || p == &format!("{server}:*") || p == "*"
        })
    }
}

/// A future-dated reminder owned by the cron collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Todo {
    pub uuid: String,
    pub task_id: String,
    pub cron_expr: String,
    pub body: String,
    pub done: bool,
}

/// A memorised fact, folded into the memory digest at prompt assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub uuid: String,
    pub task_id: String,
    pub subject: String,
    pub content: String,
    pub datetime: String,
}

/// Typed persistence operations for every entity the engine owns.
///
/// Implementations are synchronous; every call is short and the engine
/// treats failures as `storage` errors (logged, surfaced, non-panicking).
pub trait Store: Send + Sync {
    fn auto_migrate(&self) -> Result<()>;

    fn save_task(&self, task: &Task) -> Result<()>;
    fn load_task(&self, uuid: &str) -> Result<Option<Task>>;
    fn find_tasks(&self, group_id: Option<&str>) -> Result<Vec<Task>>;

    fn save_message(&self, message: &MessageRecord) -> Result<()>;
    /// The most recent `limit` messages of a task, oldest first.
    fn recent_messages(&self, task_id: &str, limit: usize) -> Result<Vec<MessageRecord>>;
    /// Drop messages sent before `cutoff`; returns how many went away.
    fn prune_messages_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    fn save_agent(&self, agent: &AgentProfile) -> Result<()>;
    fn load_agent(&self, uuid: &str) -> Result<Option<AgentProfile>>;
    fn find_agents(&self) -> Result<Vec<AgentProfile>>;

    fn save_todo(&self, todo: &Todo) -> Result<()>;
    fn load_todo(&self, uuid: &str) -> Result<Option<Todo>>;

    fn save_memory(&self, entry: &MemoryEntry) -> Result<()>;
    /// The most recent `limit` memories, newest first.
    fn recent_memories(&self, limit: usize) -> Result<Vec<MemoryEntry>>;
}
