//! Context - task identity, prompt assembly, and the persisted transcript
//! view for one (task, agent) pair
//!
//! The context owns the task row in memory, mirrors every mutation to the
//! store, and is the single place side-effect actions (memorize, annotate,
//! wait-todo) land.

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use crate::bus::{topics, BusPayload, EventBus};
use crate::config::RuntimeConfig;
use crate::llm::{ChatMessage, ChatRole};
use crate::reply::TOOL_RESULT_TAG;
use crate::storage::{AgentProfile, MemoryEntry, MessageRecord, OpType, Store, Task, TaskState, Todo};

pub mod prompts;

const MEMORY_DIGEST_SIZE: usize = 16;

pub struct Context {
    task: Mutex<Task>,
    agent: AgentProfile,
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    cfg: Arc<RuntimeConfig>,
    /// Pre-rendered `${{SUBAGENTS}}` expansion (agent uuids and roles).
    subagents_digest: String,
    /// Pre-rendered `${{MCP_TOOLS}}` expansion.
    mcp_digest: String,
}

impl Context {
    pub fn new(
        task: Task,
        agent: AgentProfile,
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        cfg: Arc<RuntimeConfig>,
        subagents_digest: String,
        mcp_digest: String,
    ) -> Self {
        Self {
            task: Mutex::new(task),
            agent,
            store,
            bus,
            cfg,
            subagents_digest,
            mcp_digest,
        }
    }

    pub fn task(&self) -> Task {
        self.task.lock().clone()
    }

    pub fn agent(&self) -> &AgentProfile {
        &self.agent
    }

    pub fn task_uuid(&self) -> String {
        self.task.lock().uuid.clone()
    }

    pub fn workdir(&self) -> String {
        self.task.lock().workdir.clone()
    }

    /// Expand the agent's prompt template. Placeholders are substituted
    /// once per assembly; the template itself is never mutated.
    pub fn prompt(&self) -> String {
        let task = self.task.lock();
        let shell = if cfg!(windows) { "cmd" } else { "sh" };

        self.agent
            .prompt_template
            .replace("${{WORK_PATH}}", &task.workdir)
            .replace("${{SUBAGENTS}}", &self.subagents_digest)
            .replace("${{MCP_TOOLS}}", &self.mcp_digest)
            .replace("${{OS_NAME}}", std::env::consts::OS)
            .replace("${{SHELL_NAME}}", shell)
            .replace("${{TOOL_RESULT_TAG}}", TOOL_RESULT_TAG)
    }

    /// Ordered message list for the next LLM call: system prompt, memory
    /// digest, then up to `CTX_MSG_SIZE` recent stored messages.
    pub fn assemble_messages(&self) -> Result<Vec<ChatMessage>> {
        let mut messages = vec![ChatMessage::system(self.prompt())];

        if let Some(digest) = self.memory_digest()? {
            messages.push(ChatMessage::system(digest));
        }

        let task_uuid = self.task_uuid();
        for record in self
            .store
            .recent_messages(&task_uuid, self.cfg.ctx_msg_size)?
        {
            if !record.respond.is_empty() {
                messages.push(ChatMessage::assistant(record.respond.clone()));
                continue;
            }
            if record.request.is_empty() {
                continue;
            }
            let role = match record.op_type {
                OpType::UserInput | OpType::ToolResult | OpType::Subtask => ChatRole::User,
                OpType::BotReply => ChatRole::Assistant,
                _ => ChatRole::System,
            };
            messages.push(ChatMessage {
                role,
                content: record.request.clone(),
            });
        }

        Ok(messages)
    }

    fn memory_digest(&self) -> Result<Option<String>> {
        let memories = self.store.recent_memories(MEMORY_DIGEST_SIZE)?;
        if memories.is_empty() {
            return Ok(None);
        }

        let mut digest = String::from("Memory digest:\n");
        for entry in memories.iter().rev() {
            digest.push_str(&format!(
                "- [{}] {}: {}\n",
                entry.datetime, entry.subject, entry.content
            ));
        }
        Ok(Some(digest.trim_end().to_string()))
    }

    /// Persist a message row under the current task.
    pub fn write_message(&self, message: MessageRecord) -> Result<()> {
        self.store.save_message(&message)
    }

    /// Persist the task state and announce it on `control`.
    pub fn set_state(&self, state: TaskState) -> Result<()> {
        let task = {
            let mut task = self.task.lock();
            task.state = state;
            task.clone()
        };
        self.store.save_task(&task)?;
        self.bus.emit(
            topics::CONTROL,
            &task.uuid,
            BusPayload::Control {
                task_uuid: task.uuid.clone(),
                state,
            },
        );
        Ok(())
    }

    /// `memorize` side effect: persist one memory entry.
    pub fn memorize(&self, subject: &str, content: &str, datetime: &str) -> Result<()> {
        let entry = MemoryEntry {
            uuid: uuid::Uuid::new_v4().to_string(),
            task_id: self.task_uuid(),
            subject: subject.to_string(),
            content: content.to_string(),
            datetime: datetime.to_string(),
        };
        tracing::debug!(task = %entry.task_id, subject = %entry.subject, "memorize");
        self.store.save_memory(&entry)
    }

    /// `annotate` side effect: update the task's rolling context annotation.
    pub fn annotate(&self, subject: &str, context: &str) -> Result<()> {
        let task = {
            let mut task = self.task.lock();
            task.annotation = Some(if subject.is_empty() {
                context.to_string()
            } else {
                format!("{subject}: {context}")
            });
            task.clone()
        };
        self.store.save_task(&task)
    }

    /// `wait-todo` side effect: persist (or update) the todo and hand it to
    /// the cron collaborator via the bus. Scheduling is not the core's job.
    pub fn wait_todo(&self, uuid: Option<&str>, time: &str, todo: &str) -> Result<()> {
        let task_uuid = self.task_uuid();
        let record = Todo {
            uuid: uuid
                .map(ToString::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            task_id: task_uuid.clone(),
            cron_expr: time.to_string(),
            body: todo.to_string(),
            done: false,
        };
        self.store.save_todo(&record)?;

        self.bus.emit(
            topics::WAIT_TODO,
            &task_uuid,
            BusPayload::WaitTodo {
                task_uuid: task_uuid.clone(),
                todo_uuid: record.uuid,
                cron_expr: record.cron_expr,
                body: record.body,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AgentRole, MemoryStore};

    fn context_with(template: &str) -> (Context, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let task = Task::new("demo", "/work/demo");
        store.save_task(&task).expect("save task");
        let agent = AgentProfile {
            uuid: "a1".into(),
            role: AgentRole::Basic,
            prompt_template: template.to_string(),
            tool_permissions: vec![],
            provider_key: None,
            home_dir: None,
        };
        let ctx = Context::new(
            task,
            agent,
            store.clone(),
            Arc::new(EventBus::new()),
            Arc::new(RuntimeConfig::default()),
            "worker-1 (worker)".to_string(),
            "search:lookup".to_string(),
        );
        (ctx, store)
    }

    #[tokio::test]
    async fn prompt_expands_every_placeholder() {
        let (ctx, _) = context_with(
            "path=${{WORK_PATH}} agents=${{SUBAGENTS}} mcp=${{MCP_TOOLS}} \
             os=${{OS_NAME}} shell=${{SHELL_NAME}} tag=${{TOOL_RESULT_TAG}}",
        );
        let prompt = ctx.prompt();
        assert!(prompt.contains("path=/work/demo"));
        assert!(prompt.contains("agents=worker-1 (worker)"));
        assert!(prompt.contains("mcp=search:lookup"));
        assert!(prompt.contains("tag=tool-result"));
        assert!(!prompt.contains("${{"));
    }

    #[tokio::test]
    async fn assemble_maps_roles_per_op_type() {
        let (ctx, store) = context_with("system prompt");
        let task_uuid = ctx.task_uuid();

        store
            .save_message(&MessageRecord::request(&task_uuid, OpType::UserInput, "hi"))
            .expect("save");
        store
            .save_message(&MessageRecord::reply(&task_uuid, "m0", "hello"))
            .expect("save");
        store
            .save_message(&MessageRecord::request(
                &task_uuid,
                OpType::ToolResult,
                "result",
            ))
            .expect("save");
        store
            .save_message(&MessageRecord::request(&task_uuid, OpType::Crontab, "tick"))
            .expect("save");

        let messages = ctx.assemble_messages().expect("assemble");
        let roles: Vec<ChatRole> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                ChatRole::System,    // prompt
                ChatRole::User,      // user-input
                ChatRole::Assistant, // bot-reply
                ChatRole::User,      // tool-result
                ChatRole::System,    // crontab
            ]
        );
    }

    #[tokio::test]
    async fn memory_digest_appears_between_prompt_and_history() {
        let (ctx, store) = context_with("system prompt");
        store
            .save_memory(&MemoryEntry {
                uuid: "m1".into(),
                task_id: ctx.task_uuid(),
                subject: "preference".into(),
                content: "likes short answers".into(),
                datetime: "2024-05-01T00:00:00Z".into(),
            })
            .expect("save memory");

        let messages = ctx.assemble_messages().expect("assemble");
        assert_eq!(messages.len(), 2);
        assert!(messages[1].content.contains("Memory digest"));
        assert!(messages[1].content.contains("likes short answers"));
    }

    #[tokio::test]
    async fn annotate_persists_on_the_task_row() {
        let (ctx, store) = context_with("p");
        ctx.annotate("plan", "phase two").expect("annotate");

        let task = store
            .load_task(&ctx.task_uuid())
            .expect("load")
            .expect("present");
        assert_eq!(task.annotation.as_deref(), Some("plan: phase two"));
    }
}
