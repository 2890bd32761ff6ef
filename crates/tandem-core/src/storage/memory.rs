//! In-memory store for tests and throwaway runs

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{AgentProfile, MemoryEntry, MessageRecord, Store, Task, Todo};

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, Task>,
    messages: Vec<MessageRecord>,
    agents: HashMap<String, AgentProfile>,
    todos: HashMap<String, Todo>,
    memories: Vec<MemoryEntry>,
}

/// Mock backend honouring the `Store` semantics without touching disk.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted messages for a task (test visibility).
    pub fn message_count(&self, task_id: &str) -> usize {
        self.inner
            .lock()
            .messages
            .iter()
            .filter(|m| m.task_id == task_id)
            .count()
    }
}

impl Store for MemoryStore {
    fn auto_migrate(&self) -> Result<()> {
        Ok(())
    }

    fn save_task(&self, task: &Task) -> Result<()> {
        self.inner
            .lock()
            .tasks
            .insert(task.uuid.clone(), task.clone());
        Ok(())
    }

    fn load_task(&self, uuid: &str) -> Result<Option<Task>> {
        Ok(self.inner.lock().tasks.get(uuid).cloned())
    }

    fn find_tasks(&self, group_id: Option<&str>) -> Result<Vec<Task>> {
        let inner = self.inner.lock();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| group_id.map(|g| t.group_id == g).unwrap_or(true))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    fn save_message(&self, message: &MessageRecord) -> Result<()> {
        self.inner.lock().messages.push(message.clone());
        Ok(())
    }

    fn recent_messages(&self, task_id: &str, limit: usize) -> Result<Vec<MessageRecord>> {
        let inner = self.inner.lock();
        let mut matching: Vec<MessageRecord> = inner
            .messages
            .iter()
            .filter(|m| m.task_id == task_id)
            .cloned()
            .collect();
        if matching.len() > limit {
            matching.drain(..matching.len() - limit);
        }
        Ok(matching)
    }

    fn prune_messages_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.lock();
        let before = inner.messages.len();
        inner.messages.retain(|m| m.sent_at >= cutoff);
        Ok(before - inner.messages.len())
    }

    fn save_agent(&self, agent: &AgentProfile) -> Result<()> {
        self.inner
            .lock()
            .agents
            .insert(agent.uuid.clone(), agent.clone());
        Ok(())
    }

    fn load_agent(&self, uuid: &str) -> Result<Option<AgentProfile>> {
        Ok(self.inner.lock().agents.get(uuid).cloned())
    }

    fn find_agents(&self) -> Result<Vec<AgentProfile>> {
        let inner = self.inner.lock();
        let mut agents: Vec<AgentProfile> = inner.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        Ok(agents)
    }

    fn save_todo(&self, todo: &Todo) -> Result<()> {
        self.inner
            .lock()
            .todos
            .insert(todo.uuid.clone(), todo.clone());
        Ok(())
    }

    fn load_todo(&self, uuid: &str) -> Result<Option<Todo>> {
        Ok(self.inner.lock().todos.get(uuid).cloned())
    }

    fn save_memory(&self, entry: &MemoryEntry) -> Result<()> {
        self.inner.lock().memories.push(entry.clone());
        Ok(())
    }

    fn recent_memories(&self, limit: usize) -> Result<Vec<MemoryEntry>> {
        let inner = self.inner.lock();
        Ok(inner.memories.iter().rev().take(limit).cloned().collect())
    }
}
