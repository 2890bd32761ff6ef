//! SQLite-backed store

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use super::{AgentProfile, MemoryEntry, MessageRecord, Store, Task, TaskState, Todo};

/// Embedded store. One connection guarded by a mutex; every operation is a
/// single short statement.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    fn map_task_row(row: &rusqlite::Row) -> rusqlite::Result<Task> {
        let state: String = row.get(3)?;
        let created_at: String = row.get(7)?;
        Ok(Task {
            uuid: row.get(0)?,
            name: row.get(1)?,
            workdir: row.get(2)?,
            state: state.parse().unwrap_or(TaskState::Waiting),
            group_id: row.get(4)?,
            leader_agent: row.get(5)?,
            annotation: row.get(6)?,
            created_at: parse_ts(&created_at),
        })
    }

    fn map_message_row(row: &rusqlite::Row) -> rusqlite::Result<MessageRecord> {
        let op_type: String = row.get(3)?;
        let sent_at: String = row.get(6)?;
        let received_at: Option<String> = row.get(7)?;
        Ok(MessageRecord {
            uuid: row.get(0)?,
            task_id: row.get(1)?,
            prev_uuid: row.get(2)?,
            op_type: op_type.parse().unwrap_or(super::OpType::UserInput),
            request: row.get(4)?,
            respond: row.get(5)?,
            sent_at: parse_ts(&sent_at),
            received_at: received_at.as_deref().map(parse_ts_str),
        })
    }

    fn map_agent_row(row: &rusqlite::Row) -> rusqlite::Result<AgentProfile> {
        let role: String = row.get(1)?;
        let permissions: String = row.get(3)?;
        Ok(AgentProfile {
            uuid: row.get(0)?,
            role: role.parse().unwrap_or(super::AgentRole::Basic),
            prompt_template: row.get(2)?,
            tool_permissions: serde_json::from_str(&permissions).unwrap_or_default(),
            provider_key: row.get(4)?,
            home_dir: row.get(5)?,
        })
    }
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_str(raw: &str) -> DateTime<Utc> {
    parse_ts(raw)
}

impl Store for SqliteStore {
    fn auto_migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                uuid TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                workdir TEXT NOT NULL,
                state TEXT NOT NULL,
                group_id TEXT NOT NULL,
                leader_agent TEXT,
                annotation TEXT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                uuid TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                prev_uuid TEXT,
                op_type TEXT NOT NULL,
                request TEXT NOT NULL DEFAULT '',
                respond TEXT NOT NULL DEFAULT '',
                sent_at TEXT NOT NULL,
                received_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messages_task ON messages(task_id, sent_at);
            CREATE TABLE IF NOT EXISTS agents (
                uuid TEXT PRIMARY KEY,
                role TEXT NOT NULL,
                prompt_template TEXT NOT NULL,
                tool_permissions TEXT NOT NULL DEFAULT '[]',
                provider_key TEXT,
                home_dir TEXT
            );
            CREATE TABLE IF NOT EXISTS todos (
                uuid TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                cron_expr TEXT NOT NULL,
                body TEXT NOT NULL,
                done INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS memories (
                uuid TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                content TEXT NOT NULL,
                datetime TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn save_task(&self, task: &Task) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tasks (uuid, name, workdir, state, group_id, leader_agent, annotation, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(uuid) DO UPDATE SET
                name = excluded.name,
                workdir = excluded.workdir,
                state = excluded.state,
                group_id = excluded.group_id,
                leader_agent = excluded.leader_agent,
                annotation = excluded.annotation",
            params![
                task.uuid,
                task.name,
                task.workdir,
                task.state.to_string(),
                task.group_id,
                task.leader_agent,
                task.annotation,
                task.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn load_task(&self, uuid: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT uuid, name, workdir, state, group_id, leader_agent, annotation, created_at
             FROM tasks WHERE uuid = ?1",
        )?;
        let mut rows = stmt.query_map([uuid], Self::map_task_row)?;
        Ok(rows.next().transpose()?)
    }

    fn find_tasks(&self, group_id: Option<&str>) -> Result<Vec<Task>> {
        let conn = self.conn.lock();
        match group_id {
            Some(gid) => {
                let mut stmt = conn.prepare(
                    "SELECT uuid, name, workdir, state, group_id, leader_agent, annotation, created_at
                     FROM tasks WHERE group_id = ?1 ORDER BY created_at",
                )?;
                let tasks = stmt
                    .query_map([gid], Self::map_task_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(tasks)
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT uuid, name, workdir, state, group_id, leader_agent, annotation, created_at
                     FROM tasks ORDER BY created_at",
                )?;
                let tasks = stmt
                    .query_map([], Self::map_task_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(tasks)
            }
        }
    }

    fn save_message(&self, message: &MessageRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages (uuid, task_id, prev_uuid, op_type, request, respond, sent_at, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.uuid,
                message.task_id,
                message.prev_uuid,
                message.op_type.as_str(),
                message.request,
                message.respond,
                message.sent_at.to_rfc3339(),
                message.received_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn recent_messages(&self, task_id: &str, limit: usize) -> Result<Vec<MessageRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT uuid, task_id, prev_uuid, op_type, request, respond, sent_at, received_at
             FROM messages WHERE task_id = ?1
             ORDER BY sent_at DESC, rowid DESC LIMIT ?2",
        )?;
        let mut messages = stmt
            .query_map(params![task_id, limit as i64], Self::map_message_row)?
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    fn prune_messages_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM messages WHERE sent_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(n)
    }

    fn save_agent(&self, agent: &AgentProfile) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agents (uuid, role, prompt_template, tool_permissions, provider_key, home_dir)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(uuid) DO UPDATE SET
                role = excluded.role,
                prompt_template = excluded.prompt_template,
                tool_permissions = excluded.tool_permissions,
                provider_key = excluded.provider_key,
                home_dir = excluded.home_dir",
            params![
                agent.uuid,
                agent.role.to_string(),
                agent.prompt_template,
                serde_json::to_string(&agent.tool_permissions)?,
                agent.provider_key,
                agent.home_dir,
            ],
        )?;
        Ok(())
    }

    fn load_agent(&self, uuid: &str) -> Result<Option<AgentProfile>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT uuid, role, prompt_template, tool_permissions, provider_key, home_dir
             FROM agents WHERE uuid = ?1",
        )?;
        let mut rows = stmt.query_map([uuid], Self::map_agent_row)?;
        Ok(rows.next().transpose()?)
    }

    fn find_agents(&self) -> Result<Vec<AgentProfile>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT uuid, role, prompt_template, tool_permissions, provider_key, home_dir
             FROM agents ORDER BY uuid",
        )?;
        let agents = stmt
            .query_map([], Self::map_agent_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    fn save_todo(&self, todo: &Todo) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO todos (uuid, task_id, cron_expr, body, done)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(uuid) DO UPDATE SET
                cron_expr = excluded.cron_expr,
                body = excluded.body,
                done = excluded.done",
            params![
                todo.uuid,
                todo.task_id,
                todo.cron_expr,
                todo.body,
                todo.done as i64,
            ],
        )?;
        Ok(())
    }

    fn load_todo(&self, uuid: &str) -> Result<Option<Todo>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT uuid, task_id, cron_expr, body, done FROM todos WHERE uuid = ?1")?;
        let mut rows = stmt.query_map([uuid], |row| {
            let done: i64 = row.get(4)?;
            Ok(Todo {
                uuid: row.get(0)?,
                task_id: row.get(1)?,
                cron_expr: row.get(2)?,
                body: row.get(3)?,
                done: done != 0,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    fn save_memory(&self, entry: &MemoryEntry) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO memories (uuid, task_id, subject, content, datetime)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.uuid,
                entry.task_id,
                entry.subject,
                entry.content,
                entry.datetime,
            ],
        )?;
        Ok(())
    }

    fn recent_memories(&self, limit: usize) -> Result<Vec<MemoryEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT uuid, task_id, subject, content, datetime
             FROM memories ORDER BY rowid DESC LIMIT ?1",
        )?;
        let memories = stmt
            .query_map([limit as i64], |row| {
                Ok(MemoryEntry {
                    uuid: row.get(0)?,
                    task_id: row.get(1)?,
                    subject: row.get(2)?,
                    content: row.get(3)?,
                    datetime: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(memories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::OpType;

    fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().expect("open in-memory db");
        store.auto_migrate().expect("migrate");
        store
    }

    #[test]
    fn task_round_trip_and_state_update() {
        let store = store();
        let mut task = Task::new("demo", "/tmp/demo");
        store.save_task(&task).expect("save");

        task.state = TaskState::Running;
        task.annotation = Some("working on it".into());
        store.save_task(&task).expect("update");

        let loaded = store.load_task(&task.uuid).expect("load").expect("present");
        assert_eq!(loaded.state, TaskState::Running);
        assert_eq!(loaded.annotation.as_deref(), Some("working on it"));
        assert_eq!(loaded.group_id, task.uuid);
    }

    #[test]
    fn recent_messages_returns_last_n_oldest_first() {
        let store = store();
        let task = Task::new("demo", "/tmp/demo");
        store.save_task(&task).expect("save task");

        for i in 0..5 {
            let mut m = MessageRecord::request(&task.uuid, OpType::UserInput, &format!("m{i}"));
            m.sent_at = Utc::now() + chrono::Duration::milliseconds(i);
            store.save_message(&m).expect("save message");
        }

        let recent = store.recent_messages(&task.uuid, 3).expect("query");
        let contents: Vec<_> = recent.iter().map(|m| m.request.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn agent_permissions_survive_round_trip() {
        let store = store();
        let agent = AgentProfile {
            uuid: "a1".into(),
            role: crate::storage::AgentRole::Worker,
            prompt_template: "You are ${{OS_NAME}}".into(),
            tool_permissions: vec!["files:*".into(), "search:query".into()],
            provider_key: Some("openai".into()),
            home_dir: None,
        };
        store.save_agent(&agent).expect("save");

        let loaded = store.load_agent("a1").expect("load").expect("present");
        assert!(loaded.permits("files", "anything"));
        assert!(loaded.permits("search", "query"));
        assert!(!loaded.permits("search", "other"));
    }

    #[test]
    fn prune_drops_old_messages_only() {
        let store = store();
        let task = Task::new("demo", "/tmp/demo");

        let mut old = MessageRecord::request(&task.uuid, OpType::UserInput, "old");
        old.sent_at = Utc::now() - chrono::Duration::days(120);
        store.save_message(&old).expect("save old");
        let fresh = MessageRecord::request(&task.uuid, OpType::UserInput, "fresh");
        store.save_message(&fresh).expect("save fresh");

        let dropped = store
            .prune_messages_before(crate::storage::default_retention_cutoff())
            .expect("prune");
        assert_eq!(dropped, 1);

        let remaining = store.recent_messages(&task.uuid, 10).expect("query");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].request, "fresh");
    }
}
