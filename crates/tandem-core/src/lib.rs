//! Core library for Tandem
//!
//! ## Orchestration engine (the canonical turn loop)
//! - `Executor` - Turn loop: drain queue, call LLM, parse, dispatch, feed back
//! - `Manager` - Agent registry, executor cache, LLM client factory
//! - `SubAgentCoordinator` - Leader/worker fan-out over the event bus
//!
//! ## Core Components
//! - `EventBus` - Named-topic pub/sub glue between the runtime pieces
//! - `reply` - Forgiving XML reply parser producing `SuperAction`s
//! - `tools` - Filesystem, shell, and builtin tool dispatch
//! - `Context` - Prompt assembly and the persisted transcript view
//!
//! ## Collaborator edges
//! - `storage` - `Store` trait with SQLite and in-memory backends
//! - `llm` - `LlmClient` trait with an OpenAI-compatible provider
//! - `mcp` - Remote tool-server registry (wire protocol is external)

pub mod bus;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod llm;
pub mod manager;
pub mod mcp;
pub mod reply;
pub mod storage;
pub mod subagent;
pub mod tools;

pub use bus::{topics, BusEvent, BusPayload, EventBus};
pub use config::{RuntimeConfig, Settings};
pub use context::Context;
pub use error::{EngineError, ErrorEvent, ErrorKind};
pub use executor::{Executor, Input};
pub use llm::{ChatMessage, ChatRole, Choice, LlmClient, LlmError};
pub use manager::{Manager, ManagerHandle};
pub use reply::{Action, ActionKind, SuperAction};
pub use storage::{AgentProfile, AgentRole, MessageRecord, OpType, Store, Task, TaskState, Todo};
pub use subagent::SubAgentCoordinator;
