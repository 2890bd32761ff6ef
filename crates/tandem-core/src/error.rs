//! Engine error kinds
//!
//! Control-plane errors (LLM transport, cancellation, limits) are surfaced
//! on the `errors` bus topic and set executor state. Tool errors are data:
//! they live in the Action's result slot and never fail the loop.

use serde::Serialize;
use thiserror::Error;

/// Errors raised by the orchestration engine itself.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("llm transport error: {0}")]
    LlmTransport(String),

    #[error("empty reply from model")]
    EmptyReply,

    #[error("canceled")]
    Cancellation,

    #[error("turn limit exceeded after {0} turns")]
    TurnLimit(usize),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Parse(_) => ErrorKind::Parse,
            EngineError::LlmTransport(_) => ErrorKind::LlmTransport,
            EngineError::EmptyReply => ErrorKind::EmptyReply,
            EngineError::Cancellation => ErrorKind::Cancellation,
            EngineError::TurnLimit(_) => ErrorKind::TurnLimit,
            EngineError::Tool(_) => ErrorKind::Tool,
            EngineError::Storage(_) => ErrorKind::Storage,
            EngineError::Config(_) => ErrorKind::Config,
        }
    }
}

/// Discriminant for error events on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Parse,
    LlmTransport,
    EmptyReply,
    Cancellation,
    TurnLimit,
    Tool,
    Storage,
    Config,
}

/// Payload for the `errors` topic.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub task_uuid: String,
    pub agent_uuid: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorEvent {
    pub fn new(task_uuid: &str, agent_uuid: &str, err: &EngineError) -> Self {
        Self {
            task_uuid: task_uuid.to_string(),
            agent_uuid: agent_uuid.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
