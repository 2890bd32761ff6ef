//! LLM client - blocking `respond`, streaming `stream`, per-group `cancel`
//!
//! `group` is an arbitrary string linking a family of in-flight requests to
//! a cancellation scope; the executor passes its task uuid. Cancelling a
//! group aborts every matching in-flight call; a cancelled call surfaces as
//! a distinct error carrying the partial text received so far, so the
//! caller can persist it.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod openai;

pub use openai::OpenAiClient;

/// Message role on the provider wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// One message in a provider conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// One completion choice from a unary call.
#[derive(Debug, Clone)]
pub struct Choice {
    pub content: String,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm transport error: {0}")]
    Transport(String),

    /// The request's group was cancelled mid-flight. Carries whatever text
    /// had streamed in before the abort.
    #[error("llm request canceled")]
    Canceled { partial: String },

    #[error("no model available")]
    NoModel,
}

/// Streaming delta callback: `(increment_idx, chunk)`. Called synchronously
/// as chunks arrive; must not block on network I/O.
pub type OnDelta<'a> = &'a (dyn Fn(u64, &str) + Send + Sync);

/// The three-method client interface the executor depends on.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Blocking chat call returning the provider's choices.
    async fn respond(&self, group: &str, messages: &[ChatMessage])
        -> Result<Vec<Choice>, LlmError>;

    /// Streaming chat call. `on_delta` fires per chunk; the accumulated
    /// reply is returned once the stream ends.
    async fn stream(
        &self,
        group: &str,
        messages: &[ChatMessage],
        on_delta: OnDelta<'_>,
    ) -> Result<String, LlmError>;

    /// Cancel every in-flight request registered under `group`.
    fn cancel(&self, group: &str);
}

/// One registered in-flight request.
pub struct ScopedToken {
    pub token: CancellationToken,
    group: String,
    id: u64,
}

/// Per-group cancellation scopes shared by provider implementations.
#[derive(Default)]
pub struct CancelScopes {
    groups: Mutex<HashMap<String, Vec<(u64, CancellationToken)>>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl CancelScopes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new in-flight request under `group`.
    pub fn register(&self, group: &str) -> ScopedToken {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let token = CancellationToken::new();
        self.groups
            .lock()
            .entry(group.to_string())
            .or_default()
            .push((id, token.clone()));
        ScopedToken {
            token,
            group: group.to_string(),
            id,
        }
    }

    /// Drop a finished request's token.
    pub fn complete(&self, scoped: &ScopedToken) {
        let mut groups = self.groups.lock();
        if let Some(tokens) = groups.get_mut(&scoped.group) {
            tokens.retain(|(id, _)| *id != scoped.id);
            if tokens.is_empty() {
                groups.remove(&scoped.group);
            }
        }
    }

    /// Cancel and forget every token of `group`.
    pub fn cancel(&self, group: &str) {
        if let Some(tokens) = self.groups.lock().remove(group) {
            for (_, token) in tokens {
                token.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_fires_every_token_in_the_group() {
        let scopes = CancelScopes::new();
        let a = scopes.register("g1");
        let b = scopes.register("g1");
        let other = scopes.register("g2");

        scopes.cancel("g1");

        assert!(a.token.is_cancelled());
        assert!(b.token.is_cancelled());
        assert!(!other.token.is_cancelled());
    }

    #[test]
    fn completed_requests_leave_the_scope() {
        let scopes = CancelScopes::new();
        let a = scopes.register("g1");
        scopes.complete(&a);
        scopes.cancel("g1");
        assert!(!a.token.is_cancelled());
    }

    #[test]
    fn cancel_of_unknown_group_is_a_no_op() {
        let scopes = CancelScopes::new();
        scopes.cancel("nothing");
    }
}
