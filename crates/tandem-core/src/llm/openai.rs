//! OpenAI-compatible chat-completions provider
//!
//! Speaks the plain chat-completions surface (unary and SSE streaming)
//! against any base URL. Providers differ only in wire encoding; everything
//! group/cancellation-shaped lives in `CancelScopes` so alternative
//! providers can reuse it.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use super::{CancelScopes, ChatMessage, Choice, LlmClient, LlmError, OnDelta};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    scopes: CancelScopes,
}

impl OpenAiClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        proxy_url: Option<&str>,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT);

        if let Some(proxy) = proxy_url.filter(|p| !p.trim().is_empty()) {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            scopes: CancelScopes::new(),
        })
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }

    fn build_request(&self) -> reqwest::RequestBuilder {
        let mut request = self.http.post(self.chat_url());
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request
    }

    fn wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect()
    }
}

/// Pull content deltas out of one SSE `data:` payload.
fn delta_content(payload: &str) -> Option<String> {
    let value: Value = serde_json::from_str(payload).ok()?;
    let delta = value.get("choices")?.get(0)?.get("delta")?;
    delta
        .get("content")
        .and_then(|c| c.as_str())
        .map(ToString::to_string)
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn respond(
        &self,
        group: &str,
        messages: &[ChatMessage],
    ) -> Result<Vec<Choice>, LlmError> {
        let scoped = self.scopes.register(group);
        let body = json!({
            "model": self.model,
            "messages": Self::wire_messages(messages),
        });

        let send = self.build_request().json(&body).send();
        let response = tokio::select! {
            response = send => match response {
                Ok(r) => r,
                Err(e) => {
                    self.scopes.complete(&scoped);
                    return Err(LlmError::Transport(e.to_string()));
                }
            },
            _ = scoped.token.cancelled() => {
                return Err(LlmError::Canceled { partial: String::new() });
            }
        };

        let result = async {
            let status = response.status();
            if !status.is_success() {
                let detail = response.text().await.unwrap_or_default();
                return Err(LlmError::Transport(format!("HTTP {status}: {detail}")));
            }

            let value: Value = response
                .json()
                .await
                .map_err(|e| LlmError::Transport(e.to_string()))?;

            let choices = value
                .get("choices")
                .and_then(|c| c.as_array())
                .map(|arr| {
                    arr.iter()
                        .map(|choice| Choice {
                            content: choice
                                .get("message")
                                .and_then(|m| m.get("content"))
                                .and_then(|c| c.as_str())
                                .unwrap_or_default()
                                .to_string(),
                        })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            Ok(choices)
        }
        .await;

        self.scopes.complete(&scoped);
        result
    }

    async fn stream(
        &self,
        group: &str,
        messages: &[ChatMessage],
        on_delta: OnDelta<'_>,
    ) -> Result<String, LlmError> {
        let scoped = self.scopes.register(group);
        let body = json!({
            "model": self.model,
            "messages": Self::wire_messages(messages),
            "stream": true,
        });

        let send = self.build_request().json(&body).send();
        let response = tokio::select! {
            response = send => match response {
                Ok(r) => r,
                Err(e) => {
                    self.scopes.complete(&scoped);
                    return Err(LlmError::Transport(e.to_string()));
                }
            },
            _ = scoped.token.cancelled() => {
                return Err(LlmError::Canceled { partial: String::new() });
            }
        };

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            self.scopes.complete(&scoped);
            return Err(LlmError::Transport(format!("HTTP {status}: {detail}")));
        }

        let mut accumulated = String::new();
        let mut pending = String::new();
        let mut increment_idx: u64 = 0;
        let mut byte_stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                chunk = byte_stream.next() => chunk,
                _ = scoped.token.cancelled() => {
                    return Err(LlmError::Canceled { partial: accumulated });
                }
            };

            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    self.scopes.complete(&scoped);
                    return Err(LlmError::Transport(e.to_string()));
                }
                None => break,
            };

            pending.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = pending.find('\n') {
                let line = pending[..newline].trim().to_string();
                pending.drain(..=newline);

                let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
                    continue;
                };
                if payload == "[DONE]" {
                    continue;
                }
                if let Some(content) = delta_content(payload) {
                    if !content.is_empty() {
                        on_delta(increment_idx, &content);
                        increment_idx += 1;
                        accumulated.push_str(&content);
                    }
                }
            }
        }

        self.scopes.complete(&scoped);
        Ok(accumulated)
    }

    fn cancel(&self, group: &str) {
        self.scopes.cancel(group);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_url_handles_trailing_slash() {
        let client = OpenAiClient::new("http://localhost:1234/v1/", None, "m", None)
            .expect("client builds");
        assert_eq!(client.chat_url(), "http://localhost:1234/v1/chat/completions");
    }

    #[test]
    fn delta_content_reads_streaming_payload() {
        let payload = r#"{"choices":[{"delta":{"content":"hel"}}]}"#;
        assert_eq!(delta_content(payload).as_deref(), Some("hel"));

        let finish = r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        assert_eq!(delta_content(finish), None);
    }
}
