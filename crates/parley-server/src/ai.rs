//! Assistant relay.
//!
//! Scans chat for `@ai` (or a configured alias) mentions, keeps a rolling
//! per-conversation context, calls an external LLM provider behind the
//! [`ChatCompletion`] seam, and hands the formatted reply back through the
//! normal routing path. Provider failure degrades to a fallback message,
//! never to an error frame; with the relay disabled mention detection does
//! nothing at all.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Marker appended to every relayed reply.
const BOT_MARKER: &str = "\u{1f916}"; // 🤖

/// Idle conversations older than this are evicted.
pub const CONTEXT_IDLE_EVICTION: Duration = Duration::from_secs(24 * 60 * 60);

/// One turn of provider context.
#[derive(Debug, Clone, Serialize)]
pub struct AiChatMessage {
    /// `system`, `user` or `assistant`.
    pub role: String,
    /// Turn content.
    pub content: String,
}

impl AiChatMessage {
    /// Build a user turn.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Build an assistant turn.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// The single seam to the LLM provider.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    /// Produce a completion for the given conversation.
    async fn chat_completion(&self, messages: &[AiChatMessage]) -> Result<String, String>;
}

/// OpenAI-compatible HTTP provider.
pub struct OpenAiChatClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiChatClient {
    /// Create a client against `{endpoint}/chat/completions`.
    #[must_use]
    pub fn new(endpoint: String, api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl ChatCompletion for OpenAiChatClient {
    async fn chat_completion(&self, messages: &[AiChatMessage]) -> Result<String, String> {
        let url = format!(
            "{}/chat/completions",
            self.endpoint.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("provider request failed: {e}"))?;

        if !response.status().is_success() {
            return Err(format!("provider returned {}", response.status()));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("provider response unreadable: {e}"))?;

        json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| "provider response missing content".to_string())
    }
}

struct Conversation {
    messages: VecDeque<AiChatMessage>,
    last_used: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ContextKey {
    group_id: i64,
    user_id: i64,
}

/// Mention detection plus provider orchestration.
pub struct AiRelay {
    alias: String,
    provider: Box<dyn ChatCompletion>,
    contexts: DashMap<ContextKey, Conversation>,
    context_window: usize,
    deadline: Duration,
    max_retries: u32,
}

impl AiRelay {
    /// Create a relay with the default `ai` alias.
    #[must_use]
    pub fn new(
        provider: Box<dyn ChatCompletion>,
        context_window: usize,
        deadline: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            alias: "ai".to_string(),
            provider,
            contexts: DashMap::new(),
            context_window: context_window.max(2),
            deadline,
            max_retries,
        }
    }

    /// Case-insensitive mention scan. Returns the message with mention
    /// tokens stripped when the assistant was addressed.
    #[must_use]
    pub fn detect_mention(&self, content: &str) -> Option<String> {
        let needle = format!("@{}", self.alias);
        let mut mentioned = false;
        let mut kept: Vec<&str> = Vec::new();

        for token in content.split_whitespace() {
            if token.eq_ignore_ascii_case(&needle) {
                mentioned = true;
            } else {
                kept.push(token);
            }
        }

        if mentioned {
            Some(kept.join(" "))
        } else {
            None
        }
    }

    /// Ask the provider, bounded by the deadline and retry budget, and
    /// format the reply for the originating conversation. Failure yields
    /// a fallback message rather than an error.
    pub async fn respond(
        &self,
        group_id: i64,
        sender_id: i64,
        sender_name: &str,
        question: &str,
    ) -> String {
        let key = ContextKey {
            group_id,
            user_id: sender_id,
        };

        let question = if question.trim().is_empty() {
            "Hello!".to_string()
        } else {
            question.to_string()
        };

        let mut conversation = vec![AiChatMessage {
            role: "system".to_string(),
            content: "You are a helpful assistant in a chat room. Keep replies short."
                .to_string(),
        }];
        if let Some(ctx) = self.contexts.get(&key) {
            conversation.extend(ctx.messages.iter().cloned());
        }
        conversation.push(AiChatMessage::user(question.clone()));

        match self.call_provider(&conversation).await {
            Ok(reply) => {
                self.remember(key, &question, &reply);
                format!("@{sender_name} {reply} {BOT_MARKER}")
            }
            Err(e) => {
                tracing::warn!(group_id, sender_id, error = %e, "assistant call failed");
                format!(
                    "@{sender_name} the assistant is unavailable right now, please try again later {BOT_MARKER}"
                )
            }
        }
    }

    async fn call_provider(&self, conversation: &[AiChatMessage]) -> Result<String, String> {
        let mut last_error = String::new();

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = Duration::from_millis(500 * 2u64.saturating_pow(attempt - 1))
                    .min(Duration::from_secs(5));
                tokio::time::sleep(backoff).await;
            }

            match tokio::time::timeout(self.deadline, self.provider.chat_completion(conversation))
                .await
            {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = "provider deadline exceeded".to_string(),
            }
        }

        Err(last_error)
    }

    fn remember(&self, key: ContextKey, question: &str, reply: &str) {
        let mut entry = self.contexts.entry(key).or_insert_with(|| Conversation {
            messages: VecDeque::new(),
            last_used: Instant::now(),
        });
        entry.messages.push_back(AiChatMessage::user(question));
        entry.messages.push_back(AiChatMessage::assistant(reply));
        while entry.messages.len() > self.context_window {
            entry.messages.pop_front();
        }
        entry.last_used = Instant::now();
    }

    /// Drop conversations idle longer than `max_idle`. Returns how many
    /// were evicted.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.contexts.len();
        self.contexts
            .retain(|_, conv| conv.last_used.elapsed() <= max_idle);
        before - self.contexts.len()
    }
}
