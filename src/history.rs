use std::sync::Arc;

use tracing::{Instrument, Span};

use crate::models::{ChatMessage, ChatModel, CompletionRequest};
use crate::mood::Mood;
use crate::prompts;
use crate::session::{Message, Role};
use crate::storage::HistoryStore;
use crate::text::strip_reasoning;

/// Reads and writes session history, collapsing it into a single summary
/// message once it grows past `max_messages`.
pub struct HistoryManager {
    store: Arc<dyn HistoryStore>,
    model: Arc<dyn ChatModel>,
    max_messages: usize,
    span: Span,
}

impl HistoryManager {
    pub fn new(store: Arc<dyn HistoryStore>, model: Arc<dyn ChatModel>, max_messages: usize, span: Span) -> Self {
        Self { store, model, max_messages, span }
    }

    /// History for the next turn. Over-threshold history is summarized first;
    /// read failures degrade to an empty history.
    pub async fn load_for_turn(&self, session_id: &str, mood: Mood) -> Vec<Message> {
        async {
            let messages = match self.store.load(session_id).await {
                Ok(m) => m,
                Err(e) => {
                    tracing::error!(session_id, error = %e, "history read failed, continuing without history");
                    return Vec::new();
                }
            };
            tracing::debug!(session_id, count = messages.len(), "history loaded");
            if messages.len() <= self.max_messages {
                return messages;
            }
            match self.summarize(session_id, mood, &messages).await {
                Ok(summary) => vec![summary],
                Err(e) => {
                    metrics::counter!("oracle_summaries_total", "outcome" => "error").increment(1);
                    tracing::error!(session_id, error = %e, "history summarization failed, history left unchanged");
                    messages
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    async fn summarize(&self, session_id: &str, mood: Mood, messages: &[Message]) -> anyhow::Result<Message> {
        let req = CompletionRequest::new(vec![
            ChatMessage::system(prompts::summary_system_prompt(mood)),
            ChatMessage::user(prompts::transcript(messages)),
        ]);
        let out = self.model.complete(req).await?;
        let summary = strip_reasoning(&out.content);
        if summary.is_empty() {
            anyhow::bail!("model returned an empty summary");
        }
        let message = Message::new(Role::System, summary);
        self.store.replace(session_id, message.clone()).await?;
        metrics::counter!("oracle_summaries_total", "outcome" => "ok").increment(1);
        tracing::info!(session_id, previous = messages.len(), max = self.max_messages, summary = %message.content, "history summarized");
        Ok(message)
    }

    /// Appends one completed turn. Failures are logged; the reply still goes out.
    pub async fn record_turn(&self, session_id: &str, user: &str, assistant: &str) {
        let turn = [Message::new(Role::User, user), Message::new(Role::Assistant, assistant)];
        if let Err(e) = self.store.append(session_id, &turn).instrument(self.span.clone()).await {
            let _enter = self.span.enter();
            tracing::error!(session_id, error = %e, "failed to persist turn");
        }
    }

    /// Drops a session's stored history. Returns whether anything was removed.
    pub async fn reset(&self, session_id: &str) -> anyhow::Result<bool> {
        let removed = self.store.clear(session_id).await?;
        self.span.in_scope(|| tracing::info!(session_id, removed, "history reset"));
        Ok(removed)
    }
}
