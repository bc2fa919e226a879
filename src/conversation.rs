use std::sync::Arc;

use serde::Serialize;
use tracing::{Instrument, Span};

use crate::agent::AgentEngine;
use crate::history::HistoryManager;
use crate::mood::{Mood, MoodClassifier};
use crate::prompts::PromptAssembler;
use crate::session::Session;

pub const APOLOGY: &str = "老夫此时无法为你算卦，请稍后再试。";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnReply {
    pub text: String,
    pub mood: Mood,
    pub voice_style: &'static str,
}

impl TurnReply {
    pub fn new(text: impl Into<String>, mood: Mood) -> Self {
        Self { text: text.into(), mood, voice_style: mood.voice_style() }
    }
}

/// Collaborators shared by every conversation.
pub struct TurnServices {
    pub classifier: MoodClassifier,
    pub engine: AgentEngine,
    pub history: HistoryManager,
}

/// One user's conversation: classify mood, rebuild the prompt from stored
/// history, run the agent and persist the turn.
pub struct ConversationSession {
    session: Session,
    services: Arc<TurnServices>,
    assembler: PromptAssembler,
    span: Span,
}

impl ConversationSession {
    pub fn new(session_id: impl Into<String>, services: Arc<TurnServices>, span: Span) -> Self {
        Self { session: Session::new(session_id), services, assembler: PromptAssembler, span }
    }

    pub fn mood(&self) -> Mood {
        self.session.mood
    }

    /// Never fails: agent errors produce the apology text and the turn is not stored.
    pub async fn run_turn(&mut self, input: &str) -> TurnReply {
        let span = self.span.clone();
        async {
            let mood = self.services.classifier.classify(input).await;
            let previous = self.session.mood;
            if self.session.set_mood(mood) {
                metrics::counter!("oracle_mood_transitions_total", "to" => mood.as_str()).increment(1);
                tracing::info!(session_id = %self.session.id, from = %previous, to = %mood, "mood changed");
            }

            let history = self.services.history.load_for_turn(&self.session.id, mood).await;
            let messages = self.assembler.assemble(mood, &history, input);
            match self.services.engine.run(messages).await {
                Ok(text) => {
                    self.services.history.record_turn(&self.session.id, input, &text).await;
                    metrics::counter!("oracle_turns_total", "outcome" => "ok").increment(1);
                    tracing::info!(session_id = %self.session.id, %mood, reply = %crate::text::preview(&text, 80), "turn complete");
                    TurnReply::new(text, mood)
                }
                Err(e) => {
                    metrics::counter!("oracle_turns_total", "outcome" => "error").increment(1);
                    tracing::error!(session_id = %self.session.id, error = %e, "agent failed");
                    TurnReply::new(APOLOGY, mood)
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ToolRegistry;
    use crate::models::ChatModel;
    use crate::session::{Message, Role};
    use crate::storage::{HistoryStore, SqliteHistoryStore};
    use crate::testing::ScriptedModel;

    /// Classifier and agent share one scripted model; replies alternate mood, answer.
    async fn services(model: Arc<ScriptedModel>, dir: &tempfile::TempDir) -> (Arc<TurnServices>, Arc<SqliteHistoryStore>) {
        services_with_rounds(model, dir, 5).await
    }

    async fn services_with_rounds(
        model: Arc<ScriptedModel>,
        dir: &tempfile::TempDir,
        max_rounds: usize,
    ) -> (Arc<TurnServices>, Arc<SqliteHistoryStore>) {
        let url = format!("sqlite://{}", dir.path().join("c.db").to_string_lossy());
        let store = Arc::new(SqliteHistoryStore::initialize(Some(url)).await.unwrap());
        let chat: Arc<dyn ChatModel> = model;
        let services = TurnServices {
            classifier: MoodClassifier::new(chat.clone(), Span::none()),
            engine: AgentEngine::new(chat.clone(), Arc::new(ToolRegistry::new(Span::none())), max_rounds, Span::none()),
            history: HistoryManager::new(store.clone(), chat, 10, Span::none()),
        };
        (Arc::new(services), store)
    }

    #[tokio::test]
    async fn turn_classifies_answers_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new().text("friendly").text("<think>x</think>亲，老夫在此").into_arc();
        let (services, store) = services(model.clone(), &dir).await;
        let mut convo = ConversationSession::new("s1", services, Span::none());

        let reply = convo.run_turn("大师你好").await;
        assert_eq!(reply, TurnReply { text: "亲，老夫在此".into(), mood: Mood::Friendly, voice_style: "friendly" });
        assert_eq!(convo.mood(), Mood::Friendly);

        let stored = store.load("s1").await.unwrap();
        assert_eq!(stored.iter().map(|m| m.role).collect::<Vec<_>>(), [Role::User, Role::Assistant]);
        assert_eq!(stored[1].content, "亲，老夫在此");

        // the agent saw the friendly role-set in its system prompt
        let requests = model.requests.lock().unwrap();
        assert!(requests[1].messages[0].content.contains(Mood::Friendly.role_set()));
    }

    #[tokio::test]
    async fn upbeat_voice_regardless_of_prior_mood() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new().text("angry").text("放肆").text("upbeat").text("太棒了").into_arc();
        let (services, _store) = services(model, &dir).await;
        let mut convo = ConversationSession::new("s", services, Span::none());
        assert_eq!(convo.run_turn("滚").await.voice_style, "angry");
        let reply = convo.run_turn("我中奖了！").await;
        assert_eq!(reply.mood, Mood::Upbeat);
        assert_eq!(reply.voice_style, "advertisement_upbeat");
    }

    #[tokio::test]
    async fn unrecognised_mood_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new().text("melancholic").text("嗯").into_arc();
        let (services, _store) = services(model, &dir).await;
        let reply = ConversationSession::new("s", services, Span::none()).run_turn("...").await;
        assert_eq!(reply.mood, Mood::Default);
        assert_eq!(reply.voice_style, "chat");
    }

    #[tokio::test]
    async fn agent_failure_apologizes_without_recording() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new().text("default").failure("model offline").into_arc();
        let (services, store) = services(model, &dir).await;
        let reply = ConversationSession::new("s", services, Span::none()).run_turn("算一卦").await;
        assert_eq!(reply.text, APOLOGY);
        assert!(store.load("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tool_round_limit_without_text_apologizes() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new()
            .text("default")
            .tool_call("search", serde_json::json!({"query": "运势"}))
            .tool_call("search", serde_json::json!({"query": "运势"}))
            .into_arc();
        let (services, store) = services_with_rounds(model.clone(), &dir, 1).await;
        let reply = ConversationSession::new("s", services, Span::none()).run_turn("算一卦").await;
        assert_eq!(reply.text, APOLOGY);
        assert_eq!(model.calls(), 3);
        assert!(store.load("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_is_replayed_into_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new().text("default").text("记得").into_arc();
        let (services, store) = services(model.clone(), &dir).await;
        store
            .append("s", &[Message::new(Role::User, "我叫张三"), Message::new(Role::Assistant, "张三你好")])
            .await
            .unwrap();
        ConversationSession::new("s", services, Span::none()).run_turn("我叫什么").await;
        let requests = model.requests.lock().unwrap();
        let contents: Vec<_> = requests[1].messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(&contents[1..], ["我叫张三", "张三你好", "我叫什么"]);
    }
}
