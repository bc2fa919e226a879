use std::sync::Arc;

use tracing::{Instrument, Span};

use crate::agent::tools::ToolRegistry;
use crate::models::{ChatMessage, ChatModel, ChatRole, CompletionRequest};
use crate::text::strip_reasoning;

/// Tool-calling loop: ask the model, run whatever tools it requests, feed the
/// results back, and stop at the first reply without tool calls.
pub struct AgentEngine {
    model: Arc<dyn ChatModel>,
    tools: Arc<ToolRegistry>,
    max_rounds: usize,
    span: Span,
}

impl AgentEngine {
    pub fn new(model: Arc<dyn ChatModel>, tools: Arc<ToolRegistry>, max_rounds: usize, span: Span) -> Self {
        Self { model, tools, max_rounds, span }
    }

    /// Runs one turn over `messages` (system, history, user) and returns the
    /// final reply with reasoning removed.
    pub async fn run(&self, mut messages: Vec<ChatMessage>) -> anyhow::Result<String> {
        let specs = self.tools.specs();
        let mut rounds = 0;
        async {
            loop {
                let mut req = CompletionRequest::new(messages.clone());
                req.tools = specs.clone();
                let response = self.model.complete(req).await?;

                if response.tool_calls.is_empty() {
                    return final_reply(&response.content);
                }

                rounds += 1;
                if rounds > self.max_rounds {
                    tracing::warn!(max_rounds = self.max_rounds, "tool round limit reached, returning partial reply");
                    return final_reply(&response.content);
                }

                messages.push(ChatMessage {
                    role: ChatRole::Assistant,
                    content: response.content.clone(),
                    tool_calls: response.tool_calls.clone(),
                    tool_call_id: None,
                });
                for call in &response.tool_calls {
                    tracing::info!(tool = %call.name, round = rounds, "tool requested");
                    let result = self.tools.invoke(&call.name, &call.arguments).await;
                    messages.push(ChatMessage::tool_result(call.id.clone(), result));
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }
}

/// The reply shown to the user; one that is blank once reasoning is removed is an error.
fn final_reply(content: &str) -> anyhow::Result<String> {
    let text = strip_reasoning(content);
    if text.is_empty() {
        anyhow::bail!("model produced no visible reply");
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tools::UNKNOWN_TOOL;
    use crate::testing::ScriptedModel;
    use serde_json::json;

    fn engine(model: Arc<ScriptedModel>, max_rounds: usize) -> AgentEngine {
        AgentEngine::new(model, Arc::new(ToolRegistry::new(Span::none())), max_rounds, Span::none())
    }

    #[tokio::test]
    async fn plain_reply_is_cleaned() {
        let model = ScriptedModel::new().text("<think>plan</think>  老夫  掐指一算 ").into_arc();
        let out = engine(model.clone(), 5).run(vec![ChatMessage::user("hi")]).await.unwrap();
        assert_eq!(out, "老夫 掐指一算");
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn tool_results_are_fed_back() {
        let model = ScriptedModel::new()
            .tool_call("missing_tool", json!({"query": "x"}))
            .text("done")
            .into_arc();
        let out = engine(model.clone(), 5).run(vec![ChatMessage::user("hi")]).await.unwrap();
        assert_eq!(out, "done");

        let requests = model.requests.lock().unwrap();
        let second = &requests[1].messages;
        assert_eq!(second.len(), 3);
        assert_eq!(second[1].role, ChatRole::Assistant);
        assert_eq!(second[1].tool_calls[0].name, "missing_tool");
        assert_eq!(second[2].role, ChatRole::Tool);
        assert_eq!(second[2].tool_call_id.as_deref(), Some("call_missing_tool"));
        assert_eq!(second[2].content, UNKNOWN_TOOL);
    }

    #[tokio::test]
    async fn stops_after_max_rounds() {
        let model = ScriptedModel::new()
            .tool_call("a", json!({}))
            .tool_call("b", json!({}))
            .tool_call("c", json!({}))
            .into_arc();
        let err = engine(model.clone(), 2).run(vec![ChatMessage::user("hi")]).await.unwrap_err();
        assert!(err.to_string().contains("no visible reply"));
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test]
    async fn blank_reply_is_an_error() {
        let model = ScriptedModel::new().text("<think>嗯</think>  ").into_arc();
        assert!(engine(model, 5).run(vec![ChatMessage::user("hi")]).await.is_err());
    }

    #[tokio::test]
    async fn model_error_propagates() {
        let model = ScriptedModel::new().failure("timeout").into_arc();
        assert!(engine(model, 5).run(vec![ChatMessage::user("hi")]).await.is_err());
    }
}
