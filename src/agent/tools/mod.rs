use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{Instrument, Span};

use crate::error::ToolError;
use crate::knowledge::KnowledgeBase;
use crate::models::{ChatModel, ToolSpec};
use crate::settings::ServiceSettings;

pub mod divination;
pub mod knowledge;
pub mod search;
pub mod yuanfenju;

/// Returned for any non-success HTTP status from the paid fortune APIs.
pub const TECHNICAL_ERROR: &str = "技术错误，请告诉用户稍后再试。";
pub const UNKNOWN_TOOL: &str = "没有这个工具，请换一个工具或直接回答用户。";

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn parameters(&self) -> Value;
    /// Text the model sees when the tool fails for any reason it cannot explain itself.
    fn unavailable_message(&self) -> &'static str;
    async fn run(&self, args: &Value) -> Result<String, ToolError>;
}

/// JSON schema for tools taking a single free-text `query`.
pub fn query_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": { "query": { "type": "string", "description": description } },
        "required": ["query"]
    })
}

/// Pulls the `query` argument; a bare JSON string is accepted as the query itself.
pub fn query_arg(args: &Value) -> Option<String> {
    let raw = match args {
        Value::String(s) => Some(s.as_str()),
        other => other.get("query").and_then(Value::as_str),
    };
    raw.map(str::trim).filter(|q| !q.is_empty()).map(str::to_string)
}

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
    span: Span,
}

impl ToolRegistry {
    pub fn new(span: Span) -> Self {
        Self { tools: Vec::new(), span }
    }

    pub fn with_default_tools(
        services: &ServiceSettings,
        model: Arc<dyn ChatModel>,
        knowledge: Arc<KnowledgeBase>,
        span: Span,
    ) -> Self {
        let client = Arc::new(yuanfenju::YuanfenjuClient::new(services));
        let mut r = Self::new(span);
        r.register(Box::new(search::SearchTool::new(services)));
        r.register(Box::new(knowledge::KnowledgeLookupTool::new(knowledge)));
        r.register(Box::new(divination::BaziTool::new(model.clone(), client.clone())));
        r.register(Box::new(divination::DrawTool::new(client.clone())));
        r.register(Box::new(divination::DreamTool::new(model, client)));
        r
    }

    pub fn register(&mut self, t: Box<dyn Tool>) {
        self.tools.push(t);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().map(|b| b.as_ref()).find(|t| t.name() == name)
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|t| ToolSpec { name: t.name().to_string(), description: t.description().to_string(), parameters: t.parameters() })
            .collect()
    }

    /// Runs a tool and always produces text for the model.
    pub async fn invoke(&self, name: &str, args: &Value) -> String {
        let Some(tool) = self.get(name) else {
            let _enter = self.span.enter();
            tracing::warn!(tool = name, "model requested unknown tool");
            metrics::counter!("oracle_tool_calls_total", "tool" => "unknown", "outcome" => "unknown").increment(1);
            return UNKNOWN_TOOL.to_string();
        };
        let (outcome, text) = match tool.run(args).instrument(self.span.clone()).await {
            Ok(text) => ("ok", text),
            Err(ToolError::NeedsInput(msg)) => ("needs_input", msg),
            Err(ToolError::Payload(msg)) => {
                self.span.in_scope(|| tracing::error!(tool = name, "unusable payload"));
                ("error", msg)
            }
            Err(ToolError::Status(status)) => {
                self.span.in_scope(|| tracing::error!(tool = name, %status, "upstream status"));
                ("error", TECHNICAL_ERROR.to_string())
            }
            Err(ToolError::Other(e)) => {
                self.span.in_scope(|| tracing::error!(tool = name, error = %e, "tool failed"));
                ("error", tool.unavailable_message().to_string())
            }
        };
        metrics::counter!("oracle_tool_calls_total", "tool" => tool.name(), "outcome" => outcome).increment(1);
        self.span.in_scope(|| tracing::debug!(tool = name, outcome, result = %crate::text::preview(&text, 200), "tool finished"));
        text
    }
}
