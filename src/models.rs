use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::settings::ModelSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), tool_calls: Vec::new(), tool_call_id: None }
    }

    pub fn system(content: impl Into<String>) -> Self { Self::new(ChatRole::System, content) }
    pub fn user(content: impl Into<String>) -> Self { Self::new(ChatRole::User, content) }
    pub fn assistant(content: impl Into<String>) -> Self { Self::new(ChatRole::Assistant, content) }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { tool_call_id: Some(call_id.into()), ..Self::new(ChatRole::Tool, content) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    /// Ask the backend to constrain output to a JSON object.
    pub json_mode: bool,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self { messages, ..Default::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<Completion>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// Client for any backend speaking the OpenAI chat/embeddings protocol
/// (Ollama's `/v1`, vLLM, hosted providers).
#[derive(Clone)]
pub struct OpenAICompatible {
    base_url: String,
    api_key: Option<String>,
    chat_model: String,
    embedding_model: String,
    temperature: f32,
    http: reqwest::Client,
}

impl OpenAICompatible {
    pub fn new(settings: &ModelSettings) -> Self {
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            chat_model: settings.chat_model.clone(),
            embedding_model: settings.embedding_model.clone(),
            temperature: settings.temperature,
            http: reqwest::Client::new(),
        }
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let rb = self.http.post(format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => rb.bearer_auth(key),
            None => rb,
        }
    }
}

#[derive(Debug, Serialize)]
struct OaiChatRequest<'a> {
    model: &'a str,
    messages: Vec<Value>,
    temperature: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OaiChatResponse {
    choices: Vec<OaiChoice>,
}

#[derive(Debug, Deserialize)]
struct OaiChoice {
    message: OaiMessage,
}

#[derive(Debug, Deserialize)]
struct OaiMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OaiToolCall>,
}

#[derive(Debug, Deserialize)]
struct OaiToolCall {
    #[serde(default)]
    id: String,
    function: OaiFunction,
}

#[derive(Debug, Deserialize)]
struct OaiFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Serialize)]
struct OaiEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct OaiEmbeddingResponse {
    data: Vec<OaiEmbedding>,
}

#[derive(Debug, Deserialize)]
struct OaiEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

fn to_wire(msg: &ChatMessage) -> Value {
    let mut v = json!({ "role": msg.role, "content": msg.content });
    if !msg.tool_calls.is_empty() {
        v["tool_calls"] = msg
            .tool_calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "type": "function",
                    "function": { "name": c.name, "arguments": c.arguments.to_string() },
                })
            })
            .collect();
    }
    if let Some(id) = &msg.tool_call_id {
        v["tool_call_id"] = json!(id);
    }
    v
}

/// Arguments arrive as a JSON-encoded string on most backends and as an
/// object on some; normalise to a value.
fn decode_arguments(raw: Value) -> Value {
    match raw {
        Value::String(s) if s.trim().is_empty() => json!({}),
        Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
        Value::Null => json!({}),
        other => other,
    }
}

#[async_trait]
impl ChatModel for OpenAICompatible {
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<Completion> {
        let body = OaiChatRequest {
            model: &self.chat_model,
            messages: req.messages.iter().map(to_wire).collect(),
            temperature: self.temperature,
            tools: req
                .tools
                .iter()
                .map(|t| json!({ "type": "function", "function": t }))
                .collect(),
            response_format: req.json_mode.then(|| json!({ "type": "json_object" })),
        };
        let resp = self.post("/chat/completions").json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("model call failed: {} {}", status, text);
        }
        let v: OaiChatResponse = resp.json().await?;
        let message = v
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| anyhow::anyhow!("model returned no choices"))?;
        let tool_calls = message
            .tool_calls
            .into_iter()
            .enumerate()
            .map(|(i, c)| ToolCall {
                id: if c.id.is_empty() { format!("call_{i}") } else { c.id },
                name: c.function.name,
                arguments: decode_arguments(c.function.arguments),
            })
            .collect();
        Ok(Completion { content: message.content.unwrap_or_default(), tool_calls })
    }
}

#[async_trait]
impl Embedder for OpenAICompatible {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = OaiEmbeddingRequest { model: &self.embedding_model, input: texts };
        let resp = self.post("/embeddings").json(&body).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("embedding call failed: {}", resp.status());
        }
        let mut v: OaiEmbeddingResponse = resp.json().await?;
        if v.data.len() != texts.len() {
            anyhow::bail!("embedding count mismatch: sent {} got {}", texts.len(), v.data.len());
        }
        v.data.sort_by_key(|e| e.index);
        Ok(v.data.into_iter().map(|e| e.embedding).collect())
    }
}
