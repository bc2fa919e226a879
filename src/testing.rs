//! Test doubles shared across module tests.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;

use crate::models::{ChatModel, Completion, CompletionRequest, Embedder, ToolCall};
use crate::settings::Settings;

/// Serves `app` on an ephemeral local port.
pub async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub fn settings_with(pairs: &[(&str, &str)]) -> Settings {
    let mut map: HashMap<String, String> = [
        ("MODEL_BASE_URL", "http://127.0.0.1:9"),
        ("CHAT_MODEL_NAME", "test-chat"),
        ("EMBEDDING_MODEL_NAME", "test-embed"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in pairs {
        map.insert(k.to_string(), v.to_string());
    }
    Settings::from_lookup(move |key: &str| map.get(key).cloned()).unwrap()
}

/// Replays canned completions in order; fails once the script runs out.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<anyhow::Result<Completion>>>,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(self, content: &str) -> Self {
        self.push(Ok(Completion { content: content.to_string(), tool_calls: Vec::new() }))
    }

    pub fn tool_call(self, name: &str, arguments: serde_json::Value) -> Self {
        let call = ToolCall { id: format!("call_{name}"), name: name.to_string(), arguments };
        self.push(Ok(Completion { content: String::new(), tool_calls: vec![call] }))
    }

    pub fn failure(self, message: &str) -> Self {
        self.push(Err(anyhow::anyhow!(message.to_string())))
    }

    fn push(self, reply: anyhow::Result<Completion>) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<Completion> {
        self.requests.lock().unwrap().push(req);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow::anyhow!("script exhausted")))
    }
}

/// Bag-of-keywords embedder: one dimension per keyword, so similarity is predictable.
pub struct KeywordEmbedder {
    pub keywords: Vec<&'static str>,
    pub calls: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn new(keywords: Vec<&'static str>) -> Self {
        Self { keywords, calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| {
                self.keywords
                    .iter()
                    .map(|k| t.matches(k).count() as f32)
                    .chain(std::iter::once(0.01))
                    .collect()
            })
            .collect())
    }
}

pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        anyhow::bail!("embedding backend offline")
    }
}
