use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::agent::{AgentEngine, ToolRegistry};
use crate::conversation::{ConversationSession, TurnReply, TurnServices, APOLOGY};
use crate::error::ApiError;
use crate::history::HistoryManager;
use crate::knowledge::KnowledgeBase;
use crate::models::{ChatModel, Embedder};
use crate::mood::{Mood, MoodClassifier};
use crate::settings::Settings;
use crate::speech::SpeechSynthesizer;
use crate::storage::{open_pool, SqliteHistoryStore};
use crate::telemetry::component_span;
use crate::text::validate_user_input;

pub const INVALID_INPUT: &str = "输入内容无效，请输入1到1000个字符。";

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub turns: Arc<TurnServices>,
    pub speech: Arc<SpeechSynthesizer>,
    pub knowledge: Arc<KnowledgeBase>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Opens storage and wires every component, each with its own log span.
    pub async fn build(settings: Settings, model: Arc<dyn ChatModel>, embedder: Arc<dyn Embedder>) -> anyhow::Result<Self> {
        let pool = open_pool(settings.store.database_url.clone()).await?;
        let knowledge = Arc::new(KnowledgeBase::new(
            pool.clone(),
            embedder,
            settings.store.knowledge_collection.clone(),
            component_span("knowledge"),
        ));
        let tools = Arc::new(ToolRegistry::with_default_tools(
            &settings.services,
            model.clone(),
            knowledge.clone(),
            component_span("tools"),
        ));
        let turns = TurnServices {
            classifier: MoodClassifier::new(model.clone(), component_span("mood")),
            engine: AgentEngine::new(model.clone(), tools, settings.agent.max_tool_rounds, component_span("agent")),
            history: HistoryManager::new(
                Arc::new(SqliteHistoryStore::new(pool)),
                model,
                settings.agent.max_history_messages,
                component_span("history"),
            ),
        };
        let speech = Arc::new(SpeechSynthesizer::new(&settings.speech, component_span("speech")));
        Ok(Self {
            settings: Arc::new(settings),
            turns: Arc::new(turns),
            speech,
            knowledge,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.metrics = handle;
        self
    }

    pub fn conversation(&self, session_id: Option<String>) -> ConversationSession {
        let id = session_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.settings.agent.default_session_id.clone());
        ConversationSession::new(id, self.turns.clone(), component_span("conversation"))
    }
}

/// Runs one turn on its own task so a panic anywhere below becomes the
/// apology instead of a dropped connection. The session comes back unless the
/// task died.
pub async fn guarded_turn(mut convo: ConversationSession, input: String) -> (Option<ConversationSession>, TurnReply) {
    let task = tokio::spawn(async move {
        let reply = convo.run_turn(&input).await;
        (convo, reply)
    });
    match task.await {
        Ok((convo, reply)) => (Some(convo), reply),
        Err(e) => {
            metrics::counter!("oracle_turns_total", "outcome" => "panic").increment(1);
            tracing::error!(error = %e, "turn task failed");
            (None, TurnReply::new(APOLOGY, Mood::Default))
        }
    }
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "service": "fortune-teller",
        "message": "陈大师算命馆已开张，请通过 /chat 或 /ws 提问。",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub query: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub msg: String,
    pub id: Uuid,
    pub mood: Mood,
    pub mood_description: String,
    pub voice_style: String,
}

async fn chat(State(state): State<AppState>, Json(body): Json<ChatBody>) -> Result<Json<ChatResponse>, ApiError> {
    if !validate_user_input(&body.query) {
        return Err(ApiError::BadRequest(INVALID_INPUT));
    }
    let convo = state.conversation(body.session_id);
    let (_, reply) = guarded_turn(convo, body.query.trim().to_string()).await;

    let id = Uuid::new_v4();
    if state.speech.spawn(reply.text.clone(), id, reply.mood).is_some() {
        tracing::debug!(%id, "speech synthesis started");
    }
    Ok(Json(ChatResponse {
        msg: reply.text,
        id,
        mood: reply.mood,
        mood_description: reply.mood.description().to_string(),
        voice_style: reply.voice_style.to_string(),
    }))
}

async fn audio(State(state): State<AppState>, Path(raw_id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let id = Uuid::parse_str(&raw_id).map_err(|_| ApiError::BadRequest("无效的音频ID"))?;
    match state.speech.load(id).await {
        Ok(Some(bytes)) => Ok(([(header::CONTENT_TYPE, "audio/mpeg")], bytes)),
        Ok(None) => Err(ApiError::NotFound("音频文件不存在")),
        Err(e) => {
            tracing::error!(%id, error = %e, "audio read failed");
            Err(ApiError::Internal("音频读取失败"))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AddUrlBody {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub response: String,
    pub chunks: usize,
}

async fn add_urls(State(state): State<AppState>, Json(body): Json<AddUrlBody>) -> Result<Json<IngestResponse>, ApiError> {
    let parsed = url::Url::parse(body.url.trim()).map_err(|_| ApiError::BadRequest("无效的URL"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ApiError::BadRequest("只支持 http/https 链接"));
    }
    match state.knowledge.ingest_url(parsed.as_str()).await {
        Ok(chunks) => Ok(Json(IngestResponse { response: "知识库已更新".into(), chunks })),
        Err(e) => {
            tracing::error!(url = %parsed, error = %e, "url ingestion failed");
            Err(ApiError::Internal("知识库更新失败"))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AddTextBody {
    pub text: String,
    pub source: Option<String>,
}

async fn add_texts(State(state): State<AppState>, Json(body): Json<AddTextBody>) -> Result<Json<IngestResponse>, ApiError> {
    if body.text.trim().is_empty() {
        return Err(ApiError::BadRequest("文本内容不能为空"));
    }
    let source = body.source.filter(|s| !s.trim().is_empty()).unwrap_or_else(|| "manual".into());
    match state.knowledge.ingest_text(&source, &body.text).await {
        Ok(chunks) => Ok(Json(IngestResponse { response: "知识库已更新".into(), chunks })),
        Err(e) => {
            tracing::error!(%source, error = %e, "text ingestion failed");
            Err(ApiError::Internal("知识库更新失败"))
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let tts = state.speech.is_available();
    Json(json!({
        "status": "healthy",
        "config_valid": state.settings.credentials_complete(),
        "tts_available": tts,
        "version": env!("CARGO_PKG_VERSION"),
        "features": {
            "chat": true,
            "tts": tts,
            "knowledge_base": true,
            "websocket": true,
        },
    }))
}

async fn metrics_text(State(state): State<AppState>) -> String {
    state.metrics.as_ref().map(PrometheusHandle::render).unwrap_or_default()
}

async fn ws_route(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

/// One conversation per connection: each text frame is a user turn, answered
/// with one text frame.
async fn handle_socket(state: AppState, mut socket: WebSocket) {
    let mut convo = Some(state.conversation(None));
    tracing::info!("websocket connected");
    while let Some(incoming) = socket.recv().await {
        let text = match incoming {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let answer = if !validate_user_input(&text) {
            INVALID_INPUT.to_string()
        } else {
            let current = convo.take().unwrap_or_else(|| state.conversation(None));
            let (back, reply) = guarded_turn(current, text.trim().to_string()).await;
            convo = back;
            reply.text
        };
        if socket.send(Message::Text(answer)).await.is_err() {
            break;
        }
    }
    tracing::info!("websocket closed");
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/chat", post(chat))
        .route("/audio/:id", get(audio))
        .route("/add_urls", post(add_urls))
        .route("/add_texts", post(add_texts))
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/ws", get(ws_route))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let span = component_span("server");
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    span.in_scope(|| tracing::info!(%addr, "listening"));
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    span.in_scope(|| tracing::info!("server stopped"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{serve as serve_app, settings_with, KeywordEmbedder, ScriptedModel};
    use async_trait::async_trait;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    struct PanickingModel;

    #[async_trait]
    impl ChatModel for PanickingModel {
        async fn complete(&self, _req: crate::models::CompletionRequest) -> anyhow::Result<crate::models::Completion> {
            panic!("model exploded")
        }
    }

    async fn app(model: Arc<dyn ChatModel>, dir: &tempfile::TempDir, extra: &[(&str, &str)]) -> (String, AppState) {
        let db = format!("sqlite://{}", dir.path().join("app.db").to_string_lossy());
        let audio = dir.path().join("audio").to_string_lossy().to_string();
        let mut pairs = vec![("DATABASE_URL", db.as_str()), ("AUDIO_DIR", audio.as_str())];
        pairs.extend_from_slice(extra);
        let settings = settings_with(&pairs);
        let embedder = Arc::new(KeywordEmbedder::new(vec!["生肖", "星座"]));
        let state = AppState::build(settings, model, embedder).await.unwrap();
        let addr = serve_app(router(state.clone())).await;
        (format!("http://{}", addr), state)
    }

    #[tokio::test]
    async fn chat_returns_reply_with_mood() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new().text("cheerful").text("哈哈，老夫看你红光满面").into_arc();
        let (base, _state) = app(model, &dir, &[]).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/chat", base))
            .json(&json!({"query": "今天心情真好", "session_id": "u1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: ChatResponse = resp.json().await.unwrap();
        assert_eq!(body.msg, "哈哈，老夫看你红光满面");
        assert_eq!(body.mood, Mood::Cheerful);
        assert_eq!(body.voice_style, "cheerful");
        assert_eq!(body.mood_description, Mood::Cheerful.description());
    }

    #[tokio::test]
    async fn chat_rejects_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new().into_arc();
        let (base, _state) = app(model.clone(), &dir, &[]).await;
        let client = reqwest::Client::new();
        let long = "算".repeat(1001);
        for query in ["", "   ", long.as_str()] {
            let resp = client.post(format!("{}/chat", base)).json(&json!({"query": query})).send().await.unwrap();
            assert_eq!(resp.status(), 400);
            let body: serde_json::Value = resp.json().await.unwrap();
            assert_eq!(body["detail"], INVALID_INPUT);
        }
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn panicking_turn_answers_with_apology() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _state) = app(Arc::new(PanickingModel), &dir, &[]).await;
        let body: ChatResponse = reqwest::Client::new()
            .post(format!("{}/chat", base))
            .json(&json!({"query": "算一卦"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body.msg, APOLOGY);
        assert_eq!(body.mood, Mood::Default);
    }

    #[tokio::test]
    async fn audio_not_found_before_synthesis() {
        let dir = tempfile::tempdir().unwrap();
        let (base, state) = app(ScriptedModel::new().into_arc(), &dir, &[]).await;
        let client = reqwest::Client::new();

        let resp = client.get(format!("{}/audio/not-a-uuid", base)).send().await.unwrap();
        assert_eq!(resp.status(), 400);

        let id = Uuid::new_v4();
        let resp = client.get(format!("{}/audio/{}", base, id)).send().await.unwrap();
        assert_eq!(resp.status(), 404);

        let path = state.speech.audio_path(id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"ID3").unwrap();
        let resp = client.get(format!("{}/audio/{}", base, id)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["content-type"], "audio/mpeg");
        assert_eq!(resp.bytes().await.unwrap().as_ref(), b"ID3");
    }

    #[tokio::test]
    async fn chat_audio_is_missing_until_synthesis_finishes() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let release = gate.clone();
        let tts = Router::new().route(
            "/tts",
            post(move || {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    vec![0x49u8, 0x44, 0x33]
                }
            }),
        );
        let tts_endpoint = format!("http://{}/tts", serve_app(tts).await);

        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new().text("friendly").text("亲，缘分到了").into_arc();
        let (base, state) =
            app(model, &dir, &[("MICROSOFT_TTS_KEY", "k"), ("TTS_ENDPOINT", tts_endpoint.as_str())]).await;
        let client = reqwest::Client::new();

        let body: ChatResponse =
            client.post(format!("{}/chat", base)).json(&json!({"query": "姻缘如何"})).send().await.unwrap().json().await.unwrap();
        assert_eq!(body.msg, "亲，缘分到了");

        let early = client.get(format!("{}/audio/{}", base, body.id)).send().await.unwrap();
        assert_eq!(early.status(), 404);

        release.notify_one();
        let mut status = early.status();
        for _ in 0..100 {
            status = client.get(format!("{}/audio/{}", base, body.id)).send().await.unwrap().status();
            if status == 200 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(status, 200);
        assert!(state.speech.audio_path(body.id).exists());
    }

    #[tokio::test]
    async fn health_reports_missing_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _state) = app(ScriptedModel::new().into_arc(), &dir, &[("MICROSOFT_TTS_KEY", "k")]).await;
        let body: serde_json::Value = reqwest::get(format!("{}/health", base)).await.unwrap().json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["config_valid"], false);
        assert_eq!(body["tts_available"], true);
        assert_eq!(body["features"]["websocket"], true);
    }

    #[tokio::test]
    async fn knowledge_ingestion_routes() {
        let dir = tempfile::tempdir().unwrap();
        let (base, state) = app(ScriptedModel::new().into_arc(), &dir, &[]).await;
        let client = reqwest::Client::new();

        let resp = client.post(format!("{}/add_urls", base)).json(&json!({"url": "ftp://example.com/a"})).send().await.unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client
            .post(format!("{}/add_texts", base))
            .json(&json!({"text": "生肖马今年贵人运旺", "source": "almanac"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: IngestResponse = resp.json().await.unwrap();
        assert_eq!(body.chunks, 1);
        assert_eq!(state.knowledge.count().await.unwrap(), 1);

        let resp = client.post(format!("{}/add_texts", base)).json(&json!({"text": "  "})).send().await.unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn websocket_answers_each_frame() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new().text("default").text("老夫在此").into_arc();
        let (base, _state) = app(model, &dir, &[]).await;
        let url = format!("{}/ws", base.replacen("http", "ws", 1));
        let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        socket.send(WsMessage::Text("   ".into())).await.unwrap();
        let reply = socket.next().await.unwrap().unwrap();
        assert_eq!(reply.into_text().unwrap(), INVALID_INPUT);

        socket.send(WsMessage::Text("大师好".into())).await.unwrap();
        let reply = socket.next().await.unwrap().unwrap();
        assert_eq!(reply.into_text().unwrap(), "老夫在此");
        socket.close(None).await.unwrap();
    }
}
