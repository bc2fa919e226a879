use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{Instrument, Span};
use uuid::Uuid;

use crate::mood::Mood;
use crate::settings::SpeechSettings;

const USER_AGENT: &str = "fortune-teller";

/// Text-to-speech against an Azure-compatible endpoint. Audio lands in
/// `<audio_dir>/<id>.mp3`; callers poll for it after the reply has gone out.
pub struct SpeechSynthesizer {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    voice_name: String,
    output_format: String,
    audio_dir: PathBuf,
    span: Span,
}

impl SpeechSynthesizer {
    pub fn new(settings: &SpeechSettings, span: Span) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            http,
            endpoint: settings.endpoint.clone(),
            api_key: settings.api_key.clone(),
            voice_name: settings.voice_name.clone(),
            output_format: settings.output_format.clone(),
            audio_dir: settings.audio_dir.clone(),
            span,
        }
    }

    pub fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn audio_path(&self, id: Uuid) -> PathBuf {
        self.audio_dir.join(format!("{}.mp3", id))
    }

    /// Starts synthesis in the background. Returns `None` when no credential
    /// is configured or there is nothing to say.
    pub fn spawn(self: &Arc<Self>, text: String, id: Uuid, mood: Mood) -> Option<JoinHandle<()>> {
        if !self.is_available() || text.trim().is_empty() {
            return None;
        }
        let this = Arc::clone(self);
        let span = self.span.clone();
        Some(tokio::spawn(
            async move {
                match this.synthesize(&text, id, mood).await {
                    Ok(path) => {
                        metrics::counter!("oracle_speech_total", "outcome" => "ok").increment(1);
                        tracing::info!(%id, path = %path.display(), "speech ready");
                    }
                    Err(e) => {
                        metrics::counter!("oracle_speech_total", "outcome" => "error").increment(1);
                        tracing::error!(%id, error = %e, "speech synthesis failed");
                    }
                }
            }
            .instrument(span),
        ))
    }

    pub async fn synthesize(&self, text: &str, id: Uuid, mood: Mood) -> anyhow::Result<PathBuf> {
        let key = self.api_key.as_deref().ok_or_else(|| anyhow::anyhow!("MICROSOFT_TTS_KEY is not configured"))?;
        tracing::debug!(%id, %mood, text = %crate::text::preview(text, 50), "synthesizing speech");
        let ssml = build_ssml(&self.voice_name, mood.voice_style(), text);
        let resp = self
            .http
            .post(&self.endpoint)
            .header("Ocp-Apim-Subscription-Key", key)
            .header(reqwest::header::CONTENT_TYPE, "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", &self.output_format)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .body(ssml)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            anyhow::bail!("tts returned {}: {}", status, crate::text::preview(&detail, 200));
        }
        let audio = resp.bytes().await?;

        tokio::fs::create_dir_all(&self.audio_dir).await?;
        let path = self.audio_path(id);
        let partial = self.audio_dir.join(format!("{}.mp3.part", id));
        tokio::fs::write(&partial, &audio).await?;
        tokio::fs::rename(&partial, &path).await?;
        Ok(path)
    }

    /// Reads finished audio. Not-yet-written (or never requested) audio is `None`.
    pub async fn load(&self, id: Uuid) -> anyhow::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.audio_path(id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

pub fn build_ssml(voice: &str, style: &str, text: &str) -> String {
    format!(
        "<speak version='1.0' xmlns='http://www.w3.org/2001/10/synthesis' xmlns:mstts=\"https://www.w3.org/2001/mstts\" xml:lang='zh-CN'>\
         <voice name='{}'><mstts:express-as style=\"{}\" role=\"SeniorMale\">{}</mstts:express-as></voice></speak>",
        escape_xml(voice),
        escape_xml(style),
        escape_xml(text)
    )
}
