use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;

use crate::error::SettingsError;

const DEFAULT_SERPAPI_BASE_URL: &str = "https://serpapi.com";
const DEFAULT_YUANFENJU_BASE_URL: &str = "https://api.yuanfenju.com/index.php/v1";
const DEFAULT_TTS_ENDPOINT: &str = "https://eastasia.tts.speech.microsoft.com/cognitiveservices/v1";
const DEFAULT_TTS_VOICE: &str = "zh-CN-YunzeNeural";
const DEFAULT_TTS_FORMAT: &str = "audio-16khz-32kbitrate-mono-mp3";

/// Keys without a sensible default. Startup fails listing every one that is unset.
pub const REQUIRED_KEYS: [&str; 3] = ["MODEL_BASE_URL", "CHAT_MODEL_NAME", "EMBEDDING_MODEL_NAME"];

/// Paid-service credentials. Missing ones disable the matching feature and are
/// reported through the health probe.
pub const CREDENTIAL_KEYS: [&str; 3] = ["SERPAPI_API_KEY", "YUANFENJU_API_KEY", "MICROSOFT_TTS_KEY"];

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelSettings {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub chat_model: String,
    pub embedding_model: String,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AgentSettings {
    pub default_session_id: String,
    pub max_history_messages: usize,
    pub max_tool_rounds: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoreSettings {
    /// `None` resolves to the XDG data directory when the store opens.
    pub database_url: Option<String>,
    pub knowledge_collection: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServiceSettings {
    pub serpapi_base_url: String,
    #[serde(skip_serializing)]
    pub serpapi_api_key: Option<String>,
    pub yuanfenju_base_url: String,
    #[serde(skip_serializing)]
    pub yuanfenju_api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SpeechSettings {
    pub endpoint: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub voice_name: String,
    pub output_format: String,
    pub audio_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Settings {
    pub model: ModelSettings,
    pub agent: AgentSettings,
    pub store: StoreSettings,
    pub services: ServiceSettings,
    pub speech: SpeechSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let missing: Vec<&'static str> = REQUIRED_KEYS.iter().copied().filter(|k| get(*k).is_none()).collect();
        if !missing.is_empty() {
            return Err(SettingsError::Missing(missing));
        }
        let required = |key: &'static str| get(key).ok_or(SettingsError::Missing(vec![key]));

        let model = ModelSettings {
            base_url: required("MODEL_BASE_URL")?,
            api_key: get("MODEL_API_KEY"),
            chat_model: required("CHAT_MODEL_NAME")?,
            embedding_model: required("EMBEDDING_MODEL_NAME")?,
            temperature: parse_or(&get, "MODEL_TEMPERATURE", 0.7)?,
        };

        let agent = AgentSettings {
            default_session_id: get("DEFAULT_SESSION_ID").unwrap_or_else(|| "default".into()),
            max_history_messages: parse_or(&get, "MAX_HISTORY_MESSAGES", 10)?,
            max_tool_rounds: parse_or(&get, "MAX_TOOL_ROUNDS", 5)?,
        };
        if agent.max_history_messages == 0 {
            return Err(SettingsError::Invalid { key: "MAX_HISTORY_MESSAGES", reason: "must be at least 1".into() });
        }
        if agent.max_tool_rounds == 0 {
            return Err(SettingsError::Invalid { key: "MAX_TOOL_ROUNDS", reason: "must be at least 1".into() });
        }

        let store = StoreSettings {
            database_url: get("DATABASE_URL"),
            knowledge_collection: get("KNOWLEDGE_COLLECTION").unwrap_or_else(|| "oracle".into()),
        };

        let services = ServiceSettings {
            serpapi_base_url: get("SERPAPI_BASE_URL").unwrap_or_else(|| DEFAULT_SERPAPI_BASE_URL.into()),
            serpapi_api_key: get("SERPAPI_API_KEY"),
            yuanfenju_base_url: get("YUANFENJU_BASE_URL").unwrap_or_else(|| DEFAULT_YUANFENJU_BASE_URL.into()),
            yuanfenju_api_key: get("YUANFENJU_API_KEY"),
        };

        let speech = SpeechSettings {
            endpoint: get("TTS_ENDPOINT").unwrap_or_else(|| DEFAULT_TTS_ENDPOINT.into()),
            api_key: get("MICROSOFT_TTS_KEY"),
            voice_name: get("TTS_VOICE_NAME").unwrap_or_else(|| DEFAULT_TTS_VOICE.into()),
            output_format: get("TTS_OUTPUT_FORMAT").unwrap_or_else(|| DEFAULT_TTS_FORMAT.into()),
            audio_dir: get("AUDIO_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
        };

        Ok(Self { model, agent, store, services, speech })
    }

    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let present = [
            self.services.serpapi_api_key.is_some(),
            self.services.yuanfenju_api_key.is_some(),
            self.speech.api_key.is_some(),
        ];
        CREDENTIAL_KEYS
            .iter()
            .zip(present)
            .filter(|(_, ok)| !ok)
            .map(|(k, _)| *k)
            .collect()
    }

    pub fn credentials_complete(&self) -> bool {
        self.missing_credentials().is_empty()
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, SettingsError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| SettingsError::Invalid { key, reason: format!("{raw:?}: {e}") }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    const BASE: [(&str, &str); 3] = [
        ("MODEL_BASE_URL", "http://localhost:11434/v1"),
        ("CHAT_MODEL_NAME", "qwen3:8b"),
        ("EMBEDDING_MODEL_NAME", "nomic-embed-text"),
    ];

    #[test]
    fn missing_required_keys_are_all_listed() {
        let err = Settings::from_lookup(lookup(&[("CHAT_MODEL_NAME", "qwen3:8b"), ("MODEL_BASE_URL", "  ")])).unwrap_err();
        match err {
            SettingsError::Missing(keys) => assert_eq!(keys, vec!["MODEL_BASE_URL", "EMBEDDING_MODEL_NAME"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn defaults_fill_optional_keys() {
        let s = Settings::from_lookup(lookup(&BASE)).unwrap();
        assert_eq!(s.model.temperature, 0.7);
        assert_eq!(s.agent.max_history_messages, 10);
        assert_eq!(s.agent.max_tool_rounds, 5);
        assert_eq!(s.agent.default_session_id, "default");
        assert_eq!(s.store.knowledge_collection, "oracle");
        assert!(s.store.database_url.is_none());
        assert_eq!(s.services.yuanfenju_base_url, DEFAULT_YUANFENJU_BASE_URL);
        assert_eq!(s.missing_credentials(), CREDENTIAL_KEYS.to_vec());
        assert!(!s.credentials_complete());
    }

    #[test]
    fn unparsable_number_names_the_key() {
        let mut pairs = BASE.to_vec();
        pairs.push(("MODEL_TEMPERATURE", "warm"));
        let err = Settings::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { key: "MODEL_TEMPERATURE", .. }));
    }

    #[test]
    fn zero_history_threshold_rejected() {
        let mut pairs = BASE.to_vec();
        pairs.push(("MAX_HISTORY_MESSAGES", "0"));
        let err = Settings::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { key: "MAX_HISTORY_MESSAGES", .. }));
    }

    #[test]
    fn zero_tool_rounds_rejected() {
        let mut pairs = BASE.to_vec();
        pairs.push(("MAX_TOOL_ROUNDS", "0"));
        let err = Settings::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { key: "MAX_TOOL_ROUNDS", .. }));
    }

    #[test]
    fn credentials_complete_when_all_keys_present() {
        let mut pairs = BASE.to_vec();
        pairs.extend([("SERPAPI_API_KEY", "s"), ("YUANFENJU_API_KEY", "y"), ("MICROSOFT_TTS_KEY", "t")]);
        let s = Settings::from_lookup(lookup(&pairs)).unwrap();
        assert!(s.credentials_complete());
        assert_eq!(s.speech.api_key.as_deref(), Some("t"));
    }
}
