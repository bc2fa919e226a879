use std::time::Duration;

use serde_json::Value;

use crate::error::ToolError;
use crate::settings::ServiceSettings;

pub const BAZI_PATH: &str = "Bazi/cesuan";
pub const DRAW_PATH: &str = "Zhanbu/meiri";
pub const DREAM_PATH: &str = "Gongju/zhougong";

/// Form-post client for the paid fortune APIs. Every call carries the API key.
pub struct YuanfenjuClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl YuanfenjuClient {
    pub fn new(services: &ServiceSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: services.yuanfenju_base_url.trim_end_matches('/').to_string(),
            api_key: services.yuanfenju_api_key.clone(),
        }
    }

    /// Non-2xx becomes `ToolError::Status`; transport and JSON decoding problems are `Other`.
    pub async fn post_form(&self, path: &str, fields: &[(&str, String)]) -> Result<Value, ToolError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("YUANFENJU_API_KEY is not configured"))?;
        let mut form: Vec<(&str, &str)> = Vec::with_capacity(fields.len() + 1);
        form.push(("api_key", key));
        form.extend(fields.iter().map(|(k, v)| (*k, v.as_str())));

        let url = format!("{}/{}", self.base_url, path);
        let resp = self.http.post(&url).form(&form).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ToolError::Status(status));
        }
        let body: Value = resp.json().await?;
        tracing::debug!(path, body = %crate::text::preview(&body.to_string(), 300), "fortune api answered");
        Ok(body)
    }
}

/// Renders a payload field as text; strings as-is, anything else as JSON.
pub fn payload_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
