use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{query_arg, query_schema, Tool};
use crate::error::ToolError;
use crate::settings::ServiceSettings;

pub const SEARCH_UNAVAILABLE: &str = "搜索服务暂时不可用，请稍后再试。";
pub const NO_RESULT: &str = "No good search result found";
const MAX_SNIPPETS: usize = 3;

/// Web search against a SerpAPI-compatible endpoint.
pub struct SearchTool {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl SearchTool {
    pub fn new(services: &ServiceSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: services.serpapi_base_url.trim_end_matches('/').to_string(),
            api_key: services.serpapi_api_key.clone(),
        }
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &'static str {
        "search"
    }

    fn description(&self) -> &'static str {
        "只有需要了解实时信息或不知道的事情的时候才会使用这个工具。"
    }

    fn parameters(&self) -> Value {
        query_schema("要搜索的内容")
    }

    fn unavailable_message(&self) -> &'static str {
        SEARCH_UNAVAILABLE
    }

    async fn run(&self, args: &Value) -> Result<String, ToolError> {
        let query = query_arg(args).ok_or_else(|| ToolError::NeedsInput("请提供要搜索的内容。".into()))?;
        let key = self.api_key.as_deref().ok_or_else(|| anyhow::anyhow!("SERPAPI_API_KEY is not configured"))?;
        let resp = self
            .http
            .get(format!("{}/search.json", self.base_url))
            .query(&[("engine", "google"), ("q", query.as_str()), ("api_key", key)])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow::anyhow!("search returned {}", status).into());
        }
        let body: Value = resp.json().await?;
        let answer = extract_answer(&body)?;
        tracing::info!(query = %query, "search answered");
        Ok(answer)
    }
}

/// Picks the most direct answer out of a SerpAPI response body.
pub fn extract_answer(body: &Value) -> Result<String, ToolError> {
    if let Some(err) = body.get("error").and_then(Value::as_str) {
        return Err(anyhow::anyhow!("search error: {}", err).into());
    }
    let text = |v: Option<&Value>| v.and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);

    if let Some(answer_box) = body.get("answer_box") {
        if let Some(a) = text(answer_box.get("answer")).or_else(|| text(answer_box.get("snippet"))) {
            return Ok(a);
        }
        if let Some(words) = answer_box.get("snippet_highlighted_words").and_then(Value::as_array) {
            if let Some(first) = text(words.first()) {
                return Ok(first);
            }
        }
    }
    if let Some(desc) = text(body.get("knowledge_graph").and_then(|kg| kg.get("description"))) {
        return Ok(desc);
    }
    let snippets: Vec<String> = body
        .get("organic_results")
        .and_then(Value::as_array)
        .map(|results| results.iter().filter_map(|r| text(r.get("snippet"))).take(MAX_SNIPPETS).collect())
        .unwrap_or_default();
    if snippets.is_empty() {
        Ok(NO_RESULT.to_string())
    } else {
        Ok(snippets.join("\n"))
    }
}
