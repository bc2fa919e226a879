//! Fortune tools backed by the paid yuanfenju APIs: bazi reading, daily
//! hexagram draw and dream interpretation.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::yuanfenju::{payload_text, YuanfenjuClient, BAZI_PATH, DRAW_PATH, DREAM_PATH};
use super::{query_arg, query_schema, Tool};
use crate::error::ToolError;
use crate::models::{ChatMessage, ChatModel, CompletionRequest};
use crate::prompts;
use crate::text::strip_reasoning;

pub const BAZI_UNAVAILABLE: &str = "八字查询服务暂时不可用，请稍后再试。";
pub const BAZI_PAYLOAD_FAILED: &str = "八字查询失败，可能是你忘记询问用户姓名或者出生年月日时了。";
pub const DRAW_UNAVAILABLE: &str = "摇卦服务暂时不可用，请稍后再试。";
pub const DRAW_FAILED: &str = "摇卦失败";
pub const DREAM_UNAVAILABLE: &str = "解梦服务暂时不可用，请稍后再试。";
pub const DREAM_FAILED: &str = "解梦失败";
pub const DREAM_ASK: &str = "请先让用户描述一下梦境的具体内容，再进行解梦。";
const BAZI_ASK: &str = "请先询问用户的姓名和出生年月日时，再进行八字测算。";

/// Birth data required by the bazi API, already range-checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BirthProfile {
    pub name: String,
    /// 0 male, 1 female
    pub sex: u8,
    /// 0 lunar, 1 solar
    pub calendar: u8,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hours: u8,
    pub minute: u8,
}

fn int_field(v: &Value, key: &str) -> Option<i64> {
    match v.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn in_range(label: &str, value: i64, lo: i64, hi: i64) -> Result<i64, ToolError> {
    if (lo..=hi).contains(&value) {
        Ok(value)
    } else {
        Err(ToolError::NeedsInput(format!(
            "用户提供的{}（{}）不在有效范围{}-{}内，请向用户确认后再测算。",
            label, value, lo, hi
        )))
    }
}

impl BirthProfile {
    /// Validates the model's extraction. Missing fields produce a request for
    /// the user to supply them; out-of-range values are rejected.
    pub fn from_extraction(v: &Value) -> Result<Self, ToolError> {
        let name = v
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let mut missing = Vec::new();
        if name.is_none() {
            missing.push("姓名");
        }
        let required = [("sex", "性别"), ("year", "出生年份"), ("month", "出生月份"), ("day", "出生日期"), ("hours", "出生时辰")];
        for (key, label) in required {
            if int_field(v, key).is_none() {
                missing.push(label);
            }
        }
        if !missing.is_empty() {
            return Err(ToolError::NeedsInput(format!("缺少用户的{}，请先询问用户后再进行八字测算。", missing.join("、"))));
        }

        let field = |key: &str| int_field(v, key).unwrap_or_default();
        Ok(Self {
            name: name.unwrap_or_default(),
            sex: in_range("性别", field("sex"), 0, 1)? as u8,
            calendar: in_range("日历类型", int_field(v, "type").unwrap_or(1), 0, 1)? as u8,
            year: in_range("出生年份", field("year"), 1900, 2030)? as u16,
            month: in_range("出生月份", field("month"), 1, 12)? as u8,
            day: in_range("出生日期", field("day"), 1, 31)? as u8,
            hours: in_range("出生时辰", field("hours"), 0, 23)? as u8,
            minute: in_range("出生分钟", int_field(v, "minute").unwrap_or(0), 0, 59)? as u8,
        })
    }

    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("name", self.name.clone()),
            ("sex", self.sex.to_string()),
            ("type", self.calendar.to_string()),
            ("year", self.year.to_string()),
            ("month", self.month.to_string()),
            ("day", self.day.to_string()),
            ("hours", self.hours.to_string()),
            ("minute", self.minute.to_string()),
        ]
    }
}

fn parse_json_reply(raw: &str) -> anyhow::Result<Value> {
    let cleaned = strip_reasoning(raw);
    let body = cleaned
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    Ok(serde_json::from_str(body)?)
}

pub struct BaziTool {
    model: Arc<dyn ChatModel>,
    client: Arc<YuanfenjuClient>,
}

impl BaziTool {
    pub fn new(model: Arc<dyn ChatModel>, client: Arc<YuanfenjuClient>) -> Self {
        Self { model, client }
    }

    async fn extract(&self, query: &str) -> Result<BirthProfile, ToolError> {
        let mut req = CompletionRequest::new(vec![ChatMessage::user(prompts::bazi_extraction_prompt(query))]);
        req.json_mode = true;
        let out = self.model.complete(req).await?;
        let extracted = parse_json_reply(&out.content)?;
        tracing::debug!(%extracted, "bazi parameters extracted");
        BirthProfile::from_extraction(&extracted)
    }
}

#[async_trait]
impl Tool for BaziTool {
    fn name(&self) -> &'static str {
        "bazi_lookup"
    }

    fn description(&self) -> &'static str {
        "只有做八字排查的时候才会使用这个工具，需要输入用户姓名和出生年月日时，如果缺少用户姓名和出生年月日时则不可用。"
    }

    fn parameters(&self) -> Value {
        query_schema("包含用户姓名、性别和出生年月日时的描述")
    }

    fn unavailable_message(&self) -> &'static str {
        BAZI_UNAVAILABLE
    }

    async fn run(&self, args: &Value) -> Result<String, ToolError> {
        let query = query_arg(args).ok_or_else(|| ToolError::NeedsInput(BAZI_ASK.into()))?;
        let profile = self.extract(&query).await?;
        let body = self.client.post_form(BAZI_PATH, &profile.form_fields()).await?;
        match body.pointer("/data/bazi_info/bazi") {
            Some(bazi) if !bazi.is_null() => Ok(format!("八字排盘完成：{}", payload_text(bazi))),
            _ => Err(ToolError::Payload(BAZI_PAYLOAD_FAILED.into())),
        }
    }
}

pub struct DrawTool {
    client: Arc<YuanfenjuClient>,
}

impl DrawTool {
    pub fn new(client: Arc<YuanfenjuClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for DrawTool {
    fn name(&self) -> &'static str {
        "divination_draw"
    }

    fn description(&self) -> &'static str {
        "只要用户想要摇卦占卜抽签的时候才会使用这个工具。"
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn unavailable_message(&self) -> &'static str {
        DRAW_UNAVAILABLE
    }

    async fn run(&self, _args: &Value) -> Result<String, ToolError> {
        let body = self.client.post_form(DRAW_PATH, &[]).await?;
        Ok(body.get("data").filter(|d| !d.is_null()).map(payload_text).unwrap_or_else(|| DRAW_FAILED.to_string()))
    }
}

pub struct DreamTool {
    model: Arc<dyn ChatModel>,
    client: Arc<YuanfenjuClient>,
}

impl DreamTool {
    pub fn new(model: Arc<dyn ChatModel>, client: Arc<YuanfenjuClient>) -> Self {
        Self { model, client }
    }
}

#[async_trait]
impl Tool for DreamTool {
    fn name(&self) -> &'static str {
        "dream_interpretation"
    }

    fn description(&self) -> &'static str {
        "只有用户想要解梦的时候才会使用这个工具，需要输入用户梦境的内容，如果缺少用户梦境的内容则不可用。"
    }

    fn parameters(&self) -> Value {
        query_schema("用户梦境的内容")
    }

    fn unavailable_message(&self) -> &'static str {
        DREAM_UNAVAILABLE
    }

    async fn run(&self, args: &Value) -> Result<String, ToolError> {
        let query = query_arg(args).ok_or_else(|| ToolError::NeedsInput(DREAM_ASK.into()))?;
        let req = CompletionRequest::new(vec![ChatMessage::user(prompts::dream_keyword_prompt(&query))]);
        let out = self.model.complete(req).await?;
        let keyword = strip_reasoning(&out.content);
        if keyword.is_empty() {
            return Err(ToolError::NeedsInput(DREAM_ASK.into()));
        }
        tracing::debug!(%keyword, "dream keyword extracted");
        let body = self.client.post_form(DREAM_PATH, &[("title_zhougong", keyword)]).await?;
        Ok(body.get("data").filter(|d| !d.is_null()).map(payload_text).unwrap_or_else(|| DREAM_FAILED.to_string()))
    }
}
