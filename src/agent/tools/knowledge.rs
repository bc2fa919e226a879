use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{query_arg, query_schema, Tool};
use crate::error::ToolError;
use crate::knowledge::{KnowledgeBase, Passage, DEFAULT_TOP_K};

pub const KNOWLEDGE_UNAVAILABLE: &str = "知识库暂时不可用，请稍后再试。";
pub const NOTHING_FOUND: &str = "未找到相关信息";

pub struct KnowledgeLookupTool {
    kb: Arc<KnowledgeBase>,
}

impl KnowledgeLookupTool {
    pub fn new(kb: Arc<KnowledgeBase>) -> Self {
        Self { kb }
    }
}

pub fn format_passages(passages: &[Passage]) -> String {
    passages
        .iter()
        .map(|p| format!("来源: {}\n内容: {}", p.source, p.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[async_trait]
impl Tool for KnowledgeLookupTool {
    fn name(&self) -> &'static str {
        "knowledge_lookup"
    }

    fn description(&self) -> &'static str {
        "只有回答与2025年运势、生肖运势或星座（比如水瓶座等）相关的问题的时候，才会使用这个工具。"
    }

    fn parameters(&self) -> Value {
        query_schema("要在本地知识库中查询的问题")
    }

    fn unavailable_message(&self) -> &'static str {
        KNOWLEDGE_UNAVAILABLE
    }

    async fn run(&self, args: &Value) -> Result<String, ToolError> {
        let query = query_arg(args).ok_or_else(|| ToolError::NeedsInput("请提供要查询的问题。".into()))?;
        let passages = self.kb.search(&query, DEFAULT_TOP_K).await?;
        if passages.is_empty() {
            return Ok(NOTHING_FOUND.to_string());
        }
        Ok(format_passages(&passages))
    }
}
