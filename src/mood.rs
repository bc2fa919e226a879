use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{Instrument, Span};

use crate::models::{ChatMessage, ChatModel, CompletionRequest};
use crate::prompts;
use crate::text::strip_reasoning;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    #[default]
    Default,
    Upbeat,
    Angry,
    Depressed,
    Friendly,
    Cheerful,
}

struct MoodProfile {
    role_set: &'static str,
    description: &'static str,
    voice_style: &'static str,
}

const DEFAULT: MoodProfile = MoodProfile {
    role_set: "",
    description: "默认状态，正常对话",
    voice_style: "chat",
};

const UPBEAT: MoodProfile = MoodProfile {
    role_set: "- 你此时也非常兴奋并表现得很有活力。\n\
               - 你会根据上下文，以一种非常兴奋的语气来回答问题。\n\
               - 你会添加类似“太棒了！”、“真是太好了！”等语气词。\n\
               - 同时你会提醒用户切莫过于兴奋，以免乐极生悲。",
    description: "兴奋状态，语气活跃积极",
    voice_style: "advertisement_upbeat",
};

const ANGRY: MoodProfile = MoodProfile {
    role_set: "- 你会以更加严厉的语气来回答问题。\n\
               - 你会在回答的时候加上一些训诫的话语。\n\
               - 你会提醒用户小心行事，别乱说话。",
    description: "愤怒状态，语气严厉",
    voice_style: "angry",
};

const DEPRESSED: MoodProfile = MoodProfile {
    role_set: "- 你会以兴奋的语气来回答问题。\n\
               - 你会在回答的时候加上一些激励的话语，比如加油等。\n\
               - 你会提醒用户要保持乐观的心态。",
    description: "沮丧状态，会用积极语言鼓励用户",
    voice_style: "upbeat",
};

const FRIENDLY: MoodProfile = MoodProfile {
    role_set: "- 你会以非常友好的语气来回答。\n\
               - 你会在回答的时候加上一些友好的词语，比如“亲爱的”、“亲”等。\n\
               - 你会随机地告诉用户一些你的经历。",
    description: "友好状态，语气亲切温和",
    voice_style: "friendly",
};

const CHEERFUL: MoodProfile = MoodProfile {
    role_set: "- 你会以非常愉悦和兴奋的语气来回答。\n\
               - 你会在回答的时候加入一些愉悦的词语，比如“哈哈”、“呵呵”等。\n\
               - 你会提醒用户切莫过于兴奋，以免乐极生悲。",
    description: "愉悦状态，语气开心轻松",
    voice_style: "cheerful",
};

impl Mood {
    pub const ALL: [Mood; 6] = [
        Mood::Default,
        Mood::Upbeat,
        Mood::Angry,
        Mood::Depressed,
        Mood::Friendly,
        Mood::Cheerful,
    ];

    fn profile(self) -> &'static MoodProfile {
        match self {
            Mood::Default => &DEFAULT,
            Mood::Upbeat => &UPBEAT,
            Mood::Angry => &ANGRY,
            Mood::Depressed => &DEPRESSED,
            Mood::Friendly => &FRIENDLY,
            Mood::Cheerful => &CHEERFUL,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mood::Default => "default",
            Mood::Upbeat => "upbeat",
            Mood::Angry => "angry",
            Mood::Depressed => "depressed",
            Mood::Friendly => "friendly",
            Mood::Cheerful => "cheerful",
        }
    }

    pub fn role_set(self) -> &'static str {
        self.profile().role_set
    }

    pub fn description(self) -> &'static str {
        self.profile().description
    }

    pub fn voice_style(self) -> &'static str {
        self.profile().voice_style
    }

    /// Exact tag lookup, case-insensitive.
    pub fn from_tag(tag: &str) -> Option<Mood> {
        Mood::ALL.into_iter().find(|m| m.as_str().eq_ignore_ascii_case(tag))
    }

    /// Reads a tag out of raw model output: reasoning removed, surrounding
    /// punctuation and quotes ignored.
    pub fn parse_model_output(raw: &str) -> Option<Mood> {
        let cleaned = strip_reasoning(raw);
        Mood::from_tag(cleaned.trim_matches(|c: char| !c.is_ascii_alphabetic()))
    }

    /// Like `parse_model_output`, with anything unrecognised read as `Default`.
    pub fn from_model_output(raw: &str) -> Mood {
        Mood::parse_model_output(raw).unwrap_or_default()
    }
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct MoodClassifier {
    model: Arc<dyn ChatModel>,
    span: Span,
}

impl MoodClassifier {
    pub fn new(model: Arc<dyn ChatModel>, span: Span) -> Self {
        Self { model, span }
    }

    /// Never fails: model errors are logged and read as `Default`.
    pub async fn classify(&self, text: &str) -> Mood {
        let req = CompletionRequest::new(vec![ChatMessage::user(prompts::emotion_prompt(text))]);
        async {
            match self.model.complete(req).await {
                Ok(out) => match Mood::parse_model_output(&out.content) {
                    Some(mood) => {
                        tracing::debug!(raw = %out.content, %mood, "mood classified");
                        mood
                    }
                    None => {
                        metrics::counter!("oracle_mood_unrecognised_total").increment(1);
                        tracing::warn!(raw = %crate::text::preview(&out.content, 80), "unrecognised mood, using default");
                        Mood::Default
                    }
                },
                Err(e) => {
                    tracing::error!(error = %e, "mood classification failed");
                    Mood::Default
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }
}
