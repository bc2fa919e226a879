use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::ChatMessage;
use crate::mood::Mood;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), created_at: Utc::now() }
    }

    pub fn to_chat(&self) -> ChatMessage {
        match self.role {
            Role::System => ChatMessage::system(self.content.clone()),
            Role::User => ChatMessage::user(self.content.clone()),
            Role::Assistant => ChatMessage::assistant(self.content.clone()),
        }
    }
}

/// In-memory view of one chat session. History itself lives in the store;
/// this carries identity and the mood that colors the next prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: String,
    pub mood: Mood,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), mood: Mood::default() }
    }

    /// Assigns the mood and reports whether it changed.
    pub fn set_mood(&mut self, mood: Mood) -> bool {
        let changed = self.mood != mood;
        self.mood = mood;
        changed
    }
}
