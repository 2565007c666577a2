//! Conversation session: identity plus the ordered, append-only turn history.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity token for one conversation. Stable for the lifetime of the process and used
/// as the key for remote history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// `session_<unix millis>`, the same shape the web client used.
    pub fn generate() -> Self {
        Self(format!("session_{}", Utc::now().timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    System,
}

/// One finalized utterance. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub emotion: Option<String>,
    pub intent: Option<String>,
    pub confidence: Option<f32>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            emotion: None,
            intent: None,
            confidence: None,
        }
    }

    pub fn system(text: impl Into<String>, emotion: Option<String>, intent: Option<String>) -> Self {
        Self {
            role: Role::System,
            text: text.into(),
            emotion,
            intent,
            confidence: None,
        }
    }

    pub fn with_confidence(mut self, confidence: Option<f32>) -> Self {
        self.confidence = confidence;
        self
    }
}

/// One entry of `GET /api/history/{session_id}`. Older records carry `ai_response`
/// instead of `text`, and the assistant role is spelled `ai`.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub ai_response: Option<String>,
    #[serde(default)]
    pub emotion: Option<String>,
    #[serde(default)]
    pub intent: Option<String>,
}

impl HistoryEntry {
    /// Entries with no usable text are skipped.
    pub fn into_turn(self) -> Option<Turn> {
        let text = self.text.or(self.ai_response)?;
        if text.trim().is_empty() {
            return None;
        }
        let role = if self.role.eq_ignore_ascii_case("user") {
            Role::User
        } else {
            Role::System
        };
        Some(Turn {
            role,
            text,
            emotion: self.emotion,
            intent: self.intent,
            confidence: None,
        })
    }
}

/// Identity plus ordered turns. Insertion order is conversational order.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    turns: Vec<Turn>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            turns: Vec::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub(crate) fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Pre-populate from remote history. Only valid before any live turn exists;
    /// returns the number of turns added.
    pub fn hydrate(&mut self, entries: Vec<HistoryEntry>) -> usize {
        if !self.turns.is_empty() {
            tracing::warn!(session_id = %self.id, "History hydration skipped: session already has turns");
            return 0;
        }
        self.turns
            .extend(entries.into_iter().filter_map(HistoryEntry::into_turn));
        self.turns.len()
    }
}
