use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Groups every utterance of one conversation. Minted once per process, never changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(format!("voxloop_session_{}", Utc::now().timestamp_millis()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
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
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Voice,
}

/// One role's contribution to a turn. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    pub role: Role,
    pub modality: Modality,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub session: SessionId,
}

/// `{role, content}` pair sent to the Conversation Service as prior context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Utterance> for ChatMessage {
    fn from(utterance: &Utterance) -> Self {
        Self {
            role: utterance.role,
            content: utterance.content.clone(),
        }
    }
}

/// The live session: its id plus a clock that keeps utterance timestamps strictly
/// increasing even when two turns complete within the same clock tick.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    last_stamp: Mutex<Option<DateTime<Utc>>>,
}

impl Session {
    #[must_use]
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            last_stamp: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn utterance(
        &self,
        role: Role,
        modality: Modality,
        content: impl Into<String>,
        audio_ref: Option<String>,
    ) -> Utterance {
        Utterance {
            role,
            modality,
            content: content.into(),
            audio_ref,
            created_at: self.stamp(),
            session: self.id.clone(),
        }
    }

    fn stamp(&self) -> DateTime<Utc> {
        let mut last = self
            .last_stamp
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Utc::now();
        let stamp = match *last {
            Some(prev) if now <= prev => prev + TimeDelta::microseconds(1),
            _ => now,
        };
        *last = Some(stamp);
        stamp
    }
}
