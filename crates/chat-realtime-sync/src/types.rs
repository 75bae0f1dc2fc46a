//! Message and conversation types shared by every delivery path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Type tag prefixed to AI-assistant participant identifiers.
pub const ASSISTANT_PREFIX: &str = "assistant:";

/// Build the participant identifier for an AI assistant.
pub fn assistant_participant(assistant_id: &str) -> String {
    if assistant_id.starts_with(ASSISTANT_PREFIX) {
        assistant_id.to_string()
    } else {
        format!("{ASSISTANT_PREFIX}{assistant_id}")
    }
}

/// True when the participant identifier refers to an AI assistant.
pub fn is_assistant(participant_id: &str) -> bool {
    participant_id.starts_with(ASSISTANT_PREFIX)
}

/// Authoritative message identifier assigned by storage.
///
/// Storage may hand out integer or string ids; both are kept as text so
/// comparisons never depend on the wire representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(String);

impl MessageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for MessageId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMessageId {
    Int(i64),
    Text(String),
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawMessageId::deserialize(deserializer)? {
            RawMessageId::Int(value) => Self::from(value),
            RawMessageId::Text(value) => Self(value),
        })
    }
}

/// A chat message as stored in the `messages` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Storage id; `None` for optimistic local inserts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    /// Chat type tag (e.g. "admin"), nullable in storage.
    #[serde(default)]
    pub chat_type: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a message that has not been acknowledged by storage yet.
    pub fn optimistic(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            content: content.into(),
            chat_type: None,
            is_read: false,
            created_at,
        }
    }

    /// Set the chat type tag.
    pub fn with_chat_type(mut self, chat_type: impl Into<String>) -> Self {
        self.chat_type = Some(chat_type.into());
        self
    }

    /// True when storage has assigned an id.
    pub fn is_authoritative(&self) -> bool {
        self.id.is_some()
    }

    /// True when `user_id` is the receiver and not also the sender.
    pub fn is_inbound_for(&self, user_id: &str) -> bool {
        self.receiver_id == user_id && self.sender_id != user_id
    }

    /// The conversation this message belongs to.
    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(&self.sender_id, &self.receiver_id)
    }
}

/// Unordered pair of participant identifiers naming one conversation.
///
/// `ConversationKey::new(a, b) == ConversationKey::new(b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    first: String,
    second: String,
}

impl ConversationKey {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        let (a, b) = (a.into(), b.into());
        if a <= b {
            Self { first: a, second: b }
        } else {
            Self { first: b, second: a }
        }
    }

    /// Conversation between a user and an AI assistant.
    pub fn with_assistant(user_id: &str, assistant_id: &str) -> Self {
        Self::new(user_id, assistant_participant(assistant_id))
    }

    /// Both participants, in normalized order.
    pub fn participants(&self) -> (&str, &str) {
        (&self.first, &self.second)
    }

    pub fn involves(&self, participant_id: &str) -> bool {
        self.first == participant_id || self.second == participant_id
    }

    /// The other participant, seen from `user_id`.
    pub fn counterpart_of(&self, user_id: &str) -> Option<&str> {
        if self.first == user_id {
            Some(&self.second)
        } else if self.second == user_id {
            Some(&self.first)
        } else {
            None
        }
    }

    /// Filesystem-safe key used to namespace local history.
    pub fn storage_key(&self) -> String {
        let sanitize = |s: &str| {
            s.chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
                .collect::<String>()
        };
        format!("chat_history_{}__{}", sanitize(&self.first), sanitize(&self.second))
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.first, self.second)
    }
}
