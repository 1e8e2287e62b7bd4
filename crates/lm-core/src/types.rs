use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Content kind vocabulary shared by session configuration ("which inputs
/// does this session expect") and model capability reporting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Text,
    Image,
    Audio,
}

/// Opaque reference to media that was decoded and validated elsewhere.
///
/// The session core never inspects media bytes; it only carries the handle
/// through to the inference engine and charges it against the token budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaRef {
    /// Identifier assigned by the media pipeline.
    pub id: String,
    /// MIME type as reported by the decoder (e.g. "image/png").
    pub media_type: String,
    /// Decoded payload size in bytes.
    pub byte_len: u64,
}

/// A part of a turn's content (text, image reference, audio reference).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { source: MediaRef },
    Audio { source: MediaRef },
}

impl ContentPart {
    /// Create a text content part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Get text content if this is a text part.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn kind(&self) -> InputKind {
        match self {
            Self::Text { .. } => InputKind::Text,
            Self::Image { .. } => InputKind::Image,
            Self::Audio { .. } => InputKind::Audio,
        }
    }
}

/// An un-counted turn as supplied by the caller (initial prompts, prompt
/// input, engine responses). Token accounting happens when a spec is
/// committed into a [`Turn`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnSpec {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl TurnSpec {
    pub fn new(role: Role, parts: Vec<ContentPart>) -> Self {
        Self { role, parts }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentPart::text(text)])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentPart::text(text)])
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// One committed exchange unit in a conversation.
///
/// Turns are immutable once created and are shared as `Arc<Turn>`: cloning
/// a session shares the turn data while each history store keeps its own
/// ordering and accounting. `token_count` is computed at insertion time and
/// never changes afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub role: Role,
    pub parts: Vec<ContentPart>,
    /// Tokens this turn consumes, including control-token overhead.
    pub token_count: u32,
    /// True only for the session's system turn.
    pub pinned: bool,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    /// Commit a spec into an immutable turn with its computed token count.
    /// The system turn is the only pinned turn.
    pub fn from_spec(spec: TurnSpec, token_count: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: spec.role,
            parts: spec.parts,
            token_count,
            pinned: spec.role == Role::System,
            created_at: Utc::now(),
        }
    }

    pub fn system(text: impl Into<String>, token_count: u32) -> Self {
        Self::from_spec(TurnSpec::system(text), token_count)
    }

    pub fn user(text: impl Into<String>, token_count: u32) -> Self {
        Self::from_spec(TurnSpec::user(text), token_count)
    }

    pub fn assistant(text: impl Into<String>, token_count: u32) -> Self {
        Self::from_spec(TurnSpec::assistant(text), token_count)
    }

    /// All text parts concatenated.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| p.as_text())
            .collect::<Vec<_>>()
            .join("")
    }
}
