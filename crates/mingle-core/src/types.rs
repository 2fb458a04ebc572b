use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a watched chat room or direct-message counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetId(pub String);

impl TargetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TargetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Whether a target is a group room or a one-to-one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Group,
    Direct,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Group => write!(f, "group"),
            TargetKind::Direct => write!(f, "direct"),
        }
    }
}

/// A watched conversation. Created from config at engine start, dropped at stop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub kind: TargetKind,
}

impl Target {
    pub fn group(id: impl Into<TargetId>) -> Self {
        Self {
            id: id.into(),
            kind: TargetKind::Group,
        }
    }

    pub fn direct(id: impl Into<TargetId>) -> Self {
        Self {
            id: id.into(),
            kind: TargetKind::Direct,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// An image attached to a specific message.
///
/// `data` is either a base64 payload or an HTTP(S) URL; URLs are resolved to
/// base64 only at prompt-assembly time because several LLM back-ends cannot
/// reach the gateway's content hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub data: String,
    pub mime: String,
}

impl ImageRef {
    pub fn is_url(&self) -> bool {
        self.data.starts_with("http://") || self.data.starts_with("https://")
    }
}

/// One chat message inside a target's buffer.
///
/// Immutable once buffered, except for the two sanitization mutations applied
/// to consumed @-mentions (content rewrite + `is_at_me` clear).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique within one target's buffer. Absent only for locally cached
    /// sends before an id is synthesized.
    pub message_id: Option<String>,
    /// ISO-8601; monotone non-decreasing within a target under normal
    /// gateway behaviour.
    pub timestamp: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub is_at_me: bool,
    pub is_self: bool,
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

impl ChatMessage {
    /// Synthesize the id used for locally cached sends.
    pub fn local_id(unix_millis: i64) -> String {
        format!("local_{unix_millis}")
    }
}

/// Per-target participation behaviour. `Normal` talks, `SemiLurk` talks only
/// when @-mentioned, `FullLurk` observes without ever sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LurkMode {
    #[default]
    Normal,
    SemiLurk,
    FullLurk,
}

impl fmt::Display for LurkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LurkMode::Normal => write!(f, "normal"),
            LurkMode::SemiLurk => write!(f, "semi-lurk"),
            LurkMode::FullLurk => write!(f, "full-lurk"),
        }
    }
}

impl std::str::FromStr for LurkMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "normal" => Ok(LurkMode::Normal),
            "semi-lurk" => Ok(LurkMode::SemiLurk),
            "full-lurk" => Ok(LurkMode::FullLurk),
            other => Err(format!("unknown lurk mode: {other}")),
        }
    }
}
