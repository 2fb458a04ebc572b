use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::types::LurkMode;

/// Severity/channel of a log entry emitted on the engine bus.
///
/// `Memory`, `Intent` and `Poll` are functional channels rather than
/// severities: document writes, willingness evaluations and per-round
/// aggregates respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Memory,
    Intent,
    Poll,
    Debug,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Memory => "memory",
            LogLevel::Intent => "intent",
            LogLevel::Poll => "poll",
            LogLevel::Debug => "debug",
        };
        write!(f, "{s}")
    }
}

/// One append-only log record for attached reporting frontends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            level,
            message: message.into(),
            details: None,
            target: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Aggregated data for one LLM round, attached to a `poll`-level entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollStats {
    /// Buffer messages visible to the round.
    pub chat_messages: usize,
    /// Characters of assembled prompt input.
    pub input_prompt: usize,
    /// Request/response cycles the tool loop ran.
    pub llm_iters: usize,
    pub sent_messages: usize,
    pub tool_calls: usize,
    /// Outcome: replied / silent / send_failed / error / observed / evaluated.
    pub action: String,
    /// Which role ran: observer / reply / intent.
    pub role: String,
}

/// Events the engine broadcasts to attached frontends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EngineEvent {
    Log(LogEntry),
    StatusChanged { running: bool },
    LurkModeChanged { target: String, mode: LurkMode },
    TargetPausedChanged { target: String, paused: bool },
    TargetNamesChanged { target: String, name: String },
}
