use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use mingle_core::events::{EngineEvent, LogEntry, LogLevel, PollStats};

/// Bounded retention of recent log entries for the query surface.
const LOG_RING_CAP: usize = 500;
/// Broadcast channel depth; slow subscribers lose oldest events.
const BUS_CAPACITY: usize = 256;

/// In-process observability bus.
///
/// Every entry is mirrored to `tracing` and retained in a bounded ring for
/// attached frontends that query instead of subscribing.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    logs: Mutex<VecDeque<LogEntry>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            logs: Mutex::new(VecDeque::with_capacity(LOG_RING_CAP)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        // No receivers is fine — the ring still captures log entries.
        let _ = self.tx.send(event);
    }

    pub fn log(
        &self,
        level: LogLevel,
        target: Option<&str>,
        message: impl Into<String>,
        details: Option<String>,
    ) {
        let mut entry = LogEntry::new(level, message);
        if let Some(t) = target {
            entry = entry.with_target(t);
        }
        if let Some(d) = details {
            entry = entry.with_details(d);
        }

        match level {
            LogLevel::Error => error!(target: "mingle", tgt = ?entry.target, "{}", entry.message),
            LogLevel::Warn => warn!(target: "mingle", tgt = ?entry.target, "{}", entry.message),
            LogLevel::Debug => debug!(target: "mingle", tgt = ?entry.target, "{}", entry.message),
            _ => info!(target: "mingle", tgt = ?entry.target, level = %entry.level, "{}", entry.message),
        }

        {
            let mut logs = self.logs.lock().unwrap();
            if logs.len() == LOG_RING_CAP {
                logs.pop_front();
            }
            logs.push_back(entry.clone());
        }
        self.emit(EngineEvent::Log(entry));
    }

    pub fn info(&self, target: Option<&str>, message: impl Into<String>) {
        self.log(LogLevel::Info, target, message, None);
    }

    pub fn warn(&self, target: Option<&str>, message: impl Into<String>) {
        self.log(LogLevel::Warn, target, message, None);
    }

    pub fn error(&self, target: Option<&str>, message: impl Into<String>) {
        self.log(LogLevel::Error, target, message, None);
    }

    /// Aggregated per-round entry for one LLM round.
    pub fn poll_round(&self, target: &str, stats: &PollStats) {
        let details = serde_json::to_string(stats).unwrap_or_default();
        self.log(
            LogLevel::Poll,
            Some(target),
            format!("{} round: {}", stats.role, stats.action),
            Some(details),
        );
    }

    /// Recent entries, optionally filtered to one target, newest last.
    pub fn recent(&self, target: Option<&str>, limit: usize) -> Vec<LogEntry> {
        let logs = self.logs.lock().unwrap();
        let filtered: Vec<LogEntry> = logs
            .iter()
            .filter(|e| target.map_or(true, |t| e.target.as_deref() == Some(t)))
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }

    pub fn clear(&self) {
        self.logs.lock().unwrap().clear();
    }

    /// True when any retained entry contains `needle` (test helper for
    /// asserting on gate transitions and round outcomes).
    pub fn has_message_containing(&self, needle: &str) -> bool {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.message.contains(needle))
    }

    pub fn count_messages_containing(&self, needle: &str) -> usize {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.message.contains(needle))
            .count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
