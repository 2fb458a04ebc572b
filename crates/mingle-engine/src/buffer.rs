use std::collections::HashSet;

use tracing::debug;

use mingle_core::types::ChatMessage;

use crate::{state::SentRecord, BUFFER_HARD_CAP};

/// Result of change detection against one layer's watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSet {
    /// The watermark was never set — the layer has not seen this target yet.
    FirstRun,
    /// Nothing after the watermark.
    Unchanged,
    /// Messages at `self.0..` are new. A trimmed-out watermark conservatively
    /// reports the whole buffer (`NewFrom(0)`).
    NewFrom(usize),
}

/// Per-target de-duplicated, size-capped, timestamp-sorted message sequence.
///
/// `seen` intentionally outlives trimmed messages so a re-pull of an already
/// summarized message is not re-inserted; it is rebuilt from the live
/// sequence once it exceeds three times the hard cap.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    messages: Vec<ChatMessage>,
    seen: HashSet<String>,
    /// Last rolling summary the gateway reported for this target.
    pub last_summary: Option<String>,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn messages_mut(&mut self) -> &mut [ChatMessage] {
        &mut self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn tail_id(&self) -> Option<String> {
        self.messages.last().and_then(|m| m.message_id.clone())
    }

    pub fn earliest_timestamp(&self) -> Option<&str> {
        self.messages.first().map(|m| m.timestamp.as_str())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.messages
            .iter()
            .any(|m| m.message_id.as_deref() == Some(id))
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.message_id.as_deref() == Some(id))
    }

    /// Append a batch idempotently by message id. Returns the ids actually
    /// inserted, in batch order. Messages without an id are ignored.
    pub fn append_batch(&mut self, batch: Vec<ChatMessage>) -> Vec<String> {
        let mut inserted = Vec::new();
        for msg in batch {
            let Some(id) = msg.message_id.clone() else {
                continue;
            };
            if self.seen.contains(&id) {
                continue;
            }
            self.seen.insert(id.clone());
            self.messages.push(msg);
            inserted.push(id);
        }
        if !inserted.is_empty() {
            self.resort();
            self.enforce_caps();
        }
        inserted
    }

    /// Re-inject locally cached sends the gateway's stream omitted.
    pub fn inject_sent(&mut self, records: &[SentRecord], self_id: &str) -> usize {
        let mut added = 0;
        for rec in records {
            if self.seen.contains(&rec.message_id) {
                continue;
            }
            self.seen.insert(rec.message_id.clone());
            self.messages.push(ChatMessage {
                message_id: Some(rec.message_id.clone()),
                timestamp: rec.timestamp.clone(),
                sender_id: self_id.to_string(),
                sender_name: String::new(),
                content: rec.content.clone(),
                is_at_me: false,
                is_self: true,
                images: Vec::new(),
            });
            added += 1;
        }
        if added > 0 {
            self.resort();
            self.enforce_caps();
        }
        added
    }

    /// Change detection for one layer's cursor.
    pub fn detect(&self, watermark: &Option<String>) -> ChangeSet {
        let Some(wm) = watermark else {
            return ChangeSet::FirstRun;
        };
        match self.index_of(wm) {
            Some(i) if i + 1 >= self.messages.len() => ChangeSet::Unchanged,
            Some(i) => ChangeSet::NewFrom(i + 1),
            // Trimmed out: everything currently buffered counts as new.
            None => {
                if self.messages.is_empty() {
                    ChangeSet::Unchanged
                } else {
                    ChangeSet::NewFrom(0)
                }
            }
        }
    }

    /// Drop entries older than the earlier of the two given watermarks,
    /// keeping at least `keep` messages below that cursor. Dropped ids stay
    /// in `seen` so a re-pull does not resurrect them. Returns dropped count.
    pub fn trim_before_watermarks(
        &mut self,
        observer_wm: &Option<String>,
        reply_wm: &Option<String>,
        keep: usize,
    ) -> usize {
        let indices: Vec<usize> = [observer_wm, reply_wm]
            .iter()
            .filter_map(|wm| wm.as_deref().and_then(|id| self.index_of(id)))
            .collect();
        if indices.len() < 2 {
            // Without both cursors placed there is nothing safely trimmable.
            return 0;
        }
        let fence = *indices.iter().min().unwrap();
        let cut = fence.saturating_sub(keep);
        if cut == 0 {
            return 0;
        }
        self.messages.drain(..cut);
        self.maybe_rebuild_seen();
        debug!(dropped = cut, "buffer trimmed below watermarks");
        cut
    }

    /// Count of messages at or below the earlier watermark, for deciding
    /// whether to request gateway-side compression.
    pub fn backlog_below_watermarks(
        &self,
        observer_wm: &Option<String>,
        reply_wm: &Option<String>,
    ) -> usize {
        [observer_wm, reply_wm]
            .iter()
            .filter_map(|wm| wm.as_deref().and_then(|id| self.index_of(id)))
            .min()
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    fn resort(&mut self) {
        // ISO-8601 timestamps compare correctly as strings.
        self.messages
            .sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    }

    fn enforce_caps(&mut self) {
        while self.messages.len() > BUFFER_HARD_CAP {
            let dropped = self.messages.remove(0);
            if let Some(id) = dropped.message_id {
                self.seen.remove(&id);
            }
        }
        self.maybe_rebuild_seen();
    }

    fn maybe_rebuild_seen(&mut self) {
        if self.seen.len() > 3 * BUFFER_HARD_CAP {
            self.seen = self
                .messages
                .iter()
                .filter_map(|m| m.message_id.clone())
                .collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, ts: &str) -> ChatMessage {
        ChatMessage {
            message_id: Some(id.to_string()),
            timestamp: ts.to_string(),
            sender_id: "u1".into(),
            sender_name: "u1".into(),
            content: format!("msg {id}"),
            is_at_me: false,
            is_self: false,
            images: Vec::new(),
        }
    }

    #[test]
    fn append_is_idempotent() {
        let mut buf = MessageBuffer::new();
        let batch = vec![msg("a", "2026-01-01T00:00:01Z"), msg("b", "2026-01-01T00:00:02Z")];
        assert_eq!(buf.append_batch(batch.clone()).len(), 2);
        assert_eq!(buf.append_batch(batch).len(), 0);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn appends_keep_timestamp_order() {
        let mut buf = MessageBuffer::new();
        buf.append_batch(vec![msg("b", "2026-01-01T00:00:02Z")]);
        buf.append_batch(vec![msg("a", "2026-01-01T00:00:01Z")]);
        let ids: Vec<_> = buf
            .messages()
            .iter()
            .map(|m| m.message_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn hard_cap_drops_oldest_and_forgets_their_ids() {
        let mut buf = MessageBuffer::new();
        for i in 0..(BUFFER_HARD_CAP + 25) {
            buf.append_batch(vec![msg(&format!("m{i:04}"), &format!("2026-01-01T00:{:02}:{:02}Z", i / 60, i % 60))]);
        }
        assert_eq!(buf.len(), BUFFER_HARD_CAP);
        assert!(!buf.contains("m0000"));
        // Dropped-by-cap ids may be re-appended.
        assert_eq!(
            buf.append_batch(vec![msg("m0000", "2026-01-01T00:00:00Z")]).len(),
            1
        );
    }

    #[test]
    fn detect_distinguishes_first_run_unchanged_and_new() {
        let mut buf = MessageBuffer::new();
        assert_eq!(buf.detect(&None), ChangeSet::FirstRun);
        buf.append_batch(vec![msg("a", "2026-01-01T00:00:01Z"), msg("b", "2026-01-01T00:00:02Z")]);
        assert_eq!(buf.detect(&Some("b".into())), ChangeSet::Unchanged);
        assert_eq!(buf.detect(&Some("a".into())), ChangeSet::NewFrom(1));
        // A trimmed-out watermark means "everything is new".
        assert_eq!(buf.detect(&Some("gone".into())), ChangeSet::NewFrom(0));
    }

    #[test]
    fn trim_keeps_a_floor_of_pre_watermark_messages() {
        let mut buf = MessageBuffer::new();
        for i in 0..100 {
            buf.append_batch(vec![msg(&format!("m{i:03}"), &format!("2026-01-01T00:{:02}:{:02}Z", i / 60, i % 60))]);
        }
        let observer = Some("m090".to_string());
        let reply = Some("m080".to_string());
        let dropped = buf.trim_before_watermarks(&observer, &reply, 30);
        // Earlier watermark is at index 80; keep 30 below it → cut 50.
        assert_eq!(dropped, 50);
        assert_eq!(buf.len(), 50);
        assert!(buf.contains("m080"));
        assert!(buf.contains("m050"));
        assert!(!buf.contains("m049"));
        // Trimmed ids are still remembered: a re-pull is ignored.
        assert_eq!(
            buf.append_batch(vec![msg("m049", "2026-01-01T00:00:49Z")]).len(),
            0
        );
    }

    #[test]
    fn sent_injection_tags_self_and_sorts() {
        let mut buf = MessageBuffer::new();
        buf.append_batch(vec![msg("a", "2026-01-01T00:00:01Z"), msg("c", "2026-01-01T00:00:03Z")]);
        let recs = vec![SentRecord {
            message_id: "local_1".into(),
            content: "me too".into(),
            timestamp: "2026-01-01T00:00:02Z".into(),
        }];
        assert_eq!(buf.inject_sent(&recs, "10001"), 1);
        assert_eq!(buf.inject_sent(&recs, "10001"), 0);
        let mid = &buf.messages()[1];
        assert!(mid.is_self);
        assert_eq!(mid.sender_id, "10001");
    }
}
