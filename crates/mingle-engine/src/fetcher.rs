//! L1 — the fetch layer.
//!
//! One timer for the whole engine. Every tick it batch-pulls recent messages
//! for every target, merges them idempotently into per-target buffers, and
//! archives rolling-summary deltas to disk. It is the only writer of the
//! message buffers.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::debug;

use mingle_core::config::SocialConfig;
use mingle_core::events::LogLevel;
use mingle_core::types::ChatMessage;
use mingle_gateway::TargetBlock;

use crate::runtime::Runtime;
use crate::state::TargetState;
use crate::{BUFFER_COMPRESS_THRESHOLD, FETCH_BATCH_LIMIT};

pub async fn run(rt: std::sync::Arc<Runtime>) {
    loop {
        let interval = Duration::from_secs(rt.config().poll_interval_secs.max(1));
        tokio::select! {
            _ = rt.cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if !rt.live() {
            break;
        }
        poll_once(&rt).await;
    }
    debug!("fetcher loop exited");
}

/// One fetch round. A gateway-level failure aborts the whole round without
/// advancing anything; per-target errors only skip their own block.
pub async fn poll_once(rt: &Runtime) {
    let config = rt.config();
    let targets = config.targets();
    if targets.is_empty() {
        return;
    }

    let blocks = match rt
        .deps
        .gateway
        .batch_recent(&targets, FETCH_BATCH_LIMIT)
        .await
    {
        Ok(blocks) => blocks,
        Err(e) => {
            rt.bus
                .warn(None, format!("batch context fetch failed: {e}"));
            return;
        }
    };

    if !rt.live() {
        return;
    }

    for block in blocks {
        handle_block(rt, &config, block);
    }
}

fn handle_block(rt: &Runtime, config: &SocialConfig, block: TargetBlock) {
    let Some(state) = rt.target(&block.target) else {
        return;
    };
    let target_id = block.target.clone();

    if let Some(err) = block.error.as_deref().filter(|e| !e.is_empty()) {
        rt.bus.warn(
            Some(target_id.as_str()),
            format!("gateway reported target error: {err}"),
        );
        return;
    }

    if let Some(name) = block.display_name() {
        rt.cache_name(&target_id, name);
    }

    let first_pull = !state.first_pull_done.load(Ordering::SeqCst);
    let incoming: Vec<ChatMessage> = block.messages.into_iter().map(Into::into).collect();

    let (inserted, injected) = {
        let sent = state.sent_cache.lock().unwrap().clone();
        let mut buffer = state.buffer.lock().unwrap();
        let inserted = buffer.append_batch(incoming);
        let injected = buffer.inject_sent(&sent, &config.self_id);
        (inserted, injected)
    };
    let added = inserted.len() + injected;

    if first_pull {
        // Startup guard: everything already @-mentioning the agent in the
        // first successful pull is history, not a request to answer now.
        let historical_at: Vec<String> = {
            let buffer = state.buffer.lock().unwrap();
            buffer
                .messages()
                .iter()
                .filter(|m| m.is_at_me && !m.is_self)
                .filter_map(|m| m.message_id.clone())
                .collect()
        };
        let absorbed = state.consume_at_ids(historical_at);
        state.first_pull_done.store(true, Ordering::SeqCst);
        if absorbed > 0 {
            rt.bus.info(
                Some(target_id.as_str()),
                format!("first pull: absorbed {absorbed} historical @-mentions"),
            );
        }
    } else if !inserted.is_empty() {
        let urgent: Vec<String> = {
            let buffer = state.buffer.lock().unwrap();
            let consumed = state.consumed_at.lock().unwrap();
            buffer
                .messages()
                .iter()
                .filter(|m| {
                    m.is_at_me
                        && !m.is_self
                        && m.message_id
                            .as_deref()
                            .map(|id| inserted.iter().any(|i| i.as_str() == id) && !consumed.contains(id))
                            .unwrap_or(false)
                })
                .filter_map(|m| m.message_id.clone())
                .collect()
        };
        if !urgent.is_empty() {
            state.consume_at_ids(urgent);
            state.flag_urgent();
            rt.bus.log(
                LogLevel::Intent,
                Some(target_id.as_str()),
                "urgent @-mention: forcing intent evaluation",
                None,
            );
        }
    }

    if added > 0 {
        state.mark_activity();
        debug!(target = %target_id, added, "buffer extended");
    }

    if let Some(summary) = block
        .compressed_summary
        .as_deref()
        .filter(|s| !s.is_empty())
    {
        handle_summary(rt, &state, summary);
    }
}

/// Archive the summary delta and trim the buffer below the slower of the
/// observer/reply watermarks.
fn handle_summary(rt: &Runtime, state: &TargetState, summary: &str) {
    let delta = {
        let buffer = state.buffer.lock().unwrap();
        match &buffer.last_summary {
            Some(prev) if prev == summary => None,
            Some(prev) => Some(summary_delta(prev, summary).to_string()),
            None => Some(summary.to_string()),
        }
    };
    let Some(delta) = delta else {
        return;
    };

    let now = chrono::Utc::now().to_rfc3339();
    if let Err(e) = rt
        .deps
        .docs
        .append_group_buffer(state.id_str(), &now, delta.trim())
    {
        rt.bus.warn(
            Some(state.id_str()),
            format!("group archive append failed: {e}"),
        );
    } else {
        rt.bus.log(
            LogLevel::Memory,
            Some(state.id_str()),
            "rolling summary archived",
            None,
        );
    }

    let dropped = {
        let watermarks = state.watermarks.lock().unwrap().clone();
        let mut buffer = state.buffer.lock().unwrap();
        buffer.last_summary = Some(summary.to_string());
        buffer.trim_before_watermarks(
            &watermarks.observer,
            &watermarks.reply,
            BUFFER_COMPRESS_THRESHOLD,
        )
    };
    if dropped > 0 {
        state.prune_consumed();
        state.prune_sent_cache();
    }
}

/// A summary that extends the previous one only contributes its suffix;
/// anything else is archived in full.
fn summary_delta<'a>(prev: &str, new: &'a str) -> &'a str {
    match new.strip_prefix(prev) {
        Some(suffix) if !suffix.is_empty() => suffix,
        _ => new,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_extension_yields_only_the_suffix() {
        assert_eq!(summary_delta("abc", "abcdef"), "def");
    }

    #[test]
    fn rewritten_summary_is_archived_in_full() {
        assert_eq!(summary_delta("abc", "xyz"), "xyz");
        assert_eq!(summary_delta("abc", "ab"), "ab");
    }

    #[test]
    fn identical_summary_yields_itself() {
        // handle_summary filters the equal case before delta computation;
        // the raw helper falls back to the full text.
        assert_eq!(summary_delta("abc", "abc"), "abc");
    }
}
