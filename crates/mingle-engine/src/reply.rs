//! L3 — the reply layer.
//!
//! Short-cycle per-target loop that actually speaks. New messages alone never
//! trigger it: the only ways to reach the LLM are the intent layer's wake
//! flag (willingness ≥ 3) or an unconsumed @-mention. A successful send locks
//! the intent gate so the agent re-evaluates before speaking again.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::debug;

use mingle_core::events::{LogLevel, PollStats};
use mingle_core::types::{ChatMessage, LurkMode};
use mingle_gateway::SendRequest;
use mingle_llm::Turn;

use crate::buffer::ChangeSet;
use crate::prompt::{
    build_system_prompt, build_turns, resolve_images, strip_turn_images, EphemeralTokens, LlmRole,
    SystemPromptInput, ThoughtBlock, TurnBuildInput,
};
use crate::runtime::Runtime;
use crate::state::{SentRecord, TargetState};
use crate::tool_loop::{run_tool_loop, ToolLoopRequest};
use crate::tools::{reply_tools, RoundRecorder};
use crate::SILENCE_MARKER;

const DETECT_SLEEP: Duration = Duration::from_secs(1);

/// Outcome of one reply iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyAction {
    Skipped,
    Replied,
    Silent,
    SendFailed,
    Error,
}

pub async fn run(rt: Arc<Runtime>, state: Arc<TargetState>) {
    let mut last_reply: Option<Instant> = None;
    loop {
        tokio::select! {
            _ = rt.cancel.cancelled() => break,
            _ = tokio::time::sleep(DETECT_SLEEP) => {}
        }
        if !rt.live() || !rt.has_target(state.id_str()) {
            break;
        }
        reply_once(&rt, &state, &mut last_reply).await;
    }
    debug!(target = %state.id_str(), "reply loop exited");
}

pub async fn reply_once(
    rt: &Runtime,
    state: &Arc<TargetState>,
    last_reply: &mut Option<Instant>,
) -> ReplyAction {
    if state.is_paused() {
        return ReplyAction::Skipped;
    }

    let config = rt.config();

    // Change detection and trigger scan under one buffer lock.
    let (change, tail_id, new_at_ids) = {
        let buffer = state.buffer.lock().unwrap();
        if buffer.is_empty() {
            return ReplyAction::Skipped;
        }
        let watermark = state.watermarks.lock().unwrap().reply.clone();
        let change = buffer.detect(&watermark);
        let consumed = state.consumed_at.lock().unwrap();
        let scan_from = match change {
            ChangeSet::FirstRun => 0,
            ChangeSet::NewFrom(i) => i,
            ChangeSet::Unchanged => buffer.len(),
        };
        let at_ids: Vec<String> = buffer.messages()[scan_from..]
            .iter()
            .filter(|m| m.is_at_me && !m.is_self)
            .filter_map(|m| m.message_id.clone())
            .filter(|id| !consumed.contains(id))
            .collect();
        (change, buffer.tail_id(), at_ids)
    };

    if change == ChangeSet::FirstRun {
        // Startup fence. Any pre-existing unconsumed mention is absorbed and
        // handed to the intent layer instead of being answered from history.
        if !new_at_ids.is_empty() {
            state.consume_at_ids(new_at_ids);
            state.flag_urgent();
        }
        state.watermarks.lock().unwrap().reply = tail_id;
        return ReplyAction::Skipped;
    }

    let at_triggered = !new_at_ids.is_empty();
    if at_triggered {
        // Defensive insert: a mention that reaches this point must never
        // re-trigger a later round.
        state.consume_at_ids(new_at_ids);
        state.flag_urgent();
    }

    let wake_flag = state.reply_wake.load(Ordering::SeqCst);
    if !at_triggered && !wake_flag {
        // New messages alone advance the fence and nothing else.
        if change != ChangeSet::Unchanged {
            state.watermarks.lock().unwrap().reply = tail_id;
        }
        return ReplyAction::Skipped;
    }

    // Lurk checks.
    match state.lurk_mode() {
        LurkMode::FullLurk => {
            state.reply_wake.store(false, Ordering::SeqCst);
            state.watermarks.lock().unwrap().reply = tail_id;
            return ReplyAction::Skipped;
        }
        LurkMode::SemiLurk if !at_triggered => {
            state.reply_wake.store(false, Ordering::SeqCst);
            state.watermarks.lock().unwrap().reply = tail_id;
            return ReplyAction::Skipped;
        }
        _ => {}
    }

    // Intent gate: wait for the next evaluation, or break the lock after the
    // safety timeout.
    if state.gate_blocks() {
        return ReplyAction::Skipped;
    }

    // Optional pacing between replies; an @-mention with instant-reply
    // enabled skips it.
    if config.reply_interval_secs > 0 && !(at_triggered && config.at_instant_reply) {
        if let Some(last) = last_reply {
            if last.elapsed() < Duration::from_secs(config.reply_interval_secs) {
                return ReplyAction::Skipped;
            }
        }
    }

    // This round consumes the wake flag.
    state.reply_wake.store(false, Ordering::SeqCst);

    let _slot = state.processor.lock().await;
    if !rt.live() {
        return ReplyAction::Skipped;
    }

    // The fence target is fixed before the LLM call: messages arriving while
    // the model thinks are not considered seen.
    let (mut snapshot, snapshot_wm) = {
        let buffer = state.buffer.lock().unwrap();
        (buffer.messages().to_vec(), buffer.tail_id())
    };
    resolve_images(&rt.deps.http, &mut snapshot).await;
    if !rt.live() {
        return ReplyAction::Skipped;
    }

    let thought = {
        let intent = state.intent.lock().unwrap();
        if intent.sleeping {
            ThoughtBlock::Sleeping
        } else {
            match intent.latest() {
                Some(entry) if !entry.idle => ThoughtBlock::Latest {
                    label: entry.label.clone(),
                    content: entry.content.clone(),
                },
                _ => ThoughtBlock::Sleeping,
            }
        }
    };

    let tokens = EphemeralTokens::generate();
    let consumed = state.consumed_at.lock().unwrap().clone();
    let recorder = RoundRecorder::new();

    let action = run_reply_llm(
        rt,
        state,
        &config,
        &snapshot,
        &consumed,
        &tokens,
        thought,
        &recorder,
    )
    .await;

    if !rt.live() {
        return ReplyAction::Skipped;
    }

    // Record anything that actually went out, regardless of how the round
    // ended.
    let sent = recorder.take_sent();
    if !sent.is_empty() {
        state.sent_cache.lock().unwrap().extend(sent);
    }

    match action {
        ReplyAction::Replied => {
            *last_reply = Some(Instant::now());
            state.watermarks.lock().unwrap().reply = snapshot_wm;
            state.lock_gate();
            rt.bus
                .log(LogLevel::Info, Some(state.id_str()), "gate locked", None);
            let mut intent = state.intent.lock().unwrap();
            intent.force_eval = true;
            intent.sleeping = false;
            drop(intent);
            state.wake.notify_one();
        }
        ReplyAction::Silent => {
            state.watermarks.lock().unwrap().reply = snapshot_wm;
        }
        ReplyAction::SendFailed => {
            // Fence untouched and the wake flag re-armed: the same messages
            // retry on the next tick.
            state.reply_wake.store(true, Ordering::SeqCst);
        }
        // Errors leave the fence alone; the next authorization retriggers.
        ReplyAction::Error | ReplyAction::Skipped => {}
    }
    action
}

/// Run the reply tool loop, with one image-stripped retry (some back-ends
/// 500 on particular attachments).
#[allow(clippy::too_many_arguments)]
async fn run_reply_llm(
    rt: &Runtime,
    state: &Arc<TargetState>,
    config: &mingle_core::config::SocialConfig,
    snapshot: &[ChatMessage],
    consumed: &HashSet<String>,
    tokens: &EphemeralTokens,
    thought: ThoughtBlock,
    recorder: &Arc<RoundRecorder>,
) -> ReplyAction {
    let system = build_system_prompt(&SystemPromptInput {
        role: LlmRole::Reply,
        config,
        docs: &rt.deps.docs,
        target: &state.target,
        lurk: state.lurk_mode(),
        tokens,
        intent: None,
    });
    let turns = build_turns(&TurnBuildInput {
        messages: snapshot,
        tokens,
        consumed,
        config,
        role: LlmRole::Reply,
        include_images: true,
        current_thought: Some(thought),
    });
    let prompt_chars = system.len() + turns.iter().map(|t| t.text().len()).sum::<usize>();

    let external = external_tools(rt, config).await;

    let mut attempt_turns = turns;
    for attempt in 0..2 {
        let request = ToolLoopRequest {
            model: config.model.clone(),
            system: system.clone(),
            turns: attempt_turns.clone(),
            builtin: reply_tools(&rt.deps.docs, state, &rt.deps.gateway, tokens, recorder),
            external: external.clone(),
            max_tokens: 2048,
            temperature: None,
        };

        let transform = send_arg_transform(tokens.clone());
        let result = run_tool_loop(
            rt.deps.backend.as_ref(),
            &rt.deps.bridge,
            request,
            &config.tool_iteration_caps,
            &rt.cancel,
            Some(&transform),
        )
        .await;

        match result {
            Ok(outcome) => {
                let action =
                    interpret_outcome(rt, state, tokens, recorder, &outcome.response).await;
                rt.bus.poll_round(
                    state.id_str(),
                    &PollStats {
                        chat_messages: snapshot.len(),
                        input_prompt: prompt_chars,
                        llm_iters: outcome.iterations,
                        sent_messages: recorder.successes(),
                        tool_calls: outcome.tool_calls,
                        action: action_name(action).into(),
                        role: "reply".into(),
                    },
                );
                return action;
            }
            Err(e) if attempt == 0 && recorder.successes() == 0 => {
                // Plan B: strip every image and retry once.
                rt.bus.warn(
                    Some(state.id_str()),
                    format!("reply LLM call failed, retrying without images: {e}"),
                );
                attempt_turns = strip_turn_images(&attempt_turns);
            }
            Err(e) => {
                // A send that already went out wins over the late failure.
                if recorder.successes() > 0 {
                    return ReplyAction::Replied;
                }
                rt.bus
                    .error(Some(state.id_str()), format!("reply LLM call failed: {e}"));
                return ReplyAction::Error;
            }
        }
    }
    ReplyAction::Error
}

/// Interpret the final tool-loop response into a round outcome, including
/// the plain-text auto-send fallback.
async fn interpret_outcome(
    rt: &Runtime,
    state: &Arc<TargetState>,
    tokens: &EphemeralTokens,
    recorder: &Arc<RoundRecorder>,
    response: &mingle_llm::ChatResponse,
) -> ReplyAction {
    if recorder.successes() > 0 {
        return ReplyAction::Replied;
    }
    if recorder.attempts() > 0 {
        return ReplyAction::SendFailed;
    }

    let text = tokens.strip(&response.content);
    let text = text.trim();
    if text.is_empty() || text.starts_with(SILENCE_MARKER) {
        return ReplyAction::Silent;
    }

    // The model spoke outside the tool. Deduplicate and send it ourselves.
    let content = dedup_utterance(text);
    let req = SendRequest {
        target: state.id_str().to_string(),
        target_type: state.target.kind,
        content: content.clone(),
        num_chunks: 1,
    };
    match rt.deps.gateway.send_message(&req).await {
        Ok(outcome) if outcome.success => {
            let now_ms = chrono::Utc::now().timestamp_millis();
            state.sent_cache.lock().unwrap().push(SentRecord {
                message_id: outcome
                    .message_id
                    .unwrap_or_else(|| ChatMessage::local_id(now_ms)),
                content,
                timestamp: outcome
                    .timestamp
                    .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
            });
            rt.bus.info(
                Some(state.id_str()),
                "plain-text reply auto-sent through the gateway",
            );
            ReplyAction::Replied
        }
        Ok(_) | Err(_) => {
            rt.bus
                .warn(Some(state.id_str()), "auto-send of plain-text reply failed");
            ReplyAction::SendFailed
        }
    }
}

fn action_name(action: ReplyAction) -> &'static str {
    match action {
        ReplyAction::Replied => "replied",
        ReplyAction::Silent => "silent",
        ReplyAction::SendFailed => "send_failed",
        ReplyAction::Error => "error",
        ReplyAction::Skipped => "skipped",
    }
}

/// External tools the user enabled for the reply role.
async fn external_tools(
    rt: &Runtime,
    config: &mingle_core::config::SocialConfig,
) -> Vec<mingle_gateway::ExternalTool> {
    let mut out = Vec::new();
    for server in &config.enabled_tool_servers {
        match rt.deps.bridge.list_tools(server).await {
            Ok(defs) => out.extend(defs.into_iter().map(|def| mingle_gateway::ExternalTool {
                server: server.clone(),
                def,
            })),
            Err(e) => {
                debug!(server = %server, error = %e, "external tool listing failed");
            }
        }
    }
    out
}

/// Force send targets and strip ephemeral tokens from any content argument.
/// The model never chooses where a message goes.
fn send_arg_transform(tokens: EphemeralTokens) -> impl Fn(&str, Value) -> Value + Send + Sync {
    move |_tool: &str, mut args: Value| {
        if let Some(content) = args.get("content").and_then(|v| v.as_str()) {
            let stripped = tokens.strip(content);
            args["content"] = json!(stripped);
        }
        // The send tool overwrites target fields itself; drop any the model
        // tried to smuggle in.
        if let Some(obj) = args.as_object_mut() {
            obj.remove("target");
            obj.remove("target_type");
        }
        args
    }
}

/// Strip within-utterance duplication: repeated sentences when punctuation
/// is present, immediate word repeats otherwise.
pub fn dedup_utterance(text: &str) -> String {
    const DELIMS: &[char] = &['。', '！', '？', '!', '?', '.', '；', ';', '…', '\n'];

    if text.contains(DELIMS) {
        let mut seen: HashSet<String> = HashSet::new();
        let mut out = String::new();
        let mut current = String::new();
        for c in text.chars() {
            current.push(c);
            if DELIMS.contains(&c) {
                flush_sentence(&mut current, &mut seen, &mut out);
            }
        }
        flush_sentence(&mut current, &mut seen, &mut out);
        out.trim().to_string()
    } else {
        let mut out: Vec<&str> = Vec::new();
        for word in text.split_whitespace() {
            if out.last() != Some(&word) {
                out.push(word);
            }
        }
        out.join(" ")
    }
}

fn flush_sentence(current: &mut String, seen: &mut HashSet<String>, out: &mut String) {
    if current.is_empty() {
        return;
    }
    let key: String = current
        .trim()
        .trim_end_matches(['。', '！', '？', '!', '?', '.', '；', ';', '…'])
        .to_string();
    if key.is_empty() || seen.insert(key) {
        out.push_str(current);
    }
    current.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_sentences_collapse() {
        let text = "今天好热。今天好热。出去吃点凉的？";
        assert_eq!(dedup_utterance(text), "今天好热。出去吃点凉的？");
    }

    #[test]
    fn distinct_sentences_survive() {
        let text = "早上好！吃了吗？我先去上班了。";
        assert_eq!(dedup_utterance(text), text);
    }

    #[test]
    fn word_level_dedup_without_punctuation() {
        assert_eq!(dedup_utterance("哈哈 哈哈 好啊"), "哈哈 好啊");
        assert_eq!(dedup_utterance("ok ok ok fine"), "ok fine");
    }

    #[test]
    fn unpunctuated_single_run_is_untouched() {
        assert_eq!(dedup_utterance("就一句话"), "就一句话");
    }
}
