//! L4 — the intent layer.
//!
//! Per-target loop producing a compact "current thought + willingness 1–5"
//! on a cadence driven by message arrival rather than wall-clock. Its output
//! is the sole authority for Reply to speak without an @-mention.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use mingle_core::events::{LogLevel, PollStats};
use mingle_core::types::LurkMode;
use mingle_llm::ChatRequest;

use crate::buffer::ChangeSet;
use crate::prompt::{
    build_system_prompt, build_turns, EphemeralTokens, IntentPromptExtra, LlmRole,
    SystemPromptInput, TurnBuildInput, WILLINGNESS_TAGS,
};
use crate::runtime::Runtime;
use crate::state::{IntentEntry, TargetState};
use crate::{INTENT_CONTEXT_MESSAGES, INTENT_EVAL_COOLDOWN, INTENT_IDLE_TIMEOUT,
    INTENT_LLM_MAX_RETRIES};

/// Interruptible wait between checks; a force-wake resolves it immediately.
const CHECK_SLEEP: Duration = Duration::from_millis(500);
/// Delay between intent LLM retry attempts.
const RETRY_DELAY: Duration = Duration::from_secs(2);
/// Willingness at or above this sets the reply wake flag.
const WAKE_THRESHOLD: u8 = 3;

/// Why an evaluation ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalKind {
    Normal,
    /// Fresh unconsumed @-mention; bypasses every cooldown.
    Urgent,
    /// The agent just spoke; willingness is pushed down unless engaged.
    AfterSend,
    /// Idle-timeout evaluation; the loop sleeps afterwards.
    Final,
}

pub async fn run(rt: Arc<Runtime>, state: Arc<TargetState>) {
    loop {
        tokio::select! {
            _ = rt.cancel.cancelled() => break,
            _ = state.wake.notified() => {}
            _ = tokio::time::sleep(CHECK_SLEEP) => {}
        }
        if !rt.live() || !rt.has_target(state.id_str()) {
            break;
        }
        intent_tick(&rt, &state).await;
    }
    debug!(target = %state.id_str(), "intent loop exited");
}

/// One scheduling decision. Returns the evaluation kind that ran, if any.
pub async fn intent_tick(rt: &Runtime, state: &Arc<TargetState>) -> Option<EvalKind> {
    if state.buffer.lock().unwrap().is_empty() {
        return None;
    }

    let (sleeping, urgent, force, last_activity, last_eval) = {
        let intent = state.intent.lock().unwrap();
        (
            intent.sleeping,
            intent.urgent_at_me,
            intent.force_eval,
            intent.last_activity,
            intent.last_eval,
        )
    };

    let has_new = {
        let buffer = state.buffer.lock().unwrap();
        let watermark = state.watermarks.lock().unwrap().intent.clone();
        !matches!(buffer.detect(&watermark), ChangeSet::Unchanged)
    };

    if sleeping {
        if urgent || force || has_new {
            state.intent.lock().unwrap().sleeping = false;
        } else {
            return None;
        }
    }

    if urgent {
        state.intent.lock().unwrap().urgent_at_me = false;
        return evaluate(rt, state, EvalKind::Urgent).await;
    }

    if force {
        state.intent.lock().unwrap().force_eval = false;
        return evaluate(rt, state, EvalKind::AfterSend).await;
    }

    // Idle timeout: one final evaluation, then sleep until activity.
    if let Some(activity) = last_activity {
        if activity.elapsed() >= INTENT_IDLE_TIMEOUT {
            let ran = evaluate(rt, state, EvalKind::Final).await;
            if ran.is_some() {
                let mut intent = state.intent.lock().unwrap();
                intent.sleeping = true;
                rt.bus.log(
                    LogLevel::Intent,
                    Some(state.id_str()),
                    "no activity, intent going to sleep",
                    None,
                );
            }
            return ran;
        }
    }

    let cooldown_elapsed = last_eval.map_or(true, |t| t.elapsed() >= INTENT_EVAL_COOLDOWN);
    let should_eval = match state.lurk_mode() {
        LurkMode::Normal => has_new || cooldown_elapsed,
        LurkMode::SemiLurk | LurkMode::FullLurk => cooldown_elapsed,
    };
    if should_eval {
        return evaluate(rt, state, EvalKind::Normal).await;
    }
    None
}

/// One evaluation: prompt from the buffer tail, small LLM call with retries,
/// tag parse, ring push, gate unlock, watermark advance, wake-flag update.
pub async fn evaluate(rt: &Runtime, state: &Arc<TargetState>, kind: EvalKind) -> Option<EvalKind> {
    let _slot = state.processor.lock().await;
    if !rt.live() {
        return None;
    }

    let config = rt.config();
    let mut response = None;

    for attempt in 0..=INTENT_LLM_MAX_RETRIES {
        // Rebuilt every attempt: messages arriving during a retry window
        // belong in the prompt.
        let (snapshot, tail) = {
            let buffer = state.buffer.lock().unwrap();
            let messages = buffer.messages();
            let from = messages.len().saturating_sub(INTENT_CONTEXT_MESSAGES);
            (messages[from..].to_vec(), buffer.tail_id())
        };
        if snapshot.is_empty() {
            return None;
        }

        let tokens = EphemeralTokens::generate();
        let consumed = state.consumed_at.lock().unwrap().clone();
        let (history, seconds_since_eval) = {
            let intent = state.intent.lock().unwrap();
            (
                intent.history.iter().cloned().collect::<Vec<_>>(),
                intent.last_eval.map(|t| t.elapsed().as_secs()),
            )
        };
        let system = build_system_prompt(&SystemPromptInput {
            role: LlmRole::Intent,
            config: &config,
            docs: &rt.deps.docs,
            target: &state.target,
            lurk: state.lurk_mode(),
            tokens: &tokens,
            intent: Some(IntentPromptExtra {
                history: &history,
                seconds_since_eval,
                after_send: kind == EvalKind::AfterSend,
            }),
        });
        let turns = build_turns(&TurnBuildInput {
            messages: &snapshot,
            tokens: &tokens,
            consumed: &consumed,
            config: &config,
            role: LlmRole::Intent,
            include_images: false,
            current_thought: None,
        });
        let prompt_chars = system.len() + turns.iter().map(|t| t.text().len()).sum::<usize>();

        let request = ChatRequest {
            model: rt.intent_model(),
            system,
            history: turns.into_iter().map(mingle_llm::HistoryItem::Turn).collect(),
            tools: Vec::new(),
            max_tokens: 256,
            temperature: None,
        };

        match rt.deps.backend.send(&request).await {
            Ok(resp) => {
                if !rt.live() {
                    return None;
                }
                response = Some((resp, tail, snapshot.len(), prompt_chars));
                break;
            }
            Err(e) if attempt < INTENT_LLM_MAX_RETRIES => {
                rt.bus.warn(
                    Some(state.id_str()),
                    format!("intent LLM attempt {} failed: {e}", attempt + 1),
                );
                tokio::select! {
                    _ = rt.cancel.cancelled() => return None,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
            Err(e) => {
                rt.bus.error(
                    Some(state.id_str()),
                    format!("intent evaluation failed after retries: {e}"),
                );
                return None;
            }
        }
    }

    let (resp, tail, chat_messages, prompt_chars) = response?;
    let parsed = parse_willingness(&resp.content);

    let entry = IntentEntry {
        timestamp: chrono::Utc::now().to_rfc3339(),
        idle: parsed.idle,
        willingness: parsed.willingness,
        label: parsed.label.clone(),
        content: parsed.content.clone(),
    };

    {
        let mut intent = state.intent.lock().unwrap();
        intent.push_entry(entry);
        intent.last_eval = Some(Instant::now());
    }

    if state.unlock_gate() {
        rt.bus.log(
            LogLevel::Info,
            Some(state.id_str()),
            "intent gate unlocked",
            None,
        );
    }

    state.watermarks.lock().unwrap().intent = tail;

    if parsed.willingness >= WAKE_THRESHOLD {
        state.reply_wake.store(true, Ordering::SeqCst);
    }

    rt.bus.log(
        LogLevel::Intent,
        Some(state.id_str()),
        if parsed.idle {
            "evaluation produced no tag".to_string()
        } else {
            format!("[{}] {}", parsed.label, parsed.content)
        },
        None,
    );
    rt.bus.poll_round(
        state.id_str(),
        &PollStats {
            chat_messages,
            input_prompt: prompt_chars,
            llm_iters: 1,
            sent_messages: 0,
            tool_calls: 0,
            action: "evaluated".into(),
            role: "intent".into(),
        },
    );

    Some(kind)
}

/// Parsed willingness evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedIntent {
    pub idle: bool,
    pub willingness: u8,
    pub label: String,
    pub content: String,
}

/// Match the six tags: first strictly `[tag：reason]`, then loosely
/// `tag：reason`. Anything else is an idle evaluation.
pub fn parse_willingness(text: &str) -> ParsedIntent {
    let trimmed = text.trim();

    for (tag, level) in WILLINGNESS_TAGS {
        for colon in ["：", ":"] {
            let strict = format!("[{tag}{colon}");
            if let Some(start) = trimmed.find(&strict) {
                let rest = &trimmed[start + strict.len()..];
                let reason = rest.split(']').next().unwrap_or("").trim();
                return ParsedIntent {
                    idle: false,
                    willingness: *level,
                    label: (*tag).to_string(),
                    content: reason.to_string(),
                };
            }
        }
    }

    for (tag, level) in WILLINGNESS_TAGS {
        for colon in ["：", ":"] {
            let loose = format!("{tag}{colon}");
            if let Some(start) = trimmed.find(&loose) {
                let rest = &trimmed[start + loose.len()..];
                let reason = rest.lines().next().unwrap_or("").trim();
                return ParsedIntent {
                    idle: false,
                    willingness: *level,
                    label: (*tag).to_string(),
                    content: reason.to_string(),
                };
            }
        }
    }

    ParsedIntent {
        idle: true,
        willingness: 0,
        label: String::new(),
        content: trimmed.to_string(),
    }
}
