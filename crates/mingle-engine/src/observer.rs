//! L2 — the observer layer.
//!
//! Long-cycle per-target loop that reads the room and maintains the durable
//! documents (group rules, cross-room social memory). It never sends chat
//! messages; its tool set has no send tool and no external tools.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use mingle_core::events::PollStats;

use crate::prompt::{
    build_system_prompt, build_turns, resolve_images, EphemeralTokens, LlmRole, SystemPromptInput,
    TurnBuildInput,
};
use crate::runtime::Runtime;
use crate::state::TargetState;
use crate::tool_loop::{run_tool_loop, ToolLoopRequest};
use crate::tools::observer_tools;
use crate::{buffer::ChangeSet, BUFFER_COMPRESS_THRESHOLD, OBSERVER_BACKOFF_CAP};

const DETECT_SLEEP: Duration = Duration::from_secs(2);

/// What one observer iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveAction {
    Skipped,
    Observed,
    Error,
}

/// Task-local pacing state.
#[derive(Debug, Default)]
pub struct ObserverCtl {
    pub last_attempt: Option<Instant>,
    pub consecutive_errors: u32,
}

impl ObserverCtl {
    /// Cooldown extended linearly with consecutive errors, capped.
    fn effective_cooldown(&self, base: Duration) -> Duration {
        let backoff = (base * self.consecutive_errors).min(OBSERVER_BACKOFF_CAP);
        base + backoff
    }
}

pub async fn run(rt: Arc<Runtime>, state: Arc<TargetState>) {
    let mut ctl = ObserverCtl::default();
    loop {
        tokio::select! {
            _ = rt.cancel.cancelled() => break,
            _ = tokio::time::sleep(DETECT_SLEEP) => {}
        }
        if !rt.live() || !rt.has_target(state.id_str()) {
            break;
        }
        observe_once(&rt, &state, &mut ctl).await;
    }
    debug!(target = %state.id_str(), "observer loop exited");
}

pub async fn observe_once(
    rt: &Runtime,
    state: &Arc<TargetState>,
    ctl: &mut ObserverCtl,
) -> ObserveAction {
    if state.is_paused() {
        return ObserveAction::Skipped;
    }
    {
        let buffer = state.buffer.lock().unwrap();
        if buffer.is_empty() {
            return ObserveAction::Skipped;
        }
        let watermark = state.watermarks.lock().unwrap().observer.clone();
        match buffer.detect(&watermark) {
            ChangeSet::FirstRun => {
                // Fence at the tail: history before the engine started is
                // not observed.
                state.watermarks.lock().unwrap().observer = buffer.tail_id();
                return ObserveAction::Skipped;
            }
            ChangeSet::Unchanged => return ObserveAction::Skipped,
            ChangeSet::NewFrom(_) => {}
        }
    }

    let config = rt.config();
    let base = Duration::from_secs(config.observer_interval_secs.max(1));
    if let Some(last) = ctl.last_attempt {
        if last.elapsed() < ctl.effective_cooldown(base) {
            return ObserveAction::Skipped;
        }
    }

    let _slot = state.processor.lock().await;
    if !rt.live() {
        return ObserveAction::Skipped;
    }
    ctl.last_attempt = Some(Instant::now());

    // Snapshot before the call: the fetcher may append while the LLM runs,
    // and the fence must not move past what the model actually saw.
    let (mut snapshot, snapshot_tail) = {
        let buffer = state.buffer.lock().unwrap();
        (buffer.messages().to_vec(), buffer.tail_id())
    };
    resolve_images(&rt.deps.http, &mut snapshot).await;
    if !rt.live() {
        return ObserveAction::Skipped;
    }

    let tokens = EphemeralTokens::generate();
    let consumed = state.consumed_at.lock().unwrap().clone();
    let system = build_system_prompt(&SystemPromptInput {
        role: LlmRole::Observer,
        config: &config,
        docs: &rt.deps.docs,
        target: &state.target,
        lurk: state.lurk_mode(),
        tokens: &tokens,
        intent: None,
    });
    let turns = build_turns(&TurnBuildInput {
        messages: &snapshot,
        tokens: &tokens,
        consumed: &consumed,
        config: &config,
        role: LlmRole::Observer,
        include_images: true,
        current_thought: None,
    });
    let prompt_chars = system.len() + turns.iter().map(|t| t.text().len()).sum::<usize>();

    let request = ToolLoopRequest {
        model: config.model.clone(),
        system,
        turns,
        builtin: observer_tools(&rt.deps.docs, state, config.agent_can_edit_strategy),
        external: Vec::new(),
        max_tokens: 2048,
        temperature: None,
    };

    let result = run_tool_loop(
        rt.deps.backend.as_ref(),
        &rt.deps.bridge,
        request,
        &config.tool_iteration_caps,
        &rt.cancel,
        None,
    )
    .await;

    if !rt.live() {
        return ObserveAction::Skipped;
    }

    match result {
        Ok(outcome) => {
            ctl.consecutive_errors = 0;
            // The snapshot tail is the correct fence whether or not the
            // model wrote anything: Observer produces no chat messages.
            state.watermarks.lock().unwrap().observer = snapshot_tail;

            rt.bus.poll_round(
                state.id_str(),
                &PollStats {
                    chat_messages: snapshot.len(),
                    input_prompt: prompt_chars,
                    llm_iters: outcome.iterations,
                    sent_messages: 0,
                    tool_calls: outcome.tool_calls,
                    action: "observed".into(),
                    role: "observer".into(),
                },
            );

            maybe_request_compression(rt, state).await;
            ObserveAction::Observed
        }
        Err(e) => {
            ctl.consecutive_errors += 1;
            rt.bus.error(
                Some(state.id_str()),
                format!(
                    "observer LLM call failed ({} consecutive): {e}",
                    ctl.consecutive_errors
                ),
            );
            ObserveAction::Error
        }
    }
}

/// When enough old messages pile up below the slower watermark, ask the
/// gateway to fold them into its rolling summary. Fire-and-forget.
async fn maybe_request_compression(rt: &Runtime, state: &Arc<TargetState>) {
    let backlog = {
        let watermarks = state.watermarks.lock().unwrap().clone();
        let buffer = state.buffer.lock().unwrap();
        buffer.backlog_below_watermarks(&watermarks.observer, &watermarks.reply)
    };
    if backlog <= BUFFER_COMPRESS_THRESHOLD {
        return;
    }
    let gateway = Arc::clone(&rt.deps.gateway);
    let target = state.target.clone();
    let bus = Arc::clone(&rt.bus);
    tokio::spawn(async move {
        if gateway.compress_context(&target).await.is_ok() {
            bus.info(
                Some(target.id.as_str()),
                "gateway-side context compression requested",
            );
        }
    });
}
