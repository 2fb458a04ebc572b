use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::Notify;

use mingle_core::types::{LurkMode, Target};

use crate::buffer::MessageBuffer;
use crate::INTENT_GATE_TIMEOUT;

/// Ring capacity of the per-target intent history.
const INTENT_HISTORY_CAP: usize = 10;

/// A message the agent successfully sent, kept for re-injection into future
/// buffer snapshots when the gateway omits it from its own stream.
#[derive(Debug, Clone)]
pub struct SentRecord {
    /// Gateway id when it returned one, otherwise a synthesized `local_<ms>`.
    pub message_id: String,
    pub content: String,
    pub timestamp: String,
}

/// One recorded intent evaluation.
#[derive(Debug, Clone)]
pub struct IntentEntry {
    pub timestamp: String,
    /// True when the model produced no recognizable tag.
    pub idle: bool,
    /// 0 (idle) or 1..=5.
    pub willingness: u8,
    pub label: String,
    pub content: String,
}

/// Mutable intent-layer state for one target.
#[derive(Debug)]
pub struct IntentState {
    pub history: VecDeque<IntentEntry>,
    pub sleeping: bool,
    pub last_activity: Option<Instant>,
    pub last_eval: Option<Instant>,
    /// Set by Reply after a successful send; consumed by the next evaluation.
    pub force_eval: bool,
    /// Set by the Fetcher on a fresh unconsumed @-mention; consumed once.
    pub urgent_at_me: bool,
}

impl IntentState {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(INTENT_HISTORY_CAP),
            sleeping: false,
            last_activity: None,
            last_eval: None,
            force_eval: false,
            urgent_at_me: false,
        }
    }

    pub fn push_entry(&mut self, entry: IntentEntry) {
        if self.history.len() == INTENT_HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }

    pub fn latest(&self) -> Option<&IntentEntry> {
        self.history.back()
    }
}

impl Default for IntentState {
    fn default() -> Self {
        Self::new()
    }
}

/// Watermarks: the last message id each layer has considered.
#[derive(Debug, Default, Clone)]
pub struct Watermarks {
    pub observer: Option<String>,
    pub reply: Option<String>,
    pub intent: Option<String>,
}

/// All engine-owned state for one watched target.
///
/// Short-lived locks (`std::sync::Mutex`) are never held across an await;
/// the `processor` slot is the one tokio mutex because it guards the whole
/// LLM call of a layer.
pub struct TargetState {
    pub target: Target,
    pub buffer: Mutex<MessageBuffer>,
    pub watermarks: Mutex<Watermarks>,
    /// @-mention ids that already fired (or were absorbed by) Reply.
    pub consumed_at: Mutex<HashSet<String>>,
    pub sent_cache: Mutex<Vec<SentRecord>>,
    pub intent: Mutex<IntentState>,
    /// `Some(t)` = locked at `t` by a successful reply.
    gate: Mutex<Option<Instant>>,
    /// One-shot: latest willingness reached 3+ and Reply has not seen it yet.
    pub reply_wake: AtomicBool,
    /// LLM-call slot shared by Intent, Reply and Observer.
    pub processor: tokio::sync::Mutex<()>,
    pub lurk: Mutex<LurkMode>,
    pub paused: AtomicBool,
    /// Flipped by the first successful pull; guards the replying-to-history
    /// startup hazard.
    pub first_pull_done: AtomicBool,
    /// Interruptible wake-up for the intent loop.
    pub wake: Notify,
}

impl TargetState {
    pub fn new(target: Target, lurk: LurkMode) -> Self {
        Self {
            target,
            buffer: Mutex::new(MessageBuffer::new()),
            watermarks: Mutex::new(Watermarks::default()),
            consumed_at: Mutex::new(HashSet::new()),
            sent_cache: Mutex::new(Vec::new()),
            intent: Mutex::new(IntentState::new()),
            gate: Mutex::new(None),
            reply_wake: AtomicBool::new(false),
            processor: tokio::sync::Mutex::new(()),
            lurk: Mutex::new(lurk),
            paused: AtomicBool::new(false),
            first_pull_done: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn id_str(&self) -> &str {
        self.target.id.as_str()
    }

    pub fn lurk_mode(&self) -> LurkMode {
        *self.lurk.lock().unwrap()
    }

    pub fn set_lurk_mode(&self, mode: LurkMode) {
        *self.lurk.lock().unwrap() = mode;
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    // --- intent gate --------------------------------------------------------

    pub fn lock_gate(&self) {
        *self.gate.lock().unwrap() = Some(Instant::now());
    }

    pub fn unlock_gate(&self) -> bool {
        self.gate.lock().unwrap().take().is_some()
    }

    /// True while the gate blocks Reply. A lock older than the safety
    /// timeout is released here.
    pub fn gate_blocks(&self) -> bool {
        let mut gate = self.gate.lock().unwrap();
        match *gate {
            Some(locked_at) if locked_at.elapsed() < INTENT_GATE_TIMEOUT => true,
            Some(_) => {
                *gate = None;
                false
            }
            None => false,
        }
    }

    pub fn gate_locked(&self) -> bool {
        self.gate.lock().unwrap().is_some()
    }

    // --- consumed-@ ---------------------------------------------------------

    /// Insert ids into the consumed set; returns how many were new.
    pub fn consume_at_ids<I: IntoIterator<Item = String>>(&self, ids: I) -> usize {
        let mut consumed = self.consumed_at.lock().unwrap();
        ids.into_iter().filter(|id| consumed.insert(id.clone())).count()
    }

    /// Drop consumed ids no longer present in the buffer.
    pub fn prune_consumed(&self) {
        let buffer = self.buffer.lock().unwrap();
        let mut consumed = self.consumed_at.lock().unwrap();
        consumed.retain(|id| buffer.contains(id));
    }

    /// Prune sent-cache records older than the buffer's earliest timestamp.
    pub fn prune_sent_cache(&self) {
        let earliest = {
            let buffer = self.buffer.lock().unwrap();
            buffer.earliest_timestamp().map(String::from)
        };
        if let Some(earliest) = earliest {
            let mut cache = self.sent_cache.lock().unwrap();
            cache.retain(|rec| rec.timestamp.as_str() >= earliest.as_str());
        }
    }

    /// Mark buffer activity and wake the intent loop.
    pub fn mark_activity(&self) {
        self.intent.lock().unwrap().last_activity = Some(Instant::now());
        self.wake.notify_one();
    }

    /// Flag an urgent unconsumed @-mention and force-wake the intent loop.
    pub fn flag_urgent(&self) {
        let mut intent = self.intent.lock().unwrap();
        intent.urgent_at_me = true;
        intent.sleeping = false;
        drop(intent);
        self.wake.notify_one();
    }
}
