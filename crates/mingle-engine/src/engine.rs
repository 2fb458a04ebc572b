//! Engine lifecycle and the query/control surface.
//!
//! One `Engine` object per process, bound to one assistant at a time.
//! `start` after `start` replaces the previous generation: the old
//! cancellation token fires and the generation counter moves on, so any
//! callback still in flight from the old loops fails its `live()` check
//! before touching shared state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::info;

use mingle_core::config::SocialConfig;
use mingle_core::events::{EngineEvent, LogEntry};
use mingle_core::types::{LurkMode, TargetKind};
use mingle_core::Result;
use mingle_docs::meta;

use crate::bus::EventBus;
use crate::runtime::{EngineDeps, Runtime};
use crate::state::TargetState;
use crate::{compress, fetcher, intent, observer, reply};

/// Snapshot of the engine for reporting frontends.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub running: bool,
    pub generation: u64,
    pub targets: Vec<TargetStatus>,
}

#[derive(Debug, Clone)]
pub struct TargetStatus {
    pub id: String,
    pub kind: TargetKind,
    pub name: Option<String>,
    pub lurk: LurkMode,
    pub paused: bool,
}

pub struct Engine {
    runtime: Mutex<Option<Arc<Runtime>>>,
    current_generation: Arc<AtomicU64>,
    bus: Arc<EventBus>,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            runtime: Mutex::new(None),
            current_generation: Arc::new(AtomicU64::new(0)),
            bus: Arc::new(EventBus::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    /// Start (or restart) the engine for one assistant. Any previous
    /// generation is stopped first.
    pub fn start(&self, config: SocialConfig, deps: EngineDeps) -> Result<Arc<Runtime>> {
        self.stop();

        let generation = self.current_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let rt = Runtime::new(
            generation,
            Arc::clone(&self.current_generation),
            config,
            deps,
            Arc::clone(&self.bus),
        );

        tokio::spawn(fetcher::run(Arc::clone(&rt)));
        tokio::spawn(compress::run(Arc::clone(&rt)));
        for state in rt.targets_snapshot() {
            spawn_target_tasks(&rt, &state);
        }

        *self.runtime.lock().unwrap() = Some(Arc::clone(&rt));
        info!(generation, "engine started");
        self.bus.emit(EngineEvent::StatusChanged { running: true });
        Ok(rt)
    }

    /// Stop the active generation. In-flight LLM calls may still complete;
    /// their results are discarded by the generation check.
    pub fn stop(&self) {
        let Some(rt) = self.runtime.lock().unwrap().take() else {
            return;
        };
        // Bump first so even a callback racing the cancel sees a stale
        // generation.
        self.current_generation.fetch_add(1, Ordering::SeqCst);
        rt.cancel.cancel();
        info!(generation = rt.generation, "engine stopped");
        self.bus.emit(EngineEvent::StatusChanged { running: false });
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().unwrap().is_some()
    }

    /// Apply an updated config to the running generation without a restart.
    /// New targets get their layer tasks; removed targets' tasks notice and
    /// exit on their next iteration.
    pub fn update_config(&self, config: SocialConfig) {
        let Some(rt) = self.runtime_handle() else {
            return;
        };
        rt.set_config(config.clone());
        let (added, removed) = rt.sync_targets(&config);
        for state in &added {
            spawn_target_tasks(&rt, state);
        }
        if !added.is_empty() || !removed.is_empty() {
            self.bus.info(
                None,
                format!(
                    "config updated: {} target(s) added, {} removed",
                    added.len(),
                    removed.len()
                ),
            );
        }
    }

    pub fn set_lurk_mode(&self, target_id: &str, mode: LurkMode) {
        let Some(rt) = self.runtime_handle() else {
            return;
        };
        let Some(state) = rt.target(target_id) else {
            return;
        };
        state.set_lurk_mode(mode);

        // Persist the full non-normal map so restarts keep lurk behaviour.
        let modes: HashMap<String, LurkMode> = rt
            .targets_snapshot()
            .iter()
            .map(|s| (s.id_str().to_string(), s.lurk_mode()))
            .collect();
        if let Err(e) = meta::save_lurk_modes(&rt.deps.docs, &modes) {
            self.bus
                .warn(Some(target_id), format!("lurk mode persist failed: {e}"));
        }

        self.bus.emit(EngineEvent::LurkModeChanged {
            target: target_id.to_string(),
            mode,
        });
        self.bus
            .info(Some(target_id), format!("lurk mode set to {mode}"));
    }

    pub fn set_target_paused(&self, target_id: &str, paused: bool) {
        let Some(rt) = self.runtime_handle() else {
            return;
        };
        let Some(state) = rt.target(target_id) else {
            return;
        };
        state.paused.store(paused, Ordering::SeqCst);
        self.bus.emit(EngineEvent::TargetPausedChanged {
            target: target_id.to_string(),
            paused,
        });
    }

    pub fn status(&self) -> EngineStatus {
        let rt = self.runtime_handle();
        match rt {
            Some(rt) => {
                let names = rt.target_names();
                let mut targets: Vec<TargetStatus> = rt
                    .targets_snapshot()
                    .iter()
                    .map(|s| TargetStatus {
                        id: s.id_str().to_string(),
                        kind: s.target.kind,
                        name: names.get(s.id_str()).cloned(),
                        lurk: s.lurk_mode(),
                        paused: s.is_paused(),
                    })
                    .collect();
                targets.sort_by(|a, b| a.id.cmp(&b.id));
                EngineStatus {
                    running: true,
                    generation: rt.generation,
                    targets,
                }
            }
            None => EngineStatus {
                running: false,
                generation: self.current_generation.load(Ordering::SeqCst),
                targets: Vec::new(),
            },
        }
    }

    pub fn recent_logs(&self, target: Option<&str>, limit: usize) -> Vec<LogEntry> {
        self.bus.recent(target, limit)
    }

    pub fn clear_logs(&self) {
        self.bus.clear();
    }

    pub fn target_names(&self) -> HashMap<String, String> {
        self.runtime_handle()
            .map(|rt| rt.target_names())
            .unwrap_or_default()
    }

    fn runtime_handle(&self) -> Option<Arc<Runtime>> {
        self.runtime.lock().unwrap().clone()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_target_tasks(rt: &Arc<Runtime>, state: &Arc<TargetState>) {
    tokio::spawn(observer::run(Arc::clone(rt), Arc::clone(state)));
    tokio::spawn(reply::run(Arc::clone(rt), Arc::clone(state)));
    tokio::spawn(intent::run(Arc::clone(rt), Arc::clone(state)));
}
