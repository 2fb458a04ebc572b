use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::info;

use mingle_core::config::{ApiFormat, ProviderConfig, SocialConfig};
use mingle_core::events::EngineEvent;
use mingle_core::types::LurkMode;
use mingle_core::{MingleError, Result};
use mingle_docs::{meta, SocialWorkspace};
use mingle_gateway::{BridgeGateway, ChatGateway, ToolBridge};
use mingle_llm::{GeminiBackend, LlmBackend, OpenAiCompatBackend};

use crate::bus::EventBus;
use crate::state::TargetState;

/// Everything the engine talks to. Tests inject fakes; production wires the
/// bridge-backed gateway and a provider-resolved back-end.
pub struct EngineDeps {
    pub gateway: Arc<dyn ChatGateway>,
    pub backend: Arc<dyn LlmBackend>,
    pub bridge: Arc<dyn ToolBridge>,
    pub docs: Arc<SocialWorkspace>,
    pub http: reqwest::Client,
}

impl EngineDeps {
    /// Resolve config references into live collaborators.
    ///
    /// The two unresolvable references here are the only fatal start errors:
    /// everything else degrades and retries.
    pub fn from_config(
        config: &SocialConfig,
        providers: &[ProviderConfig],
        bridge: Arc<dyn ToolBridge>,
        docs: Arc<SocialWorkspace>,
    ) -> Result<Self> {
        if !bridge.has_server(&config.gateway_server) {
            return Err(MingleError::ToolServerNotFound {
                name: config.gateway_server.clone(),
            });
        }

        let provider = providers
            .iter()
            .find(|p| p.id == config.provider_id)
            .ok_or_else(|| MingleError::ProviderNotResolved {
                id: config.provider_id.clone(),
            })?;

        let http = reqwest::Client::new();
        let backend: Arc<dyn LlmBackend> = match provider.api_format {
            ApiFormat::OpenaiCompatible => Arc::new(OpenAiCompatBackend::new(
                http.clone(),
                provider.api_key.clone(),
                provider.base_url.clone(),
            )),
            ApiFormat::GeminiOfficial => Arc::new(GeminiBackend::new(
                http.clone(),
                provider.api_key.clone(),
                provider.base_url.clone(),
            )),
        };

        let gateway: Arc<dyn ChatGateway> =
            Arc::new(BridgeGateway::new(Arc::clone(&bridge), &config.gateway_server));

        Ok(Self {
            gateway,
            backend,
            bridge,
            docs,
            http,
        })
    }
}

/// State of one engine generation: live config, per-target schedulers, and
/// the cancellation/generation pair every loop checks before mutating
/// anything shared.
pub struct Runtime {
    pub generation: u64,
    current_generation: Arc<AtomicU64>,
    pub cancel: CancellationToken,
    config: Mutex<SocialConfig>,
    pub deps: EngineDeps,
    targets: Mutex<HashMap<String, Arc<TargetState>>>,
    names: Mutex<HashMap<String, String>>,
    pub bus: Arc<EventBus>,
}

impl Runtime {
    pub fn new(
        generation: u64,
        current_generation: Arc<AtomicU64>,
        config: SocialConfig,
        deps: EngineDeps,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let lurk_modes = meta::load_lurk_modes(&deps.docs);
        let mut targets = HashMap::new();
        for target in config.targets() {
            let lurk = lurk_modes
                .get(target.id.as_str())
                .copied()
                .unwrap_or(LurkMode::Normal);
            targets.insert(
                target.id.as_str().to_string(),
                Arc::new(TargetState::new(target, lurk)),
            );
        }

        Arc::new(Self {
            generation,
            current_generation,
            cancel: CancellationToken::new(),
            config: Mutex::new(config),
            deps,
            targets: Mutex::new(targets),
            names: Mutex::new(HashMap::new()),
            bus,
        })
    }

    /// Standalone runtime for tests and embedded single-generation use.
    pub fn detached(config: SocialConfig, deps: EngineDeps) -> Arc<Self> {
        Self::new(
            1,
            Arc::new(AtomicU64::new(1)),
            config,
            deps,
            Arc::new(EventBus::new()),
        )
    }

    /// A loop may only mutate shared state while its generation is current
    /// and it has not been cancelled. Checked after every await.
    pub fn live(&self) -> bool {
        !self.cancel.is_cancelled()
            && self.current_generation.load(Ordering::SeqCst) == self.generation
    }

    pub fn config(&self) -> SocialConfig {
        self.config.lock().unwrap().clone()
    }

    pub fn set_config(&self, config: SocialConfig) {
        *self.config.lock().unwrap() = config;
    }

    pub fn target(&self, id: &str) -> Option<Arc<TargetState>> {
        self.targets.lock().unwrap().get(id).cloned()
    }

    pub fn has_target(&self, id: &str) -> bool {
        self.targets.lock().unwrap().contains_key(id)
    }

    pub fn targets_snapshot(&self) -> Vec<Arc<TargetState>> {
        self.targets.lock().unwrap().values().cloned().collect()
    }

    /// Cache a display name; emits a change event on first sighting/rename.
    pub fn cache_name(&self, id: &str, name: &str) {
        let mut names = self.names.lock().unwrap();
        let changed = names.get(id).map(|n| n.as_str()) != Some(name);
        if changed {
            names.insert(id.to_string(), name.to_string());
            drop(names);
            self.bus.emit(EngineEvent::TargetNamesChanged {
                target: id.to_string(),
                name: name.to_string(),
            });
        }
    }

    pub fn target_names(&self) -> HashMap<String, String> {
        self.names.lock().unwrap().clone()
    }

    /// Model for the intent layer: the configured override or the main model.
    pub fn intent_model(&self) -> String {
        let config = self.config.lock().unwrap();
        config
            .intent_model
            .clone()
            .unwrap_or_else(|| config.model.clone())
    }

    /// Reconcile the target map with an updated config. Returns the states
    /// created for new targets (the caller spawns their layer tasks) and the
    /// ids removed (their tasks notice and exit).
    pub fn sync_targets(&self, config: &SocialConfig) -> (Vec<Arc<TargetState>>, Vec<String>) {
        let lurk_modes = meta::load_lurk_modes(&self.deps.docs);
        let wanted: HashMap<String, mingle_core::types::Target> = config
            .targets()
            .into_iter()
            .map(|t| (t.id.as_str().to_string(), t))
            .collect();

        let mut targets = self.targets.lock().unwrap();
        let removed: Vec<String> = targets
            .keys()
            .filter(|id| !wanted.contains_key(*id))
            .cloned()
            .collect();
        for id in &removed {
            targets.remove(id);
            info!(target = %id, "target removed from watch list");
        }

        let mut added = Vec::new();
        for (id, target) in wanted {
            if !targets.contains_key(&id) {
                let lurk = lurk_modes.get(&id).copied().unwrap_or(LurkMode::Normal);
                let state = Arc::new(TargetState::new(target, lurk));
                targets.insert(id.clone(), Arc::clone(&state));
                info!(target = %id, "target added to watch list");
                added.push(state);
            }
        }
        (added, removed)
    }
}
