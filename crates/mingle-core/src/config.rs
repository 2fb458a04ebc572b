use figment::{
    providers::{Env, Format, Json},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{Target, TargetKind};

/// Engine-wide poll cadence (seconds) when the config does not override it.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;
/// Observer cooldown default (seconds).
pub const DEFAULT_OBSERVER_INTERVAL_SECS: u64 = 180;

/// The social participation config for one assistant.
///
/// Loaded from a JSON document with `MINGLE_` env overrides; the embedding
/// host may also hand a fully built value to the engine directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocialConfig {
    /// Opaque assistant identity; also names the on-disk workspace root.
    pub assistant_id: String,

    /// Name of the external tool server that fronts the chat gateway.
    pub gateway_server: String,

    /// Provider entry to use for LLM calls (resolved against the provider list).
    pub provider_id: String,

    /// Model for observer/reply calls.
    pub model: String,

    /// Optional cheaper model for the intent layer.
    #[serde(default)]
    pub intent_model: Option<String>,

    /// Extra cooldown between reply rounds (seconds, 0 = none).
    #[serde(default)]
    pub reply_interval_secs: u64,

    #[serde(default = "default_observer_interval")]
    pub observer_interval_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default)]
    pub watched_groups: Vec<String>,

    #[serde(default)]
    pub watched_friends: Vec<String>,

    /// Persona line injected into every social system prompt.
    #[serde(default)]
    pub persona_prompt: String,

    /// When true, an @-mention always warrants a reply attempt.
    #[serde(default)]
    pub at_must_reply: bool,

    /// Expose the reply-strategy writer tool to the observer role.
    #[serde(default)]
    pub agent_can_edit_strategy: bool,

    /// Inject the built-in behaviour guidelines block into system prompts.
    #[serde(default)]
    pub inject_behavior_guidelines: bool,

    /// Evaluate intent immediately on @-mention instead of waiting a cycle.
    #[serde(default)]
    pub at_instant_reply: bool,

    /// The agent's own account id on the chat platform.
    pub self_id: String,

    /// Display name the agent goes by in chat, used to recognise mentions.
    #[serde(default)]
    pub agent_name: Option<String>,

    #[serde(default)]
    pub owner_id: Option<String>,

    #[serde(default)]
    pub owner_name: Option<String>,

    /// External tool servers whose tools the reply role may call.
    #[serde(default)]
    pub enabled_tool_servers: Vec<String>,

    /// Per-tool-server iteration caps within one LLM round.
    /// Missing server = default cap; explicit `null` = unlimited.
    #[serde(default)]
    pub tool_iteration_caps: HashMap<String, Option<u32>>,
}

impl SocialConfig {
    /// Load from a JSON file with `MINGLE_` env var overrides.
    pub fn load(path: &str) -> crate::error::Result<Self> {
        Figment::new()
            .merge(Json::file(path))
            .merge(Env::prefixed("MINGLE_"))
            .extract()
            .map_err(|e| crate::error::MingleError::Config(e.to_string()))
    }

    /// All watched targets, groups first.
    pub fn targets(&self) -> Vec<Target> {
        let mut out: Vec<Target> = self
            .watched_groups
            .iter()
            .map(|id| Target {
                id: id.clone().into(),
                kind: TargetKind::Group,
            })
            .collect();
        out.extend(self.watched_friends.iter().map(|id| Target {
            id: id.clone().into(),
            kind: TargetKind::Direct,
        }));
        out
    }
}

/// Wire format family of an LLM provider entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiFormat {
    OpenaiCompatible,
    GeminiOfficial,
}

/// One configured LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub name: String,
    pub api_key: String,
    /// Base URL without trailing slash.
    pub base_url: String,
    pub api_format: ApiFormat,
    #[serde(default)]
    pub default_model: Option<String>,
}

fn default_observer_interval() -> u64 {
    DEFAULT_OBSERVER_INTERVAL_SECS
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
