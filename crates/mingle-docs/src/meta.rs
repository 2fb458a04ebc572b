//! Small JSON side documents: compression bookkeeping and persisted lurk modes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use mingle_core::types::LurkMode;

use crate::{Result, SocialWorkspace};

const COMPRESS_META_FILE: &str = "compress_meta.json";
const LURK_MODES_FILE: &str = "lurk_modes.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressMeta {
    #[serde(rename = "lastCompressTime", default)]
    pub last_compress_time: Option<String>,
}

pub fn load_compress_meta(ws: &SocialWorkspace) -> CompressMeta {
    ws.read_json(COMPRESS_META_FILE)
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

pub fn save_compress_meta(ws: &SocialWorkspace, meta: &CompressMeta) -> Result<()> {
    ws.write_json(COMPRESS_META_FILE, &serde_json::to_value(meta)?)
}

/// Only non-normal modes are persisted; a missing entry means `Normal`.
pub fn load_lurk_modes(ws: &SocialWorkspace) -> HashMap<String, LurkMode> {
    ws.read_json(LURK_MODES_FILE)
        .and_then(|v| serde_json::from_value::<HashMap<String, LurkMode>>(v).ok())
        .unwrap_or_default()
        .into_iter()
        .filter(|(_, mode)| *mode != LurkMode::Normal)
        .collect()
}

pub fn save_lurk_modes(ws: &SocialWorkspace, modes: &HashMap<String, LurkMode>) -> Result<()> {
    let persisted: HashMap<&String, &LurkMode> = modes
        .iter()
        .filter(|(_, mode)| **mode != LurkMode::Normal)
        .collect();
    ws.write_json(LURK_MODES_FILE, &serde_json::to_value(persisted)?)
}
