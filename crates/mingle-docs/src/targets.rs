//! Persisted list of every target the engine has ever watched.
//!
//! The daily-compression job enumerates archive files from this list, so a
//! target removed from the live config still gets its backlog digested.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{Result, SocialWorkspace};

const TARGETS_FILE: &str = "targets.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownTarget {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Load the known-target list. The legacy format (a bare array of id strings)
/// is accepted on read; unparseable content reads as empty.
pub fn load_known_targets(ws: &SocialWorkspace) -> Vec<KnownTarget> {
    let Some(value) = ws.read_json(TARGETS_FILE) else {
        return Vec::new();
    };
    let Value::Array(items) = value else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(id) => Some(KnownTarget { id, name: None }),
            obj @ Value::Object(_) => serde_json::from_value(obj).ok(),
            _ => None,
        })
        .collect()
}

pub fn save_known_targets(ws: &SocialWorkspace, targets: &[KnownTarget]) -> Result<()> {
    let value = serde_json::to_value(targets)?;
    ws.write_json(TARGETS_FILE, &value)?;
    debug!(count = targets.len(), "known targets saved");
    Ok(())
}

/// Merge newly configured ids (with optional display names) into the known
/// list. Existing entries keep their position; a fresh name wins over a
/// missing one.
pub fn merge_known_targets(
    known: &mut Vec<KnownTarget>,
    current: impl IntoIterator<Item = (String, Option<String>)>,
) {
    for (id, name) in current {
        match known.iter_mut().find(|t| t.id == id) {
            Some(existing) => {
                if existing.name.is_none() {
                    existing.name = name;
                }
            }
            None => known.push(KnownTarget { id, name }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_bare_string_list_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let ws = SocialWorkspace::new(dir.path());
        std::fs::create_dir_all(ws.social_dir()).unwrap();
        std::fs::write(
            ws.social_dir().join("targets.json"),
            r#"["g1", "g2"]"#,
        )
        .unwrap();

        let targets = load_known_targets(&ws);
        assert_eq!(
            targets,
            vec![
                KnownTarget { id: "g1".into(), name: None },
                KnownTarget { id: "g2".into(), name: None },
            ]
        );
    }

    #[test]
    fn save_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let ws = SocialWorkspace::new(dir.path());
        let targets = vec![
            KnownTarget { id: "g1".into(), name: Some("Rust 闲聊群".into()) },
            KnownTarget { id: "f1".into(), name: None },
        ];
        save_known_targets(&ws, &targets).unwrap();
        assert_eq!(load_known_targets(&ws), targets);
    }

    #[test]
    fn merge_keeps_removed_targets_and_fills_names() {
        let mut known = vec![
            KnownTarget { id: "old".into(), name: Some("Old Room".into()) },
            KnownTarget { id: "g1".into(), name: None },
        ];
        merge_known_targets(
            &mut known,
            vec![
                ("g1".to_string(), Some("Named Now".to_string())),
                ("g2".to_string(), None),
            ],
        );
        assert_eq!(known.len(), 3);
        assert_eq!(known[0].id, "old");
        assert_eq!(known[1].name.as_deref(), Some("Named Now"));
        assert_eq!(known[2].id, "g2");
    }
}
