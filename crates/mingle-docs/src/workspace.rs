use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::Result;

/// Per-file cap for persona documents (characters).
pub const MAX_PERSONA_CHARS: usize = 20_000;
/// Cap for a per-target rule document.
pub const MAX_GROUP_RULE_CHARS: usize = 10_000;
/// Cap for the reply-strategy document.
pub const MAX_REPLY_STRATEGY_CHARS: usize = 5_000;
/// Cap for the cross-group social memory document.
pub const MAX_SOCIAL_MEMORY_CHARS: usize = 20_000;

/// Head share kept when a document exceeds its cap.
const TRUNCATE_HEAD: f64 = 0.70;
/// Tail share kept when a document exceeds its cap.
const TRUNCATE_TAIL: f64 = 0.20;
const TRUNCATE_MARKER: &str = "\n\n[... content truncated ...]\n\n";

/// Handle to one assistant's workspace directory.
///
/// Layout:
/// ```text
/// <root>/SOUL.md  USER.md  MEMORY.md
/// <root>/social/SOCIAL_MEMORY.md
/// <root>/social/GROUP_RULE_<id>.md
/// <root>/social/REPLY_STRATEGY.md
/// <root>/social/GROUP_<id>.md
/// <root>/social/DAILY_<YYYY-MM-DD>.md
/// <root>/social/targets.json  lurk_modes.json  compress_meta.json
/// ```
pub struct SocialWorkspace {
    root: PathBuf,
    /// Writers take this for the duration of a write so two tool calls never
    /// interleave on the same file.
    write_lock: Mutex<()>,
}

impl SocialWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn social_dir(&self) -> PathBuf {
        self.root.join("social")
    }

    // --- persona documents --------------------------------------------------

    pub fn read_soul(&self) -> String {
        self.read_truncated(&self.root.join("SOUL.md"), MAX_PERSONA_CHARS)
    }

    pub fn read_user_profile(&self) -> String {
        self.read_truncated(&self.root.join("USER.md"), MAX_PERSONA_CHARS)
    }

    pub fn read_long_term_memory(&self) -> String {
        self.read_truncated(&self.root.join("MEMORY.md"), MAX_PERSONA_CHARS)
    }

    // --- social documents ---------------------------------------------------

    pub fn read_social_memory(&self) -> String {
        self.read_truncated(
            &self.social_dir().join("SOCIAL_MEMORY.md"),
            MAX_SOCIAL_MEMORY_CHARS,
        )
    }

    pub fn write_social_memory(&self, content: &str) -> Result<()> {
        self.write_capped(
            &self.social_dir().join("SOCIAL_MEMORY.md"),
            content,
            MAX_SOCIAL_MEMORY_CHARS,
        )
    }

    pub fn read_group_rule(&self, target_id: &str) -> String {
        self.read_truncated(&self.group_rule_path(target_id), MAX_GROUP_RULE_CHARS)
    }

    pub fn write_group_rule(&self, target_id: &str, content: &str) -> Result<()> {
        self.write_capped(&self.group_rule_path(target_id), content, MAX_GROUP_RULE_CHARS)
    }

    /// Returns `None` when no strategy document exists; callers inject the
    /// built-in default.
    pub fn read_reply_strategy(&self) -> Option<String> {
        let path = self.social_dir().join("REPLY_STRATEGY.md");
        if !path.exists() {
            return None;
        }
        Some(self.read_truncated(&path, MAX_REPLY_STRATEGY_CHARS))
    }

    pub fn write_reply_strategy(&self, content: &str) -> Result<()> {
        self.write_capped(
            &self.social_dir().join("REPLY_STRATEGY.md"),
            content,
            MAX_REPLY_STRATEGY_CHARS,
        )
    }

    // --- group buffers and digests ------------------------------------------

    pub fn group_buffer_path(&self, target_id: &str) -> PathBuf {
        self.social_dir()
            .join(format!("GROUP_{}.md", sanitize_component(target_id)))
    }

    pub fn read_group_buffer(&self, target_id: &str) -> String {
        match fs::read_to_string(self.group_buffer_path(target_id)) {
            Ok(s) => s,
            Err(_) => String::new(),
        }
    }

    /// Append one timestamped section to a target's rolling archive.
    pub fn append_group_buffer(&self, target_id: &str, timestamp: &str, body: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let path = self.group_buffer_path(target_id);
        self.ensure_parent(&path)?;
        let mut content = fs::read_to_string(&path).unwrap_or_default();
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&format!("## {timestamp}\n\n{}\n\n", body.trim_end()));
        fs::write(&path, content)?;
        debug!(target = %target_id, "group buffer section appended");
        Ok(())
    }

    pub fn write_group_buffer(&self, target_id: &str, content: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let path = self.group_buffer_path(target_id);
        self.ensure_parent(&path)?;
        fs::write(&path, content)?;
        Ok(())
    }

    pub fn daily_digest_path(&self, date: &str) -> PathBuf {
        self.social_dir()
            .join(format!("DAILY_{}.md", sanitize_component(date)))
    }

    pub fn write_daily_digest(&self, date: &str, content: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let path = self.daily_digest_path(date);
        self.ensure_parent(&path)?;
        fs::write(&path, content)?;
        Ok(())
    }

    pub fn read_daily_digest(&self, date: &str) -> Option<String> {
        fs::read_to_string(self.daily_digest_path(date)).ok()
    }

    // --- JSON side files ----------------------------------------------------

    pub(crate) fn json_path(&self, name: &str) -> PathBuf {
        self.social_dir().join(name)
    }

    pub(crate) fn write_json(&self, name: &str, value: &serde_json::Value) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let path = self.json_path(name);
        self.ensure_parent(&path)?;
        fs::write(&path, serde_json::to_string_pretty(value)?)?;
        Ok(())
    }

    /// Read a JSON side file. Parse failures degrade to `None` — a corrupt
    /// document is treated as absent, never as a fatal engine error.
    pub(crate) fn read_json(&self, name: &str) -> Option<serde_json::Value> {
        let raw = fs::read_to_string(self.json_path(name)).ok()?;
        match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(file = %name, error = %e, "unparseable JSON document treated as absent");
                None
            }
        }
    }

    // --- the read chokepoint ------------------------------------------------

    /// Read a document, applying the 70 % head + 20 % tail truncation rule
    /// when it exceeds `cap` characters. Missing files read as empty.
    pub fn read_truncated(&self, path: &Path, cap: usize) -> String {
        let content = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(_) => return String::new(),
        };
        truncate_document(&content, cap)
    }

    fn write_capped(&self, path: &Path, content: &str, cap: usize) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        self.ensure_parent(path)?;
        let clipped: String = if content.chars().count() > cap {
            warn!(path = %path.display(), cap, "document over cap, clipping on write");
            content.chars().take(cap).collect()
        } else {
            content.to_string()
        };
        fs::write(path, clipped)?;
        Ok(())
    }

    fn group_rule_path(&self, target_id: &str) -> PathBuf {
        self.social_dir()
            .join(format!("GROUP_RULE_{}.md", sanitize_component(target_id)))
    }

    fn ensure_parent(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

/// Keep 70 % of the cap from the head and 20 % from the tail, joined by a
/// marker, when the document exceeds the cap. Under-cap content is returned
/// byte-for-byte.
pub fn truncate_document(content: &str, cap: usize) -> String {
    let chars: Vec<char> = content.chars().collect();
    if chars.len() <= cap {
        return content.to_string();
    }
    let head_len = (cap as f64 * TRUNCATE_HEAD) as usize;
    let tail_len = (cap as f64 * TRUNCATE_TAIL) as usize;
    let head: String = chars[..head_len].iter().collect();
    let tail: String = chars[chars.len() - tail_len..].iter().collect();
    format!("{head}{TRUNCATE_MARKER}{tail}")
}

/// Target ids come from an external platform; keep file names flat and safe.
fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws() -> (tempfile::TempDir, SocialWorkspace) {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = SocialWorkspace::new(dir.path());
        (dir, ws)
    }

    #[test]
    fn missing_files_read_as_empty() {
        let (_dir, ws) = ws();
        assert_eq!(ws.read_soul(), "");
        assert_eq!(ws.read_group_rule("g1"), "");
        assert!(ws.read_reply_strategy().is_none());
    }

    #[test]
    fn write_then_read_round_trips_under_cap() {
        let (_dir, ws) = ws();
        ws.write_group_rule("g1", "no politics\n").unwrap();
        assert_eq!(ws.read_group_rule("g1"), "no politics\n");
    }

    #[test]
    fn over_cap_documents_keep_head_and_tail() {
        let content = format!("{}{}{}", "A".repeat(9000), "B".repeat(4000), "C".repeat(9000));
        let out = truncate_document(&content, 10_000);
        assert!(out.contains(TRUNCATE_MARKER.trim()));
        assert!(out.starts_with('A'));
        assert!(out.ends_with('C'));
        // 70% head + 20% tail
        assert_eq!(out.matches('A').count(), 7000);
        assert_eq!(out.matches('C').count(), 2000);
    }

    #[test]
    fn group_buffer_append_keeps_section_shape() {
        let (_dir, ws) = ws();
        ws.append_group_buffer("g1", "2026-07-30T12:00:00Z", "first summary")
            .unwrap();
        ws.append_group_buffer("g1", "2026-07-30T13:00:00Z", "second summary")
            .unwrap();
        let content = ws.read_group_buffer("g1");
        assert!(content.contains("## 2026-07-30T12:00:00Z\n\nfirst summary"));
        assert!(content.contains("## 2026-07-30T13:00:00Z\n\nsecond summary"));
    }

    #[test]
    fn unsafe_target_ids_map_to_flat_file_names() {
        let (_dir, ws) = ws();
        let path = ws.group_buffer_path("../evil/../../x");
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("GROUP_"));
        assert!(!name.contains('/'));
        assert!(!name.contains(".."));
    }

    #[test]
    fn corrupt_json_reads_as_absent() {
        let (_dir, ws) = ws();
        std::fs::create_dir_all(ws.social_dir()).unwrap();
        std::fs::write(ws.json_path("targets.json"), "{not json").unwrap();
        assert!(ws.read_json("targets.json").is_none());
    }
}
