//! The on-disk social workspace.
//!
//! Persona and social documents live as plain markdown/JSON under a
//! per-assistant directory. Layers re-read files on every use — that is what
//! gives the agent its "reload on the fly" property — so nothing here caches
//! file contents. All reads funnel through one truncation chokepoint and all
//! writes serialize per workspace.

pub mod group_buffer;
pub mod meta;
pub mod targets;
pub mod workspace;

pub use workspace::SocialWorkspace;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DocsError>;
