//! LLM back-end adapters.
//!
//! The engine speaks one neutral history model (`Turn` / `HistoryItem`); each
//! back-end renders that history into its native wire shape and parses the
//! native response back. The engine contains zero knowledge of either format.

pub mod gemini;
pub mod openai;
pub mod types;

pub use gemini::GeminiBackend;
pub use openai::OpenAiCompatBackend;
pub use types::{
    BackendError, ChatRequest, ChatResponse, HistoryItem, LlmBackend, Part, Role, ToolCall,
    ToolDefinition, ToolOutcome, Turn,
};
