//! Chat-gateway protocol client.
//!
//! The gateway itself is an external tool server; this crate defines the
//! typed contract the engine depends on (`ChatGateway`) plus an
//! implementation over a generic tool bridge (`BridgeGateway`). The bridge —
//! the process that actually spawns/talks to tool servers — is a collaborator
//! supplied by the embedding host.

pub mod bridge;
pub mod types;

pub use bridge::{BridgeError, BridgeGateway, ExternalTool, ToolBridge};
pub use types::{
    ChatGateway, GatewayError, GatewayMessage, RecentBatch, SendOutcome, SendRequest, TargetBlock,
};
