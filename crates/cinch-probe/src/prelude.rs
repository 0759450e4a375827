//! Convenience re-exports for common `cinch-probe` types.
//!
//! ```ignore
//! use cinch_probe::prelude::*;
//! ```
//!
//! Covers configuring and running an engine and reading its result. Server
//! internals (protocol frames, readiness probes) stay in their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{ChatCompletion, ChatModel, ChatRequest, Message, OpenRouterClient, ToolCall};

// ── Agent runtime ───────────────────────────────────────────────────
pub use crate::agent::{
    AgentConfig, AgentResult, CompositeEventHandler, ConversationEngine, DeclaredTool,
    EngineEvent, EngineState, EventHandler, FnEventHandler, LoggingHandler, NoopHandler,
    RunOutcome, ServerKind, ToolServerDeclaration, Turn, WaitSpec,
};

// ── Rate limits and retry ───────────────────────────────────────────
pub use crate::api::{ModelPricing, RateLimiterRegistry, RateLimits, RetryPolicy};

// ── Errors ──────────────────────────────────────────────────────────
pub use crate::error::{EngineError, ModelError, ServerStartError, ToolCallError};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::{ServerManager, ToolCatalogEntry, ToolServer};
