//! Agent runtime: configuration, the [`ConversationEngine`] turn loop, and
//! what it reports.
//!
//! - [`config`]: [`AgentConfig`] and tool-server declarations.
//! - [`engine`]: [`ConversationEngine`] and its [`EngineState`] machine. Start here.
//! - [`execution`]: per-turn helpers: request building, retried model call,
//!   tool dispatch.
//! - [`events`]: [`EventHandler`] trait and [`EngineEvent`] enum for
//!   observing the loop.
//! - [`result`]: [`AgentResult`], the serializable conversation record.

pub mod config;
pub mod engine;
pub mod events;
pub mod execution;
pub mod result;

pub use config::{AgentConfig, DeclaredTool, ServerKind, ToolServerDeclaration, WaitSpec};
pub use engine::{ConversationEngine, EngineState};
pub use events::{
    CompositeEventHandler, EngineEvent, EventHandler, FnEventHandler, LoggingHandler, NoopHandler,
};
pub use result::{AgentResult, RunOutcome, TokenUsage, ToolCallRecord, Turn, TurnRole};
