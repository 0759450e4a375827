//! Error taxonomy for the execution core.
//!
//! Each concern gets its own enum so callers can match on the failure class
//! that matters to them:
//!
//! | Error | Raised by | Fatal to the run? |
//! |-------|-----------|-------------------|
//! | [`ConfigError`] | [`AgentConfig::validate`](crate::agent::config::AgentConfig::validate) | yes |
//! | [`ServerStartError`] | tool-server `start()` and the server manager | yes, after rollback |
//! | [`ToolCallError`] | a single tool invocation | no, surfaced to the model |
//! | [`ModelError`] | the chat model client | only `RateLimited` is retried |
//! | [`EngineError`] | the conversation engine | yes, partial transcript kept |

use crate::agent::config::ServerKind;
use crate::agent::engine::EngineState;
use std::time::Duration;
use thiserror::Error;

// ── Configuration ──────────────────────────────────────────────────

/// A declarative agent configuration failed validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("model identifier must not be empty")]
    EmptyModel,

    #[error("max_turns must be at least 1")]
    ZeroTurns,

    #[error("duplicate tool server id '{0}'")]
    DuplicateServerId(String),

    #[error("tool server '{0}' has an empty command")]
    EmptyCommand(String),

    #[error("one-shot tool server '{0}' requires a non-empty tool_prefix")]
    MissingPrefix(String),

    #[error("tool prefix '{prefix}' is declared by both '{first}' and '{second}'")]
    DuplicatePrefix {
        prefix: String,
        first: String,
        second: String,
    },

    #[error("one-shot tool server '{0}' has no log stream; use a ready or tools wait")]
    UnsupportedWait(String),

    #[error("tool server '{server}' has an invalid log pattern: {source}")]
    InvalidPattern {
        server: String,
        #[source]
        source: regex::Error,
    },
}

// ── Server startup ─────────────────────────────────────────────────

/// Why a readiness wait did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WaitFailure {
    /// The condition did not hold before the wait's timeout elapsed.
    #[error("timed out after {timeout:?} waiting for {condition}")]
    TimedOut { condition: String, timeout: Duration },

    /// The process exited before the condition held.
    #[error("process exited early ({status}) while waiting for {condition}")]
    ExitedEarly { condition: String, status: String },

    #[error("invalid log pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },
}

impl WaitFailure {
    /// The unmet condition, e.g. `log line matching "ready"`.
    pub fn condition(&self) -> &str {
        match self {
            WaitFailure::TimedOut { condition, .. }
            | WaitFailure::ExitedEarly { condition, .. } => condition,
            WaitFailure::InvalidPattern { pattern, .. } => pattern,
        }
    }

    pub fn is_exited_early(&self) -> bool {
        matches!(self, WaitFailure::ExitedEarly { .. })
    }
}

/// A tool server could not be made usable. Fatal to the run; every process
/// started so far is stopped before this error reaches the caller.
#[derive(Error, Debug)]
pub enum ServerStartError {
    #[error("{kind} server '{server}' failed to spawn `{command}`: {source}")]
    Spawn {
        server: String,
        kind: ServerKind,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind} server '{server}' (`{command}`) is not ready: {failure}")]
    NotReady {
        server: String,
        kind: ServerKind,
        command: String,
        #[source]
        failure: WaitFailure,
    },

    #[error("{kind} server '{server}' (`{command}`) handshake failed: {message}")]
    Handshake {
        server: String,
        kind: ServerKind,
        command: String,
        message: String,
    },

    #[error("tool '{tool}' is exported by both '{first}' and '{second}'")]
    DuplicateTool {
        tool: String,
        first: String,
        second: String,
    },
}

impl ServerStartError {
    /// Id of the server that failed, when the failure belongs to one server.
    pub fn server(&self) -> Option<&str> {
        match self {
            ServerStartError::Spawn { server, .. }
            | ServerStartError::NotReady { server, .. }
            | ServerStartError::Handshake { server, .. } => Some(server),
            ServerStartError::DuplicateTool { .. } => None,
        }
    }
}

// ── Tool calls ─────────────────────────────────────────────────────

/// One tool invocation failed. Recovered locally: the engine records the
/// message as the call's error and hands it to the model as tool output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("tool '{tool}' failed: {message}")]
pub struct ToolCallError {
    pub tool: String,
    pub message: String,
}

impl ToolCallError {
    pub fn new(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

// ── Model calls ────────────────────────────────────────────────────

/// Failure of a single chat-model request.
#[derive(Error, Debug, Clone)]
pub enum ModelError {
    /// Upstream quota exhausted. The only transient failure; retried per
    /// [`RetryPolicy`](crate::api::retry::RetryPolicy).
    #[error("rate limited by upstream: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(String),

    #[error("failed to parse response: {0}")]
    Decode(String),

    #[error("API error: {0}")]
    Api(String),
}

// ── Engine ─────────────────────────────────────────────────────────

/// Fatal failure of a conversation run.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    ServerStart(#[from] ServerStartError),

    #[error("turn budget exhausted: {turns_completed} of {max_turns} turns without a final answer")]
    TurnBudgetExhausted { turns_completed: u32, max_turns: u32 },

    #[error("wall-clock deadline of {timeout:?} exceeded after {turns_completed} turns")]
    DeadlineExceeded {
        timeout: Duration,
        turns_completed: u32,
    },

    #[error("rate limit retries exhausted: {0}")]
    RateLimitExhausted(#[source] ModelError),

    #[error("model call failed: {0}")]
    Model(#[source] ModelError),

    #[error("run cancelled after {turns_completed} turns")]
    Cancelled { turns_completed: u32 },

    #[error("cannot {operation} while the engine is {state}")]
    InvalidState {
        operation: &'static str,
        state: EngineState,
    },
}

impl EngineError {
    /// Turn budget or wall-clock deadline ran out.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            EngineError::TurnBudgetExhausted { .. } | EngineError::DeadlineExceeded { .. }
        )
    }

    /// Turns completed before the failure, for the variants that track it.
    pub fn turns_completed(&self) -> Option<u32> {
        match self {
            EngineError::TurnBudgetExhausted {
                turns_completed, ..
            }
            | EngineError::DeadlineExceeded {
                turns_completed, ..
            }
            | EngineError::Cancelled { turns_completed } => Some(*turns_completed),
            _ => None,
        }
    }
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::RateLimited { .. } => EngineError::RateLimitExhausted(e),
            other => EngineError::Model(other),
        }
    }
}
