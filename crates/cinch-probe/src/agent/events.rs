//! Events and handlers for observing a [`ConversationEngine`](super::engine::ConversationEngine) run.
//!
//! The engine reports every step of its turn loop as an [`EngineEvent`].
//! Handlers are pure observers: they log, collect, or forward events but
//! never steer the loop.
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use std::time::Duration;
use tracing::{debug, info, warn};

// ── Events ─────────────────────────────────────────────────────────

/// Events emitted by the engine during a run.
#[derive(Debug)]
pub enum EngineEvent<'a> {
    /// A model call is about to be made. `turn` is 1-based.
    TurnStart { turn: u32, max_turns: u32 },
    /// The model returned text (may be alongside tool calls).
    Text(&'a str),
    /// The model requested tool calls this turn.
    ToolCallsReceived { turn: u32, count: usize },
    /// A single tool is about to be dispatched.
    ToolExecuting { name: &'a str, arguments: &'a str },
    /// A single tool call finished, successfully or not.
    ToolResult {
        name: &'a str,
        call_id: &'a str,
        result: &'a str,
        is_error: bool,
    },
    /// Token usage reported by the model for this turn.
    TokenUsage {
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    /// A rate-limited model call will be retried after `delay`.
    RetryScheduled {
        attempt: u32,
        delay: Duration,
        error: &'a str,
    },
    /// The rate limiter held the run back before a model call.
    RateLimitWait { model: &'a str, waited: Duration },
    /// The model produced a final answer.
    Finished,
    /// The turn budget ran out before a final answer.
    TurnLimitReached { max_turns: u32 },
    /// The wall-clock deadline elapsed.
    DeadlineExceeded { timeout: Duration },
}

impl EngineEvent<'_> {
    /// Total tokens from a `TokenUsage` event, `None` for every other event.
    pub fn total_tokens(&self) -> Option<u64> {
        if let EngineEvent::TokenUsage {
            prompt_tokens,
            completion_tokens,
        } = self
        {
            Some(prompt_tokens + completion_tokens)
        } else {
            None
        }
    }
}

/// Observer for engine events.
///
/// ```ignore
/// struct Printer;
///
/// impl EventHandler for Printer {
///     fn on_event(&self, event: &EngineEvent<'_>) {
///         if let EngineEvent::ToolResult { name, result, .. } = event {
///             println!("[{name}] {result}");
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &EngineEvent<'_>) {
        let _ = event;
    }
}

/// Ignores every event.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let EngineEvent::Text(text) = event {
///         println!("{text}");
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&EngineEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&EngineEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&EngineEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &EngineEvent<'_>) {
        (self.0)(event)
    }
}

/// Dispatches each event to every inner handler, in registration order.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with_if(verbose, my_printer);
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Add `handler` only when `condition` holds.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }

    /// Add a handler from an `Option`. `None` is a no-op.
    pub fn with_opt(self, handler: Option<impl EventHandler + 'static>) -> Self {
        match handler {
            Some(h) => self.with(h),
            None => self,
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &EngineEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// Logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &EngineEvent<'_>) {
        match event {
            EngineEvent::TurnStart { turn, max_turns } => {
                info!("[turn {turn}/{max_turns}]");
            }
            EngineEvent::Text(text) => {
                let preview: String = text.chars().take(200).collect();
                debug!(
                    "Model text: {preview}{}",
                    if text.len() > 200 { "..." } else { "" }
                );
            }
            EngineEvent::ToolCallsReceived { turn, count } => {
                debug!("{count} tool call(s) in turn {turn}");
            }
            EngineEvent::ToolExecuting { name, .. } => {
                debug!("Executing tool: {name}");
            }
            EngineEvent::ToolResult {
                name,
                result,
                is_error,
                ..
            } => {
                if *is_error {
                    debug!("Tool {name} failed: {result}");
                } else {
                    debug!("Tool {name} result: {} bytes", result.len());
                }
            }
            EngineEvent::TokenUsage {
                prompt_tokens,
                completion_tokens,
            } => {
                debug!("Tokens: prompt={prompt_tokens}, completion={completion_tokens}");
            }
            EngineEvent::RetryScheduled {
                attempt,
                delay,
                error,
            } => {
                warn!("Retry {attempt} in {delay:?}: {error}");
            }
            EngineEvent::RateLimitWait { model, waited } => {
                info!("Rate limiter held {model} for {waited:?}");
            }
            EngineEvent::Finished => {
                info!("Agent finished (no more tool calls)");
            }
            EngineEvent::TurnLimitReached { max_turns } => {
                info!("Agent hit turn limit ({max_turns})");
            }
            EngineEvent::DeadlineExceeded { timeout } => {
                warn!("Run deadline of {timeout:?} exceeded");
            }
        }
    }
}
