//! The [`ConversationEngine`]: one agent run from tool-server startup to
//! teardown.
//!
//! ```text
//! Init ──initialize()──▶ Ready ──run()──▶ Running ──▶ Completed | Failed | TimedOut
//!                                                          │
//!                                   shutdown() ◀───────────┘   (from any state)
//!                                       │
//!                                       ▼
//!                                    ShutDown
//! ```
//!
//! Each call to the model is one turn. Tool calls requested in a turn run
//! sequentially, in request order, and their outputs go back to the model
//! on the next turn. The run ends on a final answer, when the turn budget is
//! spent, when the wall-clock deadline passes (checked between calls, never
//! mid-call), or on a fatal model failure. Every ending produces an
//! [`AgentResult`] with the transcript collected so far.

use super::config::AgentConfig;
use super::events::{EngineEvent, EventHandler, LoggingHandler};
use super::execution::{
    build_request, execute_tool_call, non_empty_tools, request_completion, skipped_call,
};
use super::result::{AgentResult, RunOutcome, TokenUsage, ToolCallRecord, Turn};
use crate::api::rate_limit::{RateLimiterRegistry, SlidingWindowLimiter};
use crate::api::tracing::{CostTracker, generate_trace_id};
use crate::error::EngineError;
use crate::tools::manager::ServerManager;
use crate::{ChatModel, Message, ToolDef};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

// ── State ──────────────────────────────────────────────────────────

/// Lifecycle of a [`ConversationEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Init,
    Ready,
    Running,
    Completed,
    Failed,
    TimedOut,
    ShutDown,
}

impl EngineState {
    /// The run has ended (or never will).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EngineState::Completed
                | EngineState::Failed
                | EngineState::TimedOut
                | EngineState::ShutDown
        )
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Init => write!(f, "init"),
            EngineState::Ready => write!(f, "ready"),
            EngineState::Running => write!(f, "running"),
            EngineState::Completed => write!(f, "completed"),
            EngineState::Failed => write!(f, "failed"),
            EngineState::TimedOut => write!(f, "timed_out"),
            EngineState::ShutDown => write!(f, "shut_down"),
        }
    }
}

/// Transcript and counters of the run in progress.
///
/// Lives on the engine rather than on the `run()` stack so a caller that
/// drops the `run()` future can still recover the partial transcript.
struct RunState {
    trace_id: String,
    started_at: DateTime<Utc>,
    clock: Instant,
    deadline: Instant,
    messages: Vec<Message>,
    turns: Vec<Turn>,
    turns_completed: u32,
    cost: CostTracker,
}

impl RunState {
    fn new(config: &AgentConfig, prompt: &str) -> Self {
        let clock = Instant::now();
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &config.system_prompt {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(prompt));
        Self {
            trace_id: generate_trace_id(),
            started_at: Utc::now(),
            clock,
            deadline: clock + config.timeout,
            messages,
            turns: vec![Turn::user(prompt)],
            turns_completed: 0,
            cost: CostTracker::new(),
        }
    }

    fn deadline_passed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn deadline_error(&self, timeout: Duration) -> EngineError {
        EngineError::DeadlineExceeded {
            timeout,
            turns_completed: self.turns_completed,
        }
    }
}

// ── Engine ─────────────────────────────────────────────────────────

/// Drives one agent conversation against its tool servers.
///
/// ```ignore
/// let mut engine = ConversationEngine::new(config, model)
///     .with_registry(registry)
///     .with_event_handler(LoggingHandler);
/// engine.initialize().await?;
/// let result = engine.run("Move 25 from A to B").await?;
/// engine.shutdown().await;
/// ```
pub struct ConversationEngine {
    config: Arc<AgentConfig>,
    model: Arc<dyn ChatModel>,
    registry: Arc<RateLimiterRegistry>,
    event_handler: Arc<dyn EventHandler>,
    limiter: Option<Arc<SlidingWindowLimiter>>,
    manager: Option<ServerManager>,
    state: EngineState,
    run: Option<RunState>,
    last_error: Option<EngineError>,
}

impl ConversationEngine {
    /// Engine using the process-wide rate-limiter registry and a
    /// [`LoggingHandler`].
    pub fn new(config: impl Into<Arc<AgentConfig>>, model: Arc<dyn ChatModel>) -> Self {
        Self {
            config: config.into(),
            model,
            registry: RateLimiterRegistry::global(),
            event_handler: Arc::new(LoggingHandler),
            limiter: None,
            manager: None,
            state: EngineState::Init,
            run: None,
            last_error: None,
        }
    }

    /// Share rate limits through `registry` instead of the global one.
    pub fn with_registry(mut self, registry: Arc<RateLimiterRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_event_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.event_handler = Arc::new(handler);
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Typed error of the last failed `initialize()` or `run()`.
    pub fn last_error(&self) -> Option<&EngineError> {
        self.last_error.as_ref()
    }

    /// The started servers, available between `initialize()` and `shutdown()`.
    pub fn servers(&self) -> Option<&ServerManager> {
        self.manager.as_ref()
    }

    /// Validate the config, register its rate limits, and start every tool
    /// server. On failure no server process is left running and the engine
    /// is `Failed`.
    pub async fn initialize(&mut self) -> Result<(), EngineError> {
        if self.state != EngineState::Init {
            return Err(EngineError::InvalidState {
                operation: "initialize",
                state: self.state,
            });
        }

        let result = self.start_servers().await;
        match &result {
            Ok(()) => self.state = EngineState::Ready,
            Err(e) => {
                warn!("Engine initialization failed: {e}");
                self.state = EngineState::Failed;
            }
        }
        result
    }

    async fn start_servers(&mut self) -> Result<(), EngineError> {
        self.config.validate()?;
        self.limiter = Some(
            self.registry
                .register(&self.config.model, self.config.rate_limits),
        );

        let mut manager = ServerManager::from_declarations(
            &self.config.tool_servers,
            self.config.tool_call_timeout,
        );
        manager.start().await?;
        self.manager = Some(manager);
        Ok(())
    }

    /// Drive the turn loop for `prompt`.
    ///
    /// Fatal run failures are reported inside the returned [`AgentResult`]
    /// (and through [`last_error()`](Self::last_error)); `Err` means the
    /// engine was not `Ready`.
    pub async fn run(&mut self, prompt: &str) -> Result<AgentResult, EngineError> {
        if self.state != EngineState::Ready {
            return Err(EngineError::InvalidState {
                operation: "run",
                state: self.state,
            });
        }

        self.state = EngineState::Running;
        self.last_error = None;
        let run = RunState::new(&self.config, prompt);
        info!(
            "Run started: trace_id={}, model={}, max_turns={}",
            run.trace_id, self.config.model, self.config.max_turns
        );
        self.run = Some(run);

        let outcome = self.turn_loop().await;
        Ok(self.finish(outcome))
    }

    async fn turn_loop(&mut self) -> Result<(), EngineError> {
        let Self {
            config,
            model,
            event_handler,
            limiter,
            manager,
            run,
            ..
        } = self;
        let (Some(manager), Some(run)) = (manager.as_ref(), run.as_mut()) else {
            return Err(EngineError::InvalidState {
                operation: "run",
                state: EngineState::Running,
            });
        };
        let handler = event_handler.as_ref();
        let tools: Option<Vec<ToolDef>> = non_empty_tools(manager.catalog().definitions());

        loop {
            if run.turns_completed >= config.max_turns {
                handler.on_event(&EngineEvent::TurnLimitReached {
                    max_turns: config.max_turns,
                });
                return Err(EngineError::TurnBudgetExhausted {
                    turns_completed: run.turns_completed,
                    max_turns: config.max_turns,
                });
            }
            if run.deadline_passed() {
                handler.on_event(&EngineEvent::DeadlineExceeded {
                    timeout: config.timeout,
                });
                return Err(run.deadline_error(config.timeout));
            }

            // ── Rate limit ──
            if let Some(limiter) = limiter.as_ref() {
                match tokio::time::timeout_at(run.deadline, limiter.acquire()).await {
                    Ok(waited) if !waited.is_zero() => {
                        handler.on_event(&EngineEvent::RateLimitWait {
                            model: &config.model,
                            waited,
                        });
                    }
                    Ok(_) => {}
                    Err(_) => {
                        handler.on_event(&EngineEvent::DeadlineExceeded {
                            timeout: config.timeout,
                        });
                        return Err(run.deadline_error(config.timeout));
                    }
                }
            }

            // ── Model call ──
            let turn = run.turns_completed + 1;
            handler.on_event(&EngineEvent::TurnStart {
                turn,
                max_turns: config.max_turns,
            });
            let request = build_request(config, &run.messages, &tools);
            let completion =
                request_completion(model.as_ref(), &request, &config.retry, handler).await?;
            run.turns_completed = turn;

            let (prompt_tokens, completion_tokens) = completion.token_counts();
            run.cost
                .record(prompt_tokens, completion_tokens, config.pricing.as_ref());
            if completion.usage.is_some() {
                handler.on_event(&EngineEvent::TokenUsage {
                    prompt_tokens,
                    completion_tokens,
                });
            }

            let text = completion.content.unwrap_or_default();
            if !text.is_empty() {
                handler.on_event(&EngineEvent::Text(&text));
            }

            if completion.tool_calls.is_empty() {
                run.messages.push(Message::assistant_text(&text));
                run.turns.push(Turn::assistant(text, Vec::new()));
                handler.on_event(&EngineEvent::Finished);
                return Ok(());
            }

            // ── Tool calls ──
            let calls = completion.tool_calls;
            handler.on_event(&EngineEvent::ToolCallsReceived {
                turn,
                count: calls.len(),
            });
            run.messages.push(Message::assistant_tool_calls(
                (!text.is_empty()).then(|| text.clone()),
                calls.clone(),
            ));
            let pending = calls
                .iter()
                .map(|c| ToolCallRecord::pending(&c.id, &c.function.name, Default::default()))
                .collect();
            let assistant_index = run.turns.len();
            run.turns.push(Turn::assistant(text, pending));

            for (i, call) in calls.iter().enumerate() {
                if run.deadline_passed() {
                    for (j, skipped) in calls.iter().enumerate().skip(i) {
                        run.turns[assistant_index].tool_calls[j] =
                            skipped_call(skipped, "run deadline exceeded");
                    }
                    handler.on_event(&EngineEvent::DeadlineExceeded {
                        timeout: config.timeout,
                    });
                    return Err(run.deadline_error(config.timeout));
                }

                let record = execute_tool_call(manager, call, handler).await;
                run.messages
                    .push(Message::tool_result(&call.id, record.output()));
                run.turns.push(Turn::tool(&call.id, record.output()));
                run.turns[assistant_index].tool_calls[i] = record;
            }
        }
    }

    /// Freeze the run state into a result and settle the engine state.
    fn finish(&mut self, outcome: Result<(), EngineError>) -> AgentResult {
        let (state, result_outcome, error) = match outcome {
            Ok(()) => (EngineState::Completed, RunOutcome::Completed, None),
            Err(e) => {
                let state = if e.is_timeout() {
                    EngineState::TimedOut
                } else {
                    EngineState::Failed
                };
                let result_outcome = match (&e, state) {
                    (EngineError::Cancelled { .. }, _) => RunOutcome::Cancelled,
                    (_, EngineState::TimedOut) => RunOutcome::TimedOut,
                    _ => RunOutcome::Failed,
                };
                (state, result_outcome, Some(e))
            }
        };
        self.state = state;

        let result = match self.run.take() {
            Some(run) => self.seal(run, result_outcome, error.as_ref()),
            None => self.empty_result(result_outcome, error.as_ref()),
        };
        self.last_error = error;

        match &self.last_error {
            None => info!(
                "Run completed: trace_id={}, turns={}, tokens={}, est. cost=${:.4}",
                result.trace_id,
                result.turns_completed,
                result.usage.total,
                result.estimated_cost_usd
            ),
            Some(e) => warn!(
                "Run ended ({}): trace_id={}, turns={}: {e}",
                result.outcome, result.trace_id, result.turns_completed
            ),
        }
        result
    }

    fn seal(&self, run: RunState, outcome: RunOutcome, error: Option<&EngineError>) -> AgentResult {
        let mut usage = TokenUsage::default();
        usage.add(run.cost.total_prompt_tokens, run.cost.total_completion_tokens);

        // Token usage is known only now, so the limiter learns it after the
        // fact: the run that crosses the budget is not itself throttled.
        if let Some(limiter) = &self.limiter {
            limiter.record_tokens(usage.total);
        }

        AgentResult {
            trace_id: run.trace_id,
            model: self.config.model.clone(),
            started_at: run.started_at,
            turns: run.turns,
            success: outcome == RunOutcome::Completed,
            outcome,
            error: error.map(ToString::to_string),
            turns_completed: run.turns_completed,
            duration: run.clock.elapsed(),
            usage,
            estimated_cost_usd: run.cost.estimated_cost_usd,
        }
    }

    fn empty_result(&self, outcome: RunOutcome, error: Option<&EngineError>) -> AgentResult {
        AgentResult {
            trace_id: generate_trace_id(),
            model: self.config.model.clone(),
            started_at: Utc::now(),
            turns: Vec::new(),
            success: outcome == RunOutcome::Completed,
            outcome,
            error: error.map(ToString::to_string),
            turns_completed: 0,
            duration: Duration::ZERO,
            usage: TokenUsage::default(),
            estimated_cost_usd: 0.0,
        }
    }

    /// Recover the partial transcript of a `run()` whose future was dropped
    /// before it finished (for example by an outer timeout).
    ///
    /// Returns `None` when no run was interrupted. The engine ends `Failed`
    /// (or stays `ShutDown`); `shutdown()` is still required.
    pub fn cancelled_result(&mut self) -> Option<AgentResult> {
        let turns_completed = self.run.as_ref()?.turns_completed;
        let state = self.state;
        let result = self.finish(Err(EngineError::Cancelled { turns_completed }));
        if state == EngineState::ShutDown {
            self.state = state;
        }
        Some(result)
    }

    /// Stop every tool server. Safe to call in any state, any number of
    /// times; only the first call does work.
    pub async fn shutdown(&mut self) {
        if self.state == EngineState::ShutDown {
            return;
        }
        if let Some(mut manager) = self.manager.take() {
            manager.shutdown().await;
        }
        info!("Engine shut down (was {})", self.state);
        self.state = EngineState::ShutDown;
    }

    /// Initialize, run, and shut down, always yielding a result.
    pub async fn run_to_completion(&mut self, prompt: &str) -> AgentResult {
        let result = match self.initialize().await {
            Ok(()) => match self.run(prompt).await {
                Ok(result) => result,
                Err(e) => self.finish(Err(e)),
            },
            Err(e) => self.finish(Err(e)),
        };
        self.shutdown().await;
        result
    }

    /// One-call convenience over [`run_to_completion`](Self::run_to_completion)
    /// with the global registry and default logging.
    pub async fn execute(
        config: impl Into<Arc<AgentConfig>>,
        model: Arc<dyn ChatModel>,
        prompt: &str,
    ) -> AgentResult {
        Self::new(config, model).run_to_completion(prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::{ChatCompletion, ChatRequest, ModelFuture, ToolCall};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays queued responses; an exhausted queue is a final answer.
    struct Replay {
        responses: Mutex<VecDeque<Result<ChatCompletion, ModelError>>>,
        delay: Duration,
    }

    impl Replay {
        fn new(responses: Vec<Result<ChatCompletion, ModelError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                delay: Duration::ZERO,
            })
        }

        fn slow(responses: Vec<Result<ChatCompletion, ModelError>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                delay,
            })
        }
    }

    impl ChatModel for Replay {
        fn complete<'a>(&'a self, _request: &'a ChatRequest) -> ModelFuture<'a> {
            Box::pin(async move {
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                self.responses
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| Ok(ChatCompletion::text("done")))
            })
        }
    }

    fn engine(config: AgentConfig, model: Arc<dyn ChatModel>) -> ConversationEngine {
        ConversationEngine::new(config, model).with_registry(Arc::new(RateLimiterRegistry::new()))
    }

    #[tokio::test]
    async fn state_machine_happy_path() {
        let model = Replay::new(vec![Ok(ChatCompletion::text("hello").with_usage(10, 2))]);
        let mut engine = engine(AgentConfig::new("m"), model);
        assert_eq!(engine.state(), EngineState::Init);

        engine.initialize().await.unwrap();
        assert_eq!(engine.state(), EngineState::Ready);

        let result = engine.run("hi").await.unwrap();
        assert_eq!(engine.state(), EngineState::Completed);
        assert!(result.success);
        assert_eq!(result.final_text(), Some("hello"));
        assert_eq!(result.usage.total, 12);
        assert_eq!(result.turns.len(), 2);

        assert!(matches!(
            engine.run("again").await,
            Err(EngineError::InvalidState { .. })
        ));
        engine.shutdown().await;
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::ShutDown);
    }

    #[tokio::test]
    async fn run_before_initialize_is_rejected() {
        let mut engine = engine(AgentConfig::new("m"), Replay::new(vec![]));
        let err = engine.run("hi").await.unwrap_err();
        assert!(err.to_string().contains("init"), "{err}");
    }

    #[tokio::test]
    async fn invalid_config_fails_initialize() {
        let mut engine = engine(AgentConfig::new(""), Replay::new(vec![]));
        let result = engine.run_to_completion("hi").await;
        assert!(!result.success);
        assert_eq!(result.outcome, RunOutcome::Failed);
        assert!(matches!(engine.last_error(), Some(EngineError::Config(_))));
        assert_eq!(engine.state(), EngineState::ShutDown);
    }

    #[tokio::test]
    async fn turn_budget_keeps_partial_transcript() {
        let model = Replay::new(vec![Ok(ChatCompletion::tool_calls(vec![
            ToolCall::new("c1", "lookup", "{}"),
        ]))]);
        let mut engine = engine(AgentConfig::new("m").with_max_turns(1), model);
        engine.initialize().await.unwrap();
        let result = engine.run("go").await.unwrap();

        assert_eq!(engine.state(), EngineState::TimedOut);
        assert_eq!(result.outcome, RunOutcome::TimedOut);
        assert_eq!(result.turns_completed, 1);
        assert_eq!(engine.last_error().and_then(|e| e.turns_completed()), Some(1));
        // user, assistant (tool request), tool (unknown tool error)
        assert_eq!(result.turns.len(), 3);
        assert!(result.turns[2].text.contains("unknown tool"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_between_calls() {
        let model = Replay::slow(
            vec![
                Ok(ChatCompletion::tool_calls(vec![ToolCall::new("c1", "x", "{}")])),
                Ok(ChatCompletion::tool_calls(vec![ToolCall::new("c2", "x", "{}")])),
            ],
            Duration::from_secs(4),
        );
        let config = AgentConfig::new("m")
            .with_max_turns(10)
            .with_timeout(Duration::from_secs(6));
        let mut engine = engine(config, model);
        engine.initialize().await.unwrap();
        let result = engine.run("go").await.unwrap();

        assert_eq!(result.outcome, RunOutcome::TimedOut);
        // The second call started before the deadline and was allowed to finish.
        assert_eq!(result.turns_completed, 2);
        assert!(matches!(
            engine.last_error(),
            Some(EngineError::DeadlineExceeded { turns_completed: 2, .. })
        ));
    }

    #[tokio::test]
    async fn non_transient_model_error_fails_run() {
        let model = Replay::new(vec![Err(ModelError::Http {
            status: 400,
            body: "bad request".into(),
        })]);
        let mut engine = engine(AgentConfig::new("m"), model);
        let result = engine.run_to_completion("go").await;
        assert_eq!(result.outcome, RunOutcome::Failed);
        assert!(result.error.as_deref().unwrap_or_default().contains("bad request"));
        assert_eq!(result.turns_completed, 0);
        assert_eq!(result.turns.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_run_is_recoverable() {
        let model = Replay::slow(vec![], Duration::from_secs(30));
        let mut engine = engine(AgentConfig::new("m"), model);
        engine.initialize().await.unwrap();

        let cancelled = tokio::time::timeout(Duration::from_secs(1), engine.run("go")).await;
        assert!(cancelled.is_err());
        assert_eq!(engine.state(), EngineState::Running);

        let result = engine.cancelled_result().unwrap();
        assert_eq!(result.outcome, RunOutcome::Cancelled);
        assert_eq!(result.turns.len(), 1);
        assert_eq!(engine.state(), EngineState::Failed);
        assert!(engine.cancelled_result().is_none());
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::ShutDown);
    }
}
