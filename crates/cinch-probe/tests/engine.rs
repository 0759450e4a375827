//! End-to-end runs of the conversation engine against real tool servers and
//! a scripted model.

mod common;

use cinch_probe::agent::{
    AgentConfig, ConversationEngine, EngineState, RunOutcome, ToolServerDeclaration, TurnRole,
};
use cinch_probe::api::rate_limit::{RateLimiterRegistry, RateLimits};
use cinch_probe::api::retry::RetryPolicy;
use cinch_probe::error::{EngineError, ModelError};
use cinch_probe::{ChatCompletion, ChatModel, MessageRole};
use common::{ScriptedModel, calls, echo_server, pid_alive, rate_limited};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn fast_retry(retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries: retries,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        multiplier: 2.0,
        jitter: false,
    }
}

fn bank_config() -> AgentConfig {
    AgentConfig::new("test/model")
        .with_tool_server(echo_server("bank", "bank_"))
        .with_retry(fast_retry(0))
        .with_timeout(Duration::from_secs(30))
}

fn engine(config: AgentConfig, model: &Arc<ScriptedModel>) -> ConversationEngine {
    let model: Arc<dyn ChatModel> = model.clone();
    ConversationEngine::new(config, model).with_registry(Arc::new(RateLimiterRegistry::new()))
}

#[tokio::test]
async fn stateful_tool_calls_execute_in_order() {
    let model = Arc::new(ScriptedModel::new(vec![
        Ok(calls(&[
            ("bank_deposit", r#"{"amount": 40}"#),
            ("bank_deposit", r#"{"amount": 2}"#),
        ])),
        Ok(calls(&[("bank_balance", "{}")])),
        Ok(ChatCompletion::text("The balance is 42.").with_usage(50, 5)),
    ]));
    let mut engine = engine(bank_config(), &model);
    engine.initialize().await.unwrap();
    assert_eq!(engine.state(), EngineState::Ready);

    let result = engine.run("Deposit 40 then 2, then report the balance").await.unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.outcome, RunOutcome::Completed);
    assert_eq!(engine.state(), EngineState::Completed);
    assert_eq!(result.turns_completed, 3);
    assert_eq!(result.final_text(), Some("The balance is 42."));
    assert_eq!(result.usage.prompt, 250);
    assert_eq!(result.usage.completion, 25);
    assert_eq!(result.usage.total, 275);

    let records: Vec<_> = result.tool_calls().collect();
    assert_eq!(records.len(), 3);
    assert_eq!(records[2].name, "bank_balance");
    assert_eq!(records[2].output(), "42");
    assert!(records.iter().all(|r| !r.is_error()));

    // Every tool result reaches the model with its call id, in request order.
    let third = &model.requests()[2];
    let tool_messages: Vec<_> = third
        .messages
        .iter()
        .filter(|m| m.role == MessageRole::Tool)
        .collect();
    assert_eq!(tool_messages.len(), 2);
    assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("call_0"));
    assert_eq!(tool_messages[1].tool_call_id.as_deref(), Some("call_1"));
    assert!(third.tools.as_ref().is_some_and(|t| !t.is_empty()));

    engine.shutdown().await;
    assert_eq!(engine.state(), EngineState::ShutDown);
}

#[tokio::test]
async fn turn_budget_keeps_the_partial_transcript() {
    let model = Arc::new(ScriptedModel::new(vec![Ok(calls(&[
        ("bank_deposit", r#"{"amount": 1}"#),
        ("bank_balance", "{}"),
    ]))]));
    let mut engine = engine(bank_config().with_max_turns(1), &model);
    engine.initialize().await.unwrap();

    let result = engine.run("Keep going").await.unwrap();
    assert!(!result.success);
    assert_eq!(result.outcome, RunOutcome::TimedOut);
    assert!(result.is_timeout());
    assert_eq!(result.turns_completed, 1);
    assert_eq!(engine.state(), EngineState::TimedOut);
    assert!(matches!(
        engine.last_error(),
        Some(EngineError::TurnBudgetExhausted {
            turns_completed: 1,
            max_turns: 1
        })
    ));

    // user, assistant with both calls, and one tool turn per call.
    let roles: Vec<_> = result.turns.iter().map(|t| t.role).collect();
    assert_eq!(
        roles,
        [TurnRole::User, TurnRole::Assistant, TurnRole::Tool, TurnRole::Tool]
    );
    assert_eq!(result.turns[1].tool_calls.len(), 2);
    assert_eq!(result.turns[1].tool_calls[1].output(), "1");
    assert_eq!(model.call_count(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn transient_model_errors_are_retried() {
    let model = Arc::new(ScriptedModel::new(vec![
        rate_limited(),
        rate_limited(),
        Ok(ChatCompletion::text("third time lucky")),
    ]));
    let config = AgentConfig::new("test/model").with_retry(fast_retry(3));
    let mut engine = engine(config, &model);

    let result = engine.run_to_completion("hello").await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.turns_completed, 1);
    assert_eq!(model.call_count(), 3);
    assert_eq!(result.final_text(), Some("third time lucky"));
}

#[tokio::test]
async fn exhausted_retries_fail_the_run() {
    let model = Arc::new(ScriptedModel::new(vec![
        rate_limited(),
        rate_limited(),
        rate_limited(),
    ]));
    let config = AgentConfig::new("test/model").with_retry(fast_retry(1));
    let mut engine = engine(config, &model);

    let result = engine.run_to_completion("hello").await;
    assert_eq!(result.outcome, RunOutcome::Failed);
    assert_eq!(model.call_count(), 2);
    assert!(matches!(
        engine.last_error(),
        Some(EngineError::RateLimitExhausted(ModelError::RateLimited { .. }))
    ));
    assert_eq!(engine.state(), EngineState::ShutDown);
}

#[tokio::test]
async fn unknown_tool_is_reported_back_to_the_model() {
    let model = Arc::new(ScriptedModel::new(vec![
        Ok(calls(&[("bank_withdraw", r#"{"amount": 5}"#)])),
        Ok(ChatCompletion::text("Sorry, I can't withdraw.")),
    ]));
    let mut engine = engine(bank_config(), &model);
    let result = engine.run_to_completion("Withdraw 5").await;
    assert!(result.success);

    let record = result.tool_calls().next().unwrap();
    assert!(record.is_error());
    assert!(record.output().contains("unknown tool 'bank_withdraw'"), "{}", record.output());
    assert!(record.output().contains("bank_deposit"));

    let follow_up = &model.requests()[1];
    let tool_message = follow_up
        .messages
        .iter()
        .find(|m| m.role == MessageRole::Tool)
        .unwrap();
    assert_eq!(tool_message.content.as_deref(), Some(record.output()));
}

#[tokio::test]
async fn deadline_stops_the_run_between_turns() {
    let model = Arc::new(
        ScriptedModel::new(vec![
            Ok(calls(&[("bank_balance", "{}")])),
            Ok(calls(&[("bank_balance", "{}")])),
            Ok(calls(&[("bank_balance", "{}")])),
        ])
        .with_delay(Duration::from_millis(300)),
    );
    let config = bank_config().with_timeout(Duration::from_millis(500));
    let mut engine = engine(config, &model);

    let started = Instant::now();
    let result = engine.run_to_completion("Loop").await;
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(result.outcome, RunOutcome::TimedOut);
    assert_eq!(result.turns_completed, 2);
    assert!(matches!(
        engine.last_error(),
        Some(EngineError::DeadlineExceeded {
            turns_completed: 2,
            ..
        })
    ));
}

#[tokio::test]
async fn engines_share_limiters_through_the_registry() {
    let registry = Arc::new(RateLimiterRegistry::new());
    for rpm in [100, 50] {
        let model: Arc<dyn ChatModel> = Arc::new(ScriptedModel::new(vec![Ok(
            ChatCompletion::text("ok").with_usage(30, 3),
        )]));
        let config = AgentConfig::new("shared/model").with_rate_limits(RateLimits::rpm(rpm));
        let result = ConversationEngine::new(config, model)
            .with_registry(Arc::clone(&registry))
            .run_to_completion("hi")
            .await;
        assert!(result.success);
    }

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].model, "shared/model");
    assert_eq!(snapshot[0].limits.rpm, Some(50));
    assert_eq!(snapshot[0].requests_in_window, 2);
    assert_eq!(snapshot[0].tokens_in_window, 66);
}

#[tokio::test]
async fn run_to_completion_stops_every_server() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("bank.pid");
    let config = AgentConfig::new("test/model")
        .with_tool_server(
            echo_server("bank", "bank_")
                .with_env("PROBE_ECHO_PID_FILE", pid_file.to_string_lossy()),
        )
        .with_retry(fast_retry(0));
    let model = Arc::new(ScriptedModel::new(vec![
        Ok(calls(&[("bank_deposit", r#"{"amount": 3}"#)])),
        Ok(ChatCompletion::text("done")),
    ]));
    let mut engine = engine(config, &model);

    let result = engine.run_to_completion("Deposit 3").await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(engine.state(), EngineState::ShutDown);
    assert!(engine.servers().is_none());

    let pid: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    #[cfg(target_os = "linux")]
    assert!(!pid_alive(pid), "tool server pid {pid} survived the run");
    let _ = pid;
}

#[tokio::test]
async fn server_start_failure_is_reported_in_the_result() {
    let config = AgentConfig::new("test/model")
        .with_tool_server(echo_server("bank", "bank_"))
        .with_tool_server(ToolServerDeclaration::persistent("ghost", "cinch-probe-no-such-binary"));
    let model = Arc::new(ScriptedModel::new(Vec::new()));
    let mut engine = engine(config, &model);

    let result = engine.run_to_completion("hi").await;
    assert_eq!(result.outcome, RunOutcome::Failed);
    assert!(result.error.as_deref().is_some_and(|e| e.contains("ghost")));
    assert_eq!(result.turns_completed, 0);
    assert_eq!(model.call_count(), 0);
    assert!(matches!(engine.last_error(), Some(EngineError::ServerStart(_))));
}

#[tokio::test]
async fn result_serializes_to_json_and_back() {
    let model = Arc::new(ScriptedModel::new(vec![
        Ok(calls(&[("bank_echo", r#"{"text": "ping"}"#)])),
        Ok(ChatCompletion::text("pong")),
    ]));
    let mut engine = engine(bank_config(), &model);
    let mut result = engine.run_to_completion("ping").await;
    // Durations are stored at millisecond precision.
    result.duration = Duration::from_millis(result.duration.as_millis() as u64);
    for record in result.turns.iter_mut().flat_map(|t| t.tool_calls.iter_mut()) {
        record.duration = Duration::from_millis(record.duration.as_millis() as u64);
    }

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["outcome"], "completed");
    assert!(json["duration_ms"].is_u64());
    assert_eq!(json["turns"][1]["tool_calls"][0]["result"], "ping");

    let back: cinch_probe::agent::AgentResult = serde_json::from_value(json).unwrap();
    assert_eq!(back, result);
}
