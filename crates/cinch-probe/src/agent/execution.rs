//! Per-turn mechanics: request building, the retried model call, and tool
//! dispatch.
//!
//! These are called by [`super::engine::ConversationEngine::run()`]; each one
//! handles a single step of the turn loop and reports through the event
//! handler.

use super::config::AgentConfig;
use super::events::{EngineEvent, EventHandler};
use super::result::ToolCallRecord;
use crate::api::retry::{RetryPolicy, with_retry};
use crate::error::ModelError;
use crate::tools::catalog::{log_tool_call, parse_arguments};
use crate::tools::manager::ServerManager;
use crate::{ChatCompletion, ChatModel, ChatRequest, Message, ToolCall, ToolDef};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::warn;

// ── Send request ──────────────────────────────────────────────────

pub(crate) fn build_request(
    config: &AgentConfig,
    messages: &[Message],
    tools: &Option<Vec<ToolDef>>,
) -> ChatRequest {
    ChatRequest {
        model: config.model.clone(),
        messages: messages.to_vec(),
        max_tokens: config.max_tokens,
        temperature: config.temperature,
        tools: tools.clone(),
    }
}

/// `None` when there are no tools, so the field is omitted from the request.
pub(crate) fn non_empty_tools(defs: Vec<ToolDef>) -> Option<Vec<ToolDef>> {
    if defs.is_empty() { None } else { Some(defs) }
}

/// One model call under the retry policy. Only rate-limited failures are
/// retried; each scheduled retry is reported as an event.
pub(crate) async fn request_completion(
    model: &dyn ChatModel,
    request: &ChatRequest,
    policy: &RetryPolicy,
    event_handler: &dyn EventHandler,
) -> Result<ChatCompletion, ModelError> {
    with_retry(
        policy,
        || model.complete(request),
        |notice| {
            let error = notice.error.to_string();
            event_handler.on_event(&EngineEvent::RetryScheduled {
                attempt: notice.attempt,
                delay: notice.delay,
                error: &error,
            });
        },
    )
    .await
}

// ── Tool execution ────────────────────────────────────────────────

/// Run one tool call and record its outcome.
///
/// Nothing here fails the run: malformed arguments, unknown names, schema
/// violations and server-side failures all become the record's `error`,
/// which is handed back to the model as the tool's output.
pub(crate) async fn execute_tool_call(
    manager: &ServerManager,
    call: &ToolCall,
    event_handler: &dyn EventHandler,
) -> ToolCallRecord {
    let name = call.function.name.as_str();
    log_tool_call(name, &call.function.arguments);
    event_handler.on_event(&EngineEvent::ToolExecuting {
        name,
        arguments: &call.function.arguments,
    });

    let start = Instant::now();
    let (arguments, outcome) = dispatch(manager, name, &call.function.arguments).await;

    let mut record = ToolCallRecord::pending(&call.id, name, arguments);
    record.duration = start.elapsed();
    match outcome {
        Ok(result) => record.result = Some(result),
        Err(error) => {
            warn!("Tool {name} failed: {error}");
            record.error = Some(error);
        }
    }

    event_handler.on_event(&EngineEvent::ToolResult {
        name,
        call_id: &call.id,
        result: record.output(),
        is_error: record.is_error(),
    });
    record
}

async fn dispatch(
    manager: &ServerManager,
    name: &str,
    raw_arguments: &str,
) -> (Map<String, Value>, Result<String, String>) {
    let arguments = match parse_arguments(name, raw_arguments) {
        Ok(map) => map,
        Err(e) => return (Map::new(), Err(e)),
    };

    let Some(entry) = manager.catalog().get(name) else {
        let message = format!(
            "Error: unknown tool '{name}'. Available tools: {}",
            manager.catalog().names().join(", ")
        );
        return (arguments, Err(message));
    };

    if let Some(message) = entry.validate_arguments(&arguments) {
        return (arguments, Err(message));
    }

    let outcome = manager
        .call_tool(name, &arguments)
        .await
        .map_err(|e| e.to_string());
    (arguments, outcome)
}

/// Record for a call the run never reached.
pub(crate) fn skipped_call(call: &ToolCall, reason: &str) -> ToolCallRecord {
    let arguments = parse_arguments(&call.function.name, &call.function.arguments)
        .unwrap_or_default();
    let mut record = ToolCallRecord::pending(&call.id, &call.function.name, arguments);
    record.error = Some(format!("Error: not executed: {reason}"));
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::events::NoopHandler;
    use crate::error::ModelError;
    use crate::{ModelFuture, ToolCall};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FlakyModel {
        failures: u32,
        calls: AtomicU32,
    }

    impl ChatModel for FlakyModel {
        fn complete<'a>(&'a self, _request: &'a ChatRequest) -> ModelFuture<'a> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n < self.failures {
                    Err(ModelError::RateLimited {
                        retry_after: Some(Duration::from_millis(10)),
                        message: "429".into(),
                    })
                } else {
                    Ok(ChatCompletion::text("ok"))
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_reported_as_events() {
        let model = FlakyModel {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let attempts = Mutex::new(Vec::new());
        let handler = crate::agent::events::FnEventHandler::new(|event| {
            if let EngineEvent::RetryScheduled { attempt, .. } = event {
                attempts.lock().unwrap().push(*attempt);
            }
        });
        let config = AgentConfig::new("m");
        let request = build_request(&config, &[Message::user("hi")], &None);

        let completion = request_completion(&model, &request, &RetryPolicy::default(), &handler)
            .await
            .unwrap();
        assert_eq!(completion.content.as_deref(), Some("ok"));
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
        assert_eq!(*attempts.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_not_dispatched() {
        let manager = ServerManager::new(Vec::new());
        let call = ToolCall::new("c1", "missing", r#"{"x": 1}"#);
        let record = execute_tool_call(&manager, &call, &NoopHandler).await;
        assert!(record.is_error());
        assert!(record.output().contains("unknown tool 'missing'"));
        assert_eq!(record.arguments["x"], 1);
    }

    #[tokio::test]
    async fn malformed_arguments_are_reported() {
        let manager = ServerManager::new(Vec::new());
        let call = ToolCall::new("c1", "anything", "{not json");
        let record = execute_tool_call(&manager, &call, &NoopHandler).await;
        assert!(record.output().contains("invalid JSON arguments"));
        assert!(record.arguments.is_empty());
    }

    #[test]
    fn request_carries_config_parameters() {
        let config = AgentConfig::new("test/model")
            .with_max_tokens(256)
            .with_temperature(0.2);
        let tools = non_empty_tools(vec![ToolDef::new("t", "d", serde_json::json!({}))]);
        let request = build_request(&config, &[Message::user("hi")], &tools);
        assert_eq!(request.model, "test/model");
        assert_eq!(request.max_tokens, 256);
        assert_eq!(request.tools.as_ref().map(Vec::len), Some(1));
        assert!(non_empty_tools(Vec::new()).is_none());
    }
}
