//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use cinch_probe::agent::config::{ToolServerDeclaration, WaitSpec};
use cinch_probe::error::ModelError;
use cinch_probe::{ChatCompletion, ChatModel, ChatRequest, ModelFuture, ToolCall};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Path of the reference tool server built alongside the tests.
pub const ECHO_SERVER: &str = env!("CARGO_BIN_EXE_probe-echo-server");

/// Persistent declaration for the echo server, with a tool-name prefix so
/// several instances can share one catalog.
pub fn echo_server(id: &str, prefix: &str) -> ToolServerDeclaration {
    ToolServerDeclaration::persistent(id, ECHO_SERVER)
        .with_env("PROBE_ECHO_PREFIX", prefix)
        .with_wait(WaitSpec::ready())
}

/// Chat model that replays a script and records every request it saw.
///
/// When the script runs out it answers `"done"`.
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<ChatCompletion, ModelError>>>,
    requests: Mutex<Vec<ChatRequest>>,
    delay: Duration,
}

impl ScriptedModel {
    pub fn new(script: Vec<Result<ChatCompletion, ModelError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Each response takes `delay` to arrive.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl ChatModel for ScriptedModel {
    fn complete<'a>(&'a self, request: &'a ChatRequest) -> ModelFuture<'a> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ChatCompletion::text("done")))
        })
    }
}

/// A response requesting the given `(name, json arguments)` calls in order.
pub fn calls(specs: &[(&str, &str)]) -> ChatCompletion {
    ChatCompletion::tool_calls(
        specs
            .iter()
            .enumerate()
            .map(|(i, (name, args))| ToolCall::new(format!("call_{i}"), *name, *args))
            .collect(),
    )
    .with_usage(100, 10)
}

pub fn rate_limited() -> Result<ChatCompletion, ModelError> {
    Err(ModelError::RateLimited {
        retry_after: Some(Duration::from_millis(20)),
        message: "429 Too Many Requests".into(),
    })
}

/// Whether a process with `pid` is still alive (and not a zombie).
#[cfg(target_os = "linux")]
pub fn pid_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !stat
            .rsplit(')')
            .next()
            .is_some_and(|rest| rest.trim_start().starts_with('Z')),
        Err(_) => false,
    }
}

/// Liveness can't be observed portably; callers only assert on Linux.
#[cfg(not(target_os = "linux"))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}
