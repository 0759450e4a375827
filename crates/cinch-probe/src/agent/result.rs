//! The conversation record handed back to the caller.
//!
//! An [`AgentResult`] is produced once per run, on every path: success,
//! failure, timeout, and cancellation all carry the transcript collected up
//! to that point. It serializes to plain JSON so report renderers can consume
//! it without linking this crate.

use crate::agent::config::duration_ms;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

// ── Transcript ─────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    Tool,
}

/// One tool invocation requested by the model.
///
/// Exactly one of `result` / `error` is set once the call has run; both are
/// `None` while it is in flight.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolCallRecord {
    /// Call id assigned by the model.
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
}

impl ToolCallRecord {
    pub fn pending(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            result: None,
            error: None,
            duration: Duration::ZERO,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The text handed back to the model for this call.
    pub fn output(&self) -> &str {
        self.error
            .as_deref()
            .or(self.result.as_deref())
            .unwrap_or_default()
    }
}

/// One exchange in the conversation.
///
/// Assistant turns list the tool calls they requested, in request order.
/// Each tool turn carries one call's output and the id it answers.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Turn {
    pub role: TurnRole,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(text: impl Into<String>, tool_calls: Vec<ToolCallRecord>) -> Self {
        Self {
            role: TurnRole::Assistant,
            text: text.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Tool,
            text: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

// ── Result ─────────────────────────────────────────────────────────

/// How a run ended.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Failed => write!(f, "failed"),
            RunOutcome::TimedOut => write!(f, "timed_out"),
            RunOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Token counts for a whole run.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn add(&mut self, prompt: u64, completion: u64) {
        self.prompt += prompt;
        self.completion += completion;
        self.total = self.prompt + self.completion;
    }
}

/// Everything a run produced. Immutable once returned.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AgentResult {
    pub trace_id: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub turns: Vec<Turn>,
    pub success: bool,
    pub outcome: RunOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Model calls that returned a response.
    pub turns_completed: u32,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    pub usage: TokenUsage,
    pub estimated_cost_usd: f64,
}

impl AgentResult {
    /// Text of the last assistant turn, if any.
    pub fn final_text(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == TurnRole::Assistant)
            .map(|t| t.text.as_str())
    }

    /// Every tool call of the run, in execution order.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallRecord> {
        self.turns.iter().flat_map(|t| t.tool_calls.iter())
    }

    pub fn is_timeout(&self) -> bool {
        self.outcome == RunOutcome::TimedOut
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> AgentResult {
        let mut transfer = ToolCallRecord::pending(
            "call_1",
            "bank_transfer",
            json!({"from": "a", "to": "b", "amount": 25, "memo": null})
                .as_object()
                .cloned()
                .unwrap(),
        );
        transfer.result = Some("ok".into());
        transfer.duration = Duration::from_millis(12);

        let mut balance = ToolCallRecord::pending(
            "call_2",
            "bank_balance",
            json!({"account": "b", "tags": ["x", "y"]}).as_object().cloned().unwrap(),
        );
        balance.error = Some("tool 'bank_balance' failed: locked".into());
        balance.duration = Duration::from_millis(3);

        let mut usage = TokenUsage::default();
        usage.add(120, 30);
        usage.add(200, 12);

        AgentResult {
            trace_id: "tr-1".into(),
            model: "test/model".into(),
            started_at: Utc::now(),
            turns: vec![
                Turn::user("move 25 from a to b"),
                Turn::assistant("", vec![transfer, balance]),
                Turn::tool("call_1", "ok"),
                Turn::tool("call_2", "tool 'bank_balance' failed: locked"),
                Turn::assistant("done", vec![]),
            ],
            success: true,
            outcome: RunOutcome::Completed,
            error: None,
            turns_completed: 2,
            duration: Duration::from_millis(1500),
            usage,
            estimated_cost_usd: 0.0125,
        }
    }

    #[test]
    fn json_round_trip_preserves_transcript_and_usage() {
        let original = sample();
        let json = serde_json::to_string(&original).unwrap();
        let back: AgentResult = serde_json::from_str(&json).unwrap();

        assert_eq!(back, original);
        let names: Vec<&str> = back.tool_calls().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["bank_transfer", "bank_balance"]);
        assert_eq!(back.tool_calls().next().unwrap().arguments["memo"], Value::Null);
        assert_eq!(back.usage.total, 362);
    }

    #[test]
    fn usage_serializes_with_flat_keys() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["usage"], json!({"prompt": 320, "completion": 42, "total": 362}));
        assert_eq!(value["outcome"], "completed");
        assert_eq!(value["duration_ms"], 1500);
    }

    #[test]
    fn final_text_and_record_output() {
        let result = sample();
        assert_eq!(result.final_text(), Some("done"));
        let calls: Vec<_> = result.tool_calls().collect();
        assert_eq!(calls[0].output(), "ok");
        assert!(calls[1].is_error());
        assert!(calls[1].output().contains("locked"));
    }
}
