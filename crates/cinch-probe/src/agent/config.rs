//! Configuration types for the [`ConversationEngine`](super::engine::ConversationEngine).
//!
//! An [`AgentConfig`] is resolved by the caller (from a file, a test case, or
//! code) and handed to the engine read-only. It deserializes with `serde`, and
//! [`AgentConfig::json_schema`] exports the matching JSON Schema for
//! collaborators that validate configuration files up front.
//!
//! # Examples
//!
//! ```ignore
//! let config = AgentConfig::new("anthropic/claude-sonnet-4")
//!     .with_system_prompt("You are a banking assistant.")
//!     .with_max_turns(8)
//!     .with_tool_server(
//!         ToolServerDeclaration::persistent("bank", "bank-server")
//!             .with_args(["--stdio"])
//!             .with_wait(WaitSpec::tools(["deposit", "balance"], Duration::from_secs(10))),
//!     )
//!     .with_rate_limits(RateLimits::rpm(30));
//! ```

use crate::api::rate_limit::RateLimits;
use crate::api::retry::RetryPolicy;
use crate::api::tracing::ModelPricing;
use crate::error::ConfigError;
use crate::tools::catalog::DEFAULT_MAX_RESULT_BYTES;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_MAX_TURNS: u32 = 10;
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Durations travel as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

fn default_max_turns() -> u32 {
    DEFAULT_MAX_TURNS
}
fn default_run_timeout() -> Duration {
    DEFAULT_RUN_TIMEOUT
}
fn default_tool_call_timeout() -> Duration {
    DEFAULT_TOOL_CALL_TIMEOUT
}
fn default_wait_timeout() -> Duration {
    DEFAULT_WAIT_TIMEOUT
}
fn default_help_args() -> Vec<String> {
    vec!["--help".to_string()]
}

fn default_max_result_bytes() -> usize {
    DEFAULT_MAX_RESULT_BYTES
}

// ── Wait strategies ────────────────────────────────────────────────

/// Readiness condition applied after a tool server is spawned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaitSpec {
    /// Ready after a fixed settle delay (zero means immediately).
    Ready {
        #[serde(default, rename = "settle_ms", with = "duration_ms")]
        #[schemars(with = "u64")]
        settle: Duration,
        #[serde(default = "default_wait_timeout", rename = "timeout_ms", with = "duration_ms")]
        #[schemars(with = "u64")]
        timeout: Duration,
    },
    /// Ready once a stdout/stderr line matches `pattern` (a regex).
    Log {
        pattern: String,
        #[serde(default = "default_wait_timeout", rename = "timeout_ms", with = "duration_ms")]
        #[schemars(with = "u64")]
        timeout: Duration,
    },
    /// Ready once every name in `required` appears in the tool catalog.
    Tools {
        required: Vec<String>,
        #[serde(default = "default_wait_timeout", rename = "timeout_ms", with = "duration_ms")]
        #[schemars(with = "u64")]
        timeout: Duration,
    },
}

impl Default for WaitSpec {
    fn default() -> Self {
        WaitSpec::ready()
    }
}

impl WaitSpec {
    /// Ready immediately.
    pub fn ready() -> Self {
        WaitSpec::Ready {
            settle: Duration::ZERO,
            timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    pub fn settle(delay: Duration) -> Self {
        WaitSpec::Ready {
            settle: delay,
            timeout: DEFAULT_WAIT_TIMEOUT.max(delay),
        }
    }

    pub fn log(pattern: impl Into<String>, timeout: Duration) -> Self {
        WaitSpec::Log {
            pattern: pattern.into(),
            timeout,
        }
    }

    pub fn tools<I, S>(required: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        WaitSpec::Tools {
            required: required.into_iter().map(Into::into).collect(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            WaitSpec::Ready { timeout, .. }
            | WaitSpec::Log { timeout, .. }
            | WaitSpec::Tools { timeout, .. } => *timeout,
        }
    }

    /// Human-readable condition, used in readiness errors.
    pub fn describe(&self) -> String {
        match self {
            WaitSpec::Ready { settle, .. } if settle.is_zero() => "process start".to_string(),
            WaitSpec::Ready { settle, .. } => format!("settle delay of {settle:?}"),
            WaitSpec::Log { pattern, .. } => format!("log line matching {pattern:?}"),
            WaitSpec::Tools { required, .. } => format!("tools [{}]", required.join(", ")),
        }
    }
}

// ── Tool-server declarations ───────────────────────────────────────

/// How a tool server is driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    /// Long-lived subprocess speaking the line protocol over stdio.
    #[default]
    Persistent,
    /// Command spawned once per tool call.
    OneShot,
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerKind::Persistent => write!(f, "persistent"),
            ServerKind::OneShot => write!(f, "one-shot"),
        }
    }
}

/// A tool declared statically for a one-shot server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DeclaredTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the arguments. Defaults to an open object.
    #[serde(default = "open_object_schema")]
    pub input_schema: serde_json::Value,
    /// Tokens placed after the server's base args. Defaults to `[name]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcommand: Option<Vec<String>>,
}

pub(crate) fn open_object_schema() -> serde_json::Value {
    serde_json::json!({"type": "object"})
}

impl DeclaredTool {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: open_object_schema(),
            subcommand: None,
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_subcommand<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subcommand = Some(tokens.into_iter().map(Into::into).collect());
        self
    }

    pub fn subcommand_tokens(&self) -> Vec<String> {
        self.subcommand
            .clone()
            .unwrap_or_else(|| vec![self.name.clone()])
    }
}

/// One external tool provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolServerDeclaration {
    /// Unique within one config; used in logs and errors.
    pub id: String,
    #[serde(default)]
    pub kind: ServerKind,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment. Values expand `${NAME}` against the host
    /// environment at spawn time.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Run through `<shell> -c "<command line>"` instead of exec'ing directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default)]
    pub wait: WaitSpec,
    /// One-shot only: catalog names become `{prefix}_{tool}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_prefix: Option<String>,
    /// One-shot only: discover tools by parsing `command --help`.
    #[serde(default)]
    pub discover_from_help: bool,
    #[serde(default = "default_help_args")]
    pub help_args: Vec<String>,
    /// One-shot only: statically declared tools.
    #[serde(default)]
    pub tools: Vec<DeclaredTool>,
    /// Tool output longer than this is cut and marked as truncated.
    #[serde(default = "default_max_result_bytes")]
    pub max_result_bytes: usize,
}

impl ToolServerDeclaration {
    fn base(id: impl Into<String>, kind: ServerKind, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            shell: None,
            wait: WaitSpec::default(),
            tool_prefix: None,
            discover_from_help: false,
            help_args: default_help_args(),
            tools: Vec::new(),
            max_result_bytes: default_max_result_bytes(),
        }
    }

    pub fn persistent(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self::base(id, ServerKind::Persistent, command)
    }

    pub fn one_shot(
        id: impl Into<String>,
        command: impl Into<String>,
        tool_prefix: impl Into<String>,
    ) -> Self {
        Self {
            tool_prefix: Some(tool_prefix.into()),
            ..Self::base(id, ServerKind::OneShot, command)
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    pub fn with_wait(mut self, wait: WaitSpec) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }

    pub fn with_tool(mut self, tool: DeclaredTool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_help_discovery(mut self, enabled: bool) -> Self {
        self.discover_from_help = enabled;
        self
    }

    /// `command args...`, shell-quoted, for logs and errors.
    pub fn display_command(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.command.as_str());
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }

    /// The declared environment with `${NAME}` references expanded against
    /// the host environment.
    pub fn resolved_env(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|(k, v)| (k.clone(), expand_env(v, |name| std::env::var(name).ok())))
            .collect()
    }
}

static ENV_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("Invalid env reference regex")
});

/// Replace every `${NAME}` in `value` using `lookup`. Unknown names expand to
/// the empty string.
pub fn expand_env(value: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    ENV_REF
        .replace_all(value, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            lookup(name).unwrap_or_else(|| {
                warn!("Environment variable {name} is not set; expanding to empty string");
                String::new()
            })
        })
        .into_owned()
}

// ── Agent config ───────────────────────────────────────────────────

/// Everything the engine needs to run one agent conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgentConfig {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Maximum model calls per run.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// 0 leaves the provider default in place.
    #[serde(default)]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub tool_servers: Vec<ToolServerDeclaration>,
    #[serde(default)]
    pub rate_limits: RateLimits,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Wall-clock budget for `run()`.
    #[serde(default = "default_run_timeout", rename = "timeout_ms", with = "duration_ms")]
    #[schemars(with = "u64")]
    pub timeout: Duration,
    #[serde(
        default = "default_tool_call_timeout",
        rename = "tool_call_timeout_ms",
        with = "duration_ms"
    )]
    #[schemars(with = "u64")]
    pub tool_call_timeout: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<ModelPricing>,
}

impl AgentConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            max_turns: DEFAULT_MAX_TURNS,
            max_tokens: 0,
            temperature: 0.0,
            tool_servers: Vec::new(),
            rate_limits: RateLimits::default(),
            retry: RetryPolicy::default(),
            timeout: DEFAULT_RUN_TIMEOUT,
            tool_call_timeout: DEFAULT_TOOL_CALL_TIMEOUT,
            pricing: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_tool_server(mut self, server: ToolServerDeclaration) -> Self {
        self.tool_servers.push(server);
        self
    }

    pub fn with_rate_limits(mut self, limits: RateLimits) -> Self {
        self.rate_limits = limits;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_tool_call_timeout(mut self, timeout: Duration) -> Self {
        self.tool_call_timeout = timeout;
        self
    }

    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = Some(pricing);
        self
    }

    /// JSON Schema describing this configuration format.
    pub fn json_schema() -> serde_json::Value {
        let schema = schemars::schema_for!(AgentConfig);
        serde_json::to_value(schema)
            .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
    }

    /// Check the invariants the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::EmptyModel);
        }
        if self.max_turns == 0 {
            return Err(ConfigError::ZeroTurns);
        }

        let mut ids: HashSet<&str> = HashSet::new();
        let mut prefixes: HashMap<&str, &str> = HashMap::new();
        for server in &self.tool_servers {
            if !ids.insert(server.id.as_str()) {
                return Err(ConfigError::DuplicateServerId(server.id.clone()));
            }
            if server.command.trim().is_empty() {
                return Err(ConfigError::EmptyCommand(server.id.clone()));
            }

            let prefix = server.tool_prefix.as_deref().map(str::trim);
            if server.kind == ServerKind::OneShot && prefix.is_none_or(str::is_empty) {
                return Err(ConfigError::MissingPrefix(server.id.clone()));
            }
            if let Some(prefix) = prefix.filter(|p| !p.is_empty())
                && let Some(first) = prefixes.insert(prefix, server.id.as_str())
            {
                return Err(ConfigError::DuplicatePrefix {
                    prefix: prefix.to_string(),
                    first: first.to_string(),
                    second: server.id.clone(),
                });
            }

            if server.kind == ServerKind::OneShot && matches!(server.wait, WaitSpec::Log { .. }) {
                return Err(ConfigError::UnsupportedWait(server.id.clone()));
            }
            if let WaitSpec::Log { pattern, .. } = &server.wait {
                Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                    server: server.id.clone(),
                    source,
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_config_with_defaults() {
        let config: AgentConfig = serde_json::from_str(
            r#"{
                "model": "test/model",
                "tool_servers": [
                    {"id": "bank", "command": "bank-server",
                     "wait": {"type": "tools", "required": ["deposit"], "timeout_ms": 5000}},
                    {"id": "git", "kind": "one_shot", "command": "git", "tool_prefix": "git"}
                ],
                "rate_limits": {"rpm": 20}
            }"#,
        )
        .unwrap();

        assert_eq!(config.max_turns, DEFAULT_MAX_TURNS);
        assert_eq!(config.timeout, DEFAULT_RUN_TIMEOUT);
        assert_eq!(config.rate_limits.rpm, Some(20));
        assert_eq!(config.tool_servers[0].kind, ServerKind::Persistent);
        assert_eq!(
            config.tool_servers[0].wait,
            WaitSpec::tools(["deposit"], Duration::from_secs(5))
        );
        assert_eq!(config.tool_servers[1].help_args, vec!["--help"]);
        assert_eq!(config.tool_servers[1].max_result_bytes, DEFAULT_MAX_RESULT_BYTES);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn wait_spec_defaults_to_ready() {
        let spec: WaitSpec = serde_json::from_str(r#"{"type": "ready"}"#).unwrap();
        assert_eq!(spec, WaitSpec::ready());
        assert_eq!(spec.describe(), "process start");
    }

    #[test]
    fn rejects_duplicate_prefixes() {
        let config = AgentConfig::new("m")
            .with_tool_server(ToolServerDeclaration::one_shot("a", "tool-a", "x"))
            .with_tool_server(ToolServerDeclaration::one_shot("b", "tool-b", "x"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicatePrefix { prefix, .. }) if prefix == "x"
        ));
    }

    #[test]
    fn rejects_one_shot_without_prefix() {
        let config = AgentConfig::new("m")
            .with_tool_server(ToolServerDeclaration::one_shot("a", "tool-a", "  "));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingPrefix(id)) if id == "a"
        ));
    }

    #[test]
    fn rejects_duplicate_ids_and_bad_patterns() {
        let config = AgentConfig::new("m")
            .with_tool_server(ToolServerDeclaration::persistent("a", "x"))
            .with_tool_server(ToolServerDeclaration::persistent("a", "y"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateServerId(_))
        ));

        let config = AgentConfig::new("m").with_tool_server(
            ToolServerDeclaration::persistent("a", "x")
                .with_wait(WaitSpec::log("(unclosed", Duration::from_secs(1))),
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn rejects_zero_turns_and_empty_model() {
        assert!(matches!(
            AgentConfig::new(" ").validate(),
            Err(ConfigError::EmptyModel)
        ));
        assert!(matches!(
            AgentConfig::new("m").with_max_turns(0).validate(),
            Err(ConfigError::ZeroTurns)
        ));
    }

    #[test]
    fn expands_env_references() {
        let lookup = |name: &str| (name == "HOME").then(|| "/home/probe".to_string());
        assert_eq!(
            expand_env("${HOME}/data:${MISSING}:$PLAIN", lookup),
            "/home/probe/data::$PLAIN"
        );
    }

    #[test]
    fn display_command_quotes_arguments() {
        let decl = ToolServerDeclaration::persistent("s", "server").with_args(["--name", "a b"]);
        assert_eq!(decl.display_command(), "server --name 'a b'");
    }

    #[test]
    fn schema_exports_model_field() {
        let schema = AgentConfig::json_schema();
        assert!(schema["properties"]["model"].is_object());
        assert!(schema["required"]
            .as_array()
            .is_some_and(|r| r.contains(&"model".into())));
    }
}
