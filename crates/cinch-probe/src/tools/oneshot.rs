//! One-shot tool servers: a CLI spawned once per tool call.
//!
//! Catalog names are `{prefix}_{tool}`. A call runs
//! `command [args...] <subcommand...> [--flag value...] [positional...]`,
//! where flags come from the call's argument mapping (see
//! [`synthesize_args`]). Stdout is the result; a non-zero exit is a tool error.

use crate::agent::config::{ServerKind, ToolServerDeclaration};
use crate::error::{ServerStartError, ToolCallError};
use crate::tools::catalog::{ToolCatalogEntry, truncate_result};
use crate::tools::process;
use crate::tools::server::{ServerFuture, ToolServer};
use crate::tools::wait::{ReadinessProbe, wait_until_ready};
use regex::Regex;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Argument key whose array value becomes trailing positional arguments.
pub const POSITIONAL_KEY: &str = "args";

// ── Argument synthesis ─────────────────────────────────────────────

/// Turn an argument mapping into CLI tokens.
///
/// Keys are visited in sorted order and become `--key` (underscores turned
/// into hyphens). `true` yields the bare flag; `false` and `null` are
/// omitted; arrays repeat the flag per element. The [`POSITIONAL_KEY`] entry
/// is appended last as positional arguments.
pub fn synthesize_args(arguments: &Map<String, Value>) -> Vec<String> {
    let mut keys: Vec<&String> = arguments.keys().collect();
    keys.sort();

    let mut tokens = Vec::new();
    let mut positionals = Vec::new();
    for key in keys {
        let value = &arguments[key];
        if key == POSITIONAL_KEY {
            match value {
                Value::Array(items) => positionals.extend(items.iter().map(scalar)),
                Value::Null => {}
                other => positionals.push(scalar(other)),
            }
            continue;
        }

        let flag = format!("--{}", key.replace('_', "-"));
        match value {
            Value::Null | Value::Bool(false) => {}
            Value::Bool(true) => tokens.push(flag),
            Value::Array(items) => {
                for item in items {
                    tokens.push(flag.clone());
                    tokens.push(scalar(item));
                }
            }
            other => {
                tokens.push(flag);
                tokens.push(scalar(other));
            }
        }
    }
    tokens.extend(positionals);
    tokens
}

fn scalar(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ── Help-text discovery ────────────────────────────────────────────

static SECTION_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:available\s+)?(?:sub)?commands\s*:\s*$")
        .expect("Invalid help section regex")
});

static COMMAND_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s+)([A-Za-z][A-Za-z0-9_-]*)(?:,\s*[A-Za-z0-9_-]+)*(?:\s{2,}(\S.*?))?\s*$")
        .expect("Invalid help command regex")
});

/// Extract `(name, description)` pairs from a `Commands:` style section of
/// help output. Anything unrecognized yields an empty list.
pub fn parse_help_commands(help: &str) -> Vec<(String, String)> {
    let mut commands = Vec::new();
    let mut in_section = false;
    let mut entry_indent: Option<usize> = None;

    for line in help.lines() {
        if SECTION_HEADER.is_match(line) {
            in_section = true;
            entry_indent = None;
            continue;
        }
        if !in_section {
            continue;
        }
        if line.trim().is_empty() {
            if entry_indent.is_some() {
                in_section = false;
            }
            continue;
        }
        let indent = line.len() - line.trim_start().len();
        if let Some(expected) = entry_indent {
            // Deeper lines continue the previous description.
            if indent > expected {
                continue;
            }
            if indent < expected {
                in_section = false;
                continue;
            }
        }
        let Some(caps) = COMMAND_LINE.captures(line) else {
            in_section = false;
            continue;
        };
        entry_indent.get_or_insert(indent);
        let name = caps.get(2).map_or("", |m| m.as_str());
        if name == "help" || commands.iter().any(|(n, _)| n == name) {
            continue;
        }
        let description = caps.get(3).map_or("", |m| m.as_str()).trim();
        commands.push((name.to_string(), description.to_string()));
    }
    commands
}

/// Input schema for help-discovered tools: any flags plus positionals.
fn discovered_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            POSITIONAL_KEY: {
                "type": "array",
                "items": {"type": "string"},
                "description": "Positional arguments appended after flags."
            }
        },
        "additionalProperties": true
    })
}

// ── Server ─────────────────────────────────────────────────────────

/// A CLI tool provider invoked once per call.
pub struct OneShotServer {
    decl: ToolServerDeclaration,
    call_timeout: Duration,
    tools: Vec<ToolCatalogEntry>,
    subcommands: HashMap<String, Vec<String>>,
    running: bool,
}

/// One-shot servers have no long-lived process: readiness only concerns the
/// catalog.
struct CatalogProbe<'a> {
    names: Vec<&'a str>,
}

impl ReadinessProbe for CatalogProbe<'_> {
    fn exit_status(&mut self) -> Option<String> {
        None
    }

    async fn next_log_line(&mut self) -> Option<String> {
        None
    }

    async fn tool_names(&mut self) -> Result<Vec<String>, String> {
        Ok(self.names.iter().map(|n| n.to_string()).collect())
    }
}

impl OneShotServer {
    pub fn new(decl: ToolServerDeclaration, call_timeout: Duration) -> Self {
        Self {
            decl,
            call_timeout,
            tools: Vec::new(),
            subcommands: HashMap::new(),
            running: false,
        }
    }

    fn prefix(&self) -> &str {
        self.decl.tool_prefix.as_deref().unwrap_or(&self.decl.id).trim()
    }

    fn catalog_name(&self, tool: &str) -> String {
        format!("{}_{tool}", self.prefix())
    }

    /// Run the help command and parse it. Only a spawn failure is an error;
    /// odd exit codes and unparseable text give an empty list.
    async fn discover(&self) -> Result<Vec<(String, String)>, ServerStartError> {
        let mut cmd = process::build_command(&self.decl, &self.decl.help_args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = match tokio::time::timeout(self.decl.wait.timeout(), cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ServerStartError::Spawn {
                    server: self.decl.id.clone(),
                    kind: ServerKind::OneShot,
                    command: self.decl.display_command(),
                    source,
                });
            }
            Err(_) => {
                warn!("Help discovery for {} timed out; catalog is empty", self.decl.id);
                return Ok(Vec::new());
            }
        };

        // Many CLIs print help to stderr or exit non-zero for --help.
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            text.push('\n');
            text.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        let commands = parse_help_commands(&text);
        if commands.is_empty() {
            warn!(
                "No commands found in help output of {} ({}); catalog is empty",
                self.decl.id, output.status
            );
        }
        Ok(commands)
    }

    async fn start_inner(&mut self) -> Result<(), ServerStartError> {
        info!(
            "Starting one-shot tool server {}: {}",
            self.decl.id,
            self.decl.display_command()
        );
        let mut tools = Vec::new();
        let mut subcommands = HashMap::new();

        for tool in &self.decl.tools {
            let name = self.catalog_name(&tool.name);
            subcommands.insert(name.clone(), tool.subcommand_tokens());
            tools.push(ToolCatalogEntry::new(
                name,
                &tool.description,
                tool.input_schema.clone(),
                &self.decl.id,
            ));
        }

        if self.decl.discover_from_help {
            for (command, description) in self.discover().await? {
                let name = self.catalog_name(&command);
                if subcommands.contains_key(&name) {
                    continue;
                }
                subcommands.insert(name.clone(), vec![command]);
                tools.push(ToolCatalogEntry::new(
                    name,
                    description,
                    discovered_schema(),
                    &self.decl.id,
                ));
            }
        }

        let mut probe = CatalogProbe {
            names: tools.iter().map(|t| t.name.as_str()).collect(),
        };
        wait_until_ready(&self.decl.wait, &mut probe)
            .await
            .map_err(|failure| ServerStartError::NotReady {
                server: self.decl.id.clone(),
                kind: ServerKind::OneShot,
                command: self.decl.display_command(),
                failure,
            })?;

        debug!("One-shot server {} exports {} tool(s)", self.decl.id, tools.len());
        self.tools = tools;
        self.subcommands = subcommands;
        self.running = true;
        Ok(())
    }

    async fn call_inner(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<String, ToolCallError> {
        if !self.running {
            return Err(ToolCallError::new(
                name,
                format!("server '{}' is not running", self.decl.id),
            ));
        }
        let subcommand = self.subcommands.get(name).ok_or_else(|| {
            ToolCallError::new(name, format!("unknown tool for server '{}'", self.decl.id))
        })?;

        let mut argv = subcommand.clone();
        argv.extend(synthesize_args(arguments));
        debug!("[{}] invoking {} {}", self.decl.id, self.decl.command, shell_words::join(&argv));

        let mut cmd = process::build_command(&self.decl, &argv);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let start = Instant::now();
        let output = match tokio::time::timeout(self.call_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolCallError::new(
                    name,
                    format!("failed to run `{}`: {e}", self.decl.command),
                ));
            }
            Err(_) => {
                return Err(ToolCallError::new(
                    name,
                    format!("timed out after {:.0} seconds", self.call_timeout.as_secs_f64()),
                ));
            }
        };
        debug!(
            "[{}] {name} finished in {:.0}ms ({})",
            self.decl.id,
            start.elapsed().as_secs_f64() * 1000.0,
            output.status
        );

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            Ok(truncate_result(stdout, self.decl.max_result_bytes))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            Err(ToolCallError::new(
                name,
                truncate_result(
                    format!("command failed ({}): {detail}", output.status),
                    self.decl.max_result_bytes,
                ),
            ))
        }
    }
}

impl ToolServer for OneShotServer {
    fn id(&self) -> &str {
        &self.decl.id
    }

    fn kind(&self) -> ServerKind {
        ServerKind::OneShot
    }

    fn start(&mut self) -> ServerFuture<'_, Result<(), ServerStartError>> {
        Box::pin(self.start_inner())
    }

    fn tools(&self) -> &[ToolCatalogEntry] {
        &self.tools
    }

    fn call_tool<'a>(
        &'a self,
        name: &'a str,
        arguments: &'a Map<String, Value>,
    ) -> ServerFuture<'a, Result<String, ToolCallError>> {
        Box::pin(self.call_inner(name, arguments))
    }

    fn stop(&mut self) -> ServerFuture<'_, ()> {
        Box::pin(async move {
            if self.running {
                debug!("Stopping one-shot tool server {}", self.decl.id);
                self.running = false;
            }
        })
    }

    fn is_running(&self) -> bool {
        self.running
    }
}
