//! Merged tool catalog and argument checks.
//!
//! The catalog is built once while the server manager starts its servers and
//! never changes afterwards. It maps every tool name to the index of the
//! server that owns it, so dispatch is a single lookup.

use crate::ToolDef;
use crate::error::ServerStartError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, info, trace};

/// Tool output longer than this is truncated before reaching the model.
pub const DEFAULT_MAX_RESULT_BYTES: usize = 30_000;

/// One tool exported by a tool server.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCatalogEntry {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    /// Id of the owning server.
    pub server_id: String,
}

impl ToolCatalogEntry {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        server_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            server_id: server_id.into(),
        }
    }

    /// Function-calling definition sent to the model.
    pub fn definition(&self) -> ToolDef {
        ToolDef::new(&self.name, &self.description, self.input_schema.clone())
    }

    /// Check `arguments` against the input schema. Returns a message the
    /// model can act on, or `None` when the arguments are acceptable.
    ///
    /// An input schema that is itself invalid disables validation.
    pub fn validate_arguments(&self, arguments: &Map<String, Value>) -> Option<String> {
        let validator = jsonschema::validator_for(&self.input_schema).ok()?;
        let instance = Value::Object(arguments.clone());
        let errors: Vec<String> = validator
            .iter_errors(&instance)
            .map(|e| format!("  - {}: {e}", e.instance_path()))
            .collect();

        if errors.is_empty() {
            None
        } else {
            Some(format!(
                "Error: argument validation failed for tool '{}':\n{}\n\
                 Please fix the arguments and try again.",
                self.name,
                errors.join("\n")
            ))
        }
    }
}

/// Parse the model's raw argument string into an object.
///
/// An empty string is treated as `{}`.
pub fn parse_arguments(tool: &str, raw: &str) -> Result<Map<String, Value>, String> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!(
            "Error: arguments for tool '{tool}' must be a JSON object, got {}.",
            json_kind(&other)
        )),
        Err(e) => Err(format!(
            "Error: invalid JSON arguments for tool '{tool}': {e}. \
             Please provide valid JSON matching the tool's parameter schema."
        )),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Log a tool call at INFO level with a truncated preview of arguments.
pub fn log_tool_call(name: &str, arguments: &str) {
    let args_preview: String = arguments.chars().take(120).collect();
    info!(
        "[tool] {}({args_preview}{})",
        name,
        if arguments.chars().nth(120).is_some() { "..." } else { "" }
    );
    debug!("[tool] {name} full args ({} bytes)", arguments.len());
    trace!("[tool] {name} arguments: {arguments}");
}

/// Truncate a string to at most `max` bytes (on a char boundary), appending
/// a notice if trimmed.
pub fn truncate_result(s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    let head = s.get(..cut).unwrap_or_default();
    format!("{head}...\n[truncated: {} bytes total]", s.len())
}

// ── Catalog ────────────────────────────────────────────────────────

/// Closed name → server mapping for one run.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    entries: Vec<ToolCatalogEntry>,
    routes: HashMap<String, usize>,
}

impl ToolCatalog {
    /// Merge per-server catalogs, in server order. `servers[i]` holds the
    /// entries of the server at index `i`. A name exported twice is an error.
    pub fn build(servers: Vec<Vec<ToolCatalogEntry>>) -> Result<Self, ServerStartError> {
        let mut catalog = ToolCatalog::default();
        for (index, entries) in servers.into_iter().enumerate() {
            for entry in entries {
                if let Some(&existing) = catalog.routes.get(&entry.name) {
                    let first = catalog
                        .entries
                        .iter()
                        .find(|e| e.name == entry.name)
                        .map(|e| e.server_id.clone())
                        .unwrap_or_else(|| format!("#{existing}"));
                    return Err(ServerStartError::DuplicateTool {
                        tool: entry.name,
                        first,
                        second: entry.server_id,
                    });
                }
                catalog.routes.insert(entry.name.clone(), index);
                catalog.entries.push(entry);
            }
        }
        Ok(catalog)
    }

    /// Index of the server that owns `name`.
    pub fn route(&self, name: &str) -> Option<usize> {
        self.routes.get(name).copied()
    }

    pub fn get(&self, name: &str) -> Option<&ToolCatalogEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    pub fn entries(&self) -> &[ToolCatalogEntry] {
        &self.entries
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn definitions(&self) -> Vec<ToolDef> {
        self.entries.iter().map(ToolCatalogEntry::definition).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(name: &str, server: &str) -> ToolCatalogEntry {
        ToolCatalogEntry::new(name, "", json!({"type": "object"}), server)
    }

    #[test]
    fn build_routes_by_server_index() {
        let catalog = ToolCatalog::build(vec![
            vec![entry("deposit", "bank"), entry("balance", "bank")],
            vec![entry("git_status", "git")],
        ])
        .unwrap();
        assert_eq!(catalog.route("balance"), Some(0));
        assert_eq!(catalog.route("git_status"), Some(1));
        assert_eq!(catalog.route("missing"), None);
        assert_eq!(catalog.names(), vec!["deposit", "balance", "git_status"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = ToolCatalog::build(vec![vec![entry("echo", "a")], vec![entry("echo", "b")]])
            .unwrap_err();
        match err {
            ServerStartError::DuplicateTool {
                tool,
                first,
                second,
            } => {
                assert_eq!((tool.as_str(), first.as_str(), second.as_str()), ("echo", "a", "b"));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn schema_violations_are_reported() {
        let e = ToolCatalogEntry::new(
            "deposit",
            "",
            json!({
                "type": "object",
                "properties": {"amount": {"type": "number"}},
                "required": ["amount"]
            }),
            "bank",
        );
        let ok = parse_arguments("deposit", r#"{"amount": 5}"#).unwrap();
        assert!(e.validate_arguments(&ok).is_none());

        let bad = parse_arguments("deposit", r#"{"amount": "five"}"#).unwrap();
        let msg = e.validate_arguments(&bad).unwrap();
        assert!(msg.contains("/amount"), "{msg}");

        let missing = parse_arguments("deposit", "").unwrap();
        assert!(e.validate_arguments(&missing).is_some());
    }

    #[test]
    fn parse_arguments_rejects_non_objects() {
        assert!(parse_arguments("t", "[1]").unwrap_err().contains("an array"));
        assert!(parse_arguments("t", "{not json").unwrap_err().contains("invalid JSON"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(10);
        let out = truncate_result(s, 5);
        assert!(out.starts_with("éé..."));
        assert!(out.ends_with("[truncated: 20 bytes total]"));
        assert_eq!(truncate_result("short".into(), 100), "short");
    }
}
