//! Reference persistent tool server used by the integration tests.
//!
//! Speaks the line-delimited JSON-RPC protocol on stdio and deliberately
//! mixes in noise: a plain-text boot line and a stray JSON object on stdout,
//! and diagnostics on stderr.
//!
//! Tools: `echo`, `add`, `deposit`/`balance` (a running total), `fail`
//! (always an `isError` result), `slow` (sleeps), `crash` (exits mid-call),
//! and `late` (listed only after `PROBE_ECHO_LATE_TOOL_MS`).
//!
//! Environment switches:
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `PROBE_ECHO_PREFIX` | Prepended to every tool name |
//! | `PROBE_ECHO_EXIT_IMMEDIATELY` | Exit with status 3 before reading stdin |
//! | `PROBE_ECHO_EXIT_AFTER_INIT` | Exit with status 4 right after `initialize` |
//! | `PROBE_ECHO_BANNER` | Line written to stderr once the server is up |
//! | `PROBE_ECHO_BANNER_DELAY_MS` | Delay before the banner |
//! | `PROBE_ECHO_LATE_TOOL_MS` | Delay before `late` shows up in `tools/list` |
//! | `PROBE_ECHO_PID_FILE` | File the process id is written to at boot |

use cinch_probe::tools::protocol::{
    CallToolParams, CallToolResult, INVALID_PARAMS, METHOD_CALL_TOOL, METHOD_INITIALIZE,
    METHOD_LIST_TOOLS, METHOD_NOT_FOUND, PROTOCOL_VERSION, Request, Response, encode_line,
};
use serde_json::{Value, json};
use std::io::{BufRead, Write};
use std::time::{Duration, Instant};

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| !v.is_empty() && v != "0")
}

fn env_ms(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}

struct EchoServer {
    prefix: String,
    started: Instant,
    late_after: Option<Duration>,
    balance: i64,
}

impl EchoServer {
    fn tool_list(&self) -> Value {
        let mut tools = vec![
            tool("echo", "Echo the text back", json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"],
            })),
            tool("add", "Add two numbers", json!({
                "type": "object",
                "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                "required": ["a", "b"],
            })),
            tool("deposit", "Add to the running balance", json!({
                "type": "object",
                "properties": {"amount": {"type": "integer"}},
                "required": ["amount"],
            })),
            tool("balance", "Current running balance", json!({"type": "object"})),
            tool("fail", "Always fails", json!({"type": "object"})),
            tool("slow", "Sleep for ms milliseconds", json!({
                "type": "object",
                "properties": {"ms": {"type": "integer", "minimum": 0}},
            })),
            tool("crash", "Exit without answering", json!({"type": "object"})),
        ];
        if self
            .late_after
            .is_some_and(|d| self.started.elapsed() >= d)
        {
            tools.push(tool("late", "Appears after a delay", json!({"type": "object"})));
        }
        for t in &mut tools {
            if let Some(name) = t["name"].as_str() {
                t["name"] = Value::String(format!("{}{name}", self.prefix));
            }
        }
        json!({"tools": tools})
    }

    fn call(&mut self, params: CallToolParams) -> Result<CallToolResult, String> {
        let Some(name) = params.name.strip_prefix(&self.prefix) else {
            return Err(format!("unknown tool: {}", params.name));
        };
        let args = &params.arguments;
        eprintln!("probe-echo-server: calling {name}");
        let result = match name {
            "echo" => {
                // Stray JSON that is not a response frame.
                println!("{}", json!({"log": "echo invoked"}));
                CallToolResult::ok(args.get("text").and_then(Value::as_str).unwrap_or_default())
            }
            "add" => {
                let a = args.get("a").and_then(Value::as_f64).unwrap_or(0.0);
                let b = args.get("b").and_then(Value::as_f64).unwrap_or(0.0);
                CallToolResult::ok((a + b).to_string())
            }
            "deposit" => {
                self.balance += args.get("amount").and_then(Value::as_i64).unwrap_or(0);
                CallToolResult::ok(format!("deposited; balance is {}", self.balance))
            }
            "balance" => CallToolResult::ok(self.balance.to_string()),
            "fail" => CallToolResult::error("this tool always fails"),
            "slow" => {
                let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
                std::thread::sleep(Duration::from_millis(ms));
                CallToolResult::ok(format!("slept {ms}ms"))
            }
            "crash" => std::process::exit(1),
            "late" if self.late_after.is_some() => CallToolResult::ok("late tool called"),
            _ => return Err(format!("unknown tool: {}", params.name)),
        };
        Ok(result)
    }

    fn handle(&mut self, request: Request) -> Option<Response> {
        let id = request.id?;
        let response = match request.method.as_str() {
            METHOD_INITIALIZE => {
                let response = Response::success(
                    id,
                    json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": {"tools": {}},
                        "serverInfo": {
                            "name": "probe-echo-server",
                            "version": env!("CARGO_PKG_VERSION"),
                        },
                    }),
                );
                if env_flag("PROBE_ECHO_EXIT_AFTER_INIT") {
                    write_frame(&response);
                    std::process::exit(4);
                }
                response
            }
            METHOD_LIST_TOOLS => Response::success(id, self.tool_list()),
            METHOD_CALL_TOOL => match serde_json::from_value::<CallToolParams>(request.params) {
                Ok(params) => match self.call(params) {
                    Ok(result) => Response::success(id, json!(result)),
                    Err(message) => Response::failure(id, INVALID_PARAMS, message),
                },
                Err(e) => Response::failure(id, INVALID_PARAMS, format!("invalid params: {e}")),
            },
            other => Response::failure(id, METHOD_NOT_FOUND, format!("method not found: {other}")),
        };
        Some(response)
    }
}

fn tool(name: &str, description: &str, schema: Value) -> Value {
    json!({"name": name, "description": description, "inputSchema": schema})
}

fn write_frame(response: &Response) {
    let Ok(line) = encode_line(response) else {
        return;
    };
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(line.as_bytes());
    let _ = stdout.flush();
}

fn main() {
    if env_flag("PROBE_ECHO_EXIT_IMMEDIATELY") {
        eprintln!("probe-echo-server: exiting immediately");
        std::process::exit(3);
    }

    if let Ok(path) = std::env::var("PROBE_ECHO_PID_FILE") {
        let _ = std::fs::write(path, std::process::id().to_string());
    }

    println!("probe-echo-server booting");
    eprintln!("probe-echo-server: pid {}", std::process::id());

    if let Ok(banner) = std::env::var("PROBE_ECHO_BANNER") {
        let delay = env_ms("PROBE_ECHO_BANNER_DELAY_MS").unwrap_or_default();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            eprintln!("{banner}");
        });
    }

    let mut server = EchoServer {
        prefix: std::env::var("PROBE_ECHO_PREFIX").unwrap_or_default(),
        started: Instant::now(),
        late_after: env_ms("PROBE_ECHO_LATE_TOOL_MS"),
        balance: 0,
    };

    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                if let Some(response) = server.handle(request) {
                    write_frame(&response);
                }
            }
            Err(e) => eprintln!("probe-echo-server: ignoring malformed line: {e}"),
        }
    }
    eprintln!("probe-echo-server: stdin closed, exiting");
}
