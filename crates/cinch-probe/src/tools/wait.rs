//! Readiness evaluation for freshly spawned tool servers.
//!
//! [`wait_until_ready`] blocks until a [`WaitSpec`] holds or its timeout
//! elapses. It observes the process through a [`ReadinessProbe`], so the same
//! evaluator serves persistent servers (live stdio, exit status, catalog
//! queries) and one-shot servers (catalog only).
//!
//! A process that exits while the wait is pending fails the wait at once with
//! [`WaitFailure::ExitedEarly`] instead of running out the timeout.

use crate::agent::config::WaitSpec;
use crate::error::WaitFailure;
use regex::Regex;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// How often exit status and catalogs are re-checked.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// View of a spawned server used while waiting for readiness.
pub trait ReadinessProbe: Send {
    /// `Some(status)` once the process has exited.
    fn exit_status(&mut self) -> Option<String>;

    /// Next diagnostic line from the process (stderr, or stdout lines that
    /// are not protocol frames). `None` once both streams are closed.
    fn next_log_line(&mut self) -> impl Future<Output = Option<String>> + Send;

    /// Names currently in the server's tool catalog.
    fn tool_names(&mut self) -> impl Future<Output = Result<Vec<String>, String>> + Send;
}

/// Wait for `spec` to hold against `probe`.
pub async fn wait_until_ready<P: ReadinessProbe>(
    spec: &WaitSpec,
    probe: &mut P,
) -> Result<(), WaitFailure> {
    let condition = spec.describe();
    let timeout = spec.timeout();
    debug!("Waiting up to {timeout:?} for {condition}");

    let evaluation = async {
        match spec {
            WaitSpec::Ready { settle, .. } => wait_settle(*settle, probe, &condition).await,
            WaitSpec::Log { pattern, .. } => {
                let re = Regex::new(pattern).map_err(|e| WaitFailure::InvalidPattern {
                    pattern: pattern.clone(),
                    message: e.to_string(),
                })?;
                wait_log(&re, probe, &condition).await
            }
            WaitSpec::Tools { required, .. } => wait_tools(required, probe, &condition).await,
        }
    };

    match tokio::time::timeout(timeout, evaluation).await {
        Ok(result) => result,
        Err(_) => Err(WaitFailure::TimedOut {
            condition: spec.describe(),
            timeout,
        }),
    }
}

fn exited(condition: &str, status: String) -> WaitFailure {
    WaitFailure::ExitedEarly {
        condition: condition.to_string(),
        status,
    }
}

async fn wait_settle<P: ReadinessProbe>(
    settle: Duration,
    probe: &mut P,
    condition: &str,
) -> Result<(), WaitFailure> {
    let deadline = Instant::now() + settle;
    loop {
        if let Some(status) = probe.exit_status() {
            return Err(exited(condition, status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
    }
}

async fn wait_log<P: ReadinessProbe>(
    re: &Regex,
    probe: &mut P,
    condition: &str,
) -> Result<(), WaitFailure> {
    let mut streams_open = true;
    loop {
        if let Some(status) = probe.exit_status() {
            return Err(exited(condition, status));
        }
        if !streams_open {
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        }
        tokio::select! {
            line = probe.next_log_line() => match line {
                Some(line) if re.is_match(&line) => {
                    debug!("Readiness line matched: {line}");
                    return Ok(());
                }
                Some(line) => trace!("Ignoring log line while waiting: {line}"),
                None => streams_open = false,
            },
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

async fn wait_tools<P: ReadinessProbe>(
    required: &[String],
    probe: &mut P,
    condition: &str,
) -> Result<(), WaitFailure> {
    loop {
        if let Some(status) = probe.exit_status() {
            return Err(exited(condition, status));
        }
        match probe.tool_names().await {
            Ok(names) => {
                let missing: Vec<&str> = required
                    .iter()
                    .filter(|r| !names.contains(r))
                    .map(String::as_str)
                    .collect();
                if missing.is_empty() {
                    return Ok(());
                }
                trace!("Still missing tools: {}", missing.join(", "));
            }
            Err(e) => debug!("Tool catalog query failed while waiting: {e}"),
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
