//! Subprocess plumbing shared by both tool-server kinds.

use crate::agent::config::ToolServerDeclaration;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// How long a stopping server gets to exit on its own before being killed.
pub const STOP_GRACE: Duration = Duration::from_secs(3);

/// Build the command for `decl` with `extra` arguments appended.
///
/// With a `shell` override the whole command line is shell-quoted and run as
/// `<shell> -c "<line>"`. Environment entries are `${NAME}`-expanded here, at
/// spawn time. Children are killed when their handle is dropped.
pub fn build_command(decl: &ToolServerDeclaration, extra: &[String]) -> Command {
    let mut cmd = match &decl.shell {
        Some(shell) => {
            let mut words: Vec<&str> = Vec::with_capacity(decl.args.len() + extra.len() + 1);
            words.push(&decl.command);
            words.extend(decl.args.iter().map(String::as_str));
            words.extend(extra.iter().map(String::as_str));
            let mut cmd = Command::new(shell);
            cmd.arg("-c").arg(shell_words::join(words));
            cmd
        }
        None => {
            let mut cmd = Command::new(&decl.command);
            cmd.args(&decl.args).args(extra);
            cmd
        }
    };
    cmd.envs(decl.resolved_env());
    if let Some(cwd) = &decl.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::null()).kill_on_drop(true);
    cmd
}

/// `exit status: 0`, `signal: 9 (SIGKILL)`, and so on.
pub fn describe_exit(status: ExitStatus) -> String {
    status.to_string()
}

/// Wait up to `grace` for `child` to exit, then kill it.
///
/// The caller closes stdin first so well-behaved servers see EOF and exit.
pub async fn stop_child(server: &str, child: &mut Child, grace: Duration) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!("Tool server {server} already exited ({status})");
            return;
        }
        Ok(None) => {}
        Err(e) => warn!("Tool server {server}: failed to poll exit status: {e}"),
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!("Tool server {server} exited ({status})"),
        Ok(Err(e)) => warn!("Tool server {server}: wait failed: {e}"),
        Err(_) => {
            warn!("Tool server {server} did not exit within {grace:?}; killing");
            if let Err(e) = child.kill().await {
                warn!("Tool server {server}: kill failed: {e}");
            }
        }
    }
}
