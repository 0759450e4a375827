//! The contract shared by every tool-server kind.

use crate::agent::config::{ServerKind, ToolServerDeclaration};
use crate::error::{ServerStartError, ToolCallError};
use crate::tools::catalog::ToolCatalogEntry;
use crate::tools::oneshot::OneShotServer;
use crate::tools::persistent::PersistentServer;
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future returned by [`ToolServer`] methods, keeping the trait
/// dyn-compatible so a manager can hold `Box<dyn ToolServer>`.
pub type ServerFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One external tool provider and the OS process(es) behind it.
///
/// `start()` spawns and readies the server and discovers its catalog;
/// `tools()` is fixed from then on. `stop()` is graceful with a hard-kill
/// fallback and safe to call any number of times.
pub trait ToolServer: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> ServerKind;

    /// Spawn, apply the wait strategy, and discover tools. On failure no
    /// process started by this call is left running.
    fn start(&mut self) -> ServerFuture<'_, Result<(), ServerStartError>>;

    /// Catalog discovered by `start()`. Empty before start.
    fn tools(&self) -> &[ToolCatalogEntry];

    /// Invoke one tool. Failures are returned as data for the model.
    fn call_tool<'a>(
        &'a self,
        name: &'a str,
        arguments: &'a Map<String, Value>,
    ) -> ServerFuture<'a, Result<String, ToolCallError>>;

    fn stop(&mut self) -> ServerFuture<'_, ()>;

    fn is_running(&self) -> bool;

    /// OS process id of the long-lived process, if there is one.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Build the server implementation matching `decl.kind`.
pub fn from_declaration(
    decl: ToolServerDeclaration,
    call_timeout: Duration,
) -> Box<dyn ToolServer> {
    match decl.kind {
        ServerKind::Persistent => Box::new(PersistentServer::new(decl, call_timeout)),
        ServerKind::OneShot => Box::new(OneShotServer::new(decl, call_timeout)),
    }
}
