//! Scoped ownership of every tool server in one run.
//!
//! [`ServerManager::start`] starts servers in declaration order and merges
//! their catalogs. If any server fails, every server started before it is
//! stopped before the error is returned, so a failed start never leaks a
//! process. [`ServerManager::shutdown`] stops everything best-effort and can
//! be called repeatedly.

use crate::agent::config::ToolServerDeclaration;
use crate::error::{ServerStartError, ToolCallError};
use crate::tools::catalog::{ToolCatalog, ToolCatalogEntry};
use crate::tools::server::{self, ToolServer};
use futures::future::join_all;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{error, info, warn};

/// Error message for a call routed to a name outside the closed catalog.
pub const NOT_IN_CATALOG: &str = "routing error: tool is not in the catalog of any server";

pub struct ServerManager {
    servers: Vec<Box<dyn ToolServer>>,
    catalog: ToolCatalog,
    started: bool,
}

impl ServerManager {
    pub fn new(servers: Vec<Box<dyn ToolServer>>) -> Self {
        Self {
            servers,
            catalog: ToolCatalog::default(),
            started: false,
        }
    }

    /// One server per declaration, each bounded by `call_timeout` per call.
    pub fn from_declarations(decls: &[ToolServerDeclaration], call_timeout: Duration) -> Self {
        Self::new(
            decls
                .iter()
                .cloned()
                .map(|d| server::from_declaration(d, call_timeout))
                .collect(),
        )
    }

    /// Start every server in order and build the merged catalog.
    pub async fn start(&mut self) -> Result<(), ServerStartError> {
        info!("Starting {} tool server(s)", self.servers.len());
        for index in 0..self.servers.len() {
            if let Err(e) = self.servers[index].start().await {
                error!("Tool server {} failed to start: {e}", self.servers[index].id());
                self.rollback(index + 1).await;
                return Err(e);
            }
        }

        let per_server = self.servers.iter().map(|s| s.tools().to_vec()).collect();
        match ToolCatalog::build(per_server) {
            Ok(catalog) => {
                info!(
                    "Tool catalog ready: {} tool(s) [{}]",
                    catalog.len(),
                    catalog.names().join(", ")
                );
                self.catalog = catalog;
                self.started = true;
                Ok(())
            }
            Err(e) => {
                error!("Tool catalog conflict: {e}");
                self.rollback(self.servers.len()).await;
                Err(e)
            }
        }
    }

    /// Stop the first `count` servers.
    async fn rollback(&mut self, count: usize) {
        warn!("Rolling back {count} tool server(s)");
        let count = count.min(self.servers.len());
        join_all(self.servers.iter_mut().take(count).map(|s| s.stop())).await;
    }

    /// The merged catalog, in server order.
    pub fn tools(&self) -> &[ToolCatalogEntry] {
        self.catalog.entries()
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Route a call to the server that exported `name`.
    ///
    /// The catalog is closed after `start()`, so an unknown name means the
    /// caller skipped its own membership check. That is logged as an error
    /// and answered with [`NOT_IN_CATALOG`], never with a tool's own failure.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<String, ToolCallError> {
        let Some(index) = self.catalog.route(name) else {
            error!("call_tool for '{name}', which is not in the tool catalog");
            return Err(ToolCallError::new(name, NOT_IN_CATALOG));
        };
        self.servers[index].call_tool(name, arguments).await
    }

    /// Stop every server, concurrently and best-effort. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.servers.iter().any(|s| s.is_running()) {
            info!("Shutting down {} tool server(s)", self.servers.len());
        }
        join_all(self.servers.iter_mut().map(|s| s.stop())).await;
        self.started = false;
    }

    /// Whether `start()` succeeded and `shutdown()` has not run since.
    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn servers(&self) -> impl Iterator<Item = &dyn ToolServer> {
        self.servers.iter().map(|s| s.as_ref())
    }

    /// Process ids of every live long-lived server process.
    pub fn pids(&self) -> Vec<u32> {
        self.servers.iter().filter_map(|s| s.pid()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::config::ServerKind;
    use crate::tools::server::ServerFuture;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// In-memory server that records its lifecycle into a shared log.
    struct FakeServer {
        id: String,
        fail_start: bool,
        running: bool,
        tools: Vec<ToolCatalogEntry>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl FakeServer {
        fn boxed(
            id: &str,
            tools: &[&str],
            fail_start: bool,
            log: &Arc<Mutex<Vec<String>>>,
        ) -> Box<dyn ToolServer> {
            Box::new(Self {
                id: id.to_string(),
                fail_start,
                running: false,
                tools: tools
                    .iter()
                    .map(|t| ToolCatalogEntry::new(*t, "", json!({"type": "object"}), id))
                    .collect(),
                log: Arc::clone(log),
            })
        }
    }

    impl ToolServer for FakeServer {
        fn id(&self) -> &str {
            &self.id
        }
        fn kind(&self) -> ServerKind {
            ServerKind::Persistent
        }
        fn start(&mut self) -> ServerFuture<'_, Result<(), ServerStartError>> {
            Box::pin(async move {
                self.log.lock().unwrap().push(format!("start {}", self.id));
                if self.fail_start {
                    return Err(ServerStartError::Handshake {
                        server: self.id.clone(),
                        kind: ServerKind::Persistent,
                        command: "fake".into(),
                        message: "boom".into(),
                    });
                }
                self.running = true;
                Ok(())
            })
        }
        fn tools(&self) -> &[ToolCatalogEntry] {
            &self.tools
        }
        fn call_tool<'a>(
            &'a self,
            name: &'a str,
            _arguments: &'a Map<String, Value>,
        ) -> ServerFuture<'a, Result<String, ToolCallError>> {
            Box::pin(async move { Ok(format!("{} handled {name}", self.id)) })
        }
        fn stop(&mut self) -> ServerFuture<'_, ()> {
            Box::pin(async move {
                if self.running {
                    self.log.lock().unwrap().push(format!("stop {}", self.id));
                }
                self.running = false;
            })
        }
        fn is_running(&self) -> bool {
            self.running
        }
    }

    #[tokio::test]
    async fn routes_calls_by_catalog() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = ServerManager::new(vec![
            FakeServer::boxed("a", &["one"], false, &log),
            FakeServer::boxed("b", &["two"], false, &log),
        ]);
        manager.start().await.unwrap();
        assert_eq!(manager.tools().len(), 2);
        assert_eq!(manager.call_tool("two", &Map::new()).await.unwrap(), "b handled two");
        let err = manager.call_tool("three", &Map::new()).await.unwrap_err();
        assert_eq!(err.message, NOT_IN_CATALOG);
        assert_eq!(err.tool, "three");
    }

    #[tokio::test]
    async fn failed_start_rolls_back_earlier_servers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = ServerManager::new(vec![
            FakeServer::boxed("a", &["one"], false, &log),
            FakeServer::boxed("b", &["two"], true, &log),
            FakeServer::boxed("c", &["three"], false, &log),
        ]);
        let err = manager.start().await.unwrap_err();
        assert_eq!(err.server(), Some("b"));
        assert!(!manager.is_started());
        assert!(manager.servers().all(|s| !s.is_running()));
        assert_eq!(*log.lock().unwrap(), vec!["start a", "start b", "stop a"]);
    }

    #[tokio::test]
    async fn duplicate_tool_names_roll_back_everything() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = ServerManager::new(vec![
            FakeServer::boxed("a", &["same"], false, &log),
            FakeServer::boxed("b", &["same"], false, &log),
        ]);
        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, ServerStartError::DuplicateTool { .. }));
        assert!(manager.servers().all(|s| !s.is_running()));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = ServerManager::new(vec![FakeServer::boxed("a", &["one"], false, &log)]);
        manager.start().await.unwrap();
        manager.shutdown().await;
        manager.shutdown().await;
        assert_eq!(*log.lock().unwrap(), vec!["start a", "stop a"]);
    }
}
