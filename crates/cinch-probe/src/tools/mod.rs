//! External tool servers and the plumbing that drives them.
//!
//! Every tool the model can call lives in a subprocess. A [`ToolServer`]
//! owns one such process (or, for one-shot servers, the recipe for spawning
//! one per call) and a [`ServerManager`] owns every server of a run.
//!
//! # Submodules
//!
//! - [`server`]: the [`ToolServer`] contract and [`from_declaration`](server::from_declaration).
//! - [`persistent`]: line-delimited JSON-RPC servers kept alive for the run.
//! - [`oneshot`]: CLI commands spawned once per tool call, with argument
//!   synthesis and optional `--help` discovery.
//! - [`manager`]: [`ServerManager`]: ordered start with rollback, routing,
//!   idempotent shutdown.
//! - [`wait`]: readiness strategies applied after spawn.
//! - [`catalog`]: the merged, closed tool catalog plus argument validation
//!   and result truncation.
//! - [`protocol`]: wire frames for the persistent protocol.
//! - [`process`]: command construction and graceful stop.

pub mod catalog;
pub mod manager;
pub mod oneshot;
pub mod persistent;
pub mod process;
pub mod protocol;
pub mod server;
pub mod wait;

pub use catalog::{
    DEFAULT_MAX_RESULT_BYTES, ToolCatalog, ToolCatalogEntry, parse_arguments, truncate_result,
};
pub use manager::ServerManager;
pub use oneshot::OneShotServer;
pub use persistent::PersistentServer;
pub use server::{ServerFuture, ToolServer};
pub use wait::{ReadinessProbe, wait_until_ready};
