//! Tenant-scoped interactive shell sessions for MCP-style tool servers.
//!
//! This crate is the workspace execution layer: it multiplexes many live
//! shell processes belonging to many tenants inside one server process,
//! guards the shared terminal registries against concurrent tool invocations,
//! applies best-effort cgroup/rlimit confinement per tenant, and guarantees
//! that teardown — voluntary exit, forced kill, spawn error, host shutdown —
//! always leaves consistent, leak-free bookkeeping.
//!
//! The tool-protocol transport that turns these primitives into
//! network-facing operations is an external adapter; it embeds a
//! [`TerminalManager`] and serializes the result structs this crate returns.
//!
//! ```no_run
//! use mcp_tenant_shell::{Config, TerminalManager};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), mcp_tenant_shell::AppError> {
//! let config = Arc::new(Config::load()?);
//! let manager = Arc::new(TerminalManager::new(config));
//! manager.spawn_signal_handler();
//!
//! let id = manager
//!     .create_terminal("alice", Path::new("/home/alice/project"), None)
//!     .await?;
//! manager
//!     .execute_command("alice", &id, "cargo", &["build".to_string()])
//!     .await?;
//! // Completion is observed through the output buffer.
//! let output = manager.read_output("alice", &id);
//! # let _ = output;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod limits;
pub mod logging;
pub mod process;
pub mod terminal;
pub mod utils;

pub use config::Config;
pub use error::AppError;
pub use process::{ProcessInfo, ProcessManager};
pub use terminal::{
    EventSender, ExecuteCommandResult, KillTerminalResult, OutputBuffer, OutputSnapshot,
    TerminalEvent, TerminalEventKind, TerminalManager, TerminalRegistry,
};
