//! # sharetty Library
//!
//! One shell, many viewers: sharetty runs a single shell on a pseudo-terminal
//! and lets any number of browser clients watch and type into it over
//! WebSockets.
//!
//! ## Overview
//!
//! - **PTY Session**: the shared shell and its pseudo-terminal
//! - **Client Registry**: the set of attached connections and their queues
//! - **Broadcast Hub**: fans shell output out to every client and routes
//!   keystrokes and resizes back to the shell
//! - **Server**: the browser page and the WebSocket endpoint
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       Orchestrator                          │
//! ├────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  browser ──ws──┐                                            │
//! │  browser ──ws──┼──▶ Server ──▶ Broadcast Hub ──▶ Session    │
//! │  browser ──ws──┘        ◀── fan-out ◀──┘     ◀── PTY/shell  │
//! │                                                             │
//! │                  Client Registry (per-client queues)        │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sharetty::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = Orchestrator::new(config);
//!     orchestrator.start().await?;
//!
//!     // Serve until the shell exits or Ctrl-C.
//!     let outcome = orchestrator
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!     println!("shell exited with {:?}", outcome.exit_code);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY session, client registry and broadcast hub
//! - [`server`]: HTTP and WebSocket front end
//! - [`orchestrator`]: Process lifecycle

pub mod config;
pub mod orchestrator;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError};
pub use orchestrator::{Orchestrator, OrchestratorState};
pub use server::{router, AppState};
pub use session::{
    BroadcastHub, ClientId, ClientRegistry, EndReason, HubError, RegistryError, Session,
    SessionError, SessionOptions, SessionOutcome, SessionState,
};
