//! Shared terminal session.
//!
//! This module provides the PTY session, the registry of attached clients
//! and the hub that fans session output out to them.

pub mod hub;
pub mod pty;
pub mod registry;
pub mod replay;

pub use hub::{BroadcastHub, ClientAttachment, EndReason, HubError, SessionOutcome};
pub use pty::{OutputStream, Session, SessionError, SessionOptions, SessionState};
pub use registry::{
    ClientHandle, ClientId, ClientInfo, ClientRegistry, ClientStats, Outbound, RegistryError,
    RegistrySnapshot, SendOutcome,
};
pub use replay::ReplayBuffer;
