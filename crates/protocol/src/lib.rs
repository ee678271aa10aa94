//! # sharetty Protocol Library
//!
//! Message definitions shared by the sharetty server and its clients.
//!
//! ## Framing
//!
//! ```text
//! ┌──────────────────────────────┬───────────────────────────────┐
//! │ Binary WebSocket frame       │ raw terminal bytes            │
//! ├──────────────────────────────┼───────────────────────────────┤
//! │ Text WebSocket frame         │ JSON envelope, tagged by type │
//! └──────────────────────────────┴───────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientRequest, ServerMessage, TerminalSize};
//!
//! let request = ClientRequest::from_text(r#"{"type":"resize","rows":40,"cols":120}"#).unwrap();
//! assert_eq!(request, ClientRequest::Resize(TerminalSize::new(40, 120)));
//!
//! let users = ServerMessage::Users { count: 2 }.to_json().unwrap();
//! assert_eq!(users, r#"{"type":"users","count":2}"#);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Control envelopes and request decoding
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{ClientMessage, ClientRequest, ServerMessage, TerminalSize, MAX_DIMENSION};
