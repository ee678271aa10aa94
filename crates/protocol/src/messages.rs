//! Wire message definitions for sharetty.
//!
//! A connection carries two kinds of WebSocket frames:
//!
//! - **Binary frames** are raw terminal bytes. From client to server they are
//!   keystrokes; from server to client they are PTY output chunks.
//! - **Text frames** are JSON control envelopes tagged by a `type` field.
//!
//! ```text
//! client -> server   {"type":"input","data":"ls -la\r"}
//! client -> server   {"type":"resize","rows":40,"cols":120}
//! server -> client   {"type":"users","count":3}
//! server -> client   {"type":"exit","code":0}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Largest row or column count accepted in a resize.
pub const MAX_DIMENSION: u16 = 1000;

/// Terminal dimensions as reported by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of rows.
    pub rows: u16,
    /// Number of columns.
    pub cols: u16,
}

impl TerminalSize {
    /// Creates a new size without validating it.
    pub const fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Checks that both dimensions are within `1..=MAX_DIMENSION`.
    pub fn validate(&self) -> Result<()> {
        if self.rows == 0
            || self.cols == 0
            || self.rows > MAX_DIMENSION
            || self.cols > MAX_DIMENSION
        {
            return Err(ProtocolError::InvalidDimensions {
                rows: self.rows,
                cols: self.cols,
            });
        }
        Ok(())
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Control messages sent by a client in text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keystrokes typed as text.
    Input {
        /// UTF-8 keystroke payload.
        data: String,
    },
    /// The client's terminal changed size.
    Resize {
        /// New row count.
        rows: u16,
        /// New column count.
        cols: u16,
    },
}

impl ClientMessage {
    /// Parses a text frame into a client message.
    ///
    /// Resize messages are validated here so that the session only ever
    /// sees usable dimensions.
    pub fn from_json(text: &str) -> Result<Self> {
        let message: ClientMessage = serde_json::from_str(text)?;
        if let ClientMessage::Resize { rows, cols } = message {
            TerminalSize::new(rows, cols).validate()?;
        }
        Ok(message)
    }

    /// Serializes the message for a text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Control messages sent by the server in text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Current number of connected viewers.
    Users {
        /// Viewer count, including the recipient.
        count: usize,
    },
    /// The shared shell has ended. The server closes the connection next.
    Exit {
        /// Exit code of the shell, if it could be determined.
        code: Option<i32>,
    },
}

impl ServerMessage {
    /// Serializes the message for a text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a text frame into a server message.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Anything a client can ask of the shared terminal, regardless of which
/// frame kind carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// Raw bytes to write to the terminal.
    Input(Vec<u8>),
    /// New terminal dimensions.
    Resize(TerminalSize),
}

impl ClientRequest {
    /// Decodes a binary frame. Binary frames are always keystrokes.
    pub fn from_binary(data: Vec<u8>) -> Self {
        ClientRequest::Input(data)
    }

    /// Decodes a text frame carrying a JSON control envelope.
    pub fn from_text(text: &str) -> Result<Self> {
        Ok(match ClientMessage::from_json(text)? {
            ClientMessage::Input { data } => ClientRequest::Input(data.into_bytes()),
            ClientMessage::Resize { rows, cols } => {
                ClientRequest::Resize(TerminalSize::new(rows, cols))
            }
        })
    }
}
