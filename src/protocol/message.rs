//! LocoNet-over-TCP line protocol.
//!
//! Plain ASCII lines terminated by `\n`:
//!
//! ```text
//! client -> server   SEND <hex> <hex> ...
//! server -> client   VERSION <product> <version>
//! server -> client   RECEIVE <hex> <hex> ...
//! server -> client   SENT OK | SENT ERROR
//! ```
//!
//! Lines whose first token is not `SEND`, and blank lines, are ignored.

use std::fmt;

use bytes::Bytes;

use super::packet::Packet;
use crate::error::{GatewayError, Result};

/// Keyword of the only client command.
pub const SEND_KEYWORD: &str = "SEND";

/// A command received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Transmit a packet onto the bus.
    Send(Packet),
}

impl Command {
    /// Parse one client line.
    ///
    /// Returns `Ok(None)` for blank lines and unknown commands, which the
    /// protocol silently ignores.
    ///
    /// # Errors
    ///
    /// A `SEND` line with no bytes, or with a token that is not exactly two
    /// hex digits, is rejected.
    pub fn parse(line: &str) -> Result<Option<Command>> {
        let mut tokens = line.split_whitespace();

        match tokens.next() {
            Some(SEND_KEYWORD) => {
                let bytes = tokens.map(parse_hex_byte).collect::<Result<Vec<u8>>>()?;
                if bytes.is_empty() {
                    return Err(GatewayError::EmptyPacket);
                }
                Ok(Some(Command::Send(Packet::from(bytes))))
            }
            _ => Ok(None),
        }
    }
}

/// Parse a token of exactly two hex digits (either case).
pub fn parse_hex_byte(token: &str) -> Result<u8> {
    let valid = token.len() == 2 && token.bytes().all(|b| b.is_ascii_hexdigit());
    if !valid {
        return Err(GatewayError::InvalidHex(token.to_string()));
    }
    u8::from_str_radix(token, 16).map_err(|_| GatewayError::InvalidHex(token.to_string()))
}

/// A line sent from the gateway to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Greeting sent once after connect.
    Version { product: String, version: String },
    /// A packet observed on the bus.
    Receive(Packet),
    /// Outcome of a `SEND` command.
    Sent(bool),
}

impl ServerMessage {
    /// Render as a newline-terminated line ready for the socket.
    pub fn to_line(&self) -> Bytes {
        Bytes::from(format!("{}\n", self))
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMessage::Version { product, version } => {
                write!(f, "VERSION {} {}", product, version)
            }
            ServerMessage::Receive(packet) => write!(f, "RECEIVE {}", packet),
            ServerMessage::Sent(true) => f.write_str("SENT OK"),
            ServerMessage::Sent(false) => f.write_str("SENT ERROR"),
        }
    }
}
