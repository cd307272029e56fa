//! Protocol module - bus packets, framing, and the TCP line protocol.
//!
//! - [`Packet`] and the opcode length rule
//! - [`PacketFramer`] for reassembling packets from the inbound byte stream
//! - [`Command`] / [`ServerMessage`] for the LocoNet-over-TCP text lines

mod framer;
mod message;
mod packet;

pub use framer::{FramerStats, PacketFramer};
pub use message::{parse_hex_byte, Command, ServerMessage, SEND_KEYWORD};
pub use packet::{is_opcode, Packet, PacketLength, LENGTH_MASK, OPCODE_BIT};
