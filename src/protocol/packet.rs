//! LocoNet packet type and the opcode length rule.
//!
//! The length of a LocoNet packet is encoded in bits 5-6 of its opcode:
//!
//! ```text
//! opcode & 0x60 | length
//! --------------+--------------------------------
//!          0x00 | 2 bytes
//!          0x20 | 4 bytes
//!          0x40 | 6 bytes
//!          0x60 | value of the second byte
//! ```
//!
//! Checksums and opcode semantics are not interpreted.

use std::fmt;

use bytes::Bytes;

/// Mask selecting the length bits of an opcode.
pub const LENGTH_MASK: u8 = 0b0110_0000;

/// High bit that marks a byte as an opcode.
pub const OPCODE_BIT: u8 = 0b1000_0000;

/// Returns true if `byte` can start a packet.
#[inline]
pub fn is_opcode(byte: u8) -> bool {
    byte & OPCODE_BIT != 0
}

/// Length rule selected by an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketLength {
    /// Packet is always this many bytes long.
    Fixed(usize),
    /// Packet length is carried in the second byte.
    Variable,
}

impl PacketLength {
    /// Select the length rule for an opcode.
    pub fn from_opcode(opcode: u8) -> Self {
        match opcode & LENGTH_MASK {
            0b0000_0000 => PacketLength::Fixed(2),
            0b0010_0000 => PacketLength::Fixed(4),
            0b0100_0000 => PacketLength::Fixed(6),
            _ => PacketLength::Variable,
        }
    }

    /// Check whether `bytes` (starting with the opcode) is exactly one
    /// complete packet under this rule.
    ///
    /// A single byte is never complete, even for a variable-length opcode.
    pub fn is_complete(self, bytes: &[u8]) -> bool {
        match (self, bytes) {
            (_, [] | [_]) => false,
            (PacketLength::Fixed(n), _) => bytes.len() == n,
            (PacketLength::Variable, [_, count, ..]) => bytes.len() == usize::from(*count),
        }
    }
}

/// One complete bus message.
///
/// Immutable once built; cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Packet(Bytes);

impl Packet {
    /// Wrap complete packet bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// The raw bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Number of bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The opcode (first byte), if any.
    pub fn opcode(&self) -> Option<u8> {
        self.0.first().copied()
    }

    /// Into the underlying bytes.
    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl From<Vec<u8>> for Packet {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Packet {
    fn from(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Space separated two-digit lowercase hex, e.g. `83 7c`.
impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
