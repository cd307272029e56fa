//! Packet framer for the inbound bus byte stream.
//!
//! Bytes arrive from the interface with no boundaries. The framer keeps a
//! working packet and applies three rules per byte:
//!
//! - A byte with the high bit clear while no packet is in progress is noise
//!   and is discarded.
//! - A byte with the high bit set always starts a new packet. Any packet still
//!   in progress is abandoned.
//! - Anything else is appended to the working packet.
//!
//! After every byte the working packet is checked against its opcode's
//! [`PacketLength`] rule and emitted once complete.
//!
//! # Example
//!
//! ```
//! use loconet_gateway::protocol::PacketFramer;
//!
//! let mut framer = PacketFramer::new();
//!
//! // Data arrives in arbitrary chunks
//! assert!(framer.push(&[0x83]).is_empty());
//! let packets = framer.push(&[0x7c, 0xb0, 0x01]);
//!
//! assert_eq!(packets.len(), 1);
//! assert_eq!(packets[0].to_string(), "83 7c");
//! ```

use bytes::BytesMut;

use super::packet::{is_opcode, Packet, PacketLength};

/// Counters describing framing recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerStats {
    /// Completed packets emitted.
    pub packets: u64,
    /// Stray non-opcode bytes dropped while idle.
    pub noise_bytes: u64,
    /// Partial packets abandoned because a new opcode arrived.
    pub abandoned: u64,
}

/// Reassembles bus packets from a byte stream.
#[derive(Debug)]
pub struct PacketFramer {
    /// Packet being built; empty when idle.
    working: BytesMut,
    /// Length rule of the working packet's opcode.
    rule: Option<PacketLength>,
    stats: FramerStats,
}

impl PacketFramer {
    /// Create an idle framer.
    pub fn new() -> Self {
        Self {
            working: BytesMut::with_capacity(128),
            rule: None,
            stats: FramerStats::default(),
        }
    }

    /// Feed one byte. Returns the packet it completes, if any.
    pub fn accept(&mut self, byte: u8) -> Option<Packet> {
        if is_opcode(byte) {
            if !self.working.is_empty() {
                self.stats.abandoned += 1;
                tracing::debug!(
                    "Abandoning partial packet [{}] on opcode {:02x}",
                    Packet::new(self.working.clone().freeze()),
                    byte
                );
                self.working.clear();
            }
            self.working.extend_from_slice(&[byte]);
            self.rule = Some(PacketLength::from_opcode(byte));
        } else if self.working.is_empty() {
            self.stats.noise_bytes += 1;
            tracing::trace!("Discarding stray byte {:02x}", byte);
            return None;
        } else {
            self.working.extend_from_slice(&[byte]);
        }

        let rule = self.rule?;
        if !rule.is_complete(&self.working) {
            return None;
        }

        self.rule = None;
        self.stats.packets += 1;
        Some(Packet::new(self.working.split().freeze()))
    }

    /// Feed a batch of bytes and collect every packet they complete.
    ///
    /// Equivalent to calling [`accept`](Self::accept) for each byte in order.
    pub fn push(&mut self, data: &[u8]) -> Vec<Packet> {
        data.iter().filter_map(|&b| self.accept(b)).collect()
    }

    /// Number of bytes in the packet being built.
    pub fn len(&self) -> usize {
        self.working.len()
    }

    /// True if no packet is in progress.
    pub fn is_empty(&self) -> bool {
        self.working.is_empty()
    }

    /// Drop any partial packet.
    pub fn clear(&mut self) {
        self.working.clear();
        self.rule = None;
    }

    pub fn stats(&self) -> FramerStats {
        self.stats
    }
}

impl Default for PacketFramer {
    fn default() -> Self {
        Self::new()
    }
}
