//! Interface module - the boundary to the LocoNet hardware.
//!
//! An interface owns a pair of [`ByteQueues`] and a pump. The gateway only
//! needs three things from it:
//!
//! - `read()` - take everything received since the previous call
//! - `write(bytes)` - queue bytes for transmission without blocking
//! - `run()` - pump bytes between the hardware and the queues forever
//!
//! `run()` blocks; the gateway calls it on a dedicated OS thread.
//!
//! Implementations:
//! - [`LocoBufferUsb`] - RR-CirKits LocoBuffer-USB on a serial port
//! - [`LoopbackInterface`] - in-memory bus that echoes every transmitted byte

mod locobuffer;
mod loopback;
mod queues;

pub use locobuffer::{LocoBufferUsb, DEFAULT_BAUD_RATE};
pub use loopback::LoopbackInterface;
pub use queues::ByteQueues;

use bytes::Bytes;

use crate::error::Result;

/// A LocoNet hardware interface.
pub trait Interface: Send + Sync + 'static {
    /// The buffers this interface pumps.
    fn queues(&self) -> &ByteQueues;

    /// Pump bytes until the process ends.
    ///
    /// Only returns on an unrecoverable hardware error.
    fn run(&self) -> Result<()>;

    /// Take all bytes received since the previous call.
    fn read(&self) -> Bytes {
        self.queues().drain_inbound()
    }

    /// Queue bytes for transmission.
    fn write(&self, bytes: &[u8]) {
        self.queues().push_outbound(bytes)
    }
}
