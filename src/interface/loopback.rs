//! In-memory interface that behaves like an idle LocoNet segment.
//!
//! Every byte written is "transmitted" and then seen again on the receive
//! side, the same echo a real LocoBuffer reports for its own packets. Bytes
//! can also be injected as if another device on the bus had sent them.

use std::time::Duration;

use super::{ByteQueues, Interface};
use crate::error::Result;

/// How long the pump waits for outbound data per cycle.
const PUMP_WAIT: Duration = Duration::from_millis(50);

/// Loopback bus.
#[derive(Debug, Default)]
pub struct LoopbackInterface {
    queues: ByteQueues,
}

impl LoopbackInterface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject bytes as if another bus device had sent them.
    pub fn inject(&self, bytes: &[u8]) {
        self.queues.push_inbound(bytes);
    }

    /// Move any queued outbound bytes to the inbound side once.
    ///
    /// Returns the number of bytes echoed.
    pub fn pump_once(&self, wait: Duration) -> usize {
        let bytes = self.queues.wait_outbound(wait);
        if !bytes.is_empty() {
            tracing::trace!("Loopback echoing {} bytes", bytes.len());
            self.queues.push_inbound(&bytes);
        }
        bytes.len()
    }
}

impl Interface for LoopbackInterface {
    fn queues(&self) -> &ByteQueues {
        &self.queues
    }

    fn run(&self) -> Result<()> {
        loop {
            self.pump_once(PUMP_WAIT);
        }
    }
}
