//! Byte queues shared between an interface pump and the gateway.
//!
//! One mutex guards both directions. Every operation takes the lock once
//! for the whole call, so a drain returns everything buffered at that
//! instant and an append lands as one contiguous run.
//!
//! Wakeups:
//! - inbound data wakes the async framer task through a [`Notify`]
//! - outbound data wakes the blocking pump thread through a [`Condvar`]

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Buffers {
    /// Hardware -> framer.
    inbound: BytesMut,
    /// Gateway -> hardware.
    outbound: BytesMut,
}

/// Thread-safe FIFO byte buffers for one interface.
#[derive(Debug, Default)]
pub struct ByteQueues {
    buffers: Mutex<Buffers>,
    outbound_ready: Condvar,
    inbound_ready: Notify,
}

impl ByteQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Buffers> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append bytes received from the hardware.
    pub fn push_inbound(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.lock().inbound.extend_from_slice(bytes);
        self.inbound_ready.notify_one();
    }

    /// Take everything received since the previous drain.
    pub fn drain_inbound(&self) -> Bytes {
        self.lock().inbound.split().freeze()
    }

    /// Append bytes for transmission.
    pub fn push_outbound(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.lock().outbound.extend_from_slice(bytes);
        self.outbound_ready.notify_all();
    }

    /// Take all bytes queued for transmission without waiting.
    pub fn drain_outbound(&self) -> Bytes {
        self.lock().outbound.split().freeze()
    }

    /// Block the calling thread until outbound bytes are queued or `timeout`
    /// elapses, then take them. Returns empty bytes on timeout.
    ///
    /// Intended for pump threads only; never call from async code.
    pub fn wait_outbound(&self, timeout: Duration) -> Bytes {
        let guard = self.lock();
        let (mut guard, _) = self
            .outbound_ready
            .wait_timeout_while(guard, timeout, |b| b.outbound.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        guard.outbound.split().freeze()
    }

    /// Wait until inbound bytes may be available.
    ///
    /// A push that happens while nobody is waiting is remembered, so a
    /// drain-then-wait loop never misses data.
    pub async fn inbound_ready(&self) {
        self.inbound_ready.notified().await;
    }

    pub fn inbound_len(&self) -> usize {
        self.lock().inbound.len()
    }

    pub fn outbound_len(&self) -> usize {
        self.lock().outbound.len()
    }
}
