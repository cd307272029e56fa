//! Dedicated writer task for one client connection.
//!
//! Command responses come from the session task and `RECEIVE` notifications
//! come from the broadcast path. Both go through a single mpsc channel into
//! one writer task, so lines to the same connection never interleave and
//! nothing holds a lock across a socket write.
//!
//! # Architecture
//!
//! ```text
//! Session task  ─┐
//!                ├─► mpsc::Sender<Bytes> ─► Writer Task ─► TCP write half
//! Broadcast     ─┘
//! ```
//!
//! Lines that are ready together are coalesced into one write. A pending
//! line count gives backpressure: once a client stops reading and the
//! count reaches its limit, senders wait up to a timeout and then fail,
//! which gets the client dropped from the broadcast registry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{GatewayError, Result};
use crate::protocol::ServerMessage;

/// Default maximum pending lines before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_LINES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum lines to coalesce in a single write.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending lines before backpressure kicks in.
    pub max_pending_lines: usize,
    /// Channel capacity for the line queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_lines: DEFAULT_MAX_PENDING_LINES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for queueing lines to one connection.
///
/// Cheaply cloneable. The writer task exits once every handle is dropped.
#[derive(Debug, Clone)]
pub struct LineWriter {
    tx: mpsc::Sender<Bytes>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl LineWriter {
    fn new(
        tx: mpsc::Sender<Bytes>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Queue a protocol message.
    pub async fn send_message(&self, message: &ServerMessage) -> Result<()> {
        self.send(message.to_line()).await
    }

    /// Queue a pre-rendered, newline-terminated line.
    ///
    /// Waits while backpressure is active, failing after the configured
    /// timeout. Fails with `ConnectionClosed` once the writer task is gone.
    pub async fn send(&self, line: Bytes) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        let sent = tokio::time::timeout(self.timeout, self.tx.send(line)).await;
        match sent {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.pending.fetch_sub(1, Ordering::Release);
                Err(GatewayError::ConnectionClosed)
            }
            Err(_) => {
                self.pending.fetch_sub(1, Ordering::Release);
                Err(GatewayError::BackpressureTimeout)
            }
        }
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_millis(1);

        loop {
            if self.tx.is_closed() {
                return Err(GatewayError::ConnectionClosed);
            }
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }
            if start.elapsed() > self.timeout {
                return Err(GatewayError::BackpressureTimeout);
            }

            tokio::time::sleep(check_interval).await;
        }
    }

    /// True once the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Spawn the writer task for `writer` and return a handle to feed it.
pub fn spawn_line_writer<W>(writer: W, config: &WriterConfig) -> (LineWriter, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = LineWriter::new(
        tx,
        pending.clone(),
        config.max_pending_lines,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

/// Receive lines and write them out, coalescing whatever is already queued.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = BytesMut::with_capacity(4096);

    while let Some(first) = rx.recv().await {
        batch.extend_from_slice(&first);
        let mut count = 1;

        while count < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(line) => {
                    batch.extend_from_slice(&line);
                    count += 1;
                }
                Err(_) => break,
            }
        }

        let chunk = batch.split();
        let written = async {
            writer.write_all(&chunk).await?;
            writer.flush().await
        }
        .await;

        pending.fetch_sub(count, Ordering::Release);

        if let Err(e) = written {
            // Closing rx makes every handle fail fast from here on
            rx.close();
            return Err(GatewayError::Io(e));
        }
    }

    let _ = writer.shutdown().await;
    Ok(())
}
