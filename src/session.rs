//! Client session handler.
//!
//! One session per TCP connection:
//! 1. Spawn the connection's writer task
//! 2. Queue the `VERSION` greeting
//! 3. Register the client for `RECEIVE` broadcasts
//! 4. Read lines until end-of-stream, answering each `SEND` with `SENT OK`
//!    or `SENT ERROR`
//! 5. Deregister
//!
//! The greeting is queued before registration so it is always the first
//! line the client sees.
//!
//! A `SEND` blocks this session until the pipeline confirms or times out.
//! Broadcasts keep flowing to the client meanwhile because they go straight
//! to the writer task.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};

use crate::error::{GatewayError, Result};
use crate::hub::{BroadcastRegistry, ClientTarget, TargetGuard};
use crate::pipeline::SendPipeline;
use crate::protocol::{Command, ServerMessage};
use crate::writer::{spawn_line_writer, LineWriter, WriterConfig};

/// Longest accepted client line, including the newline.
pub const MAX_LINE_LENGTH: usize = 4096;

/// State shared by every session of one gateway.
pub struct SessionContext {
    pub registry: Arc<BroadcastRegistry>,
    pub pipeline: SendPipeline,
    /// `VERSION` line sent on connect.
    pub greeting: ServerMessage,
    pub writer_config: WriterConfig,
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub sent_ok: u64,
    pub sent_error: u64,
    pub ignored: u64,
}

/// Serve one client until it disconnects.
///
/// Returns an error only for I/O failures on the connection itself; a
/// client that simply closes its end finishes with `Ok`.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    peer: &str,
    ctx: &SessionContext,
) -> Result<SessionStats>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (lines, writer_task) = spawn_line_writer(writer, &ctx.writer_config);
    lines.send_message(&ctx.greeting).await?;

    let target = ClientTarget::new(peer, lines.clone());
    let registration = TargetGuard::register(&ctx.registry, Arc::new(target));

    let result = read_loop(reader, &lines, peer, ctx).await;

    registration.deregister().await;
    drop(lines);

    // Let queued responses reach the socket before the connection is dropped
    if tokio::time::timeout(ctx.writer_config.backpressure_timeout, writer_task)
        .await
        .is_err()
    {
        tracing::debug!("Writer for {} still busy at session end", peer);
    }

    result
}

async fn read_loop<R>(
    reader: R,
    lines: &LineWriter,
    peer: &str,
    ctx: &SessionContext,
) -> Result<SessionStats>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    let mut stats = SessionStats::default();

    loop {
        buf.clear();
        let n = (&mut reader)
            .take(MAX_LINE_LENGTH as u64)
            .read_until(b'\n', &mut buf)
            .await?;

        if n == 0 {
            return Ok(stats);
        }
        if n == MAX_LINE_LENGTH && buf.last() != Some(&b'\n') {
            return Err(GatewayError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("line longer than {} bytes", MAX_LINE_LENGTH),
            )));
        }

        let line = String::from_utf8_lossy(&buf);
        let confirmed = match Command::parse(&line) {
            Ok(None) => {
                stats.ignored += 1;
                continue;
            }
            Ok(Some(Command::Send(packet))) => match ctx.pipeline.send(packet.clone()).await {
                Ok(()) => {
                    tracing::info!("{} SEND [{}] OK", peer, packet);
                    true
                }
                Err(e) => {
                    tracing::info!("{} SEND [{}] ERROR: {}", peer, packet, e);
                    false
                }
            },
            Err(e) => {
                tracing::info!("{} SEND rejected: {}", peer, e);
                false
            }
        };

        if confirmed {
            stats.sent_ok += 1;
        } else {
            stats.sent_error += 1;
        }
        lines.send_message(&ServerMessage::Sent(confirmed)).await?;
    }
}
