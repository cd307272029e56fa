//! Notification targets.
//!
//! Anything registered with the [`BroadcastRegistry`](super::BroadcastRegistry)
//! implements [`NotificationTarget`]. Two kinds exist:
//!
//! - [`ClientTarget`] - a TCP client; writes the rendered `RECEIVE` line to
//!   its connection's writer task
//! - [`EchoObserver`] - a short-lived internal subscriber used by the send
//!   pipeline; fires a one-shot channel when it sees the packet it waits for

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::protocol::{Packet, ServerMessage};
use crate::writer::LineWriter;

/// Boxed future returned by targets.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A packet observed on the bus, with its `RECEIVE` line rendered once for
/// every target.
#[derive(Debug, Clone)]
pub struct Notification {
    packet: Packet,
    line: Bytes,
}

impl Notification {
    pub fn new(packet: Packet) -> Self {
        let line = ServerMessage::Receive(packet.clone()).to_line();
        Self { packet, line }
    }

    #[inline]
    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    /// `RECEIVE ...\n`
    #[inline]
    pub fn line(&self) -> &Bytes {
        &self.line
    }
}

/// Something that can be told about packets seen on the bus.
pub trait NotificationTarget: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Deliver one notification.
    ///
    /// An error means the target is unusable and should be deregistered.
    fn notify<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<()>>;
}

/// A connected TCP client.
#[derive(Debug, Clone)]
pub struct ClientTarget {
    peer: String,
    writer: LineWriter,
}

impl ClientTarget {
    pub fn new(peer: impl Into<String>, writer: LineWriter) -> Self {
        Self {
            peer: peer.into(),
            writer,
        }
    }
}

impl NotificationTarget for ClientTarget {
    fn name(&self) -> &str {
        &self.peer
    }

    fn notify<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.writer.send(notification.line().clone()))
    }
}

/// Waits for one specific packet to be echoed on the bus.
///
/// Other packets are ignored. The receiver returned by [`EchoObserver::new`]
/// resolves the first time the expected packet is delivered.
#[derive(Debug)]
pub struct EchoObserver {
    expected: Packet,
    echoed: Mutex<Option<oneshot::Sender<()>>>,
}

impl EchoObserver {
    pub fn new(expected: Packet) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let observer = Self {
            expected,
            echoed: Mutex::new(Some(tx)),
        };
        (observer, rx)
    }

    pub fn expected(&self) -> &Packet {
        &self.expected
    }
}

impl NotificationTarget for EchoObserver {
    fn name(&self) -> &str {
        "echo-observer"
    }

    fn notify<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<()>> {
        if notification.packet() == &self.expected {
            let tx = self
                .echoed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(tx) = tx {
                let _ = tx.send(());
            }
        }
        Box::pin(std::future::ready(Ok(())))
    }
}
