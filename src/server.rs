//! Gateway builder and runtime.
//!
//! The [`GatewayBuilder`] provides a fluent API over [`GatewayConfig`]. The
//! [`Gateway`] manages the lifecycle:
//! 1. Bind the TCP listener
//! 2. Start the interface pump on its own OS thread
//! 3. Start the framer task that turns received bytes into broadcasts
//! 4. Accept clients, one session task each
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use loconet_gateway::{Gateway, LoopbackInterface};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = Gateway::builder()
//!         .port(5626)
//!         .max_connections(8)
//!         .start(Arc::new(LoopbackInterface::new()))
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::GatewayConfig;
use crate::error::Result;
use crate::hub::BroadcastRegistry;
use crate::interface::Interface;
use crate::pipeline::SendPipeline;
use crate::protocol::{PacketFramer, ServerMessage};
use crate::session::{self, SessionContext};

/// Name of the OS thread running the interface pump.
pub const PUMP_THREAD_NAME: &str = "loconet-pump";

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Builder for configuring and starting a gateway.
pub struct GatewayBuilder {
    config: GatewayConfig,
}

impl GatewayBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
        }
    }

    /// Start from an existing configuration.
    pub fn from_config(config: GatewayConfig) -> Self {
        Self { config }
    }

    /// Set the bind address.
    ///
    /// Default: 127.0.0.1
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the TCP port. Port 0 picks an ephemeral port.
    ///
    /// Default: 5626
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the concurrent client limit.
    ///
    /// Clients beyond the limit wait until a session ends.
    /// Default: 4
    pub fn max_connections(mut self, limit: usize) -> Self {
        self.config.max_connections = limit;
        self
    }

    /// Set how long a SEND waits for its echo.
    ///
    /// Default: 2 seconds
    pub fn echo_timeout(mut self, timeout: Duration) -> Self {
        self.config.echo_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the framer fallback poll interval.
    ///
    /// Default: 100 ms
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the product name and version reported in `VERSION`.
    pub fn product(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.config.product = name.into();
        self.config.version = version.into();
        self
    }

    /// Set the per-client backpressure threshold.
    ///
    /// Default: 1024
    pub fn max_pending_lines(mut self, limit: usize) -> Self {
        self.config.max_pending_lines = limit;
        self
    }

    /// Set the per-client writer channel capacity.
    ///
    /// Default: 256
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Set how long a line may wait on a slow client.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.backpressure_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Validate the settings and start serving `interface`.
    pub async fn start(self, interface: Arc<dyn Interface>) -> Result<Gateway> {
        Gateway::start(self.config, interface).await
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running gateway.
///
/// Dropping it leaves the tasks running; call [`Gateway::shutdown`] to stop
/// accepting clients and close every session.
pub struct Gateway {
    local_addr: SocketAddr,
    registry: Arc<BroadcastRegistry>,
    pipeline: SendPipeline,
    accept_task: JoinHandle<()>,
    framer_task: JoinHandle<()>,
}

impl Gateway {
    /// Create a new gateway builder.
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    async fn start(config: GatewayConfig, interface: Arc<dyn Interface>) -> Result<Self> {
        config.validate()?;

        // 1. Bind before anything else so a busy port fails fast
        let listener = TcpListener::bind(config.listen_addr()?).await?;
        let local_addr = listener.local_addr()?;

        // 2. Interface pump
        spawn_pump(interface.clone())?;

        // 3. Framer
        let registry = Arc::new(BroadcastRegistry::new());
        let framer_task = tokio::spawn(framer_loop(
            interface.clone(),
            registry.clone(),
            config.poll_interval(),
        ));

        // 4. Sessions
        let pipeline = SendPipeline::new(interface, registry.clone(), config.echo_timeout());
        let ctx = Arc::new(SessionContext {
            registry: registry.clone(),
            pipeline: pipeline.clone(),
            greeting: ServerMessage::Version {
                product: config.product.clone(),
                version: config.version.clone(),
            },
            writer_config: config.writer_config(),
        });
        let slots = Arc::new(Semaphore::new(config.max_connections));
        let accept_task = tokio::spawn(accept_loop(listener, ctx, slots));

        tracing::info!(
            "Listening on {} (max {} clients, echo timeout {:?})",
            local_addr,
            config.max_connections,
            config.echo_timeout()
        );

        Ok(Gateway {
            local_addr,
            registry,
            pipeline,
            accept_task,
            framer_task,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registry of clients and pending echo observers.
    pub fn registry(&self) -> &Arc<BroadcastRegistry> {
        &self.registry
    }

    /// Send pipeline shared by all sessions.
    pub fn pipeline(&self) -> &SendPipeline {
        &self.pipeline
    }

    /// Stop accepting clients, close all sessions and stop the framer.
    ///
    /// The interface pump thread is not stopped; it ends with the process.
    pub async fn shutdown(self) {
        self.accept_task.abort();
        self.framer_task.abort();
        let _ = self.accept_task.await;
        let _ = self.framer_task.await;
        tracing::info!("Gateway on {} stopped", self.local_addr);
    }
}

/// Run `interface.run()` on a dedicated OS thread.
fn spawn_pump(interface: Arc<dyn Interface>) -> Result<()> {
    std::thread::Builder::new()
        .name(PUMP_THREAD_NAME.to_string())
        .spawn(move || match interface.run() {
            Ok(()) => tracing::warn!("Interface pump stopped"),
            Err(e) => tracing::error!("Interface pump failed: {}", e),
        })?;
    Ok(())
}

/// Drain received bytes, frame them and broadcast every complete packet.
async fn framer_loop(
    interface: Arc<dyn Interface>,
    registry: Arc<BroadcastRegistry>,
    poll_interval: Duration,
) {
    let mut framer = PacketFramer::new();

    loop {
        let bytes = interface.read();
        if bytes.is_empty() {
            tokio::select! {
                _ = interface.queues().inbound_ready() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
            continue;
        }

        for packet in framer.push(&bytes) {
            tracing::trace!("Bus packet [{}]", packet);
            let report = registry.broadcast(&packet);
            if report.failed > 0 {
                tracing::debug!("Dropped {} unreachable targets", report.failed);
            }
        }
    }
}

/// Accept clients until aborted.
///
/// A connection slot is taken before each `accept`, so clients beyond the
/// limit wait in the listen backlog until a session ends.
///
/// Sessions live in a `JoinSet` owned by this task, so aborting the accept
/// loop also ends every session.
async fn accept_loop(listener: TcpListener, ctx: Arc<SessionContext>, slots: Arc<Semaphore>) {
    let mut sessions = JoinSet::new();

    loop {
        while let Some(joined) = sessions.try_join_next() {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    tracing::error!("Session task failed: {}", e);
                }
            }
        }

        if slots.available_permits() == 0 {
            tracing::warn!("Connection limit reached, waiting for a free slot");
        }
        let Ok(permit) = slots.clone().acquire_owned().await else {
            return;
        };

        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };

        let ctx = ctx.clone();
        sessions.spawn(async move {
            // Slot is held until the session ends
            let _permit = permit;
            handle_connection(stream, peer, &ctx).await;
        });
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: &SessionContext) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
    }
    tracing::info!("Client {} connected", peer);

    let peer_name = peer.to_string();
    let (reader, writer) = stream.into_split();
    match session::serve(reader, writer, &peer_name, ctx).await {
        Ok(stats) => tracing::info!(
            "Client {} disconnected ({} sent, {} failed)",
            peer,
            stats.sent_ok,
            stats.sent_error
        ),
        Err(e) => tracing::info!("Client {} dropped: {}", peer, e),
    }
}
