//! Send-with-echo-confirmation.
//!
//! LocoNet interfaces give no transmit acknowledgment. What they do give is
//! an echo: every packet that makes it onto the bus is received back like
//! any other. A send is therefore confirmed by watching the broadcast path
//! for the exact bytes that were written:
//!
//! 1. register an [`EchoObserver`] for the packet
//! 2. queue the bytes on the interface
//! 3. wait up to the echo timeout for the observer to fire
//! 4. deregister the observer, whatever the outcome
//!
//! The observer is held by a [`TargetGuard`], so it is also removed when the
//! send is cancelled mid-wait.
//!
//! Packets seen meanwhile that do not match are ignored and do not extend
//! the deadline. A timeout does not mean nothing was transmitted, only that
//! no echo was seen.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::hub::{BroadcastRegistry, EchoObserver, TargetGuard};
use crate::interface::Interface;
use crate::protocol::Packet;

/// Default time to wait for the bus to echo a sent packet.
pub const DEFAULT_ECHO_TIMEOUT: Duration = Duration::from_secs(2);

/// Transmits packets and confirms them by echo.
///
/// Cheaply cloneable; one instance is shared by every session.
#[derive(Clone)]
pub struct SendPipeline {
    interface: Arc<dyn Interface>,
    registry: Arc<BroadcastRegistry>,
    echo_timeout: Duration,
}

impl SendPipeline {
    pub fn new(
        interface: Arc<dyn Interface>,
        registry: Arc<BroadcastRegistry>,
        echo_timeout: Duration,
    ) -> Self {
        Self {
            interface,
            registry,
            echo_timeout,
        }
    }

    pub fn echo_timeout(&self) -> Duration {
        self.echo_timeout
    }

    /// Transmit `packet` and wait for its echo.
    ///
    /// # Errors
    ///
    /// `GatewayError::NoEcho` if the packet was not seen on the bus within
    /// the echo timeout.
    pub async fn send(&self, packet: Packet) -> Result<()> {
        let (observer, echoed) = EchoObserver::new(packet.clone());
        let observer = TargetGuard::register(&self.registry, Arc::new(observer));

        self.interface.write(packet.as_bytes());

        let outcome = tokio::time::timeout(self.echo_timeout, echoed).await;

        observer.deregister().await;

        match outcome {
            Ok(Ok(())) => {
                tracing::debug!("Echo confirmed for [{}]", packet);
                Ok(())
            }
            _ => {
                tracing::debug!("No echo for [{}] within {:?}", packet, self.echo_timeout);
                Err(GatewayError::NoEcho(self.echo_timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::ByteQueues;

    /// Interface whose bus never answers.
    #[derive(Default)]
    struct SilentBus {
        queues: ByteQueues,
    }

    impl Interface for SilentBus {
        fn queues(&self) -> &ByteQueues {
            &self.queues
        }

        fn run(&self) -> Result<()> {
            Ok(())
        }
    }

    fn pipeline(timeout: Duration) -> (SendPipeline, Arc<SilentBus>, Arc<BroadcastRegistry>) {
        let bus = Arc::new(SilentBus::default());
        let registry = Arc::new(BroadcastRegistry::new());
        let pipeline = SendPipeline::new(bus.clone(), registry.clone(), timeout);
        (pipeline, bus, registry)
    }

    #[tokio::test]
    async fn test_confirmed_by_matching_broadcast() {
        let (pipeline, bus, registry) = pipeline(Duration::from_secs(2));
        let packet = Packet::from(vec![0x83, 0x7C]);

        let echo = {
            let registry = registry.clone();
            let packet = packet.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                registry.broadcast(&packet)
            })
        };

        pipeline.send(packet).await.unwrap();
        echo.await.unwrap();

        assert_eq!(&bus.queues.drain_outbound()[..], &[0x83, 0x7C]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_without_echo() {
        let (pipeline, bus, registry) = pipeline(Duration::from_millis(50));

        let result = pipeline.send(Packet::from(vec![0xB0, 0x01, 0x02, 0x03])).await;

        assert!(matches!(result, Err(GatewayError::NoEcho(_))));
        // Bytes were still queued for transmission
        assert_eq!(bus.queues.outbound_len(), 4);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_non_matching_packets_ignored() {
        let (pipeline, _bus, registry) = pipeline(Duration::from_millis(100));

        let noise = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for _ in 0..5 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    registry.broadcast(&Packet::from(vec![0x85, 0x7A]));
                }
            })
        };

        let result = pipeline.send(Packet::from(vec![0x83, 0x7C])).await;
        noise.await.unwrap();

        assert!(matches!(result, Err(GatewayError::NoEcho(_))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_send_leaves_no_observer() {
        let (pipeline, _bus, registry) = pipeline(Duration::from_secs(10));

        let task = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.send(Packet::from(vec![0x83, 0x7C])).await })
        };
        while registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_deadline_is_two_seconds() {
        let (pipeline, _bus, _registry) = pipeline(DEFAULT_ECHO_TIMEOUT);

        let start = tokio::time::Instant::now();
        let result = pipeline.send(Packet::from(vec![0x83, 0x7C])).await;

        assert!(result.is_err());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_millis(2010));
    }
}
