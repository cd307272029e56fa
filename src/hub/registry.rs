//! Broadcast registry for fanning bus packets out to every target.
//!
//! Membership lives behind one `RwLock` that is only held long enough to
//! insert, remove, or enqueue. Delivery never runs under it.
//!
//! Each registered target gets a bounded queue and its own delivery task.
//! `broadcast` only enqueues, so the caller never waits on a target. The
//! delivery task drains the queue in order and holds the target's gate for
//! the duration of each `notify`. Deregistration marks the target closed
//! and then takes the gate, so:
//!
//! - deregistering waits for an in-flight delivery to that target only
//! - once `deregister` returns, the target receives nothing further
//! - a slow or stuck target never delays deliveries to the others
//!
//! A target that returns an error, panics, or lets its queue fill up is
//! removed.
//!
//! # Example
//!
//! ```ignore
//! use loconet_gateway::hub::{BroadcastRegistry, ClientTarget};
//!
//! let registry = BroadcastRegistry::new();
//! let id = registry.register(Arc::new(ClientTarget::new(peer, writer)));
//!
//! let report = registry.broadcast(&packet);
//! registry.deregister(id).await;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex as AsyncMutex;

use super::target::{Notification, NotificationTarget};
use crate::protocol::Packet;

/// Identifier handed out by [`BroadcastRegistry::register`].
pub type TargetId = u64;

/// Default number of notifications a target may have queued.
pub const DEFAULT_TARGET_QUEUE_CAPACITY: usize = 256;

type SlotMap = RwLock<HashMap<TargetId, Slot>>;

/// State shared between a slot and its delivery task.
struct Delivery {
    target: Arc<dyn NotificationTarget>,
    open: AtomicBool,
    /// Held for the duration of each `notify`.
    gate: AsyncMutex<()>,
}

impl Delivery {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// One registered target and the sending end of its queue.
struct Slot {
    delivery: Arc<Delivery>,
    queue: mpsc::Sender<Notification>,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Targets the notification was queued for.
    pub queued: usize,
    /// Targets that could not take it and were removed.
    pub failed: usize,
}

/// Set of targets that receive every broadcast packet.
pub struct BroadcastRegistry {
    slots: Arc<SlotMap>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl BroadcastRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_TARGET_QUEUE_CAPACITY)
    }

    /// Create an empty registry whose targets may each have up to
    /// `capacity` notifications waiting.
    pub fn with_queue_capacity(capacity: usize) -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            queue_capacity: capacity.max(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TargetId, Slot>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TargetId, Slot>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a target. It receives every packet broadcast from now until it
    /// is deregistered.
    ///
    /// Spawns the target's delivery task, so it must be called from within
    /// a tokio runtime.
    pub fn register(&self, target: Arc<dyn NotificationTarget>) -> TargetId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Registered target {} ({})", id, target.name());

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let delivery = Arc::new(Delivery {
            target,
            open: AtomicBool::new(true),
            gate: AsyncMutex::new(()),
        });

        self.write().insert(
            id,
            Slot {
                delivery: delivery.clone(),
                queue: tx,
            },
        );
        tokio::spawn(delivery_loop(id, delivery, rx, Arc::downgrade(&self.slots)));
        id
    }

    /// Remove a target, waiting for any delivery to it that is in progress.
    ///
    /// Returns `false` if the id was not registered.
    pub async fn deregister(&self, id: TargetId) -> bool {
        let Some(slot) = self.remove(id) else {
            return false;
        };

        let _gate = slot.delivery.gate.lock().await;
        tracing::debug!("Deregistered target {} ({})", id, slot.delivery.target.name());
        true
    }

    /// Remove a target without waiting.
    ///
    /// Nothing is delivered to it after this returns, except a delivery
    /// that had already started.
    pub fn remove(&self, id: TargetId) -> Option<RemovedTarget> {
        let slot = self.write().remove(&id)?;
        slot.delivery.close();
        Some(RemovedTarget {
            delivery: slot.delivery,
        })
    }

    /// Queue `packet` for every registered target.
    ///
    /// Never waits on a target. One whose queue is full or whose delivery
    /// task has ended is removed.
    pub fn broadcast(&self, packet: &Packet) -> BroadcastReport {
        let notification = Notification::new(packet.clone());
        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();

        for (id, slot) in self.read().iter() {
            match slot.queue.try_send(notification.clone()) {
                Ok(()) => report.queued += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        "Target {} ({}) is not keeping up, dropping it",
                        id,
                        slot.delivery.target.name()
                    );
                    failed.push(*id);
                }
                Err(TrySendError::Closed(_)) => failed.push(*id),
            }
        }

        for id in failed {
            if self.remove(id).is_some() {
                report.failed += 1;
            }
        }

        report
    }

    /// Number of registered targets.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn contains(&self, id: TargetId) -> bool {
        self.read().contains_key(&id)
    }
}

impl Default for BroadcastRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A target taken out of the registry by [`BroadcastRegistry::remove`].
pub struct RemovedTarget {
    delivery: Arc<Delivery>,
}

impl RemovedTarget {
    pub fn name(&self) -> &str {
        self.delivery.target.name()
    }
}

/// Deliver queued notifications to one target, in order, until it is
/// closed or its queue is dropped.
async fn delivery_loop(
    id: TargetId,
    delivery: Arc<Delivery>,
    mut rx: mpsc::Receiver<Notification>,
    slots: Weak<SlotMap>,
) {
    while let Some(notification) = rx.recv().await {
        let _gate = delivery.gate.lock().await;
        if !delivery.is_open() {
            return;
        }

        // Own task so a panicking target is reported instead of taking
        // this loop down with it
        let target = delivery.target.clone();
        let outcome = tokio::spawn(async move { target.notify(&notification).await }).await;

        let failure = match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };

        tracing::warn!(
            "Delivery to target {} ({}) failed: {}",
            id,
            delivery.target.name(),
            failure
        );
        delivery.close();
        if let Some(slots) = slots.upgrade() {
            slots
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
        }
        return;
    }
}

/// Registration that is undone when dropped.
///
/// [`TargetGuard::deregister`] waits for an in-flight delivery the way
/// [`BroadcastRegistry::deregister`] does. Dropping the guard instead
/// removes the target without waiting, which covers futures that are
/// cancelled before reaching their cleanup.
pub struct TargetGuard {
    registry: Arc<BroadcastRegistry>,
    id: Option<TargetId>,
}

impl TargetGuard {
    /// Register `target` and return a guard for it.
    pub fn register(registry: &Arc<BroadcastRegistry>, target: Arc<dyn NotificationTarget>) -> Self {
        let id = registry.register(target);
        Self {
            registry: registry.clone(),
            id: Some(id),
        }
    }

    pub fn id(&self) -> Option<TargetId> {
        self.id
    }

    /// Deregister now, waiting for an in-flight delivery.
    pub async fn deregister(mut self) {
        if let Some(id) = self.id.take() {
            self.registry.deregister(id).await;
        }
    }
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if let Some(removed) = self.registry.remove(id) {
                tracing::debug!("Dropped registration of target {} ({})", id, removed.name());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GatewayError, Result};
    use crate::hub::target::BoxFuture;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Records every line it is sent.
    #[derive(Default)]
    struct Recorder {
        lines: Mutex<Vec<String>>,
        delay: Option<Duration>,
        fail: bool,
        panic: bool,
    }

    impl Recorder {
        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Default::default()
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn panicking() -> Self {
            Self {
                panic: true,
                ..Default::default()
            }
        }

        fn lines(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }

        /// Wait until at least `count` lines arrived.
        async fn wait_for(&self, count: usize) {
            let deadline = Instant::now() + Duration::from_secs(2);
            while self.lines().len() < count {
                assert!(Instant::now() < deadline, "only {} lines", self.lines().len());
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }
    }

    impl NotificationTarget for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn notify<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                if self.fail {
                    return Err(GatewayError::ConnectionClosed);
                }
                if self.panic {
                    panic!("target blew up");
                }
                let line = String::from_utf8_lossy(notification.line()).into_owned();
                self.lines.lock().unwrap().push(line);
                Ok(())
            })
        }
    }

    fn packet() -> Packet {
        Packet::from(vec![0x83, 0x7C])
    }

    async fn wait_until_gone(registry: &BroadcastRegistry, id: TargetId) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while registry.contains(id) {
            assert!(Instant::now() < deadline, "target {} still registered", id);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_target() {
        let registry = BroadcastRegistry::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        registry.register(a.clone());
        registry.register(b.clone());

        let report = registry.broadcast(&packet());

        assert_eq!(report, BroadcastReport { queued: 2, failed: 0 });
        a.wait_for(1).await;
        b.wait_for(1).await;
        assert_eq!(a.lines(), vec!["RECEIVE 83 7c\n".to_string()]);
        assert_eq!(b.lines(), a.lines());
    }

    #[tokio::test]
    async fn test_broadcast_empty_registry() {
        let registry = BroadcastRegistry::new();
        let report = registry.broadcast(&packet());
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_per_target_order_kept() {
        let registry = BroadcastRegistry::new();
        let a = Arc::new(Recorder::slow(Duration::from_millis(5)));
        registry.register(a.clone());

        for op in [0x81u8, 0x82, 0x83, 0x85] {
            registry.broadcast(&Packet::from(vec![op, 0x00]));
        }

        a.wait_for(4).await;
        assert_eq!(
            a.lines(),
            vec![
                "RECEIVE 81 00\n".to_string(),
                "RECEIVE 82 00\n".to_string(),
                "RECEIVE 83 00\n".to_string(),
                "RECEIVE 85 00\n".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_deregistered_target_receives_nothing() {
        let registry = BroadcastRegistry::new();
        let a = Arc::new(Recorder::default());
        let id = registry.register(a.clone());

        assert!(registry.deregister(id).await);
        assert!(!registry.deregister(id).await);
        assert!(registry.is_empty());

        assert_eq!(registry.broadcast(&packet()).queued, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(a.lines().is_empty());
    }

    #[tokio::test]
    async fn test_failing_target_is_deregistered() {
        let registry = BroadcastRegistry::new();
        let good = Arc::new(Recorder::default());
        registry.register(good.clone());
        let bad_id = registry.register(Arc::new(Recorder::failing()));

        registry.broadcast(&packet());

        wait_until_gone(&registry, bad_id).await;
        assert_eq!(registry.len(), 1);
        good.wait_for(1).await;
    }

    #[tokio::test]
    async fn test_panicking_target_is_deregistered() {
        let registry = BroadcastRegistry::new();
        let good = Arc::new(Recorder::default());
        registry.register(good.clone());
        let bad_id = registry.register(Arc::new(Recorder::panicking()));

        registry.broadcast(&packet());

        wait_until_gone(&registry, bad_id).await;
        registry.broadcast(&packet());
        good.wait_for(2).await;
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_slow_target_does_not_delay_others() {
        let registry = BroadcastRegistry::new();
        let fast = Arc::new(Recorder::default());
        registry.register(fast.clone());
        registry.register(Arc::new(Recorder::slow(Duration::from_millis(500))));

        // Several packets in a row; none of them waits on the slow target
        let start = Instant::now();
        for _ in 0..3 {
            let report = registry.broadcast(&packet());
            assert_eq!(report.queued, 2);
        }
        assert!(start.elapsed() < Duration::from_millis(50));

        fast.wait_for(3).await;
        assert!(start.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_full_queue_drops_target() {
        let registry = BroadcastRegistry::with_queue_capacity(2);
        let stuck_id = registry.register(Arc::new(Recorder::slow(Duration::from_secs(5))));

        // No await between broadcasts, so nothing is drained meanwhile
        let reports: Vec<_> = (0..4).map(|_| registry.broadcast(&packet())).collect();

        assert_eq!(reports[0].queued, 1);
        assert_eq!(reports[1].queued, 1);
        assert_eq!(reports[2], BroadcastReport { queued: 0, failed: 1 });
        assert_eq!(reports[3], BroadcastReport::default());
        assert!(!registry.contains(stuck_id));
    }

    #[tokio::test]
    async fn test_deregister_waits_for_inflight_delivery() {
        let registry = BroadcastRegistry::new();
        let slow = Arc::new(Recorder::slow(Duration::from_millis(100)));
        let slow_id = registry.register(slow.clone());
        let other = Arc::new(Recorder::default());
        let other_id = registry.register(other.clone());

        // Second packet is still queued for the slow target when it leaves
        registry.broadcast(&packet());
        registry.broadcast(&packet());
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Other targets are not held up by the slow one
        let start = Instant::now();
        assert!(registry.deregister(other_id).await);
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(other.lines().len(), 2);

        // The slow one is mid-delivery, so this waits for it to finish
        assert!(registry.deregister(slow_id).await);
        assert_eq!(slow.lines().len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(slow.lines().len(), 1);
    }

    #[tokio::test]
    async fn test_guard_removes_on_drop() {
        let registry = Arc::new(BroadcastRegistry::new());
        let a = Arc::new(Recorder::default());

        let guard = TargetGuard::register(&registry, a.clone());
        let id = guard.id().unwrap();
        assert!(registry.contains(id));

        drop(guard);
        assert!(registry.is_empty());
        assert_eq!(registry.broadcast(&packet()).queued, 0);
    }

    #[tokio::test]
    async fn test_guard_deregister() {
        let registry = Arc::new(BroadcastRegistry::new());
        let guard = TargetGuard::register(&registry, Arc::new(Recorder::default()));

        guard.deregister().await;
        assert!(registry.is_empty());
    }
}
