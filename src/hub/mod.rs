//! Hub module - fan-out of bus packets to interested parties.
//!
//! Provides:
//! - [`BroadcastRegistry`] - concurrent set of targets, each with its own ordered delivery queue
//! - [`TargetGuard`] - registration that is undone on drop
//! - [`NotificationTarget`] - what a target must implement
//! - [`ClientTarget`] / [`EchoObserver`] - the two kinds of target
//!
//! # Example
//!
//! ```ignore
//! use loconet_gateway::hub::{BroadcastRegistry, EchoObserver};
//!
//! let registry = BroadcastRegistry::new();
//!
//! // Wait for a packet to come back from the bus
//! let (observer, echoed) = EchoObserver::new(packet.clone());
//! let id = registry.register(Arc::new(observer));
//! // ... transmit ...
//! echoed.await?;
//! registry.deregister(id).await;
//! ```

mod registry;
mod target;

pub use registry::{
    BroadcastRegistry, BroadcastReport, RemovedTarget, TargetGuard, TargetId,
    DEFAULT_TARGET_QUEUE_CAPACITY,
};
pub use target::{BoxFuture, ClientTarget, EchoObserver, Notification, NotificationTarget};
