//! # loconet-gateway
//!
//! TCP gateway to a LocoNet model-railroad bus.
//!
//! Clients connect over TCP and speak a line-oriented text protocol. Every
//! packet seen on the bus is pushed to every client as a `RECEIVE` line,
//! and a client can transmit with `SEND`, which is answered once the bus
//! echoes the packet back (or the echo timeout passes).
//!
//! ## Architecture
//!
//! - **Interface** (OS thread): pumps raw bytes between the hardware and a
//!   pair of byte queues
//! - **Framer** (task): cuts the received byte stream into packets and
//!   broadcasts them
//! - **Sessions** (task per client): greeting, command handling, and a
//!   writer task per connection
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use loconet_gateway::{Gateway, LocoBufferUsb};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let interface = LocoBufferUsb::open("/dev/ttyUSB0", 57_600)?;
//!     let gateway = Gateway::builder().start(Arc::new(interface)).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod hub;
pub mod interface;
pub mod pipeline;
pub mod protocol;
pub mod session;

mod server;
mod writer;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use hub::BroadcastRegistry;
pub use interface::{Interface, LocoBufferUsb, LoopbackInterface};
pub use pipeline::SendPipeline;
pub use protocol::{Packet, PacketFramer};
pub use server::{Gateway, GatewayBuilder, PUMP_THREAD_NAME};
pub use writer::{LineWriter, WriterConfig};
