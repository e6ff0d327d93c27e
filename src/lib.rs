//! # telewire
//!
//! Framed telemetry/control link between a host and a device sharing one
//! serial-style byte stream.
//!
//! The host subscribes to device variables with a debounce (minimum spacing)
//! and a refresh (maximum silence). Many local subscribers of one variable
//! share a single upstream subscription that always satisfies the tightest of
//! them, and each still receives values at its own pace.
//!
//! ## Architecture
//!
//! - **Frames** ([`protocol`]): `0x53 0x53`, escaped payload, escaped
//!   little-endian CRC-32C, `0x45`
//! - **Packets** ([`protocol`], [`codec`]): request id plus a tagged payload,
//!   serialized as MessagePack
//! - **Session** ([`session`]): read loop and single-flight writer over the
//!   channel, routing through the [`correlator`]
//! - **Subscriptions** ([`subscription`]): per-variable [`Adapter`] that
//!   serializes upstream changes through a [`Floor`], and a [`Publisher`]
//!   pacing every subscriber
//! - **Ends of the link**: [`RemoteDevice`] (host) and [`DeviceEndpoint`]
//!   (device)
//!
//! ## Example
//!
//! ```
//! use telewire::{DeviceEndpoint, Intervals, RemoteDevice, Value};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> telewire::Result<()> {
//! let (host_side, device_side) = tokio::io::duplex(4096);
//!
//! let (reader, writer) = tokio::io::split(device_side);
//! let device = DeviceEndpoint::builder().variable(7).start(reader, writer);
//! device.publish(7, Value::F32(21.5));
//!
//! let (reader, writer) = tokio::io::split(host_side);
//! let remote = RemoteDevice::builder().connect(reader, writer);
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let _sub = remote
//!     .subscribe(7, Intervals::from_millis(100, 0), move |value| {
//!         let _ = tx.send(*value);
//!     })
//!     .await?;
//!
//! assert_eq!(rx.recv().await, Some(Value::F32(21.5)));
//! # Ok(())
//! # }
//! ```

pub mod backpressure;
pub mod codec;
pub mod config;
pub mod correlator;
pub mod endpoint;
pub mod error;
pub mod floor;
pub mod handler;
pub mod listeners;
pub mod protocol;
pub mod remote;
pub mod session;
pub mod subscription;
pub mod value;
pub mod writer;

mod sync;

pub use config::{LinkConfig, WriterConfig};
pub use endpoint::DeviceEndpoint;
pub use error::{Result, TelewireError};
pub use floor::Floor;
pub use remote::RemoteDevice;
pub use subscription::{Adapter, Intervals, Publisher, Subscription};
pub use value::Value;
