//! Subscription module - coalescing and pacing of value streams.
//!
//! - [`Intervals`] - a subscriber's debounce/refresh requirement
//! - [`Cadence`] - per-subscriber timing state machine
//! - [`Publisher`] - fans one value out to many subscribers, each at its own pace
//! - [`Adapter`] - shares one upstream subscription between many local
//!   subscribers, one wire operation at a time

mod adapter;
mod cadence;
mod intervals;
mod publisher;

pub use adapter::{Adapter, Subscription, Upstream};
pub use cadence::Cadence;
pub use intervals::{CancelCallback, DataCallback, Intervals};
pub use publisher::{Publisher, SubscriberId};
