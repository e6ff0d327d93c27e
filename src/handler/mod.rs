//! Handler module - dispatch of unsolicited packets.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps packet kinds to handlers
//! - [`ReplyContext`] - lets handlers answer the request they received
//!
//! # Example
//!
//! ```
//! use telewire::handler::HandlerRegistry;
//! use telewire::protocol::{PacketKind, Payload};
//!
//! let mut registry = HandlerRegistry::new();
//!
//! // Answer pings with the number of active subscriptions
//! registry.register(PacketKind::Ping, |_packet, ctx| async move {
//!     ctx.reply(Payload::Pong(0)).await
//! });
//! ```

mod context;
mod registry;

pub use context::ReplyContext;
pub use registry::{BoxFuture, FnHandler, Handler, HandlerRegistry, HandlerResult};
