//! Handler registry for dispatching packets by kind.
//!
//! Packets that neither answer a pending request nor belong to a registered
//! stream land here. Each [`PacketKind`] has at most one handler.
//!
//! # Example
//!
//! ```
//! use telewire::handler::HandlerRegistry;
//! use telewire::protocol::{PacketKind, Payload};
//!
//! let mut registry = HandlerRegistry::new();
//!
//! registry.register(PacketKind::Ping, |_packet, ctx| async move {
//!     ctx.reply(Payload::Pong(0)).await
//! });
//!
//! assert!(registry.contains(PacketKind::Ping));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use super::ReplyContext;
use crate::error::{Result, TelewireError};
use crate::protocol::{Packet, PacketKind};

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for packet handlers.
pub trait Handler: Send + Sync + 'static {
    /// Handle a packet.
    fn call(&self, packet: Packet, ctx: ReplyContext) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper turning an async closure into a [`Handler`].
pub struct FnHandler<F, Fut>
where
    F: Fn(Packet, ReplyContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(Packet, ReplyContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    /// Create a new handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Handler for FnHandler<F, Fut>
where
    F: Fn(Packet, ReplyContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, packet: Packet, ctx: ReplyContext) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.handler)(packet, ctx))
    }
}

/// Registry mapping packet kinds to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<PacketKind, Box<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `kind`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, kind: PacketKind, handler: F)
    where
        F: Fn(Packet, ReplyContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if self
            .handlers
            .insert(kind, Box::new(FnHandler::new(handler)))
            .is_some()
        {
            tracing::debug!("Replaced handler for {:?}", kind);
        }
    }

    /// Get the handler for `kind`.
    pub fn get(&self, kind: PacketKind) -> Option<&dyn Handler> {
        self.handlers.get(&kind).map(|h| h.as_ref())
    }

    /// Check if a handler is registered for `kind`.
    pub fn contains(&self, kind: PacketKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Dispatch a packet to the handler for its kind.
    pub async fn dispatch(&self, packet: Packet, ctx: ReplyContext) -> Result<()> {
        let kind = packet.kind();
        let handler = self.get(kind).ok_or(TelewireError::HandlerNotFound(kind))?;

        handler.call(packet, ctx).await
    }
}
