//! Reply context for packet handlers.
//!
//! A handler receives the incoming [`Packet`](crate::protocol::Packet) and a
//! [`ReplyContext`] that remembers the request id, so answers land on the
//! request that asked for them:
//! - `reply` - send an arbitrary payload
//! - `success` - send `success(bool)`
//! - `send` - send an unrelated fire-and-forget packet
//!
//! # Example
//!
//! ```
//! use telewire::handler::{HandlerResult, ReplyContext};
//! use telewire::protocol::{Packet, Payload};
//!
//! async fn pong(_packet: Packet, ctx: ReplyContext) -> HandlerResult {
//!     ctx.reply(Payload::Pong(0)).await
//! }
//! ```

use crate::error::Result;
use crate::protocol::{Packet, Payload};
use crate::writer::WriterHandle;

/// Context passed to packet handlers.
///
/// `ReplyContext` is `Clone` and can be moved into spawned tasks.
#[derive(Clone)]
pub struct ReplyContext {
    /// Request id of the packet being handled (0 = event).
    req_id: u32,
    /// Writer handle for sending replies.
    writer: Option<WriterHandle>,
}

impl ReplyContext {
    /// Create a context without a writer (replies are dropped).
    pub fn new(req_id: u32) -> Self {
        Self {
            req_id,
            writer: None,
        }
    }

    /// Create a context with a writer.
    pub fn with_writer(req_id: u32, writer: WriterHandle) -> Self {
        Self {
            req_id,
            writer: Some(writer),
        }
    }

    /// Get the request id.
    #[inline]
    pub fn req_id(&self) -> u32 {
        self.req_id
    }

    /// Writer of the link the packet arrived on, if any.
    pub fn writer(&self) -> Option<&WriterHandle> {
        self.writer.as_ref()
    }

    /// Answer the request with `payload`.
    pub async fn reply(&self, payload: Payload) -> Result<()> {
        self.send(Packet::new(self.req_id, payload)).await
    }

    /// Answer the request with `success(ok)`.
    pub async fn success(&self, ok: bool) -> Result<()> {
        self.reply(Payload::Success(ok)).await
    }

    /// Send any packet on the same link.
    pub async fn send(&self, packet: Packet) -> Result<()> {
        match &self.writer {
            Some(writer) => writer.send_packet(&packet).await,
            // No writer configured (testing mode)
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;
    use crate::config::WriterConfig;
    use crate::protocol::FrameDecoder;
    use crate::writer::spawn_writer_task;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_reply_without_writer() {
        let ctx = ReplyContext::new(42);
        assert_eq!(ctx.req_id(), 42);
        assert!(ctx.reply(Payload::Pong(1)).await.is_ok());
        assert!(ctx.success(true).await.is_ok());
    }

    #[tokio::test]
    async fn test_reply_keeps_request_id() {
        let (client, mut server) = duplex(4096);
        let (writer, _task) = spawn_writer_task(client, WriterConfig::default());

        let ctx = ReplyContext::with_writer(42, writer);
        ctx.success(false).await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        let payloads = FrameDecoder::new().push(&buf[..n]);
        let packet = MsgPackCodec::decode_packet(&payloads[0]).unwrap();

        assert_eq!(packet, Packet::new(42, Payload::Success(false)));
    }
}
