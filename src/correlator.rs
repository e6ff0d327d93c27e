//! Request/response correlation over a single link.
//!
//! The [`Correlator`] hands out request ids, parks each waiter in a pending
//! table until the matching reply arrives or its deadline passes, and routes
//! every other incoming packet:
//!
//! 1. a reply whose id is pending completes that request and goes nowhere else
//! 2. a packet whose id has a registered stream goes to the stream
//! 3. anything else is dispatched by kind to the [`HandlerRegistry`]
//!
//! Value updates reuse the variable id as request id, which is how the host
//! registers one long-lived stream per variable. Only reply kinds may complete
//! a pending request, so an update whose variable id happens to equal an
//! in-flight request id is still routed as an update.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{Result, TelewireError};
use crate::handler::{HandlerRegistry, ReplyContext};
use crate::protocol::{Packet, Payload, NO_REQUEST_ID};
use crate::sync::lock;
use crate::writer::WriterHandle;

/// Callback receiving packets routed to a stream.
pub type StreamHandler = Arc<dyn Fn(Packet) + Send + Sync>;

struct PendingTable {
    next_id: u32,
    waiters: HashMap<u32, oneshot::Sender<Packet>>,
}

impl PendingTable {
    /// Allocate the next free id, skipping 0 and ids still in flight.
    fn open(&mut self) -> (u32, oneshot::Receiver<Packet>) {
        let id = loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id != NO_REQUEST_ID && !self.waiters.contains_key(&id) {
                break id;
            }
        };

        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        (id, rx)
    }
}

/// Request correlator for one link.
pub struct Correlator {
    pending: Mutex<PendingTable>,
    streams: Mutex<HashMap<u32, StreamHandler>>,
    handlers: HandlerRegistry,
    writer: WriterHandle,
    closed: AtomicBool,
}

/// Removes a pending entry when the request ends, whatever the outcome.
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.correlator.pending).waiters.remove(&self.id);
    }
}

impl Correlator {
    /// Create a correlator writing through `writer` and dispatching
    /// unsolicited packets to `handlers`.
    pub fn new(writer: WriterHandle, handlers: HandlerRegistry) -> Self {
        Self {
            pending: Mutex::new(PendingTable {
                next_id: 1,
                waiters: HashMap::new(),
            }),
            streams: Mutex::new(HashMap::new()),
            handlers,
            writer,
            closed: AtomicBool::new(false),
        }
    }

    /// Send a request and wait for its reply.
    ///
    /// Queueing the request and waiting for the answer share one deadline.
    /// Fails with `Timeout` when it passes, or `ConnectionClosed` when the link
    /// goes away first. The pending entry is gone in every case.
    pub async fn request_response(&self, payload: Payload, timeout: Duration) -> Result<Packet> {
        let (id, rx) = self.open()?;
        self.round_trip(id, rx, payload, timeout).await
    }

    /// Send a request whose id stays routed to `handler` after the reply.
    ///
    /// Returns the id and the first reply. Later packets carrying the same id
    /// reach `handler` until [`close_stream`](Self::close_stream) is called.
    pub async fn request_stream(
        &self,
        payload: Payload,
        timeout: Duration,
        handler: StreamHandler,
    ) -> Result<(u32, Packet)> {
        let (id, rx) = self.open()?;
        self.set_stream(id, handler);

        match self.round_trip(id, rx, payload, timeout).await {
            Ok(reply) => Ok((id, reply)),
            Err(e) => {
                self.close_stream(id);
                Err(e)
            }
        }
    }

    /// Register a waiter, unless the link is already closed.
    ///
    /// `closed` is checked under the pending lock, which [`close`](Self::close)
    /// also holds, so a waiter is either refused or failed by `close`.
    fn open(&self) -> Result<(u32, oneshot::Receiver<Packet>)> {
        let mut pending = lock(&self.pending);
        if self.is_closed() {
            return Err(TelewireError::ConnectionClosed);
        }
        Ok(pending.open())
    }

    async fn round_trip(
        &self,
        id: u32,
        rx: oneshot::Receiver<Packet>,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Packet> {
        let _guard = PendingGuard {
            correlator: self,
            id,
        };

        let exchange = async {
            self.writer.send_packet(&Packet::new(id, payload)).await?;
            rx.await.map_err(|_| TelewireError::ConnectionClosed)
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!("Request {} timed out after {:?}", id, timeout);
                Err(TelewireError::Timeout)
            }
        }
    }

    /// Send a fire-and-forget packet (request id 0).
    pub async fn send(&self, payload: Payload) -> Result<()> {
        self.writer.send_packet(&Packet::event(payload)).await
    }

    /// Answer a request issued by the peer.
    pub async fn write_back(&self, req_id: u32, payload: Payload) -> Result<()> {
        self.writer.send_packet(&Packet::new(req_id, payload)).await
    }

    /// Route every future packet with id `id` to `handler`.
    pub fn set_stream(&self, id: u32, handler: StreamHandler) {
        lock(&self.streams).insert(id, handler);
    }

    /// Stop routing packets with id `id`. Returns whether a route existed.
    pub fn close_stream(&self, id: u32) -> bool {
        lock(&self.streams).remove(&id).is_some()
    }

    /// Route an incoming packet.
    ///
    /// Kind handlers run to completion here, so packets are processed in
    /// arrival order.
    pub async fn receive(&self, packet: Packet) {
        if packet.is_reply() {
            let waiter = lock(&self.pending).waiters.remove(&packet.req_id);
            if let Some(tx) = waiter {
                if tx.send(packet).is_err() {
                    tracing::debug!("Reply arrived after its waiter gave up");
                }
                return;
            }
        }

        if packet.req_id != NO_REQUEST_ID {
            let stream = lock(&self.streams).get(&packet.req_id).cloned();
            if let Some(stream) = stream {
                stream(packet);
                return;
            }
        }

        let kind = packet.kind();
        if !self.handlers.contains(kind) {
            if packet.is_reply() {
                tracing::debug!("Dropping late {:?} for request {}", kind, packet.req_id);
            } else {
                tracing::debug!("No handler for {:?} (req {})", kind, packet.req_id);
            }
            return;
        }

        let ctx = ReplyContext::with_writer(packet.req_id, self.writer.clone());
        if let Err(e) = self.handlers.dispatch(packet, ctx).await {
            tracing::warn!("Handler for {:?} failed: {}", kind, e);
        }
    }

    /// Fail every outstanding request with `ConnectionClosed` and refuse new
    /// ones.
    pub fn close(&self) {
        let waiters = {
            let mut pending = lock(&self.pending);
            self.closed.store(true, Ordering::Release);
            std::mem::take(&mut pending.waiters)
        };
        if !waiters.is_empty() {
            tracing::debug!("Failing {} pending requests", waiters.len());
        }
        // Dropping the senders wakes every waiter.
        drop(waiters);
    }

    /// Check whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of requests awaiting a reply.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).waiters.len()
    }

    /// Writer used for outgoing packets.
    pub fn writer(&self) -> &WriterHandle {
        &self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;
    use crate::config::WriterConfig;
    use crate::protocol::{FrameDecoder, PacketKind};
    use crate::value::Value;
    use crate::writer::spawn_writer_task;
    use std::sync::atomic::AtomicU32;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn correlator(handlers: HandlerRegistry) -> (Arc<Correlator>, DuplexStream) {
        let (client, server) = duplex(4096);
        let (writer, _task) = spawn_writer_task(client, WriterConfig::default());
        (Arc::new(Correlator::new(writer, handlers)), server)
    }

    async fn read_packet(server: &mut DuplexStream, decoder: &mut FrameDecoder) -> Packet {
        let mut buf = [0u8; 256];
        loop {
            let n = server.read(&mut buf).await.unwrap();
            if let Some(payload) = decoder.push(&buf[..n]).into_iter().next() {
                return MsgPackCodec::decode_packet(&payload).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_reply_completes_request() {
        let (corr, mut server) = correlator(HandlerRegistry::new());
        let mut decoder = FrameDecoder::new();

        let c = corr.clone();
        let request =
            tokio::spawn(async move { c.request_response(Payload::Ping, Duration::from_secs(1)).await });

        let sent = read_packet(&mut server, &mut decoder).await;
        assert_eq!(sent.payload, Payload::Ping);
        assert_ne!(sent.req_id, NO_REQUEST_ID);

        corr.receive(Packet::new(sent.req_id, Payload::Pong(3))).await;

        let reply = request.await.unwrap().unwrap();
        assert_eq!(reply.payload, Payload::Pong(3));
        assert_eq!(corr.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_pending_entry() {
        let (corr, _server) = correlator(HandlerRegistry::new());

        let result = corr
            .request_response(Payload::FetchNode(1), Duration::from_millis(100))
            .await;

        assert!(matches!(result, Err(TelewireError::Timeout)));
        assert_eq!(corr.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_ids_skip_zero_on_wrap() {
        let (corr, _server) = correlator(HandlerRegistry::new());

        let mut table = lock(&corr.pending);
        table.next_id = u32::MAX;
        let (first, _rx1) = table.open();
        let (second, _rx2) = table.open();

        assert_eq!(first, u32::MAX);
        assert_eq!(second, 1);
    }

    #[tokio::test]
    async fn test_ids_skip_pending() {
        let (corr, _server) = correlator(HandlerRegistry::new());

        let mut table = lock(&corr.pending);
        let (first, _rx1) = table.open();
        table.next_id = first;
        let (second, _rx2) = table.open();

        assert_ne!(first, second);
        assert_eq!(table.waiters.len(), 2);
    }

    #[tokio::test]
    async fn test_update_is_not_taken_as_reply() {
        let (corr, mut server) = correlator(HandlerRegistry::new());
        let mut decoder = FrameDecoder::new();

        let seen = Arc::new(AtomicU32::new(0));
        let c = corr.clone();
        let request = tokio::spawn(async move {
            c.request_response(Payload::FetchNode(0), Duration::from_secs(1))
                .await
        });
        let sent = read_packet(&mut server, &mut decoder).await;

        let s = seen.clone();
        corr.set_stream(
            sent.req_id,
            Arc::new(move |_packet| {
                s.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // Same id, but an update: goes to the stream, the request keeps waiting.
        corr.receive(Packet::update(sent.req_id, Value::U8(1))).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(corr.pending_count(), 1);

        corr.receive(Packet::new(sent.req_id, Payload::Node(Default::default())))
            .await;
        assert!(request.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_request_stream_routes_followups() {
        let (corr, mut server) = correlator(HandlerRegistry::new());
        let mut decoder = FrameDecoder::new();

        let seen = Arc::new(AtomicU32::new(0));
        let s = seen.clone();
        let c = corr.clone();
        let request = tokio::spawn(async move {
            c.request_stream(
                Payload::Call {
                    action_id: 1,
                    argument: Value::None,
                },
                Duration::from_secs(1),
                Arc::new(move |_packet| {
                    s.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
        });

        let sent = read_packet(&mut server, &mut decoder).await;
        corr.receive(Packet::new(sent.req_id, Payload::CallCompleted(Value::None)))
            .await;
        let (id, reply) = request.await.unwrap().unwrap();
        assert_eq!(id, sent.req_id);
        assert_eq!(reply.kind(), PacketKind::CallCompleted);
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        // The reply path is consumed; a second answer reaches the stream.
        corr.receive(Packet::new(id, Payload::CallCompleted(Value::U8(2))))
            .await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        assert!(corr.close_stream(id));
        corr.receive(Packet::new(id, Payload::CallCompleted(Value::U8(3))))
            .await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsolicited_packets_reach_handlers() {
        let mut handlers = HandlerRegistry::new();
        handlers.register(PacketKind::Ping, |_packet, ctx| async move {
            ctx.reply(Payload::Pong(7)).await
        });
        let (corr, mut server) = correlator(handlers);
        let mut decoder = FrameDecoder::new();

        corr.receive(Packet::new(55, Payload::Ping)).await;

        let reply = read_packet(&mut server, &mut decoder).await;
        assert_eq!(reply, Packet::new(55, Payload::Pong(7)));
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let (corr, _server) = correlator(HandlerRegistry::new());

        let c = corr.clone();
        let request = tokio::spawn(async move {
            c.request_response(Payload::Ping, Duration::from_secs(10))
                .await
        });
        while corr.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        corr.close();

        let result = request.await.unwrap();
        assert!(matches!(result, Err(TelewireError::ConnectionClosed)));

        let result = corr
            .request_response(Payload::Ping, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(TelewireError::ConnectionClosed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_racing_new_requests_fails_them_all() {
        let (corr, _server) = correlator(HandlerRegistry::new());

        let requests: Vec<_> = (0..32)
            .map(|_| {
                let c = corr.clone();
                tokio::spawn(async move {
                    c.request_response(Payload::Ping, Duration::from_secs(30))
                        .await
                })
            })
            .collect();
        corr.close();

        let all = async {
            for request in requests {
                let result = request.await.unwrap();
                assert!(matches!(result, Err(TelewireError::ConnectionClosed)));
            }
        };
        tokio::time::timeout(Duration::from_secs(5), all)
            .await
            .expect("every request ends with the link");
        assert_eq!(corr.pending_count(), 0);
    }
}
