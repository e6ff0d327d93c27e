//! Host side of a link: subscribe to variables of a remote device.
//!
//! A [`RemoteDevice`] runs a [`Session`] over one byte channel and keeps one
//! [`Adapter`] per remote variable. Local subscribers of the same variable
//! share a single upstream subscription; `update` packets for that variable
//! are routed to its adapter by variable id.
//!
//! A background task pings the device every `ping_interval`. When nothing
//! has been received for `liveness_timeout`, or the channel closes, every
//! adapter is reset: all subscribers see their cancel callback and must
//! subscribe again once the link is back.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use telewire::remote::RemoteDevice;
//! use telewire::subscription::Intervals;
//!
//! # async fn run(stream: tokio::net::TcpStream) -> telewire::Result<()> {
//! let (reader, writer) = stream.into_split();
//! let device = RemoteDevice::builder()
//!     .request_timeout(Duration::from_millis(500))
//!     .connect(reader, writer);
//!
//! let _temperature = device
//!     .subscribe(7, Intervals::from_millis(100, 1000), |value| {
//!         println!("temperature: {:?}", value);
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::LinkConfig;
use crate::correlator::Correlator;
use crate::error::{Result, TelewireError};
use crate::handler::{BoxFuture, HandlerRegistry};
use crate::listeners::{ListenerId, Listeners};
use crate::protocol::{DecoderStats, Packet, PacketKind, Payload};
use crate::session::Session;
use crate::subscription::{Adapter, CancelCallback, DataCallback, Intervals, Subscription, Upstream};
use crate::sync::lock;
use crate::value::Value;

/// Builder for a [`RemoteDevice`].
pub struct RemoteDeviceBuilder {
    config: LinkConfig,
}

impl RemoteDeviceBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            config: LinkConfig::default(),
        }
    }

    /// Replace the whole link configuration.
    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the timeout used when the caller does not pass one.
    ///
    /// Default: 1 second
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.request_timeout(timeout);
        self
    }

    /// Set how long the link may stay silent before subscriptions are reset.
    ///
    /// Default: 1 second
    pub fn liveness_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.liveness_timeout(timeout);
        self
    }

    /// Set the keep-alive ping interval.
    ///
    /// Default: 250 ms
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config = self.config.ping_interval(interval);
        self
    }

    /// Start the link over `reader`/`writer`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect<R, W>(self, reader: R, writer: W) -> RemoteDevice
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        RemoteDevice::start(reader, writer, self.config)
    }
}

impl Default for RemoteDeviceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct HostShared {
    adapters: Mutex<HashMap<u32, Adapter>>,
    connected: AtomicBool,
    link: Listeners<bool>,
}

impl HostShared {
    fn reset_all(&self) {
        let adapters: Vec<Adapter> = lock(&self.adapters).values().cloned().collect();
        for adapter in adapters {
            adapter.reset();
        }
    }

    fn set_connected(&self, up: bool) {
        if self.connected.swap(up, Ordering::AcqRel) == up {
            return;
        }
        if up {
            tracing::info!("Link up");
        } else {
            tracing::info!("Link down, resetting subscriptions");
            self.reset_all();
        }
        self.link.emit(&up);
    }
}

/// [`Upstream`] speaking the wire protocol through a correlator.
struct WireUpstream {
    correlator: Weak<Correlator>,
}

impl WireUpstream {
    async fn request(&self, payload: Payload, timeout: Duration) -> Result<()> {
        let correlator = self
            .correlator
            .upgrade()
            .ok_or(TelewireError::ConnectionClosed)?;
        let reply = correlator.request_response(payload, timeout).await?;

        match reply.payload {
            Payload::Success(true) => Ok(()),
            Payload::Success(false) => Err(TelewireError::Rejected),
            other => Err(TelewireError::UnexpectedReply(other.kind())),
        }
    }
}

impl Upstream for WireUpstream {
    fn change_subscription(
        &self,
        var_id: u32,
        intervals: Intervals,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<()>> {
        let (debounce_ms, refresh_ms) = intervals.to_wire();
        let payload = Payload::ChangeSub {
            var_id,
            debounce_ms,
            refresh_ms,
            timeout_ms: millis(timeout),
        };
        Box::pin(self.request(payload, timeout))
    }

    fn cancel_subscription(&self, var_id: u32, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        let payload = Payload::CancelSub {
            var_id,
            timeout_ms: millis(timeout),
        };
        Box::pin(self.request(payload, timeout))
    }
}

fn millis(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}

/// A remote device reached over one link.
pub struct RemoteDevice {
    session: Arc<Session>,
    shared: Arc<HostShared>,
    upstream: Arc<WireUpstream>,
    config: LinkConfig,
    liveness: JoinHandle<()>,
}

impl RemoteDevice {
    /// Create a new builder.
    pub fn builder() -> RemoteDeviceBuilder {
        RemoteDeviceBuilder::new()
    }

    fn start<R, W>(reader: R, writer: W, config: LinkConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(HostShared {
            adapters: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            link: Listeners::new(),
        });

        let handlers = host_handlers(&shared);
        let session = Arc::new(Session::start(reader, writer, &config, handlers));
        let upstream = Arc::new(WireUpstream {
            correlator: Arc::downgrade(session.correlator()),
        });
        let liveness = tokio::spawn(liveness_loop(session.clone(), shared.clone(), config.clone()));

        Self {
            session,
            shared,
            upstream,
            config,
            liveness,
        }
    }

    /// Subscribe to `var_id` with the default timeout.
    pub async fn subscribe<F>(&self, var_id: u32, intervals: Intervals, on_data: F) -> Result<Subscription>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe_with(
            var_id,
            intervals,
            self.config.request_timeout,
            Arc::new(on_data),
            None,
        )
        .await
    }

    /// Subscribe to `var_id`, with an explicit timeout and cancel callback.
    ///
    /// `timeout` bounds the wait for the adapter's floor and the upstream
    /// round trip separately.
    pub async fn subscribe_with(
        &self,
        var_id: u32,
        intervals: Intervals,
        timeout: Duration,
        on_data: DataCallback,
        on_cancel: Option<CancelCallback>,
    ) -> Result<Subscription> {
        self.adapter_for(var_id)
            .subscribe(intervals, timeout, on_data, on_cancel)
            .await
    }

    fn adapter_for(&self, var_id: u32) -> Adapter {
        let mut adapters = lock(&self.shared.adapters);
        if let Some(adapter) = adapters.get(&var_id) {
            return adapter.clone();
        }

        let adapter = Adapter::new(var_id, self.upstream.clone(), self.config.request_timeout);
        let target = adapter.clone();
        self.session.correlator().set_stream(
            var_id,
            Arc::new(move |packet: Packet| match packet.payload {
                Payload::Update { value, .. } => target.update(value),
                other => {
                    tracing::debug!("Var {}: ignoring {:?} on update route", var_id, other.kind())
                }
            }),
        );
        adapters.insert(var_id, adapter.clone());
        adapter
    }

    /// Get the adapter of `var_id`, if anything ever subscribed to it.
    pub fn adapter(&self, var_id: u32) -> Option<Adapter> {
        lock(&self.shared.adapters).get(&var_id).cloned()
    }

    /// Ping the device. Returns its number of active subscriptions.
    pub async fn ping(&self, timeout: Duration) -> Result<u32> {
        let reply = self
            .session
            .correlator()
            .request_response(Payload::Ping, timeout)
            .await?;
        match reply.payload {
            Payload::Pong(active) => Ok(active),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch the descriptor of node `node_id`.
    pub async fn fetch_node(&self, node_id: u32, timeout: Duration) -> Result<Bytes> {
        let reply = self
            .session
            .correlator()
            .request_response(Payload::FetchNode(node_id), timeout)
            .await?;
        match reply.payload {
            Payload::Node(descriptor) => Ok(descriptor),
            other => Err(unexpected(other)),
        }
    }

    /// Invoke action `action_id` and return its result.
    pub async fn call(&self, action_id: u32, argument: Value, timeout: Duration) -> Result<Value> {
        let reply = self
            .session
            .correlator()
            .request_response(Payload::Call { action_id, argument }, timeout)
            .await?;
        match reply.payload {
            Payload::CallCompleted(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Check whether the device was heard from recently.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Register a callback for link up (`true`) and down (`false`).
    pub fn on_link_change<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.shared.link.add(callback)
    }

    /// Unregister a link callback.
    pub fn remove_link_listener(&self, id: ListenerId) -> bool {
        self.shared.link.remove(id)
    }

    /// Frame decoder counters of the link.
    pub fn stats(&self) -> DecoderStats {
        self.session.stats()
    }

    /// Wait until the channel closes.
    pub async fn closed(&self) {
        self.session.closed().await
    }
}

impl Drop for RemoteDevice {
    fn drop(&mut self) {
        self.liveness.abort();
    }
}

fn unexpected(payload: Payload) -> TelewireError {
    match payload {
        Payload::Success(false) => TelewireError::Rejected,
        other => TelewireError::UnexpectedReply(other.kind()),
    }
}

fn host_handlers(shared: &Arc<HostShared>) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();

    let weak = Arc::downgrade(shared);
    handlers.register(PacketKind::Cancelled, move |packet, _ctx| {
        let weak = weak.clone();
        async move {
            let Payload::Cancelled(var_id) = packet.payload else {
                return Ok(());
            };
            let Some(shared) = weak.upgrade() else {
                return Ok(());
            };
            let adapter = lock(&shared.adapters).get(&var_id).cloned();
            if let Some(adapter) = adapter {
                tracing::debug!("Var {}: cancelled by device", var_id);
                adapter.reset();
            }
            Ok(())
        }
    });

    // Updates for variable 0 carry request id 0 and never match a stream
    // route, so they arrive here keyed by the payload's variable id.
    let weak = Arc::downgrade(shared);
    handlers.register(PacketKind::Update, move |packet, _ctx| {
        let weak = weak.clone();
        async move {
            let Payload::Update { var_id, value } = packet.payload else {
                return Ok(());
            };
            let Some(shared) = weak.upgrade() else {
                return Ok(());
            };
            let adapter = lock(&shared.adapters).get(&var_id).cloned();
            match adapter {
                Some(adapter) => adapter.update(value),
                None => tracing::debug!("Var {}: update without subscribers", var_id),
            }
            Ok(())
        }
    });

    // Answers to keep-alive pings only matter as traffic.
    handlers.register(PacketKind::Pong, |packet, _ctx| async move {
        tracing::trace!("Keep-alive answered: {:?}", packet.payload);
        Ok(())
    });

    handlers
}

async fn liveness_loop(session: Arc<Session>, shared: Arc<HostShared>, config: LinkConfig) {
    let mut ticker = tokio::time::interval(config.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = session.closed() => break,
        }

        if let Err(e) = session.correlator().send(Payload::Ping).await {
            tracing::debug!("Keep-alive ping not sent: {}", e);
        }

        let silent = session.activity().idle_for() >= config.liveness_timeout;
        shared.set_connected(!silent);
    }

    shared.set_connected(false);
    shared.reset_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;
    use crate::protocol::{encode_frame, FrameDecoder};
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Answers every request of the host with `answer(request)`.
    fn scripted_device<F>(remote: DuplexStream, answer: F) -> Arc<Mutex<Vec<Packet>>>
    where
        F: Fn(&Packet) -> Option<Packet> + Send + 'static,
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let (mut reader, mut writer) = tokio::io::split(remote);
        tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 512];
            loop {
                let n = match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                for payload in decoder.push(&buf[..n]) {
                    let request = MsgPackCodec::decode_packet(&payload).unwrap();
                    let reply = answer(&request);
                    log.lock().unwrap().push(request);
                    if let Some(reply) = reply {
                        let bytes = MsgPackCodec::encode_packet(&reply).unwrap();
                        writer.write_all(&encode_frame(&bytes)).await.unwrap();
                    }
                }
            }
        });
        seen
    }

    fn device(local: DuplexStream) -> RemoteDevice {
        let (reader, writer) = tokio::io::split(local);
        RemoteDevice::builder().connect(reader, writer)
    }

    fn accept_all(request: &Packet) -> Option<Packet> {
        match request.payload {
            Payload::ChangeSub { .. } | Payload::CancelSub { .. } => {
                Some(Packet::new(request.req_id, Payload::Success(true)))
            }
            Payload::Ping if request.req_id != 0 => Some(Packet::new(request.req_id, Payload::Pong(1))),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_subscribe_sends_change_sub() {
        let (local, remote) = duplex(4096);
        let seen = scripted_device(remote, accept_all);
        let device = device(local);

        let _sub = device
            .subscribe(7, Intervals::from_millis(100, 0), |_| {})
            .await
            .unwrap();

        let change = seen
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.kind() == PacketKind::ChangeSub)
            .cloned()
            .unwrap();
        assert_eq!(
            change.payload,
            Payload::ChangeSub {
                var_id: 7,
                debounce_ms: 100,
                refresh_ms: 0,
                timeout_ms: 1000,
            }
        );
        assert!(device.adapter(7).unwrap().is_subscribed());
    }

    #[tokio::test]
    async fn test_rejected_subscribe() {
        let (local, remote) = duplex(4096);
        scripted_device(remote, |request| match request.payload {
            Payload::ChangeSub { .. } => Some(Packet::new(request.req_id, Payload::Success(false))),
            _ => None,
        });
        let device = device(local);

        let result = device.subscribe(3, Intervals::default(), |_| {}).await;

        assert!(matches!(result, Err(TelewireError::Rejected)));
        assert!(!device.adapter(3).unwrap().is_subscribed());
    }

    #[tokio::test]
    async fn test_ping_returns_active_count() {
        let (local, remote) = duplex(4096);
        scripted_device(remote, accept_all);
        let device = device(local);

        assert_eq!(device.ping(Duration::from_secs(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_wrong_reply_kind() {
        let (local, remote) = duplex(4096);
        scripted_device(remote, |request| Some(Packet::new(request.req_id, Payload::Pong(0))));
        let device = device(local);

        let result = device.fetch_node(0, Duration::from_secs(1)).await;
        assert!(matches!(
            result,
            Err(TelewireError::UnexpectedReply(PacketKind::Pong))
        ));
    }

    #[tokio::test]
    async fn test_device_cancel_resets_adapter() {
        let (local, remote) = duplex(4096);
        // Cancels variable 9 just before answering the next fetch.
        scripted_device(remote, |request| match request.payload {
            Payload::ChangeSub { .. } => Some(Packet::new(request.req_id, Payload::Success(true))),
            Payload::FetchNode(_) => Some(Packet::event(Payload::Cancelled(9))),
            _ => None,
        });
        let device = device(local);

        let cancelled = Arc::new(AtomicUsize::new(0));
        let c = cancelled.clone();
        let sub = device
            .subscribe_with(
                9,
                Intervals::default(),
                Duration::from_secs(1),
                Arc::new(|_| {}),
                Some(Arc::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .await
            .unwrap();

        // Never answered, but the cancel is handled before it times out.
        let _ = device.fetch_node(0, Duration::from_millis(200)).await;

        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert!(!sub.is_active());
        assert!(!device.adapter(9).unwrap().is_subscribed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_resets_subscriptions() {
        let (local, remote) = duplex(4096);
        // Accepts the subscription, never answers pings.
        scripted_device(remote, |request| match request.payload {
            Payload::ChangeSub { .. } => Some(Packet::new(request.req_id, Payload::Success(true))),
            _ => None,
        });
        let device = device(local);

        let link = Arc::new(Mutex::new(Vec::new()));
        let l = link.clone();
        device.on_link_change(move |up| l.lock().unwrap().push(*up));

        let cancelled = Arc::new(AtomicUsize::new(0));
        let c = cancelled.clone();
        let sub = device
            .subscribe_with(
                1,
                Intervals::default(),
                Duration::from_secs(1),
                Arc::new(|_| {}),
                Some(Arc::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .await
            .unwrap();
        assert!(device.is_connected());

        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(!device.is_connected());
        assert_eq!(*link.lock().unwrap(), vec![false]);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert!(!sub.is_active());
        assert!(!device.adapter(1).unwrap().is_subscribed());
    }
}
