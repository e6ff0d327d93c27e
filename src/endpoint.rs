//! Device side of a link: serve variables, node descriptors and actions.
//!
//! A [`DeviceEndpoint`] answers the requests a [`RemoteDevice`] sends:
//!
//! | Request | Answer |
//! |---|---|
//! | `ping` | `pong(active subscriptions)` |
//! | `fetch_node(id)` | `node(descriptor)`, falling back to node 0 |
//! | `change_sub` | `success`, then `update` packets at the requested cadence |
//! | `cancel_sub` | `cancelled(var)`, then `success(true)` |
//! | `call` | `call_completed(result)` |
//!
//! Unknown variables, nodes and actions are answered with `success(false)`.
//! Every served variable owns a [`Publisher`]; the host's debounce and
//! refresh are applied by it before anything goes on the wire.
//!
//! [`RemoteDevice`]: crate::remote::RemoteDevice

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::LinkConfig;
use crate::handler::HandlerRegistry;
use crate::protocol::{DecoderStats, Packet, PacketKind, Payload};
use crate::session::Session;
use crate::subscription::{Intervals, Publisher, SubscriberId};
use crate::sync::lock;
use crate::value::Value;
use crate::writer::WriterHandle;

/// Action invoked by a `call` request.
pub type Action = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Builder for a [`DeviceEndpoint`].
pub struct DeviceEndpointBuilder {
    config: LinkConfig,
    variables: BTreeSet<u32>,
    nodes: HashMap<u32, Bytes>,
    actions: HashMap<u32, Action>,
}

impl DeviceEndpointBuilder {
    /// Create a builder serving nothing.
    pub fn new() -> Self {
        Self {
            config: LinkConfig::default(),
            variables: BTreeSet::new(),
            nodes: HashMap::new(),
            actions: HashMap::new(),
        }
    }

    /// Replace the whole link configuration.
    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Set how long the link may stay silent before subscriptions are dropped.
    ///
    /// Default: 1 second
    pub fn liveness_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.liveness_timeout(timeout);
        self
    }

    /// Set how often silence is checked for.
    ///
    /// Default: 250 ms
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config = self.config.ping_interval(interval);
        self
    }

    /// Serve variable `var_id`.
    pub fn variable(mut self, var_id: u32) -> Self {
        self.variables.insert(var_id);
        self
    }

    /// Serve a node descriptor. Node 0 is the root.
    pub fn node(mut self, node_id: u32, descriptor: impl Into<Bytes>) -> Self {
        self.nodes.insert(node_id, descriptor.into());
        self
    }

    /// Serve an action.
    pub fn action<F>(mut self, action_id: u32, action: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.actions.insert(action_id, Arc::new(action));
        self
    }

    /// Start serving over `reader`/`writer`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<R, W>(self, reader: R, writer: W) -> DeviceEndpoint
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(DeviceShared {
            variables: self
                .variables
                .into_iter()
                .map(|var_id| (var_id, Publisher::new()))
                .collect(),
            subscriptions: Mutex::new(HashMap::new()),
            nodes: self.nodes,
            actions: self.actions,
        });

        let handlers = device_handlers(&shared);
        let session = Arc::new(Session::start(reader, writer, &self.config, handlers));
        let liveness = tokio::spawn(liveness_loop(session.clone(), shared.clone(), self.config));

        DeviceEndpoint {
            session,
            shared,
            liveness,
        }
    }
}

impl Default for DeviceEndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct DeviceShared {
    variables: HashMap<u32, Publisher>,
    /// Host subscription of each variable.
    subscriptions: Mutex<HashMap<u32, SubscriberId>>,
    nodes: HashMap<u32, Bytes>,
    actions: HashMap<u32, Action>,
}

impl DeviceShared {
    fn active_count(&self) -> u32 {
        u32::try_from(lock(&self.subscriptions).len()).unwrap_or(u32::MAX)
    }

    fn node(&self, node_id: u32) -> Option<Bytes> {
        self.nodes
            .get(&node_id)
            .or_else(|| self.nodes.get(&0))
            .cloned()
    }

    /// Subscribe the host to `var_id`, or re-tune its subscription.
    ///
    /// Values go out through `writer` as the publisher forwards them.
    fn change_sub(&self, var_id: u32, intervals: Intervals, writer: &WriterHandle) {
        let Some(publisher) = self.variables.get(&var_id) else {
            return;
        };

        let mut subscriptions = lock(&self.subscriptions);
        if let Some(id) = subscriptions.get(&var_id) {
            if publisher.set_intervals(*id, intervals) {
                tracing::debug!("Var {}: re-tuned to {:?}", var_id, intervals);
                return;
            }
        }

        let updates = writer.clone();
        let notices = writer.clone();
        let id = publisher.subscribe(
            intervals,
            Arc::new(move |value: &Value| {
                if let Err(e) = updates.try_send_packet(&Packet::update(var_id, *value)) {
                    tracing::debug!("Var {}: update dropped: {}", var_id, e);
                }
            }),
            Some(Arc::new(move || {
                if let Err(e) = notices.try_send_packet(&Packet::event(Payload::Cancelled(var_id))) {
                    tracing::debug!("Var {}: cancel notice dropped: {}", var_id, e);
                }
            })),
        );
        subscriptions.insert(var_id, id);
        tracing::debug!("Var {}: subscribed at {:?}", var_id, intervals);
    }

    fn cancel_sub(&self, var_id: u32) {
        let removed = lock(&self.subscriptions).remove(&var_id);
        if let (Some(id), Some(publisher)) = (removed, self.variables.get(&var_id)) {
            publisher.cancel(id);
        }
    }

    fn drop_all(&self) {
        let subscriptions = std::mem::take(&mut *lock(&self.subscriptions));
        for (var_id, id) in subscriptions {
            if let Some(publisher) = self.variables.get(&var_id) {
                publisher.cancel(id);
            }
        }
    }
}

/// A running device endpoint.
pub struct DeviceEndpoint {
    session: Arc<Session>,
    shared: Arc<DeviceShared>,
    liveness: JoinHandle<()>,
}

impl DeviceEndpoint {
    /// Create a new builder.
    pub fn builder() -> DeviceEndpointBuilder {
        DeviceEndpointBuilder::new()
    }

    /// Publish a new value of `var_id`. Returns `false` for an unknown
    /// variable.
    pub fn publish(&self, var_id: u32, value: Value) -> bool {
        match self.shared.variables.get(&var_id) {
            Some(publisher) => {
                publisher.publish(value);
                true
            }
            None => false,
        }
    }

    /// Check whether the host is subscribed to `var_id`.
    pub fn is_subscribed(&self, var_id: u32) -> bool {
        lock(&self.shared.subscriptions).contains_key(&var_id)
    }

    /// Number of variables the host is subscribed to.
    pub fn subscription_count(&self) -> usize {
        lock(&self.shared.subscriptions).len()
    }

    /// Intervals the host asked for on `var_id`.
    pub fn intervals(&self, var_id: u32) -> Option<Intervals> {
        let id = *lock(&self.shared.subscriptions).get(&var_id)?;
        self.shared.variables.get(&var_id)?.intervals(id)
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

impl Drop for DeviceEndpoint {
    fn drop(&mut self) {
        self.liveness.abort();
    }
}

fn device_handlers(shared: &Arc<DeviceShared>) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();

    let s = shared.clone();
    handlers.register(PacketKind::Ping, move |_packet, ctx| {
        let active = s.active_count();
        async move { ctx.reply(Payload::Pong(active)).await }
    });

    let s = shared.clone();
    handlers.register(PacketKind::FetchNode, move |packet, ctx| {
        let node = match packet.payload {
            Payload::FetchNode(node_id) => s.node(node_id),
            _ => None,
        };
        async move {
            match node {
                Some(descriptor) => ctx.reply(Payload::Node(descriptor)).await,
                None => ctx.success(false).await,
            }
        }
    });

    let s = shared.clone();
    handlers.register(PacketKind::ChangeSub, move |packet, ctx| {
        let s = s.clone();
        async move {
            let Payload::ChangeSub {
                var_id,
                debounce_ms,
                refresh_ms,
                ..
            } = packet.payload
            else {
                return ctx.success(false).await;
            };

            let accepted = s.variables.contains_key(&var_id);
            if !accepted {
                tracing::warn!("Subscription to unknown var {}", var_id);
            }
            ctx.success(accepted).await?;

            // Accept first: the publisher may forward the current value at once.
            if let (true, Some(writer)) = (accepted, ctx.writer()) {
                s.change_sub(var_id, Intervals::from_wire(debounce_ms, refresh_ms), writer);
            }
            Ok(())
        }
    });

    let s = shared.clone();
    handlers.register(PacketKind::CancelSub, move |packet, ctx| {
        if let Payload::CancelSub { var_id, .. } = packet.payload {
            s.cancel_sub(var_id);
        }
        async move { ctx.success(true).await }
    });

    let s = shared.clone();
    handlers.register(PacketKind::Call, move |packet, ctx| {
        let result = match packet.payload {
            Payload::Call {
                action_id,
                argument,
            } => s.actions.get(&action_id).map(|action| action(argument)),
            _ => None,
        };
        async move {
            match result {
                Some(value) => ctx.reply(Payload::CallCompleted(value)).await,
                None => ctx.success(false).await,
            }
        }
    });

    handlers
}

async fn liveness_loop(session: Arc<Session>, shared: Arc<DeviceShared>, config: LinkConfig) {
    let mut ticker = tokio::time::interval(config.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = session.closed() => break,
        }

        let idle = session.activity().idle_for();
        if idle >= config.liveness_timeout && shared.active_count() > 0 {
            tracing::info!("No traffic for {:?}, dropping subscriptions", idle);
            shared.drop_all();
        }
    }

    shared.drop_all();
}
