//! One upstream subscription shared by many local subscribers.
//!
//! An [`Adapter`] stands for a single remote variable. Local callers subscribe
//! with their own [`Intervals`]; the adapter advertises the tightest of them
//! upstream and fans incoming values back out through a [`Publisher`], so each
//! subscriber still sees its own debounce and refresh.
//!
//! The remote end cannot handle overlapping re-subscribe requests for one
//! variable, so every state-changing operation first takes the adapter's
//! [`Floor`]. Callers that time out while queued never reach the wire.
//!
//! Rules while holding the floor:
//! - not subscribed upstream: request the aggregate of every live subscriber
//! - subscribed and the advertised intervals already cover the new need:
//!   nothing goes on the wire
//! - subscribed but the need is tighter: request the tightest of both, so
//!   the advertised intervals never loosen while subscribed
//! - last subscriber leaving: cancel upstream

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::runtime::Handle;

use super::{CancelCallback, DataCallback, Intervals, Publisher, SubscriberId};
use crate::error::{Result, TelewireError};
use crate::floor::Floor;
use crate::handler::BoxFuture;
use crate::sync::lock;
use crate::value::Value;

/// The wire side of an adapter.
pub trait Upstream: Send + Sync + 'static {
    /// Create or re-tune the upstream subscription to `var_id`.
    fn change_subscription(
        &self,
        var_id: u32,
        intervals: Intervals,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<()>>;

    /// Drop the upstream subscription to `var_id`.
    fn cancel_subscription(&self, var_id: u32, timeout: Duration) -> BoxFuture<'_, Result<()>>;
}

#[derive(Default)]
struct AdapterState {
    /// Live subscribers and what each asked for.
    subscribers: HashMap<SubscriberId, Intervals>,
    subscribed: bool,
    /// What the remote was last told, while subscribed.
    advertised: Option<Intervals>,
    /// Bumped by every reset.
    generation: u64,
}

struct AdapterInner {
    var_id: u32,
    upstream: Arc<dyn Upstream>,
    floor: Floor,
    state: Mutex<AdapterState>,
    publisher: Publisher,
    /// Timeout for operations nobody waits on (implicit cancels).
    default_timeout: Duration,
}

/// Coalescing adapter for one remote variable.
#[derive(Clone)]
pub struct Adapter {
    inner: Arc<AdapterInner>,
}

/// Handle of one local subscriber.
///
/// Dropping it without calling [`cancel`](Self::cancel) cancels implicitly:
/// the subscriber is removed and its cancel callback fires right away, and if
/// it was the last one an upstream cancel runs in the background.
pub struct Subscription {
    id: SubscriberId,
    adapter: Weak<AdapterInner>,
    done: bool,
}

impl Adapter {
    /// Create an adapter for `var_id`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(var_id: u32, upstream: Arc<dyn Upstream>, default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(AdapterInner {
                var_id,
                upstream,
                floor: Floor::new(),
                state: Mutex::new(AdapterState::default()),
                publisher: Publisher::new(),
                default_timeout,
            }),
        }
    }

    /// Add a local subscriber.
    ///
    /// Waits for the floor and, if the upstream subscription does not already
    /// cover `intervals`, re-subscribes upstream. Both steps get the full
    /// `timeout`. On failure nothing is registered.
    pub async fn subscribe(
        &self,
        intervals: Intervals,
        timeout: Duration,
        on_data: DataCallback,
        on_cancel: Option<CancelCallback>,
    ) -> Result<Subscription> {
        let inner = &self.inner;
        let _turn = inner.floor.acquire(timeout).await?;

        inner.negotiate(None, Some(intervals), timeout).await?;

        let id = inner.publisher.subscribe(intervals, on_data, on_cancel);
        lock(&inner.state).subscribers.insert(id, intervals);
        tracing::debug!("Var {}: added subscriber {:?} at {:?}", inner.var_id, id, intervals);

        Ok(Subscription {
            id,
            adapter: Arc::downgrade(inner),
            done: false,
        })
    }

    /// Feed a value received from upstream.
    pub fn update(&self, value: Value) {
        self.inner.publisher.publish(value);
    }

    /// Forget the upstream subscription, e.g. after the link dropped.
    ///
    /// Every subscriber is cancelled (callbacks fire) and the cached value is
    /// discarded. Subscribing again starts from scratch.
    pub fn reset(&self) {
        {
            let mut state = lock(&self.inner.state);
            state.subscribed = false;
            state.advertised = None;
            state.subscribers.clear();
            state.generation += 1;
        }
        self.inner.publisher.cancel_all();
        self.inner.publisher.clear_value();
    }

    /// Remote variable id.
    pub fn var_id(&self) -> u32 {
        self.inner.var_id
    }

    /// Check whether the upstream subscription is in place.
    pub fn is_subscribed(&self) -> bool {
        lock(&self.inner.state).subscribed
    }

    /// Intervals currently advertised upstream.
    pub fn advertised(&self) -> Option<Intervals> {
        lock(&self.inner.state).advertised
    }

    /// Number of live local subscribers.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.state).subscribers.len()
    }

    /// Latest value received from upstream.
    pub fn last_value(&self) -> Option<Value> {
        self.inner.publisher.last_value()
    }
}

impl AdapterInner {
    /// Bring the upstream subscription in line with the live subscribers.
    ///
    /// `exclude` is left out of the aggregate and `requested` added to it.
    /// Must be called with the floor held. Fails with `Cancelled` if the
    /// adapter was reset while the request was on the wire.
    async fn negotiate(
        &self,
        exclude: Option<SubscriberId>,
        requested: Option<Intervals>,
        timeout: Duration,
    ) -> Result<()> {
        let (request, generation) = {
            let state = lock(&self.state);
            let others = state
                .subscribers
                .iter()
                .filter(|(id, _)| Some(**id) != exclude)
                .map(|(_, intervals)| *intervals);
            let Some(needed) = Intervals::aggregate(others.chain(requested)) else {
                return Ok(());
            };

            let request = match state.advertised.filter(|_| state.subscribed) {
                Some(advertised) if advertised.satisfies(&needed) => None,
                Some(advertised) => Some(needed.tightest(advertised)),
                None => Some(needed),
            };
            (request, state.generation)
        };

        let Some(request) = request else {
            return Ok(());
        };

        tracing::debug!("Var {}: requesting {:?}", self.var_id, request);
        self.upstream
            .change_subscription(self.var_id, request, timeout)
            .await?;

        let mut state = lock(&self.state);
        if state.generation != generation {
            tracing::debug!("Var {}: reset while subscribing", self.var_id);
            return Err(TelewireError::Cancelled);
        }
        state.subscribed = true;
        state.advertised = Some(request);
        Ok(())
    }

    /// Upstream cancel once nobody is left. Must be called with the floor held.
    async fn release_upstream(&self, timeout: Duration) -> Result<()> {
        tracing::debug!("Var {}: last subscriber gone, cancelling upstream", self.var_id);
        self.upstream
            .cancel_subscription(self.var_id, timeout)
            .await?;

        let mut state = lock(&self.state);
        if state.subscribers.is_empty() {
            state.subscribed = false;
            state.advertised = None;
        }
        Ok(())
    }

    /// Remove a subscriber locally, firing its cancel callback.
    ///
    /// Returns `None` if it was already gone, otherwise whether it was the
    /// last one.
    fn remove(&self, id: SubscriberId) -> Option<bool> {
        let last = {
            let mut state = lock(&self.state);
            state.subscribers.remove(&id)?;
            state.subscribers.is_empty()
        };
        self.publisher.cancel(id);
        Some(last)
    }
}

impl Drop for AdapterInner {
    fn drop(&mut self) {
        self.publisher.cancel_all();
    }
}

impl Subscription {
    /// Change this subscriber's intervals.
    ///
    /// Fails with `Cancelled` if the subscription already ended.
    pub async fn change(&mut self, intervals: Intervals, timeout: Duration) -> Result<()> {
        let inner = self.live()?;
        let _turn = inner.floor.acquire(timeout).await?;

        let live = lock(&inner.state).subscribers.contains_key(&self.id);
        if !live {
            self.done = true;
            return Err(TelewireError::Cancelled);
        }

        inner.negotiate(Some(self.id), Some(intervals), timeout).await?;

        if let Some(current) = lock(&inner.state).subscribers.get_mut(&self.id) {
            *current = intervals;
        }
        inner.publisher.set_intervals(self.id, intervals);
        Ok(())
    }

    /// End this subscription.
    ///
    /// The cancel callback fires once the floor is ours. If subscribers
    /// remain this is a change to their aggregate, otherwise the upstream
    /// subscription is cancelled. If the floor cannot be had in time the
    /// subscriber is still removed locally, but nothing goes on the wire.
    pub async fn cancel(mut self, timeout: Duration) -> Result<()> {
        self.done = true;
        let inner = self.live()?;

        let _turn = match inner.floor.acquire(timeout).await {
            Ok(turn) => turn,
            Err(e) => {
                inner.remove(self.id);
                return Err(e);
            }
        };

        match inner.remove(self.id) {
            None => Err(TelewireError::Cancelled),
            Some(true) => inner.release_upstream(timeout).await,
            Some(false) => inner.negotiate(None, None, timeout).await,
        }
    }

    /// Check whether the subscription is still live.
    pub fn is_active(&self) -> bool {
        !self.done && self.intervals().is_some()
    }

    /// Current intervals of this subscriber.
    pub fn intervals(&self) -> Option<Intervals> {
        let inner = self.adapter.upgrade()?;
        let state = lock(&inner.state);
        state.subscribers.get(&self.id).copied()
    }

    fn live(&self) -> Result<Arc<AdapterInner>> {
        self.adapter.upgrade().ok_or(TelewireError::Cancelled)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let Some(inner) = self.adapter.upgrade() else {
            return;
        };
        if inner.remove(self.id) != Some(true) {
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            tracing::debug!("Var {}: no runtime, skipping upstream cancel", inner.var_id);
            return;
        };

        runtime.spawn(async move {
            let timeout = inner.default_timeout;
            let Ok(_turn) = inner.floor.acquire(timeout).await else {
                tracing::warn!("Var {}: floor busy, upstream cancel skipped", inner.var_id);
                return;
            };
            // Someone may have subscribed while we queued.
            let resubscribed = !lock(&inner.state).subscribers.is_empty();
            if resubscribed {
                return;
            }
            if let Err(e) = inner.release_upstream(timeout).await {
                tracing::warn!("Var {}: upstream cancel failed: {}", inner.var_id, e);
            }
        });
    }
}
