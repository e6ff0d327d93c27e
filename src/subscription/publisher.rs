//! Timer-driven fan-out of one value stream to many subscribers.
//!
//! A [`Publisher`] keeps the latest [`Value`] and a [`Cadence`] per
//! subscriber. New values go out immediately to every subscriber whose
//! debounce window has passed; the rest are delivered by a background driver
//! task when their alarm fires, which also handles refresh re-sends.
//!
//! Callbacks are always invoked with no lock held, so they may subscribe,
//! unsubscribe or publish from inside a callback.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{Cadence, CancelCallback, DataCallback, Intervals};
use crate::sync::lock;
use crate::value::Value;

/// Identifier of a subscriber within one publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(u64);

struct Subscriber {
    intervals: Intervals,
    cadence: Cadence,
    on_data: DataCallback,
    on_cancel: Option<CancelCallback>,
}

struct State {
    value: Option<Value>,
    subscribers: BTreeMap<SubscriberId, Subscriber>,
    next_id: u64,
}

struct Shared {
    state: Mutex<State>,
    wake: Notify,
    epoch: Instant,
}

type Delivery = (DataCallback, Value);

impl Shared {
    /// Milliseconds since the epoch on the wrapping cadence clock.
    fn now_ms(&self) -> u32 {
        // Truncation is the wraparound.
        self.epoch.elapsed().as_millis() as u32
    }

    fn deliver(deliveries: Vec<Delivery>) {
        for (on_data, value) in deliveries {
            on_data(&value);
        }
    }

    /// Fire due alarms and compute how long to sleep until the next one.
    fn fire_due(&self) -> (Vec<Delivery>, Option<Duration>) {
        let now = self.now_ms();
        let mut state = lock(&self.state);
        let Some(value) = state.value else {
            return (Vec::new(), None);
        };

        let mut deliveries = Vec::new();
        let mut next: Option<u32> = None;
        for sub in state.subscribers.values_mut() {
            if sub.cadence.fire(now) {
                deliveries.push((sub.on_data.clone(), value));
            }
            if let Some(alarm) = sub.cadence.next_alarm() {
                next = Some(next.map_or(alarm, |n| n.min(alarm)));
            }
        }

        let sleep = next.map(|alarm| Duration::from_millis(u64::from(alarm.saturating_sub(now))));
        (deliveries, sleep)
    }
}

/// Debounce/refresh publisher for one value.
pub struct Publisher {
    shared: Arc<Shared>,
    driver: JoinHandle<()>,
}

impl Publisher {
    /// Create a publisher and start its driver task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                value: None,
                subscribers: BTreeMap::new(),
                next_id: 0,
            }),
            wake: Notify::new(),
            epoch: Instant::now(),
        });

        let driver = tokio::spawn(drive(shared.clone()));
        Self { shared, driver }
    }

    /// Add a subscriber. If a value is known it is delivered right away.
    pub fn subscribe(
        &self,
        intervals: Intervals,
        on_data: DataCallback,
        on_cancel: Option<CancelCallback>,
    ) -> SubscriberId {
        let now = self.shared.now_ms();
        let mut state = lock(&self.shared.state);

        let id = SubscriberId(state.next_id);
        state.next_id += 1;

        let mut cadence = Cadence::new(intervals);
        let initial = state.value.filter(|_| cadence.update(now));

        state.subscribers.insert(
            id,
            Subscriber {
                intervals,
                cadence,
                on_data: on_data.clone(),
                on_cancel,
            },
        );
        drop(state);

        if let Some(value) = initial {
            on_data(&value);
        }
        self.shared.wake.notify_one();
        id
    }

    /// Remove a subscriber without firing its cancel callback.
    ///
    /// Returns whether it was subscribed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        lock(&self.shared.state).subscribers.remove(&id).is_some()
    }

    /// Remove a subscriber and fire its cancel callback.
    ///
    /// Returns whether it was subscribed.
    pub fn cancel(&self, id: SubscriberId) -> bool {
        let removed = lock(&self.shared.state).subscribers.remove(&id);
        match removed {
            Some(sub) => {
                if let Some(on_cancel) = sub.on_cancel {
                    on_cancel();
                }
                true
            }
            None => false,
        }
    }

    /// Change a subscriber's intervals. Returns whether it exists.
    pub fn set_intervals(&self, id: SubscriberId, intervals: Intervals) -> bool {
        let found = match lock(&self.shared.state).subscribers.get_mut(&id) {
            Some(sub) => {
                sub.intervals = intervals;
                sub.cadence.set_intervals(intervals);
                true
            }
            None => false,
        };
        if found {
            self.shared.wake.notify_one();
        }
        found
    }

    /// Get a subscriber's intervals.
    pub fn intervals(&self, id: SubscriberId) -> Option<Intervals> {
        lock(&self.shared.state)
            .subscribers
            .get(&id)
            .map(|sub| sub.intervals)
    }

    /// Publish a new value.
    ///
    /// A value equal to the last one still counts as an update: it is
    /// forwarded when outside the debounce window and restarts the refresh.
    pub fn publish(&self, value: Value) {
        let now = self.shared.now_ms();
        let deliveries: Vec<Delivery> = {
            let mut state = lock(&self.shared.state);
            state.value = Some(value);
            state
                .subscribers
                .values_mut()
                .filter_map(|sub| sub.cadence.update(now).then(|| (sub.on_data.clone(), value)))
                .collect()
        };

        Shared::deliver(deliveries);
        self.shared.wake.notify_one();
    }

    /// Remove every subscriber, firing their cancel callbacks.
    pub fn cancel_all(&self) {
        let subscribers = std::mem::take(&mut lock(&self.shared.state).subscribers);
        for sub in subscribers.into_values() {
            if let Some(on_cancel) = sub.on_cancel {
                on_cancel();
            }
        }
    }

    /// Forget the current value and all pending deliveries.
    pub fn clear_value(&self) {
        let mut state = lock(&self.shared.state);
        state.value = None;
        for sub in state.subscribers.values_mut() {
            sub.cadence.reset();
        }
    }

    /// Latest published value.
    pub fn last_value(&self) -> Option<Value> {
        lock(&self.shared.state).value
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.shared.state).subscribers.len()
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

async fn drive(shared: Arc<Shared>) {
    loop {
        let (deliveries, sleep) = shared.fire_due();
        Shared::deliver(deliveries);

        match sleep {
            Some(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shared.wake.notified() => {}
                }
            }
            None => shared.wake.notified().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Arc<Mutex<Vec<(u64, Value)>>>;

    /// Callback recording (ms since start, value).
    fn recorder(start: Instant) -> (DataCallback, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let cb: DataCallback = Arc::new(move |v: &Value| {
            l.lock()
                .unwrap()
                .push((start.elapsed().as_millis() as u64, *v));
        });
        (cb, log)
    }

    async fn advance_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_value_forwarded_once_at_window_end() {
        let start = Instant::now();
        let publisher = Publisher::new();
        let (cb, log) = recorder(start);
        publisher.subscribe(Intervals::from_millis(200, 0), cb, None);

        publisher.publish(Value::U32(1));
        advance_ms(50).await;
        publisher.publish(Value::U32(2));

        advance_ms(500).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec![(0, Value::U32(1)), (200, Value::U32(2))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_value_supersedes_pending() {
        let start = Instant::now();
        let publisher = Publisher::new();
        let (cb, log) = recorder(start);
        publisher.subscribe(Intervals::from_millis(200, 0), cb, None);

        publisher.publish(Value::U32(1));
        advance_ms(50).await;
        publisher.publish(Value::U32(2));
        advance_ms(50).await;
        publisher.publish(Value::U32(3));

        advance_ms(500).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec![(0, Value::U32(1)), (200, Value::U32(3))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_repeats_last_value() {
        let start = Instant::now();
        let publisher = Publisher::new();
        let (cb, log) = recorder(start);
        publisher.subscribe(Intervals::from_millis(0, 1000), cb, None);

        publisher.publish(Value::Bool(true));
        advance_ms(3500).await;

        let times: Vec<u64> = log.lock().unwrap().iter().map(|(t, _)| *t).collect();
        assert_eq!(times, vec![0, 1000, 2000, 3000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_value_restarts_resend() {
        let start = Instant::now();
        let publisher = Publisher::new();
        let (cb, log) = recorder(start);
        publisher.subscribe(Intervals::from_millis(0, 1000), cb, None);

        publisher.publish(Value::U8(4));
        advance_ms(600).await;
        publisher.publish(Value::U8(4));
        advance_ms(1100).await;

        let times: Vec<u64> = log.lock().unwrap().iter().map(|(t, _)| *t).collect();
        assert_eq!(times, vec![0, 600, 1600]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_keep_own_cadence() {
        let start = Instant::now();
        let publisher = Publisher::new();
        let (fast, fast_log) = recorder(start);
        let (slow, slow_log) = recorder(start);
        publisher.subscribe(Intervals::from_millis(50, 0), fast, None);
        publisher.subscribe(Intervals::from_millis(200, 0), slow, None);

        for i in 0..4u32 {
            publisher.publish(Value::U32(i));
            advance_ms(60).await;
        }
        advance_ms(500).await;

        assert_eq!(fast_log.lock().unwrap().len(), 4);
        assert_eq!(
            *slow_log.lock().unwrap(),
            vec![(0, Value::U32(0)), (200, Value::U32(3))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_subscriber_gets_last_value() {
        let start = Instant::now();
        let publisher = Publisher::new();
        publisher.publish(Value::I16(-4));

        let (cb, log) = recorder(start);
        publisher.subscribe(Intervals::default(), cb, None);

        assert_eq!(*log.lock().unwrap(), vec![(0, Value::I16(-4))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_fires_callbacks() {
        let publisher = Publisher::new();
        let cancelled = Arc::new(Mutex::new(0));
        for _ in 0..3 {
            let c = cancelled.clone();
            publisher.subscribe(
                Intervals::default(),
                Arc::new(|_| {}),
                Some(Arc::new(move || *c.lock().unwrap() += 1)),
            );
        }

        publisher.cancel_all();

        assert_eq!(*cancelled.lock().unwrap(), 3);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_fires_only_that_callback() {
        let publisher = Publisher::new();
        let cancelled = Arc::new(Mutex::new(Vec::new()));
        let mut ids = Vec::new();
        for i in 0..2 {
            let c = cancelled.clone();
            ids.push(publisher.subscribe(
                Intervals::default(),
                Arc::new(|_| {}),
                Some(Arc::new(move || c.lock().unwrap().push(i))),
            ));
        }

        assert!(publisher.cancel(ids[1]));
        assert!(!publisher.cancel(ids[1]));

        assert_eq!(*cancelled.lock().unwrap(), vec![1]);
        assert_eq!(publisher.subscriber_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_stops_delivery() {
        let start = Instant::now();
        let publisher = Publisher::new();
        let (cb, log) = recorder(start);
        let id = publisher.subscribe(Intervals::from_millis(0, 100), cb, None);

        publisher.publish(Value::U8(1));
        assert!(publisher.unsubscribe(id));
        assert!(!publisher.unsubscribe(id));
        advance_ms(500).await;

        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_intervals_takes_effect() {
        let start = Instant::now();
        let publisher = Publisher::new();
        let (cb, log) = recorder(start);
        let id = publisher.subscribe(Intervals::from_millis(0, 0), cb, None);
        publisher.publish(Value::U8(1));

        assert!(publisher.set_intervals(id, Intervals::from_millis(0, 300)));
        assert_eq!(publisher.intervals(id), Some(Intervals::from_millis(0, 300)));
        advance_ms(700).await;

        let times: Vec<u64> = log.lock().unwrap().iter().map(|(t, _)| *t).collect();
        assert_eq!(times, vec![0, 300, 600]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_value_stops_resend() {
        let start = Instant::now();
        let publisher = Publisher::new();
        let (cb, log) = recorder(start);
        publisher.subscribe(Intervals::from_millis(0, 100), cb, None);
        publisher.publish(Value::U8(1));

        publisher.clear_value();
        advance_ms(500).await;

        assert_eq!(publisher.last_value(), None);
        assert_eq!(log.lock().unwrap().len(), 1);
    }
}
