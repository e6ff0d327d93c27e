//! Per-subscriber debounce and refresh timing.
//!
//! [`Cadence`] decides when a subscriber gets a value. It holds no value and
//! no timer: the owner reports new values through [`Cadence::update`], calls
//! [`Cadence::fire`] once [`Cadence::next_alarm`] is reached, and forwards its
//! current value whenever either returns `true`.
//!
//! Time is a wrapping `u32` millisecond counter. If `now` is ever behind the
//! last forwarded time, the counter wrapped: the last forwarded time and any
//! armed alarm are moved back onto `now` instead of waiting for the counter to
//! catch up.

use std::time::Duration;

use super::Intervals;

/// Timing state of one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cadence {
    min_ms: u32,
    max_ms: Option<u32>,
    /// When a value was last forwarded.
    last: Option<u32>,
    /// Forward the pending value at this time.
    delay_alarm: Option<u32>,
    /// Re-forward the last value at this time.
    resend_alarm: Option<u32>,
}

fn millis(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}

impl Cadence {
    /// Create an idle cadence for `intervals`.
    pub fn new(intervals: Intervals) -> Self {
        Self {
            min_ms: millis(intervals.min()),
            max_ms: intervals.max().map(millis),
            last: None,
            delay_alarm: None,
            resend_alarm: None,
        }
    }

    /// A new value is available at `now`. Returns whether to forward it now.
    ///
    /// Otherwise a delay alarm is armed for the end of the debounce window,
    /// and the value will go out from [`fire`](Self::fire) unless another
    /// update replaces it first.
    pub fn update(&mut self, now: u32) -> bool {
        self.rebase(now);

        match self.last {
            Some(last) if now - last < self.min_ms => {
                self.delay_alarm = Some(last.saturating_add(self.min_ms));
                false
            }
            _ => {
                self.forwarded_at(now);
                true
            }
        }
    }

    /// Process alarms due at `now`. Returns whether to forward the current
    /// value.
    pub fn fire(&mut self, now: u32) -> bool {
        self.rebase(now);
        let mut forward = false;

        if let Some(at) = self.delay_alarm.filter(|at| *at <= now) {
            self.forwarded_at(at);
            forward = true;
        }

        if let Some(at) = self.resend_alarm.filter(|at| *at <= now) {
            self.last = Some(at);
            self.resend_alarm = self.max_ms.map(|max| at.saturating_add(max));
            forward = true;
        }

        forward
    }

    /// Earliest armed alarm.
    pub fn next_alarm(&self) -> Option<u32> {
        match (self.delay_alarm, self.resend_alarm) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Switch to new intervals, re-arming alarms from the last forwarded time.
    pub fn set_intervals(&mut self, intervals: Intervals) {
        self.min_ms = millis(intervals.min());
        self.max_ms = intervals.max().map(millis);

        let Some(last) = self.last else {
            return;
        };
        if self.delay_alarm.is_some() {
            self.delay_alarm = Some(last.saturating_add(self.min_ms));
        }
        self.resend_alarm = self.max_ms.map(|max| last.saturating_add(max));
    }

    /// Forget all history, as if no value had ever been forwarded.
    pub fn reset(&mut self) {
        self.last = None;
        self.delay_alarm = None;
        self.resend_alarm = None;
    }

    /// When a value was last forwarded.
    pub fn last_forwarded(&self) -> Option<u32> {
        self.last
    }

    fn forwarded_at(&mut self, at: u32) {
        self.last = Some(at);
        self.delay_alarm = None;
        self.resend_alarm = self.max_ms.map(|max| at.saturating_add(max));
    }

    fn rebase(&mut self, now: u32) {
        let Some(last) = self.last else {
            return;
        };
        if now >= last {
            return;
        }

        tracing::debug!("Clock wrapped ({} < {}), rebasing alarms", now, last);
        self.last = Some(now);
        if self.delay_alarm.is_some() {
            self.delay_alarm = Some(now.saturating_add(self.min_ms));
        }
        if self.resend_alarm.is_some() {
            self.resend_alarm = self.max_ms.map(|max| now.saturating_add(max));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cadence(min: u64, max: u64) -> Cadence {
        Cadence::new(Intervals::from_millis(min, max))
    }

    #[test]
    fn test_first_update_forwards() {
        let mut c = cadence(200, 0);
        assert!(c.update(1000));
        assert_eq!(c.last_forwarded(), Some(1000));
        assert_eq!(c.next_alarm(), None);
    }

    #[test]
    fn test_debounce_delays_then_forwards_once() {
        let mut c = cadence(200, 0);
        assert!(c.update(0));

        // 50 ms later: held back until 200.
        assert!(!c.update(50));
        assert_eq!(c.next_alarm(), Some(200));

        assert!(!c.fire(199));
        assert!(c.fire(200));
        assert_eq!(c.last_forwarded(), Some(200));
        assert_eq!(c.next_alarm(), None);
        assert!(!c.fire(500));
    }

    #[test]
    fn test_superseded_value_uses_same_alarm() {
        let mut c = cadence(200, 0);
        c.update(0);
        assert!(!c.update(50));
        assert!(!c.update(120));
        assert_eq!(c.next_alarm(), Some(200));
    }

    #[test]
    fn test_update_after_window_forwards() {
        let mut c = cadence(200, 0);
        c.update(0);
        assert!(c.update(200));
        assert!(c.update(450));
    }

    #[test]
    fn test_resend_repeats() {
        let mut c = cadence(0, 1000);
        assert!(c.update(0));
        assert_eq!(c.next_alarm(), Some(1000));

        assert!(c.fire(1000));
        assert_eq!(c.next_alarm(), Some(2000));
        assert!(c.fire(2000));
        assert_eq!(c.next_alarm(), Some(3000));
    }

    #[test]
    fn test_update_pushes_resend_back() {
        let mut c = cadence(0, 1000);
        c.update(0);
        assert!(c.update(600));
        assert_eq!(c.next_alarm(), Some(1600));
    }

    #[test]
    fn test_delayed_forward_rearms_resend() {
        let mut c = cadence(200, 1000);
        c.update(0);
        c.update(50);
        assert!(c.fire(200));
        assert_eq!(c.next_alarm(), Some(1200));
    }

    #[test]
    fn test_sub_millisecond_refresh_advances() {
        let intervals = Intervals::new(Duration::ZERO, Some(Duration::from_micros(500)));
        let mut c = Cadence::new(intervals);
        assert!(c.update(10));
        assert_eq!(c.next_alarm(), Some(11));
        assert!(c.fire(11));
        assert_eq!(c.next_alarm(), Some(12));
    }

    #[test]
    fn test_no_resend_without_max() {
        let mut c = cadence(100, 0);
        c.update(0);
        assert!(!c.fire(u32::MAX - 1));
    }

    #[test]
    fn test_wraparound_rebases() {
        let mut c = cadence(200, 1000);
        c.update(u32::MAX - 10);
        c.update(u32::MAX - 5);

        // The counter wrapped: 5 < last forwarded.
        assert!(!c.update(5));
        assert_eq!(c.last_forwarded(), Some(5));
        assert_eq!(c.next_alarm(), Some(205));
        assert!(c.fire(205));
    }

    #[test]
    fn test_set_intervals_rearms() {
        let mut c = cadence(500, 0);
        c.update(0);
        c.update(100);
        assert_eq!(c.next_alarm(), Some(500));

        c.set_intervals(Intervals::from_millis(200, 800));
        assert_eq!(c.next_alarm(), Some(200));

        assert!(c.fire(200));
        assert_eq!(c.next_alarm(), Some(1000));

        c.set_intervals(Intervals::from_millis(200, 0));
        assert_eq!(c.next_alarm(), None);
    }

    #[test]
    fn test_reset() {
        let mut c = cadence(200, 1000);
        c.update(0);
        c.update(10);
        c.reset();

        assert_eq!(c.next_alarm(), None);
        assert!(c.update(20));
    }
}
