//! Freshness requirements of a subscriber.
//!
//! `min` is the debounce: forwarded values are at least this far apart.
//! `max` is the refresh: when set, the last value is re-sent if nothing was
//! forwarded for this long. There is no zero refresh; `Some(0)` collapses to
//! `None`, and on the wire a refresh of 0 ms means "none requested". Timing
//! runs at millisecond resolution, so a refresh under 1 ms is raised to 1 ms.

use std::sync::Arc;
use std::time::Duration;

use crate::value::Value;

/// Callback receiving forwarded values.
pub type DataCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Callback fired once when a subscription ends, whatever ended it.
pub type CancelCallback = Arc<dyn Fn() + Send + Sync>;

/// Shortest refresh the millisecond clock can honor.
const MIN_REFRESH: Duration = Duration::from_millis(1);

/// Debounce and refresh interval pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Intervals {
    min: Duration,
    max: Option<Duration>,
}

impl Intervals {
    /// Create an interval pair. A zero refresh means no refresh.
    pub fn new(min: Duration, max: Option<Duration>) -> Self {
        Self {
            min,
            max: max
                .filter(|max| !max.is_zero())
                .map(|max| max.max(MIN_REFRESH)),
        }
    }

    /// Shorthand taking milliseconds, 0 meaning no refresh.
    pub fn from_millis(min_ms: u64, max_ms: u64) -> Self {
        Self::new(
            Duration::from_millis(min_ms),
            Some(Duration::from_millis(max_ms)),
        )
    }

    /// Build from wire fields.
    pub fn from_wire(debounce_ms: u32, refresh_ms: u32) -> Self {
        Self::from_millis(u64::from(debounce_ms), u64::from(refresh_ms))
    }

    /// Encode as wire fields `(debounce_ms, refresh_ms)`, saturating.
    pub fn to_wire(&self) -> (u32, u32) {
        (
            duration_to_ms(self.min),
            self.max.map(duration_to_ms).unwrap_or(0),
        )
    }

    /// Debounce interval.
    #[inline]
    pub fn min(&self) -> Duration {
        self.min
    }

    /// Refresh interval, if one is requested.
    #[inline]
    pub fn max(&self) -> Option<Duration> {
        self.max
    }

    /// Componentwise tightest of two requirements.
    pub fn tightest(self, other: Intervals) -> Intervals {
        let max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Intervals {
            min: self.min.min(other.min),
            max,
        }
    }

    /// Tightest requirement over a set, `None` when empty.
    pub fn aggregate<I>(intervals: I) -> Option<Intervals>
    where
        I: IntoIterator<Item = Intervals>,
    {
        intervals.into_iter().reduce(Intervals::tightest)
    }

    /// Check whether advertising `self` upstream already honors `needed`.
    pub fn satisfies(&self, needed: &Intervals) -> bool {
        if self.min > needed.min {
            return false;
        }
        match (self.max, needed.max) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(have), Some(want)) => have <= want,
        }
    }
}

fn duration_to_ms(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}
