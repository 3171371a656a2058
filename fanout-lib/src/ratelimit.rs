//! Global dispatch rate limiting.
//!
//! The limiter throttles how often requests are *dispatched*, not how many
//! are in flight; concurrency is capped separately by
//! [`DriverSettings`](crate::DriverSettings).

use std::num::NonZeroU32;
use std::ops::Add;
use std::time::Duration;

use governor::clock::{Clock, Reference};
use governor::middleware::NoOpMiddleware;
use governor::nanos::Nanos;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use tokio::time::Instant;

use crate::{ErrorKind, Result};

/// Default ceiling of dispatched requests per second, 10.
pub const DEFAULT_RATE_LIMIT: u32 = 10;

const MICROS_PER_SECOND: u64 = 1_000_000;

/// Instant of the tokio clock, which follows paused time in tests
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TokioInstant(Instant);

impl Add<Nanos> for TokioInstant {
    type Output = Self;

    fn add(self, other: Nanos) -> Self {
        Self(self.0 + Duration::from(other))
    }
}

impl Reference for TokioInstant {
    fn duration_since(&self, earlier: Self) -> Nanos {
        Nanos::from(self.0.saturating_duration_since(earlier.0))
    }

    fn saturating_sub(&self, duration: Nanos) -> Self {
        Self(self.0.checked_sub(Duration::from(duration)).unwrap_or(self.0))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TokioClock;

impl Clock for TokioClock {
    type Instant = TokioInstant;

    fn now(&self) -> TokioInstant {
        TokioInstant(Instant::now())
    }
}

type Governor =
    governor::RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<TokioInstant>>;

/// Enforces a minimum interval between two dispatches.
///
/// The interval is `1_000_000 / rps` microseconds, a quota with a burst of
/// one cell.
pub struct RateLimiter {
    rps: u32,
    interval: Duration,
    governor: Governor,
    last_dispatch: Option<Instant>,
    /// Earliest next dispatch carried over from before a rate change
    hold_until: Option<Instant>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        let interval = interval(DEFAULT_RATE_LIMIT);
        let quota =
            Quota::with_period(interval).unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN));
        Self::from_quota(DEFAULT_RATE_LIMIT, interval, quota)
    }
}

impl RateLimiter {
    /// Create a limiter allowing `rps` dispatches per second.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidRateLimit`] if `rps` is zero.
    pub fn new(rps: u32) -> Result<Self> {
        if rps == 0 {
            return Err(ErrorKind::InvalidRateLimit(rps));
        }
        let interval = interval(rps);
        // rates above one per microsecond fall back to a per-second quota
        let quota = Quota::with_period(interval)
            .or_else(|| NonZeroU32::new(rps).map(Quota::per_second))
            .ok_or(ErrorKind::InvalidRateLimit(rps))?;
        Ok(Self::from_quota(rps, interval, quota))
    }

    fn from_quota(rps: u32, interval: Duration, quota: Quota) -> Self {
        Self {
            rps,
            interval,
            governor: Governor::direct_with_clock(quota, TokioClock),
            last_dispatch: None,
            hold_until: None,
        }
    }

    /// Change the ceiling. The last dispatch is kept, so the new interval
    /// applies to the very next dispatch.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidRateLimit`] if `rps` is zero.
    pub fn set_rps(&mut self, rps: u32) -> Result<()> {
        let mut limiter = Self::new(rps)?;
        limiter.last_dispatch = self.last_dispatch;
        limiter.hold_until = self.last_dispatch.map(|last| last + limiter.interval);
        *self = limiter;
        Ok(())
    }

    /// Configured ceiling in requests per second
    #[must_use]
    pub const fn rps(&self) -> u32 {
        self.rps
    }

    /// Minimum interval between two dispatches
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Time since the last dispatch, `None` before the first one
    #[must_use]
    pub fn time_since_last(&self) -> Option<Duration> {
        self.last_dispatch.map(|last| last.elapsed())
    }

    /// Claim a dispatch happening now and return its instant, or the time
    /// left until the next dispatch is allowed.
    ///
    /// # Errors
    ///
    /// Returns the remaining wait if the dispatch has to be held back.
    pub fn check(&mut self) -> std::result::Result<Instant, Duration> {
        let now = Instant::now();
        if let Some(hold) = self.hold_until {
            if hold > now {
                return Err(hold - now);
            }
            self.hold_until = None;
        }
        match self.governor.check() {
            Ok(()) => {
                self.last_dispatch = Some(now);
                Ok(now)
            }
            Err(not_until) => Err(not_until.wait_time_from(TokioClock.now())),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rps", &self.rps)
            .field("interval", &self.interval)
            .field("time_since_last", &self.time_since_last())
            .finish_non_exhaustive()
    }
}

fn interval(rps: u32) -> Duration {
    Duration::from_micros(MICROS_PER_SECOND / u64::from(rps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, Duration::from_secs(1))]
    #[case(10, Duration::from_millis(100))]
    #[case(3, Duration::from_micros(333_333))]
    #[case(1_000_000, Duration::from_micros(1))]
    fn test_interval(#[case] rps: u32, #[case] expected: Duration) {
        assert_eq!(RateLimiter::new(rps).unwrap().interval(), expected);
    }

    #[test]
    fn test_zero_is_rejected() {
        assert_eq!(
            RateLimiter::new(0).unwrap_err(),
            ErrorKind::InvalidRateLimit(0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_dispatch_does_not_wait() {
        let mut limiter = RateLimiter::new(1).unwrap();
        assert_eq!(limiter.time_since_last(), None);
        assert!(limiter.check().is_ok());
        assert_eq!(limiter.time_since_last(), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_spaces_dispatches() {
        let mut limiter = RateLimiter::new(4).unwrap();
        let first = limiter.check().unwrap();

        let wait = limiter.check().unwrap_err();
        assert!(wait > Duration::ZERO && wait <= Duration::from_millis(250));
        // a refused check does not consume the next slot
        assert!(limiter.check().is_err());

        tokio::time::advance(wait).await;
        let second = limiter.check().unwrap();
        assert!(second - first >= Duration::from_millis(250));
        assert!(limiter.check().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_rps_keeps_last_dispatch() {
        let mut limiter = RateLimiter::new(1000).unwrap();
        limiter.check().unwrap();
        limiter.set_rps(2).unwrap();
        assert_eq!(limiter.interval(), Duration::from_millis(500));

        let wait = limiter.check().unwrap_err();
        assert!(wait > Duration::from_millis(400));
        assert!(limiter.set_rps(0).is_err());
        assert_eq!(limiter.rps(), 2);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_rps_before_first_dispatch() {
        let mut limiter = RateLimiter::new(1).unwrap();
        limiter.set_rps(5).unwrap();
        assert!(limiter.check().is_ok());
        let wait = limiter.check().unwrap_err();
        assert!(wait > Duration::from_millis(150) && wait <= Duration::from_millis(200));
    }
}
