//! Backoff schedules for retries and reconnection.
//!
//! Delays are modeled as restartable lazy sequences: a [`DelayScheduleFactory`]
//! is a nullary closure producing a fresh iterator of delays. Each retry or
//! reconnect loop instantiates its own iterator, so an earlier burst of
//! failures never biases a later one. A schedule may be infinite; the
//! consuming loop's own budget (attempts, deadline) terminates it.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// A lazy sequence of delays, consumed by one retry or reconnect loop.
pub type DelaySchedule = Box<dyn Iterator<Item = Duration> + Send>;

/// Factory producing a fresh [`DelaySchedule`] per loop invocation.
pub type DelayScheduleFactory = Arc<dyn Fn() -> DelaySchedule + Send + Sync>;

/// Maps a page count to the time budget a multi-page fetch is expected to
/// need; used to decide whether to wait out the current cache window.
pub type PageSplitDelay = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// An exponential backoff sequence with optional jitter.
///
/// Yields `base`, `base × growth`, `base × growth²`, … capped at `cap`.
/// With jitter enabled each delay is drawn uniformly from ±25% around the
/// mean, which keeps concurrent clients from synchronizing their retries.
///
/// The sequence is infinite; it keeps yielding the cap once reached.
///
/// # Examples
///
/// ```
/// use esiflow::backoff::ExponentialBackoff;
/// use std::time::Duration;
///
/// let mut delays = ExponentialBackoff::new(
///     Duration::from_millis(500),
///     Duration::from_millis(15_000),
///     3,
/// )
/// .without_jitter();
///
/// assert_eq!(delays.next(), Some(Duration::from_millis(500)));
/// assert_eq!(delays.next(), Some(Duration::from_millis(1500)));
/// assert_eq!(delays.next(), Some(Duration::from_millis(4500)));
/// ```
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: Duration,
    cap: Duration,
    growth: u32,
    jitter: bool,
}

impl ExponentialBackoff {
    /// Creates a backoff sequence starting at `base`, multiplying by
    /// `growth`, capped at `cap`. Jitter is enabled by default.
    pub fn new(base: Duration, cap: Duration, growth: u32) -> Self {
        Self {
            current: base,
            cap,
            growth,
            jitter: true,
        }
    }

    /// Disables jitter, making the sequence deterministic.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let mean = self.current.min(self.cap);
        self.current = self.current.saturating_mul(self.growth);

        if self.jitter {
            // Uniform ±25% around the mean.
            let factor = rand::thread_rng().gen_range(0.75..=1.25);
            Some(mean.mul_f64(factor))
        } else {
            Some(mean)
        }
    }
}

/// Default schedule for generic transient failures (502/503/504 without an
/// error-budget signal): 500 ms base, ×3 growth, capped at 15 s.
pub fn default_retry_delay_low() -> DelayScheduleFactory {
    Arc::new(|| {
        Box::new(ExponentialBackoff::new(
            Duration::from_millis(500),
            Duration::from_millis(500 * 30),
            3,
        ))
    })
}

/// Default schedule for endpoint error-budget exhaustion (responses carrying
/// `x-esi-error-limit-reset`): 15 s base, ×2 growth, capped at 60 s.
pub fn default_retry_delay_high() -> DelayScheduleFactory {
    Arc::new(|| {
        Box::new(ExponentialBackoff::new(
            Duration::from_millis(15_000),
            Duration::from_millis(15_000 * 4),
            2,
        ))
    })
}

/// Default reconnect schedule: 500 ms base, ×2 growth, capped at 32 s.
pub fn default_reconnect_delay() -> DelayScheduleFactory {
    Arc::new(|| {
        Box::new(ExponentialBackoff::new(
            Duration::from_millis(500),
            Duration::from_millis(500 * 64),
            2,
        ))
    })
}

/// Default anti-page-split budget: `pages × 75 ms + 2500 ms`.
pub fn default_page_split_delay() -> PageSplitDelay {
    Arc::new(|pages| Duration::from_millis(u64::from(pages) * 75 + 2500))
}
