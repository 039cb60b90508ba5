use std::{fmt, time::Duration};

use crate::AdmissionError;

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Fallback for [`ConcurrencyLimit::request_max_duration`] when it is left at zero.
pub const DEFAULT_REQUEST_MAX_DURATION: Duration = Duration::from_secs(60);

// Slot expirations are Lua numbers; five times this still stays within the 2^53
// range they represent exactly.
const MAX_REQUEST_MAX_MILLIS: u64 = 1 << 50;

/// Rate limit configuration: `rate` units per `period`, with up to `burst` units at once.
///
/// A `burst` of `0` means "same as `rate`".
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use redis_admission::Limit;
///
/// let limit = Limit::per_second(10);
/// assert_eq!(limit.to_string(), "10 req/s (burst 10)");
///
/// let limit = Limit::new(100, Duration::from_secs(60)).with_burst(20);
/// assert_eq!(limit.to_string(), "100 req/m (burst 20)");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Limit {
    /// Units admitted per `period`.
    pub rate: u64,
    /// Length of the window `rate` is measured over.
    pub period: Duration,
    /// Maximum units admitted instantaneously. `0` defaults to `rate`.
    pub burst: u64,
}

impl Limit {
    /// `rate` units per `period`, burst equal to `rate`.
    pub fn new(rate: u64, period: Duration) -> Self {
        Self {
            rate,
            period,
            burst: rate,
        }
    }

    /// `rate` units per second.
    pub fn per_second(rate: u64) -> Self {
        Self::new(rate, SECOND)
    }

    /// `rate` units per minute.
    pub fn per_minute(rate: u64) -> Self {
        Self::new(rate, MINUTE)
    }

    /// `rate` units per hour.
    pub fn per_hour(rate: u64) -> Self {
        Self::new(rate, HOUR)
    }

    /// Override the burst capacity.
    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = burst;
        self
    }

    /// Whether this is the all-zero limit.
    pub fn is_zero(&self) -> bool {
        self.rate == 0 && self.period.is_zero() && self.burst == 0
    }

    /// Burst after applying the "defaults to rate" rule.
    pub fn effective_burst(&self) -> u64 {
        if self.burst == 0 { self.rate } else { self.burst }
    }

    pub(crate) fn validate(&self) -> Result<(), AdmissionError> {
        if self.rate == 0 {
            return Err(AdmissionError::InvalidArgument(
                "rate must be greater than 0".to_string(),
            ));
        }
        if self.period < Duration::from_micros(1) {
            return Err(AdmissionError::InvalidArgument(
                "period must be at least 1µs".to_string(),
            ));
        }
        if self.effective_burst() == 0 {
            return Err(AdmissionError::InvalidArgument(
                "burst must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} req/", self.rate)?;
        match self.period {
            SECOND => write!(f, "s")?,
            MINUTE => write!(f, "m")?,
            HOUR => write!(f, "h")?,
            period => write!(f, "{period:?}")?,
        }
        write!(f, " (burst {})", self.effective_burst())
    }
}

/// Concurrency limit configuration: at most `max` slots held at the same time.
///
/// A slot that is never released expires after `request_max_duration`
/// (60 seconds when left at zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ConcurrencyLimit {
    /// Maximum number of slots held simultaneously.
    pub max: u64,
    /// How long a slot is held before it expires on its own.
    pub request_max_duration: Duration,
}

impl ConcurrencyLimit {
    /// At most `max` concurrent holders, default slot duration.
    pub fn new(max: u64) -> Self {
        Self {
            max,
            request_max_duration: Duration::ZERO,
        }
    }

    /// Override how long a slot lives without a release.
    pub fn with_request_max_duration(mut self, duration: Duration) -> Self {
        self.request_max_duration = duration;
        self
    }

    /// Slot duration after applying the 60 second default.
    pub fn effective_request_max_duration(&self) -> Duration {
        if self.request_max_duration.is_zero() {
            DEFAULT_REQUEST_MAX_DURATION
        } else {
            self.request_max_duration
        }
    }

    /// Slot duration in whole milliseconds, as handed to the slot script.
    pub(crate) fn request_max_millis(&self) -> Result<u64, AdmissionError> {
        let duration = self.effective_request_max_duration();
        if duration < Duration::from_millis(1) {
            return Err(AdmissionError::InvalidArgument(
                "request max duration must be at least 1ms".to_string(),
            ));
        }

        match u64::try_from(duration.as_millis()) {
            Ok(millis) if millis <= MAX_REQUEST_MAX_MILLIS => Ok(millis),
            _ => Err(AdmissionError::InvalidArgument(format!(
                "request max duration must be at most {MAX_REQUEST_MAX_MILLIS}ms, got {duration:?}"
            ))),
        }
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    /// Limit that was used to obtain this result.
    pub limit: Limit,
    /// Number of units admitted by this call.
    pub allowed: u64,
    /// Units that could still be admitted right now.
    pub remaining: u64,
    /// How long to wait before the refused units could be admitted.
    ///
    /// `None` when nothing was refused.
    pub retry_after: Option<Duration>,
    /// Time until the bucket is fully drained again.
    pub reset_after: Duration,
}

impl RateLimitResult {
    /// Whether at least one unit was admitted.
    pub fn is_allowed(&self) -> bool {
        self.allowed > 0
    }
}

/// Outcome of a concurrency slot acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyResult {
    /// Key the slot was requested for.
    pub key: String,
    /// Limit that was used to obtain this result.
    pub limit: ConcurrencyLimit,
    /// Whether the slot was acquired.
    pub allowed: bool,
    /// Live slots for the key, including the one just acquired.
    pub used: u64,
    /// Slots still free.
    pub remaining: u64,
    /// Best-effort wait before a slot frees up. `None` when the slot was acquired.
    ///
    /// This is the time until the soonest live slot expires on its own, so a holder
    /// that releases early frees capacity sooner.
    pub retry_after: Option<Duration>,
}
