//! Expiration bookkeeping for registry entries.
//!
//! Every entry the Registry tracks carries an [`ExpirationDetails`]. The
//! arithmetic is a pure function of wall-clock seconds supplied by a
//! [`Clock`], so sweeps can be driven deterministically in tests.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Source of wall-clock time for the Registry.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;

    /// Seconds since the Unix epoch.
    fn now_seconds(&self) -> u64 {
        self.now_millis() / 1000
    }
}

/// [`Clock`] backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

/// [`Clock`] that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `seconds` past the epoch.
    pub fn at_seconds(seconds: u64) -> Self {
        Self {
            millis: AtomicU64::new(seconds.saturating_mul(1000)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let millis = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    /// Move the clock forward by whole seconds.
    pub fn advance_seconds(&self, seconds: u64) {
        self.advance(Duration::from_secs(seconds));
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Maximum age, last refresh and renewal bookkeeping of one registry entry.
///
/// A `max_age_seconds` of 0 means the entry never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationDetails {
    max_age_seconds: u32,
    last_refresh_seconds: u64,
    renew_attempts: u32,
}

impl ExpirationDetails {
    /// Max-age value meaning "never expires".
    pub const UNLIMITED_AGE: u32 = 0;

    /// Details for an entry refreshed at `now_seconds`.
    pub fn new(max_age_seconds: u32, now_seconds: u64) -> Self {
        Self {
            max_age_seconds,
            last_refresh_seconds: now_seconds,
            renew_attempts: 0,
        }
    }

    /// Details for an entry that never expires.
    pub fn unlimited(now_seconds: u64) -> Self {
        Self::new(Self::UNLIMITED_AGE, now_seconds)
    }

    pub fn max_age_seconds(&self) -> u32 {
        self.max_age_seconds
    }

    pub fn last_refresh_seconds(&self) -> u64 {
        self.last_refresh_seconds
    }

    pub fn renew_attempts(&self) -> u32 {
        self.renew_attempts
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_age_seconds == Self::UNLIMITED_AGE
    }

    /// Reset the refresh timestamp and the renewal counter.
    pub fn stamp(&mut self, now_seconds: u64) {
        self.last_refresh_seconds = now_seconds;
        self.renew_attempts = 0;
    }

    /// Replace the max-age and stamp.
    pub fn refresh(&mut self, max_age_seconds: u32, now_seconds: u64) {
        self.max_age_seconds = max_age_seconds;
        self.stamp(now_seconds);
    }

    /// Record one more renewal attempt.
    pub fn renew_attempted(&mut self) {
        self.renew_attempts = self.renew_attempts.saturating_add(1);
    }

    /// True once `now` is past the deadline, or past half of it when
    /// `half_time` is set.
    pub fn has_expired(&self, half_time: bool, now_seconds: u64) -> bool {
        if self.is_unlimited() {
            return false;
        }
        let window = u64::from(self.max_age_seconds) / if half_time { 2 } else { 1 };
        now_seconds > self.last_refresh_seconds.saturating_add(window)
    }

    /// Seconds left before expiry; negative once expired, `i32::MAX` for
    /// unlimited entries.
    pub fn seconds_until_expiration(&self, now_seconds: u64) -> i32 {
        if self.is_unlimited() {
            return i32::MAX;
        }
        let deadline = i128::from(self.last_refresh_seconds) + i128::from(self.max_age_seconds);
        let remaining = deadline - i128::from(now_seconds);
        remaining.clamp(i128::from(i32::MIN), i128::from(i32::MAX)) as i32
    }
}

impl fmt::Display for ExpirationDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unlimited() {
            write!(f, "(unlimited, refreshed at {})", self.last_refresh_seconds)
        } else {
            write!(
                f,
                "(max age {}s, refreshed at {}, {} renew attempts)",
                self.max_age_seconds, self.last_refresh_seconds, self.renew_attempts
            )
        }
    }
}
