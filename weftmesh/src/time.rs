//! Time types for the weftmesh protocol.
//!
//! These types provide explicit time handling without relying on
//! platform-specific clocks. All time values are passed explicitly,
//! enabling deterministic simulation.
//!
//! Two clock domains exist: the millisecond domain (`Timestamp`,
//! `Duration`) drives MLE timers and retransmission tracking; the
//! microsecond domain (`TimestampUs`, `DurationUs`) is used only for
//! CSL window math, where the radio's clock is the authority.

use core::ops::{Add, AddAssign, Mul, Rem, Sub, SubAssign};

/// Protocol timestamp in milliseconds.
///
/// Wraps a u64 to enforce explicit unit conversions and prevent
/// mixing milliseconds with seconds or other units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Zero timestamp (epoch).
    pub const ZERO: Timestamp = Timestamp(0);

    /// Maximum timestamp.
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    /// Create a timestamp from milliseconds.
    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    /// Create a timestamp from seconds.
    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Timestamp(secs.saturating_mul(1000))
    }

    /// Get the timestamp as milliseconds.
    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Get the timestamp as seconds (truncated).
    #[inline]
    pub const fn as_secs(self) -> u64 {
        self.0 / 1000
    }

    /// Saturating addition of a duration.
    #[inline]
    pub const fn saturating_add(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_add(duration.0))
    }

    /// Saturating subtraction of another timestamp, returning a duration.
    #[inline]
    pub const fn saturating_sub(self, other: Timestamp) -> Duration {
        Duration(self.0.saturating_sub(other.0))
    }

    /// Checked subtraction of another timestamp.
    #[inline]
    pub const fn checked_sub(self, other: Timestamp) -> Option<Duration> {
        match self.0.checked_sub(other.0) {
            Some(d) => Some(Duration(d)),
            None => None,
        }
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    #[inline]
    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs.0)
    }
}

impl AddAssign<Duration> for Timestamp {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0;
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Timestamp) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    #[inline]
    fn sub(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 - rhs.0)
    }
}

/// Duration in milliseconds.
///
/// Represents a time span, not a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(u64);

impl Duration {
    /// Zero duration.
    pub const ZERO: Duration = Duration(0);

    /// Maximum duration.
    pub const MAX: Duration = Duration(u64::MAX);

    /// Create a duration from milliseconds.
    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Duration(ms)
    }

    /// Create a duration from seconds.
    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Duration(secs.saturating_mul(1000))
    }

    /// Get the duration as milliseconds.
    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Get the duration as seconds (truncated).
    #[inline]
    pub const fn as_secs(self) -> u64 {
        self.0 / 1000
    }

    /// Saturating addition.
    #[inline]
    pub const fn saturating_add(self, other: Duration) -> Self {
        Duration(self.0.saturating_add(other.0))
    }

    /// Saturating subtraction.
    #[inline]
    pub const fn saturating_sub(self, other: Duration) -> Self {
        Duration(self.0.saturating_sub(other.0))
    }

    /// Saturating multiplication.
    #[inline]
    pub const fn saturating_mul(self, n: u64) -> Self {
        Duration(self.0.saturating_mul(n))
    }
}

impl Add for Duration {
    type Output = Duration;

    #[inline]
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl AddAssign for Duration {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0;
    }
}

impl Sub for Duration {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl SubAssign for Duration {
    #[inline]
    fn sub_assign(&mut self, rhs: Duration) {
        self.0 -= rhs.0;
    }
}

impl Mul<u64> for Duration {
    type Output = Duration;

    #[inline]
    fn mul(self, rhs: u64) -> Duration {
        Duration(self.0 * rhs)
    }
}

/// Radio timestamp in microseconds.
///
/// Values come from `Radio::now_us` and frame rx/tx timestamps. CSL
/// windows are computed entirely in this domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimestampUs(u64);

impl TimestampUs {
    /// Zero timestamp.
    pub const ZERO: TimestampUs = TimestampUs(0);

    /// Create a timestamp from microseconds.
    #[inline]
    pub const fn from_us(us: u64) -> Self {
        TimestampUs(us)
    }

    /// Get the timestamp as microseconds.
    #[inline]
    pub const fn as_us(self) -> u64 {
        self.0
    }

    /// Saturating subtraction of another timestamp, returning a duration.
    #[inline]
    pub const fn saturating_sub(self, other: TimestampUs) -> DurationUs {
        DurationUs(self.0.saturating_sub(other.0))
    }
}

impl Add<DurationUs> for TimestampUs {
    type Output = TimestampUs;

    #[inline]
    fn add(self, rhs: DurationUs) -> TimestampUs {
        TimestampUs(self.0 + rhs.0)
    }
}

impl AddAssign<DurationUs> for TimestampUs {
    #[inline]
    fn add_assign(&mut self, rhs: DurationUs) {
        self.0 += rhs.0;
    }
}

impl Sub for TimestampUs {
    type Output = DurationUs;

    #[inline]
    fn sub(self, rhs: TimestampUs) -> DurationUs {
        DurationUs(self.0 - rhs.0)
    }
}

impl Sub<DurationUs> for TimestampUs {
    type Output = TimestampUs;

    #[inline]
    fn sub(self, rhs: DurationUs) -> TimestampUs {
        TimestampUs(self.0 - rhs.0)
    }
}

impl Rem<DurationUs> for TimestampUs {
    type Output = DurationUs;

    #[inline]
    fn rem(self, rhs: DurationUs) -> DurationUs {
        DurationUs(self.0 % rhs.0)
    }
}

/// Duration in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DurationUs(u64);

impl DurationUs {
    /// Zero duration.
    pub const ZERO: DurationUs = DurationUs(0);

    /// Maximum duration.
    pub const MAX: DurationUs = DurationUs(u64::MAX);

    /// Create a duration from microseconds.
    #[inline]
    pub const fn from_us(us: u64) -> Self {
        DurationUs(us)
    }

    /// Create a duration from milliseconds.
    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        DurationUs(ms.saturating_mul(1000))
    }

    /// Get the duration as microseconds.
    #[inline]
    pub const fn as_us(self) -> u64 {
        self.0
    }

    /// Get the duration as whole milliseconds (truncated).
    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.0 / 1000
    }

    /// Saturating addition.
    #[inline]
    pub const fn saturating_add(self, other: DurationUs) -> Self {
        DurationUs(self.0.saturating_add(other.0))
    }

    /// Saturating subtraction.
    #[inline]
    pub const fn saturating_sub(self, other: DurationUs) -> Self {
        DurationUs(self.0.saturating_sub(other.0))
    }
}

impl Add for DurationUs {
    type Output = DurationUs;

    #[inline]
    fn add(self, rhs: DurationUs) -> DurationUs {
        DurationUs(self.0 + rhs.0)
    }
}

impl Sub for DurationUs {
    type Output = DurationUs;

    #[inline]
    fn sub(self, rhs: DurationUs) -> DurationUs {
        DurationUs(self.0 - rhs.0)
    }
}

impl Mul<u64> for DurationUs {
    type Output = DurationUs;

    #[inline]
    fn mul(self, rhs: u64) -> DurationUs {
        DurationUs(self.0 * rhs)
    }
}
