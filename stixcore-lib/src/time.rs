//! Spacecraft elapsed time (SCET) and its conversion to civil time.
//!
//! The instrument clock counts `coarse` seconds and `fine` 1/65536 second ticks since the
//! mission clock zero. Bit 31 of `coarse` is set by the instrument when the clock has not yet
//! been synchronized with the spacecraft.
//!
//! Civil (UTC) conversions go through a [TimeService]. The reference [LinearClock] maps the
//! clock zero to a fixed epoch with no drift correction; kernel based conversions are expected
//! to be provided by another [TimeService] implementation.
use std::fmt::{self, Display};
use std::ops::{Add, Div, Mul, Sub};
use std::str::FromStr;

use hifitime::{Epoch, Unit};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Number of seconds in an instrument clock day.
pub const SEC_IN_DAY: u32 = 86_400;
/// Set on `coarse` times that were generated before clock synchronization.
pub const UNSYNCED_FLAG: u32 = 1 << 31;

const FINE_BITS: u32 = 16;
const TICKS_PER_SECOND: f64 = 65_536.0;
/// Default mission clock zero, `1/0000000000:00000`.
pub const DEFAULT_CLOCK_EPOCH: &str = "2000-01-01T00:00:00 UTC";

/// A point on the instrument clock stored as 1/65536 second ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ScetTime(u64);

impl ScetTime {
    pub const MIN: ScetTime = ScetTime(0);
    pub const MAX: ScetTime = ScetTime(((u32::MAX as u64) << FINE_BITS) | 0xffff);

    #[must_use]
    pub fn new(coarse: u32, fine: u16) -> Self {
        Self((u64::from(coarse) << FINE_BITS) | u64::from(fine))
    }

    #[must_use]
    pub fn from_ticks(ticks: u64) -> Self {
        Self(ticks.min(Self::MAX.0))
    }

    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn coarse(&self) -> u32 {
        (self.0 >> FINE_BITS) as u32
    }

    #[must_use]
    pub fn fine(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// Create from a number of seconds, rounded to the nearest fine tick. Negative values clamp
    /// to zero.
    #[must_use]
    pub fn from_float(seconds: f64) -> Self {
        if !seconds.is_finite() || seconds <= 0.0 {
            return Self::MIN;
        }
        Self::from_ticks((seconds * TICKS_PER_SECOND).round() as u64)
    }

    #[must_use]
    pub fn as_float(&self) -> f64 {
        self.0 as f64 / TICKS_PER_SECOND
    }

    /// Instrument clock day number.
    #[must_use]
    pub fn sceday(&self) -> u32 {
        self.coarse() / SEC_IN_DAY
    }
}

impl Display for ScetTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010}:{:05}", self.coarse(), self.fine())
    }
}

impl FromStr for ScetTime {
    type Err = Error;

    /// Parses `coarse:fine`, optionally prefixed with a clock reset counter as in `1/coarse:fine`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.rsplit('/').next().unwrap_or(s).trim();
        let (coarse, fine) = s.split_once(':').unwrap_or((s, "0"));
        let coarse = coarse
            .parse::<u32>()
            .map_err(|e| Error::Time(format!("invalid coarse time {coarse:?}: {e}")))?;
        let fine = fine
            .parse::<u16>()
            .map_err(|e| Error::Time(format!("invalid fine time {fine:?}: {e}")))?;
        Ok(Self::new(coarse, fine))
    }
}

/// Signed duration on the instrument clock in 1/65536 second ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ScetDelta(i64);

impl ScetDelta {
    pub const ZERO: ScetDelta = ScetDelta(0);

    #[must_use]
    pub fn from_ticks(ticks: i64) -> Self {
        Self(ticks)
    }

    #[must_use]
    pub fn ticks(&self) -> i64 {
        self.0
    }

    #[must_use]
    pub fn from_seconds(seconds: f64) -> Self {
        Self((seconds * TICKS_PER_SECOND).round() as i64)
    }

    #[must_use]
    pub fn as_seconds(&self) -> f64 {
        self.0 as f64 / TICKS_PER_SECOND
    }
}

impl Add<ScetDelta> for ScetTime {
    type Output = ScetTime;

    fn add(self, rhs: ScetDelta) -> ScetTime {
        let ticks = i128::from(self.0) + i128::from(rhs.0);
        ScetTime::from_ticks(ticks.clamp(0, i128::from(ScetTime::MAX.0)) as u64)
    }
}

impl Sub<ScetDelta> for ScetTime {
    type Output = ScetTime;

    fn sub(self, rhs: ScetDelta) -> ScetTime {
        self + ScetDelta(-rhs.0)
    }
}

impl Sub for ScetTime {
    type Output = ScetDelta;

    fn sub(self, rhs: ScetTime) -> ScetDelta {
        ScetDelta(self.0 as i64 - rhs.0 as i64)
    }
}

impl Add for ScetDelta {
    type Output = ScetDelta;

    fn add(self, rhs: ScetDelta) -> ScetDelta {
        ScetDelta(self.0 + rhs.0)
    }
}

impl Mul<i64> for ScetDelta {
    type Output = ScetDelta;

    fn mul(self, rhs: i64) -> ScetDelta {
        ScetDelta(self.0 * rhs)
    }
}

impl Div<i64> for ScetDelta {
    type Output = ScetDelta;

    fn div(self, rhs: i64) -> ScetDelta {
        ScetDelta(self.0 / rhs)
    }
}

/// Closed time interval on the instrument clock.
///
/// The default range is empty. [expand](ScetTimeRange::expand) only ever grows a range, so the
/// coverage recorded for an IDB version never shrinks as more packets are seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScetTimeRange {
    pub start: ScetTime,
    pub end: ScetTime,
}

impl Default for ScetTimeRange {
    fn default() -> Self {
        Self {
            start: ScetTime::MAX,
            end: ScetTime::MIN,
        }
    }
}

impl ScetTimeRange {
    #[must_use]
    pub fn new(start: ScetTime, end: ScetTime) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    /// Enlarge this range to also cover `other`. Expanding by an empty range is a no-op.
    pub fn expand(&mut self, other: &ScetTimeRange) {
        if other.is_empty() {
            return;
        }
        self.start = self.start.min(other.start);
        self.end = self.end.max(other.end);
    }

    pub fn expand_time(&mut self, time: ScetTime) {
        self.expand(&ScetTimeRange::new(time, time));
    }

    #[must_use]
    pub fn covers(&self, other: &ScetTimeRange) -> bool {
        other.is_empty() || (!self.is_empty() && self.start <= other.start && self.end >= other.end)
    }

    #[must_use]
    pub fn contains(&self, time: ScetTime) -> bool {
        self.start <= time && time <= self.end
    }
}

impl Display for ScetTimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "ScetTimeRange{{empty}}");
        }
        write!(f, "{} to {}", self.start, self.end)
    }
}

/// A UTC calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtcDay {
    pub year: i32,
    pub month: u8,
    pub day: u8,
}

impl UtcDay {
    #[must_use]
    pub fn from_epoch(epoch: Epoch) -> Self {
        let (year, month, day, ..) = epoch.to_gregorian_utc();
        Self { year, month, day }
    }

    /// Midnight starting this day.
    #[must_use]
    pub fn start(&self) -> Epoch {
        Epoch::from_gregorian_utc_at_midnight(self.year, self.month, self.day)
    }

    /// Midnight starting the next day (exclusive end).
    #[must_use]
    pub fn end(&self) -> Epoch {
        self.start() + Unit::Day * 1_i64
    }

    #[must_use]
    pub fn contains(&self, epoch: Epoch) -> bool {
        self.start() <= epoch && epoch < self.end()
    }
}

impl Display for UtcDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}{:02}{:02}", self.year, self.month, self.day)
    }
}

/// Conversion between the instrument clock and civil time.
pub trait TimeService: Send + Sync {
    fn scet_to_utc(&self, time: ScetTime) -> Epoch;

    /// # Errors
    /// [Error::Time] if `utc` is not representable on the instrument clock.
    fn utc_to_scet(&self, utc: Epoch) -> Result<ScetTime>;

    fn utc_day(&self, time: ScetTime) -> UtcDay {
        UtcDay::from_epoch(self.scet_to_utc(time))
    }
}

/// Maps the clock zero to a fixed UTC epoch without drift or leap second correction.
#[derive(Debug, Clone, Copy)]
pub struct LinearClock {
    epoch: Epoch,
}

impl LinearClock {
    #[must_use]
    pub fn new(epoch: Epoch) -> Self {
        Self { epoch }
    }

    /// Create from a clock zero formatted as hifitime accepts, e.g., `2000-01-01T00:00:00 UTC`.
    ///
    /// # Errors
    /// [Error::Config] if `epoch` cannot be parsed.
    pub fn parse(epoch: &str) -> Result<Self> {
        let epoch = Epoch::from_str(epoch)
            .map_err(|e| Error::Config(format!("invalid clock epoch {epoch:?}: {e}")))?;
        Ok(Self::new(epoch))
    }

    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }
}

impl Default for LinearClock {
    fn default() -> Self {
        Self::new(Epoch::from_gregorian_utc_at_midnight(2000, 1, 1))
    }
}

impl TimeService for LinearClock {
    fn scet_to_utc(&self, time: ScetTime) -> Epoch {
        self.epoch + Unit::Second * time.as_float()
    }

    fn utc_to_scet(&self, utc: Epoch) -> Result<ScetTime> {
        let seconds = (utc - self.epoch).to_seconds();
        if seconds < 0.0 || seconds > ScetTime::MAX.as_float() {
            return Err(Error::Time(format!(
                "{utc} is outside of the instrument clock range"
            )));
        }
        Ok(ScetTime::from_float(seconds))
    }
}
