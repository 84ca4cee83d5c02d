//! Time ranges, timestamp precision and the clock used to resolve "now".
//!
//! A [`TimeRange`] keeps exactly what the caller gave it. Missing bounds are
//! derived when asked for, and an open end is resolved against a [`Clock`]
//! at call time, never at construction time. Two resolutions of the same
//! open range can therefore differ.

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::RwLock;

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests.
#[derive(Debug)]
pub struct MockClock {
    now: RwLock<DateTime<Utc>>,
}

impl MockClock {
    pub fn with_time(time: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(time),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.write().unwrap_or_else(|e| e.into_inner());
        *now += duration;
    }

    pub fn set_time(&self, time: DateTime<Utc>) {
        *self.now.write().unwrap_or_else(|e| e.into_inner()) = time;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}

/// Unit in which a backend expresses timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimePrecision {
    S,
    Ms,
    Us,
    Ns,
}

impl Default for TimePrecision {
    fn default() -> Self {
        TimePrecision::S
    }
}

impl TimePrecision {
    fn exponent(self) -> u32 {
        match self {
            TimePrecision::S => 0,
            TimePrecision::Ms => 1,
            TimePrecision::Us => 2,
            TimePrecision::Ns => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimePrecision::S => "s",
            TimePrecision::Ms => "ms",
            TimePrecision::Us => "us",
            TimePrecision::Ns => "ns",
        }
    }

    /// Converts `value` expressed in `self` into `target`.
    ///
    /// Narrowing truncates toward zero, widening saturates at the `i64` bounds.
    pub fn convert(self, value: i64, target: TimePrecision) -> i64 {
        let from = self.exponent();
        let to = target.exponent();
        if to >= from {
            value.saturating_mul(1000_i64.pow(to - from))
        } else {
            value / 1000_i64.pow(from - to)
        }
    }

    /// Timestamp of `instant` in this precision.
    pub fn timestamp(self, instant: DateTime<Utc>) -> i64 {
        match self {
            TimePrecision::S => instant.timestamp(),
            TimePrecision::Ms => instant.timestamp_millis(),
            TimePrecision::Us => instant.timestamp_micros(),
            TimePrecision::Ns => instant.timestamp_nanos_opt().unwrap_or_else(|| {
                TimePrecision::Us.convert(instant.timestamp_micros(), TimePrecision::Ns)
            }),
        }
    }

    /// Instant for a timestamp expressed in this precision.
    pub fn instant(self, value: i64) -> Option<DateTime<Utc>> {
        match self {
            TimePrecision::S => DateTime::from_timestamp(value, 0),
            TimePrecision::Ms => DateTime::from_timestamp_millis(value),
            TimePrecision::Us => DateTime::from_timestamp_micros(value),
            TimePrecision::Ns => Some(DateTime::from_timestamp_nanos(value)),
        }
    }
}

impl FromStr for TimePrecision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "s" | "sec" | "seconds" => Ok(TimePrecision::S),
            "ms" | "milliseconds" => Ok(TimePrecision::Ms),
            "us" | "microseconds" => Ok(TimePrecision::Us),
            "ns" | "nanoseconds" => Ok(TimePrecision::Ns),
            other => Err(Error::Validation(format!("unknown precision '{}'", other))),
        }
    }
}

impl Display for TimePrecision {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clock-free view of a range, used by query builders so compiled output
/// never depends on when compilation happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeShape {
    /// Both bounds are known.
    Absolute {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// Fixed start, open end (now).
    Since { start: DateTime<Utc> },
    /// The trailing `duration` up to now.
    Trailing { duration: Duration },
}

/// Whole seconds covering `duration`, rounded up so a sub-second window
/// never collapses to zero.
pub fn ceil_seconds(duration: Duration) -> i64 {
    let secs = duration.num_seconds();
    if duration > Duration::seconds(secs) {
        secs + 1
    } else {
        secs
    }
}

/// A time range given as any two of start, end and duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeRange {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    duration: Option<Duration>,
}

impl TimeRange {
    pub fn new(
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        duration: Option<Duration>,
    ) -> Result<Self> {
        if let Some(duration) = duration {
            if duration < Duration::zero() {
                return Err(Error::Configuration(format!(
                    "duration must not be negative, got {}",
                    duration
                )));
            }
        }

        let derived_end = match (start, duration) {
            (Some(start), Some(duration)) => Some(start.checked_add_signed(duration).ok_or_else(
                || Error::Configuration("start + duration is out of range".to_string()),
            )?),
            _ => None,
        };
        if let (Some(end), Some(duration)) = (end, duration) {
            end.checked_sub_signed(duration)
                .ok_or_else(|| Error::Configuration("end - duration is out of range".to_string()))?;
        }

        match (start, end, derived_end) {
            (Some(_), Some(end), Some(derived)) if derived != end => {
                return Err(Error::Configuration(
                    "start, end and duration are inconsistent".to_string(),
                ))
            }
            (Some(start), Some(end), _) if start > end => {
                return Err(Error::Configuration(format!(
                    "start {} is after end {}",
                    start, end
                )))
            }
            _ => {}
        }

        Ok(Self {
            start,
            end,
            duration,
        })
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        Self::new(Some(start), Some(end), None)
    }

    pub fn starting_at(start: DateTime<Utc>, duration: Duration) -> Result<Self> {
        Self::new(Some(start), None, Some(duration))
    }

    pub fn ending_at(end: DateTime<Utc>, duration: Duration) -> Result<Self> {
        Self::new(None, Some(end), Some(duration))
    }

    /// The trailing `duration`, ending at resolution time.
    pub fn last(duration: Duration) -> Result<Self> {
        Self::new(None, None, Some(duration))
    }

    /// From `start` up to resolution time.
    pub fn since(start: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: None,
            duration: None,
        }
    }

    pub fn start_bound(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    pub fn end_bound(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn start(&self) -> Result<DateTime<Utc>> {
        self.start_with(&SystemClock)
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end_with(&SystemClock)
    }

    pub fn start_with(&self, clock: &dyn Clock) -> Result<DateTime<Utc>> {
        if let Some(start) = self.start {
            return Ok(start);
        }
        let duration = self.duration.ok_or_else(|| {
            Error::Configuration("cannot resolve start: neither start nor duration given".to_string())
        })?;
        self.end_with(clock)
            .checked_sub_signed(duration)
            .ok_or_else(|| Error::Configuration("end - duration is out of range".to_string()))
    }

    pub fn end_with(&self, clock: &dyn Clock) -> DateTime<Utc> {
        match (self.end, self.start, self.duration) {
            (Some(end), _, _) => end,
            // Representability was checked in `new`.
            (None, Some(start), Some(duration)) => start + duration,
            _ => clock.now(),
        }
    }

    /// Resolves both bounds against `clock` and checks `start <= end`.
    pub fn resolve_with(&self, clock: &dyn Clock) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let end = self.end_with(clock);
        let start = match self.start {
            Some(start) => start,
            None => {
                let duration = self.duration.ok_or_else(|| {
                    Error::Configuration(
                        "cannot resolve start: neither start nor duration given".to_string(),
                    )
                })?;
                end.checked_sub_signed(duration).ok_or_else(|| {
                    Error::Configuration("end - duration is out of range".to_string())
                })?
            }
        };
        if start > end {
            return Err(Error::Configuration(format!(
                "start {} is after end {}",
                start, end
            )));
        }
        Ok((start, end))
    }

    /// Describes the range without consulting a clock.
    pub fn shape(&self) -> Result<RangeShape> {
        match (self.start, self.end, self.duration) {
            (Some(start), Some(end), _) => Ok(RangeShape::Absolute { start, end }),
            (Some(start), None, Some(duration)) => Ok(RangeShape::Absolute {
                start,
                end: start + duration,
            }),
            (None, Some(end), Some(duration)) => Ok(RangeShape::Absolute {
                start: end - duration,
                end,
            }),
            (Some(start), None, None) => Ok(RangeShape::Since { start }),
            (None, None, Some(duration)) => Ok(RangeShape::Trailing { duration }),
            (None, _, None) => Err(Error::Configuration(
                "cannot resolve start: neither start nor duration given".to_string(),
            )),
        }
    }

    /// `Some(true)` when the range is known to be zero-length without a clock.
    pub fn is_empty(&self) -> Option<bool> {
        match self.shape() {
            Ok(RangeShape::Absolute { start, end }) => Some(start == end),
            Ok(RangeShape::Trailing { duration }) => Some(duration == Duration::zero()),
            _ => None,
        }
    }
}
