//! Per-source traversal schedule.
//!
//! A schedule says when a source may run (hour-granular intervals), whether
//! it is disabled, and how long to wait after a traversal drains all
//! available work. The string form
//! `[#]id:load:retryDelayMillis:start-end[:start-end...]` is accepted for
//! convenience; a leading `#` marks the schedule disabled.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TraversalError};

/// Retry delay sentinel meaning "disable the source once it has drained".
pub const POLLING_DISABLED: i64 = -1;

/// Retry delay used when a schedule string omits one.
pub const DEFAULT_RETRY_DELAY_MILLIS: i64 = 5 * 60 * 1000;

/// A half-open range of hours `[start_hour, end_hour)` in local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTimeInterval {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl ScheduleTimeInterval {
    /// Create an interval. Both hours must be in `0..=24`.
    pub fn new(start_hour: u32, end_hour: u32) -> Result<Self> {
        if start_hour > 24 || end_hour > 24 {
            return Err(TraversalError::InvalidSchedule(format!(
                "interval {}-{} outside 0-24",
                start_hour, end_hour
            )));
        }
        Ok(Self { start_hour, end_hour })
    }

    /// The whole day.
    pub fn all_day() -> Self {
        Self {
            start_hour: 0,
            end_hour: 24,
        }
    }

    /// Check whether `hour` (0-23) falls inside this interval.
    ///
    /// An end hour of 0 means midnight (24). When the end precedes the start
    /// the interval wraps over midnight.
    pub fn contains_hour(&self, hour: u32) -> bool {
        let start = self.start_hour % 24;
        let end = if self.end_hour == 0 { 24 } else { self.end_hour };

        if end < start {
            hour >= start || hour < end
        } else {
            hour >= start && hour < end
        }
    }
}

impl fmt::Display for ScheduleTimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start_hour, self.end_hour)
    }
}

impl FromStr for ScheduleTimeInterval {
    type Err = TraversalError;

    fn from_str(s: &str) -> Result<Self> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| TraversalError::InvalidSchedule(format!("bad interval '{}'", s)))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| TraversalError::InvalidSchedule(format!("bad hour '{}' in '{}'", v, s)))
        };
        Self::new(parse(start)?, parse(end)?)
    }
}

/// Schedule for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// Unique source identifier
    pub source_id: String,
    /// Whether scheduling is switched off for this source
    pub disabled: bool,
    /// Preferred batch size; 0 leaves the hint to the load manager alone
    pub load: usize,
    /// Delay after a POLL outcome, or [`POLLING_DISABLED`]
    pub retry_delay_millis: i64,
    /// When the source may run
    pub intervals: Vec<ScheduleTimeInterval>,
}

impl Schedule {
    pub fn new(
        source_id: impl Into<String>,
        load: usize,
        retry_delay_millis: i64,
        intervals: Vec<ScheduleTimeInterval>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            disabled: false,
            load,
            retry_delay_millis,
            intervals,
        }
    }

    /// A schedule that is always open, with the default retry delay.
    pub fn always(source_id: impl Into<String>, load: usize) -> Self {
        Self::new(
            source_id,
            load,
            DEFAULT_RETRY_DELAY_MILLIS,
            vec![ScheduleTimeInterval::all_day()],
        )
    }

    pub fn with_retry_delay_millis(mut self, retry_delay_millis: i64) -> Self {
        self.retry_delay_millis = retry_delay_millis;
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// True when a drained traversal should disable the source.
    pub fn is_polling_disabled(&self) -> bool {
        self.retry_delay_millis == POLLING_DISABLED
    }

    /// Cooldown after a POLL outcome. `None` means the source should be
    /// disabled instead; other negative values are treated as no delay.
    pub fn retry_delay(&self) -> Option<Duration> {
        if self.is_polling_disabled() {
            None
        } else {
            Some(Duration::from_millis(self.retry_delay_millis.max(0) as u64))
        }
    }

    /// Check whether `hour` (0-23) is inside any of the intervals.
    pub fn in_interval(&self, hour: u32) -> bool {
        self.intervals.iter().any(|i| i.contains_hour(hour))
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.disabled {
            write!(f, "#")?;
        }
        write!(f, "{}:{}:{}", self.source_id, self.load, self.retry_delay_millis)?;
        for interval in &self.intervals {
            write!(f, ":{}", interval)?;
        }
        Ok(())
    }
}

impl FromStr for Schedule {
    type Err = TraversalError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (disabled, body) = match s.strip_prefix('#') {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let mut fields = body.split(':');
        let source_id = fields
            .next()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TraversalError::InvalidSchedule(format!("missing source id in '{}'", s)))?;
        let load = fields
            .next()
            .ok_or_else(|| TraversalError::InvalidSchedule(format!("missing load in '{}'", s)))?
            .parse::<usize>()
            .map_err(|_| TraversalError::InvalidSchedule(format!("bad load in '{}'", s)))?;

        let rest: Vec<&str> = fields.collect();
        // Older strings carry no delay field; the third field is then an interval.
        let (retry_delay_millis, interval_fields) = match rest.first() {
            Some(first) => match first.parse::<i64>() {
                Ok(delay) => (delay, &rest[1..]),
                Err(_) => (DEFAULT_RETRY_DELAY_MILLIS, &rest[..]),
            },
            None => (DEFAULT_RETRY_DELAY_MILLIS, &rest[..]),
        };

        let intervals = interval_fields
            .iter()
            .filter(|f| !f.is_empty())
            .map(|f| f.parse())
            .collect::<Result<Vec<ScheduleTimeInterval>>>()?;

        Ok(Self {
            source_id: source_id.to_string(),
            disabled,
            load,
            retry_delay_millis,
            intervals,
        })
    }
}
