use std::{num::ParseFloatError, ops::Range, str::FromStr};

use thiserror::Error;

use mzdeadtime::Spectrum;

/// An inclusive scan time window. Open ends are `0` and infinity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, time: f64) -> bool {
        self.start <= time && time <= self.end
    }

    /// Drop every scan of `spectrum` outside of this window
    pub fn restrict(&self, spectrum: &mut Spectrum) {
        spectrum.retain_scans(|scan| self.contains(scan.time))
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: f64::INFINITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TimeRangeParseError {
    #[error("Failed to parse time range start {0}")]
    MalformedStart(ParseFloatError),
    #[error("Failed to parse time range end {0}")]
    MalformedEnd(ParseFloatError),
    #[error("A time range must be denoted (start?)-(stop?), got {0:?}")]
    MissingSeparator(String),
}

fn parse_bound(
    token: &str,
    default: f64,
    err: fn(ParseFloatError) -> TimeRangeParseError,
) -> Result<f64, TimeRangeParseError> {
    let token = token.trim();
    if token.is_empty() {
        Ok(default)
    } else {
        token.parse().map_err(err)
    }
}

impl FromStr for TimeRange {
    type Err = TimeRangeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (start_s, end_s) = [':', '-', ' ']
            .into_iter()
            .find_map(|sep| s.split_once(sep))
            .ok_or_else(|| TimeRangeParseError::MissingSeparator(s.to_string()))?;
        let start = parse_bound(start_s, 0.0, TimeRangeParseError::MalformedStart)?;
        let end = parse_bound(end_s, f64::INFINITY, TimeRangeParseError::MalformedEnd)?;
        Ok(TimeRange { start, end })
    }
}

impl From<Range<f64>> for TimeRange {
    fn from(value: Range<f64>) -> Self {
        Self::new(value.start, value.end)
    }
}
