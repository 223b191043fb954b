use std::fmt::Display;
use std::num::ParseFloatError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A retention time window, inclusive at both ends
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn contains_time(&self, time: f64) -> bool {
        self.start <= time && time <= self.end
    }

    pub fn is_unbounded(&self) -> bool {
        self.start <= 0.0 && self.end == f64::INFINITY
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::new(0.0, f64::INFINITY)
    }
}

impl Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Error)]
pub enum TimeRangeParseError {
    #[error("Failed to parse time range start {0}")]
    MalformedStart(ParseFloatError),
    #[error("Failed to parse time range end {0}")]
    MalformedEnd(ParseFloatError),
}

/// Split `s` on the first space, or failing that the first ':' or '-'
fn split_bounds(s: &str) -> (&str, &str) {
    [' ', ':', '-']
        .into_iter()
        .find_map(|sep| s.split_once(sep))
        .unwrap_or((s, ""))
}

impl FromStr for TimeRange {
    type Err = TimeRangeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = split_bounds(s);
        let (start, end) = (start.trim(), end.trim());
        let start = if start.is_empty() {
            0.0
        } else {
            start.parse().map_err(TimeRangeParseError::MalformedStart)?
        };
        let end = if end.is_empty() {
            f64::INFINITY
        } else {
            end.parse().map_err(TimeRangeParseError::MalformedEnd)?
        };
        Ok(Self::new(start, end))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_time_fromstr() -> Result<(), TimeRangeParseError> {
        let t: TimeRange = "52.0-".parse()?;
        assert_eq!(t, TimeRange::new(52.0, f64::INFINITY));

        let t: TimeRange = "-52.0".parse()?;
        assert_eq!(t, TimeRange::new(0.0, 52.0));

        let t: TimeRange = "32:52.0".parse()?;
        assert_eq!(t, TimeRange::new(32.0, 52.0));
        assert!(t.contains_time(40.0));
        assert!(t.contains_time(52.0));
        assert!(!t.contains_time(60.0));

        let t: TimeRange = "12.5".parse()?;
        assert_eq!(t.start, 12.5);
        assert!(!t.is_unbounded());

        assert!(TimeRange::default().is_unbounded());
        Ok(())
    }

    #[test]
    fn test_time_fromstr_malformed() {
        assert!(matches!(
            "a-".parse::<TimeRange>(),
            Err(TimeRangeParseError::MalformedStart(_))
        ));
        assert!(matches!(
            "-b".parse::<TimeRange>(),
            Err(TimeRangeParseError::MalformedEnd(_))
        ));
        assert!(matches!(
            " a-z".parse::<TimeRange>(),
            Err(TimeRangeParseError::MalformedEnd(_))
        ));
        // Both ends are bad, the start is reported
        assert!(matches!(
            "a-b".parse::<TimeRange>(),
            Err(TimeRangeParseError::MalformedStart(_))
        ));
    }
}
