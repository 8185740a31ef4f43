//! Calendar-aware fetch window planning.
//!
//! A [`WindowPlan`] partitions a date range into fixed-size fetch windows so
//! that each remote request stays under the per-request row limit. Month
//! stepping follows real calendar months, not fixed 30-day blocks.

use chrono::{Duration as ChronoDuration, Months, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Format accepted for plan boundaries (CLI and config input).
pub const WINDOW_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

/// Fixed offset appended to string-formatted window bounds (KST).
pub const KST_SUFFIX: &str = "+09:00";

const BOUND_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    Hour,
    Day,
    Month,
}

impl Interval {
    pub fn parse(input: &str) -> Result<Self, WindowError> {
        match input {
            "HOUR" => Ok(Self::Hour),
            "DAY" => Ok(Self::Day),
            "MONTH" => Ok(Self::Month),
            other => Err(WindowError::UnsupportedInterval(other.to_string())),
        }
    }

    /// Upstream period tag used as the `period_id` query parameter.
    pub fn period_id(self) -> &'static str {
        match self {
            Self::Hour => "1HRS",
            Self::Day => "1DAY",
            Self::Month => "1MTH",
        }
    }

    /// Rows per calendar day at this granularity. Month-granularity data has
    /// no fixed row count per day.
    pub fn units_per_day(self) -> Option<u32> {
        match self {
            Self::Hour => Some(24),
            Self::Day => Some(1),
            Self::Month => None,
        }
    }

    fn advance(self, from: NaiveDateTime, steps: u32) -> NaiveDateTime {
        match self {
            Self::Hour => from
                .checked_add_signed(ChronoDuration::hours(i64::from(steps)))
                .expect("window cursor advance should not overflow"),
            Self::Day => from
                .checked_add_signed(ChronoDuration::days(i64::from(steps)))
                .expect("window cursor advance should not overflow"),
            Self::Month => from
                .checked_add_months(Months::new(steps))
                .expect("window cursor advance should not overflow"),
        }
    }
}

/// How far the cursor moves past each emitted window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStride {
    /// Advance by `batch_size + 1` units, leaving a one-unit gap between
    /// consecutive windows. This matches the upstream collector's observed
    /// behavior and is the default.
    Gapped,
    /// Advance by exactly `batch_size` units so windows tile the range.
    Contiguous,
}

/// One `(start, end)` sub-range of the overall plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl FetchWindow {
    /// String bounds at seconds precision, optionally KST-suffixed the way
    /// the candle API expects them.
    pub fn bounds_strings(&self, timezone: bool) -> (String, String) {
        if timezone {
            (format_bound(self.start), format_bound(self.end))
        } else {
            (
                self.start.format(BOUND_FORMAT).to_string(),
                self.end.format(BOUND_FORMAT).to_string(),
            )
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("batch size must be greater than zero")]
    InvalidBatchSize,
    #[error("unsupported interval: {0}")]
    UnsupportedInterval(String),
    #[error("start must not be later than end, got start: {start}, end: {end}")]
    InvertedRange {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
    #[error("timestamp '{value}' does not match format {format}")]
    ParseTimestamp { value: String, format: &'static str },
}

/// A restartable, finite plan of fetch windows over `[start, end]`.
///
/// The cursor is an explicit mutable field owned by one consumer at a time;
/// exhausting the plan resets the cursor so the identical sequence can be
/// iterated again. Do not share one plan across concurrent fetch operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowPlan {
    start: NaiveDateTime,
    end: NaiveDateTime,
    interval: Interval,
    batch_size: u32,
    stride: WindowStride,
    kst_strings: bool,
    cursor: NaiveDateTime,
}

impl WindowPlan {
    pub fn new(
        start: NaiveDateTime,
        end: NaiveDateTime,
        interval: Interval,
        batch_size: u32,
    ) -> Result<Self, WindowError> {
        if batch_size == 0 {
            return Err(WindowError::InvalidBatchSize);
        }
        if end < start {
            return Err(WindowError::InvertedRange { start, end });
        }

        Ok(Self {
            start,
            end,
            interval,
            batch_size,
            stride: WindowStride::Gapped,
            kst_strings: true,
            cursor: start,
        })
    }

    /// Builds a plan from `%Y-%m-%dT%H:%M` boundary strings.
    pub fn parse(
        start: &str,
        end: &str,
        interval: Interval,
        batch_size: u32,
    ) -> Result<Self, WindowError> {
        let start_dt = parse_plan_bound(start)?;
        let end_dt = parse_plan_bound(end)?;
        Self::new(start_dt, end_dt, interval, batch_size)
    }

    pub fn with_stride(mut self, stride: WindowStride) -> Self {
        self.stride = stride;
        self
    }

    /// Controls whether downstream request builders format this plan's
    /// windows as KST strings. The futures pipeline requires instant-typed
    /// bounds and rejects plans with this left on.
    pub fn with_kst_strings(mut self, kst_strings: bool) -> Self {
        self.kst_strings = kst_strings;
        self
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    pub fn end(&self) -> NaiveDateTime {
        self.end
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    pub fn kst_strings(&self) -> bool {
        self.kst_strings
    }

    /// Overall plan bounds as strings, optionally KST-suffixed.
    pub fn bounds_strings(&self, timezone: bool) -> (String, String) {
        if timezone {
            (format_bound(self.start), format_bound(self.end))
        } else {
            (
                self.start.format(BOUND_FORMAT).to_string(),
                self.end.format(BOUND_FORMAT).to_string(),
            )
        }
    }

    /// The short trial window used for the schema probe.
    pub fn probe_window(&self, steps: u32) -> FetchWindow {
        FetchWindow {
            start: self.start,
            end: self.interval.advance(self.start, steps),
        }
    }

    /// Emits the next window, or `None` once the cursor passes `end`.
    /// Exhaustion resets the cursor to `start`.
    pub fn next_window(&mut self) -> Option<FetchWindow> {
        if self.cursor >= self.end {
            self.cursor = self.start;
            return None;
        }

        let start = self.cursor;
        let step = match self.stride {
            WindowStride::Gapped => self.batch_size + 1,
            WindowStride::Contiguous => self.batch_size,
        };
        self.cursor = self.interval.advance(start, step);

        let mut end = self.interval.advance(start, self.batch_size);
        if end > self.end {
            end = self.end;
        }

        Some(FetchWindow { start, end })
    }
}

impl Iterator for WindowPlan {
    type Item = FetchWindow;

    fn next(&mut self) -> Option<FetchWindow> {
        self.next_window()
    }
}

/// Formats an instant as an ISO-8601 string with the fixed `+09:00` offset.
pub fn format_bound(dt: NaiveDateTime) -> String {
    format!("{}{}", dt.format(BOUND_FORMAT), KST_SUFFIX)
}

/// Parses a bound produced by [`format_bound`] back into an instant.
pub fn parse_bound(value: &str) -> Result<NaiveDateTime, WindowError> {
    let trimmed = value.strip_suffix(KST_SUFFIX).unwrap_or(value);
    NaiveDateTime::parse_from_str(trimmed, BOUND_FORMAT).map_err(|_| {
        WindowError::ParseTimestamp {
            value: value.to_string(),
            format: BOUND_FORMAT,
        }
    })
}

fn parse_plan_bound(value: &str) -> Result<NaiveDateTime, WindowError> {
    NaiveDateTime::parse_from_str(value, WINDOW_TIME_FORMAT).map_err(|_| {
        WindowError::ParseTimestamp {
            value: value.to_string(),
            format: WINDOW_TIME_FORMAT,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(start: &str, end: &str, interval: Interval, batch_size: u32) -> WindowPlan {
        WindowPlan::parse(start, end, interval, batch_size).expect("plan should build")
    }

    fn dt(value: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M").expect("valid test datetime")
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = WindowPlan::parse("2020-01-01T00:00", "2020-02-01T00:00", Interval::Day, 0)
            .unwrap_err();
        assert_eq!(err, WindowError::InvalidBatchSize);
    }

    #[test]
    fn inverted_range_is_rejected() {
        let err = WindowPlan::parse("2020-02-01T00:00", "2020-01-01T00:00", Interval::Day, 1)
            .unwrap_err();
        assert!(matches!(err, WindowError::InvertedRange { .. }));
    }

    #[test]
    fn unsupported_interval_name_is_rejected() {
        let err = Interval::parse("WEEK").unwrap_err();
        assert_eq!(err, WindowError::UnsupportedInterval("WEEK".to_string()));
    }

    #[test]
    fn malformed_boundary_string_is_rejected() {
        let err = WindowPlan::parse("2020/01/01", "2020-02-01T00:00", Interval::Day, 1).unwrap_err();
        assert!(matches!(err, WindowError::ParseTimestamp { .. }));
    }

    #[test]
    fn monthly_gapped_plan_matches_upstream_sequence() {
        // Documented upstream behavior: batch_size 1 with the gapped stride
        // skips one month between windows and clips the final window.
        let mut plan = plan("2020-01-01T00:00", "2021-01-02T00:00", Interval::Month, 1);

        let expected = [
            ("2020-01-01T00:00", "2020-02-01T00:00"),
            ("2020-03-01T00:00", "2020-04-01T00:00"),
            ("2020-05-01T00:00", "2020-06-01T00:00"),
            ("2020-07-01T00:00", "2020-08-01T00:00"),
            ("2020-09-01T00:00", "2020-10-01T00:00"),
            ("2020-11-01T00:00", "2020-12-01T00:00"),
            ("2021-01-01T00:00", "2021-01-02T00:00"),
        ];

        for (start, end) in expected {
            let window = plan.next_window().expect("window expected");
            assert_eq!(window.start, dt(start));
            assert_eq!(window.end, dt(end));
        }
        assert!(plan.next_window().is_none());
    }

    #[test]
    fn contiguous_daily_plan_tiles_the_range() {
        let mut plan = plan("2020-01-01T00:00", "2020-01-10T00:00", Interval::Day, 3)
            .with_stride(WindowStride::Contiguous);

        let first = plan.next_window().expect("first window expected");
        assert_eq!(first.start, dt("2020-01-01T00:00"));
        assert_eq!(first.end, dt("2020-01-04T00:00"));

        let second = plan.next_window().expect("second window expected");
        assert_eq!(second.start, dt("2020-01-04T00:00"));
        assert_eq!(second.end, dt("2020-01-07T00:00"));

        let third = plan.next_window().expect("third window expected");
        assert_eq!(third.start, dt("2020-01-07T00:00"));
        assert_eq!(third.end, dt("2020-01-10T00:00"));

        assert!(plan.next_window().is_none());
    }

    #[test]
    fn first_window_starts_at_start_and_final_window_ends_at_end() {
        for stride in [WindowStride::Gapped, WindowStride::Contiguous] {
            let mut plan = plan("2023-07-01T00:00", "2023-07-25T00:00", Interval::Hour, 50)
                .with_stride(stride);

            let windows: Vec<FetchWindow> = plan.by_ref().collect();
            assert!(!windows.is_empty());
            assert_eq!(windows[0].start, dt("2023-07-01T00:00"));
            assert_eq!(
                windows.last().expect("at least one window").end,
                dt("2023-07-25T00:00")
            );

            let mut previous_end = windows[0].end;
            for window in &windows[1..] {
                assert!(window.end >= previous_end);
                previous_end = window.end;
            }
        }
    }

    #[test]
    fn exhausted_plan_restarts_with_identical_sequence() {
        let mut plan = plan("2020-01-01T00:00", "2020-03-15T00:00", Interval::Day, 7);

        let first_pass: Vec<FetchWindow> = plan.by_ref().collect();
        let second_pass: Vec<FetchWindow> = plan.by_ref().collect();

        assert!(!first_pass.is_empty());
        assert_eq!(first_pass, second_pass);
    }

    #[test]
    fn period_tags_match_upstream_identifiers() {
        assert_eq!(Interval::Hour.period_id(), "1HRS");
        assert_eq!(Interval::Day.period_id(), "1DAY");
        assert_eq!(Interval::Month.period_id(), "1MTH");
    }

    #[test]
    fn bound_formatting_round_trips() {
        let instant = dt("2023-07-01T12:30");
        let formatted = format_bound(instant);
        assert_eq!(formatted, "2023-07-01T12:30:00+09:00");
        assert_eq!(parse_bound(&formatted).unwrap(), instant);
    }

    #[test]
    fn probe_window_spans_two_unit_steps() {
        let plan = plan("2020-01-01T00:00", "2020-06-01T00:00", Interval::Month, 5);
        let probe = plan.probe_window(2);
        assert_eq!(probe.start, dt("2020-01-01T00:00"));
        assert_eq!(probe.end, dt("2020-03-01T00:00"));
    }

    #[test]
    fn plan_bounds_strings_carry_optional_timezone() {
        let plan = plan("2020-01-01T00:00", "2020-01-02T00:00", Interval::Day, 1);
        let (start, end) = plan.bounds_strings(true);
        assert_eq!(start, "2020-01-01T00:00:00+09:00");
        assert_eq!(end, "2020-01-02T00:00:00+09:00");

        let (start, end) = plan.bounds_strings(false);
        assert_eq!(start, "2020-01-01T00:00:00");
        assert_eq!(end, "2020-01-02T00:00:00");
    }
}
