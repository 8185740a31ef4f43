//! Moving-average crossover prediction over fetched candle tables.
//!
//! The model appends trailing-mean columns (`MAL_{d}DAY`) to a table and
//! derives a buy signal from a majority vote of short-vs-long comparisons
//! over a trailing sub-window.

use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::fetch::{FetchError, Table};
use crate::window::WindowPlan;

pub const DEFAULT_MA_WINDOWS_DAYS: [u32; 5] = [5, 20, 60, 120, 240];
pub const DEFAULT_TARGET_LABEL: &str = "price_close";
pub const DEFAULT_TIMESTAMP_LABEL: &str = "time_period_start";

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("moving averages support hour- or day-granularity data only, got {0}")]
    UnsupportedInterval(&'static str),
    #[error("plan range of {days} days is too short for any moving-average window")]
    RangeTooShort { days: i64 },
    #[error("column {0} not found; call add_moving_averages first if it is a derived column")]
    MissingColumn(String),
    #[error("target time {0} not present in the timestamp column")]
    TargetTimeNotFound(String),
    #[error("fewer than {required} rows precede index {index}")]
    InsufficientHistory { index: usize, required: usize },
    #[error("cross duration must be at least one day")]
    InvalidCrossDuration,
    #[error(transparent)]
    Table(#[from] FetchError),
}

/// Crossover model bound to one fetched table.
///
/// Rows are sorted ascending by the timestamp column at construction so
/// trailing windows always look backwards in time.
#[derive(Debug, Clone)]
pub struct CrossoverModel {
    table: Table,
    units_per_day: u32,
    windows_days: Vec<u32>,
    target_label: String,
    timestamp_label: String,
}

impl CrossoverModel {
    pub fn new(
        mut table: Table,
        plan: &WindowPlan,
        windows_days: &[u32],
        target_label: &str,
        timestamp_label: &str,
    ) -> Result<Self, ModelError> {
        let units_per_day = plan
            .interval()
            .units_per_day()
            .ok_or(ModelError::UnsupportedInterval(plan.interval().period_id()))?;

        let range = plan.end() - plan.start();
        let windows_days: Vec<u32> = windows_days
            .iter()
            .copied()
            .filter(|day| chrono::Duration::days(i64::from(*day)) < range)
            .collect();
        if windows_days.is_empty() {
            return Err(ModelError::RangeTooShort {
                days: range.num_days(),
            });
        }

        for label in [target_label, timestamp_label] {
            if !table.has_column(label) {
                return Err(ModelError::MissingColumn(label.to_string()));
            }
        }

        table.sort_rows_by(timestamp_label);

        Ok(Self {
            table,
            units_per_day,
            windows_days,
            target_label: target_label.to_string(),
            timestamp_label: timestamp_label.to_string(),
        })
    }

    /// Model over a table with the upstream candle labels and the default
    /// moving-average windows.
    pub fn with_defaults(table: Table, plan: &WindowPlan) -> Result<Self, ModelError> {
        Self::new(
            table,
            plan,
            &DEFAULT_MA_WINDOWS_DAYS,
            DEFAULT_TARGET_LABEL,
            DEFAULT_TIMESTAMP_LABEL,
        )
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn into_table(self) -> Table {
        self.table
    }

    /// Appends one `MAL_{d}DAY` column per retained window: the trailing
    /// arithmetic mean over `d × units_per_day` rows of the target column.
    /// Cells stay `Null` until the window is full or while it contains a
    /// non-numeric value.
    pub fn add_moving_averages(&mut self) -> Result<(), ModelError> {
        let prices = self
            .table
            .numeric_column(&self.target_label)
            .ok_or_else(|| ModelError::MissingColumn(self.target_label.clone()))?;

        for day in self.windows_days.clone() {
            let window = (day as usize) * (self.units_per_day as usize);
            let values = trailing_mean(&prices, window);
            self.table.add_column(&mal_label(day), values)?;
        }

        info!(
            component = "crossover_model",
            event = "model.mal.added",
            windows = ?self.windows_days,
            rows = self.table.row_count()
        );

        Ok(())
    }

    /// Majority vote of `short > long` over the trailing comparison window.
    ///
    /// With `target_time` given the vote covers the rows strictly before the
    /// matching row; without it the index defaults to one past the last row,
    /// so the vote covers the trailing rows ending at the most recent one.
    /// An exact true/false tie returns `false` (conservative no-buy).
    pub fn predict(
        &self,
        target_time: Option<&str>,
        short_label: &str,
        long_label: &str,
        cross_duration: u32,
    ) -> Result<bool, ModelError> {
        if cross_duration == 0 {
            return Err(ModelError::InvalidCrossDuration);
        }
        for label in [short_label, long_label] {
            if !self.table.has_column(label) {
                return Err(ModelError::MissingColumn(label.to_string()));
            }
        }

        let duration_index = (self.units_per_day as usize) * (cross_duration as usize) - 1;
        let index = match target_time {
            Some(time) => self.target_index(time)?,
            None => self.table.row_count(),
        };
        if index < duration_index {
            return Err(ModelError::InsufficientHistory {
                index,
                required: duration_index,
            });
        }

        let shorts = self
            .table
            .numeric_column(short_label)
            .ok_or_else(|| ModelError::MissingColumn(short_label.to_string()))?;
        let longs = self
            .table
            .numeric_column(long_label)
            .ok_or_else(|| ModelError::MissingColumn(long_label.to_string()))?;

        let mut above = 0usize;
        let mut below_or_unknown = 0usize;
        for i in (index - duration_index)..index {
            // Null averages compare as false, matching the source semantics.
            let is_above = matches!(
                (shorts.get(i).copied().flatten(), longs.get(i).copied().flatten()),
                (Some(short), Some(long)) if short > long
            );
            if is_above {
                above += 1;
            } else {
                below_or_unknown += 1;
            }
        }

        // Statistical mode with a conservative tie-break: no unique mode
        // means no buy signal.
        let signal = above > below_or_unknown;

        info!(
            component = "crossover_model",
            event = "model.predict",
            short = short_label,
            long = long_label,
            cross_duration,
            above,
            below = below_or_unknown,
            signal
        );

        Ok(signal)
    }

    fn target_index(&self, time: &str) -> Result<usize, ModelError> {
        let timestamps = self
            .table
            .column(&self.timestamp_label)
            .ok_or_else(|| ModelError::MissingColumn(self.timestamp_label.clone()))?;

        timestamps
            .iter()
            .position(|cell| cell.as_str() == Some(time))
            .ok_or_else(|| ModelError::TargetTimeNotFound(time.to_string()))
    }
}

/// Column label for a `d`-day moving average.
pub fn mal_label(day: u32) -> String {
    format!("MAL_{day}DAY")
}

fn trailing_mean(prices: &[Option<f64>], window: usize) -> Vec<Value> {
    let mut out = Vec::with_capacity(prices.len());

    for i in 0..prices.len() {
        if window == 0 || i + 1 < window {
            out.push(Value::Null);
            continue;
        }

        let slice = &prices[i + 1 - window..=i];
        if slice.iter().any(Option::is_none) {
            out.push(Value::Null);
            continue;
        }

        let sum: f64 = slice.iter().flatten().sum();
        out.push(Value::from(sum / window as f64));
    }

    out
}
