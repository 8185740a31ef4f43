//! Resilient paginated candle fetching.
//!
//! One probe request discovers the response schema, then one request per
//! window accumulates rows into a columnar [`Table`]. Any failure after the
//! probe stops the loop but still returns everything accumulated so far; the
//! cause is carried on the [`FetchOutcome`] instead of being re-raised.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::Write;

use chrono::NaiveDateTime;
use rand::Rng;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::{build_url, ClientError, GatewayResponse, HttpGateway, RemoteSource};
use crate::window::{FetchWindow, Interval, WindowPlan};

/// CoinAPI OHLCV history endpoint for the BTC/USD spot market.
pub const CANDLE_HISTORY_PATH: &str = "v1/ohlcv/BITSTAMP_SPOT_BTC_USD/history";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    /// Minimum blocking delay before each remote call.
    pub min_delay_ms: u64,
    /// Upper bound of the random jitter added to the minimum delay.
    pub delay_jitter_ms: u64,
    /// Unit-steps covered by the schema probe window.
    pub probe_steps: u32,
    /// API path for the candle history endpoint.
    pub market_path: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 100,
            delay_jitter_ms: 150,
            probe_steps: 2,
            market_path: CANDLE_HISTORY_PATH.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("remote response error (status {status}): {body}")]
    RemoteResponse { status: u16, body: String },
    #[error("probe returned no rows; cannot derive a response schema")]
    EmptyProbe,
    #[error("empty data received for window starting {window_start}")]
    EmptyWindow { window_start: NaiveDateTime },
    #[error("response body is not a JSON array of objects: {0}")]
    MalformedBody(String),
    #[error("futures fetch supports 1DAY windows only, got {0}")]
    UnsupportedInterval(&'static str),
    #[error("futures fetch requires instant window bounds; disable KST string output on the plan")]
    StringWindows,
    #[error("column {name} has {found} values, expected {expected}")]
    ColumnLengthMismatch {
        name: String,
        found: usize,
        expected: usize,
    },
    #[error("duplicate column name: {0}")]
    DuplicateColumn(String),
    #[error("client error: {0}")]
    Client(#[from] ClientError),
    #[error("CSV write error: {0}")]
    Csv(#[from] csv::Error),
}

/// Columnar table keyed by probe-discovered column names.
///
/// Invariant: every column holds exactly one value per row (`Null` marks an
/// absent cell), so all columns stay the same length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    cells: HashMap<String, Vec<Value>>,
    rows: usize,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_columns<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = Self::new();
        for name in names {
            let name = name.into();
            if !table.cells.contains_key(&name) {
                table.cells.insert(name.clone(), Vec::new());
                table.columns.push(name);
            }
        }
        table
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.cells.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Option<&[Value]> {
        self.cells.get(name).map(Vec::as_slice)
    }

    pub fn row_count(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Appends one response row. Schema columns absent from the row are
    /// filled with `Null`; row keys outside the schema are dropped.
    pub fn push_row(&mut self, row: &Map<String, Value>) {
        for name in &self.columns {
            let cell = row.get(name).cloned().unwrap_or(Value::Null);
            self.cells
                .get_mut(name)
                .expect("registered column must exist")
                .push(cell);
        }
        self.rows += 1;
    }

    /// Adds a derived column; its length must match the current row count.
    pub fn add_column(&mut self, name: &str, values: Vec<Value>) -> Result<(), FetchError> {
        if self.cells.contains_key(name) {
            return Err(FetchError::DuplicateColumn(name.to_string()));
        }
        if values.len() != self.rows {
            return Err(FetchError::ColumnLengthMismatch {
                name: name.to_string(),
                found: values.len(),
                expected: self.rows,
            });
        }

        self.columns.push(name.to_string());
        self.cells.insert(name.to_string(), values);
        Ok(())
    }

    /// Column values coerced to `f64`; non-numeric cells become `None`.
    pub fn numeric_column(&self, name: &str) -> Option<Vec<Option<f64>>> {
        self.cells
            .get(name)
            .map(|values| values.iter().map(Value::as_f64).collect())
    }

    /// Reorders all rows ascending by the given column. Returns `false`
    /// (leaving the table untouched) when the column is unknown.
    pub fn sort_rows_by(&mut self, column: &str) -> bool {
        let Some(key_column) = self.cells.get(column) else {
            return false;
        };

        let mut order: Vec<usize> = (0..self.rows).collect();
        order.sort_by(|&a, &b| compare_cells(&key_column[a], &key_column[b]));

        for values in self.cells.values_mut() {
            let reordered: Vec<Value> = order.iter().map(|&i| values[i].clone()).collect();
            *values = reordered;
        }
        true
    }

    /// Appends another table's columns side by side (futures fetch mode).
    /// Shorter columns are padded with `Null`; name collisions get an
    /// ordinal suffix.
    pub fn concat_columns(&mut self, other: Table) {
        let target_rows = self.rows.max(other.rows);

        for values in self.cells.values_mut() {
            values.resize(target_rows, Value::Null);
        }

        for name in other.columns {
            let mut values = other.cells[&name].clone();
            values.resize(target_rows, Value::Null);

            let mut unique = name.clone();
            let mut ordinal = 2usize;
            while self.cells.contains_key(&unique) {
                unique = format!("{name}#{ordinal}");
                ordinal += 1;
            }

            self.columns.push(unique.clone());
            self.cells.insert(unique, values);
        }

        self.rows = target_rows;
    }

    /// Writes the table as CSV, columns in schema order.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), FetchError> {
        let mut out = csv::Writer::from_writer(writer);
        out.write_record(&self.columns)?;

        for row in 0..self.rows {
            let record: Vec<String> = self
                .columns
                .iter()
                .map(|name| cell_to_csv(&self.cells[name][row]))
                .collect();
            out.write_record(&record)?;
        }

        out.flush().map_err(csv::Error::from)?;
        Ok(())
    }
}

fn cell_to_csv(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn compare_cells(a: &Value, b: &Value) -> Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        // ISO-8601 timestamps sort chronologically as strings.
        _ => a.as_str().unwrap_or("").cmp(b.as_str().unwrap_or("")),
    }
}

/// Result of a fetch run: the accumulated table plus how far the run got.
/// A `failure` means the table covers only part of the requested range.
#[derive(Debug)]
pub struct FetchOutcome {
    pub table: Table,
    pub windows_completed: usize,
    pub failure: Option<FetchError>,
}

impl FetchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

/// Probes the schema, then walks every window of the plan through the
/// injected fetcher, merging rows into one table.
///
/// Probe failures abort the whole run (no partial table exists yet). Any
/// error after the probe stops further fetching but the accumulated table is
/// still returned, with the cause attached to the outcome.
pub fn fetch_series_with_fetcher<F>(
    plan: &mut WindowPlan,
    cfg: &FetchConfig,
    mut fetch_window: F,
) -> Result<FetchOutcome, FetchError>
where
    F: FnMut(&FetchWindow) -> Result<GatewayResponse, FetchError>,
{
    let probe = plan.probe_window(cfg.probe_steps);
    courtesy_delay(cfg);
    let response = fetch_window(&probe)?;
    if !response.is_success() {
        return Err(FetchError::RemoteResponse {
            status: response.status,
            body: response.body,
        });
    }

    let probe_rows = parse_rows(&response.body)?;
    let first = probe_rows.first().ok_or(FetchError::EmptyProbe)?;
    let mut table = Table::with_columns(first.keys().cloned());

    info!(
        component = "candle_fetch",
        event = "fetch.probe.ok",
        period_id = plan.interval().period_id(),
        schema_columns = table.column_names().len()
    );

    let mut windows_completed = 0usize;
    let mut failure = None;

    while let Some(window) = plan.next_window() {
        courtesy_delay(cfg);

        let fetched = fetch_window(&window).and_then(|response| {
            if !response.is_success() {
                return Err(FetchError::RemoteResponse {
                    status: response.status,
                    body: response.body,
                });
            }
            parse_rows(&response.body)
        });

        match fetched {
            Ok(rows) => {
                for row in &rows {
                    table.push_row(row);
                }
                windows_completed += 1;
                debug!(
                    component = "candle_fetch",
                    event = "fetch.window.ok",
                    window_start = %window.start,
                    window_end = %window.end,
                    rows = rows.len()
                );
            }
            Err(err) => {
                warn!(
                    component = "candle_fetch",
                    event = "fetch.window.error",
                    window_start = %window.start,
                    window_end = %window.end,
                    error = %err
                );
                failure = Some(err);
                break;
            }
        }
    }

    info!(
        component = "candle_fetch",
        event = "fetch.finish",
        windows_completed,
        rows = table.row_count(),
        complete = failure.is_none()
    );

    Ok(FetchOutcome {
        table,
        windows_completed,
        failure,
    })
}

/// Candle fetch against the CoinAPI OHLCV endpoint through an HTTP gateway.
pub fn fetch_series(
    plan: &mut WindowPlan,
    cfg: &FetchConfig,
    gateway: &dyn HttpGateway,
) -> Result<FetchOutcome, FetchError> {
    let period_id = plan.interval().period_id();
    let batch_size = plan.batch_size();
    let kst = plan.kst_strings();
    let path = cfg.market_path.clone();

    fetch_series_with_fetcher(plan, cfg, move |window| {
        let (time_start, time_end) = window.bounds_strings(kst);
        let url = build_url(
            RemoteSource::CoinApi,
            &path,
            &[
                ("period_id", period_id.to_string()),
                ("time_start", time_start),
                ("time_end", time_end),
                ("include_empty_items", "true".to_string()),
                ("limit", batch_size.to_string()),
            ],
        )?;
        Ok(gateway.get(&url)?)
    })
}

/// Futures-style fetch: per-window tables concatenated column-wise instead of
/// merged row-wise. Requires day-granularity windows with instant bounds;
/// after the preconditions, the partial-failure policy is the same as
/// [`fetch_series_with_fetcher`].
pub fn fetch_futures_with_fetcher<F>(
    plan: &mut WindowPlan,
    cfg: &FetchConfig,
    mut fetch_window: F,
) -> Result<FetchOutcome, FetchError>
where
    F: FnMut(&FetchWindow) -> Result<Table, FetchError>,
{
    if plan.interval() != Interval::Day {
        return Err(FetchError::UnsupportedInterval(plan.interval().period_id()));
    }
    if plan.kst_strings() {
        return Err(FetchError::StringWindows);
    }

    let mut table = Table::new();
    let mut windows_completed = 0usize;
    let mut failure = None;

    while let Some(window) = plan.next_window() {
        courtesy_delay(cfg);

        let fetched = fetch_window(&window).and_then(|part| {
            if part.column_names().is_empty() {
                return Err(FetchError::EmptyWindow {
                    window_start: window.start,
                });
            }
            Ok(part)
        });

        match fetched {
            Ok(part) => {
                table.concat_columns(part);
                windows_completed += 1;
            }
            Err(err) => {
                warn!(
                    component = "futures_fetch",
                    event = "fetch.window.error",
                    window_start = %window.start,
                    window_end = %window.end,
                    error = %err
                );
                failure = Some(err);
                break;
            }
        }
    }

    info!(
        component = "futures_fetch",
        event = "fetch.finish",
        windows_completed,
        columns = table.column_names().len(),
        complete = failure.is_none()
    );

    Ok(FetchOutcome {
        table,
        windows_completed,
        failure,
    })
}

fn parse_rows(body: &str) -> Result<Vec<Map<String, Value>>, FetchError> {
    let parsed: Value =
        serde_json::from_str(body).map_err(|_| FetchError::MalformedBody(truncate(body)))?;
    let array = parsed
        .as_array()
        .ok_or_else(|| FetchError::MalformedBody(truncate(body)))?;

    array
        .iter()
        .map(|item| {
            item.as_object()
                .cloned()
                .ok_or_else(|| FetchError::MalformedBody(truncate(body)))
        })
        .collect()
}

fn truncate(body: &str) -> String {
    const LIMIT: usize = 256;
    if body.len() <= LIMIT {
        body.to_string()
    } else {
        let mut cut = LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &body[..cut])
    }
}

fn courtesy_delay(cfg: &FetchConfig) {
    if cfg.min_delay_ms == 0 && cfg.delay_jitter_ms == 0 {
        return;
    }
    let jitter = rand::thread_rng().gen_range(0..=cfg.delay_jitter_ms);
    std::thread::sleep(std::time::Duration::from_millis(cfg.min_delay_ms + jitter));
}
