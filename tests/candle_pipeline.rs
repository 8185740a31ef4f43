use std::cell::RefCell;

use btem::{
    fetch_series, format_bound, parse_bound, ClientError, Credentials, CrossoverModel,
    FetchConfig, GatewayResponse, HttpGateway, Interval, WindowPlan, WindowStride,
};
use chrono::{Duration as ChronoDuration, NaiveDateTime};
use serde_json::json;

/// Gateway that synthesizes one daily candle row per day inside the
/// requested window, the way the upstream OHLCV endpoint pages data.
struct SyntheticGateway {
    origin: NaiveDateTime,
    fail_after_calls: Option<usize>,
    calls: RefCell<usize>,
}

impl SyntheticGateway {
    fn new(origin: NaiveDateTime) -> Self {
        Self {
            origin,
            fail_after_calls: None,
            calls: RefCell::new(0),
        }
    }

    fn failing_after(origin: NaiveDateTime, calls: usize) -> Self {
        Self {
            fail_after_calls: Some(calls),
            ..Self::new(origin)
        }
    }
}

impl HttpGateway for SyntheticGateway {
    fn get(&self, url: &str) -> Result<GatewayResponse, ClientError> {
        let mut calls = self.calls.borrow_mut();
        *calls += 1;
        if let Some(limit) = self.fail_after_calls {
            if *calls > limit {
                return Ok(GatewayResponse {
                    status: 502,
                    body: "synthetic upstream outage".to_string(),
                });
            }
        }

        let parsed = reqwest::Url::parse(url).expect("pipeline should build valid URLs");
        assert_eq!(parsed.host_str(), Some("rest.coinapi.io"));

        let query: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        let lookup = |name: &str| {
            query
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone())
                .unwrap_or_else(|| panic!("query parameter {name} missing from {url}"))
        };

        assert_eq!(lookup("period_id"), "1DAY");
        assert_eq!(lookup("include_empty_items"), "true");

        let start = parse_bound(&lookup("time_start")).expect("valid time_start");
        let end = parse_bound(&lookup("time_end")).expect("valid time_end");

        let mut rows = Vec::new();
        let mut cursor = start;
        while cursor < end {
            let day_index = (cursor - self.origin).num_days();
            rows.push(json!({
                "time_period_start": format_bound(cursor),
                "price_close": (day_index + 1) as f64,
            }));
            cursor += ChronoDuration::days(1);
        }

        Ok(GatewayResponse {
            status: 200,
            body: serde_json::to_string(&rows).expect("serializable rows"),
        })
    }
}

fn quiet_cfg() -> FetchConfig {
    FetchConfig {
        min_delay_ms: 0,
        delay_jitter_ms: 0,
        ..FetchConfig::default()
    }
}

fn monthly_daily_plan() -> WindowPlan {
    WindowPlan::parse("2020-01-01T00:00", "2020-01-31T00:00", Interval::Day, 5)
        .expect("plan should build")
        .with_stride(WindowStride::Contiguous)
}

#[test]
fn full_pipeline_fetches_rows_and_predicts_buy_on_rising_prices() {
    let mut plan = monthly_daily_plan();
    let gateway = SyntheticGateway::new(plan.start());

    let outcome = fetch_series(&mut plan, &quiet_cfg(), &gateway).expect("probe should succeed");
    assert!(outcome.is_complete());
    assert_eq!(outcome.windows_completed, 6);
    assert_eq!(outcome.table.row_count(), 30);

    let mut model =
        CrossoverModel::with_defaults(outcome.table, &plan).expect("model should build");
    model.add_moving_averages().expect("averages should derive");

    // Monotonically rising closes keep the 5-day mean above the 20-day mean.
    let signal = model
        .predict(None, "MAL_5DAY", "MAL_20DAY", 3)
        .expect("prediction should succeed");
    assert!(signal);
}

#[test]
fn gateway_failure_mid_run_yields_partial_table_without_an_error() {
    let mut plan = monthly_daily_plan();
    // Call 1 is the probe; three window fetches succeed before the outage.
    let gateway = SyntheticGateway::failing_after(plan.start(), 4);

    let outcome = fetch_series(&mut plan, &quiet_cfg(), &gateway).expect("partial run is Ok");
    assert!(!outcome.is_complete());
    assert_eq!(outcome.windows_completed, 3);
    assert_eq!(outcome.table.row_count(), 15);

    // Exactly the rows contributed by the completed windows survive.
    let closes = outcome
        .table
        .numeric_column("price_close")
        .expect("close column present");
    let expected: Vec<Option<f64>> = (1..=15).map(|day| Some(day as f64)).collect();
    assert_eq!(closes, expected);
}

#[test]
fn probe_failure_surfaces_as_hard_error() {
    let mut plan = monthly_daily_plan();
    let gateway = SyntheticGateway::failing_after(plan.start(), 0);

    let err = fetch_series(&mut plan, &quiet_cfg(), &gateway).unwrap_err();
    assert!(err.to_string().contains("synthetic upstream outage"));
}

#[test]
fn thirty_row_series_votes_over_trailing_daily_window() {
    let mut plan = monthly_daily_plan();
    let gateway = SyntheticGateway::new(plan.start());
    let outcome = fetch_series(&mut plan, &quiet_cfg(), &gateway).expect("fetch should succeed");

    let mut model =
        CrossoverModel::with_defaults(outcome.table, &plan).expect("model should build");
    model.add_moving_averages().expect("averages should derive");

    // Explicit target on the final row exercises the timestamp lookup path.
    let target = format_bound(
        NaiveDateTime::parse_from_str("2020-01-30T00:00", "%Y-%m-%dT%H:%M")
            .expect("valid target time"),
    );
    let signal = model
        .predict(Some(&target), "MAL_5DAY", "MAL_20DAY", 3)
        .expect("prediction should succeed");
    assert!(signal);
}

#[test]
fn credentials_round_trip_through_gateway_construction() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let path = dir.path().join("keys.json");
    std::fs::write(
        &path,
        r#"{"upbit_access":"a","upbit_secret":"s","coinapi_access":"c"}"#,
    )
    .expect("keys file should write");

    let credentials = Credentials::load(&path).expect("credentials should load");
    let gateway =
        btem::ReqwestGateway::new(btem::RemoteSource::CoinApi, &credentials, 1_000);
    assert!(gateway.is_ok());
}
