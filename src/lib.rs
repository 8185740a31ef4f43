//! BTEM core crate.
//!
//! Implemented scope:
//! - calendar-aware fetch window planning (hour/day/month granularity)
//! - resilient paginated candle fetching with a partial-failure-as-success
//!   contract
//! - moving-average crossover prediction over the fetched table

mod client;
mod crossover;
mod fetch;
mod observability;
mod window;

pub use client::{
    build_url, ClientError, Credentials, GatewayResponse, HttpGateway, RemoteSource,
    ReqwestGateway, DEFAULT_KEYS_PATH,
};
pub use crossover::{
    mal_label, CrossoverModel, ModelError, DEFAULT_MA_WINDOWS_DAYS, DEFAULT_TARGET_LABEL,
    DEFAULT_TIMESTAMP_LABEL,
};
pub use fetch::{
    fetch_futures_with_fetcher, fetch_series, fetch_series_with_fetcher, FetchConfig, FetchError,
    FetchOutcome, Table, CANDLE_HISTORY_PATH,
};
pub use observability::{
    init_logging, log_app_start, log_fetch_summary, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use window::{
    format_bound, parse_bound, FetchWindow, Interval, WindowError, WindowPlan, WindowStride,
    KST_SUFFIX, WINDOW_TIME_FORMAT,
};
