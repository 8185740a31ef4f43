use std::fs::File;
use std::path::PathBuf;

use btem::{
    fetch_series, init_logging, log_app_start, log_fetch_summary, logging_config_from_env,
    Credentials, FetchConfig, Interval, RemoteSource, ReqwestGateway, WindowPlan,
    DEFAULT_KEYS_PATH,
};

const DEFAULT_TIMEOUT_MS: u64 = 15_000;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging = logging_config_from_env();
    init_logging(&logging)?;
    log_app_start(&logging);

    let start = env_or("BTEM_FETCH_START", "2023-07-01T00:00");
    let end = env_or("BTEM_FETCH_END", "2023-07-25T00:00");
    let interval = Interval::parse(&env_or("BTEM_FETCH_INTERVAL", "DAY"))?;
    let batch_size: u32 = env_or("BTEM_FETCH_BATCH_SIZE", "50").parse()?;

    let keys_path = std::env::var("BTEM_KEYS_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_KEYS_PATH));
    let credentials = Credentials::load(&keys_path)?;

    let mut plan = WindowPlan::parse(&start, &end, interval, batch_size)?;
    let gateway = ReqwestGateway::new(RemoteSource::CoinApi, &credentials, DEFAULT_TIMEOUT_MS)?;
    let cfg = FetchConfig::default();

    let outcome = fetch_series(&mut plan, &cfg, &gateway)?;
    log_fetch_summary(
        outcome.windows_completed,
        outcome.table.row_count(),
        outcome.is_complete(),
    );

    if let Some(failure) = &outcome.failure {
        eprintln!("fetch stopped early: {failure}");
    }

    if let Ok(csv_path) = std::env::var("BTEM_OUTPUT_CSV") {
        let file = File::create(&csv_path)?;
        outcome.table.write_csv(file)?;
        println!(
            "wrote {} rows x {} columns to {}",
            outcome.table.row_count(),
            outcome.table.column_names().len(),
            csv_path
        );
    } else {
        println!(
            "fetched {} rows x {} columns over {} windows ({})",
            outcome.table.row_count(),
            outcome.table.column_names().len(),
            outcome.windows_completed,
            if outcome.is_complete() {
                "complete"
            } else {
                "partial"
            }
        );
    }

    Ok(())
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
