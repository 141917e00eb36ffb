//! # beacon-demo
//!
//! Reports a short scripted session to a collector and shuts down.
//!
//! Configuration comes from the JSON file named by `BEACON_CONFIG`, or from
//! `BEACON_ENDPOINT` / `BEACON_APP_ID` / `BEACON_DEVICE_ID` when no file is
//! given. Log verbosity follows `RUST_LOG`.

use beaconkit::{OpenKit, OpenKitConfig, ReportedValue};
use log::{error, info, warn};
use std::time::Duration;

fn load_config() -> Result<OpenKitConfig, Box<dyn std::error::Error>> {
    if let Ok(path) = std::env::var("BEACON_CONFIG") {
        info!("Loading configuration from {}", path);
        return Ok(OpenKitConfig::from_file(path)?);
    }

    let endpoint = std::env::var("BEACON_ENDPOINT").unwrap_or_else(|_| "http://localhost:8080/mbeacon".to_string());
    let application_id = std::env::var("BEACON_APP_ID").unwrap_or_else(|_| "beacon-demo".to_string());
    let device_id = match std::env::var("BEACON_DEVICE_ID") {
        Ok(raw) => raw.parse()?,
        Err(_) => 1,
    };

    let mut config = OpenKitConfig::new(endpoint, application_id, device_id);
    config.application_name = "beacon-demo".to_string();
    config.application_version = env!("CARGO_PKG_VERSION").to_string();
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    let openkit = OpenKit::with_http_transport(config)?;
    openkit.initialize();
    if !openkit.wait_for_init_completion_timeout(Duration::from_secs(10)).await {
        warn!("Collector did not answer in time, reports stay buffered");
    }

    let session = openkit.create_session("127.0.0.1");
    session.identify_user("demo-user");

    let action = session.enter_action("load catalog");
    action.report_value("items", ReportedValue::Int(42));
    action.report_event("catalog rendered");
    tokio::time::sleep(Duration::from_millis(250)).await;
    action.leave_action();

    session.report_error("checkout failed", 503, "payment backend unavailable");
    session.end();

    let stats = openkit.cache().stats();
    info!(
        "Cache holds {} bytes in {} beacons ({} records added, {} evicted)",
        stats.total_bytes, stats.entries, stats.records_added, stats.records_evicted
    );

    openkit.shutdown().await;
    Ok(())
}
