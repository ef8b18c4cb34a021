//! Simulator entry point
//!
//! Starts one station per template path given on the command line (or a
//! default template), then runs until SIGINT/SIGTERM.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use station_simulator::application::EventBus;
use station_simulator::config::SimulatorConfig;
use station_simulator::station::Station;
use station_simulator::support::cache::FileCache;
use station_simulator::support::shutdown::{listen_for_shutdown_signals, ShutdownSignal};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SimulatorConfig::default();
    let cache = Arc::new(FileCache::new());
    let events = EventBus::new();

    let template_paths: Vec<String> = {
        let args: Vec<String> = std::env::args().skip(1).collect();
        if args.is_empty() {
            vec!["templates/default.json".to_string()]
        } else {
            args
        }
    };

    let mut stations = Vec::new();
    for (index, template_path) in template_paths.iter().enumerate() {
        match Station::new(
            index as u32 + 1,
            template_path,
            config.clone(),
            cache.clone(),
            events.clone(),
        ) {
            Ok(station) => {
                info!(
                    station_id = station.station_id().as_str(),
                    template = template_path.as_str(),
                    "Station initialized"
                );
                station.start();
                stations.push(station);
            }
            Err(e) => {
                // a broken template aborts this station, not its siblings
                error!(template = template_path.as_str(), error = %e, "Station initialization failed");
            }
        }
    }
    if stations.is_empty() {
        error!("No station could be started");
        std::process::exit(1);
    }

    let shutdown = ShutdownSignal::new("simulator");
    listen_for_shutdown_signals(shutdown.clone()).await;

    info!("Shutting down {} station(s)", stations.len());
    for station in &stations {
        station.stop(None, None).await;
    }
}
