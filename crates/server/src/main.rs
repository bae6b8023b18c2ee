use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dnerve_tracking::prelude::*;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "dnerve-tracker",
    author,
    version,
    about = "Track vehicles from a stream of GPS pings",
    long_about = "Reads newline-delimited JSON position pings from stdin, matches them onto \
                  the route network and keeps live vehicle state.\n\n\
                  When the input ends (or on Ctrl-C) the pipeline drains within the configured \
                  grace period, and arrivals for every --stop are printed to stdout as JSON lines."
)]
struct Args {
    /// Route dataset (JSON)
    #[arg(short, long)]
    routes: PathBuf,

    /// Tracking settings (JSON); unspecified fields keep their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop to report arrivals for; may be repeated
    #[arg(short, long = "stop")]
    stops: Vec<String>,

    /// Only report arrivals on this route
    #[arg(long)]
    route: Option<String>,

    /// Seconds between statistics log lines
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    stats_interval: u64,

    /// Verbose output (show debug messages)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(args.config.as_deref())?;
    let grace = config.pipeline.shutdown_grace();
    let catalog = RouteCatalog::from_path(&args.routes)
        .with_context(|| format!("Failed to load route dataset {}", args.routes.display()))?;
    let tracker = Tracker::new(Arc::new(catalog), config).context("Invalid tracking configuration")?;
    let service = TrackingService::start(Arc::new(tracker));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_number = 0usize;
    let mut stats_tick = tokio::time::interval(Duration::from_secs(args.stats_interval));
    stats_tick.tick().await;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read pings from stdin")? else {
                    info!(lines = line_number, "input closed");
                    break;
                };
                line_number += 1;
                submit_line(&service, &line, line_number);
            }
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
            _ = stats_tick.tick() => log_stats(&service),
        }
    }

    match service.shutdown(grace).await {
        ShutdownOutcome::Drained => {}
        ShutdownOutcome::Aborted { abandoned } => warn!(abandoned, "pings left unprocessed"),
    }
    log_stats(&service);

    let route_filter = args.route.map(RouteIdentifier::new);
    for stop in args.stops {
        let stop_id = StopIdentifier::new(&stop);
        match service.list_arrivals(&stop_id, route_filter.as_ref()) {
            Ok(arrivals) => {
                let line = json!({ "stop_id": stop_id, "arrivals": arrivals });
                println!("{line}");
            }
            Err(err) => warn!("{err}"),
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<TrackingConfig> {
    let Some(path) = path else {
        return Ok(TrackingConfig::default());
    };
    let json = std::fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path.display()))?;
    TrackingConfig::from_json(&json).with_context(|| format!("Invalid config {}", path.display()))
}

fn submit_line(service: &TrackingService, line: &str, line_number: usize) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let ping: PositionPing = match serde_json::from_str(line) {
        Ok(ping) => ping,
        Err(err) => {
            warn!(line = line_number, "malformed ping: {err}");
            return;
        }
    };
    match service.submit(ping) {
        Ok(()) => {}
        Err(IngestError::Invalid(err)) => debug!(line = line_number, code = err.code(), "rejected: {err}"),
        Err(err @ IngestError::Closed) => warn!(line = line_number, "{err}"),
    }
}

fn log_stats(service: &TrackingService) {
    let stats = service.stats();
    info!(
        accepted = stats.accepted,
        rejected = stats.total_rejected(),
        shed = stats.shed,
        processed = stats.processed,
        evicted = stats.evicted,
        vehicles = service.tracker().vehicle_count(),
        backlog = service.backlog(),
        "statistics"
    );
    if !stats.rejected.is_empty() {
        debug!(reasons = ?stats.rejected, "rejections by reason");
    }
}
