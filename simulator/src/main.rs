mod telemetry;

use clap::Parser;
use serde::Serialize;
use std::time::Duration;
use telemetry::Generator;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Uploads random measurements for one device to a running collector.
#[derive(Debug, Parser)]
#[command(name = "simulator")]
struct Args {
    /// Collector base URL
    #[arg(long, env = "COLLECTOR_URL", default_value = "http://localhost:8080")]
    url: String,

    /// Device API key, as shown once when the device was added
    #[arg(long, env = "API_KEY")]
    api_key: String,

    /// Comma-separated column names; must match the device's columns
    #[arg(long, env = "COLUMNS", default_value = "temp,humidity,battery")]
    columns: String,

    /// Delay between uploads, in milliseconds
    #[arg(long, env = "RATE_MS", default_value_t = 1000)]
    rate: u64,

    /// Stop after this many uploads; runs forever when omitted
    #[arg(long, env = "COUNT")]
    count: Option<u64>,

    /// Starting position for devices with `lat` and `lon` columns
    #[arg(long, default_value_t = 52.2297)]
    lat: f64,

    #[arg(long, default_value_t = 21.0122)]
    lon: f64,
}

#[derive(Debug, Serialize)]
struct Upload<'a> {
    data: &'a [f64],
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let columns: Vec<String> = args
        .columns
        .split(',')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if columns.is_empty() {
        error!("At least one column is required");
        std::process::exit(1);
    }

    let endpoint = format!("{}/api/measurements/", args.url.trim_end_matches('/'));
    info!("Starting simulator");
    info!("Endpoint: {}, columns: {:?}, every {} ms", endpoint, columns, args.rate);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|e| {
            error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        });

    let mut generator = Generator::new(columns, (args.lat, args.lon));
    let mut interval = tokio::time::interval(Duration::from_millis(args.rate.max(1)));
    let mut sent = 0u64;
    let mut failed = 0u64;

    loop {
        if args.count.is_some_and(|count| sent + failed >= count) {
            break;
        }
        interval.tick().await;

        let row = generator.next_row(&mut rand::thread_rng());
        let result = client
            .post(&endpoint)
            .header("API-KEY", &args.api_key)
            .json(&Upload { data: &row })
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => sent += 1,
            Ok(resp) => {
                failed += 1;
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                warn!("Upload rejected with {}: {}", status, body);
                if status == reqwest::StatusCode::UNAUTHORIZED {
                    error!("API key refused, giving up");
                    std::process::exit(1);
                }
            }
            Err(e) => {
                failed += 1;
                warn!("Failed to upload: {}", e);
            }
        }

        // Log progress periodically
        if sent > 0 && sent % 100 == 0 {
            info!("Uploaded {} measurements ({} failed)", sent, failed);
        }
    }

    info!("Done: {} uploaded, {} failed", sent, failed);
}
