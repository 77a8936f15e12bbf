use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bitscrape::{JsonlStorage, Session, SessionConfig};

#[derive(Parser)]
#[command(
    name = "bitscrape",
    version,
    about = "Passive BitTorrent DHT crawler and metadata collector"
)]
struct Opts {
    /// UDP address the DHT engine binds.
    #[arg(long, default_value = "0.0.0.0:6881")]
    listen: SocketAddr,

    /// Bootstrap nodes (host:port); repeat to override the defaults.
    #[arg(long = "bootstrap")]
    bootstrap: Vec<String>,

    /// Routing-table snapshot file, loaded at startup and written at
    /// shutdown.
    #[arg(long, default_value = "bitscrape-table.bin")]
    snapshot: PathBuf,

    /// Disable routing-table persistence.
    #[arg(long)]
    no_snapshot: bool,

    /// JSONL file collecting discovered infohashes, peers and metadata.
    #[arg(long, default_value = "bitscrape-out.jsonl")]
    output: PathBuf,

    /// Cap on concurrently running metadata fetches.
    #[arg(long, default_value_t = 100)]
    fetch_cap: usize,

    /// Cap on TCP peer connections per fetch.
    #[arg(long, default_value_t = bitscrape_bittorrent::MAX_CONNECTIONS)]
    max_peer_connections: usize,

    /// Assume the snapshot is fresh and skip bootstrap.
    #[arg(long)]
    skip_bootstrap: bool,

    /// How often to print the stats line.
    #[arg(long, default_value_t = 60)]
    stats_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opts = Opts::parse();
    let mut config = SessionConfig {
        listen_addr: opts.listen,
        snapshot_path: (!opts.no_snapshot).then(|| opts.snapshot.clone()),
        fetch_cap: opts.fetch_cap,
        max_peer_connections: opts.max_peer_connections,
        skip_bootstrap: opts.skip_bootstrap,
        ..Default::default()
    };
    if !opts.bootstrap.is_empty() {
        config.bootstrap_addrs = opts.bootstrap.clone();
    }

    let storage = Arc::new(JsonlStorage::spawn(opts.output.clone()));
    let session = Session::start(config, storage, None)
        .await
        .context("session startup failed")?;
    info!(
        listen = %opts.listen,
        output = %opts.output.display(),
        "bitscrape running; ctrl-c to stop"
    );

    let mut stats_interval =
        tokio::time::interval(Duration::from_secs(opts.stats_interval_secs.max(5)));
    stats_interval.tick().await;
    loop {
        tokio::select! {
            r = tokio::signal::ctrl_c() => {
                if let Err(e) = r {
                    warn!("ctrl-c handler failed: {e:#}");
                }
                break;
            }
            _ = stats_interval.tick() => {
                let stats = session.stats();
                info!(
                    table = stats.dht.routing_table_size,
                    observed = stats.dht.observed_infohashes,
                    fetches = stats.active_fetches,
                    received = stats.metadata_received,
                    "progress"
                );
            }
        }
    }

    session.shutdown().await;
    Ok(())
}
