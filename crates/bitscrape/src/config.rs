use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use bitscrape_dht::EMIT_WINDOW;

/// Everything a session needs to run. The CLI layer fills this in;
/// library users build it directly.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub listen_addr: SocketAddr,
    pub bootstrap_addrs: Vec<String>,
    /// Routing-table snapshot location; None disables persistence.
    pub snapshot_path: Option<PathBuf>,
    /// Cap on concurrently running metadata fetches.
    pub fetch_cap: usize,
    /// Cap on TCP connections per fetch.
    pub max_peer_connections: usize,
    /// Per-(infohash, source-ip) discovery emit window.
    pub emit_window: Duration,
    /// Skip bootstrap and serve immediately; used by tests and when
    /// resuming from a good snapshot on a stable network.
    pub skip_bootstrap: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            listen_addr: "0.0.0.0:6881".parse().expect("static addr"),
            bootstrap_addrs: bitscrape_dht::DHT_BOOTSTRAP
                .iter()
                .map(|s| s.to_string())
                .collect(),
            snapshot_path: None,
            fetch_cap: 100,
            max_peer_connections: bitscrape_bittorrent::MAX_CONNECTIONS,
            emit_window: EMIT_WINDOW,
            skip_bootstrap: false,
        }
    }
}
