//! The DHT engine: KRPC wire codec, Kademlia routing table, transaction
//! and token management, iterative lookups, bootstrap, and the passive
//! infohash harvester that feeds the rest of the crawler.

pub mod engine;
pub mod krpc;
pub mod lookup;
pub mod observed;
pub mod persistence;
pub mod routing_table;
pub mod tokens;
pub mod transactions;

use std::time::Duration;

pub use engine::{DhtConfig, DhtEngine, DhtQuery, DhtStats};
pub use lookup::{LookupConfig, LookupKind, LookupResult};
pub use routing_table::{NodeStatus, RoutingTable};

/// Kademlia replication parameter: bucket size and result-set size.
pub const K: usize = 8;
/// Kademlia lookup concurrency.
pub const ALPHA: usize = 3;

/// A node with no contact for this long becomes Questionable.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// Consecutive failed queries before a node is Bad.
pub const MAX_NODE_FAILURES: u32 = 3;

/// Per-query response timeout; one retry after the first.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
pub const QUERY_RETRIES: u8 = 1;
/// Transaction sweeper period.
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Wall-clock budget of one iterative lookup.
pub const LOOKUP_BUDGET: Duration = Duration::from_secs(30);
/// Wall-clock budget of bootstrap.
pub const BOOTSTRAP_BUDGET: Duration = Duration::from_secs(60);

/// get_peers token secret rotation period.
pub const TOKEN_ROTATE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default throttle window for repeated InfoHashDiscovered emissions
/// from the same source IP.
pub const EMIT_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Malformed-traffic source throttling.
pub const MALFORMED_PER_MINUTE_LIMIT: u32 = 16;
pub const MALFORMED_MUTE: Duration = Duration::from_secs(10 * 60);

pub const DHT_BOOTSTRAP: &[&str] = &[
    "router.bittorrent.com:6881",
    "router.utorrent.com:6881",
    "dht.transmissionbt.com:6881",
];
