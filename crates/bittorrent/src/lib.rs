//! The BitTorrent peer engine: TCP peer connections, extension
//! negotiation, the BEP 9 metadata exchange, and the per-infohash peer
//! manager that schedules it all.

pub mod conn;
pub mod manager;
pub mod metadata;

use std::time::Duration;

pub use conn::{ConnectionState, FetchError, PeerConnection, PeerConnectionOptions};
pub use manager::{PeerManager, PeerManagerConfig};
pub use metadata::MetadataExchange;

/// Outstanding ut_metadata requests kept in flight per peer.
pub const REQUEST_WINDOW: usize = 4;

/// Wall-clock budget of one metadata exchange, from the first request.
pub const EXCHANGE_BUDGET: Duration = Duration::from_secs(5 * 60);

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Peer-manager defaults.
pub const MAX_CONNECTIONS: usize = 50;
pub const FILL_INTERVAL: Duration = Duration::from_secs(5);
pub const BLACKLIST_BASE: Duration = Duration::from_secs(60);
pub const BLACKLIST_CAP: Duration = Duration::from_secs(60 * 60);
