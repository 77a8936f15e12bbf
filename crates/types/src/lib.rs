//! Identifier, endpoint and event primitives shared by every bitscrape crate.

pub mod compact;
pub mod event;
pub mod hash_id;
pub mod peer_id;
pub mod torrent_summary;

pub use compact::{CompactError, CompactNode};
pub use event::{Event, EventPayload, EventTag, FetchFailure, LogRecord, Severity, SubscriptionToken};
pub use hash_id::{Id20, IdError, InfoHash, NodeId};
pub use peer_id::PeerId;
pub use torrent_summary::TorrentSummary;
