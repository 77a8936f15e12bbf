//! The closed event union carried by the bus. Subsystems publish these;
//! subscribers pattern-match on the payload. `UserDefined` stays open for
//! plugins the core does not know about.

use std::net::SocketAddr;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::hash_id::InfoHash;

/// Handle identifying one subscriber on the bus. Monotonic per bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// One beacon emission. `location` is the `module_path!()` of the emit site.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub severity: Severity,
    pub category: &'static str,
    pub message: String,
    pub location: &'static str,
}

/// Why a metadata fetch ended without metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFailure {
    /// SHA-1 of the reassembled dictionary did not match the infohash.
    HashMismatch,
    /// Every known peer rejected at least one piece.
    AllPeersRejected,
    /// No usable peer was found before the exchange budget expired.
    NoPeers,
    /// The 5-minute exchange budget expired.
    Budget,
    /// Session shutdown cancelled the exchange.
    Cancelled,
}

impl std::fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FetchFailure::HashMismatch => "hash mismatch",
            FetchFailure::AllPeersRejected => "all peers rejected",
            FetchFailure::NoPeers => "no peers",
            FetchFailure::Budget => "budget expired",
            FetchFailure::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    DhtBootstrapComplete {
        good_nodes: usize,
    },
    DhtBootstrapFailed {
        reason: String,
    },
    /// An inbound `get_peers`/`announce_peer` named this infohash.
    InfoHashDiscovered {
        info_hash: InfoHash,
        source: SocketAddr,
    },
    /// A lookup, announce or tracker produced a peer for this infohash.
    PeerDiscovered {
        info_hash: InfoHash,
        addr: SocketAddr,
    },
    /// A verified info dictionary was downloaded.
    MetadataReceived {
        info_hash: InfoHash,
        data: Bytes,
    },
    MetadataFetchFailed {
        info_hash: InfoHash,
        reason: FetchFailure,
    },
    SessionDegraded {
        reason: String,
    },
    Log(LogRecord),
    UserDefined {
        custom_id: u64,
        data: Bytes,
    },
}

/// Discriminant of [`EventPayload`], used by filters and subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTag {
    DhtBootstrapComplete,
    DhtBootstrapFailed,
    InfoHashDiscovered,
    PeerDiscovered,
    MetadataReceived,
    MetadataFetchFailed,
    SessionDegraded,
    Log,
    UserDefined,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Event {
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn tag(&self) -> EventTag {
        match &self.payload {
            EventPayload::DhtBootstrapComplete { .. } => EventTag::DhtBootstrapComplete,
            EventPayload::DhtBootstrapFailed { .. } => EventTag::DhtBootstrapFailed,
            EventPayload::InfoHashDiscovered { .. } => EventTag::InfoHashDiscovered,
            EventPayload::PeerDiscovered { .. } => EventTag::PeerDiscovered,
            EventPayload::MetadataReceived { .. } => EventTag::MetadataReceived,
            EventPayload::MetadataFetchFailed { .. } => EventTag::MetadataFetchFailed,
            EventPayload::SessionDegraded { .. } => EventTag::SessionDegraded,
            EventPayload::Log(_) => EventTag::Log,
            EventPayload::UserDefined { .. } => EventTag::UserDefined,
        }
    }

    /// Set only for `UserDefined` events.
    pub fn custom_id(&self) -> Option<u64> {
        match &self.payload {
            EventPayload::UserDefined { custom_id, .. } => Some(*custom_id),
            _ => None,
        }
    }
}

impl From<EventPayload> for Event {
    fn from(payload: EventPayload) -> Self {
        Event::new(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_and_custom_ids() {
        let ev = Event::new(EventPayload::InfoHashDiscovered {
            info_hash: InfoHash::random(),
            source: "203.0.113.5:6881".parse().unwrap(),
        });
        assert_eq!(ev.tag(), EventTag::InfoHashDiscovered);
        assert_eq!(ev.custom_id(), None);

        let ud = Event::new(EventPayload::UserDefined {
            custom_id: 42,
            data: Bytes::from_static(b"x"),
        });
        assert_eq!(ud.tag(), EventTag::UserDefined);
        assert_eq!(ud.custom_id(), Some(42));
    }
}
