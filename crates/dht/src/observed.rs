//! Passive harvest state: what the swarm has told us about infohashes.
//! Inbound `get_peers`/`announce_peer` queries feed records here; the
//! per-(infohash, source-ip) throttle decides when a discovery event may
//! be emitted again.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use bitscrape_types::InfoHash;

use crate::EMIT_WINDOW;

/// Per-record cap on remembered peer endpoints.
const MAX_PEERS_PER_RECORD: usize = 64;
/// Global cap on records; the oldest go first when exceeded.
const MAX_RECORDS: usize = 100_000;

#[derive(Debug)]
pub struct InfoHashRecord {
    pub first_observed: Instant,
    pub last_observed: Instant,
    pub observation_count: u64,
    pub announce_count: u64,
    peers: HashSet<SocketAddr>,
    last_emit_per_ip: HashMap<IpAddr, Instant>,
}

impl InfoHashRecord {
    fn new(now: Instant) -> Self {
        InfoHashRecord {
            first_observed: now,
            last_observed: now,
            observation_count: 0,
            announce_count: 0,
            peers: HashSet::new(),
            last_emit_per_ip: HashMap::new(),
        }
    }

    fn should_emit(&mut self, source_ip: IpAddr, window: Duration, now: Instant) -> bool {
        match self.last_emit_per_ip.get(&source_ip) {
            Some(last) if now.saturating_duration_since(*last) < window => false,
            _ => {
                self.last_emit_per_ip.insert(source_ip, now);
                true
            }
        }
    }
}

pub struct ObservedStore {
    records: DashMap<InfoHash, InfoHashRecord>,
    emit_window: Duration,
    ttl: Duration,
}

pub struct ObservedStats {
    pub records: usize,
    pub total_observations: u64,
    pub total_announces: u64,
}

impl ObservedStore {
    pub fn new(emit_window: Option<Duration>, ttl: Duration) -> Self {
        ObservedStore {
            records: DashMap::new(),
            emit_window: emit_window.unwrap_or(EMIT_WINDOW),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records an inbound get_peers naming `hash`. Returns true when a
    /// discovery event should be emitted for this (hash, source) pair.
    pub fn observe_get_peers(&self, hash: InfoHash, source: SocketAddr, now: Instant) -> bool {
        let mut rec = self
            .records
            .entry(hash)
            .or_insert_with(|| InfoHashRecord::new(now));
        rec.observation_count += 1;
        rec.last_observed = now;
        rec.should_emit(source.ip(), self.emit_window, now)
    }

    /// Records a token-verified announce. `peer_addr` is the announced
    /// endpoint (announce port or implied source port already applied).
    /// Returns true when a discovery event should be emitted.
    pub fn observe_announce(
        &self,
        hash: InfoHash,
        source: SocketAddr,
        peer_addr: SocketAddr,
        now: Instant,
    ) -> bool {
        let mut rec = self
            .records
            .entry(hash)
            .or_insert_with(|| InfoHashRecord::new(now));
        rec.observation_count += 1;
        rec.announce_count += 1;
        rec.last_observed = now;
        if rec.peers.len() < MAX_PEERS_PER_RECORD {
            rec.peers.insert(peer_addr);
        }
        rec.should_emit(source.ip(), self.emit_window, now)
    }

    /// Announced peers to serve in our own get_peers responses.
    pub fn peers_for(&self, hash: &InfoHash) -> Vec<SocketAddr> {
        self.records
            .get(hash)
            .map(|rec| rec.peers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drops records past their TTL; when over the global cap, also the
    /// oldest by last observation. Returns how many were purged.
    pub fn purge(&self, now: Instant) -> usize {
        let mut purged = 0;
        let before = self.records.len();
        self.records
            .retain(|_, rec| now.saturating_duration_since(rec.last_observed) < self.ttl);
        purged += before - self.records.len();

        if self.records.len() > MAX_RECORDS {
            let mut by_age: Vec<(InfoHash, Instant)> = self
                .records
                .iter()
                .map(|e| (*e.key(), e.value().last_observed))
                .collect();
            by_age.sort_by_key(|(_, seen)| *seen);
            let excess = self.records.len() - MAX_RECORDS;
            for (hash, _) in by_age.into_iter().take(excess) {
                self.records.remove(&hash);
                purged += 1;
            }
        }
        purged
    }

    /// Forgets one record, typically after its metadata was persisted.
    pub fn forget(&self, hash: &InfoHash) -> bool {
        self.records.remove(hash).is_some()
    }

    pub fn stats(&self) -> ObservedStats {
        let mut total_observations = 0;
        let mut total_announces = 0;
        for rec in self.records.iter() {
            total_observations += rec.observation_count;
            total_announces += rec.announce_count;
        }
        ObservedStats {
            records: self.records.len(),
            total_observations,
            total_announces,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ObservedStore {
        ObservedStore::new(None, Duration::from_secs(3600))
    }

    #[test]
    fn first_observation_emits_repeat_is_throttled() {
        let s = store();
        let hash = InfoHash::random();
        let src: SocketAddr = "203.0.113.5:6881".parse().unwrap();
        let now = Instant::now();

        assert!(s.observe_get_peers(hash, src, now));
        // Same IP within the window: silent, regardless of source port.
        let src2: SocketAddr = "203.0.113.5:7000".parse().unwrap();
        assert!(!s.observe_get_peers(hash, src, now + Duration::from_secs(60)));
        assert!(!s.observe_get_peers(hash, src2, now + Duration::from_secs(120)));
        // Another IP emits independently.
        let other: SocketAddr = "198.51.100.7:6881".parse().unwrap();
        assert!(s.observe_get_peers(hash, other, now + Duration::from_secs(60)));
        // After the window the same IP emits again.
        assert!(s.observe_get_peers(hash, src, now + EMIT_WINDOW + Duration::from_secs(121)));
    }

    #[test]
    fn announce_records_peer_endpoints() {
        let s = store();
        let hash = InfoHash::random();
        let src: SocketAddr = "203.0.113.5:6881".parse().unwrap();
        let announced: SocketAddr = "203.0.113.5:51413".parse().unwrap();
        let now = Instant::now();

        assert!(s.observe_announce(hash, src, announced, now));
        assert_eq!(s.peers_for(&hash), vec![announced]);
        assert!(s.peers_for(&InfoHash::random()).is_empty());

        let stats = s.stats();
        assert_eq!(stats.records, 1);
        assert_eq!(stats.total_announces, 1);
    }

    #[test]
    fn purge_drops_expired_records() {
        let s = ObservedStore::new(None, Duration::from_secs(100));
        let now = Instant::now();
        let old = InfoHash::random();
        let fresh = InfoHash::random();
        let src: SocketAddr = "203.0.113.5:6881".parse().unwrap();
        s.observe_get_peers(old, src, now);
        s.observe_get_peers(fresh, src, now + Duration::from_secs(90));

        assert_eq!(s.purge(now + Duration::from_secs(120)), 1);
        assert!(s.peers_for(&old).is_empty());
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn forget_after_persistence() {
        let s = store();
        let hash = InfoHash::random();
        let src: SocketAddr = "203.0.113.5:6881".parse().unwrap();
        s.observe_get_peers(hash, src, Instant::now());
        assert!(s.forget(&hash));
        assert!(!s.forget(&hash));
        assert!(s.is_empty());
    }
}
