//! Per-infohash peer manager: keeps the known/active/blacklist sets,
//! tops up connections every few seconds, and turns the first verified
//! dictionary into a MetadataReceived event.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

use bitscrape_event::EventSender;
use bitscrape_types::{Event, EventPayload, FetchFailure, InfoHash, PeerId};

use crate::conn::{FetchError, PeerConnection, PeerConnectionOptions};
use crate::{BLACKLIST_BASE, BLACKLIST_CAP, EXCHANGE_BUDGET, FILL_INTERVAL, MAX_CONNECTIONS};

#[derive(Debug, Clone)]
pub struct PeerManagerConfig {
    pub max_connections: usize,
    pub fill_interval: Duration,
    pub exchange_budget: Duration,
    pub connection: PeerConnectionOptions,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        PeerManagerConfig {
            max_connections: MAX_CONNECTIONS,
            fill_interval: FILL_INTERVAL,
            exchange_budget: EXCHANGE_BUDGET,
            connection: PeerConnectionOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BlacklistEntry {
    strikes: u32,
    until: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PeerManagerStats {
    pub known: usize,
    pub active: usize,
    pub blacklisted: usize,
    pub attempts: u64,
    pub rejects: u64,
}

pub struct PeerManager {
    info_hash: InfoHash,
    local_peer_id: PeerId,
    config: PeerManagerConfig,
    events: EventSender,
    known: Mutex<HashSet<SocketAddr>>,
    active: Mutex<HashSet<SocketAddr>>,
    blacklist: Mutex<HashMap<SocketAddr, BlacklistEntry>>,
    /// Hash-mismatch contributors: banned for the whole session.
    banned: Mutex<HashSet<SocketAddr>>,
    attempts: AtomicU64,
    rejects: AtomicU64,
    done: AtomicBool,
    cancel: CancellationToken,
}

impl PeerManager {
    /// Starts the fill loop. `cancel` is the manager's own token: the
    /// session holds it to tear the whole fetch down.
    pub fn spawn(
        info_hash: InfoHash,
        local_peer_id: PeerId,
        config: PeerManagerConfig,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let manager = Arc::new(PeerManager {
            info_hash,
            local_peer_id,
            config,
            events,
            known: Mutex::new(HashSet::new()),
            active: Mutex::new(HashSet::new()),
            blacklist: Mutex::new(HashMap::new()),
            banned: Mutex::new(HashSet::new()),
            attempts: AtomicU64::new(0),
            rejects: AtomicU64::new(0),
            done: AtomicBool::new(false),
            cancel,
        });
        let this = manager.clone();
        tokio::spawn(
            async move { this.fill_loop().await }
                .instrument(tracing::debug_span!("peer_manager", info_hash = %info_hash)),
        );
        manager
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Feeds a peer from a DHT lookup, an announce or a tracker.
    pub fn add_peer(&self, addr: SocketAddr) {
        if self.done.load(Ordering::Acquire) || self.banned.lock().contains(&addr) {
            return;
        }
        if self.known.lock().insert(addr) {
            trace!(info_hash = %self.info_hash, %addr, "peer learned");
        }
    }

    pub fn stats(&self) -> PeerManagerStats {
        PeerManagerStats {
            known: self.known.lock().len(),
            active: self.active.lock().len(),
            blacklisted: self.blacklist.lock().len(),
            attempts: self.attempts.load(Ordering::Relaxed),
            rejects: self.rejects.load(Ordering::Relaxed),
        }
    }

    /// Stops all work without emitting a failure event (session
    /// shutdown path).
    pub fn abort(&self) {
        self.done.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    async fn fill_loop(self: Arc<Self>) {
        let deadline = tokio::time::Instant::now() + self.config.exchange_budget;
        let mut interval = tokio::time::interval(self.config.fill_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = interval.tick() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    self.finish_failed(self.failure_reason());
                    return;
                }
            }
            if self.done.load(Ordering::Acquire) {
                return;
            }
            self.top_up();
        }
    }

    /// Candidates = known − active − blacklisted − banned, randomized.
    fn top_up(self: &Arc<Self>) {
        let now = Instant::now();
        let active_count = self.active.lock().len();
        let room = self.config.max_connections.saturating_sub(active_count);
        if room == 0 {
            return;
        }

        let mut candidates: Vec<SocketAddr> = {
            let known = self.known.lock();
            let active = self.active.lock();
            let blacklist = self.blacklist.lock();
            let banned = self.banned.lock();
            known
                .iter()
                .filter(|a| !active.contains(a))
                .filter(|a| !banned.contains(a))
                .filter(|a| match blacklist.get(a) {
                    Some(entry) => now >= entry.until,
                    None => true,
                })
                .copied()
                .collect()
        };
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(room);

        for addr in candidates {
            if !self.active.lock().insert(addr) {
                continue;
            }
            self.attempts.fetch_add(1, Ordering::Relaxed);
            let this = self.clone();
            tokio::spawn(async move {
                let conn = PeerConnection::new(
                    addr,
                    this.info_hash,
                    this.local_peer_id,
                    this.config.connection,
                );
                let result = conn.fetch_metadata(this.cancel.child_token()).await;
                this.active.lock().remove(&addr);
                this.on_attempt_finished(addr, result);
            });
        }
    }

    fn on_attempt_finished(
        self: &Arc<Self>,
        addr: SocketAddr,
        result: Result<bytes::Bytes, FetchError>,
    ) {
        match result {
            Ok(data) => {
                if self.done.swap(true, Ordering::AcqRel) {
                    return;
                }
                info!(info_hash = %self.info_hash, %addr, len = data.len(), "metadata received");
                self.events.publish(Event::new(EventPayload::MetadataReceived {
                    info_hash: self.info_hash,
                    data,
                }));
                self.cancel.cancel();
            }
            Err(FetchError::Cancelled) => {}
            Err(e) if e.is_poisonous() => {
                warn!(info_hash = %self.info_hash, %addr, "peer served poisoned metadata");
                self.banned.lock().insert(addr);
                // The exchange resets and the next peer gets its turn;
                // the failure itself is still reported.
                self.events
                    .publish(Event::new(EventPayload::MetadataFetchFailed {
                        info_hash: self.info_hash,
                        reason: FetchFailure::HashMismatch,
                    }));
            }
            Err(e) => {
                if matches!(e, FetchError::PieceRejected(_)) {
                    self.rejects.fetch_add(1, Ordering::Relaxed);
                }
                self.penalize(addr);
                debug!(info_hash = %self.info_hash, %addr, "attempt failed: {e}");
            }
        }
    }

    /// Exponential backoff: 1 min doubling up to 1 h.
    fn penalize(&self, addr: SocketAddr) {
        let mut blacklist = self.blacklist.lock();
        let entry = blacklist.entry(addr).or_insert(BlacklistEntry {
            strikes: 0,
            until: Instant::now(),
        });
        entry.strikes += 1;
        let backoff = BLACKLIST_BASE
            .saturating_mul(1u32 << (entry.strikes - 1).min(6))
            .min(BLACKLIST_CAP);
        entry.until = Instant::now() + backoff;
        trace!(%addr, strikes = entry.strikes, ?backoff, "peer blacklisted");
    }

    fn failure_reason(&self) -> FetchFailure {
        let attempts = self.attempts.load(Ordering::Relaxed);
        let rejects = self.rejects.load(Ordering::Relaxed);
        if self.known.lock().is_empty() && attempts == 0 {
            FetchFailure::NoPeers
        } else if attempts > 0 && rejects == attempts {
            FetchFailure::AllPeersRejected
        } else {
            FetchFailure::Budget
        }
    }

    fn finish_failed(&self, reason: FetchFailure) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(info_hash = %self.info_hash, %reason, "metadata fetch failed");
        self.events
            .publish(Event::new(EventPayload::MetadataFetchFailed {
                info_hash: self.info_hash,
                reason,
            }));
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitscrape_event::EventBus;

    fn manager(config: PeerManagerConfig, bus: &EventBus) -> Arc<PeerManager> {
        PeerManager::spawn(
            InfoHash::random(),
            PeerId::generate(),
            config,
            bus.sender(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn budget_expiry_emits_no_peers() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(move |ev| sink.lock().push(ev.clone()));

        let config = PeerManagerConfig {
            exchange_budget: Duration::from_millis(200),
            fill_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let m = manager(config, &bus);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(m.is_done());
        let events = seen.lock();
        assert_eq!(events.len(), 1);
        match &events[0].payload {
            EventPayload::MetadataFetchFailed { reason, .. } => {
                assert_eq!(*reason, FetchFailure::NoPeers)
            }
            other => panic!("unexpected {other:?}"),
        }
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn banned_peers_are_not_re_added() {
        let bus = EventBus::new();
        let m = manager(PeerManagerConfig::default(), &bus);
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        m.banned.lock().insert(addr);
        m.add_peer(addr);
        assert_eq!(m.stats().known, 0);

        let ok: SocketAddr = "127.0.0.1:9998".parse().unwrap();
        m.add_peer(ok);
        m.add_peer(ok);
        assert_eq!(m.stats().known, 1);
        m.abort();
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn backoff_doubles_and_caps() {
        let bus = EventBus::new();
        let m = manager(PeerManagerConfig::default(), &bus);
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let mut last = Duration::ZERO;
        for strike in 1..=10u32 {
            m.penalize(addr);
            let entry = *m.blacklist.lock().get(&addr).unwrap();
            assert_eq!(entry.strikes, strike);
            let remaining = entry.until.saturating_duration_since(Instant::now());
            assert!(remaining <= BLACKLIST_CAP);
            if strike <= 6 {
                assert!(remaining > last, "backoff should grow");
            }
            last = remaining;
        }
        m.abort();
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn abort_is_silent() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(move |ev| sink.lock().push(ev.clone()));
        let m = manager(PeerManagerConfig::default(), &bus);
        m.abort();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(m.is_done());
        assert!(seen.lock().is_empty());
        bus.shutdown().await;
    }
}
