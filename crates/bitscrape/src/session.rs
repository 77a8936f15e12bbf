//! The crawler session: owns the bus, the lock manager, the DHT engine
//! and the per-infohash peer managers, and wires discovery events into
//! metadata fetches and storage writes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bitscrape_bittorrent::{PeerConnectionOptions, PeerManager, PeerManagerConfig};
use bitscrape_dht::persistence::{self, SnapshotEntry};
use bitscrape_dht::{DhtConfig, DhtEngine, DhtStats};
use bitscrape_event::{EventAdapter, EventBus, EventFilter, EventProcessor};
use bitscrape_lock::{LockContext, LockManager, LockMode, ResourceId, ResourcePriority};
use bitscrape_types::{
    Event, EventPayload, FetchFailure, InfoHash, PeerId, Severity, TorrentSummary,
};

use crate::beacon::{Beacon, TracingSink};
use crate::config::SessionConfig;
use crate::storage::Storage;
use crate::tracker::Tracker;

const LOCK_TIMEOUT: Duration = Duration::from_secs(1);
/// How often the stats task reports, and every fifth report feeds
/// `record_dht_node`.
const STATS_INTERVAL: Duration = Duration::from_secs(60);
const NODE_RECORD_BATCH: usize = 64;

/// Resources the session registers with its lock manager. Acquisition
/// must run in descending priority: transactions/tokens before the
/// routing table before peer sets before bootstrap state.
pub struct Resources {
    pub transaction_table: ResourceId,
    pub token_secrets: ResourceId,
    pub routing_table: ResourceId,
    pub peer_sets: ResourceId,
    pub bootstrap_state: ResourceId,
}

impl Resources {
    fn register(locks: &LockManager) -> anyhow::Result<Resources> {
        Ok(Resources {
            transaction_table: locks.register("dht.transaction-table", ResourcePriority::High)?,
            token_secrets: locks.register("dht.token-secrets", ResourcePriority::High)?,
            routing_table: locks.register("dht.routing-table", ResourcePriority::Normal)?,
            peer_sets: locks.register("bt.peer-sets", ResourcePriority::Normal)?,
            bootstrap_state: locks.register("dht.bootstrap", ResourcePriority::Low)?,
        })
    }
}

enum Command {
    Discovered(InfoHash),
    Peer(InfoHash, std::net::SocketAddr),
    Received(InfoHash, bytes::Bytes),
    Failed(InfoHash, FetchFailure),
}

#[derive(Debug, Clone)]
pub struct SessionStats {
    pub dht: DhtStats,
    pub active_fetches: usize,
    pub metadata_received: u64,
    pub metadata_failed: u64,
    pub fetches_skipped_by_cap: u64,
}

pub struct Session {
    config: SessionConfig,
    bus: EventBus,
    locks: Arc<LockManager>,
    resources: Resources,
    beacon: Beacon,
    dht: Arc<DhtEngine>,
    managers: DashMap<InfoHash, Arc<PeerManager>>,
    storage: Arc<dyn Storage>,
    tracker: Option<Arc<dyn Tracker>>,
    local_peer_id: PeerId,
    cancel: CancellationToken,
    accepting: AtomicBool,
    shutting_down: AtomicBool,
    metadata_received: AtomicU64,
    metadata_failed: AtomicU64,
    skipped_by_cap: AtomicU64,
    tracing_sink: parking_lot::Mutex<TracingSink>,
    storage_processor: EventProcessor,
}

impl Session {
    pub async fn start(
        config: SessionConfig,
        storage: Arc<dyn Storage>,
        tracker: Option<Arc<dyn Tracker>>,
    ) -> anyhow::Result<Arc<Session>> {
        let bus = EventBus::new();
        let locks = Arc::new(LockManager::new());
        let resources = Resources::register(&locks).context("registering lock resources")?;
        let beacon = Beacon::new(bus.sender());
        let mut tracing_sink = TracingSink::new();
        tracing_sink.connect(&bus);

        // Snapshot corruption is fatal startup state; a missing file is
        // a plain cold start.
        let initial_nodes: Vec<SnapshotEntry> = match &config.snapshot_path {
            Some(path) => persistence::load(path)?,
            None => Vec::new(),
        };

        let cancel = CancellationToken::new();
        let dht = DhtEngine::spawn(
            DhtConfig {
                listen_addr: config.listen_addr,
                bootstrap_addrs: config.bootstrap_addrs.clone(),
                emit_window: Some(config.emit_window),
                initial_nodes: initial_nodes
                    .iter()
                    .map(|e| (e.id, e.addr))
                    .collect(),
                cancellation_token: Some(cancel.child_token()),
                ..Default::default()
            },
            bus.sender(),
        )
        .await
        .context("starting the DHT engine")?;

        let storage_processor = Self::wire_storage(&bus, storage.clone());

        let session = Arc::new(Session {
            config,
            bus,
            locks,
            resources,
            beacon,
            dht,
            managers: DashMap::new(),
            storage,
            tracker,
            local_peer_id: PeerId::generate(),
            cancel,
            accepting: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            metadata_received: AtomicU64::new(0),
            metadata_failed: AtomicU64::new(0),
            skipped_by_cap: AtomicU64::new(0),
            tracing_sink: parking_lot::Mutex::new(tracing_sink),
            storage_processor,
        });

        let cmd_rx = session.wire_orchestration();
        {
            let this = session.clone();
            tokio::spawn(async move { this.orchestrate(cmd_rx).await });
        }
        {
            let this = session.clone();
            tokio::spawn(async move { this.bootstrap_task().await });
        }
        {
            let this = session.clone();
            tokio::spawn(async move { this.stats_task().await });
        }
        {
            // Engine death outside a requested shutdown degrades the
            // session.
            let this = session.clone();
            let engine_token = session.dht.cancellation_token().clone();
            tokio::spawn(async move {
                engine_token.cancelled().await;
                if !this.shutting_down.load(Ordering::Acquire) {
                    this.degrade("DHT engine terminated unexpectedly").await;
                }
            });
        }

        Ok(session)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn beacon(&self) -> &Beacon {
        &self.beacon
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn dht(&self) -> &Arc<DhtEngine> {
        &self.dht
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            dht: self.dht.stats(),
            active_fetches: self.managers.len(),
            metadata_received: self.metadata_received.load(Ordering::Relaxed),
            metadata_failed: self.metadata_failed.load(Ordering::Relaxed),
            fetches_skipped_by_cap: self.skipped_by_cap.load(Ordering::Relaxed),
        }
    }

    /// Storage consumes the bus through a filtered processor: discovery
    /// and result events are queued off the publish path and handed to
    /// the collaborator, with errors downgraded to warnings.
    fn wire_storage(bus: &EventBus, storage: Arc<dyn Storage>) -> EventProcessor {
        use bitscrape_types::EventTag;
        let filter = EventFilter::tag(EventTag::InfoHashDiscovered)
            .or(EventFilter::tag(EventTag::PeerDiscovered))
            .or(EventFilter::tag(EventTag::MetadataReceived));
        let processor = EventProcessor::new(
            1,
            Some(filter),
            Arc::new(move |event: &Event| {
                let result = match &event.payload {
                    EventPayload::InfoHashDiscovered { info_hash, .. } => {
                        storage.store_infohash(*info_hash, event.timestamp, event.timestamp)
                    }
                    EventPayload::PeerDiscovered { info_hash, addr } => {
                        storage.store_peer(*info_hash, *addr, event.timestamp)
                    }
                    EventPayload::MetadataReceived { info_hash, data } => {
                        storage.store_metadata(*info_hash, data, event.timestamp)
                    }
                    _ => Ok(()),
                };
                if let Err(e) = result {
                    warn!("storage write skipped: {e}");
                }
            }),
        );
        processor.attach(bus);
        processor
    }

    /// Bridges bus events into the orchestrator's command queue; bus
    /// handlers must never block.
    fn wire_orchestration(self: &Arc<Self>) -> UnboundedReceiver<Command> {
        let (tx, rx) = unbounded_channel();
        self.bus.subscribe(move |event| {
            let cmd = match &event.payload {
                EventPayload::InfoHashDiscovered { info_hash, .. } => {
                    Command::Discovered(*info_hash)
                }
                EventPayload::PeerDiscovered { info_hash, addr } => {
                    Command::Peer(*info_hash, *addr)
                }
                EventPayload::MetadataReceived { info_hash, data } => {
                    Command::Received(*info_hash, data.clone())
                }
                EventPayload::MetadataFetchFailed { info_hash, reason } => {
                    Command::Failed(*info_hash, *reason)
                }
                _ => return,
            };
            let _ = tx.send(cmd);
        });
        rx
    }

    async fn orchestrate(self: Arc<Self>, mut rx: UnboundedReceiver<Command>) {
        let ctx = LockContext::new();
        loop {
            let cmd = tokio::select! {
                _ = self.cancel.cancelled() => return,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => return,
                },
            };
            match cmd {
                Command::Discovered(info_hash) => self.maybe_launch(&ctx, info_hash).await,
                Command::Peer(info_hash, addr) => {
                    if let Some(manager) = self.managers.get(&info_hash) {
                        manager.add_peer(addr);
                    }
                }
                Command::Received(info_hash, data) => {
                    self.metadata_received.fetch_add(1, Ordering::Relaxed);
                    self.remove_manager(&ctx, info_hash).await;
                    self.dht.forget_infohash(&info_hash);
                    match TorrentSummary::from_info_bytes(&data) {
                        Ok(summary) => info!(
                            %info_hash,
                            name = summary.name.as_deref().unwrap_or("?"),
                            size = summary.total_size,
                            files = summary.file_count,
                            "metadata collected"
                        ),
                        Err(e) => debug!(%info_hash, "info dictionary did not decode: {e}"),
                    }
                }
                Command::Failed(info_hash, reason) => {
                    self.metadata_failed.fetch_add(1, Ordering::Relaxed);
                    // A hash mismatch only bans the offending peer; the
                    // fetch itself keeps running.
                    if reason != FetchFailure::HashMismatch {
                        self.remove_manager(&ctx, info_hash).await;
                    }
                }
            }
        }
    }

    async fn maybe_launch(self: &Arc<Self>, ctx: &LockContext, info_hash: InfoHash) {
        if !self.accepting.load(Ordering::Acquire) || self.managers.contains_key(&info_hash) {
            return;
        }
        if self.managers.len() >= self.config.fetch_cap {
            self.skipped_by_cap.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let guard = match self
            .locks
            .acquire(ctx, self.resources.peer_sets, LockMode::Exclusive, LOCK_TIMEOUT)
            .await
        {
            Ok(guard) => guard,
            Err(e) => {
                // Resource exhaustion sheds load instead of crashing.
                warn!(%info_hash, "skipping fetch launch: {e}");
                return;
            }
        };
        let manager = PeerManager::spawn(
            info_hash,
            self.local_peer_id,
            PeerManagerConfig {
                max_connections: self.config.max_peer_connections,
                connection: PeerConnectionOptions::default(),
                ..Default::default()
            },
            self.bus.sender(),
            self.cancel.child_token(),
        );
        self.managers.insert(info_hash, manager.clone());
        drop(guard);
        debug!(%info_hash, active = self.managers.len(), "metadata fetch launched");

        // Seed the manager: a DHT lookup plus, when configured, one
        // tracker announce. Discovered peers also stream in as
        // PeerDiscovered events.
        let dht = self.dht.clone();
        tokio::spawn(async move {
            let result = dht.get_peers(info_hash, true).await;
            for peer in result.peers {
                manager.add_peer(peer);
            }
        });
        if let Some(tracker) = &self.tracker {
            let tracker = tracker.clone();
            let sender = self.bus.sender();
            tokio::spawn(async move {
                match tracker.announce(info_hash).await {
                    Ok(peers) => {
                        for addr in peers {
                            sender.publish(Event::new(EventPayload::PeerDiscovered {
                                info_hash,
                                addr,
                            }));
                        }
                    }
                    Err(e) => debug!(%info_hash, "tracker announce failed: {e:#}"),
                }
            });
        }
    }

    async fn remove_manager(&self, ctx: &LockContext, info_hash: InfoHash) {
        let guard = self
            .locks
            .acquire(ctx, self.resources.peer_sets, LockMode::Exclusive, LOCK_TIMEOUT)
            .await;
        if let Some((_, manager)) = self.managers.remove(&info_hash) {
            manager.abort();
        }
        drop(guard);
    }

    async fn bootstrap_task(self: Arc<Self>) {
        if self.config.skip_bootstrap {
            self.dht.set_serving(true);
            return;
        }
        let ctx = LockContext::new();
        let guard = self
            .locks
            .acquire(
                &ctx,
                self.resources.bootstrap_state,
                LockMode::Exclusive,
                LOCK_TIMEOUT,
            )
            .await;
        let ok = tokio::select! {
            _ = self.cancel.cancelled() => return,
            ok = self.dht.bootstrap() => ok,
        };
        // Bootstrap failure is not fatal: keep answering whatever the
        // swarm routes through us.
        self.dht.set_serving(true);
        if !ok {
            warn!("continuing without a bootstrapped table");
        }
        drop(guard);
    }

    async fn stats_task(self: Arc<Self>) {
        let ctx = LockContext::new();
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        interval.tick().await;
        let mut tick = 0u64;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            tick += 1;
            let stats = self.stats();
            info!(
                table = stats.dht.routing_table_size,
                inflight = stats.dht.inflight_transactions,
                observed = stats.dht.observed_infohashes,
                fetches = stats.active_fetches,
                received = stats.metadata_received,
                failed = stats.metadata_failed,
                "session stats"
            );
            if tick % 5 == 0 {
                self.record_nodes(&ctx).await;
            }
        }
    }

    /// Feeds a batch of fresh table entries to the storage collaborator.
    async fn record_nodes(&self, ctx: &LockContext) {
        let guard = self
            .locks
            .acquire(
                ctx,
                self.resources.routing_table,
                LockMode::Shared,
                LOCK_TIMEOUT,
            )
            .await;
        let entries = self.dht.snapshot_nodes();
        drop(guard);
        let now = std::time::Instant::now();
        for (id, addr, _age) in entries.into_iter().take(NODE_RECORD_BATCH) {
            let status = self.dht.with_routing_table(|t| {
                t.iter_nodes()
                    .find(|n| n.id() == id)
                    .map(|n| n.status(now))
            });
            if let Some(status) = status {
                if let Err(e) = self.storage.record_dht_node(id, addr, status) {
                    warn!("record_dht_node skipped: {e}");
                    break;
                }
            }
        }
    }

    async fn degrade(self: &Arc<Self>, reason: &str) {
        warn!(reason, "session degraded");
        self.beacon
            .emit(Severity::Critical, "session", reason, module_path!());
        self.bus
            .publish(&Event::new(EventPayload::SessionDegraded {
                reason: reason.to_string(),
            }));
        self.shutdown().await;
    }

    /// Orderly teardown: stop intake, abort fetches, stop the engine,
    /// flush storage, snapshot the table, stop the bus.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("session shutting down");
        self.accepting.store(false, Ordering::Release);

        for entry in self.managers.iter() {
            entry.value().abort();
        }
        self.managers.clear();

        self.cancel.cancel();

        // Let queued storage rows drain before flushing the sink.
        self.storage_processor
            .pool()
            .wait_for_empty(Duration::from_secs(5))
            .await;
        self.storage_processor.detach(&self.bus);
        self.storage_processor.stop().await;
        self.storage.flush().await;

        if let Some(path) = &self.config.snapshot_path {
            let ctx = LockContext::new();
            let guard = self
                .locks
                .acquire(
                    &ctx,
                    self.resources.routing_table,
                    LockMode::Shared,
                    LOCK_TIMEOUT,
                )
                .await;
            let entries: Vec<SnapshotEntry> = self
                .dht
                .snapshot_nodes()
                .into_iter()
                .map(|(id, addr, age)| SnapshotEntry {
                    id,
                    addr,
                    last_seen_unix: persistence::unix_from_age(age),
                })
                .collect();
            drop(guard);
            if let Err(e) = persistence::save(path, &entries) {
                warn!("snapshot save failed: {e:#}");
            }
        }

        self.tracing_sink.lock().disconnect(&self.bus);
        self.bus.shutdown().await;
        info!("session stopped");
    }
}
