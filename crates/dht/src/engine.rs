//! The DHT engine: one UDP socket, a framer splitting reads and writes,
//! inbound query answering, passive harvesting, and the background tasks
//! (sweeper, token rotation, pinger, bucket refresher, purger) that keep
//! the table healthy.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use leaky_bucket::RateLimiter;
use parking_lot::{Mutex, RwLock};
use serde_bytes::ByteBuf;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error_span, info, trace, warn, Instrument};

use bitscrape_event::EventSender;
use bitscrape_types::compact::CompactNode;
use bitscrape_types::{Event, EventPayload, Id20, InfoHash, NodeId};

use crate::krpc::{
    self, AnnouncePeerRequest, CompactNodeListV4, CompactNodeListV6, CompactPeerList,
    FindNodeRequest, GetPeersRequest, Message, MessageKind, PingRequest, Response,
};
use crate::lookup::{iterative_lookup, LookupConfig, LookupResult};
use crate::observed::ObservedStore;
use crate::routing_table::{InsertResult, NodeStatus, RoutingTable};
use crate::tokens::TokenManager;
use crate::transactions::{Outcome, QueryKind, Transaction, TransactionTable};
use crate::{
    BOOTSTRAP_BUDGET, DHT_BOOTSTRAP, EMIT_WINDOW, INACTIVITY_TIMEOUT, K,
    MALFORMED_MUTE, MALFORMED_PER_MINUTE_LIMIT, QUERY_RETRIES, RESPONSE_TIMEOUT, SWEEP_INTERVAL,
    TOKEN_ROTATE_INTERVAL,
};

pub struct DhtConfig {
    pub node_id: Option<NodeId>,
    pub listen_addr: SocketAddr,
    pub bootstrap_addrs: Vec<String>,
    /// Throttle window for repeated InfoHashDiscovered per source IP.
    pub emit_window: Option<Duration>,
    /// How long a harvested record lives without new observations.
    pub record_ttl: Duration,
    pub queries_per_second: usize,
    /// Entries restored from a routing-table snapshot.
    pub initial_nodes: Vec<(NodeId, SocketAddr)>,
    pub cancellation_token: Option<CancellationToken>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        DhtConfig {
            node_id: None,
            listen_addr: "0.0.0.0:6881".parse().expect("static addr"),
            bootstrap_addrs: DHT_BOOTSTRAP.iter().map(|s| s.to_string()).collect(),
            emit_window: Some(EMIT_WINDOW),
            record_ttl: Duration::from_secs(30 * 60),
            queries_per_second: 250,
            initial_nodes: Vec::new(),
            cancellation_token: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DhtStats {
    pub id: String,
    pub listen_addr: SocketAddr,
    pub routing_table_size: usize,
    pub buckets: usize,
    pub inflight_transactions: usize,
    pub observed_infohashes: usize,
    pub queries_received: u64,
    pub responses_received: u64,
    pub malformed_packets: u64,
    pub muted_sources: usize,
}

#[derive(Debug, Clone)]
pub enum DhtQuery {
    Ping,
    FindNode(Id20),
    GetPeers(InfoHash),
    Announce {
        info_hash: InfoHash,
        token: Vec<u8>,
        port: u16,
    },
}

impl DhtQuery {
    fn kind(&self) -> QueryKind {
        match self {
            DhtQuery::Ping => QueryKind::Ping,
            DhtQuery::FindNode(_) => QueryKind::FindNode,
            DhtQuery::GetPeers(_) => QueryKind::GetPeers,
            DhtQuery::Announce { .. } => QueryKind::AnnouncePeer,
        }
    }
}

/// Counting window for the malformed-traffic limit.
const MALFORMED_WINDOW: Duration = Duration::from_secs(60);

struct Outbound {
    /// Set when this datagram is a tracked request of ours.
    tracked: Option<(u16, SocketAddr)>,
    message: Message,
    addr: SocketAddr,
}

#[derive(Default)]
struct SourceThrottle {
    window_start: Option<Instant>,
    count: u32,
    muted_until: Option<Instant>,
}

#[derive(Default)]
struct Counters {
    queries_received: AtomicU64,
    responses_received: AtomicU64,
    malformed_packets: AtomicU64,
}

pub struct DhtEngine {
    id: NodeId,
    listen_addr: SocketAddr,
    routing_table: RwLock<RoutingTable>,
    transactions: TransactionTable,
    tokens: TokenManager,
    observed: ObservedStore,
    events: EventSender,
    rate_limiter: RateLimiter,
    out_tx: UnboundedSender<Outbound>,
    cancel: CancellationToken,
    bootstrap_addrs: Vec<String>,
    serving: AtomicBool,
    counters: Counters,
    sources: Mutex<HashMap<IpAddr, SourceThrottle>>,
}

impl DhtEngine {
    /// Binds the UDP socket and starts the worker. A failed bind (e.g.
    /// EADDRINUSE) is fatal and surfaces here.
    pub async fn spawn(config: DhtConfig, events: EventSender) -> anyhow::Result<Arc<Self>> {
        let socket = UdpSocket::bind(config.listen_addr)
            .await
            .with_context(|| format!("error binding DHT socket at {}", config.listen_addr))?;
        let listen_addr = socket
            .local_addr()
            .context("cannot determine UDP listen addr")?;

        let id = config.node_id.unwrap_or_else(NodeId::random);
        info!(%listen_addr, id = %id, "DHT engine starting");

        let mut routing_table = RoutingTable::new(id);
        let now = Instant::now();
        for (node_id, addr) in &config.initial_nodes {
            let _ = routing_table.add_node(*node_id, *addr, now);
        }

        let (out_tx, out_rx) = unbounded_channel();
        let cancel = config.cancellation_token.unwrap_or_default();

        let engine = Arc::new(DhtEngine {
            id,
            listen_addr,
            routing_table: RwLock::new(routing_table),
            transactions: TransactionTable::new(),
            tokens: TokenManager::new(),
            observed: ObservedStore::new(config.emit_window, config.record_ttl),
            events,
            rate_limiter: make_rate_limiter(config.queries_per_second),
            out_tx,
            cancel: cancel.clone(),
            bootstrap_addrs: config.bootstrap_addrs,
            serving: AtomicBool::new(false),
            counters: Counters::default(),
            sources: Mutex::new(HashMap::new()),
        });

        let worker = DhtWorker {
            socket,
            engine: engine.clone(),
        };
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => debug!("cancelled"),
                    r = worker.run(out_rx) => {
                        if let Err(e) = r {
                            warn!("dht worker quit: {e:#}");
                        }
                        // Lets owners observe the engine's death.
                        cancel.cancel();
                    }
                }
            }
            .instrument(error_span!("dht")),
        );
        Ok(engine)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Gates answering of inbound queries; responses to our own requests
    /// are always processed.
    pub fn set_serving(&self, on: bool) {
        self.serving.store(on, Ordering::Relaxed);
    }

    pub fn stats(&self) -> DhtStats {
        let table = self.routing_table.read();
        DhtStats {
            id: self.id.as_string(),
            listen_addr: self.listen_addr,
            routing_table_size: table.len(),
            buckets: table.bucket_count(),
            inflight_transactions: self.transactions.len(),
            observed_infohashes: self.observed.len(),
            queries_received: self.counters.queries_received.load(Ordering::Relaxed),
            responses_received: self.counters.responses_received.load(Ordering::Relaxed),
            malformed_packets: self.counters.malformed_packets.load(Ordering::Relaxed),
            muted_sources: self
                .sources
                .lock()
                .values()
                .filter(|s| s.muted_until.is_some())
                .count(),
        }
    }

    /// Routing-table entries for the shutdown snapshot, freshest first.
    pub fn snapshot_nodes(&self) -> Vec<(NodeId, SocketAddr, Duration)> {
        let now = Instant::now();
        let table = self.routing_table.read();
        let mut entries: Vec<_> = table
            .iter_nodes()
            .map(|n| (n.id(), n.addr(), now.saturating_duration_since(n.last_seen())))
            .collect();
        entries.sort_by_key(|(_, _, age)| *age);
        entries
    }

    pub fn with_routing_table<R>(&self, f: impl FnOnce(&RoutingTable) -> R) -> R {
        f(&self.routing_table.read())
    }

    /// Drops a harvested record, typically once its metadata has been
    /// persisted downstream.
    pub fn forget_infohash(&self, info_hash: &InfoHash) -> bool {
        self.observed.forget(info_hash)
    }

    /// Sends one query and waits for its outcome, retrying once on
    /// timeout. `target_node` is marked in the routing table on failure.
    pub async fn request(
        self: &Arc<Self>,
        query: DhtQuery,
        addr: SocketAddr,
        target_node: Option<NodeId>,
    ) -> anyhow::Result<Response> {
        let attempts = 1 + QUERY_RETRIES;
        for attempt in 0..attempts {
            self.rate_limiter.acquire_one().await;
            let (done_tx, done_rx) = tokio::sync::oneshot::channel();
            let tid = self.transactions.insert(
                addr,
                Transaction {
                    kind: query.kind(),
                    deadline: Instant::now() + RESPONSE_TIMEOUT,
                    done: done_tx,
                },
            );
            let message = Message::request(tid, self.build_query(&query));
            trace!(%addr, tid, "sending {:?}", query);
            if self
                .out_tx
                .send(Outbound {
                    tracked: Some((tid, addr)),
                    message,
                    addr,
                })
                .is_err()
            {
                self.transactions.remove(tid, addr);
                bail!("dht worker is gone");
            }

            // The sweeper resolves timeouts; the extra slack here only
            // guards against the sweeper itself dying.
            let outcome =
                match tokio::time::timeout(RESPONSE_TIMEOUT + Duration::from_secs(2), done_rx)
                    .await
                {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(_)) => bail!("dht engine shutting down"),
                    Err(_) => {
                        self.transactions.remove(tid, addr);
                        Outcome::Timeout
                    }
                };

            match outcome {
                Outcome::Response(response) => {
                    let now = Instant::now();
                    let mut table = self.routing_table.write();
                    table.mark_response(&response.id, now);
                    drop(table);
                    self.insert_node(response.id, addr, now);
                    return Ok(response);
                }
                Outcome::Error(e) => {
                    if let Some(id) = target_node {
                        self.routing_table.write().mark_failure(&id);
                    }
                    bail!("error response {}: {}", e.code, e.message);
                }
                Outcome::Timeout => {
                    if let Some(id) = target_node {
                        self.routing_table.write().mark_failure(&id);
                    }
                    if attempt + 1 == attempts {
                        bail!("timeout after {attempts} attempts ({RESPONSE_TIMEOUT:?} each)");
                    }
                }
            }
        }
        unreachable!("loop returns or bails");
    }

    fn build_query(&self, query: &DhtQuery) -> MessageKind {
        match query {
            DhtQuery::Ping => MessageKind::PingRequest(PingRequest { id: self.id }),
            DhtQuery::FindNode(target) => MessageKind::FindNodeRequest(FindNodeRequest {
                id: self.id,
                target: NodeId(*target),
            }),
            DhtQuery::GetPeers(info_hash) => MessageKind::GetPeersRequest(GetPeersRequest {
                id: self.id,
                info_hash: *info_hash,
            }),
            DhtQuery::Announce {
                info_hash,
                token,
                port,
            } => MessageKind::AnnouncePeerRequest(AnnouncePeerRequest {
                id: self.id,
                implied_port: 0,
                info_hash: *info_hash,
                port: *port,
                token: ByteBuf::from(token.clone()),
            }),
        }
    }

    /// Iterative find_node toward `target`, seeded from the table.
    pub async fn find_node(self: &Arc<Self>, target: Id20) -> LookupResult {
        let seeds = self.lookup_seeds(&target);
        let config = LookupConfig::find_node(target);
        self.run_lookup(&config, seeds).await
    }

    /// Iterative get_peers; every discovered peer is also published as a
    /// PeerDiscovered event.
    pub async fn get_peers(
        self: &Arc<Self>,
        info_hash: InfoHash,
        early_exit_on_peers: bool,
    ) -> LookupResult {
        let seeds = self.lookup_seeds(&info_hash.0);
        let mut config = LookupConfig::get_peers(info_hash.0);
        config.early_exit_on_peers = early_exit_on_peers;
        let result = self.run_lookup(&config, seeds).await;
        for peer in &result.peers {
            self.events.publish(Event::new(EventPayload::PeerDiscovered {
                info_hash,
                addr: *peer,
            }));
        }
        result
    }

    fn lookup_seeds(&self, target: &Id20) -> Vec<(Option<NodeId>, SocketAddr)> {
        self.routing_table
            .read()
            .closest_nodes(target, Instant::now(), K)
            .into_iter()
            .map(|n| (Some(n.id()), n.addr()))
            .collect()
    }

    async fn run_lookup(
        self: &Arc<Self>,
        config: &LookupConfig,
        seeds: Vec<(Option<NodeId>, SocketAddr)>,
    ) -> LookupResult {
        let query = match config.kind {
            crate::lookup::LookupKind::FindNode => DhtQuery::FindNode(config.target),
            crate::lookup::LookupKind::GetPeers => DhtQuery::GetPeers(InfoHash(config.target)),
        };
        iterative_lookup(config, seeds, |addr| {
            let query = query.clone();
            async move { self.request(query, addr, None).await }
        })
        .await
    }

    /// Resolves the bootstrap list and floods find_node(self) until the
    /// table has a full Good bucket next to our id or the budget runs
    /// out. Failure leaves the engine serving inbound queries.
    pub async fn bootstrap(self: &Arc<Self>) -> bool {
        let deadline = Instant::now() + BOOTSTRAP_BUDGET;
        let mut seeds: Vec<(Option<NodeId>, SocketAddr)> = Vec::new();
        for host in &self.bootstrap_addrs {
            match tokio::net::lookup_host(host).await {
                Ok(addrs) => seeds.extend(addrs.map(|a| (None, a))),
                Err(e) => warn!(host, "bootstrap resolve failed: {e:#}"),
            }
        }
        seeds.extend(self.lookup_seeds(&self.id.0));

        let mut round = 0usize;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let mut config = LookupConfig::find_node(self.id.0);
            config.budget = config.budget.min(remaining);
            let result = self.run_lookup(&config, seeds.clone()).await;
            round += 1;
            debug!(
                round,
                responded = result.responded,
                table = self.routing_table.read().len(),
                "bootstrap round done"
            );
            if self
                .routing_table
                .read()
                .bootstrap_complete(Instant::now())
            {
                let good_nodes = self.routing_table.read().len();
                info!(good_nodes, "bootstrap complete");
                self.events
                    .publish(Event::new(EventPayload::DhtBootstrapComplete { good_nodes }));
                return true;
            }
            // Later rounds fan out from whatever the table learned.
            seeds = self.lookup_seeds(&self.id.0);
            if result.responded == 0 {
                // A dead or empty seed list would otherwise spin here.
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            if seeds.is_empty() {
                seeds.extend(
                    self.bootstrap_addrs
                        .iter()
                        .filter_map(|h| h.parse().ok())
                        .map(|a| (None, a)),
                );
            }
        }
        warn!("bootstrap budget expired");
        self.events.publish(Event::new(EventPayload::DhtBootstrapFailed {
            reason: format!("budget of {BOOTSTRAP_BUDGET:?} expired after {round} rounds"),
        }));
        false
    }

    /// Inserts a node, running the eviction ping protocol when the
    /// bucket is full of live-looking entries.
    fn insert_node(self: &Arc<Self>, id: NodeId, addr: SocketAddr, now: Instant) {
        let result = self.routing_table.write().add_node(id, addr, now);
        if let InsertResult::PendingEviction {
            candidate,
            candidate_addr,
        } = result
        {
            let this = self.clone();
            tokio::spawn(
                async move {
                    match this
                        .request(DhtQuery::Ping, candidate_addr, Some(candidate))
                        .await
                    {
                        // Candidate is alive; the newcomer is dropped.
                        Ok(_) => trace!(%candidate_addr, "eviction candidate survived"),
                        Err(_) => {
                            let replaced = this.routing_table.write().evict_replace(
                                &candidate,
                                id,
                                addr,
                                Instant::now(),
                            );
                            trace!(replaced, %addr, "evicted unresponsive node");
                        }
                    }
                }
                .instrument(debug_span!("eviction_ping")),
            );
        }
    }

    /// Source-level malformed traffic accounting. Returns true when the
    /// source is currently muted.
    fn source_muted(&self, ip: IpAddr, now: Instant) -> bool {
        let mut sources = self.sources.lock();
        match sources.get(&ip) {
            Some(s) => match s.muted_until {
                Some(until) if now < until => true,
                _ => false,
            },
            None => false,
        }
    }

    fn note_malformed(&self, ip: IpAddr, now: Instant) {
        self.counters
            .malformed_packets
            .fetch_add(1, Ordering::Relaxed);
        let mut sources = self.sources.lock();
        let entry = sources.entry(ip).or_default();
        match entry.window_start {
            Some(start) if now.saturating_duration_since(start) < MALFORMED_WINDOW => {
                entry.count += 1;
            }
            _ => {
                entry.window_start = Some(now);
                entry.count = 1;
            }
        }
        if entry.count > MALFORMED_PER_MINUTE_LIMIT {
            warn!(%ip, "muting source for {MALFORMED_MUTE:?} after repeated malformed traffic");
            entry.muted_until = Some(now + MALFORMED_MUTE);
            entry.count = 0;
            entry.window_start = None;
        }
    }

    /// Drops throttle entries whose mute has elapsed and whose counting
    /// window is stale, so hostile-source state stays bounded no matter
    /// how many distinct IPs send garbage. Returns how many were purged.
    fn purge_sources(&self, now: Instant) -> usize {
        let mut sources = self.sources.lock();
        let before = sources.len();
        sources.retain(|_, s| {
            if let Some(until) = s.muted_until {
                if now < until {
                    return true;
                }
            }
            matches!(
                s.window_start,
                Some(start) if now.saturating_duration_since(start) < MALFORMED_WINDOW
            )
        });
        before - sources.len()
    }

    fn handle_packet(self: &Arc<Self>, buf: &[u8], addr: SocketAddr) {
        let now = Instant::now();
        if self.source_muted(addr.ip(), now) {
            return;
        }
        match krpc::deserialize_message(buf) {
            Ok(msg) => {
                if let Err(e) = self.on_received_message(msg, addr) {
                    debug!(%addr, "error handling message: {e:#}");
                }
            }
            Err(e) => {
                debug!(%addr, "malformed packet: {e:#}");
                self.note_malformed(addr.ip(), now);
            }
        }
    }

    fn on_received_message(self: &Arc<Self>, msg: Message, addr: SocketAddr) -> anyhow::Result<()> {
        let our_tid = msg.get_our_transaction_id();
        let Message {
            transaction_id,
            kind,
            ..
        } = msg;
        match kind {
            MessageKind::Response(r) => {
                self.resolve_transaction(our_tid, addr, Outcome::Response(r))
            }
            MessageKind::Error(e) => self.resolve_transaction(our_tid, addr, Outcome::Error(e)),
            MessageKind::PingRequest(req) => {
                self.on_inbound_query(&req.id, addr)?;
                self.reply(
                    transaction_id,
                    addr,
                    Response {
                        id: self.id,
                        ..Default::default()
                    },
                )
            }
            MessageKind::FindNodeRequest(req) => {
                self.on_inbound_query(&req.id, addr)?;
                self.reply(
                    transaction_id,
                    addr,
                    Response {
                        id: self.id,
                        nodes: self.compact_nodes_v4(&req.target.0, addr),
                        nodes6: self.compact_nodes_v6(&req.target.0, addr),
                        ..Default::default()
                    },
                )
            }
            MessageKind::GetPeersRequest(req) => {
                self.on_inbound_query(&req.id, addr)?;
                if self
                    .observed
                    .observe_get_peers(req.info_hash, addr, Instant::now())
                {
                    self.events
                        .publish(Event::new(EventPayload::InfoHashDiscovered {
                            info_hash: req.info_hash,
                            source: addr,
                        }));
                }
                let values: Vec<SocketAddr> = self
                    .observed
                    .peers_for(&req.info_hash)
                    .into_iter()
                    .filter(|p| p.is_ipv4() == addr.is_ipv4())
                    .collect();
                self.reply(
                    transaction_id,
                    addr,
                    Response {
                        id: self.id,
                        nodes: self.compact_nodes_v4(&req.info_hash.0, addr),
                        nodes6: self.compact_nodes_v6(&req.info_hash.0, addr),
                        token: Some(ByteBuf::from(self.tokens.issue(&addr.ip()).to_vec())),
                        values: if values.is_empty() {
                            None
                        } else {
                            Some(CompactPeerList(values))
                        },
                    },
                )
            }
            MessageKind::AnnouncePeerRequest(req) => {
                self.on_inbound_query(&req.id, addr)?;
                if !self.tokens.verify(&addr.ip(), &req.token) {
                    // Mainline behavior: a bad token gets silence, not an
                    // error response.
                    trace!(%addr, "announce_peer with invalid token dropped");
                    return Ok(());
                }
                let peer_addr = if req.implied_port != 0 {
                    addr
                } else {
                    SocketAddr::new(addr.ip(), req.port)
                };
                let now = Instant::now();
                let emit = self
                    .observed
                    .observe_announce(req.info_hash, addr, peer_addr, now);
                if emit {
                    self.events
                        .publish(Event::new(EventPayload::InfoHashDiscovered {
                            info_hash: req.info_hash,
                            source: addr,
                        }));
                }
                self.events.publish(Event::new(EventPayload::PeerDiscovered {
                    info_hash: req.info_hash,
                    addr: peer_addr,
                }));
                self.reply(
                    transaction_id,
                    addr,
                    Response {
                        id: self.id,
                        ..Default::default()
                    },
                )
            }
        }
    }

    fn resolve_transaction(
        &self,
        our_tid: Option<u16>,
        addr: SocketAddr,
        outcome: Outcome,
    ) -> anyhow::Result<()> {
        self.counters
            .responses_received
            .fetch_add(1, Ordering::Relaxed);
        let tid = our_tid.context("response with foreign transaction id")?;
        let row = self
            .transactions
            .remove(tid, addr)
            .context("no outstanding request for this response")?;
        if row.done.send(outcome).is_err() {
            trace!("response arrived but the requester is gone");
        }
        Ok(())
    }

    /// Common handling for any inbound query: counting, the serving
    /// gate, and table upkeep for the sender.
    fn on_inbound_query(self: &Arc<Self>, sender: &NodeId, addr: SocketAddr) -> anyhow::Result<()> {
        self.counters
            .queries_received
            .fetch_add(1, Ordering::Relaxed);
        if !self.serving.load(Ordering::Relaxed) {
            bail!("inbound query processing is disabled");
        }
        let now = Instant::now();
        self.routing_table.write().mark_seen(sender, now);
        self.insert_node(*sender, addr, now);
        Ok(())
    }

    fn compact_nodes_v4(&self, target: &Id20, querier: SocketAddr) -> Option<CompactNodeListV4> {
        if !querier.is_ipv4() {
            return None;
        }
        let nodes: Vec<CompactNode> = self
            .routing_table
            .read()
            .closest_nodes(target, Instant::now(), K)
            .into_iter()
            .filter(|n| n.addr().is_ipv4())
            .map(|n| CompactNode {
                id: n.id(),
                addr: n.addr(),
            })
            .collect();
        Some(CompactNodeListV4(nodes))
    }

    fn compact_nodes_v6(&self, target: &Id20, querier: SocketAddr) -> Option<CompactNodeListV6> {
        if querier.is_ipv4() {
            return None;
        }
        let nodes: Vec<CompactNode> = self
            .routing_table
            .read()
            .closest_nodes(target, Instant::now(), K)
            .into_iter()
            .filter(|n| n.addr().is_ipv6())
            .map(|n| CompactNode {
                id: n.id(),
                addr: n.addr(),
            })
            .collect();
        Some(CompactNodeListV6(nodes))
    }

    fn reply(&self, transaction_id: ByteBuf, addr: SocketAddr, response: Response) -> anyhow::Result<()> {
        self.out_tx
            .send(Outbound {
                tracked: None,
                message: Message::response_to(transaction_id, response),
                addr,
            })
            .context("dht worker is gone")
    }
}

fn make_rate_limiter(queries_per_second: usize) -> RateLimiter {
    let per_100_ms = (queries_per_second / 10).max(1);
    RateLimiter::builder()
        .initial(per_100_ms)
        .max(queries_per_second)
        .interval(Duration::from_millis(100))
        .refill(per_100_ms)
        .build()
}

struct DhtWorker {
    socket: UdpSocket,
    engine: Arc<DhtEngine>,
}

impl DhtWorker {
    async fn run(&self, out_rx: UnboundedReceiver<Outbound>) -> anyhow::Result<()> {
        let framer = self.framer(out_rx).instrument(debug_span!("framer"));
        let sweeper = self.sweeper().instrument(debug_span!("sweeper"));
        let rotator = self.rotator().instrument(debug_span!("rotator"));
        let pinger = self.pinger().instrument(error_span!("pinger"));
        let refresher = self.refresher().instrument(error_span!("refresher"));
        let purger = self.purger().instrument(debug_span!("purger"));

        tokio::pin!(framer);
        tokio::pin!(sweeper);
        tokio::pin!(rotator);
        tokio::pin!(pinger);
        tokio::pin!(refresher);
        tokio::pin!(purger);

        tokio::select! {
            err = &mut framer => bail!("framer quit: {err:?}"),
            err = &mut sweeper => bail!("sweeper quit: {err:?}"),
            err = &mut rotator => bail!("rotator quit: {err:?}"),
            err = &mut pinger => bail!("pinger quit: {err:?}"),
            err = &mut refresher => bail!("refresher quit: {err:?}"),
            err = &mut purger => bail!("purger quit: {err:?}"),
        }
    }

    /// Owns both socket halves: serializes outbound messages and feeds
    /// inbound datagrams to the engine.
    async fn framer(&self, out_rx: UnboundedReceiver<Outbound>) -> anyhow::Result<()> {
        tokio::select! {
            r = self.write_loop(out_rx) => r,
            r = self.read_loop() => r,
        }
    }

    async fn write_loop(&self, mut out_rx: UnboundedReceiver<Outbound>) -> anyhow::Result<()> {
        while let Some(Outbound {
            tracked,
            message,
            addr,
        }) = out_rx.recv().await
        {
            let buf = match krpc::serialize_message(&message) {
                Ok(buf) => buf,
                Err(e) => {
                    warn!("serialize failed: {e:#}");
                    continue;
                }
            };
            if let Err(e) = self.socket.send_to(&buf, addr).await {
                // Send errors are never fatal; a tracked request is
                // failed immediately instead of waiting out its
                // deadline.
                debug!(%addr, "send error: {e:#}");
                if let Some((tid, addr)) = tracked {
                    if let Some(txn) = self.engine.transactions.remove(tid, addr) {
                        let _ = txn.done.send(Outcome::Timeout);
                    }
                }
            }
        }
        bail!("outbound channel closed")
    }

    async fn read_loop(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; 16384];
        loop {
            let (size, addr) = self
                .socket
                .recv_from(&mut buf)
                .await
                .context("error reading from UDP socket")?;
            self.engine.handle_packet(&buf[..size], addr);
        }
    }

    /// Expires transactions every 250 ms so lost datagrams resume their
    /// waiters promptly.
    async fn sweeper(&self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let expired = self.engine.transactions.expire(Instant::now());
            if expired > 0 {
                trace!(expired, "expired transactions");
            }
        }
    }

    async fn rotator(&self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(TOKEN_ROTATE_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            self.engine.tokens.rotate();
            trace!("rotated token secrets");
        }
    }

    /// Pings Questionable nodes so they either refresh to Good or walk
    /// toward Bad and get replaced.
    async fn pinger(&self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(INACTIVITY_TIMEOUT / 4);
        interval.tick().await;
        let mut futs = FuturesUnordered::new();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Instant::now();
                    let questionable: Vec<(NodeId, SocketAddr)> = self
                        .engine
                        .routing_table
                        .read()
                        .iter_nodes()
                        .filter(|n| n.status(now) == NodeStatus::Questionable)
                        .map(|n| (n.id(), n.addr()))
                        .collect();
                    trace!(count = questionable.len(), "pinging questionable nodes");
                    for (id, addr) in questionable {
                        let engine = self.engine.clone();
                        futs.push(async move {
                            let _ = engine.request(DhtQuery::Ping, addr, Some(id)).await;
                        });
                    }
                }
                _ = futs.next(), if !futs.is_empty() => {}
            }
        }
    }

    /// Refreshes idle buckets: one find_node(random-in-prefix) to each
    /// bucket's least-recently-seen node every 15 minutes.
    async fn refresher(&self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await;
        let mut futs = FuturesUnordered::new();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Instant::now();
                    let candidates = self.engine.routing_table.read().refresh_candidates(now);
                    for (idx, random_id, lru) in candidates {
                        self.engine.routing_table.write().note_refreshed(idx, now);
                        let engine = self.engine.clone();
                        futs.push(async move {
                            let _ = engine
                                .request(DhtQuery::FindNode(random_id), lru.addr(), Some(lru.id()))
                                .await;
                        });
                    }
                }
                _ = futs.next(), if !futs.is_empty() => {}
            }
        }
    }

    async fn purger(&self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await;
        loop {
            interval.tick().await;
            let now = Instant::now();
            let purged = self.engine.observed.purge(now);
            if purged > 0 {
                debug!(purged, "purged harvested records");
            }
            let dropped = self.engine.purge_sources(now);
            if dropped > 0 {
                trace!(dropped, "dropped stale source throttles");
            }
        }
    }
}
