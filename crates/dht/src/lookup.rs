//! Iterative Kademlia lookup with α in-flight queries converging on the
//! K closest responders. Generic over the query function; the engine
//! plugs in its transaction machinery, tests plug in scripted networks.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tracing::trace;

use bitscrape_types::compact::CompactNode;
use bitscrape_types::{Id20, NodeId};

use crate::krpc::Response;
use crate::{ALPHA, K, LOOKUP_BUDGET};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    FindNode,
    GetPeers,
}

#[derive(Debug, Clone)]
pub struct LookupConfig {
    pub target: Id20,
    pub kind: LookupKind,
    pub budget: Duration,
    /// Stop as soon as any peers arrive (useful when one live peer is
    /// enough to start a metadata exchange).
    pub early_exit_on_peers: bool,
}

impl LookupConfig {
    pub fn find_node(target: Id20) -> Self {
        LookupConfig {
            target,
            kind: LookupKind::FindNode,
            budget: LOOKUP_BUDGET,
            early_exit_on_peers: false,
        }
    }

    pub fn get_peers(target: Id20) -> Self {
        LookupConfig {
            target,
            kind: LookupKind::GetPeers,
            budget: LOOKUP_BUDGET,
            early_exit_on_peers: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct LookupResult {
    /// The K closest nodes that returned a valid response.
    pub nodes: Vec<CompactNode>,
    /// Union of `values` from every response (get_peers only).
    pub peers: Vec<SocketAddr>,
    /// Write tokens keyed by the responder that granted them.
    pub tokens: HashMap<SocketAddr, Vec<u8>>,
    pub queried: usize,
    pub responded: usize,
}

struct Candidate {
    id: Option<NodeId>,
    addr: SocketAddr,
    queried: bool,
}

impl Candidate {
    fn distance(&self, target: &Id20) -> Id20 {
        match &self.id {
            Some(id) => id.0.distance(target),
            None => Id20::MAX,
        }
    }
}

const SHORTLIST_CAP: usize = 512;

pub async fn iterative_lookup<Q, Fut>(
    config: &LookupConfig,
    seeds: Vec<(Option<NodeId>, SocketAddr)>,
    query: Q,
) -> LookupResult
where
    Q: Fn(SocketAddr) -> Fut,
    Fut: Future<Output = anyhow::Result<Response>>,
{
    let deadline = tokio::time::Instant::now() + config.budget;
    let target = config.target;

    let mut shortlist: Vec<Candidate> = Vec::new();
    for (id, addr) in seeds {
        if !shortlist.iter().any(|c| c.addr == addr) {
            shortlist.push(Candidate {
                id,
                addr,
                queried: false,
            });
        }
    }

    let mut responded: Vec<(NodeId, SocketAddr)> = Vec::new();
    let mut peers: Vec<SocketAddr> = Vec::new();
    let mut tokens: HashMap<SocketAddr, Vec<u8>> = HashMap::new();
    let mut queried_count = 0usize;

    let mut in_flight = FuturesUnordered::new();

    'outer: loop {
        // The K-th closest responder bounds which candidates are still
        // worth querying.
        let kth_distance: Option<Id20> = if responded.len() >= K {
            let mut dists: Vec<Id20> = responded.iter().map(|(id, _)| id.0.distance(&target)).collect();
            dists.sort();
            Some(dists[K - 1])
        } else {
            None
        };

        while in_flight.len() < ALPHA {
            let next = shortlist
                .iter_mut()
                .filter(|c| !c.queried)
                .filter(|c| match &kth_distance {
                    Some(kth) => c.distance(&target) < *kth,
                    None => true,
                })
                .min_by_key(|c| c.distance(&target));
            let Some(candidate) = next else { break };
            candidate.queried = true;
            queried_count += 1;
            let addr = candidate.addr;
            trace!(%addr, "querying");
            let fut = query(addr);
            in_flight.push(async move { (addr, fut.await) });
        }

        if in_flight.is_empty() {
            // Nothing pending and every useful candidate was queried.
            break;
        }

        let next = match tokio::time::timeout_at(deadline, in_flight.next()).await {
            Ok(Some(v)) => v,
            Ok(None) => break,
            Err(_) => {
                trace!("lookup budget exhausted");
                break;
            }
        };

        let (addr, result) = next;
        let response = match result {
            Ok(r) => r,
            Err(e) => {
                trace!(%addr, "lookup query failed: {e:#}");
                continue;
            }
        };

        if !responded.iter().any(|(_, a)| *a == addr) {
            responded.push((response.id, addr));
        }
        if let Some(c) = shortlist.iter_mut().find(|c| c.addr == addr) {
            c.id.get_or_insert(response.id);
        }
        if let Some(token) = &response.token {
            tokens.insert(addr, token.to_vec());
        }
        if let Some(values) = &response.values {
            for peer in &values.0 {
                if !peers.contains(peer) {
                    peers.push(*peer);
                }
            }
            if config.early_exit_on_peers && !peers.is_empty() {
                trace!(peers = peers.len(), "early exit on first peers");
                break 'outer;
            }
        }

        let discovered = response
            .nodes
            .iter()
            .flat_map(|n| n.0.iter())
            .chain(response.nodes6.iter().flat_map(|n| n.0.iter()));
        for node in discovered {
            let known = shortlist
                .iter()
                .any(|c| c.addr == node.addr || c.id == Some(node.id));
            if !known {
                shortlist.push(Candidate {
                    id: Some(node.id),
                    addr: node.addr,
                    queried: false,
                });
            }
        }
        if shortlist.len() > SHORTLIST_CAP {
            // Keep the closest unqueried tail bounded; queried entries
            // stay for dedup.
            shortlist.sort_by_key(|c| (c.queried, c.distance(&target)));
            shortlist.truncate(SHORTLIST_CAP);
        }
    }

    responded.sort_by_key(|(id, _)| id.0.distance(&target));
    let responded_count = responded.len();
    LookupResult {
        nodes: responded
            .iter()
            .take(K)
            .map(|(id, addr)| CompactNode {
                id: *id,
                addr: *addr,
            })
            .collect(),
        peers,
        tokens,
        queried: queried_count,
        responded: responded_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::krpc::{CompactNodeListV4, CompactPeerList};
    use parking_lot::Mutex;
    use serde_bytes::ByteBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Ids sharing `level * 8` leading bits with the target: every level
    /// is strictly closer than the one before.
    fn level_id(target: &Id20, level: u8, salt: u8) -> NodeId {
        let mut id = Id20::default();
        id.0[19] = salt;
        id.0[18] = level + 1;
        for bit in 0..(level as u8) * 8 {
            id.set_bit(bit, target.get_bit(bit));
        }
        // Diverge right after the shared prefix.
        id.set_bit(level * 8, !target.get_bit(level * 8));
        NodeId(id)
    }

    fn level_addr(level: u8, salt: u8) -> SocketAddr {
        format!("127.0.0.1:{}", 20000 + level as u16 * 100 + salt as u16)
            .parse()
            .unwrap()
    }

    struct MockNet {
        responses: HashMap<SocketAddr, Response>,
        queries: AtomicUsize,
        log: Mutex<Vec<SocketAddr>>,
    }

    impl MockNet {
        fn query(&self, addr: SocketAddr) -> anyhow::Result<Response> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.log.lock().push(addr);
            self.responses
                .get(&addr)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no route to {addr}"))
        }
    }

    #[tokio::test]
    async fn converging_find_node_terminates() {
        // Levels 0..=6, 8 nodes per level. Level i responds with all of
        // level i+1; level 6 responds with itself (stable frontier).
        let target = Id20::from_hex("5555555555555555555555555555555555555555").unwrap();
        let mut responses = HashMap::new();
        let level_nodes = |level: u8| -> Vec<CompactNode> {
            (0..8)
                .map(|salt| CompactNode {
                    id: level_id(&target, level, salt),
                    addr: level_addr(level, salt),
                })
                .collect()
        };
        for level in 0..=6u8 {
            let next = level_nodes(if level < 6 { level + 1 } else { 6 });
            for node in level_nodes(level) {
                responses.insert(
                    node.addr,
                    Response {
                        id: node.id,
                        nodes: Some(CompactNodeListV4(next.clone())),
                        ..Default::default()
                    },
                );
            }
        }
        let net = Arc::new(MockNet {
            responses,
            queries: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        });

        let seeds: Vec<_> = level_nodes(0)
            .into_iter()
            .map(|n| (Some(n.id), n.addr))
            .collect();
        let config = LookupConfig::find_node(target);
        let net2 = net.clone();
        let result = iterative_lookup(&config, seeds, move |addr| {
            let net = net2.clone();
            async move { net.query(addr) }
        })
        .await;

        assert_eq!(result.nodes.len(), K);
        // The final set must be exactly the deepest level, sorted by
        // distance.
        for node in &result.nodes {
            assert!(node.id.0.common_prefix_len(&target) >= 48);
        }
        for pair in result.nodes.windows(2) {
            assert!(pair[0].id.0.distance(&target) <= pair[1].id.0.distance(&target));
        }
        let issued = net.queries.load(Ordering::SeqCst);
        assert!(issued <= 32, "issued {issued} queries");
        assert_eq!(result.queried, issued);
    }

    #[tokio::test]
    async fn get_peers_collects_values_and_tokens() {
        let target = Id20::random();
        let responder_id = NodeId::random();
        let responder_addr: SocketAddr = "127.0.0.1:6882".parse().unwrap();
        let peer: SocketAddr = "127.0.0.1:6999".parse().unwrap();
        let mut responses = HashMap::new();
        responses.insert(
            responder_addr,
            Response {
                id: responder_id,
                token: Some(ByteBuf::from(vec![1, 2, 3, 4])),
                values: Some(CompactPeerList(vec![peer])),
                ..Default::default()
            },
        );
        let net = Arc::new(MockNet {
            responses,
            queries: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        });

        let mut config = LookupConfig::get_peers(target);
        config.early_exit_on_peers = true;
        let net2 = net.clone();
        let result = iterative_lookup(
            &config,
            vec![(Some(responder_id), responder_addr)],
            move |addr| {
                let net = net2.clone();
                async move { net.query(addr) }
            },
        )
        .await;

        assert_eq!(result.peers, vec![peer]);
        assert_eq!(result.tokens.get(&responder_addr).unwrap(), &[1, 2, 3, 4]);
        assert_eq!(result.responded, 1);
    }

    #[tokio::test]
    async fn unresponsive_network_respects_budget() {
        let target = Id20::random();
        let seeds: Vec<(Option<NodeId>, SocketAddr)> = (0..4)
            .map(|i| {
                (
                    Some(NodeId::random()),
                    format!("127.0.0.1:{}", 30000 + i).parse().unwrap(),
                )
            })
            .collect();
        let mut config = LookupConfig::find_node(target);
        config.budget = Duration::from_millis(100);

        let started = tokio::time::Instant::now();
        let result = iterative_lookup(&config, seeds, |_addr| futures::future::pending()).await;
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(result.nodes.is_empty());
        assert_eq!(result.responded, 0);
    }

    #[tokio::test]
    async fn failing_queries_do_not_stall() {
        let target = Id20::random();
        let good_id = NodeId::random();
        let good_addr: SocketAddr = "127.0.0.1:31000".parse().unwrap();
        let mut responses = HashMap::new();
        responses.insert(
            good_addr,
            Response {
                id: good_id,
                ..Default::default()
            },
        );
        let net = Arc::new(MockNet {
            responses,
            queries: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        });
        let seeds = vec![
            (Some(NodeId::random()), "127.0.0.1:31001".parse().unwrap()),
            (Some(good_id), good_addr),
        ];
        let net2 = net.clone();
        let result = iterative_lookup(&LookupConfig::find_node(target), seeds, move |addr| {
            let net = net2.clone();
            async move { net.query(addr) }
        })
        .await;
        assert_eq!(result.responded, 1);
        assert_eq!(result.nodes[0].id, good_id);
    }
}
