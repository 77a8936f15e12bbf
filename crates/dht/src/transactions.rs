//! In-flight query bookkeeping. Rows are keyed `(txid, addr)`; a
//! dedicated sweeper task expires them so a lost datagram resumes the
//! waiting continuation with a timeout instead of leaking it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Instant;

use dashmap::DashMap;

use crate::krpc::{ErrorResponse, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

#[derive(Debug)]
pub enum Outcome {
    Response(Response),
    Error(ErrorResponse),
    Timeout,
}

// Retry accounting lives with the requester; a row only tracks what is
// needed to route the response or expire it.
pub struct Transaction {
    pub kind: QueryKind,
    pub deadline: Instant,
    pub done: tokio::sync::oneshot::Sender<Outcome>,
}

pub struct TransactionTable {
    next_id: AtomicU16,
    // Fixed per-socket mask so txids do not collide trivially across
    // restarts.
    mask: u16,
    inflight: DashMap<(u16, SocketAddr), Transaction>,
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionTable {
    pub fn new() -> Self {
        TransactionTable {
            next_id: AtomicU16::new(0),
            mask: rand::random(),
            inflight: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    /// Allocates a txid unique among live transactions to `addr` and
    /// registers the row.
    pub fn insert(&self, addr: SocketAddr, txn: Transaction) -> u16 {
        loop {
            let tid = self.next_id.fetch_add(1, Ordering::Relaxed) ^ self.mask;
            match self.inflight.entry((tid, addr)) {
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(v) => {
                    v.insert(txn);
                    return tid;
                }
            }
        }
    }

    /// Removes the row matching an inbound response or error.
    pub fn remove(&self, tid: u16, addr: SocketAddr) -> Option<Transaction> {
        self.inflight.remove(&(tid, addr)).map(|(_, txn)| txn)
    }

    /// Expires rows whose deadline has passed, resuming each waiting
    /// continuation with `Outcome::Timeout`. Returns how many expired.
    pub fn expire(&self, now: Instant) -> usize {
        let expired: Vec<(u16, SocketAddr)> = self
            .inflight
            .iter()
            .filter(|e| e.value().deadline <= now)
            .map(|e| *e.key())
            .collect();
        let mut count = 0;
        for key in expired {
            if let Some((_, txn)) = self.inflight.remove(&key) {
                count += 1;
                let _ = txn.done.send(Outcome::Timeout);
            }
        }
        count
    }

    /// Drops every row; waiting continuations observe a closed channel.
    pub fn clear(&self) {
        self.inflight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn txn(deadline: Instant) -> (Transaction, tokio::sync::oneshot::Receiver<Outcome>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        (
            Transaction {
                kind: QueryKind::Ping,
                deadline,
                done: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn txids_are_unique_among_live_rows() {
        let table = TransactionTable::new();
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = HashSet::new();
        let mut rxs = Vec::new();
        for _ in 0..500 {
            let (t, rx) = txn(deadline);
            let tid = table.insert(addr, t);
            assert!(seen.insert(tid), "duplicate live txid {tid}");
            rxs.push(rx);
        }
        assert_eq!(table.len(), 500);
    }

    #[tokio::test]
    async fn response_removes_the_row() {
        let table = TransactionTable::new();
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let (t, mut rx) = txn(Instant::now() + Duration::from_secs(5));
        let tid = table.insert(addr, t);

        // A response from a different address must not match.
        let other: SocketAddr = "127.0.0.2:6881".parse().unwrap();
        assert!(table.remove(tid, other).is_none());

        let row = table.remove(tid, addr).unwrap();
        assert_eq!(row.kind, QueryKind::Ping);
        assert!(table.is_empty());
        drop(row);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sweeper_expires_and_resumes_continuations() {
        let table = TransactionTable::new();
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let now = Instant::now();
        let (t1, rx1) = txn(now);
        let (t2, mut rx2) = txn(now + Duration::from_secs(60));
        table.insert(addr, t1);
        table.insert(addr, t2);

        assert_eq!(table.expire(now + Duration::from_millis(1)), 1);
        assert!(matches!(rx1.await, Ok(Outcome::Timeout)));
        assert!(rx2.try_recv().is_err());
        assert_eq!(table.len(), 1);
    }
}
