//! The storage collaborator contract and the JSONL implementation the
//! binary ships with. Calls never block the caller: rows go onto an
//! unbounded queue and a writer task drains it. Storage errors are
//! warnings to the core, never failures.

use std::net::SocketAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use bitscrape_dht::NodeStatus;
use bitscrape_types::{InfoHash, NodeId};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage queue is closed")]
    QueueClosed,
}

/// The narrow interface the core consumes. Implementations queue
/// internally; every method must return without I/O.
pub trait Storage: Send + Sync + 'static {
    fn store_infohash(
        &self,
        info_hash: InfoHash,
        first_seen: DateTime<Utc>,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    fn store_peer(
        &self,
        info_hash: InfoHash,
        endpoint: SocketAddr,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    fn store_metadata(
        &self,
        info_hash: InfoHash,
        info_bytes: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    fn record_dht_node(
        &self,
        node_id: NodeId,
        endpoint: SocketAddr,
        status: NodeStatus,
    ) -> Result<(), StorageError>;

    /// Drains whatever is queued; used at shutdown.
    fn flush(&self) -> BoxFuture<'static, ()>;
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Row {
    Infohash {
        info_hash: String,
        first_seen: DateTime<Utc>,
        last_seen: DateTime<Utc>,
    },
    Peer {
        info_hash: String,
        endpoint: SocketAddr,
        seen_at: DateTime<Utc>,
    },
    Metadata {
        info_hash: String,
        info_hex: String,
        size: usize,
        received_at: DateTime<Utc>,
    },
    DhtNode {
        node_id: String,
        endpoint: SocketAddr,
        status: String,
    },
}

enum Command {
    Write(Box<Row>),
    Flush(tokio::sync::oneshot::Sender<()>),
}

/// Appends one JSON object per row to a local file.
pub struct JsonlStorage {
    tx: UnboundedSender<Command>,
}

impl JsonlStorage {
    pub fn spawn(path: PathBuf) -> JsonlStorage {
        let (tx, rx) = unbounded_channel();
        tokio::spawn(writer_task(path, rx));
        JsonlStorage { tx }
    }

    fn enqueue(&self, row: Row) -> Result<(), StorageError> {
        self.tx
            .send(Command::Write(Box::new(row)))
            .map_err(|_| StorageError::QueueClosed)
    }
}

async fn writer_task(path: PathBuf, mut rx: UnboundedReceiver<Command>) {
    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(f) => f,
        Err(e) => {
            warn!(?path, "cannot open storage output: {e:#}; rows will be dropped");
            while let Some(cmd) = rx.recv().await {
                if let Command::Flush(ack) = cmd {
                    let _ = ack.send(());
                }
            }
            return;
        }
    };
    let mut line = Vec::with_capacity(512);
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Write(row) => {
                line.clear();
                if let Err(e) = serde_json::to_writer(&mut line, &*row) {
                    warn!("row serialization failed: {e:#}");
                    continue;
                }
                line.push(b'\n');
                if let Err(e) = file.write_all(&line).await {
                    warn!("storage write failed: {e:#}");
                }
            }
            Command::Flush(ack) => {
                if let Err(e) = file.flush().await {
                    warn!("storage flush failed: {e:#}");
                }
                let _ = ack.send(());
            }
        }
    }
    let _ = file.flush().await;
    debug!(?path, "storage writer exiting");
}

impl Storage for JsonlStorage {
    fn store_infohash(
        &self,
        info_hash: InfoHash,
        first_seen: DateTime<Utc>,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.enqueue(Row::Infohash {
            info_hash: info_hash.as_string(),
            first_seen,
            last_seen,
        })
    }

    fn store_peer(
        &self,
        info_hash: InfoHash,
        endpoint: SocketAddr,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.enqueue(Row::Peer {
            info_hash: info_hash.as_string(),
            endpoint,
            seen_at,
        })
    }

    fn store_metadata(
        &self,
        info_hash: InfoHash,
        info_bytes: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.enqueue(Row::Metadata {
            info_hash: info_hash.as_string(),
            info_hex: hex::encode(info_bytes),
            size: info_bytes.len(),
            received_at,
        })
    }

    fn record_dht_node(
        &self,
        node_id: NodeId,
        endpoint: SocketAddr,
        status: NodeStatus,
    ) -> Result<(), StorageError> {
        self.enqueue(Row::DhtNode {
            node_id: node_id.as_string(),
            endpoint,
            status: format!("{status:?}").to_lowercase(),
        })
    }

    fn flush(&self) -> BoxFuture<'static, ()> {
        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        let sent = self.tx.send(Command::Flush(ack_tx)).is_ok();
        async move {
            if sent {
                let _ = ack_rx.await;
            }
        }
        .boxed()
    }
}

/// Discards everything; handy for tests and dry runs.
#[derive(Default)]
pub struct NullStorage;

impl Storage for NullStorage {
    fn store_infohash(
        &self,
        _info_hash: InfoHash,
        _first_seen: DateTime<Utc>,
        _last_seen: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        Ok(())
    }

    fn store_peer(
        &self,
        _info_hash: InfoHash,
        _endpoint: SocketAddr,
        _seen_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        Ok(())
    }

    fn store_metadata(
        &self,
        _info_hash: InfoHash,
        _info_bytes: &[u8],
        _received_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        Ok(())
    }

    fn record_dht_node(
        &self,
        _node_id: NodeId,
        _endpoint: SocketAddr,
        _status: NodeStatus,
    ) -> Result<(), StorageError> {
        Ok(())
    }

    fn flush(&self) -> BoxFuture<'static, ()> {
        async {}.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jsonl_rows_land_in_the_file() {
        let dir = std::env::temp_dir().join(format!("bitscrape-storage-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.jsonl");
        let storage = JsonlStorage::spawn(path.clone());

        let hash = InfoHash::random();
        let now = Utc::now();
        storage.store_infohash(hash, now, now).unwrap();
        storage
            .store_peer(hash, "127.0.0.1:6999".parse().unwrap(), now)
            .unwrap();
        storage.store_metadata(hash, b"d4:name4:teste", now).unwrap();
        storage
            .record_dht_node(
                NodeId::random(),
                "10.0.0.1:6881".parse().unwrap(),
                NodeStatus::Good,
            )
            .unwrap();
        storage.flush().await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        for line in &lines {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(v.get("kind").is_some());
        }
        assert!(lines[0].contains(&hash.as_string()));
        assert!(lines[2].contains(&hex::encode(b"d4:name4:teste")));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
