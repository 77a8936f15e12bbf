//! One TCP peer connection running the crawler's only conversation:
//! handshake, extension negotiation, then the ut_metadata exchange.
//!
//! ```text
//! Disconnected ── connect() ──► Connecting ── TCP up ──► Handshaking
//!       ▲                           │                        │
//!       └────────── failure ────────┘        ok ──► Connected ── error/done ──► Disconnecting ──► Disconnected
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use bitscrape_peer_protocol::extended::{ExtendedHandshake, ExtendedMessage};
use bitscrape_peer_protocol::ut_metadata::UtMetadata;
use bitscrape_peer_protocol::{read_message, Handshake, Message, ProtocolError};
use bitscrape_types::{InfoHash, PeerId};

use crate::metadata::{MetadataExchange, RecordOutcome};
use crate::{CONNECT_TIMEOUT, EXCHANGE_BUDGET, HANDSHAKE_TIMEOUT, IDLE_TIMEOUT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, Copy)]
pub struct PeerConnectionOptions {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub exchange_budget: Duration,
}

impl Default for PeerConnectionOptions {
    fn default() -> Self {
        PeerConnectionOptions {
            connect_timeout: CONNECT_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
            exchange_budget: EXCHANGE_BUDGET,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("connect failed: {0}")]
    Connect(std::io::Error),
    #[error("timed out connecting")]
    ConnectTimeout,
    #[error("timed out handshaking")]
    HandshakeTimeout,
    #[error("peer answered for a different infohash")]
    WrongInfoHash,
    #[error("peer does not support the extension protocol")]
    NoExtensionSupport,
    #[error("peer did not advertise ut_metadata")]
    NoUtMetadata,
    #[error("advertised metadata size {0} outside (0, 16 MiB]")]
    MetadataSizeOutOfRange(u32),
    #[error("peer rejected piece {0}")]
    PieceRejected(u32),
    #[error("metadata total_size changed mid-exchange: {negotiated} then {received}")]
    TotalSizeChanged { negotiated: u32, received: u32 },
    #[error("piece {0} out of range")]
    PieceOutOfRange(u32),
    #[error("duplicate piece {0}")]
    DuplicatePiece(u32),
    #[error("piece {piece} has {got} bytes, expected {expected}")]
    PieceSizeMismatch {
        piece: u32,
        expected: usize,
        got: usize,
    },
    #[error("reassembled dictionary does not hash to the infohash")]
    HashMismatch,
    #[error("idle timeout")]
    Idle,
    #[error("exchange budget expired")]
    Budget,
    #[error("cancelled")]
    Cancelled,
    #[error("peer closed the connection")]
    PeerClosed,
    #[error(transparent)]
    Protocol(ProtocolError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProtocolError> for FetchError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                FetchError::PeerClosed
            }
            ProtocolError::Io(io) => FetchError::Io(io),
            other => FetchError::Protocol(other),
        }
    }
}

impl FetchError {
    /// Hash-mismatch contributors are banned for the session; everything
    /// else only earns backoff.
    pub fn is_poisonous(&self) -> bool {
        matches!(self, FetchError::HashMismatch)
    }
}

pub struct PeerConnection {
    addr: SocketAddr,
    info_hash: InfoHash,
    local_peer_id: PeerId,
    options: PeerConnectionOptions,
    state: Arc<Mutex<ConnectionState>>,
    remote_peer_id: Mutex<Option<PeerId>>,
}

impl PeerConnection {
    pub fn new(
        addr: SocketAddr,
        info_hash: InfoHash,
        local_peer_id: PeerId,
        options: PeerConnectionOptions,
    ) -> Self {
        PeerConnection {
            addr,
            info_hash,
            local_peer_id,
            options,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            remote_peer_id: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Shared handle for observers (the manager's stats path).
    pub fn state_handle(&self) -> Arc<Mutex<ConnectionState>> {
        self.state.clone()
    }

    pub fn remote_peer_id(&self) -> Option<PeerId> {
        *self.remote_peer_id.lock()
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        trace!(addr = %self.addr, "peer state {:?} -> {next:?}", *state);
        *state = next;
    }

    /// Runs the whole conversation and returns the verified info
    /// dictionary. Always lands in `Disconnected`.
    pub async fn fetch_metadata(&self, cancel: CancellationToken) -> Result<Bytes, FetchError> {
        let result = tokio::select! {
            r = self.run() => r,
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
        };
        self.set_state(ConnectionState::Disconnecting);
        self.set_state(ConnectionState::Disconnected);
        if let Err(e) = &result {
            debug!(addr = %self.addr, "metadata fetch failed: {e}");
        }
        result
    }

    async fn run(&self) -> Result<Bytes, FetchError> {
        self.set_state(ConnectionState::Connecting);
        let mut stream =
            match tokio::time::timeout(self.options.connect_timeout, TcpStream::connect(self.addr))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(FetchError::Connect(e)),
                Err(_) => return Err(FetchError::ConnectTimeout),
            };

        self.set_state(ConnectionState::Handshaking);
        let theirs = tokio::time::timeout(
            self.options.handshake_timeout,
            self.exchange_handshakes(&mut stream),
        )
        .await
        .map_err(|_| FetchError::HandshakeTimeout)??;

        if theirs.info_hash != self.info_hash {
            return Err(FetchError::WrongInfoHash);
        }
        if !theirs.supports_extended() {
            return Err(FetchError::NoExtensionSupport);
        }
        *self.remote_peer_id.lock() = Some(theirs.peer_id);
        trace!(addr = %self.addr, peer = ?theirs.peer_id, "handshake ok");

        self.set_state(ConnectionState::Connected);
        self.exchange_metadata(stream).await
    }

    async fn exchange_handshakes(&self, stream: &mut TcpStream) -> Result<Handshake, FetchError> {
        let ours = Handshake::new(self.info_hash, self.local_peer_id);
        let mut buf = Vec::with_capacity(68);
        ours.serialize(&mut buf);
        stream.write_all(&buf).await?;
        let theirs = Handshake::read_from(stream).await?;
        Ok(theirs)
    }

    async fn exchange_metadata(&self, stream: TcpStream) -> Result<Bytes, FetchError> {
        let (mut rd, mut wr) = stream.into_split();
        let mut write_buf = Vec::with_capacity(4096);

        // BEP 10 handshake goes out first; the peer's own handshake
        // tells us its ut_metadata id and the dictionary size.
        Message::Extended(ExtendedMessage::Handshake(ExtendedHandshake::ours()))
            .serialize(&mut write_buf, 0)?;
        wr.write_all(&write_buf).await?;

        let budget = tokio::time::Instant::now() + self.options.exchange_budget;
        let mut exchange: Option<MetadataExchange> = None;

        loop {
            let idle = tokio::time::Instant::now() + self.options.idle_timeout;
            let deadline = idle.min(budget);
            let msg = match tokio::time::timeout_at(deadline, read_message(&mut rd)).await {
                Ok(msg) => msg?,
                Err(_) if tokio::time::Instant::now() >= budget => return Err(FetchError::Budget),
                Err(_) => return Err(FetchError::Idle),
            };

            match msg {
                Message::Extended(ExtendedMessage::Handshake(hs)) => {
                    if exchange.is_some() {
                        // Re-handshakes update ids in the wild; ignore.
                        continue;
                    }
                    let remote_id = hs.ut_metadata_id().ok_or(FetchError::NoUtMetadata)?;
                    let size = hs.metadata_size.ok_or(FetchError::NoUtMetadata)?;
                    let mut ex = MetadataExchange::new(self.info_hash, remote_id, size)?;
                    trace!(
                        addr = %self.addr,
                        size,
                        pieces = ex.pieces_expected(),
                        client = hs.client_version().as_deref().unwrap_or("?"),
                        "starting metadata exchange"
                    );
                    write_buf.clear();
                    Message::Interested.serialize(&mut write_buf, remote_id)?;
                    for req in ex.fill_window() {
                        Message::Extended(ExtendedMessage::UtMetadata(req))
                            .serialize(&mut write_buf, remote_id)?;
                    }
                    wr.write_all(&write_buf).await?;
                    exchange = Some(ex);
                }
                Message::Extended(ExtendedMessage::UtMetadata(UtMetadata::Data {
                    piece,
                    total_size,
                    payload,
                })) => {
                    let ex = exchange.as_mut().ok_or(FetchError::NoUtMetadata)?;
                    match ex.record_data(piece, total_size, &payload)? {
                        RecordOutcome::Progress(next) => {
                            if !next.is_empty() {
                                let remote_id = ex.remote_ut_metadata_id();
                                write_buf.clear();
                                for req in next {
                                    Message::Extended(ExtendedMessage::UtMetadata(req))
                                        .serialize(&mut write_buf, remote_id)?;
                                }
                                wr.write_all(&write_buf).await?;
                            }
                        }
                        RecordOutcome::Complete(bytes) => {
                            trace!(addr = %self.addr, len = bytes.len(), "metadata complete");
                            let _ = wr.shutdown().await;
                            return Ok(bytes);
                        }
                    }
                }
                Message::Extended(ExtendedMessage::UtMetadata(UtMetadata::Reject(piece))) => {
                    return Err(FetchError::PieceRejected(piece));
                }
                Message::Extended(ExtendedMessage::UtMetadata(UtMetadata::Request(piece))) => {
                    // We are not a source; decline.
                    if let Some(ex) = &exchange {
                        write_buf.clear();
                        Message::Extended(ExtendedMessage::UtMetadata(UtMetadata::Reject(piece)))
                            .serialize(&mut write_buf, ex.remote_ut_metadata_id())?;
                        wr.write_all(&write_buf).await?;
                    }
                }
                Message::KeepAlive
                | Message::Choke
                | Message::Unchoke
                | Message::Interested
                | Message::NotInterested
                | Message::Have(_)
                | Message::Bitfield(_)
                | Message::Port(_) => {}
                Message::Request { .. } | Message::Cancel { .. } | Message::Piece { .. } => {
                    // Payload traffic is out of scope for a crawler.
                    trace!(addr = %self.addr, "ignoring payload-path message");
                }
                Message::Extended(ExtendedMessage::Unknown { ext_id, .. }) => {
                    trace!(addr = %self.addr, ext_id, "ignoring unknown extension");
                }
            }
        }
    }
}
