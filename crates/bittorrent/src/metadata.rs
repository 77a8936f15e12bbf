//! Reassembly state for one metadata exchange with one peer: a sliding
//! request window, piece bookkeeping, and the final SHA-1 check against
//! the infohash.

use std::time::Instant;

use bytes::Bytes;
use sha1::{Digest, Sha1};

use bitscrape_peer_protocol::ut_metadata::{piece_count, piece_size, UtMetadata};
use bitscrape_peer_protocol::{MAX_METADATA_SIZE, METADATA_PIECE_SIZE};
use bitscrape_types::InfoHash;

use crate::conn::FetchError;
use crate::REQUEST_WINDOW;

#[derive(Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    /// More pieces outstanding; send these follow-up requests.
    Progress(Vec<UtMetadata>),
    /// Every piece arrived and the SHA-1 matched.
    Complete(Bytes),
}

pub struct MetadataExchange {
    info_hash: InfoHash,
    remote_ut_metadata_id: u8,
    total_size: u32,
    pieces_expected: u32,
    received: Vec<bool>,
    received_count: u32,
    buffer: Vec<u8>,
    next_request: u32,
    in_flight: u32,
    pub started_at: Instant,
    pub last_progress: Instant,
}

impl MetadataExchange {
    /// Validates the negotiated parameters: the remote extension id must
    /// be non-zero and the advertised size within (0, 16 MiB].
    pub fn new(
        info_hash: InfoHash,
        remote_ut_metadata_id: u8,
        metadata_size: u32,
    ) -> Result<Self, FetchError> {
        if remote_ut_metadata_id == 0 {
            return Err(FetchError::NoUtMetadata);
        }
        if metadata_size == 0 || metadata_size > MAX_METADATA_SIZE {
            return Err(FetchError::MetadataSizeOutOfRange(metadata_size));
        }
        let pieces_expected = piece_count(metadata_size);
        let now = Instant::now();
        Ok(MetadataExchange {
            info_hash,
            remote_ut_metadata_id,
            total_size: metadata_size,
            pieces_expected,
            received: vec![false; pieces_expected as usize],
            received_count: 0,
            buffer: vec![0u8; metadata_size as usize],
            next_request: 0,
            in_flight: 0,
            started_at: now,
            last_progress: now,
        })
    }

    pub fn remote_ut_metadata_id(&self) -> u8 {
        self.remote_ut_metadata_id
    }

    pub fn pieces_expected(&self) -> u32 {
        self.pieces_expected
    }

    pub fn pieces_received(&self) -> u32 {
        self.received_count
    }

    /// Requests to fill the in-flight window, issued in piece order.
    pub fn fill_window(&mut self) -> Vec<UtMetadata> {
        let mut out = Vec::new();
        while self.in_flight < REQUEST_WINDOW as u32 && self.next_request < self.pieces_expected {
            out.push(UtMetadata::Request(self.next_request));
            self.next_request += 1;
            self.in_flight += 1;
        }
        out
    }

    /// Records a `data` message. The codec already validated the piece
    /// bounds against the message's own total_size; this layer checks it
    /// against the negotiated size and rejects duplicates.
    pub fn record_data(
        &mut self,
        piece: u32,
        total_size: u32,
        payload: &[u8],
    ) -> Result<RecordOutcome, FetchError> {
        if total_size != self.total_size {
            return Err(FetchError::TotalSizeChanged {
                negotiated: self.total_size,
                received: total_size,
            });
        }
        if piece >= self.pieces_expected {
            return Err(FetchError::PieceOutOfRange(piece));
        }
        if self.received[piece as usize] {
            return Err(FetchError::DuplicatePiece(piece));
        }
        let expected_len = piece_size(self.total_size, piece) as usize;
        if payload.len() != expected_len {
            return Err(FetchError::PieceSizeMismatch {
                piece,
                expected: expected_len,
                got: payload.len(),
            });
        }

        let offset = piece as usize * METADATA_PIECE_SIZE as usize;
        self.buffer[offset..offset + expected_len].copy_from_slice(payload);
        self.received[piece as usize] = true;
        self.received_count += 1;
        self.in_flight = self.in_flight.saturating_sub(1);
        self.last_progress = Instant::now();

        if self.received_count < self.pieces_expected {
            return Ok(RecordOutcome::Progress(self.fill_window()));
        }

        let digest = Sha1::digest(&self.buffer);
        if digest[..] != self.info_hash.as_bytes()[..] {
            return Err(FetchError::HashMismatch);
        }
        Ok(RecordOutcome::Complete(Bytes::from(std::mem::take(
            &mut self.buffer,
        ))))
    }
}
