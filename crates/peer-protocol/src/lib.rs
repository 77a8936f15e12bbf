//! BitTorrent peer wire parsing and serialization: the BEP 3 base
//! protocol, BEP 10 extension negotiation and the BEP 9 ut_metadata
//! messages the crawler actually exchanges.

pub mod extended;
pub mod ut_metadata;

mod bencode_scan;

use byteorder::{ByteOrder, BE};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use bitscrape_types::{InfoHash, PeerId};

use crate::extended::ExtendedMessage;

pub use crate::bencode_scan::bencoded_len;

const PSTR_BT1: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// 16 KiB: the ut_metadata piece size.
pub const METADATA_PIECE_SIZE: u32 = 16384;
/// Upper bound on an info dictionary we are willing to download.
pub const MAX_METADATA_SIZE: u32 = 16 * 1024 * 1024;

/// Our advertised ut_metadata extension id, a stable small integer.
pub const MY_EXTENDED_UT_METADATA: u8 = 1;

// Bitfields of large torrents dominate frame sizes on this connection
// profile; anything beyond this is treated as hostile.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

type MsgId = u8;

const MSGID_CHOKE: MsgId = 0;
const MSGID_UNCHOKE: MsgId = 1;
const MSGID_INTERESTED: MsgId = 2;
const MSGID_NOT_INTERESTED: MsgId = 3;
const MSGID_HAVE: MsgId = 4;
const MSGID_BITFIELD: MsgId = 5;
const MSGID_REQUEST: MsgId = 6;
const MSGID_PIECE: MsgId = 7;
const MSGID_CANCEL: MsgId = 8;
const MSGID_PORT: MsgId = 9;
const MSGID_EXTENDED: MsgId = 20;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("pstr should be 19 bytes long but got {0}")]
    HandshakePstrWrongLength(u8),
    #[error("pstr doesn't match \"BitTorrent protocol\"")]
    HandshakePstrWrongContent,
    #[error("unsupported message id {0}")]
    UnsupportedMessageId(u8),
    #[error("frame of {len} bytes exceeds the {max} byte cap")]
    FrameTooLarge { len: u32, max: u32 },
    #[error("message {msg_id} length {got}, expected {expected}")]
    IncorrectMsgLen {
        msg_id: u8,
        expected: u32,
        got: u32,
    },
    #[error("bencode error: {0}")]
    Bencode(#[from] serde_bencode::Error),
    #[error("malformed or truncated bencoded value")]
    BadBencodePrefix,
    #[error("ut_metadata: missing or zero total_size")]
    UtMetadataMissingTotalSize,
    #[error("ut_metadata: total_size {0} outside [1, {MAX_METADATA_SIZE}]")]
    UtMetadataTotalSizeOutOfRange(u32),
    #[error("ut_metadata: piece {received_piece} >= total pieces {total_pieces}")]
    UtMetadataPieceOutOfBounds {
        total_pieces: u32,
        received_piece: u32,
    },
    #[error("ut_metadata: piece length {received_size}, expected {expected_size}")]
    UtMetadataSizeMismatch {
        expected_size: u32,
        received_size: u32,
    },
    #[error("ut_metadata: trailing bytes after a non-data message")]
    UtMetadataTrailingBytes,
    #[error("ut_metadata: unrecognized message type {0}")]
    UtMetadataTypeUnknown(u32),
}

/// The fixed 68-byte BEP 3 handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        let mut reserved = [0u8; 8];
        // BEP 10 extension protocol bit.
        reserved[5] |= 0x10;
        Handshake {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extended(&self) -> bool {
        self.reserved[5] & 0x10 > 0
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.push(19);
        buf.extend_from_slice(PSTR_BT1);
        buf.extend_from_slice(&self.reserved);
        buf.extend_from_slice(self.info_hash.as_bytes());
        buf.extend_from_slice(self.peer_id.as_bytes());
    }

    pub fn deserialize(buf: &[u8; HANDSHAKE_LEN]) -> Result<Self, ProtocolError> {
        if buf[0] != 19 {
            return Err(ProtocolError::HandshakePstrWrongLength(buf[0]));
        }
        if &buf[1..20] != PSTR_BT1 {
            return Err(ProtocolError::HandshakePstrWrongContent);
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Handshake {
            reserved,
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::from_bytes_exact(peer_id),
        })
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, ProtocolError> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        reader.read_exact(&mut buf).await?;
        Self::deserialize(&buf)
    }
}

/// One peer-wire frame. Payload-carrying variants own their bytes; the
/// crawler never touches the piece path beyond decoding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bytes),
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        data: Bytes,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
    Port(u16),
    Extended(ExtendedMessage),
}

fn push_frame_header(buf: &mut Vec<u8>, payload_len: u32, msg_id: MsgId) {
    buf.extend_from_slice(&(payload_len + 1).to_be_bytes());
    buf.push(msg_id);
}

impl Message {
    /// Appends the framed message to `buf`. `remote_ut_metadata_id` is the
    /// extension id the peer advertised for ut_metadata; extension frames
    /// are addressed with the receiver's id, not ours.
    pub fn serialize(
        &self,
        buf: &mut Vec<u8>,
        remote_ut_metadata_id: u8,
    ) -> Result<(), ProtocolError> {
        match self {
            Message::KeepAlive => buf.extend_from_slice(&0u32.to_be_bytes()),
            Message::Choke => push_frame_header(buf, 0, MSGID_CHOKE),
            Message::Unchoke => push_frame_header(buf, 0, MSGID_UNCHOKE),
            Message::Interested => push_frame_header(buf, 0, MSGID_INTERESTED),
            Message::NotInterested => push_frame_header(buf, 0, MSGID_NOT_INTERESTED),
            Message::Have(piece) => {
                push_frame_header(buf, 4, MSGID_HAVE);
                buf.extend_from_slice(&piece.to_be_bytes());
            }
            Message::Bitfield(bits) => {
                push_frame_header(buf, bits.len() as u32, MSGID_BITFIELD);
                buf.extend_from_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                push_frame_header(buf, 12, MSGID_REQUEST);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece { index, begin, data } => {
                push_frame_header(buf, 8 + data.len() as u32, MSGID_PIECE);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                push_frame_header(buf, 12, MSGID_CANCEL);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
            }
            Message::Port(port) => {
                push_frame_header(buf, 2, MSGID_PORT);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Message::Extended(ext) => {
                let mut payload = Vec::new();
                ext.serialize(&mut payload)?;
                push_frame_header(buf, 1 + payload.len() as u32, MSGID_EXTENDED);
                buf.push(ext.wire_id(remote_ut_metadata_id));
                buf.extend_from_slice(&payload);
            }
        }
        Ok(())
    }

    fn expect_len(msg_id: u8, expected: u32, got: u32) -> Result<(), ProtocolError> {
        if expected != got {
            return Err(ProtocolError::IncorrectMsgLen {
                msg_id,
                expected,
                got,
            });
        }
        Ok(())
    }

    /// Decodes one frame body (the bytes after the 4-byte length prefix).
    pub fn deserialize(frame: Bytes) -> Result<Message, ProtocolError> {
        if frame.is_empty() {
            return Ok(Message::KeepAlive);
        }
        let msg_id = frame[0];
        let payload = frame.slice(1..);
        let plen = payload.len() as u32;
        let msg = match msg_id {
            MSGID_CHOKE => {
                Self::expect_len(msg_id, 0, plen)?;
                Message::Choke
            }
            MSGID_UNCHOKE => {
                Self::expect_len(msg_id, 0, plen)?;
                Message::Unchoke
            }
            MSGID_INTERESTED => {
                Self::expect_len(msg_id, 0, plen)?;
                Message::Interested
            }
            MSGID_NOT_INTERESTED => {
                Self::expect_len(msg_id, 0, plen)?;
                Message::NotInterested
            }
            MSGID_HAVE => {
                Self::expect_len(msg_id, 4, plen)?;
                Message::Have(BE::read_u32(&payload))
            }
            MSGID_BITFIELD => Message::Bitfield(payload),
            MSGID_REQUEST => {
                Self::expect_len(msg_id, 12, plen)?;
                Message::Request {
                    index: BE::read_u32(&payload[0..4]),
                    begin: BE::read_u32(&payload[4..8]),
                    length: BE::read_u32(&payload[8..12]),
                }
            }
            MSGID_PIECE => {
                if plen < 8 {
                    return Err(ProtocolError::IncorrectMsgLen {
                        msg_id,
                        expected: 8,
                        got: plen,
                    });
                }
                Message::Piece {
                    index: BE::read_u32(&payload[0..4]),
                    begin: BE::read_u32(&payload[4..8]),
                    data: payload.slice(8..),
                }
            }
            MSGID_CANCEL => {
                Self::expect_len(msg_id, 12, plen)?;
                Message::Cancel {
                    index: BE::read_u32(&payload[0..4]),
                    begin: BE::read_u32(&payload[4..8]),
                    length: BE::read_u32(&payload[8..12]),
                }
            }
            MSGID_PORT => {
                Self::expect_len(msg_id, 2, plen)?;
                Message::Port(BE::read_u16(&payload))
            }
            MSGID_EXTENDED => {
                if payload.is_empty() {
                    return Err(ProtocolError::IncorrectMsgLen {
                        msg_id,
                        expected: 1,
                        got: 0,
                    });
                }
                Message::Extended(ExtendedMessage::deserialize(payload[0], payload.slice(1..))?)
            }
            other => return Err(ProtocolError::UnsupportedMessageId(other)),
        };
        Ok(msg)
    }
}

/// Reads framed messages off an async byte stream.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, ProtocolError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = BE::read_u32(&len_buf);
    if len == 0 {
        return Ok(Message::KeepAlive);
    }
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let mut frame = vec![0u8; len as usize];
    reader.read_exact(&mut frame).await?;
    Message::deserialize(Bytes::from(frame))
}
