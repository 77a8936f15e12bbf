//! BEP 9 metadata exchange messages, carried as ut_metadata extension
//! frames. `data` frames append the raw piece bytes after the bencoded
//! header.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::bencode_scan::bencoded_len;
use crate::{ProtocolError, MAX_METADATA_SIZE, METADATA_PIECE_SIZE};

// Field order is the bencode key order on the wire.
#[derive(Serialize, Deserialize)]
struct Header {
    msg_type: u32,
    piece: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_size: Option<u32>,
}

const MSG_TYPE_REQUEST: u32 = 0;
const MSG_TYPE_DATA: u32 = 1;
const MSG_TYPE_REJECT: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtMetadata {
    Request(u32),
    Data {
        piece: u32,
        total_size: u32,
        payload: Bytes,
    },
    Reject(u32),
}

/// Number of 16 KiB pieces a metadata dictionary of `total_size` spans.
pub fn piece_count(total_size: u32) -> u32 {
    total_size.div_ceil(METADATA_PIECE_SIZE)
}

/// Size of piece `index` of a dictionary of `total_size` bytes.
pub fn piece_size(total_size: u32, index: u32) -> u32 {
    total_size
        .saturating_sub(index * METADATA_PIECE_SIZE)
        .min(METADATA_PIECE_SIZE)
}

impl UtMetadata {
    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let header = match self {
            UtMetadata::Request(piece) => Header {
                msg_type: MSG_TYPE_REQUEST,
                piece: *piece,
                total_size: None,
            },
            UtMetadata::Data {
                piece, total_size, ..
            } => Header {
                msg_type: MSG_TYPE_DATA,
                piece: *piece,
                total_size: Some(*total_size),
            },
            UtMetadata::Reject(piece) => Header {
                msg_type: MSG_TYPE_REJECT,
                piece: *piece,
                total_size: None,
            },
        };
        buf.extend_from_slice(&serde_bencode::to_bytes(&header)?);
        if let UtMetadata::Data { payload, .. } = self {
            buf.extend_from_slice(payload);
        }
        Ok(())
    }

    pub fn deserialize(payload: Bytes) -> Result<Self, ProtocolError> {
        let header_len = bencoded_len(&payload)?;
        let header: Header = serde_bencode::from_bytes(&payload[..header_len])?;
        let trailing = payload.slice(header_len..);

        match header.msg_type {
            MSG_TYPE_REQUEST | MSG_TYPE_REJECT => {
                if !trailing.is_empty() {
                    return Err(ProtocolError::UtMetadataTrailingBytes);
                }
                if header.msg_type == MSG_TYPE_REQUEST {
                    Ok(UtMetadata::Request(header.piece))
                } else {
                    Ok(UtMetadata::Reject(header.piece))
                }
            }
            MSG_TYPE_DATA => {
                let total_size = header
                    .total_size
                    .filter(|s| *s > 0)
                    .ok_or(ProtocolError::UtMetadataMissingTotalSize)?;
                if total_size > MAX_METADATA_SIZE {
                    return Err(ProtocolError::UtMetadataTotalSizeOutOfRange(total_size));
                }
                let total_pieces = piece_count(total_size);
                if header.piece >= total_pieces {
                    return Err(ProtocolError::UtMetadataPieceOutOfBounds {
                        total_pieces,
                        received_piece: header.piece,
                    });
                }
                let expected_size = piece_size(total_size, header.piece);
                if trailing.len() as u32 != expected_size {
                    return Err(ProtocolError::UtMetadataSizeMismatch {
                        expected_size,
                        received_size: trailing.len() as u32,
                    });
                }
                Ok(UtMetadata::Data {
                    piece: header.piece,
                    total_size,
                    payload: trailing,
                })
            }
            other => Err(ProtocolError::UtMetadataTypeUnknown(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deser(buf: &[u8]) -> Result<UtMetadata, ProtocolError> {
        UtMetadata::deserialize(Bytes::copy_from_slice(buf))
    }

    #[test]
    fn request_wire_form() {
        let mut buf = Vec::new();
        UtMetadata::Request(3).serialize(&mut buf).unwrap();
        assert_eq!(buf, b"d8:msg_typei0e5:piecei3ee");
        assert_eq!(deser(&buf).unwrap(), UtMetadata::Request(3));
    }

    #[test]
    fn reject_wire_form() {
        let mut buf = Vec::new();
        UtMetadata::Reject(1).serialize(&mut buf).unwrap();
        assert_eq!(buf, b"d8:msg_typei2e5:piecei1ee");
        assert_eq!(deser(&buf).unwrap(), UtMetadata::Reject(1));
    }

    #[test]
    fn data_round_trip_with_trailing_payload() {
        let payload = Bytes::from(vec![0xabu8; 100]);
        let msg = UtMetadata::Data {
            piece: 0,
            total_size: 100,
            payload: payload.clone(),
        };
        let mut buf = Vec::new();
        msg.serialize(&mut buf).unwrap();
        assert!(buf.starts_with(b"d8:msg_typei1e5:piecei0e10:total_sizei100ee"));
        assert_eq!(deser(&buf).unwrap(), msg);
    }

    #[test]
    fn data_missing_total_size() {
        let err = deser(b"d8:msg_typei1e5:piecei0ee").unwrap_err();
        assert!(matches!(err, ProtocolError::UtMetadataMissingTotalSize));
    }

    #[test]
    fn data_total_size_out_of_range() {
        let total = MAX_METADATA_SIZE + 1;
        let buf = format!("d8:msg_typei1e5:piecei0e10:total_sizei{total}ee");
        let err = deser(buf.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UtMetadataTotalSizeOutOfRange(_)
        ));
    }

    #[test]
    fn data_piece_out_of_bounds() {
        let err = deser(b"d8:msg_typei1e5:piecei3e10:total_sizei100eeX").unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UtMetadataPieceOutOfBounds {
                total_pieces: 1,
                received_piece: 3
            }
        ));
    }

    #[test]
    fn data_size_mismatch() {
        let err = deser(b"d8:msg_typei1e5:piecei0e10:total_sizei100eeshort").unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UtMetadataSizeMismatch {
                expected_size: 100,
                received_size: 5
            }
        ));
    }

    #[test]
    fn trailing_bytes_after_request_rejected() {
        let err = deser(b"d8:msg_typei0e5:piecei0eeX").unwrap_err();
        assert!(matches!(err, ProtocolError::UtMetadataTrailingBytes));
    }

    #[test]
    fn unknown_msg_type() {
        let err = deser(b"d8:msg_typei9e5:piecei0ee").unwrap_err();
        assert!(matches!(err, ProtocolError::UtMetadataTypeUnknown(9)));
    }

    #[test]
    fn piece_math() {
        assert_eq!(piece_count(1), 1);
        assert_eq!(piece_count(16384), 1);
        assert_eq!(piece_count(16385), 2);
        assert_eq!(piece_count(40000), 3);
        assert_eq!(piece_size(40000, 0), 16384);
        assert_eq!(piece_size(40000, 1), 16384);
        assert_eq!(piece_size(40000, 2), 7232);
    }
}
