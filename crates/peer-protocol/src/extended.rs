//! BEP 10 extension protocol: the extension handshake and dispatch of
//! extension frames by id.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::ut_metadata::UtMetadata;
use crate::{ProtocolError, MY_EXTENDED_UT_METADATA};

/// The `m` dictionary: extension name to the id the sender listens on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedMessageIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ut_metadata: Option<u8>,
}

// Field order is the bencode key order on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedHandshake {
    #[serde(default)]
    pub m: ExtendedMessageIds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqq: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<ByteBuf>,
}

impl ExtendedHandshake {
    /// The handshake we send: advertise ut_metadata and our client tag.
    pub fn ours() -> Self {
        ExtendedHandshake {
            m: ExtendedMessageIds {
                ut_metadata: Some(MY_EXTENDED_UT_METADATA),
            },
            v: Some(ByteBuf::from(
                format!("bitscrape/{}", env!("CARGO_PKG_VERSION")).into_bytes(),
            )),
            ..Default::default()
        }
    }

    /// The peer's ut_metadata id, if advertised and non-zero.
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.m.ut_metadata.filter(|id| *id > 0)
    }

    pub fn client_version(&self) -> Option<String> {
        self.v
            .as_ref()
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendedMessage {
    Handshake(ExtendedHandshake),
    UtMetadata(UtMetadata),
    /// An extension we did not advertise; kept opaque.
    Unknown { ext_id: u8, payload: Bytes },
}

impl ExtendedMessage {
    /// Extension id to put on the wire. Outbound ut_metadata frames are
    /// addressed with the id the peer advertised, not our own.
    pub fn wire_id(&self, remote_ut_metadata_id: u8) -> u8 {
        match self {
            ExtendedMessage::Handshake(_) => 0,
            ExtendedMessage::UtMetadata(_) => remote_ut_metadata_id,
            ExtendedMessage::Unknown { ext_id, .. } => *ext_id,
        }
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        match self {
            ExtendedMessage::Handshake(h) => {
                buf.extend_from_slice(&serde_bencode::to_bytes(h)?);
            }
            ExtendedMessage::UtMetadata(m) => m.serialize(buf)?,
            ExtendedMessage::Unknown { payload, .. } => buf.extend_from_slice(payload),
        }
        Ok(())
    }

    /// Dispatches an inbound extension frame. Peers address us with the
    /// ids we advertised, so `ext_id` is matched against ours.
    pub fn deserialize(ext_id: u8, payload: Bytes) -> Result<Self, ProtocolError> {
        match ext_id {
            0 => Ok(ExtendedMessage::Handshake(serde_bencode::from_bytes(
                &payload,
            )?)),
            MY_EXTENDED_UT_METADATA => {
                Ok(ExtendedMessage::UtMetadata(UtMetadata::deserialize(payload)?))
            }
            ext_id => Ok(ExtendedMessage::Unknown { ext_id, payload }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn our_handshake_wire_form() {
        let enc = serde_bencode::to_bytes(&ExtendedHandshake::ours()).unwrap();
        let expected = format!(
            "d1:md11:ut_metadatai1ee1:v{}:bitscrape/{}e",
            concat!("bitscrape/", env!("CARGO_PKG_VERSION")).len(),
            env!("CARGO_PKG_VERSION")
        );
        assert_eq!(enc, expected.as_bytes());
    }

    #[test]
    fn peer_handshake_parses_metadata_size() {
        let raw = b"d1:md11:ut_metadatai3ee13:metadata_sizei31235e1:v13:\xc2\xb5Torrent 3.5.5e";
        let hs: ExtendedHandshake = serde_bencode::from_bytes(raw).unwrap();
        assert_eq!(hs.ut_metadata_id(), Some(3));
        assert_eq!(hs.metadata_size, Some(31235));
        assert_eq!(hs.client_version().unwrap(), "\u{b5}Torrent 3.5.5");
    }

    #[test]
    fn zero_ut_metadata_id_means_unsupported() {
        let raw = b"d1:md11:ut_metadatai0eee";
        let hs: ExtendedHandshake = serde_bencode::from_bytes(raw).unwrap();
        assert_eq!(hs.ut_metadata_id(), None);
    }

    #[test]
    fn missing_m_dict_tolerated() {
        let hs: ExtendedHandshake = serde_bencode::from_bytes(b"de").unwrap();
        assert_eq!(hs.ut_metadata_id(), None);
        assert_eq!(hs.metadata_size, None);
    }

    #[test]
    fn unknown_extension_stays_opaque() {
        let msg =
            ExtendedMessage::deserialize(7, Bytes::from_static(b"d1:xi1ee")).unwrap();
        match &msg {
            ExtendedMessage::Unknown { ext_id, payload } => {
                assert_eq!(*ext_id, 7);
                assert_eq!(payload.as_ref(), b"d1:xi1ee");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(msg.wire_id(3), 7);
    }
}
