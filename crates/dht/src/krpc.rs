//! KRPC message model and bencode codec (BEP 5), including the compact
//! node/peer forms for both address families.

use std::net::SocketAddr;

use anyhow::{bail, Context};
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};
use serde_bytes::ByteBuf;

use bitscrape_types::compact::{
    read_nodes_v4, read_nodes_v6, read_peers_v4, read_peers_v6, write_node, write_peer,
    CompactNode, PEER_V4_LEN, PEER_V6_LEN,
};
use bitscrape_types::{InfoHash, NodeId};

/// KRPC error codes used by the engine.
pub const ERR_GENERIC: i32 = 201;
pub const ERR_PROTOCOL: i32 = 203;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub code: i32,
    pub message: String,
}

impl Serialize for ErrorResponse {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeSeq;
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(&self.code)?;
        seq.serialize_element(serde_bytes::Bytes::new(self.message.as_bytes()))?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for ErrorResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;
        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = ErrorResponse;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a list [code, message]")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                use serde::de::Error;
                let code = seq
                    .next_element::<i32>()?
                    .ok_or_else(|| A::Error::invalid_length(0, &self))?;
                let message = seq
                    .next_element::<ByteBuf>()?
                    .ok_or_else(|| A::Error::invalid_length(1, &self))?;
                // Tolerate (and drop) extra elements some clients append.
                while seq.next_element::<IgnoredAny>()?.is_some() {}
                Ok(ErrorResponse {
                    code,
                    message: String::from_utf8_lossy(&message).into_owned(),
                })
            }
        }
        deserializer.deserialize_seq(Visitor)
    }
}

/// `nodes`: concatenated 26-byte entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactNodeListV4(pub Vec<CompactNode>);

/// `nodes6`: concatenated 38-byte entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactNodeListV6(pub Vec<CompactNode>);

macro_rules! compact_node_list_serde {
    ($name:ident, $reader:ident) => {
        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                let mut buf = Vec::new();
                for node in &self.0 {
                    write_node(&mut buf, node);
                }
                serializer.serialize_bytes(&buf)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let buf = ByteBuf::deserialize(deserializer)?;
                $reader(&buf)
                    .map($name)
                    .map_err(serde::de::Error::custom)
            }
        }
    };
}

compact_node_list_serde!(CompactNodeListV4, read_nodes_v4);
compact_node_list_serde!(CompactNodeListV6, read_nodes_v6);

/// `values`: a list of compact peers, 6 or 18 bytes each.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactPeerList(pub Vec<SocketAddr>);

impl Serialize for CompactPeerList {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeSeq;
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for addr in &self.0 {
            let mut buf = Vec::with_capacity(PEER_V6_LEN);
            write_peer(&mut buf, addr);
            seq.serialize_element(serde_bytes::Bytes::new(&buf))?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for CompactPeerList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let bufs = Vec::<ByteBuf>::deserialize(deserializer)?;
        let mut out = Vec::with_capacity(bufs.len());
        for buf in bufs {
            let parsed = match buf.len() {
                PEER_V4_LEN => read_peers_v4(&buf),
                PEER_V6_LEN => read_peers_v6(&buf),
                other => return Err(D::Error::custom(format!("bad peer length {other}"))),
            };
            out.extend(parsed.map_err(D::Error::custom)?);
        }
        Ok(CompactPeerList(out))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    pub id: NodeId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNodeRequest {
    pub id: NodeId,
    pub target: NodeId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPeersRequest {
    pub id: NodeId,
    pub info_hash: InfoHash,
}

// Field order is the bencode key order on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncePeerRequest {
    pub id: NodeId,
    #[serde(default)]
    pub implied_port: u8,
    pub info_hash: InfoHash,
    pub port: u16,
    pub token: ByteBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<CompactNodeListV4>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes6: Option<CompactNodeListV6>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<CompactPeerList>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    PingRequest(PingRequest),
    FindNodeRequest(FindNodeRequest),
    GetPeersRequest(GetPeersRequest),
    AnnouncePeerRequest(AnnouncePeerRequest),
    Response(Response),
    Error(ErrorResponse),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub transaction_id: ByteBuf,
    pub version: Option<ByteBuf>,
    pub kind: MessageKind,
}

impl Message {
    pub fn request(transaction_id: u16, kind: MessageKind) -> Self {
        Message {
            transaction_id: ByteBuf::from(transaction_id.to_be_bytes().to_vec()),
            version: None,
            kind,
        }
    }

    pub fn response_to(transaction_id: ByteBuf, response: Response) -> Self {
        Message {
            transaction_id,
            version: None,
            kind: MessageKind::Response(response),
        }
    }

    /// Decodes the 2-byte transaction id form our own requests use.
    pub fn get_our_transaction_id(&self) -> Option<u16> {
        let t: &[u8] = &self.transaction_id;
        match t {
            [hi, lo] => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }
}

// Field order is the bencode key order on the wire: a e q r t v y.
#[derive(Serialize, Deserialize)]
struct RawMessage<Args, Resp> {
    #[serde(rename = "a", default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Args>,
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorResponse>,
    #[serde(rename = "q", default, skip_serializing_if = "Option::is_none")]
    method_name: Option<ByteBuf>,
    #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
    response: Option<Resp>,
    #[serde(rename = "t")]
    transaction_id: ByteBuf,
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    version: Option<ByteBuf>,
    #[serde(rename = "y")]
    message_type: ByteBuf,
}

fn raw<Args, Resp>(
    transaction_id: ByteBuf,
    version: Option<ByteBuf>,
    message_type: &[u8],
) -> RawMessage<Args, Resp> {
    RawMessage {
        arguments: None,
        error: None,
        method_name: None,
        response: None,
        transaction_id,
        version,
        message_type: ByteBuf::from(message_type.to_vec()),
    }
}

pub fn serialize_message(msg: &Message) -> anyhow::Result<Vec<u8>> {
    let t = msg.transaction_id.clone();
    let v = msg.version.clone();
    let out = match &msg.kind {
        MessageKind::PingRequest(args) => {
            let mut m = raw::<&PingRequest, ()>(t, v, b"q");
            m.method_name = Some(ByteBuf::from(b"ping".to_vec()));
            m.arguments = Some(args);
            serde_bencode::to_bytes(&m)
        }
        MessageKind::FindNodeRequest(args) => {
            let mut m = raw::<&FindNodeRequest, ()>(t, v, b"q");
            m.method_name = Some(ByteBuf::from(b"find_node".to_vec()));
            m.arguments = Some(args);
            serde_bencode::to_bytes(&m)
        }
        MessageKind::GetPeersRequest(args) => {
            let mut m = raw::<&GetPeersRequest, ()>(t, v, b"q");
            m.method_name = Some(ByteBuf::from(b"get_peers".to_vec()));
            m.arguments = Some(args);
            serde_bencode::to_bytes(&m)
        }
        MessageKind::AnnouncePeerRequest(args) => {
            let mut m = raw::<&AnnouncePeerRequest, ()>(t, v, b"q");
            m.method_name = Some(ByteBuf::from(b"announce_peer".to_vec()));
            m.arguments = Some(args);
            serde_bencode::to_bytes(&m)
        }
        MessageKind::Response(resp) => {
            let mut m = raw::<(), &Response>(t, v, b"r");
            m.response = Some(resp);
            serde_bencode::to_bytes(&m)
        }
        MessageKind::Error(err) => {
            let mut m = raw::<(), ()>(t, v, b"e");
            m.error = Some(err.clone());
            serde_bencode::to_bytes(&m)
        }
    };
    out.context("bencode serialization failed")
}

pub fn deserialize_message(buf: &[u8]) -> anyhow::Result<Message> {
    let scan: RawMessage<IgnoredAny, IgnoredAny> =
        serde_bencode::from_bytes(buf).context("not a KRPC message")?;

    let kind = match &scan.message_type[..] {
        b"q" => {
            let method = scan
                .method_name
                .as_ref()
                .context("query without a method name")?;
            match &method[..] {
                b"ping" => {
                    let m: RawMessage<PingRequest, IgnoredAny> = serde_bencode::from_bytes(buf)?;
                    MessageKind::PingRequest(m.arguments.context("ping without arguments")?)
                }
                b"find_node" => {
                    let m: RawMessage<FindNodeRequest, IgnoredAny> =
                        serde_bencode::from_bytes(buf)?;
                    MessageKind::FindNodeRequest(
                        m.arguments.context("find_node without arguments")?,
                    )
                }
                b"get_peers" => {
                    let m: RawMessage<GetPeersRequest, IgnoredAny> =
                        serde_bencode::from_bytes(buf)?;
                    MessageKind::GetPeersRequest(
                        m.arguments.context("get_peers without arguments")?,
                    )
                }
                b"announce_peer" => {
                    let m: RawMessage<AnnouncePeerRequest, IgnoredAny> =
                        serde_bencode::from_bytes(buf)?;
                    MessageKind::AnnouncePeerRequest(
                        m.arguments.context("announce_peer without arguments")?,
                    )
                }
                other => bail!("unsupported method {:?}", String::from_utf8_lossy(other)),
            }
        }
        b"r" => {
            let m: RawMessage<IgnoredAny, Response> = serde_bencode::from_bytes(buf)?;
            MessageKind::Response(m.response.context("response without \"r\"")?)
        }
        b"e" => MessageKind::Error(scan.error.context("error without \"e\"")?),
        other => bail!(
            "unknown message type {:?}",
            String::from_utf8_lossy(other)
        ),
    };

    Ok(Message {
        transaction_id: scan.transaction_id,
        version: scan.version,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn nid(hex40: &str) -> NodeId {
        NodeId::from_hex(hex40).unwrap()
    }

    fn round_trip(msg: &Message) -> Vec<u8> {
        let bytes = serialize_message(msg).unwrap();
        let back = deserialize_message(&bytes).unwrap();
        assert_eq!(&back, msg);
        bytes
    }

    #[test]
    fn ping_wire_form() {
        // Scenario: local 0101..14 pings with txid "aa" (0x6161).
        let id = nid("0101010101010101010101010101010101010114");
        let msg = Message::request(0x6161, MessageKind::PingRequest(PingRequest { id }));
        let bytes = round_trip(&msg);
        let mut expected = b"d1:ad2:id20:".to_vec();
        expected.extend_from_slice(id.as_bytes());
        expected.extend_from_slice(b"e1:q4:ping1:t2:aa1:y1:qe");
        assert_eq!(bytes, expected);
        assert_eq!(msg.get_our_transaction_id(), Some(0x6161));
    }

    #[test]
    fn ping_response_wire_form() {
        let id = nid("1111111111111111111111111111111111111124");
        let msg = Message::response_to(
            ByteBuf::from(b"aa".to_vec()),
            Response {
                id,
                ..Default::default()
            },
        );
        let bytes = round_trip(&msg);
        let mut expected = b"d1:rd2:id20:".to_vec();
        expected.extend_from_slice(id.as_bytes());
        expected.extend_from_slice(b"e1:t2:aa1:y1:re");
        assert_eq!(bytes, expected);
    }

    #[test]
    fn announce_peer_bep5_example() {
        // The announce_peer example packet from BEP 5.
        let raw = b"d1:ad2:id20:abcdefghij012345678912:implied_porti1e9:info_hash20:mnopqrstuvwxyz1234564:porti6881e5:token8:aoeusnthe1:q13:announce_peer1:t2:aa1:y1:qe";
        let msg = deserialize_message(raw).unwrap();
        match &msg.kind {
            MessageKind::AnnouncePeerRequest(a) => {
                assert_eq!(a.id.as_bytes(), b"abcdefghij0123456789");
                assert_eq!(a.info_hash.as_bytes(), b"mnopqrstuvwxyz123456");
                assert_eq!(a.implied_port, 1);
                assert_eq!(a.port, 6881);
                assert_eq!(&a.token[..], b"aoeusnth");
            }
            other => panic!("wrong kind {other:?}"),
        }
        assert_eq!(serialize_message(&msg).unwrap(), raw);
    }

    #[test]
    fn get_peers_response_with_values_and_token() {
        let peer: SocketAddr = "127.0.0.1:6999".parse().unwrap();
        let msg = Message::response_to(
            ByteBuf::from(b"ab".to_vec()),
            Response {
                id: NodeId::random(),
                token: Some(ByteBuf::from(vec![1, 2, 3, 4])),
                values: Some(CompactPeerList(vec![peer])),
                ..Default::default()
            },
        );
        let bytes = round_trip(&msg);
        // 6-byte compact form of 127.0.0.1:6999 inside the values list.
        let needle = [6u8, b':', 127, 0, 0, 1, 0x1b, 0x57];
        assert!(bytes.windows(needle.len()).any(|w| w == &needle[..]));
    }

    #[test]
    fn find_node_response_with_nodes() {
        let nodes = CompactNodeListV4(
            (0..8)
                .map(|i| CompactNode {
                    id: NodeId::random(),
                    addr: format!("10.0.0.{}:6881", i + 1).parse().unwrap(),
                })
                .collect(),
        );
        let msg = Message::response_to(
            ByteBuf::from(b"xy".to_vec()),
            Response {
                id: NodeId::random(),
                nodes: Some(nodes.clone()),
                ..Default::default()
            },
        );
        let bytes = round_trip(&msg);
        // 8 nodes * 26 bytes as one bencode string.
        assert!(bytes.windows(4).any(|w| w == &b"208:"[..]));
    }

    #[test]
    fn nodes6_round_trip() {
        let msg = Message::response_to(
            ByteBuf::from(b"zz".to_vec()),
            Response {
                id: NodeId::random(),
                nodes6: Some(CompactNodeListV6(vec![CompactNode {
                    id: NodeId::random(),
                    addr: "[2001:db8::2]:6881".parse().unwrap(),
                }])),
                ..Default::default()
            },
        );
        round_trip(&msg);
    }

    #[test]
    fn error_wire_form() {
        let msg = Message {
            transaction_id: ByteBuf::from(b"aa".to_vec()),
            version: None,
            kind: MessageKind::Error(ErrorResponse {
                code: ERR_PROTOCOL,
                message: "Protocol Error".into(),
            }),
        };
        let bytes = round_trip(&msg);
        assert_eq!(bytes, b"d1:eli203e14:Protocol Errore1:t2:aa1:y1:ee".to_vec());
    }

    #[test]
    fn malformed_packets_are_errors() {
        assert!(deserialize_message(b"").is_err());
        assert!(deserialize_message(b"garbage").is_err());
        assert!(deserialize_message(b"d1:t2:aa1:y1:qe").is_err());
        // nodes blob not a multiple of 26
        assert!(deserialize_message(
            b"d1:rd2:id20:aaaaaaaaaaaaaaaaaaaa5:nodes3:xyze1:t2:aa1:y1:re"
        )
        .is_err());
    }

    #[test]
    fn foreign_transaction_ids_are_preserved() {
        let raw = b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q4:ping1:t4:wxyz1:y1:qe";
        let msg = deserialize_message(raw).unwrap();
        assert_eq!(msg.get_our_transaction_id(), None);
        assert_eq!(&msg.transaction_id[..], b"wxyz");
        assert_eq!(serialize_message(&msg).unwrap(), raw);
    }
}
