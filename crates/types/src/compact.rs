//! Compact endpoint encodings used by the DHT wire protocol and the
//! routing-table snapshot: 6/18-byte peer info, 26/38-byte node info.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::hash_id::NodeId;

pub const PEER_V4_LEN: usize = 6;
pub const PEER_V6_LEN: usize = 18;
pub const NODE_V4_LEN: usize = 26;
pub const NODE_V6_LEN: usize = 38;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CompactError {
    #[error("compact blob of {got} bytes is not a multiple of {unit}")]
    BadLength { got: usize, unit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactNode {
    pub id: NodeId,
    pub addr: SocketAddr,
}

pub fn write_peer(buf: &mut Vec<u8>, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => buf.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => buf.extend_from_slice(&ip.octets()),
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

pub fn write_node(buf: &mut Vec<u8>, node: &CompactNode) {
    buf.extend_from_slice(node.id.as_bytes());
    write_peer(buf, &node.addr);
}

fn peer_from_chunk(chunk: &[u8]) -> SocketAddr {
    let (ip, port_bytes): (IpAddr, &[u8]) = if chunk.len() == PEER_V4_LEN {
        let mut o = [0u8; 4];
        o.copy_from_slice(&chunk[..4]);
        (Ipv4Addr::from(o).into(), &chunk[4..])
    } else {
        let mut o = [0u8; 16];
        o.copy_from_slice(&chunk[..16]);
        (Ipv6Addr::from(o).into(), &chunk[16..])
    };
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
    SocketAddr::new(ip, port)
}

fn read_chunks<T>(
    buf: &[u8],
    unit: usize,
    convert: impl Fn(&[u8]) -> T,
) -> Result<Vec<T>, CompactError> {
    if buf.len() % unit != 0 {
        return Err(CompactError::BadLength {
            got: buf.len(),
            unit,
        });
    }
    Ok(buf.chunks_exact(unit).map(convert).collect())
}

pub fn read_peers_v4(buf: &[u8]) -> Result<Vec<SocketAddr>, CompactError> {
    read_chunks(buf, PEER_V4_LEN, peer_from_chunk)
}

pub fn read_peers_v6(buf: &[u8]) -> Result<Vec<SocketAddr>, CompactError> {
    read_chunks(buf, PEER_V6_LEN, peer_from_chunk)
}

fn node_from_chunk(chunk: &[u8]) -> CompactNode {
    let mut id = [0u8; 20];
    id.copy_from_slice(&chunk[..20]);
    CompactNode {
        id: NodeId::new(id),
        addr: peer_from_chunk(&chunk[20..]),
    }
}

pub fn read_nodes_v4(buf: &[u8]) -> Result<Vec<CompactNode>, CompactError> {
    read_chunks(buf, NODE_V4_LEN, node_from_chunk)
}

pub fn read_nodes_v6(buf: &[u8]) -> Result<Vec<CompactNode>, CompactError> {
    read_chunks(buf, NODE_V6_LEN, node_from_chunk)
}
