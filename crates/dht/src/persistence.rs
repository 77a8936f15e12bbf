//! Routing-table snapshot: a compact binary file written on graceful
//! shutdown and replayed into the fresh table before bootstrap.
//!
//! Layout: magic, version, entry count, then per entry the 20-byte node
//! id, an address-family tag, the compact endpoint and a u64 last-seen
//! unix timestamp. A full table stays under 32 KiB.

use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use tracing::{debug, info};

use bitscrape_types::NodeId;

const MAGIC: &[u8; 4] = b"BSRT";
const VERSION: u8 = 1;
const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Largest entry is 20 + 1 + 16 + 2 + 8 bytes; this cap keeps the file
/// under 32 KiB.
pub const MAX_SNAPSHOT_ENTRIES: usize = 680;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen_unix: u64,
}

pub fn encode(entries: &[SnapshotEntry]) -> Vec<u8> {
    let entries = &entries[..entries.len().min(MAX_SNAPSHOT_ENTRIES)];
    let mut buf = Vec::with_capacity(8 + entries.len() * 47);
    buf.extend_from_slice(MAGIC);
    buf.push(VERSION);
    buf.write_u32::<BE>(entries.len() as u32).expect("vec write");
    for entry in entries {
        buf.extend_from_slice(entry.id.as_bytes());
        match entry.addr.ip() {
            IpAddr::V4(ip) => {
                buf.push(FAMILY_V4);
                buf.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf.push(FAMILY_V6);
                buf.extend_from_slice(&ip.octets());
            }
        }
        buf.write_u16::<BE>(entry.addr.port()).expect("vec write");
        buf.write_u64::<BE>(entry.last_seen_unix).expect("vec write");
    }
    buf
}

pub fn decode(mut buf: &[u8]) -> anyhow::Result<Vec<SnapshotEntry>> {
    let mut magic = [0u8; 4];
    buf.read_exact(&mut magic).context("snapshot too short")?;
    if magic != *MAGIC {
        bail!("bad snapshot magic {magic:02x?}");
    }
    let version = buf.read_u8().context("snapshot truncated")?;
    if version != VERSION {
        bail!("unsupported snapshot version {version}");
    }
    let count = buf.read_u32::<BE>().context("snapshot truncated")?;
    if count as usize > MAX_SNAPSHOT_ENTRIES {
        bail!("snapshot claims {count} entries, cap is {MAX_SNAPSHOT_ENTRIES}");
    }
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut id = [0u8; 20];
        buf.read_exact(&mut id).context("snapshot truncated")?;
        let family = buf.read_u8().context("snapshot truncated")?;
        let ip: IpAddr = match family {
            FAMILY_V4 => {
                let mut o = [0u8; 4];
                buf.read_exact(&mut o).context("snapshot truncated")?;
                Ipv4Addr::from(o).into()
            }
            FAMILY_V6 => {
                let mut o = [0u8; 16];
                buf.read_exact(&mut o).context("snapshot truncated")?;
                Ipv6Addr::from(o).into()
            }
            other => bail!("bad address family tag {other}"),
        };
        let port = buf.read_u16::<BE>().context("snapshot truncated")?;
        let last_seen_unix = buf.read_u64::<BE>().context("snapshot truncated")?;
        entries.push(SnapshotEntry {
            id: NodeId::new(id),
            addr: SocketAddr::new(ip, port),
            last_seen_unix,
        });
    }
    if !buf.is_empty() {
        bail!("{} trailing bytes after snapshot entries", buf.len());
    }
    Ok(entries)
}

/// Atomic dump: write to a sibling tempfile, then rename over the target.
pub fn save(path: &Path, entries: &[SnapshotEntry]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("error creating dir {parent:?}"))?;
    }
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    std::fs::write(&tmp, encode(entries)).with_context(|| format!("error writing {tmp:?}"))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("error renaming {tmp:?} to {path:?}"))?;
    debug!(?path, entries = entries.len().min(MAX_SNAPSHOT_ENTRIES), "routing table snapshot saved");
    Ok(())
}

/// A missing file yields an empty list; an unreadable or corrupt file is
/// an error the caller treats as fatal startup state.
pub fn load(path: &Path) -> anyhow::Result<Vec<SnapshotEntry>> {
    let buf = match std::fs::read(path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(?path, "no routing table snapshot");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e).with_context(|| format!("error reading {path:?}")),
    };
    let entries =
        decode(&buf).with_context(|| format!("corrupt routing table snapshot {path:?}"))?;
    info!(?path, entries = entries.len(), "loaded routing table snapshot");
    Ok(entries)
}

/// Converts an entry age (relative to now) into the stored unix stamp.
pub fn unix_from_age(age: Duration) -> u64 {
    SystemTime::now()
        .checked_sub(age)
        .unwrap_or(UNIX_EPOCH)
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
