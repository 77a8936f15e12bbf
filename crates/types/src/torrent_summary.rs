//! Lenient decode of a torrent info dictionary, used for logging and
//! storage once a metadata exchange completes. Failure to decode is never
//! an error for the crawler; the raw bytes are what gets persisted.

use serde::Deserialize;
use serde_bytes::ByteBuf;

#[derive(Deserialize)]
struct RawFile {
    length: u64,
}

#[derive(Deserialize)]
struct RawInfo {
    #[serde(default)]
    name: Option<ByteBuf>,
    #[serde(rename = "piece length", default)]
    piece_length: Option<u64>,
    #[serde(default)]
    length: Option<u64>,
    #[serde(default)]
    files: Option<Vec<RawFile>>,
    #[serde(default)]
    private: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentSummary {
    pub name: Option<String>,
    pub piece_length: Option<u64>,
    pub total_size: u64,
    pub file_count: usize,
    pub private: bool,
}

impl TorrentSummary {
    pub fn from_info_bytes(info: &[u8]) -> Result<Self, serde_bencode::Error> {
        let raw: RawInfo = serde_bencode::from_bytes(info)?;
        let (total_size, file_count) = match (&raw.files, raw.length) {
            (Some(files), _) => (files.iter().map(|f| f.length).sum(), files.len()),
            (None, Some(len)) => (len, 1),
            (None, None) => (0, 0),
        };
        Ok(TorrentSummary {
            name: raw
                .name
                .map(|n| String::from_utf8_lossy(&n).into_owned()),
            piece_length: raw.piece_length,
            total_size,
            file_count,
            private: raw.private == Some(1),
        })
    }
}
