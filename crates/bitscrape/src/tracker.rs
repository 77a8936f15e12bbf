//! Optional tracker collaborator. The crawler core only consumes this
//! contract; actual HTTP/UDP tracker clients live outside it. Results
//! come back to the caller, which republishes them as PeerDiscovered.

use std::collections::HashMap;
use std::net::SocketAddr;

use futures::future::BoxFuture;

use bitscrape_types::InfoHash;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapeEntry {
    pub seeders: u32,
    pub leechers: u32,
    pub completed: u32,
}

pub trait Tracker: Send + Sync + 'static {
    /// Announces interest and returns whatever peers the tracker knows.
    fn announce(&self, info_hash: InfoHash) -> BoxFuture<'static, anyhow::Result<Vec<SocketAddr>>>;

    fn scrape(
        &self,
        info_hashes: Vec<InfoHash>,
    ) -> BoxFuture<'static, anyhow::Result<HashMap<InfoHash, ScrapeEntry>>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    struct StaticTracker {
        peers: Vec<SocketAddr>,
    }

    impl Tracker for StaticTracker {
        fn announce(
            &self,
            _info_hash: InfoHash,
        ) -> BoxFuture<'static, anyhow::Result<Vec<SocketAddr>>> {
            let peers = self.peers.clone();
            async move { Ok(peers) }.boxed()
        }

        fn scrape(
            &self,
            info_hashes: Vec<InfoHash>,
        ) -> BoxFuture<'static, anyhow::Result<HashMap<InfoHash, ScrapeEntry>>> {
            async move {
                Ok(info_hashes
                    .into_iter()
                    .map(|h| (h, ScrapeEntry::default()))
                    .collect())
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn contract_round_trip() {
        let tracker = StaticTracker {
            peers: vec!["127.0.0.1:7001".parse().unwrap()],
        };
        let peers = tracker.announce(InfoHash::random()).await.unwrap();
        assert_eq!(peers.len(), 1);
        let scraped = tracker.scrape(vec![InfoHash::random()]).await.unwrap();
        assert_eq!(scraped.len(), 1);
    }
}
