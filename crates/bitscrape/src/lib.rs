//! BitScrape: a passive Mainline-DHT crawler and metadata collector.
//!
//! The library surface is the [`Session`]: it joins the DHT, harvests
//! infohashes from the query traffic other nodes route through it,
//! downloads each torrent's info dictionary over the extension protocol
//! and hands results to the configured [`storage::Storage`]
//! collaborator.

pub mod beacon;
pub mod config;
pub mod session;
pub mod storage;
pub mod tracker;

pub use beacon::Beacon;
pub use config::SessionConfig;
pub use session::{Session, SessionStats};
pub use storage::{JsonlStorage, NullStorage, Storage};
pub use tracker::Tracker;
