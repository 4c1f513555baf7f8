//! The engine and torrent configuration.

use std::{path::PathBuf, time::Duration};

use rand::{distr::Alphanumeric, Rng};

use crate::PeerId;

/// The prefix of the client id, in the Azureus-style convention: client
/// abbreviation and version number.
const CLIENT_ID_PREFIX: &[u8; 8] = b"-PM0100-";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    ///
    /// The client id is generated here, once, and is the same for every peer
    /// and tracker we talk to during the lifetime of the engine.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: generate_client_id(),
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which the torrent's file is placed upon download and
    /// from which its pieces are served.
    pub download_dir: PathBuf,

    /// The port we announce to the tracker as the one we listen on.
    pub listen_port: u16,

    /// How long a peer session waits for an inbound message before it moves
    /// on to servicing its outbound queue and making requests.
    pub read_timeout: Duration,

    /// The interval at which the torrent reports progress and checks whether
    /// the download has stalled.
    pub tick_interval: Duration,

    /// If the download progress hasn't changed for this long, all in-progress
    /// piece downloads are released so that they may be picked again.
    pub stall_timeout: Duration,

    /// The maximum number of disk reads and writes running at the same time.
    pub disk_worker_count: usize,

    /// The maximum number of messages that may be queued up in a peer
    /// session's outbound queue.
    pub outbound_queue_len: usize,

    /// The number of pieces kept in memory for serving block requests.
    pub read_cache_len: usize,
}

impl TorrentConf {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            listen_port: 6881,
            read_timeout: Duration::from_millis(500),
            tick_interval: Duration::from_millis(200),
            stall_timeout: Duration::from_secs(10),
            disk_worker_count: 10,
            outbound_queue_len: 1024,
            read_cache_len: 16,
        }
    }
}

/// Generates a client id made up of the client prefix and random alphanumeric
/// characters.
pub fn generate_client_id() -> PeerId {
    let mut id = [0; 20];
    id[..CLIENT_ID_PREFIX.len()].copy_from_slice(CLIENT_ID_PREFIX);
    let mut rng = rand::rng();
    for b in id[CLIENT_ID_PREFIX.len()..].iter_mut() {
        *b = rng.sample(Alphanumeric);
    }
    id
}
