//! The entry point of the library: starts a torrent and hands back a handle
//! through which it can be queried and controlled.

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use tokio::{net::TcpListener, sync::mpsc, task};

use crate::{
    alert::AlertReceiver,
    conf::Conf,
    disk,
    error::*,
    metainfo::Metainfo,
    peer::Role,
    piece_picker::{PiecePicker, PieceState},
    scheduler::Scheduler,
    storage_info::StorageInfo,
    torrent::{self, stats::Progress, Torrent},
    tracker::{Announce, Event, Tracker},
    PieceIndex, Sha1Hash,
};

/// Whether the torrent is downloaded or only seeded.
#[derive(Clone, Debug)]
pub enum Mode {
    /// Download the torrent from the given peers. If empty, the peers are
    /// requested from the torrent's trackers.
    Download { seeds: Vec<SocketAddr> },
    /// Seed the torrent from an existing, complete file.
    Seed { source: PathBuf },
}

/// Information for starting a torrent.
#[derive(Clone, Debug)]
pub struct TorrentParams {
    pub metainfo: Metainfo,
    pub mode: Mode,
    /// The address on which to accept connections from peers that download
    /// from us. When seeding and this is not set, we listen on all interfaces
    /// on the configured listen port.
    pub listen_addr: Option<SocketAddr>,
}

/// A piece that we have or that is being downloaded.
#[derive(Clone, Debug, PartialEq)]
pub struct PieceInfo {
    pub index: PieceIndex,
    pub state: PieceState,
    /// The expected SHA-1 hash of the piece.
    pub hash: Sha1Hash,
}

/// Sets up the torrent's storage, finds peers, and starts the torrent on a
/// new task.
///
/// Must be called from within a tokio runtime. Returns the handle of the
/// torrent and the port on which its alerts can be received.
pub async fn start(
    conf: Conf,
    params: TorrentParams,
) -> Result<(EngineHandle, AlertReceiver)> {
    let TorrentParams {
        metainfo,
        mode,
        listen_addr,
    } = params;
    log::info!(
        "Starting torrent {} (info hash {}, {} pieces, {} bytes)",
        metainfo.name,
        hex::encode(metainfo.info_hash),
        metainfo.piece_count(),
        metainfo.len
    );

    let storage_info =
        StorageInfo::new(&metainfo, conf.torrent.download_dir.clone());
    let source = match &mode {
        Mode::Seed { source } => Some(source.clone()),
        Mode::Download { .. } => None,
    };
    let disk::Allocation {
        join_handle: disk_join_handle,
        handle: disk,
        alert_port: disk_alert_port,
        valid_pieces,
    } = disk::spawn(
        storage_info,
        metainfo.pieces.clone(),
        &conf.torrent,
        source,
    )
    .await?;

    let mut picker =
        PiecePicker::new(metainfo.pieces.clone(), metainfo.piece_len, metainfo.len);
    let mut left = metainfo.len;
    for index in valid_pieces {
        let piece_len = picker.piece_len(index)?;
        left = left.saturating_sub(piece_len as u64);
        picker.received_piece(index);
    }
    let scheduler = Arc::new(Scheduler::new(
        metainfo.info_hash,
        conf.engine.client_id,
        picker,
        disk,
        conf.torrent.stall_timeout,
    ));

    let listen_addr = match (&mode, listen_addr) {
        (_, Some(addr)) => Some(addr),
        (Mode::Seed { .. }, None) => Some(SocketAddr::new(
            Ipv4Addr::UNSPECIFIED.into(),
            conf.torrent.listen_port,
        )),
        (Mode::Download { .. }, None) => None,
    };
    let (listener, bound_addr) = match listen_addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr).await?;
            let bound_addr = listener.local_addr()?;
            log::info!("Listening on {}", bound_addr);
            (Some(listener), Some(bound_addr))
        }
        None => (None, None),
    };

    let seeds = match mode {
        Mode::Download { seeds } if !seeds.is_empty() => seeds,
        Mode::Download { .. } => {
            let announce = Announce {
                info_hash: metainfo.info_hash,
                peer_id: conf.engine.client_id,
                port: bound_addr
                    .map(|addr| addr.port())
                    .unwrap_or(conf.torrent.listen_port),
                uploaded: 0,
                downloaded: 0,
                left,
                event: Some(Event::Started),
            };
            let peers = find_peers(&metainfo, announce).await;
            if peers.is_empty() {
                log::error!("No peers to download from");
                if let Err(e) = scheduler.disk().shutdown() {
                    log::warn!("Disk task already stopped: {}", e);
                }
                match disk_join_handle.await {
                    Ok(Ok(())) => log::info!("Disk task stopped"),
                    Ok(Err(e)) => log::warn!("Disk task error: {}", e),
                    Err(e) => log::warn!("Disk task panicked: {}", e),
                }
                return Err(Error::NoPeers);
            }
            peers
        }
        Mode::Seed { .. } => Vec::new(),
    };

    let (alert_chan, alert_port) = mpsc::unbounded_channel();
    let (mut torrent, cmd_chan) = Torrent::new(torrent::Params {
        scheduler: Arc::clone(&scheduler),
        conf: conf.torrent,
        seeds,
        listener,
        disk_join_handle,
        disk_alert_port,
        alert_chan,
    });
    let join_handle = task::spawn(async move { torrent.start().await });

    Ok((
        EngineHandle {
            scheduler,
            cmd_chan,
            join_handle,
            listen_addr: bound_addr,
        },
        alert_port,
    ))
}

/// Announces to each tracker of the torrent in turn until one returns peers.
async fn find_peers(metainfo: &Metainfo, announce: Announce) -> Vec<SocketAddr> {
    for url in metainfo.trackers().into_iter().flatten() {
        let tracker = match Tracker::from_url_str(&url) {
            Ok(tracker) => tracker,
            Err(e) => {
                log::warn!("Skipping tracker {}: {}", url, e);
                continue;
            }
        };
        match tracker.announce(announce.clone()).await {
            Ok(peers) if !peers.is_empty() => return peers,
            Ok(_) => log::info!("Tracker {} has no peers", tracker),
            Err(e) => log::warn!("Error announcing to tracker {}: {}", tracker, e),
        }
    }
    Vec::new()
}

/// The handle through which a running torrent is queried and controlled.
pub struct EngineHandle {
    scheduler: Arc<Scheduler>,
    cmd_chan: torrent::Sender,
    join_handle: task::JoinHandle<Result<()>>,
    listen_addr: Option<SocketAddr>,
}

impl EngineHandle {
    /// Returns the address on which we accept peers, if we do.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// Returns the addresses and roles of the connected peers.
    pub async fn peers(&self) -> Vec<(SocketAddr, Role)> {
        self.scheduler.peers().await
    }

    /// Returns every piece that we have or that is being downloaded.
    pub async fn pieces(&self) -> Vec<PieceInfo> {
        self.scheduler
            .pieces()
            .await
            .into_iter()
            .map(|(index, state, hash)| PieceInfo { index, state, hash })
            .collect()
    }

    pub async fn progress(&self) -> Progress {
        self.scheduler.progress().await
    }

    /// Releases every piece that is being downloaded so that it may be picked
    /// again, by any session.
    pub async fn free(&self) {
        self.scheduler.cancel_all().await;
    }

    /// Shuts down the torrent and waits for it to stop.
    pub async fn shutdown(self) -> Result<()> {
        log::info!("Shutting down engine");
        // the torrent may already have stopped due to an error, which is
        // returned below
        let _ = self.cmd_chan.send(torrent::Command::Shutdown);
        self.join_handle.await.map_err(|e| {
            Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
        })?
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, time::Duration};

    use rand::{distr::Alphanumeric, Rng};

    use super::*;
    use crate::{
        alert::Alert, metainfo::tests::make_metainfo_bytes,
        piece_picker::tests::make_torrent,
    };

    fn temp_dir() -> PathBuf {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        let dir = std::env::temp_dir().join(format!("piecemeal-engine-{}", suffix));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    // One engine seeds a file and another downloads it from the first over
    // loopback.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_seed_to_leech() {
        const PIECE_LEN: u32 = 32000;
        let (data, _) = make_torrent(PIECE_LEN, 3 * PIECE_LEN as u64 - 500);
        let metainfo = Metainfo::from_bytes(&make_metainfo_bytes(
            "e2e.bin", PIECE_LEN, &data, None,
        ))
        .unwrap();

        let seed_dir = temp_dir();
        let source = seed_dir.join("source.bin");
        fs::write(&source, &data).unwrap();
        let (seed, _seed_alerts) = start(
            Conf::new(&seed_dir),
            TorrentParams {
                metainfo: metainfo.clone(),
                mode: Mode::Seed { source },
                listen_addr: Some("127.0.0.1:0".parse().unwrap()),
            },
        )
        .await
        .unwrap();
        assert!(seed.progress().await.is_complete());
        let seed_addr = seed.listen_addr().unwrap();

        let leech_dir = temp_dir();
        let (leech, mut leech_alerts) = start(
            Conf::new(&leech_dir),
            TorrentParams {
                metainfo,
                mode: Mode::Download {
                    seeds: vec![seed_addr],
                },
                listen_addr: None,
            },
        )
        .await
        .unwrap();

        let path = tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                match leech_alerts.recv().await {
                    Some(Alert::TorrentComplete(path)) => return path,
                    Some(Alert::Progress(_)) => continue,
                    other => panic!("unexpected alert: {:?}", other),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(path, leech_dir.join("e2e.bin"));
        assert_eq!(fs::read(&path).unwrap(), data);
        assert!(leech.progress().await.is_complete());
        assert_eq!(leech.pieces().await.len(), 3);
        assert!(leech
            .pieces()
            .await
            .iter()
            .all(|piece| piece.state == PieceState::Available));

        leech.shutdown().await.unwrap();
        seed.shutdown().await.unwrap();
        fs::remove_dir_all(&seed_dir).unwrap();
        fs::remove_dir_all(&leech_dir).unwrap();
    }

    #[tokio::test]
    async fn test_no_peers() {
        const PIECE_LEN: u32 = 32000;
        let (data, _) = make_torrent(PIECE_LEN, PIECE_LEN as u64);
        // no announce url and no seeds
        let metainfo = Metainfo::from_bytes(&make_metainfo_bytes(
            "lonely.bin", PIECE_LEN, &data, None,
        ))
        .unwrap();
        let dir = temp_dir();
        let result = start(
            Conf::new(&dir),
            TorrentParams {
                metainfo,
                mode: Mode::Download { seeds: Vec::new() },
                listen_addr: None,
            },
        )
        .await;
        assert!(matches!(result, Err(Error::NoPeers)));
        fs::remove_dir_all(&dir).unwrap();
    }
}
