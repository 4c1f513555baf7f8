//! The swarm-wide piece scheduler shared by all peer sessions of a torrent.

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use tokio::sync::{Mutex, RwLock};

use crate::{
    bitfield::BitField,
    disk::DiskHandle,
    download::PieceDownload,
    peer::{self, Role},
    piece_picker::{Confirmation, PiecePicker, PieceState},
    torrent::stats::Progress,
    PeerId, PieceIndex, Sha1Hash,
};

/// A registered peer session.
struct Registration {
    role: Role,
    chan: peer::Sender,
}

/// Owns the state of every piece in the torrent and the registry of live peer
/// sessions, and coordinates the two: sessions obtain pieces to download from
/// here, and completed pieces are verified, saved and announced from here.
///
/// All mutation of the piece table and of the registry goes through the
/// respective lock, so that a piece is never handed out to more than one
/// session at a time.
pub(crate) struct Scheduler {
    /// The info hash of the torrent, derived from its metainfo. This is used to
    /// identify the torrent with other peers and trackers.
    info_hash: Sha1Hash,
    /// The arbitrary client id, chosen by the user of this library. This is
    /// advertised to peers and trackers.
    client_id: PeerId,
    /// The length of the whole download, used to derive progress figures.
    download_len: u64,
    picker: RwLock<PiecePicker>,
    peers: RwLock<HashMap<SocketAddr, Registration>>,
    /// Verified pieces are saved via this handle, and sessions serve block
    /// requests through it.
    disk: DiskHandle,
    stall_timer: Mutex<StallTimer>,
}

impl Scheduler {
    pub fn new(
        info_hash: Sha1Hash,
        client_id: PeerId,
        picker: PiecePicker,
        disk: DiskHandle,
        stall_timeout: Duration,
    ) -> Self {
        Self {
            info_hash,
            client_id,
            download_len: picker.download_len(),
            picker: RwLock::new(picker),
            peers: RwLock::new(HashMap::new()),
            disk,
            stall_timer: Mutex::new(StallTimer::new(
                stall_timeout,
                Instant::now(),
            )),
        }
    }

    pub fn info_hash(&self) -> Sha1Hash {
        self.info_hash
    }

    pub fn client_id(&self) -> PeerId {
        self.client_id
    }

    pub fn disk(&self) -> &DiskHandle {
        &self.disk
    }

    /// Picks a piece that the peer with the given pieces has and that we need,
    /// and hands out a new download of it to the caller.
    pub async fn assign_piece(
        &self,
        peer_pieces: &BitField,
    ) -> Option<PieceDownload> {
        self.picker.write().await.pick_piece(peer_pieces)
    }

    /// Releases the piece so that it may be picked again.
    pub async fn cancel_piece(&self, index: PieceIndex) {
        self.picker.write().await.cancel_piece(index);
    }

    /// Releases every piece that is being downloaded.
    pub async fn cancel_all(&self) {
        log::info!("Releasing all in-progress pieces");
        self.picker.write().await.cancel_all();
    }

    /// Verifies a completed piece download.
    ///
    /// A valid piece is saved to disk and announced to every registered
    /// session, while an invalid piece is made required again. If this was the
    /// last piece, the download is finalized and all sessions are shut down.
    pub async fn confirm_piece(&self, download: PieceDownload) -> Confirmation {
        let index = download.piece_index();
        let (confirmation, is_complete) = {
            let mut picker = self.picker.write().await;
            if picker.is_complete() {
                log::debug!("Torrent complete, ignoring piece {}", index);
                return Confirmation::Ignored;
            }
            let confirmation = picker.confirm_piece(&download);
            // every write must be queued before the finalize of whichever
            // session confirms the last piece, so this happens under the lock
            if confirmation == Confirmation::Valid {
                if let Err(e) =
                    self.disk.write_piece(index, download.assembled_bytes())
                {
                    log::error!(
                        "Failed to queue piece {} for writing: {}",
                        index,
                        e
                    );
                }
            }
            (confirmation, picker.is_complete())
        };

        if confirmation == Confirmation::Valid {
            self.broadcast(peer::Command::PieceAvailable(index)).await;
        }

        if is_complete {
            self.finalize().await;
        }

        confirmation
    }

    /// Flushes the download to its final file and closes every session.
    async fn finalize(&self) {
        log::info!("All pieces downloaded, finalizing torrent");
        if let Err(e) = self.disk.finalize() {
            log::error!("Failed to finalize download: {}", e);
        }
        self.shutdown_all().await;
    }

    /// Reverts a piece that could not be saved so that it is downloaded again.
    pub async fn lost_piece(&self, index: PieceIndex) {
        log::warn!("Piece {} lost, downloading it again", index);
        self.picker.write().await.lost_piece(index);
    }

    pub async fn is_complete(&self) -> bool {
        self.picker.read().await.is_complete()
    }

    pub async fn progress_fraction(&self) -> f64 {
        self.picker.read().await.progress_fraction()
    }

    /// Returns a snapshot of the download progress.
    pub async fn progress(&self) -> Progress {
        let fraction = self.progress_fraction().await;
        let peer_count = self.peers.read().await.len();
        Progress::new(fraction, self.download_len, peer_count)
    }

    /// Releases all in-progress pieces if the download has been stuck at the
    /// same non-zero progress for the stall timeout. Returns whether the
    /// pieces were released.
    pub async fn stall_check(&self, fraction: f64, now: Instant) -> bool {
        let is_stalled = self.stall_timer.lock().await.check(fraction, now);
        if is_stalled {
            log::warn!("Download stalled at {:.1}%", fraction * 100.0);
            self.cancel_all().await;
        }
        is_stalled
    }

    /// Returns the bitfield of the pieces we have, advertised to peers that
    /// connect to us.
    pub async fn own_pieces(&self) -> BitField {
        self.picker.read().await.own_pieces()
    }

    /// Returns the state and expected hash of every piece that is not
    /// required.
    pub async fn pieces(&self) -> Vec<(PieceIndex, PieceState, Sha1Hash)> {
        let picker = self.picker.read().await;
        picker
            .states()
            .iter()
            .enumerate()
            .filter(|(_, state)| **state != PieceState::Required)
            .map(|(index, state)| {
                (index, *state, picker.expected_hash(index).unwrap_or_default())
            })
            .collect()
    }

    /// Adds the session to the registry. Registering the same address again
    /// replaces the previous entry.
    pub async fn register_peer(
        &self,
        addr: SocketAddr,
        role: Role,
        chan: peer::Sender,
    ) {
        log::debug!("Registering {:?} session {}", role, addr);
        self.peers
            .write()
            .await
            .insert(addr, Registration { role, chan });
    }

    /// Removes the session from the registry, if it is registered.
    pub async fn deregister_peer(&self, addr: &SocketAddr) {
        if self.peers.write().await.remove(addr).is_some() {
            log::debug!("Deregistered session {}", addr);
        }
    }

    /// Returns the addresses and roles of the registered sessions.
    pub async fn peers(&self) -> Vec<(SocketAddr, Role)> {
        self.peers
            .read()
            .await
            .iter()
            .map(|(addr, reg)| (*addr, reg.role))
            .collect()
    }

    /// Instructs every registered session to shut down.
    pub async fn shutdown_all(&self) {
        self.broadcast(peer::Command::Shutdown).await;
    }

    async fn broadcast(&self, cmd: peer::Command) {
        let peers = self.peers.read().await;
        for (addr, reg) in peers.iter() {
            // the session may have stopped since without having deregistered
            // yet, which is fine
            if reg.chan.send(cmd.clone()).is_err() {
                log::debug!("Session {} is gone", addr);
            }
        }
    }
}

/// Detects that the download made no progress for a while.
#[derive(Debug)]
pub(crate) struct StallTimer {
    timeout: Duration,
    /// The progress fraction at the last check.
    last_fraction: f64,
    /// When the progress last changed or the timer last fired.
    last_change: Instant,
}

impl StallTimer {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            timeout,
            last_fraction: 0.0,
            last_change: now,
        }
    }

    /// Returns true if the fraction is non-zero and hasn't changed for at
    /// least the timeout. The timer then restarts, so a download that stays
    /// stuck fires once per timeout.
    pub fn check(&mut self, fraction: f64, now: Instant) -> bool {
        #[allow(clippy::float_cmp)]
        let is_unchanged = fraction == self.last_fraction;
        if is_unchanged && fraction > 0.0 {
            if now.saturating_duration_since(self.last_change) >= self.timeout {
                self.last_change = now;
                return true;
            }
        } else {
            self.last_fraction = fraction;
            self.last_change = now;
        }
        false
    }
}
