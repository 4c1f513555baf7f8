use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    num::NonZeroUsize,
    path::PathBuf,
    sync::{self, Arc, PoisonError},
};

use lru::LruCache;
use sha1::{Digest, Sha1};
use tokio::{
    sync::{mpsc, Semaphore},
    task,
};

use super::{
    error::*, Alert, AlertReceiver, AlertSender, Command, CommandReceiver,
    CommandSender,
};
use crate::{peer, storage_info::StorageInfo, BlockInfo, PieceIndex};

/// The entity responsible for saving verified pieces to disk, serving block
/// reads and assembling the download once all pieces are saved.
pub(super) struct Disk {
    /// The torrent's storage, shared with the blocking IO workers.
    storage: Arc<Storage>,
    /// Bounds the number of disk operations running at the same time.
    workers: Arc<Semaphore>,
    /// The writes that have been dispatched but may not have finished yet.
    /// Finalizing the download waits for these.
    pending_writes: Vec<task::JoinHandle<()>>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
    /// Channel on which `Disk` sends alerts to the torrent.
    alert_chan: AlertSender,
}

impl Disk {
    /// Creates a new `Disk` instance and returns a command sender and an alert
    /// receiver.
    pub(super) fn new(
        storage: Storage,
        worker_count: usize,
    ) -> (Self, CommandSender, AlertReceiver) {
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                storage: Arc::new(storage),
                workers: Arc::new(Semaphore::new(worker_count.max(1))),
                pending_writes: Vec::new(),
                cmd_port,
                alert_chan,
            },
            cmd_chan,
            alert_port,
        )
    }

    /// Starts the disk event loop which is run until shutdown or an
    /// unrecoverable error occurs (e.g. mpsc channel failure).
    pub(super) async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            log::debug!("Disk received command");
            match cmd {
                Command::WritePiece { index, data } => {
                    self.write_piece(index, data);
                }
                Command::ReadBlock { info, result_chan } => {
                    self.read_block(info, result_chan);
                }
                Command::Finalize => {
                    self.finalize().await?;
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Writes the piece on a blocking worker.
    ///
    /// If the piece could not be written due to IO failure, the torrent is
    /// notified of it.
    fn write_piece(&mut self, index: PieceIndex, data: Vec<u8>) {
        log::trace!("Saving piece {} to disk", index);

        // forget about writes that are done
        self.pending_writes.retain(|handle| !handle.is_finished());

        let storage = Arc::clone(&self.storage);
        let workers = Arc::clone(&self.workers);
        let alert_chan = self.alert_chan.clone();
        let handle = task::spawn(async move {
            let _permit = match workers.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            // NOTE: Do _NOT_ return on disk write failure, we don't want to
            // kill the disk task due to potential disk IO errors. We need to
            // alert torrent of this failure so that the piece can be
            // downloaded again.
            let result =
                task::spawn_blocking(move || storage.write_piece(index, &data))
                    .await
                    .unwrap_or_else(|e| {
                        Err(WriteError::Io(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            e,
                        )))
                    });
            match result {
                Ok(()) => log::debug!("Saved piece {} to disk", index),
                Err(error) => {
                    log::warn!("Disk write error for piece {}: {}", index, error);
                    alert_chan
                        .send(Alert::WriteFailed { index, error })
                        .map_err(|e| {
                            log::error!("Error sending write failure: {}", e);
                            e
                        })
                        .ok();
                }
            }
        });
        self.pending_writes.push(handle);
    }

    /// Sends the specified block to the peer session, either from the read
    /// cache or from the disk.
    ///
    /// If the block cannot be read, the error is logged and the request is
    /// dropped: the protocol has no way of replying with an error.
    fn read_block(&self, info: BlockInfo, chan: peer::Sender) {
        log::trace!("Reading {:?} from disk", info);

        if let Some(piece) = self.storage.cached_piece(info.piece_index) {
            log::debug!("Piece {} is in the read cache", info.piece_index);
            match slice_block(&piece, &info) {
                Ok(data) => send_block(&chan, info, data),
                Err(e) => log::warn!("Cannot serve block {:?}: {}", info, e),
            }
            return;
        }

        log::debug!(
            "Piece {} not in the read cache, reading from disk",
            info.piece_index
        );
        let storage = Arc::clone(&self.storage);
        let workers = Arc::clone(&self.workers);
        task::spawn(async move {
            let _permit = match workers.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            // don't block the reactor with blocking disk IO
            let result = task::spawn_blocking(move || {
                let piece = storage.read_piece(info.piece_index)?;
                slice_block(&piece, &info)
            })
            .await;
            match result {
                Ok(Ok(data)) => send_block(&chan, info, data),
                Ok(Err(e)) => {
                    log::warn!("Cannot serve block {:?}: {}", info, e)
                }
                Err(e) => log::error!("Disk read task failed: {}", e),
            }
        });
    }

    /// Waits for every pending write and then assembles the file from the
    /// pieces.
    async fn finalize(&mut self) -> Result<()> {
        log::info!("Finalizing download");
        for handle in self.pending_writes.drain(..) {
            if let Err(e) = handle.await {
                log::error!("Disk write task failed: {}", e);
            }
        }

        let storage = Arc::clone(&self.storage);
        let result = task::spawn_blocking(move || storage.assemble())
            .await
            .unwrap_or_else(|e| {
                Err(WriteError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e,
                )))
            });
        match &result {
            Ok(path) => log::info!("Download assembled at {:?}", path),
            Err(e) => log::error!("Failed to assemble download: {}", e),
        }
        self.alert_chan.send(Alert::Finalized(result))?;
        Ok(())
    }
}

fn send_block(chan: &peer::Sender, info: BlockInfo, data: Vec<u8>) {
    chan.send(peer::Command::Block { info, data })
        .map_err(|e| {
            log::debug!("Error sending block to peer: {}", e);
            e
        })
        .ok();
}

/// Returns a copy of the block's bytes within the piece.
fn slice_block(piece: &[u8], info: &BlockInfo) -> Result<Vec<u8>, ReadError> {
    let start = info.offset as usize;
    let end = start + info.len as usize;
    if info.len == 0 || end > piece.len() {
        return Err(ReadError::InvalidBlockOffset);
    }
    Ok(piece[start..end].to_vec())
}

/// Where the pieces of the torrent are read from.
#[derive(Debug)]
enum Source {
    /// Each piece is in its own file in the pieces directory.
    Pieces,
    /// All pieces are in a single complete file.
    File(PathBuf),
}

/// The on-disk layout of the torrent and the blocking operations on it.
pub(super) struct Storage {
    info: StorageInfo,
    /// The directory in which verified pieces are kept until the download is
    /// assembled.
    pieces_dir: PathBuf,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Vec<u8>,
    source: sync::RwLock<Source>,
    /// The read cache that caches entire pieces, as a peer that requests
    /// a block is very likely to request the other blocks of the same piece.
    read_cache: sync::Mutex<LruCache<PieceIndex, Arc<Vec<u8>>>>,
}

impl Storage {
    /// Sets up the storage of a new download.
    ///
    /// The download directory is created if missing, and the download fails
    /// to start if its file already exists.
    pub fn new_download(
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        cache_len: usize,
    ) -> Result<Self, NewTorrentError> {
        if !info.download_dir.is_dir() {
            log::warn!(
                "Creating missing download directory {:?}",
                info.download_dir
            );
            fs::create_dir_all(&info.download_dir)?;
        }

        let output_path = info.output_path();
        if output_path.exists() {
            log::warn!("Download path {:?} exists", output_path);
            return Err(NewTorrentError::AlreadyExists);
        }

        let pieces_dir = info.pieces_dir();
        fs::create_dir_all(&pieces_dir)?;
        log::info!("Pieces are saved in {:?}", pieces_dir);

        Ok(Self::new(info, pieces_dir, piece_hashes, Source::Pieces, cache_len))
    }

    /// Sets up the storage to seed from an existing file and returns the
    /// pieces in it whose hash is valid.
    pub fn new_seed(
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        source: PathBuf,
        cache_len: usize,
    ) -> Result<(Self, Vec<PieceIndex>), NewTorrentError> {
        let mut file = File::open(&source)?;
        let actual = file.metadata()?.len();
        if actual != info.download_len {
            log::warn!("Source {:?} has wrong length {}", source, actual);
            return Err(NewTorrentError::SourceLenMismatch {
                expected: info.download_len,
                actual,
            });
        }

        log::info!("Verifying pieces of {:?}", source);
        let mut valid_pieces = Vec::with_capacity(info.piece_count);
        let mut buf = vec![0; info.piece_len as usize];
        for index in 0..info.piece_count {
            let len = info.piece_len(index).unwrap_or(info.piece_len) as usize;
            file.read_exact(&mut buf[..len])?;
            let hash = Sha1::digest(&buf[..len]);
            let pos = index * 20;
            if piece_hashes.get(pos..pos + 20) == Some(hash.as_slice()) {
                valid_pieces.push(index);
            } else {
                log::warn!("Source piece {} is NOT valid", index);
            }
        }
        log::info!(
            "{}/{} pieces of source are valid",
            valid_pieces.len(),
            info.piece_count
        );

        let pieces_dir = info.pieces_dir();
        let storage = Self::new(
            info,
            pieces_dir,
            piece_hashes,
            Source::File(source),
            cache_len,
        );
        Ok((storage, valid_pieces))
    }

    fn new(
        info: StorageInfo,
        pieces_dir: PathBuf,
        piece_hashes: Vec<u8>,
        source: Source,
        cache_len: usize,
    ) -> Self {
        let cache_len = NonZeroUsize::new(cache_len).unwrap_or(NonZeroUsize::MIN);
        Self {
            info,
            pieces_dir,
            piece_hashes,
            source: sync::RwLock::new(source),
            read_cache: sync::Mutex::new(LruCache::new(cache_len)),
        }
    }

    /// Saves the piece to its own file.
    pub fn write_piece(
        &self,
        index: PieceIndex,
        data: &[u8],
    ) -> Result<(), WriteError> {
        if self.info.piece_len(index).is_none() {
            log::warn!("Piece index {} is invalid", index);
            return Err(WriteError::InvalidPieceIndex);
        }
        debug_assert!(self.piece_hashes.len() >= (index + 1) * 20);

        let path = self.info.piece_path(&self.pieces_dir, index);
        let mut file = File::create(&path).map_err(|e| {
            log::warn!("Failed to open file {:?}", path);
            WriteError::Io(e)
        })?;
        file.write_all(data).map_err(|e| {
            log::warn!("Failed to write to file {:?}", path);
            WriteError::Io(e)
        })?;
        Ok(())
    }

    /// Returns the piece if it is in the read cache.
    pub fn cached_piece(&self, index: PieceIndex) -> Option<Arc<Vec<u8>>> {
        self.read_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&index)
            .cloned()
    }

    /// Reads in the whole piece from disk and places it in the read cache.
    pub fn read_piece(&self, index: PieceIndex) -> Result<Arc<Vec<u8>>, ReadError> {
        let len = self
            .info
            .piece_len(index)
            .ok_or(ReadError::InvalidPieceIndex)?;
        let mut buf = vec![0; len as usize];

        {
            let source = self.source.read().unwrap_or_else(PoisonError::into_inner);
            match &*source {
                Source::Pieces => {
                    let path = self.info.piece_path(&self.pieces_dir, index);
                    let mut file = File::open(path)?;
                    file.read_exact(&mut buf)?;
                }
                Source::File(path) => {
                    let mut file = File::open(path)?;
                    file.seek(SeekFrom::Start(self.info.piece_offset(index)))?;
                    file.read_exact(&mut buf)?;
                }
            }
        }
        log::debug!("Read piece {}", index);

        // Another concurrent read could already have read the piece just
        // before this thread, but replacing it shouldn't be an issue since
        // we're reading in the same place.
        let piece = Arc::new(buf);
        self.read_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(index, Arc::clone(&piece));
        Ok(piece)
    }

    /// Concatenates the piece files in ascending index order into the final
    /// file, removes the pieces directory, and serves subsequent reads from
    /// the assembled file.
    pub fn assemble(&self) -> Result<PathBuf, WriteError> {
        let mut source = self.source.write().unwrap_or_else(PoisonError::into_inner);
        if let Source::File(path) = &*source {
            log::debug!("Download is already assembled at {:?}", path);
            return Ok(path.clone());
        }

        let output_path = self.info.output_path();
        let mut output = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&output_path)?;
        let mut buf = Vec::with_capacity(self.info.piece_len as usize);
        for index in 0..self.info.piece_count {
            let path = self.info.piece_path(&self.pieces_dir, index);
            buf.clear();
            File::open(&path)
                .and_then(|mut file| file.read_to_end(&mut buf))
                .map_err(|e| {
                    log::warn!("Cannot read piece file {:?}: {}", path, e);
                    WriteError::MissingPiece(index)
                })?;
            if self.info.piece_len(index) != Some(buf.len() as u32) {
                log::warn!("Piece file {:?} has length {}", path, buf.len());
                return Err(WriteError::MissingPiece(index));
            }
            output.write_all(&buf)?;
        }
        output.flush()?;

        fs::remove_dir_all(&self.pieces_dir)?;
        *source = Source::File(output_path.clone());
        Ok(output_path)
    }
}
